//! Pending-request timer.
//!
//! Tracks outstanding requests by correlation id. Each entry resolves exactly
//! once: either a matching response arrives ([`PendingRequestTimer::add_response`])
//! or its deadline elapses and the callback receives [`RoutingError::Timeout`].
//! Whichever side removes the entry from the map under the lock owns the
//! callback, so the two outcomes cannot both fire.
//!
//! The timer's lock is independent of the routing state lock and callbacks
//! always run after it has been released.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{RoutingError, RoutingResult};
use crate::message::ProtocolMessage;

/// Callback fired with the outcome of a pending request.
pub type ResponseCallback = Box<dyn FnOnce(RoutingResult<ProtocolMessage>) + Send + 'static>;

struct PendingRequest {
    deadline: Instant,
    on_complete: ResponseCallback,
    expiry: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn abort_expiry(&mut self) {
        if let Some(handle) = self.expiry.take() {
            handle.abort();
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, PendingRequest>>>;

/// Correlates responses with outstanding requests under a deadline.
pub struct PendingRequestTimer {
    next_id: AtomicU64,
    pending: PendingMap,
}

impl PendingRequestTimer {
    /// Creates an empty timer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocates a fresh correlation id.
    pub fn new_correlation_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a request and arms its deadline.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        &self,
        correlation_id: u64,
        timeout: Duration,
        on_complete: ResponseCallback,
    ) -> RoutingResult<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RoutingError::Shutdown)?;

        let mut pending = self.pending.lock();
        if pending.contains_key(&correlation_id) {
            return Err(RoutingError::DuplicateCorrelationId(correlation_id));
        }

        let deadline = Instant::now() + timeout;
        let map = Arc::downgrade(&self.pending);
        let expiry = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(map) = map.upgrade() else {
                return;
            };
            let entry = map.lock().remove(&correlation_id);
            if let Some(entry) = entry {
                debug!(correlation_id, "request timed out");
                (entry.on_complete)(Err(RoutingError::Timeout { correlation_id }));
            }
        });

        pending.insert(
            correlation_id,
            PendingRequest {
                deadline,
                on_complete,
                expiry: Some(expiry),
            },
        );
        trace!(correlation_id, ?timeout, "request registered");
        Ok(())
    }

    /// Resolves a request with its response.
    ///
    /// Returns false if the id is unknown or already resolved (late response).
    pub fn add_response(&self, correlation_id: u64, response: ProtocolMessage) -> bool {
        let entry = self.pending.lock().remove(&correlation_id);
        match entry {
            Some(mut entry) => {
                entry.abort_expiry();
                (entry.on_complete)(Ok(response));
                true
            }
            None => {
                debug!(correlation_id, "no pending request for response");
                false
            }
        }
    }

    /// Forgets a request without firing its callback.
    pub fn cancel(&self, correlation_id: u64) -> bool {
        let entry = self.pending.lock().remove(&correlation_id);
        entry.is_some_and(|mut entry| {
            entry.abort_expiry();
            true
        })
    }

    /// Resolves every outstanding request with [`RoutingError::Shutdown`].
    pub fn cancel_all(&self) {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, e)| e).collect();
        for mut entry in drained {
            entry.abort_expiry();
            (entry.on_complete)(Err(RoutingError::Shutdown));
        }
    }

    /// Deadline of an outstanding request.
    #[must_use]
    pub fn deadline(&self, correlation_id: u64) -> Option<Instant> {
        self.pending.lock().get(&correlation_id).map(|e| e.deadline)
    }

    /// Returns true if the request is still outstanding.
    #[must_use]
    pub fn is_pending(&self, correlation_id: u64) -> bool {
        self.pending.lock().contains_key(&correlation_id)
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for PendingRequestTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PendingRequestTimer {
    fn drop(&mut self) {
        for (_, mut entry) in self.pending.lock().drain() {
            entry.abort_expiry();
        }
    }
}

impl std::fmt::Debug for PendingRequestTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequestTimer")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use crate::protocol::NodeId;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::oneshot;

    fn response(id: u64) -> ProtocolMessage {
        let mut msg = ProtocolMessage::new(MessageType::Ping, NodeId::random(), NodeId::random(), vec![]);
        msg.id = id;
        msg.is_request = false;
        msg
    }

    fn channel_callback() -> (ResponseCallback, oneshot::Receiver<RoutingResult<ProtocolMessage>>) {
        let (tx, rx) = oneshot::channel();
        let callback: ResponseCallback = Box::new(move |result| {
            let _ = tx.send(result);
        });
        (callback, rx)
    }

    #[test]
    fn correlation_ids_are_unique() {
        let timer = PendingRequestTimer::new();
        let a = timer.new_correlation_id();
        let b = timer.new_correlation_id();
        assert_ne!(a, b);
    }

    #[test]
    fn start_outside_runtime_fails() {
        let timer = PendingRequestTimer::new();
        let result = timer.start(1, Duration::from_secs(1), Box::new(|_| {}));
        assert_eq!(result, Err(RoutingError::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn response_resolves_before_deadline() {
        let timer = PendingRequestTimer::new();
        let id = timer.new_correlation_id();
        let (callback, rx) = channel_callback();
        timer.start(id, Duration::from_secs(5), callback).unwrap();
        assert!(timer.is_pending(id));

        assert!(timer.add_response(id, response(id)));
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap().id, id);
        assert_eq!(timer.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_timeout() {
        let timer = PendingRequestTimer::new();
        let id = timer.new_correlation_id();
        let (callback, rx) = channel_callback();
        timer.start(id, Duration::from_secs(5), callback).unwrap();

        let outcome = rx.await.unwrap();
        assert_eq!(outcome, Err(RoutingError::Timeout { correlation_id: id }));
        assert!(!timer.is_pending(id));
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_is_ignored() {
        let timer = PendingRequestTimer::new();
        let id = timer.new_correlation_id();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timer
            .start(
                id,
                Duration::from_millis(100),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!timer.add_response(id, response(id)));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn response_prevents_timeout() {
        let timer = PendingRequestTimer::new();
        let id = timer.new_correlation_id();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        timer
            .start(
                id,
                Duration::from_millis(100),
                Box::new(move |r| sink.lock().push(r.is_ok())),
            )
            .unwrap();

        assert!(timer.add_response(id, response(id)));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*outcomes.lock(), vec![true]);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let timer = PendingRequestTimer::new();
        timer.start(7, Duration::from_secs(5), Box::new(|_| {})).unwrap();
        assert_eq!(
            timer.start(7, Duration::from_secs(5), Box::new(|_| {})),
            Err(RoutingError::DuplicateCorrelationId(7))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_suppresses_both_outcomes() {
        let timer = PendingRequestTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        timer
            .start(
                3,
                Duration::from_millis(10),
                Box::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert!(timer.cancel(3));
        assert!(!timer.cancel(3));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_all_resolves_with_shutdown() {
        let timer = PendingRequestTimer::new();
        let (callback, rx) = channel_callback();
        timer.start(11, Duration::from_secs(60), callback).unwrap();

        timer.cancel_all();
        assert_eq!(rx.await.unwrap(), Err(RoutingError::Shutdown));
        assert_eq!(timer.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_response_and_timeout_resolve_once() {
        let timer = Arc::new(PendingRequestTimer::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let mut ids = Vec::new();
        for _ in 0..200 {
            let id = timer.new_correlation_id();
            let counter = Arc::clone(&fired);
            timer
                .start(
                    id,
                    Duration::from_millis(1),
                    Box::new(move |_| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }),
                )
                .unwrap();
            ids.push(id);
        }

        let mut tasks = Vec::new();
        for id in ids {
            let timer = Arc::clone(&timer);
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                timer.add_response(id, response(id));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 200);
        assert_eq!(timer.pending_count(), 0);
    }
}
