//! Close-group membership change events.
//!
//! The notifier is owned by the routing state and is invoked while the state
//! lock is held, so an observer never sees a table change without its event.
//! Synchronous listeners therefore must not call back into the routing node.

use tokio::sync::broadcast;
use tracing::debug;

use crate::protocol::NodeId;

/// Default capacity of the broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// A change in the composition of the close group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupChange {
    /// Close group before the mutation, closest first.
    pub old_close_group: Vec<NodeId>,
    /// Close group after the mutation, closest first.
    pub new_close_group: Vec<NodeId>,
}

impl GroupChange {
    /// Builds a change if the two groups differ as sets.
    #[must_use]
    pub fn between(old_close_group: Vec<NodeId>, new_close_group: Vec<NodeId>) -> Option<Self> {
        let same = old_close_group.len() == new_close_group.len()
            && old_close_group.iter().all(|id| new_close_group.contains(id));
        if same {
            None
        } else {
            Some(Self {
                old_close_group,
                new_close_group,
            })
        }
    }

    /// Ids that joined the close group.
    #[must_use]
    pub fn joined(&self) -> Vec<NodeId> {
        self.new_close_group
            .iter()
            .filter(|id| !self.old_close_group.contains(id))
            .copied()
            .collect()
    }

    /// Ids that left the close group.
    #[must_use]
    pub fn left(&self) -> Vec<NodeId> {
        self.old_close_group
            .iter()
            .filter(|id| !self.new_close_group.contains(id))
            .copied()
            .collect()
    }
}

/// Synchronous group change callback.
pub type GroupChangeListener = Box<dyn Fn(&GroupChange) + Send + Sync>;

/// Raises [`GroupChange`] events to listeners and subscribers.
pub struct GroupChangeNotifier {
    sender: broadcast::Sender<GroupChange>,
    listeners: Vec<GroupChangeListener>,
    raised: u64,
}

impl GroupChangeNotifier {
    /// Creates a notifier whose subscribers buffer up to `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: Vec::new(),
            raised: 0,
        }
    }

    /// Returns a receiver for future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GroupChange> {
        self.sender.subscribe()
    }

    /// Registers a synchronous listener.
    pub fn add_listener(&mut self, listener: GroupChangeListener) {
        self.listeners.push(listener);
    }

    /// Number of events raised so far.
    #[must_use]
    pub const fn raised(&self) -> u64 {
        self.raised
    }

    /// Raises `change` to every listener and subscriber.
    pub fn notify(&mut self, change: &GroupChange) {
        self.raised += 1;
        for listener in &self.listeners {
            listener(change);
        }
        // No subscribers is not an error.
        let receivers = self.sender.send(change.clone()).unwrap_or(0);
        debug!(
            joined = change.joined().len(),
            left = change.left().len(),
            receivers,
            "close group changed"
        );
    }
}

impl Default for GroupChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for GroupChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupChangeNotifier")
            .field("listeners", &self.listeners.len())
            .field("raised", &self.raised)
            .finish_non_exhaustive()
    }
}
