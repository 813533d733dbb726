//! Response handlers and the requestor side of the handshake.
//!
//! Responses are correlated with the pending-request timer. The
//! acknowledgement of a `ConnectSuccess` is where a handshake completes and
//! the peer is committed to a table.
//!
//! Timer callbacks hold a weak reference to the handler and resolve to
//! [`RoutingError::Shutdown`] once it is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RoutingConfig;
use crate::error::{RoutingError, RoutingResult};
use crate::handshake::{HandshakeKey, HandshakeState, PendingConnection, Role};
use crate::message::{
    ClosestNodesUpdate, ConnectResponse, ConnectSuccessAcknowledgement, FindNodesResponse,
    GetGroupResponse, Payload, PingResponse, ProtocolMessage,
};
use crate::protocol::{NodeId, NodeInfo};
use crate::rpcs::RequestBuilder;
use crate::state::{ClientUpdate, Commit, SharedRoutingState, TableKind, arm_handshake_guard};
use crate::timer::PendingRequestTimer;
use crate::transport::{Transport, TransportError};

/// Outcome of an outbound Connect: the peer id once the transport connect is under way.
pub type ConnectOutcome = oneshot::Receiver<RoutingResult<NodeId>>;

/// Handles inbound responses on behalf of one node.
pub struct ResponseHandler {
    weak_self: Weak<Self>,
    node_id: NodeId,
    connection_id: NodeId,
    client_mode: bool,
    config: RoutingConfig,
    state: SharedRoutingState,
    transport: Arc<dyn Transport>,
    timer: Arc<PendingRequestTimer>,
    rpcs: RequestBuilder,
    acknowledged: AtomicU64,
}

impl ResponseHandler {
    /// Creates a handler over the node's shared state.
    #[must_use]
    pub fn new(
        connection_id: NodeId,
        client_mode: bool,
        config: RoutingConfig,
        state: SharedRoutingState,
        transport: Arc<dyn Transport>,
        timer: Arc<PendingRequestTimer>,
        rpcs: RequestBuilder,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            node_id: rpcs.node_id(),
            connection_id,
            client_mode,
            config,
            state,
            transport,
            timer,
            rpcs,
            acknowledged: AtomicU64::new(0),
        })
    }

    /// Resolves a pending ping.
    pub fn ping(&self, response: ProtocolMessage) -> bool {
        self.resolve::<PingResponse>(response)
    }

    /// Resolves a pending Connect; the rest of the requestor side runs in its callback.
    pub fn connect(&self, response: ProtocolMessage) -> bool {
        self.resolve::<ConnectResponse>(response)
    }

    /// Resolves a pending get-group request.
    pub fn get_group(&self, response: ProtocolMessage) -> bool {
        self.resolve::<GetGroupResponse>(response)
    }

    /// Resolves a pending FindNodes and connects to admissible unknown nodes it names.
    pub fn find_nodes(&self, response: ProtocolMessage) -> bool {
        let found = match FindNodesResponse::parse(&response.data) {
            Ok(found) => found,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "dropping find nodes response");
                return false;
            }
        };
        if !self.timer.add_response(response.id, response) {
            debug!(node = %self.node_id, "find nodes response for no pending request");
            return false;
        }
        let attempted = found
            .nodes
            .iter()
            .filter(|id| self.check_and_send_connect_request(id))
            .count();
        debug!(node = %self.node_id, returned = found.nodes.len(), attempted, "find nodes follow-up");
        true
    }

    /// Sends Connect to `node_id` if it is unknown and the routing table would admit it.
    pub fn check_and_send_connect_request(&self, node_id: &NodeId) -> bool {
        if *node_id == self.node_id || !node_id.is_valid() {
            return false;
        }
        {
            let state = self.state.lock();
            if state.is_known(node_id) || !state.routing_table.is_candidate(node_id) {
                return false;
            }
        }
        match self.send_connect_request(*node_id) {
            Ok(_) => true,
            Err(e) => {
                debug!(node = %self.node_id, peer = %node_id, error = %e, "connect not sent");
                false
            }
        }
    }

    /// Requestor side of the handshake: offers this node's endpoints, sends
    /// Connect and tracks the answer. Endpoint negotiation against the peer's
    /// session happens once the answer names it.
    ///
    /// The returned receiver yields the peer id once a positive answer has
    /// been admitted and the transport connect started, or the reason it was
    /// not.
    pub fn send_connect_request(&self, peer_id: NodeId) -> RoutingResult<ConnectOutcome> {
        if !peer_id.is_valid() || peer_id == self.node_id {
            return Err(RoutingError::InvalidIdentifier(peer_id.to_string()));
        }
        {
            let mut state = self.state.lock();
            if state.is_known(&peer_id) || !state.begin_outbound(peer_id) {
                return Err(RoutingError::AdmissionRejected { peer: peer_id });
            }
        }

        match self.dispatch_connect(peer_id) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.state.lock().end_outbound(&peer_id);
                Err(e)
            }
        }
    }

    fn dispatch_connect(&self, peer_id: NodeId) -> RoutingResult<ConnectOutcome> {
        let nat_type = self.transport.nat_type();
        let endpoints = self.transport.local_endpoints().map_err(|source| {
            RoutingError::TransportNegotiationFailed {
                peer: peer_id,
                source,
            }
        })?;
        let id = self.timer.new_correlation_id();
        let request = self.rpcs.connect(id, peer_id, endpoints, nat_type)?;

        let (tx, rx) = oneshot::channel();
        let handler = self.weak_self.clone();
        self.timer.start(
            id,
            self.config.response_timeout,
            Box::new(move |outcome| {
                let result = match handler.upgrade() {
                    Some(handler) => handler.on_connect_outcome(peer_id, outcome),
                    None => Err(RoutingError::Shutdown),
                };
                let _ = tx.send(result);
            }),
        )?;

        if let Err(e) = self.transport.send(&request) {
            self.timer.cancel(id);
            return Err(e.into());
        }
        debug!(node = %self.node_id, peer = %peer_id, id, "connect request sent");
        Ok(rx)
    }

    fn on_connect_outcome(
        &self,
        peer_id: NodeId,
        outcome: RoutingResult<ProtocolMessage>,
    ) -> RoutingResult<NodeId> {
        // The outbound mark is cleared only once the handshake record exists,
        // so an inbound Connect from the same peer never sees neither.
        let result = self.accept_connect_response(peer_id, outcome);
        self.state.lock().end_outbound(&peer_id);
        result
    }

    fn accept_connect_response(
        &self,
        peer_id: NodeId,
        outcome: RoutingResult<ProtocolMessage>,
    ) -> RoutingResult<NodeId> {
        let response = outcome.inspect_err(|e| {
            debug!(node = %self.node_id, peer = %peer_id, error = %e, "connect request failed");
        })?;
        let answer = ConnectResponse::parse(&response.data)?;
        if !answer.answer {
            debug!(node = %self.node_id, peer = %peer_id, "connect refused");
            return Err(RoutingError::AdmissionRejected { peer: peer_id });
        }
        let contact = answer
            .contact
            .ok_or_else(|| RoutingError::parse("connect response", "accepted without contact"))?;
        if contact.node_id != peer_id {
            return Err(RoutingError::InvalidIdentifier(format!(
                "connect to {peer_id} answered by {}",
                contact.node_id
            )));
        }
        let mut peer = NodeInfo::new(contact.node_id, contact.connection_id);
        if let Some(key) = contact.public_key {
            peer = peer.with_public_key(key);
        }
        if !peer.is_valid() {
            return Err(RoutingError::InvalidIdentifier(format!(
                "empty connection id from {peer_id}"
            )));
        }
        if contact.endpoints.is_unspecified() {
            return Err(RoutingError::TransportConnectFailed {
                peer: peer_id,
                source: TransportError::NoEndpointAvailable,
            });
        }

        let peer_is_client = response.is_client_node;
        let key = HandshakeKey::of(&peer);
        let record = PendingConnection::new(
            peer,
            Role::Requestor,
            peer_is_client,
            Instant::now() + self.config.handshake_timeout,
        );
        let admitted = {
            let mut state = self.state.lock();
            if state.check_admission(&record.peer, peer_is_client)
                && state.handshakes.begin(record).is_ok()
            {
                let checked = state
                    .handshakes
                    .advance(&key, HandshakeState::AdmissionChecked);
                if checked.is_err() {
                    state.handshakes.reject(&key);
                }
                checked.is_ok()
            } else {
                false
            }
        };
        if !admitted {
            debug!(node = %self.node_id, peer = %peer_id, "accepted peer no longer admissible");
            return Err(RoutingError::AdmissionRejected { peer: peer_id });
        }

        if let Err(source) = self.transport.get_available_endpoint(
            &key.connection_id,
            &contact.endpoints,
            self.transport.nat_type(),
        ) {
            warn!(node = %self.node_id, peer = %peer_id, error = %source, "endpoint negotiation failed");
            self.state.lock().handshakes.reject(&key);
            return Err(RoutingError::TransportNegotiationFailed {
                peer: peer_id,
                source,
            });
        }
        if let Err(e) = self
            .state
            .lock()
            .handshakes
            .advance(&key, HandshakeState::EndpointNegotiated)
        {
            debug!(node = %self.node_id, peer = %peer_id, error = %e, "handshake gone before negotiation finished");
            return Err(RoutingError::AdmissionRejected { peer: peer_id });
        }

        arm_handshake_guard(&self.timer, &self.state, &self.transport, key)?;
        if let Err(source) =
            self.transport
                .connect(&self.connection_id, &key.connection_id, &contact.endpoints)
        {
            warn!(node = %self.node_id, peer = %peer_id, error = %source, "transport connect failed");
            let rejected = self.state.lock().handshakes.reject(&key);
            if let Some(guard) = rejected.and_then(|r| r.guard_id) {
                self.timer.cancel(guard);
            }
            return Err(RoutingError::TransportConnectFailed {
                peer: peer_id,
                source,
            });
        }
        debug!(node = %self.node_id, peer = %peer_id, client = peer_is_client, "connect accepted");
        Ok(peer_id)
    }

    /// Completes a handshake on the peer's acknowledgement.
    ///
    /// The requestor receives the responder's acknowledgement, commits and
    /// acknowledges back; the responder commits on that second
    /// acknowledgement. Returns the table the peer went into.
    pub fn connect_success_acknowledgement(&self, message: &ProtocolMessage) -> Option<TableKind> {
        let ack = match ConnectSuccessAcknowledgement::parse(&message.data) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "dropping acknowledgement");
                return None;
            }
        };
        if !ack.node_id.is_valid() || !ack.connection_id.is_valid() {
            warn!(node = %self.node_id, "acknowledgement with empty identifiers");
            return None;
        }
        if ack.node_id != message.source_id {
            warn!(node = %self.node_id, source = %message.source_id, "acknowledgement for another node");
            return None;
        }
        let key = HandshakeKey::new(ack.node_id, ack.connection_id);

        let (role, peer_is_client) = match self.state.lock().handshakes.get(&key) {
            Some(record) => (record.role, record.peer_is_client),
            None => {
                debug!(node = %self.node_id, peer = %key, "acknowledgement without handshake");
                return None;
            }
        };
        // Each side acknowledges with its own role, so the flag must be the opposite of ours.
        if ack.is_requestor == role.is_requestor() {
            warn!(node = %self.node_id, peer = %key, ?role, "acknowledgement from the wrong side");
            return None;
        }
        if ack.client_node != peer_is_client {
            warn!(
                node = %self.node_id,
                peer = %key,
                claimed_client = ack.client_node,
                recorded_client = peer_is_client,
                "acknowledgement disagrees with the peer's mode"
            );
            let rejected = self.state.lock().handshakes.reject(&key);
            if let Some(guard) = rejected.and_then(|r| r.guard_id) {
                self.timer.cancel(guard);
            }
            self.transport.remove(&key.connection_id);
            return None;
        }

        let committed = if peer_is_client {
            self.validate_and_complete_connection_to_client(&key)
        } else {
            self.validate_and_complete_connection_to_non_client(&key, &ack.close_ids)
        };
        let commit = committed?;

        if role.is_requestor() {
            let close_ids = self.state.lock().routing_table.close_group_ids();
            match self.rpcs.connect_success_acknowledgement(key.node_id, true, close_ids) {
                Ok(reply) => {
                    if let Err(e) =
                        self.transport
                            .send_direct(&reply, &key.node_id, &key.connection_id)
                    {
                        warn!(node = %self.node_id, peer = %key.node_id, error = %e, "failed to acknowledge");
                    }
                }
                Err(e) => warn!(node = %self.node_id, error = %e, "failed to build acknowledgement"),
            }
        }
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        Some(commit.table)
    }

    /// Client peers are committed to the client table; their view of the
    /// overlay is not merged.
    fn validate_and_complete_connection_to_client(&self, key: &HandshakeKey) -> Option<Commit> {
        self.complete(key, true, &[])
    }

    /// Routing peers go to the routing table and the close group they
    /// reported is remembered.
    fn validate_and_complete_connection_to_non_client(
        &self,
        key: &HandshakeKey,
        close_ids: &[NodeId],
    ) -> Option<Commit> {
        self.complete(key, false, close_ids)
    }

    fn complete(
        &self,
        key: &HandshakeKey,
        peer_is_client: bool,
        close_ids: &[NodeId],
    ) -> Option<Commit> {
        let (record, commit) = {
            let mut state = self.state.lock();
            let record = match state.handshakes.complete(key) {
                Ok(record) => record,
                Err(e) => {
                    debug!(node = %self.node_id, peer = %key, error = %e, "handshake not completable");
                    return None;
                }
            };
            let commit = state.commit(record.peer.clone(), peer_is_client);
            if commit.is_some() {
                state.merge_close_ids(close_ids);
            }
            (record, commit)
        };

        if let Some(guard) = record.guard_id {
            self.timer.cancel(guard);
        }
        let Some(commit) = commit else {
            warn!(node = %self.node_id, peer = %key.node_id, "peer no longer admissible at acknowledgement");
            self.transport.remove(&key.connection_id);
            return None;
        };
        if let Some(evicted) = &commit.evicted {
            info!(node = %self.node_id, evicted = %evicted.node_id, "evicted to make room");
            self.transport.remove(&evicted.connection_id);
        }
        if let Some(stale) = &commit.stale_connection {
            info!(node = %self.node_id, peer = %key.node_id, stale = %stale, "releasing replaced session");
            self.transport.remove(stale);
        }
        if let Some(update) = &commit.client_update {
            self.send_client_updates(update);
        }
        Some(commit)
    }

    /// Pushes a close-group snapshot to every client peer.
    pub fn send_client_updates(&self, update: &ClientUpdate) {
        for client in &update.clients {
            let message = match self
                .rpcs
                .closest_nodes_update(client.node_id, update.close_ids.clone())
            {
                Ok(message) => message,
                Err(e) => {
                    warn!(node = %self.node_id, error = %e, "failed to build close group update");
                    return;
                }
            };
            if let Err(e) = self
                .transport
                .send_direct(&message, &client.node_id, &client.connection_id)
            {
                debug!(node = %self.node_id, client = %client.node_id, error = %e, "close group update not delivered");
            }
        }
    }

    /// Client side of a close-group push: remembers the group and connects
    /// to admissible members it does not know yet.
    pub fn close_node_update_for_client(&self, message: &ProtocolMessage) -> usize {
        if !self.client_mode {
            debug!(node = %self.node_id, "close group update on a routing node");
            return 0;
        }
        let update = match ClosestNodesUpdate::parse(&message.data) {
            Ok(update) => update,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "dropping close group update");
                return 0;
            }
        };
        self.state.lock().merge_close_ids(&update.close_ids);
        let attempted = update
            .close_ids
            .iter()
            .filter(|id| self.check_and_send_connect_request(id))
            .count();
        debug!(
            node = %self.node_id,
            from = %update.node,
            members = update.close_ids.len(),
            attempted,
            "close group update"
        );
        attempted
    }

    /// Number of handshakes this handler has completed.
    #[must_use]
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    fn resolve<P: Payload>(&self, response: ProtocolMessage) -> bool {
        if let Err(e) = P::parse(&response.data) {
            warn!(node = %self.node_id, error = %e, "dropping response");
            return false;
        }
        let id = response.id;
        let resolved = self.timer.add_response(id, response);
        if !resolved {
            debug!(node = %self.node_id, id, "response for no pending request");
        }
        resolved
    }
}

impl std::fmt::Debug for ResponseHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandler")
            .field("node_id", &self.node_id)
            .field("client_mode", &self.client_mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "response_handler_tests.rs"]
mod tests;
