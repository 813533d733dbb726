//! Request handlers.
//!
//! Each handler takes an inbound request and returns the message to send back,
//! or `None` when the request is dropped (misaddressed, unparsable, invalid,
//! or a handshake step that failed without anything to report).

use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::config::RoutingConfig;
use crate::handshake::{HandshakeKey, HandshakeState, PendingConnection, Role};
use crate::message::{
    ConnectRequest, ConnectResponse, ConnectSuccess, FindNodesRequest, FindNodesResponse,
    GetGroupRequest, GetGroupResponse, Payload, PingRequest, PingResponse, ProtocolMessage,
};
use crate::protocol::{NodeId, NodeInfo};
use crate::rpcs::{self, DirectMessage, RequestBuilder};
use crate::state::{SharedRoutingState, arm_handshake_guard};
use crate::timer::PendingRequestTimer;
use crate::transport::Transport;

/// Answers inbound requests on behalf of one node.
pub struct Service {
    node_id: NodeId,
    connection_id: NodeId,
    client_mode: bool,
    config: RoutingConfig,
    state: SharedRoutingState,
    transport: Arc<dyn Transport>,
    timer: Arc<PendingRequestTimer>,
    rpcs: RequestBuilder,
}

impl Service {
    /// Creates a service over the node's shared state.
    #[must_use]
    pub fn new(
        connection_id: NodeId,
        client_mode: bool,
        config: RoutingConfig,
        state: SharedRoutingState,
        transport: Arc<dyn Transport>,
        timer: Arc<PendingRequestTimer>,
        rpcs: RequestBuilder,
    ) -> Self {
        Self {
            node_id: rpcs.node_id(),
            connection_id,
            client_mode,
            config,
            state,
            transport,
            timer,
            rpcs,
        }
    }

    /// Echoes a ping with the original payload and signature.
    #[must_use]
    pub fn ping(&self, request: &ProtocolMessage) -> Option<ProtocolMessage> {
        if !self.is_for_me(request) {
            return None;
        }
        if let Err(e) = PingRequest::parse(&request.data) {
            warn!(node = %self.node_id, error = %e, "dropping ping");
            return None;
        }
        let pong = PingResponse {
            pong: true,
            original_request: request.data.clone(),
            original_signature: request.signature.clone(),
            timestamp: rpcs::timestamp_ms(),
        };
        self.respond(request, &pong)
    }

    /// Responder side of the handshake.
    ///
    /// Admission failure yields a negative answer. Endpoint negotiation or
    /// transport connect failure yields no answer at all.
    #[must_use]
    pub fn connect(&self, request: &ProtocolMessage) -> Option<ProtocolMessage> {
        if !self.is_for_me(request) {
            return None;
        }
        let connect = match ConnectRequest::parse(&request.data) {
            Ok(connect) => connect,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "dropping connect request");
                return None;
            }
        };
        let contact = connect.contact;
        if contact.endpoints.is_unspecified() {
            warn!(node = %self.node_id, peer = %contact.node_id, "connect request without endpoints");
            return None;
        }
        let mut peer = NodeInfo::new(contact.node_id, contact.connection_id);
        if let Some(key) = contact.public_key {
            peer = peer.with_public_key(key);
        }
        if !peer.is_valid() {
            warn!(node = %self.node_id, "connect request with invalid identifiers");
            return None;
        }

        let peer_is_client = request.is_client_node;
        let key = HandshakeKey::of(&peer);
        let record = PendingConnection::new(
            peer.clone(),
            Role::Responder,
            peer_is_client,
            Instant::now() + self.config.handshake_timeout,
        );
        let admitted = {
            let mut state = self.state.lock();
            !state.outbound_takes_precedence(&peer.node_id)
                && state.check_admission(&peer, peer_is_client)
                && state.handshakes.begin(record).is_ok()
                && state
                    .handshakes
                    .advance(&key, HandshakeState::AdmissionChecked)
                    .is_ok()
        };
        debug!(
            node = %self.node_id,
            peer = %peer.node_id,
            client = peer_is_client,
            admitted,
            "connect request"
        );

        let mut response = ConnectResponse {
            answer: false,
            contact: None,
            original_request: request.data.clone(),
            original_signature: request.signature.clone(),
            timestamp: rpcs::timestamp_ms(),
        };
        if admitted {
            let endpoints = match self.transport.get_available_endpoint(
                &peer.connection_id,
                &contact.endpoints,
                self.transport.nat_type(),
            ) {
                Ok(endpoints) => endpoints,
                Err(e) => {
                    warn!(node = %self.node_id, peer = %peer.node_id, error = %e, "endpoint negotiation failed");
                    self.state.lock().handshakes.reject(&key);
                    return None;
                }
            };
            debug_assert!(
                endpoints.is_usable(),
                "transport returned no usable endpoint after successful negotiation"
            );
            if !endpoints.is_usable() {
                error!(node = %self.node_id, peer = %peer.node_id, "negotiated endpoint pair is unspecified");
                self.state.lock().handshakes.reject(&key);
                return None;
            }
            if let Err(e) = self
                .state
                .lock()
                .handshakes
                .advance(&key, HandshakeState::EndpointNegotiated)
            {
                debug!(node = %self.node_id, peer = %peer.node_id, error = %e, "handshake gone before negotiation finished");
                return None;
            }
            if let Err(e) = self
                .transport
                .connect(&self.connection_id, &peer.connection_id, &contact.endpoints)
            {
                warn!(node = %self.node_id, peer = %peer.node_id, error = %e, "transport connect failed");
                self.state.lock().handshakes.reject(&key);
                return None;
            }
            if arm_handshake_guard(&self.timer, &self.state, &self.transport, key).is_err() {
                return None;
            }
            response.answer = true;
            response.contact = Some(self.rpcs.contact(endpoints, self.transport.nat_type()));
        }
        self.respond(request, &response)
    }

    /// Returns this node's id followed by its closest known ids to the target.
    #[must_use]
    pub fn find_nodes(&self, request: &ProtocolMessage) -> Option<ProtocolMessage> {
        if !self.is_for_me(request) {
            return None;
        }
        let find = match FindNodesRequest::parse(&request.data) {
            Ok(find) => find,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "dropping find nodes request");
                return None;
            }
        };
        if find.num_nodes_requested == 0 || !find.target.is_valid() {
            warn!(node = %self.node_id, "invalid find nodes request");
            return None;
        }

        let wanted = usize::try_from(find.num_nodes_requested - 1).unwrap_or(usize::MAX);
        let mut nodes = vec![self.node_id];
        nodes.extend(self.state.lock().routing_table.closest_nodes(&find.target, wanted));
        debug!(node = %self.node_id, target = %find.target, found = nodes.len(), "find nodes");

        let found = FindNodesResponse {
            nodes,
            original_request: request.data.clone(),
            original_signature: request.signature.clone(),
            timestamp: rpcs::timestamp_ms(),
        };
        self.respond(request, &found)
    }

    /// Returns the close group of the target as this node sees it.
    #[must_use]
    pub fn get_group(&self, request: &ProtocolMessage) -> Option<ProtocolMessage> {
        if !self.is_for_me(request) {
            return None;
        }
        let get_group = match GetGroupRequest::parse(&request.data) {
            Ok(get_group) => get_group,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "dropping get group request");
                return None;
            }
        };
        let target = get_group.target;
        if !target.is_valid() {
            warn!(node = %self.node_id, "invalid get group target");
            return None;
        }

        let size = self.config.closest_nodes_size;
        let mut group = self.state.lock().routing_table.closest_nodes(&target, size + 1);
        group.push(self.node_id);
        group.retain(|id| *id != target);
        group.sort_by(|a, b| a.cmp_distance(b, &target));
        group.dedup();
        group.truncate(size);

        self.respond(request, &GetGroupResponse { target, group })
    }

    /// Handles a peer's `ConnectSuccess`.
    ///
    /// Dispatches on the flag the sender set, not on local role: a message
    /// from the requestor is acknowledged once, on first arrival; a message
    /// from the responder only marks the pending handshake.
    #[must_use]
    pub fn connect_success(&self, request: &ProtocolMessage) -> Option<DirectMessage> {
        if !self.is_for_me(request) {
            return None;
        }
        let success = match ConnectSuccess::parse(&request.data) {
            Ok(success) => success,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "dropping connect success");
                return None;
            }
        };
        if !success.node_id.is_valid() || !success.connection_id.is_valid() {
            warn!(node = %self.node_id, "connect success with empty identifiers");
            return None;
        }
        let key = HandshakeKey::new(success.node_id, success.connection_id);

        if success.is_requestor {
            let close_ids = {
                let mut state = self.state.lock();
                match state.handshakes.mark_peer_confirmed(&key) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(node = %self.node_id, peer = %key.node_id, "connect success already acknowledged");
                        return None;
                    }
                    Err(e) => {
                        debug!(node = %self.node_id, peer = %key.node_id, error = %e, "connect success without handshake");
                        return None;
                    }
                }
                state.routing_table.close_group_ids()
            };
            let ack = self
                .rpcs
                .connect_success_acknowledgement(success.node_id, false, close_ids)
                .map_err(|e| warn!(node = %self.node_id, error = %e, "failed to build acknowledgement"))
                .ok()?;
            Some(DirectMessage {
                message: ack,
                node_id: success.node_id,
                connection_id: success.connection_id,
            })
        } else {
            if let Err(e) = self.state.lock().handshakes.mark_peer_confirmed(&key) {
                debug!(node = %self.node_id, peer = %key.node_id, error = %e, "connect success without handshake");
            }
            None
        }
    }

    fn is_for_me(&self, request: &ProtocolMessage) -> bool {
        if request.is_addressed_to(&self.node_id) {
            return true;
        }
        warn!(
            node = %self.node_id,
            destination = %request.destination_id,
            kind = %request.message_type,
            "message not for this node"
        );
        false
    }

    fn respond<P: Payload>(&self, request: &ProtocolMessage, payload: &P) -> Option<ProtocolMessage> {
        match payload.to_bytes() {
            Ok(data) => Some(self.rpcs.response(request, data)),
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "failed to encode response");
                None
            }
        }
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("node_id", &self.node_id)
            .field("client_mode", &self.client_mode)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "service_tests.rs"]
mod tests;
