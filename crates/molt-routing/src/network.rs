//! Routing node.
//!
//! This module provides the node-level interface:
//! - [`RoutingNode`]: owns one node's routing state and dispatches transport events
//! - [`NodeState`]: lifecycle state
//! - [`NodeStats`]: traffic counters

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RoutingConfig;
use crate::error::{RoutingError, RoutingResult};
use crate::group_change::{GroupChange, GroupChangeListener};
use crate::handshake::HandshakeKey;
use crate::message::{
    FindNodesResponse, GetGroupResponse, MessageType, Payload, PingResponse, ProtocolMessage,
};
use crate::protocol::{NodeId, NodeInfo, NodeKeys};
use crate::response_handler::ResponseHandler;
use crate::rpcs::{DirectMessage, RequestBuilder};
use crate::service::Service;
use crate::state::{RoutingState, SharedRoutingState};
use crate::timer::PendingRequestTimer;
use crate::transport::{Transport, TransportEvent};

/// Lifecycle state of a routing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not processing events.
    Offline,
    /// Processing events.
    Online,
    /// Shutting down; pending requests are being cancelled.
    Leaving,
}

impl NodeState {
    /// Returns true if the node handles events and requests.
    #[must_use]
    pub const fn is_operational(&self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Traffic counters of a routing node.
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    /// Messages handed to the transport.
    pub messages_sent: u64,
    /// Messages received from the transport.
    pub messages_received: u64,
    /// Messages discarded (misaddressed, malformed, unexpected or offline).
    pub messages_dropped: u64,
    /// Inbound requests answered.
    pub requests_handled: u64,
    /// Inbound responses matched.
    pub responses_handled: u64,
    /// Transport sessions that came up.
    pub connections_established: u64,
    /// Transport sessions that went away.
    pub connections_lost: u64,
    /// Session notifications discarded for lack of a pending handshake.
    pub sessions_dropped: u64,
    /// When the node came online.
    pub online_since: Option<DateTime<Utc>>,
}

impl NodeStats {
    /// Creates zeroed statistics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            messages_sent: 0,
            messages_received: 0,
            messages_dropped: 0,
            requests_handled: 0,
            responses_handled: 0,
            connections_established: 0,
            connections_lost: 0,
            sessions_dropped: 0,
            online_since: None,
        }
    }

    /// How long the node has been online.
    #[must_use]
    pub fn uptime(&self) -> Option<Duration> {
        self.online_since.map(|t| {
            Utc::now()
                .signed_duration_since(t)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Records that the node came online.
    pub fn mark_online(&mut self) {
        self.online_since = Some(Utc::now());
    }

    /// Records that the node went offline.
    pub const fn mark_offline(&mut self) {
        self.online_since = None;
    }

    /// Records a message sent.
    pub const fn record_message_sent(&mut self) {
        self.messages_sent += 1;
    }

    /// Records a message received.
    pub const fn record_message_received(&mut self) {
        self.messages_received += 1;
    }

    /// Records a discarded message.
    pub const fn record_message_dropped(&mut self) {
        self.messages_dropped += 1;
    }

    /// Records an answered request.
    pub const fn record_request_handled(&mut self) {
        self.requests_handled += 1;
    }

    /// Records a matched response.
    pub const fn record_response_handled(&mut self) {
        self.responses_handled += 1;
    }

    /// Records a session coming up.
    pub const fn record_connection_established(&mut self) {
        self.connections_established += 1;
    }

    /// Records a session going away.
    pub const fn record_connection_lost(&mut self) {
        self.connections_lost += 1;
    }

    /// Records a session notification no handshake was waiting for.
    pub const fn record_session_dropped(&mut self) {
        self.sessions_dropped += 1;
    }
}

#[derive(Debug)]
struct NodeInner {
    state: NodeState,
    stats: NodeStats,
}

/// One node of the overlay.
///
/// Owns the routing state, the pending-request timer, the request service
/// and the response handler. Transport events are fed in through
/// [`RoutingNode::start`] or [`RoutingNode::handle_event`].
pub struct RoutingNode {
    node_id: NodeId,
    connection_id: NodeId,
    client_mode: bool,
    config: RoutingConfig,
    state: SharedRoutingState,
    timer: Arc<PendingRequestTimer>,
    transport: Arc<dyn Transport>,
    rpcs: RequestBuilder,
    service: Service,
    responses: Arc<ResponseHandler>,
    inner: Mutex<NodeInner>,
}

impl RoutingNode {
    /// Creates an offline node.
    pub fn new(
        keys: NodeKeys,
        connection_id: NodeId,
        client_mode: bool,
        config: RoutingConfig,
        transport: Arc<dyn Transport>,
    ) -> RoutingResult<Arc<Self>> {
        config.validate()?;
        if !connection_id.is_valid() {
            return Err(RoutingError::InvalidIdentifier(
                "connection id must not be empty".to_string(),
            ));
        }
        let keys = Arc::new(keys);
        let node_id = keys.identity();
        let state = RoutingState::new(node_id, connection_id, client_mode, &config).shared();
        let timer = Arc::new(PendingRequestTimer::new());
        let rpcs = RequestBuilder::new(keys, connection_id, client_mode, config.hops_to_live);
        let service = Service::new(
            connection_id,
            client_mode,
            config.clone(),
            Arc::clone(&state),
            Arc::clone(&transport),
            Arc::clone(&timer),
            rpcs.clone(),
        );
        let responses = ResponseHandler::new(
            connection_id,
            client_mode,
            config.clone(),
            Arc::clone(&state),
            Arc::clone(&transport),
            Arc::clone(&timer),
            rpcs.clone(),
        );

        Ok(Arc::new(Self {
            node_id,
            connection_id,
            client_mode,
            config,
            state,
            timer,
            transport,
            rpcs,
            service,
            responses,
            inner: Mutex::new(NodeInner {
                state: NodeState::Offline,
                stats: NodeStats::new(),
            }),
        }))
    }

    /// Brings the node online and spawns the loop draining `events`.
    ///
    /// The loop holds a weak reference and ends when the node is dropped or
    /// the event stream closes.
    pub fn start(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) -> JoinHandle<()> {
        {
            let mut inner = self.inner.lock();
            inner.state = NodeState::Online;
            inner.stats.mark_online();
        }
        info!(node = %self.node_id, client = self.client_mode, "routing node online");

        let node = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(node) = node.upgrade() else {
                    break;
                };
                node.handle_event(event);
            }
        })
    }

    /// Cancels pending requests and stops handling events.
    pub fn shutdown(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == NodeState::Offline {
                return;
            }
            inner.state = NodeState::Leaving;
        }
        self.timer.cancel_all();
        let mut inner = self.inner.lock();
        inner.state = NodeState::Offline;
        inner.stats.mark_offline();
        drop(inner);
        info!(node = %self.node_id, "routing node offline");
    }

    /// Handles one transport event.
    pub fn handle_event(&self, event: TransportEvent) {
        if !self.node_state().is_operational() {
            self.inner.lock().stats.record_message_dropped();
            return;
        }
        match event {
            TransportEvent::Message(message) => self.handle_message(message),
            TransportEvent::ConnectionEstablished {
                node_id,
                connection_id,
            } => self.on_connection_established(node_id, connection_id),
            TransportEvent::ConnectionLost { connection_id } => {
                self.on_connection_lost(&connection_id);
            }
        }
    }

    fn handle_message(&self, message: ProtocolMessage) {
        self.inner.lock().stats.record_message_received();
        if !message.is_well_formed() || !message.is_addressed_to(&self.node_id) {
            warn!(
                node = %self.node_id,
                source = %message.source_id,
                destination = %message.destination_id,
                kind = %message.message_type,
                "discarding message"
            );
            self.inner.lock().stats.record_message_dropped();
            return;
        }

        let handled = if message.is_request {
            self.handle_request(&message)
        } else {
            self.handle_response(message)
        };
        if !handled {
            self.inner.lock().stats.record_message_dropped();
        }
    }

    fn handle_request(&self, request: &ProtocolMessage) -> bool {
        let handled = match request.message_type {
            MessageType::Ping => self.reply(self.service.ping(request)),
            MessageType::Connect => self.reply(self.service.connect(request)),
            MessageType::FindNodes => self.reply(self.service.find_nodes(request)),
            MessageType::GetGroup => self.reply(self.service.get_group(request)),
            MessageType::ConnectSuccess => {
                match self.service.connect_success(request) {
                    Some(direct) => self.send_direct(&direct),
                    // Recorded without a reply.
                    None => true,
                }
            }
            MessageType::ConnectSuccessAcknowledgement | MessageType::ClosestNodesUpdate => {
                debug!(node = %self.node_id, kind = %request.message_type, "unexpected request");
                false
            }
        };
        if handled {
            self.inner.lock().stats.record_request_handled();
        }
        handled
    }

    fn handle_response(&self, response: ProtocolMessage) -> bool {
        let handled = match response.message_type {
            MessageType::Ping => self.responses.ping(response),
            MessageType::Connect => self.responses.connect(response),
            MessageType::FindNodes => self.responses.find_nodes(response),
            MessageType::GetGroup => self.responses.get_group(response),
            MessageType::ConnectSuccessAcknowledgement => self
                .responses
                .connect_success_acknowledgement(&response)
                .is_some(),
            MessageType::ClosestNodesUpdate => {
                self.responses.close_node_update_for_client(&response);
                self.client_mode
            }
            MessageType::ConnectSuccess => {
                debug!(node = %self.node_id, "unexpected connect success response");
                false
            }
        };
        if handled {
            self.inner.lock().stats.record_response_handled();
        }
        handled
    }

    /// Sends `ConnectSuccess` once the session of a pending handshake is live.
    fn on_connection_established(&self, node_id: NodeId, connection_id: NodeId) {
        self.inner.lock().stats.record_connection_established();
        let key = HandshakeKey::new(node_id, connection_id);
        let role = self.state.lock().handshakes.mark_transport_connected(&key);
        let role = match role {
            Ok(role) => role,
            Err(e) => {
                debug!(node = %self.node_id, peer = %key, error = %e, "session outside a handshake");
                self.inner.lock().stats.record_session_dropped();
                return;
            }
        };
        match self.rpcs.connect_success(node_id, role.is_requestor()) {
            Ok(message) => {
                self.send_direct(&DirectMessage {
                    message,
                    node_id,
                    connection_id,
                });
            }
            Err(e) => warn!(node = %self.node_id, error = %e, "failed to build connect success"),
        }
    }

    /// Drops whatever used the lost session and abandons its handshakes.
    fn on_connection_lost(&self, connection_id: &NodeId) {
        self.inner.lock().stats.record_connection_lost();
        let (dropped, abandoned) = {
            let mut state = self.state.lock();
            (
                state.drop_connection(connection_id),
                state.handshakes.remove_connection(connection_id),
            )
        };
        for record in abandoned {
            debug!(node = %self.node_id, peer = %record.peer.node_id, "handshake abandoned on connection loss");
            if let Some(guard) = record.guard_id {
                self.timer.cancel(guard);
            }
        }
        if let Some(dropped) = dropped {
            info!(
                node = %self.node_id,
                peer = %dropped.node.node_id,
                table = ?dropped.table,
                "peer lost"
            );
            if let Some(update) = &dropped.client_update {
                self.responses.send_client_updates(update);
            }
        }
    }

    /// Runs the handshake with `peer` as requestor.
    ///
    /// Resolves once the peer accepted and the transport connect started;
    /// the peer is committed when the acknowledgements have been exchanged.
    pub async fn connect_to(&self, peer: NodeId) -> RoutingResult<NodeId> {
        self.ensure_online()?;
        let outcome = self.responses.send_connect_request(peer)?;
        self.inner.lock().stats.record_message_sent();
        outcome.await.map_err(|_| RoutingError::Shutdown)?
    }

    /// Connects to each contact and asks it for the nodes closest to this one.
    ///
    /// Returns how many contacts accepted. Nodes named in the answers are
    /// connected to in the background.
    pub async fn bootstrap(&self, contacts: &[NodeId]) -> RoutingResult<usize> {
        let mut accepted = 0;
        for contact in contacts {
            match self.connect_to(*contact).await {
                Ok(_) => accepted += 1,
                Err(e) => {
                    warn!(node = %self.node_id, contact = %contact, error = %e, "bootstrap contact failed");
                    continue;
                }
            }
            let wanted = u32::try_from(self.config.closest_nodes_size).unwrap_or(u32::MAX);
            if let Err(e) = self.find_nodes(*contact, self.node_id, wanted).await {
                debug!(node = %self.node_id, contact = %contact, error = %e, "bootstrap lookup failed");
            }
        }
        Ok(accepted)
    }

    /// Pings `destination`.
    pub async fn ping(&self, destination: NodeId) -> RoutingResult<PingResponse> {
        let id = self.timer.new_correlation_id();
        let request = self.rpcs.ping(id, destination)?;
        let response = self.request(id, &request).await?;
        PingResponse::parse(&response.data)
    }

    /// Asks `destination` for up to `count` ids close to `target`, itself first.
    pub async fn find_nodes(
        &self,
        destination: NodeId,
        target: NodeId,
        count: u32,
    ) -> RoutingResult<Vec<NodeId>> {
        let id = self.timer.new_correlation_id();
        let request = self.rpcs.find_nodes(id, destination, target, count)?;
        let response = self.request(id, &request).await?;
        Ok(FindNodesResponse::parse(&response.data)?.nodes)
    }

    /// Asks `destination` for the close group of `target`.
    pub async fn get_group(&self, destination: NodeId, target: NodeId) -> RoutingResult<Vec<NodeId>> {
        let id = self.timer.new_correlation_id();
        let request = self.rpcs.get_group(id, destination, target)?;
        let response = self.request(id, &request).await?;
        Ok(GetGroupResponse::parse(&response.data)?.group)
    }

    async fn request(&self, id: u64, request: &ProtocolMessage) -> RoutingResult<ProtocolMessage> {
        self.ensure_online()?;
        let (tx, rx) = oneshot::channel();
        self.timer.start(
            id,
            self.config.response_timeout,
            Box::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        )?;
        if let Err(e) = self.transport.send(request) {
            self.timer.cancel(id);
            return Err(e.into());
        }
        self.inner.lock().stats.record_message_sent();
        rx.await.map_err(|_| RoutingError::Shutdown)?
    }

    fn reply(&self, response: Option<ProtocolMessage>) -> bool {
        let Some(response) = response else {
            return false;
        };
        match self.transport.send(&response) {
            Ok(()) => {
                self.inner.lock().stats.record_message_sent();
                true
            }
            Err(e) => {
                warn!(node = %self.node_id, destination = %response.destination_id, error = %e, "failed to send response");
                false
            }
        }
    }

    fn send_direct(&self, direct: &DirectMessage) -> bool {
        match self
            .transport
            .send_direct(&direct.message, &direct.node_id, &direct.connection_id)
        {
            Ok(()) => {
                self.inner.lock().stats.record_message_sent();
                true
            }
            Err(e) => {
                warn!(node = %self.node_id, peer = %direct.node_id, error = %e, "failed to send direct message");
                false
            }
        }
    }

    fn ensure_online(&self) -> RoutingResult<()> {
        if self.node_state().is_operational() {
            Ok(())
        } else {
            Err(RoutingError::Shutdown)
        }
    }

    /// This node's id.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// This node's session id.
    #[must_use]
    pub const fn connection_id(&self) -> NodeId {
        self.connection_id
    }

    /// Whether this node runs in client mode.
    #[must_use]
    pub const fn is_client(&self) -> bool {
        self.client_mode
    }

    /// The node's configuration.
    #[must_use]
    pub const fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn node_state(&self) -> NodeState {
        self.inner.lock().state
    }

    /// Snapshot of the traffic counters.
    #[must_use]
    pub fn stats(&self) -> NodeStats {
        self.inner.lock().stats.clone()
    }

    /// Routing table members, closest first.
    #[must_use]
    pub fn routing_nodes(&self) -> Vec<NodeInfo> {
        self.state.lock().routing_table.nodes().to_vec()
    }

    /// Client table members, closest first.
    #[must_use]
    pub fn client_nodes(&self) -> Vec<NodeInfo> {
        self.state.lock().client_table.nodes().to_vec()
    }

    /// The current close group.
    #[must_use]
    pub fn close_group(&self) -> Vec<NodeId> {
        self.state.lock().routing_table.close_group_ids()
    }

    /// Close-group ids learned from peers.
    #[must_use]
    pub fn known_close_ids(&self) -> Vec<NodeId> {
        self.state.lock().known_close_ids()
    }

    /// Number of handshakes in flight.
    #[must_use]
    pub fn pending_handshakes(&self) -> usize {
        self.state.lock().handshakes.len()
    }

    /// Number of completed handshakes.
    #[must_use]
    pub fn acknowledged_handshakes(&self) -> u64 {
        self.responses.acknowledged()
    }

    /// Subscribes to close group changes.
    #[must_use]
    pub fn subscribe_group_changes(&self) -> broadcast::Receiver<GroupChange> {
        self.state.lock().notifier.subscribe()
    }

    /// Registers a synchronous close group observer.
    ///
    /// The listener runs while the routing lock is held and must not call
    /// back into the node.
    pub fn add_group_change_listener(&self, listener: GroupChangeListener) {
        self.state.lock().notifier.add_listener(listener);
    }
}

impl std::fmt::Debug for RoutingNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingNode")
            .field("node_id", &self.node_id)
            .field("client_mode", &self.client_mode)
            .field("state", &self.node_state())
            .finish_non_exhaustive()
    }
}
