//! Tests for the response handlers.

use super::*;
use crate::memory::{MemoryNetwork, MemoryTransport};
use crate::message::{Contact, MessageType};
use crate::nat::{EndpointPair, NatType};
use crate::protocol::NodeKeys;
use crate::rpcs;
use crate::state::RoutingState;
use crate::transport::TransportEvent;
use std::time::Duration;
use tokio::sync::mpsc;

struct Fixture {
    network: Arc<MemoryNetwork>,
    handler: Arc<ResponseHandler>,
    state: SharedRoutingState,
    timer: Arc<PendingRequestTimer>,
    transport: MemoryTransport,
    node_id: NodeId,
    connection_id: NodeId,
    _events: mpsc::UnboundedReceiver<TransportEvent>,
}

fn fixture(client_mode: bool) -> Fixture {
    let config = RoutingConfig::for_testing();
    let keys = Arc::new(NodeKeys::generate());
    let node_id = keys.identity();
    let connection_id = NodeId::random();
    let network = MemoryNetwork::new();
    let (transport, events) = network.register(node_id, connection_id, NatType::None);
    let shared: Arc<dyn Transport> = Arc::new(transport.clone());
    let state = RoutingState::new(node_id, connection_id, client_mode, &config).shared();
    let timer = Arc::new(PendingRequestTimer::new());
    let rpcs = RequestBuilder::new(keys, connection_id, client_mode, config.hops_to_live);
    let handler = ResponseHandler::new(
        connection_id,
        client_mode,
        config,
        Arc::clone(&state),
        shared,
        Arc::clone(&timer),
        rpcs,
    );
    Fixture {
        network,
        handler,
        state,
        timer,
        transport,
        node_id,
        connection_id,
        _events: events,
    }
}

struct Remote {
    rpcs: RequestBuilder,
    node_id: NodeId,
    connection_id: NodeId,
    endpoints: EndpointPair,
    transport: MemoryTransport,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Remote {
    fn join(network: &Arc<MemoryNetwork>, client_mode: bool) -> Self {
        let keys = Arc::new(NodeKeys::generate());
        let node_id = keys.identity();
        let connection_id = NodeId::random();
        let (transport, events) = network.register(node_id, connection_id, NatType::None);
        let endpoints = transport.local_endpoints().unwrap();
        Self {
            rpcs: RequestBuilder::new(keys, connection_id, client_mode, 10),
            node_id,
            connection_id,
            endpoints,
            transport,
            events,
        }
    }

    fn key(&self) -> HandshakeKey {
        HandshakeKey::new(self.node_id, self.connection_id)
    }

    fn info(&self) -> NodeInfo {
        NodeInfo::new(self.node_id, self.connection_id)
    }

    fn contact(&self) -> Contact {
        self.rpcs.contact(self.endpoints, NatType::None)
    }

    /// Next routing message delivered to this remote.
    fn next_message(&mut self) -> ProtocolMessage {
        loop {
            match self.events.try_recv().unwrap() {
                TransportEvent::Message(message) => return message,
                _ => continue,
            }
        }
    }

    /// Answers the Connect request `request` with `answer`.
    fn answer(&self, request: &ProtocolMessage, answer: bool, contact: Option<Contact>) -> ProtocolMessage {
        let payload = ConnectResponse {
            answer,
            contact,
            original_request: request.data.clone(),
            original_signature: request.signature.clone(),
            timestamp: rpcs::timestamp_ms(),
        };
        self.rpcs.response(request, payload.to_bytes().unwrap())
    }
}

fn open_handshake(f: &Fixture, remote: &Remote, role: Role, peer_is_client: bool) -> HandshakeKey {
    let mut state = f.state.lock();
    let key = state
        .handshakes
        .begin(PendingConnection::new(
            remote.info(),
            role,
            peer_is_client,
            Instant::now() + Duration::from_secs(5),
        ))
        .unwrap();
    state.handshakes.advance(&key, HandshakeState::AdmissionChecked).unwrap();
    state.handshakes.advance(&key, HandshakeState::EndpointNegotiated).unwrap();
    key
}

// ========== Outbound Connect ==========

#[tokio::test]
async fn positive_answer_opens_requestor_handshake() {
    let f = fixture(false);
    let mut remote = Remote::join(&f.network, false);

    let outcome = f.handler.send_connect_request(remote.node_id).unwrap();
    let request = remote.next_message();
    assert_eq!(request.message_type, MessageType::Connect);
    assert!(f.state.lock().is_known(&remote.node_id));

    assert!(f.handler.connect(remote.answer(&request, true, Some(remote.contact()))));
    assert_eq!(outcome.await.unwrap(), Ok(remote.node_id));

    let state = f.state.lock();
    let record = state.handshakes.get(&remote.key()).unwrap();
    assert_eq!(record.role, Role::Requestor);
    assert_eq!(record.state, HandshakeState::EndpointNegotiated);
    assert!(record.guard_id.is_some());
    assert!(state.routing_table.is_empty());
}

#[tokio::test]
async fn negative_answer_is_reported() {
    let f = fixture(false);
    let mut remote = Remote::join(&f.network, false);

    let outcome = f.handler.send_connect_request(remote.node_id).unwrap();
    let request = remote.next_message();
    f.handler.connect(remote.answer(&request, false, None));

    assert_eq!(
        outcome.await.unwrap(),
        Err(RoutingError::AdmissionRejected {
            peer: remote.node_id
        })
    );
    assert!(!f.state.lock().is_known(&remote.node_id));
}

#[tokio::test]
async fn answer_from_another_node_is_refused() {
    let f = fixture(false);
    let mut remote = Remote::join(&f.network, false);
    let imposter = Remote::join(&f.network, false);

    let outcome = f.handler.send_connect_request(remote.node_id).unwrap();
    let request = remote.next_message();
    f.handler.connect(remote.answer(&request, true, Some(imposter.contact())));

    assert!(matches!(
        outcome.await.unwrap(),
        Err(RoutingError::InvalidIdentifier(_))
    ));
    assert!(f.state.lock().handshakes.is_empty());
}

#[tokio::test]
async fn transport_connect_failure_releases_handshake() {
    let f = fixture(false);
    let mut remote = Remote::join(&f.network, false);

    let outcome = f.handler.send_connect_request(remote.node_id).unwrap();
    let request = remote.next_message();
    f.network.fail_connect(remote.connection_id);
    f.handler.connect(remote.answer(&request, true, Some(remote.contact())));

    assert!(matches!(
        outcome.await.unwrap(),
        Err(RoutingError::TransportConnectFailed { .. })
    ));
    assert!(f.state.lock().handshakes.is_empty());
    assert_eq!(f.timer.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_connect_times_out() {
    let f = fixture(false);
    let remote = Remote::join(&f.network, false);

    let outcome = f.handler.send_connect_request(remote.node_id).unwrap();
    tokio::time::advance(RoutingConfig::for_testing().response_timeout * 2).await;

    assert!(outcome.await.unwrap().unwrap_err().is_timeout());
    assert!(!f.state.lock().is_known(&remote.node_id));
}

#[tokio::test(start_paused = true)]
async fn callback_after_handler_dropped_reports_shutdown() {
    let f = fixture(false);
    let remote = Remote::join(&f.network, false);

    let outcome = f.handler.send_connect_request(remote.node_id).unwrap();
    drop(f.handler);
    tokio::time::advance(RoutingConfig::for_testing().response_timeout * 2).await;

    assert_eq!(outcome.await.unwrap(), Err(RoutingError::Shutdown));
}

#[tokio::test]
async fn connect_request_refusals() {
    let f = fixture(false);
    let remote = Remote::join(&f.network, false);

    assert!(matches!(
        f.handler.send_connect_request(f.node_id),
        Err(RoutingError::InvalidIdentifier(_))
    ));

    let _pending = f.handler.send_connect_request(remote.node_id).unwrap();
    assert_eq!(
        f.handler.send_connect_request(remote.node_id).unwrap_err(),
        RoutingError::AdmissionRejected {
            peer: remote.node_id
        }
    );

    let stranger = NodeId::random();
    assert_eq!(
        f.handler.send_connect_request(stranger).unwrap_err(),
        RoutingError::Transport(TransportError::PeerUnreachable)
    );
    assert!(!f.state.lock().is_known(&stranger));
}

#[tokio::test]
async fn negotiation_failure_is_reported_at_once() {
    let f = fixture(false);
    let remote = Remote::join(&f.network, false);
    f.network.fail_endpoint_negotiation(f.connection_id);

    assert!(matches!(
        f.handler.send_connect_request(remote.node_id),
        Err(RoutingError::TransportNegotiationFailed { .. })
    ));
    assert!(!f.state.lock().is_known(&remote.node_id));
}

#[tokio::test]
async fn negotiation_uses_the_answered_session() {
    let f = fixture(false);
    let mut remote = Remote::join(&f.network, false);

    let outcome = f.handler.send_connect_request(remote.node_id).unwrap();
    let request = remote.next_message();
    f.network.fail_endpoint_negotiation(remote.connection_id);
    f.handler.connect(remote.answer(&request, true, Some(remote.contact())));

    assert!(matches!(
        outcome.await.unwrap(),
        Err(RoutingError::TransportNegotiationFailed { peer, .. }) if peer == remote.node_id
    ));
    assert!(!f.state.lock().is_known(&remote.node_id));
    assert_eq!(f.timer.pending_count(), 0);
}

// ========== Acknowledgement ==========

#[tokio::test]
async fn requestor_commits_on_responder_acknowledgement() {
    let f = fixture(false);
    let remote = Remote::join(&f.network, false);
    open_handshake(&f, &remote, Role::Requestor, false);
    let learned = NodeId::random();

    let ack = remote
        .rpcs
        .connect_success_acknowledgement(f.node_id, false, vec![learned])
        .unwrap();
    assert_eq!(
        f.handler.connect_success_acknowledgement(&ack),
        Some(TableKind::Routing)
    );

    let state = f.state.lock();
    assert!(state.routing_table.contains(&remote.node_id));
    assert!(state.handshakes.is_empty());
    assert_eq!(state.known_close_ids(), vec![learned]);
    drop(state);
    assert_eq!(f.handler.acknowledged(), 1);

    // A duplicate acknowledgement finds no handshake.
    assert_eq!(f.handler.connect_success_acknowledgement(&ack), None);
}

#[tokio::test]
async fn responder_commits_on_requestor_acknowledgement() {
    let f = fixture(false);
    let remote = Remote::join(&f.network, false);
    let key = open_handshake(&f, &remote, Role::Responder, false);
    let transport: Arc<dyn Transport> = Arc::new(f.transport.clone());
    arm_handshake_guard(&f.timer, &f.state, &transport, key).unwrap();
    assert_eq!(f.timer.pending_count(), 1);

    let ack = remote
        .rpcs
        .connect_success_acknowledgement(f.node_id, true, vec![])
        .unwrap();
    assert_eq!(
        f.handler.connect_success_acknowledgement(&ack),
        Some(TableKind::Routing)
    );
    assert_eq!(f.timer.pending_count(), 0);
}

#[tokio::test]
async fn acknowledgement_from_the_wrong_side_is_ignored() {
    let f = fixture(false);
    let remote = Remote::join(&f.network, false);
    open_handshake(&f, &remote, Role::Requestor, false);

    let ack = remote
        .rpcs
        .connect_success_acknowledgement(f.node_id, true, vec![])
        .unwrap();
    assert_eq!(f.handler.connect_success_acknowledgement(&ack), None);
    assert_eq!(f.state.lock().handshakes.len(), 1);
}

#[tokio::test]
async fn acknowledgement_disagreeing_with_peer_mode_is_rejected() {
    let f = fixture(false);
    // Connected as a routing peer, acknowledges as a client.
    let remote = Remote::join(&f.network, true);
    let key = open_handshake(&f, &remote, Role::Responder, false);
    let transport: Arc<dyn Transport> = Arc::new(f.transport.clone());
    arm_handshake_guard(&f.timer, &f.state, &transport, key).unwrap();
    f.transport
        .connect(&f.connection_id, &remote.connection_id, &remote.endpoints)
        .unwrap();
    remote
        .transport
        .connect(&remote.connection_id, &f.connection_id, &f.transport.local_endpoints().unwrap())
        .unwrap();
    assert!(f.network.is_connected(&f.connection_id, &remote.connection_id));

    let ack = remote
        .rpcs
        .connect_success_acknowledgement(f.node_id, true, vec![])
        .unwrap();
    assert_eq!(f.handler.connect_success_acknowledgement(&ack), None);

    let state = f.state.lock();
    assert!(state.handshakes.is_empty());
    assert!(state.routing_table.is_empty());
    assert!(state.client_table.is_empty());
    drop(state);
    assert_eq!(f.timer.pending_count(), 0);
    assert_eq!(f.handler.acknowledged(), 0);
    assert!(!f.network.is_connected(&f.connection_id, &remote.connection_id));
}

#[tokio::test]
async fn client_peer_goes_to_client_table() {
    let f = fixture(false);
    let remote = Remote::join(&f.network, true);
    open_handshake(&f, &remote, Role::Responder, true);

    let ack = remote
        .rpcs
        .connect_success_acknowledgement(f.node_id, true, vec![NodeId::random()])
        .unwrap();
    assert_eq!(
        f.handler.connect_success_acknowledgement(&ack),
        Some(TableKind::Client)
    );
    let state = f.state.lock();
    assert!(state.client_table.contains(&remote.node_id));
    assert!(!state.routing_table.contains(&remote.node_id));
    assert!(state.known_close_ids().is_empty());
}

#[tokio::test]
async fn acknowledgement_without_handshake_is_ignored() {
    let f = fixture(false);
    let remote = Remote::join(&f.network, false);
    let ack = remote
        .rpcs
        .connect_success_acknowledgement(f.node_id, false, vec![])
        .unwrap();
    assert_eq!(f.handler.connect_success_acknowledgement(&ack), None);
    assert!(f.state.lock().routing_table.is_empty());
}

// ========== FindNodes follow-up ==========

#[tokio::test]
async fn find_nodes_connects_to_unknown_nodes() {
    let f = fixture(false);
    let first = Remote::join(&f.network, false);
    let second = Remote::join(&f.network, false);
    let member = Remote::join(&f.network, false);
    f.state.lock().commit(member.info(), false).unwrap();

    let id = f.timer.new_correlation_id();
    f.timer
        .start(id, Duration::from_secs(5), Box::new(|_| {}))
        .unwrap();
    let payload = FindNodesResponse {
        nodes: vec![first.node_id, f.node_id, member.node_id, second.node_id],
        original_request: Vec::new(),
        original_signature: Vec::new(),
        timestamp: rpcs::timestamp_ms(),
    };
    let mut response = ProtocolMessage::new(
        MessageType::FindNodes,
        first.node_id,
        f.node_id,
        payload.to_bytes().unwrap(),
    );
    response.id = id;
    response.is_request = false;

    assert!(f.handler.find_nodes(response.clone()));
    let state = f.state.lock();
    assert!(state.is_known(&first.node_id));
    assert!(state.is_known(&second.node_id));
    drop(state);

    // Already resolved: no second round of connects.
    assert!(!f.handler.find_nodes(response));
}

// ========== Client updates ==========

#[tokio::test]
async fn client_connects_to_pushed_close_group() {
    let f = fixture(true);
    let routing = Remote::join(&f.network, false);
    let a = Remote::join(&f.network, false);
    let b = Remote::join(&f.network, false);

    let update = routing
        .rpcs
        .closest_nodes_update(f.node_id, vec![a.node_id, b.node_id, f.node_id])
        .unwrap();
    assert_eq!(f.handler.close_node_update_for_client(&update), 2);

    let state = f.state.lock();
    assert_eq!(state.known_close_ids(), vec![a.node_id, b.node_id]);
    assert!(state.is_known(&a.node_id));
}

#[tokio::test]
async fn routing_node_ignores_close_group_push() {
    let f = fixture(false);
    let routing = Remote::join(&f.network, false);
    let update = routing
        .rpcs
        .closest_nodes_update(f.node_id, vec![NodeId::random()])
        .unwrap();
    assert_eq!(f.handler.close_node_update_for_client(&update), 0);
}

#[tokio::test]
async fn client_updates_travel_over_live_sessions() {
    let f = fixture(false);
    let mut client = Remote::join(&f.network, true);
    let own_endpoints = f
        .transport
        .get_available_endpoint(&client.connection_id, &client.endpoints, NatType::None)
        .unwrap();
    f.transport
        .connect(&f.connection_id, &client.connection_id, &client.endpoints)
        .unwrap();
    client
        .transport
        .connect(&client.connection_id, &f.connection_id, &own_endpoints)
        .unwrap();

    let close_ids = vec![NodeId::random()];
    f.handler.send_client_updates(&ClientUpdate {
        clients: vec![client.info()],
        close_ids: close_ids.clone(),
    });

    let message = client.next_message();
    assert_eq!(message.message_type, MessageType::ClosestNodesUpdate);
    assert!(!message.is_request);
    let update = ClosestNodesUpdate::parse(&message.data).unwrap();
    assert_eq!(update.node, f.node_id);
    assert_eq!(update.close_ids, close_ids);
}
