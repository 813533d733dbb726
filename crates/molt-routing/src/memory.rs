//! In-process transport.
//!
//! [`MemoryNetwork`] links [`MemoryTransport`]s living in the same process.
//! `send` reaches any registered node by id, standing in for overlay routing;
//! `send_direct` needs a live session. A session goes live once both ends
//! have called `connect` towards each other, and both ends are then told
//! through their event channel, in no particular order relative to other
//! traffic. Faults can be injected per connection id.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::message::ProtocolMessage;
use crate::nat::{EndpointPair, NatType};
use crate::protocol::NodeId;
use crate::transport::{Transport, TransportError, TransportEvent};

const FIRST_PORT: u16 = 40_000;

struct Registration {
    node_id: NodeId,
    nat_type: NatType,
    endpoints: EndpointPair,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Default)]
struct NetworkInner {
    next_port: u16,
    nodes: HashMap<NodeId, Registration>,
    by_node: HashMap<NodeId, NodeId>,
    attempts: HashSet<(NodeId, NodeId)>,
    links: HashSet<(NodeId, NodeId)>,
    failing_endpoints: HashSet<NodeId>,
    failing_connects: HashSet<NodeId>,
    delivered: u64,
}

impl NetworkInner {
    fn emit(&mut self, connection_id: &NodeId, event: TransportEvent) -> bool {
        let Some(registration) = self.nodes.get(connection_id) else {
            return false;
        };
        let sent = registration.events.send(event).is_ok();
        if sent {
            self.delivered += 1;
        }
        sent
    }
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b { (a, b) } else { (b, a) }
}

/// A set of in-process nodes that can reach each other.
#[derive(Default)]
pub struct MemoryNetwork {
    inner: Mutex<NetworkInner>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(NetworkInner {
                next_port: FIRST_PORT,
                ..NetworkInner::default()
            }),
        })
    }

    /// Attaches a node, returning its transport and event stream.
    pub fn register(
        self: &Arc<Self>,
        node_id: NodeId,
        connection_id: NodeId,
        nat_type: NatType,
    ) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let port = inner.next_port;
        inner.next_port = inner.next_port.wrapping_add(1).max(FIRST_PORT);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        inner.nodes.insert(
            connection_id,
            Registration {
                node_id,
                nat_type,
                endpoints: EndpointPair::new(addr, addr),
                events,
            },
        );
        inner.by_node.insert(node_id, connection_id);
        debug!(node = %node_id, port, "registered in memory network");

        let transport = MemoryTransport {
            network: Arc::clone(self),
            node_id,
            connection_id,
            nat_type,
        };
        (transport, rx)
    }

    /// Detaches a node, dropping its sessions.
    pub fn unregister(&self, connection_id: &NodeId) {
        let mut inner = self.inner.lock();
        let peers: Vec<NodeId> = inner
            .links
            .iter()
            .filter_map(|(a, b)| {
                if a == connection_id {
                    Some(*b)
                } else if b == connection_id {
                    Some(*a)
                } else {
                    None
                }
            })
            .collect();
        for peer in peers {
            inner.links.remove(&link(*connection_id, peer));
            inner.emit(
                &peer,
                TransportEvent::ConnectionLost {
                    connection_id: *connection_id,
                },
            );
        }
        inner.attempts.retain(|(a, b)| a != connection_id && b != connection_id);
        if let Some(registration) = inner.nodes.remove(connection_id) {
            if inner.by_node.get(&registration.node_id) == Some(connection_id) {
                inner.by_node.remove(&registration.node_id);
            }
        }
    }

    /// Makes endpoint negotiation by or towards `connection_id` fail.
    pub fn fail_endpoint_negotiation(&self, connection_id: NodeId) {
        self.inner.lock().failing_endpoints.insert(connection_id);
    }

    /// Makes connect attempts by or towards `connection_id` fail.
    pub fn fail_connect(&self, connection_id: NodeId) {
        self.inner.lock().failing_connects.insert(connection_id);
    }

    /// Clears injected faults for `connection_id`.
    pub fn heal(&self, connection_id: &NodeId) {
        let mut inner = self.inner.lock();
        inner.failing_endpoints.remove(connection_id);
        inner.failing_connects.remove(connection_id);
    }

    /// Tears down the session between two nodes, notifying both.
    pub fn disconnect(&self, a: &NodeId, b: &NodeId) -> bool {
        let mut inner = self.inner.lock();
        if !inner.links.remove(&link(*a, *b)) {
            return false;
        }
        inner.emit(a, TransportEvent::ConnectionLost { connection_id: *b });
        inner.emit(b, TransportEvent::ConnectionLost { connection_id: *a });
        true
    }

    /// Returns true if the two nodes share a live session.
    #[must_use]
    pub fn is_connected(&self, a: &NodeId, b: &NodeId) -> bool {
        self.inner.lock().links.contains(&link(*a, *b))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.inner.lock().links.len()
    }

    /// Number of events handed to nodes so far.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.inner.lock().delivered
    }
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryNetwork")
            .field("nodes", &inner.nodes.len())
            .field("links", &inner.links.len())
            .finish_non_exhaustive()
    }
}

/// One node's handle on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
    node_id: NodeId,
    connection_id: NodeId,
    nat_type: NatType,
}

impl MemoryTransport {
    /// This node's session id.
    #[must_use]
    pub const fn connection_id(&self) -> NodeId {
        self.connection_id
    }

    /// The network this transport belongs to.
    #[must_use]
    pub fn network(&self) -> &Arc<MemoryNetwork> {
        &self.network
    }
}

impl Transport for MemoryTransport {
    fn nat_type(&self) -> NatType {
        self.nat_type
    }

    fn local_endpoints(&self) -> Result<EndpointPair, TransportError> {
        let inner = self.network.inner.lock();
        if inner.failing_endpoints.contains(&self.connection_id) {
            return Err(TransportError::NoEndpointAvailable);
        }
        inner
            .nodes
            .get(&self.connection_id)
            .map(|r| r.endpoints)
            .ok_or(TransportError::NoEndpointAvailable)
    }

    fn get_available_endpoint(
        &self,
        peer_connection_id: &NodeId,
        _peer_endpoints: &EndpointPair,
        _nat_type: NatType,
    ) -> Result<EndpointPair, TransportError> {
        let inner = self.network.inner.lock();
        if inner.failing_endpoints.contains(&self.connection_id)
            || inner.failing_endpoints.contains(peer_connection_id)
        {
            return Err(TransportError::NoEndpointAvailable);
        }
        let Some(peer) = inner.nodes.get(peer_connection_id) else {
            return Err(TransportError::PeerUnreachable);
        };
        if !self.nat_type.can_pair_with(peer.nat_type) {
            debug!(node = %self.node_id, peer = %peer.node_id, "no endpoint pairing between NAT types");
            return Err(TransportError::NoEndpointAvailable);
        }
        inner
            .nodes
            .get(&self.connection_id)
            .map(|r| r.endpoints)
            .ok_or(TransportError::NoEndpointAvailable)
    }

    fn connect(
        &self,
        own_connection_id: &NodeId,
        peer_connection_id: &NodeId,
        peer_endpoints: &EndpointPair,
    ) -> Result<(), TransportError> {
        let mut inner = self.network.inner.lock();
        if inner.failing_connects.contains(own_connection_id)
            || inner.failing_connects.contains(peer_connection_id)
            || peer_endpoints.is_unspecified()
        {
            return Err(TransportError::ConnectFailed);
        }
        let Some(peer_node_id) = inner.nodes.get(peer_connection_id).map(|r| r.node_id) else {
            return Err(TransportError::PeerUnreachable);
        };
        let pair = link(*own_connection_id, *peer_connection_id);
        if inner.links.contains(&pair) {
            return Err(TransportError::AlreadyConnected);
        }

        inner.attempts.insert((*own_connection_id, *peer_connection_id));
        if inner.attempts.remove(&(*peer_connection_id, *own_connection_id)) {
            inner.attempts.remove(&(*own_connection_id, *peer_connection_id));
            inner.links.insert(pair);
            trace!(node = %self.node_id, peer = %peer_node_id, "session established");
            inner.emit(
                own_connection_id,
                TransportEvent::ConnectionEstablished {
                    node_id: peer_node_id,
                    connection_id: *peer_connection_id,
                },
            );
            inner.emit(
                peer_connection_id,
                TransportEvent::ConnectionEstablished {
                    node_id: self.node_id,
                    connection_id: *own_connection_id,
                },
            );
        }
        Ok(())
    }

    fn send_direct(
        &self,
        message: &ProtocolMessage,
        node_id: &NodeId,
        connection_id: &NodeId,
    ) -> Result<(), TransportError> {
        let mut inner = self.network.inner.lock();
        if !inner.links.contains(&link(self.connection_id, *connection_id)) {
            return Err(TransportError::NotConnected);
        }
        if inner.nodes.get(connection_id).map(|r| r.node_id) != Some(*node_id) {
            return Err(TransportError::PeerUnreachable);
        }
        if inner.emit(connection_id, TransportEvent::Message(message.clone())) {
            Ok(())
        } else {
            Err(TransportError::PeerUnreachable)
        }
    }

    fn send(&self, message: &ProtocolMessage) -> Result<(), TransportError> {
        let mut inner = self.network.inner.lock();
        let Some(connection_id) = inner.by_node.get(&message.destination_id).copied() else {
            return Err(TransportError::PeerUnreachable);
        };
        if inner.emit(&connection_id, TransportEvent::Message(message.clone())) {
            Ok(())
        } else {
            Err(TransportError::PeerUnreachable)
        }
    }

    fn remove(&self, peer_connection_id: &NodeId) {
        let mut inner = self.network.inner.lock();
        inner
            .attempts
            .retain(|(a, b)| !(a == &self.connection_id && b == peer_connection_id));
        inner
            .attempts
            .retain(|(a, b)| !(a == peer_connection_id && b == &self.connection_id));
        if inner.links.remove(&link(self.connection_id, *peer_connection_id)) {
            inner.emit(
                &self.connection_id,
                TransportEvent::ConnectionLost {
                    connection_id: *peer_connection_id,
                },
            );
            inner.emit(
                peer_connection_id,
                TransportEvent::ConnectionLost {
                    connection_id: self.connection_id,
                },
            );
        }
    }
}
