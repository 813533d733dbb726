//! Transport collaborator contract.
//!
//! The routing layer never touches sockets. It drives a [`Transport`] to
//! negotiate endpoints, open sessions and deliver messages. Every call returns
//! immediately; a connect attempt that succeeds is reported later through the
//! node's event stream, not through the return value.

use thiserror::Error;

use crate::message::ProtocolMessage;
use crate::nat::{EndpointPair, NatType};
use crate::protocol::NodeId;

/// Status returned by a failed transport call.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TransportError {
    /// No local endpoint can be paired with the peer's endpoints.
    #[error("no endpoint available")]
    NoEndpointAvailable,
    /// The connect attempt was refused.
    #[error("connect failed")]
    ConnectFailed,
    /// No live session exists with the peer.
    #[error("not connected")]
    NotConnected,
    /// The peer is not reachable through the overlay.
    #[error("peer unreachable")]
    PeerUnreachable,
    /// A session with the peer already exists.
    #[error("already connected")]
    AlreadyConnected,
}

/// Asynchronous notifications from the transport to a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A routing message arrived.
    Message(ProtocolMessage),
    /// A session with the peer is live.
    ConnectionEstablished {
        /// Peer identity.
        node_id: NodeId,
        /// Peer session identity.
        connection_id: NodeId,
    },
    /// A session with the peer went away.
    ConnectionLost {
        /// Peer session identity.
        connection_id: NodeId,
    },
}

/// Operations the routing layer needs from the underlying transport.
pub trait Transport: Send + Sync {
    /// NAT classification of this node.
    fn nat_type(&self) -> NatType;

    /// Local endpoints to offer a peer whose session is not yet known.
    ///
    /// On success at least one of the returned endpoints is specified.
    fn local_endpoints(&self) -> Result<EndpointPair, TransportError>;

    /// Picks a local endpoint pair usable towards the session
    /// `peer_connection_id` reachable at `peer_endpoints`.
    ///
    /// On success at least one of the returned endpoints is specified.
    fn get_available_endpoint(
        &self,
        peer_connection_id: &NodeId,
        peer_endpoints: &EndpointPair,
        nat_type: NatType,
    ) -> Result<EndpointPair, TransportError>;

    /// Starts connecting to a peer. Completion is reported asynchronously.
    fn connect(
        &self,
        own_connection_id: &NodeId,
        peer_connection_id: &NodeId,
        peer_endpoints: &EndpointPair,
    ) -> Result<(), TransportError>;

    /// Sends over the live session identified by `connection_id`.
    fn send_direct(
        &self,
        message: &ProtocolMessage,
        node_id: &NodeId,
        connection_id: &NodeId,
    ) -> Result<(), TransportError>;

    /// Sends towards `message.destination_id` through the overlay.
    fn send(&self, message: &ProtocolMessage) -> Result<(), TransportError>;

    /// Tears down any session or pending attempt with the peer.
    fn remove(&self, peer_connection_id: &NodeId);
}
