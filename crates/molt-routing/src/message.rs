//! Routing protocol messages.
//!
//! A [`ProtocolMessage`] is the envelope every routing message travels in. The
//! typed payload rides in `data`, encoded with the [`Payload`] helpers.

use ed25519_dalek::VerifyingKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{RoutingError, RoutingResult};
use crate::nat::{EndpointPair, NatType};
use crate::protocol::NodeId;

/// Kind of routing message carried by an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Liveness probe.
    Ping,
    /// Handshake opener.
    Connect,
    /// Closest-node lookup.
    FindNodes,
    /// Sent once the transport session is live.
    ConnectSuccess,
    /// Confirms a `ConnectSuccess` and carries close-group ids.
    ConnectSuccessAcknowledgement,
    /// Close-group lookup for a target id.
    GetGroup,
    /// Close-group membership pushed to a client peer.
    ClosestNodesUpdate,
}

impl MessageType {
    /// Returns the message type as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Connect => "connect",
            Self::FindNodes => "find_nodes",
            Self::ConnectSuccess => "connect_success",
            Self::ConnectSuccessAcknowledgement => "connect_success_ack",
            Self::GetGroup => "get_group",
            Self::ClosestNodesUpdate => "closest_nodes_update",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Payload kind.
    pub message_type: MessageType,
    /// Correlation id tying a response to its request (0 when untracked).
    pub id: u64,
    /// Sender.
    pub source_id: NodeId,
    /// Recipient.
    pub destination_id: NodeId,
    /// Encoded payload.
    pub data: Vec<u8>,
    /// Sender's signature over `data`. Propagated, never checked here.
    pub signature: Vec<u8>,
    /// Remaining hop budget.
    pub hops_to_live: u32,
    /// Replication count.
    pub replication: u16,
    /// Whether the message goes straight to the destination.
    pub is_direct: bool,
    /// Whether the sender runs in client mode.
    pub is_client_node: bool,
    /// Request (true) or response (false).
    pub is_request: bool,
    /// Nodes the message passed through.
    pub route_history: Vec<NodeId>,
}

impl ProtocolMessage {
    /// Creates a request envelope with default routing fields.
    #[must_use]
    pub const fn new(
        message_type: MessageType,
        source_id: NodeId,
        destination_id: NodeId,
        data: Vec<u8>,
    ) -> Self {
        Self {
            message_type,
            id: 0,
            source_id,
            destination_id,
            data,
            signature: Vec::new(),
            hops_to_live: 0,
            replication: 1,
            is_direct: true,
            is_client_node: false,
            is_request: true,
            route_history: Vec::new(),
        }
    }

    /// Returns true if the message is addressed to `node_id`.
    #[must_use]
    pub fn is_addressed_to(&self, node_id: &NodeId) -> bool {
        self.destination_id == *node_id
    }

    /// Returns true if addressing and hop budget are set.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        self.source_id.is_valid() && self.destination_id.is_valid() && self.hops_to_live > 0
    }

    /// Serializes the envelope to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes an envelope from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A typed payload carried in [`ProtocolMessage::data`].
pub trait Payload: Serialize + DeserializeOwned {
    /// Name used in parse errors and logs.
    const NAME: &'static str;

    /// Encodes the payload.
    fn to_bytes(&self) -> RoutingResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| RoutingError::encode(Self::NAME, e))
    }

    /// Decodes the payload.
    fn parse(bytes: &[u8]) -> RoutingResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| RoutingError::parse(Self::NAME, e))
    }
}

/// Contact details exchanged during a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Node identity.
    pub node_id: NodeId,
    /// Transport session identity.
    pub connection_id: NodeId,
    /// Local and external endpoints.
    pub endpoints: EndpointPair,
    /// NAT classification.
    pub nat_type: NatType,
    /// Public key, when the sender shares it.
    pub public_key: Option<VerifyingKey>,
}

/// Ping request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    /// Always true.
    pub ping: bool,
    /// Sender timestamp (ms since epoch).
    pub timestamp: i64,
}

/// Ping response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    /// Always true.
    pub pong: bool,
    /// Encoded request being answered.
    pub original_request: Vec<u8>,
    /// Signature of the request being answered.
    pub original_signature: Vec<u8>,
    /// Responder timestamp (ms since epoch).
    pub timestamp: i64,
}

/// Connect request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Requestor contact and candidate endpoints.
    pub contact: Contact,
    /// Sender timestamp (ms since epoch).
    pub timestamp: i64,
}

/// Connect response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Whether the responder admitted the requestor.
    pub answer: bool,
    /// Responder contact; present only on a positive answer.
    pub contact: Option<Contact>,
    /// Encoded request being answered.
    pub original_request: Vec<u8>,
    /// Signature of the request being answered.
    pub original_signature: Vec<u8>,
    /// Responder timestamp (ms since epoch).
    pub timestamp: i64,
}

/// FindNodes request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodesRequest {
    /// How many ids the requester wants, the responder's own id included.
    pub num_nodes_requested: u32,
    /// Target to measure closeness against.
    pub target: NodeId,
    /// Sender timestamp (ms since epoch).
    pub timestamp: i64,
}

/// FindNodes response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodesResponse {
    /// Responder's own id first, then its closest known ids.
    pub nodes: Vec<NodeId>,
    /// Encoded request being answered.
    pub original_request: Vec<u8>,
    /// Signature of the request being answered.
    pub original_signature: Vec<u8>,
    /// Responder timestamp (ms since epoch).
    pub timestamp: i64,
}

/// Sent over a freshly live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectSuccess {
    /// Sender identity.
    pub node_id: NodeId,
    /// Sender session identity.
    pub connection_id: NodeId,
    /// Whether the sender was the requestor of the handshake.
    pub is_requestor: bool,
}

/// Acknowledges a `ConnectSuccess`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectSuccessAcknowledgement {
    /// Sender identity.
    pub node_id: NodeId,
    /// Sender session identity.
    pub connection_id: NodeId,
    /// Whether the sender was the requestor of the handshake.
    pub is_requestor: bool,
    /// Sender's current close group.
    pub close_ids: Vec<NodeId>,
    /// Whether the sender runs in client mode.
    pub client_node: bool,
}

/// GetGroup request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetGroupRequest {
    /// Id whose close group is wanted.
    pub target: NodeId,
}

/// GetGroup response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetGroupResponse {
    /// Id the group was computed for.
    pub target: NodeId,
    /// Group members, closest first.
    pub group: Vec<NodeId>,
}

/// Close-group snapshot pushed to a client peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosestNodesUpdate {
    /// Node whose group this is.
    pub node: NodeId,
    /// Group members, closest first.
    pub close_ids: Vec<NodeId>,
}

macro_rules! payload {
    ($($ty:ident),* $(,)?) => {
        $(impl Payload for $ty {
            const NAME: &'static str = stringify!($ty);
        })*
    };
}

payload!(
    PingRequest,
    PingResponse,
    ConnectRequest,
    ConnectResponse,
    FindNodesRequest,
    FindNodesResponse,
    ConnectSuccess,
    ConnectSuccessAcknowledgement,
    GetGroupRequest,
    GetGroupResponse,
    ClosestNodesUpdate,
);
