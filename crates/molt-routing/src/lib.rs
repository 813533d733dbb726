//! # molt-routing
//!
//! Overlay routing layer for the MOLT network.
//!
//! This crate provides:
//!
//! - XOR-distance routing table with a close group and bucket diversity
//! - Client table for client-mode peers within the close-group radius
//! - Pending-request timer correlating responses with requests
//! - The `Connect` / `ConnectSuccess` / `ConnectSuccessAcknowledgement` handshake
//! - Close group change notification
//!
//! ## Core Types
//!
//! - [`NodeId`]: 256-bit node identifier compared by XOR distance
//! - [`RoutingTable`]: Bounded table of routing peers
//! - [`ClientRoutingTable`]: Bounded table of client peers
//! - [`PendingRequestTimer`]: Correlation id registry with deadlines
//! - [`Service`]: Answers inbound requests
//! - [`ResponseHandler`]: Consumes responses and drives the requestor side
//! - [`RoutingNode`]: Ties the above to a [`Transport`]
//! - [`MemoryNetwork`]: In-process transport for tests and simulation

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client_table;
pub mod config;
pub mod error;
pub mod group_change;
pub mod handshake;
pub mod memory;
pub mod message;
pub mod nat;
pub mod network;
pub mod protocol;
pub mod response_handler;
pub mod routing_table;
pub mod rpcs;
pub mod service;
pub mod state;
pub mod timer;
pub mod transport;

pub use client_table::{ClientInsertion, ClientRoutingTable};
pub use config::{RoutingConfig, RoutingConfigBuilder};
pub use error::{RoutingError, RoutingResult};
pub use group_change::{GroupChange, GroupChangeListener, GroupChangeNotifier};
pub use handshake::{
    HandshakeError, HandshakeKey, HandshakeRegistry, HandshakeState, PendingConnection, Role,
};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{
    ClosestNodesUpdate, ConnectRequest, ConnectResponse, ConnectSuccess,
    ConnectSuccessAcknowledgement, Contact, FindNodesRequest, FindNodesResponse, GetGroupRequest,
    GetGroupResponse, MessageType, Payload, PingRequest, PingResponse, ProtocolMessage,
};
pub use nat::{EndpointPair, NatType};
pub use network::{NodeState, NodeStats, RoutingNode};
pub use protocol::{NodeId, NodeInfo, NodeKeys, XorDistance};
pub use response_handler::{ConnectOutcome, ResponseHandler};
pub use routing_table::{Insertion, Removal, RoutingTable};
pub use rpcs::{DirectMessage, RequestBuilder};
pub use service::Service;
pub use state::{ClientUpdate, Commit, Dropped, RoutingState, SharedRoutingState, TableKind};
pub use timer::{PendingRequestTimer, ResponseCallback};
pub use transport::{Transport, TransportError, TransportEvent};
