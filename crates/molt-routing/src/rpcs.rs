//! Outbound message builders.
//!
//! Requests and responses are signed with the node's key and carry its id,
//! client flag and hop budget. Responses are built from the request they
//! answer.

use std::sync::Arc;

use crate::error::RoutingResult;
use crate::message::{
    ClosestNodesUpdate, ConnectRequest, ConnectSuccess, ConnectSuccessAcknowledgement, Contact,
    FindNodesRequest, GetGroupRequest, MessageType, Payload, PingRequest, ProtocolMessage,
};
use crate::nat::{EndpointPair, NatType};
use crate::protocol::{NodeId, NodeKeys};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn timestamp_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A message to send over the live session with one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectMessage {
    /// The message.
    pub message: ProtocolMessage,
    /// Peer identity.
    pub node_id: NodeId,
    /// Peer session identity.
    pub connection_id: NodeId,
}

/// Builds this node's outbound messages.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    keys: Arc<NodeKeys>,
    connection_id: NodeId,
    client_mode: bool,
    hops_to_live: u32,
}

impl RequestBuilder {
    /// Creates a builder for the node holding `keys`.
    #[must_use]
    pub const fn new(
        keys: Arc<NodeKeys>,
        connection_id: NodeId,
        client_mode: bool,
        hops_to_live: u32,
    ) -> Self {
        Self {
            keys,
            connection_id,
            client_mode,
            hops_to_live,
        }
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        self.keys.identity()
    }

    /// This node's contact card for the given endpoints.
    #[must_use]
    pub fn contact(&self, endpoints: EndpointPair, nat_type: NatType) -> Contact {
        Contact {
            node_id: self.keys.identity(),
            connection_id: self.connection_id,
            endpoints,
            nat_type,
            public_key: Some(self.keys.public_key()),
        }
    }

    /// Ping request.
    pub fn ping(&self, id: u64, destination: NodeId) -> RoutingResult<ProtocolMessage> {
        let request = PingRequest {
            ping: true,
            timestamp: timestamp_ms(),
        };
        Ok(self.request(MessageType::Ping, id, destination, request.to_bytes()?))
    }

    /// Connect request offering `endpoints`.
    pub fn connect(
        &self,
        id: u64,
        destination: NodeId,
        endpoints: EndpointPair,
        nat_type: NatType,
    ) -> RoutingResult<ProtocolMessage> {
        let request = ConnectRequest {
            contact: self.contact(endpoints, nat_type),
            timestamp: timestamp_ms(),
        };
        Ok(self.request(MessageType::Connect, id, destination, request.to_bytes()?))
    }

    /// FindNodes request.
    pub fn find_nodes(
        &self,
        id: u64,
        destination: NodeId,
        target: NodeId,
        num_nodes_requested: u32,
    ) -> RoutingResult<ProtocolMessage> {
        let request = FindNodesRequest {
            num_nodes_requested,
            target,
            timestamp: timestamp_ms(),
        };
        Ok(self.request(MessageType::FindNodes, id, destination, request.to_bytes()?))
    }

    /// GetGroup request.
    pub fn get_group(
        &self,
        id: u64,
        destination: NodeId,
        target: NodeId,
    ) -> RoutingResult<ProtocolMessage> {
        let request = GetGroupRequest { target };
        Ok(self.request(MessageType::GetGroup, id, destination, request.to_bytes()?))
    }

    /// `ConnectSuccess` for the peer at the other end of a live session.
    pub fn connect_success(
        &self,
        destination: NodeId,
        is_requestor: bool,
    ) -> RoutingResult<ProtocolMessage> {
        let payload = ConnectSuccess {
            node_id: self.keys.identity(),
            connection_id: self.connection_id,
            is_requestor,
        };
        Ok(self.request(MessageType::ConnectSuccess, 0, destination, payload.to_bytes()?))
    }

    /// Acknowledgement of a `ConnectSuccess`, carrying this node's close group.
    pub fn connect_success_acknowledgement(
        &self,
        destination: NodeId,
        is_requestor: bool,
        close_ids: Vec<NodeId>,
    ) -> RoutingResult<ProtocolMessage> {
        let payload = ConnectSuccessAcknowledgement {
            node_id: self.keys.identity(),
            connection_id: self.connection_id,
            is_requestor,
            close_ids,
            client_node: self.client_mode,
        };
        let mut message = self.request(
            MessageType::ConnectSuccessAcknowledgement,
            0,
            destination,
            payload.to_bytes()?,
        );
        message.is_request = false;
        Ok(message)
    }

    /// Close-group snapshot pushed to a client.
    pub fn closest_nodes_update(
        &self,
        destination: NodeId,
        close_ids: Vec<NodeId>,
    ) -> RoutingResult<ProtocolMessage> {
        let payload = ClosestNodesUpdate {
            node: self.keys.identity(),
            close_ids,
        };
        let mut message = self.request(
            MessageType::ClosestNodesUpdate,
            0,
            destination,
            payload.to_bytes()?,
        );
        message.is_request = false;
        Ok(message)
    }

    /// Response envelope for `request`.
    ///
    /// Destination becomes the request's source, the hop budget is reset and
    /// the correlation id is kept.
    #[must_use]
    pub fn response(&self, request: &ProtocolMessage, data: Vec<u8>) -> ProtocolMessage {
        let signature = self.keys.sign(&data).to_bytes().to_vec();
        ProtocolMessage {
            message_type: request.message_type,
            id: request.id,
            source_id: self.keys.identity(),
            destination_id: request.source_id,
            data,
            signature,
            hops_to_live: self.hops_to_live,
            replication: 1,
            is_direct: true,
            is_client_node: self.client_mode,
            is_request: false,
            route_history: Vec::new(),
        }
    }

    fn request(
        &self,
        message_type: MessageType,
        id: u64,
        destination: NodeId,
        data: Vec<u8>,
    ) -> ProtocolMessage {
        let signature = self.keys.sign(&data).to_bytes().to_vec();
        let mut message = ProtocolMessage::new(message_type, self.keys.identity(), destination, data);
        message.id = id;
        message.signature = signature;
        message.hops_to_live = self.hops_to_live;
        message.is_client_node = self.client_mode;
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    fn builder(client_mode: bool) -> RequestBuilder {
        RequestBuilder::new(Arc::new(NodeKeys::generate()), NodeId::random(), client_mode, 12)
    }

    #[test]
    fn requests_are_addressed_and_signed() {
        let builder = builder(false);
        let dest = NodeId::random();
        let msg = builder.ping(5, dest).unwrap();

        assert!(msg.is_request);
        assert!(msg.is_well_formed());
        assert_eq!(msg.id, 5);
        assert_eq!(msg.source_id, builder.node_id());
        assert_eq!(msg.destination_id, dest);
        assert_eq!(msg.hops_to_live, 12);

        let signature = Signature::from_slice(&msg.signature).unwrap();
        assert!(builder.keys.public_key().verify(&msg.data, &signature).is_ok());
    }

    #[test]
    fn connect_carries_contact() {
        let builder = builder(true);
        let endpoints = EndpointPair::new(
            "10.0.0.1:5000".parse().unwrap(),
            "203.0.113.7:5000".parse().unwrap(),
        );
        let msg = builder
            .connect(1, NodeId::random(), endpoints, NatType::FullCone)
            .unwrap();

        assert!(msg.is_client_node);
        let request = ConnectRequest::parse(&msg.data).unwrap();
        assert_eq!(request.contact.node_id, builder.node_id());
        assert_eq!(request.contact.endpoints, endpoints);
        assert_eq!(request.contact.nat_type, NatType::FullCone);
        assert!(request.contact.public_key.is_some());
    }

    #[test]
    fn find_nodes_payload() {
        let builder = builder(false);
        let target = NodeId::random();
        let msg = builder.find_nodes(2, NodeId::random(), target, 4).unwrap();
        let request = FindNodesRequest::parse(&msg.data).unwrap();
        assert_eq!(request.target, target);
        assert_eq!(request.num_nodes_requested, 4);
    }

    #[test]
    fn acknowledgements_and_updates_travel_as_responses() {
        let builder = builder(false);
        let ack = builder
            .connect_success_acknowledgement(NodeId::random(), true, vec![NodeId::random()])
            .unwrap();
        let update = builder.closest_nodes_update(NodeId::random(), vec![]).unwrap();
        let success = builder.connect_success(NodeId::random(), false).unwrap();

        assert!(!ack.is_request);
        assert!(!update.is_request);
        assert!(success.is_request);
    }

    #[test]
    fn response_swaps_addressing() {
        let requestor = builder(false);
        let responder = RequestBuilder::new(Arc::new(NodeKeys::generate()), NodeId::random(), true, 30);
        let mut request = requestor.ping(9, responder.node_id()).unwrap();
        request.route_history.push(NodeId::random());

        let reply = responder.response(&request, b"pong".to_vec());
        assert_eq!(reply.source_id, responder.node_id());
        assert_eq!(reply.destination_id, requestor.node_id());
        assert_eq!(reply.id, 9);
        assert_eq!(reply.hops_to_live, 30);
        assert!(!reply.is_request);
        assert!(reply.is_direct);
        assert!(reply.is_client_node);
        assert_eq!(reply.replication, 1);
        assert!(reply.route_history.is_empty());
    }

    #[test]
    fn responses_are_signed_by_the_responder() {
        let keys = Arc::new(NodeKeys::generate());
        let responder = RequestBuilder::new(Arc::clone(&keys), NodeId::random(), false, 12);
        let request = builder(false).ping(3, responder.node_id()).unwrap();

        let reply = responder.response(&request, b"pong".to_vec());
        let signature = Signature::from_slice(&reply.signature).unwrap();
        assert!(keys.public_key().verify(&reply.data, &signature).is_ok());
        assert_ne!(reply.signature, request.signature);
    }

    #[test]
    fn timestamps_are_recent() {
        let before = chrono::Utc::now().timestamp_millis();
        let ts = timestamp_ms();
        assert!(ts >= before);
    }
}
