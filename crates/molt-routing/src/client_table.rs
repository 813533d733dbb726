//! Table of client-mode peers.
//!
//! Clients never route, so they do not compete for routing table slots.
//! A client is admitted only if it falls inside this node's close group, i.e.
//! it is closer to this node than the `closest_nodes_size`-th member of the
//! routing table.

use tracing::debug;

use crate::config::RoutingConfig;
use crate::protocol::{NodeId, NodeInfo};

/// Result of a successful client insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInsertion {
    /// Client pushed out to make room, if the table was full.
    pub evicted: Option<NodeInfo>,
}

/// Bounded set of client peers ordered by distance to this node.
#[derive(Debug, Clone)]
pub struct ClientRoutingTable {
    node_id: NodeId,
    max_size: usize,
    nodes: Vec<NodeInfo>,
}

impl ClientRoutingTable {
    /// Creates an empty table owned by `node_id`.
    #[must_use]
    pub fn new(node_id: NodeId, config: &RoutingConfig) -> Self {
        Self {
            node_id,
            max_size: config.max_client_routing_table_size,
            nodes: Vec::new(),
        }
    }

    /// Number of members.
    #[must_use]
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if there are no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Members, closest first.
    #[must_use]
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Returns true if `node_id` is a member.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.nodes.iter().any(|n| n.node_id == *node_id)
    }

    /// Looks up a member by id.
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.node_id == *node_id)
    }

    /// Finds the member using the given transport session.
    #[must_use]
    pub fn find_by_connection(&self, connection_id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.connection_id == *connection_id)
    }

    /// Admission check against the close-group boundary of the routing table.
    ///
    /// The client table's own fill level plays no part here.
    #[must_use]
    pub fn check_node(&self, peer: &NodeInfo, furthest_close_node_id: &NodeId) -> bool {
        peer.is_valid()
            && peer.node_id != self.node_id
            && !self.contains(&peer.node_id)
            && NodeId::closer_to_target(&peer.node_id, furthest_close_node_id, &self.node_id)
    }

    /// Inserts an admissible client.
    ///
    /// When the table is full the furthest client makes room for a closer
    /// one; otherwise the insert is a no-op and `None` is returned.
    pub fn add_node(
        &mut self,
        mut peer: NodeInfo,
        furthest_close_node_id: &NodeId,
    ) -> Option<ClientInsertion> {
        if !self.check_node(&peer, furthest_close_node_id) {
            debug!(node = %self.node_id, peer = %peer.node_id, "client table rejected peer");
            return None;
        }
        if self.nodes.len() >= self.max_size {
            let furthest = self.nodes.last()?;
            if !NodeId::closer_to_target(&peer.node_id, &furthest.node_id, &self.node_id) {
                debug!(node = %self.node_id, peer = %peer.node_id, "client table full");
                return None;
            }
        }

        peer.derive_bucket(&self.node_id);
        let distance = peer.node_id.distance(&self.node_id);
        let at = self
            .nodes
            .partition_point(|n| n.node_id.distance(&self.node_id) < distance);
        self.nodes.insert(at, peer);

        let evicted = if self.nodes.len() > self.max_size {
            self.nodes.pop()
        } else {
            None
        };
        Some(ClientInsertion { evicted })
    }

    /// Refreshes the transport session of an existing member.
    pub fn update_connection_id(&mut self, node_id: &NodeId, connection_id: NodeId) -> bool {
        match self.nodes.iter_mut().find(|n| n.node_id == *node_id) {
            Some(member) => {
                member.connection_id = connection_id;
                true
            }
            None => false,
        }
    }

    /// Removes a client.
    pub fn drop_node(&mut self, node_id: &NodeId) -> Option<NodeInfo> {
        let at = self.nodes.iter().position(|n| n.node_id == *node_id)?;
        Some(self.nodes.remove(at))
    }

    /// Client ids, closest first.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.node_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NODE_ID_LEN;
    use crate::routing_table::RoutingTable;
    use crate::routing_table::test_support::{id_at_distance, peer};

    fn owner() -> NodeId {
        NodeId::from_bytes([0x3C; NODE_ID_LEN])
    }

    fn config(client_max: usize) -> RoutingConfig {
        RoutingConfig::builder()
            .max_routing_table_size(8)
            .closest_nodes_size(2)
            .max_client_routing_table_size(client_max)
            .build()
            .unwrap()
    }

    #[test]
    fn admission_uses_close_group_boundary() {
        let config = config(4);
        let mut routing = RoutingTable::new(owner(), NodeId::random(), false, &config);
        let clients = ClientRoutingTable::new(owner(), &config);

        routing.add_node(peer(id_at_distance(&owner(), 0x02, 1))).unwrap();
        routing.add_node(peer(id_at_distance(&owner(), 0x08, 2))).unwrap();
        routing.add_node(peer(id_at_distance(&owner(), 0x20, 3))).unwrap();

        let boundary = routing.furthest_close_node_id();
        assert!(clients.check_node(&peer(id_at_distance(&owner(), 0x04, 9)), &boundary));
        // Closer than the routing table's furthest member, but outside the close group.
        assert!(!clients.check_node(&peer(id_at_distance(&owner(), 0x10, 9)), &boundary));
    }

    #[test]
    fn sparse_routing_table_admits_any_client() {
        let config = config(4);
        let routing = RoutingTable::new(owner(), NodeId::random(), false, &config);
        let clients = ClientRoutingTable::new(owner(), &config);

        let boundary = routing.furthest_close_node_id();
        assert!(clients.check_node(&peer(id_at_distance(&owner(), 0xF0, 1)), &boundary));
    }

    #[test]
    fn rejects_self_and_duplicates() {
        let config = config(4);
        let mut clients = ClientRoutingTable::new(owner(), &config);
        let boundary = id_at_distance(&owner(), 0xFF, 0xFF);
        let id = id_at_distance(&owner(), 0x01, 1);

        assert!(clients.add_node(peer(owner()), &boundary).is_none());
        assert!(clients.add_node(peer(id), &boundary).unwrap().evicted.is_none());
        assert!(clients.add_node(peer(id), &boundary).is_none());
        assert_eq!(clients.size(), 1);
    }

    #[test]
    fn full_table_keeps_the_closest_clients() {
        let config = config(2);
        let mut clients = ClientRoutingTable::new(owner(), &config);
        let boundary = id_at_distance(&owner(), 0xFF, 0xFF);

        let far = id_at_distance(&owner(), 0x40, 1);
        clients.add_node(peer(far), &boundary).unwrap();
        clients.add_node(peer(id_at_distance(&owner(), 0x20, 2)), &boundary).unwrap();

        assert!(clients.add_node(peer(id_at_distance(&owner(), 0x80, 3)), &boundary).is_none());

        let insertion = clients
            .add_node(peer(id_at_distance(&owner(), 0x10, 4)), &boundary)
            .unwrap();
        assert_eq!(insertion.evicted.map(|n| n.node_id), Some(far));
        assert_eq!(clients.size(), 2);
    }

    #[test]
    fn drop_and_lookup_by_connection() {
        let config = config(4);
        let mut clients = ClientRoutingTable::new(owner(), &config);
        let boundary = id_at_distance(&owner(), 0xFF, 0xFF);
        let info = peer(id_at_distance(&owner(), 0x01, 1));
        clients.add_node(info.clone(), &boundary).unwrap();

        assert_eq!(
            clients.find_by_connection(&info.connection_id).map(|n| n.node_id),
            Some(info.node_id)
        );
        assert_eq!(clients.drop_node(&info.node_id).map(|n| n.node_id), Some(info.node_id));
        assert!(clients.is_empty());
    }

    #[test]
    fn connection_id_refresh() {
        let config = config(4);
        let mut clients = ClientRoutingTable::new(owner(), &config);
        let boundary = id_at_distance(&owner(), 0xFF, 0xFF);
        let info = peer(id_at_distance(&owner(), 0x01, 1));
        clients.add_node(info.clone(), &boundary).unwrap();

        let fresh = NodeId::random();
        assert!(clients.update_connection_id(&info.node_id, fresh));
        assert_eq!(clients.get(&info.node_id).map(|n| n.connection_id), Some(fresh));
        assert!(clients.find_by_connection(&info.connection_id).is_none());
        assert!(!clients.update_connection_id(&NodeId::random(), fresh));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn admitted_clients_are_inside_the_close_group(
                routing_ids in prop::collection::vec(prop::array::uniform32(any::<u8>()), 0..12),
                candidate in prop::array::uniform32(any::<u8>()),
            ) {
                let config = config(16);
                let owner = owner();
                let mut routing = RoutingTable::new(owner, NodeId::random(), false, &config);
                for bytes in routing_ids {
                    let _ = routing.add_node(peer(NodeId::from_bytes(bytes)));
                }
                let mut clients = ClientRoutingTable::new(owner, &config);

                let boundary = routing.furthest_close_node_id();
                let candidate = NodeId::from_bytes(candidate);
                if clients.add_node(peer(candidate), &boundary).is_some() {
                    prop_assert!(NodeId::closer_to_target(&candidate, &boundary, &owner));
                    if let Some(nth) = routing.nth_closest(&owner, 2) {
                        prop_assert!(NodeId::closer_to_target(&candidate, &nth.node_id, &owner));
                    }
                }
            }
        }
    }
}
