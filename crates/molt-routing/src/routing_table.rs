//! XOR-ordered routing table.
//!
//! Holds the closest known non-client peers to this node, bounded by
//! `max_routing_table_size`. Entries are kept sorted by distance to the
//! owner's id so the furthest member is always the last one.

use tracing::debug;

use crate::config::RoutingConfig;
use crate::group_change::GroupChange;
use crate::protocol::{NODE_ID_LEN, NodeId, NodeInfo};

/// Result of a successful insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Insertion {
    /// Member pushed out to make room, if the table was full.
    pub evicted: Option<NodeInfo>,
    /// Close group change caused by the insertion.
    pub group_change: Option<GroupChange>,
}

/// Result of a removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// The removed member.
    pub node: NodeInfo,
    /// Close group change caused by the removal.
    pub group_change: Option<GroupChange>,
}

/// Bounded set of routing peers ordered by distance to this node.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    node_id: NodeId,
    connection_id: NodeId,
    client_mode: bool,
    max_size: usize,
    close_group_size: usize,
    nodes: Vec<NodeInfo>,
}

impl RoutingTable {
    /// Creates an empty table owned by `node_id`.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        connection_id: NodeId,
        client_mode: bool,
        config: &RoutingConfig,
    ) -> Self {
        Self {
            node_id,
            connection_id,
            client_mode,
            max_size: config.max_routing_table_size,
            close_group_size: config.closest_nodes_size,
            nodes: Vec::with_capacity(config.max_routing_table_size),
        }
    }

    /// The owner's id.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The owner's transport session id.
    #[must_use]
    pub const fn connection_id(&self) -> NodeId {
        self.connection_id
    }

    /// Whether the owner runs in client mode.
    #[must_use]
    pub const fn client_mode(&self) -> bool {
        self.client_mode
    }

    /// Number of members.
    #[must_use]
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the table has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Maximum number of members.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.max_size
    }

    /// Members, closest first.
    #[must_use]
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// Returns true if `node_id` is a member.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.position(node_id).is_some()
    }

    /// Looks up a member by id.
    #[must_use]
    pub fn get(&self, node_id: &NodeId) -> Option<&NodeInfo> {
        self.position(node_id).map(|i| &self.nodes[i])
    }

    /// Finds the member using the given transport session.
    #[must_use]
    pub fn find_by_connection(&self, connection_id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.iter().find(|n| n.connection_id == *connection_id)
    }

    /// The furthest member.
    #[must_use]
    pub fn furthest(&self) -> Option<&NodeInfo> {
        self.nodes.last()
    }

    /// Admission check: valid, not self, not present, and either there is
    /// spare capacity or the candidate is closer than the furthest member.
    #[must_use]
    pub fn check_node(&self, peer: &NodeInfo) -> bool {
        peer.is_valid() && self.is_candidate(&peer.node_id)
    }

    /// The same check on a bare id, for peers not yet contacted.
    #[must_use]
    pub fn is_candidate(&self, node_id: &NodeId) -> bool {
        if !node_id.is_valid() || *node_id == self.node_id || self.contains(node_id) {
            return false;
        }
        if self.nodes.len() < self.max_size {
            return true;
        }
        self.furthest().is_some_and(|furthest| {
            NodeId::closer_to_target(node_id, &furthest.node_id, &self.node_id)
        })
    }

    /// Inserts an admissible peer, evicting the furthest member when full.
    ///
    /// Returns `None` without touching the table if the peer is not admissible.
    pub fn add_node(&mut self, mut peer: NodeInfo) -> Option<Insertion> {
        if !self.check_node(&peer) {
            debug!(node = %self.node_id, peer = %peer.node_id, "routing table rejected peer");
            return None;
        }
        let old_group = self.close_group_ids();

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

        Some(Insertion {
            evicted,
            group_change: GroupChange::between(old_group, self.close_group_ids()),
        })
    }

    /// Removes a member.
    pub fn drop_node(&mut self, node_id: &NodeId) -> Option<Removal> {
        let at = self.position(node_id)?;
        let old_group = self.close_group_ids();
        let node = self.nodes.remove(at);
        Some(Removal {
            node,
            group_change: GroupChange::between(old_group, self.close_group_ids()),
        })
    }

    /// Refreshes the transport session of an existing member.
    pub fn update_connection_id(&mut self, node_id: &NodeId, connection_id: NodeId) -> bool {
        match self.position(node_id) {
            Some(at) => {
                self.nodes[at].connection_id = connection_id;
                true
            }
            None => false,
        }
    }

    /// Up to `count` member ids ordered by distance to `target`.
    #[must_use]
    pub fn closest_nodes(&self, target: &NodeId, count: usize) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .map(|n| n.node_id)
            .filter(|id| *id != self.node_id)
            .collect();
        ids.sort_by(|a, b| a.cmp_distance(b, target));
        ids.truncate(count);
        ids
    }

    /// The `n`-th closest member to `target`, 1-based.
    #[must_use]
    pub fn nth_closest(&self, target: &NodeId, n: usize) -> Option<NodeInfo> {
        if n == 0 {
            return None;
        }
        let mut sorted: Vec<&NodeInfo> = self.nodes.iter().collect();
        sorted.sort_by(|a, b| a.node_id.cmp_distance(&b.node_id, target));
        sorted.get(n - 1).map(|info| (*info).clone())
    }

    /// Boundary of the close group used for client admission.
    ///
    /// With fewer than `closest_nodes_size` members every id is inside the
    /// group, so the furthest possible id is returned.
    #[must_use]
    pub fn furthest_close_node_id(&self) -> NodeId {
        self.nth_closest(&self.node_id, self.close_group_size)
            .map_or_else(|| furthest_possible_from(&self.node_id), |info| info.node_id)
    }

    /// Current close group, closest first.
    #[must_use]
    pub fn close_group_ids(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .take(self.close_group_size)
            .map(|n| n.node_id)
            .collect()
    }

    /// Returns true if `node_id` would fall inside the close group.
    #[must_use]
    pub fn is_in_close_group_range(&self, node_id: &NodeId) -> bool {
        NodeId::closer_to_target(node_id, &self.furthest_close_node_id(), &self.node_id)
    }

    fn position(&self, node_id: &NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.node_id == *node_id)
    }
}

/// The id at maximal XOR distance from `id` (its bitwise complement).
fn furthest_possible_from(id: &NodeId) -> NodeId {
    let mut bytes = [0u8; NODE_ID_LEN];
    for (out, byte) in bytes.iter_mut().zip(id.as_bytes()) {
        *out = !byte;
    }
    NodeId::from_bytes(bytes)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// An id at distance `distance` (high byte) from `owner`, made unique by `tag`.
    pub(crate) fn id_at_distance(owner: &NodeId, distance: u8, tag: u8) -> NodeId {
        let mut bytes = *owner.as_bytes();
        bytes[0] ^= distance;
        bytes[NODE_ID_LEN - 1] ^= tag;
        NodeId::from_bytes(bytes)
    }

    pub(crate) fn peer(node_id: NodeId) -> NodeInfo {
        NodeInfo::new(node_id, NodeId::random())
    }
}
