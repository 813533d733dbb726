//! Shared routing state.
//!
//! The routing table, client table, pending handshakes and group change
//! notifier live behind a single lock. Admission checks and the insert they
//! guard run in one critical section, and group change events are raised
//! before the lock is released. Transport calls are never made while the lock
//! is held.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client_table::ClientRoutingTable;
use crate::config::RoutingConfig;
use crate::error::RoutingResult;
use crate::group_change::{GroupChange, GroupChangeNotifier};
use crate::handshake::{HandshakeKey, HandshakeRegistry};
use crate::protocol::{NodeId, NodeInfo};
use crate::routing_table::RoutingTable;
use crate::timer::PendingRequestTimer;
use crate::transport::Transport;

/// Routing state shared by the service, the response handler and the node.
pub type SharedRoutingState = Arc<Mutex<RoutingState>>;

/// Which table holds a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// The routing table.
    Routing,
    /// The client table.
    Client,
}

/// Close-group snapshot to push to client peers after a group change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientUpdate {
    /// Clients to notify.
    pub clients: Vec<NodeInfo>,
    /// The new close group.
    pub close_ids: Vec<NodeId>,
}

/// Outcome of committing a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// Table the peer went into.
    pub table: TableKind,
    /// Member evicted to make room.
    pub evicted: Option<NodeInfo>,
    /// Close group change, already raised to observers.
    pub group_change: Option<GroupChange>,
    /// Updates owed to client peers.
    pub client_update: Option<ClientUpdate>,
    /// Session replaced when a member reconnected under a new connection id.
    pub stale_connection: Option<NodeId>,
}

/// Outcome of dropping a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dropped {
    /// Table the peer was in.
    pub table: TableKind,
    /// The removed peer.
    pub node: NodeInfo,
    /// Close group change, already raised to observers.
    pub group_change: Option<GroupChange>,
    /// Updates owed to client peers.
    pub client_update: Option<ClientUpdate>,
}

/// Everything guarded by the routing lock.
#[derive(Debug)]
pub struct RoutingState {
    /// Routing peers.
    pub routing_table: RoutingTable,
    /// Client peers.
    pub client_table: ClientRoutingTable,
    /// Handshakes in flight.
    pub handshakes: HandshakeRegistry,
    /// Close group change notifier.
    pub notifier: GroupChangeNotifier,
    known_close_ids: VecDeque<NodeId>,
    max_known_close_ids: usize,
    outbound_connects: HashSet<NodeId>,
}

impl RoutingState {
    /// Creates empty state for the node `node_id`.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        connection_id: NodeId,
        client_mode: bool,
        config: &RoutingConfig,
    ) -> Self {
        Self {
            routing_table: RoutingTable::new(node_id, connection_id, client_mode, config),
            client_table: ClientRoutingTable::new(node_id, config),
            handshakes: HandshakeRegistry::new(),
            notifier: GroupChangeNotifier::default(),
            known_close_ids: VecDeque::new(),
            max_known_close_ids: config.max_known_close_ids,
            outbound_connects: HashSet::new(),
        }
    }

    /// Wraps the state for sharing.
    #[must_use]
    pub fn shared(self) -> SharedRoutingState {
        Arc::new(Mutex::new(self))
    }

    /// Admission decision for a peer, routed to the table matching its mode.
    ///
    /// A client-mode node has no client table of its own and refuses clients.
    /// A member reconnecting under a new connection id is admitted back into
    /// the table it already occupies.
    #[must_use]
    pub fn check_admission(&self, peer: &NodeInfo, peer_is_client: bool) -> bool {
        if let Some((table, _)) = self.reconnecting(peer) {
            return peer.is_valid() && (table == TableKind::Client) == peer_is_client;
        }
        if peer_is_client {
            !self.routing_table.client_mode()
                && !self.routing_table.contains(&peer.node_id)
                && self
                    .client_table
                    .check_node(peer, &self.routing_table.furthest_close_node_id())
        } else {
            !self.client_table.contains(&peer.node_id) && self.routing_table.check_node(peer)
        }
    }

    /// Returns true if `node_id` is a member of either table, has a handshake
    /// in flight, or is the target of an unanswered Connect.
    #[must_use]
    pub fn is_known(&self, node_id: &NodeId) -> bool {
        self.routing_table.contains(node_id)
            || self.client_table.contains(node_id)
            || self.handshakes.contains_node(node_id)
            || self.outbound_connects.contains(node_id)
    }

    /// Records an outbound Connect to `node_id`. Returns false if one is already in flight.
    pub fn begin_outbound(&mut self, node_id: NodeId) -> bool {
        self.outbound_connects.insert(node_id)
    }

    /// Forgets the outbound Connect to `node_id`.
    pub fn end_outbound(&mut self, node_id: &NodeId) -> bool {
        self.outbound_connects.remove(node_id)
    }

    /// Simultaneous open: when both nodes send Connect to each other, the
    /// lower id keeps the requestor role and refuses the inbound request.
    #[must_use]
    pub fn outbound_takes_precedence(&self, node_id: &NodeId) -> bool {
        self.outbound_connects.contains(node_id) && self.routing_table.node_id() < *node_id
    }

    /// Commits a peer to the table matching its mode.
    ///
    /// Admission is re-checked here; `None` means the peer no longer fits.
    /// A reconnecting member keeps its place and only its connection id is
    /// refreshed.
    pub fn commit(&mut self, peer: NodeInfo, peer_is_client: bool) -> Option<Commit> {
        if !self.check_admission(&peer, peer_is_client) {
            return None;
        }
        let node_id = peer.node_id;
        if let Some((table, stale)) = self.reconnecting(&peer) {
            let refreshed = match table {
                TableKind::Routing => {
                    self.routing_table.update_connection_id(&node_id, peer.connection_id)
                }
                TableKind::Client => {
                    self.client_table.update_connection_id(&node_id, peer.connection_id)
                }
            };
            info!(
                node = %self.routing_table.node_id(),
                peer = %node_id,
                table = ?table,
                refreshed,
                "peer reconnected"
            );
            return Some(Commit {
                table,
                evicted: None,
                group_change: None,
                client_update: None,
                stale_connection: Some(stale),
            });
        }
        let commit = if peer_is_client {
            let boundary = self.routing_table.furthest_close_node_id();
            let insertion = self.client_table.add_node(peer, &boundary)?;
            Commit {
                table: TableKind::Client,
                evicted: insertion.evicted,
                group_change: None,
                client_update: None,
                stale_connection: None,
            }
        } else {
            let insertion = self.routing_table.add_node(peer)?;
            let client_update = self.raise(insertion.group_change.as_ref());
            Commit {
                table: TableKind::Routing,
                evicted: insertion.evicted,
                group_change: insertion.group_change,
                client_update,
                stale_connection: None,
            }
        };
        info!(
            node = %self.routing_table.node_id(),
            peer = %node_id,
            table = ?commit.table,
            routing_size = self.routing_table.size(),
            client_size = self.client_table.size(),
            "peer committed"
        );
        Some(commit)
    }

    /// Drops a peer from whichever table holds it.
    pub fn drop_node(&mut self, node_id: &NodeId) -> Option<Dropped> {
        if let Some(removal) = self.routing_table.drop_node(node_id) {
            let client_update = self.raise(removal.group_change.as_ref());
            return Some(Dropped {
                table: TableKind::Routing,
                node: removal.node,
                group_change: removal.group_change,
                client_update,
            });
        }
        self.client_table.drop_node(node_id).map(|node| Dropped {
            table: TableKind::Client,
            node,
            group_change: None,
            client_update: None,
        })
    }

    /// Drops the peer using `connection_id`, if any.
    pub fn drop_connection(&mut self, connection_id: &NodeId) -> Option<Dropped> {
        let node_id = self
            .routing_table
            .find_by_connection(connection_id)
            .or_else(|| self.client_table.find_by_connection(connection_id))
            .map(|n| n.node_id)?;
        self.drop_node(&node_id)
    }

    /// Remembers close-group ids learned from a peer, oldest forgotten first.
    pub fn merge_close_ids(&mut self, ids: &[NodeId]) {
        let own = self.routing_table.node_id();
        for id in ids {
            if !id.is_valid() || *id == own || self.known_close_ids.contains(id) {
                continue;
            }
            if self.known_close_ids.len() == self.max_known_close_ids {
                self.known_close_ids.pop_front();
            }
            if self.max_known_close_ids > 0 {
                self.known_close_ids.push_back(*id);
            }
        }
    }

    /// Close-group ids learned from peers.
    #[must_use]
    pub fn known_close_ids(&self) -> Vec<NodeId> {
        self.known_close_ids.iter().copied().collect()
    }

    /// Table holding `peer.node_id` and the session it is known by, when that
    /// differs from `peer.connection_id`.
    fn reconnecting(&self, peer: &NodeInfo) -> Option<(TableKind, NodeId)> {
        let (table, member) = match self.routing_table.get(&peer.node_id) {
            Some(member) => (TableKind::Routing, member),
            None => (TableKind::Client, self.client_table.get(&peer.node_id)?),
        };
        (member.connection_id != peer.connection_id).then_some((table, member.connection_id))
    }

    fn raise(&mut self, change: Option<&GroupChange>) -> Option<ClientUpdate> {
        let change = change?;
        self.notifier.notify(change);
        if self.routing_table.client_mode() || self.client_table.is_empty() {
            return None;
        }
        Some(ClientUpdate {
            clients: self.client_table.nodes().to_vec(),
            close_ids: change.new_close_group.clone(),
        })
    }
}

/// Arms a timer entry that abandons the handshake `key` at its recorded
/// deadline.
///
/// The callback holds weak references only, so a torn-down node is never
/// touched. On expiry the pending record is removed and the transport session
/// (if any) is released. A handshake that cannot be guarded is rejected on the
/// spot and its session released.
pub(crate) fn arm_handshake_guard(
    timer: &PendingRequestTimer,
    state: &SharedRoutingState,
    transport: &Arc<dyn Transport>,
    key: HandshakeKey,
) -> RoutingResult<()> {
    let Some(deadline) = state.lock().handshakes.get(&key).map(|r| r.deadline) else {
        debug!(peer = %key.node_id, "handshake finished before its guard was armed");
        return Ok(());
    };
    let guard_id = timer.new_correlation_id();
    let weak_state = Arc::downgrade(state);
    let weak_transport = Arc::downgrade(transport);
    let armed = timer.start(
        guard_id,
        deadline.saturating_duration_since(Instant::now()),
        Box::new(move |outcome| {
            if outcome.is_ok() {
                return;
            }
            let Some(state) = weak_state.upgrade() else {
                return;
            };
            let expired = state.lock().handshakes.time_out(&key);
            if let Some(record) = expired {
                warn!(peer = %key.node_id, role = ?record.role, state = %record.state, "handshake timed out");
                if let Some(transport) = weak_transport.upgrade() {
                    transport.remove(&key.connection_id);
                }
            }
        }),
    );
    if let Err(e) = armed {
        warn!(peer = %key.node_id, error = %e, "handshake guard not armed, rejecting");
        state.lock().handshakes.reject(&key);
        transport.remove(&key.connection_id);
        return Err(e);
    }
    if state.lock().handshakes.set_guard(&key, guard_id).is_err() {
        // Finished before the guard was attached.
        timer.cancel(guard_id);
    }
    Ok(())
}
