//! Connection handshake state machine.
//!
//! Every in-flight handshake is one [`PendingConnection`] keyed by the peer's
//! `(node_id, connection_id)`:
//!
//! ```text
//! Discovered -> AdmissionChecked -> EndpointNegotiated -> TransportConnected -> Acknowledged
//!                      \                    \                      \
//!                       +--------------------+----------------------+--> Rejected | TimedOut
//! ```
//!
//! Completion is accepted from `EndpointNegotiated` as well as from
//! `TransportConnected`: the peer's acknowledgement can overtake the local
//! transport-connected notification. A record is removed when it reaches a
//! terminal state, so a handshake commits at most once.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::time::Instant;

use crate::protocol::{NodeId, NodeInfo};

/// Handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Peer learned from a handshake message.
    Discovered,
    /// Peer passed the admission check.
    AdmissionChecked,
    /// A local endpoint was paired with the peer's endpoints.
    EndpointNegotiated,
    /// The transport session is live.
    TransportConnected,
    /// Peer committed to a table.
    Acknowledged,
    /// Handshake aborted.
    Rejected,
    /// Handshake abandoned at its deadline.
    TimedOut,
}

impl HandshakeState {
    /// Returns true for `Acknowledged`, `Rejected` and `TimedOut`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Rejected | Self::TimedOut)
    }

    /// Returns true if moving to `next` is a legal step.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Rejected | Self::TimedOut => true,
            Self::Discovered => false,
            Self::AdmissionChecked => matches!(self, Self::Discovered),
            Self::EndpointNegotiated => matches!(self, Self::AdmissionChecked),
            Self::TransportConnected => matches!(self, Self::EndpointNegotiated),
            Self::Acknowledged => {
                matches!(self, Self::EndpointNegotiated | Self::TransportConnected)
            }
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Discovered => "discovered",
            Self::AdmissionChecked => "admission-checked",
            Self::EndpointNegotiated => "endpoint-negotiated",
            Self::TransportConnected => "transport-connected",
            Self::Acknowledged => "acknowledged",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

/// Which side of the handshake this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Sent the Connect request.
    Requestor,
    /// Answered the Connect request.
    Responder,
}

impl Role {
    /// Returns true for [`Role::Requestor`].
    #[must_use]
    pub const fn is_requestor(&self) -> bool {
        matches!(self, Self::Requestor)
    }
}

/// Identity of an in-flight handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandshakeKey {
    /// Peer identity.
    pub node_id: NodeId,
    /// Peer session identity.
    pub connection_id: NodeId,
}

impl HandshakeKey {
    /// Creates a key.
    #[must_use]
    pub const fn new(node_id: NodeId, connection_id: NodeId) -> Self {
        Self {
            node_id,
            connection_id,
        }
    }

    /// Key of the handshake with `peer`.
    #[must_use]
    pub const fn of(peer: &NodeInfo) -> Self {
        Self::new(peer.node_id, peer.connection_id)
    }
}

impl fmt::Display for HandshakeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node_id.short(), self.connection_id.short())
    }
}

/// Errors raised by the handshake registry.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// No handshake with this key is in flight.
    #[error("no pending handshake with {0}")]
    Unknown(HandshakeKey),
    /// A handshake with this key is already in flight.
    #[error("handshake with {0} already pending")]
    AlreadyPending(HandshakeKey),
    /// The requested step is not legal from the current state.
    #[error("illegal handshake transition {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: HandshakeState,
        /// Requested state.
        to: HandshakeState,
    },
}

/// A handshake in flight with one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConnection {
    /// The peer.
    pub peer: NodeInfo,
    /// This node's role.
    pub role: Role,
    /// Current state.
    pub state: HandshakeState,
    /// Whether the peer runs in client mode (decides its table).
    pub peer_is_client: bool,
    /// Whether the peer's own `ConnectSuccess` has been seen.
    pub peer_confirmed: bool,
    /// When the handshake is abandoned.
    pub deadline: Instant,
    /// Timer entry guarding the deadline.
    pub guard_id: Option<u64>,
}

impl PendingConnection {
    /// Creates a record in the `Discovered` state.
    #[must_use]
    pub const fn new(peer: NodeInfo, role: Role, peer_is_client: bool, deadline: Instant) -> Self {
        Self {
            peer,
            role,
            state: HandshakeState::Discovered,
            peer_is_client,
            peer_confirmed: false,
            deadline,
            guard_id: None,
        }
    }

    /// Key of this handshake.
    #[must_use]
    pub const fn key(&self) -> HandshakeKey {
        HandshakeKey::of(&self.peer)
    }

    fn advance(&mut self, next: HandshakeState) -> Result<(), HandshakeError> {
        if !self.state.can_transition_to(next) {
            return Err(HandshakeError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// All handshakes in flight on this node.
#[derive(Debug, Default)]
pub struct HandshakeRegistry {
    pending: HashMap<HandshakeKey, PendingConnection>,
}

impl HandshakeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handshakes in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if no handshake is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Looks up a handshake.
    #[must_use]
    pub fn get(&self, key: &HandshakeKey) -> Option<&PendingConnection> {
        self.pending.get(key)
    }

    /// Returns true if any handshake with `node_id` is in flight.
    #[must_use]
    pub fn contains_node(&self, node_id: &NodeId) -> bool {
        self.pending.keys().any(|k| k.node_id == *node_id)
    }

    /// Records a newly discovered peer.
    pub fn begin(&mut self, record: PendingConnection) -> Result<HandshakeKey, HandshakeError> {
        let key = record.key();
        if self.pending.contains_key(&key) {
            return Err(HandshakeError::AlreadyPending(key));
        }
        self.pending.insert(key, record);
        Ok(key)
    }

    /// Moves a handshake to a non-terminal state.
    pub fn advance(
        &mut self,
        key: &HandshakeKey,
        next: HandshakeState,
    ) -> Result<(), HandshakeError> {
        if next.is_terminal() {
            return Err(HandshakeError::InvalidTransition {
                from: self.state_of(key)?,
                to: next,
            });
        }
        self.pending
            .get_mut(key)
            .ok_or(HandshakeError::Unknown(*key))?
            .advance(next)
    }

    /// Attaches the timer entry guarding a handshake's deadline.
    pub fn set_guard(&mut self, key: &HandshakeKey, guard_id: u64) -> Result<(), HandshakeError> {
        let record = self.pending.get_mut(key).ok_or(HandshakeError::Unknown(*key))?;
        record.guard_id = Some(guard_id);
        Ok(())
    }

    /// Marks the session as live and returns this node's role.
    pub fn mark_transport_connected(&mut self, key: &HandshakeKey) -> Result<Role, HandshakeError> {
        let record = self.pending.get_mut(key).ok_or(HandshakeError::Unknown(*key))?;
        record.advance(HandshakeState::TransportConnected)?;
        Ok(record.role)
    }

    /// Records that the peer's `ConnectSuccess` arrived.
    ///
    /// Returns false if it had already been recorded.
    pub fn mark_peer_confirmed(&mut self, key: &HandshakeKey) -> Result<bool, HandshakeError> {
        let record = self.pending.get_mut(key).ok_or(HandshakeError::Unknown(*key))?;
        if record.state.is_terminal() {
            return Err(HandshakeError::InvalidTransition {
                from: record.state,
                to: record.state,
            });
        }
        Ok(!std::mem::replace(&mut record.peer_confirmed, true))
    }

    /// Finishes a handshake successfully, removing it.
    pub fn complete(&mut self, key: &HandshakeKey) -> Result<PendingConnection, HandshakeError> {
        self.finish(key, HandshakeState::Acknowledged)
    }

    /// Aborts a handshake, removing it.
    pub fn reject(&mut self, key: &HandshakeKey) -> Option<PendingConnection> {
        self.finish(key, HandshakeState::Rejected).ok()
    }

    /// Abandons a handshake at its deadline, removing it.
    pub fn time_out(&mut self, key: &HandshakeKey) -> Option<PendingConnection> {
        self.finish(key, HandshakeState::TimedOut).ok()
    }

    /// Rejects every handshake using `connection_id`.
    pub fn remove_connection(&mut self, connection_id: &NodeId) -> Vec<PendingConnection> {
        let keys: Vec<HandshakeKey> = self
            .pending
            .keys()
            .filter(|k| k.connection_id == *connection_id)
            .copied()
            .collect();
        keys.iter().filter_map(|key| self.reject(key)).collect()
    }

    fn state_of(&self, key: &HandshakeKey) -> Result<HandshakeState, HandshakeError> {
        self.pending
            .get(key)
            .map(|r| r.state)
            .ok_or(HandshakeError::Unknown(*key))
    }

    fn finish(
        &mut self,
        key: &HandshakeKey,
        terminal: HandshakeState,
    ) -> Result<PendingConnection, HandshakeError> {
        let from = self.state_of(key)?;
        if !from.can_transition_to(terminal) {
            return Err(HandshakeError::InvalidTransition { from, to: terminal });
        }
        let mut record = self.pending.remove(key).ok_or(HandshakeError::Unknown(*key))?;
        record.state = terminal;
        Ok(record)
    }
}

#[cfg(test)]
#[path = "handshake_tests.rs"]
mod tests;
