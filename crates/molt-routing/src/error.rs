//! Error types for molt-routing.

use thiserror::Error;

use crate::protocol::NodeId;
use crate::transport::TransportError;

/// Errors that can occur in routing operations.
///
/// Message handlers never surface these to the transport layer; they log and
/// drop the message instead. The caller-facing request APIs return them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RoutingError {
    /// Payload could not be decoded.
    #[error("failed to parse {what}: {reason}")]
    Parse {
        /// What was being parsed.
        what: &'static str,
        /// Decoder message.
        reason: String,
    },

    /// Payload could not be encoded.
    #[error("failed to encode {what}: {reason}")]
    Encode {
        /// What was being encoded.
        what: &'static str,
        /// Encoder message.
        reason: String,
    },

    /// Message is addressed to a different node.
    #[error("message addressed to {destination}, not this node")]
    Misaddressed {
        /// The destination the message carried.
        destination: NodeId,
    },

    /// Peer is valid but the table has no room for it.
    #[error("peer {peer} rejected by admission policy")]
    AdmissionRejected {
        /// The rejected peer.
        peer: NodeId,
    },

    /// No local endpoint could be paired with the peer's endpoints.
    #[error("endpoint negotiation with {peer} failed: {source}")]
    TransportNegotiationFailed {
        /// The peer being negotiated with.
        peer: NodeId,
        /// Transport status.
        source: TransportError,
    },

    /// The transport refused the connect attempt.
    #[error("transport connect to {peer} failed: {source}")]
    TransportConnectFailed {
        /// The peer being connected to.
        peer: NodeId,
        /// Transport status.
        source: TransportError,
    },

    /// No response arrived before the deadline.
    #[error("request {correlation_id} timed out")]
    Timeout {
        /// Correlation id of the request.
        correlation_id: u64,
    },

    /// Identifier is empty or has the wrong width.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A request with the same correlation id is already outstanding.
    #[error("correlation id {0} already registered")]
    DuplicateCorrelationId(u64),

    /// Sending a message failed.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// The owning node has shut down.
    #[error("routing node is shutting down")]
    Shutdown,
}

impl RoutingError {
    /// Creates a parse error for the named payload.
    pub fn parse(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Parse {
            what,
            reason: err.to_string(),
        }
    }

    /// Creates an encode error for the named payload.
    pub fn encode(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Encode {
            what,
            reason: err.to_string(),
        }
    }

    /// Returns true if this error is the timeout outcome of a request.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Result type for routing operations.
pub type RoutingResult<T> = Result<T, RoutingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_parse() {
        let err = RoutingError::parse("ConnectRequest", "expected value at line 1");
        let msg = err.to_string();
        assert!(msg.contains("ConnectRequest"));
        assert!(msg.contains("line 1"));
    }

    #[test]
    fn test_error_display_timeout() {
        let err = RoutingError::Timeout { correlation_id: 42 };
        assert!(err.to_string().contains("42"));
        assert!(err.is_timeout());
        assert!(!RoutingError::Shutdown.is_timeout());
    }

    #[test]
    fn test_error_display_negotiation() {
        let peer = NodeId::from_bytes([7; 32]);
        let err = RoutingError::TransportNegotiationFailed {
            peer,
            source: TransportError::NoEndpointAvailable,
        };
        let msg = err.to_string();
        assert!(msg.contains(&peer.to_string()));
        assert!(msg.contains("endpoint"));
    }

    #[test]
    fn test_error_from_transport() {
        let err: RoutingError = TransportError::PeerUnreachable.into();
        assert!(matches!(err, RoutingError::Transport(TransportError::PeerUnreachable)));
    }
}
