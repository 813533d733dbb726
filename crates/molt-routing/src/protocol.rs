//! Core identity types for the routing layer.
//!
//! This module defines:
//! - [`NodeId`]: fixed-width identifier with the XOR closeness ordering
//! - [`XorDistance`]: distance between two identifiers, ordered as an unsigned integer
//! - [`NodeInfo`]: a peer as held by the routing and client tables
//! - [`NodeKeys`]: this node's signing identity

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{RoutingError, RoutingResult};

/// Width of every identifier in bytes.
pub const NODE_ID_LEN: usize = 32;

/// Identifier of a node or of a transport session.
///
/// The all-zero value is the empty identifier and is never valid on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    bytes: [u8; NODE_ID_LEN],
}

impl NodeId {
    /// The empty identifier.
    pub const ZERO: Self = Self {
        bytes: [0; NODE_ID_LEN],
    };

    /// Creates a `NodeId` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self { bytes }
    }

    /// Creates a `NodeId` from a byte slice, checking its width.
    pub fn from_slice(bytes: &[u8]) -> RoutingResult<Self> {
        let bytes: [u8; NODE_ID_LEN] = bytes.try_into().map_err(|_| {
            RoutingError::InvalidIdentifier(format!(
                "expected {NODE_ID_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Generates a uniformly random identifier.
    #[must_use]
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Derives a node identifier from an Ed25519 public key (BLAKE3 of the key bytes).
    #[must_use]
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self {
            bytes: *blake3::hash(key.as_bytes()).as_bytes(),
        }
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.bytes
    }

    /// Returns true for the all-zero identifier.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes == [0; NODE_ID_LEN]
    }

    /// Returns true if the identifier may appear in a message.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.is_empty()
    }

    /// XOR distance between `self` and `other`.
    #[must_use]
    pub fn distance(&self, other: &Self) -> XorDistance {
        let mut out = [0u8; NODE_ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.bytes[i] ^ other.bytes[i];
        }
        XorDistance(out)
    }

    /// Orders `self` and `other` by closeness to `target` (closest first).
    #[must_use]
    pub fn cmp_distance(&self, other: &Self, target: &Self) -> Ordering {
        self.distance(target).cmp(&other.distance(target))
    }

    /// Returns true if `lhs` is strictly closer to `target` than `rhs`.
    #[must_use]
    pub fn closer_to_target(lhs: &Self, rhs: &Self, target: &Self) -> bool {
        lhs.cmp_distance(rhs, target) == Ordering::Less
    }

    /// Number of leading bits shared with `other`.
    #[must_use]
    pub fn common_leading_bits(&self, other: &Self) -> usize {
        self.distance(other).leading_zeros()
    }

    /// Short hex prefix for log lines.
    #[must_use]
    pub fn short(&self) -> String {
        self.bytes[..4].iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.bytes).into_string())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}..)", self.short())
    }
}

/// XOR distance between two identifiers.
///
/// Byte arrays compare lexicographically, which for a big-endian value is
/// the same as comparing unsigned integers, so the derived `Ord` is the
/// closeness order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct XorDistance([u8; NODE_ID_LEN]);

impl XorDistance {
    /// Returns the raw distance bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Count of leading zero bits (the shared prefix length).
    #[must_use]
    pub fn leading_zeros(&self) -> usize {
        let mut zeros = 0;
        for byte in &self.0 {
            if *byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        zeros
    }
}

impl fmt::Debug for XorDistance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "XorDistance(lz={})", self.leading_zeros())
    }
}

/// A peer as tracked by the routing layer.
///
/// `node_id` names the peer; `connection_id` names the transport session and
/// is the only field refreshed once the entry is committed to a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Logical identity of the peer.
    pub node_id: NodeId,
    /// Identity of the transport session with the peer.
    pub connection_id: NodeId,
    /// The peer's public key, when known.
    pub public_key: Option<VerifyingKey>,
    bucket_index: usize,
}

impl NodeInfo {
    /// Creates a new `NodeInfo`.
    #[must_use]
    pub const fn new(node_id: NodeId, connection_id: NodeId) -> Self {
        Self {
            node_id,
            connection_id,
            public_key: None,
            bucket_index: 0,
        }
    }

    /// Attaches the peer's public key.
    #[must_use]
    pub fn with_public_key(mut self, key: VerifyingKey) -> Self {
        self.public_key = Some(key);
        self
    }

    /// Returns true if both identifiers are valid.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.node_id.is_valid() && self.connection_id.is_valid()
    }

    /// Bucket index relative to the owning table (shared prefix length with it).
    #[must_use]
    pub const fn bucket_index(&self) -> usize {
        self.bucket_index
    }

    pub(crate) fn derive_bucket(&mut self, owner: &NodeId) {
        self.bucket_index = owner.common_leading_bits(&self.node_id);
    }
}

/// This node's signing identity.
#[derive(Debug, Clone)]
pub struct NodeKeys {
    signing_key: SigningKey,
    identity: NodeId,
}

impl NodeKeys {
    /// Generates a fresh key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Wraps an existing signing key.
    #[must_use]
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let identity = NodeId::from_public_key(&signing_key.verifying_key());
        Self {
            signing_key,
            identity,
        }
    }

    /// Node identifier derived from the public key.
    #[must_use]
    pub const fn identity(&self) -> NodeId {
        self.identity
    }

    /// The public half of the key pair.
    #[must_use]
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Signs `data`.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    fn id_with_prefix(prefix: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[0] = prefix;
        bytes[NODE_ID_LEN - 1] = 1;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn node_id_zero_is_empty_and_invalid() {
        assert!(NodeId::ZERO.is_empty());
        assert!(!NodeId::ZERO.is_valid());
        assert!(NodeId::random().is_valid());
    }

    #[test]
    fn node_id_from_slice_checks_width() {
        assert!(NodeId::from_slice(&[1u8; NODE_ID_LEN]).is_ok());
        assert!(matches!(
            NodeId::from_slice(&[1u8; 31]),
            Err(RoutingError::InvalidIdentifier(_))
        ));
        assert!(NodeId::from_slice(&[]).is_err());
    }

    #[test]
    fn distance_to_self_is_zero() {
        let id = NodeId::random();
        assert_eq!(id.distance(&id).as_bytes(), &[0u8; NODE_ID_LEN]);
        assert_eq!(id.common_leading_bits(&id), NODE_ID_LEN * 8);
    }

    #[test]
    fn closer_to_target_uses_xor_order() {
        let target = NodeId::ZERO;
        let near = id_with_prefix(0x01);
        let far = id_with_prefix(0x80);

        assert!(NodeId::closer_to_target(&near, &far, &target));
        assert!(!NodeId::closer_to_target(&far, &near, &target));
        assert!(!NodeId::closer_to_target(&near, &near, &target));
    }

    #[test]
    fn leading_zeros_counts_shared_prefix() {
        let a = id_with_prefix(0b0001_0000);
        assert_eq!(NodeId::ZERO.common_leading_bits(&a), 3);
    }

    #[test]
    fn node_info_bucket_is_derived_from_owner() {
        let owner = NodeId::ZERO;
        let mut info = NodeInfo::new(id_with_prefix(0b0100_0000), NodeId::random());
        info.derive_bucket(&owner);
        assert_eq!(info.bucket_index(), 1);
    }

    #[test]
    fn node_info_validity() {
        assert!(NodeInfo::new(NodeId::random(), NodeId::random()).is_valid());
        assert!(!NodeInfo::new(NodeId::ZERO, NodeId::random()).is_valid());
        assert!(!NodeInfo::new(NodeId::random(), NodeId::ZERO).is_valid());
    }

    #[test]
    fn node_keys_identity_matches_public_key() {
        let keys = NodeKeys::generate();
        assert_eq!(keys.identity(), NodeId::from_public_key(&keys.public_key()));

        let signature = keys.sign(b"payload");
        assert!(keys.public_key().verify(b"payload", &signature).is_ok());
    }

    #[test]
    fn node_id_display_is_base58() {
        let displayed = NodeId::random().to_string();
        assert!(!displayed.contains('0'));
        assert!(!displayed.contains('O'));
        assert!(!displayed.is_empty());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn distance_is_symmetric(
                a in prop::array::uniform32(any::<u8>()),
                b in prop::array::uniform32(any::<u8>()),
            ) {
                let a = NodeId::from_bytes(a);
                let b = NodeId::from_bytes(b);
                prop_assert_eq!(a.distance(&b), b.distance(&a));
            }

            #[test]
            fn closeness_is_a_strict_order(
                a in prop::array::uniform32(any::<u8>()),
                b in prop::array::uniform32(any::<u8>()),
                t in prop::array::uniform32(any::<u8>()),
            ) {
                let (a, b, t) = (NodeId::from_bytes(a), NodeId::from_bytes(b), NodeId::from_bytes(t));
                let both = NodeId::closer_to_target(&a, &b, &t) && NodeId::closer_to_target(&b, &a, &t);
                prop_assert!(!both);
                if a != b {
                    prop_assert!(NodeId::closer_to_target(&a, &b, &t) || NodeId::closer_to_target(&b, &a, &t));
                }
            }
        }
    }
}
