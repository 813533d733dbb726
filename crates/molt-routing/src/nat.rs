//! NAT classification and endpoint pairs.
//!
//! Every node advertises two endpoints: the local (private) address it is bound
//! to and the external (public) address its NAT maps it to. Either may be
//! unspecified; a pair with both unspecified cannot be connected to.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// NAT classification a node reports in its contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NatType {
    /// No NAT - public IP.
    None,
    /// Full cone NAT (endpoint independent mapping).
    FullCone,
    /// Restricted cone NAT (address restricted).
    RestrictedCone,
    /// Port restricted cone NAT.
    PortRestrictedCone,
    /// Symmetric NAT (different mapping per destination).
    Symmetric,
    /// Unknown NAT type.
    #[default]
    Unknown,
}

impl NatType {
    /// Returns true if a peer can reach a node behind this NAT by punching
    /// through it. Two nodes that both fail this cannot pair endpoints.
    #[must_use]
    pub const fn supports_direct_connection(&self) -> bool {
        matches!(
            self,
            Self::None | Self::FullCone | Self::RestrictedCone | Self::PortRestrictedCone
        )
    }

    /// Returns true if endpoints can be paired between the two NAT types.
    #[must_use]
    pub const fn can_pair_with(&self, other: Self) -> bool {
        self.supports_direct_connection() || other.supports_direct_connection()
    }
}

impl std::fmt::Display for NatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "No NAT",
            Self::FullCone => "Full Cone",
            Self::RestrictedCone => "Restricted Cone",
            Self::PortRestrictedCone => "Port Restricted Cone",
            Self::Symmetric => "Symmetric",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// The unspecified socket address (`0.0.0.0:0`).
pub const UNSPECIFIED_ENDPOINT: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

/// Local and external endpoint of one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointPair {
    /// Address the node is bound to.
    pub local: SocketAddr,
    /// Address as seen from outside the node's NAT.
    pub external: SocketAddr,
}

impl EndpointPair {
    /// Creates a new pair.
    #[must_use]
    pub const fn new(local: SocketAddr, external: SocketAddr) -> Self {
        Self { local, external }
    }

    /// A pair with both endpoints unspecified.
    #[must_use]
    pub const fn unspecified() -> Self {
        Self {
            local: UNSPECIFIED_ENDPOINT,
            external: UNSPECIFIED_ENDPOINT,
        }
    }

    /// Returns true if neither endpoint carries an address.
    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        self.local.ip().is_unspecified() && self.external.ip().is_unspecified()
    }

    /// Returns true if at least one endpoint carries an address.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.is_unspecified()
    }
}

impl Default for EndpointPair {
    fn default() -> Self {
        Self::unspecified()
    }
}
