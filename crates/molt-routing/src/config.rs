//! Routing layer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RoutingError, RoutingResult};

/// Parameters consumed by the routing tables, handlers and timer.
///
/// Treated as immutable once a node is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Capacity of the main routing table.
    pub max_routing_table_size: usize,
    /// Size of the close group; also the boundary used for client admission.
    pub closest_nodes_size: usize,
    /// Capacity of the client table.
    pub max_client_routing_table_size: usize,
    /// Hop budget stamped on every outbound message.
    pub hops_to_live: u32,
    /// How long a requester waits for a matching response.
    pub response_timeout: Duration,
    /// How long a handshake may stay pending before it is abandoned.
    pub handshake_timeout: Duration,
    /// Bound on close-group ids learned from acknowledgements and updates.
    pub max_known_close_ids: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_routing_table_size: 64,
            closest_nodes_size: 8,
            max_client_routing_table_size: 64,
            hops_to_live: 50,
            response_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(20),
            max_known_close_ids: 256,
        }
    }
}

impl RoutingConfig {
    /// Create a new builder for routing configuration.
    #[must_use]
    pub fn builder() -> RoutingConfigBuilder {
        RoutingConfigBuilder::default()
    }

    /// Small tables and short deadlines for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_routing_table_size: 8,
            closest_nodes_size: 4,
            max_client_routing_table_size: 8,
            hops_to_live: 10,
            response_timeout: Duration::from_millis(500),
            handshake_timeout: Duration::from_secs(1),
            max_known_close_ids: 32,
        }
    }

    /// Checks the parameters are consistent.
    pub fn validate(&self) -> RoutingResult<()> {
        if self.max_routing_table_size == 0 {
            return Err(RoutingError::Config(
                "max_routing_table_size must be non-zero".to_string(),
            ));
        }
        if self.closest_nodes_size == 0 {
            return Err(RoutingError::Config(
                "closest_nodes_size must be non-zero".to_string(),
            ));
        }
        if self.closest_nodes_size > self.max_routing_table_size {
            return Err(RoutingError::Config(format!(
                "closest_nodes_size ({}) exceeds max_routing_table_size ({})",
                self.closest_nodes_size, self.max_routing_table_size
            )));
        }
        if self.max_client_routing_table_size == 0 {
            return Err(RoutingError::Config(
                "max_client_routing_table_size must be non-zero".to_string(),
            ));
        }
        if self.hops_to_live == 0 {
            return Err(RoutingError::Config("hops_to_live must be non-zero".to_string()));
        }
        if self.response_timeout.is_zero() || self.handshake_timeout.is_zero() {
            return Err(RoutingError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Builder for [`RoutingConfig`].
#[derive(Debug, Default)]
pub struct RoutingConfigBuilder {
    config: RoutingConfig,
}

impl RoutingConfigBuilder {
    /// Set the routing table capacity.
    #[must_use]
    pub const fn max_routing_table_size(mut self, size: usize) -> Self {
        self.config.max_routing_table_size = size;
        self
    }

    /// Set the close group size.
    #[must_use]
    pub const fn closest_nodes_size(mut self, size: usize) -> Self {
        self.config.closest_nodes_size = size;
        self
    }

    /// Set the client table capacity.
    #[must_use]
    pub const fn max_client_routing_table_size(mut self, size: usize) -> Self {
        self.config.max_client_routing_table_size = size;
        self
    }

    /// Set the hop budget.
    #[must_use]
    pub const fn hops_to_live(mut self, hops: u32) -> Self {
        self.config.hops_to_live = hops;
        self
    }

    /// Set the response timeout.
    #[must_use]
    pub const fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> RoutingResult<RoutingConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
