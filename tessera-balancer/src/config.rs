//! Balancer configuration
//!
//! Knobs are set programmatically by the embedding balancer; there is no
//! CLI and no environment-variable loading.

use serde::{Deserialize, Serialize};

/// Cluster-wide balancer settings served by the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    /// Maximum chunk size in bytes; chunks above this are split. Collections
    /// may carry a per-collection override.
    pub max_chunk_size_bytes: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size_bytes: 128 * 1024 * 1024,
        }
    }
}

/// Policy engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of streaming actions that may be in flight at once.
    pub max_concurrent_streaming_ops: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_streaming_ops: 50,
        }
    }
}
