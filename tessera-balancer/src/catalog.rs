//! Catalog, cluster-statistics and persistence seams
//!
//! The engine never talks to the cluster directly; the embedding balancer
//! supplies implementations of these traits. All write failures surface as
//! typed errors carrying a code and a message.

use crate::config::BalancerConfig;
use crate::phases::PhaseTag;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tessera_core::{CatalogError, ChunkRange, ChunkRecord, ChunkVersion, ShardId, ZoneMap};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, CatalogError>;

/// The catalog's view of a sharded collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub uuid: Uuid,
    pub namespace: String,
    /// Shard key pattern, kept opaque to the engine.
    pub key_pattern: String,
    /// Whether the collection is currently enrolled for defragmentation.
    pub defragmenting: bool,
    /// Phase marker persisted by a previous run, if any.
    pub persisted_phase: Option<PhaseTag>,
    /// Per-collection override of the cluster-wide maximum chunk size.
    pub max_chunk_size_bytes: Option<u64>,
}

/// Per-shard capacity statistics for one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStatistics {
    pub shard: ShardId,
    pub current_size_bytes: u64,
    /// Zero means unlimited.
    pub max_size_bytes: u64,
    pub draining: bool,
}

impl ShardStatistics {
    /// Whether the shard may receive additional chunks.
    pub fn can_receive_chunks(&self) -> bool {
        if self.draining {
            return false;
        }
        self.max_size_bytes == 0 || self.current_size_bytes < self.max_size_bytes
    }
}

/// Read access to the cluster catalog.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Look up a collection by UUID.
    async fn get_collection(&self, uuid: Uuid) -> Result<CollectionEntry>;

    /// The collection's chunks, sorted by ascending range min.
    async fn get_chunks_sorted(&self, coll: &CollectionEntry) -> Result<Vec<ChunkRecord>>;

    /// The highest chunk version currently placed on `shard` for the
    /// collection. Fails with [`CatalogError::ShardVersionUnavailable`] when
    /// the shard owns no chunks.
    async fn get_shard_version(
        &self,
        coll: &CollectionEntry,
        shard: &ShardId,
    ) -> Result<ChunkVersion>;

    /// The zone map derived from the catalog tag table.
    async fn get_zones(&self, coll: &CollectionEntry) -> Result<ZoneMap>;

    /// Current cluster-wide balancer settings.
    async fn get_balancer_configuration(&self) -> Result<BalancerConfig>;
}

/// Per-collection shard statistics.
#[async_trait]
pub trait ClusterStatsSource: Send + Sync {
    async fn shard_stats(&self, coll: &CollectionEntry) -> Result<Vec<ShardStatistics>>;
}

/// Persistence of phase markers and chunk size estimates.
#[async_trait]
pub trait PhaseStore: Send + Sync {
    /// Record the collection's current defragmentation phase.
    async fn persist_phase(&self, uuid: Uuid, phase: PhaseTag) -> Result<()>;

    /// Unset both the phase marker and the defragmentation flag.
    async fn clear_defragmentation_markers(&self, uuid: Uuid) -> Result<()>;

    /// Record a measured chunk size; the write must be applied with majority
    /// write concern.
    async fn persist_chunk_size_estimate(
        &self,
        uuid: Uuid,
        range: &ChunkRange,
        shard: &ShardId,
        size_bytes: u64,
    ) -> Result<()>;

    /// Remove the estimated size from every chunk of the collection.
    async fn clear_chunk_size_estimates(&self, uuid: Uuid) -> Result<()>;
}
