//! Tessera Balancer Library
//!
//! This crate provides the chunk defragmentation policy engine for Tessera.
//!
//! A sharded collection's key space is partitioned into contiguous chunks,
//! each owned by one shard. Over time chunks become numerous and small,
//! degrading routing and rebalancing. The engine drives each enrolled
//! collection through a fixed pipeline of maintenance phases:
//! - Coalesce adjacent chunks owned by the same shard and zone
//! - Move-and-merge small chunks into a sibling's shard
//! - Split chunks that have grown past the configured maximum
//!
//! Phases produce actions that an external executor carries out against the
//! cluster; results are acknowledged back into the engine, which advances
//! phases as they complete.

pub mod action;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod phases;

mod chunk_list;

// Re-export main types
pub use action::{
    Action, ApplySplit, DataSize, FindSplitPoints, MeasureDataSize, MergeChunks, MigrateChunk,
};
pub use catalog::{
    CatalogClient, ClusterStatsSource, CollectionEntry, PhaseStore, ShardStatistics,
};
pub use config::{BalancerConfig, EngineConfig};
pub use engine::{PolicyEngine, PolicyError};
pub use phases::PhaseTag;
