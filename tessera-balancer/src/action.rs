//! Defragmentation actions and executor results
//!
//! Actions are units of work handed to the external executor; every variant
//! carries the owner shard's chunk version so the executor can detect stale
//! routing information.

use serde::{Deserialize, Serialize};
use tessera_core::{ChunkRange, ChunkVersion, ShardId, ShardKey};
use uuid::Uuid;

/// Merge every chunk inside `range` into a single chunk on `shard`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeChunks {
    pub uuid: Uuid,
    pub namespace: String,
    pub shard: ShardId,
    pub range: ChunkRange,
    pub version: ChunkVersion,
}

/// Ask `shard` to measure the data size of `range`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureDataSize {
    pub uuid: Uuid,
    pub namespace: String,
    pub shard: ShardId,
    pub range: ChunkRange,
    pub version: ChunkVersion,
}

/// Ask `shard` for split points partitioning `range` into pieces of at most
/// `max_chunk_size_bytes`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindSplitPoints {
    pub uuid: Uuid,
    pub namespace: String,
    pub shard: ShardId,
    pub range: ChunkRange,
    pub version: ChunkVersion,
    pub max_chunk_size_bytes: u64,
}

/// Split the chunk covering `range` at `split_keys`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplySplit {
    pub uuid: Uuid,
    pub namespace: String,
    pub shard: ShardId,
    pub range: ChunkRange,
    pub split_keys: Vec<ShardKey>,
    pub version: ChunkVersion,
}

/// Migrate the chunk covering `range` from `source` to `dest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateChunk {
    pub uuid: Uuid,
    pub namespace: String,
    pub source: ShardId,
    pub dest: ShardId,
    pub range: ChunkRange,
    pub version: ChunkVersion,
}

/// A unit of work for the external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    MergeChunks(MergeChunks),
    MeasureDataSize(MeasureDataSize),
    FindSplitPoints(FindSplitPoints),
    ApplySplit(ApplySplit),
    MigrateChunk(MigrateChunk),
    /// The stream has been closed and no further work will be produced.
    EndOfStream,
}

/// Payload of a successful data-size measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSize {
    pub size_bytes: u64,
}
