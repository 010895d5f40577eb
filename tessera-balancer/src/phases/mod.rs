//! Defragmentation phases
//!
//! Each enrolled collection is driven through a fixed pipeline:
//! coalesce adjacent chunks, move-and-merge small chunks, split oversized
//! chunks. A phase is a state machine that produces actions until complete,
//! then yields to the next phase.

pub(crate) mod coalesce;
pub(crate) mod move_merge;
pub(crate) mod split;

use crate::action::{
    Action, ApplySplit, DataSize, FindSplitPoints, MeasureDataSize, MergeChunks, MigrateChunk,
};
use crate::catalog::{CatalogClient, CollectionEntry, PhaseStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tessera_core::{ActionError, CatalogError, ShardId, ShardKey};
use tracing::{error, warn};

pub(crate) use coalesce::CoalescePhase;
pub(crate) use move_merge::MoveAndMergePhase;
pub(crate) use split::SplitPhase;

/// Identifier of a pipeline stage, persisted per collection as a tag string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhaseTag {
    #[serde(rename = "mergeChunks")]
    Coalesce,
    #[serde(rename = "moveAndMergeChunks")]
    MoveAndMerge,
    #[serde(rename = "splitChunks")]
    Split,
    /// Terminal stage; never persisted (represented by unsetting the
    /// markers).
    #[serde(rename = "finished")]
    Finished,
}

impl PhaseTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseTag::Coalesce => "mergeChunks",
            PhaseTag::MoveAndMerge => "moveAndMergeChunks",
            PhaseTag::Split => "splitChunks",
            PhaseTag::Finished => "finished",
        }
    }
}

impl fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mergeChunks" => Ok(PhaseTag::Coalesce),
            "moveAndMergeChunks" => Ok(PhaseTag::MoveAndMerge),
            "splitChunks" => Ok(PhaseTag::Split),
            "finished" => Ok(PhaseTag::Finished),
            other => Err(format!("unknown defragmentation phase tag: {other}")),
        }
    }
}

/// A chunk is small when its estimated size is at most 25% of the maximum
/// chunk size. Integer arithmetic, percent first.
pub(crate) fn small_chunk_threshold(max_chunk_size_bytes: u64) -> u64 {
    (max_chunk_size_bytes / 100) * 25
}

pub(crate) fn log_non_retriable(coll: &CollectionEntry, phase: PhaseTag, err: &ActionError) {
    error!(
        namespace = %coll.namespace,
        uuid = %coll.uuid,
        phase = %phase,
        error = %err,
        "Defragmentation for collection hit non-retriable error"
    );
}

/// The active phase of one enrolled collection.
pub(crate) enum Phase {
    Coalesce(CoalescePhase),
    MoveAndMerge(MoveAndMergePhase),
    Split(SplitPhase),
    Finished,
}

impl Phase {
    pub fn tag(&self) -> PhaseTag {
        match self {
            Phase::Coalesce(_) => PhaseTag::Coalesce,
            Phase::MoveAndMerge(_) => PhaseTag::MoveAndMerge,
            Phase::Split(_) => PhaseTag::Split,
            Phase::Finished => PhaseTag::Finished,
        }
    }

    pub fn next_phase(&self) -> PhaseTag {
        match self {
            Phase::Coalesce(p) => p.next_phase(),
            Phase::MoveAndMerge(p) => p.next_phase(),
            Phase::Split(p) => p.next_phase(),
            Phase::Finished => PhaseTag::Finished,
        }
    }

    /// Whether the phase has no pending and no outstanding work left. The
    /// terminal phase never reports complete; it is detected via
    /// [`Phase::is_finished`].
    pub fn is_complete(&self) -> bool {
        match self {
            Phase::Coalesce(p) => p.is_complete(),
            Phase::MoveAndMerge(p) => p.is_complete(),
            Phase::Split(p) => p.is_complete(),
            Phase::Finished => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Phase::Finished)
    }

    pub async fn pop_next_streamable_action(
        &mut self,
        catalog: &dyn CatalogClient,
    ) -> Result<Option<Action>, CatalogError> {
        match self {
            Phase::Coalesce(p) => p.pop_next_streamable_action(catalog).await,
            Phase::MoveAndMerge(p) => p.pop_next_streamable_action(catalog).await,
            Phase::Split(p) => p.pop_next_streamable_action(catalog).await,
            Phase::Finished => Ok(None),
        }
    }

    pub async fn pop_next_migration(
        &mut self,
        catalog: &dyn CatalogClient,
        used_shards: &mut HashSet<ShardId>,
    ) -> Result<Option<MigrateChunk>, CatalogError> {
        match self {
            Phase::MoveAndMerge(p) => p.pop_next_migration(catalog, used_shards).await,
            _ => Ok(None),
        }
    }

    pub fn apply_merge_result(&mut self, action: &MergeChunks, result: &Result<(), ActionError>) {
        match self {
            Phase::Coalesce(p) => p.apply_merge_result(action, result),
            Phase::MoveAndMerge(p) => p.apply_merge_result(action, result),
            _ => unexpected_result(action.uuid, self.tag(), "merge"),
        }
    }

    pub async fn apply_data_size_result(
        &mut self,
        store: &dyn PhaseStore,
        action: &MeasureDataSize,
        result: &Result<DataSize, ActionError>,
    ) {
        match self {
            Phase::Coalesce(p) => p.apply_data_size_result(store, action, result).await,
            _ => unexpected_result(action.uuid, self.tag(), "data-size"),
        }
    }

    pub fn apply_split_vector_result(
        &mut self,
        action: &FindSplitPoints,
        result: &Result<Vec<ShardKey>, ActionError>,
    ) {
        match self {
            Phase::Split(p) => p.apply_split_vector_result(action, result),
            _ => unexpected_result(action.uuid, self.tag(), "split-vector"),
        }
    }

    pub fn apply_split_result(&mut self, action: &ApplySplit, result: &Result<(), ActionError>) {
        match self {
            Phase::Split(p) => p.apply_split_result(action, result),
            _ => unexpected_result(action.uuid, self.tag(), "split"),
        }
    }

    pub fn apply_move_result(&mut self, action: &MigrateChunk, result: &Result<(), ActionError>) {
        match self {
            Phase::MoveAndMerge(p) => p.apply_move_result(action, result),
            _ => unexpected_result(action.uuid, self.tag(), "migration"),
        }
    }
}

fn unexpected_result(uuid: uuid::Uuid, phase: PhaseTag, kind: &str) {
    warn!(
        uuid = %uuid,
        phase = %phase,
        kind,
        "Dropping action result the current phase does not expect"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_uses_integer_percent_arithmetic() {
        assert_eq!(small_chunk_threshold(100), 25);
        // 103 / 100 * 25 = 25, not 25.75 rounded
        assert_eq!(small_chunk_threshold(103), 25);
        assert_eq!(small_chunk_threshold(99), 0);
    }

    #[test]
    fn test_phase_tag_round_trip() {
        for tag in [
            PhaseTag::Coalesce,
            PhaseTag::MoveAndMerge,
            PhaseTag::Split,
            PhaseTag::Finished,
        ] {
            assert_eq!(tag.as_str().parse::<PhaseTag>(), Ok(tag));
        }
        assert!("mergechunks".parse::<PhaseTag>().is_err());
    }
}
