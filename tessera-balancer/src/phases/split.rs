//! Split phase
//!
//! For every chunk whose estimated size is unknown or above the configured
//! maximum, asks the owner shard for split points and then applies the
//! resulting splits.

use crate::action::{Action, ApplySplit, FindSplitPoints};
use crate::catalog::{CatalogClient, CollectionEntry};
use crate::phases::{log_non_retriable, PhaseTag};
use std::collections::BTreeMap;
use tessera_core::{ActionError, CatalogError, ChunkRange, ChunkRecord, ShardId, ShardKey};
use tracing::debug;

/// A shard can return at most this many bytes of split keys in one
/// response; past it the remainder of the range must be scanned again
/// starting from the last returned key.
const MAX_SPLIT_RESPONSE_BYTES: usize = 16 * 1024 * 1024 - 4096;

#[derive(Debug, Default)]
struct PendingActions {
    ranges_to_find_split_points: Vec<ChunkRange>,
    ranges_to_split: Vec<(ChunkRange, Vec<ShardKey>)>,
}

pub(crate) struct SplitPhase {
    coll: CollectionEntry,
    max_chunk_size_bytes: u64,
    pending_by_shard: BTreeMap<ShardId, PendingActions>,
    outstanding_actions: usize,
    aborted: bool,
}

impl SplitPhase {
    pub fn build(coll: CollectionEntry, chunks: Vec<ChunkRecord>, max_chunk_size_bytes: u64) -> Self {
        let mut pending_by_shard: BTreeMap<ShardId, PendingActions> = BTreeMap::new();
        for chunk in chunks {
            let oversized = match chunk.estimated_size_bytes {
                None => true,
                Some(size) => size > max_chunk_size_bytes,
            };
            if oversized {
                pending_by_shard
                    .entry(chunk.shard)
                    .or_default()
                    .ranges_to_find_split_points
                    .push(chunk.range);
            }
        }

        debug!(
            namespace = %coll.namespace,
            shards = pending_by_shard.len(),
            "Built split phase"
        );

        Self {
            coll,
            max_chunk_size_bytes,
            pending_by_shard,
            outstanding_actions: 0,
            aborted: false,
        }
    }

    pub fn next_phase(&self) -> PhaseTag {
        if self.aborted {
            // Terminal abort: rebuilding this phase drains whatever remains.
            PhaseTag::Split
        } else {
            PhaseTag::Finished
        }
    }

    pub fn is_complete(&self) -> bool {
        self.pending_by_shard.is_empty() && self.outstanding_actions == 0
    }

    pub async fn pop_next_streamable_action(
        &mut self,
        catalog: &dyn CatalogClient,
    ) -> Result<Option<Action>, CatalogError> {
        let Some(shard) = self.pending_by_shard.keys().next().cloned() else {
            return Ok(None);
        };
        let version = catalog.get_shard_version(&self.coll, &shard).await?;
        let Some(pending) = self.pending_by_shard.get_mut(&shard) else {
            return Ok(None);
        };

        let action = if let Some((range, split_keys)) = pending.ranges_to_split.pop() {
            Some(Action::ApplySplit(ApplySplit {
                uuid: self.coll.uuid,
                namespace: self.coll.namespace.clone(),
                shard: shard.clone(),
                range,
                split_keys,
                version,
            }))
        } else {
            pending.ranges_to_find_split_points.pop().map(|range| {
                Action::FindSplitPoints(FindSplitPoints {
                    uuid: self.coll.uuid,
                    namespace: self.coll.namespace.clone(),
                    shard: shard.clone(),
                    range,
                    version,
                    max_chunk_size_bytes: self.max_chunk_size_bytes,
                })
            })
        };

        if action.is_some() {
            self.outstanding_actions += 1;
            if pending.ranges_to_find_split_points.is_empty() && pending.ranges_to_split.is_empty()
            {
                self.pending_by_shard.remove(&shard);
            }
        }
        Ok(action)
    }

    pub fn apply_split_vector_result(
        &mut self,
        action: &FindSplitPoints,
        result: &Result<Vec<ShardKey>, ActionError>,
    ) {
        self.outstanding_actions = self.outstanding_actions.saturating_sub(1);
        if self.aborted {
            return;
        }
        match result {
            Ok(split_keys) => {
                if split_keys.is_empty() {
                    return;
                }
                let pending = self.pending_by_shard.entry(action.shard.clone()).or_default();
                pending
                    .ranges_to_split
                    .push((action.range.clone(), split_keys.clone()));
                let response_bytes: usize = split_keys.iter().map(ShardKey::len).sum();
                if response_bytes >= MAX_SPLIT_RESPONSE_BYTES {
                    // The shard stopped early; continue scanning from the
                    // last key it returned.
                    let continuation = split_keys
                        .last()
                        .cloned()
                        .and_then(|last| ChunkRange::new(last, ChunkRange::max(&action.range).clone()).ok());
                    if let Some(range) = continuation {
                        pending.ranges_to_find_split_points.push(range);
                    }
                }
            }
            Err(err) if err.is_retriable() => {
                self.pending_by_shard
                    .entry(action.shard.clone())
                    .or_default()
                    .ranges_to_find_split_points
                    .push(action.range.clone());
            }
            Err(err) => {
                log_non_retriable(&self.coll, PhaseTag::Split, err);
                self.abort();
            }
        }
    }

    pub fn apply_split_result(&mut self, action: &ApplySplit, result: &Result<(), ActionError>) {
        self.outstanding_actions = self.outstanding_actions.saturating_sub(1);
        if self.aborted {
            return;
        }
        match result {
            // The catalog is authoritative for the new chunk boundaries.
            Ok(()) => {}
            Err(err) if err.is_retriable() => {
                self.pending_by_shard
                    .entry(action.shard.clone())
                    .or_default()
                    .ranges_to_split
                    .push((action.range.clone(), action.split_keys.clone()));
            }
            Err(err) => {
                log_non_retriable(&self.coll, PhaseTag::Split, err);
                self.abort();
            }
        }
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.pending_by_shard.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ChunkVersion;
    use uuid::Uuid;

    fn coll() -> CollectionEntry {
        CollectionEntry {
            uuid: Uuid::new_v4(),
            namespace: "app.events".to_string(),
            key_pattern: "{ _id: 1 }".to_string(),
            defragmenting: true,
            persisted_phase: None,
            max_chunk_size_bytes: None,
        }
    }

    fn chunk(min: u64, max: u64, shard: &str, size: Option<u64>) -> ChunkRecord {
        ChunkRecord {
            range: ChunkRange::new(ShardKey::from_u64(min), ShardKey::from_u64(max)).unwrap(),
            shard: ShardId::from(shard),
            estimated_size_bytes: size,
        }
    }

    fn find_action(phase: &SplitPhase, range: &ChunkRange) -> FindSplitPoints {
        FindSplitPoints {
            uuid: phase.coll.uuid,
            namespace: phase.coll.namespace.clone(),
            shard: ShardId::from("a"),
            range: range.clone(),
            version: ChunkVersion::new(1, 0, Uuid::nil(), 1),
            max_chunk_size_bytes: phase.max_chunk_size_bytes,
        }
    }

    #[test]
    fn test_only_oversized_or_unmeasured_chunks_are_selected() {
        let chunks = vec![
            chunk(0, 10, "a", Some(50)),
            chunk(10, 20, "a", Some(150)),
            chunk(20, 30, "b", None),
        ];
        let phase = SplitPhase::build(coll(), chunks, 100);
        assert_eq!(
            phase.pending_by_shard[&ShardId::from("a")]
                .ranges_to_find_split_points
                .len(),
            1
        );
        assert_eq!(
            phase.pending_by_shard[&ShardId::from("b")]
                .ranges_to_find_split_points
                .len(),
            1
        );
        assert!(!phase.is_complete());
    }

    #[test]
    fn test_split_points_become_split_work() {
        let chunks = vec![chunk(0, 30, "a", Some(150))];
        let mut phase = SplitPhase::build(coll(), chunks, 100);
        let range = ChunkRange::new(ShardKey::from_u64(0), ShardKey::from_u64(30)).unwrap();
        phase.pending_by_shard.clear();
        phase.outstanding_actions = 1;

        let keys = vec![ShardKey::from_u64(10), ShardKey::from_u64(20)];
        phase.apply_split_vector_result(&find_action(&phase, &range), &Ok(keys.clone()));
        let pending = &phase.pending_by_shard[&ShardId::from("a")];
        assert_eq!(pending.ranges_to_split, vec![(range, keys)]);
        assert!(pending.ranges_to_find_split_points.is_empty());
    }

    #[test]
    fn test_empty_split_point_response_finishes_the_range() {
        let chunks = vec![chunk(0, 30, "a", Some(150))];
        let mut phase = SplitPhase::build(coll(), chunks, 100);
        let range = ChunkRange::new(ShardKey::from_u64(0), ShardKey::from_u64(30)).unwrap();
        phase.pending_by_shard.clear();
        phase.outstanding_actions = 1;

        phase.apply_split_vector_result(&find_action(&phase, &range), &Ok(Vec::new()));
        assert!(phase.is_complete());
    }

    #[test]
    fn test_truncated_split_point_response_schedules_continuation() {
        let chunks = vec![chunk(0, 30, "a", Some(150))];
        let mut phase = SplitPhase::build(coll(), chunks, 100);
        let range = ChunkRange::new(ShardKey::from_u64(0), ShardKey::from_u64(30)).unwrap();
        phase.pending_by_shard.clear();
        phase.outstanding_actions = 1;

        // One enormous key saturates the response size bound.
        let big_key = ShardKey::new(vec![1u8; MAX_SPLIT_RESPONSE_BYTES]);
        phase.apply_split_vector_result(&find_action(&phase, &range), &Ok(vec![big_key.clone()]));
        let pending = &phase.pending_by_shard[&ShardId::from("a")];
        assert_eq!(pending.ranges_to_split.len(), 1);
        assert_eq!(
            pending.ranges_to_find_split_points,
            vec![ChunkRange::new(big_key, ShardKey::from_u64(30)).unwrap()]
        );
    }

    #[test]
    fn test_retriable_split_failure_requeues_the_work() {
        let chunks = vec![chunk(0, 30, "a", Some(150))];
        let mut phase = SplitPhase::build(coll(), chunks, 100);
        let range = ChunkRange::new(ShardKey::from_u64(0), ShardKey::from_u64(30)).unwrap();
        let keys = vec![ShardKey::from_u64(10)];
        phase.pending_by_shard.clear();
        phase.outstanding_actions = 1;

        let action = ApplySplit {
            uuid: phase.coll.uuid,
            namespace: phase.coll.namespace.clone(),
            shard: ShardId::from("a"),
            range: range.clone(),
            split_keys: keys.clone(),
            version: ChunkVersion::new(1, 0, Uuid::nil(), 1),
        };
        phase.apply_split_result(&action, &Err(ActionError::StaleConfig));
        assert_eq!(
            phase.pending_by_shard[&ShardId::from("a")].ranges_to_split,
            vec![(range, keys)]
        );
    }

    #[test]
    fn test_non_retriable_failure_is_terminal() {
        let chunks = vec![chunk(0, 30, "a", Some(150))];
        let mut phase = SplitPhase::build(coll(), chunks, 100);
        phase.outstanding_actions = 1;
        let range = ChunkRange::new(ShardKey::from_u64(0), ShardKey::from_u64(30)).unwrap();
        phase.apply_split_vector_result(
            &find_action(&phase, &range),
            &Err(ActionError::Failed {
                code: 13,
                message: "unauthorized".to_string(),
            }),
        );
        assert!(phase.aborted);
        assert!(phase.is_complete());
        assert_eq!(phase.next_phase(), PhaseTag::Split);
    }
}
