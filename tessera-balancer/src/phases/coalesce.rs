//! Coalesce-adjacent phase
//!
//! Merges maximal runs of adjacent chunks owned by the same shard and zone,
//! and requests data-size measurements for lone chunks whose size is
//! unknown. Runs are discovered with a single right-to-left scan over the
//! chunk list sorted by range min.

use crate::action::{Action, DataSize, MeasureDataSize, MergeChunks};
use crate::catalog::{CatalogClient, CollectionEntry, PhaseStore};
use crate::phases::{log_non_retriable, PhaseTag};
use std::collections::BTreeMap;
use tessera_core::{ActionError, CatalogError, ChunkRange, ChunkRecord, ShardId, ZoneMap};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PendingActions {
    ranges_to_merge: Vec<ChunkRange>,
    ranges_without_size: Vec<ChunkRange>,
}

pub(crate) struct CoalescePhase {
    coll: CollectionEntry,
    pending_by_shard: BTreeMap<ShardId, PendingActions>,
    outstanding_actions: usize,
    aborted: bool,
}

impl CoalescePhase {
    /// Scan the sorted chunk list and group the work by owner shard.
    pub fn build(coll: CollectionEntry, chunks: Vec<ChunkRecord>, zones: ZoneMap) -> Self {
        let consecutive = |a: &ChunkRecord, b: &ChunkRecord| {
            a.shard == b.shard
                && zones.zone_for(&a.range) == zones.zone_for(&b.range)
                && a.range.is_adjacent_to(&b.range)
        };

        let mut pending_by_shard: BTreeMap<ShardId, PendingActions> = BTreeMap::new();
        let mut idx = chunks.len();
        while idx > 0 {
            let upper = idx - 1;
            let mut lower = upper;
            while lower > 0 && consecutive(&chunks[lower - 1], &chunks[lower]) {
                lower -= 1;
            }
            let entry = pending_by_shard
                .entry(chunks[upper].shard.clone())
                .or_default();
            if lower != upper {
                entry
                    .ranges_to_merge
                    .push(ChunkRange::spanning(&chunks[lower].range, &chunks[upper].range));
            } else if chunks[upper].estimated_size_bytes.is_none() {
                entry.ranges_without_size.push(chunks[upper].range.clone());
            }
            idx = lower;
        }
        pending_by_shard.retain(|_, p| {
            !p.ranges_to_merge.is_empty() || !p.ranges_without_size.is_empty()
        });

        debug!(
            namespace = %coll.namespace,
            shards = pending_by_shard.len(),
            "Built coalesce phase"
        );

        Self {
            coll,
            pending_by_shard,
            outstanding_actions: 0,
            aborted: false,
        }
    }

    pub fn next_phase(&self) -> PhaseTag {
        // An abort only drains this phase; the pipeline is not bypassed.
        PhaseTag::MoveAndMerge
    }

    pub fn is_complete(&self) -> bool {
        self.pending_by_shard.is_empty() && self.outstanding_actions == 0
    }

    pub async fn pop_next_streamable_action(
        &mut self,
        catalog: &dyn CatalogClient,
    ) -> Result<Option<Action>, CatalogError> {
        // TODO (fairness): always serving the first shard entry starves the
        // others when the first shard keeps producing work.
        let Some(shard) = self.pending_by_shard.keys().next().cloned() else {
            return Ok(None);
        };
        let version = catalog.get_shard_version(&self.coll, &shard).await?;
        let Some(pending) = self.pending_by_shard.get_mut(&shard) else {
            return Ok(None);
        };

        let action = if pending.ranges_without_size.len() > pending.ranges_to_merge.len() {
            pending.ranges_without_size.pop().map(|range| {
                Action::MeasureDataSize(MeasureDataSize {
                    uuid: self.coll.uuid,
                    namespace: self.coll.namespace.clone(),
                    shard: shard.clone(),
                    range,
                    version,
                })
            })
        } else {
            pending.ranges_to_merge.pop().map(|range| {
                Action::MergeChunks(MergeChunks {
                    uuid: self.coll.uuid,
                    namespace: self.coll.namespace.clone(),
                    shard: shard.clone(),
                    range,
                    version,
                })
            })
        };

        if action.is_some() {
            self.outstanding_actions += 1;
            if pending.ranges_to_merge.is_empty() && pending.ranges_without_size.is_empty() {
                self.pending_by_shard.remove(&shard);
            }
        }
        Ok(action)
    }

    pub fn apply_merge_result(&mut self, action: &MergeChunks, result: &Result<(), ActionError>) {
        self.outstanding_actions = self.outstanding_actions.saturating_sub(1);
        if self.aborted {
            return;
        }
        match result {
            Ok(()) => {
                // The merged chunk has unknown size until remeasured.
                self.pending_by_shard
                    .entry(action.shard.clone())
                    .or_default()
                    .ranges_without_size
                    .push(action.range.clone());
            }
            Err(err) if err.is_retriable() => {
                self.pending_by_shard
                    .entry(action.shard.clone())
                    .or_default()
                    .ranges_to_merge
                    .push(action.range.clone());
            }
            Err(err) => {
                log_non_retriable(&self.coll, PhaseTag::Coalesce, err);
                self.abort();
            }
        }
    }

    pub async fn apply_data_size_result(
        &mut self,
        store: &dyn PhaseStore,
        action: &MeasureDataSize,
        result: &Result<DataSize, ActionError>,
    ) {
        self.outstanding_actions = self.outstanding_actions.saturating_sub(1);
        if self.aborted {
            return;
        }
        match result {
            Ok(data_size) => {
                if let Err(err) = store
                    .persist_chunk_size_estimate(
                        self.coll.uuid,
                        &action.range,
                        &action.shard,
                        data_size.size_bytes,
                    )
                    .await
                {
                    warn!(
                        uuid = %self.coll.uuid,
                        range = %action.range,
                        error = %err,
                        "Failed to persist measured chunk size, scheduling remeasurement"
                    );
                    self.pending_by_shard
                        .entry(action.shard.clone())
                        .or_default()
                        .ranges_without_size
                        .push(action.range.clone());
                }
            }
            Err(err) if err.is_retriable() => {
                self.pending_by_shard
                    .entry(action.shard.clone())
                    .or_default()
                    .ranges_without_size
                    .push(action.range.clone());
            }
            Err(err) => {
                log_non_retriable(&self.coll, PhaseTag::Coalesce, err);
                self.abort();
            }
        }
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.pending_by_shard.clear();
    }
}
