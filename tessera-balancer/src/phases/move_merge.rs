//! Move-and-merge phase
//!
//! Identifies small chunks (at most 25% of the maximum chunk size), migrates
//! each one onto a sibling's shard and merges the pair. Every pairing is a
//! two-step sequence: the merge for a pair is only emitted after its
//! migration has been acknowledged successfully.

use crate::action::{Action, MergeChunks, MigrateChunk};
use crate::catalog::{CatalogClient, CollectionEntry, ShardStatistics};
use crate::chunk_list::{ChunkList, ChunkRef, ChunkState};
use crate::phases::{log_non_retriable, small_chunk_threshold, PhaseTag};
use std::collections::{HashMap, HashSet, VecDeque};
use tessera_core::{ActionError, CatalogError, ChunkRange, ChunkRecord, ShardId, ZoneMap};
use tracing::{debug, warn};

// Ranking of a candidate pairing, higher is better. Bit weights so that a
// pairing that avoids a migration always beats one that merely picks the
// cheaper move direction.
const NO_MOVE_REQUIRED: u32 = 1 << 4;
const CONVENIENT_MOVE: u32 = 1 << 3;
const MERGE_SOLVES_TWO_PENDING_CHUNKS: u32 = 1 << 2;
const MERGE_SOLVES_ONE_PENDING_CHUNK: u32 = 1 << 1;

/// An active move&merge sequence: migrate `chunk_to_move` onto the sibling's
/// shard, then merge the two into one chunk. Both chunks stay busy for the
/// whole sequence, so their ranges cannot change underneath the request.
struct MoveAndMergeRequest {
    chunk_to_move: ChunkRef,
    chunk_to_merge_with: ChunkRef,
}

impl MoveAndMergeRequest {
    fn new(chunk_to_move: ChunkRef, chunk_to_merge_with: ChunkRef) -> Self {
        Self {
            chunk_to_move,
            chunk_to_merge_with,
        }
    }

    fn merged_range(&self, chunks: &ChunkList) -> ChunkRange {
        ChunkRange::spanning(
            &chunks.get(self.chunk_to_move).range,
            &chunks.get(self.chunk_to_merge_with).range,
        )
    }
}

pub(crate) struct MoveAndMergePhase {
    coll: CollectionEntry,
    chunks: ChunkList,
    /// Small, non-busy chunks eligible to be moved, per owner shard, sorted
    /// by ascending estimated size.
    small_by_shard: HashMap<ShardId, Vec<ChunkRef>>,
    shard_infos: HashMap<ShardId, ShardStatistics>,
    /// Shards ordered by descending current data size.
    shard_order: Vec<ShardId>,
    outstanding_migrations: Vec<MoveAndMergeRequest>,
    actionable_merges: VecDeque<MoveAndMergeRequest>,
    outstanding_merges: Vec<MoveAndMergeRequest>,
    zones: ZoneMap,
    small_threshold: u64,
    aborted: bool,
    next_phase: PhaseTag,
}

impl MoveAndMergePhase {
    pub fn build(
        coll: CollectionEntry,
        chunks: Vec<ChunkRecord>,
        shard_stats: Vec<ShardStatistics>,
        zones: ZoneMap,
        max_chunk_size_bytes: u64,
    ) -> Self {
        let mut phase = Self {
            coll,
            chunks: ChunkList::from_sorted(Vec::new()),
            small_by_shard: HashMap::new(),
            shard_infos: shard_stats
                .into_iter()
                .map(|s| (s.shard.clone(), s))
                .collect(),
            shard_order: Vec::new(),
            outstanding_migrations: Vec::new(),
            actionable_merges: VecDeque::new(),
            outstanding_merges: Vec::new(),
            zones,
            small_threshold: small_chunk_threshold(max_chunk_size_bytes),
            aborted: false,
            next_phase: PhaseTag::Split,
        };

        let mut states = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let Some(size) = chunk.estimated_size_bytes else {
                warn!(
                    namespace = %phase.coll.namespace,
                    range = %chunk.range,
                    "Chunk with no estimated size detected while building move-and-merge phase"
                );
                phase.abort(PhaseTag::Coalesce);
                return phase;
            };
            states.push(ChunkState {
                range: chunk.range,
                shard: chunk.shard,
                estimated_size_bytes: size,
                busy: false,
            });
        }
        phase.chunks = ChunkList::from_sorted(states);

        {
            let Self {
                chunks,
                small_by_shard,
                small_threshold,
                ..
            } = &mut phase;
            for r in chunks.refs() {
                let state = chunks.get(r);
                if state.estimated_size_bytes <= *small_threshold {
                    small_by_shard.entry(state.shard.clone()).or_default().push(r);
                }
            }
        }
        let shards: Vec<ShardId> = phase.small_by_shard.keys().cloned().collect();
        for shard in shards {
            phase.resort_small_index(&shard);
        }

        phase.shard_order = phase.shard_infos.keys().cloned().collect();
        phase.resort_shard_order();

        debug!(
            namespace = %phase.coll.namespace,
            chunks = phase.chunks.len(),
            small_shards = phase.small_by_shard.len(),
            threshold = phase.small_threshold,
            "Built move-and-merge phase"
        );
        phase
    }

    pub fn next_phase(&self) -> PhaseTag {
        self.next_phase
    }

    pub fn is_complete(&self) -> bool {
        self.small_by_shard.is_empty()
            && self.outstanding_migrations.is_empty()
            && self.actionable_merges.is_empty()
            && self.outstanding_merges.is_empty()
    }

    /// Emit the merge for the oldest successfully migrated pair, if any.
    pub async fn pop_next_streamable_action(
        &mut self,
        catalog: &dyn CatalogClient,
    ) -> Result<Option<Action>, CatalogError> {
        let Some(request) = self.actionable_merges.front() else {
            return Ok(None);
        };
        let dest = self.chunks.get(request.chunk_to_merge_with).shard.clone();
        let range = request.merged_range(&self.chunks);
        let version = catalog.get_shard_version(&self.coll, &dest).await?;
        if let Some(request) = self.actionable_merges.pop_front() {
            self.outstanding_merges.push(request);
        }
        Ok(Some(Action::MergeChunks(MergeChunks {
            uuid: self.coll.uuid,
            namespace: self.coll.namespace.clone(),
            shard: dest,
            range,
            version,
        })))
    }

    /// Find the next small chunk that can be moved and merged with one of
    /// its siblings, preferring the most loaded shards.
    pub async fn pop_next_migration(
        &mut self,
        catalog: &dyn CatalogClient,
        used_shards: &mut HashSet<ShardId>,
    ) -> Result<Option<MigrateChunk>, CatalogError> {
        for i in 0..self.shard_order.len() {
            let shard = self.shard_order[i].clone();
            if used_shards.contains(&shard) {
                // The shard is already committed to a migration this round.
                continue;
            }
            let Some((candidate, siblings)) = self.find_workable_chunk(&shard, used_shards) else {
                continue;
            };

            let target = self.pick_target_sibling(candidate, &siblings);
            let source_shard = self.chunks.get(candidate).shard.clone();
            let dest_shard = self.chunks.get(target).shard.clone();
            let version = catalog.get_shard_version(&self.coll, &source_shard).await?;

            self.chunks.get_mut(candidate).busy = true;
            self.chunks.get_mut(target).busy = true;
            used_shards.insert(source_shard.clone());
            used_shards.insert(dest_shard.clone());

            let request = MoveAndMergeRequest::new(candidate, target);
            let migration = MigrateChunk {
                uuid: self.coll.uuid,
                namespace: self.coll.namespace.clone(),
                source: source_shard,
                dest: dest_shard,
                range: self.chunks.get(candidate).range.clone(),
                version,
            };
            self.outstanding_migrations.push(request);
            return Ok(Some(migration));
        }
        Ok(None)
    }

    pub fn apply_move_result(&mut self, action: &MigrateChunk, result: &Result<(), ActionError>) {
        let Some(pos) = self.outstanding_migrations.iter().position(|r| {
            ChunkRange::min(&self.chunks.get(r.chunk_to_move).range) == ChunkRange::min(&action.range)
        }) else {
            warn!(
                uuid = %self.coll.uuid,
                range = %action.range,
                "Migration acknowledgment does not match any outstanding request"
            );
            return;
        };
        let request = self.outstanding_migrations.remove(pos);
        if self.aborted {
            return;
        }
        match result {
            Ok(()) => {
                let moved = self.chunks.get(request.chunk_to_move).estimated_size_bytes;
                let source = self.chunks.get(request.chunk_to_move).shard.clone();
                let dest = self.chunks.get(request.chunk_to_merge_with).shard.clone();
                if let Some(info) = self.shard_infos.get_mut(&source) {
                    info.current_size_bytes = info.current_size_bytes.saturating_sub(moved);
                }
                if let Some(info) = self.shard_infos.get_mut(&dest) {
                    info.current_size_bytes += moved;
                }
                self.resort_shard_order();
                self.actionable_merges.push_back(request);
            }
            Err(err) if err.is_retriable() => {
                // Release the pair; the next migration scan will rediscover
                // the chunk.
                self.chunks.get_mut(request.chunk_to_move).busy = false;
                self.chunks.get_mut(request.chunk_to_merge_with).busy = false;
            }
            Err(err) => {
                log_non_retriable(&self.coll, PhaseTag::MoveAndMerge, err);
                self.abort(PhaseTag::Coalesce);
            }
        }
    }

    pub fn apply_merge_result(&mut self, action: &MergeChunks, result: &Result<(), ActionError>) {
        let Some(pos) = self.outstanding_merges.iter().position(|r| {
            action
                .range
                .contains_key(ChunkRange::min(&self.chunks.get(r.chunk_to_move).range))
        }) else {
            warn!(
                uuid = %self.coll.uuid,
                range = %action.range,
                "Merge acknowledgment does not match any outstanding request"
            );
            return;
        };
        let request = self.outstanding_merges.remove(pos);
        if self.aborted {
            return;
        }
        match result {
            Ok(()) => self.complete_merge(request),
            Err(err) if err.is_retriable() => {
                self.actionable_merges.push_back(request);
            }
            Err(err) => {
                log_non_retriable(&self.coll, PhaseTag::MoveAndMerge, err);
                self.abort(PhaseTag::Coalesce);
            }
        }
    }

    /// The pair is now one chunk on the sibling's shard; fold the moved
    /// chunk into the sibling and drop it from the routing table and the
    /// small-chunk index.
    fn complete_merge(&mut self, request: MoveAndMergeRequest) {
        let merged_range = request.merged_range(&self.chunks);
        let moved_size = self.chunks.get(request.chunk_to_move).estimated_size_bytes;
        let deleted_shard = self.chunks.get(request.chunk_to_move).shard.clone();

        {
            let merged = self.chunks.get_mut(request.chunk_to_merge_with);
            merged.range = merged_range;
            merged.estimated_size_bytes += moved_size;
            merged.busy = false;
        }
        self.chunks.remove(request.chunk_to_move);
        self.remove_from_small_index(request.chunk_to_move, &deleted_shard);

        let merged_shard = self.chunks.get(request.chunk_to_merge_with).shard.clone();
        if self.chunks.get(request.chunk_to_merge_with).estimated_size_bytes
            > self.small_threshold
        {
            self.remove_from_small_index(request.chunk_to_merge_with, &merged_shard);
        } else {
            self.resort_small_index(&merged_shard);
        }
    }

    fn abort(&mut self, next: PhaseTag) {
        self.aborted = true;
        self.next_phase = next;
        self.actionable_merges.clear();
        self.small_by_shard.clear();
        self.shard_order.clear();
    }

    /// Siblings eligible to absorb `chunk` based on zones and capacity; busy
    /// state is not considered here.
    fn mergeable_siblings(&self, chunk: ChunkRef) -> Vec<ChunkRef> {
        let mut siblings = Vec::new();
        if let Some(right) = self.chunks.next(chunk) {
            if self.can_move_and_merge(chunk, right) {
                siblings.push(right);
            }
        }
        if let Some(left) = self.chunks.prev(chunk) {
            if self.can_move_and_merge(chunk, left) {
                siblings.push(left);
            }
        }
        siblings
    }

    fn can_move_and_merge(&self, chunk: ChunkRef, sibling: ChunkRef) -> bool {
        let c = self.chunks.get(chunk);
        let s = self.chunks.get(sibling);
        let same_zone = self.zones.zone_for(&c.range) == self.zones.zone_for(&s.range);
        let destination_available = c.shard == s.shard
            || self
                .shard_infos
                .get(&s.shard)
                .map(|info| info.can_receive_chunks())
                .unwrap_or(false);
        same_zone && destination_available
    }

    /// Walk the shard's small-chunk index for a non-busy chunk with at least
    /// one sibling that is neither busy nor on a shard committed this round.
    /// Chunks with no mergeable sibling at all are evicted from the index,
    /// and an emptied shard entry is dropped.
    fn find_workable_chunk(
        &mut self,
        shard: &ShardId,
        used_shards: &HashSet<ShardId>,
    ) -> Option<(ChunkRef, Vec<ChunkRef>)> {
        let mut small = self.small_by_shard.remove(shard)?;
        let mut found = None;
        let mut i = 0;
        while i < small.len() {
            let candidate = small[i];
            if self.chunks.get(candidate).busy {
                i += 1;
                continue;
            }
            let siblings = self.mergeable_siblings(candidate);
            if siblings.is_empty() {
                small.remove(i);
                continue;
            }
            let eligible: Vec<ChunkRef> = siblings
                .into_iter()
                .filter(|s| {
                    !self.chunks.get(*s).busy && !used_shards.contains(&self.chunks.get(*s).shard)
                })
                .collect();
            if !eligible.is_empty() {
                found = Some((candidate, eligible));
                break;
            }
            i += 1;
        }
        if !small.is_empty() {
            self.small_by_shard.insert(shard.clone(), small);
        }
        found
    }

    fn pick_target_sibling(&self, candidate: ChunkRef, siblings: &[ChunkRef]) -> ChunkRef {
        let mut target = siblings[0];
        if let Some(&challenger) = siblings.get(1) {
            let target_score = self.rank_mergeable_sibling(candidate, target);
            let challenger_score = self.rank_mergeable_sibling(candidate, challenger);
            if challenger_score > target_score
                || (challenger_score == target_score
                    && self.shard_size(&self.chunks.get(challenger).shard)
                        < self.shard_size(&self.chunks.get(target).shard))
            {
                target = challenger;
            }
        }
        target
    }

    fn rank_mergeable_sibling(&self, candidate: ChunkRef, sibling: ChunkRef) -> u32 {
        let c = self.chunks.get(candidate);
        let s = self.chunks.get(sibling);
        let mut ranking = 0;
        if c.shard == s.shard {
            ranking += NO_MOVE_REQUIRED;
        } else if c.estimated_size_bytes < s.estimated_size_bytes {
            ranking += CONVENIENT_MOVE;
        }
        let merged_size = c.estimated_size_bytes + s.estimated_size_bytes;
        if merged_size > self.small_threshold {
            ranking += if s.estimated_size_bytes < self.small_threshold {
                MERGE_SOLVES_TWO_PENDING_CHUNKS
            } else {
                MERGE_SOLVES_ONE_PENDING_CHUNK
            };
        }
        ranking
    }

    fn shard_size(&self, shard: &ShardId) -> u64 {
        self.shard_infos
            .get(shard)
            .map(|info| info.current_size_bytes)
            .unwrap_or(u64::MAX)
    }

    fn remove_from_small_index(&mut self, chunk: ChunkRef, shard: &ShardId) {
        let Some(small) = self.small_by_shard.get_mut(shard) else {
            return;
        };
        small.retain(|r| *r != chunk);
        if small.is_empty() {
            self.small_by_shard.remove(shard);
        }
    }

    fn resort_small_index(&mut self, shard: &ShardId) {
        let Self {
            chunks,
            small_by_shard,
            ..
        } = self;
        if let Some(small) = small_by_shard.get_mut(shard) {
            small.sort_by_key(|r| chunks.get(*r).estimated_size_bytes);
        }
    }

    fn resort_shard_order(&mut self) {
        let Self {
            shard_infos,
            shard_order,
            ..
        } = self;
        shard_order.sort_by(|a, b| {
            let size_a = shard_infos.get(a).map(|i| i.current_size_bytes).unwrap_or(0);
            let size_b = shard_infos.get(b).map(|i| i.current_size_bytes).unwrap_or(0);
            size_b.cmp(&size_a)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::ShardKey;
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

    fn chunk(min: u64, max: u64, shard: &str, size: u64) -> ChunkRecord {
        ChunkRecord {
            range: ChunkRange::new(ShardKey::from_u64(min), ShardKey::from_u64(max)).unwrap(),
            shard: ShardId::from(shard),
            estimated_size_bytes: Some(size),
        }
    }

    fn stats(shard: &str, current: u64) -> ShardStatistics {
        ShardStatistics {
            shard: ShardId::from(shard),
            current_size_bytes: current,
            max_size_bytes: 0,
            draining: false,
        }
    }

    fn build(chunks: Vec<ChunkRecord>, shard_stats: Vec<ShardStatistics>) -> MoveAndMergePhase {
        MoveAndMergePhase::build(coll(), chunks, shard_stats, ZoneMap::default(), 100)
    }

    #[test]
    fn test_build_aborts_on_unknown_size() {
        let chunks = vec![chunk(0, 10, "a", 5), {
            let mut c = chunk(10, 20, "a", 0);
            c.estimated_size_bytes = None;
            c
        }];
        let phase = build(chunks, vec![stats("a", 100)]);
        assert!(phase.aborted);
        assert!(phase.is_complete());
        assert_eq!(phase.next_phase(), PhaseTag::Coalesce);
    }

    #[test]
    fn test_small_index_sorted_by_ascending_size() {
        let chunks = vec![
            chunk(0, 10, "a", 20),
            chunk(10, 20, "a", 5),
            chunk(20, 30, "a", 90),
        ];
        let phase = build(chunks, vec![stats("a", 115)]);
        let small = &phase.small_by_shard[&ShardId::from("a")];
        let sizes: Vec<u64> = small
            .iter()
            .map(|r| phase.chunks.get(*r).estimated_size_bytes)
            .collect();
        assert_eq!(sizes, vec![5, 20]);
    }

    #[test]
    fn test_shard_order_descending_by_size() {
        let chunks = vec![chunk(0, 10, "a", 5), chunk(10, 20, "b", 5)];
        let phase = build(
            chunks,
            vec![stats("a", 10), stats("b", 500), stats("c", 100)],
        );
        assert_eq!(
            phase.shard_order,
            vec![ShardId::from("b"), ShardId::from("c"), ShardId::from("a")]
        );
    }

    #[test]
    fn test_rank_prefers_same_shard_sibling() {
        let chunks = vec![
            chunk(0, 10, "a", 5),
            chunk(10, 20, "a", 10),
            chunk(20, 30, "b", 10),
        ];
        let phase = build(chunks, vec![stats("a", 15), stats("b", 10)]);
        let refs: Vec<ChunkRef> = phase.chunks.refs().collect();
        let same_shard = phase.rank_mergeable_sibling(refs[0], refs[1]);
        let remote = phase.rank_mergeable_sibling(refs[1], refs[2]);
        assert!(same_shard >= NO_MOVE_REQUIRED);
        assert!(same_shard > remote);
    }

    #[test]
    fn test_rank_rewards_merges_that_clear_the_small_index() {
        // threshold is 25 for max size 100
        let chunks = vec![
            chunk(0, 10, "a", 20),
            chunk(10, 20, "b", 20),
            chunk(20, 30, "b", 90),
        ];
        let phase = build(chunks, vec![stats("a", 20), stats("b", 110)]);
        let refs: Vec<ChunkRef> = phase.chunks.refs().collect();
        // 20 + 20 > 25 and the sibling is itself small: both pending chunks
        // are resolved by one merge.
        let both = phase.rank_mergeable_sibling(refs[0], refs[1]);
        assert_eq!(both & MERGE_SOLVES_TWO_PENDING_CHUNKS, MERGE_SOLVES_TWO_PENDING_CHUNKS);
        // 20 + 90 > 25 but the sibling was never pending.
        let one = phase.rank_mergeable_sibling(refs[1], refs[2]);
        assert_eq!(one & MERGE_SOLVES_ONE_PENDING_CHUNK, MERGE_SOLVES_ONE_PENDING_CHUNK);
        assert_eq!(one & MERGE_SOLVES_TWO_PENDING_CHUNKS, 0);
    }

    #[test]
    fn test_chunk_with_no_mergeable_sibling_is_evicted() {
        // Lone small chunk on a: its only sibling is on a draining shard.
        let chunks = vec![chunk(0, 10, "a", 5), chunk(10, 20, "b", 90)];
        let mut phase = MoveAndMergePhase::build(
            coll(),
            chunks,
            vec![
                stats("a", 5),
                ShardStatistics {
                    shard: ShardId::from("b"),
                    current_size_bytes: 90,
                    max_size_bytes: 0,
                    draining: true,
                },
            ],
            ZoneMap::default(),
            100,
        );
        let mut used = HashSet::new();
        let found = phase.find_workable_chunk(&ShardId::from("a"), &used);
        assert!(found.is_none());
        // The index entry is gone for good.
        assert!(phase.small_by_shard.is_empty());
        used.clear();
        assert!(phase.find_workable_chunk(&ShardId::from("a"), &used).is_none());
    }

    #[test]
    fn test_zone_fence_blocks_pairing() {
        let zones = ZoneMap::new(vec![
            (
                ChunkRange::new(ShardKey::from_u64(0), ShardKey::from_u64(10)).unwrap(),
                "hot".to_string(),
            ),
            (
                ChunkRange::new(ShardKey::from_u64(10), ShardKey::from_u64(20)).unwrap(),
                "cold".to_string(),
            ),
        ]);
        let chunks = vec![chunk(0, 10, "a", 5), chunk(10, 20, "b", 5)];
        let mut phase = MoveAndMergePhase::build(
            coll(),
            chunks,
            vec![stats("a", 5), stats("b", 5)],
            zones,
            100,
        );
        let used = HashSet::new();
        assert!(phase.find_workable_chunk(&ShardId::from("a"), &used).is_none());
        assert!(phase.find_workable_chunk(&ShardId::from("b"), &used).is_none());
    }

    #[test]
    fn test_merge_success_updates_routing_table_and_index() {
        let chunks = vec![
            chunk(0, 10, "a", 5),
            chunk(10, 20, "b", 5),
            chunk(20, 30, "b", 80),
        ];
        let mut phase = build(chunks, vec![stats("a", 5), stats("b", 85)]);
        let refs: Vec<ChunkRef> = phase.chunks.refs().collect();
        let request = MoveAndMergeRequest::new(refs[0], refs[1]);
        phase.chunks.get_mut(refs[0]).busy = true;
        phase.chunks.get_mut(refs[1]).busy = true;
        phase.complete_merge(request);

        assert_eq!(phase.chunks.len(), 2);
        let merged = phase.chunks.get(refs[1]);
        assert_eq!(
            merged.range,
            ChunkRange::new(ShardKey::from_u64(0), ShardKey::from_u64(20)).unwrap()
        );
        assert_eq!(merged.estimated_size_bytes, 10);
        assert!(!merged.busy);
        // Moved chunk left the small index for shard a entirely.
        assert!(phase.small_by_shard.get(&ShardId::from("a")).is_none());
        // The merged chunk (size 10 <= 25) is still indexed under b.
        assert!(phase.small_by_shard[&ShardId::from("b")].contains(&refs[1]));
    }

    #[test]
    fn test_merged_chunk_above_threshold_leaves_small_index() {
        let chunks = vec![chunk(0, 10, "a", 20), chunk(10, 20, "b", 20)];
        let mut phase = build(chunks, vec![stats("a", 20), stats("b", 20)]);
        let refs: Vec<ChunkRef> = phase.chunks.refs().collect();
        let request = MoveAndMergeRequest::new(refs[0], refs[1]);
        phase.complete_merge(request);
        // 40 > 25: nothing small remains anywhere.
        assert!(phase.small_by_shard.is_empty());
        assert!(phase.is_complete());
    }

    #[test]
    fn test_retriable_migration_failure_releases_the_pair() {
        let chunks = vec![chunk(0, 10, "a", 5), chunk(10, 20, "b", 5)];
        let mut phase = build(chunks, vec![stats("a", 5), stats("b", 5)]);
        let refs: Vec<ChunkRef> = phase.chunks.refs().collect();
        phase.chunks.get_mut(refs[0]).busy = true;
        phase.chunks.get_mut(refs[1]).busy = true;
        phase
            .outstanding_migrations
            .push(MoveAndMergeRequest::new(refs[0], refs[1]));
        let action = MigrateChunk {
            uuid: phase.coll.uuid,
            namespace: phase.coll.namespace.clone(),
            source: ShardId::from("a"),
            dest: ShardId::from("b"),
            range: phase.chunks.get(refs[0]).range.clone(),
            version: tessera_core::ChunkVersion::new(1, 0, Uuid::nil(), 1),
        };
        phase.apply_move_result(&action, &Err(ActionError::StaleShardVersion));
        assert!(!phase.chunks.get(refs[0]).busy);
        assert!(!phase.chunks.get(refs[1]).busy);
        assert!(phase.outstanding_migrations.is_empty());
        assert!(!phase.aborted);
    }

    #[test]
    fn test_successful_migration_resorts_shard_order() {
        let chunks = vec![chunk(0, 10, "a", 20), chunk(10, 20, "b", 15)];
        let mut phase = build(chunks, vec![stats("a", 20), stats("b", 15)]);
        assert_eq!(phase.shard_order[0], ShardId::from("a"));
        let refs: Vec<ChunkRef> = phase.chunks.refs().collect();
        phase
            .outstanding_migrations
            .push(MoveAndMergeRequest::new(refs[0], refs[1]));
        let action = MigrateChunk {
            uuid: phase.coll.uuid,
            namespace: phase.coll.namespace.clone(),
            source: ShardId::from("a"),
            dest: ShardId::from("b"),
            range: phase.chunks.get(refs[0]).range.clone(),
            version: tessera_core::ChunkVersion::new(1, 0, Uuid::nil(), 1),
        };
        phase.apply_move_result(&action, &Ok(()));
        // 20 bytes moved from a to b: b now leads the processing order.
        assert_eq!(phase.shard_order[0], ShardId::from("b"));
        assert_eq!(phase.actionable_merges.len(), 1);
    }
}
