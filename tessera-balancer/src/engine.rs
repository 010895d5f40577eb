//! Defragmentation policy engine
//!
//! Orchestrates the enrolled collections: owns the map from collection to
//! its current phase, serves the two work queues (single-item streaming
//! actions and batch migration selection), advances phases as they complete
//! and persists every transition.
//!
//! A single async mutex protects all engine and per-collection state; phase
//! methods are never re-entered. Catalog reads are issued while the lock is
//! held, which is accepted because the balancer is a low-frequency control
//! loop.

use crate::action::{
    Action, ApplySplit, DataSize, FindSplitPoints, MeasureDataSize, MergeChunks, MigrateChunk,
};
use crate::catalog::{CatalogClient, ClusterStatsSource, CollectionEntry, PhaseStore};
use crate::config::EngineConfig;
use crate::phases::{CoalescePhase, MoveAndMergePhase, Phase, PhaseTag, SplitPhase};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tessera_core::{ActionError, CatalogError, ShardId, ShardKey};
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Engine-surface errors.
#[derive(Error, Debug)]
pub enum PolicyError {
    /// A second consumer tried to suspend on the action stream while one was
    /// already parked; the stream supports a single waiting consumer.
    #[error("A streaming consumer is already waiting for the next action")]
    ConsumerAlreadyParked,
}

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Error)]
enum TransitionError {
    #[error("persisting the phase transition failed: {0}")]
    Persist(CatalogError),
    #[error("building the next phase failed: {0}")]
    Build(CatalogError),
}

struct EngineState {
    /// Active (non-terminal) phase per enrolled collection.
    collections: HashMap<Uuid, Phase>,
    /// In-flight streaming actions. Incremented when an action is handed
    /// out on the ready path or during a refresh; an acknowledgment either
    /// hands its slot to the parked consumer or decrements.
    concurrent_streaming_ops: usize,
    /// Single-slot parked consumer.
    pending_consumer: Option<oneshot::Sender<Action>>,
    stream_closed: bool,
}

/// Chunk defragmentation policy engine.
pub struct PolicyEngine {
    catalog: Arc<dyn CatalogClient>,
    stats: Arc<dyn ClusterStatsSource>,
    store: Arc<dyn PhaseStore>,
    config: EngineConfig,
    state: Mutex<EngineState>,
}

impl PolicyEngine {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        stats: Arc<dyn ClusterStatsSource>,
        store: Arc<dyn PhaseStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            stats,
            store,
            config,
            state: Mutex::new(EngineState {
                collections: HashMap::new(),
                concurrent_streaming_ops: 0,
                pending_consumer: None,
                stream_closed: false,
            }),
        }
    }

    /// Enroll or cancel a collection according to its catalog entry.
    pub async fn refresh_collection_status(&self, coll: &CollectionEntry) {
        let mut state = self.state.lock().await;
        if coll.defragmenting && !state.collections.contains_key(&coll.uuid) {
            self.initialize_collection(&mut state, coll).await;
            // Fulfil a parked consumer if the new collection brought work.
            if state.pending_consumer.is_some() {
                if let Some(action) = self.produce_next_action(&mut state).await {
                    state.concurrent_streaming_ops += 1;
                    if !fulfil_pending_consumer(&mut state, action) {
                        state.concurrent_streaming_ops -= 1;
                    }
                }
            }
        } else if !coll.defragmenting && state.collections.contains_key(&coll.uuid) {
            match self.transition_phase(coll, PhaseTag::Finished, true).await {
                Ok(_) => {
                    state.collections.remove(&coll.uuid);
                    info!(
                        namespace = %coll.namespace,
                        uuid = %coll.uuid,
                        "Collection defragmentation cancelled"
                    );
                }
                Err(err) => {
                    // Keep the collection; the next refresh retries the
                    // cancellation.
                    warn!(
                        uuid = %coll.uuid,
                        error = %err,
                        "Failed to finalize defragmentation cancellation"
                    );
                }
            }
        }
    }

    /// The next streamable action, suspending the caller when no work is
    /// currently producible or the concurrency cap is reached. At most one
    /// consumer may be suspended at a time.
    pub async fn next_streaming_action(&self) -> Result<Action> {
        let receiver = {
            let mut state = self.state.lock().await;
            if state.concurrent_streaming_ops < self.config.max_concurrent_streaming_ops {
                if let Some(action) = self.produce_next_action(&mut state).await {
                    state.concurrent_streaming_ops += 1;
                    return Ok(action);
                }
            }
            if state.pending_consumer.is_some() {
                return Err(PolicyError::ConsumerAlreadyParked);
            }
            let (sender, receiver) = oneshot::channel();
            state.pending_consumer = Some(sender);
            receiver
        };
        // The engine was dropped without closing the stream.
        Ok(receiver.await.unwrap_or(Action::EndOfStream))
    }

    /// Batch-select migrations across all enrolled collections.
    ///
    /// Repeatedly sweeps the collections until a full pass commits no new
    /// migration; `used_shards` collects the shards committed by this call.
    pub async fn select_chunks_to_move(
        &self,
        used_shards: &mut HashSet<ShardId>,
    ) -> Vec<MigrateChunk> {
        let mut state = self.state.lock().await;
        let mut migrations = Vec::new();
        loop {
            let selected_before_this_pass = migrations.len();
            let uuids: Vec<Uuid> = state.collections.keys().copied().collect();
            for uuid in uuids {
                if let Err(err) = self.refresh_phase_for(&mut state, uuid).await {
                    error!(uuid = %uuid, error = %err, "Error while getting next migration");
                    state.collections.remove(&uuid);
                    continue;
                }
                let Some(phase) = state.collections.get_mut(&uuid) else {
                    continue;
                };
                match phase
                    .pop_next_migration(self.catalog.as_ref(), used_shards)
                    .await
                {
                    Ok(Some(migration)) => migrations.push(migration),
                    Ok(None) => {}
                    Err(err) => {
                        error!(uuid = %uuid, error = %err, "Error while getting next migration");
                        state.collections.remove(&uuid);
                    }
                }
            }
            if migrations.len() == selected_before_this_pass {
                break;
            }
        }
        migrations
    }

    pub async fn acknowledge_merge_result(
        &self,
        action: MergeChunks,
        result: std::result::Result<(), ActionError>,
    ) {
        let mut state = self.state.lock().await;
        // The collection may have been cancelled while the action was in
        // flight.
        let Some(phase) = state.collections.get_mut(&action.uuid) else {
            return;
        };
        phase.apply_merge_result(&action, &result);
        self.process_end_of_action(&mut state).await;
    }

    pub async fn acknowledge_data_size_result(
        &self,
        action: MeasureDataSize,
        result: std::result::Result<DataSize, ActionError>,
    ) {
        let mut state = self.state.lock().await;
        let Some(phase) = state.collections.get_mut(&action.uuid) else {
            return;
        };
        phase
            .apply_data_size_result(self.store.as_ref(), &action, &result)
            .await;
        self.process_end_of_action(&mut state).await;
    }

    pub async fn acknowledge_split_vector_result(
        &self,
        action: FindSplitPoints,
        result: std::result::Result<Vec<ShardKey>, ActionError>,
    ) {
        let mut state = self.state.lock().await;
        let Some(phase) = state.collections.get_mut(&action.uuid) else {
            return;
        };
        phase.apply_split_vector_result(&action, &result);
        self.process_end_of_action(&mut state).await;
    }

    pub async fn acknowledge_split_result(
        &self,
        action: ApplySplit,
        result: std::result::Result<(), ActionError>,
    ) {
        let mut state = self.state.lock().await;
        let Some(phase) = state.collections.get_mut(&action.uuid) else {
            return;
        };
        phase.apply_split_result(&action, &result);
        self.process_end_of_action(&mut state).await;
    }

    pub async fn acknowledge_move_result(
        &self,
        action: MigrateChunk,
        result: std::result::Result<(), ActionError>,
    ) {
        let mut state = self.state.lock().await;
        let Some(phase) = state.collections.get_mut(&action.uuid) else {
            return;
        };
        phase.apply_move_result(&action, &result);
        self.process_end_of_action(&mut state).await;
    }

    /// Stop producing work. Clears every collection and resolves a parked
    /// consumer with [`Action::EndOfStream`]; once closed, an idle stream
    /// yields `EndOfStream` instead of suspending.
    pub async fn close_action_stream(&self) {
        let mut state = self.state.lock().await;
        state.collections.clear();
        fulfil_pending_consumer(&mut state, Action::EndOfStream);
        state.stream_closed = true;
        info!("Defragmentation action stream closed");
    }

    /// Produce the next action from any collection, advancing phases first.
    /// Collections whose catalog reads fail are evicted.
    async fn produce_next_action(&self, state: &mut EngineState) -> Option<Action> {
        let uuids: Vec<Uuid> = state.collections.keys().copied().collect();
        for uuid in uuids {
            if let Err(err) = self.refresh_phase_for(state, uuid).await {
                error!(uuid = %uuid, error = %err, "Error while getting next defragmentation action");
                state.collections.remove(&uuid);
                continue;
            }
            let Some(phase) = state.collections.get_mut(&uuid) else {
                continue;
            };
            match phase.pop_next_streamable_action(self.catalog.as_ref()).await {
                Ok(Some(action)) => return Some(action),
                Ok(None) => {}
                Err(err) => {
                    error!(uuid = %uuid, error = %err, "Error while getting next defragmentation action");
                    state.collections.remove(&uuid);
                }
            }
        }
        if state.stream_closed {
            Some(Action::EndOfStream)
        } else {
            None
        }
    }

    /// Hand a freed slot to the parked consumer if it can be satisfied,
    /// otherwise release the slot.
    async fn process_end_of_action(&self, state: &mut EngineState) {
        if state.pending_consumer.is_some() {
            if let Some(action) = self.produce_next_action(state).await {
                if fulfil_pending_consumer(state, action) {
                    return;
                }
            }
        }
        state.concurrent_streaming_ops = state.concurrent_streaming_ops.saturating_sub(1);
    }

    /// While the collection's phase is complete, transition to the next one,
    /// persisting each hop. Returns an error when the catalog read needed
    /// for the transition fails; the caller evicts the collection.
    async fn refresh_phase_for(
        &self,
        state: &mut EngineState,
        uuid: Uuid,
    ) -> std::result::Result<(), CatalogError> {
        let complete = match state.collections.get(&uuid) {
            Some(phase) => phase.is_complete(),
            None => return Ok(()),
        };
        if !complete {
            return Ok(());
        }

        let coll = self.catalog.get_collection(uuid).await?;
        while state
            .collections
            .get(&uuid)
            .map(|phase| phase.is_complete())
            .unwrap_or(false)
        {
            let next = match state.collections.get(&uuid) {
                Some(phase) => phase.next_phase(),
                None => break,
            };
            match self.transition_phase(&coll, next, true).await {
                Ok(phase) if phase.is_finished() => {
                    state.collections.remove(&uuid);
                }
                Ok(phase) => {
                    state.collections.insert(uuid, phase);
                }
                Err(TransitionError::Persist(err)) => {
                    // Leave the collection in its pre-transition state; the
                    // next refresh retries the transition.
                    warn!(uuid = %uuid, error = %err, "Failed to persist phase transition");
                    break;
                }
                Err(TransitionError::Build(err)) => return Err(err),
            }
        }
        Ok(())
    }

    /// Build the state of a freshly enrolled collection, resuming from the
    /// persisted phase marker and fast-forwarding through phases that have
    /// nothing to do.
    async fn initialize_collection(&self, state: &mut EngineState, coll: &CollectionEntry) {
        let first_tag = coll.persisted_phase.unwrap_or(PhaseTag::Coalesce);
        let persist_first = coll.persisted_phase.is_none();
        let mut phase = match self.transition_phase(coll, first_tag, persist_first).await {
            Ok(phase) => phase,
            Err(err) => {
                warn!(
                    namespace = %coll.namespace,
                    uuid = %coll.uuid,
                    error = %err,
                    "Failed to enroll collection for defragmentation"
                );
                return;
            }
        };
        while phase.is_complete() {
            phase = match self.transition_phase(coll, phase.next_phase(), true).await {
                Ok(phase) => phase,
                Err(err) => {
                    warn!(
                        namespace = %coll.namespace,
                        uuid = %coll.uuid,
                        error = %err,
                        "Failed to enroll collection for defragmentation"
                    );
                    return;
                }
            };
        }
        if !phase.is_finished() {
            state.collections.insert(coll.uuid, phase);
        }
    }

    /// Persist and build the next phase. `Finished` unsets the persisted
    /// markers and clears the per-chunk size estimates instead of building
    /// anything.
    async fn transition_phase(
        &self,
        coll: &CollectionEntry,
        tag: PhaseTag,
        persist: bool,
    ) -> std::result::Result<Phase, TransitionError> {
        if persist {
            let persisted = match tag {
                PhaseTag::Finished => self.store.clear_defragmentation_markers(coll.uuid).await,
                tag => self.store.persist_phase(coll.uuid, tag).await,
            };
            persisted.map_err(TransitionError::Persist)?;
        }

        let phase = match tag {
            PhaseTag::Coalesce => {
                let chunks = self
                    .catalog
                    .get_chunks_sorted(coll)
                    .await
                    .map_err(TransitionError::Build)?;
                let zones = self
                    .catalog
                    .get_zones(coll)
                    .await
                    .map_err(TransitionError::Build)?;
                Phase::Coalesce(CoalescePhase::build(coll.clone(), chunks, zones))
            }
            PhaseTag::MoveAndMerge => {
                let chunks = self
                    .catalog
                    .get_chunks_sorted(coll)
                    .await
                    .map_err(TransitionError::Build)?;
                let zones = self
                    .catalog
                    .get_zones(coll)
                    .await
                    .map_err(TransitionError::Build)?;
                let shard_stats = self
                    .stats
                    .shard_stats(coll)
                    .await
                    .map_err(TransitionError::Build)?;
                let max_size = self
                    .effective_max_chunk_size(coll)
                    .await
                    .map_err(TransitionError::Build)?;
                Phase::MoveAndMerge(MoveAndMergePhase::build(
                    coll.clone(),
                    chunks,
                    shard_stats,
                    zones,
                    max_size,
                ))
            }
            PhaseTag::Split => {
                let chunks = self
                    .catalog
                    .get_chunks_sorted(coll)
                    .await
                    .map_err(TransitionError::Build)?;
                let max_size = self
                    .effective_max_chunk_size(coll)
                    .await
                    .map_err(TransitionError::Build)?;
                Phase::Split(SplitPhase::build(coll.clone(), chunks, max_size))
            }
            PhaseTag::Finished => {
                if let Err(err) = self.store.clear_chunk_size_estimates(coll.uuid).await {
                    warn!(
                        uuid = %coll.uuid,
                        error = %err,
                        "Failed to clear chunk size estimates"
                    );
                }
                Phase::Finished
            }
        };

        info!(
            namespace = %coll.namespace,
            uuid = %coll.uuid,
            phase = %phase.tag(),
            "Collection defragmentation transitioning to new phase"
        );
        Ok(phase)
    }

    async fn effective_max_chunk_size(
        &self,
        coll: &CollectionEntry,
    ) -> std::result::Result<u64, CatalogError> {
        if let Some(size) = coll.max_chunk_size_bytes {
            return Ok(size);
        }
        let config = self.catalog.get_balancer_configuration().await?;
        Ok(config.max_chunk_size_bytes)
    }
}

fn fulfil_pending_consumer(state: &mut EngineState, action: Action) -> bool {
    let Some(sender) = state.pending_consumer.take() else {
        return false;
    };
    if sender.send(action).is_err() {
        warn!("Streaming consumer went away before its action was produced");
        return false;
    }
    true
}
