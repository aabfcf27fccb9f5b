//! The pipeline driver.
//!
//! Binds batcher, lane partitioner, worker pool and finalizer into the
//! apply loop: persist the batch to the local log, apply it across lanes
//! under the batch barrier, advance the consistency markers, register log
//! visibility, and try to leave RECOVERING once `lastApplied` covers
//! `minValid`.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crossbeam::channel::unbounded;

use crate::catalog::Catalog;
use crate::config::ApplyConfig;
use crate::core::{Namespace, OpEntry, OpTime, OpTimeAndWall, Timestamp};
use crate::error::fatal;
use crate::failpoint::{
    FailPointRegistry, PAUSE_AFTER_OPLOG_WRITES, PAUSE_APPLY_LOOP, PAUSE_BEFORE_BATCH_COMPLETION,
};
use crate::metrics::Metrics;
use crate::storage::{MultikeyUpdate, OplogInsert, StorageEngine};
use crate::util::{ShutdownSignal, ThreadPool};

use super::apply::{ApplyContext, ApplyError};
use super::batcher::{Batcher, BatcherContext};
use super::buffer::OplogBuffer;
use super::coordinator::{
    ApplierState, DataConsistency, MemberState, ReplicationCoordinator,
};
use super::fetcher::SyncSourceClient;
use super::finalizer::BatchFinalizer;
use super::markers::ConsistencyMarkers;
use super::observer::ApplyObserver;
use super::partition::{assign_to_lanes, LaneOp};
use super::worker::apply_lane;

/// Per-run knobs distinguishing steady-state application, initial sync and
/// crash recovery.
#[derive(Clone, Default)]
pub struct ApplyOptions {
    /// Ops at or before this position are silently skipped (resumed sync).
    pub begin_applying_optime: OpTime,
    /// Crash recovery replays entries that are already in the log.
    pub skip_writes_to_oplog: bool,
    /// Initial sync: where to fetch documents that cloning missed.
    pub missing_document_source: Option<Arc<dyn SyncSourceClient>>,
    /// Tolerate vanished namespaces on CRUD at the worker level.
    pub allow_namespace_not_found_on_crud: bool,
    /// Stable timestamp recovery is replaying toward, when known.
    pub stable_timestamp_for_recovery: Option<Timestamp>,
}

/// Constructor dependencies, passed as one bundle.
pub struct ApplyEngineDeps {
    pub catalog: Arc<Catalog>,
    pub engine: Arc<dyn StorageEngine>,
    pub coordinator: Arc<dyn ReplicationCoordinator>,
    pub observer: Arc<dyn ApplyObserver>,
    pub metrics: Arc<Metrics>,
    pub fail_points: Arc<FailPointRegistry>,
    pub config: ApplyConfig,
    pub options: ApplyOptions,
}

pub struct ApplyEngine {
    ctx: Arc<ApplyContext>,
    coordinator: Arc<dyn ReplicationCoordinator>,
    markers: ConsistencyMarkers,
    options: ApplyOptions,
    pool: ThreadPool,
    /// Held exclusively while a batch applies; readers hold it shared, so
    /// no reader observes a half-applied batch.
    batch_barrier: Arc<RwLock<()>>,
    /// Serializes the RECOVERING -> SECONDARY attempt with external state
    /// transitions.
    state_transition: Arc<Mutex<()>>,
    /// Held across each batch so an fsync-and-lock cannot interleave.
    fsync_lock: Arc<Mutex<()>>,
    shutdown: ShutdownSignal,
}

impl ApplyEngine {
    pub fn new(deps: ApplyEngineDeps) -> Self {
        let ApplyEngineDeps {
            catalog,
            engine,
            coordinator,
            observer,
            metrics,
            fail_points,
            config,
            options,
        } = deps;

        // Session bookkeeping lands in config.transactions; make sure the
        // table exists before the first synthesized update reaches it.
        let txns_ns = Namespace::config_transactions();
        if catalog.collection(&txns_ns).is_none() {
            if let Err(err) = catalog.create_collection(txns_ns, None, Default::default()) {
                tracing::warn!("could not pre-create session table: {err}");
            }
        }

        let pool = ThreadPool::new("repl-writer", config.effective_writer_threads());
        let ctx = Arc::new(ApplyContext {
            catalog,
            engine,
            observer,
            metrics,
            fail_points,
            config,
            shutdown: ShutdownSignal::new(),
        });
        Self {
            coordinator,
            markers: ConsistencyMarkers::new(Arc::clone(&ctx.engine)),
            options,
            pool,
            batch_barrier: Arc::new(RwLock::new(())),
            state_transition: Arc::new(Mutex::new(())),
            fsync_lock: Arc::new(Mutex::new(())),
            shutdown: ctx.shutdown.clone(),
            ctx,
        }
    }

    /// Shared flag that ends [`run`](Self::run); also observed by the
    /// batcher and the pause gates.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Readers take this shared to be isolated from batch application.
    pub fn batch_barrier(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.batch_barrier)
    }

    /// fsync-and-lock takes this to quiesce batch application.
    pub fn fsync_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.fsync_lock)
    }

    pub fn markers(&self) -> &ConsistencyMarkers {
        &self.markers
    }

    /// The outer apply loop. Returns when the batcher hands over the
    /// shutdown sentinel.
    pub fn run(&self, buffer: Arc<OplogBuffer>) {
        let batcher = Batcher::spawn(BatcherContext {
            buffer,
            coordinator: Arc::clone(&self.coordinator),
            config: self.ctx.config.clone(),
            shutdown: self.shutdown.clone(),
        });
        let finalizer =
            BatchFinalizer::for_engine(Arc::clone(&self.coordinator), Arc::clone(&self.ctx.engine));

        loop {
            self.ctx
                .fail_points
                .pause_while_active(PAUSE_APPLY_LOOP, &self.shutdown);

            let min_valid = match self.markers.min_valid() {
                Ok(min_valid) => min_valid,
                Err(err) => fatal(40705, format!("cannot read minValid: {err}")),
            };

            self.try_promote_to_secondary(min_valid);

            // Record the term before blocking: a drain signal computed
            // from a stale term must be recognizable as stale.
            let term_before_wait = self.coordinator.term();

            let ops = batcher.next_batch(Duration::from_secs(1));
            if ops.is_empty() {
                if ops.must_shutdown() {
                    finalizer.shutdown();
                    batcher.join();
                    return;
                }
                self.coordinator.signal_drain_complete(term_before_wait);
                continue;
            }

            let first_optime = ops.first_optime().expect("non-empty batch");
            let last_entry_optime = ops.last_optime().expect("non-empty batch");
            let last_entry_wall = ops.back().expect("non-empty batch").wall();
            let last_applied_at_start = self.coordinator.last_applied().optime;

            // The log must not go back in time or repeat an entry.
            if first_optime <= last_applied_at_start {
                fatal(
                    34361,
                    format!(
                        "attempted to apply an entry at {first_optime} not greater than our last \
                         applied optime {last_applied_at_start}"
                    ),
                );
            }

            let _fsync = self.fsync_lock.lock().expect("fsync lock poisoned");

            let last_applied_in_batch = match self.apply_batch(ops.into_ops()) {
                Ok(optime) => optime,
                Err(err) => fatal(34437, format!("failed to apply batch: {err}")),
            };
            if last_applied_in_batch != last_entry_optime {
                fatal(
                    40706,
                    format!(
                        "batch reported {last_applied_in_batch} applied but its last entry is \
                         {last_entry_optime}"
                    ),
                );
            }

            let min_valid = min_valid.max(last_entry_optime);

            // Ordering here is load-bearing: persist appliedThrough before
            // advertising the new lastApplied.
            if let Err(err) = self.markers.set_applied_through(last_entry_optime) {
                fatal(40707, format!("cannot persist appliedThrough: {err}"));
            }

            let last_applied_at_end = self.coordinator.last_applied().optime;
            if last_applied_at_start != last_applied_at_end {
                fatal(
                    40708,
                    format!(
                        "last applied moved from {last_applied_at_start} to \
                         {last_applied_at_end} during batch application"
                    ),
                );
            }

            // Everything for this batch is written; let readers see it.
            self.ctx
                .engine
                .oplog_disk_loc_register(last_entry_optime.ts, true);

            let consistency = if last_entry_optime >= min_valid {
                DataConsistency::Consistent
            } else {
                DataConsistency::Inconsistent
            };
            finalizer.record(
                OpTimeAndWall::new(last_entry_optime, last_entry_wall),
                consistency,
            );
            self.ctx.observer.on_batch_applied(last_entry_optime);
        }
    }

    /// Apply one batch: log writes, partition, parallel apply, marker
    /// updates. Returns the last applied optime.
    pub fn apply_batch(&self, ops: Vec<OpEntry>) -> Result<OpTime, ApplyError> {
        if ops.is_empty() {
            return Err(ApplyError::EmptyBatch);
        }
        tracing::debug!(ops = ops.len(), "applying replication batch");

        // Freeze user-visible state for the duration of the batch.
        let _barrier = self.batch_barrier.write().expect("batch barrier poisoned");

        if self.coordinator.applier_state() == ApplierState::Stopped {
            tracing::error!("attempting to replicate ops while primary");
            return Err(ApplyError::CannotApplyWhilePrimary);
        }

        self.ctx.metrics.batches_applied.incr();
        self.ctx.metrics.batch_ops_total.add(ops.len() as u64);

        let first_ts = ops.first().expect("non-empty").timestamp();
        let last_optime = ops.last().expect("non-empty").optime();

        if !self.options.skip_writes_to_oplog {
            // If we crash mid-write the log tail past this point may be
            // missing entries; recovery truncates it.
            self.markers.set_oplog_truncate_after_point(first_ts)?;
            self.schedule_oplog_writes(&ops);
        }

        let mut lanes: Vec<Vec<LaneOp>> = (0..self.pool.threads()).map(|_| Vec::new()).collect();
        let partition_result = assign_to_lanes(&self.ctx, &self.options, ops, &mut lanes);

        // The log writers borrow nothing, but they must finish before the
        // markers are reset below, error or not.
        self.pool.wait_for_idle();
        partition_result?;

        self.ctx
            .fail_points
            .pause_while_active(PAUSE_AFTER_OPLOG_WRITES, &self.shutdown);

        if !self.options.skip_writes_to_oplog {
            self.markers.set_oplog_truncate_after_point(Timestamp::NULL)?;
            self.markers.set_min_valid_to_at_least(last_optime)?;
        }

        let multikey = self.dispatch_lanes(lanes)?;

        self.ctx.engine.replication_batch_is_complete();

        self.ctx
            .fail_points
            .pause_while_active(PAUSE_BEFORE_BATCH_COMPLETION, &self.shutdown);

        // Multikey flips are timestamped with the first timestamp in the
        // batch: too early is always safe, too late is not, and the exact
        // first write that went multikey is unknown here.
        for update in multikey {
            self.persist_multikey(&update, first_ts);
        }

        Ok(last_optime)
    }

    fn dispatch_lanes(&self, lanes: Vec<Vec<LaneOp>>) -> Result<Vec<MultikeyUpdate>, ApplyError> {
        let (tx, rx) = unbounded();
        let mut dispatched = 0;
        for (idx, lane) in lanes.into_iter().enumerate() {
            if lane.is_empty() {
                continue;
            }
            dispatched += 1;
            let tx = tx.clone();
            let ctx = Arc::clone(&self.ctx);
            let options = self.options.clone();
            self.pool.schedule(move || {
                let result = apply_lane(&ctx, &options, lane);
                // The receiver outlives the pool wait below.
                let _ = tx.send((idx, result));
            });
        }
        drop(tx);
        self.pool.wait_for_idle();

        let mut outcomes: Vec<(usize, Result<Vec<MultikeyUpdate>, ApplyError>)> =
            rx.into_iter().collect();
        debug_assert_eq!(outcomes.len(), dispatched);
        outcomes.sort_by_key(|(idx, _)| *idx);

        let mut multikey = Vec::new();
        for (idx, outcome) in outcomes {
            match outcome {
                Ok(mut lane_multikey) => multikey.append(&mut lane_multikey),
                Err(err) => {
                    tracing::error!(lane = idx, "batch application failed in worker: {err}");
                    return Err(err);
                }
            }
        }
        Ok(multikey)
    }

    /// Write the batch's raw entries to the local log, split across the
    /// pool when the engine can take parallel ordered inserts and the
    /// batch is big enough to amortize the fan-out.
    fn schedule_oplog_writes(&self, ops: &[OpEntry]) {
        const MIN_OPS_PER_WRITER: usize = 16;

        let inserts: Vec<OplogInsert> = ops
            .iter()
            .map(|op| OplogInsert {
                raw: op.raw().clone(),
                ts: op.timestamp(),
                term: op.term(),
            })
            .collect();

        let threads = self.pool.threads();
        let parallel = self.ctx.engine.supports_doc_locking()
            && inserts.len() >= MIN_OPS_PER_WRITER * threads;

        let write = |engine: Arc<dyn StorageEngine>, chunk: Vec<OplogInsert>| {
            move || {
                if let Err(err) = engine.insert_oplog_documents(chunk) {
                    fatal(40141, format!("failed to write entries to the log: {err}"));
                }
            }
        };

        if !parallel {
            self.pool
                .schedule(write(Arc::clone(&self.ctx.engine), inserts));
            return;
        }

        let per_thread = inserts.len() / threads;
        let mut rest = inserts;
        for _ in 0..threads.saturating_sub(1) {
            let tail = rest.split_off(per_thread.min(rest.len()));
            self.pool.schedule(write(Arc::clone(&self.ctx.engine), rest));
            rest = tail;
        }
        self.pool.schedule(write(Arc::clone(&self.ctx.engine), rest));
    }

    fn persist_multikey(&self, update: &MultikeyUpdate, ts: Timestamp) {
        if let Err(err) =
            self.ctx
                .engine
                .set_index_is_multikey(&update.ns, &update.index, &update.paths, ts)
        {
            fatal(50686, format!("cannot persist multikey transition: {err}"));
        }
        if let Some(collection) = self.ctx.catalog.collection(&update.ns) {
            collection.set_index_multikey(&update.index, &update.paths);
        }
    }

    /// Leave RECOVERING for SECONDARY once the data is consistent.
    fn try_promote_to_secondary(&self, min_valid: OpTime) {
        // Cheap check first, no locks.
        if self.coordinator.member_state().is_readable() {
            return;
        }
        self.ctx.metrics.attempts_to_become_secondary.incr();

        let _transition = self
            .state_transition
            .lock()
            .expect("state transition lock poisoned");

        // Re-check now that the transition lock is held.
        if self.coordinator.member_state().is_readable() {
            return;
        }
        if self.coordinator.in_maintenance_mode() {
            tracing::debug!("cannot leave RECOVERING while in maintenance mode");
            return;
        }
        let state = self.coordinator.member_state();
        if state != MemberState::Recovering {
            tracing::debug!(%state, "can only transition to SECONDARY from RECOVERING");
            return;
        }
        let last_applied = self.coordinator.last_applied().optime;
        if last_applied < min_valid {
            tracing::debug!(
                %last_applied,
                %min_valid,
                "cannot become SECONDARY until lastApplied reaches minValid"
            );
            return;
        }

        if let Err(err) = self.coordinator.set_follower_mode(MemberState::Secondary) {
            tracing::warn!(
                state = %self.coordinator.member_state(),
                "failed to transition to SECONDARY: {err}"
            );
        }
    }
}
