//! Engine counters.
//!
//! One explicit sink of atomic counters passed by `Arc` through
//! constructors. No global registry; embedders snapshot what they need.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// All counters the pipeline and the sweeper maintain.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Individual log entries applied (grouped inserts count each member).
    pub ops_applied: Counter,
    /// Batches handed to the apply pipeline.
    pub batches_applied: Counter,
    /// Sum of batch sizes in ops, for average-batch-size reporting.
    pub batch_ops_total: Counter,
    /// Attempts to leave RECOVERING for SECONDARY, successful or not.
    pub attempts_to_become_secondary: Counter,
    /// CRUD ops skipped because their namespace was already gone in a
    /// mode that tolerates it.
    pub namespace_not_found_skipped: Counter,
    /// Write-conflict retry loop iterations.
    pub write_conflict_retries: Counter,
    /// Documents fetched from the sync source during initial sync.
    pub missing_docs_fetched: Counter,
    /// Session-table pseudo-ops synthesized from tracked sessions.
    pub session_updates_flushed: Counter,

    /// Sweeper: data-handle passes started.
    pub sweep_ticks: Counter,
    /// Sweeper: handles newly marked with a time of death.
    pub sweep_marked: Counter,
    /// Sweeper: handles closed (expired or discarded).
    pub sweep_closed: Counter,
    /// Sweeper: handles unlinked from the handle list.
    pub sweep_removed: Counter,
    /// Sweeper: try-lock skips due to concurrent use.
    pub sweep_busy_skips: Counter,
    /// Auxiliary-store sweeps performed.
    pub lookaside_sweeps: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}
