//! The handle sweep server.
//!
//! Bounds the open-handle count without ever blocking user operations.
//! Each pass runs four phases in order: mark idle handles with a time of
//! death, expire handles idle past the threshold (down to the configured
//! minimum), discard dead handles from cache, and unlink anything nothing
//! references anymore. The auxiliary lookaside store is pruned on a faster
//! cadence. Lock contention is never an error here: a busy handle is
//! simply skipped until the next pass.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::config::SweepSettings;
use crate::error::fatal;
use crate::metrics::Metrics;

use super::{DataHandle, HandleList, HandleType, Lookaside, TxnVisibility};

/// Cadence of the auxiliary-store sweep, faster than the handle sweep.
pub const LOOKASIDE_SWEEP_SECS: u64 = 20;

#[derive(Debug, Error)]
pub enum SweepError {
    /// Try-lock contention; the handle is skipped this pass.
    #[error("handle busy")]
    Busy,
    /// Engine fault while closing or unlinking. Fatal to the tick.
    #[error("sweep engine fault: {0}")]
    Engine(String),
}

/// Time source for the sweeper; injected so tests can drive idleness.
pub trait SweepClock: Send + Sync {
    fn now_secs(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl SweepClock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// One sweep state machine. Synchronous: `tick` does one wakeup's worth of
/// work. [`SweepServer`] owns one on its thread; tests drive one directly.
pub struct Sweeper {
    settings: SweepSettings,
    interval: u64,
    handles: Arc<HandleList>,
    txns: Arc<TxnVisibility>,
    lookaside: Arc<Lookaside>,
    clock: Arc<dyn SweepClock>,
    metrics: Arc<Metrics>,
    last_sweep: u64,
    last_lookaside_id: u64,
}

impl Sweeper {
    pub fn new(
        settings: SweepSettings,
        handles: Arc<HandleList>,
        txns: Arc<TxnVisibility>,
        lookaside: Arc<Lookaside>,
        clock: Arc<dyn SweepClock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let interval = if settings.aggressive {
            (settings.close_scan_interval_secs / 10).max(1)
        } else {
            settings.close_scan_interval_secs
        };
        let last_sweep = clock.now_secs();
        Self {
            settings,
            interval,
            handles,
            txns,
            lookaside,
            clock,
            metrics,
            last_sweep,
            last_lookaside_id: 0,
        }
    }

    /// The condvar period the server should sleep between ticks.
    pub fn wait_period(&self) -> Duration {
        Duration::from_secs(LOOKASIDE_SWEEP_SECS.min(self.interval).max(1))
    }

    /// One wakeup: maybe prune the lookaside, maybe sweep data handles.
    pub fn tick(&mut self) -> Result<(), SweepError> {
        let now = self.clock.now_secs();

        let lookaside_due = self.settings.aggressive
            || now.saturating_sub(self.last_sweep) >= LOOKASIDE_SWEEP_SECS;
        if lookaside_due && !self.lookaside.is_empty() && !self.lookaside.is_cache_stuck() {
            let oldest = self.txns.oldest_id();
            // Re-sweeping before the horizon advances would find nothing.
            if self.last_lookaside_id < oldest {
                self.lookaside.sweep(oldest);
                self.metrics.lookaside_sweeps.incr();
                self.last_lookaside_id = oldest;
            }
        }

        if now.saturating_sub(self.last_sweep) < self.interval {
            return Ok(());
        }
        self.metrics.sweep_ticks.incr();

        if self.settings.close_idle_time_secs != 0 {
            self.mark(now);
            if self.handles.open_count() >= self.settings.close_handle_minimum {
                self.expire(now)?;
            }
        }

        let dead = self.discard()?;
        if dead > 0 {
            self.remove();
        }

        self.last_sweep = now;
        Ok(())
    }

    /// Phase 1: stamp idle handles with a time of death.
    fn mark(&self, now: u64) {
        for handle in self.handles.snapshot() {
            if handle.is_metadata() {
                continue;
            }
            // Internal bumps of the in-use count (eviction and friends)
            // must not keep a handle alive, but several concurrent cursors
            // mean real use: restart its idle clock.
            if handle.sessions_in_use() > 1 {
                handle.clear_time_of_death();
            }
            if handle.is_exclusive()
                || handle.sessions_in_use() > 0
                || handle.time_of_death() != 0
            {
                continue;
            }
            handle.set_time_of_death(now);
            self.metrics.sweep_marked.incr();
        }
    }

    /// Phase 2: expire handles idle past the threshold, stopping at the
    /// configured minimum of open handles.
    fn expire(&self, now: u64) -> Result<(), SweepError> {
        for handle in self.handles.snapshot() {
            if self.handles.open_count() <= self.settings.close_handle_minimum {
                break;
            }
            if handle.is_metadata()
                || !handle.is_open()
                || handle.is_dead()
                || handle.sessions_in_use() != 0
                || handle.time_of_death() == 0
                || now - handle.time_of_death() <= self.settings.close_idle_time_secs
            {
                continue;
            }

            // Table handles race cursor opens through the table lock;
            // btrees only need their own lock.
            let result = if handle.handle_type() == HandleType::Table {
                let _table = self.handles.table_lock();
                self.expire_one(&handle)
            } else {
                self.expire_one(&handle)
            };
            match result {
                Ok(()) => {}
                Err(SweepError::Busy) => self.metrics.sweep_busy_skips.incr(),
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    fn expire_one(&self, handle: &Arc<DataHandle>) -> Result<(), SweepError> {
        let Some(_guard) = handle.try_write() else {
            return Err(SweepError::Busy);
        };
        // Only sweep clean trees: a modified tree (or one whose newest
        // reconciliation is not yet visible to every transaction) would
        // need I/O to close. Leave it for a later pass.
        if !handle.tree_clean(&self.txns) {
            return Ok(());
        }
        handle.mark_dead();
        self.metrics.sweep_closed.incr();
        Ok(())
    }

    /// Phase 3: flush dead-but-open handles from cache and count how many
    /// handles could be unlinked.
    fn discard(&self) -> Result<usize, SweepError> {
        let mut discardable = 0;
        for handle in self.handles.snapshot() {
            if handle.can_discard() {
                discardable += 1;
            }
            if !handle.is_open() || !handle.is_dead() {
                continue;
            }
            handle.set_open(false);
            discardable += 1;
        }
        Ok(discardable)
    }

    /// Phase 4: unlink discardable handles under the list write lock.
    fn remove(&self) {
        let metrics = Arc::clone(&self.metrics);
        let _table = self.handles.table_lock();
        let removed = self.handles.remove_discarded(|handle| {
            tracing::debug!(handle = handle.name(), "sweep unlinked handle");
            true
        });
        metrics.sweep_removed.add(removed as u64);
    }
}

struct ServerShared {
    running: Mutex<bool>,
    cond: Condvar,
}

/// The background thread driving a [`Sweeper`].
pub struct SweepServer {
    shared: Arc<ServerShared>,
    thread: Option<JoinHandle<()>>,
}

impl SweepServer {
    pub fn spawn(mut sweeper: Sweeper) -> Self {
        let shared = Arc::new(ServerShared {
            running: Mutex::new(true),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("handle-sweep".into())
            .spawn(move || {
                let period = sweeper.wait_period();
                loop {
                    {
                        let running = thread_shared
                            .running
                            .lock()
                            .expect("sweep server state poisoned");
                        let (running, _) = thread_shared
                            .cond
                            .wait_timeout(running, period)
                            .expect("sweep server state poisoned");
                        if !*running {
                            return;
                        }
                    }
                    if let Err(err) = sweeper.tick() {
                        fatal(40700, format!("handle sweep server error: {err}"));
                    }
                }
            })
            .expect("spawn sweep server");
        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn shutdown(&mut self) {
        {
            let mut running = self
                .shared
                .running
                .lock()
                .expect("sweep server state poisoned");
            *running = false;
        }
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SweepServer {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}
