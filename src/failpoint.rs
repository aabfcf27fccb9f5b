//! Named pause/trigger points for tests.
//!
//! A registry of gates the pipeline consults at fixed places. Gates are
//! off by default and cost one relaxed atomic load when off; tests flip
//! them to force pauses or skips. The registry is passed explicitly, never
//! global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::fatal;
use crate::util::ShutdownSignal;

pub const PAUSE_BEFORE_BATCH_COMPLETION: &str = "pause-batch-application-before-completion";
pub const PAUSE_AFTER_OPLOG_WRITES: &str = "pause-batch-application-after-oplog-writes";
pub const PAUSE_APPLY_LOOP: &str = "pause-apply-loop";
pub const HANG_BEFORE_MISSING_DOC_FETCH: &str = "hang-before-missing-document-fetch";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPointMode {
    Off,
    AlwaysOn,
    /// Fire for the next `n` evaluations, then turn off.
    Times(u64),
    /// Stay off for the next `n` evaluations, then behave as always-on.
    Skip(u64),
}

const MODE_OFF: u8 = 0;
const MODE_ALWAYS: u8 = 1;
const MODE_TIMES: u8 = 2;
const MODE_SKIP: u8 = 3;

#[derive(Debug)]
pub struct FailPoint {
    mode: AtomicU8,
    count: AtomicI64,
}

impl FailPoint {
    fn new() -> Self {
        Self {
            mode: AtomicU8::new(MODE_OFF),
            count: AtomicI64::new(0),
        }
    }

    pub fn set_mode(&self, mode: FailPointMode) {
        match mode {
            FailPointMode::Off => self.mode.store(MODE_OFF, Ordering::SeqCst),
            FailPointMode::AlwaysOn => self.mode.store(MODE_ALWAYS, Ordering::SeqCst),
            FailPointMode::Times(n) => {
                self.count.store(n as i64, Ordering::SeqCst);
                self.mode.store(MODE_TIMES, Ordering::SeqCst);
            }
            FailPointMode::Skip(n) => {
                self.count.store(n as i64, Ordering::SeqCst);
                self.mode.store(MODE_SKIP, Ordering::SeqCst);
            }
        }
    }

    /// Evaluate the gate once, consuming a count in the counted modes.
    pub fn should_fire(&self) -> bool {
        match self.mode.load(Ordering::Relaxed) {
            MODE_OFF => false,
            MODE_ALWAYS => true,
            MODE_TIMES => {
                if self.count.fetch_sub(1, Ordering::SeqCst) > 0 {
                    true
                } else {
                    self.mode.store(MODE_OFF, Ordering::SeqCst);
                    false
                }
            }
            MODE_SKIP => self.count.fetch_sub(1, Ordering::SeqCst) <= 0,
            _ => false,
        }
    }

    /// Non-consuming view, used by pause loops that poll until disabled.
    pub fn is_active(&self) -> bool {
        match self.mode.load(Ordering::Relaxed) {
            MODE_OFF => false,
            MODE_ALWAYS => true,
            MODE_TIMES => self.count.load(Ordering::SeqCst) > 0,
            MODE_SKIP => self.count.load(Ordering::SeqCst) <= 0,
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct FailPointRegistry {
    points: Mutex<HashMap<String, Arc<FailPoint>>>,
}

impl FailPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Arc<FailPoint> {
        let mut points = self.points.lock().expect("fail point registry poisoned");
        Arc::clone(
            points
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(FailPoint::new())),
        )
    }

    pub fn enable(&self, name: &str, mode: FailPointMode) {
        self.get(name).set_mode(mode);
    }

    pub fn disable(&self, name: &str) {
        self.get(name).set_mode(FailPointMode::Off);
    }

    /// Block while `name` is active. A clean-shutdown request during the
    /// pause is an operator error: tests must disable their gates before
    /// shutting down, so this aborts rather than leaving the pipeline in
    /// an intermediate state.
    pub fn pause_while_active(&self, name: &str, shutdown: &ShutdownSignal) {
        let point = self.get(name);
        if !point.is_active() {
            return;
        }
        tracing::info!(gate = name, "pause gate enabled; blocking until disabled");
        while point.is_active() {
            if shutdown.is_set() {
                fatal(40304, format!("shutdown requested while pause gate {name} is active"));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_by_default() {
        let registry = FailPointRegistry::new();
        assert!(!registry.get("anything").should_fire());
    }

    #[test]
    fn times_mode_fires_n_then_turns_off() {
        let registry = FailPointRegistry::new();
        registry.enable("gate", FailPointMode::Times(2));
        let point = registry.get("gate");
        assert!(point.should_fire());
        assert!(point.should_fire());
        assert!(!point.should_fire());
        assert!(!point.is_active());
    }

    #[test]
    fn skip_mode_suppresses_n_evaluations() {
        let registry = FailPointRegistry::new();
        registry.enable("gate", FailPointMode::Skip(2));
        let point = registry.get("gate");
        assert!(!point.should_fire());
        assert!(!point.should_fire());
        assert!(point.should_fire());
    }

    #[test]
    fn pause_returns_once_disabled() {
        let registry = Arc::new(FailPointRegistry::new());
        registry.enable("gate", FailPointMode::AlwaysOn);
        let bg = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                registry.disable("gate");
            })
        };
        registry.pause_while_active("gate", &ShutdownSignal::new());
        bg.join().expect("join");
    }
}
