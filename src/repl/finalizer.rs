//! Batch finalization: publishing applied/durable progress.
//!
//! Two variants chosen at startup by storage durability. The immediate
//! variant publishes both marks inline. The durable variant publishes
//! `lastApplied` inline and hands `lastDurable` to a waiter thread that
//! blocks on the journal before advancing it.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::core::OpTimeAndWall;
use crate::storage::StorageEngine;

use super::coordinator::{DataConsistency, ReplicationCoordinator};

pub enum BatchFinalizer {
    Immediate {
        coordinator: Arc<dyn ReplicationCoordinator>,
    },
    Durable(DurableFinalizer),
}

impl BatchFinalizer {
    pub fn for_engine(
        coordinator: Arc<dyn ReplicationCoordinator>,
        engine: Arc<dyn StorageEngine>,
    ) -> Self {
        if engine.is_durable() {
            BatchFinalizer::Durable(DurableFinalizer::spawn(coordinator, engine))
        } else {
            BatchFinalizer::Immediate { coordinator }
        }
    }

    /// Record a batch's final optime. Forward-only in both variants.
    pub fn record(&self, opt: OpTimeAndWall, consistency: DataConsistency) {
        match self {
            BatchFinalizer::Immediate { coordinator } => {
                coordinator.set_last_applied_forward(opt, consistency);
                // Without a journal, applied is as durable as it gets.
                coordinator.set_last_durable_forward(opt);
            }
            BatchFinalizer::Durable(durable) => durable.record(opt, consistency),
        }
    }

    pub fn shutdown(self) {
        if let BatchFinalizer::Durable(durable) = self {
            durable.shutdown();
        }
    }
}

#[derive(Default)]
struct WaiterState {
    latest: Option<OpTimeAndWall>,
    shutdown: bool,
}

struct WaiterShared {
    state: Mutex<WaiterState>,
    cond: Condvar,
}

pub struct DurableFinalizer {
    coordinator: Arc<dyn ReplicationCoordinator>,
    shared: Arc<WaiterShared>,
    waiter: Option<JoinHandle<()>>,
}

impl DurableFinalizer {
    fn spawn(
        coordinator: Arc<dyn ReplicationCoordinator>,
        engine: Arc<dyn StorageEngine>,
    ) -> Self {
        let shared = Arc::new(WaiterShared {
            state: Mutex::new(WaiterState::default()),
            cond: Condvar::new(),
        });
        let waiter = {
            let shared = Arc::clone(&shared);
            let coordinator = Arc::clone(&coordinator);
            std::thread::Builder::new()
                .name("journal-finalizer".into())
                .spawn(move || loop {
                    let latest = {
                        let mut state = shared.state.lock().expect("finalizer state poisoned");
                        while state.latest.is_none() && !state.shutdown {
                            state = shared
                                .cond
                                .wait(state)
                                .expect("finalizer state poisoned");
                        }
                        if state.shutdown {
                            return;
                        }
                        state.latest.take().expect("latest present after wait")
                    };
                    engine.wait_until_durable();
                    coordinator.set_last_durable_forward(latest);
                })
                .expect("spawn journal finalizer")
        };
        Self {
            coordinator,
            shared,
            waiter: Some(waiter),
        }
    }

    fn record(&self, opt: OpTimeAndWall, consistency: DataConsistency) {
        self.coordinator.set_last_applied_forward(opt, consistency);
        let mut state = self.shared.state.lock().expect("finalizer state poisoned");
        // Overwriting an unconsumed value is fine: durability waits are
        // cumulative, the newest optime covers the older ones.
        state.latest = Some(opt);
        self.shared.cond.notify_all();
    }

    fn shutdown(mut self) {
        self.signal_shutdown();
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.join();
        }
    }

    fn signal_shutdown(&self) {
        let mut state = self.shared.state.lock().expect("finalizer state poisoned");
        state.shutdown = true;
        self.shared.cond.notify_all();
    }
}

impl Drop for DurableFinalizer {
    fn drop(&mut self) {
        self.signal_shutdown();
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{OpTime, Timestamp};
    use crate::repl::coordinator::LocalCoordinator;
    use crate::storage::{MemEngine, MemEngineOptions};
    use std::time::{Duration, Instant, UNIX_EPOCH};

    fn at(secs: u32) -> OpTimeAndWall {
        OpTimeAndWall::new(OpTime::new(Timestamp::new(secs, 0), 1), UNIX_EPOCH)
    }

    fn wait_for_durable(coord: &LocalCoordinator, secs: u32) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while coord.last_durable().optime.ts.secs != secs {
            assert!(Instant::now() < deadline, "durable mark never advanced");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn immediate_variant_publishes_both_marks() {
        let coord = Arc::new(LocalCoordinator::recovering());
        let engine = Arc::new(MemEngine::new(MemEngineOptions {
            durable: false,
            ..Default::default()
        }));
        let finalizer = BatchFinalizer::for_engine(
            Arc::clone(&coord) as _,
            engine as Arc<dyn StorageEngine>,
        );
        assert!(matches!(finalizer, BatchFinalizer::Immediate { .. }));

        finalizer.record(at(10), DataConsistency::Consistent);
        assert_eq!(coord.last_applied().optime.ts.secs, 10);
        assert_eq!(coord.last_durable().optime.ts.secs, 10);
        finalizer.shutdown();
    }

    #[test]
    fn durable_variant_advances_durable_from_the_waiter() {
        let coord = Arc::new(LocalCoordinator::recovering());
        let engine = Arc::new(MemEngine::new(MemEngineOptions::default()));
        let finalizer = BatchFinalizer::for_engine(
            Arc::clone(&coord) as _,
            engine as Arc<dyn StorageEngine>,
        );
        assert!(matches!(finalizer, BatchFinalizer::Durable(_)));

        finalizer.record(at(10), DataConsistency::Consistent);
        assert_eq!(coord.last_applied().optime.ts.secs, 10);
        wait_for_durable(&coord, 10);

        finalizer.record(at(11), DataConsistency::Consistent);
        wait_for_durable(&coord, 11);
        finalizer.shutdown();
    }

    #[test]
    fn shutdown_joins_the_waiter_cleanly() {
        let coord = Arc::new(LocalCoordinator::recovering());
        let engine = Arc::new(MemEngine::new(MemEngineOptions::default()));
        let finalizer = BatchFinalizer::for_engine(
            Arc::clone(&coord) as _,
            engine as Arc<dyn StorageEngine>,
        );
        // No records at all; shutdown must not hang.
        finalizer.shutdown();
    }
}
