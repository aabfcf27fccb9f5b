//! The secondary log application pipeline.
//!
//! A producer feeds raw entries into the [`OplogBuffer`]; the [`Batcher`]
//! drains it into bounded batches; the [`ApplyEngine`] partitions each
//! batch into per-worker lanes, persists the entries to the local log,
//! applies them in parallel, advances the consistency markers, and reports
//! progress through the [`ReplicationCoordinator`].

mod apply;
mod batcher;
mod buffer;
mod coordinator;
mod engine;
mod fetcher;
mod finalizer;
mod insert_group;
mod markers;
mod observer;
mod partition;
mod session_update;
mod txn;
mod worker;

pub use apply::{write_conflict_retry, ApplyError, ApplyMode};
pub use batcher::{BatchLimits, Batcher};
pub use buffer::OplogBuffer;
pub use coordinator::{
    ApplierState, CoordinatorError, DataConsistency, LocalCoordinator, MemberState,
    ReplicationCoordinator,
};
pub use engine::{ApplyEngine, ApplyEngineDeps, ApplyOptions};
pub use fetcher::{FetchError, SyncSourceClient};
pub use finalizer::BatchFinalizer;
pub use markers::ConsistencyMarkers;
pub use observer::{ApplyObserver, NullObserver};
pub use session_update::SessionUpdateTracker;
pub use txn::TxnChainError;
