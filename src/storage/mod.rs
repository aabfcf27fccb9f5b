//! Storage layer: the engine contract, record stores, and the data-handle
//! sweeper.

mod engine;
mod handle;
mod lookaside;
mod record_store;
mod sweeper;

use thiserror::Error;

use crate::core::{Namespace, Timestamp};

pub use engine::{MemEngine, MemEngineOptions, OplogInsert, StorageEngine};
pub use handle::{DataHandle, HandleList, HandleType, TxnVisibility};
pub use lookaside::Lookaside;
pub use record_store::{CapLimits, RecordStore, UpdateOutcome};
pub use sweeper::{SweepClock, SweepServer, Sweeper, SystemClock, LOOKASIDE_SWEEP_SECS};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Transient: the write raced a concurrent transaction. Callers retry
    /// with a fresh snapshot.
    #[error("write conflict on {ns}")]
    WriteConflict { ns: Namespace },

    /// The update's target document does not exist and upsert was off.
    #[error("update target missing in {ns}")]
    UpdateTargetMissing { ns: Namespace },

    /// An update or delete without an `_id` to address.
    #[error("operation on {ns} carries no _id")]
    MissingId { ns: Namespace },
}

/// A deferred index multikey transition recorded during batch application
/// and persisted at a safe timestamp once the batch completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultikeyUpdate {
    pub ns: Namespace,
    pub index: String,
    pub paths: Vec<String>,
}

/// As `MultikeyUpdate` but stamped, the form the engine persists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StampedMultikeyUpdate {
    pub update: MultikeyUpdate,
    pub ts: Timestamp,
}
