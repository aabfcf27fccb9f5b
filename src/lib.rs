#![forbid(unsafe_code)]

//! Core engine of a replicated, document-oriented database: the secondary
//! log application pipeline (batching, lane partitioning, parallel apply,
//! consistency markers, member-state transitions) and the storage-engine
//! handle sweeper that ages out idle data handles underneath it.

pub mod catalog;
pub mod config;
pub mod core;
pub mod error;
pub mod failpoint;
pub mod metrics;
pub mod repl;
pub mod storage;
pub mod telemetry;
mod util;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::core::{
    CommandKind, Document, EntryParseError, Namespace, NamespaceError, OpEntry, OpQueue, OpTime,
    OpTimeAndWall, OpType, SessionId, Timestamp, OPLOG_VERSION,
};
pub use crate::util::ShutdownSignal;
