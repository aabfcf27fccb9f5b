//! Layer 0: shared primitives.
//!
//! Optimes, namespaces, documents, parsed log entries and the batch queue.
//! Everything above (catalog, storage, replication) builds on these types.

mod document;
mod entry;
mod namespace;
mod optime;
mod queue;
mod session;

pub use document::Document;
pub use entry::{CommandKind, EntryParseError, OpEntry, OpType, OPLOG_VERSION};
pub use namespace::{Namespace, NamespaceError};
pub use optime::{OpTime, OpTimeAndWall, Timestamp};
pub use queue::OpQueue;
pub use session::SessionId;
