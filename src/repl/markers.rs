//! Durable replication consistency markers.
//!
//! Three scalars persisted through the storage engine's durable path:
//! `appliedThrough` (replay resumes after this on crash recovery),
//! `minValid` (upper bound of the known-inconsistent window) and
//! `oplogTruncateAfterPoint` (log tail to cut before recovery). The
//! pipeline driver is the single writer.

use std::sync::Arc;

use serde_json::Value;

use crate::core::{Document, Namespace, OpTime, Timestamp};
use crate::storage::{StorageEngine, StorageError};

#[derive(Clone)]
pub struct ConsistencyMarkers {
    engine: Arc<dyn StorageEngine>,
}

impl ConsistencyMarkers {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }

    pub fn min_valid(&self) -> Result<OpTime, StorageError> {
        self.read_optime(&Namespace::min_valid())
    }

    pub fn set_min_valid(&self, optime: OpTime) -> Result<(), StorageError> {
        self.write_optime(&Namespace::min_valid(), optime)
    }

    /// Raise `minValid` to at least `optime`; never lowers it.
    pub fn set_min_valid_to_at_least(&self, optime: OpTime) -> Result<(), StorageError> {
        let current = self.min_valid()?;
        if optime > current {
            self.set_min_valid(optime)?;
        }
        Ok(())
    }

    pub fn applied_through(&self) -> Result<OpTime, StorageError> {
        self.read_optime(&Namespace::applied_through())
    }

    pub fn set_applied_through(&self, optime: OpTime) -> Result<(), StorageError> {
        self.write_optime(&Namespace::applied_through(), optime)
    }

    pub fn oplog_truncate_after_point(&self) -> Result<Timestamp, StorageError> {
        let ns = Namespace::oplog_truncate_after_point();
        let Some(doc) = self.engine.read_singleton(&ns)? else {
            return Ok(Timestamp::NULL);
        };
        Ok(doc
            .get("ts")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(Timestamp::NULL))
    }

    /// A non-null point marks the log suffix as possibly missing its
    /// database writes; recovery truncates it. Cleared (set null) once the
    /// batch's log writes are all in.
    pub fn set_oplog_truncate_after_point(&self, ts: Timestamp) -> Result<(), StorageError> {
        let mut doc = Document::new();
        doc.insert(
            "ts",
            serde_json::to_value(ts).expect("timestamp encoding is infallible"),
        );
        self.engine
            .upsert_singleton(&Namespace::oplog_truncate_after_point(), doc)
    }

    fn read_optime(&self, ns: &Namespace) -> Result<OpTime, StorageError> {
        let Some(doc) = self.engine.read_singleton(ns)? else {
            return Ok(OpTime::NULL);
        };
        Ok(serde_json::from_value(Value::Object(doc.0)).unwrap_or(OpTime::NULL))
    }

    fn write_optime(&self, ns: &Namespace, optime: OpTime) -> Result<(), StorageError> {
        let value = serde_json::to_value(optime).expect("optime encoding is infallible");
        let doc = match value {
            Value::Object(map) => Document(map),
            _ => Document::new(),
        };
        self.engine.upsert_singleton(ns, doc)
    }
}
