//! Storage engine contract and the in-memory engine.
//!
//! The replication pipeline only ever talks to [`StorageEngine`]; the
//! in-memory implementation backs the tests and single-process embedders.
//! A journaled engine plugs in behind the same trait.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;

use crate::core::{Document, Namespace, Timestamp};

use super::{StampedMultikeyUpdate, StorageError};

/// One raw entry headed for the local log, with its position. Entries may
/// arrive out of order across writer jobs; the log orders by timestamp.
#[derive(Clone, Debug)]
pub struct OplogInsert {
    pub raw: Bytes,
    pub ts: Timestamp,
    pub term: i64,
}

pub trait StorageEngine: Send + Sync {
    /// Whether the engine locks at document granularity. Gates intra-
    /// collection parallelism and parallel log writes.
    fn supports_doc_locking(&self) -> bool;

    /// Whether collection drops are deferred until checkpoint.
    fn supports_pending_drops(&self) -> bool;

    /// Whether commits reach a journal. Selects the batch finalizer
    /// variant.
    fn is_durable(&self) -> bool;

    /// Whether all state lives in memory. Disables idle handle sweeping.
    fn is_ephemeral(&self) -> bool;

    /// Append raw entries to the local log at their timestamps.
    fn insert_oplog_documents(&self, docs: Vec<OplogInsert>) -> Result<(), StorageError>;

    /// Advance log visibility: everything at or before `ts` may now be
    /// served to readers. `ordered_commit` asserts the caller wrote in
    /// timestamp order.
    fn oplog_disk_loc_register(&self, ts: Timestamp, ordered_commit: bool);

    /// Fetch the raw log entry at exactly `ts`, if present.
    fn read_oplog_at(&self, ts: Timestamp) -> Option<Bytes>;

    /// Replace the single document stored under `ns`. Used for the durable
    /// consistency markers.
    fn upsert_singleton(&self, ns: &Namespace, doc: Document) -> Result<(), StorageError>;

    fn read_singleton(&self, ns: &Namespace) -> Result<Option<Document>, StorageError>;

    /// Persist a deferred multikey transition at `ts`.
    fn set_index_is_multikey(
        &self,
        ns: &Namespace,
        index: &str,
        paths: &[String],
        ts: Timestamp,
    ) -> Result<(), StorageError>;

    /// Timestamp the engine recovered to at startup, if it checkpoints.
    fn get_recovery_timestamp(&self) -> Option<Timestamp>;

    /// Block until everything committed so far is journaled.
    fn wait_until_durable(&self);

    /// All writes for the current replication batch are finished; no new
    /// writes with those timestamps will appear.
    fn replication_batch_is_complete(&self);
}

#[derive(Clone, Copy, Debug)]
pub struct MemEngineOptions {
    pub durable: bool,
    pub doc_locking: bool,
    pub pending_drops: bool,
}

impl Default for MemEngineOptions {
    fn default() -> Self {
        Self {
            durable: true,
            doc_locking: true,
            pending_drops: false,
        }
    }
}

#[derive(Debug)]
struct OplogRecord {
    term: i64,
    raw: Bytes,
}

/// Everything-in-memory engine. Trivially durable: `wait_until_durable`
/// returns immediately.
#[derive(Debug, Default)]
pub struct MemEngine {
    options: MemEngineOptions,
    oplog: Mutex<BTreeMap<Timestamp, OplogRecord>>,
    visibility: Mutex<Vec<(Timestamp, bool)>>,
    singletons: Mutex<HashMap<Namespace, Document>>,
    multikey: Mutex<Vec<StampedMultikeyUpdate>>,
    recovery_timestamp: Mutex<Option<Timestamp>>,
    batch_completions: AtomicU64,
}

impl MemEngine {
    pub fn new(options: MemEngineOptions) -> Self {
        Self {
            options,
            ..Default::default()
        }
    }

    pub fn set_recovery_timestamp(&self, ts: Timestamp) {
        *self
            .recovery_timestamp
            .lock()
            .expect("recovery timestamp poisoned") = Some(ts);
    }

    /// Raw log contents in timestamp order.
    pub fn oplog_entries(&self) -> Vec<Bytes> {
        let oplog = self.oplog.lock().expect("oplog poisoned");
        oplog.values().map(|r| r.raw.clone()).collect()
    }

    pub fn oplog_len(&self) -> usize {
        self.oplog.lock().expect("oplog poisoned").len()
    }

    /// Every visibility registration in call order.
    pub fn visibility_registrations(&self) -> Vec<(Timestamp, bool)> {
        self.visibility.lock().expect("visibility poisoned").clone()
    }

    pub fn visible_through(&self) -> Option<Timestamp> {
        self.visibility
            .lock()
            .expect("visibility poisoned")
            .last()
            .map(|(ts, _)| *ts)
    }

    pub fn multikey_updates(&self) -> Vec<StampedMultikeyUpdate> {
        self.multikey.lock().expect("multikey poisoned").clone()
    }

    pub fn batch_completions(&self) -> u64 {
        self.batch_completions.load(Ordering::SeqCst)
    }
}

impl StorageEngine for MemEngine {
    fn supports_doc_locking(&self) -> bool {
        self.options.doc_locking
    }

    fn supports_pending_drops(&self) -> bool {
        self.options.pending_drops
    }

    fn is_durable(&self) -> bool {
        self.options.durable
    }

    fn is_ephemeral(&self) -> bool {
        true
    }

    fn insert_oplog_documents(&self, docs: Vec<OplogInsert>) -> Result<(), StorageError> {
        let mut oplog = self.oplog.lock().expect("oplog poisoned");
        for doc in docs {
            oplog.insert(
                doc.ts,
                OplogRecord {
                    term: doc.term,
                    raw: doc.raw,
                },
            );
        }
        Ok(())
    }

    fn oplog_disk_loc_register(&self, ts: Timestamp, ordered_commit: bool) {
        self.visibility
            .lock()
            .expect("visibility poisoned")
            .push((ts, ordered_commit));
    }

    fn read_oplog_at(&self, ts: Timestamp) -> Option<Bytes> {
        let oplog = self.oplog.lock().expect("oplog poisoned");
        oplog.get(&ts).map(|r| r.raw.clone())
    }

    fn upsert_singleton(&self, ns: &Namespace, doc: Document) -> Result<(), StorageError> {
        self.singletons
            .lock()
            .expect("singletons poisoned")
            .insert(ns.clone(), doc);
        Ok(())
    }

    fn read_singleton(&self, ns: &Namespace) -> Result<Option<Document>, StorageError> {
        Ok(self
            .singletons
            .lock()
            .expect("singletons poisoned")
            .get(ns)
            .cloned())
    }

    fn set_index_is_multikey(
        &self,
        ns: &Namespace,
        index: &str,
        paths: &[String],
        ts: Timestamp,
    ) -> Result<(), StorageError> {
        self.multikey
            .lock()
            .expect("multikey poisoned")
            .push(StampedMultikeyUpdate {
                update: super::MultikeyUpdate {
                    ns: ns.clone(),
                    index: index.to_string(),
                    paths: paths.to_vec(),
                },
                ts,
            });
        Ok(())
    }

    fn get_recovery_timestamp(&self) -> Option<Timestamp> {
        *self
            .recovery_timestamp
            .lock()
            .expect("recovery timestamp poisoned")
    }

    fn wait_until_durable(&self) {}

    fn replication_batch_is_complete(&self) {
        self.batch_completions.fetch_add(1, Ordering::SeqCst);
    }
}
