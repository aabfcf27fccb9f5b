//! In-memory record store backing one collection.
//!
//! Records keep insertion order; capped stores evict from the front on
//! overflow. Every write carries the storage timestamp chosen by the
//! caller so replicas converge on one durable timeline.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use crate::core::{Document, Namespace, Timestamp};

use super::StorageError;

/// Size bounds for a capped store. A `None` bound is unlimited.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CapLimits {
    pub max_docs: Option<u64>,
    pub max_bytes: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    Upserted,
}

#[derive(Debug)]
struct Record {
    ts: Timestamp,
    size: usize,
    doc: Document,
}

#[derive(Debug, Default)]
struct Inner {
    records: Vec<Record>,
    bytes: usize,
}

#[derive(Debug)]
pub struct RecordStore {
    ns: Namespace,
    capped: Option<CapLimits>,
    inner: Mutex<Inner>,
    // Test hook: force the next N writes to report a conflict.
    injected_conflicts: AtomicU32,
}

impl RecordStore {
    pub fn new(ns: Namespace, capped: Option<CapLimits>) -> Self {
        Self {
            ns,
            capped,
            inner: Mutex::new(Inner::default()),
            injected_conflicts: AtomicU32::new(0),
        }
    }

    pub fn is_capped(&self) -> bool {
        self.capped.is_some()
    }

    /// Arrange for the next `n` writes to fail with a write conflict, as a
    /// concurrent user transaction would cause.
    pub fn inject_write_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> Result<(), StorageError> {
        let mut current = self.injected_conflicts.load(Ordering::SeqCst);
        while current > 0 {
            match self.injected_conflicts.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Err(StorageError::WriteConflict {
                        ns: self.ns.clone(),
                    })
                }
                Err(seen) => current = seen,
            }
        }
        Ok(())
    }

    /// Insert one document. Replay is idempotent: a record with the same
    /// `_id` is replaced in place rather than duplicated.
    pub fn insert(&self, doc: Document, ts: Timestamp) -> Result<(), StorageError> {
        self.take_conflict()?;
        let mut inner = self.inner.lock().expect("record store poisoned");
        self.insert_locked(&mut inner, doc, ts);
        Ok(())
    }

    /// Insert a run of documents as one call. The whole group conflicts or
    /// none of it does; order is preserved.
    pub fn insert_many(
        &self,
        docs: Vec<(Document, Timestamp)>,
    ) -> Result<(), StorageError> {
        self.take_conflict()?;
        let mut inner = self.inner.lock().expect("record store poisoned");
        for (doc, ts) in docs {
            self.insert_locked(&mut inner, doc, ts);
        }
        Ok(())
    }

    fn insert_locked(&self, inner: &mut Inner, doc: Document, ts: Timestamp) {
        let size = doc.encoded_len();
        if let Some(id) = doc.id() {
            if let Some(existing) = inner
                .records
                .iter_mut()
                .find(|r| r.doc.id() == Some(id))
            {
                inner.bytes = inner.bytes - existing.size + size;
                existing.doc = doc;
                existing.size = size;
                existing.ts = ts;
                return;
            }
        }
        inner.bytes += size;
        inner.records.push(Record { ts, size, doc });
        self.evict_locked(inner);
    }

    fn evict_locked(&self, inner: &mut Inner) {
        let Some(limits) = self.capped else { return };
        loop {
            let over_docs = limits
                .max_docs
                .is_some_and(|max| inner.records.len() as u64 > max);
            let over_bytes = limits
                .max_bytes
                .is_some_and(|max| inner.bytes as u64 > max);
            if !over_docs && !over_bytes {
                return;
            }
            if inner.records.is_empty() {
                return;
            }
            let evicted = inner.records.remove(0);
            inner.bytes -= evicted.size;
        }
    }

    /// Apply an update addressed by `_id`. Modifier payloads (`$set`,
    /// `$unset`, `$inc`) patch the record; anything else replaces it.
    pub fn update(
        &self,
        id: &Value,
        payload: &Document,
        ts: Timestamp,
        upsert: bool,
    ) -> Result<UpdateOutcome, StorageError> {
        self.take_conflict()?;
        let mut guard = self.inner.lock().expect("record store poisoned");
        let inner = &mut *guard;

        if let Some(record) = inner.records.iter_mut().find(|r| r.doc.id() == Some(id)) {
            let mut doc = record.doc.clone();
            apply_update_payload(&mut doc, payload, id);
            let size = doc.encoded_len();
            inner.bytes = inner.bytes - record.size + size;
            record.doc = doc;
            record.size = size;
            record.ts = ts;
            return Ok(UpdateOutcome::Updated);
        }

        if !upsert {
            return Err(StorageError::UpdateTargetMissing {
                ns: self.ns.clone(),
            });
        }

        let mut doc = Document::new();
        doc.insert("_id", id.clone());
        apply_update_payload(&mut doc, payload, id);
        self.insert_locked(inner, doc, ts);
        Ok(UpdateOutcome::Upserted)
    }

    /// Remove the record with the given `_id`. Absent targets are fine:
    /// replayed deletes must be idempotent.
    pub fn delete(&self, id: &Value) -> Result<bool, StorageError> {
        self.take_conflict()?;
        let mut inner = self.inner.lock().expect("record store poisoned");
        let Some(pos) = inner.records.iter().position(|r| r.doc.id() == Some(id)) else {
            return Ok(false);
        };
        let removed = inner.records.remove(pos);
        inner.bytes -= removed.size;
        Ok(true)
    }

    pub fn find_by_id(&self, id: &Value) -> Option<Document> {
        let inner = self.inner.lock().expect("record store poisoned");
        inner
            .records
            .iter()
            .find(|r| r.doc.id() == Some(id))
            .map(|r| r.doc.clone())
    }

    /// All documents in insertion order.
    pub fn all_docs(&self) -> Vec<Document> {
        let inner = self.inner.lock().expect("record store poisoned");
        inner.records.iter().map(|r| r.doc.clone()).collect()
    }

    /// As `all_docs`, with each record's storage timestamp.
    pub fn all_with_timestamps(&self) -> Vec<(Timestamp, Document)> {
        let inner = self.inner.lock().expect("record store poisoned");
        inner
            .records
            .iter()
            .map(|r| (r.ts, r.doc.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("record store poisoned").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().expect("record store poisoned").bytes
    }
}

fn apply_update_payload(doc: &mut Document, payload: &Document, id: &Value) {
    let is_modifier = payload
        .first_field()
        .is_some_and(|field| field.starts_with('$'));
    if !is_modifier {
        let mut replacement = payload.clone();
        replacement.0.insert("_id".to_string(), id.clone());
        *doc = replacement;
        return;
    }

    for (operator, fields) in &payload.0 {
        let Value::Object(fields) = fields else { continue };
        match operator.as_str() {
            "$set" => {
                for (field, value) in fields {
                    doc.insert(field.clone(), value.clone());
                }
            }
            "$unset" => {
                for field in fields.keys() {
                    doc.remove(field);
                }
            }
            "$inc" => {
                for (field, delta) in fields {
                    let delta = delta.as_i64().unwrap_or(0);
                    let current = doc.get(field).and_then(Value::as_i64).unwrap_or(0);
                    doc.insert(field.clone(), Value::from(current + delta));
                }
            }
            other => {
                tracing::warn!(operator = other, "ignoring unsupported update operator");
            }
        }
    }
}
