//! Live collection objects.

use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::{Document, Namespace, Timestamp};
use crate::storage::{CapLimits, MultikeyUpdate, RecordStore};

/// Comparison rules for a collection. Besides matching, the collation
/// defines the key used when hashing `_id` values for lane assignment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collation {
    #[default]
    Binary,
    CaseInsensitive,
}

impl Collation {
    pub fn key_for(&self, value: &Value) -> String {
        let raw = value.to_string();
        match self {
            Collation::Binary => raw,
            Collation::CaseInsensitive => raw.to_lowercase(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionOptions {
    pub capped: bool,
    pub capped_max_docs: Option<u64>,
    pub capped_max_bytes: Option<u64>,
    pub collation: Collation,
}

impl CollectionOptions {
    pub fn capped_with_max_docs(max_docs: u64) -> Self {
        Self {
            capped: true,
            capped_max_docs: Some(max_docs),
            ..Default::default()
        }
    }

    /// Options as they appear in a `create` command payload.
    pub fn from_create_payload(payload: &Document) -> Self {
        let capped = matches!(payload.get("capped"), Some(Value::Bool(true)));
        let capped_max_docs = payload.get("max").and_then(Value::as_u64);
        let capped_max_bytes = payload.get("size").and_then(Value::as_u64);
        let collation = match payload.get("collation").and_then(|v| v.get("locale")) {
            Some(Value::String(locale)) if locale != "simple" => Collation::CaseInsensitive,
            _ => Collation::Binary,
        };
        Self {
            capped,
            capped_max_docs,
            capped_max_bytes,
            collation,
        }
    }

    pub fn cap_limits(&self) -> Option<CapLimits> {
        if !self.capped {
            return None;
        }
        Some(CapLimits {
            max_docs: self.capped_max_docs,
            max_bytes: self.capped_max_bytes,
        })
    }
}

/// One secondary index. Key paths map field name to direction; multikey is
/// set once an indexed path has held an array value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub key: Document,
    #[serde(default)]
    pub multikey: bool,
    #[serde(default)]
    pub multikey_paths: Vec<String>,
}

/// A live collection. Exactly one exists per UUID; the catalog owns it and
/// everything else refers to it by UUID.
#[derive(Debug)]
pub struct Collection {
    uuid: Uuid,
    ns: RwLock<Namespace>,
    options: CollectionOptions,
    records: RecordStore,
    indexes: Mutex<Vec<IndexSpec>>,
    min_visible: Mutex<Option<Timestamp>>,
}

impl Collection {
    pub fn new(ns: Namespace, uuid: Uuid, options: CollectionOptions) -> Arc<Self> {
        let records = RecordStore::new(ns.clone(), options.cap_limits());
        Arc::new(Self {
            uuid,
            ns: RwLock::new(ns),
            options,
            records,
            indexes: Mutex::new(Vec::new()),
            min_visible: Mutex::new(None),
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn ns(&self) -> Namespace {
        self.ns.read().expect("collection ns poisoned").clone()
    }

    pub(crate) fn set_ns(&self, ns: Namespace) {
        *self.ns.write().expect("collection ns poisoned") = ns;
    }

    pub fn options(&self) -> &CollectionOptions {
        &self.options
    }

    pub fn is_capped(&self) -> bool {
        self.options.capped
    }

    pub fn default_collation(&self) -> Collation {
        self.options.collation
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn create_index(&self, spec: IndexSpec) {
        let mut indexes = self.indexes.lock().expect("index catalog poisoned");
        if indexes.iter().any(|i| i.name == spec.name) {
            return;
        }
        indexes.push(spec);
    }

    pub fn drop_index(&self, name: &str) -> bool {
        let mut indexes = self.indexes.lock().expect("index catalog poisoned");
        let before = indexes.len();
        indexes.retain(|i| i.name != name);
        indexes.len() != before
    }

    pub fn indexes(&self) -> Vec<IndexSpec> {
        self.indexes.lock().expect("index catalog poisoned").clone()
    }

    /// Mark an index multikey locally once the transition is persisted.
    pub fn set_index_multikey(&self, name: &str, paths: &[String]) {
        let mut indexes = self.indexes.lock().expect("index catalog poisoned");
        if let Some(index) = indexes.iter_mut().find(|i| i.name == name) {
            index.multikey = true;
            for path in paths {
                if !index.multikey_paths.contains(path) {
                    index.multikey_paths.push(path.clone());
                }
            }
        }
    }

    /// Indexed array paths this document would introduce, for indexes not
    /// yet marked multikey. The caller batches these and persists them at
    /// a safe timestamp.
    pub fn pending_multikey(&self, doc: &Document) -> Vec<MultikeyUpdate> {
        let indexes = self.indexes.lock().expect("index catalog poisoned");
        let ns = self.ns();
        let mut out = Vec::new();
        for index in indexes.iter().filter(|i| !i.multikey) {
            let paths: Vec<String> = index
                .key
                .0
                .keys()
                .filter(|field| matches!(doc.get(field), Some(Value::Array(_))))
                .cloned()
                .collect();
            if !paths.is_empty() {
                out.push(MultikeyUpdate {
                    ns: ns.clone(),
                    index: index.name.clone(),
                    paths,
                });
            }
        }
        out
    }

    /// Earliest timestamp at which this collection may be read; set when
    /// catalog changes land mid-batch.
    pub fn min_visible(&self) -> Option<Timestamp> {
        *self.min_visible.lock().expect("min visible poisoned")
    }

    pub fn set_min_visible(&self, ts: Timestamp) {
        let mut min_visible = self.min_visible.lock().expect("min visible poisoned");
        if min_visible.is_none_or(|current| current < ts) {
            *min_visible = Some(ts);
        }
    }
}
