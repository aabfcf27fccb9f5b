//! Shared builders for the pipeline integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use nacre::catalog::{Catalog, Collection, CollectionOptions};
use nacre::config::ApplyConfig;
use nacre::core::{Document, Namespace, OpEntry, OpTime, Timestamp};
use nacre::failpoint::FailPointRegistry;
use nacre::metrics::Metrics;
use nacre::repl::{
    ApplyEngine, ApplyEngineDeps, ApplyOptions, LocalCoordinator, NullObserver, OplogBuffer,
    ReplicationCoordinator,
};
use nacre::storage::{MemEngine, MemEngineOptions, StorageEngine};

pub const WRITERS: usize = 4;

pub struct Harness {
    pub catalog: Arc<Catalog>,
    pub mem: Arc<MemEngine>,
    pub coordinator: Arc<LocalCoordinator>,
    pub metrics: Arc<Metrics>,
    pub fail_points: Arc<FailPointRegistry>,
    pub engine: Arc<ApplyEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(MemEngineOptions::default(), ApplyOptions::default())
    }

    pub fn recovering_replay() -> Self {
        Self::build(
            MemEngineOptions::default(),
            ApplyOptions {
                skip_writes_to_oplog: true,
                allow_namespace_not_found_on_crud: true,
                ..Default::default()
            },
        )
    }

    pub fn build(mem_options: MemEngineOptions, options: ApplyOptions) -> Self {
        let catalog = Arc::new(Catalog::new());
        let mem = Arc::new(MemEngine::new(mem_options));
        let coordinator = Arc::new(LocalCoordinator::recovering());
        let metrics = Arc::new(Metrics::new());
        let fail_points = Arc::new(FailPointRegistry::new());
        let engine = Arc::new(ApplyEngine::new(ApplyEngineDeps {
            catalog: Arc::clone(&catalog),
            engine: Arc::clone(&mem) as Arc<dyn StorageEngine>,
            coordinator: Arc::clone(&coordinator) as _,
            observer: Arc::new(NullObserver),
            metrics: Arc::clone(&metrics),
            fail_points: Arc::clone(&fail_points),
            config: ApplyConfig {
                writer_threads: WRITERS,
                ..Default::default()
            },
            options,
        }));
        Self {
            catalog,
            mem,
            coordinator,
            metrics,
            fail_points,
            engine,
        }
    }

    pub fn create_collection(&self, ns: &str, options: CollectionOptions) -> Arc<Collection> {
        self.catalog
            .create_collection(Namespace::parse(ns).expect("namespace"), None, options)
            .expect("create collection")
    }

    pub fn collection(&self, ns: &str) -> Arc<Collection> {
        self.catalog
            .collection(&Namespace::parse(ns).expect("namespace"))
            .expect("collection exists")
    }

    /// Start the apply loop on its own thread against `buffer`.
    pub fn start(&self, buffer: Arc<OplogBuffer>) -> std::thread::JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        std::thread::Builder::new()
            .name("apply-loop".into())
            .spawn(move || engine.run(buffer))
            .expect("spawn apply loop")
    }

    /// Signal shutdown and join the apply loop.
    pub fn stop(&self, buffer: &OplogBuffer, handle: std::thread::JoinHandle<()>) {
        self.engine.shutdown_signal().set();
        buffer.begin_drain();
        handle.join().expect("apply loop panicked");
    }

    /// Block until the coordinator advertises `optime` as applied.
    pub fn wait_for_applied(&self, optime: OpTime) {
        wait_until(
            || self.coordinator.last_applied().optime >= optime,
            &format!("lastApplied never reached {optime}"),
        );
    }
}

pub fn wait_until(mut check: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out: {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn entry(value: Value) -> OpEntry {
    OpEntry::from_document(Document(
        value.as_object().expect("entry literal is an object").clone(),
    ))
    .expect("valid entry")
}

pub fn insert_at(secs: u32, ns: &str, id: i64) -> OpEntry {
    entry(json!({
        "ts": {"secs": secs, "inc": 0},
        "t": 1,
        "v": 2,
        "op": "i",
        "ns": ns,
        "o": {"_id": id, "payload": format!("doc-{id}")},
        "wall": u64::from(secs) * 1000,
    }))
}

pub fn update_at(secs: u32, ns: &str, id: i64, set: Value) -> OpEntry {
    entry(json!({
        "ts": {"secs": secs, "inc": 0},
        "t": 1,
        "v": 2,
        "op": "u",
        "ns": ns,
        "o": {"$set": set},
        "o2": {"_id": id},
        "wall": u64::from(secs) * 1000,
    }))
}

pub fn txn_insert_at(
    secs: u32,
    ns: &str,
    id: i64,
    session: &str,
    txn_number: i64,
    prev_secs: u32,
) -> OpEntry {
    entry(json!({
        "ts": {"secs": secs, "inc": 0},
        "t": 1,
        "v": 2,
        "op": "i",
        "ns": ns,
        "o": {"_id": id},
        "wall": u64::from(secs) * 1000,
        "lsid": {"id": session},
        "txnNumber": txn_number,
        "partialTxn": true,
        "prevOpTime": prev_optime(prev_secs),
    }))
}

pub fn commit_at(secs: u32, session: &str, txn_number: i64, prev_secs: u32) -> OpEntry {
    entry(json!({
        "ts": {"secs": secs, "inc": 0},
        "t": 1,
        "v": 2,
        "op": "c",
        "ns": "admin.$cmd",
        "o": {"commitTransaction": 1, "prepared": false},
        "wall": u64::from(secs) * 1000,
        "lsid": {"id": session},
        "txnNumber": txn_number,
        "prevOpTime": prev_optime(prev_secs),
    }))
}

fn prev_optime(prev_secs: u32) -> Value {
    if prev_secs == 0 {
        json!({"ts": {"secs": 0, "inc": 0}, "t": -1})
    } else {
        json!({"ts": {"secs": prev_secs, "inc": 0}, "t": 1})
    }
}

pub fn optime(secs: u32) -> OpTime {
    OpTime::new(Timestamp::new(secs, 0), 1)
}

pub fn push_entries(buffer: &OplogBuffer, entries: &[OpEntry]) {
    for e in entries {
        assert!(buffer.push(e.raw().clone()), "buffer rejected entry");
    }
}

pub fn doc_ids(collection: &Collection) -> Vec<i64> {
    collection
        .records()
        .all_docs()
        .iter()
        .map(|d| d.id().and_then(Value::as_i64).expect("numeric _id"))
        .collect()
}
