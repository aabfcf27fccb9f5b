//! Application of a single log entry.
//!
//! The worker loop calls [`apply_entry`] for everything it cannot group.
//! CRUD resolves the collection (by UUID when the entry has one), takes
//! the database lock shared (exclusive for `system.views`), and writes at
//! the entry's timestamp. Commands dispatch on their subtype. Write
//! conflicts are retried here; which errors are tolerated depends on the
//! application mode.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;

use crate::catalog::{Catalog, CatalogError, CollectionOptions, IndexSpec, ViewDefinition};
use crate::config::ApplyConfig;
use crate::core::{
    CommandKind, Document, EntryParseError, Namespace, OpEntry, OpTime, OpType,
};
use crate::failpoint::FailPointRegistry;
use crate::metrics::Metrics;
use crate::storage::{MultikeyUpdate, StorageEngine, StorageError};
use crate::util::ShutdownSignal;

use super::fetcher::FetchError;
use super::observer::ApplyObserver;
use super::txn::TxnChainError;

/// How the pipeline is being driven, which decides error tolerance and
/// update-to-upsert conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyMode {
    /// Steady-state batch application on a secondary.
    Secondary,
    /// Initial sync: cloning may race the log, so missing namespaces are
    /// tolerated and missing update targets are fetched from the source.
    InitialSync,
    /// Startup replay from a checkpoint toward `minValid`.
    Recovering,
    /// Direct `applyOps` command execution on a primary.
    ApplyOpsCmd,
}

impl ApplyMode {
    /// Replaying an update after the delete that followed it must not
    /// error, so updates upsert — except in initial sync, where the
    /// missing document is fetched instead.
    pub fn convert_update_to_upsert(self) -> bool {
        !matches!(self, ApplyMode::InitialSync)
    }

    /// Whether a vanished namespace is survivable for CRUD in this mode.
    /// Storage does not wait for drops to checkpoint, so replay can see
    /// writes to collections that are already gone.
    pub fn tolerate_namespace_not_found(self) -> bool {
        matches!(self, ApplyMode::InitialSync | ApplyMode::Recovering)
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Entry(#[from] EntryParseError),
    #[error(transparent)]
    TxnChain(#[from] TxnChainError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unsupported command {name:?} at {optime}")]
    UnsupportedCommand { optime: OpTime, name: String },
    #[error("transaction control command rejected in applyOps mode")]
    TxnCommandInApplyOps,
    #[error("malformed applyOps payload: {reason}")]
    MalformedApplyOps { reason: String },
    #[error("cannot apply operations while primary")]
    CannotApplyWhilePrimary,
    #[error("empty batch handed to the applier")]
    EmptyBatch,
}

impl ApplyError {
    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            ApplyError::Storage(StorageError::WriteConflict { .. })
        )
    }

    pub fn is_namespace_not_found(&self) -> bool {
        matches!(self, ApplyError::Catalog(err) if err.is_namespace_not_found())
    }

    pub fn is_update_target_missing(&self) -> bool {
        matches!(
            self,
            ApplyError::Storage(StorageError::UpdateTargetMissing { .. })
        )
    }
}

/// Everything a worker needs to apply ops, shared across the pool.
pub(crate) struct ApplyContext {
    pub catalog: Arc<Catalog>,
    pub engine: Arc<dyn StorageEngine>,
    pub observer: Arc<dyn ApplyObserver>,
    pub metrics: Arc<Metrics>,
    pub fail_points: Arc<FailPointRegistry>,
    pub config: ApplyConfig,
    pub shutdown: ShutdownSignal,
}

/// Run `f` until it stops returning write conflicts. Conflicts abandon the
/// snapshot and retry; anything else propagates.
pub fn write_conflict_retry<T>(
    metrics: &Metrics,
    op_name: &str,
    ns: &Namespace,
    mut f: impl FnMut() -> Result<T, ApplyError>,
) -> Result<T, ApplyError> {
    loop {
        match f() {
            Err(err) if err.is_write_conflict() => {
                metrics.write_conflict_retries.incr();
                tracing::debug!(%ns, op = op_name, "write conflict, retrying");
            }
            other => return other,
        }
    }
}

/// Apply one entry in `mode`. Multikey transitions discovered along the
/// way are pushed to `multikey` for the batch driver to persist.
pub(crate) fn apply_entry(
    ctx: &ApplyContext,
    entry: &OpEntry,
    mode: ApplyMode,
    multikey: &mut Vec<MultikeyUpdate>,
) -> Result<(), ApplyError> {
    let started = Instant::now();
    let result = match entry.op_type() {
        OpType::Noop => apply_noop(ctx, entry),
        OpType::Insert | OpType::Update | OpType::Delete => {
            write_conflict_retry(&ctx.metrics, "apply-crud", entry.ns(), || {
                apply_crud(ctx, entry, mode, multikey)
            })
        }
        OpType::Command => write_conflict_retry(&ctx.metrics, "apply-command", entry.ns(), || {
            apply_command(ctx, entry, mode, multikey)
        }),
    };

    if result.is_ok() {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if elapsed_ms > ctx.config.slow_op_ms {
            tracing::info!(
                ns = %entry.ns(),
                optime = %entry.optime(),
                elapsed_ms,
                "slow op application"
            );
        }
    }
    result
}

fn apply_noop(ctx: &ApplyContext, entry: &OpEntry) -> Result<(), ApplyError> {
    let db_lock = ctx.catalog.db_lock(entry.ns().db());
    let _db = db_lock.write().expect("db lock poisoned");
    ctx.metrics.ops_applied.incr();
    Ok(())
}

fn apply_crud(
    ctx: &ApplyContext,
    entry: &OpEntry,
    mode: ApplyMode,
    multikey: &mut Vec<MultikeyUpdate>,
) -> Result<(), ApplyError> {
    let ns = entry.ns();
    let db_lock = ctx.catalog.db_lock(ns.db());
    // The view catalog reflects every entry immediately, so writes to
    // system.views serialize against all readers of that database.
    let exclusive = ns.is_system_dot_views();
    let _shared;
    let _exclusive;
    if exclusive {
        _exclusive = Some(db_lock.write().expect("db lock poisoned"));
        _shared = None;
    } else {
        _shared = Some(db_lock.read().expect("db lock poisoned"));
        _exclusive = None;
    }

    let collection = match ctx.catalog.resolve(ns, entry.uuid()) {
        Ok(collection) => collection,
        Err(err) if err.is_namespace_not_found() => {
            // Deletes are idempotent against missing namespaces in every
            // mode; other CRUD survives only in replay modes.
            if entry.op_type() == OpType::Delete || mode.tolerate_namespace_not_found() {
                ctx.metrics.namespace_not_found_skipped.incr();
                ctx.metrics.ops_applied.incr();
                return Ok(());
            }
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    let ts = entry.timestamp();
    match entry.op_type() {
        OpType::Insert => {
            let doc = entry.payload().clone();
            multikey.extend(collection.pending_multikey(&doc));
            collection.records().insert(doc, ts)?;
            ctx.observer.on_inserts(ns, 1);
        }
        OpType::Update => {
            let id = entry
                .id_value()
                .ok_or_else(|| StorageError::MissingId { ns: ns.clone() })?
                .clone();
            collection
                .records()
                .update(&id, entry.payload(), ts, mode.convert_update_to_upsert())?;
            if let Some(doc) = collection.records().find_by_id(&id) {
                multikey.extend(collection.pending_multikey(&doc));
            }
        }
        OpType::Delete => {
            let id = entry
                .id_value()
                .ok_or_else(|| StorageError::MissingId { ns: ns.clone() })?;
            collection.records().delete(id)?;
        }
        OpType::Noop | OpType::Command => unreachable!("non-crud op in apply_crud"),
    }

    if ns.is_system_dot_views() {
        ctx.catalog.invalidate_views(ns.db());
    }
    ctx.metrics.ops_applied.incr();
    Ok(())
}

fn apply_command(
    ctx: &ApplyContext,
    entry: &OpEntry,
    mode: ApplyMode,
    multikey: &mut Vec<MultikeyUpdate>,
) -> Result<(), ApplyError> {
    let kind = entry.command_kind().ok_or_else(|| {
        let name = entry.payload().first_field().unwrap_or("<empty>").to_string();
        ApplyError::UnsupportedCommand {
            optime: entry.optime(),
            name,
        }
    })?;
    let db = entry.ns().db();
    let db_lock = ctx.catalog.db_lock(db);
    let _db = db_lock.write().expect("db lock poisoned");

    match kind {
        CommandKind::Create => apply_create(ctx, entry, db)?,
        CommandKind::Drop => apply_drop(ctx, entry, mode, db)?,
        CommandKind::DropDatabase => {
            ctx.catalog.drop_database(db);
        }
        CommandKind::RenameCollection => apply_rename(ctx, entry)?,
        CommandKind::CreateIndexes => apply_create_indexes(ctx, entry, mode, db)?,
        CommandKind::DropIndexes => apply_drop_indexes(ctx, entry, mode, db)?,
        CommandKind::ApplyOps => {
            if entry.should_prepare() {
                // A prepared transaction's write set is applied when its
                // commit arrives; the prepare itself changes nothing here.
                tracing::debug!(optime = %entry.optime(), "skipping prepare entry");
            } else {
                apply_ops_inline(ctx, entry, mode, multikey)?;
            }
        }
        CommandKind::CommitTransaction => apply_commit_transaction(ctx, entry, mode, multikey)?,
        CommandKind::AbortTransaction => {
            if mode == ApplyMode::ApplyOpsCmd {
                return Err(ApplyError::TxnCommandInApplyOps);
            }
            // Nothing is held for unprepared transactions between entries;
            // the in-batch pending list was already discarded upstream.
        }
        CommandKind::PrepareTransaction => {
            tracing::debug!(optime = %entry.optime(), "skipping prepare entry");
        }
    }

    ctx.metrics.ops_applied.incr();
    Ok(())
}

fn apply_create(ctx: &ApplyContext, entry: &OpEntry, db: &str) -> Result<(), ApplyError> {
    let payload = entry.payload();
    let name = command_target(payload, "create", entry)?;
    let ns = Namespace::new(db, &name).map_err(CatalogError::from)?;

    if let Some(Value::String(view_on)) = payload.get("viewOn") {
        let pipeline = match payload.get("pipeline") {
            None => Vec::new(),
            Some(Value::Array(stages)) => stages
                .iter()
                .filter_map(|stage| stage.as_object().cloned().map(Document))
                .collect(),
            Some(_) => {
                return Err(CatalogError::InvalidView {
                    reason: format!("pipeline for view {ns} is not an array"),
                }
                .into())
            }
        };
        let definition = ViewDefinition {
            ns,
            view_on: Namespace::new(db, view_on).map_err(CatalogError::from)?,
            pipeline,
            collation: CollectionOptions::from_create_payload(payload).collation,
        };
        ctx.catalog.create_view(&definition)?;
        return Ok(());
    }

    let options = CollectionOptions::from_create_payload(payload);
    match ctx.catalog.create_collection(ns.clone(), entry.uuid(), options) {
        Ok(collection) => {
            // Reads through this collection must not use a snapshot from
            // before its creation landed.
            collection.set_min_visible(entry.timestamp());
            ctx.observer.on_create_collection(&ns, collection.uuid());
            Ok(())
        }
        Err(CatalogError::NamespaceExists(_)) => {
            // Replays recreate collections that already exist; same UUID
            // means the same collection and the entry is a no-op.
            let existing = ctx
                .catalog
                .collection(&ns)
                .ok_or_else(|| CatalogError::NamespaceNotFound(ns.to_string()))?;
            match entry.uuid() {
                Some(uuid) if uuid != existing.uuid() => {
                    Err(CatalogError::NamespaceExists(ns).into())
                }
                _ => Ok(()),
            }
        }
        Err(err) => Err(err.into()),
    }
}

fn apply_drop(
    ctx: &ApplyContext,
    entry: &OpEntry,
    mode: ApplyMode,
    db: &str,
) -> Result<(), ApplyError> {
    let name = command_target(entry.payload(), "drop", entry)?;
    let ns = Namespace::new(db, &name).map_err(CatalogError::from)?;
    match ctx.catalog.drop_collection(&ns) {
        Ok(uuid) => {
            ctx.observer.on_drop_collection(&ns, uuid);
            Ok(())
        }
        Err(err) if err.is_namespace_not_found() && mode.tolerate_namespace_not_found() => {
            ctx.metrics.namespace_not_found_skipped.incr();
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn apply_rename(ctx: &ApplyContext, entry: &OpEntry) -> Result<(), ApplyError> {
    let payload = entry.payload();
    let from = match payload.get("renameCollection") {
        Some(Value::String(raw)) => Namespace::parse(raw).map_err(CatalogError::from)?,
        _ => {
            return Err(ApplyError::MalformedApplyOps {
                reason: format!("renameCollection at {} has no source", entry.optime()),
            })
        }
    };
    let to = match payload.get("to") {
        Some(Value::String(raw)) => Namespace::parse(raw).map_err(CatalogError::from)?,
        _ => {
            return Err(ApplyError::MalformedApplyOps {
                reason: format!("renameCollection at {} has no target", entry.optime()),
            })
        }
    };
    let drop_target = matches!(payload.get("dropTarget"), Some(Value::Bool(true)));
    ctx.catalog.rename_collection(&from, to.clone(), drop_target)?;
    if let Some(collection) = ctx.catalog.collection(&to) {
        collection.set_min_visible(entry.timestamp());
    }
    Ok(())
}

fn apply_create_indexes(
    ctx: &ApplyContext,
    entry: &OpEntry,
    mode: ApplyMode,
    db: &str,
) -> Result<(), ApplyError> {
    let payload = entry.payload();
    let name = command_target(payload, "createIndexes", entry)?;
    let ns = Namespace::new(db, &name).map_err(CatalogError::from)?;
    let collection = match ctx.catalog.resolve(&ns, entry.uuid()) {
        Ok(collection) => collection,
        Err(err) if err.is_namespace_not_found() && mode.tolerate_namespace_not_found() => {
            ctx.metrics.namespace_not_found_skipped.incr();
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let index_name = match payload.get("name") {
        Some(Value::String(s)) => s.clone(),
        _ => {
            return Err(ApplyError::MalformedApplyOps {
                reason: format!("createIndexes at {} has no index name", entry.optime()),
            })
        }
    };
    let key = match payload.get("key") {
        Some(Value::Object(map)) => Document(map.clone()),
        _ => {
            return Err(ApplyError::MalformedApplyOps {
                reason: format!("createIndexes at {} has no key pattern", entry.optime()),
            })
        }
    };
    collection.create_index(IndexSpec {
        name: index_name,
        key,
        multikey: false,
        multikey_paths: Vec::new(),
    });
    Ok(())
}

fn apply_drop_indexes(
    ctx: &ApplyContext,
    entry: &OpEntry,
    mode: ApplyMode,
    db: &str,
) -> Result<(), ApplyError> {
    let payload = entry.payload();
    let name = command_target(payload, "dropIndexes", entry)?;
    let ns = Namespace::new(db, &name).map_err(CatalogError::from)?;
    let collection = match ctx.catalog.resolve(&ns, entry.uuid()) {
        Ok(collection) => collection,
        Err(err) if err.is_namespace_not_found() && mode.tolerate_namespace_not_found() => {
            ctx.metrics.namespace_not_found_skipped.incr();
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    if let Some(Value::String(index)) = payload.get("index") {
        collection.drop_index(index);
    }
    Ok(())
}

/// Expand an `applyOps` payload into standalone entries. Inner operations
/// omit the envelope; they inherit the container's position and wall time.
pub(crate) fn extract_operations(entry: &OpEntry) -> Result<Vec<OpEntry>, ApplyError> {
    let inner = match entry.payload().get("applyOps") {
        Some(Value::Array(ops)) => ops,
        _ => {
            return Err(ApplyError::MalformedApplyOps {
                reason: format!("applyOps at {} payload is not an array", entry.optime()),
            })
        }
    };

    let outer = Document::from_bytes(entry.raw()).map_err(EntryParseError::from)?;
    let mut out = Vec::with_capacity(inner.len());
    for op in inner {
        let Value::Object(map) = op else {
            return Err(ApplyError::MalformedApplyOps {
                reason: format!("applyOps at {} has a non-document op", entry.optime()),
            });
        };
        let mut doc = Document(map.clone());
        for field in ["ts", "t", "wall", "lsid", "txnNumber"] {
            if !doc.contains(field) {
                if let Some(value) = outer.get(field) {
                    doc.insert(field, value.clone());
                }
            }
        }
        out.push(OpEntry::from_document(doc)?);
    }
    Ok(out)
}

fn apply_ops_inline(
    ctx: &ApplyContext,
    entry: &OpEntry,
    mode: ApplyMode,
    multikey: &mut Vec<MultikeyUpdate>,
) -> Result<(), ApplyError> {
    for inner in extract_operations(entry)? {
        apply_entry(ctx, &inner, mode, multikey)?;
    }
    Ok(())
}

fn apply_commit_transaction(
    ctx: &ApplyContext,
    entry: &OpEntry,
    mode: ApplyMode,
    multikey: &mut Vec<MultikeyUpdate>,
) -> Result<(), ApplyError> {
    if mode == ApplyMode::ApplyOpsCmd {
        return Err(ApplyError::TxnCommandInApplyOps);
    }

    // Unprepared commits are expanded by the lane partitioner; reaching
    // here means there is nothing left to do.
    if entry.is_unprepared_commit() {
        return Ok(());
    }

    // Prepared commit: the previous entry in the chain is the prepare,
    // whose payload is the transaction's applyOps. Strip the prepare flag
    // and apply it as a plain container.
    let prepare_optime = entry.prev_optime().filter(|optime| !optime.is_null());
    let Some(prepare_optime) = prepare_optime else {
        return Err(ApplyError::MalformedApplyOps {
            reason: format!("prepared commit at {} has no chain", entry.optime()),
        });
    };
    let raw = ctx
        .engine
        .read_oplog_at(prepare_optime.ts)
        .ok_or(TxnChainError::MissingChainEntry(prepare_optime))?;
    let prepare_entry = OpEntry::parse(raw)?;

    let mut payload = prepare_entry.payload().clone();
    payload.remove("prepare");
    let mut rebuilt =
        Document::from_bytes(prepare_entry.raw()).map_err(EntryParseError::from)?;
    rebuilt.insert("o", Value::Object(payload.0));
    rebuilt.remove("prepare");
    let container = OpEntry::from_document(rebuilt)?;
    apply_ops_inline(ctx, &container, mode, multikey)
}

fn command_target(
    payload: &Document,
    command: &str,
    entry: &OpEntry,
) -> Result<String, ApplyError> {
    match payload.get(command) {
        Some(Value::String(name)) => Ok(name.clone()),
        _ => Err(ApplyError::UnsupportedCommand {
            optime: entry.optime(),
            name: command.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::NullObserver;
    use crate::storage::{MemEngine, MemEngineOptions};
    use serde_json::json;
    use uuid::Uuid;

    fn ctx() -> ApplyContext {
        ApplyContext {
            catalog: Arc::new(Catalog::new()),
            engine: Arc::new(MemEngine::new(MemEngineOptions::default())),
            observer: Arc::new(NullObserver),
            metrics: Arc::new(Metrics::new()),
            fail_points: Arc::new(FailPointRegistry::new()),
            config: ApplyConfig::default(),
            shutdown: ShutdownSignal::new(),
        }
    }

    fn entry(value: serde_json::Value) -> OpEntry {
        OpEntry::from_document(Document(value.as_object().expect("object").clone()))
            .expect("entry")
    }

    fn insert_entry(secs: u32, ns: &str, id: i64) -> OpEntry {
        entry(json!({
            "ts": {"secs": secs, "inc": 0},
            "t": 1,
            "op": "i",
            "ns": ns,
            "o": {"_id": id},
            "wall": 1000,
        }))
    }

    fn apply(ctx: &ApplyContext, e: &OpEntry, mode: ApplyMode) -> Result<(), ApplyError> {
        let mut multikey = Vec::new();
        apply_entry(ctx, e, mode, &mut multikey)
    }

    #[test]
    fn insert_into_missing_namespace_follows_mode_table() {
        let ctx = ctx();
        let e = insert_entry(1, "app.gone", 1);

        let err = apply(&ctx, &e, ApplyMode::Secondary).expect_err("secondary errors");
        assert!(err.is_namespace_not_found());

        apply(&ctx, &e, ApplyMode::Recovering).expect("recovering tolerates");
        apply(&ctx, &e, ApplyMode::InitialSync).expect("initial sync tolerates");
        assert_eq!(ctx.metrics.namespace_not_found_skipped.get(), 2);
    }

    #[test]
    fn delete_on_missing_namespace_is_ok_in_every_mode() {
        let ctx = ctx();
        let e = entry(json!({
            "ts": {"secs": 1, "inc": 0},
            "t": 1,
            "op": "d",
            "ns": "app.gone",
            "o": {"_id": 1},
            "wall": 0,
        }));
        apply(&ctx, &e, ApplyMode::Secondary).expect("delete tolerated");
    }

    #[test]
    fn update_upsert_conversion_depends_on_mode() {
        let ctx = ctx();
        ctx.catalog
            .create_collection(
                Namespace::parse("app.events").expect("ns"),
                None,
                Default::default(),
            )
            .expect("create");
        let e = entry(json!({
            "ts": {"secs": 2, "inc": 0},
            "t": 1,
            "op": "u",
            "ns": "app.events",
            "o": {"$set": {"x": 1}},
            "o2": {"_id": 5},
            "wall": 0,
        }));

        let err = apply(&ctx, &e, ApplyMode::InitialSync).expect_err("no upsert in initial sync");
        assert!(err.is_update_target_missing());

        apply(&ctx, &e, ApplyMode::Secondary).expect("secondary upserts");
        let collection = ctx
            .catalog
            .collection(&Namespace::parse("app.events").expect("ns"))
            .expect("collection");
        assert_eq!(collection.records().len(), 1);
    }

    #[test]
    fn create_command_is_idempotent_for_same_uuid() {
        let ctx = ctx();
        let uuid = Uuid::new_v4();
        let e = entry(json!({
            "ts": {"secs": 1, "inc": 0},
            "t": 1,
            "op": "c",
            "ns": "app.$cmd",
            "ui": uuid.to_string(),
            "o": {"create": "events"},
            "wall": 0,
        }));
        apply(&ctx, &e, ApplyMode::Secondary).expect("create");
        apply(&ctx, &e, ApplyMode::Secondary).expect("replayed create is a no-op");

        let other = entry(json!({
            "ts": {"secs": 2, "inc": 0},
            "t": 1,
            "op": "c",
            "ns": "app.$cmd",
            "ui": Uuid::new_v4().to_string(),
            "o": {"create": "events"},
            "wall": 0,
        }));
        assert!(apply(&ctx, &other, ApplyMode::Secondary).is_err());
    }

    #[test]
    fn create_with_view_on_registers_a_view() {
        let ctx = ctx();
        let e = entry(json!({
            "ts": {"secs": 1, "inc": 0},
            "t": 1,
            "op": "c",
            "ns": "app.$cmd",
            "o": {"create": "recent", "viewOn": "events", "pipeline": [{"$limit": 10}]},
            "wall": 0,
        }));
        apply(&ctx, &e, ApplyMode::Secondary).expect("create view");
        let defs = ctx.catalog.view_definitions("app").expect("defs");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].view_on, Namespace::parse("app.events").expect("ns"));
    }

    #[test]
    fn apply_ops_container_applies_inner_ops() {
        let ctx = ctx();
        ctx.catalog
            .create_collection(
                Namespace::parse("app.events").expect("ns"),
                None,
                Default::default(),
            )
            .expect("create");
        let e = entry(json!({
            "ts": {"secs": 3, "inc": 0},
            "t": 1,
            "op": "c",
            "ns": "admin.$cmd",
            "o": {"applyOps": [
                {"op": "i", "ns": "app.events", "o": {"_id": 1}},
                {"op": "i", "ns": "app.events", "o": {"_id": 2}},
            ]},
            "wall": 0,
        }));
        apply(&ctx, &e, ApplyMode::ApplyOpsCmd).expect("applyOps");
        let collection = ctx
            .catalog
            .collection(&Namespace::parse("app.events").expect("ns"))
            .expect("collection");
        assert_eq!(collection.records().len(), 2);
    }

    #[test]
    fn txn_control_commands_rejected_in_apply_ops_mode() {
        let ctx = ctx();
        let commit = entry(json!({
            "ts": {"secs": 3, "inc": 0},
            "t": 1,
            "op": "c",
            "ns": "admin.$cmd",
            "o": {"commitTransaction": 1, "prepared": false},
            "wall": 0,
        }));
        assert!(matches!(
            apply(&ctx, &commit, ApplyMode::ApplyOpsCmd),
            Err(ApplyError::TxnCommandInApplyOps)
        ));

        let abort = entry(json!({
            "ts": {"secs": 4, "inc": 0},
            "t": 1,
            "op": "c",
            "ns": "admin.$cmd",
            "o": {"abortTransaction": 1},
            "wall": 0,
        }));
        assert!(matches!(
            apply(&ctx, &abort, ApplyMode::ApplyOpsCmd),
            Err(ApplyError::TxnCommandInApplyOps)
        ));
    }

    #[test]
    fn write_conflicts_are_retried_to_success() {
        let ctx = ctx();
        let collection = ctx
            .catalog
            .create_collection(
                Namespace::parse("app.events").expect("ns"),
                None,
                Default::default(),
            )
            .expect("create");
        collection.records().inject_write_conflicts(2);

        apply(&ctx, &insert_entry(1, "app.events", 1), ApplyMode::Secondary)
            .expect("retries through conflicts");
        assert_eq!(ctx.metrics.write_conflict_retries.get(), 2);
        assert_eq!(collection.records().len(), 1);
    }

    #[test]
    fn system_views_writes_invalidate_the_cache() {
        let ctx = ctx();
        let views_ns = Namespace::parse("app.system.views").expect("ns");
        ctx.catalog
            .create_collection(views_ns.clone(), None, Default::default())
            .expect("create");
        assert!(ctx.catalog.view_definitions("app").expect("defs").is_empty());

        let e = entry(json!({
            "ts": {"secs": 1, "inc": 0},
            "t": 1,
            "op": "i",
            "ns": "app.system.views",
            "o": {"_id": "app.recent", "viewOn": "events", "pipeline": []},
            "wall": 0,
        }));
        apply(&ctx, &e, ApplyMode::Secondary).expect("insert view doc");
        assert_eq!(ctx.catalog.view_definitions("app").expect("defs").len(), 1);
    }
}
