//! The applier worker body: one lane, one pass.

use crate::storage::MultikeyUpdate;

use super::apply::{apply_entry, ApplyContext, ApplyError, ApplyMode};
use super::engine::ApplyOptions;
use super::fetcher::fetch_and_insert_missing_document;
use super::insert_group::try_group_inserts;
use super::partition::LaneOp;

/// Mode is implied by the options: replay without log writes is crash
/// recovery, a configured sync source means initial sync, otherwise this
/// is a steady-state secondary.
pub(crate) fn mode_for_options(options: &ApplyOptions) -> ApplyMode {
    if options.skip_writes_to_oplog {
        ApplyMode::Recovering
    } else if options.missing_document_source.is_some() {
        ApplyMode::InitialSync
    } else {
        ApplyMode::Secondary
    }
}

/// Apply one lane. Returns the multikey transitions the batch driver must
/// persist, or the first error (which fails the whole batch).
pub(crate) fn apply_lane(
    ctx: &ApplyContext,
    options: &ApplyOptions,
    mut ops: Vec<LaneOp>,
) -> Result<Vec<MultikeyUpdate>, ApplyError> {
    let mode = mode_for_options(options);

    // Stable: preserves within-namespace order while clustering ops of a
    // collection for lock reuse and insert grouping.
    ops.sort_by(|a, b| a.entry.ns().cmp(b.entry.ns()));

    let mut multikey = Vec::new();
    let mut i = 0;
    while i < ops.len() {
        if let Some(next) = try_group_inserts(ctx, &ops, i, &mut multikey) {
            i = next;
            continue;
        }

        let entry = &ops[i].entry;
        match apply_entry(ctx, entry, mode, &mut multikey) {
            Ok(()) => {}
            Err(err) if err.is_update_target_missing() => {
                // Initial sync can race cloning: fetch the document from
                // the source instead of failing. The fetched copy already
                // reflects this update.
                let Some(source) = options.missing_document_source.as_ref() else {
                    tracing::error!(
                        optime = %entry.optime(),
                        ns = %entry.ns(),
                        "error applying operation: {err}"
                    );
                    return Err(err);
                };
                fetch_and_insert_missing_document(ctx, entry, source)?;
            }
            Err(err)
                if err.is_namespace_not_found()
                    && entry.is_crud()
                    && options.allow_namespace_not_found_on_crud =>
            {
                // The namespace will be dropped before sync finishes
                // anyway; skipping keeps replay idempotent.
                ctx.metrics.namespace_not_found_skipped.incr();
            }
            Err(err) => {
                tracing::error!(
                    optime = %entry.optime(),
                    ns = %entry.ns(),
                    "writer worker failed to apply operation: {err}"
                );
                return Err(err);
            }
        }
        i += 1;
    }

    Ok(multikey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CollectionOptions};
    use crate::config::ApplyConfig;
    use crate::core::{Document, Namespace, OpEntry};
    use crate::failpoint::FailPointRegistry;
    use crate::metrics::Metrics;
    use crate::repl::fetcher::{FetchError, SyncSourceClient};
    use crate::repl::NullObserver;
    use crate::storage::{MemEngine, MemEngineOptions};
    use crate::util::ShutdownSignal;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use uuid::Uuid;

    fn ctx() -> ApplyContext {
        ApplyContext {
            catalog: Arc::new(Catalog::new()),
            engine: Arc::new(MemEngine::new(MemEngineOptions::default())),
            observer: Arc::new(NullObserver),
            metrics: Arc::new(Metrics::new()),
            fail_points: Arc::new(FailPointRegistry::new()),
            config: ApplyConfig {
                fetch_retry_base_ms: 1,
                ..Default::default()
            },
            shutdown: ShutdownSignal::new(),
        }
    }

    fn lane_op(value: serde_json::Value) -> LaneOp {
        let entry = OpEntry::from_document(Document(
            value.as_object().expect("object").clone(),
        ))
        .expect("entry");
        LaneOp {
            entry: Arc::new(entry),
            for_capped_collection: false,
        }
    }

    fn insert(secs: u32, ns: &str, id: i64) -> LaneOp {
        lane_op(json!({
            "ts": {"secs": secs, "inc": 0},
            "t": 1,
            "op": "i",
            "ns": ns,
            "o": {"_id": id},
            "wall": 0,
        }))
    }

    #[test]
    fn lane_sort_is_stable_within_namespace() {
        let ctx = ctx();
        for raw in ["app.b", "app.a"] {
            ctx.catalog
                .create_collection(
                    Namespace::parse(raw).expect("ns"),
                    None,
                    CollectionOptions::default(),
                )
                .expect("create");
        }
        // Interleaved namespaces; within each, ids ascend with optime.
        let ops = vec![
            insert(1, "app.b", 1),
            insert(2, "app.a", 1),
            insert(3, "app.b", 2),
            insert(4, "app.a", 2),
        ];
        apply_lane(&ctx, &ApplyOptions::default(), ops).expect("apply");

        for raw in ["app.a", "app.b"] {
            let collection = ctx
                .catalog
                .collection(&Namespace::parse(raw).expect("ns"))
                .expect("collection");
            let ids: Vec<i64> = collection
                .records()
                .all_docs()
                .iter()
                .map(|d| d.id().and_then(Value::as_i64).expect("id"))
                .collect();
            assert_eq!(ids, vec![1, 2], "within-namespace order must hold");
        }
    }

    struct OneDocSource {
        doc: Document,
    }

    impl SyncSourceClient for OneDocSource {
        fn find_by_id(
            &self,
            _ns: &Namespace,
            _uuid: Option<Uuid>,
            _id: &Value,
        ) -> Result<Option<Document>, FetchError> {
            Ok(Some(self.doc.clone()))
        }
    }

    #[test]
    fn initial_sync_fetches_missing_update_target() {
        let ctx = ctx();
        let ns = Namespace::parse("app.events").expect("ns");
        ctx.catalog
            .create_collection(ns.clone(), None, CollectionOptions::default())
            .expect("create");

        let update = lane_op(json!({
            "ts": {"secs": 5, "inc": 0},
            "t": 1,
            "op": "u",
            "ns": "app.events",
            "o": {"$set": {"x": 2}},
            "o2": {"_id": 7},
            "wall": 0,
        }));
        let fetched = Document(
            json!({"_id": 7, "x": 2}).as_object().expect("object").clone(),
        );
        let options = ApplyOptions {
            missing_document_source: Some(Arc::new(OneDocSource { doc: fetched }) as _),
            allow_namespace_not_found_on_crud: true,
            ..Default::default()
        };

        apply_lane(&ctx, &options, vec![update]).expect("apply with fetch");
        let collection = ctx.catalog.collection(&ns).expect("collection");
        assert_eq!(
            collection.records().find_by_id(&json!(7)).expect("doc").get("x"),
            Some(&json!(2))
        );
        assert_eq!(ctx.metrics.missing_docs_fetched.get(), 1);
    }

    #[test]
    fn secondary_mode_propagates_missing_namespace() {
        let ctx = ctx();
        let ops = vec![insert(1, "app.gone", 1)];
        let err = apply_lane(&ctx, &ApplyOptions::default(), ops).expect_err("fails");
        assert!(err.is_namespace_not_found());
    }

    #[test]
    fn recovering_mode_skips_missing_namespace_and_continues() {
        let ctx = ctx();
        let ns = Namespace::parse("app.live").expect("ns");
        ctx.catalog
            .create_collection(ns.clone(), None, CollectionOptions::default())
            .expect("create");
        let options = ApplyOptions {
            skip_writes_to_oplog: true,
            allow_namespace_not_found_on_crud: true,
            ..Default::default()
        };
        let ops = vec![insert(1, "app.gone", 1), insert(2, "app.live", 2)];
        apply_lane(&ctx, &options, ops).expect("apply");
        let collection = ctx.catalog.collection(&ns).expect("collection");
        assert_eq!(collection.records().len(), 1);
        assert!(ctx.metrics.namespace_not_found_skipped.get() >= 1);
    }
}
