//! Bulk grouping of consecutive inserts within a lane.
//!
//! After the lane is namespace-sorted, runs of inserts into the same
//! collection are applied with one bulk call. Groups are bounded in count
//! and payload bytes, never include capped-collection inserts (those must
//! observe exact insertion order), and fall back to one-at-a-time
//! application on any failure.

use crate::core::OpType;
use crate::storage::MultikeyUpdate;

use super::apply::ApplyContext;
use super::partition::LaneOp;

const MAX_GROUP_OPS: usize = 64;
const MAX_GROUP_BYTES: usize = 256 * 1024;

/// Try to bulk-apply a run of inserts starting at `start`. Returns the
/// index after the group when a group of at least two was applied; `None`
/// means the caller should apply `ops[start]` individually (including the
/// fallback after a failed bulk call).
pub(crate) fn try_group_inserts(
    ctx: &ApplyContext,
    ops: &[LaneOp],
    start: usize,
    multikey: &mut Vec<MultikeyUpdate>,
) -> Option<usize> {
    let first = &ops[start];
    if first.entry.op_type() != OpType::Insert || first.for_capped_collection {
        return None;
    }
    let ns = first.entry.ns();

    let mut end = start;
    let mut bytes = 0usize;
    while end < ops.len() {
        let candidate = &ops[end];
        if candidate.entry.op_type() != OpType::Insert
            || candidate.for_capped_collection
            || candidate.entry.ns() != ns
        {
            break;
        }
        let size = candidate.entry.payload().encoded_len();
        if end > start && (end - start >= MAX_GROUP_OPS || bytes + size > MAX_GROUP_BYTES) {
            break;
        }
        bytes += size;
        end += 1;
    }
    if end - start < 2 {
        return None;
    }
    let group = &ops[start..end];

    let collection = match ctx.catalog.resolve(ns, first.entry.uuid()) {
        Ok(collection) => collection,
        // Let the individual path produce the mode-appropriate outcome.
        Err(_) => return None,
    };

    let mut docs = Vec::with_capacity(group.len());
    for op in group {
        let doc = op.entry.payload().clone();
        multikey.extend(collection.pending_multikey(&doc));
        docs.push((doc, op.entry.timestamp()));
    }
    if let Err(err) = collection.records().insert_many(docs) {
        tracing::debug!(
            %ns,
            group = group.len(),
            "grouped insert failed, falling back to individual application: {err}"
        );
        return None;
    }

    ctx.observer.on_inserts(ns, group.len());
    ctx.metrics.ops_applied.add(group.len() as u64);
    Some(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, CollectionOptions};
    use crate::config::ApplyConfig;
    use crate::core::{Document, Namespace, OpEntry};
    use crate::failpoint::FailPointRegistry;
    use crate::metrics::Metrics;
    use crate::repl::NullObserver;
    use crate::storage::{MemEngine, MemEngineOptions};
    use crate::util::ShutdownSignal;
    use serde_json::json;
    use std::sync::Arc;

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

    fn lane_op(secs: u32, ns: &str, id: i64, capped: bool) -> LaneOp {
        let entry = OpEntry::from_document(Document(
            json!({
                "ts": {"secs": secs, "inc": 0},
                "t": 1,
                "op": "i",
                "ns": ns,
                "o": {"_id": id},
                "wall": 0,
            })
            .as_object()
            .expect("object")
            .clone(),
        ))
        .expect("entry");
        LaneOp {
            entry: Arc::new(entry),
            for_capped_collection: capped,
        }
    }

    #[test]
    fn groups_consecutive_same_namespace_inserts() {
        let ctx = ctx();
        let ns = Namespace::parse("app.events").expect("ns");
        ctx.catalog
            .create_collection(ns.clone(), None, CollectionOptions::default())
            .expect("create");

        let ops = vec![
            lane_op(1, "app.events", 1, false),
            lane_op(2, "app.events", 2, false),
            lane_op(3, "app.events", 3, false),
            lane_op(4, "app.other", 4, false),
        ];
        let mut multikey = Vec::new();
        let next = try_group_inserts(&ctx, &ops, 0, &mut multikey).expect("grouped");
        assert_eq!(next, 3, "group stops at the namespace change");
        assert_eq!(ctx.metrics.ops_applied.get(), 3);
        let collection = ctx.catalog.collection(&ns).expect("collection");
        assert_eq!(collection.records().len(), 3);
    }

    #[test]
    fn single_insert_is_not_grouped() {
        let ctx = ctx();
        let ops = vec![
            lane_op(1, "app.events", 1, false),
            lane_op(2, "app.other", 2, false),
        ];
        let mut multikey = Vec::new();
        assert!(try_group_inserts(&ctx, &ops, 0, &mut multikey).is_none());
    }

    #[test]
    fn capped_inserts_are_never_grouped() {
        let ctx = ctx();
        let ops = vec![
            lane_op(1, "app.capped", 1, true),
            lane_op(2, "app.capped", 2, true),
        ];
        let mut multikey = Vec::new();
        assert!(try_group_inserts(&ctx, &ops, 0, &mut multikey).is_none());
    }

    #[test]
    fn group_is_bounded_in_op_count() {
        let ctx = ctx();
        let ns = Namespace::parse("app.events").expect("ns");
        ctx.catalog
            .create_collection(ns, None, CollectionOptions::default())
            .expect("create");
        let ops: Vec<LaneOp> = (0..100)
            .map(|i| lane_op(i as u32 + 1, "app.events", i, false))
            .collect();
        let mut multikey = Vec::new();
        let next = try_group_inserts(&ctx, &ops, 0, &mut multikey).expect("grouped");
        assert_eq!(next, MAX_GROUP_OPS);
    }

    #[test]
    fn failed_bulk_insert_falls_back_to_individual_path() {
        let ctx = ctx();
        let ns = Namespace::parse("app.events").expect("ns");
        let collection = ctx
            .catalog
            .create_collection(ns, None, CollectionOptions::default())
            .expect("create");
        collection.records().inject_write_conflicts(1);

        let ops = vec![
            lane_op(1, "app.events", 1, false),
            lane_op(2, "app.events", 2, false),
        ];
        let mut multikey = Vec::new();
        assert!(try_group_inserts(&ctx, &ops, 0, &mut multikey).is_none());
        assert_eq!(ctx.metrics.ops_applied.get(), 0);
    }
}
