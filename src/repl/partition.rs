//! Lane assignment: splitting a batch across applier workers.
//!
//! All ops for one namespace land in the same lane, so within-namespace
//! order is the lane's order. When the engine locks at document
//! granularity (and the collection is not capped), the document `_id` —
//! keyed through the collection's collation — joins the hash, spreading a
//! hot collection across lanes while preserving per-document order.
//! Transaction containers are expanded here: an unprepared `applyOps`
//! recursively re-partitions its inner ops, an unprepared commit assembles
//! the transaction from the chain plus the in-batch pending list.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::catalog::{Catalog, Collation};
use crate::core::{Namespace, OpEntry, OpType, SessionId};

use super::apply::{extract_operations, ApplyContext, ApplyError};
use super::engine::ApplyOptions;
use super::session_update::SessionUpdateTracker;
use super::txn::read_transaction_operations;

/// One slot in a lane. The capped flag forbids grouping the insert with
/// its neighbors: capped collections must observe exact insertion order.
#[derive(Clone, Debug)]
pub(crate) struct LaneOp {
    pub entry: Arc<OpEntry>,
    pub for_capped_collection: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct CollProps {
    is_capped: bool,
    collation: Collation,
}

/// Collection properties looked up once per namespace per batch.
#[derive(Default)]
struct CollPropsCache {
    cache: HashMap<Namespace, CollProps>,
}

impl CollPropsCache {
    fn get(&mut self, catalog: &Catalog, ns: &Namespace) -> CollProps {
        if let Some(props) = self.cache.get(ns) {
            return *props;
        }
        let props = match catalog.collection(ns) {
            Some(collection) => CollProps {
                is_capped: collection.is_capped(),
                collation: collection.default_collation(),
            },
            None => CollProps::default(),
        };
        self.cache.insert(ns.clone(), props);
        props
    }
}

/// Partition `ops` into `lanes`. Session bookkeeping runs only at the top
/// level; derived ops (expanded containers, synthesized session updates)
/// are re-partitioned without it.
pub(crate) fn assign_to_lanes(
    ctx: &ApplyContext,
    options: &ApplyOptions,
    ops: Vec<OpEntry>,
    lanes: &mut Vec<Vec<LaneOp>>,
) -> Result<(), ApplyError> {
    let mut props = CollPropsCache::default();
    let mut tracker = SessionUpdateTracker::new();
    assign_inner(ctx, options, ops, lanes, &mut props, Some(&mut tracker))?;

    let flushed = tracker.flush_all();
    if !flushed.is_empty() {
        ctx.metrics.session_updates_flushed.add(flushed.len() as u64);
        assign_inner(ctx, options, flushed, lanes, &mut props, None)?;
    }
    Ok(())
}

fn assign_inner(
    ctx: &ApplyContext,
    options: &ApplyOptions,
    ops: Vec<OpEntry>,
    lanes: &mut Vec<Vec<LaneOp>>,
    props: &mut CollPropsCache,
    mut tracker: Option<&mut SessionUpdateTracker>,
) -> Result<(), ApplyError> {
    let lane_count = lanes.len();
    let doc_locking = ctx.engine.supports_doc_locking();
    // Entries of still-uncommitted transactions, per session, in batch
    // order. Dispatched only when their commit shows up.
    let mut pending: HashMap<SessionId, Vec<Arc<OpEntry>>> = HashMap::new();

    for op in ops {
        // Resumed sync: everything at or before the resume point was
        // already applied.
        if op.optime() <= options.begin_applying_optime {
            continue;
        }
        let op = Arc::new(op);

        if let Some(tracker) = tracker.as_deref_mut() {
            if let Some(derived) = tracker.update_or_flush(&op) {
                ctx.metrics.session_updates_flushed.add(derived.len() as u64);
                assign_inner(ctx, options, derived, lanes, props, None)?;
            }
        }

        if op.is_in_pending_txn() {
            let session = op.session_id().unwrap_or_default();
            let list = pending.entry(session).or_default();
            if let Some(first) = list.first() {
                if first.txn_number() != op.txn_number() {
                    // The session moved on to a new transaction; whatever
                    // was pending belonged to an aborted one.
                    tracing::info!(
                        %session,
                        old_txn = ?first.txn_number(),
                        new_txn = ?op.txn_number(),
                        dropped = list.len(),
                        "clearing pending transaction entries for superseded txnNumber"
                    );
                    list.clear();
                }
            }
            list.push(op);
            continue;
        }

        let mut hash = hash_namespace(op.ns());
        let mut for_capped_collection = false;
        if op.is_crud() {
            let coll_props = props.get(&ctx.catalog, op.ns());
            if doc_locking && !coll_props.is_capped {
                if let Some(id) = op.id_value() {
                    hash = combine_id_hash(hash, &coll_props.collation.key_for(id));
                }
            }
            if op.op_type() == OpType::Insert && coll_props.is_capped {
                for_capped_collection = true;
            }
        }

        if op.is_unprepared_apply_ops() {
            // Nested entries cannot carry their own session updates.
            let derived = extract_operations(&op)?;
            assign_inner(ctx, options, derived, lanes, props, None)?;
            continue;
        }
        if op.is_unprepared_commit() {
            let session = op.session_id().unwrap_or_default();
            let cached = pending.remove(&session).unwrap_or_default();
            let derived = read_transaction_operations(ctx.engine.as_ref(), &op, &cached)?;
            assign_inner(ctx, options, derived, lanes, props, None)?;
            continue;
        }

        lanes[(hash % lane_count as u64) as usize].push(LaneOp {
            entry: op,
            for_capped_collection,
        });
    }

    if !pending.is_empty() {
        // Commits arriving in a later batch will rebuild these from the
        // log; the entries themselves are persisted with this batch.
        tracing::debug!(
            sessions = pending.len(),
            "pending transaction entries held past batch end"
        );
    }
    Ok(())
}

fn hash_namespace(ns: &Namespace) -> u64 {
    let mut hasher = DefaultHasher::new();
    ns.hash(&mut hasher);
    hasher.finish()
}

fn combine_id_hash(ns_hash: u64, id_key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    ns_hash.hash(&mut hasher);
    id_key.hash(&mut hasher);
    hasher.finish()
}
