//! Session-table maintenance during batch application.
//!
//! On a primary, retryable-write bookkeeping in `config.transactions` is
//! updated without log entries. A secondary reconstructs those writes by
//! watching the session envelope on every applied entry and synthesizing
//! update pseudo-ops, flushed once per batch and routed through the normal
//! lanes.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};

use crate::core::{Document, Namespace, OpEntry, OpTime, SessionId};

#[derive(Clone, Debug)]
struct TrackedSession {
    session: SessionId,
    txn_number: Option<i64>,
    last_optime: OpTime,
    last_wall: SystemTime,
}

#[derive(Debug, Default)]
pub struct SessionUpdateTracker {
    sessions: HashMap<SessionId, TrackedSession>,
}

impl SessionUpdateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one op. Returns synthesized entries that must be applied
    /// before `op` when `op` writes `config.transactions` directly (the
    /// direct write supersedes whatever was tracked).
    pub fn update_or_flush(&mut self, op: &OpEntry) -> Option<Vec<OpEntry>> {
        if op.ns().is_config_transactions() {
            return self.flush_for_direct_write(op);
        }

        // Every op type counts, including noops: chunk-migration noops
        // carry session info too.
        if let Some(session) = op.session_id() {
            let tracked = self
                .sessions
                .entry(session)
                .or_insert_with(|| TrackedSession {
                    session,
                    txn_number: op.txn_number(),
                    last_optime: op.optime(),
                    last_wall: op.wall(),
                });
            if op.optime() >= tracked.last_optime {
                tracked.txn_number = op.txn_number();
                tracked.last_optime = op.optime();
                tracked.last_wall = op.wall();
            }
        }
        None
    }

    /// Synthesize entries for every tracked session and clear the table.
    pub fn flush_all(&mut self) -> Vec<OpEntry> {
        let mut tracked: Vec<TrackedSession> = self.sessions.drain().map(|(_, v)| v).collect();
        tracked.sort_by_key(|t| t.session);
        tracked.iter().map(synthesize_update).collect()
    }

    pub fn tracked_count(&self) -> usize {
        self.sessions.len()
    }

    fn flush_for_direct_write(&mut self, op: &OpEntry) -> Option<Vec<OpEntry>> {
        let target = direct_write_session(op)?;
        let tracked = self.sessions.remove(&target)?;
        Some(vec![synthesize_update(&tracked)])
    }
}

/// The session a direct `config.transactions` write addresses.
fn direct_write_session(op: &OpEntry) -> Option<SessionId> {
    let id_doc = op
        .target()
        .and_then(Document::id)
        .or_else(|| op.payload().id())?;
    let raw = id_doc.get("id")?.as_str()?;
    uuid::Uuid::parse_str(raw).ok().map(SessionId)
}

fn synthesize_update(tracked: &TrackedSession) -> OpEntry {
    let wall_ms = tracked
        .last_wall
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let session_doc = json!({"id": tracked.session.0.to_string()});
    let mut record = json!({
        "_id": session_doc.clone(),
        "lastWriteOpTime": serde_json::to_value(tracked.last_optime)
            .expect("optime encoding is infallible"),
        "lastWriteDate": wall_ms,
    });
    if let Some(txn_number) = tracked.txn_number {
        record["txnNum"] = Value::from(txn_number);
    }

    let doc = Document(
        json!({
            "ts": serde_json::to_value(tracked.last_optime.ts)
                .expect("timestamp encoding is infallible"),
            "t": tracked.last_optime.term,
            "op": "u",
            "ns": Namespace::config_transactions().to_string(),
            "o": record,
            "o2": {"_id": session_doc},
            "wall": wall_ms,
        })
        .as_object()
        .expect("literal object")
        .clone(),
    );
    OpEntry::from_document(doc).expect("synthesized session update is well formed")
}
