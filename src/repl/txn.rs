//! Transaction reconstruction from the local log.
//!
//! Multi-entry transactions chain their entries through `prevOpTime`. At
//! commit (or prepare) the full operation list is rebuilt: walk the
//! on-disk chain backward, reverse to chronological order, append the ops
//! cached from the current batch, and restamp everything at the commit
//! position.

use std::sync::Arc;

use thiserror::Error;

use crate::core::{CommandKind, EntryParseError, OpEntry, OpTime};
use crate::storage::StorageEngine;

#[derive(Debug, Error)]
pub enum TxnChainError {
    #[error("transaction chain entry missing from the log at {0}")]
    MissingChainEntry(OpTime),
    #[error("transaction chain entry at {0} is not part of a pending transaction")]
    NotInTransaction(OpTime),
    #[error("transaction chain at {chain} does not precede its commit at {commit}")]
    ChainOrder { chain: OpTime, commit: OpTime },
    #[error("commitTransaction at {0} has no operations")]
    EmptyCommit(OpTime),
    #[error(transparent)]
    Parse(#[from] EntryParseError),
}

/// Walks `prevOpTime` links backward through the local log.
pub(crate) struct TxnChainIterator<'a> {
    engine: &'a dyn StorageEngine,
    next: Option<OpTime>,
}

impl<'a> TxnChainIterator<'a> {
    pub fn new(engine: &'a dyn StorageEngine, start: Option<OpTime>) -> Self {
        let next = start.filter(|optime| !optime.is_null());
        Self { engine, next }
    }
}

impl Iterator for TxnChainIterator<'_> {
    type Item = Result<OpEntry, TxnChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let optime = self.next.take()?;
        let Some(raw) = self.engine.read_oplog_at(optime.ts) else {
            return Some(Err(TxnChainError::MissingChainEntry(optime)));
        };
        match OpEntry::parse(raw) {
            Ok(entry) => {
                self.next = entry.prev_optime().filter(|optime| !optime.is_null());
                Some(Ok(entry))
            }
            Err(err) => Some(Err(err.into())),
        }
    }
}

/// Rebuild the chronological operation list of the transaction ending at
/// `commit_or_prepare`. `cached_ops` are this batch's entries for the same
/// session, not necessarily written to the log yet, in timestamp order.
pub(crate) fn read_transaction_operations(
    engine: &dyn StorageEngine,
    commit_or_prepare: &OpEntry,
    cached_ops: &[Arc<OpEntry>],
) -> Result<Vec<OpEntry>, TxnChainError> {
    let commit_optime = commit_or_prepare.optime();

    // The newest entry expected on disk: the one before the first cached
    // op, or before the commit itself when nothing is cached.
    let last_on_disk = match cached_ops.first() {
        Some(first) => first.prev_optime(),
        None => commit_or_prepare.prev_optime(),
    };
    if let Some(last) = last_on_disk {
        if !last.is_null() && last >= commit_optime {
            return Err(TxnChainError::ChainOrder {
                chain: last,
                commit: commit_optime,
            });
        }
    }

    let mut ops = Vec::new();
    for entry in TxnChainIterator::new(engine, last_on_disk) {
        let entry = entry?;
        if !entry.is_in_pending_txn() {
            return Err(TxnChainError::NotInTransaction(entry.optime()));
        }
        ops.push(entry.at_commit_envelope(commit_or_prepare)?);
    }
    // The chain was walked newest-first.
    ops.reverse();

    for cached in cached_ops {
        if !cached.is_in_pending_txn() {
            return Err(TxnChainError::NotInTransaction(cached.optime()));
        }
        ops.push(cached.at_commit_envelope(commit_or_prepare)?);
    }

    // Empty commits are disallowed; empty prepares are fine.
    if ops.is_empty()
        && commit_or_prepare.command_kind() == Some(CommandKind::CommitTransaction)
    {
        return Err(TxnChainError::EmptyCommit(commit_optime));
    }

    Ok(ops)
}
