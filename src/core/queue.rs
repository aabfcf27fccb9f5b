//! The batch hand-off unit.

use super::{OpEntry, OpTime};

/// An ordered run of log entries with aggregate byte accounting. The
/// batcher fills one per batch and publishes it to the apply loop; a queue
/// with `must_shutdown` set is the drain sentinel.
///
/// Entries are monotonically non-decreasing in optime within a queue; the
/// producer guarantees log order and the batcher never reorders.
#[derive(Debug, Default)]
pub struct OpQueue {
    ops: Vec<OpEntry>,
    bytes: usize,
    must_shutdown: bool,
}

impl OpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: OpEntry) {
        debug_assert!(
            self.ops
                .last()
                .map_or(true, |prev| prev.optime() <= entry.optime()),
            "op queue entries must be non-decreasing in optime"
        );
        self.bytes += entry.raw_len();
        self.ops.push(entry);
    }

    /// Remove and return the most recently pushed entry. Used when the
    /// batcher peeks an entry that must start its own batch.
    pub fn pop_newest(&mut self) -> Option<OpEntry> {
        let entry = self.ops.pop()?;
        self.bytes -= entry.raw_len();
        Some(entry)
    }

    pub fn front(&self) -> Option<&OpEntry> {
        self.ops.first()
    }

    pub fn back(&self) -> Option<&OpEntry> {
        self.ops.last()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn first_optime(&self) -> Option<OpTime> {
        self.front().map(OpEntry::optime)
    }

    pub fn last_optime(&self) -> Option<OpTime> {
        self.back().map(OpEntry::optime)
    }

    pub fn set_must_shutdown(&mut self) {
        self.must_shutdown = true;
    }

    pub fn must_shutdown(&self) -> bool {
        self.must_shutdown
    }

    pub fn into_ops(self) -> Vec<OpEntry> {
        self.ops
    }
}
