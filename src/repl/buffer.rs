//! Bounded FIFO between the log producer and the batcher.
//!
//! The producer pushes raw entries; the single consumer peeks, pops and
//! blocks briefly for more. Pushes block when the buffer is at capacity so
//! a stalled applier backpressures the producer.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;

#[derive(Debug, Default)]
struct BufferInner {
    entries: VecDeque<Bytes>,
    bytes: usize,
    draining: bool,
}

#[derive(Debug)]
pub struct OplogBuffer {
    inner: Mutex<BufferInner>,
    max_bytes: usize,
    not_empty: Condvar,
    not_full: Condvar,
}

impl OplogBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            max_bytes,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append one raw entry, blocking while the buffer is full. Entries
    /// pushed after `begin_drain` are rejected.
    pub fn push(&self, entry: Bytes) -> bool {
        let mut inner = self.inner.lock().expect("oplog buffer poisoned");
        while !inner.draining && inner.bytes + entry.len() > self.max_bytes && !inner.entries.is_empty()
        {
            inner = self
                .not_full
                .wait(inner)
                .expect("oplog buffer poisoned");
        }
        if inner.draining {
            return false;
        }
        inner.bytes += entry.len();
        inner.entries.push_back(entry);
        self.not_empty.notify_all();
        true
    }

    pub fn push_all(&self, entries: impl IntoIterator<Item = Bytes>) -> bool {
        for entry in entries {
            if !self.push(entry) {
                return false;
            }
        }
        true
    }

    /// Clone the front entry without consuming it.
    pub fn peek(&self) -> Option<Bytes> {
        let inner = self.inner.lock().expect("oplog buffer poisoned");
        inner.entries.front().cloned()
    }

    pub fn try_pop(&self) -> Option<Bytes> {
        let mut inner = self.inner.lock().expect("oplog buffer poisoned");
        let entry = inner.entries.pop_front()?;
        inner.bytes -= entry.len();
        self.not_full.notify_all();
        Some(entry)
    }

    /// Block up to `timeout` for the buffer to become non-empty. Returns
    /// whether data is available.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let mut inner = self.inner.lock().expect("oplog buffer poisoned");
        if !inner.entries.is_empty() {
            return true;
        }
        if inner.draining {
            return false;
        }
        let (inner, _timed_out) = self
            .not_empty
            .wait_timeout(inner, timeout)
            .expect("oplog buffer poisoned");
        !inner.entries.is_empty()
    }

    /// Stop accepting pushes and wake all waiters. Already-buffered
    /// entries remain poppable so the consumer can drain.
    pub fn begin_drain(&self) {
        let mut inner = self.inner.lock().expect("oplog buffer poisoned");
        inner.draining = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_draining(&self) -> bool {
        self.inner.lock().expect("oplog buffer poisoned").draining
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("oplog buffer poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.inner.lock().expect("oplog buffer poisoned").bytes
    }
}
