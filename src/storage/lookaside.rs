//! Auxiliary store for evicted, not-yet-globally-visible updates.
//!
//! Entries are keyed by the transaction that produced them; once that
//! transaction is visible to everyone the entry is garbage and the sweeper
//! prunes it on its faster cadence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct Lookaside {
    /// txn id -> number of stashed updates for that txn.
    entries: Mutex<BTreeMap<u64, u64>>,
    cache_stuck: AtomicBool,
}

impl Lookaside {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stash `count` evicted updates belonging to `txn_id`.
    pub fn record(&self, txn_id: u64, count: u64) {
        let mut entries = self.entries.lock().expect("lookaside poisoned");
        *entries.entry(txn_id).or_insert(0) += count;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().expect("lookaside poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("lookaside poisoned").len()
    }

    /// A stuck cache means sweeping would churn pages and make eviction
    /// worse; the sweeper backs off while this is set.
    pub fn is_cache_stuck(&self) -> bool {
        self.cache_stuck.load(Ordering::SeqCst)
    }

    pub fn set_cache_stuck(&self, stuck: bool) {
        self.cache_stuck.store(stuck, Ordering::SeqCst);
    }

    /// Drop every entry whose transaction is older than `oldest_id`.
    /// Returns the number of transactions pruned.
    pub fn sweep(&self, oldest_id: u64) -> usize {
        let mut entries = self.entries.lock().expect("lookaside poisoned");
        let keep = entries.split_off(&oldest_id);
        let pruned = entries.len();
        *entries = keep;
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_prunes_strictly_older_transactions() {
        let las = Lookaside::new();
        las.record(3, 2);
        las.record(5, 1);
        las.record(9, 4);
        assert_eq!(las.sweep(5), 1, "only txn 3 is older than 5");
        assert_eq!(las.len(), 2);
        assert_eq!(las.sweep(10), 2);
        assert!(las.is_empty());
    }
}
