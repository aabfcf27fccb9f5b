//! Sweepable data handles.
//!
//! A data handle is the engine's descriptor for one open data object
//! (a table or the btree under it), shared across sessions. The sweeper
//! ages idle handles out; everything it relies on here is lock-free reads
//! plus a try-only rwlock, so user operations never block on the sweeper.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockWriteGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleType {
    Table,
    Btree,
}

#[derive(Debug, Default)]
struct TreeState {
    modified: bool,
    rec_max_txn: u64,
}

#[derive(Debug)]
pub struct DataHandle {
    name: String,
    ty: HandleType,
    is_metadata: bool,
    rwlock: RwLock<()>,
    open: AtomicBool,
    exclusive: AtomicBool,
    dead: AtomicBool,
    session_in_use: AtomicU32,
    session_ref: AtomicU32,
    /// Epoch seconds when the handle was last seen idle; 0 = unmarked.
    time_of_death: AtomicU64,
    tree: Mutex<TreeState>,
}

impl DataHandle {
    pub fn new(name: impl Into<String>, ty: HandleType) -> Arc<Self> {
        Self::build(name, ty, false)
    }

    /// The engine's own metadata object. Never swept.
    pub fn metadata(name: impl Into<String>) -> Arc<Self> {
        Self::build(name, HandleType::Btree, true)
    }

    fn build(name: impl Into<String>, ty: HandleType, is_metadata: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ty,
            is_metadata,
            rwlock: RwLock::new(()),
            open: AtomicBool::new(true),
            exclusive: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            session_in_use: AtomicU32::new(0),
            session_ref: AtomicU32::new(0),
            time_of_death: AtomicU64::new(0),
            tree: Mutex::new(TreeState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle_type(&self) -> HandleType {
        self.ty
    }

    pub fn is_metadata(&self) -> bool {
        self.is_metadata
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive.load(Ordering::SeqCst)
    }

    pub fn set_exclusive(&self, exclusive: bool) {
        self.exclusive.store(exclusive, Ordering::SeqCst);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn sessions_in_use(&self) -> u32 {
        self.session_in_use.load(Ordering::SeqCst)
    }

    /// A session starts using the handle (cursor open).
    pub fn acquire(&self) {
        self.session_in_use.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release(&self) {
        let prev = self.session_in_use.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "release without acquire");
    }

    pub fn session_refs(&self) -> u32 {
        self.session_ref.load(Ordering::SeqCst)
    }

    pub fn add_session_ref(&self) {
        self.session_ref.fetch_add(1, Ordering::SeqCst);
    }

    pub fn drop_session_ref(&self) {
        let prev = self.session_ref.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "ref drop without ref");
    }

    pub fn time_of_death(&self) -> u64 {
        self.time_of_death.load(Ordering::SeqCst)
    }

    pub fn set_time_of_death(&self, secs: u64) {
        self.time_of_death.store(secs, Ordering::SeqCst);
    }

    pub fn clear_time_of_death(&self) {
        self.time_of_death.store(0, Ordering::SeqCst);
    }

    /// Record a modification to the underlying tree. A modified tree is
    /// never swept until it is clean again.
    pub fn mark_tree_modified(&self, modified: bool) {
        self.tree.lock().expect("tree state poisoned").modified = modified;
    }

    /// Record the newest transaction that reconciled the tree.
    pub fn set_rec_max_txn(&self, txn: u64) {
        self.tree.lock().expect("tree state poisoned").rec_max_txn = txn;
    }

    /// Clean means: unmodified, and every update in the tree is visible to
    /// all running transactions.
    pub fn tree_clean(&self, txns: &TxnVisibility) -> bool {
        let tree = self.tree.lock().expect("tree state poisoned");
        !tree.modified && txns.visible_to_all(tree.rec_max_txn)
    }

    /// Non-blocking exclusive access, the only way the sweeper ever locks
    /// a handle. Contention means the handle is in use: skip it.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.rwlock.try_write().ok()
    }

    pub fn can_discard(&self) -> bool {
        !self.is_exclusive()
            && !self.is_open()
            && self.sessions_in_use() == 0
            && self.session_refs() == 0
    }
}

/// Global transaction visibility horizon: the oldest transaction id still
/// running. An update is visible to all when it committed before that.
#[derive(Debug, Default)]
pub struct TxnVisibility {
    oldest_active: AtomicU64,
}

impl TxnVisibility {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn oldest_id(&self) -> u64 {
        self.oldest_active.load(Ordering::SeqCst)
    }

    pub fn advance_oldest(&self, id: u64) {
        self.oldest_active.fetch_max(id, Ordering::SeqCst);
    }

    pub fn visible_to_all(&self, txn: u64) -> bool {
        // Zero means "never reconciled": nothing to wait for.
        txn == 0 || txn < self.oldest_id()
    }
}

/// The connection-wide list of data handles.
#[derive(Debug, Default)]
pub struct HandleList {
    handles: RwLock<Vec<Arc<DataHandle>>>,
    table_lock: Mutex<()>,
}

impl HandleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<DataHandle>) {
        self.handles
            .write()
            .expect("handle list poisoned")
            .push(handle);
    }

    pub fn snapshot(&self) -> Vec<Arc<DataHandle>> {
        self.handles.read().expect("handle list poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.handles.read().expect("handle list poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open handles that still count against the sweep minimum.
    pub fn open_count(&self) -> usize {
        self.handles
            .read()
            .expect("handle list poisoned")
            .iter()
            .filter(|h| !h.is_metadata() && h.is_open() && !h.is_dead())
            .count()
    }

    /// Serializes table-handle state changes against cursor opens.
    pub fn table_lock(&self) -> MutexGuard<'_, ()> {
        self.table_lock.lock().expect("table lock poisoned")
    }

    /// Unlink every handle that passes the discard check under the list
    /// write lock and its own try-lock. Returns how many were removed.
    pub(crate) fn remove_discarded(
        &self,
        mut precheck: impl FnMut(&Arc<DataHandle>) -> bool,
    ) -> usize {
        let mut handles = self.handles.write().expect("handle list poisoned");
        let before = handles.len();
        handles.retain(|handle| {
            if handle.is_metadata() || !handle.can_discard() {
                return true;
            }
            // Exclusive access plus a re-check: states may have changed
            // between the scan and this unlink.
            let Some(_guard) = handle.try_write() else {
                return true;
            };
            if !handle.can_discard() {
                return true;
            }
            !precheck(handle)
        });
        before - handles.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discard_predicate() {
        let handle = DataHandle::new("table:app/events", HandleType::Btree);
        assert!(!handle.can_discard(), "open handles are kept");
        handle.set_open(false);
        assert!(handle.can_discard());
        handle.acquire();
        assert!(!handle.can_discard());
        handle.release();
        handle.add_session_ref();
        assert!(!handle.can_discard());
        handle.drop_session_ref();
        handle.set_exclusive(true);
        assert!(!handle.can_discard());
    }

    #[test]
    fn tree_clean_requires_global_visibility() {
        let txns = TxnVisibility::new();
        let handle = DataHandle::new("table:app/events", HandleType::Btree);
        handle.set_rec_max_txn(5);
        assert!(!handle.tree_clean(&txns), "txn 5 not yet visible to all");
        txns.advance_oldest(6);
        assert!(handle.tree_clean(&txns));
        handle.mark_tree_modified(true);
        assert!(!handle.tree_clean(&txns));
    }

    #[test]
    fn open_count_ignores_metadata_and_dead() {
        let list = HandleList::new();
        list.register(DataHandle::metadata("metadata:"));
        let a = DataHandle::new("a", HandleType::Btree);
        let b = DataHandle::new("b", HandleType::Btree);
        list.register(Arc::clone(&a));
        list.register(Arc::clone(&b));
        assert_eq!(list.open_count(), 2);
        b.mark_dead();
        assert_eq!(list.open_count(), 1);
    }

    #[test]
    fn try_write_skips_contended_handles() {
        let handle = DataHandle::new("a", HandleType::Btree);
        let guard = handle.try_write().expect("uncontended");
        assert!(handle.try_write().is_none());
        drop(guard);
        assert!(handle.try_write().is_some());
    }
}
