//! Resident-page bookkeeping: addressing keys, the externally owned page
//! buffer reference ([`CachePointer`]) and the per-page cache record
//! ([`CacheEntry`]).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use strata_types::FileId;

use crate::locks::PageLatch;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Addressing tuple of a page inside the cache queues.
///
/// Ordering is lexicographic on `(file_id, page_index)`; batched page-lock
/// acquisition relies on this being a total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey {
    pub file_id: FileId,
    pub page_index: u64,
}

impl PageKey {
    #[inline]
    #[must_use]
    pub const fn new(file_id: FileId, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }
}

/// Key of the pinned-page table. Same shape as [`PageKey`] but a distinct
/// type, so pinned-table keys cannot be mixed up with queue keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PinnedPageKey {
    pub file_id: FileId,
    pub page_index: u64,
}

impl PinnedPageKey {
    #[inline]
    #[must_use]
    pub const fn new(file_id: FileId, page_index: u64) -> Self {
        Self {
            file_id,
            page_index,
        }
    }
}

// ---------------------------------------------------------------------------
// CachePointer
// ---------------------------------------------------------------------------

/// Reference to a page buffer owned by the write cache.
///
/// The read cache never allocates or frees buffers: it holds exactly one
/// reader reference per pointer attached to a resident entry and drops that
/// reference on eviction. Writers take the pointer's exclusive lock for the
/// whole span between `load_for_write` and `release_from_write`; the lock is
/// released only after the write cache has recorded the page, which keeps the
/// dirty-pages table and the write cache content in step.
pub struct CachePointer {
    file_id: FileId,
    page_index: u64,
    readers_referrer: AtomicI32,
    exclusive_latch: PageLatch,
    data: RwLock<Vec<u8>>,
}

impl CachePointer {
    /// Wrap a buffer handed out by the write cache. The creator holds the
    /// initial reader reference.
    #[must_use]
    pub fn new(file_id: FileId, page_index: u64, data: Vec<u8>) -> Self {
        Self {
            file_id,
            page_index,
            readers_referrer: AtomicI32::new(1),
            exclusive_latch: PageLatch::new(),
            data: RwLock::new(data),
        }
    }

    #[inline]
    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    #[inline]
    #[must_use]
    pub fn page_index(&self) -> u64 {
        self.page_index
    }

    /// Register one more reader reference.
    #[inline]
    pub fn increment_readers_referrer(&self) {
        self.readers_referrer.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reader reference.
    #[inline]
    pub fn decrement_readers_referrer(&self) {
        let prev = self.readers_referrer.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "readers referrer underflow");
    }

    /// Current reader reference count.
    #[inline]
    #[must_use]
    pub fn readers_referrer_count(&self) -> i32 {
        self.readers_referrer.load(Ordering::Acquire)
    }

    /// Take the buffer's exclusive write lock.
    pub fn acquire_exclusive_lock(&self) {
        self.exclusive_latch.acquire_exclusive();
    }

    /// Release the buffer's exclusive write lock.
    pub fn release_exclusive_lock(&self) {
        self.exclusive_latch.release_exclusive();
    }

    /// Whether the exclusive write lock is currently held.
    #[must_use]
    pub fn is_exclusively_locked(&self) -> bool {
        self.exclusive_latch.is_exclusively_locked()
    }

    /// Read access to the page bytes.
    pub fn data(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.data.read()
    }

    /// Write access to the page bytes.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.data.write()
    }
}

impl fmt::Debug for CachePointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePointer")
            .field("file_id", &self.file_id)
            .field("page_index", &self.page_index)
            .field(
                "readers_referrer",
                &self.readers_referrer.load(Ordering::Relaxed),
            )
            .field("data_len", &self.data.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// One resident (or ghost) page of the cache.
///
/// The pointer is attached while the entry sits in `a1in`, `am` or the pinned
/// table and detached while it parks in `a1out`. Queue membership, pointer
/// swaps and the usage count are only mutated under the entry's page lock;
/// the usage count itself is atomic so the pinned fast path can bump it
/// without the page lock.
pub struct CacheEntry {
    file_id: FileId,
    page_index: u64,
    pointer: Mutex<Option<Arc<CachePointer>>>,
    usages: AtomicI32,
    dirty: AtomicBool,
    latch: PageLatch,
}

impl CacheEntry {
    #[must_use]
    pub fn new(file_id: FileId, page_index: u64, pointer: Option<Arc<CachePointer>>) -> Self {
        Self {
            file_id,
            page_index,
            pointer: Mutex::new(pointer),
            usages: AtomicI32::new(0),
            dirty: AtomicBool::new(false),
            latch: PageLatch::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    #[inline]
    #[must_use]
    pub fn page_index(&self) -> u64 {
        self.page_index
    }

    #[inline]
    #[must_use]
    pub fn page_key(&self) -> PageKey {
        PageKey::new(self.file_id, self.page_index)
    }

    /// The attached buffer reference, if any.
    #[must_use]
    pub fn cache_pointer(&self) -> Option<Arc<CachePointer>> {
        self.pointer.lock().clone()
    }

    /// Attach a buffer reference to a ghost entry.
    pub(crate) fn set_cache_pointer(&self, pointer: Arc<CachePointer>) {
        let mut slot = self.pointer.lock();
        debug_assert!(slot.is_none(), "pointer already attached");
        *slot = Some(pointer);
    }

    /// Detach and return the buffer reference.
    pub(crate) fn clear_cache_pointer(&self) -> Option<Arc<CachePointer>> {
        self.pointer.lock().take()
    }

    /// Number of concurrent holders; `> 0` guarantees non-evictability.
    #[inline]
    #[must_use]
    pub fn usages_count(&self) -> i32 {
        self.usages.load(Ordering::Acquire)
    }

    pub(crate) fn increment_usages(&self) {
        self.usages.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count after the decrement.
    pub(crate) fn decrement_usages(&self) -> i32 {
        self.usages.fetch_sub(1, Ordering::AcqRel) - 1
    }

    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Mark the page as modified; cleared by the write cache after flush.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Take the entry latch in shared mode (read access).
    pub fn acquire_shared_lock(&self) {
        self.latch.acquire_shared();
    }

    pub fn release_shared_lock(&self) {
        self.latch.release_shared();
    }

    /// Take the entry latch in exclusive mode (write access).
    pub fn acquire_exclusive_lock(&self) {
        self.latch.acquire_exclusive();
    }

    pub fn release_exclusive_lock(&self) {
        self.latch.release_exclusive();
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("file_id", &self.file_id)
            .field("page_index", &self.page_index)
            .field("usages", &self.usages.load(Ordering::Relaxed))
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .field("has_pointer", &self.pointer.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(n: u32) -> FileId {
        FileId::compose(1, n)
    }

    #[test]
    fn page_key_orders_lexicographically() {
        let a = PageKey::new(file(1), 5);
        let b = PageKey::new(file(1), 6);
        let c = PageKey::new(file(2), 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn pointer_reference_bookkeeping() {
        let pointer = CachePointer::new(file(1), 0, vec![0_u8; 64]);
        assert_eq!(pointer.readers_referrer_count(), 1);
        pointer.increment_readers_referrer();
        assert_eq!(pointer.readers_referrer_count(), 2);
        pointer.decrement_readers_referrer();
        pointer.decrement_readers_referrer();
        assert_eq!(pointer.readers_referrer_count(), 0);
    }

    #[test]
    fn pointer_exclusive_lock_visible() {
        let pointer = CachePointer::new(file(1), 0, vec![]);
        assert!(!pointer.is_exclusively_locked());
        pointer.acquire_exclusive_lock();
        assert!(pointer.is_exclusively_locked());
        pointer.release_exclusive_lock();
        assert!(!pointer.is_exclusively_locked());
    }

    #[test]
    fn pointer_data_round_trip() {
        let pointer = CachePointer::new(file(1), 3, vec![0_u8; 8]);
        pointer.data_mut()[0] = 0xAB;
        assert_eq!(pointer.data()[0], 0xAB);
        assert_eq!(pointer.page_index(), 3);
    }

    #[test]
    fn entry_usage_counting() {
        let entry = CacheEntry::new(file(1), 7, None);
        assert_eq!(entry.usages_count(), 0);
        entry.increment_usages();
        entry.increment_usages();
        assert_eq!(entry.usages_count(), 2);
        assert_eq!(entry.decrement_usages(), 1);
        assert_eq!(entry.decrement_usages(), 0);
    }

    #[test]
    fn entry_pointer_attach_detach() {
        let entry = CacheEntry::new(file(2), 9, None);
        assert!(entry.cache_pointer().is_none());

        let pointer = Arc::new(CachePointer::new(file(2), 9, vec![]));
        entry.set_cache_pointer(Arc::clone(&pointer));
        assert!(entry.cache_pointer().is_some());

        let detached = entry.clear_cache_pointer().unwrap();
        assert!(Arc::ptr_eq(&detached, &pointer));
        assert!(entry.cache_pointer().is_none());
    }

    #[test]
    fn entry_dirty_flag() {
        let entry = CacheEntry::new(file(1), 0, None);
        assert!(!entry.is_dirty());
        entry.mark_dirty();
        assert!(entry.is_dirty());
        entry.clear_dirty();
        assert!(!entry.is_dirty());
    }

    #[test]
    fn entry_latch_modes() {
        let entry = CacheEntry::new(file(1), 0, None);
        entry.acquire_shared_lock();
        entry.release_shared_lock();
        entry.acquire_exclusive_lock();
        entry.release_exclusive_lock();
    }
}
