//! Lock primitives for the cache: a shared/exclusive latch with explicit
//! acquire/release, and a partitioned lock manager for per-file and per-page
//! locking.
//!
//! Guard-scoped locks do not fit the entry lifecycle — a caller acquires an
//! entry's latch in `load_for_read` and releases it in `release_from_read`,
//! possibly on another thread — so [`PageLatch`] exposes the acquire/release
//! pairs directly and tracks state in a `Mutex` + `Condvar`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Number of lock partitions. Power of two so the hash can be masked.
const DEFAULT_PARTITION_COUNT: usize = 64;

// ---------------------------------------------------------------------------
// PageLatch
// ---------------------------------------------------------------------------

/// A shared/exclusive latch held across call boundaries.
///
/// State is a single counter: `-1` means exclusively held, `0` free, and a
/// positive value counts shared holders. Release is not tied to the acquiring
/// thread.
#[derive(Debug, Default)]
pub struct PageLatch {
    state: Mutex<i32>,
    gate: Condvar,
}

impl PageLatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no exclusive holder remains, then join the shared holders.
    pub fn acquire_shared(&self) {
        let mut state = self.state.lock();
        while *state < 0 {
            self.gate.wait(&mut state);
        }
        *state += 1;
    }

    /// Drop one shared hold.
    pub fn release_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(*state > 0, "release_shared without a shared hold");
        *state -= 1;
        if *state == 0 {
            self.gate.notify_all();
        }
    }

    /// Block until the latch is free, then take it exclusively.
    pub fn acquire_exclusive(&self) {
        let mut state = self.state.lock();
        while *state != 0 {
            self.gate.wait(&mut state);
        }
        *state = -1;
    }

    /// Drop the exclusive hold.
    pub fn release_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(*state, -1, "release_exclusive without the exclusive hold");
        *state = 0;
        self.gate.notify_all();
    }

    /// Whether the latch is currently held exclusively.
    #[must_use]
    pub fn is_exclusively_locked(&self) -> bool {
        *self.state.lock() == -1
    }
}

// ---------------------------------------------------------------------------
// PartitionedLockManager
// ---------------------------------------------------------------------------

/// Partitioned reader-writer lock table keyed by hash.
///
/// Distinct keys rarely contend: each key maps to one of
/// [`DEFAULT_PARTITION_COUNT`] partitions and locks that partition. Two keys
/// in the same partition share a lock, which is safe (coarser) but never
/// wrong.
#[derive(Debug)]
pub struct PartitionedLockManager<K> {
    partitions: Box<[RwLock<()>]>,
    _key: PhantomData<fn(&K)>,
}

impl<K: Hash> PartitionedLockManager<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITION_COUNT)
    }

    /// Create a manager with `partitions` rounded up to a power of two.
    #[must_use]
    pub fn with_partitions(partitions: usize) -> Self {
        let count = partitions.max(1).next_power_of_two();
        let partitions = (0..count).map(|_| RwLock::new(())).collect::<Vec<_>>();
        Self {
            partitions: partitions.into_boxed_slice(),
            _key: PhantomData,
        }
    }

    fn partition_index(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) & (self.partitions.len() - 1)
    }

    /// Acquire the key's partition in shared mode.
    pub fn acquire_shared(&self, key: &K) -> RwLockReadGuard<'_, ()> {
        self.partitions[self.partition_index(key)].read()
    }

    /// Acquire the key's partition in exclusive mode.
    pub fn acquire_exclusive(&self, key: &K) -> RwLockWriteGuard<'_, ()> {
        self.partitions[self.partition_index(key)].write()
    }

    /// Acquire exclusive locks covering every key in `keys`.
    ///
    /// The keys collapse to their distinct partitions, which are locked in
    /// ascending partition order. Every acquirer — single-key or batch —
    /// reaches partitions in that same order, so batches cannot deadlock
    /// against each other.
    pub fn acquire_exclusive_batch(&self, keys: &[K]) -> Vec<RwLockWriteGuard<'_, ()>> {
        let mut indexes: Vec<usize> = keys.iter().map(|k| self.partition_index(k)).collect();
        indexes.sort_unstable();
        indexes.dedup();
        indexes
            .into_iter()
            .map(|i| self.partitions[i].write())
            .collect()
    }
}

impl<K: Hash> Default for PartitionedLockManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn latch_counts_shared_holders() {
        let latch = PageLatch::new();
        latch.acquire_shared();
        latch.acquire_shared();
        assert!(!latch.is_exclusively_locked());
        latch.release_shared();
        latch.release_shared();

        latch.acquire_exclusive();
        assert!(latch.is_exclusively_locked());
        latch.release_exclusive();
        assert!(!latch.is_exclusively_locked());
    }

    #[test]
    fn latch_exclusive_waits_for_readers() {
        let latch = Arc::new(PageLatch::new());
        let order = Arc::new(AtomicUsize::new(0));

        latch.acquire_shared();

        let writer = {
            let latch = Arc::clone(&latch);
            let order = Arc::clone(&order);
            thread::spawn(move || {
                latch.acquire_exclusive();
                order.fetch_add(1, Ordering::SeqCst);
                latch.release_exclusive();
            })
        };

        // The writer must still be parked while the shared hold exists.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(order.load(Ordering::SeqCst), 0);

        latch.release_shared();
        writer.join().unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn latch_release_on_other_thread() {
        let latch = Arc::new(PageLatch::new());
        latch.acquire_exclusive();

        let releaser = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.release_exclusive())
        };
        releaser.join().unwrap();

        latch.acquire_exclusive();
        latch.release_exclusive();
    }

    #[test]
    fn batch_collapses_duplicate_partitions() {
        let manager: PartitionedLockManager<u64> = PartitionedLockManager::with_partitions(1);
        // Every key maps to the single partition; the batch must still return
        // exactly one guard instead of self-deadlocking.
        let guards = manager.acquire_exclusive_batch(&[1, 2, 3, 4]);
        assert_eq!(guards.len(), 1);
    }

    #[test]
    fn batch_guards_cover_all_keys() {
        let manager: PartitionedLockManager<u64> = PartitionedLockManager::with_partitions(64);
        let keys: Vec<u64> = (0..16).collect();
        let guards = manager.acquire_exclusive_batch(&keys);
        assert!(!guards.is_empty());
        assert!(guards.len() <= keys.len());
    }

    #[test]
    fn concurrent_batches_make_progress() {
        let manager: Arc<PartitionedLockManager<u64>> =
            Arc::new(PartitionedLockManager::with_partitions(8));
        let done = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let manager = Arc::clone(&manager);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    for round in 0..200_u64 {
                        let keys: Vec<u64> = (0..8).map(|i| t * 31 + round + i).collect();
                        let _guards = manager.acquire_exclusive_batch(&keys);
                    }
                    done.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn shared_locks_do_not_exclude_each_other() {
        let manager: PartitionedLockManager<u64> = PartitionedLockManager::with_partitions(1);
        let a = manager.acquire_shared(&1);
        let b = manager.acquire_shared(&2);
        drop(a);
        drop(b);
    }
}
