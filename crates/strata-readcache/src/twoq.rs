//! 2Q page cache core.
//!
//! Three recency structures drive admission: `a1in` holds recently admitted
//! resident pages, `a1out` holds ghost entries (keys without data) recently
//! evicted from `a1in`, and `am` holds pages seen at least twice. A page
//! re-accessed while parked in `a1out` is re-fetched and promoted straight to
//! `am`; a one-shot scan never gets past `a1in`, which is what makes the
//! policy scan resistant.
//!
//! # Lock hierarchy
//!
//! Acquired in this order, released in reverse:
//!
//! 1. `cache_lock` — shared by the data plane, exclusive by eviction and the
//!    storage-wide operations.
//! 2. file lock — shared for per-page operations, exclusive for file
//!    lifecycle and page allocation.
//! 3. page lock — exclusive for any mutation of an entry's queue membership,
//!    pointer or usage count. The pinned fast path skips this level: a map
//!    lookup plus an atomic usage increment.
//! 4. entry latch — held by callers between `load_*` and `release_*`.
//! 5. buffer exclusive lock — held by writers while the entry is exclusive.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use strata_error::{Result, StrataError};
use strata_types::{FileId, IncompatibleFileId};
use tracing::{info, warn};

use crate::entry::{CacheEntry, CachePointer, PageKey, PinnedPageKey};
use crate::locks::PartitionedLockManager;
use crate::lru::LruList;
use crate::memory::{MemoryData, MemoryDataContainer};
use crate::traits::{ReadCache, WriteCache};

/// File under the storage root that holds persisted cache state.
pub const CACHE_STATE_FILE: &str = "cache.stt";

/// Smallest cache capacity, in pages, when the minimum is enforced.
pub const MIN_CACHE_SIZE: u32 = 256;

/// Hard cap on the configurable pinned-page percentage.
const MAX_PERCENT_OF_PINNED_PAGES: u32 = 50;

/// Total number of times the pinned-page limit warning is emitted.
const MAX_AMOUNT_OF_WARNINGS_PINNED_PAGES: u32 = 10;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Constructor arguments of [`TwoQCache`].
#[derive(Debug, Clone)]
pub struct TwoQCacheConfig {
    /// Maximum amount of memory the cache may hold, in bytes.
    pub max_memory_bytes: u64,
    /// Page size, in bytes.
    pub page_size: usize,
    /// Raise the capacity to [`MIN_CACHE_SIZE`] pages when it normalizes
    /// below it.
    pub enforce_min_size: bool,
    /// Maximum percentage of the capacity the pinned table may hold.
    /// At most [`MAX_PERCENT_OF_PINNED_PAGES`].
    pub percent_of_pinned_pages: u32,
    /// Whether the host should report cache statistics periodically.
    pub print_statistics: bool,
    /// Reporting interval for the host's statistics loop.
    pub statistics_interval: Duration,
}

impl TwoQCacheConfig {
    /// Config with the default pinned share (20%) and statistics off.
    #[must_use]
    pub fn new(max_memory_bytes: u64, page_size: usize) -> Self {
        Self {
            max_memory_bytes,
            page_size,
            enforce_min_size: false,
            percent_of_pinned_pages: 20,
            print_statistics: false,
            statistics_interval: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of the cache counters and structural state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Load requests served since the last counter reset.
    pub cache_requests: u64,
    /// Requests served without disk I/O.
    pub cache_hits: u64,
    /// Pages currently in the admission queue.
    pub a1in_pages: usize,
    /// Ghost entries currently parked.
    pub a1out_pages: usize,
    /// Pages currently in the hot queue.
    pub am_pages: usize,
    /// Pages currently pinned.
    pub pinned_pages: u32,
    /// Cache capacity, in pages.
    pub max_size: u32,
}

impl CacheStatistics {
    /// Hit rate as a percentage; `0.0` when no requests were observed.
    #[must_use]
    pub fn hit_rate_pct(&self) -> f64 {
        if self.cache_requests == 0 {
            return 0.0;
        }
        (self.cache_hits as f64 / self.cache_requests as f64) * 100.0
    }

    /// Share of the capacity currently occupied, as a percentage.
    #[must_use]
    pub fn fill_rate_pct(&self) -> f64 {
        if self.max_size == 0 {
            return 0.0;
        }
        let resident = self.a1in_pages + self.am_pages + self.pinned_pages as usize;
        (resident as f64 / f64::from(self.max_size)) * 100.0
    }
}

// ---------------------------------------------------------------------------
// TwoQCache
// ---------------------------------------------------------------------------

/// Outcome of a queue consultation on the load path.
struct UpdateCacheResult {
    remove_cold_pages: bool,
    entry: Arc<CacheEntry>,
    cache_hit: bool,
}

/// 2Q page read cache.
///
/// See the module documentation for the queue roles and the lock hierarchy.
#[derive(Debug)]
pub struct TwoQCache {
    am: LruList,
    a1out: LruList,
    a1in: LruList,

    page_size: usize,
    percent_of_pinned_pages: u32,
    print_statistics: bool,
    statistics_interval: Duration,

    memory_data: MemoryDataContainer,
    pinned_pages_warning_counter: AtomicU32,

    cache_requests: AtomicU64,
    cache_hits: AtomicU64,

    cache_lock: RwLock<()>,
    file_locks: PartitionedLockManager<FileId>,
    page_locks: PartitionedLockManager<PageKey>,

    /// Every page index tracked for a file, across all four locations.
    file_pages: Mutex<HashMap<FileId, HashSet<u64>>>,
    pinned_pages: Mutex<HashMap<PinnedPageKey, Arc<CacheEntry>>>,
}

impl TwoQCache {
    /// Build a cache from its configuration.
    ///
    /// Fails when the pinned-page percentage exceeds
    /// [`MAX_PERCENT_OF_PINNED_PAGES`].
    pub fn new(config: TwoQCacheConfig) -> Result<Self> {
        if config.percent_of_pinned_pages > MAX_PERCENT_OF_PINNED_PAGES {
            return Err(StrataError::PinnedPercentTooHigh {
                actual: config.percent_of_pinned_pages,
                limit: MAX_PERCENT_OF_PINNED_PAGES,
            });
        }
        debug_assert!(config.page_size > 0, "page size must be positive");

        let mut normalized = Self::normalize_memory(config.max_memory_bytes, config.page_size);
        if config.enforce_min_size && normalized < MIN_CACHE_SIZE {
            normalized = MIN_CACHE_SIZE;
        }

        Ok(Self {
            am: LruList::new(),
            a1out: LruList::new(),
            a1in: LruList::new(),
            page_size: config.page_size,
            percent_of_pinned_pages: config.percent_of_pinned_pages,
            print_statistics: config.print_statistics,
            statistics_interval: config.statistics_interval,
            memory_data: MemoryDataContainer::new(MemoryData::new(normalized, 0)),
            pinned_pages_warning_counter: AtomicU32::new(0),
            cache_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_lock: RwLock::new(()),
            file_locks: PartitionedLockManager::new(),
            page_locks: PartitionedLockManager::new(),
            file_pages: Mutex::new(HashMap::new()),
            pinned_pages: Mutex::new(HashMap::new()),
        })
    }

    /// Change the memory budget. The pinned share must stay within its
    /// percentage under the new size.
    ///
    /// Shrinking stays passive: queues above the new budget are trimmed by
    /// the next admission, not here.
    pub fn change_maximum_amount_of_memory(&self, max_memory_bytes: u64) -> Result<()> {
        let new_size = Self::normalize_memory(max_memory_bytes, self.page_size);
        loop {
            let memory_data = self.memory_data.load();
            if memory_data.max_size() == new_size {
                return Ok(());
            }
            if new_size == 0
                || 100 * u64::from(memory_data.pinned_pages()) / u64::from(new_size)
                    > u64::from(self.percent_of_pinned_pages)
            {
                return Err(StrataError::PinnedPagesOverBudget {
                    percent: self.percent_of_pinned_pages,
                });
            }
            let new_data = MemoryData::new(new_size, memory_data.pinned_pages());
            if self.memory_data.compare_exchange(memory_data, new_data) {
                info!(
                    old_size = memory_data.max_size(),
                    new_size, "disk cache size changed"
                );
                return Ok(());
            }
        }
    }

    /// Snapshot of counters and queue sizes.
    #[must_use]
    pub fn statistics(&self) -> CacheStatistics {
        let memory_data = self.memory_data.load();
        CacheStatistics {
            cache_requests: self.cache_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            a1in_pages: self.a1in.len(),
            a1out_pages: self.a1out.len(),
            am_pages: self.am.len(),
            pinned_pages: memory_data.pinned_pages(),
            max_size: memory_data.max_size(),
        }
    }

    /// Emit the statistics line and reset the interval counters. Driven by
    /// the host's scheduler at [`Self::statistics_interval`] when
    /// [`Self::statistics_enabled`] is set.
    pub fn log_statistics(&self) {
        let requests = self.cache_requests.load(Ordering::Relaxed);
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let memory_data = self.memory_data.load();

        let hit_pct: i64 = if requests > 0 {
            (100 * hits / requests) as i64
        } else {
            -1
        };
        let resident =
            (self.am.len() + self.a1in.len()) as u64 + u64::from(memory_data.pinned_pages());
        let size_pct = 100 * resident / u64::from(memory_data.max_size().max(1));
        info!(
            cache_hits_pct = hit_pct,
            cache_size_pct = size_pct,
            "read cache statistics"
        );

        self.cache_requests.fetch_sub(requests, Ordering::Relaxed);
        self.cache_hits.fetch_sub(hits, Ordering::Relaxed);
    }

    /// Whether the host should run the periodic statistics loop.
    #[must_use]
    pub fn statistics_enabled(&self) -> bool {
        self.print_statistics
    }

    /// Interval for the host's statistics loop.
    #[must_use]
    pub fn statistics_interval(&self) -> Duration {
        self.statistics_interval
    }

    fn normalize_memory(max_memory_bytes: u64, page_size: usize) -> u32 {
        let pages = max_memory_bytes / page_size as u64;
        if pages >= i32::MAX as u64 {
            i32::MAX as u32
        } else {
            pages as u32
        }
    }

    fn incompatible(err: IncompatibleFileId) -> StrataError {
        StrataError::IncompatibleFileId {
            file_id: err.file_id,
            file_storage_id: err.file_storage_id,
            storage_id: err.storage_id,
        }
    }

    // -- Load path ----------------------------------------------------------

    fn do_load(
        &self,
        file_id: FileId,
        page_index: u64,
        check_pinned_pages: bool,
        write_cache: &dyn WriteCache,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let file_id = file_id
            .checked_for_storage(write_cache.id())
            .map_err(Self::incompatible)?;
        if page_count < 1 {
            return Err(StrataError::InvalidPageCount { actual: page_count });
        }

        let result = {
            let _cache_guard = self.cache_lock.read();
            let _file_guard = self.file_locks.acquire_shared(&file_id);
            self.load_locked(
                file_id,
                page_index,
                check_pinned_pages,
                false,
                write_cache,
                page_count,
                verify_checksums,
            )?
        };
        let Some(result) = result else {
            return Ok(None);
        };

        if result.remove_cold_pages {
            if let Err(err) = self.remove_coldest_pages_if_needed(write_cache) {
                // Eviction failed after the usage was taken; hand the usage
                // back so the entry does not leak as permanently pinned.
                self.do_release(&result.entry);
                return Err(err);
            }
        }

        self.cache_requests.fetch_add(1, Ordering::Relaxed);
        if result.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }

        Ok(Some(result.entry))
    }

    /// Load body run under the cache lock and a file lock held by the caller.
    #[allow(clippy::too_many_arguments)]
    fn load_locked(
        &self,
        file_id: FileId,
        page_index: u64,
        check_pinned_pages: bool,
        add_new_pages: bool,
        write_cache: &dyn WriteCache,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<UpdateCacheResult>> {
        if check_pinned_pages {
            if let Some(entry) = self.pinned_lookup(file_id, page_index) {
                entry.increment_usages();
                return Ok(Some(UpdateCacheResult {
                    remove_cold_pages: false,
                    entry,
                    cache_hit: true,
                }));
            }
        }

        let page_keys: Vec<PageKey> = (0..page_count as u64)
            .map(|i| PageKey::new(file_id, page_index + i))
            .collect();
        let _page_guards = self.page_locks.acquire_exclusive_batch(&page_keys);

        let pinned = if check_pinned_pages {
            self.pinned_lookup(file_id, page_index)
        } else {
            None
        };

        let result = match pinned {
            Some(entry) => UpdateCacheResult {
                remove_cold_pages: false,
                entry,
                cache_hit: true,
            },
            None => {
                match self.update_cache(
                    file_id,
                    page_index,
                    add_new_pages,
                    write_cache,
                    page_count,
                    verify_checksums,
                )? {
                    Some(result) => result,
                    None => return Ok(None),
                }
            }
        };

        result.entry.increment_usages();
        Ok(Some(result))
    }

    /// Consult the queues for the primary page and admit any prefetched
    /// siblings. Caller holds the page locks for every touched key.
    fn update_cache(
        &self,
        file_id: FileId,
        page_index: u64,
        add_new_pages: bool,
        write_cache: &dyn WriteCache,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<UpdateCacheResult>> {
        debug_assert!(page_count > 0);

        if let Some(entry) = self.am.get(file_id, page_index) {
            debug_assert!(self.is_tracked(file_id, page_index));
            self.am.put_to_mru(Arc::clone(&entry));
            return Ok(Some(UpdateCacheResult {
                remove_cold_pages: false,
                entry,
                cache_hit: true,
            }));
        }

        if let Some(entry) = self.a1out.remove(file_id, page_index) {
            debug_assert!(self.is_tracked(file_id, page_index));

            let loaded = write_cache.load(
                file_id,
                page_index,
                page_count,
                false,
                verify_checksums,
            )?;
            let mut pointers = loaded.pointers.into_iter();
            let pointer = pointers
                .next()
                .expect("ghost page vanished from the write cache");

            debug_assert!(entry.cache_pointer().is_none());
            entry.set_cache_pointer(pointer);
            self.am.put_to_mru(Arc::clone(&entry));

            let mut remove_cold_pages = true;
            for extra in pointers {
                remove_cold_pages = self.process_fetched_page(remove_cold_pages, extra);
            }
            return Ok(Some(UpdateCacheResult {
                remove_cold_pages,
                entry,
                cache_hit: loaded.cache_hit,
            }));
        }

        if let Some(entry) = self.a1in.get(file_id, page_index) {
            debug_assert!(self.is_tracked(file_id, page_index));
            return Ok(Some(UpdateCacheResult {
                remove_cold_pages: false,
                entry,
                cache_hit: true,
            }));
        }

        let loaded = write_cache.load(
            file_id,
            page_index,
            page_count,
            add_new_pages,
            verify_checksums,
        )?;
        let mut pointers = loaded.pointers.into_iter();
        let Some(pointer) = pointers.next() else {
            // The page does not exist and allocation was not requested.
            return Ok(None);
        };

        let entry = self.admit_new_entry(file_id, page_index, pointer);
        let mut remove_cold_pages = true;
        for extra in pointers {
            remove_cold_pages = self.process_fetched_page(remove_cold_pages, extra);
        }
        Ok(Some(UpdateCacheResult {
            remove_cold_pages,
            entry,
            cache_hit: loaded.cache_hit,
        }))
    }

    /// Place a prefetched sibling page. The resident copy is authoritative:
    /// a pointer for a page already in `am`, `a1in` or the pinned table is
    /// dropped on the spot.
    fn process_fetched_page(&self, remove_cold_pages: bool, pointer: Arc<CachePointer>) -> bool {
        let file_id = pointer.file_id();
        let page_index = pointer.page_index();

        if self
            .pinned_pages
            .lock()
            .contains_key(&PinnedPageKey::new(file_id, page_index))
        {
            pointer.decrement_readers_referrer();
            return remove_cold_pages;
        }

        if let Some(entry) = self.am.get(file_id, page_index) {
            self.am.put_to_mru(entry);
            pointer.decrement_readers_referrer();
            return remove_cold_pages;
        }

        if let Some(ghost) = self.a1out.remove(file_id, page_index) {
            debug_assert!(ghost.cache_pointer().is_none());
            ghost.set_cache_pointer(pointer);
            self.am.put_to_mru(ghost);
            return true;
        }

        if self.a1in.get(file_id, page_index).is_some() {
            pointer.decrement_readers_referrer();
            return remove_cold_pages;
        }

        self.admit_new_entry(file_id, page_index, pointer);
        true
    }

    fn admit_new_entry(
        &self,
        file_id: FileId,
        page_index: u64,
        pointer: Arc<CachePointer>,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry::new(file_id, page_index, Some(pointer)));
        self.a1in.put_to_mru(Arc::clone(&entry));
        self.file_pages
            .lock()
            .entry(file_id)
            .or_default()
            .insert(page_index);
        entry
    }

    // -- Release path --------------------------------------------------------

    fn do_release(&self, entry: &Arc<CacheEntry>) {
        let _cache_guard = self.cache_lock.read();
        let _file_guard = self.file_locks.acquire_shared(&entry.file_id());
        let _page_guard = self.page_locks.acquire_exclusive(&entry.page_key());
        let remaining = entry.decrement_usages();
        debug_assert!(remaining >= 0, "usage count underflow");
    }

    // -- Eviction -------------------------------------------------------------

    /// Bring `|a1in| + |am|` back within the 2Q budget.
    ///
    /// May be called with no locks held. The write cache gets a chance to
    /// drain pending flushes before the exclusive critical section.
    fn remove_coldest_pages_if_needed(&self, write_cache: &dyn WriteCache) -> Result<()> {
        let memory_data = self.memory_data.load();
        let two_q_size = memory_data.two_q_size() as usize;

        if self.am.len() + self.a1in.len() > two_q_size {
            write_cache.check_cache_overflow()?;
        }

        let _cache_guard = self.cache_lock.write();
        while self.am.len() + self.a1in.len() > two_q_size {
            if self.a1in.len() > memory_data.k_in() as usize {
                let Some(removed) = self.a1in.remove_lru() else {
                    return Err(StrataError::AllCacheEntriesUsed { queue: "a1in" });
                };
                debug_assert_eq!(removed.usages_count(), 0);

                // The pointer can already be detached on entries restored
                // without data; those skip the reference decrement.
                if let Some(pointer) = removed.clear_cache_pointer() {
                    pointer.decrement_readers_referrer();
                }
                self.a1out.put_to_mru(removed);

                while self.a1out.len() > memory_data.k_out() as usize {
                    let ghost = self
                        .a1out
                        .remove_lru()
                        .expect("a1out above its bound cannot be empty");
                    debug_assert_eq!(ghost.usages_count(), 0);
                    debug_assert!(ghost.cache_pointer().is_none());
                    self.forget_file_page(ghost.file_id(), ghost.page_index());
                }
            } else {
                let Some(removed) = self.am.remove_lru() else {
                    return Err(StrataError::AllCacheEntriesUsed { queue: "am" });
                };
                debug_assert_eq!(removed.usages_count(), 0);

                if let Some(pointer) = removed.clear_cache_pointer() {
                    pointer.decrement_readers_referrer();
                }
                self.forget_file_page(removed.file_id(), removed.page_index());
            }
        }
        Ok(())
    }

    fn forget_file_page(&self, file_id: FileId, page_index: u64) {
        if let Some(pages) = self.file_pages.lock().get_mut(&file_id) {
            pages.remove(&page_index);
        }
    }

    // -- Lookup / removal helpers ---------------------------------------------

    fn lookup_entry(&self, file_id: FileId, page_index: u64) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.am.get(file_id, page_index) {
            debug_assert!(self.is_tracked(file_id, page_index));
            return Some(entry);
        }
        if let Some(entry) = self.a1out.get(file_id, page_index) {
            debug_assert!(self.is_tracked(file_id, page_index));
            return Some(entry);
        }
        self.a1in.get(file_id, page_index)
    }

    fn pinned_lookup(&self, file_id: FileId, page_index: u64) -> Option<Arc<CacheEntry>> {
        self.pinned_pages
            .lock()
            .get(&PinnedPageKey::new(file_id, page_index))
            .cloned()
    }

    /// Extract the entry from whichever queue holds it. An entry with more
    /// usages than the caller's own is not extractable.
    fn extract_entry(
        &self,
        file_id: FileId,
        page_index: u64,
    ) -> Result<Option<Arc<CacheEntry>>> {
        if let Some(entry) = self.am.remove(file_id, page_index) {
            if entry.usages_count() > 1 {
                return Err(StrataError::PageIsUsed {
                    file_id: file_id.raw(),
                    page_index,
                });
            }
            return Ok(Some(entry));
        }
        if let Some(entry) = self.a1out.remove(file_id, page_index) {
            return Ok(Some(entry));
        }
        if let Some(entry) = self.a1in.remove(file_id, page_index) {
            if entry.usages_count() > 1 {
                return Err(StrataError::PageIsUsed {
                    file_id: file_id.raw(),
                    page_index,
                });
            }
            return Ok(Some(entry));
        }
        Ok(None)
    }

    fn is_tracked(&self, file_id: FileId, page_index: u64) -> bool {
        self.file_pages
            .lock()
            .get(&file_id)
            .is_some_and(|pages| pages.contains(&page_index))
    }

    // -- Per-file and storage-wide clearing ------------------------------------

    /// Drop every tracked page of a file. Caller holds the file lock
    /// exclusively or the cache lock exclusively.
    fn clear_file_locked(&self, file_id: FileId) -> Result<()> {
        let page_indexes: Vec<u64> = {
            let file_pages = self.file_pages.lock();
            match file_pages.get(&file_id) {
                Some(pages) if !pages.is_empty() => pages.iter().copied().collect(),
                _ => {
                    debug_assert!(self.lookup_entry(file_id, 0).is_none());
                    return Ok(());
                }
            }
        };

        for page_index in page_indexes {
            let entry = self
                .lookup_entry(file_id, page_index)
                .or_else(|| self.pinned_lookup(file_id, page_index));
            let Some(entry) = entry else {
                return Err(StrataError::PageNotFoundInCache {
                    file_id: file_id.raw(),
                    page_index,
                });
            };
            if entry.usages_count() != 0 {
                return Err(StrataError::PageIsUsed {
                    file_id: file_id.raw(),
                    page_index,
                });
            }

            let removed = match self.extract_entry(file_id, page_index)? {
                Some(removed) => removed,
                None => {
                    let pinned = self
                        .pinned_pages
                        .lock()
                        .remove(&PinnedPageKey::new(file_id, page_index))
                        .expect("page was just observed in the pinned table");
                    self.memory_data
                        .update(|d| MemoryData::new(d.max_size(), d.pinned_pages() - 1));
                    pinned
                }
            };

            if let Some(pointer) = removed.clear_cache_pointer() {
                pointer.decrement_readers_referrer();
            }
        }

        debug_assert!(self.lookup_entry(file_id, 0).is_none());
        if let Some(pages) = self.file_pages.lock().get_mut(&file_id) {
            pages.clear();
        }
        Ok(())
    }

    /// Drop all cached content. Caller holds the cache lock exclusively.
    fn clear_cache_content(&self) -> Result<()> {
        for entry in self.am.entries_mru_to_lru() {
            if entry.usages_count() != 0 {
                return Err(StrataError::PageIsUsed {
                    file_id: entry.file_id().raw(),
                    page_index: entry.page_index(),
                });
            }
            if let Some(pointer) = entry.clear_cache_pointer() {
                pointer.decrement_readers_referrer();
            }
        }
        for entry in self.a1in.entries_mru_to_lru() {
            if entry.usages_count() != 0 {
                return Err(StrataError::PageIsUsed {
                    file_id: entry.file_id().raw(),
                    page_index: entry.page_index(),
                });
            }
            if let Some(pointer) = entry.clear_cache_pointer() {
                pointer.decrement_readers_referrer();
            }
        }

        self.a1out.clear();
        self.am.clear();
        self.a1in.clear();

        for pages in self.file_pages.lock().values_mut() {
            pages.clear();
        }

        self.clear_pinned_pages()
    }

    fn clear_pinned_pages(&self) -> Result<()> {
        let entries: Vec<Arc<CacheEntry>> = self.pinned_pages.lock().values().cloned().collect();
        for entry in entries {
            if entry.usages_count() != 0 {
                return Err(StrataError::PageIsUsed {
                    file_id: entry.file_id().raw(),
                    page_index: entry.page_index(),
                });
            }
            if let Some(pointer) = entry.clear_cache_pointer() {
                pointer.decrement_readers_referrer();
            }
            self.memory_data
                .update(|d| MemoryData::new(d.max_size(), d.pinned_pages() - 1));
        }
        self.pinned_pages.lock().clear();
        Ok(())
    }

    // -- Test hooks -------------------------------------------------------------

    #[cfg(test)]
    fn in_pinned_pages(&self, file_id: FileId, page_index: u64) -> bool {
        self.pinned_pages
            .lock()
            .contains_key(&PinnedPageKey::new(file_id, page_index))
    }
}

impl ReadCache for TwoQCache {
    fn add_file(&self, name: &str, write_cache: &dyn WriteCache) -> Result<FileId> {
        let _cache_guard = self.cache_lock.write();
        let file_id = write_cache.add_file(name)?;
        let old = self.file_pages.lock().insert(file_id, HashSet::new());
        debug_assert!(
            old.is_none_or(|pages| pages.is_empty()),
            "file registered while pages were still tracked"
        );
        Ok(file_id)
    }

    fn add_file_with_id(
        &self,
        name: &str,
        file_id: FileId,
        write_cache: &dyn WriteCache,
    ) -> Result<FileId> {
        let file_id = file_id
            .checked_for_storage(write_cache.id())
            .map_err(Self::incompatible)?;

        let _cache_guard = self.cache_lock.write();
        let file_id = write_cache.add_file_with_id(name, file_id)?;
        let old = self.file_pages.lock().insert(file_id, HashSet::new());
        debug_assert!(
            old.is_none_or(|pages| pages.is_empty()),
            "file registered while pages were still tracked"
        );
        Ok(file_id)
    }

    fn load_for_read(
        &self,
        file_id: FileId,
        page_index: u64,
        check_pinned_pages: bool,
        write_cache: &dyn WriteCache,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let Some(entry) = self.do_load(
            file_id,
            page_index,
            check_pinned_pages,
            write_cache,
            page_count,
            verify_checksums,
        )?
        else {
            return Ok(None);
        };

        entry.acquire_shared_lock();
        Ok(Some(entry))
    }

    fn release_from_read(&self, entry: &Arc<CacheEntry>, _write_cache: &dyn WriteCache) {
        entry.release_shared_lock();
        self.do_release(entry);
    }

    fn load_for_write(
        &self,
        file_id: FileId,
        page_index: u64,
        check_pinned_pages: bool,
        write_cache: &dyn WriteCache,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>> {
        let Some(entry) = self.do_load(
            file_id,
            page_index,
            check_pinned_pages,
            write_cache,
            page_count,
            verify_checksums,
        )?
        else {
            return Ok(None);
        };

        entry.acquire_exclusive_lock();
        let pointer = entry
            .cache_pointer()
            .expect("loaded entry must have a page buffer attached");
        pointer.acquire_exclusive_lock();
        entry.mark_dirty();
        write_cache.update_dirty_pages_table(&pointer);
        Ok(Some(entry))
    }

    fn release_from_write(&self, entry: &Arc<CacheEntry>, write_cache: &dyn WriteCache) {
        let pointer = entry
            .cache_pointer()
            .expect("entry released from write must have a page buffer attached");

        {
            let _cache_guard = self.cache_lock.read();
            let _file_guard = self.file_locks.acquire_shared(&entry.file_id());
            let _page_guard = self.page_locks.acquire_exclusive(&entry.page_key());
            let remaining = entry.decrement_usages();
            debug_assert!(remaining >= 0, "usage count underflow");
            write_cache.store(entry.file_id(), entry.page_index(), &pointer);
        }

        entry.release_exclusive_lock();
        // The buffer's exclusive lock is released only after the write cache
        // has recorded the page; a flush between the two steps would drop the
        // dirty-pages table entry before the write cache saw this update and
        // lose the change after recovery.
        pointer.release_exclusive_lock();
    }

    fn pin_page(&self, entry: &Arc<CacheEntry>, write_cache: &dyn WriteCache) -> Result<()> {
        let memory_data = self.memory_data.load();
        let pinned = u64::from(memory_data.pinned_pages());
        let max_size = u64::from(memory_data.max_size());

        if max_size == 0
            || 100 * (pinned + 1) / max_size > u64::from(self.percent_of_pinned_pages)
        {
            if self.pinned_pages_warning_counter.load(Ordering::Relaxed)
                < MAX_AMOUNT_OF_WARNINGS_PINNED_PAGES
            {
                let warnings = self
                    .pinned_pages_warning_counter
                    .fetch_add(1, Ordering::Relaxed);
                if warnings < MAX_AMOUNT_OF_WARNINGS_PINNED_PAGES {
                    warn!(
                        file_id = %entry.file_id(),
                        page_index = entry.page_index(),
                        "maximum amount of pinned pages is reached, the page will not be \
                         pinned; consider raising the pinned pages percentage"
                    );
                }
            }
            return Ok(());
        }

        {
            let _cache_guard = self.cache_lock.read();
            let _file_guard = self.file_locks.acquire_shared(&entry.file_id());
            let _page_guard = self.page_locks.acquire_exclusive(&entry.page_key());
            self.extract_entry(entry.file_id(), entry.page_index())?;
            self.pinned_pages.lock().insert(
                PinnedPageKey::new(entry.file_id(), entry.page_index()),
                Arc::clone(entry),
            );
        }

        self.memory_data
            .update(|d| MemoryData::new(d.max_size(), d.pinned_pages() + 1));

        self.remove_coldest_pages_if_needed(write_cache)
    }

    fn allocate_new_page(
        &self,
        file_id: FileId,
        write_cache: &dyn WriteCache,
        verify_checksums: bool,
    ) -> Result<Arc<CacheEntry>> {
        let file_id = file_id
            .checked_for_storage(write_cache.id())
            .map_err(Self::incompatible)?;

        let result = {
            let _cache_guard = self.cache_lock.read();
            let _file_guard = self.file_locks.acquire_exclusive(&file_id);
            let filled_up_to = write_cache.filled_up_to(file_id)?;
            self.load_locked(
                file_id,
                filled_up_to,
                false,
                true,
                write_cache,
                1,
                verify_checksums,
            )?
        };

        self.cache_requests.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);

        let result =
            result.expect("write cache must materialize a page when allocation is requested");

        if result.remove_cold_pages {
            if let Err(err) = self.remove_coldest_pages_if_needed(write_cache) {
                self.do_release(&result.entry);
                return Err(err);
            }
        }

        let entry = result.entry;
        entry.acquire_exclusive_lock();
        let pointer = entry
            .cache_pointer()
            .expect("allocated entry must have a page buffer attached");
        pointer.acquire_exclusive_lock();
        entry.mark_dirty();
        write_cache.update_dirty_pages_table(&pointer);
        Ok(entry)
    }

    fn truncate_file(&self, file_id: FileId, write_cache: &dyn WriteCache) -> Result<()> {
        let file_id = file_id
            .checked_for_storage(write_cache.id())
            .map_err(Self::incompatible)?;

        let _cache_guard = self.cache_lock.read();
        let _file_guard = self.file_locks.acquire_exclusive(&file_id);
        write_cache.truncate_file(file_id)?;
        self.clear_file_locked(file_id)
    }

    fn close_file(
        &self,
        file_id: FileId,
        flush: bool,
        write_cache: &dyn WriteCache,
    ) -> Result<()> {
        let file_id = file_id
            .checked_for_storage(write_cache.id())
            .map_err(Self::incompatible)?;

        let _cache_guard = self.cache_lock.read();
        let _file_guard = self.file_locks.acquire_exclusive(&file_id);
        write_cache.close_file(file_id, flush)?;
        self.clear_file_locked(file_id)
    }

    fn delete_file(&self, file_id: FileId, write_cache: &dyn WriteCache) -> Result<()> {
        let file_id = file_id
            .checked_for_storage(write_cache.id())
            .map_err(Self::incompatible)?;

        let _cache_guard = self.cache_lock.read();
        let _file_guard = self.file_locks.acquire_exclusive(&file_id);
        self.clear_file_locked(file_id)?;
        self.file_pages.lock().remove(&file_id);
        write_cache.delete_file(file_id)
    }

    fn clear(&self) -> Result<()> {
        let _cache_guard = self.cache_lock.write();
        self.clear_cache_content()
    }

    fn close_storage(&self, write_cache: &dyn WriteCache) -> Result<()> {
        let _cache_guard = self.cache_lock.write();
        for file_id in write_cache.close()? {
            self.clear_file_locked(file_id)?;
        }
        Ok(())
    }

    fn delete_storage(&self, write_cache: &dyn WriteCache) -> Result<()> {
        let _cache_guard = self.cache_lock.write();
        for file_id in write_cache.delete()? {
            self.clear_file_locked(file_id)?;
        }

        let state_file = write_cache.root_directory().join(CACHE_STATE_FILE);
        if state_file.exists() {
            std::fs::remove_file(&state_file)?;
        }
        Ok(())
    }

    fn load_cache_state(&self, _write_cache: &dyn WriteCache) {
        // Warm-cache state is reserved but not consumed; load traffic
        // repopulates the queues.
    }

    fn store_cache_state(&self, _write_cache: &dyn WriteCache) {
        // Warm-cache state is reserved but not produced.
    }

    fn used_memory(&self) -> u64 {
        (self.am.len() + self.a1in.len()) as u64 * self.page_size as u64
    }
}
