//! The read-cache facade and the write-cache collaborator contract.
//!
//! The read cache owns residency and eviction; the write cache owns the
//! physical page buffers, dirty-page tracking and all disk I/O. Pointers
//! returned by [`WriteCache::load`] arrive with one reader reference already
//! held, which the read cache either keeps (page admitted) or drops (page
//! already resident).

use std::path::PathBuf;
use std::sync::Arc;

use strata_error::Result;
use strata_types::FileId;

use crate::entry::{CacheEntry, CachePointer};

/// Result of a [`WriteCache::load`] call.
///
/// `pointers` holds 0..`page_count` buffers starting at the requested index;
/// an empty vector means the primary page does not exist and allocation was
/// not requested. `cache_hit` is true iff the primary page was served
/// without disk I/O inside the write cache.
#[derive(Debug)]
pub struct LoadedPages {
    pub pointers: Vec<Arc<CachePointer>>,
    pub cache_hit: bool,
}

/// The lower-level write cache the read cache delegates to.
pub trait WriteCache: Send + Sync {
    /// Id of the storage this write cache serves; file ids are bound to it.
    fn id(&self) -> u32;

    /// Root directory of the storage, home of the persisted cache state file.
    fn root_directory(&self) -> PathBuf;

    /// Register a file and return its composed id.
    fn add_file(&self, name: &str) -> Result<FileId>;

    /// Register a file under a caller-chosen id.
    fn add_file_with_id(&self, name: &str, file_id: FileId) -> Result<FileId>;

    /// Materialize up to `page_count` contiguous pages starting at
    /// `start_index`. See [`LoadedPages`] for the result contract.
    fn load(
        &self,
        file_id: FileId,
        start_index: u64,
        page_count: usize,
        allocate_new_pages: bool,
        verify_checksums: bool,
    ) -> Result<LoadedPages>;

    /// Accept a dirty page for asynchronous write-back.
    fn store(&self, file_id: FileId, page_index: u64, pointer: &Arc<CachePointer>);

    /// Record the page in the dirty-pages table used by recovery.
    fn update_dirty_pages_table(&self, pointer: &Arc<CachePointer>);

    /// Number of pages the file currently holds.
    fn filled_up_to(&self, file_id: FileId) -> Result<u64>;

    fn truncate_file(&self, file_id: FileId) -> Result<()>;

    fn close_file(&self, file_id: FileId, flush: bool) -> Result<()>;

    /// Close every file; returns the ids whose cached pages must be dropped.
    fn close(&self) -> Result<Vec<FileId>>;

    fn delete_file(&self, file_id: FileId) -> Result<()>;

    /// Delete every file; returns the ids whose cached pages must be dropped.
    fn delete(&self) -> Result<Vec<FileId>>;

    /// Cooperatively wait while the write cache drains pending flushes. May
    /// block; an interrupted wait surfaces as [`strata_error::StrataError::Interrupted`].
    fn check_cache_overflow(&self) -> Result<()>;
}

/// Public surface of the page read cache.
///
/// Entries returned from `load_for_read`/`load_for_write`/`allocate_new_page`
/// carry an acquired entry latch (shared for read, exclusive for write) and
/// one usage. The caller must hand the entry back through the matching
/// `release_*`, which drops both. The entry stays valid and its buffer
/// pinned for as long as its usage count is above zero.
pub trait ReadCache: Send + Sync {
    fn add_file(&self, name: &str, write_cache: &dyn WriteCache) -> Result<FileId>;

    fn add_file_with_id(
        &self,
        name: &str,
        file_id: FileId,
        write_cache: &dyn WriteCache,
    ) -> Result<FileId>;

    /// Load a page for reading. `Ok(None)` means the page does not exist.
    fn load_for_read(
        &self,
        file_id: FileId,
        page_index: u64,
        check_pinned_pages: bool,
        write_cache: &dyn WriteCache,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>>;

    fn release_from_read(&self, entry: &Arc<CacheEntry>, write_cache: &dyn WriteCache);

    /// Load a page for writing: like [`Self::load_for_read`] but the entry
    /// comes back exclusively latched, marked dirty and registered in the
    /// write cache's dirty-pages table.
    fn load_for_write(
        &self,
        file_id: FileId,
        page_index: u64,
        check_pinned_pages: bool,
        write_cache: &dyn WriteCache,
        page_count: usize,
        verify_checksums: bool,
    ) -> Result<Option<Arc<CacheEntry>>>;

    fn release_from_write(&self, entry: &Arc<CacheEntry>, write_cache: &dyn WriteCache);

    /// Exempt the entry from eviction, subject to the pinned-page budget.
    fn pin_page(&self, entry: &Arc<CacheEntry>, write_cache: &dyn WriteCache) -> Result<()>;

    /// Append a page to the file and return it as a dirty, exclusively
    /// latched entry.
    fn allocate_new_page(
        &self,
        file_id: FileId,
        write_cache: &dyn WriteCache,
        verify_checksums: bool,
    ) -> Result<Arc<CacheEntry>>;

    fn truncate_file(&self, file_id: FileId, write_cache: &dyn WriteCache) -> Result<()>;

    fn close_file(&self, file_id: FileId, flush: bool, write_cache: &dyn WriteCache)
    -> Result<()>;

    fn delete_file(&self, file_id: FileId, write_cache: &dyn WriteCache) -> Result<()>;

    /// Drop every cached page; fails if any entry is still in use.
    fn clear(&self) -> Result<()>;

    fn close_storage(&self, write_cache: &dyn WriteCache) -> Result<()>;

    fn delete_storage(&self, write_cache: &dyn WriteCache) -> Result<()>;

    /// Reserved: warm-cache state is not restored. Kept for interface
    /// compatibility.
    fn load_cache_state(&self, write_cache: &dyn WriteCache);

    /// Reserved: warm-cache state is not persisted. Kept for interface
    /// compatibility.
    fn store_cache_state(&self, write_cache: &dyn WriteCache);

    /// Bytes held by resident (non-pinned) pages.
    fn used_memory(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Both traits must stay object safe; the cache core is handed around as
    // `&dyn WriteCache` and the facade as `&dyn ReadCache`.
    fn _assert_write_cache_object_safe(_: &dyn WriteCache) {}
    fn _assert_read_cache_object_safe(_: &dyn ReadCache) {}

    #[test]
    fn loaded_pages_empty_means_missing() {
        let loaded = LoadedPages {
            pointers: Vec::new(),
            cache_hit: false,
        };
        assert!(loaded.pointers.is_empty());
        assert!(!loaded.cache_hit);
    }
}
