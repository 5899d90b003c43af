//! 2Q disk-page read cache for the Strata storage engine.
//!
//! Sits between callers that need fixed-size pages of a file and the write
//! cache that owns the physical page buffers. Admission follows the 2Q
//! policy: pages enter the `a1in` queue on first access, park as ghost
//! entries in `a1out` after eviction, and graduate to the hot `am` queue on
//! re-access, which keeps one-shot scans from flushing the hot set.
//!
//! The cache enforces a page-denominated memory budget, supports a small
//! pinned-page set exempt from eviction, and serves concurrent readers and
//! writers through a partitioned lock hierarchy (global cache lock → file
//! lock → page lock → entry latch → buffer lock).

pub mod entry;
pub mod locks;
pub mod lru;
pub mod memory;
pub mod traits;
pub mod twoq;

pub use entry::{CacheEntry, CachePointer, PageKey, PinnedPageKey};
pub use lru::LruList;
pub use memory::MemoryData;
pub use traits::{LoadedPages, ReadCache, WriteCache};
pub use twoq::{CACHE_STATE_FILE, CacheStatistics, MIN_CACHE_SIZE, TwoQCache, TwoQCacheConfig};
