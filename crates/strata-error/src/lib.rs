use thiserror::Error;

/// Primary error type for Strata storage operations.
///
/// Structured variants for common cases; classification helpers tell callers
/// whether an error signals backpressure (retry later) or a broken caller
/// contract (fatal for the operation).
#[derive(Error, Debug)]
pub enum StrataError {
    // === Argument validation ===
    /// The requested prefetch width is zero.
    #[error("amount of pages to load from cache should be not less than 1 but passed value is {actual}")]
    InvalidPageCount { actual: usize },

    /// The configured pinned-page percentage is above the hard cap.
    #[error("percent of pinned pages cannot be more than {limit} but passed value is {actual}")]
    PinnedPercentTooHigh { actual: u32, limit: u32 },

    /// A file id belongs to a different storage than the write cache serves.
    #[error("file id {file_id} belongs to storage {file_storage_id} and is not compatible with storage {storage_id}")]
    IncompatibleFileId {
        file_id: u64,
        file_storage_id: u32,
        storage_id: u32,
    },

    // === Storage consistency ===
    /// A page slated for removal still has outstanding usages.
    #[error("page with index {page_index} for file with id {file_id} cannot be freed because it is used")]
    PageIsUsed { file_id: u64, page_index: u64 },

    /// A page tracked by the file index was not found in any queue.
    #[error("page with index {page_index} was not found in cache for file with id {file_id}")]
    PageNotFoundInCache { file_id: u64, page_index: u64 },

    // === Backpressure ===
    /// Every entry in the named queue has outstanding usages, so eviction
    /// cannot make progress.
    #[error("all cache entries in the {queue} queue are used")]
    AllCacheEntriesUsed { queue: &'static str },

    // === Budget ===
    /// A budget change would leave pinned pages over their configured share.
    #[error("cannot decrease amount of memory used by disk cache because limit of pinned pages will be more than allowed limit {percent}")]
    PinnedPagesOverBudget { percent: u32 },

    // === Cooperative waits ===
    /// The wait on the write cache's overflow check was interrupted.
    #[error("check of write cache overflow was interrupted")]
    Interrupted,

    // === I/O ===
    /// File I/O error, propagated unchanged from the write cache.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrataError {
    /// Whether the error may clear on retry once concurrent holders release
    /// their pages.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AllCacheEntriesUsed { .. } | Self::Interrupted
        )
    }

    /// Whether the error signals a caller contract violation; state up to the
    /// detection point may already be mutated and is not rolled back.
    pub const fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            Self::PageIsUsed { .. } | Self::PageNotFoundInCache { .. }
        )
    }

    /// Whether the error was rejected at the entry point with no state change.
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidPageCount { .. }
                | Self::PinnedPercentTooHigh { .. }
                | Self::IncompatibleFileId { .. }
        )
    }
}

/// Result type alias using `StrataError`.
pub type Result<T> = std::result::Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_page_is_used() {
        let err = StrataError::PageIsUsed {
            file_id: 7,
            page_index: 42,
        };
        assert_eq!(
            err.to_string(),
            "page with index 42 for file with id 7 cannot be freed because it is used"
        );
    }

    #[test]
    fn display_all_entries_used() {
        let err = StrataError::AllCacheEntriesUsed { queue: "a1in" };
        assert_eq!(err.to_string(), "all cache entries in the a1in queue are used");
    }

    #[test]
    fn display_invalid_page_count() {
        let err = StrataError::InvalidPageCount { actual: 0 };
        assert_eq!(
            err.to_string(),
            "amount of pages to load from cache should be not less than 1 but passed value is 0"
        );
    }

    #[test]
    fn classification() {
        assert!(StrataError::AllCacheEntriesUsed { queue: "am" }.is_transient());
        assert!(StrataError::Interrupted.is_transient());
        assert!(
            !StrataError::PageIsUsed {
                file_id: 1,
                page_index: 1
            }
            .is_transient()
        );

        assert!(
            StrataError::PageNotFoundInCache {
                file_id: 1,
                page_index: 0
            }
            .is_consistency_violation()
        );
        assert!(!StrataError::Interrupted.is_consistency_violation());

        assert!(StrataError::InvalidPageCount { actual: 0 }.is_invalid_argument());
        assert!(
            StrataError::IncompatibleFileId {
                file_id: 1,
                file_storage_id: 2,
                storage_id: 3
            }
            .is_invalid_argument()
        );
        assert!(!StrataError::AllCacheEntriesUsed { queue: "am" }.is_invalid_argument());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: StrataError = io_err.into();
        assert!(matches!(err, StrataError::Io(_)));
        assert!(!err.is_transient());
    }
}
