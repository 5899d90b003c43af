use std::fmt;

/// Identifier of a file managed by a storage's write cache.
///
/// The 64-bit value is composed: the high 32 bits carry the id of the owning
/// storage, the low 32 bits the file's slot inside that storage. Ids received
/// from outside the storage may carry a zero storage half; they are bound to
/// a concrete storage with [`FileId::checked_for_storage`] before use.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct FileId(u64);

impl FileId {
    /// Compose a file id from a storage id and a storage-internal file slot.
    #[inline]
    #[must_use]
    pub const fn compose(storage_id: u32, internal_id: u32) -> Self {
        Self(((storage_id as u64) << 32) | internal_id as u64)
    }

    /// Wrap a raw 64-bit id as received from callers.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The storage half of the id.
    #[inline]
    #[must_use]
    pub const fn storage_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The storage-internal file slot.
    #[inline]
    #[must_use]
    pub const fn internal_id(self) -> u32 {
        self.0 as u32
    }

    /// Bind this id to the given storage.
    ///
    /// An id with a zero storage half is adopted by the storage; an id that
    /// already names `storage_id` passes through. An id naming a different
    /// storage is rejected.
    pub const fn checked_for_storage(
        self,
        storage_id: u32,
    ) -> Result<Self, IncompatibleFileId> {
        let own = self.storage_id();
        if own == 0 {
            Ok(Self::compose(storage_id, self.internal_id()))
        } else if own == storage_id {
            Ok(self)
        } else {
            Err(IncompatibleFileId {
                file_id: self.0,
                file_storage_id: own,
                storage_id,
            })
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for FileId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Error returned when a file id names a storage other than the one serving
/// the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncompatibleFileId {
    pub file_id: u64,
    pub file_storage_id: u32,
    pub storage_id: u32,
}

impl fmt::Display for IncompatibleFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "file id {} belongs to storage {} and is not compatible with storage {}",
            self.file_id, self.file_storage_id, self.storage_id
        )
    }
}

impl std::error::Error for IncompatibleFileId {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_round_trips_halves() {
        let id = FileId::compose(3, 17);
        assert_eq!(id.storage_id(), 3);
        assert_eq!(id.internal_id(), 17);
        assert_eq!(id.raw(), (3_u64 << 32) | 17);
    }

    #[test]
    fn unbound_id_is_adopted() {
        let id = FileId::from_raw(5);
        let bound = id.checked_for_storage(9).unwrap();
        assert_eq!(bound, FileId::compose(9, 5));
    }

    #[test]
    fn matching_storage_passes_through() {
        let id = FileId::compose(9, 5);
        assert_eq!(id.checked_for_storage(9).unwrap(), id);
    }

    #[test]
    fn foreign_storage_is_rejected() {
        let id = FileId::compose(2, 5);
        let err = id.checked_for_storage(9).unwrap_err();
        assert_eq!(err.file_storage_id, 2);
        assert_eq!(err.storage_id, 9);
        assert_eq!(
            err.to_string(),
            format!(
                "file id {} belongs to storage 2 and is not compatible with storage 9",
                id.raw()
            )
        );
    }

    #[test]
    fn ordering_is_by_raw_value() {
        let a = FileId::compose(1, 2);
        let b = FileId::compose(1, 3);
        let c = FileId::compose(2, 0);
        assert!(a < b);
        assert!(b < c);
    }
}
