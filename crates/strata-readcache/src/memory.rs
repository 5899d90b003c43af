//! Memory-budget bookkeeping for the 2Q queues.
//!
//! [`MemoryData`] is an immutable snapshot of `(max_size, pinned_pages)` with
//! the queue bounds derived from it. Consumers that need consistency across
//! the two inputs snapshot once and derive everything from that snapshot.
//! The holding cell packs both halves into one `AtomicU64`, so replacement is
//! a single compare-exchange.

use std::sync::atomic::{AtomicU64, Ordering};

/// Immutable snapshot of the cache budget, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryData {
    max_size: u32,
    pinned_pages: u32,
}

impl MemoryData {
    #[must_use]
    pub fn new(max_size: u32, pinned_pages: u32) -> Self {
        debug_assert!(pinned_pages <= max_size, "pinned pages exceed budget");
        Self {
            max_size,
            pinned_pages,
        }
    }

    /// Total budget of the cache, in pages.
    #[inline]
    #[must_use]
    pub const fn max_size(self) -> u32 {
        self.max_size
    }

    /// Pages currently held by the pinned table.
    #[inline]
    #[must_use]
    pub const fn pinned_pages(self) -> u32 {
        self.pinned_pages
    }

    /// Budget available to the 2Q queues: `max_size - pinned_pages`.
    #[inline]
    #[must_use]
    pub const fn two_q_size(self) -> u32 {
        self.max_size - self.pinned_pages
    }

    /// Bound of the `a1in` queue: a quarter of the 2Q budget.
    #[inline]
    #[must_use]
    pub const fn k_in(self) -> u32 {
        self.two_q_size() >> 2
    }

    /// Bound of the `a1out` ghost queue: half of the 2Q budget.
    #[inline]
    #[must_use]
    pub const fn k_out(self) -> u32 {
        self.two_q_size() >> 1
    }

    const fn pack(self) -> u64 {
        ((self.max_size as u64) << 32) | self.pinned_pages as u64
    }

    const fn unpack(raw: u64) -> Self {
        Self {
            max_size: (raw >> 32) as u32,
            pinned_pages: raw as u32,
        }
    }
}

/// Atomic cell holding the current [`MemoryData`].
#[derive(Debug)]
pub(crate) struct MemoryDataContainer {
    raw: AtomicU64,
}

impl MemoryDataContainer {
    pub(crate) fn new(data: MemoryData) -> Self {
        Self {
            raw: AtomicU64::new(data.pack()),
        }
    }

    pub(crate) fn load(&self) -> MemoryData {
        MemoryData::unpack(self.raw.load(Ordering::Acquire))
    }

    /// Single compare-exchange attempt; `true` on success.
    pub(crate) fn compare_exchange(&self, current: MemoryData, new: MemoryData) -> bool {
        self.raw
            .compare_exchange(
                current.pack(),
                new.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// CAS loop applying `f` until the swap lands; returns the published data.
    pub(crate) fn update(&self, f: impl Fn(MemoryData) -> MemoryData) -> MemoryData {
        loop {
            let current = self.load();
            let new = f(current);
            if self.compare_exchange(current, new) {
                return new;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn derived_sizes() {
        let data = MemoryData::new(16, 0);
        assert_eq!(data.two_q_size(), 16);
        assert_eq!(data.k_in(), 4);
        assert_eq!(data.k_out(), 8);

        let data = MemoryData::new(16, 4);
        assert_eq!(data.two_q_size(), 12);
        assert_eq!(data.k_in(), 3);
        assert_eq!(data.k_out(), 6);
    }

    #[test]
    fn pack_round_trips() {
        let data = MemoryData::new(u32::MAX, 123);
        assert_eq!(MemoryData::unpack(data.pack()), data);
    }

    #[test]
    fn container_load_and_swap() {
        let container = MemoryDataContainer::new(MemoryData::new(8, 0));
        let current = container.load();
        assert_eq!(current.max_size(), 8);

        assert!(container.compare_exchange(current, MemoryData::new(8, 1)));
        assert_eq!(container.load().pinned_pages(), 1);

        // Stale snapshot must not win.
        assert!(!container.compare_exchange(current, MemoryData::new(8, 2)));
        assert_eq!(container.load().pinned_pages(), 1);
    }

    #[test]
    fn update_applies_under_contention() {
        let container = Arc::new(MemoryDataContainer::new(MemoryData::new(1024, 0)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let container = Arc::clone(&container);
                thread::spawn(move || {
                    for _ in 0..250 {
                        container.update(|d| MemoryData::new(d.max_size(), d.pinned_pages() + 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(container.load().pinned_pages(), 1000);
    }
}
