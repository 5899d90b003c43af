//! Ordered recency structure keyed by `(file_id, page_index)`.
//!
//! A slab-backed doubly-linked list (index links instead of pointers, so no
//! unsafe code) combined with a hash index for O(1) lookup. The cache hosts
//! three independent instances: `a1in`, `a1out` and `am`.
//!
//! Calls arrive under per-page locks but only a shared cache lock, so the
//! inner state sits behind a `Mutex`; each operation is atomic with respect
//! to the list itself.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use strata_types::FileId;

use crate::entry::{CacheEntry, PageKey};

/// Index into the slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotIdx(u32);

#[derive(Debug)]
struct SlotNode {
    entry: Arc<CacheEntry>,
    prev: Option<SlotIdx>,
    next: Option<SlotIdx>,
}

/// Ordered MRU→LRU list of cache entries with O(1) keyed lookup.
///
/// The head of the internal list is the LRU end, the tail the MRU end.
#[derive(Default, Debug)]
pub struct LruList {
    inner: Mutex<LruInner>,
}

#[derive(Default, Debug)]
struct LruInner {
    slots: Vec<Option<SlotNode>>,
    free_indices: Vec<u32>,
    head: Option<SlotIdx>,
    tail: Option<SlotIdx>,
    index: HashMap<PageKey, SlotIdx>,
}

impl LruList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the entry at the MRU end, or move it there if already present.
    pub fn put_to_mru(&self, entry: Arc<CacheEntry>) {
        let key = entry.page_key();
        let mut inner = self.inner.lock();
        if let Some(&idx) = inner.index.get(&key) {
            inner.move_to_tail(idx);
        } else {
            let idx = inner.push_tail(entry);
            inner.index.insert(key, idx);
        }
    }

    /// Look up an entry without changing its position.
    #[must_use]
    pub fn get(&self, file_id: FileId, page_index: u64) -> Option<Arc<CacheEntry>> {
        let inner = self.inner.lock();
        let idx = *inner.index.get(&PageKey::new(file_id, page_index))?;
        Some(Arc::clone(&inner.node(idx).entry))
    }

    /// Remove and return the entry for the key, if present.
    pub fn remove(&self, file_id: FileId, page_index: u64) -> Option<Arc<CacheEntry>> {
        let mut inner = self.inner.lock();
        let idx = inner.index.remove(&PageKey::new(file_id, page_index))?;
        Some(inner.unlink(idx))
    }

    /// Remove and return the coldest evictable entry.
    ///
    /// Entries with outstanding usages are skipped; returns `None` when the
    /// list is empty or every entry is in use.
    pub fn remove_lru(&self) -> Option<Arc<CacheEntry>> {
        let mut inner = self.inner.lock();
        let mut cursor = inner.head;
        while let Some(idx) = cursor {
            let (evictable, key, next) = {
                let node = inner.node(idx);
                (
                    node.entry.usages_count() == 0,
                    node.entry.page_key(),
                    node.next,
                )
            };
            if evictable {
                inner.index.remove(&key);
                return Some(inner.unlink(idx));
            }
            cursor = next;
        }
        None
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.slots.clear();
        inner.free_indices.clear();
        inner.head = None;
        inner.tail = None;
        inner.index.clear();
    }

    /// Snapshot of the entries in MRU→LRU order.
    #[must_use]
    pub fn entries_mru_to_lru(&self) -> Vec<Arc<CacheEntry>> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.index.len());
        let mut cursor = inner.tail;
        while let Some(idx) = cursor {
            let node = inner.node(idx);
            out.push(Arc::clone(&node.entry));
            cursor = node.prev;
        }
        out
    }
}

impl LruInner {
    fn node(&self, idx: SlotIdx) -> &SlotNode {
        self.slots[idx.0 as usize].as_ref().expect("dangling SlotIdx")
    }

    fn node_mut(&mut self, idx: SlotIdx) -> &mut SlotNode {
        self.slots[idx.0 as usize].as_mut().expect("dangling SlotIdx")
    }

    fn push_tail(&mut self, entry: Arc<CacheEntry>) -> SlotIdx {
        let idx = self.alloc_slot(entry);
        if let Some(old_tail) = self.tail {
            self.node_mut(old_tail).next = Some(idx);
            self.node_mut(idx).prev = Some(old_tail);
        } else {
            self.head = Some(idx);
        }
        self.tail = Some(idx);
        idx
    }

    /// Unlink the node and return its entry. The caller maintains `index`.
    fn unlink(&mut self, idx: SlotIdx) -> Arc<CacheEntry> {
        let node = self.slots[idx.0 as usize]
            .take()
            .expect("unlink on vacant slot");

        match (node.prev, node.next) {
            (Some(p), Some(n)) => {
                self.node_mut(p).next = Some(n);
                self.node_mut(n).prev = Some(p);
            }
            (None, Some(n)) => {
                self.node_mut(n).prev = None;
                self.head = Some(n);
            }
            (Some(p), None) => {
                self.node_mut(p).next = None;
                self.tail = Some(p);
            }
            (None, None) => {
                self.head = None;
                self.tail = None;
            }
        }

        self.free_indices.push(idx.0);
        node.entry
    }

    fn move_to_tail(&mut self, idx: SlotIdx) {
        if self.tail == Some(idx) {
            return;
        }

        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };

        match (prev, next) {
            (Some(p), Some(n)) => {
                self.node_mut(p).next = Some(n);
                self.node_mut(n).prev = Some(p);
            }
            (None, Some(n)) => {
                self.node_mut(n).prev = None;
                self.head = Some(n);
            }
            // Single element or already at the tail.
            _ => return,
        }

        let old_tail = self.tail;
        if let Some(t) = old_tail {
            self.node_mut(t).next = Some(idx);
        }
        let node = self.node_mut(idx);
        node.prev = old_tail;
        node.next = None;
        self.tail = Some(idx);
    }

    fn alloc_slot(&mut self, entry: Arc<CacheEntry>) -> SlotIdx {
        let node = SlotNode {
            entry,
            prev: None,
            next: None,
        };
        if let Some(free) = self.free_indices.pop() {
            self.slots[free as usize] = Some(node);
            SlotIdx(free)
        } else {
            let raw = u32::try_from(self.slots.len()).expect("slab overflow");
            self.slots.push(Some(node));
            SlotIdx(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(n: u32) -> FileId {
        FileId::compose(1, n)
    }

    fn entry(file_id: FileId, page_index: u64) -> Arc<CacheEntry> {
        Arc::new(CacheEntry::new(file_id, page_index, None))
    }

    fn keys(list: &LruList) -> Vec<u64> {
        list.entries_mru_to_lru()
            .iter()
            .map(|e| e.page_index())
            .collect()
    }

    #[test]
    fn put_and_get() {
        let list = LruList::new();
        let e = entry(file(1), 3);
        list.put_to_mru(Arc::clone(&e));

        let found = list.get(file(1), 3).unwrap();
        assert!(Arc::ptr_eq(&found, &e));
        assert!(list.get(file(1), 4).is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn put_existing_moves_to_mru() {
        let list = LruList::new();
        for i in 0..4 {
            list.put_to_mru(entry(file(1), i));
        }
        assert_eq!(keys(&list), vec![3, 2, 1, 0]);

        let e1 = list.get(file(1), 1).unwrap();
        list.put_to_mru(e1);
        assert_eq!(keys(&list), vec![1, 3, 2, 0]);
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn get_does_not_reorder() {
        let list = LruList::new();
        for i in 0..3 {
            list.put_to_mru(entry(file(1), i));
        }
        let _ = list.get(file(1), 0);
        assert_eq!(keys(&list), vec![2, 1, 0]);
    }

    #[test]
    fn remove_unlinks_by_key() {
        let list = LruList::new();
        for i in 0..3 {
            list.put_to_mru(entry(file(1), i));
        }
        let removed = list.remove(file(1), 1).unwrap();
        assert_eq!(removed.page_index(), 1);
        assert_eq!(keys(&list), vec![2, 0]);
        assert!(list.remove(file(1), 1).is_none());
    }

    #[test]
    fn remove_lru_takes_coldest() {
        let list = LruList::new();
        for i in 0..3 {
            list.put_to_mru(entry(file(1), i));
        }
        let removed = list.remove_lru().unwrap();
        assert_eq!(removed.page_index(), 0);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_lru_skips_entries_in_use() {
        let list = LruList::new();
        let cold = entry(file(1), 0);
        cold.increment_usages();
        list.put_to_mru(cold);
        list.put_to_mru(entry(file(1), 1));

        let removed = list.remove_lru().unwrap();
        assert_eq!(removed.page_index(), 1);
        // Only the in-use entry remains; nothing is evictable.
        assert!(list.remove_lru().is_none());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_lru_on_empty_is_none() {
        let list = LruList::new();
        assert!(list.remove_lru().is_none());
    }

    #[test]
    fn clear_empties_everything() {
        let list = LruList::new();
        for i in 0..5 {
            list.put_to_mru(entry(file(2), i));
        }
        list.clear();
        assert!(list.is_empty());
        assert!(list.get(file(2), 0).is_none());
        assert!(list.remove_lru().is_none());
    }

    #[test]
    fn slots_are_recycled() {
        let list = LruList::new();
        for round in 0..4_u64 {
            for i in 0..8 {
                list.put_to_mru(entry(file(1), round * 8 + i));
            }
            while list.remove_lru().is_some() {}
        }
        assert!(list.is_empty());
        assert!(list.inner.lock().slots.len() <= 8);
    }

    #[test]
    fn instances_are_independent() {
        let a = LruList::new();
        let b = LruList::new();
        a.put_to_mru(entry(file(1), 0));
        assert!(b.get(file(1), 0).is_none());
        assert_eq!(b.len(), 0);
    }
}
