//! Inode table: kernel node ids ↔ item ids.
//!
//! Node ids are allocated monotonically and never reused within a
//! process lifetime; the root item always holds node id 1. The table
//! is an index only: entry data lives in the metadata store, keyed by
//! item id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use onemount_core::domain::ItemId;

/// Node id of the mount root.
pub const ROOT_INO: u64 = 1;

/// Bidirectional inode ↔ item id index.
///
/// DashMap gives lock-free reads from concurrent kernel threads.
pub struct InodeTable {
    by_ino: DashMap<u64, ItemId>,
    by_id: DashMap<ItemId, u64>,
    next: AtomicU64,
}

impl InodeTable {
    /// Creates a table with `root` pinned to node id 1.
    pub fn new(root: ItemId) -> Arc<Self> {
        let table = Self {
            by_ino: DashMap::new(),
            by_id: DashMap::new(),
            next: AtomicU64::new(ROOT_INO + 1),
        };
        table.by_ino.insert(ROOT_INO, root.clone());
        table.by_id.insert(root, ROOT_INO);
        Arc::new(table)
    }

    /// Node id for an item, allocating one on first sight.
    pub fn ino_for(&self, id: &ItemId) -> u64 {
        if let Some(ino) = self.by_id.get(id) {
            return *ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        match self.by_id.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => *existing.get(),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                // The racing allocation above burns a number; ids stay
                // unique either way.
                slot.insert(ino);
                self.by_ino.insert(ino, id.clone());
                ino
            }
        }
    }

    /// Item id behind a node id.
    pub fn get(&self, ino: u64) -> Option<ItemId> {
        self.by_ino.get(&ino).map(|id| id.clone())
    }

    /// Node id of an item, if it has been seen.
    pub fn ino_of(&self, id: &ItemId) -> Option<u64> {
        self.by_id.get(id).map(|ino| *ino)
    }

    /// Drops an item's mapping. Its node id is never reused.
    pub fn remove(&self, id: &ItemId) {
        if let Some((_, ino)) = self.by_id.remove(id) {
            self.by_ino.remove(&ino);
        }
    }

    /// Moves an item's node id to a new item id (the provisional→
    /// remote exchange). The kernel keeps seeing the same node id.
    pub fn rekey(&self, old: &ItemId, new: &ItemId) {
        if let Some((_, ino)) = self.by_id.remove(old) {
            self.by_id.insert(new.clone(), ino);
            self.by_ino.insert(ino, new.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_ino_1() {
        let table = InodeTable::new(ItemId::remote("ROOT"));
        assert_eq!(table.get(ROOT_INO), Some(ItemId::remote("ROOT")));
        assert_eq!(table.ino_for(&ItemId::remote("ROOT")), ROOT_INO);
    }

    #[test]
    fn test_allocation_is_monotonic_and_stable() {
        let table = InodeTable::new(ItemId::remote("ROOT"));
        let a = table.ino_for(&ItemId::remote("A"));
        let b = table.ino_for(&ItemId::remote("B"));
        assert!(a > ROOT_INO);
        assert!(b > a);
        // Stable across calls.
        assert_eq!(table.ino_for(&ItemId::remote("A")), a);
    }

    #[test]
    fn test_removed_inos_are_never_reused() {
        let table = InodeTable::new(ItemId::remote("ROOT"));
        let a = table.ino_for(&ItemId::remote("A"));
        table.remove(&ItemId::remote("A"));
        assert!(table.get(a).is_none());
        let b = table.ino_for(&ItemId::remote("A2"));
        assert!(b > a, "node ids are never reused");
    }

    #[test]
    fn test_rekey_preserves_node_id() {
        let table = InodeTable::new(ItemId::remote("ROOT"));
        let local = ItemId::new_local();
        let ino = table.ino_for(&local);
        let remote = ItemId::remote("ASSIGNED");
        table.rekey(&local, &remote);
        assert_eq!(table.get(ino), Some(remote.clone()));
        assert_eq!(table.ino_of(&remote), Some(ino));
        assert_eq!(table.ino_of(&local), None);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        use std::thread;
        let table = InodeTable::new(ItemId::remote("ROOT"));
        let table = &table;
        thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|t| {
                    s.spawn(move || {
                        (0..100)
                            .map(|i| table.ino_for(&ItemId::remote(format!("item-{}-{}", t, i))))
                            .collect::<Vec<u64>>()
                    })
                })
                .collect();
            let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
            all.sort_unstable();
            let len = all.len();
            all.dedup();
            assert_eq!(all.len(), len, "no node id handed out twice");
        });
    }
}
