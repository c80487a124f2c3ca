//! Linear-probing hash table with an explicit growth protocol.
//!
//! Inserts never block: when the table wants to grow and the non-blocking
//! allocation fails, the growth is recorded as deferred and the table keeps
//! operating above its load threshold. The owner later allocates a
//! [`SlotBlock`] with the blocking primitive outside its lock and hands it
//! back through [`ProbeTable::commit_block`].

use crate::vfs::Allocator;
use std::mem;
use std::sync::Arc;

/// A fixed-size record stored inline in the table.
pub trait TableEntry: Copy {
    type Key: Copy + Eq;

    /// The empty-slot marker.
    const VACANT: Self;

    /// `None` for vacant slots.
    fn key(&self) -> Option<Self::Key>;

    fn hash_key(key: &Self::Key) -> u64;
}

/// Slot storage obtained from an [`Allocator`], freed back to it on drop.
pub struct SlotBlock<E> {
    slots: Vec<E>,
    bytes: usize,
    alloc: Arc<dyn Allocator>,
}

impl<E: TableEntry> SlotBlock<E> {
    fn bytes_for(slot_count: usize) -> Option<usize> {
        slot_count.checked_mul(mem::size_of::<E>())
    }

    fn build(slot_count: usize, bytes: usize, alloc: Arc<dyn Allocator>) -> Option<Self> {
        let mut slots = Vec::new();
        if slots.try_reserve_exact(slot_count).is_err() {
            alloc.free(bytes);
            return None;
        }
        slots.resize(slot_count, E::VACANT);
        Some(Self {
            slots,
            bytes,
            alloc,
        })
    }

    /// Blocking allocation of `slot_count` vacant slots.
    pub fn allocate(alloc: Arc<dyn Allocator>, slot_count: usize) -> Option<Self> {
        let bytes = Self::bytes_for(slot_count)?;
        if !alloc.alloc(bytes) {
            return None;
        }
        Self::build(slot_count, bytes, alloc)
    }

    fn allocate_nowait(alloc: Arc<dyn Allocator>, slot_count: usize) -> Option<Self> {
        let bytes = Self::bytes_for(slot_count)?;
        if !alloc.alloc_nowait(bytes) {
            return None;
        }
        Self::build(slot_count, bytes, alloc)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

impl<E> Drop for SlotBlock<E> {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.alloc.free(self.bytes);
        }
    }
}

/// Returned when no vacant slot is left for a new key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableFull;

pub struct ProbeTable<E: TableEntry> {
    storage: SlotBlock<E>,
    len: usize,
    deferred_grow: Option<usize>,
}

impl<E: TableEntry> ProbeTable<E> {
    /// Creates a table with `capacity` slots (rounded up to a power of two)
    /// using a blocking allocation.
    pub fn with_capacity(alloc: Arc<dyn Allocator>, capacity: usize) -> Option<Self> {
        let capacity = capacity.max(2).checked_next_power_of_two()?;
        let storage = SlotBlock::allocate(alloc, capacity)?;
        Some(Self {
            storage,
            len: 0,
            deferred_grow: None,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.storage.slots.len()
    }

    fn mask(&self) -> usize {
        self.capacity() - 1
    }

    fn home_slot(&self, key: &E::Key) -> usize {
        let hash = E::hash_key(key);
        (hash ^ (hash >> 29)) as usize & self.mask()
    }

    fn over_threshold(count: usize, capacity: usize) -> bool {
        count.saturating_mul(4) > capacity.saturating_mul(3)
    }

    fn position(&self, key: &E::Key) -> Option<usize> {
        let mask = self.mask();
        let mut index = self.home_slot(key);
        for _ in 0..self.capacity() {
            match self.storage.slots[index].key() {
                None => return None,
                Some(found) if found == *key => return Some(index),
                Some(_) => index = (index + 1) & mask,
            }
        }
        None
    }

    pub fn find(&self, key: &E::Key) -> Option<&E> {
        self.position(key).map(|index| &self.storage.slots[index])
    }

    pub fn find_mut(&mut self, key: &E::Key) -> Option<&mut E> {
        let index = self.position(key)?;
        Some(&mut self.storage.slots[index])
    }

    /// Inserts or replaces the entry with the same key, without blocking.
    ///
    /// Growth that cannot be satisfied without blocking is recorded and
    /// reported by [`ProbeTable::take_deferred_grow`].
    pub fn insert(&mut self, entry: E) -> Result<(), TableFull> {
        let Some(key) = entry.key() else {
            return Ok(());
        };

        if let Some(existing) = self.find_mut(&key) {
            *existing = entry;
            return Ok(());
        }

        if Self::over_threshold(self.len + 1, self.capacity()) {
            self.grow_nowait();
        }

        // One slot always stays vacant so probing terminates.
        if self.len + 1 >= self.capacity() {
            return Err(TableFull);
        }

        self.place(entry, key);
        self.len += 1;
        Ok(())
    }

    fn place(&mut self, entry: E, key: E::Key) {
        let mask = self.mask();
        let mut index = self.home_slot(&key);
        while self.storage.slots[index].key().is_some() {
            index = (index + 1) & mask;
        }
        self.storage.slots[index] = entry;
    }

    fn grow_nowait(&mut self) {
        let Some(wanted) = self.capacity().checked_mul(2) else {
            return;
        };
        let alloc = Arc::clone(&self.storage.alloc);
        match SlotBlock::allocate_nowait(alloc, wanted) {
            Some(block) => self.rehash_into(block),
            None => {
                let pending = self.deferred_grow.unwrap_or(0).max(wanted);
                self.deferred_grow = Some(pending);
            }
        }
    }

    fn rehash_into(&mut self, block: SlotBlock<E>) {
        let old = mem::replace(&mut self.storage, block);
        for entry in old.slots.iter().copied() {
            if let Some(key) = entry.key() {
                self.place(entry, key);
            }
        }
        if let Some(pending) = self.deferred_grow {
            if pending <= self.capacity() {
                self.deferred_grow = None;
            }
        }
    }

    /// Removes the entry for `key`, keeping probe sequences intact by
    /// shifting later entries of the cluster back.
    pub fn remove(&mut self, key: &E::Key) -> Option<E> {
        let mut hole = self.position(key)?;
        let removed = mem::replace(&mut self.storage.slots[hole], E::VACANT);
        self.len -= 1;

        let mask = self.mask();
        let mut next = hole;
        loop {
            next = (next + 1) & mask;
            let Some(next_key) = self.storage.slots[next].key() else {
                break;
            };
            let home = self.home_slot(&next_key);
            let stays = if hole <= next {
                hole < home && home <= next
            } else {
                hole < home || home <= next
            };
            if !stays {
                self.storage.slots[hole] = self.storage.slots[next];
                self.storage.slots[next] = E::VACANT;
                hole = next;
            }
        }
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.storage.slots.fill(E::VACANT);
        self.len = 0;
    }

    /// Visits every occupied entry. The callback must not change keys.
    pub fn for_each_mut(&mut self, mut visit: impl FnMut(&mut E)) {
        for entry in self.storage.slots.iter_mut() {
            if entry.key().is_some() {
                visit(entry);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.storage.slots.iter().filter(|e| e.key().is_some())
    }

    /// Slot count of a growth that failed without blocking, if any.
    pub fn take_deferred_grow(&mut self) -> Option<usize> {
        self.deferred_grow.take()
    }

    pub fn allocator(&self) -> Arc<dyn Allocator> {
        Arc::clone(&self.storage.alloc)
    }

    /// Grows into a block allocated outside the lock.
    ///
    /// Returns the block when the table does not need it (anymore); dropping
    /// it frees the memory.
    pub fn commit_block(&mut self, block: SlotBlock<E>) -> Option<SlotBlock<E>> {
        let still_needed = block.slot_count() > self.capacity()
            && Self::over_threshold(self.len + 1, self.capacity());
        if !still_needed {
            return Some(block);
        }
        self.rehash_into(block);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::PressureAllocator;
    use crate::vfs::SystemAllocator;

    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct TestEntry {
        key: u64,
        value: u32,
    }

    impl TableEntry for TestEntry {
        type Key = u64;
        const VACANT: Self = TestEntry { key: 0, value: 0 };

        fn key(&self) -> Option<u64> {
            (self.key != 0).then_some(self.key)
        }

        // Deliberately weak so tests get long collision clusters.
        fn hash_key(key: &u64) -> u64 {
            key % 4
        }
    }

    fn entry(key: u64, value: u32) -> TestEntry {
        TestEntry { key, value }
    }

    fn table(capacity: usize) -> ProbeTable<TestEntry> {
        ProbeTable::with_capacity(Arc::new(SystemAllocator::new()), capacity).unwrap()
    }

    #[test]
    fn test_capacity_rounds_to_power_of_two() {
        assert_eq!(table(10).capacity(), 16);
        assert_eq!(table(16).capacity(), 16);
    }

    #[test]
    fn test_insert_find_update() {
        let mut t = table(16);
        t.insert(entry(1, 10)).unwrap();
        t.insert(entry(5, 50)).unwrap();
        assert_eq!(t.find(&1).unwrap().value, 10);
        assert_eq!(t.find(&5).unwrap().value, 50);

        t.insert(entry(1, 11)).unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.find(&1).unwrap().value, 11);
        assert!(t.find(&9).is_none());
    }

    #[test]
    fn test_remove_keeps_cluster_reachable() {
        let mut t = table(16);
        // 4, 8 and 12 share a home slot with 16; 1 lands inside the cluster.
        for key in [4, 8, 12, 16, 1, 5] {
            t.insert(entry(key, key as u32)).unwrap();
        }
        assert_eq!(t.remove(&8).unwrap().value, 8);
        for key in [4, 12, 16, 1, 5] {
            assert_eq!(t.find(&key).unwrap().value, key as u32, "key {}", key);
        }
        assert!(t.find(&8).is_none());
        assert_eq!(t.len(), 5);
        assert!(t.remove(&8).is_none());
    }

    #[test]
    fn test_remove_wrapping_cluster() {
        let mut t = table(4);
        // Both keys home at the last slot, so 7 wraps around to slot 0.
        t.insert(entry(3, 3)).unwrap();
        t.insert(entry(7, 7)).unwrap();
        assert_eq!(t.remove(&3).unwrap().value, 3);
        assert_eq!(t.find(&7).unwrap().value, 7);
    }

    #[test]
    fn test_grows_at_load_threshold() {
        let mut t = table(8);
        for key in 1..=7 {
            t.insert(entry(key, 0)).unwrap();
        }
        assert_eq!(t.capacity(), 16);
        assert!(t.take_deferred_grow().is_none());
        for key in 1..=7 {
            assert!(t.find(&key).is_some());
        }
    }

    #[test]
    fn test_failed_nowait_grow_is_deferred() {
        let alloc = Arc::new(PressureAllocator::new());
        let mut t: ProbeTable<TestEntry> =
            ProbeTable::with_capacity(alloc.clone(), 8).unwrap();
        alloc.set_nowait_fails(true);

        for key in 1..=7 {
            t.insert(entry(key, 0)).unwrap();
        }
        assert_eq!(t.capacity(), 8);
        assert_eq!(t.len(), 7);
        assert_eq!(t.insert(entry(100, 0)), Err(TableFull));
        assert_eq!(t.take_deferred_grow(), Some(16));
        assert_eq!(t.take_deferred_grow(), None);
    }

    #[test]
    fn test_commit_block_grows_table() {
        let alloc = Arc::new(PressureAllocator::new());
        let mut t: ProbeTable<TestEntry> =
            ProbeTable::with_capacity(alloc.clone(), 8).unwrap();
        alloc.set_nowait_fails(true);
        for key in 1..=7 {
            t.insert(entry(key, key as u32)).unwrap();
        }
        let wanted = t.take_deferred_grow().unwrap();

        let block = SlotBlock::allocate(t.allocator(), wanted).unwrap();
        assert!(t.commit_block(block).is_none());
        assert_eq!(t.capacity(), 16);
        for key in 1..=7 {
            assert_eq!(t.find(&key).unwrap().value, key as u32);
        }
        assert_eq!(alloc.outstanding_bytes(), 16 * mem::size_of::<TestEntry>());
    }

    #[test]
    fn test_commit_block_returns_unneeded_block() {
        let alloc = Arc::new(PressureAllocator::new());
        let mut t: ProbeTable<TestEntry> =
            ProbeTable::with_capacity(alloc.clone(), 8).unwrap();
        t.insert(entry(1, 1)).unwrap();

        let block = SlotBlock::allocate(t.allocator(), 16).unwrap();
        let unused = t.commit_block(block);
        assert!(unused.is_some());
        drop(unused);
        assert_eq!(t.capacity(), 8);
        assert_eq!(alloc.outstanding_bytes(), 8 * mem::size_of::<TestEntry>());
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut t = table(32);
        for key in 1..=10 {
            t.insert(entry(key, 0)).unwrap();
        }
        t.clear();
        assert!(t.is_empty());
        assert_eq!(t.capacity(), 32);
        assert!(t.find(&3).is_none());
    }

    #[test]
    fn test_for_each_mut_and_iter() {
        let mut t = table(16);
        for key in 1..=4 {
            t.insert(entry(key, 1)).unwrap();
        }
        t.for_each_mut(|e| {
            if e.key % 2 == 0 {
                e.value = 2;
            }
        });
        let total: u32 = t.iter().map(|e| e.value).sum();
        assert_eq!(total, 6);
    }

    #[test]
    fn test_drop_frees_storage() {
        let alloc = Arc::new(SystemAllocator::new());
        {
            let mut t: ProbeTable<TestEntry> =
                ProbeTable::with_capacity(alloc.clone(), 8).unwrap();
            for key in 1..=20 {
                t.insert(entry(key, 0)).unwrap();
            }
            assert!(alloc.outstanding_bytes() > 0);
        }
        assert_eq!(alloc.outstanding_bytes(), 0);
    }
}
