//! Address-keyed map of resident extents.

use std::collections::HashMap;

use lodestore_primitives::PhysicalAddr;

use crate::extent::{ExtentArena, ExtentId};

/// Mapping `paddr -> extent`, keys unique. At most one non-invalid extent
/// per physical address is resident; the root lives under its reserved
/// pseudo-address.
///
/// The index holds one strong count per entry; callers route insert/erase
/// through [`crate::Cache`] so the counts stay balanced.
#[derive(Default)]
pub(crate) struct ExtentIndex {
    by_paddr: HashMap<PhysicalAddr, ExtentId>,
    total_bytes: u64,
}

impl ExtentIndex {
    pub fn insert(&mut self, arena: &mut ExtentArena, id: ExtentId) {
        let extent = arena.extent(id);
        let paddr = extent.paddr();
        let length = extent.length();
        debug_assert!(paddr.is_real_location());
        let prev = self.by_paddr.insert(paddr, id);
        assert!(prev.is_none(), "duplicate extent at {paddr}");
        self.total_bytes += length as u64;
        arena.retain(id);
    }

    pub fn erase(&mut self, arena: &mut ExtentArena, id: ExtentId) {
        let extent = arena.extent(id);
        let paddr = extent.paddr();
        let length = extent.length();
        let removed = self.by_paddr.remove(&paddr);
        assert_eq!(removed, Some(id), "index entry mismatch at {paddr}");
        self.total_bytes -= length as u64;
        arena.release(id);
    }

    /// Atomic swap of `prev` for `next` under the same key.
    ///
    /// Preconditions: same paddr, same length, `next.version == prev.version + 1`.
    pub fn replace(&mut self, arena: &mut ExtentArena, next: ExtentId, prev: ExtentId) {
        let (paddr, length, prev_version) = {
            let p = arena.extent(prev);
            (p.paddr(), p.length(), p.version())
        };
        {
            let n = arena.extent(next);
            assert_eq!(n.paddr(), paddr);
            assert_eq!(n.length(), length);
            assert_eq!(n.version(), prev_version + 1);
        }
        let slot = self
            .by_paddr
            .get_mut(&paddr)
            .unwrap_or_else(|| panic!("replace of unindexed extent at {paddr}"));
        assert_eq!(*slot, prev);
        *slot = next;
        arena.retain(next);
        arena.release(prev);
    }

    pub fn find(&self, paddr: PhysicalAddr) -> Option<ExtentId> {
        self.by_paddr.get(&paddr).copied()
    }

    pub fn len(&self) -> usize {
        self.by_paddr.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = ExtentId> + '_ {
        self.by_paddr.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{Extent, ExtentState};
    use lodestore_primitives::ExtentType;

    fn block(paddr: PhysicalAddr, len: usize) -> Extent {
        Extent::new(ExtentType::TestBlock, paddr, None, ExtentState::Clean, vec![0; len])
    }

    #[test]
    fn insert_find_erase() {
        let mut arena = ExtentArena::new();
        let mut index = ExtentIndex::default();
        let paddr = PhysicalAddr::RandomBlock { offset: 0x1000 };

        let id = arena.insert(block(paddr, 4096));
        index.insert(&mut arena, id);
        assert_eq!(index.find(paddr), Some(id));
        assert_eq!(index.len(), 1);
        assert_eq!(index.total_bytes(), 4096);

        index.erase(&mut arena, id);
        assert_eq!(index.find(paddr), None);
        assert_eq!(index.total_bytes(), 0);
    }

    #[test]
    fn replace_swaps_same_key() {
        let mut arena = ExtentArena::new();
        let mut index = ExtentIndex::default();
        let paddr = PhysicalAddr::RandomBlock { offset: 0x2000 };

        let prev = arena.insert(block(paddr, 512));
        index.insert(&mut arena, prev);

        let mut next_extent = block(paddr, 512);
        next_extent.version = 1;
        let next = arena.insert(next_extent);
        index.replace(&mut arena, next, prev);

        assert_eq!(index.find(paddr), Some(next));
        assert_eq!(index.len(), 1);
        assert_eq!(index.total_bytes(), 512);
    }

    #[test]
    #[should_panic(expected = "duplicate extent")]
    fn double_insert_panics() {
        let mut arena = ExtentArena::new();
        let mut index = ExtentIndex::default();
        let paddr = PhysicalAddr::RandomBlock { offset: 0x3000 };

        let a = arena.insert(block(paddr, 64));
        let b = arena.insert(block(paddr, 64));
        index.insert(&mut arena, a);
        index.insert(&mut arena, b);
    }
}
