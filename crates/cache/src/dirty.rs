//! The dirty list: stable-dirty extents ordered by `dirty_from`.
//!
//! Position is an insertion counter rather than `dirty_from` itself:
//! replacements preserve their predecessor's slot, and an extent whose
//! `dirty_from` is still unassigned (journal write in flight) sits at the
//! tail where its eventual sequence will keep the order non-decreasing.

use std::collections::{BTreeMap, HashMap};

use crate::extent::{ExtentArena, ExtentId};

#[derive(Default)]
pub(crate) struct DirtyList {
    by_pos: BTreeMap<u64, ExtentId>,
    pos_of: HashMap<ExtentId, u64>,
    next_pos: u64,
    dirty_bytes: u64,
}

impl DirtyList {
    /// Link a newly dirty extent at the tail. One strong count is acquired.
    ///
    /// Requires `state == DIRTY`, a set modify time and a fully loaded
    /// buffer.
    pub fn push_back(&mut self, arena: &mut ExtentArena, id: ExtentId) {
        {
            let extent = arena.extent(id);
            assert!(extent.is_stable_dirty());
            assert!(!extent.linked_dirty);
            assert!(extent.modify_time().is_some());
            assert!(extent.is_fully_loaded());
            debug_assert!(extent.paddr().is_real_location());
        }
        let pos = self.next_pos;
        self.next_pos += 1;
        self.by_pos.insert(pos, id);
        self.pos_of.insert(id, pos);
        self.dirty_bytes += arena.extent(id).length() as u64;
        arena.extent_mut(id).linked_dirty = true;
        arena.retain(id);
    }

    /// Unlink an extent, releasing the list's strong count.
    pub fn erase(&mut self, arena: &mut ExtentArena, id: ExtentId) {
        assert!(arena.extent(id).linked_dirty);
        let pos = self.pos_of.remove(&id).expect("extent not in dirty list");
        let removed = self.by_pos.remove(&pos);
        debug_assert_eq!(removed, Some(id));
        self.dirty_bytes -= arena.extent(id).length() as u64;
        arena.extent_mut(id).linked_dirty = false;
        arena.release(id);
    }

    /// Swap `prev` for `next` at the same position. Both must be stable
    /// dirty with equal `dirty_from` and length.
    pub fn replace_in_place(&mut self, arena: &mut ExtentArena, next: ExtentId, prev: ExtentId) {
        {
            let p = arena.extent(prev);
            let n = arena.extent(next);
            assert!(p.is_stable_dirty() && p.linked_dirty);
            assert!(p.is_fully_loaded());
            assert!(n.is_stable_dirty() && !n.linked_dirty);
            assert!(n.modify_time().is_some());
            assert!(n.is_fully_loaded());
            assert_eq!(p.dirty_from(), n.dirty_from());
            assert_eq!(p.length(), n.length());
            assert_eq!(p.ext_type(), n.ext_type());
            assert!(!n.ext_type().is_root());
        }
        let pos = self.pos_of.remove(&prev).expect("extent not in dirty list");
        self.by_pos.insert(pos, next);
        self.pos_of.insert(next, pos);
        arena.extent_mut(prev).linked_dirty = false;
        arena.extent_mut(next).linked_dirty = true;
        arena.retain(next);
        arena.release(prev);
    }

    pub fn contains(&self, id: ExtentId) -> bool {
        self.pos_of.contains_key(&id)
    }

    pub fn front(&self) -> Option<ExtentId> {
        self.by_pos.values().next().copied()
    }

    pub fn iter_oldest_first(&self) -> impl Iterator<Item = ExtentId> + '_ {
        self.by_pos.values().copied()
    }

    pub fn len(&self) -> usize {
        self.by_pos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pos.is_empty()
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.dirty_bytes
    }

    /// Drop every entry, e.g. at cache close. Counts are released.
    pub fn clear(&mut self, arena: &mut ExtentArena) {
        let ids: Vec<_> = self.by_pos.values().copied().collect();
        for id in ids {
            assert!(arena.extent(id).is_stable_dirty());
            self.erase(arena, id);
        }
        assert_eq!(self.dirty_bytes, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{Extent, ExtentState};
    use lodestore_primitives::{ExtentType, JournalSeq, ModifyTime, PhysicalAddr};

    fn dirty_extent(offset: u64, seq: u64) -> Extent {
        let mut e = Extent::new(
            ExtentType::TestBlock,
            PhysicalAddr::RandomBlock { offset },
            None,
            ExtentState::Dirty,
            vec![0; 64],
        );
        e.dirty_from = Some(JournalSeq(seq));
        e.modify_time = Some(ModifyTime(1));
        e.version = 1;
        e
    }

    #[test]
    fn oldest_first_follows_insertion() {
        let mut arena = ExtentArena::new();
        let mut dirty = DirtyList::default();

        let a = arena.insert(dirty_extent(0x1000, 10));
        let b = arena.insert(dirty_extent(0x2000, 11));
        let c = arena.insert(dirty_extent(0x3000, 12));
        for id in [a, b, c] {
            dirty.push_back(&mut arena, id);
        }

        assert_eq!(dirty.iter_oldest_first().collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(dirty.front(), Some(a));
        assert_eq!(dirty.dirty_bytes(), 3 * 64);

        dirty.erase(&mut arena, b);
        assert_eq!(dirty.iter_oldest_first().collect::<Vec<_>>(), vec![a, c]);
    }

    #[test]
    fn replace_keeps_position() {
        let mut arena = ExtentArena::new();
        let mut dirty = DirtyList::default();

        let a = arena.insert(dirty_extent(0x1000, 10));
        let b = arena.insert(dirty_extent(0x2000, 11));
        let c = arena.insert(dirty_extent(0x3000, 12));
        for id in [a, b, c] {
            dirty.push_back(&mut arena, id);
        }

        let mut replacement = dirty_extent(0x2000, 11);
        replacement.version = 2;
        let b2 = arena.insert(replacement);
        dirty.replace_in_place(&mut arena, b2, b);

        assert_eq!(dirty.iter_oldest_first().collect::<Vec<_>>(), vec![a, b2, c]);
        assert!(!dirty.contains(b));
        assert!(arena.extent(b2).linked_dirty);
    }
}
