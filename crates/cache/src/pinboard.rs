//! Eviction candidate list, external to the cache.
//!
//! The cache only reports membership events; which extents to evict, and
//! when, is the embedder's policy. A plain LRU implementation is provided
//! for embedders without their own and for tests.

use std::collections::HashMap;

use crate::extent::ExtentId;

/// Why an extent is being touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TouchHint {
    /// A transaction accessed the extent.
    Access,
    /// The extent was faulted in or confirmed during journal replay.
    Replay,
}

pub trait Pinboard {
    fn insert(&mut self, id: ExtentId, bytes: u64);
    fn touch(&mut self, id: ExtentId, hint: TouchHint);
    fn remove(&mut self, id: ExtentId);
    fn clear(&mut self);
    fn current_num_extents(&self) -> u64;
    fn current_size_bytes(&self) -> u64;
}

/// Least-recently-touched list with a byte-size budget.
///
/// The budget is advisory: the board reports when it is over budget and
/// yields eviction candidates oldest-first, but never drops entries on its
/// own, since removal must go through the cache.
pub struct LruPinboard {
    capacity_bytes: u64,
    entries: HashMap<ExtentId, (u64, u64)>,
    clock: u64,
    size_bytes: u64,
}

impl LruPinboard {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            entries: HashMap::new(),
            clock: 0,
            size_bytes: 0,
        }
    }

    pub fn is_over_budget(&self) -> bool {
        self.size_bytes > self.capacity_bytes
    }

    /// Extents in least-recently-touched order.
    pub fn eviction_candidates(&self) -> Vec<ExtentId> {
        let mut entries: Vec<_> = self.entries.iter().map(|(&id, &(stamp, _))| (stamp, id)).collect();
        entries.sort_unstable();
        entries.into_iter().map(|(_, id)| id).collect()
    }
}

impl Pinboard for LruPinboard {
    fn insert(&mut self, id: ExtentId, bytes: u64) {
        self.clock += 1;
        if let Some((_, prev_bytes)) = self.entries.insert(id, (self.clock, bytes)) {
            self.size_bytes -= prev_bytes;
        }
        self.size_bytes += bytes;
    }

    fn touch(&mut self, id: ExtentId, _hint: TouchHint) {
        self.clock += 1;
        if let Some((stamp, _)) = self.entries.get_mut(&id) {
            *stamp = self.clock;
        }
    }

    fn remove(&mut self, id: ExtentId) {
        if let Some((_, bytes)) = self.entries.remove(&id) {
            self.size_bytes -= bytes;
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.size_bytes = 0;
    }

    fn current_num_extents(&self) -> u64 {
        self.entries.len() as u64
    }

    fn current_size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::test_support::dangling_id;

    #[test]
    fn tracks_sizes_and_order() {
        let mut board = LruPinboard::new(100);
        let a = dangling_id(1);
        let b = dangling_id(2);

        board.insert(a, 60);
        board.insert(b, 30);
        assert_eq!(board.current_num_extents(), 2);
        assert_eq!(board.current_size_bytes(), 90);
        assert!(!board.is_over_budget());

        board.touch(a, TouchHint::Access);
        assert_eq!(board.eviction_candidates(), vec![b, a]);

        board.insert(dangling_id(3), 30);
        assert!(board.is_over_budget());

        board.remove(b);
        assert_eq!(board.current_size_bytes(), 90);
    }
}
