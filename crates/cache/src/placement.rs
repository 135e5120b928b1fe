//! Seam to the physical placement/allocation layer.

use std::collections::HashMap;

use lodestore_primitives::PhysicalAddr;

/// Space accounting callbacks the cache drives during commit.
///
/// `mark_space_used`/`mark_space_free` adjust provisional accounting;
/// `commit_space_used` finalizes a fresh extent's range once its address is
/// known. `get_checksum_needed` reports whether extents at `paddr` carry a
/// crc or the no-checksum sentinel.
pub trait ExtentPlacementManager {
    fn mark_space_used(&mut self, paddr: PhysicalAddr, length: u32);
    fn mark_space_free(&mut self, paddr: PhysicalAddr, length: u32);
    fn commit_space_used(&mut self, paddr: PhysicalAddr, length: u32);
    fn get_checksum_needed(&self, paddr: PhysicalAddr) -> bool;
}

/// In-memory placement manager for tests: tracks per-range accounting and
/// always wants checksums.
#[derive(Default)]
pub struct MemPlacementManager {
    used: HashMap<PhysicalAddr, u32>,
    committed: HashMap<PhysicalAddr, u32>,
    frees: Vec<(PhysicalAddr, u32)>,
}

impl MemPlacementManager {
    pub fn committed_ranges(&self) -> &HashMap<PhysicalAddr, u32> {
        &self.committed
    }

    pub fn freed_ranges(&self) -> &[(PhysicalAddr, u32)] {
        &self.frees
    }
}

impl ExtentPlacementManager for MemPlacementManager {
    fn mark_space_used(&mut self, paddr: PhysicalAddr, length: u32) {
        self.used.insert(paddr, length);
    }

    fn mark_space_free(&mut self, paddr: PhysicalAddr, length: u32) {
        self.used.remove(&paddr);
        self.committed.remove(&paddr);
        self.frees.push((paddr, length));
    }

    fn commit_space_used(&mut self, paddr: PhysicalAddr, length: u32) {
        self.committed.insert(paddr, length);
    }

    fn get_checksum_needed(&self, _paddr: PhysicalAddr) -> bool {
        true
    }
}
