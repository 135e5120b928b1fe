//! Per-transaction staging state.
//!
//! A transaction accumulates the extents it has read, the mutations it has
//! staged and the retirements it intends, without touching stable cache
//! state. Note that membership in these sets reflects the cumulative effect
//! of the transaction: an extent duplicated for write appears once in the
//! mutated list however many times it is written, and an extent the
//! transaction itself allocated never enters the read set.
//!
//! Stable state changes only in `prepare_record`/`complete_commit`, which
//! consume these lists.

use std::collections::BTreeMap;

use lodestore_primitives::PhysicalAddr;

use crate::backref::BackrefEntry;
use crate::extent::ExtentId;
use crate::stats::{IoStat, TreeStats};

/// Transaction handle. Monotonically assigned, never reused within a cache
/// instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransId(pub u64);

impl std::fmt::Display for TransId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "t={}", self.0)
    }
}

/// What kind of work a transaction performs. `Read` is read-only; the last
/// four are background/rewriting sources that are allowed to lose conflicts
/// against foreground mutators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransactionSource {
    Mutate,
    Read,
    TrimDirty,
    TrimAlloc,
    CleanerMain,
    CleanerCold,
}

impl TransactionSource {
    pub const ALL: [TransactionSource; 6] = [
        Self::Mutate,
        Self::Read,
        Self::TrimDirty,
        Self::TrimAlloc,
        Self::CleanerMain,
        Self::CleanerCold,
    ];

    pub fn index(&self) -> usize {
        match self {
            Self::Mutate => 0,
            Self::Read => 1,
            Self::TrimDirty => 2,
            Self::TrimAlloc => 3,
            Self::CleanerMain => 4,
            Self::CleanerCold => 5,
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(
            self,
            Self::TrimDirty | Self::TrimAlloc | Self::CleanerMain | Self::CleanerCold
        )
    }
}

/// Result of looking an address up in a transaction's view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GetExtentResult {
    Present(ExtentId),
    Absent,
    Retired,
}

/// Which index a tree-operation counter belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeKind {
    Laddr,
    Backref,
    Onode,
    Omap,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OolWriteStats {
    pub extents: IoStat,
    pub num_records: u64,
    pub md_bytes: u64,
    pub data_bytes: u64,
}

impl OolWriteStats {
    pub fn record_bytes(&self) -> u64 {
        self.md_bytes + self.data_bytes
    }

    pub fn is_clear(&self) -> bool {
        self.extents.is_clear() && self.num_records == 0 && self.md_bytes == 0 && self.data_bytes == 0
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ExistingBlockStats {
    pub valid_num: u64,
    pub clean_num: u64,
    pub mutated_num: u64,
}

pub struct Transaction {
    pub(crate) id: TransId,
    pub(crate) src: TransactionSource,
    pub(crate) weak: bool,
    pub(crate) conflicted: bool,
    /// The root extent pinned into this transaction's view.
    pub(crate) root: Option<ExtentId>,

    /// Stable extents this transaction has observed, by address.
    pub(crate) read_set: BTreeMap<PhysicalAddr, ExtentId>,
    /// Pending extents owned by this transaction, by address.
    pub(crate) write_set: BTreeMap<PhysicalAddr, ExtentId>,
    /// Extents this transaction will retire.
    pub(crate) retired_set: BTreeMap<PhysicalAddr, ExtentId>,

    pub(crate) mutated_block_list: Vec<ExtentId>,
    pub(crate) inline_block_list: Vec<ExtentId>,
    pub(crate) ool_block_list: Vec<ExtentId>,
    pub(crate) inplace_ool_block_list: Vec<ExtentId>,
    pub(crate) existing_block_list: Vec<ExtentId>,
    pub(crate) delayed_block_list: Vec<ExtentId>,
    pub(crate) pre_alloc_list: Vec<ExtentId>,

    /// Next record-relative offset for fresh inline extents, assigned in
    /// allocation order.
    pub(crate) fresh_offset: u32,
    pub(crate) next_delayed_id: u32,

    pub(crate) fresh_block_stats: IoStat,
    pub(crate) num_delayed_invalid_extents: u64,
    pub(crate) num_allocated_invalid_extents: u64,
    pub(crate) ool_write_stats: OolWriteStats,
    pub(crate) existing_block_stats: ExistingBlockStats,
    pub(crate) rewrite_num: u64,
    pub(crate) rewrite_bytes: u64,

    pub(crate) laddr_tree_stats: TreeStats,
    pub(crate) backref_tree_stats: TreeStats,
    pub(crate) onode_tree_stats: TreeStats,
    pub(crate) omap_tree_stats: TreeStats,

    /// Backref entries staged by `prepare_record`, installed into the
    /// backref log at `complete_commit`.
    pub(crate) backref_entries: Vec<BackrefEntry>,
}

impl Transaction {
    pub(crate) fn new(id: TransId, src: TransactionSource, weak: bool) -> Self {
        // weak read-only snapshots never commit, so a weak background or
        // mutating transaction is a caller bug
        assert!(!weak || src == TransactionSource::Read);
        Self {
            id,
            src,
            weak,
            conflicted: false,
            root: None,
            read_set: BTreeMap::new(),
            write_set: BTreeMap::new(),
            retired_set: BTreeMap::new(),
            mutated_block_list: Vec::new(),
            inline_block_list: Vec::new(),
            ool_block_list: Vec::new(),
            inplace_ool_block_list: Vec::new(),
            existing_block_list: Vec::new(),
            delayed_block_list: Vec::new(),
            pre_alloc_list: Vec::new(),
            fresh_offset: 0,
            next_delayed_id: 0,
            fresh_block_stats: IoStat::default(),
            num_delayed_invalid_extents: 0,
            num_allocated_invalid_extents: 0,
            ool_write_stats: OolWriteStats::default(),
            existing_block_stats: ExistingBlockStats::default(),
            rewrite_num: 0,
            rewrite_bytes: 0,
            laddr_tree_stats: TreeStats::default(),
            backref_tree_stats: TreeStats::default(),
            onode_tree_stats: TreeStats::default(),
            omap_tree_stats: TreeStats::default(),
            backref_entries: Vec::new(),
        }
    }

    pub fn id(&self) -> TransId {
        self.id
    }

    pub fn src(&self) -> TransactionSource {
        self.src
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    pub fn is_conflicted(&self) -> bool {
        self.conflicted
    }

    pub fn root(&self) -> Option<ExtentId> {
        self.root
    }

    /// Look up `paddr` in this transaction's view: pending extents first,
    /// then retirements, then reads.
    pub fn get_extent(&self, paddr: PhysicalAddr) -> GetExtentResult {
        if self.retired_set.contains_key(&paddr) {
            return GetExtentResult::Retired;
        }
        if let Some(&id) = self.write_set.get(&paddr) {
            return GetExtentResult::Present(id);
        }
        if let Some(&id) = self.read_set.get(&paddr) {
            return GetExtentResult::Present(id);
        }
        GetExtentResult::Absent
    }

    pub fn tree_stats(&self, kind: TreeKind) -> &TreeStats {
        match kind {
            TreeKind::Laddr => &self.laddr_tree_stats,
            TreeKind::Backref => &self.backref_tree_stats,
            TreeKind::Onode => &self.onode_tree_stats,
            TreeKind::Omap => &self.omap_tree_stats,
        }
    }

    /// Counters for the index implementations layered above the cache.
    pub fn tree_stats_mut(&mut self, kind: TreeKind) -> &mut TreeStats {
        match kind {
            TreeKind::Laddr => &mut self.laddr_tree_stats,
            TreeKind::Backref => &mut self.backref_tree_stats,
            TreeKind::Onode => &mut self.onode_tree_stats,
            TreeKind::Omap => &mut self.omap_tree_stats,
        }
    }

    pub fn ool_write_stats(&self) -> &OolWriteStats {
        &self.ool_write_stats
    }

    pub fn existing_block_stats(&self) -> &ExistingBlockStats {
        &self.existing_block_stats
    }

    /// The out-of-line writer reports its record accounting here.
    pub fn ool_write_stats_mut(&mut self) -> &mut OolWriteStats {
        &mut self.ool_write_stats
    }

    pub(crate) fn take_backref_entries(&mut self) -> Vec<BackrefEntry> {
        std::mem::take(&mut self.backref_entries)
    }

    pub(crate) fn allocate_fresh_offset(&mut self, length: u32) -> u32 {
        let offset = self.fresh_offset;
        self.fresh_offset += length;
        offset
    }

    pub(crate) fn allocate_delayed_id(&mut self) -> u32 {
        let id = self.next_delayed_id;
        self.next_delayed_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_lookup_priority() {
        let mut t = Transaction::new(TransId(1), TransactionSource::Mutate, false);
        let paddr = PhysicalAddr::RandomBlock { offset: 0x1000 };

        assert_eq!(t.get_extent(paddr), GetExtentResult::Absent);

        let read_id = crate::extent::test_support::dangling_id(7);
        t.read_set.insert(paddr, read_id);
        assert_eq!(t.get_extent(paddr), GetExtentResult::Present(read_id));

        let pending_id = crate::extent::test_support::dangling_id(8);
        t.write_set.insert(paddr, pending_id);
        assert_eq!(t.get_extent(paddr), GetExtentResult::Present(pending_id));

        t.retired_set.insert(paddr, read_id);
        assert_eq!(t.get_extent(paddr), GetExtentResult::Retired);
    }

    #[test]
    fn fresh_offsets_are_allocation_ordered() {
        let mut t = Transaction::new(TransId(1), TransactionSource::Mutate, false);
        assert_eq!(t.allocate_fresh_offset(4096), 0);
        assert_eq!(t.allocate_fresh_offset(512), 4096);
        assert_eq!(t.allocate_fresh_offset(4096), 4608);
    }

    #[test]
    #[should_panic]
    fn weak_must_be_read_only() {
        let _ = Transaction::new(TransId(1), TransactionSource::Mutate, true);
    }
}
