//! In-memory extent cache and transactional staging layer of a
//! log-structured object store.
//!
//! The cache sits between the journaling device layer and the higher-level
//! indices (logical-address tree, object-node tree, collection maps,
//! back-reference tree). It caches fixed-size, physically addressed extents
//! in RAM, gives each transaction a consistent snapshot of the extents it
//! has read, stages mutations, and condenses a committing transaction into
//! a single journal record ([`Cache::prepare_record`] /
//! [`Cache::complete_commit`]). On mount, [`Cache::replay_delta`]
//! reconstructs cache state from journal deltas.
//!
//! Execution is single-threaded per shard: the cache owns its shard's state
//! exclusively, and all "concurrency" is the interleaving of suspended
//! transactions on one thread. Conflicts between interleaved transactions
//! are detected at invalidation time and reported from the commit path as
//! [`CacheError::Conflict`].

mod backref;
mod commit;
mod dirty;
mod error;
mod extent;
mod index;
mod pinboard;
mod placement;
mod record;
mod replay;
mod source;
mod stats;
mod transaction;

pub use backref::{BackrefEntry, BackrefLog, BackrefOp};
pub use error::{CacheError, Result};
pub use extent::{decode_delta_ops, encode_delta_ops, DeltaOp, Extent, ExtentId, ExtentState};
pub use pinboard::{LruPinboard, Pinboard, TouchHint};
pub use placement::{ExtentPlacementManager, MemPlacementManager};
pub use record::{
    AllocBlock, AllocDelta, AllocOp, DeltaInfo, JournalTailDelta, Record, RecordExtent, RecordKind,
};
pub use source::{ExtentSource, MemExtentSource};
pub use stats::{CacheStats, CommittedEfforts, InvalidatedEfforts, IoStat, TreeStats};
pub use transaction::{
    ExistingBlockStats, GetExtentResult, OolWriteStats, TransId, Transaction, TransactionSource,
    TreeKind,
};

use std::collections::{BTreeMap, HashMap};

use itertools::Itertools;
use log::{debug, error, info, trace};
use lodestore_primitives::{
    ExtentType, JournalSeq, LogicalAddr, ModifyTime, PhysicalAddr, SegmentId, SegmentKind,
    SegmentSeq,
};

use extent::ExtentArena;

/// Length of the root extent's buffer.
pub const ROOT_LENGTH: u32 = 512;

/// Cache configuration. One key: the pinboard byte budget per shard.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub pinboard_size_bytes: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pinboard_size_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Current incarnation of a segment, for delta staleness checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentInfo {
    pub seq: SegmentSeq,
    pub kind: SegmentKind,
}

/// Three-valued oldest-dirty answer: nothing dirty, oldest entry still
/// waiting for its commit sequence, or a concrete sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OldestDirty {
    NoneDirty,
    Pending,
    At(JournalSeq),
}

pub struct Cache {
    pub(crate) arena: ExtentArena,
    pub(crate) index: index::ExtentIndex,
    pub(crate) dirty: dirty::DirtyList,
    pub(crate) root: Option<ExtentId>,
    pub(crate) transactions: HashMap<TransId, Transaction>,
    next_trans_id: u64,
    pub(crate) backref_log: BackrefLog,
    /// Registered back-reference tree nodes by address; retired nodes drop
    /// their registration instead of emitting retire entries.
    pub(crate) backref_extents: BTreeMap<PhysicalAddr, ExtentType>,
    segments: HashMap<SegmentId, SegmentInfo>,
    pub(crate) last_commit: Option<JournalSeq>,
    pub(crate) stats: CacheStats,
    pub(crate) epm: Box<dyn ExtentPlacementManager>,
    pub(crate) pinboard: Box<dyn Pinboard>,
    pub(crate) source: Box<dyn ExtentSource>,
}

impl Cache {
    pub fn new(
        options: Options,
        epm: Box<dyn ExtentPlacementManager>,
        source: Box<dyn ExtentSource>,
    ) -> Self {
        Self::with_pinboard(
            epm,
            Box::new(LruPinboard::new(options.pinboard_size_bytes)),
            source,
        )
    }

    pub fn with_pinboard(
        epm: Box<dyn ExtentPlacementManager>,
        pinboard: Box<dyn Pinboard>,
        source: Box<dyn ExtentSource>,
    ) -> Self {
        Self {
            arena: ExtentArena::new(),
            index: index::ExtentIndex::default(),
            dirty: dirty::DirtyList::default(),
            root: None,
            transactions: HashMap::new(),
            next_trans_id: 0,
            backref_log: BackrefLog::default(),
            backref_extents: BTreeMap::new(),
            segments: HashMap::new(),
            last_commit: None,
            stats: CacheStats::default(),
            epm,
            pinboard,
            source,
        }
    }

    /// Install the root extent. Initial creation does `init` + [`Cache::mkfs`]
    /// followed by a mount, which calls `init` again.
    pub fn init(&mut self) {
        if let Some(prev_root) = self.root.take() {
            debug!("init: removing previous root {prev_root}");
            self.remove_extent(prev_root);
            self.arena.release(prev_root);
        }
        let mut root = Extent::new(
            ExtentType::Root,
            PhysicalAddr::Root,
            None,
            ExtentState::Dirty,
            vec![0; ROOT_LENGTH as usize],
        );
        // keeping the root permanently dirty is simpler than tracking a
        // clean root that cannot be faulted back in
        root.modify_time = Some(ModifyTime::now());
        let id = self.arena.insert(root);
        info!("init root {id}");
        self.index.insert(&mut self.arena, id);
        self.dirty.push_back(&mut self.arena, id);
        self.root = Some(id);
    }

    /// Within `t`, pin the root and stage its initial image so the first
    /// commit journals a root delta.
    pub fn mkfs(&mut self, tid: TransId) -> Result<()> {
        let root = self.get_root(tid)?;
        info!("mkfs: create root on {tid}");
        let dup = self.duplicate_for_write(tid, root);
        let image = vec![0u8; ROOT_LENGTH as usize];
        self.write_extent(tid, dup, 0, &image);
        Ok(())
    }

    /// Tear the shard down. All transactions must have been destructed.
    pub fn close(&mut self) {
        assert!(
            self.transactions.is_empty(),
            "close with live transactions"
        );
        info!(
            "close with {}({}B) dirty, {}({}B) pinned, {}({}B) indexed",
            self.dirty.len(),
            self.dirty.dirty_bytes(),
            self.pinboard.current_num_extents(),
            self.pinboard.current_size_bytes(),
            self.index.len(),
            self.index.total_bytes(),
        );
        if let Some(root) = self.root.take() {
            self.arena.release(root);
        }
        self.dirty.clear(&mut self.arena);
        self.backref_extents.clear();
        self.backref_log.clear();
        self.pinboard.clear();
        let resident = self.index.iter().collect_vec();
        for id in resident {
            self.index.erase(&mut self.arena, id);
        }
        if self.arena.len() != 0 {
            error!("{} extents still alive at close", self.arena.len());
        }
        assert_eq!(self.arena.len(), 0);
    }

    pub fn create_transaction(&mut self, src: TransactionSource, weak: bool) -> TransId {
        let tid = TransId(self.next_trans_id);
        self.next_trans_id += 1;
        trace!("create {tid} src={src:?} weak={weak}");
        self.transactions.insert(tid, Transaction::new(tid, src, weak));
        tid
    }

    #[track_caller]
    pub fn transaction(&self, tid: TransId) -> &Transaction {
        self.transactions.get(&tid).expect("unknown transaction")
    }

    #[track_caller]
    pub fn transaction_mut(&mut self, tid: TransId) -> &mut Transaction {
        self.transactions.get_mut(&tid).expect("unknown transaction")
    }

    #[track_caller]
    pub fn extent(&self, id: ExtentId) -> &Extent {
        self.arena.extent(id)
    }

    pub fn try_extent(&self, id: ExtentId) -> Option<&Extent> {
        self.arena.get(id)
    }

    /// Pin the root extent into the transaction's view.
    pub fn get_root(&mut self, tid: TransId) -> Result<ExtentId> {
        if let Some(root) = self.transaction(tid).root {
            trace!("get_root: root already on {tid}");
            return Ok(root);
        }
        let root = self.root.expect("cache not initialized");
        debug!("get_root: pin {root} on {tid}");
        self.transaction_mut(tid).root = Some(root);
        self.add_to_read_set(tid, root);
        Ok(root)
    }

    /// Read an extent through the transaction, faulting it in from the
    /// device on a miss.
    pub fn get_extent(
        &mut self,
        tid: TransId,
        ext_type: ExtentType,
        paddr: PhysicalAddr,
        laddr: Option<LogicalAddr>,
        length: u32,
    ) -> Result<ExtentId> {
        assert!(ext_type.is_cached() && !ext_type.is_root() && !ext_type.is_retired_placeholder());
        assert!(paddr.is_absolute());
        self.stats.cache_accesses += 1;

        match self.transaction(tid).get_extent(paddr) {
            GetExtentResult::Present(id) => {
                let extent = self.arena.extent(id);
                assert_eq!(extent.ext_type(), ext_type);
                assert_eq!(extent.length(), length);
                self.stats.cache_hits += 1;
                trace!("{tid} get_extent hit on transaction -- {extent:?}");
                return Ok(id);
            }
            GetExtentResult::Retired => {
                panic!("get_extent: {paddr} already retired on {tid}");
            }
            GetExtentResult::Absent => {}
        }

        if let Some(id) = self.index.find(paddr) {
            let extent = self.arena.extent(id);
            assert!(
                !extent.is_placeholder(),
                "get_extent: {paddr} holds a retired placeholder"
            );
            assert_eq!(extent.ext_type(), ext_type);
            assert_eq!(extent.length(), length);
            self.stats.cache_hits += 1;
            trace!("{tid} get_extent hit in cache -- {:?}", self.arena.extent(id));
            self.pinboard.touch(id, TouchHint::Access);
            self.add_to_read_set(tid, id);
            return Ok(id);
        }

        // miss, fault in cold
        let bytes = self.source.read(paddr, length)?;
        let id = self.insert_cold_extent(ext_type, paddr, laddr, bytes);
        debug!("{tid} get_extent miss, loaded -- {:?}", self.arena.extent(id));
        self.add_to_read_set(tid, id);
        Ok(id)
    }

    /// Return the resident extent at `paddr`, if any, pinning it into the
    /// transaction's view. Placeholders report as absent.
    pub fn get_extent_if_cached(&mut self, tid: TransId, paddr: PhysicalAddr) -> Option<ExtentId> {
        self.stats.cache_accesses += 1;
        let id = self.index.find(paddr)?;
        if self.arena.extent(id).is_placeholder() {
            return None;
        }
        self.stats.cache_hits += 1;
        self.pinboard.touch(id, TouchHint::Access);
        self.add_to_read_set(tid, id);
        Some(id)
    }

    /// Allocate a fresh inline extent. Its record-relative address is
    /// assigned in allocation order and rebased once the journal reports
    /// where the record landed.
    pub fn alloc_new_extent(
        &mut self,
        tid: TransId,
        ext_type: ExtentType,
        length: u32,
        laddr: Option<LogicalAddr>,
    ) -> ExtentId {
        Self::check_alloc_type(ext_type, laddr);
        let t = self.transaction_mut(tid);
        let offset = t.allocate_fresh_offset(length);
        let paddr = PhysicalAddr::RecordRelative { offset };
        let mut extent = Extent::new(
            ext_type,
            paddr,
            laddr,
            ExtentState::CleanPending,
            vec![0; length as usize],
        );
        extent.pending_for_transaction = Some(tid);
        let id = self.arena.insert(extent);
        let t = self.transaction_mut(tid);
        t.inline_block_list.push(id);
        t.write_set.insert(paddr, id);
        t.fresh_block_stats.increment(length as u64);
        debug!("{tid} alloc fresh inline {ext_type} {length}B at {paddr}");
        id
    }

    /// Allocate a fresh extent whose placement decision is deferred. It
    /// must be placed inline or out-of-line before commit.
    pub fn alloc_delayed_extent(
        &mut self,
        tid: TransId,
        ext_type: ExtentType,
        length: u32,
        laddr: Option<LogicalAddr>,
    ) -> ExtentId {
        Self::check_alloc_type(ext_type, laddr);
        assert!(ext_type.is_data(), "delayed placement is for data extents");
        let t = self.transaction_mut(tid);
        let paddr = PhysicalAddr::Delayed {
            id: t.allocate_delayed_id(),
        };
        let mut extent = Extent::new(
            ext_type,
            paddr,
            laddr,
            ExtentState::CleanPending,
            vec![0; length as usize],
        );
        extent.pending_for_transaction = Some(tid);
        let id = self.arena.insert(extent);
        let t = self.transaction_mut(tid);
        t.delayed_block_list.push(id);
        t.write_set.insert(paddr, id);
        t.fresh_block_stats.increment(length as u64);
        debug!("{tid} alloc fresh delayed {ext_type} {length}B at {paddr}");
        id
    }

    /// Place a delayed extent inline with the journal record.
    pub fn place_delayed_inline(&mut self, tid: TransId, id: ExtentId) {
        let (old_paddr, length) = {
            let extent = self.arena.extent(id);
            assert!(extent.paddr().is_delayed());
            assert_eq!(extent.pending_for_transaction, Some(tid));
            (extent.paddr(), extent.length())
        };
        let t = self.transaction_mut(tid);
        let pos = t
            .delayed_block_list
            .iter()
            .position(|&e| e == id)
            .expect("extent not on delayed list");
        t.delayed_block_list.remove(pos);
        let offset = t.allocate_fresh_offset(length);
        let paddr = PhysicalAddr::RecordRelative { offset };
        t.write_set.remove(&old_paddr);
        t.write_set.insert(paddr, id);
        t.inline_block_list.push(id);
        self.arena.extent_mut(id).paddr = paddr;
        debug!("{tid} place delayed {id} inline at {paddr}");
    }

    /// Place a delayed extent at pre-allocated out-of-line space. The
    /// caller has already written the payload there.
    pub fn place_delayed_ool(&mut self, tid: TransId, id: ExtentId, paddr: PhysicalAddr) {
        assert!(paddr.is_absolute());
        let old_paddr = {
            let extent = self.arena.extent(id);
            assert!(extent.paddr().is_delayed());
            assert_eq!(extent.pending_for_transaction, Some(tid));
            extent.paddr()
        };
        let length = self.arena.extent(id).length();
        self.arena.extent_mut(id).paddr = paddr;
        self.arena.retain(id);
        let t = self.transaction_mut(tid);
        let pos = t
            .delayed_block_list
            .iter()
            .position(|&e| e == id)
            .expect("extent not on delayed list");
        t.delayed_block_list.remove(pos);
        t.write_set.remove(&old_paddr);
        t.write_set.insert(paddr, id);
        t.ool_block_list.push(id);
        t.pre_alloc_list.push(id);
        t.ool_write_stats.extents.increment(length as u64);
        debug!("{tid} place delayed {id} ool at {paddr}");
    }

    /// Stage a fresh out-of-line extent already written at `paddr`.
    pub fn alloc_ool_extent(
        &mut self,
        tid: TransId,
        ext_type: ExtentType,
        paddr: PhysicalAddr,
        laddr: Option<LogicalAddr>,
        bytes: Vec<u8>,
    ) -> ExtentId {
        Self::check_alloc_type(ext_type, laddr);
        assert!(paddr.is_absolute());
        let length = bytes.len() as u32;
        let mut extent = Extent::new(ext_type, paddr, laddr, ExtentState::CleanPending, bytes);
        extent.pending_for_transaction = Some(tid);
        let id = self.arena.insert(extent);
        let t = self.transaction_mut(tid);
        t.ool_block_list.push(id);
        t.write_set.insert(paddr, id);
        t.fresh_block_stats.increment(length as u64);
        t.ool_write_stats.extents.increment(length as u64);
        self.arena.retain(id);
        self.transaction_mut(tid).pre_alloc_list.push(id);
        debug!("{tid} alloc fresh ool {ext_type} {length}B at {paddr}");
        id
    }

    /// Stage a logical extent whose existence is established within the
    /// transaction, e.g. one half of a remap. It enters the cache only at
    /// commit.
    pub fn add_existing_extent(
        &mut self,
        tid: TransId,
        ext_type: ExtentType,
        paddr: PhysicalAddr,
        laddr: LogicalAddr,
        bytes: Vec<u8>,
    ) -> ExtentId {
        assert!(ext_type.is_logical());
        assert!(paddr.is_absolute());
        let mut extent = Extent::new(ext_type, paddr, Some(laddr), ExtentState::ExistClean, bytes);
        extent.pending_for_transaction = Some(tid);
        let id = self.arena.insert(extent);
        let t = self.transaction_mut(tid);
        t.existing_block_list.push(id);
        t.write_set.insert(paddr, id);
        debug!("{tid} add existing {ext_type} at {paddr} {laddr}");
        id
    }

    /// Move a stable-dirty extent onto the transaction's in-place rewrite
    /// list: the cleaner rewrites it at its current address without logical
    /// change, and commit downgrades it to clean.
    pub fn mark_inplace_rewrite(&mut self, tid: TransId, id: ExtentId) {
        let length = {
            let extent = self.arena.extent(id);
            assert!(extent.is_stable_dirty());
            assert!(extent.ext_type().can_inplace_rewrite());
            assert!(extent.paddr().is_absolute_random_block());
            extent.length()
        };
        self.arena.retain(id);
        let t = self.transaction_mut(tid);
        t.inplace_ool_block_list.push(id);
        t.ool_write_stats.extents.increment(length as u64);
        t.rewrite_num += 1;
        t.rewrite_bytes += length as u64;
        debug!("{tid} mark inplace rewrite {id}");
    }

    /// Produce (or return) the transaction-owned mutable image of `id`.
    ///
    /// Already-mutable extents are returned as-is. An `ExistClean` extent
    /// is promoted in place. Otherwise a fresh `MutationPending` clone is
    /// attached to the transaction, carrying the original as its prior
    /// instance.
    pub fn duplicate_for_write(&mut self, tid: TransId, id: ExtentId) -> ExtentId {
        let (state, is_logical) = {
            let extent = self.arena.extent(id);
            assert!(extent.is_valid());
            assert!(extent.is_fully_loaded());
            if extent.is_logical() {
                assert!(extent.laddr().is_some());
            }
            (extent.state(), extent.is_logical())
        };

        if self.arena.extent(id).is_mutable() {
            assert_eq!(self.arena.extent(id).pending_for_transaction, Some(tid));
            return id;
        }

        if state == ExtentState::ExistClean {
            assert!(is_logical);
            let extent = self.arena.extent_mut(id);
            extent.version += 1;
            extent.state = ExtentState::ExistMutationPending;
            extent.last_committed_crc = extent.calc_crc32c();
            assert!(extent.prior_instance.is_none());
            self.arena.retain(id);
            self.transaction_mut(tid).mutated_block_list.push(id);
            debug!("{tid} duplicate existing extent {id}");
            return id;
        }

        // stable clean or dirty: clone as a pending mutation
        let next = {
            let prior = self.arena.extent(id);
            let is_root = prior.ext_type().is_root();
            let mut next = Extent::new(
                prior.ext_type(),
                prior.paddr(),
                prior.laddr(),
                ExtentState::MutationPending,
                prior.buffer().expect("stable extent has a buffer").to_vec(),
            );
            next.version = prior.version() + 1;
            next.dirty_from = prior.dirty_from();
            next.modify_time = prior.modify_time();
            if !is_root {
                next.last_committed_crc = prior.last_committed_crc();
            }
            next.prior_instance = Some(id);
            next.pending_for_transaction = Some(tid);
            next
        };
        let next_id = self.arena.insert(next);
        self.arena.extent_mut(id).mutation_pending.push(next_id);

        let paddr = self.arena.extent(next_id).paddr();
        let is_root = self.arena.extent(next_id).ext_type().is_root();
        let t = self.transaction_mut(tid);
        if is_root {
            t.root = Some(next_id);
        }
        t.mutated_block_list.push(next_id);
        t.write_set.insert(paddr, next_id);
        debug!("{tid} duplicate {id} -> {next_id}");
        next_id
    }

    /// Assign the logical address of a transaction-owned pending extent,
    /// once the address-tree mapping for it exists.
    pub fn set_extent_laddr(&mut self, tid: TransId, id: ExtentId, laddr: LogicalAddr) {
        let extent = self.arena.extent_mut(id);
        assert_eq!(extent.pending_for_transaction, Some(tid));
        assert!(extent.ext_type().is_logical() || extent.ext_type().is_laddr_node());
        extent.laddr = Some(laddr);
    }

    /// Write into a transaction-owned extent. For pending mutations the
    /// splice is staged as delta; fresh extents take the bytes directly,
    /// their whole payload travels with the record.
    pub fn write_extent(&mut self, tid: TransId, id: ExtentId, offset: u32, bytes: &[u8]) {
        let extent = self.arena.extent_mut(id);
        assert_eq!(extent.pending_for_transaction, Some(tid));
        match extent.state() {
            ExtentState::MutationPending | ExtentState::ExistMutationPending => {
                extent.splice(offset, bytes);
            }
            ExtentState::CleanPending => {
                let buf = extent.buffer.as_mut().expect("fresh extent has a buffer");
                let end = offset as usize + bytes.len();
                assert!(end <= buf.len(), "write beyond extent length");
                buf[offset as usize..end].copy_from_slice(bytes);
            }
            state => panic!("write into non-writable extent in state {state:?}"),
        }
    }

    /// Retire the extent at `paddr`, loading nothing: unknown addresses get
    /// a retired placeholder recording the range.
    pub fn retire_extent_addr(
        &mut self,
        tid: TransId,
        paddr: PhysicalAddr,
        length: u32,
    ) -> Result<()> {
        trace!("{tid} retire {paddr}~{length:#x}");
        assert!(paddr.is_real_location());

        match self.transaction(tid).get_extent(paddr) {
            GetExtentResult::Present(id) => {
                debug!("{tid} retire {paddr}~{length:#x} on transaction");
                let extent = self.arena.extent(id);
                assert!(extent.pending_for_transaction.is_none());
                assert!(!extent.is_mutable());
                self.arena.retain(id);
                self.transaction_mut(tid).retired_set.insert(paddr, id);
                return Ok(());
            }
            GetExtentResult::Retired => {
                panic!("retire {paddr}~{length:#x} failed, already retired on {tid}");
            }
            GetExtentResult::Absent => {}
        }

        // any record-relative or delayed address would be on the transaction
        assert!(paddr.is_absolute());

        let id = match self.index.find(paddr) {
            Some(id) => {
                debug!("{tid} retire {paddr}~{length:#x} in cache");
                assert_eq!(self.arena.extent(id).length(), length);
                if self.arena.extent(id).may_conflict() {
                    self.add_to_read_set(tid, id);
                }
                id
            }
            None => {
                debug!("{tid} retire {paddr}~{length:#x} as placeholder");
                self.insert_retired_placeholder(paddr, length)
            }
        };
        self.arena.retain(id);
        self.transaction_mut(tid).retired_set.insert(paddr, id);
        Ok(())
    }

    /// Hot path of [`Cache::retire_extent_addr`] for addresses the caller
    /// has already verified absent from the transaction and the cache.
    pub fn retire_absent_extent_addr(&mut self, tid: TransId, paddr: PhysicalAddr, length: u32) {
        assert!(paddr.is_absolute());
        debug_assert_eq!(
            self.transaction(tid).get_extent(paddr),
            GetExtentResult::Absent
        );
        debug_assert!(self.index.find(paddr).is_none());
        debug!("{tid} retire {paddr}~{length:#x} as placeholder");
        let id = self.insert_retired_placeholder(paddr, length);
        self.arena.retain(id);
        self.transaction_mut(tid).retired_set.insert(paddr, id);
    }

    /// Oldest-first dirty extents with `dirty_from < seq`, up to
    /// `max_bytes`, pinned into the transaction's view for rewriting.
    pub fn get_next_dirty_extents(
        &mut self,
        tid: TransId,
        seq: JournalSeq,
        max_bytes: u64,
    ) -> Result<Vec<ExtentId>> {
        match self.dirty.front() {
            None => debug!("{tid} get_next_dirty_extents: dirty is empty"),
            Some(front) => debug!(
                "{tid} get_next_dirty_extents: max_bytes={max_bytes}B seq={seq} dirty_from={:?}",
                self.arena.extent(front).dirty_from()
            ),
        }
        let mut cand = Vec::new();
        let mut bytes_so_far = 0u64;
        let mut last_dirty_from = None;
        for id in self.dirty.iter_oldest_first() {
            if bytes_so_far >= max_bytes {
                break;
            }
            let extent = self.arena.extent(id);
            assert!(extent.is_fully_loaded());
            let dirty_from = extent
                .dirty_from()
                .unwrap_or_else(|| panic!("dirty extent without dirty_from -- {extent:?}"));
            if dirty_from >= seq {
                break;
            }
            if let Some(last) = last_dirty_from {
                assert!(
                    last <= dirty_from,
                    "dirty extents not ordered by dirty_from"
                );
            }
            last_dirty_from = Some(dirty_from);
            bytes_so_far += extent.length() as u64;
            cand.push(id);
        }

        let mut ret = Vec::with_capacity(cand.len());
        for id in cand {
            if !self.arena.extent(id).is_valid() {
                let src = self.transaction(tid).src();
                self.stats.trans_conflicts_by_unknown[src.index()] += 1;
                self.mark_transaction_conflicted(tid, id);
                return Err(CacheError::Conflict);
            }
            let paddr = self.arena.extent(id).paddr();
            match self.transaction(tid).get_extent(paddr) {
                GetExtentResult::Absent => {
                    self.add_to_read_set(tid, id);
                    if self.arena.extent(id).ext_type().is_root() {
                        let t = self.transaction_mut(tid);
                        assert!(t.root.is_none(), "root would already be in the read set");
                        t.root = Some(id);
                    }
                    ret.push(id);
                }
                GetExtentResult::Present(on_t) => {
                    trace!("{tid} dirty extent already on transaction -- {on_t}");
                    ret.push(on_t);
                }
                GetExtentResult::Retired => {
                    trace!("{tid} dirty extent retired on transaction");
                }
            }
        }
        Ok(ret)
    }

    /// Unregister a finished transaction, crediting success counters for
    /// clean reads. Weak transactions never took reader registrations and
    /// are excluded from read accounting.
    pub fn on_transaction_destruct(&mut self, tid: TransId) {
        let t = self.transactions.remove(&tid).expect("unknown transaction");
        trace!("destruct {tid}");

        if t.src == TransactionSource::Read && !t.conflicted {
            let mut read_stat = IoStat::default();
            for &id in t.read_set.values() {
                if let Some(extent) = self.arena.get(id) {
                    read_stat.increment(extent.length() as u64);
                }
            }
            debug!("{tid} done, {read_stat} read");
            if !t.weak {
                self.stats.success_read.num_trans += 1;
                self.stats.success_read.read.increment_stat(read_stat);
            }
            assert!(t.retired_set.is_empty());
            assert!(t.fresh_block_stats.is_clear());
            assert!(t.mutated_block_list.is_empty());
            assert!(t.laddr_tree_stats.is_clear());
            assert!(t.backref_tree_stats.is_clear());
            assert!(t.onode_tree_stats.is_clear());
            assert!(t.omap_tree_stats.is_clear());
        }

        for (_, id) in t.read_set {
            if let Some(extent) = self.arena.get_mut(id) {
                if !t.weak {
                    extent.read_transactions.remove(&tid);
                }
            }
            self.arena.release(id);
        }
        for (_, id) in t.retired_set {
            self.arena.release(id);
        }
        for id in t
            .mutated_block_list
            .into_iter()
            .chain(t.inline_block_list)
            .chain(t.ool_block_list)
            .chain(t.inplace_ool_block_list)
            .chain(t.existing_block_list)
            .chain(t.delayed_block_list)
            .chain(t.pre_alloc_list)
        {
            // pending extents that never committed detach from their prior
            if let Some(extent) = self.arena.get(id) {
                if extent.is_mutable() || extent.state() == ExtentState::ExistClean {
                    if let Some(prior) = self.arena.extent(id).prior_instance() {
                        if let Some(prior_extent) = self.arena.get_mut(prior) {
                            prior_extent.mutation_pending.retain(|e| *e != id);
                        }
                        self.arena.extent_mut(id).prior_instance = None;
                    }
                }
            }
            self.arena.release(id);
        }
    }

    /// Record the current incarnation of a segment.
    pub fn update_segment_info(&mut self, segment: SegmentId, seq: SegmentSeq, kind: SegmentKind) {
        self.segments.insert(segment, SegmentInfo { seq, kind });
    }

    pub fn segment_info(&self, segment: SegmentId) -> Option<SegmentInfo> {
        self.segments.get(&segment).copied()
    }

    /// Oldest `dirty_from` in the dirty list; the dirty tail.
    pub fn oldest_dirty_from(&self) -> OldestDirty {
        match self.dirty.front() {
            None => OldestDirty::NoneDirty,
            Some(id) => match self.arena.extent(id).dirty_from() {
                None => OldestDirty::Pending,
                Some(seq) => OldestDirty::At(seq),
            },
        }
    }

    /// Oldest staged backref-log sequence; the alloc tail.
    pub fn oldest_backref_dirty_from(&self) -> Option<JournalSeq> {
        self.backref_log.oldest_seq()
    }

    pub fn last_commit(&self) -> Option<JournalSeq> {
        self.last_commit
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn backref_log(&self) -> &BackrefLog {
        &self.backref_log
    }

    pub fn backref_log_mut(&mut self) -> &mut BackrefLog {
        &mut self.backref_log
    }

    pub fn resident_extents(&self) -> usize {
        self.index.len()
    }

    pub fn resident_bytes(&self) -> u64 {
        self.index.total_bytes()
    }

    pub fn dirty_extents(&self) -> usize {
        self.dirty.len()
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.dirty.dirty_bytes()
    }

    pub fn is_dirty(&self, id: ExtentId) -> bool {
        self.dirty.contains(id)
    }

    /// Dirty extents, oldest first. Observability only; rewriting goes
    /// through [`Cache::get_next_dirty_extents`].
    pub fn dirty_ids(&self) -> Vec<ExtentId> {
        self.dirty.iter_oldest_first().collect_vec()
    }

    pub fn resident_at(&self, paddr: PhysicalAddr) -> Option<ExtentId> {
        self.index.find(paddr)
    }

    // -------- internals shared by the commit and replay paths --------

    fn check_alloc_type(ext_type: ExtentType, laddr: Option<LogicalAddr>) {
        assert!(!ext_type.is_root(), "the root is never directly allocated");
        assert!(ext_type.is_cached() && !ext_type.is_retired_placeholder());
        if laddr.is_some() {
            assert!(ext_type.is_logical() || ext_type.is_laddr_node());
        }
    }

    pub(crate) fn add_to_read_set(&mut self, tid: TransId, id: ExtentId) {
        let paddr = self.arena.extent(id).paddr();
        let weak = self.transaction(tid).weak;
        let t = self.transaction_mut(tid);
        if let Some(&existing) = t.read_set.get(&paddr) {
            debug_assert_eq!(existing, id);
            return;
        }
        t.read_set.insert(paddr, id);
        self.arena.retain(id);
        if !weak {
            self.arena.extent_mut(id).read_transactions.insert(tid);
        }
    }

    /// Build a cold extent by type tag and make it resident. The closed-set
    /// constructor table: the root is never directly read, placeholders and
    /// bookkeeping tags never name loadable extents.
    pub(crate) fn insert_cold_extent(
        &mut self,
        ext_type: ExtentType,
        paddr: PhysicalAddr,
        laddr: Option<LogicalAddr>,
        bytes: Vec<u8>,
    ) -> ExtentId {
        match ext_type {
            ExtentType::Root => panic!("the root is never directly read"),
            ExtentType::RetiredPlaceholder => panic!("placeholders are never loaded"),
            ExtentType::AllocInfo | ExtentType::JournalTail => {
                panic!("{ext_type} never names a resident extent")
            }
            _ => {}
        }
        if ext_type.is_logical() {
            assert!(laddr.is_some(), "logical extent loaded without laddr");
        }
        let mut extent = Extent::new(ext_type, paddr, laddr, ExtentState::Clean, bytes);
        extent.last_committed_crc = self
            .epm
            .get_checksum_needed(paddr)
            .then(|| extent.calc_crc32c().expect("loaded extent has a buffer"));
        let length = extent.length();
        let id = self.arena.insert(extent);
        self.index.insert(&mut self.arena, id);
        self.pinboard.insert(id, length as u64);
        self.arena.release(id);
        id
    }

    fn insert_retired_placeholder(&mut self, paddr: PhysicalAddr, length: u32) -> ExtentId {
        let id = self.arena.insert(Extent::retired_placeholder(paddr, length));
        // placeholders are not eviction candidates, so no pinboard entry
        self.index.insert(&mut self.arena, id);
        self.arena.release(id);
        id
    }

    /// Make a stable extent dirty outside the commit path (replay).
    pub(crate) fn mark_dirty(&mut self, id: ExtentId) {
        assert!(self.arena.extent(id).paddr().is_absolute());
        if self.arena.extent(id).is_stable_dirty() {
            assert!(self.arena.extent(id).linked_dirty);
            return;
        }
        self.pinboard.remove(id);
        self.arena.extent_mut(id).state = ExtentState::Dirty;
        self.dirty.push_back(&mut self.arena, id);
    }

    /// Drop a resident extent from the index, the dirty list and the
    /// pinboard, whichever apply.
    pub(crate) fn remove_extent(&mut self, id: ExtentId) {
        let extent = self.arena.extent(id);
        assert!(extent.is_valid());
        debug_assert!(extent.paddr().is_real_location());
        if extent.is_stable_dirty() {
            self.dirty.erase(&mut self.arena, id);
        } else if !extent.is_placeholder() {
            self.pinboard.remove(id);
        }
        self.index.erase(&mut self.arena, id);
    }

    /// Remove a retired extent and fire invalidations at its readers.
    pub(crate) fn commit_retire_extent(&mut self, tid: TransId, id: ExtentId) {
        self.remove_extent(id);
        self.arena.extent_mut(id).dirty_from = None;
        self.invalidate_extent(tid, id);
    }

    /// Swap `next` in for `prev` in the index and dirty bookkeeping, then
    /// invalidate `prev`, conflicting its readers.
    pub(crate) fn commit_replace_extent(&mut self, tid: TransId, next: ExtentId, prev: ExtentId) {
        {
            let n = self.arena.extent(next);
            let p = self.arena.extent(prev);
            assert_eq!(n.paddr(), p.paddr());
            debug_assert!(n.paddr().is_real_location());
        }
        // keep prev alive through the swap; its last owner may be the very
        // index slot being replaced
        self.arena.retain(prev);
        self.index.replace(&mut self.arena, next, prev);

        if self.arena.extent(prev).ext_type().is_root() {
            assert!(self.arena.extent(prev).is_stable_dirty());
            assert!(self.arena.extent(prev).linked_dirty);
            // the new dirty root goes to the tail; its dirty_from is
            // assigned at complete_commit
            self.dirty.erase(&mut self.arena, prev);
            self.dirty.push_back(&mut self.arena, next);
        } else if self.arena.extent(prev).is_stable_dirty() {
            self.dirty.replace_in_place(&mut self.arena, next, prev);
        } else {
            self.pinboard.remove(prev);
            self.dirty.push_back(&mut self.arena, next);
        }

        self.invalidate_extent(tid, prev);
        self.arena.release(prev);
    }

    /// Invalidate `extent`, conflicting every transaction that has read it.
    pub(crate) fn invalidate_extent(&mut self, cause_tid: TransId, id: ExtentId) {
        if !self.arena.extent(id).may_conflict() {
            assert!(self.arena.extent(id).read_transactions.is_empty());
            self.set_invalid(id);
            return;
        }

        let cause_src = self.transaction(cause_tid).src();
        let readers: Vec<TransId> = self
            .arena
            .extent(id)
            .read_transactions
            .iter()
            .copied()
            .collect();
        let mut logged = false;
        for reader in readers {
            if self.transaction(reader).conflicted {
                continue;
            }
            if !logged {
                debug!("conflict begin -- {:?}", self.arena.extent(id));
                logged = true;
            }
            assert!(!self.transaction(reader).weak);
            let reader_src = self.transaction(reader).src();
            self.stats.account_conflict(cause_src, reader_src);
            self.mark_transaction_conflicted(reader, id);
        }
        self.set_invalid(id);
    }

    fn set_invalid(&mut self, id: ExtentId) {
        let prior = {
            let extent = self.arena.extent_mut(id);
            extent.state = ExtentState::Invalid;
            extent.prior_instance.take()
        };
        // detach from the stable extent this was going to replace; pending
        // clones of *this* extent keep their weak ids, which simply stop
        // resolving once the slot is reclaimed
        if let Some(prior) = prior {
            if let Some(prior_extent) = self.arena.get_mut(prior) {
                prior_extent.mutation_pending.retain(|e| *e != id);
            }
        }
    }

    /// Flag `tid` conflicted and account the effort it wasted. Its eventual
    /// commit call returns [`CacheError::Conflict`].
    pub(crate) fn mark_transaction_conflicted(&mut self, tid: TransId, conflicting: ExtentId) {
        trace!("{tid} conflicted on {conflicting}");
        let (src, weak) = {
            let t = self.transaction(tid);
            (t.src(), t.weak)
        };
        assert!(!weak);
        assert!(!self.transaction(tid).conflicted);
        self.transaction_mut(tid).conflicted = true;

        let mut read_stat = IoStat::default();
        for &id in self.transaction(tid).read_set.values() {
            if let Some(extent) = self.arena.get(id) {
                read_stat.increment(extent.length() as u64);
            }
        }

        if src != TransactionSource::Read {
            let mut retire_stat = IoStat::default();
            for &id in self.transaction(tid).retired_set.values() {
                retire_stat.increment(self.arena.extent(id).length() as u64);
            }
            let mut mutate_stat = IoStat::default();
            let mut delta_bytes = 0u64;
            let mutated: Vec<ExtentId> = self.transaction(tid).mutated_block_list.clone();
            for id in mutated {
                let extent = self.arena.extent(id);
                if !extent.is_valid() {
                    continue;
                }
                mutate_stat.increment(extent.length() as u64);
                delta_bytes += extent.encode_delta().len() as u64;
            }

            // pre-allocated space will never be committed, return it
            let pre_alloc: Vec<(PhysicalAddr, u32)> = self
                .transaction(tid)
                .pre_alloc_list
                .iter()
                .map(|&id| {
                    let extent = self.arena.extent(id);
                    (extent.paddr(), extent.length())
                })
                .collect();
            for (paddr, length) in pre_alloc {
                self.epm.mark_space_free(paddr, length);
            }
            let t = self.transaction_mut(tid);
            t.num_allocated_invalid_extents += t.pre_alloc_list.len() as u64;
            t.num_delayed_invalid_extents += t.delayed_block_list.len() as u64;

            let t = self.transaction(tid);
            let fresh_stat = t.fresh_block_stats;
            let ool_records = t.ool_write_stats.num_records;
            let ool_bytes = t.ool_write_stats.record_bytes();
            let laddr_tree = t.laddr_tree_stats;
            let backref_tree = t.backref_tree_stats;
            let onode_tree = t.onode_tree_stats;
            let omap_tree = t.omap_tree_stats;
            if src.is_background() {
                // cleaner transactions never touch the object trees
                assert!(onode_tree.is_clear());
                assert!(omap_tree.is_clear());
            } else {
                self.stats.fold_invalidated_tree(TreeKind::Onode, &onode_tree);
                self.stats.fold_invalidated_tree(TreeKind::Omap, &omap_tree);
            }
            self.stats.fold_invalidated_tree(TreeKind::Laddr, &laddr_tree);
            self.stats.fold_invalidated_tree(TreeKind::Backref, &backref_tree);
            let efforts = &mut self.stats.invalidated[src.index()];
            efforts.num_trans += 1;
            efforts.read.increment_stat(read_stat);
            efforts.retire.increment_stat(retire_stat);
            efforts.fresh.increment_stat(fresh_stat);
            efforts.mutate.increment_stat(mutate_stat);
            efforts.mutate_delta_bytes += delta_bytes;
            efforts.num_ool_records += ool_records;
            efforts.ool_record_bytes += ool_bytes;
            debug!(
                "{tid} discard {read_stat} read, {fresh_stat} fresh, {mutate_stat} delta, \
                 {retire_stat} retire, {ool_records}({ool_bytes}B) ool-records"
            );
        } else {
            let t = self.transaction(tid);
            assert!(t.retired_set.is_empty());
            assert!(t.fresh_block_stats.is_clear());
            assert!(t.mutated_block_list.is_empty());
            assert!(t.ool_write_stats.is_clear());
            let efforts = &mut self.stats.invalidated[src.index()];
            efforts.num_trans += 1;
            efforts.read.increment_stat(read_stat);
            debug!("{tid} discard {read_stat} read");
        }
    }
}
