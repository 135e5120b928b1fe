//! Resident extents and the arena that owns them.
//!
//! Extents are held in a generational arena and referred to by [`ExtentId`].
//! The index, the dirty list and each transaction hold explicit strong
//! counts on the slots they reference; the `prior_instance` relation from a
//! pending mutation to the stable extent it will replace is deliberately
//! weak — a stale id resolves to `None` instead of aliasing a reused slot.

use std::collections::BTreeSet;

use lodestore_primitives::buffer::{BufReader, BufWriter, DecodeError};
use lodestore_primitives::{ExtentType, JournalSeq, LogicalAddr, ModifyTime, PhysicalAddr};
use slab::Slab;
use smallvec::SmallVec;

use crate::transaction::TransId;

/// Generational handle to an extent slot in the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtentId {
    slot: u32,
    gen: u32,
}

impl std::fmt::Display for ExtentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ext={}.{}", self.slot, self.gen)
    }
}

/// Lifecycle state of a resident extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExtentState {
    /// Resident and matching the on-device image.
    Clean,
    /// In-memory state is newer than the device image; linked in the dirty
    /// list.
    Dirty,
    /// A pending mutation owned by one transaction, replacing
    /// `prior_instance` on commit.
    MutationPending,
    /// A pending mutation of an extent whose existence was established
    /// within the owning transaction; has no prior instance.
    ExistMutationPending,
    /// An extent whose existence was established within the owning
    /// transaction, unmodified so far.
    ExistClean,
    /// Freshly allocated, waiting for its final physical address after the
    /// journal write.
    CleanPending,
    /// Terminal. Dropped from the index; readers of it must conflict.
    Invalid,
}

/// Pending-I/O barrier. Records the state the extent held when the barrier
/// was set; cleared by `complete_io`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoWait {
    pub from_state: ExtentState,
}

/// One staged splice against an extent buffer. The encoded sequence of
/// these is the delta payload journaled for the extent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaOp {
    pub offset: u32,
    pub bytes: Vec<u8>,
}

impl DeltaOp {
    fn encode(&self, w: &mut impl BufWriter) {
        w.put_u32(self.offset);
        w.put_u32(self.bytes.len() as u32);
        w.put_slice(&self.bytes);
    }

    fn decode<'a>(r: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        let offset = r.get_u32()?;
        let len = r.get_u32()? as usize;
        let bytes = r.get_slice(len)?.to_vec();
        Ok(Self { offset, bytes })
    }
}

/// Encode a staged splice list into delta payload bytes.
pub fn encode_delta_ops(ops: &[DeltaOp]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        op.encode(&mut out);
    }
    out
}

/// Decode delta payload bytes back into splice operations.
pub fn decode_delta_ops(mut bytes: &[u8]) -> Result<Vec<DeltaOp>, DecodeError> {
    let mut ops = Vec::new();
    while bytes.remaining() > 0 {
        ops.push(DeltaOp::decode(&mut bytes)?);
    }
    Ok(ops)
}

/// A fixed-length, physically addressed payload unit managed by the cache.
pub struct Extent {
    pub(crate) ext_type: ExtentType,
    pub(crate) paddr: PhysicalAddr,
    pub(crate) laddr: Option<LogicalAddr>,
    /// Payload. `None` only for retired placeholders.
    pub(crate) buffer: Option<Vec<u8>>,
    pub(crate) length: u32,
    /// 0 = clean-from-disk, >= 1 = has uncommitted or replayed mutations.
    pub(crate) version: u32,
    pub(crate) state: ExtentState,
    /// Journal sequence at which this extent became dirty.
    pub(crate) dirty_from: Option<JournalSeq>,
    /// Crc matching the device image; `None` when no crc is needed.
    pub(crate) last_committed_crc: Option<u32>,
    pub(crate) modify_time: Option<ModifyTime>,
    /// Weak back-reference from a pending mutation to the stable extent it
    /// will replace. Cleared in `complete_commit` and on invalidation.
    pub(crate) prior_instance: Option<ExtentId>,
    /// Pending mutations cloned off this stable extent, one per mutating
    /// transaction.
    pub(crate) mutation_pending: SmallVec<[ExtentId; 1]>,
    /// Non-weak transactions that have observed this extent and must be
    /// invalidated if it becomes `Invalid`.
    pub(crate) read_transactions: BTreeSet<TransId>,
    pub(crate) io_wait: Option<IoWait>,
    pub(crate) pending_for_transaction: Option<TransId>,
    /// Splices staged since this extent became mutable.
    pub(crate) staged_delta: Vec<DeltaOp>,
    /// Whether this extent is linked in the dirty list.
    pub(crate) linked_dirty: bool,
}

impl Extent {
    pub(crate) fn new(
        ext_type: ExtentType,
        paddr: PhysicalAddr,
        laddr: Option<LogicalAddr>,
        state: ExtentState,
        buffer: Vec<u8>,
    ) -> Self {
        let length = buffer.len() as u32;
        Self {
            ext_type,
            paddr,
            laddr,
            buffer: Some(buffer),
            length,
            version: 0,
            state,
            dirty_from: None,
            last_committed_crc: None,
            modify_time: None,
            prior_instance: None,
            mutation_pending: SmallVec::new(),
            read_transactions: BTreeSet::new(),
            io_wait: None,
            pending_for_transaction: None,
            staged_delta: Vec::new(),
            linked_dirty: false,
        }
    }

    /// A placeholder recording that `paddr` is known-retired. No buffer,
    /// never dirty, never evicted.
    pub(crate) fn retired_placeholder(paddr: PhysicalAddr, length: u32) -> Self {
        debug_assert!(paddr.is_absolute());
        Self {
            ext_type: ExtentType::RetiredPlaceholder,
            paddr,
            laddr: None,
            buffer: None,
            length,
            version: 0,
            state: ExtentState::Clean,
            dirty_from: None,
            last_committed_crc: None,
            modify_time: None,
            prior_instance: None,
            mutation_pending: SmallVec::new(),
            read_transactions: BTreeSet::new(),
            io_wait: None,
            pending_for_transaction: None,
            staged_delta: Vec::new(),
            linked_dirty: false,
        }
    }

    pub fn ext_type(&self) -> ExtentType {
        self.ext_type
    }

    pub fn paddr(&self) -> PhysicalAddr {
        self.paddr
    }

    pub fn laddr(&self) -> Option<LogicalAddr> {
        self.laddr
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn state(&self) -> ExtentState {
        self.state
    }

    pub fn dirty_from(&self) -> Option<JournalSeq> {
        self.dirty_from
    }

    pub fn last_committed_crc(&self) -> Option<u32> {
        self.last_committed_crc
    }

    pub fn modify_time(&self) -> Option<ModifyTime> {
        self.modify_time
    }

    pub fn prior_instance(&self) -> Option<ExtentId> {
        self.prior_instance
    }

    pub fn buffer(&self) -> Option<&[u8]> {
        self.buffer.as_deref()
    }

    pub fn is_valid(&self) -> bool {
        self.state != ExtentState::Invalid
    }

    pub fn is_mutable(&self) -> bool {
        matches!(
            self.state,
            ExtentState::MutationPending | ExtentState::ExistMutationPending
        )
    }

    pub fn is_mutation_pending(&self) -> bool {
        self.state == ExtentState::MutationPending
    }

    pub fn is_exist_clean(&self) -> bool {
        self.state == ExtentState::ExistClean
    }

    pub fn is_exist_mutation_pending(&self) -> bool {
        self.state == ExtentState::ExistMutationPending
    }

    pub fn is_stable_dirty(&self) -> bool {
        self.state == ExtentState::Dirty
    }

    pub fn is_stable_clean(&self) -> bool {
        self.state == ExtentState::Clean
    }

    /// Clean with a pending-write barrier: freshly journaled, address not
    /// final yet.
    pub fn is_stable_clean_pending(&self) -> bool {
        self.state == ExtentState::CleanPending
            || (self.state == ExtentState::Clean && self.io_wait.is_some())
    }

    pub fn is_placeholder(&self) -> bool {
        self.ext_type.is_retired_placeholder()
    }

    pub fn is_logical(&self) -> bool {
        self.ext_type.is_logical()
    }

    pub fn is_fully_loaded(&self) -> bool {
        self.buffer.is_some() || self.is_placeholder()
    }

    pub fn is_pending_io(&self) -> bool {
        self.io_wait.is_some()
    }

    /// Retired placeholders record absence only; nothing reads through
    /// them, so invalidating one conflicts nobody.
    pub fn may_conflict(&self) -> bool {
        !self.is_placeholder()
    }

    pub fn calc_crc32c(&self) -> Option<u32> {
        self.buffer.as_deref().map(crc32c::crc32c)
    }

    /// Set the pending-I/O barrier and transition to `next`. The state held
    /// at barrier time is kept for the commit applier's checks.
    pub(crate) fn set_io_wait(&mut self, next: ExtentState) {
        debug_assert!(self.io_wait.is_none());
        self.io_wait = Some(IoWait {
            from_state: self.state,
        });
        self.state = next;
    }

    pub(crate) fn complete_io(&mut self) {
        debug_assert!(self.io_wait.is_some());
        self.io_wait = None;
    }

    /// Stage a splice: mutate the buffer and record the delta op.
    pub(crate) fn splice(&mut self, offset: u32, bytes: &[u8]) {
        let buf = self.buffer.as_mut().expect("splice on bufferless extent");
        let end = offset as usize + bytes.len();
        assert!(end <= buf.len(), "splice beyond extent length");
        buf[offset as usize..end].copy_from_slice(bytes);
        self.staged_delta.push(DeltaOp {
            offset,
            bytes: bytes.to_vec(),
        });
    }

    /// Encode the staged splice list as the delta payload for this extent.
    pub(crate) fn encode_delta(&self) -> Vec<u8> {
        encode_delta_ops(&self.staged_delta)
    }

    /// Apply a decoded delta payload to the buffer and refresh the crc.
    pub(crate) fn apply_delta_bytes(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        let ops = decode_delta_ops(bytes)?;
        let buf = self
            .buffer
            .as_mut()
            .expect("delta applied to bufferless extent");
        for op in &ops {
            let end = op.offset as usize + op.bytes.len();
            if end > buf.len() {
                return Err(DecodeError::BufferLength {
                    for_type: "DeltaOp",
                    expected: end,
                    given: buf.len(),
                });
            }
            buf[op.offset as usize..end].copy_from_slice(&op.bytes);
        }
        self.last_committed_crc = Some(crc32c::crc32c(buf));
        Ok(())
    }
}

impl std::fmt::Debug for Extent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extent")
            .field("type", &self.ext_type)
            .field("paddr", &self.paddr)
            .field("laddr", &self.laddr)
            .field("length", &self.length)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("dirty_from", &self.dirty_from)
            .field("crc", &self.last_committed_crc)
            .finish()
    }
}

struct Slot {
    extent: Extent,
    strong: u32,
}

/// Generational arena of extents with explicit strong counts.
///
/// `retain`/`release` realize the ownership model: the index, the dirty
/// list and each transaction list hold one count apiece. A slot is freed
/// when its count drops to zero, and its generation bumps so stale
/// [`ExtentId`]s stop resolving.
pub(crate) struct ExtentArena {
    slots: Slab<Slot>,
    gens: Vec<u32>,
}

impl ExtentArena {
    pub fn new() -> Self {
        Self {
            slots: Slab::new(),
            gens: Vec::new(),
        }
    }

    /// Insert with an initial strong count of one, owned by the caller.
    pub fn insert(&mut self, extent: Extent) -> ExtentId {
        let slot = self.slots.insert(Slot { extent, strong: 1 });
        if slot >= self.gens.len() {
            self.gens.resize(slot + 1, 0);
        }
        ExtentId {
            slot: slot as u32,
            gen: self.gens[slot],
        }
    }

    pub fn get(&self, id: ExtentId) -> Option<&Extent> {
        if self.gens.get(id.slot as usize) != Some(&id.gen) {
            return None;
        }
        self.slots.get(id.slot as usize).map(|s| &s.extent)
    }

    pub fn get_mut(&mut self, id: ExtentId) -> Option<&mut Extent> {
        if self.gens.get(id.slot as usize) != Some(&id.gen) {
            return None;
        }
        self.slots.get_mut(id.slot as usize).map(|s| &mut s.extent)
    }

    #[track_caller]
    pub fn extent(&self, id: ExtentId) -> &Extent {
        self.get(id).expect("stale extent id")
    }

    #[track_caller]
    pub fn extent_mut(&mut self, id: ExtentId) -> &mut Extent {
        self.get_mut(id).expect("stale extent id")
    }

    pub fn retain(&mut self, id: ExtentId) {
        assert_eq!(self.gens[id.slot as usize], id.gen, "retain of stale id");
        self.slots[id.slot as usize].strong += 1;
    }

    /// Drop one strong count; frees the slot at zero. Returns whether the
    /// extent was freed.
    pub fn release(&mut self, id: ExtentId) -> bool {
        assert_eq!(self.gens[id.slot as usize], id.gen, "release of stale id");
        let slot = &mut self.slots[id.slot as usize];
        assert!(slot.strong > 0);
        slot.strong -= 1;
        if slot.strong == 0 {
            self.slots.remove(id.slot as usize);
            self.gens[id.slot as usize] += 1;
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::ExtentId;

    /// An id that resolves nowhere; for tests that only need a handle.
    pub(crate) fn dangling_id(slot: u32) -> ExtentId {
        ExtentId { slot, gen: u32::MAX }
    }
}
