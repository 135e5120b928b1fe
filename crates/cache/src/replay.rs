//! Reconstructing cache state from journal deltas on mount.

use log::{debug, trace};
use lodestore_primitives::{ExtentType, JournalSeq, ModifyTime, PhysicalAddr};

use crate::backref::BackrefEntry;
use crate::extent::{ExtentId, ExtentState};
use crate::record::{AllocDelta, AllocOp, DeltaInfo};
use crate::{Cache, Result, TouchHint};

impl Cache {
    /// Apply one journal delta read back at mount.
    ///
    /// Returns whether the delta was applied, and the extent it touched if
    /// any. Deltas below the corresponding tail, deltas addressing stale
    /// segment incarnations, and deltas whose target has been rewritten
    /// away are skipped.
    pub fn replay_delta(
        &mut self,
        journal_seq: JournalSeq,
        record_base: PhysicalAddr,
        delta: &DeltaInfo,
        dirty_tail: JournalSeq,
        alloc_tail: JournalSeq,
        modify_time: ModifyTime,
    ) -> Result<(bool, Option<ExtentId>)> {
        assert!(modify_time != ModifyTime(0));

        // The journal may validly contain deltas for extents in since
        // reclaimed segments. A segment whose current incarnation differs
        // from the one the delta was written against must already have had
        // its live extents rewritten, so the delta is obsolete.
        if let Some(segment) = delta.paddr.and_then(|p| p.segment()) {
            if let Some(info) = self.segment_info(segment) {
                if Some(info.seq) != delta.ext_seq || Some(info.kind) != delta.seg_kind {
                    debug!(
                        "replay: delta at {journal_seq} is obsolete, segment {segment:?} \
                         is now {info:?}"
                    );
                    return Ok((false, None));
                }
            }
        }

        if delta.ext_type == ExtentType::JournalTail {
            // already consumed while locating the mount point
            return Ok((false, None));
        }

        if delta.ext_type == ExtentType::AllocInfo {
            if journal_seq < alloc_tail {
                debug!("replay: {journal_seq} < alloc_tail {alloc_tail}, skip alloc delta");
                return Ok((false, None));
            }
            let alloc_delta = AllocDelta::decode(&delta.bytes)?;
            let mut entries = Vec::with_capacity(alloc_delta.blocks.len());
            for block in alloc_delta.blocks {
                let paddr = if block.paddr.is_record_relative() {
                    record_base.add_relative(block.paddr)
                } else {
                    assert!(block.paddr.is_absolute());
                    block.paddr
                };
                trace!(
                    "replay alloc_blk {paddr}~{:#x} {:?} at {journal_seq}",
                    block.length,
                    block.laddr
                );
                entries.push(match alloc_delta.op {
                    AllocOp::Set => BackrefEntry::create(
                        paddr,
                        block.laddr.expect("alloc entries carry a logical address"),
                        block.length,
                        block.ext_type,
                    ),
                    AllocOp::Clear => BackrefEntry::retire(paddr, block.length, block.ext_type),
                });
            }
            self.apply_backref_byseq(entries, journal_seq);
            return Ok((true, None));
        }

        if journal_seq < dirty_tail {
            debug!("replay: {journal_seq} < dirty_tail {dirty_tail}, skip {delta:?}");
            return Ok((false, None));
        }

        if delta.ext_type.is_root() {
            let root = self.root.expect("cache not initialized");
            assert_eq!(delta.paddr, Some(PhysicalAddr::Root));
            trace!("replay root delta at {journal_seq}");
            self.remove_extent(root);
            {
                let extent = self.arena.extent_mut(root);
                extent
                    .apply_delta_bytes(&delta.bytes)
                    .expect("malformed root delta");
                extent.dirty_from = Some(journal_seq);
                extent.state = ExtentState::Dirty;
                // a dirty extent cannot stay at version 0
                extent.version = 1;
                extent.modify_time = Some(modify_time);
            }
            self.index.insert(&mut self.arena, root);
            self.dirty.push_back(&mut self.arena, root);
            debug!("replayed root delta at {journal_seq} -- {:?}", self.arena.extent(root));
            return Ok((true, Some(root)));
        }

        let paddr = delta.paddr.expect("extent deltas carry an address");
        assert!(paddr.is_absolute());

        let extent = if delta.pversion == 0 {
            // the delta initializes the extent, fault it in cold
            Some(self.replay_fault_in(delta, paddr)?)
        } else {
            // no transaction has run yet, so no placeholder can exist
            let cached = self.index.find(paddr);
            if let Some(id) = cached {
                assert!(!self.arena.extent(id).is_placeholder());
            }
            cached
        };
        let Some(id) = extent else {
            debug!(
                "replay: extent at {paddr} is not present, delta at {journal_seq} is obsolete"
            );
            assert!(delta.pversion > 0, "initial delta for an absent extent");
            return Ok((false, None));
        };

        if paddr.is_absolute_segmented() || !delta.ext_type.can_inplace_rewrite() {
            {
                let extent = self.arena.extent(id);
                assert_eq!(
                    extent.last_committed_crc(),
                    delta.prev_crc,
                    "crc mismatch replaying {delta:?} against {extent:?}"
                );
                debug_assert_eq!(extent.version(), delta.pversion);
            }
            let extent = self.arena.extent_mut(id);
            extent
                .apply_delta_bytes(&delta.bytes)
                .expect("malformed extent delta");
            extent.modify_time = Some(modify_time);
            assert_eq!(
                extent.last_committed_crc, delta.final_crc,
                "delta application diverged from the committed image"
            );
        } else {
            // in-place rewrites may legitimately desynchronize version and
            // crc; both are verified wholesale after replay finishes
            assert!(paddr.is_absolute_random_block());
            let extent = self.arena.extent_mut(id);
            extent
                .apply_delta_bytes(&delta.bytes)
                .expect("malformed extent delta");
            extent.modify_time = Some(modify_time);
        }

        {
            let extent = self.arena.extent_mut(id);
            extent.version += 1;
            if extent.version == 1 {
                extent.dirty_from = Some(journal_seq);
            }
        }
        debug!(
            "replayed extent delta at {journal_seq} -- {:?}",
            self.arena.extent(id)
        );
        self.mark_dirty(id);
        Ok((true, Some(id)))
    }

    /// Cold fault-in during replay, by type tag. Replay touches the
    /// pinboard with its own hint so the eviction policy can tell replayed
    /// residency from transaction traffic.
    fn replay_fault_in(&mut self, delta: &DeltaInfo, paddr: PhysicalAddr) -> Result<ExtentId> {
        if let Some(id) = self.index.find(paddr) {
            assert!(!self.arena.extent(id).is_placeholder());
            self.pinboard.touch(id, TouchHint::Replay);
            return Ok(id);
        }
        let bytes = self.source.read(paddr, delta.length)?;
        let id = self.insert_cold_extent(delta.ext_type, paddr, delta.laddr, bytes);
        self.pinboard.touch(id, TouchHint::Replay);
        Ok(id)
    }
}
