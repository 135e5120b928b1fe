//! Turning a committing transaction into a journal record, and applying
//! the commit to the cache once the record is durable.

use itertools::Itertools;
use log::{debug, info, trace};
use lodestore_primitives::{
    ExtentType, JournalSeq, LogicalAddr, ModifyTime, PhysicalAddr,
};

use crate::backref::BackrefEntry;
use crate::extent::{ExtentId, ExtentState};
use crate::record::{
    AllocBlock, AllocDelta, AllocOp, DeltaInfo, JournalTailDelta, Record, RecordExtent,
};
use crate::stats::IoStat;
use crate::transaction::{TransactionSource, TransId, TreeKind};
use crate::{Cache, CacheError, OldestDirty, Result};

impl Cache {
    /// Condense transaction `tid` into a journal record.
    ///
    /// Side effects: the index and dirty list are mutated to reflect the
    /// commit, replaced and retired extents are invalidated (conflicting
    /// their readers), and fresh/mutated extents are left behind a
    /// pending-I/O barrier that [`Cache::complete_commit`] resolves.
    ///
    /// `journal_head` and `journal_dirty_tail` feed the journal-tail delta
    /// emitted for background transactions.
    pub fn prepare_record(
        &mut self,
        tid: TransId,
        journal_head: Option<JournalSeq>,
        journal_dirty_tail: Option<JournalSeq>,
    ) -> Result<Record> {
        let src = {
            let t = self.transaction(tid);
            assert!(!t.is_weak());
            assert_ne!(t.src(), TransactionSource::Read);
            if t.is_conflicted() {
                return Err(CacheError::Conflict);
            }
            t.src()
        };
        trace!("{tid} prepare_record: head={journal_head:?} dirty_tail={journal_dirty_tail:?}");

        // 1. Validate and drop the read set. An invalid entry here means
        // the caller ignored conflict signaling; that is a bug, not an
        // error.
        let read_ids: Vec<ExtentId> = self.transaction(tid).read_set.values().copied().collect();
        let mut read_stat = IoStat::default();
        for &id in &read_ids {
            let extent = self.arena.extent(id);
            assert!(
                extent.is_valid(),
                "invalid extent in the read set of {tid} -- {extent:?}"
            );
            read_stat.increment(extent.length() as u64);
        }
        for id in read_ids {
            self.arena.extent_mut(id).read_transactions.remove(&tid);
            self.arena.release(id);
        }
        {
            let t = self.transaction_mut(tid);
            t.read_set.clear();
            t.write_set.clear();
        }

        let mut record = Record::new(src);
        let commit_time = ModifyTime::now();

        // 2. Emit deltas for mutated extents.
        let mutated: Vec<ExtentId> = self.transaction(tid).mutated_block_list.clone();
        let mut mutate_stat = IoStat::default();
        let mut delta_stat = IoStat::default();
        for &id in &mutated {
            if !self.arena.extent(id).is_valid() {
                debug!("{tid} invalid mutated extent {id}");
                continue;
            }
            {
                let extent = self.arena.extent(id);
                assert!(
                    extent.is_exist_mutation_pending() || extent.prior_instance().is_some()
                );
                mutate_stat.increment(extent.length() as u64);
            }
            let delta_bytes = self.arena.extent(id).encode_delta();
            assert!(!delta_bytes.is_empty(), "mutated extent with empty delta");
            self.arena.extent_mut(id).modify_time = Some(commit_time);

            if self.arena.extent(id).is_mutation_pending() {
                let prior = self.arena.extent(id).prior_instance().expect("checked above");
                let prior_version = self.arena.extent(prior).version();
                if prior_version == 0 && self.arena.extent(id).version() > 1 {
                    // The prior was downgraded to clean by a concurrent
                    // in-place rewrite, which does not modify the payload.
                    // Reconcile the version so the emitted delta applies
                    // against version 0.
                    debug!(
                        "{tid} commit replace extent (inplace-rewrite) {id}, prior={prior}"
                    );
                    let prior_extent = self.arena.extent(prior);
                    assert!(prior_extent.ext_type().can_inplace_rewrite());
                    assert_eq!(prior_extent.state(), ExtentState::Clean);
                    assert_eq!(prior_extent.dirty_from(), Some(JournalSeq::MIN));
                    assert!(prior_extent.paddr().is_absolute_random_block());
                    assert!(self.arena.extent(id).ext_type().can_inplace_rewrite());
                    self.arena.extent_mut(id).version = 1;
                } else {
                    debug!("{tid} commit replace extent {id}, prior={prior}");
                }
            } else {
                assert!(self.arena.extent(id).is_exist_mutation_pending());
            }

            assert!(self.arena.extent(id).version() > 0);
            let final_crc = self.arena.extent(id).calc_crc32c();
            let is_root = self.arena.extent(id).ext_type().is_root();
            if is_root {
                trace!("{tid} writing out root delta {}B", delta_bytes.len());
                assert_eq!(self.transaction(tid).root(), Some(id));
                // the pending root becomes the cache's root singleton
                let prev_root = self.root.replace(id).expect("cache not initialized");
                self.arena.retain(id);
                self.arena.release(prev_root);
                let pversion = self.arena.extent(id).version() - 1;
                record.deltas.push(DeltaInfo {
                    ext_type: ExtentType::Root,
                    paddr: Some(PhysicalAddr::Root),
                    laddr: None,
                    prev_crc: Some(0),
                    final_crc: Some(0),
                    length: 0,
                    pversion,
                    ext_seq: None,
                    seg_kind: None,
                    bytes: delta_bytes.clone(),
                });
            } else {
                let extent = self.arena.extent(id);
                let (ext_seq, seg_kind) = extent
                    .paddr()
                    .segment()
                    .and_then(|segment| self.segment_info(segment))
                    .map_or((None, None), |info| (Some(info.seq), Some(info.kind)));
                let delta = DeltaInfo {
                    ext_type: extent.ext_type(),
                    paddr: Some(extent.paddr()),
                    laddr: extent.is_logical().then(|| extent.laddr()).flatten(),
                    prev_crc: extent.last_committed_crc(),
                    final_crc,
                    length: extent.length(),
                    pversion: extent.version() - 1,
                    ext_seq,
                    seg_kind,
                    bytes: delta_bytes.clone(),
                };
                record.deltas.push(delta);
                self.arena.extent_mut(id).last_committed_crc = final_crc;
            }
            delta_stat.increment(delta_bytes.len() as u64);
        }

        // 3. Fresh extents would run their pre-commit fixups here, before
        // the retirement sweep, so replacement tree nodes can still reach
        // their prior instances. Our payloads carry no such linkage.

        // 4. Swap replacements into the index and fire invalidations.
        for &id in &mutated {
            if !self.arena.extent(id).is_valid() {
                continue;
            }
            if self.arena.extent(id).is_mutation_pending() {
                let prior = self.arena.extent(id).prior_instance().expect("pending has prior");
                self.arena.extent_mut(id).set_io_wait(ExtentState::Dirty);
                self.commit_replace_extent(tid, id, prior);
            }
            // exist-mutation-pending extents have no prior to replace;
            // they are indexed and barriered with the existing blocks below
        }

        // 5. Retire.
        let retired: Vec<(PhysicalAddr, ExtentId)> = self
            .transaction(tid)
            .retired_set
            .iter()
            .map(|(&paddr, &id)| (paddr, id))
            .collect();
        let mut retire_stat = IoStat::default();
        let mut rel_blocks: Vec<AllocBlock> = Vec::new();
        let mut backref_entries: Vec<BackrefEntry> = Vec::new();
        for (paddr, id) in retired {
            let (ext_type, length) = {
                let extent = self.arena.extent(id);
                assert!(extent.is_valid(), "retired extent already invalid");
                (extent.ext_type(), extent.length())
            };
            retire_stat.increment(length as u64);
            debug!("{tid} retire and remove {paddr}~{length:#x} ({ext_type})");
            self.commit_retire_extent(tid, id);

            if ext_type.is_backref_mapped() || ext_type.is_retired_placeholder() {
                rel_blocks.push(AllocBlock {
                    paddr,
                    laddr: None,
                    length,
                    ext_type,
                });
                backref_entries.push(BackrefEntry::retire(paddr, length, ext_type));
            } else if ext_type.is_backref_node() {
                let registered = self.backref_extents.remove(&paddr);
                assert!(registered.is_some(), "unregistered backref node retired");
            } else {
                panic!("retired extent of unexpected type {ext_type}");
            }
        }

        // 6. Fresh inline extents. Payloads enter the record in
        // allocation order, matching their record-relative addresses;
        // invalid payloads are still written to keep the offsets stable.
        let inline: Vec<ExtentId> = self.transaction(tid).inline_block_list.clone();
        let mut fresh_stat = IoStat::default();
        let mut fresh_invalid_stat = IoStat::default();
        let mut alloc_blocks: Vec<AllocBlock> = Vec::new();
        for &id in &inline {
            let valid = self.arena.extent(id).is_valid();
            let length = self.arena.extent(id).length();
            if !valid {
                debug!("{tid} invalid fresh inline extent {id}");
                fresh_invalid_stat.increment(length as u64);
            }
            fresh_stat.increment(length as u64);
            {
                let extent = self.arena.extent(id);
                assert!(extent.paddr().is_record_relative());
                assert!(!extent.ext_type().is_root(), "the root is never written fresh");
            }
            let extent = self.arena.extent(id);
            let payload = extent.buffer().expect("fresh extent has a buffer").to_vec();
            assert_eq!(payload.len(), length as usize);
            record.extents.push(RecordExtent {
                ext_type: extent.ext_type(),
                laddr: Self::node_laddr(extent.ext_type(), extent.laddr()),
                bytes: payload,
                modify_time: extent.modify_time().unwrap_or(commit_time),
            });
            if !valid {
                continue;
            }
            if extent.ext_type().is_backref_mapped() {
                alloc_blocks.push(AllocBlock {
                    paddr: extent.paddr(),
                    laddr: Some(Self::alloc_laddr(extent.ext_type(), extent.laddr())),
                    length,
                    ext_type: extent.ext_type(),
                });
            }
            let crc = extent.calc_crc32c();
            let e = self.arena.extent_mut(id);
            e.last_committed_crc = crc;
            e.set_io_wait(ExtentState::Clean);
        }

        // 7. Out-of-line extents: already written, no payload to append.
        let ool: Vec<ExtentId> = self.transaction(tid).ool_block_list.clone();
        let mut fresh_ool_stat = IoStat::default();
        for &id in &ool {
            let extent = self.arena.extent(id);
            trace!("{tid} fresh ool extent {id}");
            assert!(extent.is_valid());
            assert!(extent.paddr().is_absolute());
            fresh_ool_stat.increment(extent.length() as u64);
            if extent.ext_type().is_backref_mapped() {
                alloc_blocks.push(AllocBlock {
                    paddr: extent.paddr(),
                    laddr: Some(Self::alloc_laddr(extent.ext_type(), extent.laddr())),
                    length: extent.length(),
                    ext_type: extent.ext_type(),
                });
            }
            let crc = self
                .epm
                .get_checksum_needed(extent.paddr())
                .then(|| extent.calc_crc32c().expect("ool extent has a buffer"));
            let e = self.arena.extent_mut(id);
            e.last_committed_crc = crc;
            e.set_io_wait(ExtentState::Clean);
        }

        // 8. In-place rewrites: dirty extents rewritten at their current
        // address become clean again, with no pending I/O to resolve.
        let inplace: Vec<ExtentId> = self.transaction(tid).inplace_ool_block_list.clone();
        for &id in &inplace {
            if !self.arena.extent(id).is_valid() {
                continue;
            }
            let length = {
                let extent = self.arena.extent(id);
                assert_eq!(extent.state(), ExtentState::Dirty);
                assert!(extent.version() > 0);
                assert!(extent.pending_for_transaction.is_none());
                assert!(extent.prior_instance().is_none());
                extent.length()
            };
            self.dirty.erase(&mut self.arena, id);
            let extent = self.arena.extent_mut(id);
            extent.version = 0;
            extent.dirty_from = Some(JournalSeq::MIN);
            extent.state = ExtentState::Clean;
            extent.staged_delta.clear();
            assert!(!extent.is_pending_io());
            self.pinboard.insert(id, length as u64);
            debug!("{tid} inplace rewrite committed {id}");
        }

        // 9. Existing blocks (remap halves) become resident.
        let existing: Vec<ExtentId> = self.transaction(tid).existing_block_list.clone();
        let mut existing_stat = IoStat::default();
        {
            let mut valid_num = 0;
            let mut clean_num = 0;
            let mut mutated_num = 0;
            for &id in &existing {
                let extent = self.arena.extent(id);
                if extent.is_valid() {
                    valid_num += 1;
                    if extent.is_exist_clean() {
                        clean_num += 1;
                    } else {
                        mutated_num += 1;
                    }
                }
            }
            debug!(
                "{tid} existing blocks: valid={valid_num} clean={clean_num} mutated={mutated_num}"
            );
            let t = self.transaction_mut(tid);
            t.existing_block_stats.valid_num = valid_num;
            t.existing_block_stats.clean_num = clean_num;
            t.existing_block_stats.mutated_num = mutated_num;
        }
        for &id in &existing {
            {
                let extent = self.arena.extent(id);
                assert!(extent.ext_type().is_logical());
                if !extent.is_valid() {
                    continue;
                }
            }
            let (paddr, laddr, length, ext_type) = {
                let extent = self.arena.extent(id);
                (
                    extent.paddr(),
                    extent.laddr().expect("existing extents are logical"),
                    extent.length(),
                    extent.ext_type(),
                )
            };
            existing_stat.increment(length as u64);
            if self.arena.extent(id).is_exist_clean() {
                let extent = self.arena.extent_mut(id);
                assert_eq!(extent.version(), 0);
                assert!(extent.prior_instance().is_none());
                assert!(!extent.is_pending_io());
                extent.pending_for_transaction = None;
                extent.state = ExtentState::Clean;
            } else {
                assert!(self.arena.extent(id).is_exist_mutation_pending());
                self.arena.extent_mut(id).set_io_wait(ExtentState::Dirty);
            }

            self.index.insert(&mut self.arena, id);
            if self.arena.extent(id).is_stable_dirty() {
                self.dirty.push_back(&mut self.arena, id);
            } else {
                self.pinboard.insert(id, length as u64);
            }

            alloc_blocks.push(AllocBlock {
                paddr,
                laddr: Some(laddr),
                length,
                ext_type,
            });
            // remapping splits into retire + alloc; both halves commit
            // atomically within this record
            backref_entries.push(BackrefEntry::create(paddr, laddr, length, ext_type));
        }

        // 10. Serialize the allocation bookkeeping, retires first.
        for (op, blocks) in [(AllocOp::Clear, rel_blocks), (AllocOp::Set, alloc_blocks)] {
            if blocks.is_empty() {
                continue;
            }
            let alloc_delta = AllocDelta { op, blocks };
            record.deltas.push(DeltaInfo {
                ext_type: ExtentType::AllocInfo,
                paddr: None,
                laddr: None,
                prev_crc: None,
                final_crc: None,
                length: 0,
                pversion: 0,
                ext_seq: None,
                seg_kind: None,
                bytes: alloc_delta.to_bytes(),
            });
        }

        // 11. Background transactions carry the journal tails forward.
        if src.is_background() {
            let journal_head =
                journal_head.expect("background commits require the journal head");
            let dirty_tail = match self.oldest_dirty_from() {
                OldestDirty::At(seq) => seq,
                OldestDirty::NoneDirty => {
                    info!("{tid} dirty_tail all trimmed, set to head {journal_head}");
                    journal_head
                }
                OldestDirty::Pending => {
                    let tail = journal_dirty_tail
                        .expect("dirty tail pending and no caller-provided tail");
                    info!("{tid} dirty_tail is pending, set to {tail}");
                    tail
                }
            };
            let alloc_tail = match self.oldest_backref_dirty_from() {
                Some(seq) => seq,
                None => {
                    info!("{tid} alloc_tail all trimmed, set to head {journal_head}");
                    journal_head
                }
            };
            let tails = JournalTailDelta {
                alloc_tail,
                dirty_tail,
            };
            debug!("{tid} update tails as delta {tails:?}");
            record.deltas.push(DeltaInfo {
                ext_type: ExtentType::JournalTail,
                paddr: None,
                laddr: None,
                prev_crc: None,
                final_crc: None,
                length: 0,
                pversion: 0,
                ext_seq: None,
                seg_kind: None,
                bytes: tails.to_bytes(),
            });
        }

        // 12. Stage the backref entries; they are installed into the
        // per-sequence log once the journal hands back the commit sequence.
        self.transaction_mut(tid).backref_entries = backref_entries;

        // Post-conditions tying the stats to the lists they were
        // accumulated from.
        {
            let t = self.transaction(tid);
            assert_eq!(
                t.fresh_block_stats.num,
                (inline.len() + ool.len()) as u64
                    + t.num_delayed_invalid_extents
                    + t.num_allocated_invalid_extents
            );
            assert_eq!(
                t.ool_write_stats.extents.num,
                (ool.len() + inplace.len()) as u64
            );
            assert!(t.delayed_block_list.is_empty(), "unplaced delayed extents");
        }
        if record.is_empty() {
            info!("{tid} record to submit is empty, src={src:?}");
            let t = self.transaction(tid);
            assert!(t.laddr_tree_stats.is_clear());
            assert!(t.backref_tree_stats.is_clear());
            assert!(t.onode_tree_stats.is_clear());
            assert!(t.omap_tree_stats.is_clear());
            assert!(t.ool_write_stats.is_clear());
        }
        record.modify_time = Some(commit_time);

        debug!(
            "{tid} commit: {read_stat} read, {fresh_stat} fresh with {fresh_invalid_stat} \
             invalid, {delta_stat} delta, {retire_stat} retire, {existing_stat} existing"
        );

        // Accounting.
        {
            let t = self.transaction(tid);
            let laddr_tree = t.laddr_tree_stats;
            let backref_tree = t.backref_tree_stats;
            let onode_tree = t.onode_tree_stats;
            let omap_tree = t.omap_tree_stats;
            let ool_records = t.ool_write_stats.num_records;
            let ool_bytes = t.ool_write_stats.record_bytes();
            let rewrite_num = t.rewrite_num;
            let rewrite_bytes = t.rewrite_bytes;

            if src.is_background() {
                assert!(onode_tree.is_clear());
                assert!(omap_tree.is_clear());
            } else {
                self.stats.fold_committed_tree(TreeKind::Onode, &onode_tree);
                self.stats.fold_committed_tree(TreeKind::Omap, &omap_tree);
            }
            self.stats.fold_committed_tree(TreeKind::Laddr, &laddr_tree);
            self.stats.fold_committed_tree(TreeKind::Backref, &backref_tree);

            match src {
                TransactionSource::TrimDirty => {
                    self.stats.rewrites.num_dirty += rewrite_num;
                    self.stats.rewrites.dirty_bytes += rewrite_bytes;
                }
                TransactionSource::CleanerMain | TransactionSource::CleanerCold => {
                    self.stats.rewrites.num_reclaim += rewrite_num;
                    self.stats.rewrites.reclaim_bytes += rewrite_bytes;
                }
                _ => assert_eq!((rewrite_num, rewrite_bytes), (0, 0)),
            }

            let efforts = &mut self.stats.committed[src.index()];
            efforts.num_trans += 1;
            efforts.read.increment_stat(read_stat);
            efforts.mutate.increment_stat(mutate_stat);
            efforts.retire.increment_stat(retire_stat);
            efforts.fresh_inline.increment_stat(fresh_stat);
            efforts.fresh_ool.increment_stat(fresh_ool_stat);
            efforts.fresh_invalid.increment_stat(fresh_invalid_stat);
            efforts.existing.increment_stat(existing_stat);
            efforts.delta_bytes += delta_stat.bytes;
            efforts.num_ool_records += ool_records;
            efforts.ool_record_bytes += ool_bytes;
        }

        Ok(record)
    }

    /// Apply a commit to cache state after the journal durably wrote its
    /// record, rebasing fresh extents to `final_block_start` and stamping
    /// `start_seq` as the commit sequence.
    pub fn complete_commit(
        &mut self,
        tid: TransId,
        final_block_start: PhysicalAddr,
        start_seq: JournalSeq,
    ) {
        trace!("{tid} complete_commit: final_block_start={final_block_start} {start_seq}");
        let mut fresh_backref_entries: Vec<BackrefEntry> = Vec::new();

        // 1. Finalized fresh extents become resident.
        let fresh = {
            let t = self.transaction(tid);
            t.inline_block_list
                .iter()
                .chain(t.ool_block_list.iter())
                .copied()
                .collect_vec()
        };
        for id in fresh {
            if !self.arena.extent(id).is_valid() {
                continue;
            }
            assert!(self.arena.extent(id).is_stable_clean_pending());
            let is_inline = self.arena.extent(id).paddr().is_record_relative();
            if is_inline {
                let rebased = final_block_start.add_relative(self.arena.extent(id).paddr());
                self.arena.extent_mut(id).paddr = rebased;
            }
            let (paddr, length, ext_type) = {
                let extent = self.arena.extent(id);
                (extent.paddr(), extent.length(), extent.ext_type())
            };
            if self.epm.get_checksum_needed(paddr) {
                debug_assert_eq!(
                    self.arena.extent(id).last_committed_crc(),
                    self.arena.extent(id).calc_crc32c(),
                    "fresh extent payload changed between prepare and complete"
                );
            } else {
                self.arena.extent_mut(id).last_committed_crc = None;
            }
            {
                let extent = self.arena.extent_mut(id);
                extent.pending_for_transaction = None;
                extent.prior_instance = None;
            }
            debug!(
                "{tid} add extent as fresh, inline={is_inline} -- {:?}",
                self.arena.extent(id)
            );
            self.index.insert(&mut self.arena, id);
            self.pinboard.insert(id, length as u64);
            self.arena.extent_mut(id).complete_io();
            self.epm.commit_space_used(paddr, length);

            if ext_type.is_backref_mapped() {
                let laddr = Self::alloc_laddr(ext_type, self.arena.extent(id).laddr());
                fresh_backref_entries.push(BackrefEntry::create(paddr, laddr, length, ext_type));
            } else if ext_type.is_backref_node() {
                self.backref_extents.insert(paddr, ext_type);
            } else {
                panic!("fresh extent of unexpected type {ext_type}");
            }
        }

        // 2. Mutated extents finish their barrier and learn their
        // dirty_from.
        let mutated: Vec<ExtentId> = self.transaction(tid).mutated_block_list.clone();
        for id in mutated {
            if !self.arena.extent(id).is_valid() {
                continue;
            }
            {
                let extent = self.arena.extent(id);
                assert!(extent.is_stable_dirty());
                assert!(extent.is_pending_io());
                let from = extent.io_wait.expect("pending io").from_state;
                assert!(
                    from == ExtentState::ExistMutationPending
                        || (from == ExtentState::MutationPending
                            && extent.prior_instance().is_some())
                );
            }
            let extent = self.arena.extent_mut(id);
            extent.staged_delta.clear();
            extent.pending_for_transaction = None;
            extent.prior_instance = None;
            assert!(extent.version() > 0);
            if extent.version() == 1 || extent.ext_type().is_root() {
                extent.dirty_from = Some(start_seq);
                debug!("{tid} commit extent done, became dirty -- {extent:?}");
            } else {
                debug!("{tid} commit extent done -- {extent:?}");
            }
            extent.complete_io();
        }

        // 3.-5. Space accounting with the placement manager.
        let retired: Vec<(PhysicalAddr, u32)> = self
            .transaction(tid)
            .retired_set
            .values()
            .map(|&id| {
                let extent = self.arena.extent(id);
                (extent.paddr(), extent.length())
            })
            .collect();
        for (paddr, length) in retired {
            self.epm.mark_space_free(paddr, length);
        }
        let existing: Vec<(PhysicalAddr, u32)> = self
            .transaction(tid)
            .existing_block_list
            .iter()
            .filter(|&&id| self.arena.extent(id).is_valid())
            .map(|&id| {
                let extent = self.arena.extent(id);
                (extent.paddr(), extent.length())
            })
            .collect();
        for (paddr, length) in existing {
            self.epm.mark_space_used(paddr, length);
        }
        let stale_pre_alloc: Vec<(PhysicalAddr, u32)> = self
            .transaction(tid)
            .pre_alloc_list
            .iter()
            .filter(|&&id| !self.arena.extent(id).is_valid())
            .map(|&id| {
                let extent = self.arena.extent(id);
                (extent.paddr(), extent.length())
            })
            .collect();
        for (paddr, length) in stale_pre_alloc {
            self.epm.mark_space_free(paddr, length);
        }

        // 6.-7. Advance the commit cursor and install backref entries,
        // transaction-staged (retires, remaps) before fresh allocations.
        self.last_commit = Some(start_seq);
        let staged = self.transaction_mut(tid).take_backref_entries();
        self.apply_backref_byseq(staged, start_seq);
        self.apply_backref_byseq(fresh_backref_entries, start_seq);
    }

    /// Install backref entries into the per-sequence log. Buckets are
    /// strictly append-ordered; entries for an older sequence cannot
    /// arrive after a newer one.
    pub(crate) fn apply_backref_byseq(&mut self, entries: Vec<BackrefEntry>, seq: JournalSeq) {
        debug!("backref_entry apply {} entries at {seq}", entries.len());
        self.backref_log.append(seq, entries);
    }

    /// Record laddr carried for a fresh payload: logical extents and
    /// address-tree nodes advertise one, physical extents none.
    fn node_laddr(ext_type: ExtentType, laddr: Option<LogicalAddr>) -> Option<LogicalAddr> {
        if ext_type.is_logical() || ext_type.is_laddr_node() {
            Some(laddr.expect("extent kind carries a logical address"))
        } else {
            None
        }
    }

    /// Logical address recorded in allocation entries. Physical test
    /// blocks are tagged [`LogicalAddr::MIN`]; it is a tag, not an address.
    fn alloc_laddr(ext_type: ExtentType, laddr: Option<LogicalAddr>) -> LogicalAddr {
        if ext_type.is_logical() || ext_type.is_laddr_node() {
            laddr.expect("extent kind carries a logical address")
        } else {
            assert_eq!(ext_type, ExtentType::TestBlockPhysical);
            LogicalAddr::MIN
        }
    }
}
