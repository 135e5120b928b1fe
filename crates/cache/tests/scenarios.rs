//! End-to-end scenarios through the public commit and replay paths.

mod common;

use common::{block_at, pattern, Harness, BLOCK};
use lodestore_cache::{
    AllocDelta, AllocOp, CacheError, DeltaInfo, ExtentState, TransactionSource,
};
use lodestore_primitives::{
    ExtentType, JournalSeq, LogicalAddr, ModifyTime, PhysicalAddr, SegmentId, SegmentKind,
    SegmentSeq,
};
use pretty_assertions::assert_eq;

/// A mutate transaction replaces a clean extent with a dirty successor and
/// journals exactly one delta against version 0.
#[test]
fn simple_mutate() {
    let paddr = block_at(0x1000);
    let mut h = Harness::with_device(|dev| dev.put(paddr, pattern(7)));
    h.mkfs();

    let t = h.begin(TransactionSource::Mutate);
    let x = h.get(t, ExtentType::TestBlockPhysical, paddr, None);
    let crc_a = h.cache.extent(x).last_committed_crc().expect("loaded crc");
    assert_eq!(h.cache.extent(x).version(), 0);
    assert_eq!(h.cache.extent(x).state(), ExtentState::Clean);

    let y = h.cache.duplicate_for_write(t, x);
    assert_ne!(x, y);
    h.cache.write_extent(t, y, 16, b"updated contents");

    let (record, seq, _) = h.commit(t);
    h.cache.on_transaction_destruct(t);

    let deltas: Vec<&DeltaInfo> = record
        .deltas
        .iter()
        .filter(|d| d.ext_type == ExtentType::TestBlockPhysical)
        .collect();
    assert_eq!(deltas.len(), 1);
    let delta = deltas[0];
    assert_eq!(delta.paddr, Some(paddr));
    assert_eq!(delta.prev_crc, Some(crc_a));
    assert_eq!(delta.length, BLOCK);
    assert_eq!(delta.pversion, 0);

    // the original is gone, the replacement is resident and dirty
    assert!(h.cache.try_extent(x).is_none());
    assert_eq!(h.cache.resident_at(paddr), Some(y));
    let committed = h.cache.extent(y);
    assert_eq!(committed.version(), 1);
    assert_eq!(committed.state(), ExtentState::Dirty);
    assert_eq!(committed.dirty_from(), Some(seq));
    assert_eq!(committed.last_committed_crc(), delta.final_crc);
    assert!(h.cache.is_dirty(y));
}

/// A reader of a retired extent is conflicted before the retiring commit
/// returns, and its own commit reports the conflict.
#[test]
fn conflict_on_retire() {
    let paddr = block_at(0x2000);
    let mut h = Harness::with_device(|dev| dev.put(paddr, pattern(3)));
    h.mkfs();

    let a = h.begin(TransactionSource::Mutate);
    let x = h.get(a, ExtentType::TestBlockPhysical, paddr, None);
    assert!(!h.cache.transaction(a).is_conflicted());

    let b = h.begin(TransactionSource::Mutate);
    h.cache.retire_extent_addr(b, paddr, BLOCK).unwrap();
    h.commit(b);
    h.cache.on_transaction_destruct(b);

    // the invalidation flagged the reader before b's commit returned
    assert!(h.cache.transaction(a).is_conflicted());
    assert!(!h.cache.extent(x).is_valid());
    assert!(matches!(
        h.cache.prepare_record(a, None, None),
        Err(CacheError::Conflict)
    ));
    h.cache.on_transaction_destruct(a);

    assert_eq!(
        h.cache
            .stats()
            .conflicts(TransactionSource::Mutate, TransactionSource::Mutate),
        1
    );
    assert_eq!(h.cache.stats().invalidated(TransactionSource::Mutate).num_trans, 1);
}

/// Retiring an address the cache has never seen plants a placeholder and
/// commits a single retire alloc-delta with no payload.
#[test]
fn retire_absent() {
    let paddr = block_at(0x4000);
    let mut h = Harness::new();
    h.mkfs();

    let t = h.begin(TransactionSource::Mutate);
    h.cache.retire_extent_addr(t, paddr, BLOCK).unwrap();

    let placeholder = h.cache.resident_at(paddr).expect("placeholder planted");
    {
        let extent = h.cache.extent(placeholder);
        assert_eq!(extent.ext_type(), ExtentType::RetiredPlaceholder);
        assert_eq!(extent.state(), ExtentState::Clean);
        assert_eq!(extent.length(), BLOCK);
        assert!(extent.buffer().is_none());
    }

    let (record, _, _) = h.commit(t);
    h.cache.on_transaction_destruct(t);

    assert!(record.extents.is_empty());
    let alloc_deltas: Vec<&DeltaInfo> = record
        .deltas
        .iter()
        .filter(|d| d.ext_type == ExtentType::AllocInfo)
        .collect();
    assert_eq!(alloc_deltas.len(), 1);
    let decoded = AllocDelta::decode(&alloc_deltas[0].bytes).unwrap();
    assert_eq!(decoded.op, AllocOp::Clear);
    assert_eq!(decoded.blocks.len(), 1);
    assert_eq!(decoded.blocks[0].paddr, paddr);
    assert_eq!(decoded.blocks[0].length, BLOCK);
    assert_eq!(decoded.blocks[0].ext_type, ExtentType::RetiredPlaceholder);

    assert_eq!(h.cache.resident_at(paddr), None);
}

/// A delta addressed at a stale segment incarnation is skipped untouched.
#[test]
fn replay_skips_obsolete_segment() {
    let mut h = Harness::new();
    h.mkfs();
    let resident_before = h.cache.resident_extents();

    let segment = SegmentId(3);
    h.cache
        .update_segment_info(segment, SegmentSeq(7), SegmentKind::Journal);

    let delta = DeltaInfo {
        ext_type: ExtentType::ObjectData,
        paddr: Some(PhysicalAddr::Segmented {
            segment,
            offset: 0x100,
        }),
        laddr: Some(LogicalAddr(0x500)),
        prev_crc: Some(1),
        final_crc: Some(2),
        length: BLOCK,
        pversion: 3,
        ext_seq: Some(SegmentSeq(5)),
        seg_kind: Some(SegmentKind::Journal),
        bytes: vec![],
    };
    let (applied, extent) = h
        .cache
        .replay_delta(
            JournalSeq(9),
            block_at(0),
            &delta,
            JournalSeq::MIN,
            JournalSeq::MIN,
            ModifyTime(1),
        )
        .unwrap();
    assert!(!applied);
    assert!(extent.is_none());
    assert_eq!(h.cache.resident_extents(), resident_before);
}

/// The first root delta after mount turns the version-0 root dirty at the
/// replayed sequence.
#[test]
fn root_replay() {
    let mut h = Harness::new();
    // no mkfs; replay against a freshly initialized cache
    let t = h.begin(TransactionSource::Read);
    let root = h.cache.get_root(t).unwrap();
    assert_eq!(h.cache.extent(root).version(), 0);
    h.cache.on_transaction_destruct(t);

    let image: Vec<u8> = (0..64u8).collect();
    let bytes = lodestore_cache::encode_delta_ops(&[lodestore_cache::DeltaOp {
        offset: 0,
        bytes: image.clone(),
    }]);
    let delta = DeltaInfo {
        ext_type: ExtentType::Root,
        paddr: Some(PhysicalAddr::Root),
        laddr: None,
        prev_crc: Some(0),
        final_crc: Some(0),
        length: 0,
        pversion: 0,
        ext_seq: None,
        seg_kind: None,
        bytes,
    };
    let seq = JournalSeq(11);
    let (applied, extent) = h
        .cache
        .replay_delta(seq, block_at(0), &delta, JournalSeq::MIN, JournalSeq::MIN, ModifyTime(5))
        .unwrap();
    assert!(applied);
    let root = extent.expect("root replayed");
    assert_eq!(h.cache.resident_at(PhysicalAddr::Root), Some(root));
    let extent = h.cache.extent(root);
    assert_eq!(extent.version(), 1);
    assert_eq!(extent.state(), ExtentState::Dirty);
    assert_eq!(extent.dirty_from(), Some(seq));
    assert_eq!(&extent.buffer().unwrap()[..64], &image[..]);
    assert!(h.cache.is_dirty(root));
}

/// An in-place rewrite downgrades the prior to clean/version 0 under a
/// concurrent mutator; the mutator's commit reconciles its clone back to
/// version 1 and emits a delta against version 0.
#[test]
fn inplace_rewrite_version_reset() {
    let paddr = block_at(0x8000);
    let laddr = Some(LogicalAddr(0x9000));
    let mut h = Harness::with_device(|dev| dev.put(paddr, pattern(1)));
    h.mkfs();

    // drive the extent to version 3
    for round in 0..3 {
        h.mutate_once(paddr, ExtentType::ObjectData, laddr, &[round; 32]);
    }
    let x = h.cache.resident_at(paddr).unwrap();
    assert_eq!(h.cache.extent(x).version(), 3);
    assert_eq!(h.cache.extent(x).state(), ExtentState::Dirty);

    // concurrent mutator clones the dirty extent
    let a = h.begin(TransactionSource::Mutate);
    let got = h.get(a, ExtentType::ObjectData, paddr, laddr);
    assert_eq!(got, x);
    let y = h.cache.duplicate_for_write(a, x);
    assert_eq!(h.cache.extent(y).version(), 4);
    h.cache.write_extent(a, y, 64, b"mutator writes");

    // the cleaner rewrites the extent in place, without logical change
    let c = h.begin(TransactionSource::CleanerMain);
    h.cache.mark_inplace_rewrite(c, x);
    h.commit(c);
    h.cache.on_transaction_destruct(c);
    {
        let extent = h.cache.extent(x);
        assert_eq!(extent.state(), ExtentState::Clean);
        assert_eq!(extent.version(), 0);
        assert_eq!(extent.dirty_from(), Some(JournalSeq::MIN));
    }
    // the mutator was not conflicted; the rewrite left the payload alone
    assert!(!h.cache.transaction(a).is_conflicted());

    let (record, seq, _) = h.commit(a);
    h.cache.on_transaction_destruct(a);

    let delta = record
        .deltas
        .iter()
        .find(|d| d.ext_type == ExtentType::ObjectData)
        .expect("mutation delta");
    assert_eq!(delta.pversion, 0);

    let committed = h.cache.resident_at(paddr).unwrap();
    assert_eq!(committed, y);
    assert_eq!(h.cache.extent(y).version(), 1);
    assert_eq!(h.cache.extent(y).dirty_from(), Some(seq));
    assert_eq!(h.cache.extent(y).state(), ExtentState::Dirty);
}
