//! Shared harness: a cache wired to an in-memory device and a simulated
//! journal that hands out sequence numbers and record placements.

use lodestore_cache::{
    Cache, ExtentId, MemExtentSource, MemPlacementManager, Options, Record, TransId,
    TransactionSource,
};
use lodestore_primitives::{ExtentType, JournalSeq, LogicalAddr, PhysicalAddr, SegmentId};

pub const BLOCK: u32 = 4096;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Harness {
    pub cache: Cache,
    next_seq: u64,
    next_record_offset: u32,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_device(|_| {})
    }

    /// Build a harness whose device already holds the given blocks.
    pub fn with_device(fill: impl FnOnce(&mut MemExtentSource)) -> Self {
        init_logging();
        let mut source = MemExtentSource::default();
        fill(&mut source);
        let mut cache = Cache::new(
            Options::default(),
            Box::new(MemPlacementManager::default()),
            Box::new(source),
        );
        cache.init();
        Self {
            cache,
            next_seq: 1,
            next_record_offset: 0,
        }
    }

    /// Format the store: first transaction, first commit, root delta.
    pub fn mkfs(&mut self) -> JournalSeq {
        let t = self.cache.create_transaction(TransactionSource::Mutate, false);
        self.cache.mkfs(t).unwrap();
        let (_, seq, _) = self.commit(t);
        self.cache.on_transaction_destruct(t);
        seq
    }

    pub fn begin(&mut self, src: TransactionSource) -> TransId {
        self.cache.create_transaction(src, false)
    }

    /// Run the commit pipeline: prepare, pretend the journal wrote the
    /// record, apply. The caller still owns the transaction.
    pub fn commit(&mut self, t: TransId) -> (Record, JournalSeq, PhysicalAddr) {
        self.try_commit(t).expect("commit failed")
    }

    pub fn try_commit(
        &mut self,
        t: TransId,
    ) -> Result<(Record, JournalSeq, PhysicalAddr), lodestore_cache::CacheError> {
        let head = JournalSeq(self.next_seq);
        let record = self.cache.prepare_record(t, Some(head), Some(JournalSeq::MIN))?;
        let seq = JournalSeq(self.next_seq);
        self.next_seq += 1;
        let base = PhysicalAddr::Segmented {
            segment: SegmentId(1000),
            offset: self.next_record_offset,
        };
        self.next_record_offset += record.extent_bytes() as u32;
        self.cache.complete_commit(t, base, seq);
        Ok((record, seq, base))
    }

    /// Load a block into the cache through a transaction.
    pub fn get(
        &mut self,
        t: TransId,
        ext_type: ExtentType,
        paddr: PhysicalAddr,
        laddr: Option<LogicalAddr>,
    ) -> ExtentId {
        self.cache.get_extent(t, ext_type, paddr, laddr, BLOCK).unwrap()
    }

    /// Mutate-commit one splice into the extent at `paddr`, returning the
    /// committed replacement and its sequence.
    pub fn mutate_once(
        &mut self,
        paddr: PhysicalAddr,
        ext_type: ExtentType,
        laddr: Option<LogicalAddr>,
        payload: &[u8],
    ) -> (ExtentId, JournalSeq) {
        let t = self.begin(TransactionSource::Mutate);
        let x = self.get(t, ext_type, paddr, laddr);
        let y = self.cache.duplicate_for_write(t, x);
        self.cache.write_extent(t, y, 0, payload);
        let (_, seq, _) = self.commit(t);
        self.cache.on_transaction_destruct(t);
        (y, seq)
    }
}

pub fn block_at(offset: u64) -> PhysicalAddr {
    PhysicalAddr::RandomBlock { offset }
}

pub fn pattern(seed: u8) -> Vec<u8> {
    (0..BLOCK as usize).map(|i| seed.wrapping_add(i as u8)).collect()
}
