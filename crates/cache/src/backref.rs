//! Per-sequence staging log for the back-reference index.
//!
//! Entries describe physical ranges allocated or retired by a committed
//! journal sequence. The back-reference tree consumes buckets oldest-first;
//! until then the log is the authoritative replay state for allocations,
//! and its oldest bucket defines the alloc tail.

use std::collections::VecDeque;

use lodestore_primitives::{ExtentType, JournalSeq, LogicalAddr, PhysicalAddr};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackrefOp {
    Create,
    Retire,
}

/// One allocation or retirement to install into the back-reference index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackrefEntry {
    pub op: BackrefOp,
    pub paddr: PhysicalAddr,
    /// `None` for retirements; for physical test blocks this is the
    /// [`LogicalAddr::MIN`] tag, not a real address.
    pub laddr: Option<LogicalAddr>,
    pub length: u32,
    pub ext_type: ExtentType,
}

impl BackrefEntry {
    pub fn create(
        paddr: PhysicalAddr,
        laddr: LogicalAddr,
        length: u32,
        ext_type: ExtentType,
    ) -> Self {
        Self {
            op: BackrefOp::Create,
            paddr,
            laddr: Some(laddr),
            length,
            ext_type,
        }
    }

    pub fn retire(paddr: PhysicalAddr, length: u32, ext_type: ExtentType) -> Self {
        Self {
            op: BackrefOp::Retire,
            paddr,
            laddr: None,
            length,
            ext_type,
        }
    }
}

/// Buckets of backref entries in non-decreasing sequence order.
#[derive(Default)]
pub struct BackrefLog {
    buckets: VecDeque<(JournalSeq, Vec<BackrefEntry>)>,
}

impl BackrefLog {
    /// Append `entries` at `seq`. Appends to the most recent bucket iff its
    /// sequence matches; an older sequence arriving after a newer one is a
    /// fatal ordering violation.
    pub fn append(&mut self, seq: JournalSeq, entries: Vec<BackrefEntry>) {
        if entries.is_empty() {
            return;
        }
        match self.buckets.back_mut() {
            Some((last_seq, bucket)) => {
                assert!(
                    *last_seq <= seq,
                    "backref entries at {seq} arrived after {last_seq}"
                );
                if *last_seq == seq {
                    bucket.extend(entries);
                } else {
                    self.buckets.push_back((seq, entries));
                }
            }
            None => self.buckets.push_back((seq, entries)),
        }
    }

    /// Oldest sequence still staged; the alloc tail.
    pub fn oldest_seq(&self) -> Option<JournalSeq> {
        self.buckets.front().map(|(seq, _)| *seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = (JournalSeq, &[BackrefEntry])> + '_ {
        self.buckets.iter().map(|(seq, bucket)| (*seq, bucket.as_slice()))
    }

    /// Hand buckets up to `upto` (exclusive) to the back-reference index.
    pub fn drain_upto(&mut self, upto: JournalSeq) -> Vec<(JournalSeq, Vec<BackrefEntry>)> {
        let mut drained = Vec::new();
        while let Some((seq, _)) = self.buckets.front() {
            if *seq >= upto {
                break;
            }
            drained.push(self.buckets.pop_front().unwrap());
        }
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(offset: u64) -> BackrefEntry {
        BackrefEntry::retire(
            PhysicalAddr::RandomBlock { offset },
            4096,
            ExtentType::RetiredPlaceholder,
        )
    }

    #[test]
    fn equal_seq_merges_into_last_bucket() {
        let mut log = BackrefLog::default();
        log.append(JournalSeq(5), vec![entry(0x1000)]);
        log.append(JournalSeq(5), vec![entry(0x2000)]);
        log.append(JournalSeq(7), vec![entry(0x3000)]);

        let buckets: Vec<_> = log.iter().map(|(s, b)| (s, b.len())).collect();
        assert_eq!(buckets, vec![(JournalSeq(5), 2), (JournalSeq(7), 1)]);
        assert_eq!(log.oldest_seq(), Some(JournalSeq(5)));
    }

    #[test]
    fn drain_respects_tail() {
        let mut log = BackrefLog::default();
        log.append(JournalSeq(5), vec![entry(0x1000)]);
        log.append(JournalSeq(7), vec![entry(0x2000)]);
        log.append(JournalSeq(9), vec![entry(0x3000)]);

        let drained = log.drain_upto(JournalSeq(8));
        assert_eq!(drained.len(), 2);
        assert_eq!(log.oldest_seq(), Some(JournalSeq(9)));
    }

    #[test]
    #[should_panic(expected = "arrived after")]
    fn out_of_order_append_is_fatal() {
        let mut log = BackrefLog::default();
        log.append(JournalSeq(7), vec![entry(0x1000)]);
        log.append(JournalSeq(5), vec![entry(0x2000)]);
    }

    #[test]
    fn empty_appends_are_ignored() {
        let mut log = BackrefLog::default();
        log.append(JournalSeq(5), vec![]);
        assert!(log.is_empty());
    }
}
