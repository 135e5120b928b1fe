//! Journal record types and the bit-stable delta payloads.
//!
//! A committing transaction is condensed into one [`Record`]: delta
//! descriptors for mutated extents, full payloads for fresh inline extents,
//! plus allocation bookkeeping serialized as `AllocInfo` deltas and, for
//! background transactions, one `JournalTail` delta. The journal owns
//! framing and checksums of the record itself; only the [`AllocDelta`] and
//! [`JournalTailDelta`] payload encodings defined here are persisted as-is
//! and must stay bit-stable across versions.

use lodestore_primitives::buffer::{BufReader, BufWriter, DecodeError};
use lodestore_primitives::{
    ExtentType, JournalSeq, LogicalAddr, ModifyTime, PhysicalAddr, SegmentKind, SegmentSeq,
};

use crate::transaction::TransactionSource;

/// Incremental mutation of one extent, as carried in a journal record.
///
/// Root deltas use the sentinel address with zero crcs and zero length.
/// `AllocInfo` and `JournalTail` deltas carry encoded payload-only bytes
/// and no target address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeltaInfo {
    pub ext_type: ExtentType,
    pub paddr: Option<PhysicalAddr>,
    pub laddr: Option<LogicalAddr>,
    pub prev_crc: Option<u32>,
    pub final_crc: Option<u32>,
    pub length: u32,
    /// Version of the extent the delta applies against.
    pub pversion: u32,
    /// Segment incarnation the target address belongs to, for staleness
    /// detection on replay. Only set for segmented addresses.
    pub ext_seq: Option<SegmentSeq>,
    pub seg_kind: Option<SegmentKind>,
    pub bytes: Vec<u8>,
}

/// Payload of a fresh extent written inline with the record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordExtent {
    pub ext_type: ExtentType,
    pub laddr: Option<LogicalAddr>,
    pub bytes: Vec<u8>,
    pub modify_time: ModifyTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordKind {
    Journal,
}

/// One journal record, the unit a committing transaction hands to the
/// journal.
#[derive(Debug)]
pub struct Record {
    pub kind: RecordKind,
    pub src: TransactionSource,
    pub modify_time: Option<ModifyTime>,
    pub deltas: Vec<DeltaInfo>,
    pub extents: Vec<RecordExtent>,
}

impl Record {
    pub fn new(src: TransactionSource) -> Self {
        Self {
            kind: RecordKind::Journal,
            src,
            modify_time: None,
            deltas: Vec::new(),
            extents: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.extents.is_empty()
    }

    /// Total bytes of fresh inline payload; fresh extents are laid out in
    /// this order behind the record header, which is what record-relative
    /// addresses offset into.
    pub fn extent_bytes(&self) -> u64 {
        self.extents.iter().map(|e| e.bytes.len() as u64).sum()
    }

    pub fn delta_bytes(&self) -> u64 {
        self.deltas.iter().map(|d| d.bytes.len() as u64).sum()
    }
}

/// Whether an alloc-delta batch sets or clears back-references.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AllocOp {
    Set = 0,
    Clear = 1,
}

impl AllocOp {
    fn decode<'a>(r: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            0 => Ok(Self::Set),
            1 => Ok(Self::Clear),
            tag => Err(DecodeError::InvalidTag {
                for_type: "AllocOp",
                tag,
            }),
        }
    }
}

/// One allocated or retired physical range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocBlock {
    pub paddr: PhysicalAddr,
    pub laddr: Option<LogicalAddr>,
    pub length: u32,
    pub ext_type: ExtentType,
}

impl AllocBlock {
    fn encode(&self, w: &mut impl BufWriter) {
        self.paddr.encode(w);
        LogicalAddr::encode_opt(self.laddr, w);
        w.put_u32(self.length);
        self.ext_type.encode(w);
    }

    fn decode<'a>(r: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        Ok(Self {
            paddr: PhysicalAddr::decode(r)?,
            laddr: LogicalAddr::decode_opt(r)?,
            length: r.get_u32()?,
            ext_type: ExtentType::decode(r)?,
        })
    }
}

/// Payload of an `AllocInfo` delta: a batch of allocation (`Set`) or
/// retirement (`Clear`) ranges to install into the back-reference index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocDelta {
    pub op: AllocOp,
    pub blocks: Vec<AllocBlock>,
}

impl AllocDelta {
    pub fn encode(&self, w: &mut impl BufWriter) {
        w.put_u8(self.op as u8);
        w.put_u32(self.blocks.len() as u32);
        for block in &self.blocks {
            block.encode(w);
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = bytes;
        let op = AllocOp::decode(&mut r)?;
        let count = r.get_u32()?;
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            blocks.push(AllocBlock::decode(&mut r)?);
        }
        if r.remaining() != 0 {
            return Err(DecodeError::TrailingBytes {
                for_type: "AllocDelta",
                got: r.remaining(),
            });
        }
        Ok(Self { op, blocks })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

/// Payload of a `JournalTail` delta: the oldest journal sequences still
/// needed for delta replay (`dirty_tail`) and backref replay (`alloc_tail`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalTailDelta {
    pub alloc_tail: JournalSeq,
    pub dirty_tail: JournalSeq,
}

impl JournalTailDelta {
    pub fn encode(&self, w: &mut impl BufWriter) {
        self.alloc_tail.encode(w);
        self.dirty_tail.encode(w);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = bytes;
        let tail = Self {
            alloc_tail: JournalSeq::decode(&mut r)?,
            dirty_tail: JournalSeq::decode(&mut r)?,
        };
        if r.remaining() != 0 {
            return Err(DecodeError::TrailingBytes {
                for_type: "JournalTailDelta",
                got: r.remaining(),
            });
        }
        Ok(tail)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lodestore_primitives::SegmentId;
    use proptest::prelude::*;

    fn any_alloc_block() -> impl Strategy<Value = AllocBlock> {
        let paddr = prop_oneof![
            (any::<u32>(), any::<u32>()).prop_map(|(s, o)| PhysicalAddr::Segmented {
                segment: SegmentId(s),
                offset: o,
            }),
            any::<u64>().prop_map(|o| PhysicalAddr::RandomBlock { offset: o }),
            any::<u32>().prop_map(|o| PhysicalAddr::RecordRelative { offset: o }),
        ];
        let laddr = prop_oneof![
            Just(None),
            (0..u64::MAX - 1).prop_map(|l| Some(LogicalAddr(l))),
        ];
        let ext_type = prop_oneof![
            Just(ExtentType::ObjectData),
            Just(ExtentType::LaddrLeaf),
            Just(ExtentType::TestBlock),
            Just(ExtentType::TestBlockPhysical),
            Just(ExtentType::RetiredPlaceholder),
        ];
        (paddr, laddr, any::<u32>(), ext_type).prop_map(|(paddr, laddr, length, ext_type)| {
            AllocBlock {
                paddr,
                laddr,
                length,
                ext_type,
            }
        })
    }

    proptest! {
        #[test]
        fn alloc_delta_roundtrip(
            op in prop_oneof![Just(AllocOp::Set), Just(AllocOp::Clear)],
            blocks in proptest::collection::vec(any_alloc_block(), 0..8),
        ) {
            let delta = AllocDelta { op, blocks };
            let decoded = AllocDelta::decode(&delta.to_bytes()).unwrap();
            prop_assert_eq!(delta, decoded);
        }

        #[test]
        fn journal_tail_roundtrip(alloc in any::<u64>(), dirty in any::<u64>()) {
            let tail = JournalTailDelta {
                alloc_tail: JournalSeq(alloc),
                dirty_tail: JournalSeq(dirty),
            };
            let decoded = JournalTailDelta::decode(&tail.to_bytes()).unwrap();
            prop_assert_eq!(tail, decoded);
        }
    }

    #[test]
    fn alloc_delta_wire_layout_is_stable() {
        // Persisted format: op tag, u32 count, then per block the paddr
        // (tagged), laddr (u64, MAX = none), u32 length, type tag. All
        // little-endian. This byte string is load-bearing; changing it
        // breaks replay of existing journals.
        let delta = AllocDelta {
            op: AllocOp::Set,
            blocks: vec![AllocBlock {
                paddr: PhysicalAddr::Segmented {
                    segment: SegmentId(2),
                    offset: 0x1000,
                },
                laddr: Some(LogicalAddr(0x42)),
                length: 4096,
                ext_type: ExtentType::ObjectData,
            }],
        };
        assert_eq!(
            delta.to_bytes(),
            vec![
                0, // Set
                1, 0, 0, 0, // one block
                1, // segmented paddr
                2, 0, 0, 0, // segment
                0x00, 0x10, 0, 0, // offset
                0x42, 0, 0, 0, 0, 0, 0, 0, // laddr
                0x00, 0x10, 0, 0, // length
                6, // ObjectData
            ]
        );
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let tail = JournalTailDelta {
            alloc_tail: JournalSeq(1),
            dirty_tail: JournalSeq(2),
        };
        let mut bytes = tail.to_bytes();
        bytes.push(0);
        assert!(matches!(
            JournalTailDelta::decode(&bytes),
            Err(DecodeError::TrailingBytes { .. })
        ));
    }
}
