use crate::buffer::{BufReader, BufWriter, DecodeError};

/// Identity of one segment on a segmented device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub u32);

/// Reuse generation of a segment. Bumped every time the cleaner reclaims
/// and reopens the segment, which is how stale journal deltas addressed at
/// a previous incarnation are detected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentSeq(pub u32);

/// What a segment is currently used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentKind {
    Journal = 0,
    Ool = 1,
}

impl SegmentKind {
    pub fn encode(&self, w: &mut impl BufWriter) {
        w.put_u8(*self as u8);
    }

    pub fn decode<'a>(r: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            0 => Ok(Self::Journal),
            1 => Ok(Self::Ool),
            tag => Err(DecodeError::InvalidTag {
                for_type: "SegmentKind",
                tag,
            }),
        }
    }
}

/// Logical address of an extent within the logical address space.
///
/// [`LogicalAddr::MIN`] is a sentinel tagging allocation entries for
/// physical test blocks; it must never be interpreted as a real logical
/// address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalAddr(pub u64);

impl LogicalAddr {
    pub const MIN: Self = Self(0);

    // u64::MAX stands for "no logical address" on the wire.
    const NULL_WIRE: u64 = u64::MAX;

    pub fn encode_opt(laddr: Option<LogicalAddr>, w: &mut impl BufWriter) {
        w.put_u64(laddr.map_or(Self::NULL_WIRE, |l| l.0));
    }

    pub fn decode_opt<'a>(r: &mut impl BufReader<'a>) -> Result<Option<Self>, DecodeError> {
        let raw = r.get_u64()?;
        Ok((raw != Self::NULL_WIRE).then_some(Self(raw)))
    }
}

impl std::fmt::Display for LogicalAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "laddr={:#x}", self.0)
    }
}

/// Physical address of an extent.
///
/// `Segmented` and `RandomBlock` are the two absolute forms; `Root` is the
/// reserved pseudo-address of the root extent. `RecordRelative` addresses a
/// fresh extent by its offset inside the record that will carry it, and is
/// rebased to an absolute address once the journal reports where the record
/// landed. `Delayed` marks an extent whose placement decision has not been
/// made yet; it never appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PhysicalAddr {
    Root,
    Segmented { segment: SegmentId, offset: u32 },
    RandomBlock { offset: u64 },
    RecordRelative { offset: u32 },
    Delayed { id: u32 },
}

impl PhysicalAddr {
    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }

    pub fn is_absolute(&self) -> bool {
        matches!(self, Self::Segmented { .. } | Self::RandomBlock { .. })
    }

    pub fn is_absolute_segmented(&self) -> bool {
        matches!(self, Self::Segmented { .. })
    }

    pub fn is_absolute_random_block(&self) -> bool {
        matches!(self, Self::RandomBlock { .. })
    }

    pub fn is_record_relative(&self) -> bool {
        matches!(self, Self::RecordRelative { .. })
    }

    pub fn is_delayed(&self) -> bool {
        matches!(self, Self::Delayed { .. })
    }

    /// An address a resident extent may carry: absolute or root.
    pub fn is_real_location(&self) -> bool {
        self.is_absolute() || self.is_root()
    }

    pub fn segment(&self) -> Option<SegmentId> {
        match self {
            Self::Segmented { segment, .. } => Some(*segment),
            _ => None,
        }
    }

    /// Rebase a record-relative address against the absolute start of the
    /// record. `self` must be absolute.
    ///
    /// # Panics
    ///
    /// If `self` is not absolute or `rel` is not record-relative.
    pub fn add_relative(&self, rel: PhysicalAddr) -> PhysicalAddr {
        let PhysicalAddr::RecordRelative { offset: rel_off } = rel else {
            panic!("add_relative: {rel:?} is not record-relative");
        };
        match *self {
            Self::Segmented { segment, offset } => Self::Segmented {
                segment,
                offset: offset + rel_off,
            },
            Self::RandomBlock { offset } => Self::RandomBlock {
                offset: offset + rel_off as u64,
            },
            base => panic!("add_relative: {base:?} is not absolute"),
        }
    }

    pub fn encode(&self, w: &mut impl BufWriter) {
        match *self {
            Self::Root => w.put_u8(0),
            Self::Segmented { segment, offset } => {
                w.put_u8(1);
                w.put_u32(segment.0);
                w.put_u32(offset);
            }
            Self::RandomBlock { offset } => {
                w.put_u8(2);
                w.put_u64(offset);
            }
            Self::RecordRelative { offset } => {
                w.put_u8(3);
                w.put_u32(offset);
            }
            Self::Delayed { id } => {
                w.put_u8(4);
                w.put_u32(id);
            }
        }
    }

    pub fn decode<'a>(r: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        match r.get_u8()? {
            0 => Ok(Self::Root),
            1 => Ok(Self::Segmented {
                segment: SegmentId(r.get_u32()?),
                offset: r.get_u32()?,
            }),
            2 => Ok(Self::RandomBlock { offset: r.get_u64()? }),
            3 => Ok(Self::RecordRelative { offset: r.get_u32()? }),
            4 => Ok(Self::Delayed { id: r.get_u32()? }),
            tag => Err(DecodeError::InvalidTag {
                for_type: "PhysicalAddr",
                tag,
            }),
        }
    }
}

impl std::fmt::Display for PhysicalAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Root => write!(f, "paddr=ROOT"),
            Self::Segmented { segment, offset } => {
                write!(f, "paddr={}:{:#x}", segment.0, offset)
            }
            Self::RandomBlock { offset } => write!(f, "paddr=rb:{offset:#x}"),
            Self::RecordRelative { offset } => write!(f, "paddr=rel:{offset:#x}"),
            Self::Delayed { id } => write!(f, "paddr=delayed:{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_paddr() -> impl Strategy<Value = PhysicalAddr> {
        prop_oneof![
            Just(PhysicalAddr::Root),
            (any::<u32>(), any::<u32>()).prop_map(|(s, o)| PhysicalAddr::Segmented {
                segment: SegmentId(s),
                offset: o,
            }),
            any::<u64>().prop_map(|o| PhysicalAddr::RandomBlock { offset: o }),
            any::<u32>().prop_map(|o| PhysicalAddr::RecordRelative { offset: o }),
            any::<u32>().prop_map(|id| PhysicalAddr::Delayed { id }),
        ]
    }

    proptest! {
        #[test]
        fn paddr_roundtrip(paddr in any_paddr()) {
            let mut buf = Vec::new();
            paddr.encode(&mut buf);
            let decoded = PhysicalAddr::decode(&mut buf.as_slice()).unwrap();
            prop_assert_eq!(paddr, decoded);
        }
    }

    #[test]
    fn rebase_against_segmented_base() {
        let base = PhysicalAddr::Segmented {
            segment: SegmentId(7),
            offset: 0x1000,
        };
        let rebased = base.add_relative(PhysicalAddr::RecordRelative { offset: 0x200 });
        assert_eq!(
            rebased,
            PhysicalAddr::Segmented {
                segment: SegmentId(7),
                offset: 0x1200,
            }
        );
    }
}
