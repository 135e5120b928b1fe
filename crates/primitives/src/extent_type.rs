use crate::buffer::{BufReader, BufWriter, DecodeError};

/// The closed set of extent types the cache manages.
///
/// The tag selects the parser and the role of the extent; the cache itself
/// only consults the capability predicates below. `AllocInfo` and
/// `JournalTail` never name resident extents, they tag bookkeeping deltas
/// inside journal records. `RetiredPlaceholder` entries record that a
/// physical address is known-retired; they carry no buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ExtentType {
    Root = 0,
    LaddrInternal = 1,
    LaddrLeaf = 2,
    OmapInner = 3,
    OmapLeaf = 4,
    Onode = 5,
    ObjectData = 6,
    BackrefInternal = 7,
    BackrefLeaf = 8,
    AllocInfo = 9,
    JournalTail = 10,
    RetiredPlaceholder = 11,
    TestBlock = 12,
    TestBlockPhysical = 13,
}

impl ExtentType {
    pub fn is_root(&self) -> bool {
        matches!(self, Self::Root)
    }

    /// Extents addressed by the logical address space; these carry a laddr.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            Self::OmapInner | Self::OmapLeaf | Self::Onode | Self::ObjectData | Self::TestBlock
        )
    }

    /// Nodes of the logical-address tree.
    pub fn is_laddr_node(&self) -> bool {
        matches!(self, Self::LaddrInternal | Self::LaddrLeaf)
    }

    /// Nodes of the back-reference tree.
    pub fn is_backref_node(&self) -> bool {
        matches!(self, Self::BackrefInternal | Self::BackrefLeaf)
    }

    /// Extents whose physical range is tracked by the back-reference index.
    pub fn is_backref_mapped(&self) -> bool {
        self.is_logical() || self.is_laddr_node() || matches!(self, Self::TestBlockPhysical)
    }

    pub fn is_retired_placeholder(&self) -> bool {
        matches!(self, Self::RetiredPlaceholder)
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::ObjectData | Self::TestBlock | Self::TestBlockPhysical)
    }

    /// Types a cleaner may rewrite at their existing physical address on a
    /// random-block device, without any logical change.
    pub fn can_inplace_rewrite(&self) -> bool {
        matches!(self, Self::ObjectData | Self::TestBlockPhysical)
    }

    /// Types that may appear as resident extents in the cache index.
    pub fn is_cached(&self) -> bool {
        !matches!(self, Self::AllocInfo | Self::JournalTail)
    }

    pub fn encode(&self, w: &mut impl BufWriter) {
        w.put_u8(*self as u8);
    }

    pub fn decode<'a>(r: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        Self::from_u8(r.get_u8()?)
    }

    pub fn from_u8(tag: u8) -> Result<Self, DecodeError> {
        use ExtentType::*;
        Ok(match tag {
            0 => Root,
            1 => LaddrInternal,
            2 => LaddrLeaf,
            3 => OmapInner,
            4 => OmapLeaf,
            5 => Onode,
            6 => ObjectData,
            7 => BackrefInternal,
            8 => BackrefLeaf,
            9 => AllocInfo,
            10 => JournalTail,
            11 => RetiredPlaceholder,
            12 => TestBlock,
            13 => TestBlockPhysical,
            tag => {
                return Err(DecodeError::InvalidTag {
                    for_type: "ExtentType",
                    tag,
                })
            }
        })
    }

    pub const ALL: [ExtentType; 14] = [
        Self::Root,
        Self::LaddrInternal,
        Self::LaddrLeaf,
        Self::OmapInner,
        Self::OmapLeaf,
        Self::Onode,
        Self::ObjectData,
        Self::BackrefInternal,
        Self::BackrefLeaf,
        Self::AllocInfo,
        Self::JournalTail,
        Self::RetiredPlaceholder,
        Self::TestBlock,
        Self::TestBlockPhysical,
    ];
}

impl std::fmt::Display for ExtentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_roundtrip() {
        for ty in ExtentType::ALL {
            assert_eq!(ExtentType::from_u8(ty as u8).unwrap(), ty);
        }
        assert!(ExtentType::from_u8(14).is_err());
    }

    #[test]
    fn capability_partition() {
        for ty in ExtentType::ALL {
            // laddr nodes, backref nodes and the root are physical
            if ty.is_logical() {
                assert!(!ty.is_laddr_node());
                assert!(!ty.is_backref_node());
                assert!(!ty.is_root());
            }
            // backref nodes are tracked out of band, not by the backref index
            if ty.is_backref_node() {
                assert!(!ty.is_backref_mapped());
            }
        }
    }
}
