//! Address and identifier primitives shared by the lodestore crates.
//!
//! Everything here is a plain value type: physical and logical addresses,
//! journal sequence numbers, segment identity, the closed extent-type
//! enumeration, and the byte-buffer traits the on-wire encodings are written
//! against. No I/O, no policy.

mod addr;
pub mod buffer;
mod extent_type;

pub use addr::{LogicalAddr, PhysicalAddr, SegmentId, SegmentKind, SegmentSeq};
pub use extent_type::ExtentType;

use buffer::{BufReader, BufWriter, DecodeError};

/// A position in the journal, totally ordered.
///
/// The journal hands these out at commit time; the cache never fabricates
/// them except for [`JournalSeq::MIN`], which tags extents made clean again
/// by an in-place rewrite.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    pub const MIN: Self = Self(0);

    pub fn encode(&self, w: &mut impl BufWriter) {
        w.put_u64(self.0);
    }

    pub fn decode<'a>(r: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        r.get_u64().map(Self)
    }
}

impl std::fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "seq={}", self.0)
    }
}

/// Wall-clock modification time, nanoseconds since the Unix epoch.
///
/// Only ever compared for equality and persisted; replay overwrites it from
/// the record, so wall-clock skew never leaks into cache decisions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModifyTime(pub u64);

impl ModifyTime {
    pub fn now() -> Self {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        // 0 is reserved for "unset"; a real clock reading of exactly the
        // epoch is not worth distinguishing.
        Self(nanos.max(1))
    }

    pub fn encode(&self, w: &mut impl BufWriter) {
        w.put_u64(self.0);
    }

    pub fn decode<'a>(r: &mut impl BufReader<'a>) -> Result<Self, DecodeError> {
        r.get_u64().map(Self)
    }
}
