//! Minimal byte-buffer reader/writer used by all on-wire encodings.
//!
//! Encoders write little-endian integers and raw slices through
//! [`BufWriter`]; decoders read them back through [`BufReader`], failing
//! with [`DecodeError`] on truncation or bad tags. The wire formats built on
//! top of this must stay bit-stable across versions, so nothing here is
//! allowed to change representation.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum DecodeError {
    #[error("buffer has less than {expected} bytes remaining ({given} given) for {for_type}")]
    BufferLength {
        for_type: &'static str,
        expected: usize,
        given: usize,
    },
    #[error("unknown tag {tag:#04x} for {for_type}")]
    InvalidTag { for_type: &'static str, tag: u8 },
    #[error("{got} trailing bytes after {for_type}")]
    TrailingBytes { for_type: &'static str, got: usize },
}

pub trait BufWriter {
    fn put_slice(&mut self, slice: &[u8]);

    fn put_u8(&mut self, val: u8) {
        self.put_slice(&val.to_le_bytes());
    }
    fn put_u16(&mut self, val: u16) {
        self.put_slice(&val.to_le_bytes());
    }
    fn put_u32(&mut self, val: u32) {
        self.put_slice(&val.to_le_bytes());
    }
    fn put_u64(&mut self, val: u64) {
        self.put_slice(&val.to_le_bytes());
    }
}

impl BufWriter for Vec<u8> {
    fn put_slice(&mut self, slice: &[u8]) {
        self.extend_from_slice(slice);
    }
}

pub trait BufReader<'de> {
    fn get_slice(&mut self, size: usize) -> Result<&'de [u8], DecodeError>;
    fn remaining(&self) -> usize;

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.get_slice(N)?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        Ok(buf)
    }
    fn get_u8(&mut self) -> Result<u8, DecodeError> {
        self.get_array().map(u8::from_le_bytes)
    }
    fn get_u16(&mut self) -> Result<u16, DecodeError> {
        self.get_array().map(u16::from_le_bytes)
    }
    fn get_u32(&mut self) -> Result<u32, DecodeError> {
        self.get_array().map(u32::from_le_bytes)
    }
    fn get_u64(&mut self) -> Result<u64, DecodeError> {
        self.get_array().map(u64::from_le_bytes)
    }
}

impl<'de> BufReader<'de> for &'de [u8] {
    fn get_slice(&mut self, size: usize) -> Result<&'de [u8], DecodeError> {
        if self.len() < size {
            return Err(DecodeError::BufferLength {
                for_type: "slice",
                expected: size,
                given: self.len(),
            });
        }
        let (head, tail) = self.split_at(size);
        *self = tail;
        Ok(head)
    }

    fn remaining(&self) -> usize {
        self.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_roundtrip() {
        let mut buf = Vec::new();
        buf.put_u8(0xab);
        buf.put_u16(0xbeef);
        buf.put_u32(0xdead_beef);
        buf.put_u64(u64::MAX - 1);

        let mut r = buf.as_slice();
        assert_eq!(r.get_u8().unwrap(), 0xab);
        assert_eq!(r.get_u16().unwrap(), 0xbeef);
        assert_eq!(r.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.get_u64().unwrap(), u64::MAX - 1);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn truncated_read_fails() {
        let buf = [0u8; 3];
        let mut r = buf.as_slice();
        assert!(matches!(
            r.get_u32(),
            Err(DecodeError::BufferLength { expected: 4, given: 3, .. })
        ));
    }
}
