//! Seam to the device layer for cold reads.

use std::collections::HashMap;
use std::io;

use lodestore_primitives::PhysicalAddr;

/// Reads extent payloads from the device on a cache miss or a replay
/// fault-in. Failures surface to the caller; the cache does not retry.
pub trait ExtentSource {
    fn read(&mut self, paddr: PhysicalAddr, length: u32) -> io::Result<Vec<u8>>;
}

/// In-memory device image for tests.
#[derive(Default)]
pub struct MemExtentSource {
    blocks: HashMap<PhysicalAddr, Vec<u8>>,
}

impl MemExtentSource {
    pub fn put(&mut self, paddr: PhysicalAddr, bytes: Vec<u8>) {
        self.blocks.insert(paddr, bytes);
    }
}

impl ExtentSource for MemExtentSource {
    fn read(&mut self, paddr: PhysicalAddr, length: u32) -> io::Result<Vec<u8>> {
        let bytes = self.blocks.get(&paddr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no extent at {paddr}"))
        })?;
        if bytes.len() != length as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("length mismatch at {paddr}: {} != {length}", bytes.len()),
            ));
        }
        Ok(bytes.clone())
    }
}
