#![forbid(unsafe_code)]

use crate::types::{compute_crc32, read_u32, read_u64, Result, StoreError};

/// Length of the partition header at the start of every partition file.
pub const HEADER_LEN: u64 = 64;

const MAGIC: [u8; 8] = *b"PMAPPART";
const VERSION: u32 = 1;
const CRC_AT: usize = 60;

/// Metadata stored in the first bytes of a partition file.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PartitionHeader {
    /// Tile size the file was written with.
    pub tile_size: u32,
    /// Partition index; must match the file name.
    pub index: u32,
    /// Bytes of partition data in use.
    pub virtual_size: u64,
    /// Checkpoint generation that last wrote this header.
    pub generation: u64,
}

impl PartitionHeader {
    /// Encodes the header into `HEADER_LEN` bytes.
    pub fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&VERSION.to_be_bytes());
        buf[12..16].copy_from_slice(&self.tile_size.to_be_bytes());
        buf[16..20].copy_from_slice(&self.index.to_be_bytes());
        buf[24..32].copy_from_slice(&self.virtual_size.to_be_bytes());
        buf[32..40].copy_from_slice(&self.generation.to_be_bytes());
        let crc = compute_crc32(&[&buf[..CRC_AT]]);
        buf[CRC_AT..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Decodes and checks a header read from disk.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN as usize {
            return Err(StoreError::format("partition header truncated"));
        }
        if buf[0..8] != MAGIC {
            return Err(StoreError::format("partition header magic mismatch"));
        }
        let version = read_u32(buf, 8);
        if version != VERSION {
            return Err(StoreError::format(format!(
                "unsupported partition version {version}"
            )));
        }
        let stored = read_u32(buf, CRC_AT);
        let crc = compute_crc32(&[&buf[..CRC_AT]]);
        if stored != crc {
            return Err(StoreError::format(format!(
                "partition header checksum mismatch (stored {stored:#010x}, computed {crc:#010x})"
            )));
        }
        Ok(Self {
            tile_size: read_u32(buf, 12),
            index: read_u32(buf, 16),
            virtual_size: read_u64(buf, 24),
            generation: read_u64(buf, 32),
        })
    }
}
