#![forbid(unsafe_code)]

use crc32fast::Hasher;

/// CRC32 over a sequence of byte slices, as if they were concatenated.
pub fn compute_crc32(parts: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

/// CRC32 of a byte range bound to the partition and file offset it came from,
/// so a record replayed into the wrong place fails verification.
pub fn range_crc32(partition: u32, offset: u64, payload: &[u8]) -> u32 {
    compute_crc32(&[&partition.to_be_bytes(), &offset.to_be_bytes(), payload])
}
