use crc32fast::Hasher;

/// CRC-32 over a sequence of byte slices, used to frame handoff blobs.
pub fn compute_crc32(parts: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}
