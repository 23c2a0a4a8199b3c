//! Byte-level primitives shared by both engines: big-endian 48-bit fields,
//! fixed-width name padding, and the CRC-32 helpers.

use crc32fast::Hasher;

use crate::buffer::LargeBuffer;

/// Largest value representable in a 6-byte size field.
pub const MAX_U48: u64 = (1 << 48) - 1;

pub fn u48_to_be(value: u64) -> [u8; 6] {
    let b = value.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

pub fn u48_from_be(bytes: &[u8; 6]) -> u64 {
    let mut b = [0u8; 8];
    b[2..].copy_from_slice(bytes);
    u64::from_be_bytes(b)
}

/// Copy up to `width` bytes of `name` into a zero-filled field.
pub fn pad_name(name: &[u8], width: usize) -> Vec<u8> {
    let mut field = vec![0u8; width];
    let n = name.len().min(width);
    field[..n].copy_from_slice(&name[..n]);
    field
}

/// The logical name is the prefix before the first zero byte.
pub fn unpad_name(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(end) => &field[..end],
        None => field,
    }
}

pub fn crc_of(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Archive-level checksum: per-entry CRCs sorted ascending as unsigned
/// 32-bit values, each fed as one big-endian word.  Order-independent
/// across entry maps.
pub fn archive_crc(entry_crcs: &[u32]) -> u32 {
    let mut sorted = entry_crcs.to_vec();
    sorted.sort_unstable();

    let mut words = LargeBuffer::with_capacity(sorted.len() as u64 * 4);
    for crc in &sorted {
        words.append_slice(&crc.to_be_bytes());
    }

    let mut hasher = Hasher::new();
    words.for_each_word(|w| hasher.update(&w.to_be_bytes()));
    hasher.finalize()
}
