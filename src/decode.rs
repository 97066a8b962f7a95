//! Stateless byte decoding helpers shared by every on-disk structure.
//!
//! ext structures are little-endian, JBD2 journal structures are big-endian.
//! None of these helpers check bounds: callers validate the slice length once
//! per structure and report `TruncatedMetadata` themselves.
use byteorder::{BigEndian, ByteOrder, LittleEndian};

pub fn le_u16(data: &[u8], offset: usize) -> u16 {
    LittleEndian::read_u16(&data[offset..offset + 2])
}

pub fn le_u32(data: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&data[offset..offset + 4])
}

pub fn be_u32(data: &[u8], offset: usize) -> u32 {
    BigEndian::read_u32(&data[offset..offset + 4])
}

pub fn be_u64(data: &[u8], offset: usize) -> u64 {
    BigEndian::read_u64(&data[offset..offset + 8])
}

/// Merge a split field: `lo` supplies the low 32 bits, `hi` everything above.
pub fn lo_hi(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

/// Expand bytes into bits, least significant bit of each byte first (the
/// order ext bitmaps use).
pub fn bytes_to_bits(data: &[u8]) -> Vec<bool> {
    data.iter()
        .flat_map(|byte| (0..8).map(move |i| byte & (1 << i) != 0))
        .collect()
}

/// `ceil(a / b)` for block arithmetic.
pub fn div_ceil(a: u64, b: u64) -> u64 {
    a / b + u64::from(a % b != 0)
}
