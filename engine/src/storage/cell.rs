//! Fixed-width integer fields for the on-disk stores.
//!
//! Every persisted integer is a zigzag LEB128 signed varint zero-padded to
//! exactly [`FIELD`] bytes, so cells stay identically sized regardless of
//! magnitude and any field can be addressed by offset arithmetic alone.

/// Bytes per encoded integer field.
pub const FIELD: usize = 8;

/// Bytes per record-store index cell: (record index, source offset, length).
pub const STORE_CELL: usize = 3 * FIELD;

pub const INDEX_FIELD: usize = 0;
pub const OFFSET_FIELD: usize = FIELD;
pub const LENGTH_FIELD: usize = 2 * FIELD;

/// Encodes `value` into a zero-padded field. Values must fit in `7 * FIELD`
/// payload bits after zigzag, which file offsets and counts always do.
pub fn encode_i64(value: i64) -> [u8; FIELD] {
    let mut zigzag = (value as u64) << 1;
    if value < 0 {
        zigzag = !zigzag;
    }
    let mut buf = [0u8; FIELD];
    let mut at = 0;
    while zigzag >= 0x80 {
        debug_assert!(at + 1 < FIELD, "varint overflows fixed field");
        buf[at] = zigzag as u8 | 0x80;
        zigzag >>= 7;
        at += 1;
    }
    buf[at] = zigzag as u8;
    buf
}

/// Decodes a field written by [`encode_i64`]. Trailing padding past the
/// terminator byte is ignored; an all-zero field decodes to 0.
pub fn decode_i64(buf: &[u8; FIELD]) -> i64 {
    let mut zigzag: u64 = 0;
    let mut shift = 0;
    for &byte in buf {
        if byte < 0x80 {
            zigzag |= (byte as u64) << shift;
            break;
        }
        zigzag |= ((byte & 0x7f) as u64) << shift;
        shift += 7;
    }
    let value = (zigzag >> 1) as i64;
    if zigzag & 1 != 0 { !value } else { value }
}
