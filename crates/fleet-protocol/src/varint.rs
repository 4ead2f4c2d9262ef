//! Variable-length unsigned 32-bit integers.
//!
//! 7 data bits per byte, least-significant group first, continuation bit 0x80.
//! A u32 never needs more than 5 bytes; a sixth continuation byte is malformed.

use bytes::BufMut;

use crate::ProtocolError;

/// Longest valid encoding of a u32.
pub const MAX_VARINT_LEN: usize = 5;

const CONTINUATION: u8 = 0x80;
const DATA_MASK: u8 = 0x7F;

/// Number of bytes `value` occupies on the wire.
pub const fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}

/// Append the varint encoding of `value` to `dst`.
pub fn write_varint<B: BufMut>(dst: &mut B, mut value: u32) {
    while value >= u32::from(CONTINUATION) {
        dst.put_u8((value as u8 & DATA_MASK) | CONTINUATION);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Read a varint from the front of `src` without consuming it.
///
/// Returns `Ok(None)` when more bytes are needed, otherwise the value and the
/// number of bytes it occupied.
pub fn read_varint(src: &[u8]) -> Result<Option<(u32, usize)>, ProtocolError> {
    let mut value: u32 = 0;
    for (index, byte) in src.iter().copied().enumerate() {
        if index == MAX_VARINT_LEN - 1 {
            // Only 4 bits of the fifth group fit into a u32.
            if byte & CONTINUATION != 0 {
                return Err(ProtocolError::MalformedVarInt("varint longer than 5 bytes"));
            }
            if byte > 0x0F {
                return Err(ProtocolError::MalformedVarInt("varint overflows u32"));
            }
        }
        value |= u32::from(byte & DATA_MASK) << (7 * index);
        if byte & CONTINUATION == 0 {
            return Ok(Some((value, index + 1)));
        }
    }
    Ok(None)
}

/// Read a varint and advance `src` past it. Unlike [`read_varint`], running out
/// of bytes is an error: used when the whole frame is already buffered.
pub fn take_varint(src: &mut &[u8]) -> Result<u32, ProtocolError> {
    match read_varint(src)? {
        Some((value, len)) => {
            *src = &src[len..];
            Ok(value)
        }
        None => Err(ProtocolError::MalformedVarInt("truncated varint")),
    }
}
