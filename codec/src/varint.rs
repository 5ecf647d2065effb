//! Variable-length integer encoding and decoding
//!
//! Lengths and integers inside records use Protocol Buffers style varints. Each byte uses:
//! - 7 bits for the value
//! - 1 "continuation" bit to indicate if more bytes follow
//!
//! Signed integers are ZigZag-mapped first so that small negative values stay short.

use crate::Error;
use bytes::{Buf, BufMut};

const BITS_PER_BYTE: usize = 8;
const DATA_BITS_PER_BYTE: usize = 7;
const DATA_BITS_MASK: u8 = 0x7F;
const CONTINUATION_BIT_MASK: u8 = 0x80;
const MAX_BITS: usize = 64;

/// Encodes an unsigned 64-bit integer as a varint.
pub fn write(value: u64, buf: &mut impl BufMut) {
    if value < CONTINUATION_BIT_MASK as u64 {
        // Fast path for small values (common case for lengths).
        buf.put_u8(value as u8);
        return;
    }

    let mut val = value;
    while val >= CONTINUATION_BIT_MASK as u64 {
        buf.put_u8((val as u8) | CONTINUATION_BIT_MASK);
        val >>= DATA_BITS_PER_BYTE;
    }
    buf.put_u8(val as u8);
}

/// Decodes an unsigned 64-bit integer from a varint.
pub fn read(buf: &mut impl Buf) -> Result<u64, Error> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        if !buf.has_remaining() {
            return Err(Error::EndOfBuffer);
        }
        let byte = buf.get_u8();

        // If this must be the last byte, reject set bits beyond 64 (this also rejects a trailing
        // continuation bit).
        let remaining_bits = MAX_BITS - shift;
        if remaining_bits <= DATA_BITS_PER_BYTE {
            let relevant_bits = BITS_PER_BYTE - byte.leading_zeros() as usize;
            if relevant_bits > remaining_bits {
                return Err(Error::InvalidVarint);
            }
        }

        result |= ((byte & DATA_BITS_MASK) as u64) << shift;
        if byte & CONTINUATION_BIT_MASK == 0 {
            return Ok(result);
        }
        shift += DATA_BITS_PER_BYTE;
    }
}

/// Number of bytes needed to encode `value` as a varint.
pub fn size(value: u64) -> usize {
    let data_bits = MAX_BITS - value.leading_zeros() as usize;
    usize::max(1, data_bits.div_ceil(DATA_BITS_PER_BYTE))
}

#[inline]
fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ (-((value & 1) as i64))
}

/// Encodes a signed integer as a ZigZag varint.
pub fn write_signed(value: i64, buf: &mut impl BufMut) {
    write(zigzag(value), buf);
}

/// Decodes a signed integer from a ZigZag varint.
pub fn read_signed(buf: &mut impl Buf) -> Result<i64, Error> {
    Ok(unzigzag(read(buf)?))
}

/// Number of bytes needed to encode `value` as a ZigZag varint.
pub fn size_signed(value: i64) -> usize {
    size(zigzag(value))
}

/// Reads a varint length and checks it against `max`.
pub fn read_len(buf: &mut impl Buf, max: usize) -> Result<usize, Error> {
    let len = read(buf)?;
    let len = usize::try_from(len).map_err(|_| Error::InvalidVarint)?;
    if len > max {
        return Err(Error::LengthExceeded(len, max));
    }
    Ok(len)
}
