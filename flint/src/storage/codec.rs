//! Fixed-width big-endian integers inside byte buffers.
//!
//! Every on-disk structure (block headers, item directories, base files) is
//! encoded through these helpers. Callers guarantee `offset + width` lies
//! inside the buffer; block-size invariants make that true for all block
//! accesses, and a violation is a bug rather than a data error.

/// Read a 1-byte unsigned integer.
#[must_use]
#[inline]
pub fn get1(buf: &[u8], offset: usize) -> u8 {
    debug_assert!(offset < buf.len(), "get1 past end of buffer");
    buf[offset]
}

/// Read a 2-byte big-endian unsigned integer.
#[must_use]
#[inline]
pub fn get2(buf: &[u8], offset: usize) -> u16 {
    debug_assert!(offset + 2 <= buf.len(), "get2 past end of buffer");
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Read a 4-byte big-endian unsigned integer.
#[must_use]
#[inline]
pub fn get4(buf: &[u8], offset: usize) -> u32 {
    debug_assert!(offset + 4 <= buf.len(), "get4 past end of buffer");
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

/// Read an 8-byte big-endian unsigned integer.
#[must_use]
#[inline]
pub fn get8(buf: &[u8], offset: usize) -> u64 {
    debug_assert!(offset + 8 <= buf.len(), "get8 past end of buffer");
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// Write a 1-byte unsigned integer.
#[inline]
pub fn set1(buf: &mut [u8], offset: usize, value: u8) {
    debug_assert!(offset < buf.len(), "set1 past end of buffer");
    buf[offset] = value;
}

/// Write a 2-byte big-endian unsigned integer.
#[inline]
pub fn set2(buf: &mut [u8], offset: usize, value: u16) {
    debug_assert!(offset + 2 <= buf.len(), "set2 past end of buffer");
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

/// Write a 4-byte big-endian unsigned integer.
#[inline]
pub fn set4(buf: &mut [u8], offset: usize, value: u32) {
    debug_assert!(offset + 4 <= buf.len(), "set4 past end of buffer");
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Write an 8-byte big-endian unsigned integer.
#[inline]
pub fn set8(buf: &mut [u8], offset: usize, value: u64) {
    debug_assert!(offset + 8 <= buf.len(), "set8 past end of buffer");
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Append `value` as a little-endian base-128 varint.
///
/// Seven bits per byte, high bit set on every byte except the last.
pub fn pack_uint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        #[allow(clippy::cast_possible_truncation)] // masked to 7 bits
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    #[allow(clippy::cast_possible_truncation)] // value < 0x80 here
    out.push(value as u8);
}

/// Append a varint length followed by the bytes themselves.
pub fn pack_string(out: &mut Vec<u8>, bytes: &[u8]) {
    pack_uint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

/// Decode a varint from the front of `input`, advancing it.
///
/// Returns `None` if the input ends mid-value or the value overflows 64 bits.
pub fn unpack_uint(input: &mut &[u8]) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = input.split_first()?;
        *input = rest;
        if shift >= 64 {
            return None;
        }
        value |= u64::from(byte & 0x7f).checked_shl(shift)?;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut buf = [0u8; 8];
        set4(&mut buf, 0, 0x0102_0304);
        set2(&mut buf, 4, 0xa0b0);
        set1(&mut buf, 6, 0xff);
        assert_eq!(buf, [1, 2, 3, 4, 0xa0, 0xb0, 0xff, 0]);
        assert_eq!(get4(&buf, 0), 0x0102_0304);
        assert_eq!(get2(&buf, 4), 0xa0b0);
        assert_eq!(get1(&buf, 6), 0xff);
    }

    #[test]
    fn test_unaligned_offsets() {
        let mut buf = [0u8; 16];
        set4(&mut buf, 3, u32::MAX - 1);
        set8(&mut buf, 7, 0x1122_3344_5566_7788);
        assert_eq!(get4(&buf, 3), u32::MAX - 1);
        assert_eq!(get8(&buf, 7), 0x1122_3344_5566_7788);
        assert_eq!(buf[0..3], [0, 0, 0]);
    }

    #[test]
    fn test_varint_boundaries() {
        let mut out = Vec::new();
        pack_uint(&mut out, 0);
        pack_uint(&mut out, 127);
        pack_uint(&mut out, 128);
        pack_uint(&mut out, u64::MAX);
        assert_eq!(&out[..4], &[0x00, 0x7f, 0x80, 0x01]);

        let mut input = out.as_slice();
        assert_eq!(unpack_uint(&mut input), Some(0));
        assert_eq!(unpack_uint(&mut input), Some(127));
        assert_eq!(unpack_uint(&mut input), Some(128));
        assert_eq!(unpack_uint(&mut input), Some(u64::MAX));
        assert!(input.is_empty());
    }

    #[test]
    fn test_varint_truncated() {
        let mut input: &[u8] = &[0x80, 0x80];
        assert_eq!(unpack_uint(&mut input), None);
    }

    #[test]
    fn test_pack_string() {
        let mut out = Vec::new();
        pack_string(&mut out, b"postlist");
        assert_eq!(out[0], 8);
        assert_eq!(&out[1..], b"postlist");
    }
}
