//! Block header layout and whole-block operations.
//!
//! Every block starts with a fixed header:
//!
//! - `revision`: 4 bytes, the revision the block was written for
//! - `checksum`: 4 bytes (CRC32 of the block with this field zeroed)
//! - `level`: 1 byte, 0 for leaves
//! - `max_free`: 2 bytes, size of the contiguous gap after the directory
//! - `total_free`: 2 bytes, all free bytes in the block
//! - `dir_end`: 2 bytes, offset just past the item directory
//!
//! The directory of 2-byte item offsets starts at [`DIR_START`] and is kept
//! in key order. Items are packed against the end of the block.

#![allow(clippy::cast_possible_truncation)]

use crate::storage::btree::item::{C2, I2, Item, K1};
use crate::storage::codec::{get1, get2, get4, set1, set2, set4};

/// Header field offsets.
mod offsets {
    pub const REVISION: usize = 0;
    pub const CHECKSUM: usize = 4;
    pub const LEVEL: usize = 8;
    pub const MAX_FREE: usize = 9;
    pub const TOTAL_FREE: usize = 11;
    pub const DIR_END: usize = 13;
}

/// Offset of the first directory entry.
pub const DIR_START: usize = 15;

/// Size of one directory entry.
pub const D2: usize = 2;

/// Block numbers are 4 bytes wide.
pub const BYTES_PER_BLOCK_NUMBER: usize = 4;

/// Smallest allowed block size.
pub const MIN_BLOCK_SIZE: usize = 2048;

/// Largest allowed block size (2-byte offsets must address every byte).
pub const MAX_BLOCK_SIZE: usize = 65536;

/// Block size used when none is configured.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Whether `size` is a valid block size.
#[must_use]
pub const fn is_valid_block_size(size: usize) -> bool {
    size >= MIN_BLOCK_SIZE && size <= MAX_BLOCK_SIZE && size.is_power_of_two()
}

#[must_use]
pub fn revision(p: &[u8]) -> u32 {
    get4(p, offsets::REVISION)
}

pub fn set_revision(p: &mut [u8], revision: u32) {
    set4(p, offsets::REVISION, revision);
}

#[must_use]
pub fn level(p: &[u8]) -> usize {
    usize::from(get1(p, offsets::LEVEL))
}

pub fn set_level(p: &mut [u8], level: usize) {
    set1(p, offsets::LEVEL, level as u8);
}

#[must_use]
pub fn max_free(p: &[u8]) -> usize {
    usize::from(get2(p, offsets::MAX_FREE))
}

pub fn set_max_free(p: &mut [u8], x: usize) {
    set2(p, offsets::MAX_FREE, x as u16);
}

#[must_use]
pub fn total_free(p: &[u8]) -> usize {
    usize::from(get2(p, offsets::TOTAL_FREE))
}

pub fn set_total_free(p: &mut [u8], x: usize) {
    set2(p, offsets::TOTAL_FREE, x as u16);
}

#[must_use]
pub fn dir_end(p: &[u8]) -> usize {
    usize::from(get2(p, offsets::DIR_END))
}

pub fn set_dir_end(p: &mut [u8], x: usize) {
    set2(p, offsets::DIR_END, x as u16);
}

/// Offset of the item whose directory entry is at `c`.
#[must_use]
pub fn item_offset(p: &[u8], c: usize) -> usize {
    usize::from(get2(p, c))
}

pub fn set_item_offset(p: &mut [u8], c: usize, o: usize) {
    set2(p, c, o as u16);
}

/// Number of items in the block.
#[must_use]
pub fn item_count(p: &[u8]) -> usize {
    (dir_end(p) - DIR_START) / D2
}

/// Bytes taken by items and directory entries.
#[must_use]
pub fn used_space(p: &[u8]) -> usize {
    p.len() - DIR_START - total_free(p)
}

/// Initialise an empty block at `level`.
pub fn init(p: &mut [u8], level: usize, revision: u32) {
    p.fill(0);
    set_revision(p, revision);
    set_level(p, level);
    set_dir_end(p, DIR_START);
    let free = p.len() - DIR_START;
    set_max_free(p, free);
    set_total_free(p, free);
}

/// CRC32 of the block, computed as if the checksum field were zero.
#[must_use]
pub fn compute_checksum(p: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&p[..offsets::CHECKSUM]);
    hasher.update(&[0u8; 4]);
    hasher.update(&p[offsets::CHECKSUM + 4..]);
    hasher.finalize()
}

/// Stamp the block's checksum just before it goes to disk.
pub fn seal(p: &mut [u8]) {
    let checksum = compute_checksum(p);
    set4(p, offsets::CHECKSUM, checksum);
}

/// Check a block freshly read from disk.
///
/// Verifies the checksum and that the directory and every item lie inside
/// the block, so item views over it can slice without further checks.
pub fn validate(p: &[u8]) -> Result<(), BlockError> {
    let stored = get4(p, offsets::CHECKSUM);
    let computed = compute_checksum(p);
    if stored != computed {
        return Err(BlockError::ChecksumMismatch { stored, computed });
    }

    let dir_end = dir_end(p);
    if dir_end < DIR_START || dir_end > p.len() || (dir_end - DIR_START) % D2 != 0 {
        return Err(BlockError::InvalidDirEnd(dir_end));
    }

    // Leaves need a component number and a component count after the key;
    // internal items need a child block number.
    let (min_key, trailer) = if level(p) == 0 {
        (K1 + C2, C2)
    } else {
        (K1, BYTES_PER_BLOCK_NUMBER)
    };
    for c in (DIR_START..dir_end).step_by(D2) {
        let o = item_offset(p, c);
        if o < dir_end || o + I2 + K1 > p.len() {
            return Err(BlockError::ItemOutOfBounds { entry: c, offset: o });
        }
        let size = Item::size_at(p, o);
        let key_len = usize::from(get1(p, o + I2));
        if key_len < min_key || I2 + key_len + trailer > size || o + size > p.len() {
            return Err(BlockError::ItemOutOfBounds { entry: c, offset: o });
        }
    }
    Ok(())
}

/// Repack all items against the end of the block.
///
/// Afterwards `max_free == total_free`. `scratch` must be block-sized.
pub fn compact(p: &mut [u8], scratch: &mut [u8]) {
    let block_size = p.len();
    let mut e = block_size;
    let dir_end = dir_end(p);
    for c in (DIR_START..dir_end).step_by(D2) {
        let o = item_offset(p, c);
        let l = Item::size_at(p, o);
        e -= l;
        scratch[e..e + l].copy_from_slice(&p[o..o + l]);
        set_item_offset(p, c, e);
    }
    p[e..].copy_from_slice(&scratch[e..]);
    let free = e - dir_end;
    set_total_free(p, free);
    set_max_free(p, free);
}

/// Insert an item's bytes at directory position `c`.
///
/// The caller has made sure `max_free` has room for the item plus its
/// directory entry.
pub fn insert_item(p: &mut [u8], item: &[u8], c: usize) {
    let dir_end = dir_end(p);
    let needed = item.len() + D2;
    let new_total = total_free(p) - needed;
    let new_max = max_free(p) - needed;

    p.copy_within(c..dir_end, c + D2);
    let dir_end = dir_end + D2;
    set_dir_end(p, dir_end);

    let o = dir_end + new_max;
    set_item_offset(p, c, o);
    p[o..o + item.len()].copy_from_slice(item);

    set_max_free(p, new_max);
    set_total_free(p, new_total);
}

/// Remove the directory entry at `c`, returning the freed item size.
pub fn remove_item(p: &mut [u8], c: usize) -> usize {
    let size = Item::at(p, c).size();
    let dir_end = dir_end(p) - D2;
    p.copy_within(c + D2..dir_end + D2, c);
    set_dir_end(p, dir_end);
    set_max_free(p, max_free(p) + D2);
    set_total_free(p, total_free(p) + size + D2);
    size
}

/// Directory entry whose items split the block roughly in half by bytes.
#[must_use]
pub fn mid_point(p: &[u8]) -> usize {
    let mut n = 0;
    let dir_end = dir_end(p);
    let size = p.len() - total_free(p) - dir_end;
    for c in (DIR_START..dir_end).step_by(D2) {
        let l = Item::at(p, c).size();
        n += 2 * l;
        if n >= size {
            if l < n - size {
                return c;
            }
            return c + D2;
        }
    }
    dir_end
}

/// Errors detected in a block read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Stored checksum does not match the contents.
    ChecksumMismatch { stored: u32, computed: u32 },
    /// Directory end outside the block.
    InvalidDirEnd(usize),
    /// An item lies (partly) outside the block or over the directory.
    ItemOutOfBounds { entry: usize, offset: usize },
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ChecksumMismatch { stored, computed } => write!(
                f,
                "checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
            ),
            Self::InvalidDirEnd(d) => write!(f, "dir_end {d} invalid"),
            Self::ItemOutOfBounds { entry, offset } => {
                write!(f, "item at directory entry {entry} (offset {offset}) out of bounds")
            }
        }
    }
}

impl std::error::Error for BlockError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::item::ItemWriter;

    const SIZE: usize = 2048;

    fn leaf_item(key: &[u8], tag: &[u8]) -> ItemWriter {
        let mut kt = ItemWriter::new(SIZE);
        kt.form_key(key).expect("form key");
        kt.set_components_of(1);
        kt.set_tag(tag, false);
        kt
    }

    fn block_with(keys: &[&[u8]]) -> Vec<u8> {
        let mut p = vec![0u8; SIZE];
        init(&mut p, 0, 1);
        for (i, key) in keys.iter().enumerate() {
            let kt = leaf_item(key, b"tag");
            insert_item(&mut p, kt.as_bytes(), DIR_START + i * D2);
        }
        p
    }

    #[test]
    fn test_block_size_validation() {
        assert!(is_valid_block_size(2048));
        assert!(is_valid_block_size(65536));
        assert!(!is_valid_block_size(1024));
        assert!(!is_valid_block_size(3000));
        assert!(!is_valid_block_size(131_072));
    }

    #[test]
    fn test_init_empty_block() {
        let mut p = vec![0xaau8; SIZE];
        init(&mut p, 2, 9);
        assert_eq!(revision(&p), 9);
        assert_eq!(level(&p), 2);
        assert_eq!(dir_end(&p), DIR_START);
        assert_eq!(total_free(&p), SIZE - DIR_START);
        assert_eq!(max_free(&p), total_free(&p));
        assert_eq!(used_space(&p), 0);
    }

    #[test]
    fn test_insert_remove_accounting() {
        let mut p = block_with(&[b"apple", b"banana", b"cherry"]);
        assert_eq!(item_count(&p), 3);
        let size = Item::at(&p, DIR_START + D2).size();
        let before = total_free(&p);

        let freed = remove_item(&mut p, DIR_START + D2);
        assert_eq!(freed, size);
        assert_eq!(total_free(&p), before + size + D2);
        assert_eq!(item_count(&p), 2);
        assert_eq!(Item::at(&p, DIR_START + D2).key().bytes(), b"cherry");
    }

    #[test]
    fn test_compact_recovers_gap() {
        let mut p = block_with(&[b"a", b"b", b"c", b"d"]);
        remove_item(&mut p, DIR_START);
        remove_item(&mut p, DIR_START);
        assert!(max_free(&p) < total_free(&p));

        let mut scratch = vec![0u8; SIZE];
        compact(&mut p, &mut scratch);
        assert_eq!(max_free(&p), total_free(&p));
        assert_eq!(Item::at(&p, DIR_START).key().bytes(), b"c");
        assert_eq!(Item::at(&p, DIR_START + D2).key().bytes(), b"d");
    }

    #[test]
    fn test_checksum_detects_damage() {
        let mut p = block_with(&[b"key"]);
        seal(&mut p);
        validate(&p).expect("sealed block validates");

        p[SIZE - 1] ^= 0x01;
        assert!(matches!(
            validate(&p),
            Err(BlockError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_dir_end() {
        let mut p = block_with(&[b"key"]);
        set_dir_end(&mut p, 3);
        seal(&mut p);
        assert_eq!(validate(&p), Err(BlockError::InvalidDirEnd(3)));
    }

    #[test]
    fn test_mid_point_splits_by_bytes() {
        let mut p = vec![0u8; SIZE];
        init(&mut p, 0, 1);
        let big = leaf_item(b"a", &[7u8; 300]);
        insert_item(&mut p, big.as_bytes(), DIR_START);
        for (i, key) in [b"b", b"c", b"d", b"e"].iter().enumerate() {
            let kt = leaf_item(*key, b"x");
            insert_item(&mut p, kt.as_bytes(), DIR_START + (i + 1) * D2);
        }
        // The single large item outweighs the four small ones.
        assert_eq!(mid_point(&p), DIR_START + D2);
    }
}
