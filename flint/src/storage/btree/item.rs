//! Items: the variable-length records stored in blocks.
//!
//! ```text
//!   I K key x C tag
//!     <--K-->
//!   <------I------>
//! ```
//!
//! - `I` (2 bytes): item size; the top bit flags a compressed tag
//! - `K` (1 byte): key length including `K` itself and `x`
//! - `x` (2 bytes): component number of this item (1-based)
//! - `C` (2 bytes): number of components the whole tag was split into
//!
//! Leaf items carry a chunk of the tag. Internal items have no `C` and
//! their "tag" is the 4-byte number of the child block. The first item of
//! an internal block may hold a null key (`K` only) since it is never
//! compared.

#![allow(clippy::cast_possible_truncation)]

use std::cmp::Ordering;

use crate::storage::btree::block::{BYTES_PER_BLOCK_NUMBER, item_offset};
use crate::storage::codec::{get1, get2, get4, set1, set2, set4};

/// Width of the item size field.
pub const I2: usize = 2;
/// Width of the key length field.
pub const K1: usize = 1;
/// Width of a component counter.
pub const C2: usize = 2;

/// Longest key a table can hold.
pub const MAX_KEY_LEN: usize = 252;

/// Largest encodable item size; the top bit of `I` is the compressed flag.
pub const MAX_ITEM_SIZE: usize = 0x7fff;

const COMPRESSED_FLAG: u8 = 0x80;

/// A key inside a block: `K key x`.
#[derive(Clone, Copy)]
pub struct Key<'a> {
    p: &'a [u8],
}

impl<'a> Key<'a> {
    /// View the key starting at its `K` byte.
    #[must_use]
    pub fn new(p: &'a [u8]) -> Self {
        let k = usize::from(get1(p, 0));
        Self { p: &p[..k] }
    }

    /// Length of the key bytes, excluding `K` and the component number.
    #[must_use]
    pub const fn length(&self) -> usize {
        self.p.len().saturating_sub(K1 + C2)
    }

    /// The key bytes.
    #[must_use]
    pub fn bytes(&self) -> &'a [u8] {
        &self.p[K1..K1 + self.length()]
    }

    /// Component number stored with the key (0 for a null key).
    #[must_use]
    pub fn component(&self) -> u16 {
        if self.p.len() < K1 + C2 {
            0
        } else {
            get2(self.p, K1 + self.length())
        }
    }
}

impl PartialEq for Key<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key<'_> {}

impl PartialOrd for Key<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key<'_> {
    /// Byte order, shorter first on a common prefix, then component number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes()
            .cmp(other.bytes())
            .then_with(|| self.component().cmp(&other.component()))
    }
}

impl std::fmt::Debug for Key<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Key({:?}#{})",
            String::from_utf8_lossy(self.bytes()),
            self.component()
        )
    }
}

/// Read-only view of one item.
#[derive(Clone, Copy)]
pub struct Item<'a> {
    p: &'a [u8],
}

impl<'a> Item<'a> {
    /// The item whose directory entry is at `c` in `block`.
    #[must_use]
    pub fn at(block: &'a [u8], c: usize) -> Self {
        let o = item_offset(block, c);
        Self::from_offset(block, o)
    }

    /// The item starting at byte `o` of `block`.
    #[must_use]
    pub fn from_offset(block: &'a [u8], o: usize) -> Self {
        let size = Self::size_at(block, o);
        Self {
            p: &block[o..o + size],
        }
    }

    /// Size field of the item starting at byte `o`.
    #[must_use]
    pub fn size_at(block: &[u8], o: usize) -> usize {
        usize::from(get2(block, o)) & MAX_ITEM_SIZE
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.p.len()
    }

    #[must_use]
    pub const fn is_compressed(&self) -> bool {
        self.p[0] & COMPRESSED_FLAG != 0
    }

    fn key_field(&self) -> usize {
        usize::from(get1(self.p, I2))
    }

    #[must_use]
    pub fn key(&self) -> Key<'a> {
        Key::new(&self.p[I2..])
    }

    #[must_use]
    pub fn component_of(&self) -> u16 {
        get2(self.p, I2 + self.key_field() - C2)
    }

    #[must_use]
    pub fn components_of(&self) -> u16 {
        get2(self.p, I2 + self.key_field())
    }

    /// This item's share of the tag.
    #[must_use]
    pub fn tag_chunk(&self) -> &'a [u8] {
        &self.p[I2 + self.key_field() + C2..]
    }

    /// Append this item's tag chunk to `tag`.
    pub fn append_chunk(&self, tag: &mut Vec<u8>) {
        tag.extend_from_slice(self.tag_chunk());
    }

    /// Child block number of an internal item.
    #[must_use]
    pub fn block_given_by(&self) -> u32 {
        get4(self.p, self.size() - BYTES_PER_BLOCK_NUMBER)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &'a [u8] {
        self.p
    }
}

/// Point the internal item at directory entry `c` to child `n`.
pub fn set_block_given_by(block: &mut [u8], c: usize, n: u32) {
    let o = item_offset(block, c);
    let size = Item::size_at(block, o);
    set4(block, o + size - BYTES_PER_BLOCK_NUMBER, n);
}

/// Shrink the internal item at byte `o` to a null key pointing at `n`.
///
/// Returns how many bytes the item lost.
pub fn null_key_in_place(block: &mut [u8], o: usize, n: u32) -> usize {
    let old_size = Item::size_at(block, o);
    set4(block, o + I2 + K1, n);
    set1(block, o + I2, K1 as u8);
    let new_size = I2 + K1 + BYTES_PER_BLOCK_NUMBER;
    set2(block, o, new_size as u16);
    old_size - new_size
}

/// An item under construction, owned outside any block.
pub struct ItemWriter {
    buf: Vec<u8>,
}

impl ItemWriter {
    /// Scratch space large enough for any item in a block of `block_size`.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            buf: vec![0u8; block_size.min(MAX_ITEM_SIZE + 1)],
        }
    }

    fn key_field(&self) -> usize {
        usize::from(get1(&self.buf, I2))
    }

    fn set_size(&mut self, size: usize) {
        debug_assert!(size <= MAX_ITEM_SIZE, "item too large");
        set2(&mut self.buf, 0, size as u16);
    }

    #[must_use]
    pub fn size(&self) -> usize {
        Item::size_at(&self.buf, 0)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.size()]
    }

    #[must_use]
    pub fn key(&self) -> Key<'_> {
        Key::new(&self.buf[I2..])
    }

    /// Fill in the key part for `key`, component 1.
    ///
    /// The size and tag are left for [`ItemWriter::set_tag`].
    pub fn form_key(&mut self, key: &[u8]) -> Result<(), KeyTooLong> {
        if key.len() > MAX_KEY_LEN {
            return Err(KeyTooLong(key.len()));
        }
        set1(&mut self.buf, I2, (key.len() + K1 + C2) as u8);
        self.buf[I2 + K1..I2 + K1 + key.len()].copy_from_slice(key);
        self.set_component_of(1);
        // Keep the item self-consistent until a tag is attached.
        let size = I2 + K1 + key.len() + C2 + C2;
        self.set_size(size);
        Ok(())
    }

    pub fn set_component_of(&mut self, i: u16) {
        let o = I2 + self.key_field() - C2;
        set2(&mut self.buf, o, i);
    }

    pub fn set_components_of(&mut self, m: u16) {
        let o = I2 + self.key_field();
        set2(&mut self.buf, o, m);
    }

    /// Offset at which the tag chunk starts.
    #[must_use]
    pub fn tag_offset(&self) -> usize {
        I2 + self.key_field() + C2
    }

    /// Store `chunk` as this item's tag.
    pub fn set_tag(&mut self, chunk: &[u8], compressed: bool) {
        let cd = self.tag_offset();
        self.buf[cd..cd + chunk.len()].copy_from_slice(chunk);
        self.set_size(cd + chunk.len());
        if compressed {
            self.buf[0] |= COMPRESSED_FLAG;
        }
    }

    /// Build an internal item from the first `truncate` bytes of `key`
    /// (keeping its component number) pointing at child `n`.
    pub fn set_key_and_block(&mut self, key: Key<'_>, truncate: usize, n: u32) {
        debug_assert!(truncate <= key.length());
        let new_size = I2 + K1 + truncate + C2;
        self.set_size(new_size + BYTES_PER_BLOCK_NUMBER);
        set1(&mut self.buf, I2, (new_size - I2) as u8);
        self.buf[I2 + K1..I2 + K1 + truncate].copy_from_slice(&key.bytes()[..truncate]);
        set2(&mut self.buf, I2 + K1 + truncate, key.component());
        set4(&mut self.buf, new_size, n);
    }

    /// An internal item with a null key pointing at child `n`.
    pub fn form_null_key(&mut self, n: u32) {
        set4(&mut self.buf, I2 + K1, n);
        set1(&mut self.buf, I2, K1 as u8);
        self.set_size(I2 + K1 + BYTES_PER_BLOCK_NUMBER);
    }

    /// The single empty-key, empty-tag item of a faked root block.
    pub fn fake_root_item(&mut self) {
        set1(&mut self.buf, I2, (K1 + C2) as u8);
        self.set_size(I2 + K1 + 2 * C2);
        self.set_component_of(1);
        self.set_components_of(1);
    }
}

/// A key longer than [`MAX_KEY_LEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTooLong(pub usize);

impl std::fmt::Display for KeyTooLong {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "key too long: length was {} bytes, maximum length of a key is {MAX_KEY_LEN} bytes",
            self.0
        )
    }
}

impl std::error::Error for KeyTooLong {}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(key: &[u8], component: u16, tag: &[u8]) -> ItemWriter {
        let mut kt = ItemWriter::new(2048);
        kt.form_key(key).expect("form key");
        kt.set_component_of(component);
        kt.set_components_of(3);
        kt.set_tag(tag, false);
        kt
    }

    #[test]
    fn test_leaf_item_fields() {
        let kt = leaf(b"term0001", 2, b"doc-list");
        let item = Item::from_offset(kt.as_bytes(), 0);
        assert_eq!(item.size(), I2 + K1 + 8 + C2 + C2 + 8);
        assert!(!item.is_compressed());
        assert_eq!(item.key().bytes(), b"term0001");
        assert_eq!(item.key().length(), 8);
        assert_eq!(item.component_of(), 2);
        assert_eq!(item.components_of(), 3);
        assert_eq!(item.tag_chunk(), b"doc-list");
    }

    #[test]
    fn test_compressed_flag_does_not_change_size() {
        let mut kt = ItemWriter::new(2048);
        kt.form_key(b"k").expect("form key");
        kt.set_components_of(1);
        kt.set_tag(&[1, 2, 3], true);
        assert!(Item::from_offset(kt.as_bytes(), 0).is_compressed());
        assert_eq!(kt.size(), I2 + K1 + 1 + C2 + C2 + 3);
    }

    #[test]
    fn test_key_ordering() {
        let a = leaf(b"ab", 1, b"");
        let ab2 = leaf(b"ab", 2, b"");
        let abc = leaf(b"abc", 1, b"");
        let b = leaf(b"b", 1, b"");

        assert!(a.key() < ab2.key());
        assert!(ab2.key() < abc.key(), "shorter key sorts first on a prefix");
        assert!(abc.key() < b.key());
        assert_eq!(a.key(), leaf(b"ab", 1, b"x").key());
    }

    #[test]
    fn test_key_too_long() {
        let mut kt = ItemWriter::new(2048);
        assert_eq!(kt.form_key(&[b'x'; 253]), Err(KeyTooLong(253)));
        kt.form_key(&[b'x'; MAX_KEY_LEN]).expect("252 bytes is allowed");
    }

    #[test]
    fn test_truncated_separator() {
        let source = leaf(b"term0250", 1, b"tag");
        let mut sep = ItemWriter::new(2048);
        sep.set_key_and_block(source.key(), 5, 42);
        let item = Item::from_offset(sep.as_bytes(), 0);
        assert_eq!(item.key().bytes(), b"term0");
        assert_eq!(item.key().component(), 1);
        assert_eq!(item.block_given_by(), 42);
    }

    #[test]
    fn test_null_key_item() {
        let mut kt = ItemWriter::new(2048);
        kt.form_null_key(7);
        let item = Item::from_offset(kt.as_bytes(), 0);
        assert_eq!(item.size(), I2 + K1 + BYTES_PER_BLOCK_NUMBER);
        assert_eq!(item.key().length(), 0);
        assert_eq!(item.block_given_by(), 7);
    }

    #[test]
    fn test_null_key_in_place_shrinks() {
        let source = leaf(b"separator", 1, b"");
        let mut sep = ItemWriter::new(2048);
        sep.set_key_and_block(source.key(), 9, 11);
        let mut block = sep.as_bytes().to_vec();
        let lost = null_key_in_place(&mut block, 0, 11);
        assert_eq!(lost, 9 + C2);
        let item = Item::from_offset(&block, 0);
        assert_eq!(item.key().length(), 0);
        assert_eq!(item.block_given_by(), 11);
    }

    #[test]
    fn test_fake_root_item() {
        let mut kt = ItemWriter::new(2048);
        kt.fake_root_item();
        let item = Item::from_offset(kt.as_bytes(), 0);
        assert_eq!(item.size(), I2 + K1 + 2 * C2);
        assert_eq!(item.key().length(), 0);
        assert_eq!(item.component_of(), 1);
        assert!(item.tag_chunk().is_empty());
    }
}
