//! Base files: the per-revision metadata record of a table.
//!
//! A table keeps two base slots, A and B. Each commit writes the new record
//! into the slot not holding the revision it started from, so a crash while
//! writing it leaves the other slot (and every block that slot refers to)
//! intact.
//!
//! The record also carries the free-block bitmap. While a transaction is
//! open two copies are kept: the bitmap as of the start of the transaction
//! and the current one. A block may only be reused if it is free in both,
//! which is what keeps the committed revision readable until the next
//! commit.

#![allow(clippy::cast_possible_truncation)]

use tracing::warn;

use crate::storage::btree::block::is_valid_block_size;
use crate::storage::codec::{get1, get4, get8, set1, set4, set8};
use crate::storage::compression::CompressionStrategy;
use crate::storage::io::{Storage, StorageError};

/// Magic number identifying a base file: "FLINTBSE"
pub const MAGIC: [u8; 8] = *b"FLINTBSE";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// The bitmap grows by this many bytes at a time.
const BIT_MAP_INC: usize = 1000;

/// Base file field offsets.
mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 8;
    pub const REVISION: usize = 12;
    pub const BLOCK_SIZE: usize = 16;
    pub const ROOT: usize = 20;
    pub const LEVEL: usize = 24;
    pub const ITEM_COUNT: usize = 28;
    pub const LAST_BLOCK: usize = 36;
    pub const FLAGS: usize = 40;
    pub const COMPRESSION: usize = 41;
    pub const BITMAP_SIZE: usize = 42;
    pub const BITMAP: usize = 46;
}

/// Trailing CRC32 over everything before it.
const CHECKSUM_LEN: usize = 4;

mod flags {
    pub const FAKE_ROOT: u8 = 0x01;
    pub const SEQUENTIAL: u8 = 0x02;
}

/// Which of the two base slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseLetter {
    A,
    B,
}

impl BaseLetter {
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    #[must_use]
    pub const fn as_char(self) -> char {
        match self {
            Self::A => 'A',
            Self::B => 'B',
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }
}

/// The contents of one base file.
#[derive(Debug, Clone)]
pub struct BaseRecord {
    pub revision: u32,
    pub block_size: u32,
    pub root: u32,
    pub level: u32,
    pub item_count: u64,
    /// No block has been written yet; the root is built in memory.
    pub have_fakeroot: bool,
    pub sequential: bool,
    pub compression: CompressionStrategy,
    last_block: u32,
    /// Blocks in use now.
    bitmap: Vec<u8>,
    /// Blocks in use at the start of the transaction.
    bitmap0: Vec<u8>,
    /// Lowest byte of the bitmap that may have a free bit.
    bit_map_low: usize,
}

impl BaseRecord {
    /// The record of a freshly created, empty table.
    #[must_use]
    pub const fn new(revision: u32, block_size: u32, compression: CompressionStrategy) -> Self {
        Self {
            revision,
            block_size,
            root: 0,
            level: 0,
            item_count: 0,
            have_fakeroot: true,
            sequential: true,
            compression,
            last_block: 0,
            bitmap: Vec::new(),
            bitmap0: Vec::new(),
            bit_map_low: 0,
        }
    }

    /// Parse and validate a base file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BaseError> {
        if bytes.len() < offsets::BITMAP + CHECKSUM_LEN {
            return Err(BaseError::Truncated(bytes.len()));
        }
        if bytes[offsets::MAGIC..offsets::MAGIC + MAGIC.len()] != MAGIC {
            return Err(BaseError::BadMagic);
        }
        let version = get4(bytes, offsets::FORMAT_VERSION);
        if version != FORMAT_VERSION {
            return Err(BaseError::UnsupportedVersion(version));
        }

        let body_len = bytes.len() - CHECKSUM_LEN;
        let stored = get4(bytes, body_len);
        let computed = crc32fast::hash(&bytes[..body_len]);
        if stored != computed {
            return Err(BaseError::ChecksumMismatch { stored, computed });
        }

        let bitmap_size = get4(bytes, offsets::BITMAP_SIZE) as usize;
        if offsets::BITMAP + bitmap_size != body_len {
            return Err(BaseError::Truncated(bytes.len()));
        }

        let block_size = get4(bytes, offsets::BLOCK_SIZE);
        if !is_valid_block_size(block_size as usize) {
            return Err(BaseError::InvalidBlockSize(block_size));
        }

        let compression_byte = get1(bytes, offsets::COMPRESSION);
        let compression = CompressionStrategy::try_from(compression_byte)
            .map_err(BaseError::UnknownCompression)?;

        let flag_bits = get1(bytes, offsets::FLAGS);
        let have_fakeroot = flag_bits & flags::FAKE_ROOT != 0;
        let bitmap = bytes[offsets::BITMAP..body_len].to_vec();

        Ok(Self {
            revision: get4(bytes, offsets::REVISION),
            block_size,
            root: get4(bytes, offsets::ROOT),
            level: get4(bytes, offsets::LEVEL),
            item_count: get8(bytes, offsets::ITEM_COUNT),
            have_fakeroot,
            // A faked root is always in sequential mode.
            sequential: have_fakeroot || flag_bits & flags::SEQUENTIAL != 0,
            compression,
            last_block: get4(bytes, offsets::LAST_BLOCK),
            bitmap0: bitmap.clone(),
            bitmap,
            bit_map_low: 0,
        })
    }

    /// Serialize the record, with the bitmap trimmed of trailing free bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let bitmap_size = self.bitmap.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        let body_len = offsets::BITMAP + bitmap_size;
        let mut bytes = vec![0u8; body_len + CHECKSUM_LEN];

        bytes[offsets::MAGIC..offsets::MAGIC + MAGIC.len()].copy_from_slice(&MAGIC);
        set4(&mut bytes, offsets::FORMAT_VERSION, FORMAT_VERSION);
        set4(&mut bytes, offsets::REVISION, self.revision);
        set4(&mut bytes, offsets::BLOCK_SIZE, self.block_size);
        set4(&mut bytes, offsets::ROOT, self.root);
        set4(&mut bytes, offsets::LEVEL, self.level);
        set8(&mut bytes, offsets::ITEM_COUNT, self.item_count);
        set4(&mut bytes, offsets::LAST_BLOCK, self.last_block);
        let mut flag_bits = 0;
        if self.have_fakeroot {
            flag_bits |= flags::FAKE_ROOT;
        }
        if self.sequential {
            flag_bits |= flags::SEQUENTIAL;
        }
        set1(&mut bytes, offsets::FLAGS, flag_bits);
        set1(&mut bytes, offsets::COMPRESSION, self.compression as u8);
        set4(&mut bytes, offsets::BITMAP_SIZE, bitmap_size as u32);
        bytes[offsets::BITMAP..body_len].copy_from_slice(&self.bitmap[..bitmap_size]);

        let checksum = crc32fast::hash(&bytes[..body_len]);
        set4(&mut bytes, body_len, checksum);
        bytes
    }

    /// Highest block number in use, as last calculated.
    #[must_use]
    pub const fn last_block(&self) -> u32 {
        self.last_block
    }

    /// Allocate a block that is free now and was free at the start of the
    /// transaction.
    pub fn next_free_block(&mut self) -> u32 {
        let mut i = self.bit_map_low;
        let x = loop {
            if i >= self.bitmap.len() {
                self.extend_bit_map();
            }
            let x = self.bitmap0[i] | self.bitmap[i];
            if x != u8::MAX {
                break x;
            }
            i += 1;
        };
        let bit = x.trailing_ones();
        self.bitmap[i] |= 1 << bit;
        self.bit_map_low = i;
        let n = (i * 8) as u32 + bit;
        self.last_block = self.last_block.max(n);
        n
    }

    /// Mark block `n` free in the current bitmap.
    pub fn free_block(&mut self, n: u32) {
        let (i, bit) = Self::position(n);
        if let Some(byte) = self.bitmap.get_mut(i) {
            *byte &= !bit;
        }
        if i < self.bit_map_low && self.bitmap0.get(i).is_none_or(|b| b & bit == 0) {
            self.bit_map_low = i;
        }
    }

    /// Whether block `n` was free at the start of the transaction.
    #[must_use]
    pub fn block_free_at_start(&self, n: u32) -> bool {
        let (i, bit) = Self::position(n);
        self.bitmap0.get(i).is_none_or(|b| b & bit == 0)
    }

    /// Whether block `n` is free in the current bitmap.
    #[must_use]
    pub fn block_free_now(&self, n: u32) -> bool {
        let (i, bit) = Self::position(n);
        self.bitmap.get(i).is_none_or(|b| b & bit == 0)
    }

    /// First block at or after `n` that was free at the start of the
    /// transaction but is in use now.
    #[must_use]
    pub fn find_changed_block(&self, mut n: u32) -> Option<u32> {
        while n <= self.last_block {
            if self.block_free_at_start(n) && !self.block_free_now(n) {
                return Some(n);
            }
            n += 1;
        }
        None
    }

    /// Recompute the highest block in use from the current bitmap.
    pub fn calculate_last_block(&mut self) {
        self.last_block = self
            .bitmap
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |i| (i * 8) as u32 + 7 - self.bitmap[i].leading_zeros());
    }

    /// Forget every allocation; used when the root was never written.
    pub fn clear_bit_map(&mut self) {
        self.bitmap.fill(0);
    }

    /// The transaction is over: the current bitmap becomes the start one.
    pub fn commit(&mut self) {
        self.bitmap0.clone_from(&self.bitmap);
        self.bit_map_low = 0;
    }

    fn extend_bit_map(&mut self) {
        let len = self.bitmap.len() + BIT_MAP_INC;
        self.bitmap.resize(len, 0);
        self.bitmap0.resize(len, 0);
    }

    const fn position(n: u32) -> (usize, u8) {
        ((n / 8) as usize, 1 << (n % 8))
    }
}

/// Read one base slot.
///
/// A missing slot is `None`. So is a slot that fails to parse: the other
/// slot is the recovery path, so this is logged rather than returned.
pub fn read_slot<S: Storage>(
    storage: &S,
    letter: BaseLetter,
) -> Result<Option<BaseRecord>, StorageError> {
    let Some(bytes) = storage.read_base(letter)? else {
        return Ok(None);
    };
    match BaseRecord::from_bytes(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(base = %letter.as_char(), error = %e, "ignoring unreadable base file");
            Ok(None)
        }
    }
}

/// Read both base slots, indexed by [`BaseLetter`].
pub fn read_both<S: Storage>(storage: &S) -> Result<[Option<BaseRecord>; 2], StorageError> {
    Ok([
        read_slot(storage, BaseLetter::A)?,
        read_slot(storage, BaseLetter::B)?,
    ])
}

/// The slot holding the newest valid record. B wins a tie.
#[must_use]
pub fn latest_of(bases: &[Option<BaseRecord>; 2]) -> Option<BaseLetter> {
    let mut best: Option<(BaseLetter, u32)> = None;
    for letter in [BaseLetter::A, BaseLetter::B] {
        if let Some(record) = &bases[letter.index()] {
            if best.is_none_or(|(_, revision)| record.revision >= revision) {
                best = Some((letter, record.revision));
            }
        }
    }
    best.map(|(letter, _)| letter)
}

/// The slot holding exactly `revision`, if any.
#[must_use]
pub fn slot_with_revision(bases: &[Option<BaseRecord>; 2], revision: u32) -> Option<BaseLetter> {
    [BaseLetter::A, BaseLetter::B]
        .into_iter()
        .find(|letter| bases[letter.index()].as_ref().is_some_and(|r| r.revision == revision))
}

/// Take the record out of a slot.
pub fn take_slot(bases: &mut [Option<BaseRecord>; 2], letter: BaseLetter) -> Option<BaseRecord> {
    bases[letter.index()].take()
}

/// Errors from parsing a base file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseError {
    /// Shorter than the fixed header, or length disagrees with the bitmap size.
    Truncated(usize),
    /// Not a base file.
    BadMagic,
    /// Written by an incompatible version.
    UnsupportedVersion(u32),
    /// Trailer checksum does not match the contents.
    ChecksumMismatch { stored: u32, computed: u32 },
    /// Block size is not a power of two in the allowed range.
    InvalidBlockSize(u32),
    /// Unknown compression strategy byte.
    UnknownCompression(u8),
}

impl std::fmt::Display for BaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated(len) => write!(f, "base file truncated ({len} bytes)"),
            Self::BadMagic => write!(f, "invalid magic number"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported base format version {v}"),
            Self::ChecksumMismatch { stored, computed } => write!(
                f,
                "base checksum mismatch (stored {stored:#010x}, computed {computed:#010x})"
            ),
            Self::InvalidBlockSize(size) => write!(f, "invalid block size {size}"),
            Self::UnknownCompression(b) => write!(f, "unknown compression strategy {b}"),
        }
    }
}

impl std::error::Error for BaseError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(revision: u32) -> BaseRecord {
        BaseRecord::new(revision, 2048, CompressionStrategy::Default)
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut base = record(7);
        base.root = 12;
        base.level = 2;
        base.item_count = 500;
        base.have_fakeroot = false;
        base.sequential = false;
        base.compression = CompressionStrategy::RunLength;
        for _ in 0..20 {
            base.next_free_block();
        }

        let parsed = BaseRecord::from_bytes(&base.to_bytes()).expect("parse");
        assert_eq!(parsed.revision, 7);
        assert_eq!(parsed.root, 12);
        assert_eq!(parsed.level, 2);
        assert_eq!(parsed.item_count, 500);
        assert!(!parsed.have_fakeroot);
        assert!(!parsed.sequential);
        assert_eq!(parsed.compression, CompressionStrategy::RunLength);
        assert_eq!(parsed.last_block(), 19);
        for n in 0..20 {
            assert!(!parsed.block_free_at_start(n));
        }
        assert!(parsed.block_free_at_start(20));
    }

    #[test]
    fn test_bitmap_is_trimmed() {
        let mut base = record(1);
        base.next_free_block();
        // Extending allocated a whole increment; only one byte is in use.
        assert_eq!(base.to_bytes().len(), offsets::BITMAP + 1 + CHECKSUM_LEN);
    }

    #[test]
    fn test_corruption_detected() {
        let mut bytes = record(3).to_bytes();
        bytes[offsets::ROOT] ^= 0x40;
        assert!(matches!(
            BaseRecord::from_bytes(&bytes),
            Err(BaseError::ChecksumMismatch { .. })
        ));

        assert!(matches!(
            BaseRecord::from_bytes(b"not a base"),
            Err(BaseError::Truncated(10))
        ));

        let mut bytes = record(3).to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            BaseRecord::from_bytes(&bytes),
            Err(BaseError::BadMagic)
        ));
    }

    #[test]
    fn test_blocks_freed_in_transaction_are_not_reused() {
        let mut base = record(1);
        let a = base.next_free_block();
        let b = base.next_free_block();
        base.commit();

        // b was in use at the start of this transaction.
        base.free_block(b);
        let c = base.next_free_block();
        assert_ne!(c, b);
        assert_ne!(c, a);

        base.commit();
        let d = base.next_free_block();
        assert_eq!(d, b, "reusable after commit");
    }

    #[test]
    fn test_block_allocated_in_transaction_is_reused() {
        let mut base = record(1);
        let a = base.next_free_block();
        base.free_block(a);
        assert_eq!(base.next_free_block(), a);
    }

    #[test]
    fn test_find_changed_blocks() {
        let mut base = record(1);
        for _ in 0..3 {
            base.next_free_block();
        }
        base.commit();
        base.free_block(1);
        let fresh = base.next_free_block();
        assert_eq!(fresh, 3);
        base.calculate_last_block();

        assert_eq!(base.find_changed_block(0), Some(3));
        assert_eq!(base.find_changed_block(4), None);
    }

    #[test]
    fn test_calculate_last_block() {
        let mut base = record(1);
        for _ in 0..10 {
            base.next_free_block();
        }
        base.free_block(9);
        base.free_block(8);
        base.calculate_last_block();
        assert_eq!(base.last_block(), 7);

        base.clear_bit_map();
        base.calculate_last_block();
        assert_eq!(base.last_block(), 0);
    }

    #[test]
    fn test_latest_of() {
        assert_eq!(latest_of(&[None, None]), None);
        assert_eq!(latest_of(&[Some(record(4)), None]), Some(BaseLetter::A));
        assert_eq!(
            latest_of(&[Some(record(4)), Some(record(5))]),
            Some(BaseLetter::B)
        );
        assert_eq!(
            latest_of(&[Some(record(6)), Some(record(5))]),
            Some(BaseLetter::A)
        );

        let bases = [Some(record(6)), Some(record(5))];
        assert_eq!(slot_with_revision(&bases, 5), Some(BaseLetter::B));
        assert_eq!(slot_with_revision(&bases, 4), None);
    }
}
