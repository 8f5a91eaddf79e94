//! Root-to-leaf navigation.
//!
//! A path holds one [`CursorLevel`] per tree level, leaf first and root
//! last. The table's built-in cursor and every external [`Cursor`] walk
//! the tree through the same functions here; they differ only in how a
//! block gets into a level, which is the [`BlockLoader`]'s job.
//!
//! [`Cursor`]: crate::storage::btree::Cursor

use crate::storage::btree::TableError;
use crate::storage::btree::block::{self, D2, DIR_START};
use crate::storage::btree::item::{Item, Key};

/// Block number of a level that holds no block.
pub const BLK_UNUSED: u32 = u32::MAX;

/// One level of a path: a block buffer, its number and a directory position.
pub struct CursorLevel {
    pub block: Vec<u8>,
    pub n: u32,
    /// Directory entry being visited; 0 when unpositioned.
    pub c: usize,
    /// The buffer differs from the block on disk and must be written out.
    pub rewrite: bool,
}

impl CursorLevel {
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block: vec![0u8; block_size],
            n: BLK_UNUSED,
            c: 0,
            rewrite: false,
        }
    }

    /// Forget the block held here without touching the buffer size.
    pub const fn reset(&mut self) {
        self.n = BLK_UNUSED;
        self.c = 0;
        self.rewrite = false;
    }
}

/// Fills path levels with blocks.
pub trait BlockLoader {
    /// Make `path[j]` hold block `n`.
    ///
    /// Does nothing if it already does.
    fn load(&mut self, path: &mut [CursorLevel], j: usize, n: u32) -> Result<(), TableError>;
}

/// Checks shared by every loader once block `n` sits in `path[j]`.
///
/// A block newer than its parent means a writer has reused the space since
/// the parent was read: a reader must reopen, a writer has found corruption.
pub fn check_loaded(
    path: &[CursorLevel],
    j: usize,
    n: u32,
    writable: bool,
) -> Result<(), TableError> {
    let p = &path[j].block;
    if j + 1 < path.len() && block::revision(p) > block::revision(&path[j + 1].block) {
        return Err(TableError::overwritten(writable));
    }
    if block::level(p) != j {
        return Err(TableError::Corrupt(format!(
            "expected block {n} to be level {j}, not {}",
            block::level(p)
        )));
    }
    Ok(())
}

/// Directory entry of the last item in `p` whose key is `<= key`.
///
/// `c` is a hint from a previous search of the same block. In a leaf the
/// result may be `DIR_START - D2`, meaning every item is greater.
#[must_use]
pub fn find_in_block(p: &[u8], key: Key<'_>, leaf: bool, c: usize) -> usize {
    let mut i = if leaf { DIR_START - D2 } else { DIR_START };
    let mut j = block::dir_end(p);

    if c >= DIR_START {
        if c < j && i < c && Item::at(p, c).key() <= key {
            i = c;
        }
        let c = c + D2;
        if c < j && i < c && key < Item::at(p, c).key() {
            j = c;
        }
    }

    while j - i > D2 {
        let k = i + ((j - i) / (D2 * 2)) * D2;
        if key < Item::at(p, k).key() {
            j = k;
        } else {
            i = k;
        }
    }
    i
}

/// Descend from the root to the leaf where `key` is or would be.
///
/// The root level must already be loaded. Returns whether the leaf holds
/// `key` exactly.
pub fn find<L: BlockLoader>(
    loader: &mut L,
    path: &mut [CursorLevel],
    key: Key<'_>,
) -> Result<bool, TableError> {
    let level = path.len() - 1;
    for j in (1..=level).rev() {
        let c = find_in_block(&path[j].block, key, false, path[j].c);
        path[j].c = c;
        let child = Item::at(&path[j].block, c).block_given_by();
        loader.load(path, j - 1, child)?;
    }
    let p = &path[0].block;
    let c = find_in_block(p, key, true, path[0].c);
    path[0].c = c;
    Ok(c >= DIR_START && Item::at(p, c).key() == key)
}

/// Step level `j` to the previous item, climbing as far as needed.
///
/// Returns false at the start of the table.
pub fn prev<L: BlockLoader>(
    loader: &mut L,
    path: &mut [CursorLevel],
    j: usize,
) -> Result<bool, TableError> {
    let mut c = path[j].c;
    if c <= DIR_START {
        if j + 1 == path.len() || !prev(loader, path, j + 1)? {
            return Ok(false);
        }
        c = block::dir_end(&path[j].block);
    }
    c -= D2;
    path[j].c = c;
    if j > 0 {
        let child = Item::at(&path[j].block, c).block_given_by();
        loader.load(path, j - 1, child)?;
    }
    Ok(true)
}

/// Step level `j` to the next item, climbing as far as needed.
///
/// Returns false at the end of the table.
pub fn next<L: BlockLoader>(
    loader: &mut L,
    path: &mut [CursorLevel],
    j: usize,
) -> Result<bool, TableError> {
    let mut c = path[j].c + D2;
    if c >= block::dir_end(&path[j].block) {
        if j + 1 == path.len() || !next(loader, path, j + 1)? {
            return Ok(false);
        }
        c = DIR_START;
    }
    path[j].c = c;
    if j > 0 {
        let child = Item::at(&path[j].block, c).block_given_by();
        loader.load(path, j - 1, child)?;
    }
    Ok(true)
}

/// Join every component of the tag whose first item the leaf level is on.
///
/// Leaves the leaf level on the last component. Returns the raw bytes and
/// whether they are compressed.
pub fn read_tag<L: BlockLoader>(
    loader: &mut L,
    path: &mut [CursorLevel],
) -> Result<(Vec<u8>, bool), TableError> {
    let mut tag = Vec::new();
    let (components, compressed) = {
        let item = Item::at(&path[0].block, path[0].c);
        item.append_chunk(&mut tag);
        (item.components_of(), item.is_compressed())
    };
    for _ in 1..components {
        if !next(loader, path, 0)? {
            return Err(TableError::Corrupt(
                "unexpected end of table when reading continuation of tag".to_string(),
            ));
        }
        Item::at(&path[0].block, path[0].c).append_chunk(&mut tag);
    }
    Ok((tag, compressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::item::ItemWriter;

    const SIZE: usize = 2048;

    fn leaf(keys: &[&[u8]]) -> Vec<u8> {
        let mut p = vec![0u8; SIZE];
        block::init(&mut p, 0, 1);
        for (i, key) in keys.iter().enumerate() {
            let mut kt = ItemWriter::new(SIZE);
            kt.form_key(key).expect("form key");
            kt.set_components_of(1);
            kt.set_tag(b"t", false);
            block::insert_item(&mut p, kt.as_bytes(), DIR_START + i * D2);
        }
        p
    }

    fn key_of(k: &[u8]) -> ItemWriter {
        let mut kt = ItemWriter::new(SIZE);
        kt.form_key(k).expect("form key");
        kt
    }

    #[test]
    fn test_find_in_block_positions() {
        let p = leaf(&[b"b", b"d", b"f", b"h"]);
        let at = |k: &[u8], hint| find_in_block(&p, key_of(k).key(), true, hint);

        assert_eq!(at(b"a", 0), DIR_START - D2);
        assert_eq!(at(b"b", 0), DIR_START);
        assert_eq!(at(b"c", 0), DIR_START);
        assert_eq!(at(b"h", 0), DIR_START + 3 * D2);
        assert_eq!(at(b"z", 0), DIR_START + 3 * D2);
    }

    #[test]
    fn test_find_in_block_hint_does_not_change_result() {
        let keys: Vec<Vec<u8>> = (0..40).map(|i| format!("k{i:03}").into_bytes()).collect();
        let refs: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        let p = leaf(&refs);

        let target = key_of(b"k017x");
        let expected = find_in_block(&p, target.key(), true, 0);
        assert_eq!(expected, DIR_START + 17 * D2);
        for hint in (DIR_START..block::dir_end(&p)).step_by(D2) {
            assert_eq!(find_in_block(&p, target.key(), true, hint), expected);
        }
    }

    struct NoLoads;

    impl BlockLoader for NoLoads {
        fn load(&mut self, _: &mut [CursorLevel], _: usize, _: u32) -> Result<(), TableError> {
            Err(TableError::Corrupt("single-level path".to_string()))
        }
    }

    #[test]
    fn test_next_prev_within_single_leaf() {
        let mut level = CursorLevel::new(SIZE);
        level.block = leaf(&[b"a", b"b"]);
        level.c = DIR_START;
        let mut path = vec![level];

        assert!(next(&mut NoLoads, &mut path, 0).expect("next"));
        assert_eq!(path[0].c, DIR_START + D2);
        assert!(!next(&mut NoLoads, &mut path, 0).expect("next at end"));
        assert!(prev(&mut NoLoads, &mut path, 0).expect("prev"));
        assert!(!prev(&mut NoLoads, &mut path, 0).expect("prev at start"));
        assert_eq!(path[0].c, DIR_START);
    }

    #[test]
    fn test_find_single_level() {
        let mut level = CursorLevel::new(SIZE);
        level.block = leaf(&[b"a", b"c"]);
        let mut path = vec![level];

        assert!(find(&mut NoLoads, &mut path, key_of(b"c").key()).expect("find"));
        assert!(!find(&mut NoLoads, &mut path, key_of(b"b").key()).expect("find"));
        assert_eq!(path[0].c, DIR_START);
    }
}
