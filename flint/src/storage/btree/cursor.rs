//! Ordered iteration over a table.
//!
//! A cursor keeps its own path of block copies and reads through a shared
//! table reference, so many cursors can be open at once. Each write to
//! the table bumps its cursor version; a cursor that sees a new version
//! re-finds its current key before moving.

use crate::storage::btree::block::DIR_START;
use crate::storage::btree::item::{Item, ItemWriter, MAX_KEY_LEN};
use crate::storage::btree::path::{self, CursorLevel};
use crate::storage::btree::table::{Handle, Table, TableError};
use crate::storage::io::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagStatus {
    Unread,
    Compressed,
    Uncompressed,
}

/// A position in a table's key order.
///
/// Only whole entries are visited: the components of a long tag after the
/// first are stepped over.
pub struct Cursor {
    path: Vec<CursorLevel>,
    version: u64,
    is_positioned: bool,
    is_after_end: bool,
    tag_status: TagStatus,
    current_key: Vec<u8>,
    current_tag: Vec<u8>,
    kt: ItemWriter,
}

impl Cursor {
    /// A cursor over `table`, not yet positioned.
    pub fn new<S: Storage>(table: &Table<S>) -> Result<Self, TableError> {
        match table.core.handle {
            Handle::Closed => return Err(TableError::Closed),
            Handle::Unopened => {
                return Err(TableError::Opening(format!(
                    "table '{}' is not open",
                    table.core.name
                )));
            }
            Handle::Open => {}
        }
        let mut cursor = Self {
            path: Vec::new(),
            version: 0,
            is_positioned: false,
            is_after_end: false,
            tag_status: TagStatus::Unread,
            current_key: Vec::new(),
            current_tag: Vec::new(),
            kt: ItemWriter::new(table.core.block_size),
        };
        cursor.rebuild(table)?;
        Ok(cursor)
    }

    /// Start over from the table's current root.
    fn rebuild<S: Storage>(&mut self, table: &Table<S>) -> Result<(), TableError> {
        let level = table.core.level;
        let block_size = table.core.block_size;
        self.path.truncate(level + 1);
        for l in &mut self.path {
            l.reset();
        }
        while self.path.len() <= level {
            self.path.push(CursorLevel::new(block_size));
        }
        let root = table.path[level].n;
        path::BlockLoader::load(&mut table.snapshot(), &mut self.path, level, root)?;
        self.version = table.core.cursor_version;
        Ok(())
    }

    fn check_table<S: Storage>(&mut self, table: &Table<S>) -> Result<(), TableError> {
        if table.core.handle != Handle::Open {
            return Err(TableError::Closed);
        }
        if self.version != table.core.cursor_version {
            self.rebuild(table)?;
        }
        Ok(())
    }

    /// Key of the leaf item the path is on.
    fn read_current_key(&mut self) {
        let key = Item::at(&self.path[0].block, self.path[0].c).key();
        self.current_key.clear();
        self.current_key.extend_from_slice(key.bytes());
    }

    fn on_first_component(&self) -> bool {
        Item::at(&self.path[0].block, self.path[0].c).component_of() == 1
    }

    /// Position on `key`, or on the last entry before it.
    ///
    /// Returns whether `key` itself is present. Keys too long to store are
    /// never found. Every table has the empty key, so a key before
    /// everything positions there.
    pub fn find_entry<S: Storage>(&mut self, table: &Table<S>, key: &[u8]) -> Result<bool, TableError> {
        self.check_table(table)?;
        self.is_after_end = false;
        self.is_positioned = true;

        let (search, storable) = if key.len() > MAX_KEY_LEN {
            (&key[..MAX_KEY_LEN], false)
        } else {
            (key, true)
        };
        self.kt.form_key(search)?;
        let mut loader = table.snapshot();
        let found = path::find(&mut loader, &mut self.path, self.kt.key())? && storable;

        if !found {
            let mut at_start = false;
            if self.path[0].c < DIR_START {
                self.path[0].c = DIR_START;
                at_start = !path::prev(&mut loader, &mut self.path, 0)?;
            }
            if !at_start {
                while !self.on_first_component() {
                    if !path::prev(&mut loader, &mut self.path, 0)? {
                        self.is_positioned = false;
                        return Err(TableError::Corrupt(
                            "find_entry failed to find any entry at all".to_string(),
                        ));
                    }
                }
            }
        }

        if found {
            self.current_key.clear();
            self.current_key.extend_from_slice(key);
        } else {
            self.read_current_key();
        }
        self.tag_status = TagStatus::Unread;
        Ok(found)
    }

    /// Position on `key`, or on the first entry after it.
    ///
    /// Returns whether `key` itself is present. When nothing follows, the
    /// cursor ends up after the end.
    pub fn find_entry_ge<S: Storage>(
        &mut self,
        table: &Table<S>,
        key: &[u8],
    ) -> Result<bool, TableError> {
        self.check_table(table)?;
        self.is_after_end = false;
        self.is_positioned = true;

        let (search, storable) = if key.len() > MAX_KEY_LEN {
            (&key[..MAX_KEY_LEN], false)
        } else {
            (key, true)
        };
        self.kt.form_key(search)?;
        let mut loader = table.snapshot();
        let found = path::find(&mut loader, &mut self.path, self.kt.key())? && storable;

        self.tag_status = TagStatus::Unread;
        if found {
            self.current_key.clear();
            self.current_key.extend_from_slice(key);
            return Ok(true);
        }
        if !path::next(&mut loader, &mut self.path, 0)? {
            self.is_after_end = true;
            self.is_positioned = false;
            return Ok(false);
        }
        self.read_current_key();
        Ok(false)
    }

    /// Move to the next entry. Returns false, leaving the cursor after the
    /// end, when there is none.
    pub fn next<S: Storage>(&mut self, table: &Table<S>) -> Result<bool, TableError> {
        if self.is_after_end {
            return Ok(false);
        }
        if self.version != table.core.cursor_version {
            let key = std::mem::take(&mut self.current_key);
            self.find_entry(table, &key)?;
        }
        self.check_table(table)?;

        if self.tag_status == TagStatus::Unread {
            // Reading the tag already moved past its components.
            let mut loader = table.snapshot();
            loop {
                if !path::next(&mut loader, &mut self.path, 0)? {
                    self.is_positioned = false;
                    break;
                }
                if self.on_first_component() {
                    self.is_positioned = true;
                    break;
                }
            }
        }

        if !self.is_positioned {
            self.is_after_end = true;
            return Ok(false);
        }
        self.read_current_key();
        self.tag_status = TagStatus::Unread;
        Ok(true)
    }

    /// Move to the previous entry. Returns false at the start of the table.
    pub fn prev<S: Storage>(&mut self, table: &Table<S>) -> Result<bool, TableError> {
        if self.is_after_end {
            return Ok(false);
        }
        if self.version != table.core.cursor_version || !self.is_positioned {
            let key = std::mem::take(&mut self.current_key);
            if !self.find_entry(table, &key)? {
                // Already on the entry before the vanished key.
                return Ok(true);
            }
        } else if self.tag_status != TagStatus::Unread {
            // Back to the first component of the current entry.
            self.step_back_to_first_component(table)?;
            if !self.is_positioned {
                return Ok(false);
            }
        }

        self.step_back_to_first_component(table)?;
        if !self.is_positioned {
            return Ok(false);
        }
        self.read_current_key();
        self.tag_status = TagStatus::Unread;
        Ok(true)
    }

    fn step_back_to_first_component<S: Storage>(
        &mut self,
        table: &Table<S>,
    ) -> Result<(), TableError> {
        let mut loader = table.snapshot();
        loop {
            if !path::prev(&mut loader, &mut self.path, 0)? {
                self.is_positioned = false;
                return Ok(());
            }
            if self.on_first_component() {
                return Ok(());
            }
        }
    }

    /// Read the tag of the current entry into [`Cursor::current_tag`].
    ///
    /// With `keep_compressed`, a compressed tag is left compressed. Returns
    /// whether the tag as read is compressed.
    pub fn read_tag<S: Storage>(
        &mut self,
        table: &Table<S>,
        keep_compressed: bool,
    ) -> Result<bool, TableError> {
        if self.version != table.core.cursor_version {
            let key = std::mem::take(&mut self.current_key);
            self.find_entry(table, &key)?;
        }
        self.check_table(table)?;

        if self.tag_status == TagStatus::Unread {
            if !self.is_positioned {
                return Err(TableError::InvalidArgument(
                    "cursor is not on an entry".to_string(),
                ));
            }
            let mut loader = table.snapshot();
            let (tag, compressed) = path::read_tag(&mut loader, &mut self.path)?;
            if compressed && !keep_compressed {
                self.current_tag = table.core.inflate(&tag)?;
                self.tag_status = TagStatus::Uncompressed;
            } else {
                self.current_tag = tag;
                self.tag_status = if compressed {
                    TagStatus::Compressed
                } else {
                    TagStatus::Uncompressed
                };
            }
            // The path now sits on the last component; step past it so
            // `next` lands on the following entry directly.
            self.is_positioned = path::next(&mut loader, &mut self.path, 0)?;
        }
        Ok(self.tag_status == TagStatus::Compressed)
    }

    #[must_use]
    pub fn current_key(&self) -> &[u8] {
        &self.current_key
    }

    /// Tag read by the last [`Cursor::read_tag`].
    #[must_use]
    pub fn current_tag(&self) -> &[u8] {
        &self.current_tag
    }

    /// Whether the cursor has run off the end of the table.
    #[must_use]
    pub const fn after_end(&self) -> bool {
        self.is_after_end
    }
}

/// A cursor that can also delete the entry it is on.
pub struct MutableCursor {
    cursor: Cursor,
}

impl MutableCursor {
    pub fn new<S: Storage>(table: &Table<S>) -> Result<Self, TableError> {
        Ok(Self {
            cursor: Cursor::new(table)?,
        })
    }

    /// Delete the current entry and move to the one after it.
    ///
    /// Returns false if nothing follows.
    pub fn del<S: Storage>(&mut self, table: &mut Table<S>) -> Result<bool, TableError> {
        let key = self.cursor.current_key.clone();
        table.del(&key)?;
        if !self.cursor.find_entry_ge(table, &key)? {
            return Ok(self.cursor.is_positioned);
        }
        self.cursor.next(table)
    }
}

impl std::ops::Deref for MutableCursor {
    type Target = Cursor;

    fn deref(&self) -> &Cursor {
        &self.cursor
    }
}

impl std::ops::DerefMut for MutableCursor {
    fn deref_mut(&mut self) -> &mut Cursor {
        &mut self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::simulation::SimulatedStorage;

    fn table_with(keys: &[&str]) -> Table<SimulatedStorage> {
        let config = TableConfig {
            block_size: 2048,
            ..TableConfig::default()
        };
        let mut table = Table::new("cursor", SimulatedStorage::new(21), &config);
        table.create_and_open(2048).expect("create");
        for key in keys {
            table
                .add(key.as_bytes(), format!("tag of {key}").as_bytes(), false)
                .expect("add");
        }
        table
    }

    #[test]
    fn test_find_entry_exact_and_before() {
        let table = table_with(&["apple", "cherry"]);
        let mut cursor = table.cursor().expect("cursor");

        assert!(cursor.find_entry(&table, b"apple").expect("find"));
        assert_eq!(cursor.current_key(), b"apple");

        assert!(!cursor.find_entry(&table, b"banana").expect("find"));
        assert_eq!(cursor.current_key(), b"apple");

        // Before every real key: the empty entry.
        assert!(!cursor.find_entry(&table, b"aaa").expect("find"));
        assert_eq!(cursor.current_key(), b"");
    }

    #[test]
    fn test_find_entry_ge() {
        let table = table_with(&["apple", "cherry"]);
        let mut cursor = table.cursor().expect("cursor");

        assert!(!cursor.find_entry_ge(&table, b"banana").expect("find"));
        assert_eq!(cursor.current_key(), b"cherry");

        assert!(!cursor.find_entry_ge(&table, b"zebra").expect("find"));
        assert!(cursor.after_end());
        assert!(!cursor.next(&table).expect("next"));
    }

    #[test]
    fn test_iterate_and_read_tags() {
        let table = table_with(&["b", "a", "c"]);
        let mut cursor = table.cursor().expect("cursor");
        cursor.find_entry(&table, b"").expect("find");

        let mut seen = Vec::new();
        while cursor.next(&table).expect("next") {
            assert!(!cursor.read_tag(&table, false).expect("read tag"));
            seen.push((cursor.current_key().to_vec(), cursor.current_tag().to_vec()));
        }
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), b"tag of a".to_vec()),
                (b"b".to_vec(), b"tag of b".to_vec()),
                (b"c".to_vec(), b"tag of c".to_vec()),
            ]
        );
    }

    #[test]
    fn test_prev_after_read_tag() {
        let table = table_with(&["a", "b", "c"]);
        let mut cursor = table.cursor().expect("cursor");
        assert!(cursor.find_entry(&table, b"c").expect("find"));
        cursor.read_tag(&table, false).expect("read tag");
        assert!(cursor.prev(&table).expect("prev"));
        assert_eq!(cursor.current_key(), b"b");
        assert!(cursor.prev(&table).expect("prev"));
        assert!(cursor.prev(&table).expect("prev"));
        assert_eq!(cursor.current_key(), b"");
        assert!(!cursor.prev(&table).expect("prev at start"));
    }

    #[test]
    fn test_cursor_survives_table_changes() {
        let mut table = table_with(&["a", "c", "e"]);
        let mut cursor = table.cursor().expect("cursor");
        assert!(cursor.find_entry(&table, b"c").expect("find"));

        table.add(b"d", b"tag of d", false).expect("add");
        assert!(cursor.next(&table).expect("next"));
        assert_eq!(cursor.current_key(), b"d");

        table.del(b"d").expect("del");
        assert!(cursor.next(&table).expect("next"));
        assert_eq!(cursor.current_key(), b"e");
    }

    #[test]
    fn test_mutable_cursor_del() {
        let mut table = table_with(&["a", "b", "c"]);
        let mut cursor = MutableCursor::new(&table).expect("cursor");
        assert!(cursor.find_entry(&table, b"b").expect("find"));
        assert!(cursor.del(&mut table).expect("del"));
        assert_eq!(cursor.current_key(), b"c");
        assert!(!table.key_exists(b"b").expect("exists"));
        assert!(!cursor.del(&mut table).expect("del last"));
        assert_eq!(table.get_entry_count(), 1);
    }

    #[test]
    fn test_long_key_is_never_found() {
        let table = table_with(&["a"]);
        let mut cursor = table.cursor().expect("cursor");
        let long = vec![b'a'; MAX_KEY_LEN + 10];
        assert!(!cursor.find_entry(&table, &long).expect("find"));
        assert_eq!(cursor.current_key(), b"a");
    }
}
