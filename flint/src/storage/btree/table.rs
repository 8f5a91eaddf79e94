//! The table: a copy-on-write B-tree of key/tag pairs.
//!
//! A table owns its storage, the open base record and a built-in cursor
//! (`path`) holding one block per level. Modified blocks are only written
//! when they drop out of the path, on [`Table::flush_db`], or on commit;
//! a committed block is never overwritten within the next transaction.

#![allow(clippy::cast_possible_truncation)]

use std::cell::RefCell;
use std::io::Write;

use tracing::{debug, warn};

use crate::config::TableConfig;
use crate::storage::base::{self, BaseError, BaseLetter, BaseRecord};
use crate::storage::btree::block::{self, BlockError, D2, DIR_START, is_valid_block_size};
use crate::storage::btree::cursor::Cursor;
use crate::storage::btree::item::{
    C2, I2, ItemWriter, K1, Key, KeyTooLong, MAX_ITEM_SIZE, MAX_KEY_LEN,
};
use crate::storage::btree::path::{self, BLK_UNUSED, BlockLoader, CursorLevel};
use crate::storage::changes;
use crate::storage::compression::{CompressionError, CompressionStrategy, CompressionStream};
use crate::storage::file::FileStorage;
use crate::storage::io::{Storage, StorageError};

/// Most levels a tree may grow to.
pub const MAX_LEVELS: usize = 10;

/// Items that must fit in a block, used to size the largest item.
const BLOCK_CAPACITY: usize = 4;

/// Appends at the same place needed before splits switch to the
/// insertion point.
pub(super) const SEQ_START_POINT: i32 = -10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Handle {
    /// Not open; a lazy table with no files stays here until its first add.
    Unopened,
    Open,
    /// Closed for good.
    Closed,
}

/// Work a caller wants done inside every commit, before the table's own
/// blocks are flushed.
///
/// A table buffering derived updates (merged word frequencies, say) uses
/// this to write them out as part of the same revision.
pub trait CommitHook<S: Storage> {
    fn before_commit(&mut self, table: &mut Table<S>) -> Result<(), TableError>;
}

/// Everything except the built-in cursor, so cursor levels can be borrowed
/// separately from the state used to fill them.
pub(super) struct TableCore<S: Storage> {
    pub(super) name: String,
    pub(super) storage: S,
    pub(super) writable: bool,
    pub(super) lazy: bool,
    pub(super) handle: Handle,
    pub(super) block_size: usize,
    pub(super) max_item_size: usize,
    /// Strategy for new tables; an opened table uses the one it was
    /// created with.
    pub(super) compression: CompressionStrategy,
    pub(super) revision_number: u32,
    pub(super) latest_revision_number: u32,
    pub(super) item_count: u64,
    pub(super) level: usize,
    pub(super) root: u32,
    pub(super) faked_root_block: bool,
    pub(super) sequential: bool,
    /// Both base files are valid, so the first block write must remove the
    /// older one.
    pub(super) both_bases: bool,
    pub(super) base_letter: BaseLetter,
    pub(super) base: BaseRecord,
    pub(super) modified: bool,
    /// Bumped whenever the tree changes; cursors compare it to spot stale
    /// paths.
    pub(super) cursor_version: u64,
    pub(super) stream: RefCell<CompressionStream>,
}

impl<S: Storage> TableCore<S> {
    /// Read and validate block `n`.
    pub(super) fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<(), TableError> {
        if self.handle == Handle::Closed {
            return Err(TableError::Closed);
        }
        self.storage.read_block(n, buf)?;
        block::validate(buf).map_err(|e| {
            TableError::Corrupt(format!("block {n} of table '{}': {e}", self.name))
        })
    }

    /// Seal and write block `n`.
    pub(super) fn write_block(&mut self, n: u32, buf: &mut [u8]) -> Result<(), TableError> {
        if self.handle == Handle::Closed {
            return Err(TableError::Closed);
        }
        if self.both_bases {
            // The older base would point at blocks about to be reused.
            self.storage.remove_base(self.base_letter.other())?;
            self.both_bases = false;
            self.latest_revision_number = self.revision_number;
        }
        block::seal(buf);
        self.storage.write_block(n, buf)?;
        Ok(())
    }

    pub(super) fn inflate(&self, tag: &[u8]) -> Result<Vec<u8>, TableError> {
        Ok(self.stream.borrow_mut().decompress(tag)?)
    }

    fn set_max_item_size(&mut self) {
        let size = (self.block_size - DIR_START - BLOCK_CAPACITY * D2) / BLOCK_CAPACITY;
        self.max_item_size = size.min(MAX_ITEM_SIZE);
    }

    fn check_not_closed(&self) -> Result<(), TableError> {
        if self.handle == Handle::Closed {
            Err(TableError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> Result<(), TableError> {
        self.check_not_closed()?;
        if self.writable {
            Ok(())
        } else {
            Err(TableError::InvalidArgument(format!(
                "table '{}' is open read-only",
                self.name
            )))
        }
    }
}

impl<S: Storage> BlockLoader for TableCore<S> {
    /// Loader for the built-in cursor: a level giving up a modified block
    /// writes it out first.
    fn load(&mut self, path: &mut [CursorLevel], j: usize, n: u32) -> Result<(), TableError> {
        if path[j].n == n {
            return Ok(());
        }
        if path[j].rewrite {
            self.write_block(path[j].n, &mut path[j].block)?;
            path[j].rewrite = false;
        }
        path[j].n = BLK_UNUSED;
        self.read_block(n, &mut path[j].block)?;
        path[j].n = n;
        path::check_loaded(path, j, n, self.writable)
    }
}

/// Loader for external cursors: blocks the built-in cursor holds are
/// copied from it, everything else is read from storage.
pub(super) struct SnapshotLoader<'a, S: Storage> {
    pub(super) core: &'a TableCore<S>,
    pub(super) builtin: &'a [CursorLevel],
}

impl<S: Storage> BlockLoader for SnapshotLoader<'_, S> {
    fn load(&mut self, path: &mut [CursorLevel], j: usize, n: u32) -> Result<(), TableError> {
        if path[j].n == n {
            return Ok(());
        }
        path[j].n = BLK_UNUSED;
        match self.builtin.get(j) {
            Some(level) if level.n == n => path[j].block.copy_from_slice(&level.block),
            _ => self.core.read_block(n, &mut path[j].block)?,
        }
        path[j].n = n;
        path::check_loaded(path, j, n, self.core.writable)
    }
}

/// A B-tree table of key/tag pairs.
pub struct Table<S: Storage = FileStorage> {
    pub(super) core: TableCore<S>,
    /// Built-in cursor, leaf first; exactly `level + 1` entries while open.
    pub(super) path: Vec<CursorLevel>,
    /// Item being added or searched for.
    pub(super) kt: ItemWriter,
    /// Lower half of a block being split.
    pub(super) split_p: Vec<u8>,
    /// Compaction space.
    pub(super) scratch: Vec<u8>,
    /// Below zero while warming up to sequential mode.
    pub(super) seq_count: i32,
    /// Block and directory entry of the last leaf insertion.
    pub(super) changed_n: u32,
    pub(super) changed_c: usize,
    pub(super) full_compaction: bool,
    hook: Option<Box<dyn CommitHook<S>>>,
}

impl<S: Storage> Table<S> {
    /// A writable table named `name` over `storage`. Nothing is opened yet.
    pub fn new(name: impl Into<String>, storage: S, config: &TableConfig) -> Self {
        Self::with_mode(name.into(), storage, config, true)
    }

    /// A read-only table named `name` over `storage`. Nothing is opened yet.
    pub fn new_read_only(name: impl Into<String>, storage: S, config: &TableConfig) -> Self {
        Self::with_mode(name.into(), storage, config, false)
    }

    /// Construct a reader and open its latest revision.
    pub fn open_read_only(
        name: impl Into<String>,
        storage: S,
        config: &TableConfig,
    ) -> Result<Self, TableError> {
        let mut table = Self::new_read_only(name, storage, config);
        table.open()?;
        Ok(table)
    }

    fn with_mode(name: String, storage: S, config: &TableConfig, writable: bool) -> Self {
        let mut core = TableCore {
            name,
            storage,
            writable,
            lazy: config.lazy,
            handle: Handle::Unopened,
            block_size: config.block_size,
            max_item_size: 0,
            compression: config.compression,
            revision_number: 0,
            latest_revision_number: 0,
            item_count: 0,
            level: 0,
            root: 0,
            faked_root_block: true,
            sequential: true,
            both_bases: false,
            base_letter: BaseLetter::A,
            base: BaseRecord::new(0, config.block_size as u32, config.compression),
            modified: false,
            cursor_version: 0,
            stream: RefCell::new(CompressionStream::new(config.compression)),
        };
        if is_valid_block_size(core.block_size) {
            core.set_max_item_size();
        }
        Self {
            core,
            path: Vec::new(),
            kt: ItemWriter::new(0),
            split_p: Vec::new(),
            scratch: Vec::new(),
            seq_count: SEQ_START_POINT,
            changed_n: 0,
            changed_c: DIR_START,
            full_compaction: config.full_compaction,
            hook: None,
        }
    }

    /// Run `hook` at the start of every commit.
    pub fn set_commit_hook(&mut self, hook: Box<dyn CommitHook<S>>) {
        self.hook = Some(hook);
    }

    // ========== Opening ==========

    /// Create an empty table with blocks of `block_size` and open it.
    ///
    /// Existing files are replaced. No block is written until the first
    /// change is flushed; until then the root is faked in memory.
    pub fn create_and_open(&mut self, block_size: usize) -> Result<(), TableError> {
        self.core.check_writable()?;
        if !is_valid_block_size(block_size) {
            return Err(TableError::InvalidArgument(format!(
                "invalid block size {block_size}: must be a power of two between 2048 and 65536"
            )));
        }
        self.close(false);

        self.core.block_size = block_size;
        self.core.set_max_item_size();
        let record =
            BaseRecord::new(self.core.revision_number, block_size as u32, self.core.compression);
        self.core.storage.write_base(BaseLetter::A, &record.to_bytes())?;
        self.core.storage.remove_base(BaseLetter::B)?;

        self.do_open_to_write(None, true)?;
        debug!(
            table = %self.core.name,
            revision = self.core.revision_number,
            block_size,
            "created table"
        );
        Ok(())
    }

    /// Open the latest revision.
    pub fn open(&mut self) -> Result<(), TableError> {
        self.core.check_not_closed()?;
        self.close(false);
        let opened = if self.core.writable {
            self.do_open_to_write(None, false)?
        } else {
            self.do_open_to_read(None)?
        };
        if !opened {
            return Err(TableError::Opening(format!(
                "failed to open table '{}'",
                self.core.name
            )));
        }
        Ok(())
    }

    /// Open exactly `revision`. Returns false if neither base holds it.
    pub fn open_at(&mut self, revision: u32) -> Result<bool, TableError> {
        self.core.check_not_closed()?;
        self.close(false);
        let opened = if self.core.writable {
            self.do_open_to_write(Some(revision), false)?
        } else {
            self.do_open_to_read(Some(revision))?
        };
        if !opened {
            self.close(false);
        }
        Ok(opened)
    }

    fn open_data_file(&mut self, create: bool, revision: Option<u32>) -> Result<bool, TableError> {
        match self.core.storage.open_data(create, self.core.writable) {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound(_)) if self.core.lazy && !create => {
                // A lazy table with no files is an empty table.
                self.core.revision_number = revision.unwrap_or(0);
                self.core.latest_revision_number = self.core.revision_number;
                self.core.item_count = 0;
                Ok(false)
            }
            Err(e) => Err(TableError::Opening(format!(
                "couldn't open table '{}': {e}",
                self.core.name
            ))),
        }
    }

    fn do_open_to_write(&mut self, revision: Option<u32>, create: bool) -> Result<bool, TableError> {
        if !self.open_data_file(create, revision)? {
            return Ok(true);
        }
        if !self.basic_open(revision)? {
            self.core.storage.close_data();
            return Ok(false);
        }
        self.core.handle = Handle::Open;
        self.allocate_buffers();
        self.read_root()?;
        self.reset_sequential_state();
        debug!(
            table = %self.core.name,
            revision = self.core.revision_number,
            level = self.core.level,
            items = self.core.item_count,
            "opened table for writing"
        );
        Ok(true)
    }

    fn do_open_to_read(&mut self, revision: Option<u32>) -> Result<bool, TableError> {
        if !self.open_data_file(false, revision)? {
            return Ok(true);
        }
        if !self.basic_open(revision)? {
            self.core.storage.close_data();
            return Ok(false);
        }
        self.core.handle = Handle::Open;
        self.allocate_buffers();
        self.read_root()?;
        debug!(
            table = %self.core.name,
            revision = self.core.revision_number,
            level = self.core.level,
            items = self.core.item_count,
            "opened table for reading"
        );
        Ok(true)
    }

    /// Pick and load a base record. Returns false if `revision` is not in
    /// either base.
    fn basic_open(&mut self, revision: Option<u32>) -> Result<bool, TableError> {
        let mut bases = base::read_both(&self.core.storage).map_err(|e| {
            TableError::Opening(format!("couldn't read base files of '{}': {e}", self.core.name))
        })?;
        let Some(latest) = base::latest_of(&bases) else {
            return Err(TableError::Opening(format!(
                "no valid base file for table '{}'",
                self.core.name
            )));
        };
        let letter = match revision {
            None => latest,
            Some(r) => match base::slot_with_revision(&bases, r) {
                Some(letter) => letter,
                None => return Ok(false),
            },
        };

        let both_bases = bases.iter().all(Option::is_some);
        let other_revision = bases[letter.other().index()].as_ref().map(|b| b.revision);
        let Some(record) = base::take_slot(&mut bases, letter) else {
            return Ok(false);
        };
        if record.level as usize >= MAX_LEVELS {
            return Err(TableError::Corrupt(format!(
                "base {} of table '{}' claims {} levels",
                letter.as_char(),
                self.core.name,
                record.level
            )));
        }

        self.core.both_bases = both_bases;
        self.core.base_letter = letter;
        self.load_base(record);
        self.core.latest_revision_number = self
            .core
            .revision_number
            .max(other_revision.unwrap_or(0));
        self.core.cursor_version += 1;
        Ok(true)
    }

    fn load_base(&mut self, record: BaseRecord) {
        let core = &mut self.core;
        core.revision_number = record.revision;
        core.block_size = record.block_size as usize;
        core.set_max_item_size();
        core.root = record.root;
        core.level = record.level as usize;
        core.item_count = record.item_count;
        core.faked_root_block = record.have_fakeroot;
        core.sequential = record.sequential;
        if core.compression != record.compression {
            core.stream = RefCell::new(CompressionStream::new(record.compression));
        }
        core.compression = record.compression;
        core.base = record;
        core.modified = false;
    }

    fn allocate_buffers(&mut self) {
        let block_size = self.core.block_size;
        self.path = (0..=self.core.level).map(|_| CursorLevel::new(block_size)).collect();
        self.kt = ItemWriter::new(block_size);
        self.split_p = vec![0u8; block_size];
        self.scratch = vec![0u8; block_size];
    }

    fn reset_sequential_state(&mut self) {
        self.changed_n = 0;
        self.changed_c = DIR_START;
        self.seq_count = SEQ_START_POINT;
        if self.full_compaction {
            self.seq_count = 0;
        }
    }

    /// Load the root into the top level of the built-in cursor.
    fn read_root(&mut self) -> Result<(), TableError> {
        if self.core.faked_root_block {
            // An empty leaf holding just the null entry.
            let revision = if self.core.writable {
                self.core.latest_revision_number + 1
            } else {
                0
            };
            let n = if self.core.writable {
                self.core.base.next_free_block()
            } else {
                0
            };
            let level = &mut self.path[0];
            block::init(&mut level.block, 0, revision);
            let mut item = ItemWriter::new(I2 + K1 + 2 * C2);
            item.fake_root_item();
            block::insert_item(&mut level.block, item.as_bytes(), DIR_START);
            level.n = n;
            level.c = 0;
            level.rewrite = false;
            return Ok(());
        }

        let level = self.core.level;
        let root = self.core.root;
        self.core.load(&mut self.path, level, root)?;
        if block::revision(&self.path[level].block) > self.core.revision_number {
            return Err(TableError::overwritten(self.core.writable));
        }
        Ok(())
    }

    // ========== Lifecycle ==========

    /// Drop the open state. With `permanent`, every later call fails with
    /// [`TableError::Closed`].
    pub fn close(&mut self, permanent: bool) {
        if self.core.handle == Handle::Open {
            self.core.storage.close_data();
            debug!(table = %self.core.name, permanent, "closed table");
        }
        if permanent {
            self.core.handle = Handle::Closed;
        } else if self.core.handle != Handle::Closed {
            self.core.handle = Handle::Unopened;
        }
        self.path.clear();
        self.core.modified = false;
    }

    /// Write out every modified block of the built-in cursor.
    pub fn flush_db(&mut self) -> Result<(), TableError> {
        self.core.check_writable()?;
        if self.core.handle != Handle::Open {
            return Ok(());
        }
        for j in (0..=self.core.level).rev() {
            let level = &mut self.path[j];
            if level.rewrite {
                self.core.write_block(level.n, &mut level.block)?;
            }
        }
        if self.core.modified {
            self.core.faked_root_block = false;
        }
        Ok(())
    }

    /// Make the current state revision `revision`, which must be newer than
    /// the open one.
    ///
    /// On failure the table is closed and the previous revision stays on
    /// disk untouched.
    pub fn commit(&mut self, revision: u32) -> Result<(), TableError> {
        self.commit_inner(revision, None)
    }

    /// Like [`Table::commit`], also appending the new base file to a
    /// changeset.
    pub fn commit_with_changes(
        &mut self,
        revision: u32,
        changes: &mut dyn Write,
    ) -> Result<(), TableError> {
        self.commit_inner(revision, Some(changes))
    }

    fn commit_inner(
        &mut self,
        revision: u32,
        changes: Option<&mut dyn Write>,
    ) -> Result<(), TableError> {
        self.core.check_writable()?;
        if revision <= self.core.revision_number {
            return Err(TableError::InvalidArgument(format!(
                "new revision {revision} must be greater than {}",
                self.core.revision_number
            )));
        }

        if let Some(mut hook) = self.hook.take() {
            let result = hook.before_commit(self);
            self.hook = Some(hook);
            result?;
        }

        if self.core.handle == Handle::Unopened {
            self.core.revision_number = revision;
            self.core.latest_revision_number = revision;
            return Ok(());
        }

        match self.commit_open(revision, changes) {
            Ok(()) => {
                debug!(
                    table = %self.core.name,
                    revision,
                    level = self.core.level,
                    items = self.core.item_count,
                    "committed table"
                );
                Ok(())
            }
            Err(e) => {
                warn!(table = %self.core.name, revision, error = %e, "commit failed");
                self.close(false);
                Err(e)
            }
        }
    }

    fn commit_open(
        &mut self,
        revision: u32,
        changes: Option<&mut dyn Write>,
    ) -> Result<(), TableError> {
        self.flush_db()?;

        let core = &mut self.core;
        if core.faked_root_block {
            core.base.clear_bit_map();
        }
        let root = self.path[core.level].n;
        core.base.revision = revision;
        core.base.root = root;
        core.base.level = core.level as u32;
        core.base.item_count = core.item_count;
        core.base.have_fakeroot = core.faked_root_block;
        core.base.sequential = core.sequential;
        core.base.compression = core.compression;
        core.base.calculate_last_block();

        let letter = core.base_letter.other();
        let bytes = core.base.to_bytes();

        // Blocks must be durable before the base that points at them.
        core.storage.sync()?;
        if let Some(out) = changes {
            changes::write_base_entry(out, &core.name, letter, &bytes)?;
        }
        core.storage.write_base(letter, &bytes)?;

        core.base_letter = letter;
        core.both_bases = true;
        core.revision_number = revision;
        core.latest_revision_number = revision;
        core.root = root;
        core.modified = false;
        core.base.commit();
        for level in &mut self.path {
            level.reset();
        }
        self.read_root()?;
        self.reset_sequential_state();
        Ok(())
    }

    /// Throw away every change since the last commit.
    pub fn cancel(&mut self) -> Result<(), TableError> {
        self.core.check_writable()?;
        if self.core.handle == Handle::Unopened {
            self.core.latest_revision_number = self.core.revision_number;
            return Ok(());
        }

        let letter = self.core.base_letter;
        let record = base::read_slot(&self.core.storage, letter)?.ok_or_else(|| {
            TableError::Corrupt(format!(
                "couldn't reread base {} of table '{}'",
                letter.as_char(),
                self.core.name
            ))
        })?;
        self.load_base(record);
        self.core.latest_revision_number = self.core.revision_number;
        self.allocate_buffers();
        self.read_root()?;
        self.reset_sequential_state();
        self.core.cursor_version += 1;
        debug!(table = %self.core.name, revision = self.core.revision_number, "cancelled changes");
        Ok(())
    }

    /// Whether the table's files exist.
    pub fn exists(&self) -> Result<bool, TableError> {
        if !self.core.storage.data_exists() {
            return Ok(false);
        }
        Ok(self.core.storage.read_base(BaseLetter::A)?.is_some()
            || self.core.storage.read_base(BaseLetter::B)?.is_some())
    }

    /// Close the table and remove its files.
    pub fn erase(&mut self) -> Result<(), TableError> {
        self.close(false);
        self.core.storage.erase()?;
        Ok(())
    }

    // ========== Reading ==========

    /// Run `f` with the search item taken out of the table, so it can be
    /// borrowed next to `self`.
    pub(super) fn with_kt<T>(
        &mut self,
        f: impl FnOnce(&mut Self, &mut ItemWriter) -> Result<T, TableError>,
    ) -> Result<T, TableError> {
        let mut kt = std::mem::replace(&mut self.kt, ItemWriter::new(0));
        let result = f(self, &mut kt);
        self.kt = kt;
        result
    }

    /// Position the built-in cursor on `key`. Returns whether it exists.
    pub(super) fn find(&mut self, key: Key<'_>) -> Result<bool, TableError> {
        path::find(&mut self.core, &mut self.path, key)
    }

    /// Position the built-in cursor on `key`. Keys that cannot be stored
    /// are never found.
    fn find_key(&mut self, key: &[u8]) -> Result<bool, TableError> {
        self.core.check_not_closed()?;
        if self.core.handle == Handle::Unopened || key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }
        self.with_kt(|table, kt| {
            kt.form_key(key)?;
            table.find(kt.key())
        })
    }

    /// The tag stored under `key`, if any.
    pub fn get_exact_entry(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, TableError> {
        if !self.find_key(key)? {
            return Ok(None);
        }
        let (tag, compressed) = path::read_tag(&mut self.core, &mut self.path)?;
        if compressed {
            Ok(Some(self.core.inflate(&tag)?))
        } else {
            Ok(Some(tag))
        }
    }

    /// Whether `key` is stored, without reading its tag.
    pub fn key_exists(&mut self, key: &[u8]) -> Result<bool, TableError> {
        self.find_key(key)
    }

    /// Whether the table has no entries, found by scanning rather than by
    /// trusting the stored count.
    pub fn is_empty(&self) -> Result<bool, TableError> {
        self.core.check_not_closed()?;
        if self.core.handle == Handle::Unopened {
            return Ok(true);
        }
        let mut cursor = self.cursor()?;
        cursor.find_entry(self, b"")?;
        Ok(!cursor.next(self)?)
    }

    /// A new cursor over this table.
    pub fn cursor(&self) -> Result<Cursor, TableError> {
        Cursor::new(self)
    }

    pub(super) fn snapshot(&self) -> SnapshotLoader<'_, S> {
        SnapshotLoader {
            core: &self.core,
            builtin: self.path.as_slice(),
        }
    }

    // ========== Writing ==========

    /// Insert or replace the tag stored under `key`.
    ///
    /// With `already_compressed`, `tag` is stored as is and flagged
    /// compressed. A lazy table creates its files here.
    pub fn add(&mut self, key: &[u8], tag: &[u8], already_compressed: bool) -> Result<(), TableError> {
        self.core.check_writable()?;
        if key.is_empty() {
            return Err(TableError::InvalidArgument(
                "the empty key is reserved".to_string(),
            ));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(KeyTooLong(key.len()).into());
        }
        if self.core.handle == Handle::Unopened {
            if !self.core.lazy {
                return Err(TableError::Opening(format!(
                    "table '{}' is not open",
                    self.core.name
                )));
            }
            self.create_and_open(self.core.block_size)?;
        }

        let mut compressed = already_compressed;
        let packed;
        let tag = if already_compressed {
            tag
        } else {
            match self.core.stream.get_mut().compress(tag)? {
                Some(bytes) => {
                    compressed = true;
                    packed = bytes;
                    &packed
                }
                None => tag,
            }
        };

        self.with_kt(|table, kt| table.add_components(kt, key, tag, compressed))?;
        self.core.modified = true;
        self.core.cursor_version += 1;
        Ok(())
    }

    /// Store `tag` as components `key#1..key#m`, removing any leftover
    /// components of a longer previous tag.
    fn add_components(
        &mut self,
        kt: &mut ItemWriter,
        key: &[u8],
        tag: &[u8],
        compressed: bool,
    ) -> Result<(), TableError> {
        kt.form_key(key)?;
        let cd = kt.tag_offset();
        let l = self.core.max_item_size - cd;
        let mut first_l = l;

        let mut found = self.find(kt.key())?;
        if !found {
            // Try to fill the target leaf with the first chunk.
            let mut n = block::total_free(&self.path[0].block) % (self.core.max_item_size + D2);
            if n > D2 + cd {
                n -= D2 + cd;
                let last = tag.len() % l;
                if n >= last || (self.full_compaction && n >= key.len() + 34) {
                    first_l = n;
                }
            }
        }

        let m = if tag.is_empty() {
            1
        } else {
            (tag.len() + l - 1 - first_l) / l + 1
        };
        let Ok(m16) = u16::try_from(m) else {
            return Err(TableError::InvalidArgument(format!(
                "tag of {} bytes needs {m} items, more than a key can hold",
                tag.len()
            )));
        };
        kt.set_components_of(m16);

        let mut replacement = false;
        let mut old_components = 0;
        let mut o = 0;
        for i in 1..=m16 {
            let chunk = if i == m16 {
                tag.len() - o
            } else if i == 1 {
                first_l
            } else {
                l
            };
            kt.set_tag(&tag[o..o + chunk], compressed);
            kt.set_component_of(i);
            o += chunk;

            if i > 1 {
                found = self.find(kt.key())?;
            }
            old_components = self.add_kt(kt, found)?;
            if old_components > 0 {
                replacement = true;
            }
        }
        for i in u32::from(m16) + 1..=u32::from(old_components) {
            kt.set_component_of(i as u16);
            self.delete_kt(kt.key())?;
        }
        if !replacement {
            self.core.item_count += 1;
        }
        Ok(())
    }

    /// Remove `key`. Returns false if it was not there.
    pub fn del(&mut self, key: &[u8]) -> Result<bool, TableError> {
        self.core.check_writable()?;
        if self.core.handle == Handle::Unopened || key.is_empty() || key.len() > MAX_KEY_LEN {
            return Ok(false);
        }

        let deleted = self.with_kt(|table, kt| {
            kt.form_key(key)?;
            let n = table.delete_kt(kt.key())?;
            if n == 0 {
                return Ok(false);
            }
            for i in 2..=n {
                kt.set_component_of(i);
                table.delete_kt(kt.key())?;
            }
            Ok(true)
        })?;

        if deleted {
            self.core.item_count = self.core.item_count.saturating_sub(1);
            self.core.modified = true;
            self.core.cursor_version += 1;
        }
        Ok(deleted)
    }

    /// Split long tags more eagerly and switch straight to sequential
    /// splitting, for tables built once in key order.
    pub const fn set_full_compaction(&mut self, parity: bool) {
        if parity {
            self.seq_count = 0;
        }
        self.full_compaction = parity;
    }

    // ========== Changesets ==========

    /// Append every block written in this transaction to `out`.
    ///
    /// Call before [`Table::commit`].
    pub fn write_changed_blocks(&mut self, out: &mut dyn Write) -> Result<(), TableError> {
        self.core.check_writable()?;
        if self.core.handle != Handle::Open {
            return Ok(());
        }
        self.flush_db()?;
        if self.core.faked_root_block {
            return Ok(());
        }

        changes::write_block_list_header(out, &self.core.name, self.core.block_size)?;
        self.core.base.calculate_last_block();
        let mut buf = vec![0u8; self.core.block_size];
        let mut n = 0;
        while let Some(changed) = self.core.base.find_changed_block(n) {
            self.core.read_block(changed, &mut buf)?;
            changes::write_block_entry(out, changed, &buf)?;
            n = changed + 1;
        }
        changes::write_end(out)?;
        Ok(())
    }

    // ========== Accessors ==========

    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Number of entries, excluding the null entry.
    #[must_use]
    pub const fn get_entry_count(&self) -> u64 {
        self.core.item_count
    }

    #[must_use]
    pub const fn get_open_revision_number(&self) -> u32 {
        self.core.revision_number
    }

    /// Newest revision on disk, which may be newer than the open one.
    #[must_use]
    pub const fn get_latest_revision_number(&self) -> u32 {
        self.core.latest_revision_number
    }

    #[must_use]
    pub const fn get_block_size(&self) -> usize {
        self.core.block_size
    }

    /// Whether there are uncommitted changes.
    #[must_use]
    pub const fn is_modified(&self) -> bool {
        self.core.modified
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.core.handle == Handle::Open
    }

    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.core.writable
    }

    #[must_use]
    pub const fn compression(&self) -> CompressionStrategy {
        self.core.compression
    }

    #[must_use]
    pub const fn storage(&self) -> &S {
        &self.core.storage
    }

    pub const fn storage_mut(&mut self) -> &mut S {
        &mut self.core.storage
    }

    /// Give up the table and hand back its storage.
    pub fn into_storage(mut self) -> S {
        self.close(false);
        self.core.storage
    }
}

/// Errors from table operations.
#[derive(Debug)]
pub enum TableError {
    /// The caller broke a precondition.
    InvalidArgument(String),
    /// The table's files are missing or unreadable.
    Opening(String),
    /// The on-disk structure is inconsistent.
    Corrupt(String),
    /// A read or write failed.
    Io(StorageError),
    /// The compression codec ran out of resources.
    ResourceExhausted(String),
    /// A writer has reused blocks of the revision this reader has open.
    Modified,
    /// The table was closed for good.
    Closed,
}

impl TableError {
    /// Error for a block newer than the revision that reached it.
    pub(super) fn overwritten(writable: bool) -> Self {
        if writable {
            Self::Corrupt("block overwritten - are there multiple writers?".to_string())
        } else {
            Self::Modified
        }
    }
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Opening(msg) => write!(f, "opening error: {msg}"),
            Self::Corrupt(msg) => write!(f, "database corrupt: {msg}"),
            Self::Io(e) => write!(f, "storage error: {e}"),
            Self::ResourceExhausted(msg) => write!(f, "resource exhausted: {msg}"),
            Self::Modified => write!(f, "revision has been overwritten, reopen to continue"),
            Self::Closed => write!(f, "table has been closed"),
        }
    }
}

impl std::error::Error for TableError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StorageError> for TableError {
    fn from(e: StorageError) -> Self {
        Self::Io(e)
    }
}

impl From<std::io::Error> for TableError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(StorageError::Io(e))
    }
}

impl From<CompressionError> for TableError {
    fn from(e: CompressionError) -> Self {
        match e {
            CompressionError::Corrupt(msg) => Self::Corrupt(msg),
            CompressionError::ResourceExhausted => {
                Self::ResourceExhausted("compression stream".to_string())
            }
        }
    }
}

impl From<BlockError> for TableError {
    fn from(e: BlockError) -> Self {
        Self::Corrupt(e.to_string())
    }
}

impl From<BaseError> for TableError {
    fn from(e: BaseError) -> Self {
        Self::Corrupt(e.to_string())
    }
}

impl From<KeyTooLong> for TableError {
    fn from(e: KeyTooLong) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedStorage;

    fn config(block_size: usize) -> TableConfig {
        TableConfig {
            block_size,
            ..TableConfig::default()
        }
    }

    fn new_table(seed: u64) -> Table<SimulatedStorage> {
        let mut table = Table::new("test", SimulatedStorage::new(seed), &config(2048));
        table.create_and_open(2048).expect("create table");
        table
    }

    #[test]
    fn test_fresh_table_has_faked_root() {
        let mut table = new_table(1);
        assert!(table.core.faked_root_block);
        assert_eq!(table.get_entry_count(), 0);
        assert!(table.is_empty().expect("is_empty"));
        assert_eq!(table.get_exact_entry(b"missing").expect("get"), None);
        assert_eq!(table.storage().stats().writes, 0);
    }

    #[test]
    fn test_add_get_replace() {
        let mut table = new_table(2);
        table.add(b"alpha", b"one", false).expect("add");
        table.add(b"beta", b"two", false).expect("add");
        assert_eq!(table.get_entry_count(), 2);
        assert_eq!(
            table.get_exact_entry(b"alpha").expect("get").as_deref(),
            Some(&b"one"[..])
        );

        table.add(b"alpha", b"uno", false).expect("replace");
        assert_eq!(table.get_entry_count(), 2);
        assert_eq!(
            table.get_exact_entry(b"alpha").expect("get").as_deref(),
            Some(&b"uno"[..])
        );
        assert!(table.is_modified());
    }

    #[test]
    fn test_invalid_keys() {
        let mut table = new_table(3);
        assert!(matches!(
            table.add(b"", b"x", false),
            Err(TableError::InvalidArgument(_))
        ));
        let long = vec![b'k'; MAX_KEY_LEN + 1];
        assert!(matches!(
            table.add(&long, b"x", false),
            Err(TableError::InvalidArgument(_))
        ));
        assert!(!table.del(b"").expect("del empty"));
        assert!(!table.del(&long).expect("del long"));
        assert!(!table.key_exists(&long).expect("exists long"));
    }

    #[test]
    fn test_invalid_block_size() {
        let mut table = Table::new("t", SimulatedStorage::new(4), &config(2048));
        assert!(matches!(
            table.create_and_open(3000),
            Err(TableError::InvalidArgument(_))
        ));
        assert!(matches!(
            table.create_and_open(1024),
            Err(TableError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_commit_requires_newer_revision() {
        let mut table = new_table(5);
        table.add(b"k", b"v", false).expect("add");
        table.commit(1).expect("commit");
        assert!(matches!(table.commit(1), Err(TableError::InvalidArgument(_))));
        assert_eq!(table.get_open_revision_number(), 1);
    }

    #[test]
    fn test_cancel_discards_changes() {
        let mut table = new_table(6);
        table.add(b"kept", b"1", false).expect("add");
        table.commit(1).expect("commit");

        table.add(b"dropped", b"2", false).expect("add");
        assert!(table.del(b"kept").expect("del"));
        table.cancel().expect("cancel");

        assert!(!table.is_modified());
        assert_eq!(table.get_entry_count(), 1);
        assert!(table.key_exists(b"kept").expect("exists"));
        assert!(!table.key_exists(b"dropped").expect("exists"));
    }

    #[test]
    fn test_closed_table_rejects_operations() {
        let mut table = new_table(7);
        table.close(true);
        assert!(matches!(table.add(b"k", b"v", false), Err(TableError::Closed)));
        assert!(matches!(table.get_exact_entry(b"k"), Err(TableError::Closed)));
        assert!(matches!(table.open(), Err(TableError::Closed)));
        assert!(matches!(table.commit(9), Err(TableError::Closed)));
    }

    #[test]
    fn test_reader_cannot_write() {
        let mut writer = new_table(8);
        writer.add(b"k", b"v", false).expect("add");
        writer.commit(1).expect("commit");

        let mut reader = Table::open_read_only("test", writer.into_storage(), &config(2048))
            .expect("open reader");
        assert!(matches!(
            reader.add(b"x", b"y", false),
            Err(TableError::InvalidArgument(_))
        ));
        assert_eq!(
            reader.get_exact_entry(b"k").expect("get").as_deref(),
            Some(&b"v"[..])
        );
    }

    #[test]
    fn test_error_display() {
        let e = TableError::from(CompressionError::ResourceExhausted);
        assert!(matches!(e, TableError::ResourceExhausted(_)));
        let e = TableError::from(std::io::Error::other("disk full"));
        assert!(std::error::Error::source(&e).is_some());
        assert!(e.to_string().contains("disk full"));
        assert_eq!(TableError::overwritten(false).to_string(), TableError::Modified.to_string());
    }
}
