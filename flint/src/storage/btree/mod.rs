//! Copy-on-write B-tree tables.
//!
//! A table maps byte-string keys of up to [`MAX_KEY_LEN`] bytes to
//! arbitrary byte-string tags. Tags longer than fits in one item are split
//! into numbered components, each stored under the key with its component
//! number appended.
//!
//! # Structure
//!
//! - Leaf blocks (level 0) hold key/tag items in key order
//! - Internal blocks hold separator keys and child block numbers; the
//!   first item of an internal block is a null key
//! - A block from the last committed revision is never modified in place;
//!   the first change in a transaction copies it to a newly allocated
//!   block and updates the parent to match
//!
//! # Readers
//!
//! A [`Cursor`] reads through a shared reference to the table. Writers
//! bump a version so cursors rebuild their path after modifications. A
//! table opened read-only reports [`TableError::Modified`] if a writer has
//! reused a block of the revision it opened.
//!
//! # Usage
//!
//! ```
//! use flint::config::TableConfig;
//! use flint::simulation::SimulatedStorage;
//! use flint::storage::btree::Table;
//!
//! let mut table = Table::new("terms", SimulatedStorage::new(1), &TableConfig::default());
//! table.create_and_open(8192).expect("create");
//! table.add(b"apple", b"fruit", false).expect("add");
//! table.commit(1).expect("commit");
//! assert_eq!(table.get_exact_entry(b"apple").expect("get"), Some(b"fruit".to_vec()));
//! ```

pub(crate) mod block;
mod check;
mod cursor;
pub(crate) mod item;
mod path;
mod table;
mod update;

pub use block::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use check::{BlockSummary, CheckReport, check_table};
pub use cursor::{Cursor, MutableCursor};
pub use item::MAX_KEY_LEN;
pub use table::{CommitHook, MAX_LEVELS, Table, TableError};
