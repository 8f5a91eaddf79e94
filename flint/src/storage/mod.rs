//! On-disk table storage.
//!
//! # Files
//!
//! A table named by a path prefix is stored in three files:
//!
//! - `<prefix>DB`: fixed-size blocks holding the B-tree
//! - `<prefix>baseA`, `<prefix>baseB`: alternating base files, each
//!   recording one revision's root, level, entry count and free-block
//!   bitmap
//!
//! Opening picks the valid base with the higher revision. A commit writes
//! the other base, so a crash during commit leaves the previous revision
//! intact.
//!
//! # Usage
//!
//! ```ignore
//! use flint::config::TableConfig;
//! use flint::storage::{FileStorage, btree::Table};
//!
//! let mut table = Table::new("postlist", FileStorage::new("db/postlist."), &TableConfig::default());
//! table.create_and_open(8192)?;
//! table.add(b"apple", b"tag", false)?;
//! table.commit(1)?;
//! ```

pub mod base;
pub mod btree;
pub mod changes;
pub mod codec;
pub mod compression;
pub mod file;
pub mod io;

pub use file::FileStorage;
pub use io::{Storage, StorageError};
