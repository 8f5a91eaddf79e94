//! Storage abstraction for the table files.
//!
//! A table lives in three files sharing a prefix: two alternating base
//! files and one data file of fixed-size blocks. The `Storage` trait hides
//! where those bytes live so the table can run against real files in
//! production and against [`crate::simulation::SimulatedStorage`] in tests.
//!
//! Implementations must ensure:
//! - `read_block` returns the last bytes written for that block
//! - `sync` makes all previous block writes durable
//! - `write_base` returns only once the base file is durable

use crate::storage::base::BaseLetter;

/// Errors that can occur at the storage boundary.
#[derive(Debug)]
pub enum StorageError {
    /// I/O error.
    Io(std::io::Error),
    /// A file the operation needs does not exist.
    NotFound(String),
    /// Injected fault for simulation.
    InjectedFault(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::NotFound(what) => write!(f, "{what} not found"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over the files backing one table.
///
/// Block reads take `&self` so cursors can read through a shared table
/// reference.
pub trait Storage {
    // ========== Data File ==========

    /// Whether the data file exists.
    fn data_exists(&self) -> bool;

    /// Open the data file, creating (and truncating) it if `create` is set.
    ///
    /// Returns `StorageError::NotFound` if it is missing and `create` is
    /// not set.
    fn open_data(&mut self, create: bool, writable: bool) -> Result<(), StorageError>;

    /// Release the data file handle. Safe to call when nothing is open.
    fn close_data(&mut self);

    /// Read block `n` into `buf`, which is exactly one block long.
    fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<(), StorageError>;

    /// Write `buf` as block `n`. The write may be buffered until `sync`.
    fn write_block(&mut self, n: u32, buf: &[u8]) -> Result<(), StorageError>;

    /// Make all previous block writes durable.
    fn sync(&mut self) -> Result<(), StorageError>;

    // ========== Base Files ==========

    /// Contents of a base file, or `None` if it does not exist.
    fn read_base(&self, letter: BaseLetter) -> Result<Option<Vec<u8>>, StorageError>;

    /// Replace a base file and make it durable.
    fn write_base(&mut self, letter: BaseLetter, bytes: &[u8]) -> Result<(), StorageError>;

    /// Remove a base file. Removing a missing file is not an error.
    fn remove_base(&mut self, letter: BaseLetter) -> Result<(), StorageError>;

    // ========== Whole Table ==========

    /// Remove every file of the table.
    fn erase(&mut self) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let e = StorageError::NotFound("postlist.DB".to_string());
        assert_eq!(e.to_string(), "postlist.DB not found");

        let e = StorageError::InjectedFault("test fault".to_string());
        assert!(e.to_string().contains("test fault"));

        let e = StorageError::from(std::io::Error::other("disk full"));
        assert!(std::error::Error::source(&e).is_some());
    }
}
