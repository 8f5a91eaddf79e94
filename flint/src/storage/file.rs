//! Table files on disk.
//!
//! A table with prefix `/db/postlist.` uses `/db/postlist.baseA`,
//! `/db/postlist.baseB` and `/db/postlist.DB`. The prefix is used verbatim,
//! so it may end in a directory separator, a dot, or nothing at all.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
#[cfg(not(unix))]
use std::io::{Read, Seek, SeekFrom};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::storage::base::BaseLetter;
use crate::storage::io::{Storage, StorageError};

/// The on-disk [`Storage`] implementation.
pub struct FileStorage {
    prefix: PathBuf,
    data: Option<File>,
}

impl FileStorage {
    /// Storage for the table whose files start with `prefix`.
    ///
    /// No file is touched until the table opens or creates itself.
    pub fn new(prefix: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            data: None,
        }
    }

    fn path_with(&self, suffix: &str) -> PathBuf {
        let mut name = self.prefix.clone().into_os_string();
        name.push(suffix);
        PathBuf::from(name)
    }

    fn data_path(&self) -> PathBuf {
        self.path_with("DB")
    }

    fn base_path(&self, letter: BaseLetter) -> PathBuf {
        self.path_with(&format!("base{}", letter.as_char()))
    }

    fn data_file(&self) -> Result<&File, StorageError> {
        self.data
            .as_ref()
            .ok_or_else(|| StorageError::NotFound(self.data_path().display().to_string()))
    }

    fn offset(n: u32, block_size: usize) -> u64 {
        u64::from(n) * block_size as u64
    }

    fn remove_if_present(path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

impl Storage for FileStorage {
    fn data_exists(&self) -> bool {
        self.data_path().exists()
    }

    fn open_data(&mut self, create: bool, writable: bool) -> Result<(), StorageError> {
        let path = self.data_path();
        let result = OpenOptions::new()
            .read(true)
            .write(writable || create)
            .create(create)
            .truncate(create)
            .open(&path);
        match result {
            Ok(file) => {
                self.data = Some(file);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn close_data(&mut self) {
        self.data = None;
    }

    #[cfg(unix)]
    fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let offset = Self::offset(n, buf.len());
        self.data_file()?.read_exact_at(buf, offset)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let offset = Self::offset(n, buf.len());
        let mut file = self.data_file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    #[cfg(unix)]
    fn write_block(&mut self, n: u32, buf: &[u8]) -> Result<(), StorageError> {
        let offset = Self::offset(n, buf.len());
        self.data_file()?.write_all_at(buf, offset)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn write_block(&mut self, n: u32, buf: &[u8]) -> Result<(), StorageError> {
        let offset = Self::offset(n, buf.len());
        let mut file = self.data_file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.data_file()?.sync_data()?;
        Ok(())
    }

    fn read_base(&self, letter: BaseLetter) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.base_path(letter)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn write_base(&mut self, letter: BaseLetter, bytes: &[u8]) -> Result<(), StorageError> {
        let mut file = File::create(self.base_path(letter))?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    }

    fn remove_base(&mut self, letter: BaseLetter) -> Result<(), StorageError> {
        Self::remove_if_present(&self.base_path(letter))
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.close_data();
        Self::remove_if_present(&self.base_path(BaseLetter::A))?;
        Self::remove_if_present(&self.base_path(BaseLetter::B))?;
        Self::remove_if_present(&self.data_path())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_file_names_use_prefix_verbatim() {
        let storage = FileStorage::new("/db/postlist.");
        assert_eq!(storage.data_path(), PathBuf::from("/db/postlist.DB"));
        assert_eq!(
            storage.base_path(BaseLetter::B),
            PathBuf::from("/db/postlist.baseB")
        );
    }

    #[test]
    fn test_open_missing_data_file() {
        let dir = tempdir().expect("create temp dir");
        let mut storage = FileStorage::new(dir.path().join("t."));
        assert!(!storage.data_exists());
        assert!(matches!(
            storage.open_data(false, true),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_block_write_read() {
        let dir = tempdir().expect("create temp dir");
        let mut storage = FileStorage::new(dir.path().join("t."));
        storage.open_data(true, true).expect("create data file");

        let block = vec![0x5au8; 2048];
        storage.write_block(3, &block).expect("write block");
        storage.sync().expect("sync");

        let mut buf = vec![0u8; 2048];
        storage.read_block(3, &mut buf).expect("read block");
        assert_eq!(buf, block);

        // Past the end of the file.
        assert!(storage.read_block(9, &mut buf).is_err());
    }

    #[test]
    fn test_base_files() {
        let dir = tempdir().expect("create temp dir");
        let mut storage = FileStorage::new(dir.path().join("t."));
        assert_eq!(storage.read_base(BaseLetter::A).expect("read"), None);

        storage
            .write_base(BaseLetter::A, b"base contents")
            .expect("write base");
        assert_eq!(
            storage.read_base(BaseLetter::A).expect("read").as_deref(),
            Some(&b"base contents"[..])
        );

        storage.remove_base(BaseLetter::A).expect("remove");
        storage.remove_base(BaseLetter::A).expect("remove twice");
        assert_eq!(storage.read_base(BaseLetter::A).expect("read"), None);
    }

    #[test]
    fn test_erase_removes_everything() {
        let dir = tempdir().expect("create temp dir");
        let mut storage = FileStorage::new(dir.path().join("t."));
        storage.open_data(true, true).expect("create");
        storage.write_base(BaseLetter::B, b"x").expect("write base");

        storage.erase().expect("erase");
        assert!(!storage.data_exists());
        assert_eq!(storage.read_base(BaseLetter::B).expect("read"), None);
    }
}
