//! Readers sharing real files with a writer, and commit hooks.

use std::cell::RefCell;
use std::rc::Rc;

use tempfile::tempdir;

use crate::e2e_tests::helpers::*;
use crate::simulation::SimulatedStorage;
use crate::storage::FileStorage;
use crate::storage::btree::{CommitHook, Table, TableError};

#[test]
fn test_reader_keeps_its_revision_until_blocks_are_reused() {
    let dir = tempdir().expect("tempdir");
    let prefix = dir.path().join("postlist.");

    let mut writer = Table::new(TABLE_NAME, FileStorage::new(&prefix), &config(2048));
    writer.create_and_open(2048).expect("create");
    for i in 0..2000 {
        writer.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    writer.commit(1).expect("commit");

    let mut reader =
        Table::open_read_only(TABLE_NAME, FileStorage::new(&prefix), &config(2048)).expect("open");
    assert_eq!(reader.get_open_revision_number(), 1);
    assert!(!reader.is_writable());

    // Revision 2 leaves revision 1's blocks alone.
    for i in 0..2000 {
        writer.add(&term_key(i), b"second", false).expect("add");
    }
    writer.commit(2).expect("commit");
    for i in (0..2000).step_by(97) {
        assert_eq!(
            reader.get_exact_entry(&term_key(i)).expect("get"),
            Some(doc_list(i))
        );
    }

    // Revision 3 may reuse them.
    for i in 0..2000 {
        writer.add(&term_key(i), b"third", false).expect("add");
    }
    writer.commit(3).expect("commit");

    let mut modified = false;
    for i in 0..2000 {
        match reader.get_exact_entry(&term_key(i)) {
            Ok(tag) => assert_eq!(tag, Some(doc_list(i))),
            Err(TableError::Modified) => {
                modified = true;
                break;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(modified);

    reader.open().expect("reopen");
    assert_eq!(reader.get_open_revision_number(), 3);
    assert_eq!(reader.get_latest_revision_number(), 3);
    assert_eq!(
        reader.get_exact_entry(&term_key(10)).expect("get"),
        Some(b"third".to_vec())
    );
    assert_consistent(&reader);
}

#[test]
fn test_file_storage_round_trip() {
    let dir = tempdir().expect("tempdir");
    let prefix = dir.path().join("termlist.");

    let mut table = Table::new(TABLE_NAME, FileStorage::new(&prefix), &config(8192));
    table.create_and_open(8192).expect("create");
    for i in 0..5000 {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    table.commit(1).expect("commit");
    table.close(true);

    assert!(prefix.with_file_name("termlist.DB").exists());
    let table =
        Table::open_read_only(TABLE_NAME, FileStorage::new(&prefix), &config(2048)).expect("open");
    assert_eq!(table.get_block_size(), 8192);
    assert_eq!(table.get_entry_count(), 5000);
    assert_consistent(&table);
}

/// Writes a running total into the table at every commit.
struct CountingHook {
    commits: Rc<RefCell<u32>>,
}

impl CommitHook<SimulatedStorage> for CountingHook {
    fn before_commit(&mut self, table: &mut Table<SimulatedStorage>) -> Result<(), TableError> {
        let mut commits = self.commits.borrow_mut();
        *commits += 1;
        table.add(b"#commits", commits.to_string().as_bytes(), false)
    }
}

#[test]
fn test_commit_hook_writes_into_revision() {
    let commits = Rc::new(RefCell::new(0));
    let mut table = new_table(70, 2048);
    table.set_commit_hook(Box::new(CountingHook {
        commits: Rc::clone(&commits),
    }));

    table.add(b"k", b"v", false).expect("add");
    table.commit(1).expect("commit");
    table.commit(2).expect("commit");
    assert_eq!(*commits.borrow(), 2);

    let mut table = reopen(table);
    assert_eq!(table.get_exact_entry(b"#commits").expect("get"), Some(b"2".to_vec()));
    assert_eq!(table.get_entry_count(), 2);
}

struct FailingHook;

impl CommitHook<SimulatedStorage> for FailingHook {
    fn before_commit(&mut self, _table: &mut Table<SimulatedStorage>) -> Result<(), TableError> {
        Err(TableError::InvalidArgument("merge failed".to_string()))
    }
}

#[test]
fn test_failing_hook_aborts_commit() {
    let mut table = new_table(71, 2048);
    table.add(b"k", b"v", false).expect("add");
    table.commit(1).expect("commit");

    table.set_commit_hook(Box::new(FailingHook));
    table.add(b"k2", b"v2", false).expect("add");
    assert!(matches!(table.commit(2), Err(TableError::InvalidArgument(_))));
    assert_eq!(table.get_open_revision_number(), 1);
    assert!(table.is_modified());
}
