//! Tables whose files are only created by the first write.

use crate::config::TableConfig;
use crate::e2e_tests::helpers::*;
use crate::simulation::SimulatedStorage;
use crate::storage::btree::{Table, TableError};

fn lazy_config() -> TableConfig {
    TableConfig {
        block_size: 2048,
        lazy: true,
        ..TableConfig::default()
    }
}

#[test]
fn test_lazy_table_without_files_reads_as_empty() {
    let mut table = Table::new(TABLE_NAME, SimulatedStorage::new(50), &lazy_config());
    table.open().expect("open lazy");
    assert!(!table.is_open());
    assert!(!table.exists().expect("exists"));
    assert_eq!(table.get_entry_count(), 0);
    assert!(table.is_empty().expect("is_empty"));
    assert_eq!(table.get_exact_entry(b"anything").expect("get"), None);
    assert!(!table.del(b"anything").expect("del"));

    // Committing an untouched lazy table only moves the revision on.
    table.commit(5).expect("commit");
    assert_eq!(table.get_open_revision_number(), 5);
    assert!(!table.exists().expect("exists"));
    assert_eq!(table.storage().stats().base_writes, 0);
}

#[test]
fn test_first_add_creates_lazy_table() {
    let mut table = Table::new(TABLE_NAME, SimulatedStorage::new(51), &lazy_config());
    table.open().expect("open lazy");
    table.commit(3).expect("commit");

    table.add(b"first", b"entry", false).expect("add");
    assert!(table.is_open());
    assert!(table.exists().expect("exists"));
    table.commit(4).expect("commit");

    let table = reopen(table);
    assert_eq!(table.get_open_revision_number(), 4);
    assert_eq!(all_entries(&table), vec![(b"first".to_vec(), b"entry".to_vec())]);
}

#[test]
fn test_add_to_unopened_table_needs_lazy() {
    let mut table = Table::new(TABLE_NAME, SimulatedStorage::new(52), &config(2048));
    assert!(matches!(
        table.add(b"k", b"v", false),
        Err(TableError::Opening(_))
    ));
    assert!(matches!(table.cursor(), Err(TableError::Opening(_))));
}

#[test]
fn test_erase_removes_files() {
    let mut table = new_table(53, 2048);
    table.add(b"k", b"v", false).expect("add");
    table.commit(1).expect("commit");
    assert!(table.exists().expect("exists"));

    table.erase().expect("erase");
    assert!(!table.exists().expect("exists"));
    assert!(!table.is_open());
    assert!(matches!(table.open(), Err(TableError::Opening(_))));
}
