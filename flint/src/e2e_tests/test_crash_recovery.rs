//! Interrupted commits and damaged base files.

use crate::e2e_tests::helpers::*;
use crate::simulation::{FaultConfig, SimulatedStorage};
use crate::storage::base::{BaseLetter, BaseRecord};
use crate::storage::btree::{Table, TableError};

fn letter_with_revision(storage: &SimulatedStorage, revision: u32) -> BaseLetter {
    [BaseLetter::A, BaseLetter::B]
        .into_iter()
        .find(|letter| {
            storage
                .base(*letter)
                .and_then(|bytes| BaseRecord::from_bytes(bytes).ok())
                .is_some_and(|record| record.revision == revision)
        })
        .expect("no base holds the revision")
}

#[test]
fn test_commit_interrupted_before_base_write() {
    let mut table = new_table(40, 2048);
    for i in 0..300 {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    table.commit(1).expect("commit");
    let committed = all_entries(&table);

    for i in 300..900 {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    for i in 0..100 {
        assert!(table.del(&term_key(i)).expect("del"));
    }
    table.storage_mut().set_fail_base_writes(true);
    assert!(matches!(table.commit(2), Err(TableError::Io(_))));
    assert!(!table.is_open());

    let mut storage = table.into_storage();
    storage.crash();
    storage.set_fail_base_writes(false);

    let mut table = Table::new(TABLE_NAME, storage, &config(2048));
    table.open().expect("reopen");
    assert_eq!(table.get_open_revision_number(), 1);
    assert_eq!(table.get_entry_count(), 300);
    assert_eq!(all_entries(&table), committed);
    assert_consistent(&table);

    // The blocks of the lost transaction are free again.
    table.add(b"after", b"crash", false).expect("add");
    table.commit(2).expect("commit");
    assert_eq!(table.get_entry_count(), 301);
    assert_consistent(&table);
}

#[test]
fn test_corrupt_latest_base_falls_back() {
    let mut table = new_table(41, 2048);
    for i in 0..200 {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    table.commit(1).expect("commit");
    let first = all_entries(&table);
    for i in 200..400 {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    table.commit(2).expect("commit");

    let mut storage = table.into_storage();
    let latest = letter_with_revision(&storage, 2);
    storage.corrupt_base(latest);

    let table = Table::open_read_only(TABLE_NAME, storage, &config(2048)).expect("open");
    assert_eq!(table.get_open_revision_number(), 1);
    assert_eq!(all_entries(&table), first);
    assert_consistent(&table);
}

#[test]
fn test_both_bases_corrupt_is_opening_error() {
    let mut table = new_table(42, 2048);
    table.add(b"k", b"v", false).expect("add");
    table.commit(1).expect("commit");

    let mut storage = table.into_storage();
    storage.corrupt_base(BaseLetter::A);
    storage.corrupt_base(BaseLetter::B);
    assert!(matches!(
        Table::open_read_only(TABLE_NAME, storage, &config(2048)),
        Err(TableError::Opening(_))
    ));
}

#[test]
fn test_open_at_unavailable_revision() {
    let mut table = new_table(43, 2048);
    table.add(b"k", b"v1", false).expect("add");
    table.commit(1).expect("commit");
    table.add(b"k", b"v2", false).expect("add");
    table.commit(2).expect("commit");
    table.add(b"k", b"v3", false).expect("add");
    table.commit(3).expect("commit");

    let mut reader = Table::new_read_only(TABLE_NAME, table.into_storage(), &config(2048));
    assert!(!reader.open_at(1).expect("open at 1"));
    assert!(!reader.is_open());
    assert!(reader.open_at(2).expect("open at 2"));
    assert_eq!(reader.get_exact_entry(b"k").expect("get"), Some(b"v2".to_vec()));
    assert!(reader.open_at(3).expect("open at 3"));
    assert_eq!(reader.get_exact_entry(b"k").expect("get"), Some(b"v3".to_vec()));
}

#[test]
fn test_missing_table_is_opening_error() {
    let mut table = Table::new(TABLE_NAME, SimulatedStorage::new(44), &config(2048));
    assert!(matches!(table.open(), Err(TableError::Opening(_))));
    assert!(!table.exists().expect("exists"));
}

#[test]
fn test_read_faults_surface_as_errors() {
    let mut table = new_table(45, 2048);
    for i in 0..500 {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    table.commit(1).expect("commit");

    let mut storage = table.into_storage();
    storage.set_fault_config(FaultConfig {
        read_error_rate: 1.0,
        ..FaultConfig::no_faults()
    });
    assert!(matches!(
        Table::open_read_only(TABLE_NAME, storage, &config(2048)),
        Err(TableError::Io(_))
    ));
}

fn first_read_error(table: &mut Table<SimulatedStorage>, count: usize) -> Option<TableError> {
    for i in 0..count {
        match table.get_exact_entry(&term_key(i)) {
            Ok(tag) => assert_eq!(tag, Some(doc_list(i))),
            Err(e) => return Some(e),
        }
    }
    None
}

#[test]
fn test_damaged_blocks_surface_as_corrupt() {
    let mut table = new_table(46, 2048);
    for i in 0..1000 {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    table.commit(1).expect("commit");

    let mut storage = table.into_storage();
    storage.set_fault_config(FaultConfig {
        corruption_rate: 1.0,
        ..FaultConfig::no_faults()
    });
    let mut table = Table::new(TABLE_NAME, storage, &config(2048));
    let err = match table.open() {
        Err(e) => e,
        Ok(()) => first_read_error(&mut table, 1000).expect("damaged blocks read back cleanly"),
    };
    assert!(matches!(err, TableError::Corrupt(_)), "unexpected error: {err}");
    assert!(table.storage().stats().corrupted_reads > 0);
}

#[test]
fn test_torn_block_writes_surface_as_corrupt() {
    fn fill_and_commit(table: &mut Table<SimulatedStorage>) -> Result<(), TableError> {
        for i in 0..1000 {
            table.add(&term_key(i), &doc_list(i), false)?;
        }
        table.commit(1)
    }

    let faults = FaultConfig {
        partial_write_rate: 1.0,
        ..FaultConfig::no_faults()
    };
    let mut table = Table::new(
        TABLE_NAME,
        SimulatedStorage::with_config(47, faults),
        &config(2048),
    );
    table.create_and_open(2048).expect("create");

    // Every leaf ends in tag bytes, so zeroing any tail breaks its checksum.
    // The writer may trip over a torn block itself, or the next reader will.
    let err = match fill_and_commit(&mut table) {
        Err(e) => e,
        Ok(()) => {
            let mut table = Table::new(TABLE_NAME, table.into_storage(), &config(2048));
            match table.open() {
                Err(e) => e,
                Ok(()) => first_read_error(&mut table, 1000).expect("torn blocks read back cleanly"),
            }
        }
    };
    assert!(matches!(err, TableError::Corrupt(_)), "unexpected error: {err}");
}
