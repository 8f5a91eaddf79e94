//! Common helpers for end-to-end tests.

use crate::config::TableConfig;
use crate::simulation::SimulatedStorage;
use crate::storage::btree::{Table, check_table};
use crate::storage::io::Storage;

pub const TABLE_NAME: &str = "postlist";

#[must_use]
pub fn config(block_size: usize) -> TableConfig {
    TableConfig {
        block_size,
        ..TableConfig::default()
    }
}

/// A freshly created, open table over simulated storage.
#[must_use]
pub fn new_table(seed: u64, block_size: usize) -> Table<SimulatedStorage> {
    let mut table = Table::new(TABLE_NAME, SimulatedStorage::new(seed), &config(block_size));
    table.create_and_open(block_size).expect("Failed to create test table");
    table
}

/// Close `table` and open its latest revision again for writing.
#[must_use]
pub fn reopen(table: Table<SimulatedStorage>) -> Table<SimulatedStorage> {
    let block_size = table.get_block_size();
    let mut table = Table::new(TABLE_NAME, table.into_storage(), &config(block_size));
    table.open().expect("Failed to reopen test table");
    table
}

#[must_use]
pub fn term_key(i: usize) -> Vec<u8> {
    format!("term{i:04}").into_bytes()
}

#[must_use]
pub fn doc_list(i: usize) -> Vec<u8> {
    format!("doc-list-{i:04}").into_bytes()
}

/// Every entry in key order, read through a cursor.
#[must_use]
pub fn all_entries<S: Storage>(table: &Table<S>) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = table.cursor().expect("Failed to create cursor");
    cursor.find_entry(table, b"").expect("Failed to find null entry");
    let mut entries = Vec::new();
    while cursor.next(table).expect("Failed to step cursor") {
        cursor.read_tag(table, false).expect("Failed to read tag");
        entries.push((cursor.current_key().to_vec(), cursor.current_tag().to_vec()));
    }
    entries
}

/// Run the checker and compare its count with a full scan.
pub fn assert_consistent<S: Storage>(table: &Table<S>) {
    let report = check_table(table).expect("Table failed structural check");
    assert_eq!(report.item_count, table.get_entry_count());
    assert_eq!(all_entries(table).len() as u64, table.get_entry_count());
}
