//! 500 terms in a table with the smallest block size.

use crate::e2e_tests::helpers::*;
use crate::storage::btree::{Table, check_table};

const TERMS: usize = 500;

#[test]
fn test_term_table_lifecycle() {
    let mut table = new_table(1, 2048);
    for i in 0..TERMS {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    assert_eq!(table.get_entry_count(), 500);
    assert_eq!(
        table.get_exact_entry(b"term0250").expect("get"),
        Some(b"doc-list-0250".to_vec())
    );

    assert!(table.del(b"term0250").expect("del"));
    assert!(!table.key_exists(b"term0250").expect("exists"));
    assert_eq!(table.get_entry_count(), 499);
    assert_consistent(&table);

    table.commit(2).expect("commit");
    let expected = all_entries(&table);

    let block_size = table.get_block_size();
    let mut table = Table::new(
        TABLE_NAME,
        table.into_storage(),
        &config(block_size),
    );
    assert!(table.open_at(2).expect("open at 2"));
    assert_eq!(table.get_open_revision_number(), 2);
    assert_eq!(table.get_entry_count(), 499);
    assert_eq!(all_entries(&table), expected);
    assert_eq!(
        table.get_exact_entry(b"term0251").expect("get"),
        Some(b"doc-list-0251".to_vec())
    );
    assert_consistent(&table);
}

#[test]
fn test_absent_delete_changes_nothing() {
    let mut table = new_table(2, 2048);
    for i in 0..TERMS {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    table.commit(1).expect("commit");
    let writes = table.storage().stats().writes;

    assert!(!table.del(b"term9999").expect("del absent"));
    assert!(!table.del(b"term0250x").expect("del absent"));
    assert!(!table.is_modified());
    assert_eq!(table.get_entry_count(), 500);

    table.flush_db().expect("flush");
    assert_eq!(table.storage().stats().writes, writes);
}

#[test]
fn test_sequential_build_matches_reverse_build() {
    let mut forward = new_table(3, 2048);
    let mut backward = new_table(4, 2048);
    for i in 0..TERMS {
        forward.add(&term_key(i), &doc_list(i), false).expect("add");
        let j = TERMS - 1 - i;
        backward.add(&term_key(j), &doc_list(j), false).expect("add");
    }
    forward.commit(1).expect("commit");
    backward.commit(1).expect("commit");

    assert_eq!(all_entries(&forward), all_entries(&backward));
    assert_consistent(&forward);
    assert_consistent(&backward);

    // Appending in order packs leaves fuller than prepending does.
    let forward_leaves = check_table(&forward)
        .expect("check")
        .blocks_per_level[0];
    let backward_leaves = check_table(&backward)
        .expect("check")
        .blocks_per_level[0];
    assert!(forward_leaves <= backward_leaves);
}
