//! Cursor traversal across many leaves.

use crate::e2e_tests::helpers::*;
use crate::storage::btree::MutableCursor;

#[test]
fn test_forward_scan_is_strictly_increasing() {
    let mut table = new_table(20, 2048);
    for i in (0..1200).rev() {
        table
            .add(format!("s{:05}", i * 7 % 1200).as_bytes(), b"tag", false)
            .expect("add");
    }
    table.commit(1).expect("commit");

    let entries = all_entries(&table);
    assert_eq!(entries.len(), 1200);
    for pair in entries.windows(2) {
        assert!(pair[0].0 < pair[1].0, "keys out of order");
    }
}

#[test]
fn test_backward_scan_visits_every_entry() {
    let mut table = new_table(21, 2048);
    for i in 0..900 {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }

    let mut cursor = table.cursor().expect("cursor");
    assert!(cursor.find_entry(&table, b"term0899").expect("find"));
    let mut seen = vec![cursor.current_key().to_vec()];
    while cursor.prev(&table).expect("prev") {
        if cursor.current_key().is_empty() {
            break;
        }
        seen.push(cursor.current_key().to_vec());
    }
    assert_eq!(seen.len(), 900);
    assert_eq!(seen.last().map(Vec::as_slice), Some(&b"term0000"[..]));
}

#[test]
fn test_cursor_survives_writes() {
    let mut table = new_table(22, 2048);
    for i in (0..600).step_by(2) {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }

    let mut cursor = table.cursor().expect("cursor");
    assert!(cursor.find_entry(&table, &term_key(100)).expect("find"));

    // Fill in the gaps; the cursor rebuilds its path on its next move.
    for i in (1..600).step_by(2) {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }
    assert!(cursor.next(&table).expect("next"));
    assert_eq!(cursor.current_key(), &term_key(101)[..]);
    cursor.read_tag(&table, false).expect("read tag");
    assert_eq!(cursor.current_tag(), &doc_list(101)[..]);
}

#[test]
fn test_mutable_cursor_deletes_range() {
    let mut table = new_table(23, 2048);
    for i in 0..400 {
        table.add(&term_key(i), &doc_list(i), false).expect("add");
    }

    let mut cursor = MutableCursor::new(&table).expect("cursor");
    assert!(cursor.find_entry_ge(&table, b"term0100").expect("find"));
    let mut deleted = 0;
    while cursor.current_key() < &b"term0200"[..] {
        deleted += 1;
        if !cursor.del(&mut table).expect("del") {
            break;
        }
    }
    assert_eq!(deleted, 100);
    assert_eq!(cursor.current_key(), b"term0200");
    assert_eq!(table.get_entry_count(), 300);
    assert!(!table.key_exists(b"term0150").expect("exists"));
    assert!(table.key_exists(b"term0200").expect("exists"));
    assert_consistent(&table);
}

#[test]
fn test_find_entry_ge_past_end() {
    let mut table = new_table(24, 2048);
    table.add(b"apple", b"1", false).expect("add");
    table.add(b"banana", b"2", false).expect("add");

    let mut cursor = table.cursor().expect("cursor");
    assert!(!cursor.find_entry_ge(&table, b"avocado").expect("find"));
    assert_eq!(cursor.current_key(), b"banana");
    assert!(!cursor.find_entry_ge(&table, b"cherry").expect("find"));
    assert!(cursor.after_end());
    assert!(!cursor.next(&table).expect("next after end"));
}
