//! Tags split over several items, and tag compression.

use crate::config::TableConfig;
use crate::e2e_tests::helpers::*;
use crate::simulation::SimulatedStorage;
use crate::storage::btree::{Table, check_table};
use crate::storage::compression::{CompressionStrategy, CompressionStream};

/// Bytes that deflate cannot shrink, so components are counted exactly.
fn noise(len: usize, seed: u32) -> Vec<u8> {
    let mut x = seed.wrapping_mul(2_654_435_761).max(1);
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            x.to_le_bytes()[0]
        })
        .collect()
}

#[test]
fn test_multi_component_tags_round_trip() {
    let mut table = new_table(30, 2048);
    let sizes = [0, 1, 400, 2048, 5000, 20_000, 70_000];
    for (i, size) in (0u32..).zip(sizes) {
        table
            .add(format!("big{i}").as_bytes(), &noise(size, i), false)
            .expect("add");
    }
    assert_eq!(table.get_entry_count(), sizes.len() as u64);
    assert_consistent(&table);

    table.commit(1).expect("commit");
    let mut table = reopen(table);
    for (i, size) in (0u32..).zip(sizes) {
        let tag = table
            .get_exact_entry(format!("big{i}").as_bytes())
            .expect("get")
            .expect("present");
        assert_eq!(tag, noise(size, i));
    }
}

#[test]
fn test_replacing_long_tag_with_short_removes_components() {
    let mut table = new_table(31, 2048);
    table.add(b"a", b"first", false).expect("add");
    table.add(b"long", &noise(30_000, 1), false).expect("add");
    table.add(b"z", b"last", false).expect("add");
    let blocks_with_long = check_table(&table).expect("check").blocks.len();

    table.add(b"long", b"short now", false).expect("replace");
    assert_eq!(table.get_entry_count(), 3);
    assert_eq!(
        table.get_exact_entry(b"long").expect("get"),
        Some(b"short now".to_vec())
    );
    let report = check_table(&table).expect("check");
    assert!(report.blocks.len() < blocks_with_long);

    let keys: Vec<Vec<u8>> = all_entries(&table).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![b"a".to_vec(), b"long".to_vec(), b"z".to_vec()]);

    table.add(b"long", &noise(9000, 2), false).expect("grow again");
    assert_eq!(table.get_exact_entry(b"long").expect("get"), Some(noise(9000, 2)));
    assert!(table.del(b"long").expect("del"));
    assert_eq!(table.get_entry_count(), 2);
    assert_consistent(&table);
}

#[test]
fn test_compressible_tags_are_stored_compressed() {
    let tag = b"posting ".repeat(500);

    let mut plain = Table::new(
        TABLE_NAME,
        SimulatedStorage::new(32),
        &TableConfig {
            block_size: 2048,
            compression: CompressionStrategy::NoCompression,
            ..TableConfig::default()
        },
    );
    plain.create_and_open(2048).expect("create");
    let mut packed = new_table(33, 2048);
    for i in 0..20 {
        plain.add(&term_key(i), &tag, false).expect("add");
        packed.add(&term_key(i), &tag, false).expect("add");
    }

    let plain_blocks = check_table(&plain).expect("check").blocks.len();
    let packed_blocks = check_table(&packed).expect("check").blocks.len();
    assert!(packed_blocks < plain_blocks);
    assert_eq!(packed.get_exact_entry(&term_key(7)).expect("get"), Some(tag.clone()));

    let mut cursor = packed.cursor().expect("cursor");
    assert!(cursor.find_entry(&packed, &term_key(3)).expect("find"));
    assert!(cursor.read_tag(&packed, true).expect("read tag"));
    let mut stream = CompressionStream::new(CompressionStrategy::Default);
    assert_eq!(stream.decompress(cursor.current_tag()).expect("inflate"), tag);
}

#[test]
fn test_already_compressed_tag_is_inflated_on_read() {
    let tag = b"abcabcabc".repeat(300);
    let mut stream = CompressionStream::new(CompressionStrategy::Filtered);
    let compressed = stream.compress(&tag).expect("compress").expect("shrinks");

    let mut table = new_table(34, 4096);
    table.add(b"pre", &compressed, true).expect("add");
    assert_eq!(table.get_exact_entry(b"pre").expect("get"), Some(tag));

    let mut cursor = table.cursor().expect("cursor");
    assert!(cursor.find_entry(&table, b"pre").expect("find"));
    assert!(cursor.read_tag(&table, true).expect("read tag"));
    assert_eq!(cursor.current_tag(), &compressed[..]);
}
