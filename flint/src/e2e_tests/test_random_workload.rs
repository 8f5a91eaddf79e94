//! Random inserts and deletes checked against an in-memory model.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::*;
use crate::simulation::SimulatedStorage;
use crate::storage::btree::{Table, check_table};

fn random_tag(rng: &mut StdRng) -> Vec<u8> {
    let len = rng.random_range(0..120);
    (0..len).map(|_| rng.random_range(b'a'..=b'f')).collect()
}

fn assert_matches_model(table: &Table<SimulatedStorage>, model: &BTreeMap<Vec<u8>, Vec<u8>>) {
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(all_entries(table), expected);
    assert_eq!(table.get_entry_count(), model.len() as u64);
    assert_consistent(table);
}

#[test]
fn test_insert_then_delete_all_in_random_order() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut table = new_table(10, 2048);

    let mut keys: Vec<Vec<u8>> = (0..3000).map(|i| format!("k{i:06}").into_bytes()).collect();
    keys.shuffle(&mut rng);
    for key in &keys {
        table.add(key, &[b'v'; 40], false).expect("add");
    }
    let report = check_table(&table).expect("check");
    assert!(report.level >= 1);
    table.commit(1).expect("commit");

    keys.shuffle(&mut rng);
    for key in &keys {
        assert!(table.del(key).expect("del"));
    }
    assert_eq!(table.get_entry_count(), 0);
    assert!(table.is_empty().expect("is_empty"));
    assert_consistent(&table);

    table.commit(2).expect("commit");
    let table = reopen(table);
    assert!(table.is_empty().expect("is_empty"));
    let report = check_table(&table).expect("check");
    assert_eq!(report.level, 0);
}

#[test]
fn test_mixed_workload_across_commits() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut table = new_table(11, 2048);
    let mut model = BTreeMap::new();

    for revision in 1..=6 {
        for _ in 0..800 {
            let key = format!("w{:04}", rng.random_range(0..1500)).into_bytes();
            if rng.random_bool(0.3) {
                let existed = model.remove(&key).is_some();
                assert_eq!(table.del(&key).expect("del"), existed);
            } else {
                let tag = random_tag(&mut rng);
                table.add(&key, &tag, false).expect("add");
                model.insert(key, tag);
            }
        }
        assert_matches_model(&table, &model);
        table.commit(revision).expect("commit");
        if revision % 2 == 0 {
            table = reopen(table);
            assert_eq!(table.get_open_revision_number(), revision);
        }
        assert_matches_model(&table, &model);
    }

    for (key, tag) in &model {
        assert_eq!(table.get_exact_entry(key).expect("get").as_ref(), Some(tag));
    }
}

#[test]
fn test_cancelled_transactions_leave_committed_state() {
    let mut rng = StdRng::seed_from_u64(7);
    let mut table = new_table(12, 2048);
    let mut model = BTreeMap::new();
    for i in 0..1000 {
        let key = format!("c{i:04}").into_bytes();
        let tag = random_tag(&mut rng);
        table.add(&key, &tag, false).expect("add");
        model.insert(key, tag);
    }
    table.commit(1).expect("commit");

    for _ in 0..3 {
        for _ in 0..500 {
            let key = format!("c{:04}", rng.random_range(0..2000)).into_bytes();
            if rng.random_bool(0.5) {
                table.del(&key).expect("del");
            } else {
                table.add(&key, b"scratch", false).expect("add");
            }
        }
        table.cancel().expect("cancel");
        assert_matches_model(&table, &model);
    }
}
