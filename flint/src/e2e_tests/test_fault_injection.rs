//! Transactions under injected I/O errors always recover to the last
//! committed revision.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::e2e_tests::helpers::*;
use crate::simulation::{FaultConfig, SimulatedStorage};
use crate::storage::btree::{Table, TableError};

type Model = BTreeMap<Vec<u8>, Vec<u8>>;

fn faults() -> FaultConfig {
    FaultConfig {
        read_error_rate: 0.005,
        write_error_rate: 0.005,
        sync_error_rate: 0.05,
        ..FaultConfig::no_faults()
    }
}

fn run_transaction(
    table: &mut Table<SimulatedStorage>,
    rng: &mut StdRng,
    pending: &mut Model,
    revision: u32,
) -> Result<(), TableError> {
    for _ in 0..30 {
        let key = format!("f{:05}", rng.random_range(0..3000)).into_bytes();
        if rng.random_bool(0.25) {
            pending.remove(&key);
            table.del(&key)?;
        } else {
            let tag = vec![b'a' + rng.random_range(0..26u8); rng.random_range(1..80)];
            pending.insert(key.clone(), tag.clone());
            table.add(&key, &tag, false)?;
        }
    }
    table.commit(revision)
}

#[test]
fn test_recovery_after_injected_faults() {
    let mut rng = StdRng::seed_from_u64(0xfa17);
    let mut table = new_table(80, 2048);
    table.storage_mut().set_fault_config(faults());

    let mut committed = Model::new();
    let mut revision = 0;
    let mut failures = 0;

    for _ in 0..60 {
        let mut pending = committed.clone();
        if run_transaction(&mut table, &mut rng, &mut pending, revision + 1).is_ok() {
            committed = pending;
            revision += 1;
            continue;
        }
        failures += 1;

        let mut storage = table.into_storage();
        storage.crash();
        storage.set_fault_config(FaultConfig::no_faults());
        table = Table::new(TABLE_NAME, storage, &config(2048));
        table.open().expect("Failed to reopen after fault");

        // A fault after the new base was written leaves the commit durable.
        if table.get_open_revision_number() == revision + 1 {
            committed = pending;
            revision += 1;
        }
        assert_eq!(table.get_open_revision_number(), revision);
        let expected: Vec<(Vec<u8>, Vec<u8>)> = committed
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        assert_eq!(all_entries(&table), expected);
        assert_consistent(&table);

        table.storage_mut().set_fault_config(faults());
    }

    assert!(failures > 0, "no fault was injected");
    assert!(revision > 0, "no transaction committed");
}
