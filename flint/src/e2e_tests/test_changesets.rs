//! Replaying changesets onto a second copy of a table.

use crate::e2e_tests::helpers::*;
use crate::simulation::SimulatedStorage;
use crate::storage::base::BaseLetter;
use crate::storage::btree::Table;
use crate::storage::changes::{ChangeEntry, parse_changes};
use crate::storage::io::Storage;

fn apply(replica: &mut SimulatedStorage, changes: &[u8]) {
    for entry in parse_changes(changes).expect("Malformed changeset") {
        match entry {
            ChangeEntry::Blocks {
                name,
                block_size,
                blocks,
            } => {
                assert_eq!(name, TABLE_NAME);
                assert_eq!(block_size, 2048);
                for (n, block) in blocks {
                    replica.write_block(n, &block).expect("write block");
                }
                replica.sync().expect("sync");
            }
            ChangeEntry::Base {
                name,
                letter,
                bytes,
            } => {
                assert_eq!(name, TABLE_NAME);
                let letter = if letter == 'A' { BaseLetter::A } else { BaseLetter::B };
                replica.write_base(letter, &bytes).expect("write base");
            }
        }
    }
}

#[test]
fn test_replica_follows_master() {
    let mut master = new_table(60, 2048);
    let mut replica = SimulatedStorage::new(61);
    replica.open_data(true, true).expect("create replica");

    for revision in 1..=3u32 {
        let start = (revision as usize - 1) * 300;
        for i in start..start + 300 {
            master.add(&term_key(i), &doc_list(i), false).expect("add");
        }
        for i in (0..start).step_by(5) {
            master.del(&term_key(i)).expect("del");
        }

        let mut changes = Vec::new();
        master.write_changed_blocks(&mut changes).expect("changed blocks");
        master
            .commit_with_changes(revision, &mut changes)
            .expect("commit");
        apply(&mut replica, &changes);
    }

    replica.close_data();
    let copy = Table::open_read_only(TABLE_NAME, replica, &config(2048)).expect("open replica");
    assert_eq!(copy.get_open_revision_number(), 3);
    assert_eq!(copy.get_entry_count(), master.get_entry_count());
    assert_eq!(all_entries(&copy), all_entries(&master));
    assert_consistent(&copy);
}

#[test]
fn test_untouched_table_has_no_block_list() {
    let mut table = new_table(62, 2048);
    let mut changes = Vec::new();
    table.write_changed_blocks(&mut changes).expect("changed blocks");
    assert!(changes.is_empty());

    table.commit_with_changes(1, &mut changes).expect("commit");
    let entries = parse_changes(&changes).expect("parse");
    assert!(matches!(
        entries.as_slice(),
        [ChangeEntry::Base { letter: 'B', .. }]
    ));
}
