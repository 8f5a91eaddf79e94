//! Structural checker.
//!
//! Walks every block reachable from the root and verifies the invariants
//! the table relies on. The walk reads through the same loader as
//! external cursors, so a writer is checked including its unflushed
//! changes.

use std::collections::HashSet;

use crate::storage::btree::block::{self, D2, DIR_START};
use crate::storage::btree::item::Item;
use crate::storage::btree::path::{BlockLoader, CursorLevel};
use crate::storage::btree::table::{Handle, SnapshotLoader, Table, TableError};
use crate::storage::io::Storage;

/// One block seen by the checker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSummary {
    pub level: usize,
    pub n: u32,
    pub revision: u32,
    pub items: usize,
    pub total_free: usize,
}

/// What the checker found in a table that passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub revision: u32,
    pub level: usize,
    pub block_size: usize,
    pub item_count: u64,
    pub last_block: u32,
    /// Number of blocks at each level, leaves first.
    pub blocks_per_level: Vec<u64>,
    pub faked_root: bool,
    /// Every block in depth-first order, parents before children.
    pub blocks: Vec<BlockSummary>,
}

struct Checker<'a, S: Storage> {
    table: &'a Table<S>,
    loader: SnapshotLoader<'a, S>,
    path: Vec<CursorLevel>,
    seen: HashSet<u32>,
    leaf_entries: u64,
    blocks_per_level: Vec<u64>,
    blocks: Vec<BlockSummary>,
}

impl<S: Storage> Checker<'_, S> {
    fn failure(n: u32, msg: &str) -> TableError {
        TableError::Corrupt(format!("block {n}: {msg}"))
    }

    fn block_check(&mut self, j: usize) -> Result<(), TableError> {
        let n = self.path[j].n;
        let p = &self.path[j].block;
        let block_size = p.len();
        let dir_end = block::dir_end(p);
        let max_free = block::max_free(p);

        if !self.seen.insert(n) {
            return Err(Self::failure(n, "block is used twice"));
        }
        if !self.table.core.faked_root_block && self.table.core.base.block_free_now(n) {
            return Err(Self::failure(n, "block in use is marked free"));
        }
        if block::level(p) != j {
            return Err(Self::failure(n, "block has wrong level"));
        }
        if dir_end <= DIR_START || dir_end > block_size {
            return Err(Self::failure(n, "directory end pointer invalid"));
        }

        let significant_c = if j == 0 { DIR_START } else { DIR_START + D2 };
        let mut total_free = block_size - dir_end;
        for c in (DIR_START..dir_end).step_by(D2) {
            let o = block::item_offset(p, c);
            if o > block_size {
                return Err(Self::failure(n, "item starts outside block"));
            }
            if o < dir_end + max_free {
                return Err(Self::failure(n, "item overlaps directory"));
            }
            let item = Item::at(p, c);
            if o + item.size() > block_size {
                return Err(Self::failure(n, "item ends outside block"));
            }
            total_free = total_free.saturating_sub(item.size());
            if c > significant_c && Item::at(p, c - D2).key() >= item.key() {
                return Err(Self::failure(n, "items not in sorted order"));
            }
            if j == 0 && item.component_of() == 1 {
                self.leaf_entries += 1;
            }
        }
        if total_free != block::total_free(p) {
            return Err(Self::failure(n, "stored total free space value wrong"));
        }

        self.blocks_per_level[j] += 1;
        self.blocks.push(BlockSummary {
            level: j,
            n,
            revision: block::revision(p),
            items: block::item_count(p),
            total_free,
        });
        if j == 0 {
            return Ok(());
        }

        for c in (DIR_START..dir_end).step_by(D2) {
            self.path[j].c = c;
            let child = Item::at(&self.path[j].block, c).block_given_by();
            self.loader.load(&mut self.path, j - 1, child)?;
            self.block_check(j - 1)?;

            let p = &self.path[j].block;
            let q = &self.path[j - 1].block;
            if c > DIR_START {
                // The dummy first key of an internal child is never compared.
                let first = if j == 1 { DIR_START } else { DIR_START + D2 };
                if first < block::dir_end(q) && Item::at(q, first).key() < Item::at(p, c).key() {
                    return Err(Self::failure(child, "key < left dividing key in level above"));
                }
            }
            let q_end = block::dir_end(q);
            if c + D2 < dir_end
                && (j == 1 || DIR_START + D2 < q_end)
                && Item::at(q, q_end - D2).key() >= Item::at(p, c + D2).key()
            {
                return Err(Self::failure(child, "key >= right dividing key in level above"));
            }
            if block::revision(q) > block::revision(p) {
                return Err(Self::failure(child, "child block has greater revision than parent"));
            }
        }
        Ok(())
    }
}

/// Check the whole tree of an open table.
pub fn check_table<S: Storage>(table: &Table<S>) -> Result<CheckReport, TableError> {
    match table.core.handle {
        Handle::Closed => return Err(TableError::Closed),
        Handle::Unopened => {
            return Err(TableError::Opening(format!(
                "table '{}' is not open",
                table.core.name
            )));
        }
        Handle::Open => {}
    }

    let level = table.core.level;
    let block_size = table.core.block_size;
    let mut checker = Checker {
        table,
        loader: table.snapshot(),
        path: (0..=level).map(|_| CursorLevel::new(block_size)).collect(),
        seen: HashSet::new(),
        leaf_entries: 0,
        blocks_per_level: vec![0; level + 1],
        blocks: Vec::new(),
    };
    let root = table.path[level].n;
    checker.loader.load(&mut checker.path, level, root)?;
    checker.block_check(level)?;

    // The empty key is always there and never counted.
    let entries = checker.leaf_entries.saturating_sub(1);
    if entries != table.core.item_count {
        return Err(TableError::Corrupt(format!(
            "table '{}' has {entries} entries but records {}",
            table.core.name, table.core.item_count
        )));
    }

    Ok(CheckReport {
        revision: table.core.revision_number,
        level,
        block_size,
        item_count: entries,
        last_block: table.core.base.last_block(),
        blocks_per_level: checker.blocks_per_level,
        faked_root: table.core.faked_root_block,
        blocks: checker.blocks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::simulation::SimulatedStorage;

    fn table() -> Table<SimulatedStorage> {
        let config = TableConfig {
            block_size: 2048,
            ..TableConfig::default()
        };
        let mut table = Table::new("check", SimulatedStorage::new(31), &config);
        table.create_and_open(2048).expect("create");
        table
    }

    #[test]
    fn test_check_faked_root() {
        let table = table();
        let report = check_table(&table).expect("check");
        assert!(report.faked_root);
        assert_eq!(report.item_count, 0);
        assert_eq!(report.blocks_per_level, vec![1]);
    }

    #[test]
    fn test_check_multi_level_tree() {
        let mut table = table();
        for i in 0..1500 {
            table
                .add(format!("entry{i:05}").as_bytes(), &[b'x'; 30], false)
                .expect("add");
        }
        let report = check_table(&table).expect("check before commit");
        assert_eq!(report.item_count, 1500);
        assert!(report.level >= 1);
        assert_eq!(report.blocks_per_level[report.level], 1);

        table.commit(1).expect("commit");
        let report = check_table(&table).expect("check after commit");
        assert_eq!(report.revision, 1);
        assert!(!report.faked_root);
        assert_eq!(report.blocks.len() as u64, report.blocks_per_level.iter().sum::<u64>());
    }

    #[test]
    fn test_check_detects_wrong_count() {
        let mut table = table();
        table.add(b"a", b"1", false).expect("add");
        table.core.item_count = 5;
        assert!(matches!(check_table(&table), Err(TableError::Corrupt(_))));
    }
}
