//! Changing the tree: copy-on-write, inserts with splits, deletes with
//! merges.
//!
//! Every function here works on the built-in cursor, which a preceding
//! `find` has positioned. After a split the cursor levels above the leaf
//! may no longer be parent and child; the next `find` from the root
//! repairs that.

use tracing::trace;

use crate::storage::btree::block::{self, BYTES_PER_BLOCK_NUMBER, D2, DIR_START};
use crate::storage::btree::item::{self, C2, I2, Item, ItemWriter, K1, Key, MAX_KEY_LEN};
use crate::storage::btree::path::{BLK_UNUSED, BlockLoader, CursorLevel};
use crate::storage::btree::table::{MAX_LEVELS, SEQ_START_POINT, Table, TableError};
use crate::storage::io::Storage;

/// Room for any internal item.
const SEPARATOR_CAPACITY: usize = I2 + K1 + MAX_KEY_LEN + C2 + BYTES_PER_BLOCK_NUMBER;

const NULL_ITEM_SIZE: usize = I2 + K1 + BYTES_PER_BLOCK_NUMBER;

/// What happened to an under-full block.
enum Rebalance {
    /// Folded into a sibling; the parent lost an entry.
    Merged,
    /// Refilled from a sibling; the parent's separator changed.
    Borrowed,
    Untouched,
}

/// Bytes of `new` to keep in a level-1 separator: enough to sort after
/// `prev`.
fn separator_length(prev: Key<'_>, new: Key<'_>) -> usize {
    let new_len = new.length();
    let common = prev
        .bytes()
        .iter()
        .zip(new.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    if common < new_len { common + 1 } else { new_len }
}

impl<S: Storage> Table<S> {
    /// Make the path from the leaf up safe to modify.
    ///
    /// A block committed in an earlier revision moves to a block free at the
    /// start of this transaction, and its parent is repointed, up to the
    /// first block already being rewritten or allocated in this
    /// transaction.
    pub(super) fn alter(&mut self) {
        let mut j = 0;
        loop {
            if self.path[j].rewrite {
                return;
            }
            self.path[j].rewrite = true;
            let n = self.path[j].n;
            if self.core.base.block_free_at_start(n) {
                return;
            }
            self.core.base.free_block(n);
            let n = self.core.base.next_free_block();
            self.path[j].n = n;
            block::set_revision(&mut self.path[j].block, self.core.latest_revision_number + 1);
            if j == self.core.level {
                return;
            }
            j += 1;
            let c = self.path[j].c;
            item::set_block_given_by(&mut self.path[j].block, c, n);
        }
    }

    /// Store `kt` at the leaf position found for it.
    ///
    /// Returns the component count of the item it replaced, or 0 for a
    /// fresh insertion.
    pub(super) fn add_kt(&mut self, kt: &ItemWriter, found: bool) -> Result<u16, TableError> {
        self.alter();
        let new = kt.as_bytes();

        if !found {
            if self.changed_n == self.path[0].n && self.changed_c == self.path[0].c {
                if self.seq_count < 0 {
                    self.seq_count += 1;
                }
            } else {
                self.seq_count = SEQ_START_POINT;
                self.core.sequential = false;
            }
            self.path[0].c += D2;
            self.add_item(new, 0)?;
            return Ok(0);
        }

        self.seq_count = SEQ_START_POINT;
        self.core.sequential = false;

        let c = self.path[0].c;
        let p: &mut [u8] = &mut self.path[0].block;
        let (old_size, components) = {
            let item = Item::at(p, c);
            (item.size(), item.components_of())
        };
        if new.len() <= old_size {
            let o = block::item_offset(p, c);
            p[o..o + new.len()].copy_from_slice(new);
            block::set_total_free(p, block::total_free(p) + old_size - new.len());
        } else if block::max_free(p) >= new.len() {
            let max_free = block::max_free(p) - new.len();
            let o = block::dir_end(p) + max_free;
            p[o..o + new.len()].copy_from_slice(new);
            block::set_item_offset(p, c, o);
            block::set_max_free(p, max_free);
            block::set_total_free(p, block::total_free(p) - (new.len() - old_size));
        } else {
            self.delete_item(0, false)?;
            self.add_item(new, 0)?;
        }
        Ok(components)
    }

    /// Insert `item` at `path[j].c`, splitting the block if it is full.
    pub(super) fn add_item(&mut self, item: &[u8], j: usize) -> Result<(), TableError> {
        let mut c = self.path[j].c;
        let needed = item.len() + D2;
        let n;

        if block::total_free(&self.path[j].block) < needed {
            // Sequential inserts split at the insertion point so the lower
            // half stays full.
            let m = if self.seq_count < 0 {
                block::mid_point(&self.path[j].block)
            } else {
                c
            };

            let split_n = self.path[j].n;
            self.path[j].n = self.core.base.next_free_block();

            self.split_p.copy_from_slice(&self.path[j].block);
            block::set_dir_end(&mut self.split_p, m);
            block::compact(&mut self.split_p, &mut self.scratch);

            let p: &mut [u8] = &mut self.path[j].block;
            let residue = block::dir_end(p) - m;
            p.copy_within(m..m + residue, DIR_START);
            block::set_dir_end(p, DIR_START + residue);
            block::compact(p, &mut self.scratch);

            let add_to_upper_half = if self.seq_count < 0 {
                c >= m
            } else {
                block::total_free(&self.split_p) < needed
            };
            if add_to_upper_half {
                c -= m - DIR_START;
                block::insert_item(&mut self.path[j].block, item, c);
                n = self.path[j].n;
            } else {
                block::insert_item(&mut self.split_p, item, c);
                n = split_n;
            }

            self.core.write_block(split_n, &mut self.split_p)?;
            trace!(
                table = %self.core.name,
                level = j,
                lower = split_n,
                upper = self.path[j].n,
                "split block"
            );

            if j == self.core.level {
                self.split_root(split_n)?;
            }
            self.enter_key(j + 1)?;
        } else {
            let p: &mut [u8] = &mut self.path[j].block;
            if block::max_free(p) < needed {
                block::compact(p, &mut self.scratch);
            }
            block::insert_item(p, item, c);
            n = self.path[j].n;
        }

        if j == 0 {
            self.changed_n = n;
            self.changed_c = c;
        }
        Ok(())
    }

    /// Grow the tree by one level above a root that just split into
    /// `split_n` and the block in the cursor.
    fn split_root(&mut self, split_n: u32) -> Result<(), TableError> {
        let level = self.core.level + 1;
        if level >= MAX_LEVELS {
            return Err(TableError::Corrupt(format!(
                "table '{}' has grown impossibly large ({MAX_LEVELS} levels)",
                self.core.name
            )));
        }
        self.core.level = level;

        let mut root = CursorLevel::new(self.core.block_size);
        block::init(&mut root.block, level, self.core.latest_revision_number + 1);
        root.n = self.core.base.next_free_block();
        root.c = DIR_START;
        root.rewrite = true;
        self.path.push(root);

        let mut item = ItemWriter::new(NULL_ITEM_SIZE);
        item.form_null_key(split_n);
        self.add_item(item.as_bytes(), level)?;
        trace!(table = %self.core.name, level, "root split");
        Ok(())
    }

    /// Enter the separator between the two halves of a split at level
    /// `j - 1` into level `j`.
    ///
    /// The lower half is in `split_p`; the upper half is in the cursor.
    fn enter_key(&mut self, j: usize) -> Result<(), TableError> {
        let blocknumber = self.path[j - 1].n;
        let mut sep = ItemWriter::new(SEPARATOR_CAPACITY);
        {
            let prevkey = Item::at(&self.split_p, block::dir_end(&self.split_p) - D2).key();
            let newkey = Item::at(&self.path[j - 1].block, DIR_START).key();
            let len = if j == 1 {
                separator_length(prevkey, newkey)
            } else {
                newkey.length()
            };
            sep.set_key_and_block(newkey, len, blocknumber);
        }

        if j > 1 {
            // The key now lives in the parent; the first key of an internal
            // block is never compared.
            let p: &mut [u8] = &mut self.path[j - 1].block;
            let o = block::item_offset(p, DIR_START);
            let child = Item::from_offset(p, o).block_given_by();
            let lost = item::null_key_in_place(p, o, child);
            block::set_total_free(p, block::total_free(p) + lost);
        }

        self.path[j].c += D2;
        self.path[j].rewrite = true;
        self.add_item(sep.as_bytes(), j)
    }

    /// Remove the leaf entry for `key`.
    ///
    /// Returns the component count of the removed item, or 0 if `key` was
    /// not there.
    pub(super) fn delete_kt(&mut self, key: Key<'_>) -> Result<u16, TableError> {
        if !self.find(key)? {
            return Ok(0);
        }
        self.seq_count = SEQ_START_POINT;
        self.core.sequential = false;

        let components = Item::at(&self.path[0].block, self.path[0].c).components_of();
        self.alter();
        self.delete_item(0, true)?;
        self.rebalance()?;
        Ok(components)
    }

    /// Remove the item at `path[j].c`.
    ///
    /// With `repeatedly`, an emptied block is freed and removed from its
    /// parent in turn, and a root left with one child loses a level.
    fn delete_item(&mut self, j: usize, repeatedly: bool) -> Result<(), TableError> {
        let c = self.path[j].c;
        block::remove_item(&mut self.path[j].block, c);
        if !repeatedly {
            return Ok(());
        }

        if j < self.core.level {
            if block::dir_end(&self.path[j].block) == DIR_START {
                self.core.base.free_block(self.path[j].n);
                self.path[j].reset();
                self.path[j + 1].rewrite = true;
                return self.delete_item(j + 1, true);
            }
            Ok(())
        } else {
            self.lose_levels()
        }
    }

    /// Drop root levels that have a single child.
    fn lose_levels(&mut self) -> Result<(), TableError> {
        while self.core.level > 0
            && block::dir_end(&self.path[self.core.level].block) == DIR_START + D2
        {
            let level = self.core.level;
            let new_root = Item::at(&self.path[level].block, DIR_START).block_given_by();
            self.core.base.free_block(self.path[level].n);
            self.path.pop();
            self.core.level = level - 1;
            self.core.load(&mut self.path, level - 1, new_root)?;
            trace!(table = %self.core.name, level = level - 1, "root lost a level");
        }
        Ok(())
    }

    /// Fix up under-full blocks on the path after a removal, lowest first.
    fn rebalance(&mut self) -> Result<(), TableError> {
        let mut j = 0;
        while j < self.core.level && self.path[j].n == BLK_UNUSED {
            j += 1;
        }
        while j < self.core.level && self.is_under_full(j) {
            match self.fix_under_full(j)? {
                Rebalance::Merged => j += 1,
                Rebalance::Borrowed | Rebalance::Untouched => break,
            }
        }
        self.lose_levels()
    }

    fn is_under_full(&self, j: usize) -> bool {
        block::used_space(&self.path[j].block) * 4 < self.core.block_size - DIR_START
    }

    /// Merge `path[j]` with a sibling under the same parent, or at leaf
    /// level move items over from a sibling too full to merge with.
    ///
    /// The sibling is read into `split_p`.
    fn fix_under_full(&mut self, j: usize) -> Result<Rebalance, TableError> {
        let parent = &self.path[j + 1].block;
        let pc = self.path[j + 1].c;
        let (left_c, right_c, block_is_left) = if pc + D2 < block::dir_end(parent) {
            (pc, pc + D2, true)
        } else if pc > DIR_START {
            (pc - D2, pc, false)
        } else {
            return Ok(Rebalance::Untouched);
        };
        let sibling_c = if block_is_left { right_c } else { left_c };
        let sibling_n = Item::at(parent, sibling_c).block_given_by();
        let parent_revision = block::revision(parent);

        self.core.read_block(sibling_n, &mut self.split_p)?;
        if block::level(&self.split_p) != j {
            return Err(TableError::Corrupt(format!(
                "expected block {sibling_n} to be level {j}, not {}",
                block::level(&self.split_p)
            )));
        }
        if block::revision(&self.split_p) > parent_revision {
            return Err(TableError::overwritten(self.core.writable));
        }

        let (left, right) = if block_is_left {
            (&self.path[j].block, &self.split_p)
        } else {
            (&self.split_p, &self.path[j].block)
        };
        let mut needed = block::used_space(left) + block::used_space(right);
        if j > 0 {
            // The right block's dummy first key becomes the parent's
            // separator for it.
            let sep_len = Item::at(&self.path[j + 1].block, right_c).key().length();
            needed = needed + I2 + K1 + sep_len + C2 + BYTES_PER_BLOCK_NUMBER
                - Item::at(right, DIR_START).size();
        }

        if needed <= self.core.block_size - DIR_START {
            self.merge(j, left_c, right_c, block_is_left, sibling_n)?;
            Ok(Rebalance::Merged)
        } else if j == 0 {
            self.borrow_items(j, sibling_c, right_c, block_is_left, sibling_n)?;
            Ok(Rebalance::Borrowed)
        } else {
            Ok(Rebalance::Untouched)
        }
    }

    /// Fold `path[j]` and its sibling (in `split_p`) into `path[j]`, free
    /// the sibling and drop the right block's parent entry.
    fn merge(
        &mut self,
        j: usize,
        left_c: usize,
        right_c: usize,
        block_is_left: bool,
        sibling_n: u32,
    ) -> Result<(), TableError> {
        let mut merged = vec![0u8; self.core.block_size];
        block::init(&mut merged, j, self.core.latest_revision_number + 1);
        let left_items;
        {
            let (left, right) = if block_is_left {
                (&self.path[j].block, &self.split_p)
            } else {
                (&self.split_p, &self.path[j].block)
            };
            left_items = block::item_count(left);
            for c in (DIR_START..block::dir_end(left)).step_by(D2) {
                let at = block::dir_end(&merged);
                block::insert_item(&mut merged, Item::at(left, c).as_bytes(), at);
            }
            for c in (DIR_START..block::dir_end(right)).step_by(D2) {
                let at = block::dir_end(&merged);
                if j > 0 && c == DIR_START {
                    let mut sep = ItemWriter::new(SEPARATOR_CAPACITY);
                    let key = Item::at(&self.path[j + 1].block, right_c).key();
                    sep.set_key_and_block(key, key.length(), Item::at(right, c).block_given_by());
                    block::insert_item(&mut merged, sep.as_bytes(), at);
                } else {
                    block::insert_item(&mut merged, Item::at(right, c).as_bytes(), at);
                }
            }
        }

        self.path[j].block.copy_from_slice(&merged);
        if !block_is_left {
            self.path[j].c += left_items * D2;
            let n = self.path[j].n;
            item::set_block_given_by(&mut self.path[j + 1].block, left_c, n);
        }
        self.core.base.free_block(sibling_n);

        self.path[j + 1].c = right_c;
        self.path[j + 1].rewrite = true;
        self.delete_item(j + 1, false)?;
        self.path[j + 1].c = left_c;
        trace!(
            table = %self.core.name,
            level = j,
            block = self.path[j].n,
            freed = sibling_n,
            "merged blocks"
        );
        Ok(())
    }

    /// Move leaf items from the sibling in `split_p` into `path[0]` until
    /// the two hold about the same, then rewrite the sibling and the
    /// separator of the right one.
    fn borrow_items(
        &mut self,
        j: usize,
        sibling_c: usize,
        right_c: usize,
        block_is_left: bool,
        sibling_n: u32,
    ) -> Result<(), TableError> {
        let target =
            (block::used_space(&self.path[j].block) + block::used_space(&self.split_p)) / 2;
        let mut moved = 0;
        loop {
            let from = if block_is_left {
                DIR_START
            } else {
                block::dir_end(&self.split_p) - D2
            };
            let size = Item::at(&self.split_p, from).size();
            if block::item_count(&self.split_p) <= 1
                || block::used_space(&self.path[j].block) + size + D2 > target
            {
                break;
            }
            let p: &mut [u8] = &mut self.path[j].block;
            if block::max_free(p) < size + D2 {
                block::compact(p, &mut self.scratch);
            }
            let to = if block_is_left { block::dir_end(p) } else { DIR_START };
            block::insert_item(p, Item::at(&self.split_p, from).as_bytes(), to);
            block::remove_item(&mut self.split_p, from);
            moved += 1;
        }
        if moved == 0 {
            return Ok(());
        }
        if !block_is_left {
            self.path[j].c += moved * D2;
        }

        // The sibling changed, so it is copied like any other block.
        let mut n = sibling_n;
        if !self.core.base.block_free_at_start(n) {
            self.core.base.free_block(n);
            n = self.core.base.next_free_block();
            item::set_block_given_by(&mut self.path[j + 1].block, sibling_c, n);
        }
        block::set_revision(&mut self.split_p, self.core.latest_revision_number + 1);
        self.core.write_block(n, &mut self.split_p)?;

        let mut sep = ItemWriter::new(SEPARATOR_CAPACITY);
        {
            let (left, right, right_n) = if block_is_left {
                (&self.path[j].block, &self.split_p, n)
            } else {
                (&self.split_p, &self.path[j].block, self.path[j].n)
            };
            let prevkey = Item::at(left, block::dir_end(left) - D2).key();
            let newkey = Item::at(right, DIR_START).key();
            sep.set_key_and_block(newkey, separator_length(prevkey, newkey), right_n);
        }
        self.path[j + 1].c = right_c;
        self.path[j + 1].rewrite = true;
        self.delete_item(j + 1, false)?;
        self.add_item(sep.as_bytes(), j + 1)?;
        trace!(
            table = %self.core.name,
            level = j,
            moved,
            from = n,
            "moved items between blocks"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::simulation::SimulatedStorage;

    fn key(k: &[u8]) -> ItemWriter {
        let mut kt = ItemWriter::new(64);
        kt.form_key(k).expect("form key");
        kt
    }

    #[test]
    fn test_separator_length() {
        assert_eq!(separator_length(key(b"abc").key(), key(b"abd").key()), 3);
        assert_eq!(separator_length(key(b"abc").key(), key(b"b").key()), 1);
        // Prefix of the new key: one byte past it.
        assert_eq!(separator_length(key(b"ab").key(), key(b"abcd").key()), 3);
        // Same key bytes, later component: keep it all.
        assert_eq!(separator_length(key(b"ab").key(), key(b"ab").key()), 2);
    }

    fn table() -> Table<SimulatedStorage> {
        let config = TableConfig {
            block_size: 2048,
            ..TableConfig::default()
        };
        let mut table = Table::new("update", SimulatedStorage::new(11), &config);
        table.create_and_open(2048).expect("create");
        table
    }

    #[test]
    fn test_splits_grow_levels_and_deletes_shrink_them() {
        // 7919 is prime, so this visits every key once in scattered order.
        let order = |i: usize| format!("key{:05}", i * 7919 % 2000);
        let mut table = table();
        for i in 0..2000 {
            table.add(order(i).as_bytes(), &[b'v'; 200], false).expect("add");
        }
        assert!(table.core.level >= 2, "level {}", table.core.level);
        assert_eq!(table.path.len(), table.core.level + 1);

        for i in 0..2000 {
            let k = order(i);
            assert!(table.del(k.as_bytes()).expect("del"), "missing {k}");
        }
        assert_eq!(table.core.level, 0);
        assert_eq!(table.get_entry_count(), 0);
        assert!(table.is_empty().expect("is_empty"));
    }

    #[test]
    fn test_deleting_absent_key_keeps_sequential_state() {
        let mut table = table();
        for i in 0..20 {
            table
                .add(format!("seq{i:04}").as_bytes(), b"tag", false)
                .expect("add");
        }
        let seq_count = table.seq_count;
        let sequential = table.core.sequential;
        assert!(seq_count > SEQ_START_POINT, "appends were not counted");

        assert!(!table.del(b"absent").expect("del"));
        assert_eq!(table.seq_count, seq_count);
        assert_eq!(table.core.sequential, sequential);

        assert!(table.del(b"seq0005").expect("del"));
        assert_eq!(table.seq_count, SEQ_START_POINT);
        assert!(!table.core.sequential);
    }

    #[test]
    fn test_sequential_inserts_fill_blocks() {
        let mut sequential = table();
        let mut shuffled = table();
        for i in 0..600 {
            let k = format!("seq{i:04}");
            sequential.add(k.as_bytes(), b"tag", false).expect("add");
        }
        // Same keys, interleaved from both ends.
        for i in 0..300 {
            for k in [format!("seq{i:04}"), format!("seq{:04}", 599 - i)] {
                shuffled.add(k.as_bytes(), b"tag", false).expect("add");
            }
        }
        sequential.flush_db().expect("flush");
        shuffled.flush_db().expect("flush");
        sequential.core.base.calculate_last_block();
        shuffled.core.base.calculate_last_block();
        assert!(sequential.core.base.last_block() <= shuffled.core.base.last_block());
    }

    #[test]
    fn test_copy_on_write_moves_committed_blocks() {
        let mut table = table();
        for i in 0..300 {
            table
                .add(format!("k{i:04}").as_bytes(), b"v", false)
                .expect("add");
        }
        table.commit(1).expect("commit");
        let root = table.path[table.core.level].n;

        table.add(b"k0150x", b"new", false).expect("add");
        assert_ne!(table.path[table.core.level].n, root);
        assert!(table.core.base.block_free_now(root));
        assert!(!table.core.base.block_free_at_start(root));
        table.cancel().expect("cancel");
        assert_eq!(table.path[table.core.level].n, root);
    }
}
