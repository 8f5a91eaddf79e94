//! End-to-end tests at the table API level.
//!
//! Each test file covers a specific scenario, running whole transactions
//! against simulated storage (or real files where readers and writers
//! share them) and verifying the tree with the checker afterwards.

#![cfg(test)]

mod helpers;

mod test_changesets;
mod test_crash_recovery;
mod test_cursor_order;
mod test_fault_injection;
mod test_large_tags;
mod test_lazy_tables;
mod test_random_workload;
mod test_readers;
mod test_term_scenario;
