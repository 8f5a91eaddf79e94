//! Simulated in-memory storage for deterministic testing.
//!
//! This module provides an in-memory implementation of the `Storage` trait
//! with support for fault injection:
//! - Block-level read/write errors
//! - Byte-level corruption (bit flips) on read
//! - Partial block writes
//! - Sync failures
//! - Base file write failures, to interrupt a commit at its last step
//!
//! Block writes stay pending until `sync`; [`SimulatedStorage::crash`]
//! throws away whatever was not synced.

use std::cell::RefCell;
use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::storage::base::BaseLetter;
use crate::storage::io::{Storage, StorageError};

/// Configuration for fault injection.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a read error (0.0 - 1.0).
    pub read_error_rate: f64,
    /// Probability of a write error (0.0 - 1.0).
    pub write_error_rate: f64,
    /// Probability of a sync error (0.0 - 1.0).
    pub sync_error_rate: f64,
    /// Probability of block corruption on read (0.0 - 1.0).
    pub corruption_rate: f64,
    /// Probability of partial write (0.0 - 1.0).
    pub partial_write_rate: f64,
}

impl FaultConfig {
    /// Create a fault config with no faults (for baseline testing).
    #[must_use]
    pub fn no_faults() -> Self {
        Self::default()
    }
}

/// Statistics about simulated storage operations.
#[derive(Debug, Default, Clone)]
pub struct SimulatedStorageStats {
    /// Number of block reads.
    pub reads: u64,
    /// Number of block writes.
    pub writes: u64,
    /// Number of syncs.
    pub syncs: u64,
    /// Number of base file writes.
    pub base_writes: u64,
    /// Number of injected read errors.
    pub injected_read_errors: u64,
    /// Number of injected write errors.
    pub injected_write_errors: u64,
    /// Number of injected sync errors.
    pub injected_sync_errors: u64,
    /// Number of corrupted blocks returned.
    pub corrupted_reads: u64,
    /// Number of partial writes.
    pub partial_writes: u64,
}

/// In-memory table files for deterministic testing.
///
/// # Thread Safety
///
/// This implementation is not thread-safe. The RNG and statistics sit in
/// `RefCell`s so reads can go through `&self`.
pub struct SimulatedStorage {
    /// Block contents as of the last sync.
    durable: HashMap<u32, Vec<u8>>,
    /// Block writes since the last sync.
    pending: HashMap<u32, Vec<u8>>,
    data_exists: bool,
    data_open: bool,
    bases: [Option<Vec<u8>>; 2],

    /// Fault injection configuration.
    fault_config: FaultConfig,
    /// Fail every base file write while set.
    fail_base_writes: bool,
    /// Random number generator for fault injection.
    rng: RefCell<StdRng>,

    stats: RefCell<SimulatedStorageStats>,
}

impl SimulatedStorage {
    /// Create a new simulated storage with the given seed.
    ///
    /// The seed ensures deterministic behavior - the same seed will
    /// produce the same sequence of faults.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, FaultConfig::default())
    }

    /// Create a new simulated storage with custom fault configuration.
    #[must_use]
    pub fn with_config(seed: u64, fault_config: FaultConfig) -> Self {
        Self {
            durable: HashMap::new(),
            pending: HashMap::new(),
            data_exists: false,
            data_open: false,
            bases: [None, None],
            fault_config,
            fail_base_writes: false,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            stats: RefCell::new(SimulatedStorageStats::default()),
        }
    }

    /// Get the current statistics.
    #[must_use]
    pub fn stats(&self) -> SimulatedStorageStats {
        self.stats.borrow().clone()
    }

    /// Update the fault configuration.
    pub fn set_fault_config(&mut self, config: FaultConfig) {
        self.fault_config = config;
    }

    /// Make every base file write fail (or succeed again).
    pub const fn set_fail_base_writes(&mut self, fail: bool) {
        self.fail_base_writes = fail;
    }

    /// Lose every block write that was not synced, and close the data file.
    pub fn crash(&mut self) {
        self.pending.clear();
        self.data_open = false;
    }

    /// Raw contents of a base slot.
    #[must_use]
    pub fn base(&self, letter: BaseLetter) -> Option<&[u8]> {
        self.bases[letter.index()].as_deref()
    }

    /// Flip a byte in a base slot, if it exists.
    pub fn corrupt_base(&mut self, letter: BaseLetter) {
        if let Some(byte) = self.bases[letter.index()]
            .as_mut()
            .and_then(|bytes| bytes.last_mut())
        {
            *byte ^= 0xff;
        }
    }

    /// Check if a fault should be injected based on the given rate.
    fn should_inject_fault(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        self.rng.borrow_mut().random::<f64>() < rate
    }

    /// Corrupt a block by flipping random bits.
    fn corrupt_block(&self, block: &mut [u8]) {
        let mut rng = self.rng.borrow_mut();
        let num_flips = rng.random_range(1..=8);
        for _ in 0..num_flips {
            let byte_offset = rng.random_range(0..block.len());
            let bit = rng.random_range(0..8u8);
            block[byte_offset] ^= 1 << bit;
        }
    }

    /// Simulate a partial write by zeroing out the tail of the block.
    fn make_partial_write(&self, block: &mut [u8]) {
        let cutoff = self.rng.borrow_mut().random_range(0..block.len());
        block[cutoff..].fill(0);
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.data_open {
            Ok(())
        } else {
            Err(StorageError::NotFound("simulated data file".to_string()))
        }
    }
}

impl Storage for SimulatedStorage {
    fn data_exists(&self) -> bool {
        self.data_exists
    }

    fn open_data(&mut self, create: bool, _writable: bool) -> Result<(), StorageError> {
        if create {
            self.durable.clear();
            self.pending.clear();
            self.data_exists = true;
        } else if !self.data_exists {
            return Err(StorageError::NotFound("simulated data file".to_string()));
        }
        self.data_open = true;
        Ok(())
    }

    fn close_data(&mut self) {
        self.data_open = false;
    }

    fn read_block(&self, n: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        self.stats.borrow_mut().reads += 1;
        self.check_open()?;

        if self.should_inject_fault(self.fault_config.read_error_rate) {
            self.stats.borrow_mut().injected_read_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated read error".to_string(),
            ));
        }

        let Some(block) = self.pending.get(&n).or_else(|| self.durable.get(&n)) else {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("block {n} was never written"),
            )));
        };
        buf.copy_from_slice(block);

        if self.should_inject_fault(self.fault_config.corruption_rate) {
            self.stats.borrow_mut().corrupted_reads += 1;
            self.corrupt_block(buf);
        }
        Ok(())
    }

    fn write_block(&mut self, n: u32, buf: &[u8]) -> Result<(), StorageError> {
        self.stats.borrow_mut().writes += 1;
        self.check_open()?;

        if self.should_inject_fault(self.fault_config.write_error_rate) {
            self.stats.borrow_mut().injected_write_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated write error".to_string(),
            ));
        }

        let mut block = buf.to_vec();
        if self.should_inject_fault(self.fault_config.partial_write_rate) {
            self.stats.borrow_mut().partial_writes += 1;
            self.make_partial_write(&mut block);
        }
        self.pending.insert(n, block);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.stats.borrow_mut().syncs += 1;
        self.check_open()?;

        if self.should_inject_fault(self.fault_config.sync_error_rate) {
            self.stats.borrow_mut().injected_sync_errors += 1;
            return Err(StorageError::InjectedFault(
                "simulated sync error".to_string(),
            ));
        }

        self.durable.extend(self.pending.drain());
        Ok(())
    }

    fn read_base(&self, letter: BaseLetter) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.bases[letter.index()].clone())
    }

    fn write_base(&mut self, letter: BaseLetter, bytes: &[u8]) -> Result<(), StorageError> {
        self.stats.borrow_mut().base_writes += 1;
        if self.fail_base_writes {
            return Err(StorageError::InjectedFault(format!(
                "simulated failure writing base{}",
                letter.as_char()
            )));
        }
        self.bases[letter.index()] = Some(bytes.to_vec());
        Ok(())
    }

    fn remove_base(&mut self, letter: BaseLetter) -> Result<(), StorageError> {
        self.bases[letter.index()] = None;
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        self.durable.clear();
        self.pending.clear();
        self.bases = [None, None];
        self.data_exists = false;
        self.data_open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_storage(seed: u64, config: FaultConfig) -> SimulatedStorage {
        let mut storage = SimulatedStorage::with_config(seed, config);
        storage.open_data(true, true).expect("create");
        storage
    }

    #[test]
    fn test_simulated_storage_basic() {
        let mut storage = open_storage(12345, FaultConfig::no_faults());
        storage.write_block(2, &[7u8; 64]).expect("write");

        let mut buf = [0u8; 64];
        storage.read_block(2, &mut buf).expect("read");
        assert_eq!(buf, [7u8; 64]);
        assert!(storage.read_block(3, &mut buf).is_err());
    }

    #[test]
    fn test_crash_loses_unsynced_writes() {
        let mut storage = open_storage(1, FaultConfig::no_faults());
        storage.write_block(0, &[1u8; 16]).expect("write");
        storage.sync().expect("sync");
        storage.write_block(0, &[2u8; 16]).expect("write");
        storage.write_block(1, &[3u8; 16]).expect("write");

        storage.crash();
        storage.open_data(false, true).expect("reopen");

        let mut buf = [0u8; 16];
        storage.read_block(0, &mut buf).expect("read");
        assert_eq!(buf, [1u8; 16]);
        assert!(storage.read_block(1, &mut buf).is_err());
    }

    #[test]
    fn test_base_write_failure_keeps_old_contents() {
        let mut storage = SimulatedStorage::new(1);
        storage.write_base(BaseLetter::A, b"old").expect("write");
        storage.set_fail_base_writes(true);
        assert!(matches!(
            storage.write_base(BaseLetter::A, b"new"),
            Err(StorageError::InjectedFault(_))
        ));
        assert_eq!(storage.base(BaseLetter::A), Some(&b"old"[..]));
        assert_eq!(storage.stats().base_writes, 2);
    }

    #[test]
    fn test_simulated_storage_fault_injection() {
        let config = FaultConfig {
            read_error_rate: 1.0,
            ..Default::default()
        };
        let mut storage = open_storage(12345, config);
        storage.write_block(1, &[0u8; 8]).expect("write");

        let mut buf = [0u8; 8];
        let result = storage.read_block(1, &mut buf);
        assert!(matches!(result, Err(StorageError::InjectedFault(_))));
        assert_eq!(storage.stats().injected_read_errors, 1);
    }

    #[test]
    fn test_simulated_storage_deterministic() {
        let config = FaultConfig {
            read_error_rate: 0.5,
            ..Default::default()
        };

        let run = |config: FaultConfig| {
            let mut storage = open_storage(12345, config);
            for n in 0..10 {
                storage.write_block(n, &[0u8; 8]).expect("write");
            }
            let mut buf = [0u8; 8];
            (0..10)
                .map(|n| storage.read_block(n, &mut buf).is_ok())
                .collect::<Vec<_>>()
        };

        assert_eq!(
            run(config.clone()),
            run(config),
            "Same seed should produce same fault pattern"
        );
    }
}
