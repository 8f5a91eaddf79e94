//! Deterministic simulation support.
//!
//! [`SimulatedStorage`] keeps a table's files in memory, separates
//! buffered block writes from durable ones and can inject faults, so crash
//! and recovery paths can be tested from a seed.

mod storage;

pub use storage::{FaultConfig, SimulatedStorage, SimulatedStorageStats};
