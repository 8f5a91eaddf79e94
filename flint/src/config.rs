//! Table configuration.
//!
//! Settings that apply when a table is created or opened. They can be
//! built directly or loaded from environment variables.
//!
//! # Environment Variables
//!
//! - `FLINT_BLOCK_SIZE`: block size for newly created tables (default: `8192`)
//! - `FLINT_COMPRESSION`: one of `none`, `default`, `filtered`, `huffman`, `rle` (default: `default`)
//! - `FLINT_LAZY`: `true` to create the table on first write (default: `false`)
//! - `FLINT_FULL_COMPACTION`: `true` to pack blocks fully on split (default: `false`)
//!
//! # Invariants
//!
//! - `block_size` from `from_env()` is a power of two in 2048..=65536

use crate::storage::btree::block::{DEFAULT_BLOCK_SIZE, is_valid_block_size};
use crate::storage::compression::CompressionStrategy;

/// Settings for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableConfig {
    /// Block size used by `create_and_open`. An existing table keeps the
    /// block size recorded in its base file.
    pub block_size: usize,
    /// How tags are compressed.
    pub compression: CompressionStrategy,
    /// Defer creating the files until the first commit with changes.
    pub lazy: bool,
    /// Split blocks as full as possible, for tables built once and then
    /// only read.
    pub full_compaction: bool,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            compression: CompressionStrategy::default(),
            lazy: false,
            full_compaction: false,
        }
    }
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl TableConfig {
    /// Load configuration from environment variables. Unset variables
    /// take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not
    /// parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let block_size = match lookup("FLINT_BLOCK_SIZE") {
            Some(value) => parse_block_size(&value)?,
            None => defaults.block_size,
        };
        let compression = match lookup("FLINT_COMPRESSION") {
            Some(value) => {
                CompressionStrategy::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
                    name: "FLINT_COMPRESSION".to_string(),
                    message: format!("'{value}' is not a compression strategy"),
                })?
            }
            None => defaults.compression,
        };
        let lazy = match lookup("FLINT_LAZY") {
            Some(value) => parse_flag("FLINT_LAZY", &value)?,
            None => defaults.lazy,
        };
        let full_compaction = match lookup("FLINT_FULL_COMPACTION") {
            Some(value) => parse_flag("FLINT_FULL_COMPACTION", &value)?,
            None => defaults.full_compaction,
        };

        Ok(Self {
            block_size,
            compression,
            lazy,
            full_compaction,
        })
    }
}

fn parse_block_size(value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(size) if is_valid_block_size(size) => Ok(size),
        _ => Err(ConfigError::InvalidValue {
            name: "FLINT_BLOCK_SIZE".to_string(),
            message: format!("'{value}' is not a power of two between 2048 and 65536"),
        }),
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a boolean"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<TableConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        TableConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).expect("defaults");
        assert_eq!(config, TableConfig::default());
        assert_eq!(config.block_size, 8192);
        assert_eq!(config.compression, CompressionStrategy::Default);
    }

    #[test]
    fn test_all_values_set() {
        let config = load(&[
            ("FLINT_BLOCK_SIZE", "4096"),
            ("FLINT_COMPRESSION", "rle"),
            ("FLINT_LAZY", "true"),
            ("FLINT_FULL_COMPACTION", "1"),
        ])
        .expect("config");
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.compression, CompressionStrategy::RunLength);
        assert!(config.lazy);
        assert!(config.full_compaction);
    }

    #[test]
    fn test_invalid_block_size() {
        for bad in ["1000", "3000", "131072", "big"] {
            let err = load(&[("FLINT_BLOCK_SIZE", bad)]).expect_err("must reject");
            assert!(matches!(err, ConfigError::InvalidValue { ref name, .. } if name == "FLINT_BLOCK_SIZE"));
        }
    }

    #[test]
    fn test_invalid_flag() {
        let err = load(&[("FLINT_LAZY", "maybe")]).expect_err("must reject");
        assert_eq!(
            err.to_string(),
            "invalid value for FLINT_LAZY: 'maybe' is not a boolean"
        );
    }
}
