#![cfg_attr(not(test), deny(clippy::unwrap_used))]
//! `flint-check`: open a table read-only and verify its structure.
//!
//! ```text
//! flint-check <prefix> [--tree]
//! ```
//!
//! Exits non-zero if the table cannot be opened or fails a check.

use std::process::ExitCode;

use flint::config::TableConfig;
use flint::storage::FileStorage;
use flint::storage::btree::{CheckReport, Table, check_table};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flint=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let Some(prefix) = args.next() else {
        eprintln!("usage: flint-check <prefix> [--tree]");
        return ExitCode::from(2);
    };
    let show_tree = match args.next().as_deref() {
        None => false,
        Some("--tree") => true,
        Some(other) => {
            eprintln!("unknown option '{other}'");
            return ExitCode::from(2);
        }
    };

    let config = match TableConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let table = match Table::open_read_only(prefix.as_str(), FileStorage::new(&prefix), &config) {
        Ok(table) => table,
        Err(e) => {
            tracing::error!(table = %prefix, "Failed to open table: {e}");
            return ExitCode::FAILURE;
        }
    };

    match check_table(&table) {
        Ok(report) => {
            print_report(&prefix, &report, show_tree);
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(table = %prefix, "Check failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_report(prefix: &str, report: &CheckReport, show_tree: bool) {
    println!("table {prefix}");
    println!("  revision:   {}", report.revision);
    println!("  block size: {}", report.block_size);
    println!("  levels:     {}", report.level + 1);
    println!("  entries:    {}", report.item_count);
    println!("  last block: {}", report.last_block);
    for (level, count) in report.blocks_per_level.iter().enumerate().rev() {
        println!("  level {level}: {count} block(s)");
    }
    if report.faked_root {
        println!("  root is faked (no blocks written)");
    }

    if show_tree {
        for block in &report.blocks {
            let indent = "  ".repeat(report.level - block.level + 1);
            println!(
                "{indent}block {} (level {}, revision {}): {} items, {} bytes free",
                block.n, block.level, block.revision, block.items, block.total_free
            );
        }
    }
    println!("no errors found");
}
