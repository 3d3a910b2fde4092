//! Verify command implementation.
//!
//! Opens the database (running recovery), then walks every tree and value
//! chain.

use super::{CliResult, OutputFormat};
use keeldb_core::{Config, Database};
use serde::Serialize;
use std::path::Path;

/// Verification result.
#[derive(Debug, Serialize)]
pub struct VerifyResult {
    /// Transactions replayed while opening.
    pub replayed: u64,
    /// Whether recovery discarded a torn WAL tail.
    pub torn_tail: bool,
    /// Non-empty tables.
    pub tables: usize,
    /// Entries across all tables.
    pub entries: u64,
    /// Catalog and table node blocks.
    pub tree_blocks: u64,
    /// Overflow value blocks.
    pub overflow_blocks: u64,
    /// Deepest tree.
    pub max_depth: usize,
    /// Blocks in the file.
    pub total_blocks: u64,
    /// Blocks ready for reuse.
    pub free_blocks: u64,
    /// Blocks neither reachable nor free.
    pub unaccounted_blocks: u64,
    /// Problem found, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerifyResult {
    fn is_ok(&self) -> bool {
        self.error.is_none() && self.unaccounted_blocks == 0
    }
}

/// Verifies the database at `path`.
pub fn verify(path: &Path) -> CliResult<VerifyResult> {
    let db = Database::open_with_config(path, Config::default().create_if_missing(false))?;
    let recovery = db.recovery_report().clone();

    let mut result = VerifyResult {
        replayed: recovery.replayed,
        torn_tail: recovery.torn_tail,
        tables: 0,
        entries: 0,
        tree_blocks: 0,
        overflow_blocks: 0,
        max_depth: 0,
        total_blocks: 0,
        free_blocks: 0,
        unaccounted_blocks: 0,
        error: None,
    };

    match db.verify() {
        Ok(report) => {
            result.tables = report.tables;
            result.entries = report.entries;
            result.tree_blocks = report.tree_blocks;
            result.overflow_blocks = report.overflow_blocks;
            result.max_depth = report.max_depth;
            result.total_blocks = report.usage.total;
            result.free_blocks = report.usage.free + report.usage.pending;
            result.unaccounted_blocks = report.unaccounted;
        }
        Err(e) => result.error = Some(e.to_string()),
    }

    db.close()?;
    Ok(result)
}

/// Runs the verify command.
pub fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let result = verify(path)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_result(path, &result),
    }

    if result.is_ok() {
        Ok(())
    } else {
        Err("Verification failed".into())
    }
}

fn print_result(path: &Path, result: &VerifyResult) {
    println!("Verifying database at {}", path.display());
    println!();
    println!("Recovery:");
    println!("  Replayed transactions: {}", result.replayed);
    if result.torn_tail {
        println!("  Discarded a torn WAL tail");
    }
    println!();
    println!("Trees:");
    println!("  Tables:          {}", result.tables);
    println!("  Entries:         {}", result.entries);
    println!("  Tree blocks:     {}", result.tree_blocks);
    println!("  Overflow blocks: {}", result.overflow_blocks);
    println!("  Max depth:       {}", result.max_depth);
    println!();
    println!("Blocks:");
    println!("  Total:       {}", result.total_blocks);
    println!("  Free:        {}", result.free_blocks);
    println!("  Unaccounted: {}", result.unaccounted_blocks);
    println!();
    if let Some(err) = &result.error {
        println!("  Error: {err}");
    }
    if result.is_ok() {
        println!("✓ Database verification passed");
    } else {
        println!("✗ Database verification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_database_passes() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let t = db.table("t").unwrap();
        for i in 0..300u32 {
            t.write(&i.to_be_bytes(), &vec![1u8; (i as usize % 7) * 200]).unwrap();
        }
        db.close().unwrap();

        let result = verify(dir.path()).unwrap();
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(result.tables, 1);
        assert_eq!(result.entries, 300);
        assert!(result.overflow_blocks > 0);
    }

    #[test]
    fn missing_database_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(verify(&dir.path().join("absent")).is_err());
    }

    #[test]
    fn damaged_block_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.table("t").unwrap().write(b"k", b"v").unwrap();
        db.close().unwrap();

        let blocks = keeldb_core::block_path(dir.path());
        let mut bytes = std::fs::read(&blocks).unwrap();
        let last = bytes.len() - keeldb_core::block::BLOCK_SIZE + 12;
        bytes[last] ^= 0xFF;
        std::fs::write(&blocks, bytes).unwrap();

        assert!(verify(dir.path()).is_err());
    }
}
