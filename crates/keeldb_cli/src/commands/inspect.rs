//! Inspect command implementation.
//!
//! Reads the superblock and walks the WAL framing without running recovery,
//! so it shows the files exactly as a crash left them. The directory lock is
//! still taken.

use super::{format_size, CliResult, OutputFormat};
use keeldb_core::block::{BlockStore, Superblock, BLOCK_SIZE};
use keeldb_core::wal::{WalManager, WalTail};
use keeldb_core::{BlockId, DatabaseDir, DatabasePath};
use keeldb_storage::{FileBackend, StorageBackend};
use serde::Serialize;
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Block file size in bytes.
    pub block_file_size: u64,
    /// Whole blocks in the block file.
    pub block_count: u64,
    /// WAL file size in bytes.
    pub wal_size: u64,
    /// Newest valid superblock, if any checkpoint completed.
    pub superblock: Option<SuperblockInfo>,
    /// Readable WAL records.
    pub wal_records: usize,
    /// LSN of the first and last readable records.
    pub wal_lsn_range: Option<(u64, u64)>,
    /// Whether the WAL ends in a torn record.
    pub wal_torn_tail: bool,
    /// Error that stopped the WAL walk early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wal_error: Option<String>,
}

/// Superblock fields.
#[derive(Debug, Serialize)]
pub struct SuperblockInfo {
    /// Checkpoint generation.
    pub generation: u64,
    /// Last LSN covered by the checkpoint.
    pub checkpoint_lsn: u64,
    /// Next transaction id.
    pub next_txid: u64,
    /// Block count at checkpoint time.
    pub block_count: u64,
    /// Catalog tree root (0 = empty).
    pub catalog_root: u64,
}

/// Gathers inspection data for the database at `path`.
pub fn inspect(path: &Path) -> CliResult<InspectResult> {
    let dir = DatabaseDir::open(&DatabasePath::new(path)?, false)?;
    if dir.is_new_database() {
        return Err(format!("No database found at {}", path.display()).into());
    }

    let block_backend = FileBackend::open(&dir.block_path())?;
    let block_file_size = block_backend.size()?;
    let blocks = BlockStore::open(Box::new(block_backend), None)?;
    let superblock = Superblock::load(&blocks)?.map(|sb| SuperblockInfo {
        generation: sb.generation,
        checkpoint_lsn: sb.checkpoint_lsn.as_u64(),
        next_txid: sb.next_txid.as_u64(),
        block_count: sb.block_count,
        catalog_root: BlockId::to_raw(sb.catalog_root),
    });

    let wal_backend = FileBackend::open(&dir.wal_path())?;
    let wal_size = wal_backend.size()?;
    let wal = WalManager::new(Box::new(wal_backend), false);

    let mut result = InspectResult {
        path: path.display().to_string(),
        block_file_size,
        block_count: block_file_size / BLOCK_SIZE as u64,
        wal_size,
        superblock,
        wal_records: 0,
        wal_lsn_range: None,
        wal_torn_tail: false,
        wal_error: None,
    };

    let mut records = wal.iter()?;
    for item in records.by_ref() {
        match item {
            Ok((_, record)) => {
                let lsn = record.lsn.as_u64();
                result.wal_lsn_range = Some(match result.wal_lsn_range {
                    Some((first, _)) => (first, lsn),
                    None => (lsn, lsn),
                });
                result.wal_records += 1;
            }
            Err(e) => {
                result.wal_error = Some(e.to_string());
                break;
            }
        }
    }
    result.wal_torn_tail = records.tail() == WalTail::Torn;

    Ok(result)
}

/// Runs the inspect command.
pub fn run(path: &Path, format: OutputFormat) -> CliResult<()> {
    let result = inspect(path)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("keeldb Database Inspection");
    println!("==========================");
    println!();
    println!("Path: {}", result.path);
    println!();
    println!("Storage:");
    println!(
        "  Block file:  {} bytes ({} blocks)",
        format_size(result.block_file_size),
        result.block_count
    );
    println!("  WAL size:    {} bytes", format_size(result.wal_size));
    println!();
    match &result.superblock {
        Some(sb) => {
            println!("Superblock:");
            println!("  Generation:     {}", sb.generation);
            println!("  Checkpoint LSN: {}", sb.checkpoint_lsn);
            println!("  Next txid:      {}", sb.next_txid);
            println!("  Block count:    {}", sb.block_count);
            println!("  Catalog root:   {}", sb.catalog_root);
        }
        None => println!("Superblock: none (no checkpoint completed)"),
    }
    println!();
    println!("WAL:");
    println!("  Records:   {}", result.wal_records);
    if let Some((first, last)) = result.wal_lsn_range {
        println!("  LSN range: {first}..={last}");
    }
    if result.wal_torn_tail {
        println!("  Torn tail: yes (discarded on next open)");
    }
    if let Some(err) = &result.wal_error {
        println!("  Error:     {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeldb_core::{failpoint, Database};

    #[test]
    fn inspect_closed_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.table("t").unwrap().write(b"k", b"v").unwrap();
        db.close().unwrap();

        let result = inspect(dir.path()).unwrap();
        let sb = result.superblock.unwrap();
        assert_eq!(sb.checkpoint_lsn, 1);
        assert_ne!(sb.catalog_root, 0);
        assert_eq!(result.wal_records, 0);
        assert!(!result.wal_torn_tail);
    }

    #[test]
    fn inspect_shows_uncheckpointed_records() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let t = db.table("t").unwrap();
        t.write(b"a", b"1").unwrap();
        failpoint::enable(failpoint::COMMIT_BEFORE_PUBLISH);
        assert!(t.write(b"b", b"2").is_err());
        failpoint::clear();
        db.close().unwrap();

        let result = inspect(dir.path()).unwrap();
        assert_eq!(result.wal_records, 2);
        assert_eq!(result.wal_lsn_range, Some((1, 2)));
        assert_eq!(result.superblock.unwrap().checkpoint_lsn, 0);
    }

    #[test]
    fn inspect_missing_database_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(inspect(&dir.path().join("nothing")).is_err());
        assert!(inspect(dir.path()).is_err());
    }
}
