//! Dump WAL command implementation.

use super::{CliResult, OutputFormat};
use keeldb_core::wal::{MutationOp, WalManager, WalRecord, WalTail};
use keeldb_core::{DatabaseDir, DatabasePath};
use keeldb_storage::FileBackend;
use serde::Serialize;
use std::path::Path;

/// WAL record representation for output.
#[derive(Debug, Serialize)]
pub struct WalRecordInfo {
    /// Offset in the WAL file.
    pub offset: u64,
    /// Log sequence number.
    pub lsn: u64,
    /// Transaction ID.
    pub txid: u64,
    /// Mutations in application order.
    pub mutations: Vec<MutationInfo>,
}

/// One mutation inside a record.
#[derive(Debug, Serialize)]
pub struct MutationInfo {
    /// `put` or `delete`.
    pub op: &'static str,
    /// Table tag.
    pub table: String,
    /// Key, lossily decoded as UTF-8.
    pub key: String,
    /// Value size in bytes (puts only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_len: Option<usize>,
    /// Write time in Unix millis (puts only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
}

/// Records read from the log and how the walk ended.
#[derive(Debug, Serialize)]
pub struct WalDump {
    /// Records in log order.
    pub records: Vec<WalRecordInfo>,
    /// Whether the walk stopped at a torn tail.
    pub torn_tail: bool,
    /// Error that stopped the walk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<(u64, WalRecord)> for WalRecordInfo {
    fn from((offset, record): (u64, WalRecord)) -> Self {
        let mutations = record
            .mutations
            .into_iter()
            .map(|m| {
                let (op, value_len, updated_at) = match &m.op {
                    MutationOp::Put { value, updated_at } => {
                        ("put", Some(value.len()), Some(*updated_at))
                    }
                    MutationOp::Delete => ("delete", None, None),
                };
                MutationInfo {
                    op,
                    table: m.table.to_string(),
                    key: String::from_utf8_lossy(&m.key).into_owned(),
                    value_len,
                    updated_at,
                }
            })
            .collect();
        Self {
            offset,
            lsn: record.lsn.as_u64(),
            txid: record.txid.as_u64(),
            mutations,
        }
    }
}

/// Reads up to `limit` records from the WAL of the database at `path`.
pub fn read_records(path: &Path, limit: Option<usize>) -> CliResult<WalDump> {
    let dir = DatabaseDir::open(&DatabasePath::new(path)?, false)?;
    if !dir.wal_path().exists() {
        return Err("WAL file not found".into());
    }

    let wal = WalManager::new(Box::new(FileBackend::open(&dir.wal_path())?), false);
    let mut dump = WalDump {
        records: Vec::new(),
        torn_tail: false,
        error: None,
    };

    let max_records = limit.unwrap_or(usize::MAX);
    let mut iter = wal.iter()?;
    while dump.records.len() < max_records {
        match iter.next() {
            Some(Ok(item)) => dump.records.push(item.into()),
            Some(Err(e)) => {
                dump.error = Some(e.to_string());
                break;
            }
            None => {
                dump.torn_tail = iter.tail() == WalTail::Torn;
                break;
            }
        }
    }

    Ok(dump)
}

/// Runs the dump-wal command.
pub fn run(path: &Path, limit: Option<usize>, format: OutputFormat) -> CliResult<()> {
    let dump = read_records(path, limit)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&dump)?),
        OutputFormat::Text => print_text_output(&dump),
    }
    Ok(())
}

fn print_text_output(dump: &WalDump) {
    if dump.records.is_empty() {
        println!("WAL is empty");
    }
    for record in &dump.records {
        println!(
            "[{:>8}] lsn {} txid {} ({} mutations)",
            record.offset,
            record.lsn,
            record.txid,
            record.mutations.len()
        );
        for m in &record.mutations {
            match m.value_len {
                Some(len) => println!("    {} {}/{:?} ({len} bytes)", m.op, m.table, m.key),
                None => println!("    {} {}/{:?}", m.op, m.table, m.key),
            }
        }
    }
    if dump.torn_tail {
        println!("-- torn tail");
    }
    if let Some(err) = &dump.error {
        println!("-- stopped: {err}");
    }
}
