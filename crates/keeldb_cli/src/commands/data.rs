//! Data access commands: get, put, delete, keys, tables, checkpoint.

use super::CliResult;
use keeldb_core::{Config, Database, Table};
use std::path::Path;

fn open_existing(path: &Path) -> CliResult<Database> {
    Ok(Database::open_with_config(
        path,
        Config::default().create_if_missing(false),
    )?)
}

fn existing_table(path: &Path, tag: &str) -> CliResult<Table> {
    Ok(open_existing(path)?.table(tag)?)
}

/// Prints the value stored under `key`, or fails if there is none.
pub fn get(path: &Path, tag: &str, key: &str) -> CliResult<()> {
    let mut table = existing_table(path, tag)?;
    let value = table.read(key.as_bytes())?;
    table.close()?;
    match value {
        Some(value) => {
            println!("{}", String::from_utf8_lossy(&value));
            Ok(())
        }
        None => Err(format!("key {key:?} not found in {tag}").into()),
    }
}

/// Stores `value` under `key`, creating the database if needed.
pub fn put(path: &Path, tag: &str, key: &str, value: &str) -> CliResult<()> {
    let mut table = Table::open(path, tag)?;
    table.write(key.as_bytes(), value.as_bytes())?;
    table.close()?;
    Ok(())
}

/// Removes `key`.
pub fn delete(path: &Path, tag: &str, key: &str) -> CliResult<()> {
    let mut table = existing_table(path, tag)?;
    let removed = table.delete(key.as_bytes())?;
    table.close()?;
    if !removed {
        eprintln!("key {key:?} was not present");
    }
    Ok(())
}

/// Prints keys of a table in order.
pub fn keys(path: &Path, tag: &str, limit: Option<usize>) -> CliResult<()> {
    let mut table = existing_table(path, tag)?;
    let keys = table.keys()?;
    table.close()?;
    for key in keys.iter().take(limit.unwrap_or(usize::MAX)) {
        println!("{}", String::from_utf8_lossy(key));
    }
    Ok(())
}

/// Prints every non-empty table with its key count.
pub fn tables(path: &Path) -> CliResult<()> {
    let db = open_existing(path)?;
    for tag in db.tables()? {
        let count = db.table(tag.as_str())?.len()?;
        println!("{tag}\t{count}");
    }
    db.close()?;
    Ok(())
}

/// Forces a checkpoint.
pub fn checkpoint(path: &Path) -> CliResult<()> {
    let db = open_existing(path)?;
    db.checkpoint()?;
    println!("checkpoint complete at {}", db.last_lsn());
    db.close()?;
    Ok(())
}
