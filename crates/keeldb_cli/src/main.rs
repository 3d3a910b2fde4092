//! keeldb CLI
//!
//! Command-line tools for keeldb database management.
//!
//! # Commands
//!
//! - `inspect` - Display superblock and file metadata
//! - `verify` - Recover the database and check every tree
//! - `dump-wal` - Dump WAL records for debugging
//! - `get`, `put`, `delete`, `keys` - Single-table data access
//! - `tables` - List non-empty tables
//! - `checkpoint` - Force a checkpoint

mod commands;

use clap::{Parser, Subcommand};
use commands::OutputFormat;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// keeldb command-line database tools.
#[derive(Parser)]
#[command(name = "keeldb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display superblock and file metadata without running recovery
    Inspect {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Recover the database and check every tree and value chain
    Verify {
        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Dump WAL records for debugging
    DumpWal {
        /// Maximum number of records to dump
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Print the value stored under a key
    Get {
        /// Table tag
        #[arg(short, long)]
        table: String,

        /// Key (UTF-8)
        key: String,
    },

    /// Store a value under a key
    Put {
        /// Table tag
        #[arg(short, long)]
        table: String,

        /// Key (UTF-8)
        key: String,

        /// Value (UTF-8)
        value: String,
    },

    /// Remove a key
    Delete {
        /// Table tag
        #[arg(short, long)]
        table: String,

        /// Key (UTF-8)
        key: String,
    },

    /// List keys of a table in order
    Keys {
        /// Table tag
        #[arg(short, long)]
        table: String,

        /// Maximum number of keys to print
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// List non-empty tables
    Tables,

    /// Write a new superblock and truncate the WAL
    Checkpoint,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let path = cli.path.ok_or("Database path required (--path)")?;

    match cli.command {
        Commands::Inspect { format } => commands::inspect::run(&path, format)?,
        Commands::Verify { format } => commands::verify::run(&path, format)?,
        Commands::DumpWal { limit, format } => commands::dump_wal::run(&path, limit, format)?,
        Commands::Get { table, key } => commands::data::get(&path, &table, &key)?,
        Commands::Put { table, key, value } => commands::data::put(&path, &table, &key, &value)?,
        Commands::Delete { table, key } => commands::data::delete(&path, &table, &key)?,
        Commands::Keys { table, limit } => commands::data::keys(&path, &table, limit)?,
        Commands::Tables => commands::data::tables(&path)?,
        Commands::Checkpoint => commands::data::checkpoint(&path)?,
    }

    Ok(())
}
