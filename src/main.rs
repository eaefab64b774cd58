//! ohcache - Snapshot Tooling
//!
//! Command-line companion for the off-heap cache.
//!
//! # Commands
//!
//! ```text
//! ohcache inspect <file> [--json]        header, block and record summary; verifies checksums
//! ohcache demo --entries N --out <file>  fill a table, write a snapshot, read it back
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ohcache::cache::alloc::{Allocator, HeapAllocator};
use ohcache::{AllocatorKind, CacheConfig, SegmentedTable, SnapshotReader};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Off-heap cache snapshot tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Summarize a snapshot file and verify every record
    Inspect {
        /// Snapshot file
        file: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fill a table with generated entries and save a snapshot
    Demo {
        /// Number of entries to generate
        #[arg(long, default_value = "10000")]
        entries: u64,

        /// Snapshot output file
        #[arg(long)]
        out: PathBuf,

        /// Table capacity in bytes
        #[arg(long, env = "OHCACHE_CAPACITY", default_value = "67108864")]
        capacity: u64,

        /// Number of segments (0 = derive from available parallelism)
        #[arg(long, env = "OHCACHE_SEGMENTS", default_value = "0")]
        segments: usize,

        /// Allocator strategy (heap, malloc)
        #[arg(long, env = "OHCACHE_ALLOCATOR", default_value = "heap")]
        allocator: AllocatorKind,

        /// Track every allocation and report leaks on close
        #[arg(long, env = "OHCACHE_DEBUG_TRACKING")]
        debug_tracking: bool,

        /// Value size in bytes
        #[arg(long, default_value = "128")]
        value_size: usize,

        /// Write uncompressed blocks
        #[arg(long)]
        plain: bool,
    },
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    match args.command {
        Command::Inspect { file, json } => inspect(&file, json),
        Command::Demo {
            entries,
            out,
            capacity,
            segments,
            allocator,
            debug_tracking,
            value_size,
            plain,
        } => {
            let config = CacheConfig::new(capacity)
                .with_segment_count(segments)
                .with_allocator(allocator)
                .with_debug_tracking(debug_tracking);
            demo(config, entries, value_size, &out, !plain)
        }
    }
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Inspect
// =============================================================================

#[derive(Debug, Serialize)]
struct InspectReport {
    file: String,
    compressed: bool,
    version: u32,
    block_size: u32,
    max_compressed_block_size: u32,
    blocks: u64,
    records: u64,
    key_bytes: u64,
    value_bytes: u64,
    file_bytes: u64,
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let file_bytes = file.metadata()?.len();

    let allocator: Arc<dyn Allocator> = Arc::new(HeapAllocator::new());
    let mut reader = SnapshotReader::open(BufReader::new(file), &allocator)
        .with_context(|| format!("reading header of {}", path.display()))?;
    let header = *reader.blocks().header();

    let mut key_bytes = 0u64;
    let mut value_bytes = 0u64;
    while let Some(record) = reader
        .next_record()
        .with_context(|| format!("record {} of {}", reader.records_read(), path.display()))?
    {
        key_bytes += record.key.len() as u64;
        value_bytes += record.value.len() as u64;
    }

    let report = InspectReport {
        file: path.display().to_string(),
        compressed: header.is_compressed(),
        version: header.version,
        block_size: header.block_size,
        max_compressed_block_size: header.max_compressed_block_size,
        blocks: reader.blocks().blocks_read(),
        records: reader.records_read(),
        key_bytes,
        value_bytes,
        file_bytes,
    };
    reader.close();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("file:              {}", report.file);
        println!("codec:             {}", header.algorithm);
        println!("version:           {}", report.version);
        println!("block size:        {}", report.block_size);
        println!("max encoded block: {}", report.max_compressed_block_size);
        println!("blocks:            {}", report.blocks);
        println!("records:           {} (all checksums valid)", report.records);
        println!("key bytes:         {}", report.key_bytes);
        println!("value bytes:       {}", report.value_bytes);
        println!("file bytes:        {}", report.file_bytes);
    }
    Ok(())
}

// =============================================================================
// Demo
// =============================================================================

fn demo(config: CacheConfig, entries: u64, value_size: usize, out: &Path, compressed: bool) -> Result<()> {
    let table = SegmentedTable::with_config(config.clone()).context("creating table")?;
    info!(
        segments = table.segment_count(),
        capacity = table.capacity(),
        "filling table with {} entries",
        entries
    );

    for i in 0..entries {
        let key = format!("key-{:010}", i);
        let value: Vec<u8> = (0..value_size).map(|j| ((i as usize + j) % 251) as u8).collect();
        table.put(key.as_bytes(), &value)?;
    }
    info!(stats = %table.stats(), "table filled");

    let file = File::create(out).with_context(|| format!("creating {}", out.display()))?;
    let saved = table
        .save_entries(BufWriter::new(file), compressed)
        .context("saving snapshot")?;

    let restored_table = SegmentedTable::with_config(config).context("creating restore table")?;
    let file = File::open(out).with_context(|| format!("opening {}", out.display()))?;
    let restored = restored_table
        .restore_entries(BufReader::new(file))
        .context("restoring snapshot")?;
    if restored != saved {
        bail!("snapshot restored {} of {} entries", restored, saved);
    }

    println!(
        "saved {} entries to {} ({} bytes), restored {}",
        saved,
        out.display(),
        std::fs::metadata(out)?.len(),
        restored
    );

    table.close().context("closing table")?;
    restored_table.close().context("closing restore table")?;
    Ok(())
}
