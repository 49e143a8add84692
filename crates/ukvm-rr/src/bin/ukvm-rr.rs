//! ukvm-rr: inspect record/replay logs and checkpoint files.

use clap::{Parser, Subcommand};
use snafu::Snafu;
use std::path::PathBuf;
use ukvm_rr::checkpoint::{diff_files, CheckpointError};
use ukvm_rr::log::{LogError, LogReader};
use ukvm_rr::stats::LogStats;

/// CLI errors for the inspection binary.
#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("log error: {source}"), context(false))]
    Log { source: LogError },
    #[snafu(display("checkpoint error: {source}"), context(false))]
    Checkpoint { source: CheckpointError },
    #[snafu(display("JSON error: {source}"), context(false))]
    Json { source: serde_json::Error },
    #[snafu(display("checkpoints diverge"))]
    Diverged,
}

#[derive(Parser)]
#[command(name = "ukvm-rr")]
#[command(about = "Inspect ukvm record/replay logs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the entries of a log
    Dump {
        /// Path to rr.log
        log: PathBuf,

        /// Stop after this many entries
        #[arg(short, long)]
        limit: Option<u64>,

        /// Payload bytes to show per entry
        #[arg(long, default_value_t = 16)]
        preview: usize,
    },

    /// Count entries and bytes per call site
    Stats {
        /// Path to rr.log
        log: PathBuf,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Find the first differing checkpoint between two checkpoint files
    Diff {
        /// Checkpoints written while recording
        recorded: PathBuf,

        /// Checkpoints written while replaying
        replayed: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Dump {
            log,
            limit,
            preview,
        } => cmd_dump(log, limit, preview),
        Commands::Stats { log, json } => cmd_stats(log, json),
        Commands::Diff { recorded, replayed } => cmd_diff(recorded, replayed),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn cmd_dump(path: PathBuf, limit: Option<u64>, preview: usize) -> Result<(), CliError> {
    let mut reader = LogReader::open(&path)?;
    let limit = limit.unwrap_or(u64::MAX);

    while reader.position() < limit {
        let index = reader.position();
        let Some(entry) = reader.next_entry()? else {
            break;
        };
        let shown = &entry.payload[..entry.payload.len().min(preview)];
        let more = if entry.payload.len() > shown.len() { " …" } else { "" };
        println!(
            "{:>8}  {:<12} {:>6}  {}{}",
            index,
            entry.site,
            entry.payload.len(),
            hex(shown),
            more
        );
    }
    Ok(())
}

fn cmd_stats(path: PathBuf, json: bool) -> Result<(), CliError> {
    let mut reader = LogReader::open(&path)?;
    let stats = LogStats::collect(&mut reader)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("=== {} ===", path.display());
    println!("Entries: {}", stats.entries);
    println!("Raw:     {} bytes", stats.raw_bytes);
    if let Ok(meta) = std::fs::metadata(&path) {
        println!("On disk: {} bytes (lz4)", meta.len());
    }
    println!();
    println!("{:<12} {:>10} {:>12}", "site", "entries", "payload");
    for (site, s) in &stats.sites {
        println!("{:<12} {:>10} {:>12}", site, s.entries, s.payload_bytes);
    }
    Ok(())
}

fn cmd_diff(recorded: PathBuf, replayed: PathBuf) -> Result<(), CliError> {
    match diff_files(&recorded, &replayed)? {
        None => {
            println!("checkpoints identical");
            Ok(())
        }
        Some((index, m)) => {
            println!("first divergence at checkpoint {}", index);
            println!("  field:    {}", m.field);
            println!("  recorded: {}", m.recorded);
            println!("  replayed: {}", m.replayed);
            DivergedSnafu.fail()
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
