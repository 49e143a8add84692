//! Record/replay log formats for the ukvm monitor.
//!
//! This crate owns everything that ends up on disk during a recorded run
//! and knows nothing about KVM:
//!
//! - [`log`]: the main log of nondeterministic inputs, one tagged entry per
//!   transfer, written by a background flusher
//! - [`checkpoint`]: heavy consistency checkpoints (registers, segments,
//!   memory CRC) used to locate the first point where a replay drifts
//! - [`stats`]: per-call-site summaries for the `ukvm-rr` tool
//!
//! The monitor decides *what* is recorded; this crate decides *how* it is
//! laid out and guarantees that a replay reading in a different order than
//! the recording wrote fails loudly.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use ukvm_rr::log::{LogReader, LogWriter};
//!
//! # fn main() -> Result<(), ukvm_rr::log::LogError> {
//! let mut w = LogWriter::create(Path::new("/tmp/rr.log"))?;
//! w.append("rdtsc", &42u64.to_le_bytes())?;
//! w.finish()?;
//!
//! let mut r = LogReader::open(Path::new("/tmp/rr.log"))?;
//! let tsc = r.expect("rdtsc", 8)?;
//! assert_eq!(tsc, 42u64.to_le_bytes());
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod crc32;
pub mod log;
pub mod stats;

pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointReader, CheckpointWriter, Mismatch, Phase,
};
pub use crc32::{crc32, crc32_update};
pub use self::log::{Entry, LogError, LogReader, LogWriter};
pub use stats::LogStats;

/// File names inside a record/replay directory.
pub mod files {
    /// Main log of recorded transfers.
    pub const LOG: &str = "rr.log";
    /// Field-level check log (checked mode).
    pub const CHECK_LOG: &str = "rr_check.log";
    /// Checkpoints taken before each transfer (checked mode).
    pub const HEAVY_IN: &str = "rr_heavy_in.jsonl";
    /// Checkpoints taken after each transfer (checked mode).
    pub const HEAVY_OUT: &str = "rr_heavy_out.jsonl";
}
