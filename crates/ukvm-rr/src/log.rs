//! The record/replay log.
//!
//! # Format
//!
//! A log is a flat sequence of entries, one per recorded transfer, in the
//! exact order the monitor produced them:
//!
//! ```text
//! Offset  Size  Field
//! ──────  ────  ─────────────────────────────────────────
//! 0x00    4     magic "UKRR"
//! 0x04    52    call-site name, NUL padded
//! 0x38    4     payload length (u32 little-endian)
//! 0x3C    n     payload
//! ```
//!
//! Bytes `0x04..0x3C` form the 56-byte tag.  Replay reads an entry only
//! through [`LogReader::expect`], which checks magic, call site and length
//! before handing out the payload.
//!
//! # Writer
//!
//! [`LogWriter`] stages entries into [`BLOCK_BYTES`] blocks on the caller's
//! thread and hands full blocks to a flusher thread over a bounded channel
//! of [`QUEUE_BLOCKS`] slots.  The vCPU thread blocks when the queue is
//! full; the flusher blocks when it is empty.
//!
//! The flusher LZ4-compresses the entry stream into a single frame of
//! linked blocks, so compression never runs on the vCPU thread.
//! [`LogReader::open`] decompresses transparently; [`LogReader::new`] reads
//! an uncompressed entry stream.

use crossbeam_channel::{bounded, Sender};
use log::{debug, warn};
use lz4_flex::frame::{BlockMode, BlockSize, FrameDecoder, FrameEncoder, FrameInfo};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Entry magic.
pub const MAGIC: [u8; 4] = *b"UKRR";

/// Size of the tag that follows the magic.
pub const TAG_SIZE: usize = 56;

/// Longest call-site name that fits in the tag.
pub const SITE_NAME_MAX: usize = TAG_SIZE - 4;

/// Bytes in front of every payload.
pub const HEADER_SIZE: usize = MAGIC.len() + TAG_SIZE;

/// Staging block size handed to the flusher.
pub const BLOCK_BYTES: usize = 128 * 1024;

/// Capacity of the writer queue, in blocks.
pub const QUEUE_BLOCKS: usize = 64;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("RR log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("call-site name {0:?} does not fit in a log tag")]
    BadSiteName(String),

    #[error("payload of {0} bytes does not fit in a log entry")]
    PayloadTooLarge(usize),

    #[error("entry {index}: bad magic {found:02x?}")]
    BadMagic { index: u64, found: [u8; 4] },

    #[error("log ends inside entry {index}")]
    Truncated { index: u64 },

    #[error(
        "replay diverged at entry {index}: monitor requested {expected} ({expected_len} bytes), \
         log holds {found} ({found_len} bytes)"
    )]
    Divergence {
        index: u64,
        expected: String,
        expected_len: usize,
        found: String,
        found_len: usize,
    },

    #[error("reached end of replay log after {index} entries")]
    Exhausted { index: u64 },

    #[error("log flusher thread is gone")]
    FlusherGone,
}

impl LogError {
    /// End of log during replay is a normal stop, not a failure.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, LogError::Exhausted { .. })
    }
}

/// One decoded entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub site: String,
    pub payload: Vec<u8>,
}

/// Build the header for an entry.
pub fn encode_header(site: &str, len: usize) -> Result<[u8; HEADER_SIZE], LogError> {
    if site.is_empty() || site.len() > SITE_NAME_MAX || site.as_bytes().contains(&0) {
        return Err(LogError::BadSiteName(site.to_string()));
    }
    let len32 = u32::try_from(len).map_err(|_| LogError::PayloadTooLarge(len))?;

    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&MAGIC);
    header[4..4 + site.len()].copy_from_slice(site.as_bytes());
    header[HEADER_SIZE - 4..].copy_from_slice(&len32.to_le_bytes());
    Ok(header)
}

/// Split a header into call-site name and payload length.
fn decode_header(index: u64, header: &[u8; HEADER_SIZE]) -> Result<(String, usize), LogError> {
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[..4]);
    if magic != MAGIC {
        return Err(LogError::BadMagic { index, found: magic });
    }
    let name = &header[4..4 + SITE_NAME_MAX];
    let end = name.iter().position(|b| *b == 0).unwrap_or(name.len());
    let site = String::from_utf8_lossy(&name[..end]).into_owned();

    let mut len = [0u8; 4];
    len.copy_from_slice(&header[HEADER_SIZE - 4..]);
    Ok((site, u32::from_le_bytes(len) as usize))
}

// ─── Writer ───────────────────────────────────────────────────────────

/// Append-only log writer with a background flusher.
pub struct LogWriter {
    staging: Vec<u8>,
    tx: Option<Sender<Vec<u8>>>,
    flusher: Option<JoinHandle<io::Result<u64>>>,
    entries: u64,
}

impl LogWriter {
    /// Create (truncate) `path` and start the flusher.
    pub fn create(path: &Path) -> Result<Self, LogError> {
        let file = File::create(path)?;
        Self::spawn(BufWriter::new(file))
    }

    /// Start a flusher thread compressing blocks into `sink`.
    pub fn spawn<W: Write + Send + 'static>(sink: W) -> Result<Self, LogError> {
        let (tx, rx) = bounded::<Vec<u8>>(QUEUE_BLOCKS);
        let flusher = thread::Builder::new()
            .name("rr-flusher".into())
            .spawn(move || -> io::Result<u64> {
                let info = FrameInfo::new()
                    .block_size(BlockSize::Max256KB)
                    .block_mode(BlockMode::Linked);
                let mut encoder = FrameEncoder::with_frame_info(info, sink);
                let mut written = 0u64;
                for block in rx.iter() {
                    encoder.write_all(&block)?;
                    written += block.len() as u64;
                }
                let mut sink = encoder.finish().map_err(io::Error::other)?;
                sink.flush()?;
                Ok(written)
            })?;

        Ok(Self {
            staging: Vec::with_capacity(BLOCK_BYTES),
            tx: Some(tx),
            flusher: Some(flusher),
            entries: 0,
        })
    }

    /// Append one entry.
    pub fn append(&mut self, site: &str, payload: &[u8]) -> Result<(), LogError> {
        let header = encode_header(site, payload.len())?;
        if self.staging.len() + HEADER_SIZE + payload.len() > BLOCK_BYTES {
            self.send_block()?;
        }
        self.staging.extend_from_slice(&header);
        self.staging.extend_from_slice(payload);
        // Oversized entries travel as a block of their own.
        if self.staging.len() >= BLOCK_BYTES {
            self.send_block()?;
        }
        self.entries += 1;
        Ok(())
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    fn send_block(&mut self) -> Result<(), LogError> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let block = std::mem::replace(&mut self.staging, Vec::with_capacity(BLOCK_BYTES));
        match &self.tx {
            Some(tx) => tx.send(block).map_err(|_| LogError::FlusherGone),
            None => Err(LogError::FlusherGone),
        }
    }

    /// Flush everything staged, stop the flusher and wait for it.
    /// Returns the number of uncompressed bytes written.
    pub fn finish(mut self) -> Result<u64, LogError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<u64, LogError> {
        let sent = self.send_block();
        self.tx = None;
        let joined = match self.flusher.take() {
            Some(handle) => handle.join().map_err(|_| LogError::FlusherGone)?,
            None => return Ok(0),
        };
        sent?;
        let written = joined?;
        debug!("RR log closed: {} entries, {} bytes", self.entries, written);
        Ok(written)
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if self.flusher.is_some() {
            if let Err(e) = self.shutdown() {
                warn!("RR log not flushed cleanly: {}", e);
            }
        }
    }
}

// ─── Reader ───────────────────────────────────────────────────────────

/// Sequential log reader.
pub struct LogReader<R = FrameDecoder<BufReader<File>>> {
    inner: R,
    index: u64,
}

impl LogReader<FrameDecoder<BufReader<File>>> {
    /// Open a log written by [`LogWriter::create`].
    pub fn open(path: &Path) -> Result<Self, LogError> {
        Ok(Self::new(FrameDecoder::new(BufReader::new(File::open(path)?))))
    }
}

impl<R: Read> LogReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, index: 0 }
    }

    /// Index of the next entry.
    pub fn position(&self) -> u64 {
        self.index
    }

    /// Read the next entry, or `None` at a clean end of log.
    pub fn next_entry(&mut self) -> Result<Option<Entry>, LogError> {
        let mut header = [0u8; HEADER_SIZE];
        match read_full(&mut self.inner, &mut header)? {
            0 => return Ok(None),
            n if n < HEADER_SIZE => return Err(LogError::Truncated { index: self.index }),
            _ => {}
        }
        let (site, len) = decode_header(self.index, &header)?;
        let mut payload = vec![0u8; len];
        if read_full(&mut self.inner, &mut payload)? < len {
            return Err(LogError::Truncated { index: self.index });
        }
        self.index += 1;
        Ok(Some(Entry { site, payload }))
    }

    /// Read the next entry and require it to come from `site` with exactly
    /// `len` payload bytes.
    pub fn expect(&mut self, site: &str, len: usize) -> Result<Vec<u8>, LogError> {
        let index = self.index;
        let entry = self
            .next_entry()?
            .ok_or(LogError::Exhausted { index })?;
        if entry.site != site || entry.payload.len() != len {
            return Err(LogError::Divergence {
                index,
                expected: site.to_string(),
                expected_len: len,
                found: entry.site,
                found_len: entry.payload.len(),
            });
        }
        Ok(entry.payload)
    }
}

/// Fill `buf` as far as the reader allows; returns bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
