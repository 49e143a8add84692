//! Record/replay engine.
//!
//! Every nondeterministic value the guest observes passes through
//! [`RrEngine::input`] before the real operation and [`RrEngine::output`]
//! after it:
//!
//! ```text
//!            input(IN)                          output(OUT)
//! RECORD   checks, checkpoint ── real op ──▶  log recorded items, checkpoint
//! REPLAY   checks, checkpoint, stage + inject  ──▶  (skip op)  checkpoint
//! ```
//!
//! Replay reads every recorded item of a call into a staging area before
//! anything is written to guest memory, so a divergence found anywhere in
//! the call aborts with no guest-visible side effect.

mod checks;
pub mod plan;

use std::fs;
use std::path::PathBuf;

use log::{debug, info};
use thiserror::Error;
use ukvm_rr::{files, LogError, LogReader, LogWriter, Phase};

use crate::memory::{Gpa, GpaError, GuestRam, GuestRange, MemoryError};
use crate::vcpu::{Vcpu, VcpuError};
use checks::Checker;
pub use plan::{entry_name, CpuidValue, RandValue, Recordable, Step, TscValue};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RrMode {
    #[default]
    None,
    Record,
    Replay,
}

impl std::fmt::Display for RrMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RrMode::None => write!(f, "none"),
            RrMode::Record => write!(f, "record"),
            RrMode::Replay => write!(f, "replay"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct RrConfig {
    pub mode: RrMode,
    /// Directory holding the log files.
    pub dir: PathBuf,
    /// Checked mode: field checks and heavy checkpoints.
    pub checks: bool,
}

#[derive(Error, Debug)]
pub enum RrError {
    #[error("failed to prepare record/replay directory {path}: {source}")]
    Dir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Checkpoint(#[from] ukvm_rr::CheckpointError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Vcpu(#[from] VcpuError),

    #[error("checked value diverged: recorded {recorded}, replayed {replayed}")]
    CheckMismatch {
        name: String,
        recorded: String,
        replayed: String,
    },

    #[error("check log ended before {name}")]
    CheckLogEnded { name: String },
}

impl From<GpaError> for RrError {
    fn from(e: GpaError) -> Self {
        RrError::Memory(MemoryError::Gpa(e))
    }
}

impl RrError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, RrError::Log(e) if e.is_exhausted())
    }
}

/// Whether the caller must perform the real operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Run the operation; the result will be recorded if recording.
    Live,
    /// The result was injected from the log; skip the operation.
    Replayed,
}

enum Backend {
    Off,
    Record(LogWriter),
    Replay(LogReader),
}

pub struct RrEngine {
    backend: Backend,
    checker: Option<Checker>,
    transfers: u64,
}

impl RrEngine {
    pub fn disabled() -> Self {
        Self {
            backend: Backend::Off,
            checker: None,
            transfers: 0,
        }
    }

    pub fn open(config: &RrConfig) -> Result<Self, RrError> {
        let dir = config.dir.as_path();
        let (backend, checker) = match config.mode {
            RrMode::None => return Ok(Self::disabled()),
            RrMode::Record => {
                fs::create_dir_all(dir).map_err(|source| RrError::Dir {
                    path: dir.to_path_buf(),
                    source,
                })?;
                let log = LogWriter::create(&dir.join(files::LOG))?;
                let checker = config.checks.then(|| Checker::record(dir)).transpose()?;
                (Backend::Record(log), checker)
            }
            RrMode::Replay => {
                let log = LogReader::open(&dir.join(files::LOG))?;
                let checker = config.checks.then(|| Checker::replay(dir)).transpose()?;
                (Backend::Replay(log), checker)
            }
        };
        info!(
            "record/replay: {} in {}{}",
            config.mode,
            dir.display(),
            if checker.is_some() { " (checked)" } else { "" }
        );
        Ok(Self {
            backend,
            checker,
            transfers: 0,
        })
    }

    pub fn mode(&self) -> RrMode {
        match self.backend {
            Backend::Off => RrMode::None,
            Backend::Record(_) => RrMode::Record,
            Backend::Replay(_) => RrMode::Replay,
        }
    }

    pub fn is_active(&self) -> bool {
        self.mode() != RrMode::None
    }

    /// Transfers recorded or replayed so far.
    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    /// IN side of a transfer.  On replay, injects the recorded items into
    /// `value` and guest memory and returns [`Flow::Replayed`].
    pub fn input<T: Recordable>(
        &mut self,
        value: &mut T,
        mem: &GuestRam,
        vcpu: &dyn Vcpu,
    ) -> Result<Flow, RrError> {
        if let Backend::Off = self.backend {
            return Ok(Flow::Live);
        }

        let mut raw = vec![0u8; T::SIZE];
        value.encode(&mut raw);

        if let Some(checker) = self.checker.as_mut() {
            checker.checkpoint(T::SITE, Phase::In, mem, vcpu)?;
            for step in T::PLAN {
                match *step {
                    Step::Check(f) => {
                        checker.check(&entry_name(T::SITE, f.name), &raw[f.range()])?
                    }
                    Step::CheckBuffer { data, len } => {
                        let bytes = mem.read_bytes(Gpa(data.read_uint(&raw)), len.read_uint(&raw))?;
                        checker.check(&entry_name(T::SITE, "buffer"), &bytes)?;
                    }
                    _ => {}
                }
            }
        }

        let Backend::Replay(log) = &mut self.backend else {
            return Ok(Flow::Live);
        };
        if T::REDO {
            return Ok(Flow::Live);
        }

        let writes = stage::<T>(log, &mut raw, mem)?;
        for (range, bytes) in &writes {
            mem.write(range, bytes)?;
        }
        if let Some(injected) = T::decode(&raw) {
            *value = injected;
        }
        self.transfers += 1;
        debug!("replayed {} ({} buffer(s))", T::SITE, writes.len());
        Ok(Flow::Replayed)
    }

    /// OUT side of a transfer, after the result is in `value` and guest
    /// memory.
    pub fn output<T: Recordable>(
        &mut self,
        value: &T,
        mem: &GuestRam,
        vcpu: &dyn Vcpu,
    ) -> Result<(), RrError> {
        if let (Backend::Record(log), false) = (&mut self.backend, T::REDO) {
            let mut raw = vec![0u8; T::SIZE];
            value.encode(&mut raw);
            for step in T::PLAN {
                match *step {
                    Step::Record(f) => log.append(&entry_name(T::SITE, f.name), &raw[f.range()])?,
                    Step::RecordBuffer { data, len } => {
                        let bytes =
                            mem.read_bytes(Gpa(data.read_uint(&raw)), len.read_uint(&raw))?;
                        log.append(&entry_name(T::SITE, "buffer"), &bytes)?;
                    }
                    _ => {}
                }
            }
            self.transfers += 1;
            debug!("recorded {}", T::SITE);
        }
        if let Some(checker) = self.checker.as_mut() {
            checker.checkpoint(T::SITE, Phase::Out, mem, vcpu)?;
        }
        Ok(())
    }

    /// Flush and close every log.
    pub fn finish(self) -> Result<(), RrError> {
        if let Backend::Record(log) = self.backend {
            let entries = log.finish()?;
            info!("record/replay: {} entries written", entries);
        }
        if let Some(checker) = self.checker {
            checker.finish()?;
        }
        Ok(())
    }
}

/// Pull every recorded item of one call out of the log.  Scalar items go
/// straight into `raw`; buffers are validated and returned for the caller
/// to commit.
fn stage<T: Recordable>(
    log: &mut LogReader,
    raw: &mut [u8],
    mem: &GuestRam,
) -> Result<Vec<(GuestRange, Vec<u8>)>, RrError> {
    let mut writes = Vec::new();
    for step in T::PLAN {
        match *step {
            Step::Record(f) => {
                let bytes = log.expect(&entry_name(T::SITE, f.name), f.size)?;
                raw[f.range()].copy_from_slice(&bytes);
            }
            Step::RecordBuffer { data, len } => {
                let range = mem.check(Gpa(data.read_uint(raw)), len.read_uint(raw))?;
                let bytes = log.expect(&entry_name(T::SITE, "buffer"), range.len())?;
                writes.push((range, bytes));
            }
            _ => {}
        }
    }
    Ok(writes)
}
