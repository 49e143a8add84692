//! Heavy consistency checkpoints.
//!
//! A checkpoint captures the full architectural state of the vCPU plus a
//! CRC-32 of guest memory at one record/replay transfer point.  Recording
//! appends checkpoints as JSON lines; replay captures the same
//! checkpoints and compares them one by one against the recorded file,
//! stopping at the first field that differs.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("checkpoint line {line} is malformed: {source}")]
    Json {
        line: u64,
        #[source]
        source: serde_json::Error,
    },

    #[error("recorded checkpoints end before replay checkpoint {seq} ({site})")]
    Missing { seq: u64, site: String },

    #[error(
        "state diverged at checkpoint {seq} ({site} {phase}): {field} recorded {recorded}, replayed {replayed}"
    )]
    Diverged {
        seq: u64,
        site: String,
        phase: Phase,
        field: String,
        recorded: String,
        replayed: String,
    },
}

/// Which side of a transfer the checkpoint was taken on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    In,
    Out,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::In => write!(f, "IN"),
            Phase::Out => write!(f, "OUT"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralRegs {
    pub rip: u64,
    pub rflags: u64,
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    #[serde(rename = "type")]
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segments {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemRegs {
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub efer: u64,
    pub apic_base: u64,
}

/// One checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Position in the checkpoint stream, starting at 0.
    pub seq: u64,
    /// Call site that produced the transfer (`blkread`, `rdtsc`, ...).
    pub site: String,
    pub phase: Phase,
    pub regs: GeneralRegs,
    pub segments: Segments,
    pub system: SystemRegs,
    pub memory_crc: u32,
}

/// The first field at which two checkpoints disagree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    pub field: String,
    pub recorded: String,
    pub replayed: String,
}

/// Compare two checkpoints field by field.
///
/// Identity fields (site, phase) are compared first so an ordering
/// problem is not reported as a register difference.
pub fn first_difference(recorded: &Checkpoint, replayed: &Checkpoint) -> Option<Mismatch> {
    if recorded.site != replayed.site {
        return Some(Mismatch {
            field: "site".into(),
            recorded: recorded.site.clone(),
            replayed: replayed.site.clone(),
        });
    }
    if recorded.phase != replayed.phase {
        return Some(Mismatch {
            field: "phase".into(),
            recorded: recorded.phase.to_string(),
            replayed: replayed.phase.to_string(),
        });
    }

    let a = serde_json::to_value(recorded).ok()?;
    let b = serde_json::to_value(replayed).ok()?;
    diff_values("", &a, &b)
}

fn diff_values(path: &str, a: &serde_json::Value, b: &serde_json::Value) -> Option<Mismatch> {
    use serde_json::Value;
    match (a, b) {
        (Value::Object(left), Value::Object(right)) => {
            for (key, lv) in left {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match right.get(key) {
                    Some(rv) => {
                        if let Some(m) = diff_values(&child, lv, rv) {
                            return Some(m);
                        }
                    }
                    None => {
                        return Some(Mismatch {
                            field: child,
                            recorded: lv.to_string(),
                            replayed: "<absent>".into(),
                        })
                    }
                }
            }
            None
        }
        _ if a == b => None,
        (Value::Number(l), Value::Number(r)) => Some(Mismatch {
            field: path.to_string(),
            recorded: hex_or_plain(l),
            replayed: hex_or_plain(r),
        }),
        _ => Some(Mismatch {
            field: path.to_string(),
            recorded: a.to_string(),
            replayed: b.to_string(),
        }),
    }
}

fn hex_or_plain(n: &serde_json::Number) -> String {
    match n.as_u64() {
        Some(v) => format!("{v:#x}"),
        None => n.to_string(),
    }
}

// ─── Files ────────────────────────────────────────────────────────────

/// Appends checkpoints as JSON lines.
pub struct CheckpointWriter {
    out: BufWriter<File>,
    written: u64,
}

impl CheckpointWriter {
    pub fn create(path: &Path) -> Result<Self, CheckpointError> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
            written: 0,
        })
    }

    pub fn append(&mut self, cp: &Checkpoint) -> Result<(), CheckpointError> {
        serde_json::to_writer(&mut self.out, cp).map_err(|source| CheckpointError::Json {
            line: self.written,
            source,
        })?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), CheckpointError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Reads checkpoints back in order.
pub struct CheckpointReader {
    lines: std::io::Lines<BufReader<File>>,
    line: u64,
}

impl CheckpointReader {
    pub fn open(path: &Path) -> Result<Self, CheckpointError> {
        Ok(Self {
            lines: BufReader::new(File::open(path)?).lines(),
            line: 0,
        })
    }

    pub fn next_checkpoint(&mut self) -> Result<Option<Checkpoint>, CheckpointError> {
        loop {
            let Some(line) = self.lines.next() else {
                return Ok(None);
            };
            let line = line?;
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }
            return serde_json::from_str(&line)
                .map(Some)
                .map_err(|source| CheckpointError::Json {
                    line: self.line,
                    source,
                });
        }
    }

    /// Compare a freshly captured checkpoint with the next recorded one.
    pub fn verify(&mut self, replayed: &Checkpoint) -> Result<(), CheckpointError> {
        let recorded = self.next_checkpoint()?.ok_or_else(|| CheckpointError::Missing {
            seq: replayed.seq,
            site: replayed.site.clone(),
        })?;
        match first_difference(&recorded, replayed) {
            None => Ok(()),
            Some(m) => Err(CheckpointError::Diverged {
                seq: replayed.seq,
                site: recorded.site,
                phase: recorded.phase,
                field: m.field,
                recorded: m.recorded,
                replayed: m.replayed,
            }),
        }
    }
}

/// Walk two checkpoint files in lockstep and return the first pair that
/// differs, with the offending field.  A length difference is reported
/// as a mismatch on `seq`.
pub fn diff_files(
    recorded: &Path,
    replayed: &Path,
) -> Result<Option<(u64, Mismatch)>, CheckpointError> {
    let mut a = CheckpointReader::open(recorded)?;
    let mut b = CheckpointReader::open(replayed)?;
    let mut index = 0u64;
    loop {
        match (a.next_checkpoint()?, b.next_checkpoint()?) {
            (None, None) => return Ok(None),
            (Some(l), Some(r)) => {
                if let Some(m) = first_difference(&l, &r) {
                    return Ok(Some((index, m)));
                }
            }
            (l, r) => {
                let describe = |c: Option<Checkpoint>| match c {
                    Some(c) => format!("{} {}", c.site, c.phase),
                    None => "<end>".to_string(),
                };
                return Ok(Some((
                    index,
                    Mismatch {
                        field: "seq".into(),
                        recorded: describe(l),
                        replayed: describe(r),
                    },
                )));
            }
        }
        index += 1;
    }
}
