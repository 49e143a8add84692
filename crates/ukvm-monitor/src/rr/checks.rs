//! Checked mode: field checks and heavy state checkpoints.
//!
//! Recording writes every `Check` item of a transfer to `rr_check.log` and
//! a full state [`Checkpoint`] before and after each transfer.  Replay
//! reads the same files back and stops at the first difference.

use std::path::Path;

use kvm_bindings::{kvm_dtable, kvm_regs, kvm_segment, kvm_sregs};
use log::debug;
use ukvm_rr::checkpoint::{DescriptorTable, GeneralRegs, Segment, Segments, SystemRegs};
use ukvm_rr::{files, Checkpoint, CheckpointReader, CheckpointWriter, LogReader, LogWriter, Phase};

use super::RrError;
use crate::memory::GuestRam;
use crate::vcpu::Vcpu;

pub(crate) enum Checker {
    Record {
        checks: LogWriter,
        heavy_in: CheckpointWriter,
        heavy_out: CheckpointWriter,
        seq: u64,
    },
    Replay {
        checks: LogReader,
        heavy_in: CheckpointReader,
        heavy_out: CheckpointReader,
        seq: u64,
    },
}

impl Checker {
    pub(crate) fn record(dir: &Path) -> Result<Self, RrError> {
        Ok(Checker::Record {
            checks: LogWriter::create(&dir.join(files::CHECK_LOG))?,
            heavy_in: CheckpointWriter::create(&dir.join(files::HEAVY_IN))?,
            heavy_out: CheckpointWriter::create(&dir.join(files::HEAVY_OUT))?,
            seq: 0,
        })
    }

    pub(crate) fn replay(dir: &Path) -> Result<Self, RrError> {
        Ok(Checker::Replay {
            checks: LogReader::open(&dir.join(files::CHECK_LOG))?,
            heavy_in: CheckpointReader::open(&dir.join(files::HEAVY_IN))?,
            heavy_out: CheckpointReader::open(&dir.join(files::HEAVY_OUT))?,
            seq: 0,
        })
    }

    /// Record or compare one checked item.
    pub(crate) fn check(&mut self, name: &str, bytes: &[u8]) -> Result<(), RrError> {
        match self {
            Checker::Record { checks, .. } => Ok(checks.append(name, bytes)?),
            Checker::Replay { checks, .. } => {
                let entry = checks
                    .next_entry()?
                    .ok_or_else(|| RrError::CheckLogEnded { name: name.to_string() })?;
                if entry.site != name || entry.payload != bytes {
                    return Err(RrError::CheckMismatch {
                        name: name.to_string(),
                        recorded: describe(&entry.site, &entry.payload),
                        replayed: describe(name, bytes),
                    });
                }
                Ok(())
            }
        }
    }

    /// Take a checkpoint on one side of a transfer.
    pub(crate) fn checkpoint(
        &mut self,
        site: &str,
        phase: Phase,
        mem: &GuestRam,
        vcpu: &dyn Vcpu,
    ) -> Result<(), RrError> {
        let regs = vcpu.regs()?;
        let sregs = vcpu.sregs()?;
        let memory_crc = mem.crc32()?;

        match self {
            Checker::Record {
                heavy_in,
                heavy_out,
                seq,
                ..
            } => {
                let cp = capture(*seq, site, phase, &regs, &sregs, memory_crc);
                match phase {
                    Phase::In => heavy_in.append(&cp)?,
                    Phase::Out => {
                        heavy_out.append(&cp)?;
                        *seq += 1;
                    }
                }
            }
            Checker::Replay {
                heavy_in,
                heavy_out,
                seq,
                ..
            } => {
                let cp = capture(*seq, site, phase, &regs, &sregs, memory_crc);
                match phase {
                    Phase::In => heavy_in.verify(&cp)?,
                    Phase::Out => {
                        heavy_out.verify(&cp)?;
                        *seq += 1;
                    }
                }
            }
        }
        debug!("checkpoint {} {} crc={:08x}", site, phase, memory_crc);
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<(), RrError> {
        if let Checker::Record {
            checks,
            mut heavy_in,
            mut heavy_out,
            ..
        } = self
        {
            checks.finish()?;
            heavy_in.flush()?;
            heavy_out.flush()?;
        }
        Ok(())
    }
}

fn describe(name: &str, bytes: &[u8]) -> String {
    const PREVIEW: usize = 16;
    let hex: String = bytes.iter().take(PREVIEW).map(|b| format!("{:02x}", b)).collect();
    let more = if bytes.len() > PREVIEW { ".." } else { "" };
    format!("{} [{} bytes] {}{}", name, bytes.len(), hex, more)
}

pub(crate) fn capture(
    seq: u64,
    site: &str,
    phase: Phase,
    regs: &kvm_regs,
    sregs: &kvm_sregs,
    memory_crc: u32,
) -> Checkpoint {
    Checkpoint {
        seq,
        site: site.to_string(),
        phase,
        regs: GeneralRegs {
            rip: regs.rip,
            rflags: regs.rflags,
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rsp: regs.rsp,
            rbp: regs.rbp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
        },
        segments: Segments {
            cs: segment(&sregs.cs),
            ds: segment(&sregs.ds),
            es: segment(&sregs.es),
            fs: segment(&sregs.fs),
            gs: segment(&sregs.gs),
            ss: segment(&sregs.ss),
        },
        system: SystemRegs {
            gdt: table(&sregs.gdt),
            idt: table(&sregs.idt),
            cr0: sregs.cr0,
            cr2: sregs.cr2,
            cr3: sregs.cr3,
            cr4: sregs.cr4,
            cr8: sregs.cr8,
            efer: sregs.efer,
            apic_base: sregs.apic_base,
        },
        memory_crc,
    }
}

fn segment(s: &kvm_segment) -> Segment {
    Segment {
        base: s.base,
        limit: s.limit,
        selector: s.selector,
        type_: s.type_,
        present: s.present,
        dpl: s.dpl,
        db: s.db,
        s: s.s,
        l: s.l,
        g: s.g,
        avl: s.avl,
    }
}

fn table(t: &kvm_dtable) -> DescriptorTable {
    DescriptorTable {
        base: t.base,
        limit: t.limit,
    }
}
