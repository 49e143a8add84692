//! Trapping nondeterministic instructions.
//!
//! When an image is loaded, its text is decoded once from the entry point
//! to the end of the executable segment.  Every `RDTSC`, `RDRAND` and
//! `CPUID` found is replaced by `int3` followed by `nop`s, so the
//! instruction length and all later offsets stay the same.  With software
//! breakpoints enabled each of those now exits to the monitor, where
//! [`TrapModule`] emulates it through the record/replay engine and moves
//! `rip` past the original instruction.
//!
//! The sweep is linear: data embedded in the text can hide or fake an
//! instruction boundary.  Guests are expected to keep such data out of
//! the text section.

use iced_x86::{Decoder, DecoderOptions, Mnemonic, Register};
use kvm_bindings::kvm_regs;
use log::{debug, info, trace};
use thiserror::Error;

use crate::cpu::HostCpu;
use crate::loader::LoadedImage;
use crate::memory::{Gpa, GuestRam, MemoryError};
use crate::module::{Context, Module, ModuleError, Setup};
use crate::rr::{CpuidValue, Flow, RandValue, TscValue};
use crate::vcpu::VmExit;

const INT3: u8 = 0xcc;
const NOP: u8 = 0x90;

// RFLAGS bits touched by RDRAND.
const FLAG_CF: u64 = 1 << 0;
const FLAG_PF: u64 = 1 << 2;
const FLAG_AF: u64 = 1 << 4;
const FLAG_ZF: u64 = 1 << 6;
const FLAG_SF: u64 = 1 << 7;
const FLAG_OF: u64 = 1 << 11;

#[derive(Error, Debug)]
pub enum TrapError {
    #[error("cannot read image text: {0}")]
    Memory(#[from] MemoryError),

    #[error("trapped instruction at {addr:#x} has unsupported operand {operand}")]
    UnsupportedOperand { addr: u64, operand: String },

    #[error("text range [{start:#x}, {end:#x}) is empty or reversed")]
    BadRange { start: u64, end: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    Rdtsc,
    Rdrand,
    Cpuid,
}

/// General-purpose registers in hardware encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpReg {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

const GP_REGS: [GpReg; 16] = [
    GpReg::Rax,
    GpReg::Rcx,
    GpReg::Rdx,
    GpReg::Rbx,
    GpReg::Rsp,
    GpReg::Rbp,
    GpReg::Rsi,
    GpReg::Rdi,
    GpReg::R8,
    GpReg::R9,
    GpReg::R10,
    GpReg::R11,
    GpReg::R12,
    GpReg::R13,
    GpReg::R14,
    GpReg::R15,
];

const REG64: [Register; 16] = [
    Register::RAX,
    Register::RCX,
    Register::RDX,
    Register::RBX,
    Register::RSP,
    Register::RBP,
    Register::RSI,
    Register::RDI,
    Register::R8,
    Register::R9,
    Register::R10,
    Register::R11,
    Register::R12,
    Register::R13,
    Register::R14,
    Register::R15,
];

const REG32: [Register; 16] = [
    Register::EAX,
    Register::ECX,
    Register::EDX,
    Register::EBX,
    Register::ESP,
    Register::EBP,
    Register::ESI,
    Register::EDI,
    Register::R8D,
    Register::R9D,
    Register::R10D,
    Register::R11D,
    Register::R12D,
    Register::R13D,
    Register::R14D,
    Register::R15D,
];

const REG16: [Register; 16] = [
    Register::AX,
    Register::CX,
    Register::DX,
    Register::BX,
    Register::SP,
    Register::BP,
    Register::SI,
    Register::DI,
    Register::R8W,
    Register::R9W,
    Register::R10W,
    Register::R11W,
    Register::R12W,
    Register::R13W,
    Register::R14W,
    Register::R15W,
];

/// A register operand: which register and how many bytes of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Operand {
    pub reg: GpReg,
    pub width: u8,
}

impl Operand {
    fn from_iced(reg: Register) -> Option<Self> {
        [(REG64, 8u8), (REG32, 4), (REG16, 2)]
            .iter()
            .find_map(|(table, width)| {
                table.iter().position(|r| *r == reg).map(|i| Operand {
                    reg: GP_REGS[i],
                    width: *width,
                })
            })
    }

    /// Write `value` with x86 semantics: 32-bit writes zero-extend,
    /// 16-bit writes keep the upper bits.
    fn write(&self, regs: &mut kvm_regs, value: u64) {
        let slot = gp_slot(regs, self.reg);
        *slot = match self.width {
            8 => value,
            4 => value & 0xffff_ffff,
            _ => (*slot & !0xffff) | (value & 0xffff),
        };
    }
}

fn gp_slot(regs: &mut kvm_regs, reg: GpReg) -> &mut u64 {
    match reg {
        GpReg::Rax => &mut regs.rax,
        GpReg::Rcx => &mut regs.rcx,
        GpReg::Rdx => &mut regs.rdx,
        GpReg::Rbx => &mut regs.rbx,
        GpReg::Rsp => &mut regs.rsp,
        GpReg::Rbp => &mut regs.rbp,
        GpReg::Rsi => &mut regs.rsi,
        GpReg::Rdi => &mut regs.rdi,
        GpReg::R8 => &mut regs.r8,
        GpReg::R9 => &mut regs.r9,
        GpReg::R10 => &mut regs.r10,
        GpReg::R11 => &mut regs.r11,
        GpReg::R12 => &mut regs.r12,
        GpReg::R13 => &mut regs.r13,
        GpReg::R14 => &mut regs.r14,
        GpReg::R15 => &mut regs.r15,
    }
}

/// One patched instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trap {
    pub addr: u64,
    pub kind: TrapKind,
    pub len: usize,
    /// The explicit operand, if any.  RDTSC and CPUID have none (their
    /// registers are implicit) and RDRAND has exactly one, its destination,
    /// so one slot covers every trapped form.
    pub dest: Option<Operand>,
}

#[derive(Clone, Debug, Default)]
pub struct TrapTable {
    traps: Vec<Trap>,
}

impl TrapTable {
    /// Decode `[start, end)` and collect the instructions to trap.
    /// Guest memory is not modified.
    pub fn scan(mem: &GuestRam, start: u64, end: u64) -> Result<Self, TrapError> {
        if end <= start {
            return Err(TrapError::BadRange { start, end });
        }
        let text = mem.read_bytes(Gpa(start), end - start)?;
        let mut decoder = Decoder::with_ip(64, &text, start, DecoderOptions::NONE);
        let mut traps = Vec::new();

        while decoder.can_decode() {
            let insn = decoder.decode();
            if insn.is_invalid() {
                continue;
            }
            let kind = match insn.mnemonic() {
                Mnemonic::Rdtsc => TrapKind::Rdtsc,
                Mnemonic::Rdrand => TrapKind::Rdrand,
                Mnemonic::Cpuid => TrapKind::Cpuid,
                _ => continue,
            };
            let dest = match insn.op_count() {
                0 => None,
                _ => Some(Operand::from_iced(insn.op0_register()).ok_or_else(|| {
                    TrapError::UnsupportedOperand {
                        addr: insn.ip(),
                        operand: format!("{:?}", insn.op0_register()),
                    }
                })?),
            };
            trace!("trap {:?} at {:#x} ({} bytes)", kind, insn.ip(), insn.len());
            traps.push(Trap {
                addr: insn.ip(),
                kind,
                len: insn.len(),
                dest,
            });
        }
        Ok(Self { traps })
    }

    /// Overwrite every trapped instruction with `int3` + `nop` padding.
    pub fn patch(&self, mem: &GuestRam) -> Result<(), TrapError> {
        for trap in &self.traps {
            let mut bytes = vec![NOP; trap.len];
            bytes[0] = INT3;
            mem.write_bytes(Gpa(trap.addr), &bytes)?;
        }
        Ok(())
    }

    pub fn find(&self, addr: u64) -> Option<&Trap> {
        self.traps.iter().find(|t| t.addr == addr)
    }

    pub fn len(&self) -> usize {
        self.traps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traps.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trap> {
        self.traps.iter()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapStats {
    pub rdtsc: u64,
    pub rdrand: u64,
    pub cpuid: u64,
}

/// Exit handler that emulates trapped instructions.
pub struct TrapModule {
    cpu: Box<dyn HostCpu>,
    table: TrapTable,
    breakpoints: bool,
    stats: TrapStats,
}

impl TrapModule {
    pub fn new(cpu: Box<dyn HostCpu>) -> Self {
        Self {
            cpu,
            table: TrapTable::default(),
            breakpoints: false,
            stats: TrapStats::default(),
        }
    }

    pub fn table(&self) -> &TrapTable {
        &self.table
    }

    pub fn stats(&self) -> TrapStats {
        self.stats
    }

    fn emulate(&mut self, trap: Trap, ctx: &mut Context<'_>) -> Result<(), ModuleError> {
        let mut regs = ctx.vcpu.regs()?;
        match trap.kind {
            TrapKind::Rdtsc => {
                let mut tsc = TscValue { value: 0 };
                if ctx.rr.input(&mut tsc, ctx.mem, &*ctx.vcpu)? == Flow::Live {
                    tsc.value = self.cpu.rdtsc();
                }
                regs.rax = tsc.value & 0xffff_ffff;
                regs.rdx = tsc.value >> 32;
                regs.rip = trap.addr + trap.len as u64;
                ctx.vcpu.set_regs(&regs)?;
                ctx.rr.output(&tsc, ctx.mem, &*ctx.vcpu)?;
                self.stats.rdtsc += 1;
            }
            TrapKind::Rdrand => {
                let mut rand = RandValue { value: 0 };
                if ctx.rr.input(&mut rand, ctx.mem, &*ctx.vcpu)? == Flow::Live {
                    rand.value = self.cpu.rdrand();
                }
                if let Some(dest) = trap.dest {
                    dest.write(&mut regs, rand.value);
                }
                regs.rflags |= FLAG_CF;
                regs.rflags &= !(FLAG_OF | FLAG_SF | FLAG_ZF | FLAG_AF | FLAG_PF);
                regs.rip = trap.addr + trap.len as u64;
                ctx.vcpu.set_regs(&regs)?;
                ctx.rr.output(&rand, ctx.mem, &*ctx.vcpu)?;
                self.stats.rdrand += 1;
            }
            TrapKind::Cpuid => {
                let mut q = CpuidValue {
                    leaf: regs.rax as u32,
                    subleaf: regs.rcx as u32,
                    eax: 0,
                    ebx: 0,
                    ecx: 0,
                    edx: 0,
                };
                if ctx.rr.input(&mut q, ctx.mem, &*ctx.vcpu)? == Flow::Live {
                    let r = self.cpu.cpuid(q.leaf, q.subleaf);
                    q.eax = r.eax;
                    q.ebx = r.ebx;
                    q.ecx = r.ecx;
                    q.edx = r.edx;
                }
                regs.rax = u64::from(q.eax);
                regs.rbx = u64::from(q.ebx);
                regs.rcx = u64::from(q.ecx);
                regs.rdx = u64::from(q.edx);
                regs.rip = trap.addr + trap.len as u64;
                ctx.vcpu.set_regs(&regs)?;
                ctx.rr.output(&q, ctx.mem, &*ctx.vcpu)?;
                self.stats.cpuid += 1;
            }
        }
        Ok(())
    }
}

impl Module for TrapModule {
    fn name(&self) -> &'static str {
        "trap"
    }

    fn setup(&mut self, setup: &mut Setup<'_>) -> Result<(), ModuleError> {
        setup.register_vmexit_handler();
        Ok(())
    }

    fn handle_vmexit(&mut self, exit: &VmExit, ctx: &mut Context<'_>) -> Result<bool, ModuleError> {
        let VmExit::Debug { pc } = *exit else {
            return Ok(false);
        };
        let Some(trap) = self.table.find(pc).copied() else {
            debug!("breakpoint at {:#x} is not a trap", pc);
            return Ok(false);
        };
        self.emulate(trap, ctx)?;
        Ok(true)
    }

    fn image_loaded(
        &mut self,
        image: &LoadedImage,
        ctx: &mut Context<'_>,
    ) -> Result<(), ModuleError> {
        let table = TrapTable::scan(ctx.mem, image.entry, image.text_end)?;
        table.patch(ctx.mem)?;
        info!(
            "traps: {} instruction(s) patched in [{:#x}, {:#x})",
            table.len(),
            image.entry,
            image.text_end
        );
        self.table = table;
        if !self.breakpoints {
            ctx.vcpu.enable_sw_breakpoints()?;
            self.breakpoints = true;
        }
        Ok(())
    }
}
