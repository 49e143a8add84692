//! Fixtures shared by the in-crate tests: a scripted vCPU, a console that
//! can be inspected after the monitor takes ownership of it, and a tiny
//! ELF builder.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use kvm_bindings::{kvm_regs, kvm_sregs};
use ukvm_protocol::Hypercall;

use crate::memory::{BootSegment, GuestRam};
use crate::vcpu::{Vcpu, VcpuError, VmExit};

pub const TEST_MEM: usize = 4 << 20;

pub fn guest_ram() -> GuestRam {
    GuestRam::new(TEST_MEM).unwrap()
}

/// A vCPU that replays a fixed list of exits, then halts.
///
/// Each exit may move `rip` first, which is how a test makes a `Debug`
/// exit land on a trap.
#[derive(Default)]
pub struct ScriptedVcpu {
    exits: VecDeque<(Option<u64>, VmExit)>,
    pub regs: kvm_regs,
    pub sregs: kvm_sregs,
    pub breakpoints: bool,
}

impl ScriptedVcpu {
    pub fn new() -> Self {
        let mut sregs = kvm_sregs::default();
        sregs.cs = BootSegment::Code.kvm_segment();
        sregs.ds = BootSegment::Data.kvm_segment();
        sregs.cr3 = ukvm_protocol::PML4_BASE;
        Self {
            sregs,
            ..Default::default()
        }
    }

    pub fn push(&mut self, exit: VmExit) -> &mut Self {
        self.exits.push_back((None, exit));
        self
    }

    pub fn push_at(&mut self, rip: u64, exit: VmExit) -> &mut Self {
        self.exits.push_back((Some(rip), exit));
        self
    }

    /// Queue a hypercall: a 4-byte `OUT` of `gpa` to the call's port.
    pub fn hypercall(&mut self, call: Hypercall, gpa: u32) -> &mut Self {
        self.push(VmExit::IoOut {
            port: call.port(),
            size: 4,
            value: gpa,
        })
    }

    /// Queue an `int3` exit at `pc`.
    pub fn breakpoint(&mut self, pc: u64) -> &mut Self {
        self.push_at(pc, VmExit::Debug { pc })
    }
}

impl Vcpu for ScriptedVcpu {
    fn run(&mut self) -> Result<VmExit, VcpuError> {
        match self.exits.pop_front() {
            Some((rip, exit)) => {
                if let Some(rip) = rip {
                    self.regs.rip = rip;
                }
                Ok(exit)
            }
            None => Ok(VmExit::Hlt),
        }
    }

    fn regs(&self) -> Result<kvm_regs, VcpuError> {
        Ok(self.regs)
    }

    fn set_regs(&mut self, regs: &kvm_regs) -> Result<(), VcpuError> {
        self.regs = *regs;
        Ok(())
    }

    fn sregs(&self) -> Result<kvm_sregs, VcpuError> {
        Ok(self.sregs)
    }

    fn enable_sw_breakpoints(&mut self) -> Result<(), VcpuError> {
        self.breakpoints = true;
        Ok(())
    }
}

/// Console sink whose contents stay reachable through a clone.
#[derive(Clone, Default)]
pub struct SharedConsole(pub Arc<Mutex<Vec<u8>>>);

impl SharedConsole {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedConsole {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Build a minimal static x86_64 executable: one R+X `PT_LOAD` segment
/// holding `code`, loaded at and entered from `entry`.
pub fn build_elf(entry: u64, code: &[u8]) -> Vec<u8> {
    const EHDR: usize = 64;
    const PHDR: usize = 56;
    const CODE_OFFSET: usize = 128;

    let mut out = vec![0u8; CODE_OFFSET];
    out[0..4].copy_from_slice(b"\x7fELF");
    out[4] = 2; // ELFCLASS64
    out[5] = 1; // little-endian
    out[6] = 1; // EV_CURRENT
    out[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    out[20..24].copy_from_slice(&1u32.to_le_bytes());
    out[24..32].copy_from_slice(&entry.to_le_bytes());
    out[32..40].copy_from_slice(&(EHDR as u64).to_le_bytes()); // e_phoff
    out[52..54].copy_from_slice(&(EHDR as u16).to_le_bytes()); // e_ehsize
    out[54..56].copy_from_slice(&(PHDR as u16).to_le_bytes()); // e_phentsize
    out[56..58].copy_from_slice(&1u16.to_le_bytes()); // e_phnum
    out[58..60].copy_from_slice(&64u16.to_le_bytes()); // e_shentsize

    let ph = &mut out[EHDR..EHDR + PHDR];
    ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    ph[4..8].copy_from_slice(&5u32.to_le_bytes()); // PF_R | PF_X
    ph[8..16].copy_from_slice(&(CODE_OFFSET as u64).to_le_bytes());
    ph[16..24].copy_from_slice(&entry.to_le_bytes()); // p_vaddr
    ph[24..32].copy_from_slice(&entry.to_le_bytes()); // p_paddr
    ph[32..40].copy_from_slice(&(code.len() as u64).to_le_bytes());
    ph[40..48].copy_from_slice(&(code.len() as u64).to_le_bytes());
    ph[48..56].copy_from_slice(&0x1000u64.to_le_bytes());

    out.extend_from_slice(code);
    out
}
