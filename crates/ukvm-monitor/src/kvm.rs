//! KVM backend: VM and vCPU creation, long-mode setup and the `run`
//! wrapper that turns `VcpuExit` into [`VmExit`].

use kvm_bindings::{
    kvm_fpu, kvm_guest_debug, kvm_regs, kvm_sregs, kvm_userspace_memory_region,
    KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_USE_SW_BP,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use log::{debug, info};
use thiserror::Error;

use crate::cpu::{self, CpuError};
use crate::memory::{BootSegment, GuestRam, MemoryError};
use crate::vcpu::{Vcpu, VcpuError, VmExit};
use ukvm_protocol::{GDT_BASE, PML4_BASE};

// x86_64 control register flags
const X86_CR0_PE: u64 = 0x1;
const X86_CR0_PG: u64 = 0x8000_0000;
const X86_CR4_PAE: u64 = 0x20;
const EFER_LME: u64 = 0x100;
const EFER_LMA: u64 = 0x400;

#[derive(Error, Debug)]
pub enum KvmError {
    #[error("Failed to open /dev/kvm: {0}")]
    Open(#[source] kvm_ioctls::Error),

    #[error("Failed to create VM: {0}")]
    VmCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to create vCPU: {0}")]
    VcpuCreate(#[source] kvm_ioctls::Error),

    #[error("Failed to set user memory region: {0}")]
    SetUserMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("Failed to set FPU: {0}")]
    SetFpu(#[source] kvm_ioctls::Error),

    #[error(transparent)]
    Cpu(#[from] CpuError),

    #[error(transparent)]
    Vcpu(#[from] VcpuError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// The KVM system and VM file descriptors.  Must outlive the vCPU.
pub struct KvmVm {
    _kvm: Kvm,
    _vm: VmFd,
    tsc_freq: u64,
}

impl KvmVm {
    /// Create a VM over `mem` with a single vCPU in 64-bit long mode.
    ///
    /// General registers are left for the caller; see
    /// [`crate::vcpu::boot_regs`].
    pub fn new(mem: &GuestRam) -> Result<(Self, KvmVcpu), KvmError> {
        let kvm = Kvm::new().map_err(KvmError::Open)?;
        let vm = kvm.create_vm().map_err(KvmError::VmCreate)?;

        let region = kvm_userspace_memory_region {
            slot: 0,
            guest_phys_addr: 0,
            memory_size: mem.size() as u64,
            userspace_addr: mem.host_address()?,
            flags: 0,
        };
        // SAFETY: the region stays mapped for as long as `mem` lives, and
        // the monitor owns both for the whole run.
        unsafe {
            vm.set_user_memory_region(region)
                .map_err(KvmError::SetUserMemoryRegion)?;
        }

        let fd = vm.create_vcpu(0).map_err(KvmError::VcpuCreate)?;
        let cpuid = cpu::supported_cpuid(&kvm)?;
        cpu::apply_cpuid(&fd, &cpuid)?;
        let tsc_freq = cpu::tsc_frequency(&fd);

        let vcpu = KvmVcpu { fd };
        vcpu.setup_long_mode()?;
        vcpu.setup_fpu()?;

        info!(
            "KVM VM created: {} MB, TSC {} Hz",
            mem.size() / (1024 * 1024),
            tsc_freq
        );

        Ok((
            Self {
                _kvm: kvm,
                _vm: vm,
                tsc_freq,
            },
            vcpu,
        ))
    }

    pub fn tsc_freq(&self) -> u64 {
        self.tsc_freq
    }
}

pub struct KvmVcpu {
    fd: VcpuFd,
}

impl KvmVcpu {
    fn setup_long_mode(&self) -> Result<(), VcpuError> {
        let mut sregs = self.fd.get_sregs().map_err(VcpuError::GetSregs)?;

        let data = BootSegment::Data.kvm_segment();
        sregs.cs = BootSegment::Code.kvm_segment();
        sregs.ds = data;
        sregs.es = data;
        sregs.fs = data;
        sregs.gs = data;
        sregs.ss = data;
        sregs.tr = BootSegment::Tss.kvm_segment();

        sregs.gdt.base = GDT_BASE;
        sregs.gdt.limit = (BootSegment::GDT_SLOTS * 8 - 1) as u16;

        sregs.cr0 |= X86_CR0_PE | X86_CR0_PG;
        sregs.cr3 = PML4_BASE;
        sregs.cr4 |= X86_CR4_PAE;
        sregs.efer |= EFER_LME | EFER_LMA;

        self.fd.set_sregs(&sregs).map_err(VcpuError::SetSregs)
    }

    fn setup_fpu(&self) -> Result<(), KvmError> {
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        self.fd.set_fpu(&fpu).map_err(KvmError::SetFpu)
    }
}

impl Vcpu for KvmVcpu {
    fn run(&mut self) -> Result<VmExit, VcpuError> {
        let exit = match self.fd.run() {
            Ok(exit) => exit,
            Err(e) if e.errno() == libc::EINTR => return Ok(VmExit::Interrupted),
            Err(e) if e.errno() == libc::EFAULT => return Err(VcpuError::GuestFault),
            Err(e) => return Err(VcpuError::Run(e)),
        };
        Ok(match exit {
            VcpuExit::Hlt => VmExit::Hlt,
            VcpuExit::IoOut(port, data) => VmExit::io_out(port, data),
            VcpuExit::IoIn(port, data) => VmExit::IoIn {
                port,
                size: data.len(),
            },
            VcpuExit::Debug(arch) => VmExit::Debug { pc: arch.pc },
            VcpuExit::Shutdown => VmExit::Shutdown,
            VcpuExit::FailEntry(reason, _cpu) => VmExit::FailEntry { reason },
            VcpuExit::InternalError => VmExit::InternalError,
            VcpuExit::Intr => VmExit::Interrupted,
            other => {
                debug!("unmapped KVM exit: {:?}", other);
                VmExit::Unhandled(format!("{:?}", other))
            }
        })
    }

    fn regs(&self) -> Result<kvm_regs, VcpuError> {
        self.fd.get_regs().map_err(VcpuError::GetRegs)
    }

    fn set_regs(&mut self, regs: &kvm_regs) -> Result<(), VcpuError> {
        self.fd.set_regs(regs).map_err(VcpuError::SetRegs)
    }

    fn sregs(&self) -> Result<kvm_sregs, VcpuError> {
        self.fd.get_sregs().map_err(VcpuError::GetSregs)
    }

    fn enable_sw_breakpoints(&mut self) -> Result<(), VcpuError> {
        let dbg = kvm_guest_debug {
            control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_USE_SW_BP,
            ..Default::default()
        };
        self.fd
            .set_guest_debug(&dbg)
            .map_err(VcpuError::GuestDebug)?;
        info!("software breakpoints enabled");
        Ok(())
    }
}
