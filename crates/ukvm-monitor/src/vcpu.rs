//! The vCPU seam.
//!
//! The exit loop, the hypercall handlers, the trap emulator and the RR
//! engine only ever see a `dyn Vcpu`.  [`crate::kvm::KvmVcpu`] is the real
//! implementation; tests drive the monitor with a scripted one.

use kvm_bindings::{kvm_regs, kvm_sregs};
use thiserror::Error;

/// Why the vCPU stopped running guest code.
///
/// A hypervisor-independent view of the exits the monitor cares about.
/// Anything else is carried as [`VmExit::Unhandled`] with a description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmExit {
    Hlt,
    /// Port write.  `value` holds the first `size` bytes, little-endian.
    IoOut { port: u16, size: usize, value: u32 },
    IoIn { port: u16, size: usize },
    /// Software breakpoint at `pc`.
    Debug { pc: u64 },
    Shutdown,
    FailEntry { reason: u64 },
    InternalError,
    /// The run call was interrupted by a signal and should be retried.
    Interrupted,
    Unhandled(String),
}

impl VmExit {
    /// Build an `IoOut` from the raw bytes the hypervisor hands over.
    pub fn io_out(port: u16, data: &[u8]) -> Self {
        let mut bytes = [0u8; 4];
        let n = data.len().min(4);
        bytes[..n].copy_from_slice(&data[..n]);
        VmExit::IoOut {
            port,
            size: data.len(),
            value: u32::from_le_bytes(bytes),
        }
    }
}

#[derive(Error, Debug)]
pub enum VcpuError {
    #[error("Failed to run vCPU: {0}")]
    Run(#[source] kvm_ioctls::Error),

    #[error("Guest memory translation fault")]
    GuestFault,

    #[error("Failed to get vCPU registers: {0}")]
    GetRegs(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU registers: {0}")]
    SetRegs(#[source] kvm_ioctls::Error),

    #[error("Failed to get vCPU special registers: {0}")]
    GetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to set vCPU special registers: {0}")]
    SetSregs(#[source] kvm_ioctls::Error),

    #[error("Failed to enable guest debugging: {0}")]
    GuestDebug(#[source] kvm_ioctls::Error),
}

/// One virtual CPU.  Single-threaded: only the exit loop calls `run`.
pub trait Vcpu {
    fn run(&mut self) -> Result<VmExit, VcpuError>;
    fn regs(&self) -> Result<kvm_regs, VcpuError>;
    fn set_regs(&mut self, regs: &kvm_regs) -> Result<(), VcpuError>;
    fn sregs(&self) -> Result<kvm_sregs, VcpuError>;
    /// Make `int3` in the guest exit to the monitor as [`VmExit::Debug`].
    fn enable_sw_breakpoints(&mut self) -> Result<(), VcpuError>;

    /// Current instruction pointer, or 0 when registers are unreadable.
    /// Used for diagnostics only.
    fn rip(&self) -> u64 {
        self.regs().map(|r| r.rip).unwrap_or(0)
    }
}

/// General registers at guest entry: `rip` at the entry point, the stack
/// at the top of memory and the boot-info pointer as the only argument.
pub fn boot_regs(entry: u64, mem_size: u64) -> kvm_regs {
    kvm_regs {
        rip: entry,
        rsp: mem_size - 8,
        rdi: ukvm_protocol::BOOT_INFO_BASE,
        rflags: 0x2,
        ..Default::default()
    }
}
