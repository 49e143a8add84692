//! CPU configuration and host instruction sources.
//!
//! Two unrelated concerns share this module because both are about what
//! the guest sees when it asks the processor something:
//!
//! - **CPUID setup**: the vCPU is handed the host's KVM-supported CPUID
//!   table unchanged, and its TSC frequency is reported in boot info.
//! - **[`HostCpu`]**: where the values for trapped `RDTSC`, `RDRAND` and
//!   `CPUID` instructions come from when they are emulated in userspace.
//!   Production uses [`X86Cpu`]; tests substitute a scripted source so a
//!   record and a replay can be fed different "hardware".

use kvm_bindings::{CpuId, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VcpuFd};
use log::{info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CpuError {
    #[error("Failed to get supported CPUID: {0}")]
    GetSupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("Failed to set CPUID on vCPU: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("Failed to query TSC frequency: {0}")]
    GetTscKhz(#[source] kvm_ioctls::Error),
}

// ═══════════════════════════════════════════════════════════════════════
//  CPUID passthrough
// ═══════════════════════════════════════════════════════════════════════

/// Fetch the CPUID table KVM supports on this host.
pub fn supported_cpuid(kvm: &Kvm) -> Result<CpuId, CpuError> {
    let cpuid = kvm
        .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
        .map_err(CpuError::GetSupportedCpuid)?;
    info!("CPUID: {} supported entries", cpuid.as_slice().len());
    Ok(cpuid)
}

/// Install `cpuid` on the vCPU.
pub fn apply_cpuid(vcpu: &VcpuFd, cpuid: &CpuId) -> Result<(), CpuError> {
    vcpu.set_cpuid2(cpuid).map_err(CpuError::SetCpuid)
}

/// TSC frequency of the vCPU in Hz, as reported to the guest.
///
/// Hosts without `KVM_CAP_GET_TSC_KHZ` report 0 and the guest has to
/// calibrate on its own.
pub fn tsc_frequency(vcpu: &VcpuFd) -> u64 {
    match vcpu.get_tsc_khz() {
        Ok(khz) => u64::from(khz) * 1000,
        Err(e) => {
            warn!("TSC frequency unavailable ({}), reporting 0", CpuError::GetTscKhz(e));
            0
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Host instruction sources
// ═══════════════════════════════════════════════════════════════════════

/// Register values produced by one `CPUID` query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Source of values for emulated nondeterministic instructions.
pub trait HostCpu: Send {
    fn rdtsc(&mut self) -> u64;
    fn rdrand(&mut self) -> u64;
    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuidResult;
}

/// The real processor the monitor runs on.
pub struct X86Cpu {
    has_rdrand: bool,
}

impl X86Cpu {
    pub fn new() -> Self {
        #[cfg(target_arch = "x86_64")]
        let has_rdrand = std::arch::is_x86_feature_detected!("rdrand");
        #[cfg(not(target_arch = "x86_64"))]
        let has_rdrand = false;

        if !has_rdrand {
            warn!("host lacks RDRAND; emulated RDRAND will use a software generator");
        }
        Self { has_rdrand }
    }
}

impl Default for X86Cpu {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "rdrand")]
unsafe fn rdrand64() -> Option<u64> {
    let mut value = 0u64;
    // Intel recommends retrying a bounded number of times.
    for _ in 0..10 {
        if std::arch::x86_64::_rdrand64_step(&mut value) == 1 {
            return Some(value);
        }
    }
    None
}

impl HostCpu for X86Cpu {
    fn rdtsc(&mut self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: RDTSC is available on every x86_64 processor.
            unsafe { std::arch::x86_64::_rdtsc() }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            0
        }
    }

    fn rdrand(&mut self) -> u64 {
        #[cfg(target_arch = "x86_64")]
        {
            if self.has_rdrand {
                // SAFETY: the feature was detected at construction.
                if let Some(v) = unsafe { rdrand64() } {
                    return v;
                }
            }
        }
        rand::random()
    }

    fn cpuid(&mut self, leaf: u32, subleaf: u32) -> CpuidResult {
        #[cfg(target_arch = "x86_64")]
        {
            // SAFETY: CPUID is available on every x86_64 processor.
            let r = unsafe { std::arch::x86_64::__cpuid_count(leaf, subleaf) };
            CpuidResult {
                eax: r.eax,
                ebx: r.ebx,
                ecx: r.ecx,
                edx: r.edx,
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = (leaf, subleaf);
            CpuidResult::default()
        }
    }
}
