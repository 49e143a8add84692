//! ukvm monitor: boots a unikernel on KVM behind a narrow hypercall ABI.
//!
//! The guest talks to the monitor only through 32-bit port writes in the
//! hypercall window (see `ukvm_protocol`).  Every guest-supplied address
//! goes through [`memory::GuestRam::check`] before it is touched, and every
//! nondeterministic value the guest sees can be recorded and replayed.
//!
//! # Architecture
//!
//! - [`vm`]: the monitor, its module registry and the VM-exit loop
//! - [`module`]: the module trait, setup handle and poll set
//! - [`hypercall`]: the dispatch table
//! - [`devices`]: console, lifecycle, block and network handlers
//! - [`trap`]: RDTSC/RDRAND/CPUID patching and emulation
//! - [`rr`]: record/replay engine and consistency checks
//! - [`memory`], [`loader`], [`kvm`], [`cpu`], [`vcpu`]: guest memory, ELF
//!   loading and the KVM backend
//! - [`verified`]: pure bounds arithmetic kept free of I/O

pub mod boot;
pub mod config;
pub mod cpu;
pub mod devices;
pub mod hypercall;
pub mod kvm;
pub mod loader;
pub mod memory;
pub mod module;
pub mod rr;
pub mod trap;
pub mod vcpu;
pub mod verified;
pub mod vm;

#[cfg(test)]
mod testutil;
