//! Putting a monitor together from a [`MonitorConfig`].

use std::io;
use std::path::Path;

use log::info;

use crate::config::MonitorConfig;
use crate::cpu::{HostCpu, X86Cpu};
use crate::devices::{BlockModule, ConsoleModule, LifecycleModule, NetModule, Tap};
use crate::kvm::KvmVm;
use crate::loader::{self, LoadedImage};
use crate::memory::{GuestRam, MemoryError};
use crate::module::Module;
use crate::rr::RrEngine;
use crate::trap::TrapModule;
use crate::vm::{Monitor, MonitorError, Termination};

/// Write the page tables, the GDT and the command line.
pub fn prepare_memory(mem: &GuestRam, cmdline: &str) -> Result<(), MemoryError> {
    mem.setup_page_tables()?;
    mem.setup_gdt()?;
    mem.write_cmdline(cmdline)?;
    Ok(())
}

/// Load the kernel image and describe it to the guest in the boot info.
pub fn load_kernel(mem: &GuestRam, path: &Path, tsc_freq: u64) -> Result<LoadedImage, MonitorError> {
    let image = loader::load_file(mem, path)?;
    mem.write_boot_info(image.kernel_end, tsc_freq)?;
    Ok(image)
}

/// Modules in registration order.  Instruction traps are only installed
/// when recording or replaying.
pub fn build_modules(
    config: &MonitorConfig,
    tsc_freq: u64,
    cpu: Box<dyn HostCpu>,
) -> Result<Vec<Box<dyn Module>>, MonitorError> {
    let mut modules: Vec<Box<dyn Module>> = vec![
        Box::new(ConsoleModule::new()),
        Box::new(LifecycleModule::new(tsc_freq)),
    ];
    if let Some(disk) = &config.disk {
        modules.push(Box::new(BlockModule::open(disk)?));
    }
    if let Some(net) = &config.net {
        let tap = Tap::attach(&net.iface)?;
        info!("net: attached {}", net.iface);
        modules.push(Box::new(NetModule::new(Box::new(tap), net.mac)));
    }
    if config.wants_traps() {
        modules.push(Box::new(TrapModule::new(cpu)));
    }
    Ok(modules)
}

/// Boot the configured guest on KVM and run it to completion.
pub fn launch(config: &MonitorConfig) -> Result<Termination, MonitorError> {
    config.validate()?;

    let mem = GuestRam::new(config.mem_size)?;
    prepare_memory(&mem, &config.cmdline)?;
    let (vm, vcpu) = KvmVm::new(&mem)?;
    let image = load_kernel(&mem, &config.kernel, vm.tsc_freq())?;

    let rr = RrEngine::open(&config.rr)?;
    let modules = build_modules(config, vm.tsc_freq(), Box::new(X86Cpu::new()))?;
    let mut monitor = Monitor::new(mem, vcpu, rr, Box::new(io::stdout()), modules)?;
    monitor.start(&image)?;

    let end = monitor.run();
    // Logs are flushed even when the run failed, so a divergence can be
    // inspected afterwards.
    let finished = monitor.finish();
    drop(vm);
    let end = end?;
    finished?;
    Ok(end)
}
