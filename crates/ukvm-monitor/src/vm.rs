//! The monitor: module registry plus the VM-exit loop.
//!
//! [`Monitor`] owns guest memory, the vCPU, the record/replay engine and
//! every module.  Registration happens in [`Monitor::new`]; after that the
//! dispatch table, poll set and exit-handler chain are read-only and
//! [`Monitor::run`] drives the vCPU until the guest stops or something
//! fatal happens.

use std::io::Write;

use log::{debug, error, info, trace};
use thiserror::Error;
use ukvm_protocol::{port_to_nr, HYPERCALL_ACCESS_SIZE};

use crate::config::ConfigError;
use crate::devices::block::BlockError;
use crate::devices::net::NetError;
use crate::hypercall::{DispatchError, HypercallTable, ModuleId, Outcome};
use crate::kvm::KvmError;
use crate::loader::{LoadedImage, LoaderError};
use crate::memory::{Gpa, GuestRam, MemoryError};
use crate::module::{Context, Module, ModuleError, PollSet, Setup};
use crate::rr::{RrEngine, RrError};
use crate::vcpu::{boot_regs, Vcpu, VcpuError, VmExit};

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Kvm(#[from] KvmError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Rr(#[from] RrError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Vcpu(#[from] VcpuError),

    #[error("{0} (rip={1:#x})")]
    Dispatch(DispatchError, u64),

    #[error("module {module}: {source}")]
    Module {
        module: &'static str,
        #[source]
        source: ModuleError,
    },

    #[error("Invalid guest port access: port={port:#x} size={size} {direction} (rip={rip:#x})")]
    InvalidPortAccess {
        port: u16,
        size: usize,
        direction: &'static str,
        rip: u64,
    },

    #[error("Guest memory translation fault (rip={rip:#x})")]
    GuestFault { rip: u64 },

    #[error("Unexpected breakpoint (rip={rip:#x})")]
    UnhandledBreakpoint { rip: u64 },

    #[error("KVM entry failed: hardware_entry_failure_reason={reason:#x} (rip={rip:#x})")]
    FailEntry { reason: u64, rip: u64 },

    #[error("KVM internal error (rip={rip:#x})")]
    InternalError { rip: u64 },

    #[error("Guest shutdown (triple fault?) (rip={rip:#x})")]
    Shutdown { rip: u64 },

    #[error("Unhandled exit {reason} (rip={rip:#x})")]
    UnhandledExit { reason: String, rip: u64 },
}

/// How a run ended without a fatal error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The guest issued HALT with this status.
    Exit(i32),
    /// The guest executed `hlt`.
    Hlt,
    /// Replay consumed the whole log.
    ReplayExhausted,
}

impl Termination {
    pub fn exit_code(&self) -> i32 {
        match *self {
            Termination::Exit(status) => status,
            Termination::Hlt | Termination::ReplayExhausted => 0,
        }
    }
}

pub struct Monitor<V: Vcpu> {
    mem: GuestRam,
    vcpu: V,
    rr: RrEngine,
    console: Box<dyn Write>,
    modules: Vec<Box<dyn Module>>,
    table: HypercallTable,
    polls: PollSet,
    exit_handlers: Vec<ModuleId>,
    exits: u64,
    hypercalls: u64,
}

impl<V: Vcpu> Monitor<V> {
    /// Run every module's setup in order.  A module's id is its position
    /// in `modules`.
    pub fn new(
        mem: GuestRam,
        vcpu: V,
        rr: RrEngine,
        console: Box<dyn Write>,
        mut modules: Vec<Box<dyn Module>>,
    ) -> Result<Self, MonitorError> {
        let mut table = HypercallTable::new();
        let mut polls = PollSet::new();
        let mut exit_handlers = Vec::new();

        for (id, module) in modules.iter_mut().enumerate() {
            let mut setup = Setup {
                id,
                table: &mut table,
                polls: &mut polls,
                wants_vmexits: false,
            };
            module
                .setup(&mut setup)
                .map_err(|source| MonitorError::Module {
                    module: module.name(),
                    source,
                })?;
            if setup.wants_vmexits {
                exit_handlers.push(id);
            }
            debug!("module {} ({}) ready", id, module.name());
        }

        let calls: Vec<&str> = table.registered().map(|c| c.name()).collect();
        info!(
            "{} module(s); hypercalls: {}; {} poll device(s)",
            modules.len(),
            calls.join(" "),
            polls.len()
        );

        Ok(Self {
            mem,
            vcpu,
            rr,
            console,
            modules,
            table,
            polls,
            exit_handlers,
            exits: 0,
            hypercalls: 0,
        })
    }

    pub fn mem(&self) -> &GuestRam {
        &self.mem
    }

    pub fn vcpu(&self) -> &V {
        &self.vcpu
    }

    pub fn vcpu_mut(&mut self) -> &mut V {
        &mut self.vcpu
    }

    pub fn rr(&self) -> &RrEngine {
        &self.rr
    }

    /// Point the vCPU at a freshly loaded image and tell every module.
    pub fn start(&mut self, image: &LoadedImage) -> Result<(), MonitorError> {
        self.vcpu
            .set_regs(&boot_regs(image.entry, self.mem.size() as u64))?;
        self.image_loaded(image)
    }

    fn image_loaded(&mut self, image: &LoadedImage) -> Result<(), MonitorError> {
        for id in 0..self.modules.len() {
            self.with_module(id, |module, ctx| module.image_loaded(image, ctx))?;
        }
        Ok(())
    }

    /// Lend the monitor's state to module `id` for one call.
    fn with_module<R>(
        &mut self,
        id: ModuleId,
        f: impl FnOnce(&mut dyn Module, &mut Context<'_>) -> Result<R, ModuleError>,
    ) -> Result<R, MonitorError> {
        let Self {
            mem,
            vcpu,
            rr,
            console,
            modules,
            polls,
            ..
        } = self;
        let module = modules[id].as_mut();
        let name = module.name();
        let mut ctx = Context {
            mem,
            vcpu,
            rr,
            polls,
            console: console.as_mut(),
        };
        f(module, &mut ctx).map_err(|source| MonitorError::Module { module: name, source })
    }

    /// Drive the vCPU until the guest stops.
    pub fn run(&mut self) -> Result<Termination, MonitorError> {
        let result = self.run_loop();
        match &result {
            Ok(end) => info!(
                "guest stopped: {:?} after {} exits, {} hypercalls, {} rr transfers",
                end,
                self.exits,
                self.hypercalls,
                self.rr.transfers()
            ),
            Err(e) => error!("{} (after {} exits)", e, self.exits),
        }
        result
    }

    fn run_loop(&mut self) -> Result<Termination, MonitorError> {
        loop {
            let exit = match self.vcpu.run() {
                Ok(exit) => exit,
                Err(VcpuError::GuestFault) => {
                    return Err(MonitorError::GuestFault {
                        rip: self.vcpu.rip(),
                    })
                }
                Err(e) => return Err(e.into()),
            };
            if exit == VmExit::Interrupted {
                continue;
            }
            self.exits += 1;
            trace!("exit {}: {:?}", self.exits, exit);

            match self.handle_exit(exit) {
                Ok(None) => {}
                Ok(Some(end)) => return Ok(end),
                Err(MonitorError::Module { source, .. }) if source.is_replay_exhausted() => {
                    info!("replay log exhausted");
                    return Ok(Termination::ReplayExhausted);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_exit(&mut self, exit: VmExit) -> Result<Option<Termination>, MonitorError> {
        for i in 0..self.exit_handlers.len() {
            let id = self.exit_handlers[i];
            if self.with_module(id, |module, ctx| module.handle_vmexit(&exit, ctx))? {
                return Ok(None);
            }
        }

        let rip = self.vcpu.rip();
        match exit {
            VmExit::Hlt => Ok(Some(Termination::Hlt)),
            VmExit::IoOut { port, size, value } => {
                let nr = match port_to_nr(port) {
                    Some(nr) if size == HYPERCALL_ACCESS_SIZE => nr,
                    _ => {
                        return Err(MonitorError::InvalidPortAccess {
                            port,
                            size,
                            direction: "out",
                            rip,
                        })
                    }
                };
                self.dispatch(nr, Gpa::from(value), rip)
            }
            VmExit::IoIn { port, size } => Err(MonitorError::InvalidPortAccess {
                port,
                size,
                direction: "in",
                rip,
            }),
            VmExit::Debug { .. } => Err(MonitorError::UnhandledBreakpoint { rip }),
            VmExit::Shutdown => Err(MonitorError::Shutdown { rip }),
            VmExit::FailEntry { reason } => Err(MonitorError::FailEntry { reason, rip }),
            VmExit::InternalError => Err(MonitorError::InternalError { rip }),
            VmExit::Interrupted => Ok(None),
            VmExit::Unhandled(reason) => Err(MonitorError::UnhandledExit { reason, rip }),
        }
    }

    fn dispatch(&mut self, nr: u32, gpa: Gpa, rip: u64) -> Result<Option<Termination>, MonitorError> {
        let (call, owner) = self
            .table
            .lookup(nr)
            .map_err(|e| MonitorError::Dispatch(e, rip))?;
        self.hypercalls += 1;
        debug!("hypercall {} gpa={:#x}", call.name(), gpa);

        match self.with_module(owner, |module, ctx| module.handle_hypercall(call, gpa, ctx))? {
            Outcome::Continue => Ok(None),
            Outcome::Halt(status) => Ok(Some(Termination::Exit(status))),
            Outcome::Loaded(image) => {
                self.image_loaded(&image)?;
                Ok(None)
            }
        }
    }

    /// Flush the record/replay logs and release the guest.
    pub fn finish(self) -> Result<(), MonitorError> {
        let Self { mut console, rr, .. } = self;
        // Console flush failures at exit are not worth masking the run result.
        let _ = console.flush();
        rr.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::tests::FakeCpu;
    use crate::devices::{BlockModule, ConsoleModule, LifecycleModule, MemDisk, NetModule, QueueNet};
    use crate::loader::load_elf;
    use crate::rr::{RrConfig, RrMode};
    use crate::testutil::{build_elf, guest_ram, ScriptedVcpu, SharedConsole};
    use crate::trap::TrapModule;
    use ukvm_protocol::{
        BlkInfo, BlkRead, BlkWrite, Halt, Hypercall, NetRead, Poll, Puts, HALT_DUMP_MAX, PIO_BASE,
    };

    const ENTRY: u64 = 0x10_0000;
    // rdtsc; rdrand rax; cpuid; hlt
    const CODE: &[u8] = &[0x0f, 0x31, 0x48, 0x0f, 0xc7, 0xf0, 0x0f, 0xa2, 0xf4];
    const RDTSC_AT: u64 = ENTRY;
    const RDRAND_AT: u64 = ENTRY + 2;
    const CPUID_AT: u64 = ENTRY + 6;

    const REQ_A: u32 = 0x8000;
    const REQ_B: u32 = 0x8100;
    const REQ_C: u32 = 0x8200;
    const DATA: u32 = 0x9000;
    const OUT: u32 = 0xa000;

    fn modules(disk: MemDisk, cpu: Option<FakeCpu>) -> Vec<Box<dyn Module>> {
        let mut modules: Vec<Box<dyn Module>> = vec![
            Box::new(ConsoleModule::new()),
            Box::new(LifecycleModule::new(0)),
            Box::new(BlockModule::new(Box::new(disk)).unwrap()),
        ];
        if let Some(cpu) = cpu {
            modules.push(Box::new(TrapModule::new(Box::new(cpu))));
        }
        modules
    }

    fn monitor(
        vcpu: ScriptedVcpu,
        rr: RrEngine,
        modules: Vec<Box<dyn Module>>,
    ) -> (Monitor<ScriptedVcpu>, SharedConsole) {
        let console = SharedConsole::default();
        let monitor = Monitor::new(guest_ram(), vcpu, rr, Box::new(console.clone()), modules).unwrap();
        (monitor, console)
    }

    /// Guest memory for the block scenario: a payload, a blkwrite of one
    /// sector, a blkread into a second buffer and a puts of 11 bytes.
    fn stage_block_scenario(mem: &GuestRam) {
        let mut sector = [0u8; 512];
        sector[..11].copy_from_slice(b"0123456789\n");
        mem.write_bytes(Gpa::from(DATA), &sector).unwrap();
        mem.write_struct(Gpa::from(REQ_A), &BlkWrite { sector: 0, data: DATA, len: 512, ret: 9 })
            .unwrap();
        mem.write_struct(Gpa::from(REQ_B), &BlkRead { sector: 0, data: OUT, len: 512, ret: 9 })
            .unwrap();
        mem.write_struct(Gpa::from(REQ_C), &Puts { data: OUT, len: 11 }).unwrap();
    }

    fn block_script() -> ScriptedVcpu {
        let mut vcpu = ScriptedVcpu::new();
        vcpu.hypercall(Hypercall::BlkWrite, REQ_A)
            .hypercall(Hypercall::BlkRead, REQ_B)
            .hypercall(Hypercall::Puts, REQ_C);
        vcpu
    }

    #[test]
    fn blkwrite_blkread_puts_roundtrip() {
        let (mut mon, console) =
            monitor(block_script(), RrEngine::disabled(), modules(MemDisk::new(4096), None));
        stage_block_scenario(mon.mem());

        assert_eq!(mon.run().unwrap(), Termination::Hlt);
        assert_eq!(console.contents(), b"0123456789\n");
        assert_eq!(mon.mem().read_struct::<BlkRead>(Gpa::from(REQ_B)).unwrap().ret, 0);
    }

    #[test]
    fn halt_hypercall_ends_run_with_status() {
        let mut vcpu = ScriptedVcpu::new();
        vcpu.hypercall(Hypercall::Halt, REQ_A)
            .hypercall(Hypercall::Puts, REQ_B);
        let (mut mon, console) = monitor(vcpu, RrEngine::disabled(), modules(MemDisk::new(512), None));
        let halt = Halt { exit_status: 7, len: 0, data: [0; HALT_DUMP_MAX] };
        mon.mem().write_struct(Gpa::from(REQ_A), &halt).unwrap();

        let end = mon.run().unwrap();
        assert_eq!(end, Termination::Exit(7));
        assert_eq!(end.exit_code(), 7);
        assert!(console.contents().is_empty(), "nothing runs after HALT");
    }

    #[test]
    fn unregistered_hypercall_is_fatal() {
        let mut vcpu = ScriptedVcpu::new();
        vcpu.hypercall(Hypercall::NetInfo, REQ_A);
        let (mut mon, _) = monitor(vcpu, RrEngine::disabled(), modules(MemDisk::new(512), None));
        assert!(matches!(
            mon.run(),
            Err(MonitorError::Dispatch(DispatchError::InvalidHypercall { nr: 6 }, _))
        ));
    }

    #[test]
    fn reserved_number_zero_is_fatal() {
        let mut vcpu = ScriptedVcpu::new();
        vcpu.push(VmExit::IoOut { port: PIO_BASE, size: 4, value: REQ_A });
        let (mut mon, _) = monitor(vcpu, RrEngine::disabled(), modules(MemDisk::new(512), None));
        assert!(matches!(
            mon.run(),
            Err(MonitorError::Dispatch(DispatchError::InvalidHypercall { nr: 0 }, _))
        ));
    }

    #[test]
    fn abi_violating_port_accesses_are_fatal() {
        let cases = [
            VmExit::IoOut { port: Hypercall::Puts.port(), size: 2, value: REQ_A },
            VmExit::IoOut { port: 0x3f8, size: 4, value: 0 },
            VmExit::IoIn { port: Hypercall::Puts.port(), size: 4 },
        ];
        for exit in cases {
            let mut vcpu = ScriptedVcpu::new();
            vcpu.push_at(0x10_0042, exit.clone());
            let (mut mon, _) = monitor(vcpu, RrEngine::disabled(), modules(MemDisk::new(512), None));
            match mon.run() {
                Err(MonitorError::InvalidPortAccess { rip, .. }) => assert_eq!(rip, 0x10_0042),
                other => panic!("{exit:?}: unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn hypervisor_failures_are_fatal_with_rip() {
        let mut vcpu = ScriptedVcpu::new();
        vcpu.push_at(0x10_0010, VmExit::FailEntry { reason: 0x21 });
        let (mut mon, _) = monitor(vcpu, RrEngine::disabled(), modules(MemDisk::new(512), None));
        assert!(matches!(
            mon.run(),
            Err(MonitorError::FailEntry { reason: 0x21, rip: 0x10_0010 })
        ));

        let mut vcpu = ScriptedVcpu::new();
        vcpu.push(VmExit::Unhandled("Mmio".into()));
        let (mut mon, _) = monitor(vcpu, RrEngine::disabled(), modules(MemDisk::new(512), None));
        assert!(matches!(mon.run(), Err(MonitorError::UnhandledExit { .. })));
    }

    #[test]
    fn interrupted_run_is_retried() {
        let mut vcpu = ScriptedVcpu::new();
        vcpu.push(VmExit::Interrupted)
            .push(VmExit::Interrupted)
            .hypercall(Hypercall::Puts, REQ_A);
        let (mut mon, console) = monitor(vcpu, RrEngine::disabled(), modules(MemDisk::new(512), None));
        mon.mem().write_bytes(Gpa::from(DATA), b"still here").unwrap();
        mon.mem().write_struct(Gpa::from(REQ_A), &Puts { data: DATA, len: 10 }).unwrap();
        assert_eq!(mon.run().unwrap(), Termination::Hlt);
        assert_eq!(console.contents(), b"still here");
    }

    #[test]
    fn duplicate_hypercall_owner_fails_setup() {
        let mods: Vec<Box<dyn Module>> =
            vec![Box::new(ConsoleModule::new()), Box::new(ConsoleModule::new())];
        let err = Monitor::new(
            guest_ram(),
            ScriptedVcpu::new(),
            RrEngine::disabled(),
            Box::new(std::io::sink()),
            mods,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            MonitorError::Module {
                source: ModuleError::Dispatch(DispatchError::AlreadyRegistered { owner: 0, .. }),
                ..
            }
        ));
    }

    #[test]
    fn breakpoint_outside_trap_table_is_fatal() {
        let mut vcpu = ScriptedVcpu::new();
        vcpu.breakpoint(ENTRY + 1);
        let (mut mon, _) = monitor(
            vcpu,
            RrEngine::disabled(),
            modules(MemDisk::new(512), Some(FakeCpu::seeded(1))),
        );
        let image = load_elf(mon.mem(), &build_elf(ENTRY, CODE)).unwrap();
        mon.start(&image).unwrap();
        assert!(matches!(
            mon.run(),
            Err(MonitorError::UnhandledBreakpoint { rip }) if rip == ENTRY + 1
        ));
    }

    // ── record / replay ─────────────────────────────────────────────

    /// Full workload: traps for all three instructions, the block
    /// scenario, a poll, and a HALT.
    fn workload() -> ScriptedVcpu {
        let mut vcpu = ScriptedVcpu::new();
        vcpu.breakpoint(RDTSC_AT)
            .breakpoint(RDRAND_AT)
            .hypercall(Hypercall::BlkWrite, REQ_A)
            .hypercall(Hypercall::BlkRead, REQ_B)
            .breakpoint(CPUID_AT)
            .hypercall(Hypercall::Puts, REQ_C)
            .hypercall(Hypercall::Poll, 0x8300)
            .hypercall(Hypercall::BlkInfo, 0x8400)
            .hypercall(Hypercall::Halt, 0x8500);
        vcpu
    }

    struct Observed {
        end: Termination,
        console: Vec<u8>,
        regs: kvm_bindings::kvm_regs,
        read_back: Vec<u8>,
        info: BlkInfo,
    }

    fn run_workload(rr: RrEngine, disk: MemDisk, cpu: FakeCpu) -> Observed {
        let (mut mon, console) = monitor(workload(), rr, modules(disk, Some(cpu)));
        let image = load_elf(mon.mem(), &build_elf(ENTRY, CODE)).unwrap();
        mon.start(&image).unwrap();
        stage_block_scenario(mon.mem());
        mon.mem().write_struct(Gpa(0x8300), &Poll { timeout_nsecs: 1_000, ret: 5 }).unwrap();
        let halt = Halt { exit_status: 3, len: 0, data: [0; HALT_DUMP_MAX] };
        mon.mem().write_struct(Gpa(0x8500), &halt).unwrap();
        mon.vcpu_mut().regs.rax = 1;

        let end = mon.run().unwrap();
        let observed = Observed {
            end,
            console: console.contents(),
            regs: mon.vcpu().regs,
            read_back: mon.mem().read_bytes(Gpa::from(OUT), 512).unwrap(),
            info: mon.mem().read_struct(Gpa(0x8400)).unwrap(),
        };
        mon.finish().unwrap();
        observed
    }

    fn rr(mode: RrMode, dir: &std::path::Path, checks: bool) -> RrEngine {
        RrEngine::open(&RrConfig { mode, dir: dir.to_path_buf(), checks }).unwrap()
    }

    #[test]
    fn replay_reproduces_recorded_run() {
        for checks in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let recorded = run_workload(
                rr(RrMode::Record, dir.path(), checks),
                MemDisk::new(4096),
                FakeCpu::seeded(11),
            );
            assert_eq!(recorded.end, Termination::Exit(3));
            assert_eq!(recorded.console, b"0123456789\n");

            // Different disk contents, a different CPU and a disk too small
            // for the request: replay must not consult any of them.
            let mut other_disk = MemDisk::new(512);
            other_disk.inject_fault(crate::devices::block::DiskFault::ReadError { offset: 0 });
            let replayed = run_workload(
                rr(RrMode::Replay, dir.path(), checks),
                other_disk,
                FakeCpu::seeded(99),
            );

            assert_eq!(replayed.end, recorded.end);
            assert_eq!(replayed.console, recorded.console);
            assert_eq!(replayed.read_back, recorded.read_back);
            assert_eq!(replayed.info, recorded.info);
            assert_eq!(replayed.info.num_sectors, 8);
            assert_eq!(replayed.regs.rip, recorded.regs.rip);
            assert_eq!(replayed.regs.rax, recorded.regs.rax);
            assert_eq!(replayed.regs.rbx, recorded.regs.rbx);
            assert_eq!(replayed.regs.rdx, recorded.regs.rdx);
        }
    }

    #[test]
    fn replay_past_end_of_log_is_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut vcpu = ScriptedVcpu::new();
            vcpu.hypercall(Hypercall::BlkInfo, REQ_A);
            let (mut mon, _) = monitor(
                vcpu,
                rr(RrMode::Record, dir.path(), false),
                modules(MemDisk::new(512), None),
            );
            assert_eq!(mon.run().unwrap(), Termination::Hlt);
            mon.finish().unwrap();
        }

        let mut vcpu = ScriptedVcpu::new();
        vcpu.hypercall(Hypercall::BlkInfo, REQ_A)
            .hypercall(Hypercall::BlkInfo, REQ_A);
        let (mut mon, _) = monitor(
            vcpu,
            rr(RrMode::Replay, dir.path(), false),
            modules(MemDisk::new(512), None),
        );
        assert_eq!(mon.run().unwrap(), Termination::ReplayExhausted);
    }

    #[test]
    fn replay_in_different_call_order_diverges() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut vcpu = ScriptedVcpu::new();
            vcpu.hypercall(Hypercall::BlkInfo, REQ_A);
            let (mut mon, _) = monitor(
                vcpu,
                rr(RrMode::Record, dir.path(), false),
                modules(MemDisk::new(512), None),
            );
            mon.run().unwrap();
            mon.finish().unwrap();
        }

        let mut vcpu = ScriptedVcpu::new();
        vcpu.hypercall(Hypercall::BlkRead, REQ_B);
        let (mut mon, _) = monitor(
            vcpu,
            rr(RrMode::Replay, dir.path(), false),
            modules(MemDisk::new(512), None),
        );
        mon.mem().write_bytes(Gpa::from(OUT), &[0x77; 16]).unwrap();
        mon.mem()
            .write_struct(Gpa::from(REQ_B), &BlkRead { sector: 0, data: OUT, len: 16, ret: 4 })
            .unwrap();

        let err = mon.run().unwrap_err();
        assert!(matches!(err, MonitorError::Module { source: ModuleError::Rr(_), .. }), "{err}");
        assert_eq!(mon.mem().read_bytes(Gpa::from(OUT), 16).unwrap(), vec![0x77; 16]);
        assert_eq!(mon.mem().read_struct::<BlkRead>(Gpa::from(REQ_B)).unwrap().ret, 4);
    }

    #[test]
    fn netread_is_replayed_without_backend() {
        let dir = tempfile::tempdir().unwrap();
        let setup_mem = |mon: &Monitor<ScriptedVcpu>| {
            mon.mem()
                .write_struct(Gpa::from(REQ_A), &NetRead { data: OUT, len: 64, ret: 0 })
                .unwrap();
        };
        let script = || {
            let mut vcpu = ScriptedVcpu::new();
            vcpu.hypercall(Hypercall::NetRead, REQ_A);
            vcpu
        };

        let nic = QueueNet::new().unwrap();
        nic.inject(b"packet!".to_vec()).unwrap();
        let (mut mon, _) = monitor(
            script(),
            rr(RrMode::Record, dir.path(), true),
            vec![Box::new(NetModule::new(Box::new(nic), Some([2, 0, 0, 0, 0, 1])))],
        );
        setup_mem(&mon);
        mon.run().unwrap();
        mon.finish().unwrap();

        let (mut mon, _) = monitor(
            script(),
            rr(RrMode::Replay, dir.path(), true),
            vec![Box::new(NetModule::new(Box::new(QueueNet::new().unwrap()), None))],
        );
        setup_mem(&mon);
        assert_eq!(mon.run().unwrap(), Termination::Hlt);
        let req: NetRead = mon.mem().read_struct(Gpa::from(REQ_A)).unwrap();
        assert_eq!((req.ret, req.len), (0, 7));
        assert_eq!(mon.mem().read_bytes(Gpa::from(OUT), 7).unwrap(), b"packet!");
    }
}
