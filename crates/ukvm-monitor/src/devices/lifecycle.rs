//! EXEC and HALT: replacing and ending the guest.

use log::{info, warn};
use ukvm_protocol::{Exec, Halt, Hypercall, HALT_DUMP_MAX};

use crate::hypercall::{DispatchError, Outcome};
use crate::loader::load_elf;
use crate::memory::Gpa;
use crate::module::{Context, Module, ModuleError, Setup};
use crate::vcpu::boot_regs;

#[derive(Debug, Default)]
pub struct LifecycleModule {
    tsc_freq: u64,
    execs: u32,
}

impl LifecycleModule {
    /// `tsc_freq` is handed to EXEC'd images in their boot info.
    pub fn new(tsc_freq: u64) -> Self {
        Self { tsc_freq, execs: 0 }
    }

    fn exec(&mut self, gpa: Gpa, ctx: &mut Context<'_>) -> Result<Outcome, ModuleError> {
        let mut req: Exec = ctx.mem.read_struct(gpa)?;
        ctx.rr.input(&mut req, ctx.mem, &*ctx.vcpu)?;

        let range = ctx.mem.check(Gpa::from(req.elf_mem), req.elf_mem_len)?;
        let image = ctx.mem.read(&range)?;
        // Written before loading, since the new image may cover the request.
        req.ret = 0;
        ctx.mem.write_struct(gpa, &req)?;
        let loaded = match load_elf(ctx.mem, &image) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("exec: rejected image at {:#x}: {}", req.elf_mem, e);
                req.ret = -1;
                ctx.mem.write_struct(gpa, &req)?;
                ctx.rr.output(&req, ctx.mem, &*ctx.vcpu)?;
                return Ok(Outcome::Continue);
            }
        };

        ctx.mem.write_boot_info(loaded.kernel_end, self.tsc_freq)?;
        ctx.vcpu
            .set_regs(&boot_regs(loaded.entry, ctx.mem.size() as u64))?;
        self.execs += 1;
        info!("exec #{}: entering {:#x}", self.execs, loaded.entry);

        ctx.rr.output(&req, ctx.mem, &*ctx.vcpu)?;
        Ok(Outcome::Loaded(loaded))
    }

    fn halt(&mut self, gpa: Gpa, ctx: &mut Context<'_>) -> Result<Outcome, ModuleError> {
        let mut req: Halt = ctx.mem.read_struct(gpa)?;
        ctx.rr.input(&mut req, ctx.mem, &*ctx.vcpu)?;

        let dump_len = (req.len as usize).min(HALT_DUMP_MAX);
        if dump_len > 0 {
            info!("guest dump ({} bytes):", dump_len);
            for (i, line) in req.data[..dump_len].chunks(16).enumerate() {
                let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
                info!("  {:04x}: {}", i * 16, hex.join(" "));
            }
        }

        ctx.rr.output(&req, ctx.mem, &*ctx.vcpu)?;
        Ok(Outcome::Halt(req.exit_status))
    }
}

impl Module for LifecycleModule {
    fn name(&self) -> &'static str {
        "lifecycle"
    }

    fn setup(&mut self, setup: &mut Setup<'_>) -> Result<(), ModuleError> {
        setup.register_hypercall(Hypercall::Exec)?;
        setup.register_hypercall(Hypercall::Halt)?;
        Ok(())
    }

    fn handle_hypercall(
        &mut self,
        call: Hypercall,
        gpa: Gpa,
        ctx: &mut Context<'_>,
    ) -> Result<Outcome, ModuleError> {
        match call {
            Hypercall::Exec => self.exec(gpa, ctx),
            Hypercall::Halt => self.halt(gpa, ctx),
            other => Err(DispatchError::InvalidHypercall { nr: other.nr() }.into()),
        }
    }
}
