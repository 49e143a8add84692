//! PUTS and POLL.

use std::time::Duration;

use log::trace;
use ukvm_protocol::{Hypercall, Poll, Puts};

use crate::hypercall::{DispatchError, Outcome};
use crate::memory::Gpa;
use crate::module::{Context, Module, ModuleError, Setup};
use crate::rr::Flow;

/// Guest console output and the POLL wait.
#[derive(Debug, Default)]
pub struct ConsoleModule {
    bytes_written: u64,
    polls: u64,
}

impl ConsoleModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn puts(&mut self, gpa: Gpa, ctx: &mut Context<'_>) -> Result<(), ModuleError> {
        let mut req: Puts = ctx.mem.read_struct(gpa)?;
        ctx.rr.input(&mut req, ctx.mem, &*ctx.vcpu)?;

        let range = ctx.mem.check(Gpa::from(req.data), req.len)?;
        let text = ctx.mem.read(&range)?;
        ctx.console.write_all(&text).map_err(ModuleError::Console)?;
        ctx.console.flush().map_err(ModuleError::Console)?;
        self.bytes_written += text.len() as u64;

        ctx.rr.output(&req, ctx.mem, &*ctx.vcpu)?;
        Ok(())
    }

    fn poll(&mut self, gpa: Gpa, ctx: &mut Context<'_>) -> Result<(), ModuleError> {
        let mut req: Poll = ctx.mem.read_struct(gpa)?;
        if ctx.rr.input(&mut req, ctx.mem, &*ctx.vcpu)? == Flow::Live {
            let ready = ctx
                .polls
                .wait(Duration::from_nanos(req.timeout_nsecs))
                .map_err(ModuleError::Poll)?;
            trace!("poll: {:?} ready", ready);
            req.ret = i32::from(!ready.is_empty());
        }
        self.polls += 1;
        ctx.mem.write_struct(gpa, &req)?;
        ctx.rr.output(&req, ctx.mem, &*ctx.vcpu)?;
        Ok(())
    }
}

impl Module for ConsoleModule {
    fn name(&self) -> &'static str {
        "console"
    }

    fn setup(&mut self, setup: &mut Setup<'_>) -> Result<(), ModuleError> {
        setup.register_hypercall(Hypercall::Puts)?;
        setup.register_hypercall(Hypercall::Poll)?;
        Ok(())
    }

    fn handle_hypercall(
        &mut self,
        call: Hypercall,
        gpa: Gpa,
        ctx: &mut Context<'_>,
    ) -> Result<Outcome, ModuleError> {
        match call {
            Hypercall::Puts => self.puts(gpa, ctx)?,
            Hypercall::Poll => self.poll(gpa, ctx)?,
            other => return Err(DispatchError::InvalidHypercall { nr: other.nr() }.into()),
        }
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestRam;
    use crate::module::PollSet;
    use crate::rr::RrEngine;
    use crate::testutil::{guest_ram, ScriptedVcpu};
    use std::time::Instant;
    use vmm_sys_util::eventfd::EventFd;

    const REQ: u64 = 0x8000;

    fn call(
        module: &mut ConsoleModule,
        mem: &GuestRam,
        polls: &PollSet,
        console: &mut Vec<u8>,
        call: Hypercall,
    ) -> Result<Outcome, ModuleError> {
        let mut vcpu = ScriptedVcpu::new();
        let mut rr = RrEngine::disabled();
        let mut ctx = Context {
            mem,
            vcpu: &mut vcpu,
            rr: &mut rr,
            polls,
            console,
        };
        module.handle_hypercall(call, Gpa(REQ), &mut ctx)
    }

    #[test]
    fn puts_writes_exact_range() {
        let mem = guest_ram();
        let mut console = Vec::new();
        let mut module = ConsoleModule::new();
        mem.write_bytes(Gpa(0x9000), b"hello, world!").unwrap();
        mem.write_struct(Gpa(REQ), &Puts { data: 0x9000, len: 5 }).unwrap();

        call(&mut module, &mem, &PollSet::new(), &mut console, Hypercall::Puts).unwrap();
        assert_eq!(console, b"hello");
        assert_eq!(module.bytes_written(), 5);
    }

    #[test]
    fn puts_out_of_bounds_is_fatal() {
        let mem = guest_ram();
        let mut console = Vec::new();
        let req = Puts { data: mem.size() as u32 - 2, len: 5 };
        mem.write_struct(Gpa(REQ), &req).unwrap();
        let err = call(&mut ConsoleModule::new(), &mem, &PollSet::new(), &mut console, Hypercall::Puts)
            .unwrap_err();
        assert!(matches!(err, ModuleError::Memory(_)));
        assert!(console.is_empty());
    }

    #[test]
    fn poll_times_out_with_zero() {
        let mem = guest_ram();
        let quiet = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let mut polls = PollSet::new();
        polls.register(std::os::unix::io::AsRawFd::as_raw_fd(&quiet), "quiet");
        mem.write_struct(Gpa(REQ), &Poll { timeout_nsecs: 10_000_000, ret: 7 }).unwrap();

        let start = Instant::now();
        call(&mut ConsoleModule::new(), &mem, &polls, &mut Vec::new(), Hypercall::Poll).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(mem.read_struct::<Poll>(Gpa(REQ)).unwrap().ret, 0);
    }

    #[test]
    fn poll_reports_readable_device() {
        let mem = guest_ram();
        let loud = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        loud.write(1).unwrap();
        let mut polls = PollSet::new();
        polls.register(std::os::unix::io::AsRawFd::as_raw_fd(&loud), "loud");
        mem.write_struct(Gpa(REQ), &Poll { timeout_nsecs: 1_000_000_000, ret: 0 }).unwrap();

        call(&mut ConsoleModule::new(), &mem, &polls, &mut Vec::new(), Hypercall::Poll).unwrap();
        assert_eq!(mem.read_struct::<Poll>(Gpa(REQ)).unwrap().ret, 1);
    }
}
