//! Monitor modules and the state they are handed.
//!
//! Every piece of guest-visible functionality (console, block, network,
//! instruction traps) is a [`Module`].  At startup each module runs
//! [`Module::setup`], claiming hypercall numbers, registering file
//! descriptors for the POLL hypercall and optionally asking to see every
//! VM exit first.  After that the registries are frozen and the exit loop
//! calls back into modules with a [`Context`] borrowing the monitor's
//! state for the duration of one exit.

use std::io::{self, Write};
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::{debug, trace};
use thiserror::Error;
use ukvm_protocol::Hypercall;

use crate::hypercall::{DispatchError, HypercallTable, ModuleId, Outcome};
use crate::loader::{LoadedImage, LoaderError};
use crate::memory::{Gpa, GpaError, GuestRam, MemoryError};
use crate::rr::{RrEngine, RrError};
use crate::trap::TrapError;
use crate::vcpu::{Vcpu, VcpuError, VmExit};

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Rr(#[from] RrError),

    #[error(transparent)]
    Vcpu(#[from] VcpuError),

    #[error(transparent)]
    Trap(#[from] TrapError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error("console write failed: {0}")]
    Console(#[source] io::Error),

    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),

    #[error("{module}: {message}")]
    Setup {
        module: &'static str,
        message: String,
    },
}

impl From<GpaError> for ModuleError {
    fn from(e: GpaError) -> Self {
        ModuleError::Memory(MemoryError::Gpa(e))
    }
}

impl ModuleError {
    /// True when the error only means the replay log ran out.
    pub fn is_replay_exhausted(&self) -> bool {
        matches!(self, ModuleError::Rr(e) if e.is_exhausted())
    }
}

/// A unit of monitor functionality.
pub trait Module {
    fn name(&self) -> &'static str;

    /// Claim hypercalls, poll descriptors and exit hooks.  Runs once,
    /// before the guest starts.
    fn setup(&mut self, setup: &mut Setup<'_>) -> Result<(), ModuleError>;

    /// Handle a hypercall this module registered for.  `gpa` is the
    /// guest-supplied argument pointer, not yet validated.
    fn handle_hypercall(
        &mut self,
        call: Hypercall,
        gpa: Gpa,
        ctx: &mut Context<'_>,
    ) -> Result<Outcome, ModuleError> {
        let _ = (gpa, ctx);
        Err(DispatchError::InvalidHypercall { nr: call.nr() }.into())
    }

    /// Offered every exit before the default handling when the module
    /// registered as an exit handler.  Return `true` if consumed.
    fn handle_vmexit(&mut self, exit: &VmExit, ctx: &mut Context<'_>) -> Result<bool, ModuleError> {
        let _ = (exit, ctx);
        Ok(false)
    }

    /// A new image was placed in guest memory (boot or EXEC).
    fn image_loaded(
        &mut self,
        image: &LoadedImage,
        ctx: &mut Context<'_>,
    ) -> Result<(), ModuleError> {
        let _ = (image, ctx);
        Ok(())
    }
}

/// Registration handle passed to [`Module::setup`].
pub struct Setup<'a> {
    pub(crate) id: ModuleId,
    pub(crate) table: &'a mut HypercallTable,
    pub(crate) polls: &'a mut PollSet,
    pub(crate) wants_vmexits: bool,
}

impl Setup<'_> {
    pub fn register_hypercall(&mut self, call: Hypercall) -> Result<(), DispatchError> {
        self.table.register(call, self.id)
    }

    pub fn register_pollfd(&mut self, fd: RawFd, name: &'static str) -> DeviceIndex {
        self.polls.register(fd, name)
    }

    pub fn register_vmexit_handler(&mut self) {
        self.wants_vmexits = true;
    }
}

/// Monitor state lent to a module for one exit.
pub struct Context<'a> {
    pub mem: &'a GuestRam,
    pub vcpu: &'a mut dyn Vcpu,
    pub rr: &'a mut RrEngine,
    pub polls: &'a PollSet,
    pub console: &'a mut dyn Write,
}

// ═══════════════════════════════════════════════════════════════════════
//  Poll set
// ═══════════════════════════════════════════════════════════════════════

/// Stable index of a descriptor in the [`PollSet`], in registration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceIndex(pub usize);

/// Descriptors the POLL hypercall waits on.
#[derive(Debug, Default)]
pub struct PollSet {
    fds: Vec<(RawFd, &'static str)>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, fd: RawFd, name: &'static str) -> DeviceIndex {
        let index = DeviceIndex(self.fds.len());
        debug!("poll device {} = {} (fd {})", index.0, name, fd);
        self.fds.push((fd, name));
        index
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Block for at most `timeout` until any descriptor is readable.
    /// Returns the readable devices; empty on timeout or signal.
    pub fn wait(&self, timeout: Duration) -> io::Result<Vec<DeviceIndex>> {
        if self.fds.is_empty() {
            std::thread::sleep(timeout);
            return Ok(Vec::new());
        }

        let mut pfds: Vec<libc::pollfd> = self
            .fds
            .iter()
            .map(|&(fd, _)| libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };

        // SAFETY: `pfds` is a live, correctly sized array for the whole call.
        let rc = unsafe {
            libc::ppoll(
                pfds.as_mut_ptr(),
                pfds.len() as libc::nfds_t,
                &ts,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let ready: Vec<DeviceIndex> = pfds
            .iter()
            .enumerate()
            .filter(|(_, p)| p.revents & libc::POLLIN != 0)
            .map(|(i, _)| DeviceIndex(i))
            .collect();
        trace!("poll: {} of {} ready", ready.len(), pfds.len());
        Ok(ready)
    }
}
