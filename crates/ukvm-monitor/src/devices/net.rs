//! Network device: NETINFO, NETWRITE and NETREAD over a packet backend.
//!
//! The production backend is a Linux tap device opened non-blocking.
//! [`QueueNet`] keeps frames in memory queues and signals readability
//! through an eventfd, so POLL behaves the same against either.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::raw::{c_int, c_short};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use rand::RngCore;
use thiserror::Error;
use ukvm_protocol::{format_mac, Hypercall, NetInfo, NetRead, NetWrite};
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::ioctl_with_mut_ref;
use vmm_sys_util::{ioctl_ioc_nr, ioctl_iow_nr};

use crate::hypercall::{DispatchError, Outcome};
use crate::memory::Gpa;
use crate::module::{Context, Module, ModuleError, Setup};
use crate::rr::Flow;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Could not attach interface {iface}: {source}")]
    Attach {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("Interface name {0:?} is longer than {max} bytes", max = libc::IFNAMSIZ - 1)]
    NameTooLong(String),

    #[error("Requested interface {requested:?} but the kernel attached {attached:?}")]
    NameMismatch { requested: String, attached: String },

    #[error("Interface {0} exists but is not up")]
    NotUp(String),

    #[error("Malformed descriptor in {0:?}")]
    BadDescriptor(String),

    #[error("Malformed mac address: {0}")]
    BadMac(String),
}

/// A packet-oriented network backend.
pub trait NetBackend: Send {
    /// Receive one frame into `buf`.  `Ok(None)` means nothing is pending.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Transmit one frame, returning the number of bytes accepted.
    fn send(&mut self, frame: &[u8]) -> io::Result<usize>;

    /// Descriptor that becomes readable when a frame is pending.
    fn pollfd(&self) -> Option<RawFd>;
}

// ═══════════════════════════════════════════════════════════════════════
//  Tap backend
// ═══════════════════════════════════════════════════════════════════════

const TUNTAP: u32 = b'T' as u32;
ioctl_iow_nr!(TUNSETIFF, TUNTAP, 202, c_int);

/// `struct ifreq` as used by TUNSETIFF: the name and the flags member of
/// the request union, padded to the kernel's size.
#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    flags: c_short,
    _pad: [u8; 22],
}

/// A host tap interface.
pub struct Tap {
    file: File,
}

impl Tap {
    /// Attach to `iface`: either an interface name, or `@N` to adopt an
    /// already-open descriptor `N`.
    pub fn attach(iface: &str) -> Result<Self, NetError> {
        let attach_err = |source| NetError::Attach {
            iface: iface.to_string(),
            source,
        };

        if let Some(fd) = iface.strip_prefix('@') {
            let fd: RawFd = fd
                .parse()
                .map_err(|_| NetError::BadDescriptor(iface.to_string()))?;
            // SAFETY: plain fcntl on a caller-supplied descriptor.
            if unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) } == -1 {
                return Err(attach_err(io::Error::last_os_error()));
            }
            // SAFETY: the caller hands this descriptor to the monitor.
            let file = unsafe { File::from_raw_fd(fd) };
            return Ok(Self { file });
        }

        if iface.len() >= libc::IFNAMSIZ {
            return Err(NetError::NameTooLong(iface.to_string()));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")
            .map_err(attach_err)?;

        let mut ifr = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: (libc::IFF_TAP | libc::IFF_NO_PI) as c_short,
            _pad: [0; 22],
        };
        ifr.name[..iface.len()].copy_from_slice(iface.as_bytes());

        // SAFETY: `ifr` is a valid, writable ifreq for the whole call.
        let ret = unsafe { ioctl_with_mut_ref(&file, TUNSETIFF(), &mut ifr) };
        if ret < 0 {
            return Err(attach_err(io::Error::last_os_error()));
        }

        // Asking for "tap%d" silently creates a new device with another name.
        let attached_len = ifr.name.iter().position(|&b| b == 0).unwrap_or(ifr.name.len());
        let attached = String::from_utf8_lossy(&ifr.name[..attached_len]).into_owned();
        if attached != iface {
            return Err(NetError::NameMismatch {
                requested: iface.to_string(),
                attached,
            });
        }

        // A freshly created (not pre-configured) device rejects writes with EIO.
        let mut tap = Self { file };
        if let Err(e) = tap.file.write(&[]) {
            if e.raw_os_error() == Some(libc::EIO) {
                return Err(NetError::NotUp(iface.to_string()));
            }
        }
        Ok(tap)
    }
}

impl NetBackend for Tap {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        match self.file.read(buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.file.write(frame)
    }

    fn pollfd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  In-memory backend
// ═══════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct Queues {
    rx: VecDeque<Vec<u8>>,
    tx: Vec<Vec<u8>>,
}

struct Shared {
    queues: Mutex<Queues>,
    ready: EventFd,
}

/// In-memory NIC.  Clones share the same queues, so a test keeps one
/// handle to inject frames and inspect what the guest sent.
#[derive(Clone)]
pub struct QueueNet {
    shared: Arc<Shared>,
}

impl QueueNet {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                queues: Mutex::new(Queues::default()),
                ready: EventFd::new(libc::EFD_NONBLOCK)?,
            }),
        })
    }

    /// Queue a frame for the guest and mark the device readable.
    pub fn inject(&self, frame: Vec<u8>) -> io::Result<()> {
        self.lock().rx.push_back(frame);
        self.shared.ready.write(1)
    }

    /// Frames the guest transmitted, oldest first.
    pub fn drain_tx(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.lock().tx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Queues> {
        // A poisoned queue still holds valid frames.
        self.shared
            .queues
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl NetBackend for QueueNet {
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut queues = self.lock();
        let Some(frame) = queues.rx.pop_front() else {
            return Ok(None);
        };
        if queues.rx.is_empty() {
            match self.shared.ready.read() {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        // Like a tap without packet info, an oversized frame is truncated.
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(Some(n))
    }

    fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
        self.lock().tx.push(frame.to_vec());
        Ok(frame.len())
    }

    fn pollfd(&self) -> Option<RawFd> {
        Some(self.shared.ready.as_raw_fd())
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Module
// ═══════════════════════════════════════════════════════════════════════

/// Parse `xx:xx:xx:xx:xx:xx`.
pub fn parse_mac(s: &str) -> Result<[u8; 6], NetError> {
    let bad = || NetError::BadMac(s.to_string());
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(bad)?;
        if part.is_empty() || part.len() > 2 {
            return Err(bad());
        }
        *byte = u8::from_str_radix(part, 16).map_err(|_| bad())?;
    }
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok(mac)
}

/// A random locally administered unicast address.
pub fn random_mac() -> [u8; 6] {
    let mut mac = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut mac);
    mac[0] &= 0xfe;
    mac[0] |= 0x02;
    mac
}

/// Packet and byte counters for a [`NetModule`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// NETREAD calls that found nothing pending.
    pub rx_empty: u64,
    pub tx_errors: u64,
}

pub struct NetModule {
    backend: Box<dyn NetBackend>,
    mac: [u8; 6],
    stats: NetStats,
}

impl NetModule {
    /// `mac` defaults to [`random_mac`].
    pub fn new(backend: Box<dyn NetBackend>, mac: Option<[u8; 6]>) -> Self {
        let mac = mac.unwrap_or_else(random_mac);
        Self {
            backend,
            mac,
            stats: NetStats::default(),
        }
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    pub fn stats(&self) -> &NetStats {
        &self.stats
    }

    fn netinfo(&mut self, gpa: Gpa, ctx: &mut Context<'_>) -> Result<(), ModuleError> {
        let mut info: NetInfo = ctx.mem.read_struct(gpa)?;
        if ctx.rr.input(&mut info, ctx.mem, &*ctx.vcpu)? == Flow::Live {
            info.mac_str = format_mac(&self.mac);
        }
        ctx.mem.write_struct(gpa, &info)?;
        ctx.rr.output(&info, ctx.mem, &*ctx.vcpu)?;
        Ok(())
    }

    fn netwrite(&mut self, gpa: Gpa, ctx: &mut Context<'_>) -> Result<(), ModuleError> {
        let mut req: NetWrite = ctx.mem.read_struct(gpa)?;
        if ctx.rr.input(&mut req, ctx.mem, &*ctx.vcpu)? == Flow::Live {
            let range = ctx.mem.check(Gpa::from(req.data), req.len)?;
            let frame = ctx.mem.read(&range)?;
            req.ret = match self.backend.send(&frame) {
                Ok(n) if n == frame.len() => {
                    self.stats.tx_packets += 1;
                    self.stats.tx_bytes += n as u64;
                    0
                }
                Ok(n) => {
                    warn!("net: short write ({} of {} bytes)", n, frame.len());
                    self.stats.tx_errors += 1;
                    -1
                }
                Err(e) => {
                    warn!("net: write failed: {}", e);
                    self.stats.tx_errors += 1;
                    -1
                }
            };
        }
        ctx.mem.write_struct(gpa, &req)?;
        ctx.rr.output(&req, ctx.mem, &*ctx.vcpu)?;
        Ok(())
    }

    fn netread(&mut self, gpa: Gpa, ctx: &mut Context<'_>) -> Result<(), ModuleError> {
        let mut req: NetRead = ctx.mem.read_struct(gpa)?;
        if ctx.rr.input(&mut req, ctx.mem, &*ctx.vcpu)? == Flow::Live {
            let range = ctx.mem.check(Gpa::from(req.data), req.len)?;
            let mut buf = vec![0u8; range.len()];
            req.ret = match self.backend.recv(&mut buf) {
                Ok(Some(n)) => {
                    let received = ctx.mem.check(Gpa::from(req.data), n as u64)?;
                    ctx.mem.write(&received, &buf[..n])?;
                    req.len = n as u32;
                    self.stats.rx_packets += 1;
                    self.stats.rx_bytes += n as u64;
                    0
                }
                Ok(None) => {
                    self.stats.rx_empty += 1;
                    -1
                }
                Err(e) => {
                    debug!("net: read failed: {}", e);
                    -1
                }
            };
        }
        ctx.mem.write_struct(gpa, &req)?;
        ctx.rr.output(&req, ctx.mem, &*ctx.vcpu)?;
        Ok(())
    }
}

impl Module for NetModule {
    fn name(&self) -> &'static str {
        "net"
    }

    fn setup(&mut self, setup: &mut Setup<'_>) -> Result<(), ModuleError> {
        setup.register_hypercall(Hypercall::NetInfo)?;
        setup.register_hypercall(Hypercall::NetWrite)?;
        setup.register_hypercall(Hypercall::NetRead)?;
        if let Some(fd) = self.backend.pollfd() {
            setup.register_pollfd(fd, "net");
        }
        info!("net: mac {}", String::from_utf8_lossy(&format_mac(&self.mac)[..17]));
        Ok(())
    }

    fn handle_hypercall(
        &mut self,
        call: Hypercall,
        gpa: Gpa,
        ctx: &mut Context<'_>,
    ) -> Result<Outcome, ModuleError> {
        match call {
            Hypercall::NetInfo => self.netinfo(gpa, ctx)?,
            Hypercall::NetWrite => self.netwrite(gpa, ctx)?,
            Hypercall::NetRead => self.netread(gpa, ctx)?,
            other => return Err(DispatchError::InvalidHypercall { nr: other.nr() }.into()),
        }
        Ok(Outcome::Continue)
    }
}
