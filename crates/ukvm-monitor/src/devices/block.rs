//! Block device: BLKINFO, BLKWRITE and BLKREAD over a raw disk image.
//!
//! The device is a flat array of 512-byte sectors.  Requests that do not
//! fit the device, and I/O errors from the backing store, are reported to
//! the guest as `ret = -1`.  A guest buffer outside guest memory is an ABI
//! violation and stops the monitor.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{info, warn};
use thiserror::Error;
use ukvm_protocol::{BlkInfo, BlkRead, BlkWrite, Hypercall};

use crate::hypercall::Outcome;
use crate::memory::Gpa;
use crate::module::{Context, Module, ModuleError, Setup};
use crate::rr::Flow;
use crate::verified::block::sector_offset;

pub const SECTOR_SIZE: u64 = 512;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Failed to open disk image {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Disk image has {sectors} sectors, more than the ABI can address")]
    TooLarge { sectors: u64 },
}

/// Random-access byte storage behind the block device.
pub trait Storage: Send {
    fn size(&self) -> u64;
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()>;
    fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<()>;
}

/// A disk image file opened read-write.
pub struct FileDisk {
    file: File,
    size: u64,
}

impl FileDisk {
    pub fn open(path: &Path) -> Result<Self, BlockError> {
        let open_err = |source| BlockError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(open_err)?;
        let size = file.metadata().map_err(open_err)?.len();
        Ok(Self { file, size })
    }
}

impl Storage for FileDisk {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(data, offset)
    }
}

/// A fault queued on a [`MemDisk`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskFault {
    /// Fail the next read at `offset`.
    ReadError { offset: u64 },
    /// Fail the next write at `offset`.
    WriteError { offset: u64 },
}

/// In-memory disk with injectable I/O errors.
///
/// Faults are consumed in FIFO order by the first request whose offset
/// matches.
#[derive(Clone, Debug, Default)]
pub struct MemDisk {
    data: Vec<u8>,
    faults: VecDeque<DiskFault>,
}

impl MemDisk {
    pub fn new(size: usize) -> Self {
        Self::from_image(vec![0; size])
    }

    pub fn from_image(data: Vec<u8>) -> Self {
        Self {
            data,
            faults: VecDeque::new(),
        }
    }

    pub fn inject_fault(&mut self, fault: DiskFault) {
        self.faults.push_back(fault);
    }

    fn take_fault(&mut self, wanted: &DiskFault) -> bool {
        match self.faults.iter().position(|f| f == wanted) {
            Some(i) => {
                self.faults.remove(i);
                true
            }
            None => false,
        }
    }

    fn span(&self, offset: u64, len: usize) -> io::Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset).map_err(|_| io::ErrorKind::InvalidInput)?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(io::ErrorKind::UnexpectedEof)?;
        Ok(start..end)
    }
}

impl Storage for MemDisk {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        if self.take_fault(&DiskFault::ReadError { offset }) {
            return Err(io::Error::other("injected read error"));
        }
        let span = self.span(offset, buf.len())?;
        buf.copy_from_slice(&self.data[span]);
        Ok(())
    }

    fn write_at(&mut self, data: &[u8], offset: u64) -> io::Result<()> {
        if self.take_fault(&DiskFault::WriteError { offset }) {
            return Err(io::Error::other("injected write error"));
        }
        let span = self.span(offset, data.len())?;
        self.data[span].copy_from_slice(data);
        Ok(())
    }
}

/// Read/write statistics for a [`BlockModule`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Requests answered with `ret = -1`.
    pub rejected: u64,
}

pub struct BlockModule {
    disk: Box<dyn Storage>,
    num_sectors: u64,
    stats: BlockStats,
}

impl BlockModule {
    pub fn new(disk: Box<dyn Storage>) -> Result<Self, BlockError> {
        let num_sectors = disk.size() / SECTOR_SIZE;
        if num_sectors > u64::from(u32::MAX) {
            return Err(BlockError::TooLarge {
                sectors: num_sectors,
            });
        }
        Ok(Self {
            disk,
            num_sectors,
            stats: BlockStats::default(),
        })
    }

    pub fn open(path: &Path) -> Result<Self, BlockError> {
        let module = Self::new(Box::new(FileDisk::open(path)?))?;
        info!(
            "block: {} ({} sectors of {} bytes)",
            path.display(),
            module.num_sectors,
            SECTOR_SIZE
        );
        Ok(module)
    }

    pub fn stats(&self) -> &BlockStats {
        &self.stats
    }

    fn blkinfo(&mut self, gpa: Gpa, ctx: &mut Context<'_>) -> Result<(), ModuleError> {
        let mut info: BlkInfo = ctx.mem.read_struct(gpa)?;
        if ctx.rr.input(&mut info, ctx.mem, &*ctx.vcpu)? == Flow::Live {
            info.sector_size = SECTOR_SIZE as u32;
            info.num_sectors = self.num_sectors as u32;
            info.rw = 1;
        }
        ctx.mem.write_struct(gpa, &info)?;
        ctx.rr.output(&info, ctx.mem, &*ctx.vcpu)?;
        Ok(())
    }

    fn blkwrite(&mut self, gpa: Gpa, ctx: &mut Context<'_>) -> Result<(), ModuleError> {
        let mut req: BlkWrite = ctx.mem.read_struct(gpa)?;
        if ctx.rr.input(&mut req, ctx.mem, &*ctx.vcpu)? == Flow::Live {
            // The buffer is checked before the sector range so a bad `data`
            // is fatal whether or not the request would have been rejected.
            let range = ctx.mem.check(Gpa::from(req.data), req.len)?;
            req.ret = match sector_offset(
                u64::from(req.sector),
                u64::from(req.len),
                SECTOR_SIZE,
                self.num_sectors,
            ) {
                None => {
                    self.stats.rejected += 1;
                    -1
                }
                Some(offset) => {
                    let data = ctx.mem.read(&range)?;
                    match self.disk.write_at(&data, offset) {
                        Ok(()) => {
                            self.stats.writes += 1;
                            self.stats.bytes_written += data.len() as u64;
                            0
                        }
                        Err(e) => {
                            warn!("block: write of {} bytes at {:#x} failed: {}", data.len(), offset, e);
                            self.stats.rejected += 1;
                            -1
                        }
                    }
                }
            };
        }
        ctx.mem.write_struct(gpa, &req)?;
        ctx.rr.output(&req, ctx.mem, &*ctx.vcpu)?;
        Ok(())
    }

    fn blkread(&mut self, gpa: Gpa, ctx: &mut Context<'_>) -> Result<(), ModuleError> {
        let mut req: BlkRead = ctx.mem.read_struct(gpa)?;
        if ctx.rr.input(&mut req, ctx.mem, &*ctx.vcpu)? == Flow::Live {
            // Recording logs `[data, data + len)` even for a rejected read,
            // so the buffer must be valid in every mode.
            let range = ctx.mem.check(Gpa::from(req.data), req.len)?;
            req.ret = match sector_offset(
                u64::from(req.sector),
                u64::from(req.len),
                SECTOR_SIZE,
                self.num_sectors,
            ) {
                None => {
                    self.stats.rejected += 1;
                    -1
                }
                Some(offset) => {
                    let mut buf = vec![0u8; range.len()];
                    match self.disk.read_at(&mut buf, offset) {
                        Ok(()) => {
                            ctx.mem.write(&range, &buf)?;
                            self.stats.reads += 1;
                            self.stats.bytes_read += buf.len() as u64;
                            0
                        }
                        Err(e) => {
                            warn!("block: read of {} bytes at {:#x} failed: {}", buf.len(), offset, e);
                            self.stats.rejected += 1;
                            -1
                        }
                    }
                }
            };
        }
        ctx.mem.write_struct(gpa, &req)?;
        ctx.rr.output(&req, ctx.mem, &*ctx.vcpu)?;
        Ok(())
    }
}

impl Module for BlockModule {
    fn name(&self) -> &'static str {
        "blk"
    }

    fn setup(&mut self, setup: &mut Setup<'_>) -> Result<(), ModuleError> {
        setup.register_hypercall(Hypercall::BlkInfo)?;
        setup.register_hypercall(Hypercall::BlkWrite)?;
        setup.register_hypercall(Hypercall::BlkRead)?;
        Ok(())
    }

    fn handle_hypercall(
        &mut self,
        call: Hypercall,
        gpa: Gpa,
        ctx: &mut Context<'_>,
    ) -> Result<Outcome, ModuleError> {
        match call {
            Hypercall::BlkInfo => self.blkinfo(gpa, ctx)?,
            Hypercall::BlkWrite => self.blkwrite(gpa, ctx)?,
            Hypercall::BlkRead => self.blkread(gpa, ctx)?,
            other => {
                return Err(crate::hypercall::DispatchError::InvalidHypercall { nr: other.nr() }.into())
            }
        }
        Ok(Outcome::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::GuestRam;
    use crate::module::PollSet;
    use crate::rr::{RrConfig, RrEngine, RrMode};
    use crate::testutil::{guest_ram, ScriptedVcpu};
    use std::io::Write;

    const REQ: u64 = 0x8000;
    const BUF: u32 = 0x9000;

    struct Rig {
        mem: GuestRam,
        vcpu: ScriptedVcpu,
        rr: RrEngine,
        polls: PollSet,
        console: Vec<u8>,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                mem: guest_ram(),
                vcpu: ScriptedVcpu::new(),
                rr: RrEngine::disabled(),
                polls: PollSet::new(),
                console: Vec::new(),
            }
        }

        fn call(&mut self, blk: &mut BlockModule, call: Hypercall) -> Result<Outcome, ModuleError> {
            let mut ctx = Context {
                mem: &self.mem,
                vcpu: &mut self.vcpu,
                rr: &mut self.rr,
                polls: &self.polls,
                console: &mut self.console,
            };
            blk.handle_hypercall(call, Gpa(REQ), &mut ctx)
        }

        fn write(&mut self, blk: &mut BlockModule, sector: u32, data: &[u8]) -> i32 {
            self.mem.write_bytes(Gpa::from(BUF), data).unwrap();
            let req = BlkWrite { sector, data: BUF, len: data.len() as u32, ret: 99 };
            self.mem.write_struct(Gpa(REQ), &req).unwrap();
            self.call(blk, Hypercall::BlkWrite).unwrap();
            self.mem.read_struct::<BlkWrite>(Gpa(REQ)).unwrap().ret
        }

        fn read(&mut self, blk: &mut BlockModule, sector: u32, len: u32) -> (i32, Vec<u8>) {
            let req = BlkRead { sector, data: BUF, len, ret: 99 };
            self.mem.write_struct(Gpa(REQ), &req).unwrap();
            self.call(blk, Hypercall::BlkRead).unwrap();
            let ret = self.mem.read_struct::<BlkRead>(Gpa(REQ)).unwrap().ret;
            (ret, self.mem.read_bytes(Gpa::from(BUF), len as u64).unwrap())
        }
    }

    fn disk(sectors: usize) -> BlockModule {
        BlockModule::new(Box::new(MemDisk::new(sectors * 512))).unwrap()
    }

    #[test]
    fn blkinfo_reports_geometry() {
        let mut rig = Rig::new();
        let mut blk = disk(8);
        rig.call(&mut blk, Hypercall::BlkInfo).unwrap();
        let info: BlkInfo = rig.mem.read_struct(Gpa(REQ)).unwrap();
        assert_eq!(info, BlkInfo { sector_size: 512, num_sectors: 8, rw: 1 });
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut rig = Rig::new();
        let mut blk = disk(8);
        let payload: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(rig.write(&mut blk, 6, &payload), 0);
        rig.mem.write_bytes(Gpa::from(BUF), &[0; 1024]).unwrap();
        let (ret, back) = rig.read(&mut blk, 6, 1024);
        assert_eq!(ret, 0);
        assert_eq!(back, payload);
        assert_eq!(blk.stats().writes, 1);
        assert_eq!(blk.stats().bytes_read, 1024);
    }

    #[test]
    fn out_of_range_requests_rejected_without_io() {
        let mut rig = Rig::new();
        let mut blk = disk(8);
        assert_eq!(rig.write(&mut blk, 8, &[1; 512]), -1);
        assert_eq!(rig.write(&mut blk, 7, &[1; 513]), -1);
        assert_eq!(rig.write(&mut blk, u32::MAX, &[1; 512]), -1);

        rig.mem.write_bytes(Gpa::from(BUF), &[0x5a; 512]).unwrap();
        let (ret, buf) = rig.read(&mut blk, 9, 512);
        assert_eq!(ret, -1);
        assert_eq!(buf, vec![0x5a; 512], "guest buffer untouched");
        assert_eq!(blk.stats().writes, 0);
        assert_eq!(blk.stats().rejected, 4);
    }

    #[test]
    fn backing_errors_reported_to_guest() {
        let mut rig = Rig::new();
        let mut mem_disk = MemDisk::new(8 * 512);
        mem_disk.inject_fault(DiskFault::WriteError { offset: 1024 });
        mem_disk.inject_fault(DiskFault::ReadError { offset: 0 });
        let mut blk = BlockModule::new(Box::new(mem_disk)).unwrap();
        assert_eq!(rig.write(&mut blk, 2, &[1; 16]), -1);
        assert_eq!(rig.write(&mut blk, 2, &[1; 16]), 0, "fault consumed");
        assert_eq!(rig.read(&mut blk, 0, 16).0, -1);
    }

    #[test]
    fn guest_buffer_outside_memory_is_fatal() {
        let mut rig = Rig::new();
        let mut blk = disk(8);
        let req = BlkRead { sector: 0, data: rig.mem.size() as u32 - 100, len: 512, ret: 0 };
        rig.mem.write_struct(Gpa(REQ), &req).unwrap();
        assert!(matches!(
            rig.call(&mut blk, Hypercall::BlkRead),
            Err(ModuleError::Memory(_))
        ));
    }

    #[test]
    fn rejected_read_with_bad_buffer_is_fatal_in_every_mode() {
        let dir = tempfile::tempdir().unwrap();
        let recording = RrEngine::open(&RrConfig {
            mode: RrMode::Record,
            dir: dir.path().to_path_buf(),
            checks: false,
        })
        .unwrap();

        for rr in [RrEngine::disabled(), recording] {
            let mut rig = Rig::new();
            rig.rr = rr;
            let mut blk = disk(8);
            let req = BlkRead { sector: 99, data: rig.mem.size() as u32 - 10, len: 512, ret: 0 };
            rig.mem.write_struct(Gpa(REQ), &req).unwrap();
            assert!(matches!(
                rig.call(&mut blk, Hypercall::BlkRead),
                Err(ModuleError::Memory(_))
            ));
            assert_eq!(blk.stats().rejected, 0, "failed before the sector check");
        }
    }

    #[test]
    fn rejected_write_with_bad_buffer_is_fatal() {
        let mut rig = Rig::new();
        let mut blk = disk(8);
        let req = BlkWrite { sector: 99, data: rig.mem.size() as u32 - 10, len: 512, ret: 0 };
        rig.mem.write_struct(Gpa(REQ), &req).unwrap();
        assert!(matches!(
            rig.call(&mut blk, Hypercall::BlkWrite),
            Err(ModuleError::Memory(_))
        ));
    }

    #[test]
    fn file_disk_persists_writes() {
        let mut image = tempfile::NamedTempFile::new().unwrap();
        image.write_all(&[0u8; 4 * 512]).unwrap();
        image.flush().unwrap();

        let mut rig = Rig::new();
        let mut blk = BlockModule::open(image.path()).unwrap();
        assert_eq!(rig.write(&mut blk, 1, b"persisted"), 0);
        drop(blk);

        let on_disk = std::fs::read(image.path()).unwrap();
        assert_eq!(&on_disk[512..521], b"persisted");
    }
}
