//! Guest memory for the ukvm monitor.
//!
//! [`GuestRam`] owns the single flat `mmap` region that backs guest
//! physical memory, and it is the only way the monitor touches it.  Every
//! access goes through [`GuestRam::check`], which turns a guest-supplied
//! `(gpa, len)` pair into a [`GuestRange`] or refuses it.  Hypercall
//! handlers never compute host addresses themselves.
//!
//! # Guest Physical Memory Layout
//!
//! ```text
//! 0x0000_0000  ┌───────────────────────────┐
//!              │  unused                    │
//! 0x0000_1000  ├───────────────────────────┤
//!              │  GDT (4 × 8-byte entries)  │
//! 0x0000_2000  ├───────────────────────────┤
//!              │  Boot info                 │  ← rdi at entry
//! 0x0000_3000  ├───────────────────────────┤
//!              │  Command line (8 KB)       │
//! 0x0001_0000  ├───────────────────────────┤
//!              │  PML4, PDPT, PD pages      │  → identity map of all RAM
//! 0x0010_0000  ├───────────────────────────┤
//!              │  Unikernel image           │
//!              │  heap / stack              │
//!              │  ...                       │  ← rsp = mem_size - 8
//!              └───────────────────────────┘
//! ```

use kvm_bindings::kvm_segment;
use log::info;
use thiserror::Error;
use ukvm_protocol::{
    AbiStruct, BootInfo, BOOT_INFO_BASE, CMDLINE_BASE, CMDLINE_SIZE, GDT_BASE, KERNEL_MIN_ADDR,
    PDE_BASE, PDPTE_BASE, PML4_BASE,
};
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use crate::verified;

// ═══════════════════════════════════════════════════════════════════════
//  Layout constants
// ═══════════════════════════════════════════════════════════════════════

/// Smallest guest that can hold the boot structures plus an image.
pub const MIN_MEMORY_SIZE: usize = 0x20_0000;

/// Bytes mapped by one page-directory page (512 × 2 MB).
const PD_PAGE_SPAN: u64 = 1 << 30;

/// Page-table entry flags: present + writable.
const PTE_PRESENT_WRITABLE: u64 = 0x03;

/// Page-directory entry flags: present + writable + page-size (2 MB).
const PDE_PRESENT_WRITABLE_PS: u64 = 0x83;

/// Chunk size used when walking all of guest memory.
const SCAN_CHUNK: usize = 1 << 20;

// ═══════════════════════════════════════════════════════════════════════
//  Error types
// ═══════════════════════════════════════════════════════════════════════

/// A guest-supplied range failed validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpaError {
    #[error("guest range {gpa:#x}+{len:#x} overflows")]
    Overflow { gpa: u64, len: u64 },

    #[error("guest range {gpa:#x}+{len:#x} exceeds guest memory of {mem_size:#x} bytes")]
    OutOfBounds { gpa: u64, len: u64, mem_size: u64 },

    #[error("transfer of {len:#x} bytes exceeds the maximum transfer size")]
    TooLarge { len: u64 },
}

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to create guest memory region of {size} bytes")]
    Create { size: usize },

    #[error("Guest memory of {size} bytes is below the {MIN_MEMORY_SIZE} byte minimum")]
    TooSmall { size: usize },

    #[error("Invalid guest address: {0}")]
    Gpa(#[from] GpaError),

    #[error("Failed to access guest memory at {gpa:#x}")]
    Access { gpa: u64 },

    #[error("Command line too long: {len} bytes exceeds maximum of {CMDLINE_SIZE}")]
    CmdlineTooLong { len: usize },

    #[error("Guest memory of {size} bytes needs more page-directory pages than fit below the image")]
    TooLargeToMap { size: usize },

    #[error("Failed to resolve host virtual address for guest memory")]
    HostAddress,
}

// ═══════════════════════════════════════════════════════════════════════
//  GPA and validated ranges
// ═══════════════════════════════════════════════════════════════════════

/// A guest-physical address as handed over by the guest.  Carries no
/// guarantee at all until it is checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Gpa(pub u64);

impl From<u32> for Gpa {
    fn from(raw: u32) -> Self {
        Gpa(raw as u64)
    }
}

impl std::fmt::LowerHex for Gpa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A range of guest memory that passed [`GuestRam::check`].  Only
/// `GuestRam` can construct one, and it is only valid for the `GuestRam`
/// that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestRange {
    gpa: u64,
    len: usize,
}

impl GuestRange {
    pub fn gpa(&self) -> u64 {
        self.gpa
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  GuestRam
// ═══════════════════════════════════════════════════════════════════════

/// Flat guest physical memory starting at GPA 0.
///
/// The `mmap`-backed region has interior mutability, so writers take
/// `&self` just like `vm-memory`'s own API.
pub struct GuestRam {
    memory: GuestMemoryMmap,
    size: usize,
}

impl GuestRam {
    /// Allocate `size` bytes of zeroed guest memory.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size < MIN_MEMORY_SIZE {
            return Err(MemoryError::TooSmall { size });
        }
        let regions = vec![(GuestAddress(0), size)];
        let memory =
            GuestMemoryMmap::from_ranges(&regions).map_err(|_| MemoryError::Create { size })?;

        info!(
            "Guest memory created: {} MB ({} bytes)",
            size / (1024 * 1024),
            size,
        );

        Ok(Self { memory, size })
    }

    /// Validate a guest-supplied range.  This is the single gate between
    /// guest-controlled integers and host memory.
    pub fn check(&self, gpa: impl Into<Gpa>, len: impl Into<u64>) -> Result<GuestRange, GpaError> {
        let gpa = gpa.into().0;
        let len = len.into();
        verified::gpa::check_range(self.size as u64, gpa, len)?;
        Ok(GuestRange {
            gpa,
            len: len as usize,
        })
    }

    /// Copy a validated range out of guest memory.
    pub fn read(&self, range: &GuestRange) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; range.len];
        self.read_into(range, &mut buf)?;
        Ok(buf)
    }

    /// Copy a validated range into `buf`, which must be exactly as long.
    pub fn read_into(&self, range: &GuestRange, buf: &mut [u8]) -> Result<(), MemoryError> {
        if buf.len() != range.len {
            return Err(MemoryError::Access { gpa: range.gpa });
        }
        if buf.is_empty() {
            return Ok(());
        }
        self.memory
            .read_slice(buf, GuestAddress(range.gpa))
            .map_err(|_| MemoryError::Access { gpa: range.gpa })
    }

    /// Overwrite a validated range.  `data` must be no longer than the range.
    pub fn write(&self, range: &GuestRange, data: &[u8]) -> Result<(), MemoryError> {
        if data.len() > range.len {
            return Err(MemoryError::Access { gpa: range.gpa });
        }
        if data.is_empty() {
            return Ok(());
        }
        self.memory
            .write_slice(data, GuestAddress(range.gpa))
            .map_err(|_| MemoryError::Access { gpa: range.gpa })
    }

    /// Check and read in one step.
    pub fn read_bytes(&self, gpa: impl Into<Gpa>, len: u64) -> Result<Vec<u8>, MemoryError> {
        let range = self.check(gpa, len)?;
        self.read(&range)
    }

    /// Check and write in one step.
    pub fn write_bytes(&self, gpa: impl Into<Gpa>, data: &[u8]) -> Result<(), MemoryError> {
        let range = self.check(gpa, data.len() as u64)?;
        self.write(&range, data)
    }

    /// Decode an ABI struct living at `gpa`.
    pub fn read_struct<T: AbiStruct>(&self, gpa: impl Into<Gpa>) -> Result<T, MemoryError> {
        let gpa = gpa.into();
        let raw = self.read_bytes(gpa, T::SIZE as u64)?;
        T::decode(&raw).ok_or(MemoryError::Access { gpa: gpa.0 })
    }

    /// Encode an ABI struct back to `gpa`.  Padding bytes keep whatever the
    /// guest had there.
    pub fn write_struct<T: AbiStruct>(&self, gpa: impl Into<Gpa>, value: &T) -> Result<(), MemoryError> {
        let gpa = gpa.into();
        let range = self.check(gpa, T::SIZE as u64)?;
        let mut raw = self.read(&range)?;
        if !value.encode(&mut raw) {
            return Err(MemoryError::Access { gpa: gpa.0 });
        }
        self.write(&range, &raw)
    }

    /// CRC-32 over all of guest memory.
    pub fn crc32(&self) -> Result<u32, MemoryError> {
        let mut crc = 0u32;
        let mut chunk = vec![0u8; SCAN_CHUNK.min(self.size)];
        let mut gpa = 0usize;
        while gpa < self.size {
            let n = (self.size - gpa).min(chunk.len());
            self.memory
                .read_slice(&mut chunk[..n], GuestAddress(gpa as u64))
                .map_err(|_| MemoryError::Access { gpa: gpa as u64 })?;
            crc = ukvm_rr::crc32_update(crc, &chunk[..n]);
            gpa += n;
        }
        Ok(crc)
    }

    // ─── Boot structures ─────────────────────────────────────────────

    /// Identity-map all of guest memory with 2 MB pages.
    ///
    /// ```text
    /// PML4[0]    → PDPT   (at 0x10000)
    /// PDPT[i]    → PD i   (at 0x11000 + ...)
    /// PD i[0..511] → 2 MB pages covering [i GB, (i+1) GB)
    /// ```
    pub fn setup_page_tables(&self) -> Result<(), MemoryError> {
        let pd_pages = (self.size as u64).div_ceil(PD_PAGE_SPAN);
        if pd_pages > 512 || PDE_BASE + pd_pages * 0x1000 > KERNEL_MIN_ADDR {
            return Err(MemoryError::TooLargeToMap { size: self.size });
        }

        self.write_u64(PML4_BASE, PDPTE_BASE | PTE_PRESENT_WRITABLE)?;
        for i in 0..pd_pages {
            let pd = PDE_BASE + i * 0x1000;
            self.write_u64(PDPTE_BASE + i * 8, pd | PTE_PRESENT_WRITABLE)?;
            for j in 0..512u64 {
                let page = (i * 512 + j) << 21;
                self.write_u64(pd + j * 8, page | PDE_PRESENT_WRITABLE_PS)?;
            }
        }

        info!(
            "Page tables written: PML4={:#x}, {} PD page(s) ({} GB identity map)",
            PML4_BASE, pd_pages, pd_pages,
        );
        Ok(())
    }

    /// Write the boot GDT at [`GDT_BASE`]: a null entry, then every
    /// [`BootSegment`] at its selector.
    pub fn setup_gdt(&self) -> Result<(), MemoryError> {
        self.write_u64(GDT_BASE, 0)?;
        for seg in BootSegment::ALL {
            self.write_u64(GDT_BASE + u64::from(seg.selector()), seg.descriptor())?;
        }
        Ok(())
    }

    /// Write the NUL-terminated guest command line at [`CMDLINE_BASE`].
    pub fn write_cmdline(&self, cmdline: &str) -> Result<(), MemoryError> {
        let len = cmdline.len() + 1;
        if len > CMDLINE_SIZE {
            return Err(MemoryError::CmdlineTooLong { len });
        }
        let mut bytes = Vec::with_capacity(len);
        bytes.extend_from_slice(cmdline.as_bytes());
        bytes.push(0);
        self.write_bytes(Gpa(CMDLINE_BASE), &bytes)
    }

    /// Write the boot-info block the guest receives in `rdi`.
    pub fn write_boot_info(&self, kernel_end: u64, tsc_freq: u64) -> Result<(), MemoryError> {
        let info = BootInfo {
            mem_size: self.size as u64,
            kernel_end,
            cmdline: CMDLINE_BASE,
            tsc_freq,
        };
        self.write_struct(Gpa(BOOT_INFO_BASE), &info)
    }

    fn write_u64(&self, gpa: u64, value: u64) -> Result<(), MemoryError> {
        self.write_bytes(Gpa(gpa), &value.to_le_bytes())
    }

    /// The underlying `vm-memory` object.
    #[inline]
    pub fn inner(&self) -> &GuestMemoryMmap {
        &self.memory
    }

    /// Host virtual address of GPA 0, for KVM memory-slot setup.
    pub fn host_address(&self) -> Result<u64, MemoryError> {
        self.memory
            .get_host_address(GuestAddress(0))
            .map(|p| p as u64)
            .map_err(|_| MemoryError::HostAddress)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

// ─── Boot segments ───────────────────────────────────────────────────

/// The flat ring-0 segments a guest boots with, in GDT order after the
/// null entry.  Base 0, limit 0xfffff in 4 KiB pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootSegment {
    Code,
    Data,
    Tss,
}

impl BootSegment {
    pub const ALL: [BootSegment; 3] = [BootSegment::Code, BootSegment::Data, BootSegment::Tss];

    /// GDT slots, null entry included.
    pub const GDT_SLOTS: usize = 1 + Self::ALL.len();

    const LIMIT: u32 = 0xf_ffff;

    pub fn selector(self) -> u16 {
        (self as u16 + 1) * 8
    }

    /// P, DPL, S and type.
    fn access(self) -> u8 {
        match self {
            BootSegment::Code => 0x9b, // execute/read, accessed
            BootSegment::Data => 0x93, // read/write, accessed
            BootSegment::Tss => 0x8b,  // busy 64-bit TSS
        }
    }

    /// G, D/B, L, AVL from high bit to low.
    fn granularity(self) -> u8 {
        match self {
            BootSegment::Code => 0b1010,
            BootSegment::Data => 0b1100,
            BootSegment::Tss => 0b1000,
        }
    }

    /// The 8-byte descriptor as stored in the GDT.
    pub fn descriptor(self) -> u64 {
        let limit = u64::from(Self::LIMIT);
        (limit & 0xffff)
            | (u64::from(self.access()) << 40)
            | ((limit >> 16) << 48)
            | (u64::from(self.granularity()) << 52)
    }

    /// The same segment as KVM wants it in `kvm_sregs`.
    pub fn kvm_segment(self) -> kvm_segment {
        let access = self.access();
        let flags = self.granularity();
        let g = flags >> 3;
        kvm_segment {
            base: 0,
            limit: if g == 1 { (Self::LIMIT << 12) | 0xfff } else { Self::LIMIT },
            selector: self.selector(),
            type_: access & 0xf,
            present: access >> 7,
            dpl: (access >> 5) & 3,
            db: (flags >> 2) & 1,
            s: (access >> 4) & 1,
            l: (flags >> 1) & 1,
            g,
            avl: flags & 1,
            unusable: 0,
            padding: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ukvm_protocol::BlkRead;

    const MEM: usize = 4 << 20;

    fn ram() -> GuestRam {
        GuestRam::new(MEM).unwrap()
    }

    #[test]
    fn tiny_memory_rejected() {
        assert!(matches!(GuestRam::new(4096), Err(MemoryError::TooSmall { .. })));
    }

    #[test]
    fn check_accepts_exact_end() {
        let mem = ram();
        let r = mem.check(Gpa(MEM as u64 - 16), 16u64).unwrap();
        assert_eq!(r.gpa(), MEM as u64 - 16);
        assert_eq!(r.len(), 16);
    }

    #[test]
    fn check_rejects_past_end_and_overflow() {
        let mem = ram();
        assert!(mem.check(Gpa(MEM as u64 - 16), 17u64).is_err());
        assert!(mem.check(Gpa(u64::MAX), 2u64).is_err());
    }

    #[test]
    fn validated_range_sees_guest_bytes() {
        let mem = ram();
        mem.write_bytes(Gpa(0x5000), b"hello, guest").unwrap();
        let range = mem.check(Gpa(0x5000), 12u64).unwrap();
        let bytes = mem.read(&range).unwrap();
        assert_eq!(bytes.first(), Some(&b'h'));
        assert_eq!(bytes.last(), Some(&b't'));
        assert_eq!(&bytes, b"hello, guest");
    }

    #[test]
    fn rejected_write_leaves_memory_untouched() {
        let mem = ram();
        let end = MEM as u64 - 4;
        mem.write_bytes(Gpa(end), &[1, 2, 3, 4]).unwrap();
        assert!(mem.write_bytes(Gpa(end), &[9; 8]).is_err());
        assert_eq!(mem.read_bytes(Gpa(end), 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn struct_roundtrip_through_guest_memory() {
        let mem = ram();
        let req = BlkRead { sector: 3, data: 0x8000, len: 512, ret: -1 };
        mem.write_struct(Gpa(0x4000), &req).unwrap();
        let back: BlkRead = mem.read_struct(Gpa(0x4000)).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn struct_at_end_of_memory_rejected() {
        let mem = ram();
        let r: Result<BlkRead, _> = mem.read_struct(Gpa(MEM as u64 - 8));
        assert!(matches!(r, Err(MemoryError::Gpa(GpaError::OutOfBounds { .. }))));
    }

    #[test]
    fn crc_changes_with_memory() {
        let mem = ram();
        let before = mem.crc32().unwrap();
        mem.write_bytes(Gpa(0x20_0000), &[0xff]).unwrap();
        assert_ne!(mem.crc32().unwrap(), before);
    }

    #[test]
    fn crc_matches_one_shot_crc() {
        let mem = ram();
        mem.write_bytes(Gpa(0x1234), b"abc").unwrap();
        let all = mem.read_bytes(Gpa(0), MEM as u64).unwrap();
        assert_eq!(mem.crc32().unwrap(), ukvm_rr::crc32(&all));
    }

    #[test]
    fn page_tables_identity_map() {
        let mem = ram();
        mem.setup_page_tables().unwrap();
        let pml4 = u64::from_le_bytes(mem.read_bytes(Gpa(PML4_BASE), 8).unwrap().try_into().unwrap());
        assert_eq!(pml4, PDPTE_BASE | 0x03);
        let pde1 = u64::from_le_bytes(mem.read_bytes(Gpa(PDE_BASE + 8), 8).unwrap().try_into().unwrap());
        assert_eq!(pde1, (1 << 21) | 0x83);
    }

    #[test]
    fn cmdline_is_nul_terminated() {
        let mem = ram();
        mem.write_cmdline("verbose=1").unwrap();
        assert_eq!(mem.read_bytes(Gpa(CMDLINE_BASE), 10).unwrap(), b"verbose=1\0");
        assert!(mem.write_cmdline(&"x".repeat(CMDLINE_SIZE)).is_err());
    }

    #[test]
    fn boot_info_layout() {
        let mem = ram();
        mem.write_boot_info(0x20_0000, 2_400_000_000).unwrap();
        let info: BootInfo = mem.read_struct(Gpa(BOOT_INFO_BASE)).unwrap();
        assert_eq!(info.mem_size, MEM as u64);
        assert_eq!(info.kernel_end, 0x20_0000);
        assert_eq!(info.cmdline, CMDLINE_BASE);
        assert_eq!(info.tsc_freq, 2_400_000_000);
    }

    #[test]
    fn gdt_segments() {
        let cs = BootSegment::Code.kvm_segment();
        assert_eq!(cs.selector, 0x08);
        assert_eq!(cs.l, 1);
        assert_eq!(cs.present, 1);
        assert_eq!(cs.limit, 0xffff_ffff);
        let ds = BootSegment::Data.kvm_segment();
        assert_eq!(ds.selector, 0x10);
        assert_eq!(ds.l, 0);
        assert_eq!(ds.db, 1);
        let tr = BootSegment::Tss.kvm_segment();
        assert_eq!(tr.s, 0, "TSS is a system segment");
        assert_eq!(tr.type_, 0xb);
    }

    #[test]
    fn gdt_in_guest_memory() {
        let mem = ram();
        mem.setup_gdt().unwrap();
        let gdt = mem
            .read_bytes(Gpa(GDT_BASE), (BootSegment::GDT_SLOTS * 8) as u64)
            .unwrap();
        let entries: Vec<u64> = gdt
            .chunks(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(
            entries,
            vec![0, 0x00af_9b00_0000_ffff, 0x00cf_9300_0000_ffff, 0x008f_8b00_0000_ffff]
        );
    }
}
