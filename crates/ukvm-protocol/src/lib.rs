//! Hypercall ABI shared between a ukvm guest and the monitor.
//!
//! This crate defines the I/O port window, hypercall numbers, the
//! fixed-layout argument structs and the boot-info block.  It is
//! `no_std`-compatible with zero dependencies.
//!
//! # Transport
//!
//! A hypercall is a single 32-bit port write:
//!
//! 1. Guest fills an argument struct somewhere in its own memory
//! 2. Guest does `outl(PIO_BASE + nr, gpa_of_struct)`
//! 3. Host validates the GPA, decodes the struct, performs the operation
//! 4. Host writes output fields back into the same struct
//! 5. Guest resumes after the `out` instruction
//!
//! # Layouts
//!
//! Every argument struct is `#[repr(C)]` and its field offsets are part of
//! the ABI.  The [`abi_struct!`] macro generates, next to each struct, a
//! [`Field`] descriptor per field.  The monitor encodes and decodes structs
//! through those descriptors, and the record/replay engine uses the same
//! descriptors to pick which bytes to log, so there is exactly one
//! definition of each layout.

#![cfg_attr(not(feature = "std"), no_std)]

use core::ops::Range;

// ═══════════════════════════════════════════════════════════════════════
//  Ports
// ═══════════════════════════════════════════════════════════════════════

/// First I/O port of the hypercall window.  Hypercall `n` uses
/// `PIO_BASE + n`.
pub const PIO_BASE: u16 = 0x500;

/// Number of slots in the hypercall table (one past the highest number).
pub const HYPERCALL_MAX: usize = 11;

/// Width in bytes of the port write that carries a hypercall GPA.
pub const HYPERCALL_ACCESS_SIZE: usize = 4;

// ═══════════════════════════════════════════════════════════════════════
//  Guest memory layout
// ═══════════════════════════════════════════════════════════════════════

/// Guest-physical address of the GDT.
pub const GDT_BASE: u64 = 0x1000;

/// Guest-physical address of [`BootInfo`], passed to the guest in `rdi`.
pub const BOOT_INFO_BASE: u64 = 0x2000;

/// Guest-physical address of the NUL-terminated command line.
pub const CMDLINE_BASE: u64 = 0x3000;

/// Capacity of the command line area, including the terminator.
pub const CMDLINE_SIZE: usize = 0x2000;

/// Identity-mapping page tables (PML4, PDPT, then PD pages).
pub const PML4_BASE: u64 = 0x10000;
pub const PDPTE_BASE: u64 = 0x11000;
pub const PDE_BASE: u64 = 0x12000;

/// Lowest address a guest image may be loaded at.  Everything below
/// belongs to the monitor-built boot structures.
pub const KERNEL_MIN_ADDR: u64 = 0x100000;

// ═══════════════════════════════════════════════════════════════════════
//  Hypercall numbers
// ═══════════════════════════════════════════════════════════════════════

/// Hypercall numbers.  Number 0 is reserved and never dispatched.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Hypercall {
    Puts = 1,
    Poll = 2,
    BlkInfo = 3,
    BlkWrite = 4,
    BlkRead = 5,
    NetInfo = 6,
    NetWrite = 7,
    NetRead = 8,
    Exec = 9,
    Halt = 10,
}

impl Hypercall {
    pub const ALL: [Hypercall; HYPERCALL_MAX - 1] = [
        Hypercall::Puts,
        Hypercall::Poll,
        Hypercall::BlkInfo,
        Hypercall::BlkWrite,
        Hypercall::BlkRead,
        Hypercall::NetInfo,
        Hypercall::NetWrite,
        Hypercall::NetRead,
        Hypercall::Exec,
        Hypercall::Halt,
    ];

    /// Map a raw number to a hypercall.  Returns `None` for 0 and for
    /// anything at or above [`HYPERCALL_MAX`].
    pub const fn from_nr(nr: u32) -> Option<Self> {
        Some(match nr {
            1 => Hypercall::Puts,
            2 => Hypercall::Poll,
            3 => Hypercall::BlkInfo,
            4 => Hypercall::BlkWrite,
            5 => Hypercall::BlkRead,
            6 => Hypercall::NetInfo,
            7 => Hypercall::NetWrite,
            8 => Hypercall::NetRead,
            9 => Hypercall::Exec,
            10 => Hypercall::Halt,
            _ => return None,
        })
    }

    pub const fn nr(self) -> u32 {
        self as u32
    }

    /// I/O port the guest writes to issue this hypercall.
    pub const fn port(self) -> u16 {
        PIO_BASE + self as u16
    }

    pub const fn name(self) -> &'static str {
        match self {
            Hypercall::Puts => "puts",
            Hypercall::Poll => "poll",
            Hypercall::BlkInfo => "blkinfo",
            Hypercall::BlkWrite => "blkwrite",
            Hypercall::BlkRead => "blkread",
            Hypercall::NetInfo => "netinfo",
            Hypercall::NetWrite => "netwrite",
            Hypercall::NetRead => "netread",
            Hypercall::Exec => "exec",
            Hypercall::Halt => "halt",
        }
    }
}

/// Offset of `port` inside the hypercall window, or `None` if the port
/// lies outside `[PIO_BASE, PIO_BASE + HYPERCALL_MAX)`.
pub const fn port_to_nr(port: u16) -> Option<u32> {
    if port < PIO_BASE {
        return None;
    }
    let nr = (port - PIO_BASE) as usize;
    if nr >= HYPERCALL_MAX {
        return None;
    }
    Some(nr as u32)
}

// ═══════════════════════════════════════════════════════════════════════
//  Field descriptors and encoding
// ═══════════════════════════════════════════════════════════════════════

/// Location of one field inside an ABI struct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
}

impl Field {
    pub const fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }

    /// Read an unsigned integer field (4 or 8 bytes) out of an encoded
    /// struct.  Other widths read as 0.
    pub fn read_uint(&self, raw: &[u8]) -> u64 {
        match self.size {
            4 => u32::read_le(&raw[self.range()]) as u64,
            8 => u64::read_le(&raw[self.range()]),
            _ => 0,
        }
    }

    /// Store an unsigned integer into a 4- or 8-byte field.  The value is
    /// truncated to the field width.
    pub fn write_uint(&self, raw: &mut [u8], value: u64) {
        match self.size {
            4 => (value as u32).write_le(&mut raw[self.range()]),
            8 => value.write_le(&mut raw[self.range()]),
            _ => {}
        }
    }
}

/// A scalar or byte array that can live in an ABI struct.
pub trait AbiValue: Copy {
    const ZERO: Self;
    fn read_le(raw: &[u8]) -> Self;
    fn write_le(&self, raw: &mut [u8]);
}

macro_rules! int_abi_value {
    ($($ty:ty),*) => {$(
        impl AbiValue for $ty {
            const ZERO: Self = 0;

            fn read_le(raw: &[u8]) -> Self {
                let mut bytes = [0u8; core::mem::size_of::<$ty>()];
                bytes.copy_from_slice(&raw[..core::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(bytes)
            }

            fn write_le(&self, raw: &mut [u8]) {
                raw[..core::mem::size_of::<$ty>()].copy_from_slice(&self.to_le_bytes());
            }
        }
    )*};
}

int_abi_value!(u32, i32, u64);

impl<const N: usize> AbiValue for [u8; N] {
    const ZERO: Self = [0; N];

    fn read_le(raw: &[u8]) -> Self {
        let mut out = [0u8; N];
        out.copy_from_slice(&raw[..N]);
        out
    }

    fn write_le(&self, raw: &mut [u8]) {
        raw[..N].copy_from_slice(self);
    }
}

/// A fixed-layout struct exchanged through guest memory.
pub trait AbiStruct: Copy + core::fmt::Debug {
    /// Encoded size in bytes, padding included.
    const SIZE: usize;

    fn fields() -> &'static [Field];

    /// All-zero value.
    fn zeroed() -> Self;

    /// Decode from the first `SIZE` bytes of `raw`.  Returns `None` when
    /// `raw` is too short.
    fn decode(raw: &[u8]) -> Option<Self>;

    /// Encode into the first `SIZE` bytes of `raw`, leaving padding bytes
    /// untouched.  Returns `false` when `raw` is too short.
    fn encode(&self, raw: &mut [u8]) -> bool;
}

/// Define a `#[repr(C)]` ABI struct together with its field descriptors.
///
/// ```
/// ukvm_protocol::abi_struct! {
///     /// Example.
///     pub struct Pair {
///         pub a: u32 => A,
///         pub b: u64 => B,
///     }
/// }
/// use ukvm_protocol::AbiStruct;
/// assert_eq!(Pair::SIZE, 16);
/// assert_eq!(Pair::B.offset, 8);
/// ```
#[macro_export]
macro_rules! abi_struct {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty => $desc:ident ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(C)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $name {
            $(
                pub const $desc: $crate::Field = $crate::Field {
                    name: stringify!($field),
                    offset: ::core::mem::offset_of!($name, $field),
                    size: ::core::mem::size_of::<$ty>(),
                };
            )*

            pub const FIELDS: &'static [$crate::Field] = &[$(Self::$desc),*];
        }

        impl $crate::AbiStruct for $name {
            const SIZE: usize = ::core::mem::size_of::<$name>();

            fn fields() -> &'static [$crate::Field] {
                Self::FIELDS
            }

            fn zeroed() -> Self {
                Self { $( $field: <$ty as $crate::AbiValue>::ZERO, )* }
            }

            fn decode(raw: &[u8]) -> Option<Self> {
                if raw.len() < <Self as $crate::AbiStruct>::SIZE {
                    return None;
                }
                Some(Self {
                    $( $field: <$ty as $crate::AbiValue>::read_le(&raw[Self::$desc.range()]), )*
                })
            }

            fn encode(&self, raw: &mut [u8]) -> bool {
                if raw.len() < <Self as $crate::AbiStruct>::SIZE {
                    return false;
                }
                $( $crate::AbiValue::write_le(&self.$field, &mut raw[Self::$desc.range()]); )*
                true
            }
        }
    };
}

// ═══════════════════════════════════════════════════════════════════════
//  Argument structs
// ═══════════════════════════════════════════════════════════════════════

/// Length of the MAC string in [`NetInfo`]: `xx:xx:xx:xx:xx:xx\0`.
pub const MAC_STR_LEN: usize = 18;

/// Maximum dump payload carried by [`Halt`].
pub const HALT_DUMP_MAX: usize = 512;

abi_struct! {
    /// `PUTS`: write `len` bytes at `data` to the console.
    pub struct Puts {
        pub data: u32 => DATA,
        pub len: u32 => LEN,
    }
}

abi_struct! {
    /// `POLL`: wait up to `timeout_nsecs` for I/O; `ret` is 1 if ready.
    pub struct Poll {
        pub timeout_nsecs: u64 => TIMEOUT_NSECS,
        pub ret: i32 => RET,
    }
}

abi_struct! {
    /// `BLKINFO`: geometry of the block device.
    pub struct BlkInfo {
        pub sector_size: u32 => SECTOR_SIZE,
        pub num_sectors: u32 => NUM_SECTORS,
        pub rw: i32 => RW,
    }
}

abi_struct! {
    /// `BLKWRITE`: write `len` bytes at `data` starting at `sector`.
    pub struct BlkWrite {
        pub sector: u32 => SECTOR,
        pub data: u32 => DATA,
        pub len: u32 => LEN,
        pub ret: i32 => RET,
    }
}

abi_struct! {
    /// `BLKREAD`: read up to `len` bytes into `data` starting at `sector`.
    /// `len` is updated with the number of bytes read.
    pub struct BlkRead {
        pub sector: u32 => SECTOR,
        pub data: u32 => DATA,
        pub len: u32 => LEN,
        pub ret: i32 => RET,
    }
}

abi_struct! {
    /// `NETINFO`: MAC address as a NUL-terminated string.
    pub struct NetInfo {
        pub mac_str: [u8; MAC_STR_LEN] => MAC_STR,
    }
}

abi_struct! {
    /// `NETWRITE`: transmit one packet.
    pub struct NetWrite {
        pub data: u32 => DATA,
        pub len: u32 => LEN,
        pub ret: i32 => RET,
    }
}

abi_struct! {
    /// `NETREAD`: receive one packet into `data`; `len` is in/out.
    pub struct NetRead {
        pub data: u32 => DATA,
        pub len: u32 => LEN,
        pub ret: i32 => RET,
    }
}

abi_struct! {
    /// `EXEC`: replace the running image with the ELF at `elf_mem`.
    /// `ret` is only written back on failure.
    pub struct Exec {
        pub elf_mem: u32 => ELF_MEM,
        pub elf_mem_len: u32 => ELF_MEM_LEN,
        pub ret: i32 => RET,
    }
}

abi_struct! {
    /// `HALT`: terminate with `exit_status`, optionally handing the monitor
    /// `len` bytes of dump data.
    pub struct Halt {
        pub exit_status: i32 => EXIT_STATUS,
        pub len: u32 => LEN,
        pub data: [u8; HALT_DUMP_MAX] => DATA,
    }
}

abi_struct! {
    /// Boot information placed at [`BOOT_INFO_BASE`].
    pub struct BootInfo {
        pub mem_size: u64 => MEM_SIZE,
        pub kernel_end: u64 => KERNEL_END,
        pub cmdline: u64 => CMDLINE,
        pub tsc_freq: u64 => TSC_FREQ,
    }
}

// Compile-time layout checks.  These sizes are what the guest is built
// against.
const _: () = assert!(core::mem::size_of::<Puts>() == 8);
const _: () = assert!(core::mem::size_of::<Poll>() == 16);
const _: () = assert!(core::mem::size_of::<BlkInfo>() == 12);
const _: () = assert!(core::mem::size_of::<BlkWrite>() == 16);
const _: () = assert!(core::mem::size_of::<BlkRead>() == 16);
const _: () = assert!(core::mem::size_of::<NetInfo>() == MAC_STR_LEN);
const _: () = assert!(core::mem::size_of::<NetWrite>() == 12);
const _: () = assert!(core::mem::size_of::<NetRead>() == 12);
const _: () = assert!(core::mem::size_of::<Exec>() == 12);
const _: () = assert!(core::mem::size_of::<Halt>() == 8 + HALT_DUMP_MAX);
const _: () = assert!(core::mem::size_of::<BootInfo>() == 32);
const _: () = assert!(CMDLINE_BASE + CMDLINE_SIZE as u64 <= PML4_BASE);

/// Format a MAC address the way [`NetInfo::mac_str`] carries it.
pub fn format_mac(mac: &[u8; 6]) -> [u8; MAC_STR_LEN] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = [0u8; MAC_STR_LEN];
    for (i, byte) in mac.iter().enumerate() {
        out[i * 3] = HEX[(byte >> 4) as usize];
        out[i * 3 + 1] = HEX[(byte & 0xf) as usize];
        if i < 5 {
            out[i * 3 + 2] = b':';
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypercall_numbers_are_dense_and_bounded() {
        for (i, call) in Hypercall::ALL.iter().enumerate() {
            assert_eq!(call.nr() as usize, i + 1);
            assert_eq!(Hypercall::from_nr(call.nr()), Some(*call));
        }
        assert_eq!(Hypercall::from_nr(0), None);
        assert_eq!(Hypercall::from_nr(HYPERCALL_MAX as u32), None);
    }

    #[test]
    fn ports_map_back_to_numbers() {
        assert_eq!(Hypercall::Puts.port(), 0x501);
        assert_eq!(port_to_nr(Hypercall::BlkRead.port()), Some(5));
        assert_eq!(port_to_nr(PIO_BASE), Some(0));
        assert_eq!(port_to_nr(PIO_BASE - 1), None);
        assert_eq!(port_to_nr(PIO_BASE + HYPERCALL_MAX as u16), None);
        assert_eq!(port_to_nr(0x3f8), None, "serial port is outside the window");
    }

    #[test]
    fn blkread_field_offsets_match_c_layout() {
        assert_eq!(BlkRead::SECTOR.offset, 0);
        assert_eq!(BlkRead::DATA.offset, 4);
        assert_eq!(BlkRead::LEN.offset, 8);
        assert_eq!(BlkRead::RET.offset, 12);
        assert_eq!(BlkRead::FIELDS.len(), 4);
    }

    #[test]
    fn poll_ret_follows_u64_timeout() {
        assert_eq!(Poll::RET.offset, 8);
        assert_eq!(Poll::SIZE, 16, "trailing padding is part of the size");
    }

    #[test]
    fn decode_reads_little_endian_fields() {
        let raw = [
            0x07, 0, 0, 0, // sector
            0x00, 0x10, 0, 0, // data
            0x00, 0x02, 0, 0, // len
            0xff, 0xff, 0xff, 0xff, // ret
        ];
        let req = BlkWrite::decode(&raw).unwrap();
        assert_eq!(req.sector, 7);
        assert_eq!(req.data, 0x1000);
        assert_eq!(req.len, 512);
        assert_eq!(req.ret, -1);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        assert!(BlkInfo::decode(&[0u8; 11]).is_none());
        assert!(!BlkInfo::zeroed().encode(&mut [0u8; 4]));
    }

    #[test]
    fn encode_leaves_padding_alone() {
        let mut raw = [0xAAu8; 16];
        let poll = Poll { timeout_nsecs: 5, ret: 1 };
        assert!(poll.encode(&mut raw));
        assert_eq!(&raw[..8], &5u64.to_le_bytes());
        assert_eq!(&raw[8..12], &1i32.to_le_bytes());
        assert_eq!(&raw[12..], &[0xAA; 4]);
    }

    #[test]
    fn field_uint_accessors() {
        let mut raw = [0u8; 16];
        BlkRead::LEN.write_uint(&mut raw, 0x1_0000_0200);
        assert_eq!(BlkRead::LEN.read_uint(&raw), 0x200, "truncated to u32");
        Poll::TIMEOUT_NSECS.write_uint(&mut raw, u64::MAX);
        assert_eq!(Poll::TIMEOUT_NSECS.read_uint(&raw), u64::MAX);
    }

    #[test]
    fn halt_zeroed_has_empty_dump() {
        let halt = Halt::zeroed();
        assert_eq!(halt.len, 0);
        assert!(halt.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn mac_string_format() {
        let s = format_mac(&[0x02, 0xab, 0x00, 0x10, 0xff, 0x9c]);
        assert_eq!(&s[..17], b"02:ab:00:10:ff:9c");
        assert_eq!(s[17], 0);
    }

    #[test]
    fn boot_structures_below_kernel() {
        assert!(BOOT_INFO_BASE + BootInfo::SIZE as u64 <= CMDLINE_BASE);
        assert!(PDE_BASE < KERNEL_MIN_ADDR);
    }
}
