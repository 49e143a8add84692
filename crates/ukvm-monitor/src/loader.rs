//! ELF64 loader for unikernel images.
//!
//! Used both for the kernel given on the command line and for images the
//! guest hands over with the EXEC hypercall, so every field of the image
//! is treated as untrusted.  Segments are placed at their physical
//! addresses, which must not reach below [`KERNEL_MIN_ADDR`] into the boot
//! structures.

use goblin::elf::header::{EM_X86_64, ET_EXEC};
use goblin::elf::program_header::{PF_X, PT_LOAD};
use goblin::elf::Elf;
use log::{debug, info};
use std::path::{Path, PathBuf};
use thiserror::Error;
use ukvm_protocol::KERNEL_MIN_ADDR;

use crate::memory::{Gpa, GuestRam, MemoryError};

const PAGE_SIZE: u64 = 0x1000;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("Failed to read image {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse ELF: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("Image is not a 64-bit ELF")]
    NotElf64,

    #[error("Image is built for machine {0}, not x86_64")]
    WrongMachine(u16),

    #[error("Image has ELF type {0}, not an executable")]
    NotExecutable(u16),

    #[error("Segment {index} at {paddr:#x} lies below {KERNEL_MIN_ADDR:#x}")]
    SegmentTooLow { index: usize, paddr: u64 },

    #[error("Segment {index} refers to bytes outside the image")]
    SegmentOutsideImage { index: usize },

    #[error("Segment {index} has file size larger than memory size")]
    SegmentSize { index: usize },

    #[error("Image has no executable segment containing the entry point {entry:#x}")]
    NoText { entry: u64 },

    #[error("Segment does not fit in guest memory: {0}")]
    Memory(#[from] MemoryError),
}

/// Where an image ended up in guest memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadedImage {
    pub entry: u64,
    /// First page-aligned address past every loaded segment.
    pub kernel_end: u64,
    /// Executable segment holding the entry point, `[text_start, text_end)`.
    pub text_start: u64,
    pub text_end: u64,
}

/// Read an image from disk and load it.
pub fn load_file(mem: &GuestRam, path: &Path) -> Result<LoadedImage, LoaderError> {
    let image = std::fs::read(path).map_err(|source| LoaderError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Loading {} ({} bytes)", path.display(), image.len());
    load_elf(mem, &image)
}

/// Validate and load an in-memory ELF image.
///
/// Nothing is written to guest memory until every segment has been
/// validated.
pub fn load_elf(mem: &GuestRam, image: &[u8]) -> Result<LoadedImage, LoaderError> {
    let elf = Elf::parse(image)?;
    if !elf.is_64 {
        return Err(LoaderError::NotElf64);
    }
    if elf.header.e_machine != EM_X86_64 {
        return Err(LoaderError::WrongMachine(elf.header.e_machine));
    }
    if elf.header.e_type != ET_EXEC {
        return Err(LoaderError::NotExecutable(elf.header.e_type));
    }

    let entry = elf.entry;
    let mut kernel_end = 0u64;
    let mut text = None;
    let mut plan = Vec::new();

    for (index, ph) in elf.program_headers.iter().enumerate() {
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.p_paddr < KERNEL_MIN_ADDR {
            return Err(LoaderError::SegmentTooLow {
                index,
                paddr: ph.p_paddr,
            });
        }
        if ph.p_filesz > ph.p_memsz {
            return Err(LoaderError::SegmentSize { index });
        }
        let file = ph
            .p_offset
            .checked_add(ph.p_filesz)
            .filter(|&end| end <= image.len() as u64)
            .map(|end| ph.p_offset as usize..end as usize)
            .ok_or(LoaderError::SegmentOutsideImage { index })?;
        let range = mem
            .check(Gpa(ph.p_paddr), ph.p_memsz)
            .map_err(MemoryError::from)?;

        let end = ph.p_paddr + ph.p_memsz;
        kernel_end = kernel_end.max(end);
        if ph.p_flags & PF_X != 0 && (ph.p_paddr..end).contains(&entry) {
            text = Some((ph.p_paddr, ph.p_paddr + ph.p_filesz));
        }
        plan.push((range, file, ph.p_filesz as usize));
    }

    let (text_start, text_end) = text.ok_or(LoaderError::NoText { entry })?;

    for (range, file, filesz) in plan {
        debug!(
            "segment {:#x}: {:#x} file bytes, {:#x} memory bytes",
            range.gpa(),
            filesz,
            range.len()
        );
        let mut bytes = vec![0u8; range.len()];
        bytes[..filesz].copy_from_slice(&image[file]);
        mem.write(&range, &bytes)?;
    }

    let loaded = LoadedImage {
        entry,
        kernel_end: kernel_end.div_ceil(PAGE_SIZE) * PAGE_SIZE,
        text_start,
        text_end,
    };
    info!(
        "Image loaded: entry={:#x} text=[{:#x}, {:#x}) end={:#x}",
        loaded.entry, loaded.text_start, loaded.text_end, loaded.kernel_end
    );
    Ok(loaded)
}
