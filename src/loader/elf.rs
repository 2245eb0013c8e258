//! ELF32 executable parsing.
//!
//! The kernel is 32-bit, so only `ELFCLASS32`, little-endian, `ET_EXEC`
//! images are accepted, and the entry point must land inside user program
//! space so stacks and code cannot overlap. Anything else is
//! `InvalidExecFormat`, which the loader treats as "try the flat binary
//! path".

use crate::memory::{phys, PhysAddr, VirtAddr, USER_PROGRAM_ENTRY};
use crate::status::{KernelError, KernelResult};
use alloc::vec::Vec;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const ELFCLASSNONE: u8 = 0;
const ELFCLASS32: u8 = 1;
const ELFDATANONE: u8 = 0;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const PT_LOAD: u32 = 1;
const PF_W: u32 = 2;

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

struct Elf32Ehdr {
    e_type: u16,
    e_entry: u32,
    e_phoff: u32,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf32Ehdr {
    fn parse(data: &[u8]) -> KernelResult<Self> {
        if data.len() < EHDR_SIZE {
            return Err(KernelError::InvalidExecFormat);
        }
        if data[0..4] != ELF_MAGIC {
            return Err(KernelError::InvalidExecFormat);
        }
        if data[EI_CLASS] != ELFCLASSNONE && data[EI_CLASS] != ELFCLASS32 {
            return Err(KernelError::InvalidExecFormat);
        }
        if data[EI_DATA] != ELFDATANONE && data[EI_DATA] != ELFDATA2LSB {
            return Err(KernelError::InvalidExecFormat);
        }
        Ok(Elf32Ehdr {
            e_type: u16::from_le_bytes([data[16], data[17]]),
            e_entry: u32::from_le_bytes(data[24..28].try_into().unwrap()),
            e_phoff: u32::from_le_bytes(data[28..32].try_into().unwrap()),
            e_phentsize: u16::from_le_bytes([data[42], data[43]]),
            e_phnum: u16::from_le_bytes([data[44], data[45]]),
        })
    }
}

struct Elf32Phdr {
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
}

impl Elf32Phdr {
    fn parse(data: &[u8]) -> KernelResult<Self> {
        if data.len() < PHDR_SIZE {
            return Err(KernelError::InvalidExecFormat);
        }
        Ok(Elf32Phdr {
            p_type: u32::from_le_bytes(data[0..4].try_into().unwrap()),
            p_offset: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            p_vaddr: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            p_filesz: u32::from_le_bytes(data[16..20].try_into().unwrap()),
            p_memsz: u32::from_le_bytes(data[20..24].try_into().unwrap()),
            p_flags: u32::from_le_bytes(data[24..28].try_into().unwrap()),
        })
    }
}

/// One loadable segment, reduced to what mapping needs.
#[derive(Debug, Clone, Copy)]
pub struct ElfSegment {
    pub vaddr: VirtAddr,
    /// Offset of the segment's bytes within the raw file image.
    pub file_offset: u32,
    pub file_size: u32,
    pub mem_size: u32,
    pub writable: bool,
}

/// A validated ELF executable, raw bytes still resident at `memory`.
#[derive(Debug)]
pub struct ElfFile {
    pub memory: PhysAddr,
    pub size: u32,
    pub entry: VirtAddr,
    pub segments: Vec<ElfSegment>,
}

impl ElfFile {
    /// Physical address of a segment's file bytes.
    pub fn segment_paddr(&self, segment: &ElfSegment) -> PhysAddr {
        PhysAddr::new(self.memory.as_u32() + segment.file_offset)
    }
}

/// Validate and index the image sitting in frames at `memory`.
pub fn parse(memory: PhysAddr, size: u32) -> KernelResult<ElfFile> {
    // Shared read of frames the caller owns exclusively.
    let data = unsafe { phys::bytes(memory, size as usize) };
    let header = Elf32Ehdr::parse(data)?;

    if header.e_type != ET_EXEC {
        return Err(KernelError::InvalidExecFormat);
    }
    // The entry must sit above the reserved stack region, otherwise the
    // program would overlap kernel space or its own stack.
    if header.e_entry < USER_PROGRAM_ENTRY {
        return Err(KernelError::InvalidExecFormat);
    }
    if header.e_phoff == 0 || header.e_phnum == 0 {
        return Err(KernelError::InvalidExecFormat);
    }

    let mut segments = Vec::new();
    for i in 0..header.e_phnum as usize {
        let off = header.e_phoff as usize + i * header.e_phentsize as usize;
        let end = off.checked_add(PHDR_SIZE).ok_or(KernelError::InvalidExecFormat)?;
        if end > data.len() {
            return Err(KernelError::InvalidExecFormat);
        }
        let phdr = Elf32Phdr::parse(&data[off..end])?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(KernelError::InvalidExecFormat);
        }
        segments.push(ElfSegment {
            vaddr: VirtAddr::new(phdr.p_vaddr),
            file_offset: phdr.p_offset,
            file_size: phdr.p_filesz,
            mem_size: phdr.p_memsz,
            writable: phdr.p_flags & PF_W != 0,
        });
    }

    Ok(ElfFile {
        memory,
        size,
        entry: VirtAddr::new(header.e_entry),
        segments,
    })
}
