//! Program image production.
//!
//! The loader pulls a file through the [`crate::fs::FileSystem`] boundary
//! into physically contiguous frames and decides what it got: an ELF
//! executable (parsed headers, per-segment mapping data) or a flat binary
//! that runs at the fixed default entry. Everything downstream matches on
//! [`ProgramImage`] exhaustively.

pub mod elf;

use crate::fs::{FileMode, FileSystem};
use crate::memory::phys::{self, FrameAllocator};
use crate::memory::{page_count, PhysAddr, VirtAddr, USER_PROGRAM_ENTRY};
use crate::status::{KernelError, KernelResult};
use elf::ElfFile;

/// A loaded, not yet mapped, program image.
#[derive(Debug)]
pub enum ProgramImage {
    /// Flat binary: code and data loaded contiguously at the default entry.
    Binary { code_paddr: PhysAddr, size: u32 },
    /// ELF executable with its raw file bytes still in memory.
    Elf { file: ElfFile },
}

impl ProgramImage {
    /// Where execution starts: the ELF entry point, or the fixed default for
    /// flat binaries.
    pub fn entry_point(&self) -> VirtAddr {
        match self {
            ProgramImage::Binary { .. } => VirtAddr::new(USER_PROGRAM_ENTRY),
            ProgramImage::Elf { file } => file.entry,
        }
    }

    /// The backing frame range holding the raw image bytes.
    pub fn backing(&self) -> (PhysAddr, u32) {
        match self {
            ProgramImage::Binary { code_paddr, size } => (*code_paddr, *size),
            ProgramImage::Elf { file } => (file.memory, file.size),
        }
    }
}

/// Read `path` into fresh frames and classify it. ELF is preferred; a file
/// that is not ELF-shaped falls back to the flat binary format, exactly like
/// the boot shell expects.
pub fn load_image(
    fs: &dyn FileSystem,
    frames: &mut FrameAllocator,
    path: &str,
) -> KernelResult<ProgramImage> {
    let handle = fs.open(path, FileMode::Read)?;

    let result = (|| {
        let stat = fs.stat(handle)?;
        if stat.size == 0 {
            return Err(KernelError::InvalidExecFormat);
        }

        let memory = frames.allocate_bytes(stat.size)?;
        // Exclusive access: the frames were just allocated and are not yet
        // mapped anywhere.
        let buf = unsafe { phys::bytes_mut(memory, stat.size as usize) };
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = fs.read(handle, &mut buf[filled..]).inspect_err(|_| {
                frames.release_frames(memory, page_count(stat.size));
            })?;
            if n == 0 {
                frames.release_frames(memory, page_count(stat.size));
                return Err(KernelError::Io);
            }
            filled += n;
        }

        match elf::parse(memory, stat.size) {
            Ok(file) => Ok(ProgramImage::Elf { file }),
            Err(KernelError::InvalidExecFormat) => {
                log::info!("{} is not ELF, loading as flat binary", path);
                Ok(ProgramImage::Binary {
                    code_paddr: memory,
                    size: stat.size,
                })
            }
            Err(err) => {
                frames.release_frames(memory, page_count(stat.size));
                Err(err)
            }
        }
    })();

    let _ = fs.close(handle);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::ramfs::RamFs;
    use crate::testutil;

    #[test]
    fn flat_binary_round_trips_through_frames() {
        testutil::init_phys();
        let payload = [0x90u8; 100]; // nops
        let fs = RamFs::new().with_file("0:/blank", &payload);
        let image = phys::with_frames(|frames| load_image(&fs, frames, "0:/blank")).unwrap();

        match &image {
            ProgramImage::Binary { code_paddr, size } => {
                assert_eq!(*size, 100);
                let mut out = [0u8; 100];
                phys::copy_out(*code_paddr, &mut out);
                assert_eq!(out, payload);
            }
            ProgramImage::Elf { .. } => panic!("expected a flat binary"),
        }
        assert_eq!(image.entry_point(), VirtAddr::new(USER_PROGRAM_ENTRY));
    }

    #[test]
    fn missing_file_propagates_bad_path() {
        testutil::init_phys();
        let fs = RamFs::new();
        let err = phys::with_frames(|frames| load_image(&fs, frames, "0:/nope")).unwrap_err();
        assert_eq!(err, KernelError::BadFilePath);
    }

    #[test]
    fn elf_files_are_recognized() {
        testutil::init_phys();
        let bytes = elf::tests::build_test_elf(USER_PROGRAM_ENTRY, &[(USER_PROGRAM_ENTRY, 64, 64, true)]);
        let fs = RamFs::new().with_file("0:/prog", &bytes);
        let image = phys::with_frames(|frames| load_image(&fs, frames, "0:/prog")).unwrap();
        match &image {
            ProgramImage::Elf { file } => {
                assert_eq!(file.entry, VirtAddr::new(USER_PROGRAM_ENTRY));
                assert_eq!(file.segments.len(), 1);
            }
            ProgramImage::Binary { .. } => panic!("expected ELF"),
        }
    }
}
