//! The filesystem boundary.
//!
//! The kernel core does not parse on-disk formats; it consumes a
//! [`FileSystem`] implementation installed by the platform (FAT16 over ATA on
//! real hardware, [`ramfs::RamFs`] in hosted builds and tests). The program
//! loader is the only in-crate consumer.

pub mod ramfs;

use crate::status::KernelResult;
use alloc::sync::Arc;
use bitflags::bitflags;
use lazy_static::lazy_static;
use spin::Mutex;

/// Longest accepted file path, terminator excluded.
pub const MAX_PATH_LEN: usize = 108;

/// Opaque handle to an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start,
    Current,
    End,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileStatFlags: u32 {
        const READ_ONLY = 1 << 0;
        const DIRECTORY = 1 << 1;
        const HIDDEN = 1 << 2;
        const DEVICE = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u32,
    pub flags: FileStatFlags,
}

/// What the kernel needs from a filesystem, nothing more.
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &str, mode: FileMode) -> KernelResult<FileHandle>;
    /// Read up to `out.len()` bytes at the handle's cursor; returns the byte
    /// count actually read.
    fn read(&self, handle: FileHandle, out: &mut [u8]) -> KernelResult<usize>;
    fn seek(&self, handle: FileHandle, offset: u32, whence: SeekFrom) -> KernelResult<()>;
    fn stat(&self, handle: FileHandle) -> KernelResult<FileStat>;
    fn close(&self, handle: FileHandle) -> KernelResult<()>;
}

lazy_static! {
    static ref FILESYSTEM: Mutex<Option<Arc<dyn FileSystem>>> = Mutex::new(None);
}

/// Install the platform filesystem. Replaces any previous one.
pub fn install(fs: Arc<dyn FileSystem>) {
    *FILESYSTEM.lock() = Some(fs);
}

/// The currently installed filesystem, if any.
pub fn installed() -> Option<Arc<dyn FileSystem>> {
    FILESYSTEM.lock().clone()
}
