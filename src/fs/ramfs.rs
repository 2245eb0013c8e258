//! A small in-memory filesystem: read-only files registered at construction,
//! handles with a seek cursor. Stands in for the on-disk filesystem in hosted
//! builds and carries the loader tests.

use super::{FileHandle, FileMode, FileStat, FileStatFlags, FileSystem, SeekFrom};
use crate::status::{KernelError, KernelResult};
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

struct OpenFile {
    path: String,
    pos: u32,
}

pub struct RamFs {
    files: BTreeMap<String, Vec<u8>>,
    open: Mutex<Vec<Option<OpenFile>>>,
}

impl RamFs {
    pub fn new() -> Self {
        RamFs {
            files: BTreeMap::new(),
            open: Mutex::new(Vec::new()),
        }
    }

    /// Register a file; chainable at construction time.
    pub fn with_file(mut self, path: &str, data: &[u8]) -> Self {
        self.files.insert(String::from(path), Vec::from(data));
        self
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem for RamFs {
    fn open(&self, path: &str, mode: FileMode) -> KernelResult<FileHandle> {
        if mode != FileMode::Read {
            return Err(KernelError::NotImplemented);
        }
        if !self.files.contains_key(path) {
            return Err(KernelError::BadFilePath);
        }
        let mut open = self.open.lock();
        let entry = OpenFile {
            path: String::from(path),
            pos: 0,
        };
        for (i, slot) in open.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(FileHandle(i));
            }
        }
        open.push(Some(entry));
        Ok(FileHandle(open.len() - 1))
    }

    fn read(&self, handle: FileHandle, out: &mut [u8]) -> KernelResult<usize> {
        let mut open = self.open.lock();
        let file = open
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(KernelError::InvalidArgument)?;
        let data = self.files.get(&file.path).ok_or(KernelError::Io)?;
        let start = (file.pos as usize).min(data.len());
        let len = out.len().min(data.len() - start);
        out[..len].copy_from_slice(&data[start..start + len]);
        file.pos += len as u32;
        Ok(len)
    }

    fn seek(&self, handle: FileHandle, offset: u32, whence: SeekFrom) -> KernelResult<()> {
        let mut open = self.open.lock();
        let file = open
            .get_mut(handle.0)
            .and_then(Option::as_mut)
            .ok_or(KernelError::InvalidArgument)?;
        let size = self.files.get(&file.path).map(|d| d.len() as u32).unwrap_or(0);
        file.pos = match whence {
            SeekFrom::Start => offset,
            SeekFrom::Current => file.pos.saturating_add(offset),
            SeekFrom::End => size.saturating_add(offset),
        };
        Ok(())
    }

    fn stat(&self, handle: FileHandle) -> KernelResult<FileStat> {
        let open = self.open.lock();
        let file = open
            .get(handle.0)
            .and_then(Option::as_ref)
            .ok_or(KernelError::InvalidArgument)?;
        let data = self.files.get(&file.path).ok_or(KernelError::Io)?;
        Ok(FileStat {
            size: data.len() as u32,
            flags: FileStatFlags::READ_ONLY,
        })
    }

    fn close(&self, handle: FileHandle) -> KernelResult<()> {
        let mut open = self.open.lock();
        match open.get_mut(handle.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// Convenience for tests and bring-up code.
pub fn shared(fs: RamFs) -> Arc<dyn FileSystem> {
    Arc::new(fs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_read_seek_close() {
        let fs = RamFs::new().with_file("0:/hello", b"hello world");
        let h = fs.open("0:/hello", FileMode::Read).unwrap();
        assert_eq!(fs.stat(h).unwrap().size, 11);

        let mut buf = [0u8; 5];
        assert_eq!(fs.read(h, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        fs.seek(h, 6, SeekFrom::Start).unwrap();
        assert_eq!(fs.read(h, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");

        fs.close(h).unwrap();
        assert_eq!(fs.read(h, &mut buf), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn missing_file_is_a_bad_path() {
        let fs = RamFs::new();
        assert_eq!(
            fs.open("0:/nope", FileMode::Read).err(),
            Some(KernelError::BadFilePath)
        );
    }
}
