use thiserror::Error;

/// Kernel-wide error kinds.
///
/// Every recoverable failure in the kernel is one of these. Each kind has a
/// stable numeric code; syscalls report failure as the negated code in the
/// return-value register, so user programs can test `ret < 0`.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("I/O error")]
    Io,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("out of memory")]
    OutOfMemory,
    #[error("out of process slots")]
    OutOfProcesses,
    #[error("out of virtual memory blocks")]
    OutOfVmemBlocks,
    #[error("bad file path")]
    BadFilePath,
    #[error("invalid executable format")]
    InvalidExecFormat,
    #[error("invalid user memory access")]
    InvalidUserAccess,
    #[error("process is not a zombie")]
    NotZombie,
    #[error("not implemented")]
    NotImplemented,
}

impl KernelError {
    /// Stable status code, part of the syscall ABI.
    pub const fn code(self) -> i32 {
        match self {
            KernelError::Io => 1,
            KernelError::InvalidArgument => 2,
            KernelError::OutOfMemory => 3,
            KernelError::OutOfProcesses => 4,
            KernelError::OutOfVmemBlocks => 5,
            KernelError::BadFilePath => 6,
            KernelError::InvalidExecFormat => 7,
            KernelError::InvalidUserAccess => 8,
            KernelError::NotZombie => 9,
            KernelError::NotImplemented => 10,
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Collapse a syscall result into the single machine word that lands in the
/// return-value register: the value itself on success, `-code` on failure.
pub fn status_word(res: KernelResult<u32>) -> i32 {
    match res {
        Ok(value) => value as i32,
        Err(err) => -err.code(),
    }
}
