//! Boundary checks and copies between user and kernel memory.
//!
//! One constant separates the kernel-reserved low range from user-accessible
//! space. Every value crossing the trap boundary is validated here before the
//! kernel trusts it, and copies resolve user virtual addresses through the
//! task's own page tables rather than dereferencing them.
//!
//! A caller handing in a range that dips below the boundary is killed with a
//! kernel halt rather than an error. That severity is inherited behavior and
//! a known hardening gap: a better kernel would terminate just the offending
//! process.

use super::paging::AddressSpace;
use super::{phys, VirtAddr, KERNEL_SPACE_END, PAGE_SIZE};
use crate::status::{KernelError, KernelResult};
use alloc::string::String;
use alloc::vec;

/// First user-accessible virtual address.
pub const USER_SPACE_START: u32 = KERNEL_SPACE_END;

/// Fail with `InvalidUserAccess` when `addr` lies in kernel space.
pub fn verify_pointer(addr: VirtAddr) -> KernelResult<()> {
    if addr.as_u32() < USER_SPACE_START {
        return Err(KernelError::InvalidUserAccess);
    }
    Ok(())
}

/// Verify the whole range `[addr, addr + len)`, including overflow wraps.
pub fn verify_range(addr: VirtAddr, len: u32) -> KernelResult<()> {
    verify_pointer(addr)?;
    match addr.as_u32().checked_add(len) {
        Some(_) => Ok(()),
        None => Err(KernelError::InvalidUserAccess),
    }
}

/// Copy `dst.len()` bytes out of user memory at `src`, walking `space` page
/// by page.
///
/// Halts the kernel when the source range violates the user boundary. A
/// verified but unmapped page reports `InvalidUserAccess` instead; on real
/// hardware that case would surface as a page fault and kill the process.
pub fn copy_from_user(space: &AddressSpace, src: VirtAddr, dst: &mut [u8]) -> KernelResult<()> {
    if verify_range(src, dst.len() as u32).is_err() {
        panic!("user memory access below the kernel boundary: {:?}", src);
    }

    let mut copied = 0usize;
    while copied < dst.len() {
        let va = VirtAddr::new(src.as_u32() + copied as u32);
        let (paddr, _) = space.translate(va).ok_or(KernelError::InvalidUserAccess)?;
        let in_page = (PAGE_SIZE - va.page_offset()) as usize;
        let chunk = in_page.min(dst.len() - copied);
        phys::copy_out(paddr, &mut dst[copied..copied + chunk]);
        copied += chunk;
    }
    Ok(())
}

/// Fetch one 4-byte little-endian word from user memory. The primitive the
/// syscall argument path is built on.
pub fn read_user_u32(space: &AddressSpace, addr: VirtAddr) -> KernelResult<u32> {
    let mut word = [0u8; 4];
    copy_from_user(space, addr, &mut word)?;
    Ok(u32::from_le_bytes(word))
}

/// Read a NUL-terminated string of at most `max_len` bytes from user memory.
/// A missing terminator within the bound is an `InvalidArgument`.
pub fn copy_str_from_user(
    space: &AddressSpace,
    addr: VirtAddr,
    max_len: usize,
) -> KernelResult<String> {
    let mut buf = vec![0u8; max_len];
    let mut len = 0usize;
    // Read page-sized chunks so a short string near the end of a mapping does
    // not fault on pages past its terminator.
    while len < max_len {
        let va = VirtAddr::new(addr.as_u32() + len as u32);
        let in_page = (PAGE_SIZE - va.page_offset()) as usize;
        let chunk = in_page.min(max_len - len);
        copy_from_user(space, va, &mut buf[len..len + chunk])?;
        if let Some(nul) = buf[len..len + chunk].iter().position(|&b| b == 0) {
            buf.truncate(len + nul);
            return String::from_utf8(buf).map_err(|_| KernelError::InvalidArgument);
        }
        len += chunk;
    }
    Err(KernelError::InvalidArgument)
}
