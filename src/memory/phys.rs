//! Physical memory: the RAM window and the frame allocator.
//!
//! The kernel reaches physical memory exclusively through a window described
//! by a base pointer and a length. On hardware the window is the identity
//! mapped RAM region established at boot (base 0); hosted builds back it with
//! a leaked heap arena so the same code runs under the test harness.
//!
//! Frames are handed out by a bump allocator with a small free list. Only
//! page-table frames ever return to the free list; frames that were mapped
//! into an address space are dropped on release and counted instead, because
//! reclaiming them safely needs the sharing analysis the kernel does not do
//! yet. The `reclaim_frames` capability turns real reuse on and defaults to
//! off.

use super::{page_count, PhysAddr, PAGE_SIZE};
use crate::status::{KernelError, KernelResult};
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::{Mutex, Once};

struct Window {
    base: *mut u8,
    len: usize,
}

// The window is plain memory; all mutation goes through raw pointers with
// range discipline enforced by the frame allocator.
unsafe impl Send for Window {}
unsafe impl Sync for Window {}

static WINDOW: Once<Window> = Once::new();

/// Describe the physical RAM window.
///
/// # Safety
/// `base..base + len` must be valid, writable memory that stays alive for the
/// rest of the kernel's life and is not used by anything else.
pub unsafe fn init_window(base: *mut u8, len: usize) {
    WINDOW.call_once(|| Window { base, len });
}

/// Back the physical window with a leaked, zeroed heap arena. This is how
/// hosted builds and the test harness get their "RAM".
pub fn init_hosted_window(len: usize) {
    WINDOW.call_once(|| {
        let arena = alloc::vec![0u8; len].leak();
        Window {
            base: arena.as_mut_ptr(),
            len,
        }
    });
}

fn window() -> &'static Window {
    WINDOW.get().expect("physical memory window not initialized")
}

/// Raw pointer to `len` bytes of physical memory at `paddr`.
/// Panics when the range falls outside the window; that is a kernel bug, not
/// a recoverable condition.
pub(crate) fn ptr(paddr: PhysAddr, len: usize) -> *mut u8 {
    let window = window();
    let offset = paddr.as_u32() as usize;
    assert!(
        offset.checked_add(len).is_some_and(|end| end <= window.len),
        "physical access out of window: {:?} + {:#x}",
        paddr,
        len
    );
    unsafe { window.base.add(offset) }
}

/// Borrow a physical range as a byte slice.
///
/// # Safety
/// The caller must guarantee nothing else reads or writes the range while the
/// borrow lives.
pub unsafe fn bytes(paddr: PhysAddr, len: usize) -> &'static [u8] {
    unsafe { core::slice::from_raw_parts(ptr(paddr, len), len) }
}

/// Borrow a physical range as a mutable byte slice.
///
/// # Safety
/// The caller must guarantee exclusive access to the range while the borrow
/// lives.
pub unsafe fn bytes_mut(paddr: PhysAddr, len: usize) -> &'static mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(ptr(paddr, len), len) }
}

/// Copy `src` into physical memory at `paddr`.
pub fn copy_in(paddr: PhysAddr, src: &[u8]) {
    unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), ptr(paddr, src.len()), src.len()) }
}

/// Copy physical memory at `paddr` into `dst`.
pub fn copy_out(paddr: PhysAddr, dst: &mut [u8]) {
    unsafe { core::ptr::copy_nonoverlapping(ptr(paddr, dst.len()), dst.as_mut_ptr(), dst.len()) }
}

/// Copy `len` bytes between non-overlapping physical ranges.
pub fn copy_phys(dst: PhysAddr, src: PhysAddr, len: usize) {
    unsafe { core::ptr::copy_nonoverlapping(ptr(src, len) as *const u8, ptr(dst, len), len) }
}

/// Zero `len` bytes of physical memory at `paddr`.
pub fn zero(paddr: PhysAddr, len: usize) {
    unsafe { core::ptr::write_bytes(ptr(paddr, len), 0, len) }
}

pub fn write_u32(paddr: PhysAddr, value: u32) {
    copy_in(paddr, &value.to_le_bytes());
}

pub fn read_u32(paddr: PhysAddr) -> u32 {
    let mut word = [0u8; 4];
    copy_out(paddr, &mut word);
    u32::from_le_bytes(word)
}

/// Bump allocator over a physical range, with a free list that only
/// page-table frames return to.
pub struct FrameAllocator {
    next: u32,
    end: u32,
    free_tables: Vec<PhysAddr>,
    reclaim_frames: bool,
    leaked_frames: u32,
}

impl FrameAllocator {
    /// Manage the frame range `[start, end)`. Both ends page aligned.
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        assert!(start.is_page_aligned() && end.is_page_aligned());
        assert!(start < end, "empty frame range");
        FrameAllocator {
            next: start.as_u32(),
            end: end.as_u32(),
            free_tables: Vec::new(),
            reclaim_frames: false,
            leaked_frames: 0,
        }
    }

    /// Hand out one zeroed frame, reusing a released table frame when one is
    /// available.
    pub fn allocate_frame(&mut self) -> KernelResult<PhysAddr> {
        if let Some(frame) = self.free_tables.pop() {
            zero(frame, PAGE_SIZE as usize);
            return Ok(frame);
        }
        self.allocate_frames(1)
    }

    /// Hand out `count` physically contiguous zeroed frames.
    pub fn allocate_frames(&mut self, count: u32) -> KernelResult<PhysAddr> {
        if count == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let bytes = count
            .checked_mul(PAGE_SIZE)
            .ok_or(KernelError::InvalidArgument)?;
        let start = self.next;
        let end = start.checked_add(bytes).ok_or(KernelError::OutOfMemory)?;
        if end > self.end {
            return Err(KernelError::OutOfMemory);
        }
        self.next = end;
        let frame = PhysAddr::new(start);
        zero(frame, bytes as usize);
        Ok(frame)
    }

    /// Convenience: contiguous frames covering `bytes` bytes.
    pub fn allocate_bytes(&mut self, bytes: u32) -> KernelResult<PhysAddr> {
        self.allocate_frames(page_count(bytes))
    }

    /// Release frames that were mapped into an address space.
    ///
    /// With `reclaim_frames` off (the default) the frames are dropped and
    /// counted, never reused; a frame may still be referenced through a stale
    /// mapping and the kernel has no sharing analysis to prove otherwise.
    pub fn release_frames(&mut self, start: PhysAddr, count: u32) {
        if self.reclaim_frames {
            for i in 0..count {
                self.free_tables
                    .push(PhysAddr::new(start.as_u32() + i * PAGE_SIZE));
            }
        } else {
            self.leaked_frames += count;
        }
    }

    /// Release a page-table frame. Table frames are kernel private and never
    /// user mapped, so they always return to the free list.
    pub fn release_table_frame(&mut self, frame: PhysAddr) {
        self.free_tables.push(frame);
    }

    pub fn set_reclaim_frames(&mut self, enabled: bool) {
        self.reclaim_frames = enabled;
    }

    /// Frames dropped instead of reused since boot.
    pub fn leaked_frames(&self) -> u32 {
        self.leaked_frames
    }

    /// Frames currently sitting on the free list.
    pub fn free_list_len(&self) -> usize {
        self.free_tables.len()
    }

    /// Frames the bump region can still hand out.
    pub fn remaining_frames(&self) -> u32 {
        (self.end - self.next) / PAGE_SIZE
    }
}

lazy_static! {
    static ref FRAMES: Mutex<Option<FrameAllocator>> = Mutex::new(None);
}

/// Install the global frame allocator over `[start, end)`.
pub fn init_frames(start: PhysAddr, end: PhysAddr) {
    let mut frames = FRAMES.lock();
    if frames.is_none() {
        *frames = Some(FrameAllocator::new(start, end));
    }
}

/// Run `f` with the global frame allocator. Panics before [`init_frames`].
pub fn with_frames<R>(f: impl FnOnce(&mut FrameAllocator) -> R) -> R {
    let mut frames = FRAMES.lock();
    f(frames.as_mut().expect("frame allocator not initialized"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn contiguous_allocation_is_zeroed_and_disjoint() {
        testutil::init_phys();
        let (a, b) = with_frames(|frames| {
            let a = frames.allocate_frames(2).unwrap();
            let b = frames.allocate_frame().unwrap();
            (a, b)
        });
        assert!(a.is_page_aligned());
        assert_eq!(b.as_u32() - a.as_u32(), 2 * PAGE_SIZE);
        let mut buf = [0xFFu8; 16];
        copy_out(a, &mut buf);
        assert_eq!(buf, [0u8; 16]);
        write_u32(a, 0xDEAD_BEEF);
        assert_eq!(read_u32(a), 0xDEAD_BEEF);
    }

    #[test]
    fn released_mapped_frames_leak_by_default() {
        testutil::init_phys();
        let mut local = testutil::carve_allocator(8);
        let frame = local.allocate_frame().unwrap();
        local.release_frames(frame, 1);
        assert_eq!(local.leaked_frames(), 1);
        assert_eq!(local.free_list_len(), 0);

        local.set_reclaim_frames(true);
        let frame2 = local.allocate_frame().unwrap();
        local.release_frames(frame2, 1);
        assert_eq!(local.free_list_len(), 1);
        assert_eq!(local.allocate_frame().unwrap(), frame2);
    }

    #[test]
    fn table_frames_are_recycled() {
        testutil::init_phys();
        let mut local = testutil::carve_allocator(4);
        let frame = local.allocate_frame().unwrap();
        write_u32(frame, 0x1234_5678);
        local.release_table_frame(frame);
        let again = local.allocate_frame().unwrap();
        assert_eq!(again, frame);
        // Recycled frames come back zeroed.
        assert_eq!(read_u32(again), 0);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        testutil::init_phys();
        let mut local = testutil::carve_allocator(2);
        assert!(local.allocate_frames(2).is_ok());
        assert_eq!(local.allocate_frame(), Err(KernelError::OutOfMemory));
    }
}
