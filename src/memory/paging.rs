//! Two-level page tables for 32-bit protected mode.
//!
//! An address space is a root directory of 1024 entries, each pointing at a
//! second-level table of 1024 entries, each mapping one 4 KiB frame. Entries
//! keep the frame address in the top 20 bits and the access flags in the low
//! 12. Table frames come from the frame allocator and are edited through the
//! physical window with volatile accesses, since the MMU walks the same
//! memory.
//!
//! Frame ownership follows the no-page-sharing rule: a mapped frame belongs
//! to exactly one leaf entry of exactly one space. Releasing a mapping hands
//! the frame back through the allocator's gated release, which by default
//! drops it instead of reusing it (see [`super::phys`]).

use super::phys::{self, FrameAllocator};
use super::{PhysAddr, VirtAddr, KERNEL_SPACE_END, PAGE_SIZE, TABLE_ENTRY_COUNT};
use crate::arch;
use crate::status::{KernelError, KernelResult};
use bit_field::BitField;
use bitflags::bitflags;
use spin::Mutex;
use volatile::Volatile;

bitflags! {
    /// Access bits in the low 12 bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
    }
}

/// Root directory entries covering kernel space; task spaces borrow these
/// from the kernel address space instead of building their own.
pub const KERNEL_TABLE_COUNT: usize = (KERNEL_SPACE_END >> 22) as usize;

/// One page-table entry, directory or leaf.
#[derive(Clone, Copy, PartialEq, Eq)]
struct Entry(u32);

impl Entry {
    const EMPTY: Entry = Entry(0);

    fn new(frame: PhysAddr, flags: PageFlags) -> Self {
        Entry(frame.as_u32() | flags.bits())
    }

    fn is_present(self) -> bool {
        self.0.get_bit(0)
    }

    fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0.get_bits(12..32) << 12)
    }

    fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0.get_bits(0..12))
    }
}

fn entry_ptr(table: PhysAddr, index: usize) -> *mut Volatile<u32> {
    debug_assert!(index < TABLE_ENTRY_COUNT);
    phys::ptr(PhysAddr::new(table.as_u32() + (index as u32) * 4), 4) as *mut Volatile<u32>
}

fn read_entry(table: PhysAddr, index: usize) -> Entry {
    Entry(unsafe { (*entry_ptr(table, index)).read() })
}

fn write_entry(table: PhysAddr, index: usize, entry: Entry) {
    unsafe { (*entry_ptr(table, index)).write(entry.0) }
}

/// The root frame currently loaded on the (single) CPU.
static ACTIVE_ROOT: Mutex<Option<PhysAddr>> = Mutex::new(None);

/// One virtual address space: a root table frame plus the count of leading
/// root entries borrowed from the kernel space. Borrowed tables are shared
/// read-only by convention and are never released with this space.
pub struct AddressSpace {
    root: PhysAddr,
    shared_prefix: usize,
}

impl AddressSpace {
    /// Wrap an existing root frame (no borrowed entries assumed).
    pub const fn from_root(root: PhysAddr) -> Self {
        AddressSpace {
            root,
            shared_prefix: 0,
        }
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Build a complete two-level identity mapping of the 32-bit space with
    /// `flags` on every entry. Used once for the kernel space.
    ///
    /// On a mid-build allocation failure every table built so far and the
    /// root are returned to the allocator; no partial space leaks out.
    pub fn new_identity(flags: PageFlags, frames: &mut FrameAllocator) -> KernelResult<Self> {
        let root = frames.allocate_frame()?;
        for dir in 0..TABLE_ENTRY_COUNT {
            let table = match frames.allocate_frame() {
                Ok(table) => table,
                Err(err) => {
                    for built in 0..dir {
                        frames.release_table_frame(read_entry(root, built).frame());
                    }
                    frames.release_table_frame(root);
                    return Err(err);
                }
            };
            for i in 0..TABLE_ENTRY_COUNT {
                let page = ((dir as u32) << 22) | ((i as u32) << 12);
                write_entry(table, i, Entry::new(PhysAddr::new(page), flags));
            }
            write_entry(
                root,
                dir,
                Entry::new(table, flags | PageFlags::PRESENT | PageFlags::WRITABLE),
            );
        }
        Ok(AddressSpace {
            root,
            shared_prefix: 0,
        })
    }

    /// Allocate only the zeroed root directory; the base of every task space.
    pub fn new_empty(frames: &mut FrameAllocator) -> KernelResult<Self> {
        Ok(AddressSpace {
            root: frames.allocate_frame()?,
            shared_prefix: 0,
        })
    }

    /// Borrow the kernel-region root entries from the kernel space so kernel
    /// code and data stay reachable while this space is active. The borrowed
    /// second-level tables are excluded from [`free`](Self::free).
    pub fn adopt_kernel_tables(&mut self, kernel_root: PhysAddr) {
        for dir in 0..KERNEL_TABLE_COUNT {
            write_entry(self.root, dir, read_entry(kernel_root, dir));
        }
        self.shared_prefix = KERNEL_TABLE_COUNT;
    }

    /// Create (or with `overwrite` replace) the mapping `vaddr -> paddr`.
    ///
    /// Both addresses must be page aligned. The covering second-level table
    /// is allocated on demand. An existing mapping is an error unless
    /// `overwrite` is set, in which case the previous frame goes through the
    /// gated release.
    pub fn map(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        flags: PageFlags,
        overwrite: bool,
        frames: &mut FrameAllocator,
    ) -> KernelResult<()> {
        if !vaddr.is_page_aligned() || !paddr.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }

        let dir = vaddr.directory_index();
        let dir_entry = read_entry(self.root, dir);
        let table = if dir_entry.is_present() {
            // Widen the directory flags; the MMU takes the AND of both
            // levels, so the directory must be at least as permissive.
            let widened = dir_entry.flags() | flags | PageFlags::PRESENT | PageFlags::WRITABLE;
            write_entry(self.root, dir, Entry::new(dir_entry.frame(), widened));
            dir_entry.frame()
        } else {
            let table = frames.allocate_frame()?;
            write_entry(
                self.root,
                dir,
                Entry::new(table, flags | PageFlags::PRESENT | PageFlags::WRITABLE),
            );
            table
        };

        let index = vaddr.table_index();
        let old = read_entry(table, index);
        if old.is_present() {
            if !overwrite {
                return Err(KernelError::InvalidArgument);
            }
            // No page sharing: replacing a mapping also releases its frame.
            // The release is gated and currently a counted no-op.
            frames.release_frames(old.frame(), 1);
        }
        write_entry(table, index, Entry::new(paddr, flags));
        Ok(())
    }

    /// Map the contiguous range `[va_start, va_end)` to physical frames
    /// starting at `pa_start`, page by page in increasing order.
    ///
    /// A failure mid-range returns the error with the already-mapped prefix
    /// left in place; callers own the cleanup.
    pub fn map_region(
        &mut self,
        va_start: VirtAddr,
        va_end: VirtAddr,
        pa_start: PhysAddr,
        flags: PageFlags,
        frames: &mut FrameAllocator,
    ) -> KernelResult<()> {
        if !va_start.is_page_aligned() || !va_end.is_page_aligned() || !pa_start.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        if va_end <= va_start {
            return Err(KernelError::InvalidArgument);
        }
        let pages = (va_end.as_u32() - va_start.as_u32()) / PAGE_SIZE;
        for i in 0..pages {
            self.map(
                VirtAddr::new(va_start.as_u32() + i * PAGE_SIZE),
                PhysAddr::new(pa_start.as_u32() + i * PAGE_SIZE),
                flags,
                true,
                frames,
            )?;
        }
        Ok(())
    }

    /// Clear every present mapping in `[va_start, va_end)`, invalidating the
    /// TLB entry for each cleared page. Absent pages are skipped, which makes
    /// repeated unmaps of the same range idempotent.
    pub fn unmap_region(
        &mut self,
        va_start: VirtAddr,
        va_end: VirtAddr,
        frames: &mut FrameAllocator,
    ) -> KernelResult<()> {
        if va_end < va_start {
            return Err(KernelError::InvalidArgument);
        }
        let mut page = va_start.align_down();
        let end = va_end.align_up();
        while page < end {
            self.unmap_page(page, frames);
            page = VirtAddr::new(page.as_u32() + PAGE_SIZE);
        }
        Ok(())
    }

    fn unmap_page(&mut self, page: VirtAddr, frames: &mut FrameAllocator) {
        let dir_entry = read_entry(self.root, page.directory_index());
        if !dir_entry.is_present() {
            return;
        }
        let table = dir_entry.frame();
        let index = page.table_index();
        let leaf = read_entry(table, index);
        if !leaf.is_present() {
            return;
        }
        frames.release_frames(leaf.frame(), 1);
        write_entry(table, index, Entry::EMPTY);
        arch::flush_tlb_page(page);
    }

    /// Software page walk: the physical address `vaddr` currently maps to,
    /// with the leaf flags, or `None` when unmapped.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let dir_entry = read_entry(self.root, vaddr.directory_index());
        if !dir_entry.is_present() {
            return None;
        }
        let leaf = read_entry(dir_entry.frame(), vaddr.table_index());
        if !leaf.is_present() {
            return None;
        }
        Some((
            PhysAddr::new(leaf.frame().as_u32() + vaddr.page_offset()),
            leaf.flags(),
        ))
    }

    /// Install this space on the CPU and record it as active.
    pub fn switch(&self) {
        // Sound because kernel code and stacks are mapped identically in
        // every space (borrowed kernel tables), so execution continues.
        unsafe { arch::load_page_table_root(self.root) };
        *ACTIVE_ROOT.lock() = Some(self.root);
    }

    /// Release every owned second-level table and the root itself. Borrowed
    /// kernel tables are skipped. Only valid once no task references the
    /// space; mapped data frames are not touched here.
    pub fn free(self, frames: &mut FrameAllocator) {
        for dir in self.shared_prefix..TABLE_ENTRY_COUNT {
            let entry = read_entry(self.root, dir);
            if entry.is_present() {
                frames.release_table_frame(entry.frame());
            }
        }
        frames.release_table_frame(self.root);
    }
}

/// Root of the space currently installed on the CPU.
pub fn active_root() -> Option<PhysAddr> {
    *ACTIVE_ROOT.lock()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::recorder;
    use crate::testutil;

    const USER_PAGE: u32 = 0x0840_0000;

    fn space(frames: &mut FrameAllocator) -> AddressSpace {
        AddressSpace::new_empty(frames).unwrap()
    }

    #[test]
    fn map_then_write_is_visible_at_the_physical_frame() {
        testutil::init_phys();
        let mut frames = testutil::carve_allocator(8);
        let mut space = space(&mut frames);
        let frame = frames.allocate_frame().unwrap();

        space
            .map(
                VirtAddr::new(USER_PAGE),
                frame,
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                false,
                &mut frames,
            )
            .unwrap();

        // Write through the virtual mapping, observe at the physical frame.
        let (paddr, flags) = space.translate(VirtAddr::new(USER_PAGE + 0x42)).unwrap();
        phys::write_u32(paddr, 0xAB54_A11A);
        assert_eq!(paddr.as_u32(), frame.as_u32() + 0x42);
        assert_eq!(phys::read_u32(PhysAddr::new(frame.as_u32() + 0x42)), 0xAB54_A11A);
        assert!(flags.contains(PageFlags::USER | PageFlags::WRITABLE));
    }

    #[test]
    fn unaligned_map_is_rejected() {
        testutil::init_phys();
        let mut frames = testutil::carve_allocator(4);
        let mut space = space(&mut frames);
        let frame = frames.allocate_frame().unwrap();
        assert_eq!(
            space.map(
                VirtAddr::new(USER_PAGE + 1),
                frame,
                PageFlags::PRESENT,
                false,
                &mut frames
            ),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            space.map(
                VirtAddr::new(USER_PAGE),
                PhysAddr::new(frame.as_u32() + 4),
                PageFlags::PRESENT,
                false,
                &mut frames
            ),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    fn double_map_requires_overwrite() {
        testutil::init_phys();
        let mut frames = testutil::carve_allocator(8);
        let mut space = space(&mut frames);
        let a = frames.allocate_frame().unwrap();
        let b = frames.allocate_frame().unwrap();
        let va = VirtAddr::new(USER_PAGE);
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE;

        space.map(va, a, flags, false, &mut frames).unwrap();
        assert_eq!(
            space.map(va, b, flags, false, &mut frames),
            Err(KernelError::InvalidArgument)
        );
        space.map(va, b, flags, true, &mut frames).unwrap();
        assert_eq!(space.translate(va).unwrap().0, b);
        // The replaced frame went through the gated release: dropped, counted.
        assert_eq!(frames.leaked_frames(), 1);
    }

    #[test]
    fn unmap_region_is_idempotent_and_flushes_each_page() {
        testutil::init_phys();
        let mut frames = testutil::carve_allocator(16);
        let mut space = space(&mut frames);
        let backing = frames.allocate_frames(3).unwrap();
        let start = VirtAddr::new(USER_PAGE);
        let end = VirtAddr::new(USER_PAGE + 3 * PAGE_SIZE);
        let flags = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;

        space.map_region(start, end, backing, flags, &mut frames).unwrap();
        assert!(space.translate(VirtAddr::new(USER_PAGE + 2 * PAGE_SIZE)).is_some());

        recorder::reset();
        space.unmap_region(start, end, &mut frames).unwrap();
        assert_eq!(recorder::snapshot().tlb_flushes.len(), 3);
        assert!(space.translate(start).is_none());

        // Second pass finds nothing to clear and flushes nothing.
        recorder::reset();
        space.unmap_region(start, end, &mut frames).unwrap();
        assert_eq!(recorder::snapshot().tlb_flushes.len(), 0);
    }

    #[test]
    fn map_region_failure_leaves_mapped_prefix() {
        testutil::init_phys();
        // Room for the root plus exactly one second-level table.
        let mut frames = testutil::carve_allocator(2);
        let mut space = space(&mut frames);
        // Backing range carved separately so the small allocator is spent on
        // tables only.
        let backing = testutil::carve_allocator(2).allocate_frames(2).unwrap();

        // The range crosses a directory boundary; the second directory has no
        // table frame left.
        let start = VirtAddr::new(0x083F_F000);
        let end = VirtAddr::new(0x0840_1000);
        let res = space.map_region(
            start,
            end,
            backing,
            PageFlags::PRESENT | PageFlags::USER,
            &mut frames,
        );
        assert_eq!(res, Err(KernelError::OutOfMemory));
        // Locked-in behavior: the prefix stays mapped after the failure.
        assert!(space.translate(start).is_some());
        assert!(space.translate(VirtAddr::new(0x0840_0000)).is_none());
    }

    #[test]
    fn identity_space_translates_everywhere() {
        testutil::init_phys();
        let mut frames = testutil::carve_allocator(1026);
        let space =
            AddressSpace::new_identity(PageFlags::PRESENT | PageFlags::WRITABLE, &mut frames)
                .unwrap();
        for addr in [0u32, 0x1234_5678, 0x0800_0000, 0xFFFF_FFFF] {
            let (paddr, flags) = space.translate(VirtAddr::new(addr)).unwrap();
            assert_eq!(paddr.as_u32(), addr);
            assert!(flags.contains(PageFlags::PRESENT | PageFlags::WRITABLE));
            assert!(!flags.contains(PageFlags::USER));
        }
    }

    #[test]
    fn identity_space_rolls_back_on_allocation_failure() {
        testutil::init_phys();
        let mut frames = testutil::carve_allocator(10);
        let res = AddressSpace::new_identity(PageFlags::PRESENT, &mut frames);
        assert!(matches!(res, Err(KernelError::OutOfMemory)));
        // Everything built before the failure is back on the free list.
        assert_eq!(
            frames.free_list_len() as u32 + frames.remaining_frames(),
            10
        );
        assert!(frames.allocate_frame().is_ok());
    }

    #[test]
    fn adopted_kernel_tables_are_shared_not_owned() {
        testutil::init_phys();
        let mut frames = testutil::carve_allocator(16);
        let mut kernel = space(&mut frames);
        let kframe = frames.allocate_frame().unwrap();
        // A kernel-region mapping, below the user boundary.
        kernel
            .map(
                VirtAddr::new(0x0010_0000),
                kframe,
                PageFlags::PRESENT | PageFlags::WRITABLE,
                false,
                &mut frames,
            )
            .unwrap();

        let mut task_space = space(&mut frames);
        task_space.adopt_kernel_tables(kernel.root());
        assert_eq!(
            task_space.translate(VirtAddr::new(0x0010_0000)).unwrap().0,
            kframe
        );

        // Freeing the task space must not return the kernel's table frames.
        let before = frames.free_list_len();
        task_space.free(&mut frames);
        assert_eq!(frames.free_list_len(), before + 1); // root only
        assert_eq!(
            kernel.translate(VirtAddr::new(0x0010_0000)).unwrap().0,
            kframe
        );
    }

    #[test]
    fn switch_records_the_active_root() {
        testutil::init_phys();
        let mut frames = testutil::carve_allocator(2);
        let space = space(&mut frames);
        recorder::reset();
        space.switch();
        assert_eq!(recorder::snapshot().active_root, Some(space.root().as_u32()));
    }
}
