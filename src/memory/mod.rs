pub mod paging;
pub mod phys;
pub mod user;

use crate::status::KernelResult;
use core::fmt;
use paging::{AddressSpace, PageFlags};
use spin::Once;

/// Size of one page / physical frame.
pub const PAGE_SIZE: u32 = 4096;

/// Entries per page directory and per second-level page table.
pub const TABLE_ENTRY_COUNT: usize = 1024;

/// Everything below this address is reserved for the kernel; user-accessible
/// virtual memory starts here. The single boundary the whole user/kernel
/// validation story hangs off.
pub const KERNEL_SPACE_END: u32 = 0x0800_0000;

/// Load address and entry point for flat binary programs.
pub const USER_PROGRAM_ENTRY: u32 = KERNEL_SPACE_END + 0x40_0000;

/// Top of the user stack (the stack grows down from here).
pub const USER_STACK_TOP: u32 = KERNEL_SPACE_END + 0x3F_F000;

/// Fixed size of every user stack.
pub const USER_STACK_SIZE: u32 = 16 * 1024;

/// Lowest mapped address of the user stack.
pub const USER_STACK_BOTTOM: u32 = USER_STACK_TOP - USER_STACK_SIZE;

/// A 32-bit virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VirtAddr(u32);

/// A 32-bit physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PhysAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        VirtAddr(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    /// Align down to the containing page boundary.
    pub const fn align_down(self) -> Self {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }

    /// Align up to the next page boundary (identity on aligned addresses).
    pub const fn align_up(self) -> Self {
        VirtAddr(self.0.wrapping_add(PAGE_SIZE - 1) & !(PAGE_SIZE - 1))
    }

    /// Index into the root page directory.
    pub const fn directory_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Index into the second-level page table.
    pub const fn table_index(self) -> usize {
        ((self.0 >> 12) & 0x3FF) as usize
    }

    /// Offset within the page.
    pub const fn page_offset(self) -> u32 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        PhysAddr(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    pub const fn align_down(self) -> Self {
        PhysAddr(self.0 & !(PAGE_SIZE - 1))
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

/// Number of whole pages needed to hold `bytes`.
pub const fn page_count(bytes: u32) -> u32 {
    bytes.div_ceil(PAGE_SIZE)
}

static KERNEL_SPACE: Once<AddressSpace> = Once::new();

/// Build the kernel address space: the full 32-bit range, identity mapped,
/// present and writable but not user accessible. Installed immediately so the
/// kernel runs on it from here on. Every task later borrows this space's
/// kernel-region tables through its own root entries.
///
/// The physical window and frame allocator must be initialized first.
pub fn init_kernel_space() -> KernelResult<()> {
    let mut result = Ok(());
    KERNEL_SPACE.call_once(|| {
        match phys::with_frames(|frames| {
            AddressSpace::new_identity(PageFlags::PRESENT | PageFlags::WRITABLE, frames)
        }) {
            Ok(space) => {
                space.switch();
                log::info!("kernel address space built, root at {:?}", space.root());
                space
            }
            Err(err) => {
                result = Err(err);
                AddressSpace::from_root(PhysAddr::new(0))
            }
        }
    });
    result
}

/// Root frame of the kernel address space.
///
/// Panics if [`init_kernel_space`] has not run; nothing can sensibly create
/// processes before the kernel mappings exist.
pub fn kernel_root() -> PhysAddr {
    KERNEL_SPACE
        .get()
        .expect("kernel address space not initialized")
        .root()
}
