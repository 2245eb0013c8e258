//! Process lifecycle.
//!
//! Processes live in a fixed arena indexed by pid; a pid is unique while its
//! slot is live and may be reused after reaping. Every process owns exactly
//! one task (single-threaded processes are a stated invariant), a fixed-size
//! user stack, its program image, a fixed table of user memory blocks and a
//! keyboard input buffer.
//!
//! Lifecycle: a slot is empty, `create` fills it (`Creating`),
//! `add_arguments` arms it (`CanStart`), `exit` turns it into a zombie that
//! keeps its exit status, and the parent's `wait` reaps it back to empty.
//! Exit never frees the task itself; the exiting task's own context may still
//! be executing kernel code, so the task is only marked dead and freed later
//! by reap, when the CPU is guaranteed to be elsewhere.

use crate::fs::{self, FileHandle, FileSystem};
use crate::loader::{self, ProgramImage};
use crate::memory::paging::{AddressSpace, PageFlags};
use crate::memory::phys::{self, FrameAllocator};
use crate::memory::{
    page_count, PhysAddr, VirtAddr, PAGE_SIZE, USER_PROGRAM_ENTRY, USER_STACK_BOTTOM,
    USER_STACK_SIZE, USER_STACK_TOP,
};
use crate::scheduler::context::Registers;
use crate::scheduler::{self, TaskId, TaskTable};
use crate::status::{KernelError, KernelResult};
use alloc::string::String;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

/// Capacity of the process arena.
pub const MAX_PROCS: usize = 10;

/// Per-process capacity of the user memory block table.
pub const PROCESS_VMEM_MAX_BLOCKS: usize = 10;

/// Per-process capacity of the open file table.
pub const PROCESS_MAX_OPEN_FILES: usize = 10;

/// Bytes in the circular keyboard input buffer.
pub const PROCESS_INPUT_BUFFER_SIZE: usize = 1024;

/// Exit status recorded for a process terminated by a CPU exception.
pub const EXCEPTION_EXIT_STATUS: i32 = -11;

/// Index of a process slot; doubles as the user-visible pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pid(pub u16);

impl Pid {
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Lifecycle state of a live slot. The empty slot itself plays the "unused"
/// role; the running/ready distinction of a started process lives on its
/// task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Creating,
    CanStart,
    Zombie,
}

/// One user memory block registered by mmap, keyed by its start address.
#[derive(Debug, Clone, Copy)]
pub struct VmemBlock {
    pub start: VirtAddr,
    pub end: VirtAddr,
}

/// Circular buffer of decoded keyboard characters. NUL doubles as the empty
/// sentinel, so it is never stored.
pub struct InputBuffer {
    buf: [u8; PROCESS_INPUT_BUFFER_SIZE],
    head: usize,
    tail: usize,
}

impl InputBuffer {
    pub fn new() -> Self {
        InputBuffer {
            buf: [0; PROCESS_INPUT_BUFFER_SIZE],
            head: 0,
            tail: 0,
        }
    }

    pub fn push(&mut self, c: u8) {
        if c == 0 {
            return;
        }
        self.buf[self.tail] = c;
        self.tail = (self.tail + 1) % PROCESS_INPUT_BUFFER_SIZE;
    }

    /// Next buffered character, or NUL when empty.
    pub fn pop(&mut self) -> u8 {
        let c = self.buf[self.head];
        if c == 0 {
            return 0;
        }
        self.buf[self.head] = 0;
        self.head = (self.head + 1) % PROCESS_INPUT_BUFFER_SIZE;
        c
    }
}

impl Default for InputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Process {
    pub pid: Pid,
    pub parent_pid: Pid,
    pub status: ProcessStatus,
    pub exit_status: i32,
    /// The process's single task.
    pub task: TaskId,
    pub image: ProgramImage,
    /// Physical bottom of the user stack allocation.
    pub stack_paddr: PhysAddr,
    pub program_path: String,
    vmem_blocks: [Option<VmemBlock>; PROCESS_VMEM_MAX_BLOCKS],
    open_files: [Option<FileHandle>; PROCESS_MAX_OPEN_FILES],
    /// Anonymous frame ranges allocated on the process's behalf (partially
    /// initialized ELF segments), released at exit.
    owned_frames: Vec<(PhysAddr, u32)>,
    pub input: InputBuffer,
}

impl Process {
    /// Attach an open file handle; the index is the user-visible descriptor.
    pub fn attach_file(&mut self, handle: FileHandle) -> KernelResult<usize> {
        for (i, slot) in self.open_files.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(handle);
                return Ok(i);
            }
        }
        Err(KernelError::OutOfVmemBlocks)
    }

    pub fn detach_file(&mut self, descriptor: usize) -> KernelResult<FileHandle> {
        self.open_files
            .get_mut(descriptor)
            .and_then(Option::take)
            .ok_or(KernelError::InvalidArgument)
    }

    pub fn vmem_block(&self, index: usize) -> Option<VmemBlock> {
        self.vmem_blocks.get(index).copied().flatten()
    }
}

/// The process arena plus the current-process pointer for the single CPU.
pub struct ProcessTable {
    slots: [Option<Process>; MAX_PROCS],
    current: Option<Pid>,
    kernel_root: PhysAddr,
}

impl ProcessTable {
    /// `kernel_root` is the kernel address space every new task borrows its
    /// kernel-region tables from.
    pub fn new(kernel_root: PhysAddr) -> Self {
        const EMPTY: Option<Process> = None;
        ProcessTable {
            slots: [EMPTY; MAX_PROCS],
            current: None,
            kernel_root,
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(Option::is_none)
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.slots.get(pid.as_usize()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots.get_mut(pid.as_usize()).and_then(Option::as_mut)
    }

    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    /// Record the process whose task just went on the CPU. Routing state
    /// (keyboard input, exception exits) follows this pointer.
    pub fn set_current(&mut self, pid: Pid) {
        let proc = self.get(pid).expect("current process does not exist");
        if proc.status != ProcessStatus::CanStart {
            panic!("process {} is not ready to run", pid.0);
        }
        self.current = Some(pid);
    }

    /// Create a process from the program at `path`.
    ///
    /// Finds a slot, allocates the user stack, loads the image (ELF or flat
    /// binary), builds the task with a fresh address space and maps program
    /// and stack into it. Any failure releases everything allocated so far
    /// and returns the slot to the pool.
    pub fn create(
        &mut self,
        tasks: &mut TaskTable,
        frames: &mut FrameAllocator,
        fs: &dyn FileSystem,
        path: &str,
    ) -> KernelResult<Pid> {
        if path.is_empty() || path.len() > fs::MAX_PATH_LEN {
            return Err(KernelError::BadFilePath);
        }
        let slot = self.free_slot().ok_or(KernelError::OutOfProcesses)?;
        let pid = Pid(slot as u16);
        let stack_pages = USER_STACK_SIZE / PAGE_SIZE;

        let stack_paddr = frames.allocate_frames(stack_pages)?;

        let image = match loader::load_image(fs, frames, path) {
            Ok(image) => image,
            Err(err) => {
                frames.release_frames(stack_paddr, stack_pages);
                return Err(err);
            }
        };

        let release_on_error = |frames: &mut FrameAllocator, image: &ProgramImage| {
            let (paddr, size) = image.backing();
            frames.release_frames(paddr, page_count(size));
            frames.release_frames(stack_paddr, stack_pages);
        };

        let mut space = match AddressSpace::new_empty(frames) {
            Ok(space) => space,
            Err(err) => {
                release_on_error(frames, &image);
                return Err(err);
            }
        };
        space.adopt_kernel_tables(self.kernel_root);

        let registers = Registers::at_user_entry(image.entry_point());
        let task = match tasks.create(pid, space, registers, frames) {
            Ok(task) => task,
            Err(err) => {
                release_on_error(frames, &image);
                return Err(err);
            }
        };

        self.slots[slot] = Some(Process {
            pid,
            parent_pid: Pid(0),
            status: ProcessStatus::Creating,
            exit_status: 0,
            task,
            image,
            stack_paddr,
            program_path: String::from(path),
            vmem_blocks: [None; PROCESS_VMEM_MAX_BLOCKS],
            open_files: [None; PROCESS_MAX_OPEN_FILES],
            owned_frames: Vec::new(),
            input: InputBuffer::new(),
        });

        if let Err(err) = self.map_process_memory(tasks, frames, pid) {
            self.destroy(tasks, frames, pid);
            return Err(err);
        }

        log::info!("process {} created from {}", pid.0, path);
        Ok(pid)
    }

    /// Map the program image and the stack into the process's task space.
    fn map_process_memory(
        &mut self,
        tasks: &mut TaskTable,
        frames: &mut FrameAllocator,
        pid: Pid,
    ) -> KernelResult<()> {
        let proc = self.get_mut(pid).expect("mapping a process that does not exist");
        let task = tasks.get_mut(proc.task).expect("process task does not exist");
        let user_rw = PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER;

        // Pull the mapping plan out of the image up front; the ELF loop below
        // also appends to the process's owned-frame list.
        let elf_plan = match &proc.image {
            ProgramImage::Binary { code_paddr, size } => {
                let va_start = VirtAddr::new(USER_PROGRAM_ENTRY);
                let va_end = VirtAddr::new(USER_PROGRAM_ENTRY + size).align_up();
                task.space
                    .map_region(va_start, va_end, *code_paddr, user_rw, frames)?;
                None
            }
            ProgramImage::Elf { file } => Some((file.segments.clone(), file.memory)),
        };

        if let Some((segments, image_memory)) = elf_plan {
            for segment in segments {
                if segment.mem_size == 0 {
                    log::warn!("skipping empty segment at {:?}", segment.vaddr);
                    continue;
                }
                let mut pa_start =
                    PhysAddr::new(image_memory.as_u32() + segment.file_offset).align_down();
                if segment.file_size != segment.mem_size {
                    // Segment bytes beyond the file size read as zero, so
                    // the file-backed frames cannot be mapped directly.
                    // Copy into fresh zeroed frames owned by the process.
                    let copy = frames.allocate_bytes(segment.mem_size)?;
                    phys::copy_phys(
                        copy,
                        PhysAddr::new(image_memory.as_u32() + segment.file_offset),
                        segment.file_size as usize,
                    );
                    proc.owned_frames.push((copy, page_count(segment.mem_size)));
                    pa_start = copy;
                }
                let va_start = segment.vaddr.align_down();
                let va_end = VirtAddr::new(segment.vaddr.as_u32() + segment.mem_size).align_up();
                let mut flags = PageFlags::PRESENT | PageFlags::USER;
                if segment.writable {
                    flags |= PageFlags::WRITABLE;
                }
                task.space.map_region(va_start, va_end, pa_start, flags, frames)?;
            }
        }

        task.space.map_region(
            VirtAddr::new(USER_STACK_BOTTOM),
            VirtAddr::new(USER_STACK_TOP),
            proc.stack_paddr,
            user_rw,
            frames,
        )
    }

    /// Marshal program arguments onto the user stack.
    ///
    /// `packed` is `argc` NUL-terminated strings back to back. The bytes go
    /// on top of the stack verbatim; below them an array of the arguments'
    /// *virtual* addresses, then the argv pointer, then argc, and the task's
    /// stack pointer drops by the total so the program starts as if argc and
    /// argv had just been pushed. Only legal while the process is `Creating`;
    /// arms it to `CanStart`.
    pub fn add_arguments(
        &mut self,
        tasks: &mut TaskTable,
        pid: Pid,
        argc: usize,
        packed: &[u8],
    ) -> KernelResult<()> {
        let proc = self.get_mut(pid).ok_or(KernelError::InvalidArgument)?;
        if proc.status != ProcessStatus::Creating {
            panic!("add_arguments: process {} is not in creating state", pid.0);
        }

        let len = packed.len();
        let pointer_bytes = argc
            .checked_mul(core::mem::size_of::<u32>())
            .ok_or(KernelError::InvalidArgument)?;
        // The argc and argv words themselves need room too.
        if len + pointer_bytes + 8 > USER_STACK_SIZE as usize {
            return Err(KernelError::OutOfMemory);
        }

        let task = tasks.get_mut(proc.task).ok_or(KernelError::InvalidArgument)?;
        let stack_paddr = proc.stack_paddr;
        let stack_phys =
            |va: u32| PhysAddr::new(stack_paddr.as_u32() + (va - USER_STACK_BOTTOM));

        let mut sp = task.registers.esp;
        let mut argv_va = 0u32;

        if argc > 0 {
            // The packed bytes, verbatim, at the top of the stack.
            sp -= len as u32;
            let args_va = sp;
            phys::copy_in(stack_phys(args_va), packed);

            // Each argument's virtual address, found by walking terminators.
            let mut pointers = Vec::with_capacity(argc);
            let mut offset = 0usize;
            for _ in 0..argc {
                if offset >= len {
                    return Err(KernelError::InvalidArgument);
                }
                pointers.push(args_va + offset as u32);
                let nul = packed[offset..]
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(KernelError::InvalidArgument)?;
                offset += nul + 1;
            }

            sp -= pointer_bytes as u32;
            argv_va = sp;
            let mut bytes = Vec::with_capacity(pointer_bytes);
            for p in &pointers {
                bytes.extend_from_slice(&p.to_le_bytes());
            }
            phys::copy_in(stack_phys(argv_va), &bytes);
        }

        sp -= 4;
        phys::write_u32(stack_phys(sp), argv_va);
        sp -= 4;
        phys::write_u32(stack_phys(sp), argc as u32);

        task.registers.esp = sp;
        proc.status = ProcessStatus::CanStart;
        Ok(())
    }

    /// Terminate `pid` with `status`. Idempotent when the slot is empty.
    ///
    /// Releases the image, every user memory block and the stack, and marks
    /// the task dead. The slot itself survives as a zombie holding the exit
    /// status until the parent reaps it.
    pub fn exit(&mut self, tasks: &mut TaskTable, frames: &mut FrameAllocator, pid: Pid, status: i32) {
        let Some(proc) = self.slots.get_mut(pid.as_usize()).and_then(Option::as_mut) else {
            return;
        };
        tasks.mark_dead(proc.task);
        Self::release_resources(proc, tasks, frames);
        proc.status = ProcessStatus::Zombie;
        proc.exit_status = status;
        if self.current == Some(pid) {
            self.current = None;
        }
        log::info!("process {} exited with status {}", pid.0, status);
    }

    /// Release everything a process owns except its task and slot.
    fn release_resources(proc: &mut Process, tasks: &mut TaskTable, frames: &mut FrameAllocator) {
        let block_starts: Vec<VirtAddr> = proc
            .vmem_blocks
            .iter()
            .flatten()
            .map(|block| block.start)
            .collect();
        for start in block_starts {
            let _ = Self::free_block_in(proc, tasks, frames, start);
        }

        let (image_paddr, image_size) = proc.image.backing();
        frames.release_frames(image_paddr, page_count(image_size));
        for (start, pages) in proc.owned_frames.drain(..) {
            frames.release_frames(start, pages);
        }
        frames.release_frames(proc.stack_paddr, USER_STACK_SIZE / PAGE_SIZE);
    }

    /// Reap a zombie: free its task and return the slot to the pool. The
    /// caller must guarantee the CPU is not running inside that task.
    pub fn reap(&mut self, tasks: &mut TaskTable, frames: &mut FrameAllocator, pid: Pid) -> KernelResult<()> {
        match self.get(pid) {
            None => return Err(KernelError::InvalidArgument),
            Some(proc) if proc.status != ProcessStatus::Zombie => {
                return Err(KernelError::NotZombie)
            }
            Some(_) => {}
        }
        let proc = self.slots[pid.as_usize()].take().expect("zombie vanished");
        tasks.free(proc.task, frames);
        log::info!("process {} reaped", pid.0);
        Ok(())
    }

    /// Reap `target` on behalf of `caller`. Fails `InvalidArgument` unless
    /// `target` exists and its recorded parent is `caller`; a still-running
    /// child reports `NotZombie` and the caller is expected to poll.
    pub fn wait(
        &mut self,
        tasks: &mut TaskTable,
        frames: &mut FrameAllocator,
        caller: Pid,
        target: Pid,
    ) -> KernelResult<()> {
        match self.get(target) {
            Some(proc) if proc.parent_pid == caller => {}
            _ => return Err(KernelError::InvalidArgument),
        }
        self.reap(tasks, frames, target)
    }

    /// Tear down a process that never finished creation: everything exit
    /// does, plus freeing the task and clearing the slot immediately.
    pub fn destroy(&mut self, tasks: &mut TaskTable, frames: &mut FrameAllocator, pid: Pid) {
        {
            let Some(proc) = self.slots.get_mut(pid.as_usize()).and_then(Option::as_mut) else {
                return;
            };
            tasks.mark_dead(proc.task);
            Self::release_resources(proc, tasks, frames);
        }
        let proc = self.slots[pid.as_usize()].take().expect("slot vanished");
        tasks.free(proc.task, frames);
        if self.current == Some(pid) {
            self.current = None;
        }
    }

    /// Register a user memory block. Live blocks must not overlap.
    pub fn add_vmem_block(&mut self, pid: Pid, start: VirtAddr, end: VirtAddr) -> KernelResult<usize> {
        let proc = self.get_mut(pid).ok_or(KernelError::InvalidArgument)?;
        if proc
            .vmem_blocks
            .iter()
            .flatten()
            .any(|block| start < block.end && block.start < end)
        {
            return Err(KernelError::InvalidArgument);
        }
        for (i, slot) in proc.vmem_blocks.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(VmemBlock { start, end });
                return Ok(i);
            }
        }
        Err(KernelError::OutOfVmemBlocks)
    }

    /// Index of the block starting exactly at `start`.
    pub fn get_vmem_block(&self, pid: Pid, start: VirtAddr) -> KernelResult<usize> {
        let proc = self.get(pid).ok_or(KernelError::InvalidArgument)?;
        proc.vmem_blocks
            .iter()
            .position(|slot| matches!(slot, Some(block) if block.start == start))
            .ok_or(KernelError::InvalidArgument)
    }

    /// Drop the block starting at `start`, unmapping its pages from the
    /// owning task's address space.
    pub fn free_vmem_block(
        &mut self,
        tasks: &mut TaskTable,
        frames: &mut FrameAllocator,
        pid: Pid,
        start: VirtAddr,
    ) -> KernelResult<()> {
        let proc = self.get_mut(pid).ok_or(KernelError::InvalidArgument)?;
        Self::free_block_in(proc, tasks, frames, start)
    }

    fn free_block_in(
        proc: &mut Process,
        tasks: &mut TaskTable,
        frames: &mut FrameAllocator,
        start: VirtAddr,
    ) -> KernelResult<()> {
        let index = proc
            .vmem_blocks
            .iter()
            .position(|slot| matches!(slot, Some(block) if block.start == start))
            .ok_or(KernelError::InvalidArgument)?;
        let block = proc.vmem_blocks[index].take().expect("vmem block vanished");
        // Single task per process: one address space to clean up, no
        // cross-task shootdown.
        let task = tasks.get_mut(proc.task).ok_or(KernelError::InvalidArgument)?;
        task.space.unmap_region(block.start, block.end, frames)
    }

    /// Drop a block entry without touching the page tables; the rollback
    /// path for a mapping that never happened.
    pub fn clear_vmem_block(&mut self, pid: Pid, index: usize) {
        if let Some(proc) = self.get_mut(pid) {
            if let Some(slot) = proc.vmem_blocks.get_mut(index) {
                *slot = None;
            }
        }
    }

    pub fn push_input(&mut self, pid: Pid, c: u8) {
        if let Some(proc) = self.get_mut(pid) {
            proc.input.push(c);
        }
    }

    pub fn pop_input(&mut self, pid: Pid) -> u8 {
        self.get_mut(pid).map_or(0, |proc| proc.input.pop())
    }
}

lazy_static! {
    static ref PROCS: Mutex<Option<ProcessTable>> = Mutex::new(None);
}

/// Initialize the global process table. Requires the kernel address space.
pub fn init() {
    let mut table = PROCS.lock();
    if table.is_none() {
        *table = Some(ProcessTable::new(crate::memory::kernel_root()));
        log::info!("process table ready ({} slots)", MAX_PROCS);
    }
}

/// Run `f` with the global process table. Panics before [`init`].
pub fn with_table<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> R {
    let mut table = PROCS.lock();
    f(table.as_mut().expect("process table not initialized"))
}

/// Create a process through the installed filesystem.
pub fn create(path: &str) -> KernelResult<Pid> {
    let fs = fs::installed().ok_or(KernelError::Io)?;
    with_table(|procs| {
        scheduler::with_tasks(|tasks| {
            phys::with_frames(|frames| procs.create(tasks, frames, &*fs, path))
        })
    })
}

pub fn add_arguments(pid: Pid, argc: usize, packed: &[u8]) -> KernelResult<()> {
    with_table(|procs| scheduler::with_tasks(|tasks| procs.add_arguments(tasks, pid, argc, packed)))
}

pub fn set_parent(child: Pid, parent: Pid) {
    with_table(|procs| {
        if let Some(proc) = procs.get_mut(child) {
            proc.parent_pid = parent;
        }
    });
}

pub fn current_pid() -> Option<Pid> {
    with_table(|procs| procs.current())
}

/// Terminate the current process; a no-op when nothing is current.
pub fn exit_current(status: i32) {
    with_table(|procs| {
        if let Some(pid) = procs.current() {
            scheduler::with_tasks(|tasks| {
                phys::with_frames(|frames| procs.exit(tasks, frames, pid, status))
            });
        }
    });
}

/// Reap `target` on behalf of the current process.
pub fn wait_current(target: Pid) -> KernelResult<()> {
    with_table(|procs| {
        let caller = procs.current().ok_or(KernelError::InvalidArgument)?;
        scheduler::with_tasks(|tasks| {
            phys::with_frames(|frames| procs.wait(tasks, frames, caller, target))
        })
    })
}

/// Tear down a process that failed mid-creation.
pub fn destroy(pid: Pid) {
    with_table(|procs| {
        scheduler::with_tasks(|tasks| {
            phys::with_frames(|frames| procs.destroy(tasks, frames, pid))
        })
    });
}

/// Route one decoded keyboard character to the current process.
pub fn push_input_to_current(c: u8) {
    with_table(|procs| {
        if let Some(pid) = procs.current() {
            procs.push_input(pid, c);
        }
    });
}

/// Pop one buffered character for the current process; NUL when empty.
pub fn pop_input_current() -> u8 {
    with_table(|procs| {
        procs
            .current()
            .map_or(0, |pid| procs.pop_input(pid))
    })
}
