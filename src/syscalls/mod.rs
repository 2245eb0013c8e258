//! The syscall commands.
//!
//! Each command is a [`SyscallHandler`] registered in the dispatcher's
//! command table at boot. Arguments arrive on the *user* stack: the caller's
//! stub pushes them in declaration order before trapping, so argument `i`
//! sits at the saved stack pointer plus `4 * i`, fetched through the memory
//! access validator. Results are single machine words; failures are negated
//! status codes.
//!
//! Command 0 is reserved.

use crate::drivers::console;
use crate::fs::MAX_PATH_LEN;
use crate::interrupts::{self, SyscallHandler, TrapFrame};
use crate::memory::paging::PageFlags;
use crate::memory::phys;
use crate::memory::{page_count, user, VirtAddr, USER_STACK_SIZE};
use crate::process::{self, Pid, MAX_PROCS};
use crate::scheduler;
use crate::status::{KernelError, KernelResult};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Once;

pub const SYS_PRINT: usize = 1;
pub const SYS_GET_CHAR: usize = 2;
pub const SYS_PUT_CHAR: usize = 3;
pub const SYS_MMAP: usize = 4;
pub const SYS_MUNMAP: usize = 5;
pub const SYS_CLEAR_SCREEN: usize = 6;
pub const SYS_CREATE_PROCESS: usize = 7;
pub const SYS_EXIT: usize = 8;
pub const SYS_WAIT_PID: usize = 9;

/// Largest print buffer a single call will copy.
const PRINT_MAX: u32 = 4096;

/// User-visible mapping request flags.
const MAP_WRITE: u32 = 2;

/// Fetch syscall argument `index` from the trapping task's user stack.
fn argument(index: usize) -> KernelResult<u32> {
    scheduler::with_tasks(|tasks| {
        let id = tasks.current().ok_or(KernelError::InvalidArgument)?;
        let task = tasks.get(id).ok_or(KernelError::InvalidArgument)?;
        let addr = VirtAddr::new(task.registers.esp + (4 * index) as u32);
        user::read_user_u32(&task.space, addr)
    })
}

/// Copy `len` bytes from the trapping task's memory into a kernel buffer.
fn copy_buffer(src: u32, len: usize) -> KernelResult<Vec<u8>> {
    scheduler::with_tasks(|tasks| {
        let id = tasks.current().ok_or(KernelError::InvalidArgument)?;
        let task = tasks.get(id).ok_or(KernelError::InvalidArgument)?;
        let mut buf = vec![0u8; len];
        user::copy_from_user(&task.space, VirtAddr::new(src), &mut buf)?;
        Ok(buf)
    })
}

fn copy_path(src: u32) -> KernelResult<String> {
    scheduler::with_tasks(|tasks| {
        let id = tasks.current().ok_or(KernelError::InvalidArgument)?;
        let task = tasks.get(id).ok_or(KernelError::InvalidArgument)?;
        user::copy_str_from_user(&task.space, VirtAddr::new(src), MAX_PATH_LEN + 1)
            .map_err(|_| KernelError::BadFilePath)
    })
}

/// print(buf, len): copy the buffer out of user memory and write it to the
/// console.
struct Print;

impl SyscallHandler for Print {
    fn handle(&self, _frame: &mut TrapFrame) -> KernelResult<u32> {
        let len = argument(0)?;
        let buf = argument(1)?;
        if len > PRINT_MAX {
            return Err(KernelError::InvalidArgument);
        }
        let bytes = copy_buffer(buf, len as usize)?;
        let text = String::from_utf8_lossy(&bytes);
        console::with_console(|c| c.write(&text));
        Ok(0)
    }
}

/// get_char(): next buffered keyboard character for the calling process, or
/// NUL when the buffer is empty.
struct GetChar;

impl SyscallHandler for GetChar {
    fn handle(&self, _frame: &mut TrapFrame) -> KernelResult<u32> {
        Ok(process::pop_input_current() as u32)
    }
}

/// put_char(c)
struct PutChar;

impl SyscallHandler for PutChar {
    fn handle(&self, _frame: &mut TrapFrame) -> KernelResult<u32> {
        let c = argument(0)? as u8;
        console::with_console(|console| console.put_byte(c));
        Ok(0)
    }
}

/// mmap(va_start, va_end, flags): back `[va_start, va_end)` with fresh
/// frames, register the block, map it into the caller's space.
struct Mmap;

impl SyscallHandler for Mmap {
    fn handle(&self, _frame: &mut TrapFrame) -> KernelResult<u32> {
        let start = VirtAddr::new(argument(2)?);
        let end = VirtAddr::new(argument(1)?);
        let request = argument(0)?;

        // Alignment is the caller's job; nothing is registered for a sloppy
        // request.
        if !start.is_page_aligned() || !end.is_page_aligned() {
            return Err(KernelError::InvalidArgument);
        }
        user::verify_pointer(start)?;
        user::verify_pointer(end)?;
        if end <= start {
            return Err(KernelError::InvalidUserAccess);
        }

        let mut flags = PageFlags::PRESENT | PageFlags::USER;
        if request & MAP_WRITE != 0 {
            flags |= PageFlags::WRITABLE;
        }

        process::with_table(|procs| {
            scheduler::with_tasks(|tasks| {
                phys::with_frames(|frames| {
                    let pid = procs.current().ok_or(KernelError::InvalidArgument)?;
                    let bytes = end.as_u32() - start.as_u32();
                    let backing = frames.allocate_bytes(bytes)?;

                    let block = match procs.add_vmem_block(pid, start, end) {
                        Ok(block) => block,
                        Err(err) => {
                            frames.release_frames(backing, page_count(bytes));
                            return Err(err);
                        }
                    };

                    let task = procs.get(pid).ok_or(KernelError::InvalidArgument)?.task;
                    let task = tasks.get_mut(task).ok_or(KernelError::InvalidArgument)?;
                    if let Err(err) = task.space.map_region(start, end, backing, flags, frames) {
                        procs.clear_vmem_block(pid, block);
                        frames.release_frames(backing, page_count(bytes));
                        return Err(err);
                    }
                    Ok(0)
                })
            })
        })
    }
}

/// munmap(addr): tear down the whole block previously mapped at `addr`.
struct Munmap;

impl SyscallHandler for Munmap {
    fn handle(&self, _frame: &mut TrapFrame) -> KernelResult<u32> {
        let addr = VirtAddr::new(argument(0)?);
        process::with_table(|procs| {
            scheduler::with_tasks(|tasks| {
                phys::with_frames(|frames| {
                    let pid = procs.current().ok_or(KernelError::InvalidArgument)?;
                    procs.free_vmem_block(tasks, frames, pid, addr)?;
                    Ok(0)
                })
            })
        })
    }
}

/// clear_screen()
struct ClearScreen;

impl SyscallHandler for ClearScreen {
    fn handle(&self, _frame: &mut TrapFrame) -> KernelResult<u32> {
        console::with_console(|console| console.clear());
        Ok(0)
    }
}

/// create_process(path, argc, args_len, packed_args) -> pid.
///
/// `packed_args` is `argc` NUL-terminated strings back to back, `args_len`
/// bytes total including terminators. The new process gets the caller as its
/// parent and its arguments marshalled onto its stack; it is left `CanStart`
/// and will run when the scheduler picks it.
struct CreateProcess;

impl SyscallHandler for CreateProcess {
    fn handle(&self, _frame: &mut TrapFrame) -> KernelResult<u32> {
        let args_ptr = argument(0)?;
        let args_len = argument(1)?;
        let argc = argument(2)?;
        let path_ptr = argument(3)?;

        if args_len > USER_STACK_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let path = copy_path(path_ptr)?;
        let packed = if args_len > 0 {
            copy_buffer(args_ptr, args_len as usize)?
        } else {
            Vec::new()
        };

        let parent = process::current_pid().ok_or(KernelError::InvalidArgument)?;
        let pid = process::create(&path)?;
        process::set_parent(pid, parent);
        if let Err(err) = process::add_arguments(pid, argc as usize, &packed) {
            process::destroy(pid);
            return Err(err);
        }
        Ok(pid.0 as u32)
    }
}

/// exit(status): never returns; the CPU moves to the next ready task.
struct Exit;

impl SyscallHandler for Exit {
    fn handle(&self, _frame: &mut TrapFrame) -> KernelResult<u32> {
        let status = argument(0)? as i32;
        process::exit_current(status);
        scheduler::switch_and_run_any()
    }
}

/// wait_pid(pid): reap a zombie child; 0 on success, negative while the
/// child still runs (poll again) or on a pid that is not the caller's child.
struct WaitPid;

impl SyscallHandler for WaitPid {
    fn handle(&self, _frame: &mut TrapFrame) -> KernelResult<u32> {
        let pid = argument(0)?;
        if pid >= MAX_PROCS as u32 {
            return Err(KernelError::InvalidArgument);
        }
        process::wait_current(Pid(pid as u16))?;
        Ok(0)
    }
}

static REGISTERED: Once<()> = Once::new();

/// Register every command with the dispatcher. Idempotent so repeated boot
/// paths cannot trip the double-registration check.
pub fn register_all() {
    REGISTERED.call_once(|| {
        let entries: [(usize, Arc<dyn SyscallHandler>); 9] = [
            (SYS_PRINT, Arc::new(Print)),
            (SYS_GET_CHAR, Arc::new(GetChar)),
            (SYS_PUT_CHAR, Arc::new(PutChar)),
            (SYS_MMAP, Arc::new(Mmap)),
            (SYS_MUNMAP, Arc::new(Munmap)),
            (SYS_CLEAR_SCREEN, Arc::new(ClearScreen)),
            (SYS_CREATE_PROCESS, Arc::new(CreateProcess)),
            (SYS_EXIT, Arc::new(Exit)),
            (SYS_WAIT_PID, Arc::new(WaitPid)),
        ];
        for (command, handler) in entries {
            interrupts::register_syscall(command, handler)
                .expect("syscall command out of range");
        }
        log::info!("syscall commands registered");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::console::{self as console_seam, BufferConsole};
    use crate::drivers::keyboard;
    use crate::drivers::Console as _;
    use crate::fs::ramfs::RamFs;
    use crate::interrupts::{handle_syscall, TrapFrame};
    use crate::memory::USER_PROGRAM_ENTRY;
    use crate::scheduler::context::{INITIAL_EFLAGS, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
    use crate::testutil;

    fn boot() -> Arc<BufferConsole> {
        testutil::boot_kernel();
        crate::fs::install(Arc::new(
            RamFs::new()
                .with_file("0:/shell", &[0x90u8; 32])
                .with_file("0:/child", &[0x90u8; 16]),
        ));
        let buffer = Arc::new(BufferConsole::new());
        console_seam::install(buffer.clone());
        buffer
    }

    /// Create a process, arm it and put it on the CPU so syscalls have a
    /// current task to charge.
    fn spawn_current(path: &str) -> Pid {
        let pid = process::create(path).unwrap();
        process::add_arguments(pid, 0, b"").unwrap();
        let task = process::with_table(|procs| procs.get(pid).unwrap().task);
        scheduler::switch_to(task);
        pid
    }

    /// Write `words` where the syscall stub would have pushed them and
    /// return the stack pointer value at trap time (`words[i]` at
    /// `esp + 4 * i`).
    fn write_args(words: &[u32]) -> u32 {
        scheduler::with_tasks(|tasks| {
            let id = tasks.current().unwrap();
            let task = tasks.get_mut(id).unwrap();
            let mut esp = task.registers.esp;
            for word in words.iter().rev() {
                esp -= 4;
                let (paddr, _) = task.space.translate(VirtAddr::new(esp)).unwrap();
                phys::write_u32(paddr, *word);
            }
            esp
        })
    }

    /// Trap into the kernel the way the platform stub would.
    fn syscall(command: usize, args: &[u32]) -> i32 {
        let esp = write_args(args);
        let mut frame = TrapFrame {
            eax: command as u32,
            esp,
            eip: USER_PROGRAM_ENTRY,
            cs: USER_CODE_SELECTOR,
            ss: USER_DATA_SELECTOR,
            eflags: INITIAL_EFLAGS,
            ..TrapFrame::default()
        };
        handle_syscall(&mut frame)
    }

    /// Write bytes somewhere harmless in the current task's user memory and
    /// return the virtual address.
    fn poke_user(offset: u32, bytes: &[u8]) -> u32 {
        use crate::memory::USER_STACK_BOTTOM;
        let va = USER_STACK_BOTTOM + offset;
        scheduler::with_tasks(|tasks| {
            let id = tasks.current().unwrap();
            let task = tasks.get(id).unwrap();
            let (paddr, _) = task.space.translate(VirtAddr::new(va)).unwrap();
            phys::copy_in(paddr, bytes);
        });
        va
    }

    #[test]
    fn unknown_commands_report_not_implemented() {
        let _guard = testutil::kernel_lock();
        boot();
        let pid = spawn_current("0:/shell");

        let ret = syscall(63, &[]);
        assert_eq!(ret, -(KernelError::NotImplemented.code()));
        // The saved snapshot carries the result for the eventual resume.
        let saved = scheduler::with_tasks(|tasks| {
            let id = tasks.current().unwrap();
            tasks.registers_of(id).eax
        });
        assert_eq!(saved as i32, ret);

        process::destroy(pid);
    }

    #[test]
    fn print_copies_out_of_user_memory() {
        let _guard = testutil::kernel_lock();
        let console = boot();
        let pid = spawn_current("0:/shell");
        console.clear();

        let text = b"hello from ring 3";
        let va = poke_user(0, text);
        assert_eq!(syscall(SYS_PRINT, &[text.len() as u32, va]), 0);
        assert_eq!(console.contents(), "hello from ring 3");

        // Oversized requests are rejected before any copy.
        assert_eq!(
            syscall(SYS_PRINT, &[PRINT_MAX + 1, va]),
            -(KernelError::InvalidArgument.code())
        );

        process::destroy(pid);
    }

    #[test]
    fn put_char_and_clear_screen_drive_the_console() {
        let _guard = testutil::kernel_lock();
        let console = boot();
        let pid = spawn_current("0:/shell");
        console.clear();

        assert_eq!(syscall(SYS_PUT_CHAR, &[b'A' as u32]), 0);
        assert_eq!(console.contents(), "A");
        assert_eq!(syscall(SYS_CLEAR_SCREEN, &[]), 0);
        assert_eq!(console.contents(), "");

        process::destroy(pid);
    }

    #[test]
    fn get_char_drains_the_input_buffer() {
        let _guard = testutil::kernel_lock();
        boot();
        let pid = spawn_current("0:/shell");

        keyboard::push_char(b'x');
        keyboard::push_char(b'y');
        assert_eq!(syscall(SYS_GET_CHAR, &[]), b'x' as i32);
        assert_eq!(syscall(SYS_GET_CHAR, &[]), b'y' as i32);
        assert_eq!(syscall(SYS_GET_CHAR, &[]), 0);

        process::destroy(pid);
    }

    #[test]
    fn mmap_write_read_munmap_scenario() {
        let _guard = testutil::kernel_lock();
        boot();
        let pid = spawn_current("0:/shell");
        let (va_start, va_end) = (0x0900_2000u32, 0x0900_3000u32);

        assert_eq!(syscall(SYS_MMAP, &[MAP_WRITE, va_end, va_start]), 0);

        // A write through the fresh mapping reads back.
        scheduler::with_tasks(|tasks| {
            let id = tasks.current().unwrap();
            let task = tasks.get(id).unwrap();
            let (paddr, flags) = task.space.translate(VirtAddr::new(va_start)).unwrap();
            assert!(flags.contains(PageFlags::WRITABLE | PageFlags::USER));
            phys::write_u32(paddr, 0x5EED_F00D);
            assert_eq!(phys::read_u32(paddr), 0x5EED_F00D);
        });

        assert_eq!(syscall(SYS_MUNMAP, &[va_start]), 0);
        scheduler::with_tasks(|tasks| {
            let id = tasks.current().unwrap();
            let task = tasks.get(id).unwrap();
            assert!(task.space.translate(VirtAddr::new(va_start)).is_none());
        });

        // The block is gone; a second munmap cannot name it.
        assert_eq!(
            syscall(SYS_MUNMAP, &[va_start]),
            -(KernelError::InvalidArgument.code())
        );

        process::destroy(pid);
    }

    #[test]
    fn unaligned_mmap_leaves_the_block_table_untouched() {
        let _guard = testutil::kernel_lock();
        boot();
        let pid = spawn_current("0:/shell");

        assert_eq!(
            syscall(SYS_MMAP, &[MAP_WRITE, 0x0900_3000, 0x0900_2001]),
            -(KernelError::InvalidArgument.code())
        );
        process::with_table(|procs| {
            let proc = procs.get(pid).unwrap();
            for i in 0..crate::process::PROCESS_VMEM_MAX_BLOCKS {
                assert!(proc.vmem_block(i).is_none());
            }
        });

        // Kernel-space targets are refused as user access violations.
        assert_eq!(
            syscall(SYS_MMAP, &[MAP_WRITE, 0x3000, 0x2000]),
            -(KernelError::InvalidUserAccess.code())
        );

        process::destroy(pid);
    }

    #[test]
    fn create_process_then_wait_reaps_exactly_once() {
        let _guard = testutil::kernel_lock();
        boot();
        let parent = spawn_current("0:/shell");

        let path_va = poke_user(0, b"0:/child\0");
        let args_va = poke_user(64, b"child\0-v\0");
        let ret = syscall(SYS_CREATE_PROCESS, &[args_va, 9, 2, path_va]);
        assert!(ret >= 0, "create_process failed: {}", ret);
        let child = Pid(ret as u16);

        process::with_table(|procs| {
            let proc = procs.get(child).unwrap();
            assert_eq!(proc.parent_pid, parent);
            assert_eq!(proc.program_path, "0:/child");
        });

        // Still running: the parent has to poll.
        assert_eq!(
            syscall(SYS_WAIT_PID, &[child.0 as u32]),
            -(KernelError::NotZombie.code())
        );

        // The child exits (not via its own trap here; it never ran).
        process::with_table(|procs| {
            scheduler::with_tasks(|tasks| {
                phys::with_frames(|frames| procs.exit(tasks, frames, child, 0))
            })
        });

        assert_eq!(syscall(SYS_WAIT_PID, &[child.0 as u32]), 0);
        assert_eq!(
            syscall(SYS_WAIT_PID, &[child.0 as u32]),
            -(KernelError::InvalidArgument.code())
        );

        process::destroy(parent);
    }

    #[test]
    fn exception_kills_the_current_process_and_schedules_another() {
        let _guard = testutil::kernel_lock();
        boot();
        let doomed = spawn_current("0:/shell");
        let bystander = {
            let pid = process::create("0:/child").unwrap();
            process::add_arguments(pid, 0, b"").unwrap();
            pid
        };

        let mut frame = TrapFrame {
            eip: USER_PROGRAM_ENTRY,
            ..TrapFrame::default()
        };
        // Vector 0 (divide error) runs the default exception handler, which
        // exits the current process and then tries to resume the bystander.
        // The hosted backend cannot resume a context, so the control
        // transfer surfaces as a caught unwind; the interesting state is
        // checked afterwards.
        let unwind = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            crate::interrupts::handle_interrupt(0, &mut frame);
        }));
        assert!(unwind.is_err());

        process::with_table(|procs| {
            use crate::process::ProcessStatus;
            let proc = procs.get(doomed).unwrap();
            assert_eq!(proc.status, ProcessStatus::Zombie);
            assert_eq!(proc.exit_status, crate::process::EXCEPTION_EXIT_STATUS);
        });

        process::destroy(bystander);
        // The zombie still holds its dead task; reap it to free the slot.
        process::with_table(|procs| {
            scheduler::with_tasks(|tasks| {
                phys::with_frames(|frames| procs.reap(tasks, frames, doomed).unwrap())
            })
        });
    }
}
