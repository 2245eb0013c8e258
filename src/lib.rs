//! Core of a single-CPU, 32-bit protected-mode operating system kernel:
//! virtual memory, process and task lifecycle, and the trap/syscall boundary
//! between user and kernel execution.
//!
//! The crate is the kernel's brain, not its body. Boot glue, the hardware
//! IDT/GDT, the console and keyboard drivers, the disk stack and the heap
//! allocator are platform collaborators reached through the seams in
//! [`fs`], [`drivers`] and [`arch`]; hosted builds plug test doubles into
//! the same seams, which is how the whole core is unit tested off-target.
//!
//! Scheduling is purely cooperative: control moves between tasks only on an
//! explicit syscall, a wait, or an unhandled exception. There is no timer
//! preemption and no second CPU, and the concurrency story leans on both:
//! shared kernel state lives behind spinlocks that are only ever taken from
//! trap context or boot code, with interrupts masked.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod drivers;
pub mod fs;
pub mod interrupts;
pub mod loader;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod status;
pub mod syscalls;

use alloc::sync::Arc;
use status::KernelResult;

/// Bring the core up in dependency order. The platform must have initialized
/// the physical window and frame allocator (and its heap) first.
pub fn kernel_init(
    filesystem: Arc<dyn fs::FileSystem>,
    console: Arc<dyn drivers::Console>,
) -> KernelResult<()> {
    memory::init_kernel_space()?;
    interrupts::init();
    process::init();
    syscalls::register_all();
    fs::install(filesystem);
    drivers::console::install(console);
    log::info!("kernel core initialized");
    Ok(())
}

/// Load the first user program, hand it its arguments and run it. Never
/// returns; a failure this early is unrecoverable and halts.
pub fn run_first_process(path: &str, argc: usize, packed_args: &[u8]) -> ! {
    let pid = match process::create(path) {
        Ok(pid) => pid,
        Err(err) => panic!("failed to load {}: {:?}", path, err),
    };
    if let Err(err) = process::add_arguments(pid, argc, packed_args) {
        panic!("failed to add arguments for {}: {:?}", path, err);
    }
    log::info!("starting init process {}", pid.0);
    scheduler::run_init_task()
}

#[cfg(all(not(test), target_arch = "x86"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    log::error!("kernel panic: {}", info);
    arch::halt_loop()
}
