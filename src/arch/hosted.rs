//! Hosted backend: no-ops standing in for privileged CPU operations when the
//! crate is compiled for anything but bare i686. Under `cfg(test)` every call
//! is recorded per thread so tests can assert on the side effects the real
//! backend would have had.

use crate::memory::{PhysAddr, VirtAddr};
use crate::scheduler::context::Registers;

#[cfg(test)]
pub mod recorder {
    use std::cell::RefCell;

    /// Observable CPU side effects accumulated by the current test thread.
    #[derive(Default, Clone)]
    pub struct CpuState {
        pub interrupts_enabled: bool,
        pub active_root: Option<u32>,
        pub tlb_flushes: Vec<u32>,
        pub pic_acks: usize,
    }

    std::thread_local! {
        static CPU: RefCell<CpuState> = RefCell::new(CpuState::default());
    }

    pub(super) fn with<R>(f: impl FnOnce(&mut CpuState) -> R) -> R {
        CPU.with(|cpu| f(&mut cpu.borrow_mut()))
    }

    pub fn snapshot() -> CpuState {
        with(|cpu| cpu.clone())
    }

    pub fn reset() {
        with(|cpu| *cpu = CpuState::default());
    }
}

pub fn interrupts_enable() {
    #[cfg(test)]
    recorder::with(|cpu| cpu.interrupts_enabled = true);
}

pub fn interrupts_disable() {
    #[cfg(test)]
    recorder::with(|cpu| cpu.interrupts_enabled = false);
}

pub fn halt_loop() -> ! {
    #[cfg(test)]
    panic!("halt_loop reached in a hosted test");
    #[cfg(not(test))]
    loop {
        core::hint::spin_loop();
    }
}

/// # Safety
/// Mirrors the contract of the real backend; harmless here.
pub unsafe fn load_page_table_root(root: PhysAddr) {
    let _ = root;
    #[cfg(test)]
    recorder::with(|cpu| cpu.active_root = Some(root.as_u32()));
}

pub fn flush_tlb_page(page: VirtAddr) {
    let _ = page;
    #[cfg(test)]
    recorder::with(|cpu| cpu.tlb_flushes.push(page.as_u32()));
}

pub fn pic_acknowledge() {
    #[cfg(test)]
    recorder::with(|cpu| cpu.pic_acks += 1);
}

/// The real backend never returns; the hosted one cannot resume a user
/// context at all, so reaching it is always a bug in hosted code.
///
/// # Safety
/// Never sound to call on a hosted target; provided so callers type-check.
pub unsafe fn task_return(regs: *const Registers) -> ! {
    let _ = regs;
    panic!("task_return requires a protected-mode x86 CPU");
}
