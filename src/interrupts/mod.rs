//! Trap dispatch: the interrupt vector table, the syscall command table and
//! the critical-section nesting counter.
//!
//! The hardware IDT and the per-vector assembly stubs belong to the platform
//! layer; each stub materializes a [`TrapFrame`] and calls
//! [`handle_interrupt`] or [`handle_syscall`]. Both dispatch tables hold
//! trait objects behind `Arc` so a handler can be invoked after the table
//! lock is dropped; handlers are allowed to switch tasks and never return,
//! and must not do that while holding the table.

use crate::arch;
use crate::process::{self, EXCEPTION_EXIT_STATUS};
use crate::scheduler::{self, context::Registers};
use crate::status::{status_word, KernelError, KernelResult};
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};
use lazy_static::lazy_static;
use spin::{Mutex, Once};

/// Vectors the dispatcher tracks.
pub const INTERRUPT_COUNT: usize = 512;

/// Size of the syscall command space.
pub const SYSCALL_COUNT: usize = 64;

/// The software interrupt user programs trap into for syscalls.
pub const SYSCALL_VECTOR: usize = 0x80;

/// CPU exceptions occupy the first 32 vectors.
pub const EXCEPTION_VECTOR_COUNT: usize = 0x20;

/// Register state the trap stub captured on entry: the `pushad` block in
/// push order, then what the CPU pushed on the ring transition.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// esp slot written by `pushad`; not the trapping stack pointer.
    pub reserved_esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// The user stack pointer pushed by the CPU on the ring transition.
    pub esp: u32,
    pub ss: u32,
}

impl TrapFrame {
    /// The frame as a task register snapshot.
    pub fn registers(&self) -> Registers {
        Registers {
            edi: self.edi,
            esi: self.esi,
            ebp: self.ebp,
            ebx: self.ebx,
            edx: self.edx,
            ecx: self.ecx,
            eax: self.eax,
            eip: self.eip,
            cs: self.cs,
            eflags: self.eflags,
            esp: self.esp,
            ss: self.ss,
        }
    }
}

/// A hardware or software interrupt handler.
pub trait InterruptHandler: Send + Sync {
    fn handle(&self, vector: usize, frame: &mut TrapFrame);
}

/// One syscall command. The result word lands in the task's `eax`.
pub trait SyscallHandler: Send + Sync {
    fn handle(&self, frame: &mut TrapFrame) -> KernelResult<u32>;
}

/// Fixed-size interrupt vector table, initially empty.
pub struct InterruptTable {
    handlers: [Option<Arc<dyn InterruptHandler>>; INTERRUPT_COUNT],
}

impl InterruptTable {
    pub fn new() -> Self {
        const EMPTY: Option<Arc<dyn InterruptHandler>> = None;
        InterruptTable {
            handlers: [EMPTY; INTERRUPT_COUNT],
        }
    }

    /// Install (or replace) the handler for `vector`.
    pub fn register(
        &mut self,
        vector: usize,
        handler: Arc<dyn InterruptHandler>,
    ) -> KernelResult<()> {
        if vector >= INTERRUPT_COUNT {
            return Err(KernelError::InvalidArgument);
        }
        self.handlers[vector] = Some(handler);
        Ok(())
    }

    pub fn handler(&self, vector: usize) -> Option<Arc<dyn InterruptHandler>> {
        self.handlers.get(vector).and_then(Clone::clone)
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size syscall command table, initially empty.
pub struct SyscallTable {
    handlers: [Option<Arc<dyn SyscallHandler>>; SYSCALL_COUNT],
}

impl SyscallTable {
    pub fn new() -> Self {
        const EMPTY: Option<Arc<dyn SyscallHandler>> = None;
        SyscallTable {
            handlers: [EMPTY; SYSCALL_COUNT],
        }
    }

    /// Install the handler for `command`.
    ///
    /// An out-of-range command is an error; registering over an occupied
    /// slot is a configuration bug and halts the kernel.
    pub fn register(
        &mut self,
        command: usize,
        handler: Arc<dyn SyscallHandler>,
    ) -> KernelResult<()> {
        if command >= SYSCALL_COUNT {
            return Err(KernelError::InvalidArgument);
        }
        if self.handlers[command].is_some() {
            panic!("syscall command {} already in use", command);
        }
        self.handlers[command] = Some(handler);
        Ok(())
    }

    pub fn handler(&self, command: usize) -> Option<Arc<dyn SyscallHandler>> {
        self.handlers.get(command).and_then(Clone::clone)
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref INTERRUPTS: Mutex<InterruptTable> = Mutex::new(InterruptTable::new());
    pub static ref SYSCALLS: Mutex<SyscallTable> = Mutex::new(SyscallTable::new());
}

pub fn register_interrupt(vector: usize, handler: Arc<dyn InterruptHandler>) -> KernelResult<()> {
    INTERRUPTS.lock().register(vector, handler)
}

pub fn register_syscall(command: usize, handler: Arc<dyn SyscallHandler>) -> KernelResult<()> {
    SYSCALLS.lock().register(command, handler)
}

/// Default handler for CPU exception vectors: the faulting process is
/// terminated with the exception status and something else gets the CPU.
struct ExceptionExit;

impl InterruptHandler for ExceptionExit {
    fn handle(&self, vector: usize, frame: &mut TrapFrame) {
        log::error!(
            "exception {} at eip {:#010x}, terminating current process",
            vector,
            frame.eip
        );
        process::exit_current(EXCEPTION_EXIT_STATUS);
        scheduler::switch_and_run_any();
    }
}

static INIT: Once<()> = Once::new();

/// Wire the default exception handlers and reset the nesting counter.
pub fn init() {
    INIT.call_once(|| {
        let exception: Arc<dyn InterruptHandler> = Arc::new(ExceptionExit);
        let mut table = INTERRUPTS.lock();
        for vector in 0..EXCEPTION_VECTOR_COUNT {
            table
                .register(vector, exception.clone())
                .expect("exception vector out of range");
        }
        STI_COUNT.store(0, Ordering::SeqCst);
        log::info!("interrupt dispatch ready");
    });
}

/// Entry point for the platform's per-vector stubs.
///
/// Looks up and runs the registered handler; without one the interrupt
/// controller is acknowledged and execution resumes. Handlers own any
/// further acknowledgment because they may switch away and never return.
pub extern "C" fn handle_interrupt(vector: usize, frame: &mut TrapFrame) {
    let handler = INTERRUPTS.lock().handler(vector);
    match handler {
        Some(handler) => handler.handle(vector, frame),
        None => arch::pic_acknowledge(),
    }
}

/// Entry point for the syscall stub (vector 0x80).
///
/// Saves the trapping task's full snapshot, dispatches on the command in
/// `eax`, and both returns the result word and stores it into the saved
/// snapshot so the task sees it whenever it next runs.
pub extern "C" fn handle_syscall(frame: &mut TrapFrame) -> i32 {
    scheduler::save_current_state(frame);
    let command = frame.eax as usize;

    let handler = SYSCALLS.lock().handler(command);
    let result = match handler {
        Some(handler) => status_word(handler.handle(frame)),
        None => -KernelError::NotImplemented.code(),
    };

    scheduler::set_current_return_value(result as u32);
    frame.eax = result as u32;
    result
}

/// How many nested requests for the interrupts-enabled window are
/// outstanding. The kernel's only mutual-exclusion mechanism: trap handlers
/// run with interrupts masked and this counter makes nested mask/unmask
/// pairs compose.
static STI_COUNT: AtomicI32 = AtomicI32::new(0);

/// Enter an interrupts-enabled window; actually unmasks on the 0 -> 1
/// transition. Misuse is logged and ignored rather than escalated.
pub fn sti_push() {
    let count = STI_COUNT.load(Ordering::SeqCst);
    if count < 0 {
        log::error!("sti_push with negative count {}", count);
        return;
    }
    if STI_COUNT.fetch_add(1, Ordering::SeqCst) == 0 {
        arch::interrupts_enable();
    }
}

/// Leave an interrupts-enabled window; masks again on the 1 -> 0 transition.
pub fn sti_pop() {
    let count = STI_COUNT.load(Ordering::SeqCst);
    if count <= 0 {
        log::error!("sti_pop with count already {}", count);
        return;
    }
    if STI_COUNT.fetch_sub(1, Ordering::SeqCst) == 1 {
        arch::interrupts_disable();
    }
}

/// Current nesting depth; diagnostics only.
pub fn sti_depth() -> i32 {
    STI_COUNT.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::recorder;
    use core::sync::atomic::AtomicUsize;

    struct CountingInterrupt {
        hits: AtomicUsize,
    }

    impl InterruptHandler for CountingInterrupt {
        fn handle(&self, _vector: usize, frame: &mut TrapFrame) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            frame.eax = 0x77;
        }
    }

    struct FixedSyscall(u32);

    impl SyscallHandler for FixedSyscall {
        fn handle(&self, _frame: &mut TrapFrame) -> KernelResult<u32> {
            Ok(self.0)
        }
    }

    #[test]
    fn registration_rejects_out_of_range_slots() {
        let mut interrupts = InterruptTable::new();
        let mut syscalls = SyscallTable::new();
        assert_eq!(
            interrupts.register(
                INTERRUPT_COUNT,
                Arc::new(CountingInterrupt {
                    hits: AtomicUsize::new(0)
                })
            ),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            syscalls.register(SYSCALL_COUNT, Arc::new(FixedSyscall(0))),
            Err(KernelError::InvalidArgument)
        );
    }

    #[test]
    #[should_panic(expected = "already in use")]
    fn double_syscall_registration_is_fatal() {
        let mut syscalls = SyscallTable::new();
        syscalls.register(5, Arc::new(FixedSyscall(1))).unwrap();
        let _ = syscalls.register(5, Arc::new(FixedSyscall(2)));
    }

    #[test]
    fn registered_interrupt_handlers_run() {
        let mut table = InterruptTable::new();
        let handler = Arc::new(CountingInterrupt {
            hits: AtomicUsize::new(0),
        });
        table.register(0x21, handler.clone()).unwrap();

        let mut frame = TrapFrame::default();
        table.handler(0x21).unwrap().handle(0x21, &mut frame);
        assert_eq!(handler.hits.load(Ordering::SeqCst), 1);
        assert_eq!(frame.eax, 0x77);
        assert!(table.handler(0x22).is_none());
    }

    #[test]
    fn unhandled_vector_acks_the_pic() {
        recorder::reset();
        // Vector far above anything the tests register globally.
        let mut frame = TrapFrame::default();
        handle_interrupt(0x1F0, &mut frame);
        assert_eq!(recorder::snapshot().pic_acks, 1);
    }

    #[test]
    fn sti_counter_enables_on_first_push_and_disables_on_last_pop() {
        let _guard = crate::testutil::kernel_lock();
        while sti_depth() > 0 {
            sti_pop();
        }
        recorder::reset();

        sti_push();
        assert!(recorder::snapshot().interrupts_enabled);
        assert_eq!(sti_depth(), 1);

        sti_push();
        assert_eq!(sti_depth(), 2);

        sti_pop();
        // Still inside the outer window.
        assert!(recorder::snapshot().interrupts_enabled);

        sti_pop();
        assert!(!recorder::snapshot().interrupts_enabled);
        assert_eq!(sti_depth(), 0);

        // Underflow is logged, not fatal, and the count stays put.
        sti_pop();
        assert_eq!(sti_depth(), 0);
    }

    #[test]
    fn trap_frame_converts_to_a_snapshot() {
        let frame = TrapFrame {
            eax: 1,
            ebx: 2,
            esp: 0x083F_F000,
            eip: 0x0840_0000,
            cs: 0x1B,
            ss: 0x23,
            reserved_esp: 0xDEAD,
            ..TrapFrame::default()
        };
        let regs = frame.registers();
        assert_eq!(regs.eax, 1);
        assert_eq!(regs.ebx, 2);
        assert_eq!(regs.esp, 0x083F_F000);
        // The pushad esp slot is noise and must not leak into the snapshot.
        assert_eq!(regs.eip, 0x0840_0000);
    }
}
