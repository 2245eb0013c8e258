//! Cooperative task scheduling.
//!
//! Tasks live in a fixed arena; the run queue is a doubly linked list woven
//! through the arena with indices, appended on creation, unlinked on free.
//! Control only ever moves between tasks at explicit points (syscall exit,
//! wait, exception), so the policy is a plain head-first scan for a `Ready`
//! task and the mechanism is a register-snapshot restore that does not
//! return.

pub mod context;
pub mod task;

use crate::interrupts::TrapFrame;
use crate::memory::paging::AddressSpace;
use crate::process::{self, Pid, MAX_PROCS};
use crate::status::{KernelError, KernelResult};
use context::Registers;
use lazy_static::lazy_static;
use spin::Mutex;
pub use task::{Task, TaskId, TaskState};

/// One task per process slot.
pub const MAX_TASKS: usize = MAX_PROCS;

/// The task arena plus the run queue threaded through it.
pub struct TaskTable {
    slots: [Option<Task>; MAX_TASKS],
    head: Option<TaskId>,
    tail: Option<TaskId>,
    current: Option<TaskId>,
}

impl TaskTable {
    pub fn new() -> Self {
        const EMPTY: Option<Task> = None;
        TaskTable {
            slots: [EMPTY; MAX_TASKS],
            head: None,
            tail: None,
            current: None,
        }
    }

    /// Create a task for `process` and append it to the run queue. Takes
    /// ownership of the address space; on failure the space is released
    /// before the error surfaces.
    pub fn create(
        &mut self,
        process: Pid,
        space: AddressSpace,
        registers: Registers,
        frames: &mut crate::memory::phys::FrameAllocator,
    ) -> KernelResult<TaskId> {
        let Some(slot) = self.slots.iter().position(Option::is_none) else {
            space.free(frames);
            return Err(KernelError::OutOfProcesses);
        };
        let id = TaskId(slot);
        self.slots[slot] = Some(Task {
            space,
            state: TaskState::Ready,
            registers,
            process,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.slots[tail.0].as_mut().unwrap().next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        Ok(id)
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current
    }

    pub fn first(&self) -> Option<TaskId> {
        self.head
    }

    pub fn mark_dead(&mut self, id: TaskId) {
        if let Some(task) = self.get_mut(id) {
            task.state = TaskState::Dead;
        }
    }

    /// Head-first scan for the next runnable task. Pure policy; switching is
    /// someone else's job.
    pub fn pick_next_ready(&self) -> Option<TaskId> {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let task = self.get(id)?;
            if task.state == TaskState::Ready {
                return Some(id);
            }
            cursor = task.next;
        }
        None
    }

    /// Make `id` the running task: demote a still-running predecessor to
    /// `Ready`, install the task's address space, record it as current.
    /// Returns the owning process so the caller can record the new current
    /// process as well.
    pub fn switch(&mut self, id: TaskId) -> Pid {
        if let Some(previous) = self.current {
            if previous != id {
                if let Some(task) = self.get_mut(previous) {
                    // Only a still-running task is demoted; exit or a
                    // blocking call may already have moved the state on.
                    if task.state == TaskState::Running {
                        task.state = TaskState::Ready;
                    }
                }
            }
        }
        let task = self.get_mut(id).expect("switching to a task that does not exist");
        task.state = TaskState::Running;
        task.space.switch();
        let process = task.process;
        self.current = Some(id);
        process
    }

    /// Copy the trapped register state into the current task's snapshot.
    pub fn save_current_state(&mut self, frame: &TrapFrame) {
        let id = self.current.expect("state save with no current task");
        let task = self.get_mut(id).expect("current task vanished");
        task.registers = frame.registers();
    }

    /// Stash a syscall result where the task will see it on resume.
    pub fn set_current_return_value(&mut self, value: u32) {
        let id = self.current.expect("return value with no current task");
        let task = self.get_mut(id).expect("current task vanished");
        task.registers.eax = value;
    }

    pub fn registers_of(&self, id: TaskId) -> Registers {
        self.get(id).expect("task does not exist").registers
    }

    /// Remove a dead task: unlink it from the run queue and release its
    /// address space. Freeing a live task is a programming error; the
    /// caller must guarantee the CPU is not inside this task.
    pub fn free(&mut self, id: TaskId, frames: &mut crate::memory::phys::FrameAllocator) {
        let task = self.slots[id.0].take().expect("freeing a task that does not exist");
        if task.state != TaskState::Dead {
            panic!("trying to free a task that is not dead");
        }
        if let Some(prev) = task.prev {
            self.slots[prev.0].as_mut().unwrap().next = task.next;
        }
        if let Some(next) = task.next {
            self.slots[next.0].as_mut().unwrap().prev = task.prev;
        }
        if self.head == Some(id) {
            self.head = task.next;
        }
        if self.tail == Some(id) {
            self.tail = task.prev;
        }
        if self.current == Some(id) {
            self.current = None;
        }
        task.space.free(frames);
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref TASKS: Mutex<TaskTable> = Mutex::new(TaskTable::new());
}

/// Run `f` with the global task table.
pub fn with_tasks<R>(f: impl FnOnce(&mut TaskTable) -> R) -> R {
    f(&mut TASKS.lock())
}

pub fn current_task_id() -> Option<TaskId> {
    TASKS.lock().current()
}

/// Save the trapping task's registers; the first thing the syscall path does.
pub fn save_current_state(frame: &TrapFrame) {
    TASKS.lock().save_current_state(frame);
}

pub fn set_current_return_value(value: u32) {
    TASKS.lock().set_current_return_value(value);
}

/// Switch to `id` without transferring control (the trap return will do
/// that). Also records the owning process as current.
pub fn switch_to(id: TaskId) {
    process::with_table(|procs| {
        let pid = TASKS.lock().switch(id);
        procs.set_current(pid);
    });
}

/// Switch to `id` and resume it on the CPU. Never returns.
///
/// Switching into a non-ready task is a programming error, not a runtime
/// condition, and halts the kernel.
pub fn switch_and_run(id: TaskId) -> ! {
    let registers = process::with_table(|procs| {
        let mut tasks = TASKS.lock();
        match tasks.get(id) {
            Some(task) if task.state == TaskState::Ready => {}
            _ => panic!("can't switch to a non-ready task"),
        }
        let pid = tasks.switch(id);
        procs.set_current(pid);
        tasks.registers_of(id)
    });
    // All locks dropped; the snapshot is a copy.
    context::restore(&registers)
}

/// Run the first `Ready` task in queue order. With interrupts masked on a
/// single CPU, finding none means nothing can ever run again: a deadlock,
/// reported as such.
pub fn switch_and_run_any() -> ! {
    match TASKS.lock().pick_next_ready() {
        Some(id) => switch_and_run(id),
        None => panic!("deadlock: no ready task to run"),
    }
}

/// Bootstrap: run the first task ever created, with its process recorded as
/// its own parent. Called exactly once at kernel startup.
pub fn run_init_task() -> ! {
    let first = TASKS
        .lock()
        .first()
        .expect("can't start the init task: no task exists");
    let pid = TASKS.lock().get(first).expect("init task vanished").process;
    process::set_parent(pid, pid);
    switch_and_run(first)
}
