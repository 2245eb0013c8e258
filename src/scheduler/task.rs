use super::context::Registers;
use crate::memory::paging::AddressSpace;
use crate::process::Pid;

/// Index of a task slot in the task arena. Stable for the task's lifetime;
/// every cross reference to a task is one of these, never a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub usize);

/// Task state machine. `Ready` and `Running` cycle under the cooperative
/// scheduler; `Dead` is terminal and set by process exit, after which only
/// reaping touches the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Blocked,
    Dead,
}

/// The schedulable unit: one per process (single-threaded processes are a
/// stated invariant of this kernel).
pub struct Task {
    /// The task's own address space; kernel tables borrowed, user mappings
    /// private.
    pub space: AddressSpace,
    pub state: TaskState,
    pub registers: Registers,
    /// Owning process.
    pub process: Pid,
    /// Run-queue links, indices into the task arena.
    pub(super) prev: Option<TaskId>,
    pub(super) next: Option<TaskId>,
}
