//! Task slot — one cooperatively scheduled unit of execution
//!
//! Slots live in a fixed table inside the scheduler. A slot is `Free` until
//! `create_task` fills it, `Pending` while waiting for its turn, `Active`
//! while it owns the CPU, and becomes `Free` again when its handler returns.
//!
//! Author: Moroya Sakamoto

use core::fmt;

use crate::context::Context;
use crate::heap::HeapPtr;
use crate::kernel::Kernel;

/// Task entry point — called once with the kernel and the task argument
pub type TaskFn = fn(&Kernel, usize);

/// Index of a task slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

impl TaskId {
    pub const fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task execution state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot is empty and may be reused
    Free,
    /// Ready, waiting for its round-robin turn
    Pending,
    /// Currently owns the CPU
    Active,
}

/// Task slot
#[derive(Clone, Copy)]
pub struct Task {
    /// Task name (8 ASCII chars max)
    pub(crate) name: [u8; 8],
    pub(crate) state: TaskState,
    /// Register snapshot from the last switch away
    pub(crate) context: Context,
    pub(crate) handler: Option<TaskFn>,
    pub(crate) arg: usize,
    /// Lowest payload byte of the stack block (guard word lives here)
    pub(crate) stack: Option<HeapPtr>,
    pub(crate) stack_size: usize,
    /// Times this task was switched in
    pub(crate) dispatches: u32,
}

impl Task {
    /// Empty task slot
    pub const fn empty() -> Self {
        Self {
            name: [0u8; 8],
            state: TaskState::Free,
            context: Context::empty(),
            handler: None,
            arg: 0,
            stack: None,
            stack_size: 0,
            dispatches: 0,
        }
    }

    pub(crate) fn new(
        name: &[u8],
        handler: TaskFn,
        arg: usize,
        stack: HeapPtr,
        stack_size: usize,
        context: Context,
    ) -> Self {
        let mut n = [0u8; 8];
        let len = name.len().min(8);
        n[..len].copy_from_slice(&name[..len]);

        Self {
            name: n,
            state: TaskState::Pending,
            context,
            handler: Some(handler),
            arg,
            stack: Some(stack),
            stack_size,
            dispatches: 0,
        }
    }

    /// Is this slot in use?
    pub fn is_live(&self) -> bool {
        self.state != TaskState::Free
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Name up to the first NUL, `"?"` if not UTF-8
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    pub fn arg(&self) -> usize {
        self.arg
    }

    /// Stack base as an arena offset, `None` once reclaimed
    pub fn stack_base(&self) -> Option<usize> {
        self.stack.map(HeapPtr::offset)
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Saved stack pointer (arena offset)
    pub fn saved_sp(&self) -> usize {
        self.context.sp
    }

    pub fn dispatches(&self) -> u32 {
        self.dispatches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_task(_kernel: &Kernel, _arg: usize) {}

    #[test]
    fn test_task_creation() {
        let task = Task::new(
            b"uart_rx",
            dummy_task,
            7,
            HeapPtr::from_raw(16),
            256,
            Context { sp: 200 },
        );
        assert!(task.is_live());
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.name(), "uart_rx");
        assert_eq!(task.arg(), 7);
        assert_eq!(task.stack_base(), Some(16));
        assert_eq!(task.saved_sp(), 200);
    }

    #[test]
    fn test_empty_task() {
        let task = Task::empty();
        assert!(!task.is_live());
        assert_eq!(task.state(), TaskState::Free);
        assert_eq!(task.name(), "");
        assert_eq!(task.stack_base(), None);
    }

    #[test]
    fn test_name_truncated() {
        let task = Task::new(
            b"keypad_scanner",
            dummy_task,
            0,
            HeapPtr::from_raw(16),
            128,
            Context::empty(),
        );
        assert_eq!(task.name(), "keypad_s");
    }

    #[test]
    fn test_task_id_display() {
        assert_eq!(TaskId(3).to_string(), "3");
        assert_eq!(TaskId(3).index(), 3);
    }
}
