//! Kernel status codes and error types

use thiserror::Error;

use crate::task::TaskId;

/// Status taxonomy shared by every kernel call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Unrecoverable; the kernel halts
    Fatal,
    Busy,
    InvalidArgument,
    Retry,
    Timeout,
}

/// Unrecoverable kernel conditions. Never returned to task code: the kernel
/// halts with one of these instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Fault {
    /// Saved stack pointer at or below the task's stack base
    #[error("stack overflow in task {task}: sp {sp:#x} <= base {base:#x}")]
    StackOverflow { task: TaskId, sp: usize, base: usize },

    /// Guard word at the stack base was overwritten
    #[error("stack guard corrupted in task {task}: found {found:#010x}")]
    GuardCorrupted { task: TaskId, found: u32 },

    /// Heap could not supply a task stack
    #[error("no heap block for a {size}-byte stack")]
    StackAllocFailed { size: usize },

    /// Stack memory is not aligned for the context frame
    #[error("stack at {addr:#x} is misaligned")]
    StackMisaligned { addr: usize },

    /// Requested stack cannot hold the guard word and one context frame
    #[error("stack of {size} bytes is below the {min}-byte minimum")]
    StackTooSmall { size: usize, min: usize },

    /// Nothing left to dispatch
    #[error("no runnable task")]
    NoRunnableTask,

    /// A task handler unwound (hosted port only)
    #[error("task {task} aborted")]
    TaskAborted { task: TaskId },
}

/// Recoverable kernel errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("fatal: {0}")]
    Fatal(#[from] Fault),

    #[error("resource busy")]
    Busy,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("try again")]
    Retry,

    #[error("operation timed out")]
    Timeout,
}

impl KernelError {
    /// Collapse to the status taxonomy
    pub fn status(&self) -> Status {
        match self {
            KernelError::Fatal(_) => Status::Fatal,
            KernelError::Busy => Status::Busy,
            KernelError::InvalidArgument => Status::InvalidArgument,
            KernelError::Retry => Status::Retry,
            KernelError::Timeout => Status::Timeout,
        }
    }
}

impl<T> From<&KernelResult<T>> for Status {
    fn from(result: &KernelResult<T>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(KernelError::Timeout.status(), Status::Timeout);
        assert_eq!(KernelError::Busy.status(), Status::Busy);
        assert_eq!(
            KernelError::from(Fault::NoRunnableTask).status(),
            Status::Fatal
        );
    }

    #[test]
    fn test_result_to_status() {
        let ok: KernelResult<u8> = Ok(1);
        let err: KernelResult<u8> = Err(KernelError::Retry);
        assert_eq!(Status::from(&ok), Status::Ok);
        assert_eq!(Status::from(&err), Status::Retry);
    }

    #[test]
    fn test_fault_display() {
        let fault = Fault::GuardCorrupted {
            task: TaskId(2),
            found: 0,
        };
        assert_eq!(
            fault.to_string(),
            "stack guard corrupted in task 2: found 0x00000000"
        );
        let err = KernelError::Fatal(Fault::StackTooSmall { size: 16, min: 80 });
        assert_eq!(
            err.to_string(),
            "fatal: stack of 16 bytes is below the 80-byte minimum"
        );
    }
}
