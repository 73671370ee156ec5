//! coop-rtos — cooperative single-core RTOS kernel
//!
//! Tasks run until they yield. Everything a task can block on is a loop
//! around `yield_now`:
//! - Best-fit arena heap with block splitting and coalescing
//! - Round-robin task table, stacks carved from the heap, guard-word checks
//! - Lock and sleep with wrapping millisecond timeouts
//! - Bounded queues of fixed-size elements, stored in the heap
//!
//! Context switching is delegated to a port: PendSV on Cortex-M, OS threads
//! on a host (`std`).
//!
//! Author: Moroya Sakamoto

#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod config;
pub mod error;
pub mod heap;
pub mod time;
pub mod task;
pub mod context;
pub mod scheduler;
pub mod sync;
pub mod queue;
pub mod kernel;
mod port;

#[cfg(feature = "python")]
mod python;

pub use config::{KernelConfig, LockPolicy, ARENA_SIZE, MAX_TASKS, MIN_STACK_SIZE};
pub use error::{Fault, KernelError, KernelResult, Status};
pub use heap::{BlockInfo, Heap, HeapPtr, HeapStats};
pub use time::{Deadline, SysTimer, Tick, TimeSource, FOREVER};
#[cfg(any(test, feature = "std"))]
pub use time::HostClock;
pub use task::{Task, TaskFn, TaskId, TaskState};
pub use scheduler::Scheduler;
pub use sync::{LockFlag, LockState};
pub use queue::{Queue, QueueHandle};
pub use kernel::{Kernel, KernelStats};
