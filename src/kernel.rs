//! Kernel — top-level RTOS object
//!
//! Owns the heap arena, the task table, the time source and the port that
//! performs the actual register save/restore. Tasks receive a `&Kernel` and
//! suspend only by calling [`Kernel::yield_now`], directly or through
//! `sleep`, `lock` and the queue `*_wait` calls.
//!
//! The heap and the task table sit behind spin locks only so the kernel can
//! be shared; under cooperative scheduling they are never contended. No
//! kernel call yields while holding either lock, and task code must not
//! yield from inside [`Kernel::with_heap`].
//!
//! Author: Moroya Sakamoto

use log::{debug, error, trace, warn};
use spin::Mutex;

use crate::config::{KernelConfig, ARENA_SIZE};
use crate::context::EntryPoint;
use crate::error::{Fault, KernelError, Status};
use crate::heap::{Heap, HeapPtr, HeapStats};
use crate::port::{self, Port};
use crate::scheduler::{Scheduler, Switch};
use crate::task::{Task, TaskFn, TaskId};
use crate::time::{Tick, TimeSource};

/// Kernel instance
///
/// Memory footprint is dominated by the arena (`ARENA_SIZE`).
pub struct Kernel {
    pub(crate) heap: Mutex<Heap<ARENA_SIZE>>,
    pub(crate) scheduler: Mutex<Scheduler>,
    clock: &'static dyn TimeSource,
    config: KernelConfig,
    pub(crate) port: Port,
}

impl Kernel {
    /// Create kernel; nothing is formatted until [`init`](Self::init)
    pub const fn new(clock: &'static dyn TimeSource, config: KernelConfig) -> Self {
        Self {
            heap: Mutex::new(Heap::new()),
            scheduler: Mutex::new(Scheduler::new()),
            clock,
            config,
            port: Port::new(),
        }
    }

    /// Heap and scheduler initialisation
    pub fn init(&self) -> Status {
        match self.init_heap() {
            Status::Ok => self.init_scheduler(),
            status => status,
        }
    }

    /// Format the arena. Outstanding allocations become invalid.
    pub fn init_heap(&self) -> Status {
        self.heap.lock().init()
    }

    /// Clear the task table and put the switch trigger at the lowest
    /// interrupt priority
    pub fn init_scheduler(&self) -> Status {
        self.scheduler.lock().reset();
        self.port.init();
        debug!("kernel: scheduler ready");
        Status::Ok
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> &'static dyn TimeSource {
        self.clock
    }

    /// Current tick
    pub fn now(&self) -> Tick {
        self.clock.now()
    }

    /// Allocate from the kernel heap
    pub fn malloc(&self, size: usize) -> Option<HeapPtr> {
        self.heap.lock().malloc(size)
    }

    /// Release a kernel heap allocation. Not checked: see [`Heap::free`].
    pub fn free(&self, ptr: HeapPtr) {
        self.heap.lock().free(ptr)
    }

    /// Run `f` with the heap locked. Must not yield.
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<ARENA_SIZE>) -> R) -> R {
        f(&mut self.heap.lock())
    }

    /// Register a task named `"task"`
    pub fn create_task(&self, handler: TaskFn, arg: usize, stack_size: usize) -> TaskId {
        self.create_named_task(b"task", handler, arg, stack_size)
    }

    /// Register a task.
    ///
    /// While every slot is taken this yields until one frees up. Called from
    /// a context where no other task can ever return (before `start`, or
    /// from the only running task with a full table) it never comes back.
    /// A stack that cannot be allocated, is misaligned or is smaller than
    /// [`MIN_STACK_SIZE`](crate::config::MIN_STACK_SIZE) halts the kernel.
    pub fn create_named_task(
        &self,
        name: &[u8],
        handler: TaskFn,
        arg: usize,
        stack_size: usize,
    ) -> TaskId {
        let mut waited = false;
        loop {
            let result = {
                let mut heap = self.heap.lock();
                let mut scheduler = self.scheduler.lock();
                scheduler.spawn(&mut heap, name, handler, arg, stack_size, |id| {
                    self.entry_point(id)
                })
            };
            match result {
                Ok(id) => return id,
                Err(KernelError::Fatal(fault)) => self.halt(fault),
                Err(_) => {
                    if !waited {
                        warn!("kernel: task table full, waiting for a free slot");
                        waited = true;
                    }
                    self.yield_now();
                }
            }
        }
    }

    /// Registers a new task's initial frame resumes with
    fn entry_point(&self, id: TaskId) -> EntryPoint {
        EntryPoint {
            pc: port::trampoline_address(),
            r0: self as *const Kernel as usize,
            r1: id.index(),
        }
    }

    /// Give up the CPU until the round-robin comes back to this task.
    /// Returns at once when no other task is pending, or before `start`.
    pub fn yield_now(&self) {
        self.port.request_switch(self);
    }

    /// Portable half of the switch: validate, count, pick the next task
    pub(crate) fn switch_from(&self, saved_sp: usize) -> Result<Switch, Fault> {
        let mut heap = self.heap.lock();
        let mut scheduler = self.scheduler.lock();
        let switch = scheduler.switch(&mut heap, saved_sp)?;
        if self.config.trace_switches {
            trace!(
                "kernel: switch #{} {:?} -> {:?}",
                scheduler.context_switches,
                switch.from,
                switch.to
            );
        }
        Ok(switch)
    }

    /// Body of every task: run the handler once, then free the slot and
    /// yield away for good
    pub(crate) fn run_task(&self, id: TaskId) {
        let entry = self.scheduler.lock().entry_of(id);
        if let Some((handler, arg)) = entry {
            handler(self, arg);
        }
        self.scheduler.lock().retire_current();
        self.port.on_task_exit(id);
        self.yield_now();
    }

    /// Stop the system. Never returns.
    pub fn halt(&self, fault: Fault) -> ! {
        error!("kernel: halted: {}", fault);
        self.port.halt(fault)
    }

    /// Task running right now
    pub fn current_task(&self) -> Option<TaskId> {
        self.scheduler.lock().current()
    }

    /// Snapshot of a task slot
    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.scheduler.lock().get_task(id).copied()
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.lock().stats()
    }

    pub fn stats(&self) -> KernelStats {
        let (context_switches, live_tasks, current) = {
            let scheduler = self.scheduler.lock();
            (
                scheduler.context_switches,
                scheduler.live_tasks(),
                scheduler.current(),
            )
        };
        KernelStats {
            uptime_ms: self.now(),
            context_switches,
            live_tasks,
            current,
            heap: self.heap_stats(),
        }
    }

    /// Memory footprint estimate
    pub fn memory_footprint(&self) -> usize {
        core::mem::size_of::<Self>()
    }
}

/// Kernel statistics snapshot
#[derive(Debug, Clone)]
pub struct KernelStats {
    /// Current tick (ms, wrapping)
    pub uptime_ms: Tick,
    /// Passes through the switch routine
    pub context_switches: u32,
    /// Non-free task slots
    pub live_tasks: usize,
    pub current: Option<TaskId>,
    pub heap: HeapStats,
}

#[cfg(test)]
pub(crate) fn boot(clock: &'static dyn TimeSource, config: KernelConfig) -> &'static Kernel {
    let kernel: &'static Kernel = Box::leak(Box::new(Kernel::new(clock, config)));
    assert_eq!(kernel.init(), Status::Ok);
    kernel
}
