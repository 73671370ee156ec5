//! Round-robin scheduler
//!
//! Portable half of the context switch: the port saves registers and hands
//! over the saved stack pointer, the scheduler validates the departing
//! task's stack, picks the next `Pending` slot after the current one, and
//! returns the stack pointer to restore. No priorities, no time slices.
//!
//! Author: Moroya Sakamoto

use log::debug;

use crate::config::{ALIGNMENT, MAX_TASKS, MIN_STACK_SIZE};
use crate::context::{self, EntryPoint};
use crate::error::{Fault, KernelError, KernelResult};
use crate::heap::Heap;
use crate::task::{Task, TaskFn, TaskId, TaskState};

/// Result of one pass of the switch routine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    /// Task that was running, if any
    pub from: Option<TaskId>,
    /// Task to resume, `None` when every slot is free
    pub to: Option<TaskId>,
    /// The departing task had returned and its stack was released
    pub retired: bool,
    /// Stack pointer to restore (arena offset)
    pub sp: usize,
}

/// Round-robin scheduler
///
/// Static task table, stacks come from the kernel heap.
pub struct Scheduler {
    /// Static task table
    tasks: [Task; MAX_TASKS],
    /// Slot currently `Active`
    current: Option<usize>,
    /// Total passes through the switch routine
    pub context_switches: u32,
}

impl Scheduler {
    /// Create empty scheduler
    pub const fn new() -> Self {
        Self {
            tasks: [Task::empty(); MAX_TASKS],
            current: None,
            context_switches: 0,
        }
    }

    /// Forget every task
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// First reusable slot. A slot whose task returned but whose stack is
    /// still awaiting release does not count.
    pub fn free_slot(&self) -> Option<usize> {
        self.tasks
            .iter()
            .position(|t| t.state == TaskState::Free && t.stack.is_none())
    }

    /// Fill a free slot: allocate the stack, write the guard word and the
    /// initial frame built from `entry(slot)`.
    ///
    /// `Err(Busy)` when the table is full; every other failure is fatal.
    pub fn spawn<const N: usize>(
        &mut self,
        heap: &mut Heap<N>,
        name: &[u8],
        handler: TaskFn,
        arg: usize,
        stack_size: usize,
        entry: impl FnOnce(TaskId) -> EntryPoint,
    ) -> KernelResult<TaskId> {
        let slot = self.free_slot().ok_or(KernelError::Busy)?;
        if stack_size < MIN_STACK_SIZE {
            return Err(Fault::StackTooSmall {
                size: stack_size,
                min: MIN_STACK_SIZE,
            }
            .into());
        }
        let stack = heap
            .malloc(stack_size)
            .ok_or(Fault::StackAllocFailed { size: stack_size })?;
        let base_addr = heap.address_of(stack.offset());
        if base_addr % ALIGNMENT != 0 {
            heap.free(stack);
            return Err(Fault::StackMisaligned { addr: base_addr }.into());
        }

        let id = TaskId(slot);
        context::write_guard(heap, stack);
        let frame = context::write_initial_frame(heap, stack, stack_size, entry(id));
        self.tasks[slot] = Task::new(name, handler, arg, stack, stack_size, frame);
        debug!(
            "sched: task {} ({}) in slot {}, {} byte stack at {:#x}",
            id,
            self.tasks[slot].name(),
            slot,
            stack_size,
            stack.offset()
        );
        Ok(id)
    }

    /// Promote the first pending slot to `Active` without any context to
    /// save. Used once, to bootstrap.
    pub fn start_first(&mut self) -> Result<TaskId, Fault> {
        let slot = self
            .tasks
            .iter()
            .position(|t| t.state == TaskState::Pending)
            .ok_or(Fault::NoRunnableTask)?;
        self.activate(slot);
        Ok(TaskId(slot))
    }

    /// The switch routine.
    ///
    /// Stores `saved_sp` for the departing task and validates it, demotes
    /// that task to `Pending`, then scans the table starting after it
    /// (wrapping, the departing task comes last) for the next `Pending`
    /// slot. A departing task that already returned is not validated; its
    /// stack goes back to the heap instead.
    pub fn switch<const N: usize>(
        &mut self,
        heap: &mut Heap<N>,
        saved_sp: usize,
    ) -> Result<Switch, Fault> {
        let from = self.current;
        let mut retired = false;
        if let Some(cur) = from {
            let task = &mut self.tasks[cur];
            if task.state == TaskState::Free {
                if let Some(stack) = task.stack.take() {
                    heap.free(stack);
                }
                retired = true;
            } else {
                task.context.sp = saved_sp;
                if let Some(stack) = task.stack {
                    context::check_stack(heap, TaskId(cur), stack, saved_sp)?;
                }
                task.state = TaskState::Pending;
            }
        }

        self.context_switches = self.context_switches.wrapping_add(1);

        let start = from.map_or(0, |cur| cur + 1);
        let next = (0..MAX_TASKS)
            .map(|i| (start + i) % MAX_TASKS)
            .find(|&i| self.tasks[i].state == TaskState::Pending);

        match next {
            Some(slot) => {
                self.activate(slot);
                Ok(Switch {
                    from: from.map(TaskId),
                    to: Some(TaskId(slot)),
                    retired,
                    sp: self.tasks[slot].context.sp,
                })
            }
            None => {
                self.current = None;
                Ok(Switch {
                    from: from.map(TaskId),
                    to: None,
                    retired,
                    sp: 0,
                })
            }
        }
    }

    /// Mark the active task finished. Its stack is released on the switch
    /// away from it.
    pub fn retire_current(&mut self) -> Option<TaskId> {
        let cur = self.current?;
        let task = &mut self.tasks[cur];
        task.state = TaskState::Free;
        task.handler = None;
        debug!("sched: task {} ({}) returned", cur, task.name());
        Some(TaskId(cur))
    }

    fn activate(&mut self, slot: usize) {
        let task = &mut self.tasks[slot];
        task.state = TaskState::Active;
        task.dispatches = task.dispatches.wrapping_add(1);
        self.current = Some(slot);
    }

    pub fn current(&self) -> Option<TaskId> {
        self.current.map(TaskId)
    }

    /// Handler and argument of a live task
    pub fn entry_of(&self, id: TaskId) -> Option<(TaskFn, usize)> {
        let task = self.tasks.get(id.0)?;
        task.handler.map(|handler| (handler, task.arg))
    }

    /// Get task by id
    pub fn get_task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id.0)
    }

    /// Number of non-free slots
    pub fn live_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| t.is_live()).count()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ARENA_SIZE, STACK_GUARD};
    use crate::kernel::Kernel;

    fn dummy_task(_kernel: &Kernel, _arg: usize) {}

    fn entry(id: TaskId) -> EntryPoint {
        EntryPoint {
            pc: 0x0800_0101,
            r0: 0x2000_0000,
            r1: id.0,
        }
    }

    fn setup() -> (Scheduler, Heap<ARENA_SIZE>) {
        let mut heap = Heap::new();
        heap.init();
        (Scheduler::new(), heap)
    }

    fn spawn(sched: &mut Scheduler, heap: &mut Heap<ARENA_SIZE>, arg: usize) -> TaskId {
        sched
            .spawn(heap, b"t", dummy_task, arg, 256, entry)
            .expect("spawn")
    }

    /// Yield from the current task with its stored stack pointer
    fn yield_once(sched: &mut Scheduler, heap: &mut Heap<ARENA_SIZE>) -> Switch {
        let sp = sched
            .current()
            .map_or(0, |id| sched.get_task(id).unwrap().saved_sp());
        sched.switch(heap, sp).expect("switch")
    }

    #[test]
    fn test_scheduler_empty() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.live_tasks(), 0);
        assert_eq!(sched.current(), None);
        assert_eq!(sched.start_first(), Err(Fault::NoRunnableTask));
    }

    #[test]
    fn test_spawn_prepares_stack() {
        let (mut sched, mut heap) = setup();
        let id = spawn(&mut sched, &mut heap, 42);
        assert_eq!(id, TaskId(0));

        let task = sched.get_task(id).unwrap();
        assert_eq!(task.state(), TaskState::Pending);
        assert_eq!(task.arg(), 42);
        let base = task.stack_base().unwrap();
        assert_eq!(heap.read_u32(base), STACK_GUARD);
        assert_eq!(task.saved_sp(), base + 256 - context::INITIAL_FRAME_SIZE);
        // r1 of the initial frame carries the slot
        assert_eq!(heap.read_u32(task.saved_sp() + 40), 0);
    }

    #[test]
    fn test_table_full_is_busy() {
        let (mut sched, mut heap) = setup();
        for i in 0..MAX_TASKS {
            assert_eq!(spawn(&mut sched, &mut heap, i), TaskId(i));
        }
        let result = sched.spawn(&mut heap, b"t", dummy_task, 0, 256, entry);
        assert_eq!(result, Err(KernelError::Busy));
    }

    #[test]
    fn test_small_stack_is_fatal() {
        let (mut sched, mut heap) = setup();
        let result = sched.spawn(&mut heap, b"t", dummy_task, 0, 16, entry);
        assert_eq!(
            result,
            Err(KernelError::Fatal(Fault::StackTooSmall {
                size: 16,
                min: MIN_STACK_SIZE
            }))
        );
    }

    #[test]
    fn test_stack_alloc_failure_is_fatal() {
        let (mut sched, mut heap) = setup();
        let result = sched.spawn(&mut heap, b"t", dummy_task, 0, ARENA_SIZE * 2, entry);
        assert_eq!(
            result,
            Err(KernelError::Fatal(Fault::StackAllocFailed {
                size: ARENA_SIZE * 2
            }))
        );
        assert_eq!(sched.live_tasks(), 0);
    }

    #[test]
    fn test_round_robin_fairness() {
        let (mut sched, mut heap) = setup();
        for i in 0..3 {
            spawn(&mut sched, &mut heap, i);
        }
        assert_eq!(sched.start_first(), Ok(TaskId(0)));

        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(yield_once(&mut sched, &mut heap).to.unwrap().0);
        }
        assert_eq!(order, vec![1, 2, 0, 1, 2, 0]);
        assert_eq!(sched.context_switches, 6);
        let dispatches: Vec<_> = (0..3)
            .map(|i| sched.get_task(TaskId(i)).unwrap().dispatches())
            .collect();
        assert_eq!(dispatches, vec![3, 2, 2]);
    }

    #[test]
    fn test_only_task_reselected() {
        let (mut sched, mut heap) = setup();
        spawn(&mut sched, &mut heap, 0);
        sched.start_first().unwrap();
        let switch = yield_once(&mut sched, &mut heap);
        assert_eq!(switch.from, Some(TaskId(0)));
        assert_eq!(switch.to, Some(TaskId(0)));
        assert_eq!(
            sched.get_task(TaskId(0)).unwrap().state(),
            TaskState::Active
        );
    }

    #[test]
    fn test_skips_free_slots() {
        let (mut sched, mut heap) = setup();
        for i in 0..3 {
            spawn(&mut sched, &mut heap, i);
        }
        sched.start_first().unwrap();
        // Task 0 returns; slot 1 runs next, then 2, then 1 again
        sched.retire_current();
        assert_eq!(yield_once(&mut sched, &mut heap).to, Some(TaskId(1)));
        assert_eq!(yield_once(&mut sched, &mut heap).to, Some(TaskId(2)));
        assert_eq!(yield_once(&mut sched, &mut heap).to, Some(TaskId(1)));
    }

    #[test]
    fn test_retired_slot_reclaimed_and_reused() {
        let (mut sched, mut heap) = setup();
        let free_before = heap.stats().free;
        spawn(&mut sched, &mut heap, 0);
        spawn(&mut sched, &mut heap, 1);
        sched.start_first().unwrap();

        assert_eq!(sched.retire_current(), Some(TaskId(0)));
        // Not reusable until the switch away releases the stack
        assert_eq!(sched.free_slot(), Some(2));
        let switch = yield_once(&mut sched, &mut heap);
        assert!(switch.retired);
        assert_eq!(switch.to, Some(TaskId(1)));
        assert_eq!(sched.free_slot(), Some(0));

        let again = spawn(&mut sched, &mut heap, 9);
        assert_eq!(again, TaskId(0));
        sched.get_task(TaskId(1)).unwrap();
        assert!(heap.check());

        // Once everything returns the heap is whole again
        sched.retire_current();
        yield_once(&mut sched, &mut heap);
        sched.retire_current();
        let last = yield_once(&mut sched, &mut heap);
        assert_eq!(last.to, None);
        assert_eq!(heap.stats().free, free_before);
    }

    #[test]
    fn test_guard_corruption_is_fatal() {
        let (mut sched, mut heap) = setup();
        spawn(&mut sched, &mut heap, 0);
        spawn(&mut sched, &mut heap, 1);
        sched.start_first().unwrap();

        let task = *sched.get_task(TaskId(0)).unwrap();
        heap.write_u32(task.stack_base().unwrap(), 0);
        let result = sched.switch(&mut heap, task.saved_sp());
        assert_eq!(
            result,
            Err(Fault::GuardCorrupted {
                task: TaskId(0),
                found: 0
            })
        );
        assert_eq!(sched.context_switches, 0);
    }

    #[test]
    fn test_stack_pointer_below_base_is_fatal() {
        let (mut sched, mut heap) = setup();
        spawn(&mut sched, &mut heap, 0);
        sched.start_first().unwrap();

        let base = sched.get_task(TaskId(0)).unwrap().stack_base().unwrap();
        let result = sched.switch(&mut heap, base - 8);
        assert_eq!(
            result,
            Err(Fault::StackOverflow {
                task: TaskId(0),
                sp: base - 8,
                base
            })
        );
    }

    #[test]
    fn test_entry_of() {
        let (mut sched, mut heap) = setup();
        let id = spawn(&mut sched, &mut heap, 5);
        let (_, arg) = sched.entry_of(id).unwrap();
        assert_eq!(arg, 5);
        assert!(sched.entry_of(TaskId(3)).is_none());
        assert!(sched.entry_of(TaskId(MAX_TASKS)).is_none());
    }
}
