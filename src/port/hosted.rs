//! Hosted port — tasks on OS threads, one baton
//!
//! Each task gets its own thread the first time it is dispatched, which
//! gives it a real stack to block on. Only the thread whose task holds the
//! baton runs; a switch moves the baton and parks the departing thread on a
//! condition variable until the round-robin comes back to it. The portable
//! switch routine (validation, counting, selection) runs exactly as on
//! hardware; only the register save/restore is replaced by the hand-off.
//!
//! Threads are started by the runner (the caller of [`Kernel::run`]), since
//! only it holds a `'static` kernel reference.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use log::{debug, info, warn};

use crate::config::MAX_TASKS;
use crate::error::{Fault, KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::task::TaskId;

struct Baton {
    /// Task allowed to run
    active: Option<TaskId>,
    /// Slots whose current incarnation already has a thread
    launched: [bool; MAX_TASKS],
    /// Thread the runner should start next
    launch: Option<TaskId>,
    /// Set once: every task returned, or the kernel halted
    outcome: Option<Result<(), Fault>>,
}

pub(crate) struct Port {
    baton: Mutex<Baton>,
    handoff: Condvar,
}

impl Port {
    pub(crate) const fn new() -> Self {
        Self {
            baton: Mutex::new(Baton {
                active: None,
                launched: [false; MAX_TASKS],
                launch: None,
                outcome: None,
            }),
            handoff: Condvar::new(),
        }
    }

    /// No interrupt controller to configure
    pub(crate) fn init(&self) {}

    fn lock(&self) -> MutexGuard<'_, Baton> {
        self.baton.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Baton>) -> MutexGuard<'a, Baton> {
        self.handoff
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn request_switch(&self, kernel: &Kernel) {
        let (me, saved_sp) = {
            let scheduler = kernel.scheduler.lock();
            let Some(me) = scheduler.current() else {
                return;
            };
            let saved_sp = scheduler.get_task(me).map_or(0, |t| t.saved_sp());
            (me, saved_sp)
        };

        let switch = match kernel.switch_from(saved_sp) {
            Ok(switch) => switch,
            Err(fault) => kernel.halt(fault),
        };
        if switch.to == Some(me) {
            return;
        }

        let mut baton = self.lock();
        baton.active = switch.to;
        match switch.to {
            Some(next) if !baton.launched[next.index()] => {
                baton.launched[next.index()] = true;
                baton.launch = Some(next);
            }
            Some(_) => {}
            None => {
                baton.outcome.get_or_insert(Ok(()));
            }
        }
        self.handoff.notify_all();

        // A returned task's thread simply ends
        if switch.retired {
            return;
        }
        while baton.active != Some(me) {
            baton = self.wait(baton);
        }
    }

    pub(crate) fn on_task_exit(&self, id: TaskId) {
        self.lock().launched[id.index()] = false;
    }

    /// Record the fault for the runner and unwind the calling thread
    pub(crate) fn halt(&self, fault: Fault) -> ! {
        self.finish(Err(fault));
        panic!("kernel halted: {}", fault);
    }

    fn finish(&self, outcome: Result<(), Fault>) {
        let mut baton = self.lock();
        baton.outcome.get_or_insert(outcome);
        self.handoff.notify_all();
    }

    fn wait_for_turn(&self, id: TaskId) {
        let mut baton = self.lock();
        while baton.active != Some(id) {
            baton = self.wait(baton);
        }
    }

    fn launch(&self, kernel: &'static Kernel, id: TaskId) {
        let spawned = thread::Builder::new()
            .name(format!("task-{}", id))
            .spawn(move || {
                kernel.port.wait_for_turn(id);
                let result = panic::catch_unwind(AssertUnwindSafe(|| kernel.run_task(id)));
                if result.is_err() {
                    kernel.port.finish(Err(Fault::TaskAborted { task: id }));
                }
            });
        if let Err(err) = spawned {
            warn!("hosted: cannot start thread for task {}: {}", id, err);
            self.finish(Err(Fault::TaskAborted { task: id }));
        }
    }
}

impl Kernel {
    /// Start the first task and drive the system until every task has
    /// returned (`Ok`) or the kernel halted (`Err(Fatal)`).
    pub fn run(&'static self) -> KernelResult<()> {
        let first = self.scheduler.lock().start_first()?;
        debug!("hosted: starting with task {}", first);

        let mut baton = self.port.lock();
        baton.outcome = None;
        baton.active = Some(first);
        baton.launched[first.index()] = true;
        baton.launch = Some(first);
        loop {
            if let Some(outcome) = baton.outcome.take() {
                return outcome.map_err(KernelError::Fatal);
            }
            if let Some(id) = baton.launch.take() {
                // Spawn outside the baton lock
                drop(baton);
                self.port.launch(self, id);
                baton = self.port.lock();
                continue;
            }
            baton = self.port.wait(baton);
        }
    }

    /// Run, then park the calling thread forever
    pub fn start(&'static self) -> ! {
        match self.run() {
            Ok(()) => info!("hosted: all tasks returned"),
            Err(err) => warn!("hosted: stopped: {}", err),
        }
        loop {
            thread::park();
        }
    }
}
