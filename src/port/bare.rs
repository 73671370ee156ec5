//! Bare port — no context-switch backend for this target
//!
//! Heap, queues and the portable scheduler still work; `yield_now` returns
//! immediately and `start` halts.

use crate::error::Fault;
use crate::kernel::Kernel;
use crate::task::TaskId;

pub(crate) struct Port;

impl Port {
    pub(crate) const fn new() -> Self {
        Port
    }

    pub(crate) fn init(&self) {
        log::warn!("bare: no context-switch backend, tasks will not run");
    }

    pub(crate) fn request_switch(&self, _kernel: &Kernel) {}

    pub(crate) fn on_task_exit(&self, _id: TaskId) {}

    pub(crate) fn halt(&self, _fault: Fault) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }
}

impl Kernel {
    pub fn start(&'static self) -> ! {
        self.halt(Fault::NoRunnableTask)
    }
}
