//! Ports — the target-specific half of the context switch
//!
//! Every backend exposes the same `Port` surface:
//!
//! - `new` / `init`: construct, and put the switch trigger at the lowest
//!   interrupt priority
//! - `request_switch`: what `yield_now` does
//! - `on_task_exit`: bookkeeping when a handler returns
//! - `halt`: stop the system after a fault
//!
//! and an `impl Kernel` block with `start`. Exactly one backend is compiled:
//!
//! | backend    | selected by                                             |
//! |------------|---------------------------------------------------------|
//! | `hosted`   | `std` feature or unit tests                             |
//! | `cortex_m` | `cortex-m` feature on `thumbv7*-none-*`                 |
//! | `bare`     | anything else; yielding does nothing                    |
//!
//! Author: Moroya Sakamoto

use crate::kernel::Kernel;
use crate::task::TaskId;

#[cfg(any(test, feature = "std"))]
mod hosted;
#[cfg(any(test, feature = "std"))]
pub(crate) use hosted::Port;

#[cfg(all(
    not(any(test, feature = "std")),
    feature = "cortex-m",
    target_arch = "arm",
    target_os = "none"
))]
mod cortex_m;
#[cfg(all(
    not(any(test, feature = "std")),
    feature = "cortex-m",
    target_arch = "arm",
    target_os = "none"
))]
pub(crate) use cortex_m::Port;

#[cfg(all(
    not(any(test, feature = "std")),
    not(all(feature = "cortex-m", target_arch = "arm", target_os = "none"))
))]
mod bare;
#[cfg(all(
    not(any(test, feature = "std")),
    not(all(feature = "cortex-m", target_arch = "arm", target_os = "none"))
))]
pub(crate) use bare::Port;

/// First code a new task executes, with `r0` = kernel and `r1` = slot.
///
/// Runs the handler, retires the slot and yields. A retired task is never
/// selected again, so the loop is only reached if that invariant broke.
pub(crate) extern "C" fn task_trampoline(kernel: &Kernel, slot: usize) -> ! {
    kernel.run_task(TaskId(slot));
    loop {
        kernel.yield_now();
    }
}

/// Program counter a new task's initial frame resumes at (Thumb bit clear,
/// the core takes it from xPSR)
pub(crate) fn trampoline_address() -> usize {
    task_trampoline as usize & !1
}
