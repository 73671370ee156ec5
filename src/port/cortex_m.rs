//! Cortex-M port — PendSV context switch (ARMv7-M / ARMv7E-M)
//!
//! `yield_now` pends PendSV, which runs at the lowest priority, so the
//! switch happens only once every other handler has returned. The handler
//! pushes r4–r11 and EXC_RETURN (plus s16–s31 when the task has an active
//! FP context) onto the process stack, calls the portable switch routine,
//! then pops the chosen task's frame and returns into it.
//!
//! The vector table must route PendSV to the `PendSV` symbol defined here
//! (the name cortex-m-rt uses).
//!
//! Author: Moroya Sakamoto

use core::arch::{asm, global_asm};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::context::stack_top;
use crate::error::Fault;
use crate::kernel::Kernel;
use crate::port::task_trampoline;
use crate::task::TaskId;

/// Interrupt control and state register
const SCB_ICSR: *mut u32 = 0xE000_ED04 as *mut u32;
const ICSR_PENDSVSET: u32 = 1 << 28;
/// System handler priority register 3 (PendSV in bits 23:16)
const SCB_SHPR3: *mut u32 = 0xE000_ED20 as *mut u32;
const SHPR3_PENDSV_LOWEST: u32 = 0xFF << 16;

/// Kernel the PendSV handler switches for, set by `start`
static KERNEL: AtomicPtr<Kernel> = AtomicPtr::new(ptr::null_mut());

pub(crate) struct Port;

impl Port {
    pub(crate) const fn new() -> Self {
        Port
    }

    /// PendSV at the lowest priority
    pub(crate) fn init(&self) {
        // SAFETY: SHPR3 is an always-present System Control Block register;
        // only the PendSV byte is changed.
        unsafe {
            let shpr3 = ptr::read_volatile(SCB_SHPR3);
            ptr::write_volatile(SCB_SHPR3, shpr3 | SHPR3_PENDSV_LOWEST);
        }
    }

    pub(crate) fn request_switch(&self, kernel: &Kernel) {
        if kernel.scheduler.lock().current().is_none() {
            return;
        }
        // SAFETY: writing PENDSVSET only pends the exception; other ICSR
        // write bits are ignored when zero.
        unsafe {
            ptr::write_volatile(SCB_ICSR, ICSR_PENDSVSET);
            asm!("dsb", "isb", options(nostack, preserves_flags));
        }
    }

    pub(crate) fn on_task_exit(&self, _id: TaskId) {}

    pub(crate) fn halt(&self, _fault: Fault) -> ! {
        // SAFETY: masking interrupts has no memory effects.
        unsafe {
            asm!("cpsid i", options(nomem, nostack, preserves_flags));
        }
        loop {
            core::hint::spin_loop();
        }
    }
}

impl Kernel {
    /// Run the first pending task on its own stack. Never returns.
    ///
    /// There is no previous context to save, so this loads PSP with the top
    /// of the task's stack, switches thread mode onto PSP and calls the
    /// trampoline directly.
    pub fn start(&'static self) -> ! {
        KERNEL.store(self as *const Kernel as *mut Kernel, Ordering::Release);

        let first = match self.scheduler.lock().start_first() {
            Ok(id) => id,
            Err(fault) => self.halt(fault),
        };
        let top = {
            let scheduler = self.scheduler.lock();
            let heap = self.heap.lock();
            scheduler
                .get_task(first)
                .and_then(|t| t.stack.map(|stack| stack_top(stack, t.stack_size)))
                .map(|top| heap.address_of(top))
        };
        let Some(top) = top else {
            self.halt(Fault::NoRunnableTask)
        };
        log::debug!("cortex-m: starting task {} at psp {:#x}", first, top);

        // SAFETY: `top` is the aligned end of a heap block owned by `first`;
        // nothing else uses that memory. After CONTROL.SPSEL is set the
        // call below runs on the task stack.
        unsafe {
            asm!(
                "msr psp, {top}",
                "msr control, {spsel}",
                "isb",
                "bx {entry}",
                top = in(reg) top,
                spsel = in(reg) 2u32,
                entry = in(reg) task_trampoline as usize,
                in("r0") self as *const Kernel,
                in("r1") first.index(),
                options(noreturn),
            );
        }
    }
}

/// Called from PendSV with the departing task's PSP after the software
/// frame was pushed; returns the PSP to restore.
#[no_mangle]
extern "C" fn coop_rtos_switch(psp: usize) -> usize {
    let kernel = KERNEL.load(Ordering::Acquire);
    if kernel.is_null() {
        return psp;
    }
    // SAFETY: set once in `start` from a `&'static Kernel`.
    let kernel = unsafe { &*kernel };

    // Outside the arena maps to 0, which always fails the stack check
    let saved = kernel.with_heap(|heap| heap.offset_of_address(psp).unwrap_or(0));
    match kernel.switch_from(saved) {
        Ok(switch) if switch.to.is_some() => kernel.with_heap(|heap| heap.address_of(switch.sp)),
        Ok(_) => kernel.halt(Fault::NoRunnableTask),
        Err(fault) => kernel.halt(fault),
    }
}

#[cfg(target_abi = "eabihf")]
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    tst lr, #0x10",
    "    it eq",
    "    vstmdbeq r0!, {{s16-s31}}",
    "    stmdb r0!, {{r4-r11, lr}}",
    "    bl coop_rtos_switch",
    "    ldmia r0!, {{r4-r11, lr}}",
    "    tst lr, #0x10",
    "    it eq",
    "    vldmiaeq r0!, {{s16-s31}}",
    "    msr psp, r0",
    "    bx lr",
);

#[cfg(not(target_abi = "eabihf"))]
global_asm!(
    ".section .text.PendSV,\"ax\",%progbits",
    ".global PendSV",
    ".type PendSV,%function",
    ".thumb_func",
    "PendSV:",
    "    mrs r0, psp",
    "    stmdb r0!, {{r4-r11, lr}}",
    "    bl coop_rtos_switch",
    "    ldmia r0!, {{r4-r11, lr}}",
    "    msr psp, r0",
    "    bx lr",
);
