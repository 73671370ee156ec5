//! Task context — saved stack pointer and the ARMv7-M frame layout
//!
//! A suspended task's registers live on its own stack; the slot only keeps
//! the stack pointer. The switch shim pushes the software frame below the
//! hardware frame the core stacked on exception entry:
//!
//! ```text
//!   high  ┌──────────────┐ ← stack top (8-byte aligned)
//!         │ xpsr         │
//!         │ pc           │
//!         │ lr           │   hardware frame
//!         │ r12, r3..r0  │
//!         ├──────────────┤
//!         │ s31..s16     │   only when EXC_RETURN bit 4 is clear
//!         ├──────────────┤
//!         │ EXC_RETURN   │
//!         │ r11..r4      │   software frame
//!   sp →  ├──────────────┤
//!         │      ...     │
//!         │ guard word   │ ← stack base
//!   low   └──────────────┘
//! ```
//!
//! All offsets here are arena offsets; the port adds the arena address.
//!
//! Author: Moroya Sakamoto

use crate::config::{ALIGNMENT, STACK_GUARD};
use crate::error::Fault;
use crate::heap::{align_down, Heap, HeapPtr};
use crate::task::TaskId;

/// Words pushed by the switch shim: r4–r11 and EXC_RETURN
pub const SOFTWARE_FRAME_WORDS: usize = 9;
/// Extra words for s16–s31 with an active FP context
pub const FP_FRAME_WORDS: usize = 16;
/// Words the core stacks on exception entry: r0–r3, r12, lr, pc, xpsr
pub const HARDWARE_FRAME_WORDS: usize = 8;
/// Bytes of the frame a new task starts from
pub const INITIAL_FRAME_SIZE: usize = (SOFTWARE_FRAME_WORDS + HARDWARE_FRAME_WORDS) * 4;

/// Return to thread mode on the process stack, basic frame
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;
/// EXC_RETURN bit that is clear when an extended FP frame was stacked
const EXC_RETURN_BASIC_FRAME: u32 = 1 << 4;
/// xPSR with only the Thumb bit set
pub const XPSR_THUMB: u32 = 1 << 24;

/// Saved register state of a suspended task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    /// Stack pointer after the software frame was pushed (arena offset)
    pub sp: usize,
}

impl Context {
    pub const fn empty() -> Self {
        Self { sp: 0 }
    }
}

/// Registers a new task starts with
#[derive(Debug, Clone, Copy)]
pub struct EntryPoint {
    /// Trampoline address
    pub pc: usize,
    /// First argument (kernel address)
    pub r0: usize,
    /// Second argument (task slot)
    pub r1: usize,
}

/// Did the core stack s0–s15 (and do we owe s16–s31)?
pub const fn has_fp_frame(exc_return: u32) -> bool {
    exc_return & EXC_RETURN_BASIC_FRAME == 0
}

/// Bytes the shim pushes for a given EXC_RETURN
pub const fn software_frame_size(exc_return: u32) -> usize {
    if has_fp_frame(exc_return) {
        (SOFTWARE_FRAME_WORDS + FP_FRAME_WORDS) * 4
    } else {
        SOFTWARE_FRAME_WORDS * 4
    }
}

/// Aligned top of a stack block
pub fn stack_top(stack: HeapPtr, stack_size: usize) -> usize {
    align_down(stack.offset() + stack_size, ALIGNMENT)
}

/// Write the guard word at the stack base
pub fn write_guard<const N: usize>(heap: &mut Heap<N>, stack: HeapPtr) {
    heap.write_u32(stack.offset(), STACK_GUARD);
}

/// Synthesize the frame a first switch-in restores: execution resumes at
/// `entry.pc` with `r0`/`r1` loaded and every other register zeroed.
pub fn write_initial_frame<const N: usize>(
    heap: &mut Heap<N>,
    stack: HeapPtr,
    stack_size: usize,
    entry: EntryPoint,
) -> Context {
    let top = stack_top(stack, stack_size);
    let hardware = top - HARDWARE_FRAME_WORDS * 4;
    // Registers are 32 bits wide on the target
    let words: [u32; HARDWARE_FRAME_WORDS] = [
        entry.r0 as u32,
        entry.r1 as u32,
        0, // r2
        0, // r3
        0, // r12
        0, // lr, the trampoline never returns
        entry.pc as u32,
        XPSR_THUMB,
    ];
    for (i, word) in words.iter().enumerate() {
        heap.write_u32(hardware + i * 4, *word);
    }

    let software = hardware - SOFTWARE_FRAME_WORDS * 4;
    for i in 0..SOFTWARE_FRAME_WORDS - 1 {
        heap.write_u32(software + i * 4, 0);
    }
    heap.write_u32(
        software + (SOFTWARE_FRAME_WORDS - 1) * 4,
        EXC_RETURN_THREAD_PSP,
    );

    Context { sp: software }
}

/// Validate a saved stack pointer against the stack it belongs to
pub fn check_stack<const N: usize>(
    heap: &Heap<N>,
    task: TaskId,
    stack: HeapPtr,
    sp: usize,
) -> Result<(), Fault> {
    let base = stack.offset();
    if sp <= base {
        return Err(Fault::StackOverflow { task, sp, base });
    }
    let found = heap.read_u32(base);
    if found != STACK_GUARD {
        return Err(Fault::GuardCorrupted { task, found });
    }
    Ok(())
}
