//! Lock and sleep — wait primitives built on `yield_now`
//!
//! Both are polling loops: test the condition, yield, test again. Nothing
//! here is atomic. A [`LockFlag`] is read and then written with two separate
//! accesses, which is sound only because a task cannot be switched out
//! between them; the only suspension point is the yield.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};

use crate::config::LockPolicy;
use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::time::Deadline;

/// Value of a [`LockFlag`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Released,
    Locked,
}

/// Two-valued lock. No owner, no recursion count.
///
/// Backed by an `AtomicBool` only so it can sit in a `static`; it is never
/// compare-and-swapped.
#[derive(Debug)]
pub struct LockFlag {
    locked: AtomicBool,
}

impl LockFlag {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LockState {
        if self.is_locked() {
            LockState::Locked
        } else {
            LockState::Released
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn set(&self, state: LockState) {
        self.locked
            .store(state == LockState::Locked, Ordering::Release);
    }
}

impl Default for LockFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Claim `flag`, yielding while it is held.
    ///
    /// `timeout` is in ticks, [`FOREVER`](crate::time::FOREVER) never gives
    /// up. Under [`LockPolicy::Unconditional`] the flag is claimed without
    /// looking at it.
    pub fn lock(&self, flag: &LockFlag, timeout: u32) -> KernelResult<()> {
        if self.config().lock_policy == LockPolicy::Blocking {
            let deadline = Deadline::new(self.now(), timeout);
            while flag.is_locked() {
                if deadline.expired(self.now()) {
                    warn!(
                        "sync: lock not acquired after {} ms",
                        deadline.elapsed(self.now())
                    );
                    return Err(KernelError::Timeout);
                }
                self.yield_now();
            }
        }
        flag.set(LockState::Locked);
        Ok(())
    }

    /// Release `flag` and give waiters a turn
    pub fn release(&self, flag: &LockFlag) {
        flag.set(LockState::Released);
        self.yield_now();
    }

    /// Yield until `period` ticks have passed.
    ///
    /// Time must advance while yielding; sleeping before `start` with a
    /// tick counter nobody advances never returns.
    pub fn sleep(&self, period: u32) {
        let start = self.now();
        while self.clock().elapsed_since(start) < period {
            self.yield_now();
        }
        debug!("sync: slept {} ms", self.clock().elapsed_since(start));
    }
}
