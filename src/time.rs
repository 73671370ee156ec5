//! Monotonic time source — wrapping millisecond ticks
//!
//! The kernel only ever compares two readings, always through the
//! wrapping difference, so a counter that rolls over mid-wait still
//! produces the right elapsed time.
//! On hardware [`SysTimer`] is advanced from the SysTick interrupt; on a
//! host, [`HostClock`] reads the OS monotonic clock.
//!
//! Author: Moroya Sakamoto

use core::sync::atomic::{AtomicU32, Ordering};

/// Millisecond tick counter value
pub type Tick = u32;

/// Timeout value meaning "wait forever"
pub const FOREVER: u32 = 0;

/// Wrapping-safe `now - start`
#[inline]
pub const fn elapsed(start: Tick, now: Tick) -> u32 {
    now.wrapping_sub(start)
}

/// Anything that can report the current tick
pub trait TimeSource: Sync {
    fn now(&self) -> Tick;

    /// Milliseconds since `reference`
    fn elapsed_since(&self, reference: Tick) -> u32 {
        elapsed(reference, self.now())
    }
}

/// Software tick counter
///
/// Size: 8 bytes
pub struct SysTimer {
    /// Current tick count (milliseconds)
    ticks: AtomicU32,
    /// Overflow count
    overflows: AtomicU32,
}

impl SysTimer {
    pub const fn new() -> Self {
        Self {
            ticks: AtomicU32::new(0),
            overflows: AtomicU32::new(0),
        }
    }

    /// Start at an arbitrary tick, e.g. just below the wrap point
    pub const fn starting_at(tick: Tick) -> Self {
        Self {
            ticks: AtomicU32::new(tick),
            overflows: AtomicU32::new(0),
        }
    }

    /// Advance time by `ms` milliseconds (SysTick handler, or tests)
    pub fn advance(&self, ms: u32) {
        let old = self.ticks.fetch_add(ms, Ordering::AcqRel);
        if old.checked_add(ms).is_none() {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One SysTick period
    pub fn tick(&self) {
        self.advance(1);
    }

    pub fn now_ms(&self) -> Tick {
        self.ticks.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.ticks.store(0, Ordering::Release);
        self.overflows.store(0, Ordering::Relaxed);
    }

    /// Number of overflows
    pub fn overflows(&self) -> u32 {
        self.overflows.load(Ordering::Relaxed)
    }
}

impl Default for SysTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SysTimer {
    fn now(&self) -> Tick {
        self.now_ms()
    }
}

/// Host monotonic clock, milliseconds since construction
#[cfg(any(test, feature = "std"))]
pub struct HostClock {
    origin: std::time::Instant,
}

#[cfg(any(test, feature = "std"))]
impl HostClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "std"))]
impl TimeSource for HostClock {
    fn now(&self) -> Tick {
        // Truncation is the wrap
        self.origin.elapsed().as_millis() as Tick
    }
}

/// Timeout tracker for a single wait
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    /// Wait start
    start: Tick,
    /// Allowed duration, [`FOREVER`] for none
    timeout: u32,
}

impl Deadline {
    pub fn new(start: Tick, timeout: u32) -> Self {
        Self { start, timeout }
    }

    /// Has the wait run out at `now`?
    pub fn expired(&self, now: Tick) -> bool {
        self.timeout != FOREVER && elapsed(self.start, now) >= self.timeout
    }

    /// Remaining time until expiry (0 if expired, `u32::MAX` if forever)
    pub fn remaining(&self, now: Tick) -> u32 {
        if self.timeout == FOREVER {
            u32::MAX
        } else {
            self.timeout.saturating_sub(elapsed(self.start, now))
        }
    }

    /// Elapsed since start
    pub fn elapsed(&self, now: Tick) -> u32 {
        elapsed(self.start, now)
    }
}
