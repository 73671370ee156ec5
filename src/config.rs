//! Kernel configuration — build-time constants and runtime policy
//!
//! Arena size and task count are fixed at build time. The few behaviours
//! that differ between deployments are carried by [`KernelConfig`].
//!
//! Author: Moroya Sakamoto

/// Bytes in the heap arena backing task stacks and queues
pub const ARENA_SIZE: usize = 16 * 1024;

/// Maximum tasks the kernel can manage
pub const MAX_TASKS: usize = 8;

/// Heap word and stack alignment (AAPCS requires 8 at public interfaces)
pub const ALIGNMENT: usize = 8;

/// Sentinel written at the lowest address of every task stack
pub const STACK_GUARD: u32 = 0xDEAD_BEEF;

/// Bytes reserved for the guard word (kept at full alignment)
pub const GUARD_SIZE: usize = ALIGNMENT;

/// Smallest stack `create_task` accepts: guard + one initial context frame
pub const MIN_STACK_SIZE: usize =
    GUARD_SIZE + crate::heap::align_up(crate::context::INITIAL_FRAME_SIZE, ALIGNMENT);

/// Behaviour of [`Kernel::lock`](crate::Kernel::lock) when the flag is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPolicy {
    /// Yield until the flag is released or the timeout elapses
    Blocking,
    /// Claim the flag without checking it; acquire never waits
    Unconditional,
}

/// Runtime kernel policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Lock acquisition behaviour
    pub lock_policy: LockPolicy,
    /// Emit a `trace!` record for every context switch
    pub trace_switches: bool,
}

impl KernelConfig {
    /// Blocking locks, no switch tracing
    pub const fn new() -> Self {
        Self {
            lock_policy: LockPolicy::Blocking,
            trace_switches: false,
        }
    }

    pub const fn with_lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub const fn with_trace_switches(mut self, enabled: bool) -> Self {
        self.trace_switches = enabled;
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_blocks() {
        let config = KernelConfig::default();
        assert_eq!(config.lock_policy, LockPolicy::Blocking);
        assert!(!config.trace_switches);
    }

    #[test]
    fn test_builder() {
        let config = KernelConfig::new()
            .with_lock_policy(LockPolicy::Unconditional)
            .with_trace_switches(true);
        assert_eq!(config.lock_policy, LockPolicy::Unconditional);
        assert!(config.trace_switches);
    }

    #[test]
    fn test_min_stack_holds_frame() {
        assert!(MIN_STACK_SIZE > crate::context::INITIAL_FRAME_SIZE);
        assert_eq!(MIN_STACK_SIZE % ALIGNMENT, 0);
    }
}
