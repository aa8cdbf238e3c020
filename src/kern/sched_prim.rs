//! Scheduling Primitives - Preemption state
//!
//! The slice of the scheduler the allocator consults: whether the
//! current context has preemption disabled. Code running with preemption
//! disabled must not sleep, so allocation paths check the level before
//! touching anything that can block.

use core::sync::atomic::{AtomicU32, Ordering};

static PREEMPTION_LEVEL: AtomicU32 = AtomicU32::new(0);

/// Current preemption-disable depth (0 = preemptible)
#[inline]
pub fn preemption_level() -> u32 {
    PREEMPTION_LEVEL.load(Ordering::Relaxed)
}

/// Enter a preemption-disabled section
#[inline]
pub fn disable_preemption() {
    PREEMPTION_LEVEL.fetch_add(1, Ordering::Relaxed);
}

/// Leave a preemption-disabled section
#[inline]
pub fn enable_preemption() {
    let prev = PREEMPTION_LEVEL.fetch_sub(1, Ordering::Relaxed);
    debug_assert!(prev > 0, "enable_preemption without matching disable");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preemption_nesting() {
        let base = preemption_level();
        disable_preemption();
        disable_preemption();
        assert!(preemption_level() >= base + 2);
        enable_preemption();
        enable_preemption();
    }
}
