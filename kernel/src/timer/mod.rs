//! Monotonic kernel clock.
//!
//! Backs message timestamps and the absolute deadlines used by every
//! blocking primitive. Bare metal advances a tick counter from the arch
//! timer interrupt; hosted builds read the OS monotonic clock so unit
//! tests measure real time.

#[cfg(target_os = "none")]
use core::sync::atomic::{AtomicU64, Ordering};

/// Nanoseconds since boot, advanced by [`tick`].
#[cfg(target_os = "none")]
static UPTIME_NS: AtomicU64 = AtomicU64::new(0);

/// Advance the clock from the architecture timer interrupt.
#[cfg(target_os = "none")]
pub fn tick(elapsed_ns: u64) {
    UPTIME_NS.fetch_add(elapsed_ns, Ordering::Release);
}

/// Current monotonic time in nanoseconds.
#[cfg(target_os = "none")]
pub fn current_time_ns() -> u64 {
    UPTIME_NS.load(Ordering::Acquire)
}

#[cfg(not(target_os = "none"))]
pub fn current_time_ns() -> u64 {
    use std::time::Instant;

    lazy_static::lazy_static! {
        static ref BOOT: Instant = Instant::now();
    }
    BOOT.elapsed().as_nanos() as u64
}

/// A resolved sleep deadline.
///
/// Callers convert a relative timeout to a `Deadline` exactly once at
/// entry to a blocking operation, so retries after interruption do not
/// refresh the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Block until the predicate holds.
    Infinite,
    /// Never block; report `would_block` if the predicate does not hold.
    Immediate,
    /// Block until the given absolute time (ns since boot).
    At(u64),
}

impl Deadline {
    /// Interpret a signed relative timeout in nanoseconds: negative means
    /// infinite, zero immediate, positive an absolute deadline computed
    /// from the current time.
    pub fn after_ns(timeout_ns: i64) -> Self {
        match timeout_ns {
            t if t < 0 => Self::Infinite,
            0 => Self::Immediate,
            t => Self::At(current_time_ns().saturating_add(t as u64)),
        }
    }

    /// Whether the deadline has already passed.
    pub fn expired(&self) -> bool {
        match self {
            Self::Infinite | Self::Immediate => false,
            Self::At(t) => current_time_ns() >= *t,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let a = current_time_ns();
        let b = current_time_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_deadline_interpretation() {
        assert_eq!(Deadline::after_ns(-1), Deadline::Infinite);
        assert_eq!(Deadline::after_ns(0), Deadline::Immediate);
        let d = Deadline::after_ns(1_000_000_000);
        assert!(matches!(d, Deadline::At(_)));
        assert!(!d.expired());
        assert!(Deadline::At(1).expired());
    }
}
