//! Generation-counted wait queues.
//!
//! Every rendezvous in the kernel (port listen, connection open,
//! endpoint data/space) blocks on one of these. The protocol is the
//! classic sequence-count condition variable:
//!
//! ```ignore
//! let mut inner = conn.lock();
//! loop {
//!     if predicate(&inner) { break; }
//!     let token = wq.prepare();
//!     drop(inner);
//!     wq.wait(token, deadline, interruptible)?;
//!     inner = conn.lock();
//! }
//! ```
//!
//! Wakes are broadcasts; woken threads must re-evaluate their predicate
//! under the lock because state-machine transitions (close, disown) wake
//! every waiter. A wake between `prepare` and `wait` is not lost: the
//! generation already moved, so `wait` returns immediately.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{
    error::{KernelError, KernelResult},
    timer::Deadline,
};

/// Opaque snapshot of a queue's generation, taken under the caller's lock
/// before the predicate wait.
#[derive(Debug, Clone, Copy)]
pub struct WaitToken(u64);

/// A broadcast wait queue.
#[derive(Debug, Default)]
pub struct WaitQueue {
    generation: AtomicU64,
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Snapshot the current generation. Must be called while the lock
    /// protecting the waited-on predicate is held.
    pub fn prepare(&self) -> WaitToken {
        WaitToken(self.generation.load(Ordering::Acquire))
    }

    /// Wake every waiter. Also used where a single wake would suffice;
    /// waiters re-check their predicate, so spurious wakes are benign.
    pub fn wake_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Wake at least one waiter.
    pub fn wake_one(&self) {
        self.wake_all();
    }

    /// Block until a wake arrives after `token` was taken, the deadline
    /// passes, or (when `interruptible`) the thread is interrupted.
    ///
    /// Returns `WouldBlock` for an immediate deadline whose predicate did
    /// not hold, `TimedOut` for an expired absolute deadline, and
    /// `Interrupted` when an interrupt was pending. The caller re-checks
    /// its predicate under the lock in all cases: the awaited event may
    /// have raced with the removal.
    pub fn wait(
        &self,
        token: WaitToken,
        deadline: Deadline,
        interruptible: bool,
    ) -> KernelResult<()> {
        loop {
            if self.generation.load(Ordering::Acquire) != token.0 {
                return Ok(());
            }
            match deadline {
                Deadline::Immediate => return Err(KernelError::WouldBlock),
                d if d.expired() => return Err(KernelError::TimedOut),
                _ => {}
            }
            if interruptible && crate::process::thread::interrupt_pending() {
                return Err(KernelError::Interrupted);
            }
            relax();
        }
    }
}

/// Yield the CPU while spinning on a wait queue.
#[inline]
fn relax() {
    #[cfg(not(target_os = "none"))]
    std::thread::yield_now();
    #[cfg(target_os = "none")]
    core::hint::spin_loop();
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_wake_before_wait_is_not_lost() {
        let wq = WaitQueue::new();
        let token = wq.prepare();
        wq.wake_all();
        assert!(wq.wait(token, Deadline::Infinite, false).is_ok());
    }

    #[test]
    fn test_immediate_deadline_returns_would_block() {
        let wq = WaitQueue::new();
        let token = wq.prepare();
        assert_eq!(
            wq.wait(token, Deadline::Immediate, false),
            Err(KernelError::WouldBlock)
        );
    }

    #[test]
    fn test_absolute_deadline_times_out() {
        let wq = WaitQueue::new();
        let token = wq.prepare();
        let deadline = Deadline::after_ns(2_000_000); // 2ms
        assert_eq!(
            wq.wait(token, deadline, false),
            Err(KernelError::TimedOut)
        );
    }

    #[test]
    fn test_cross_thread_wake() {
        use std::sync::Arc;

        let wq = Arc::new(WaitQueue::new());
        let token = wq.prepare();
        let waker = Arc::clone(&wq);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            waker.wake_all();
        });
        assert!(wq.wait(token, Deadline::Infinite, false).is_ok());
        handle.join().unwrap();
    }
}
