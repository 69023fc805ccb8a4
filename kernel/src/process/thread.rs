//! Kernel threads, reduced to the surface the core subsystems consume:
//! the current-thread notion, the active-token latch, and the interrupt
//! flag observed by interruptible waits.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use spin::Mutex;

use crate::{process::Process, security::SecurityToken};

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

pub struct Thread {
    id: u64,
    process: Mutex<Arc<Process>>,
    /// Optional per-thread token overriding the process token.
    token_override: Mutex<Option<Arc<SecurityToken>>>,
    /// Token latched on first query during the current kernel entry.
    active_token: Mutex<Option<Arc<SecurityToken>>>,
    interrupted: AtomicBool,
}

impl Thread {
    pub fn new(process: Arc<Process>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed),
            process: Mutex::new(process),
            token_override: Mutex::new(None),
            active_token: Mutex::new(None),
            interrupted: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn process(&self) -> Arc<Process> {
        Arc::clone(&self.process.lock())
    }

    /// Rebind this thread to another process (hosted test surface; on
    /// bare metal threads are born into their process).
    pub fn adopt(&self, process: Arc<Process>) {
        crate::mm::AddressSpace::switch_to(process.space());
        *self.process.lock() = process;
        // A new identity invalidates any latched token.
        *self.active_token.lock() = None;
    }

    /// The token authorizing this thread's current kernel entry. The
    /// first query latches it (thread override if set, else the process
    /// token); it stays stable until [`Thread::kernel_exit`].
    pub fn active_token(&self) -> Arc<SecurityToken> {
        let mut active = self.active_token.lock();
        if let Some(token) = &*active {
            return Arc::clone(token);
        }
        let token = self
            .token_override
            .lock()
            .clone()
            .unwrap_or_else(|| self.process.lock().token());
        *active = Some(Arc::clone(&token));
        token
    }

    /// Kernel-entry epilogue: drop the latched token so the next entry
    /// observes current state.
    pub fn kernel_exit(&self) {
        *self.active_token.lock() = None;
    }

    pub fn set_token_override(&self, token: Option<Arc<SecurityToken>>) {
        *self.token_override.lock() = token;
    }

    /// Mark the thread interrupted; the next (or current) interruptible
    /// wait returns `interrupted`.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Consume a pending interrupt.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }
}

// --- current thread --------------------------------------------------------

#[cfg(not(target_os = "none"))]
mod current {
    use super::Thread;
    use alloc::sync::Arc;
    use std::cell::RefCell;

    std::thread_local! {
        // Host threads lazily become kernel threads of the kernel
        // process the first time they enter the kernel.
        static CURRENT: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
    }

    pub fn current_thread() -> Arc<Thread> {
        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            match &*slot {
                Some(thread) => Arc::clone(thread),
                None => {
                    let thread = Thread::new(crate::process::kernel_process());
                    *slot = Some(Arc::clone(&thread));
                    thread
                }
            }
        })
    }
}

#[cfg(target_os = "none")]
mod current {
    use super::Thread;
    use alloc::sync::Arc;
    use spin::Mutex;

    // Until the scheduler collaborator takes over, every CPU runs the
    // boot thread.
    static BOOT_THREAD: Mutex<Option<Arc<Thread>>> = Mutex::new(None);

    pub fn current_thread() -> Arc<Thread> {
        let mut slot = BOOT_THREAD.lock();
        match &*slot {
            Some(thread) => Arc::clone(thread),
            None => {
                let thread = Thread::new(crate::process::kernel_process());
                *slot = Some(Arc::clone(&thread));
                thread
            }
        }
    }
}

pub use current::current_thread;

/// Whether the current thread has an interrupt pending. Consuming: the
/// flag is cleared, so one interrupt cancels one wait.
pub fn interrupt_pending() -> bool {
    current_thread().take_interrupt()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::security::{self, Privileges, SecurityContext, SecurityToken};
    use alloc::vec;

    #[test]
    fn test_active_token_latches_until_kernel_exit() {
        let process = crate::process::Process::new("latch-test", security::system_token(), 1);
        let thread = Thread::new(Arc::clone(&process));

        let latched = thread.active_token();
        // Swapping the process token mid-entry does not change the
        // latched token.
        let reduced = SecurityToken::create(
            &security::system_token(),
            &SecurityContext {
                uid: 7,
                gid: 7,
                groups: vec![],
                effective: Privileges::empty(),
                inherit: Privileges::empty(),
            },
        )
        .unwrap();
        process.set_token(Arc::clone(&reduced));
        assert!(Arc::ptr_eq(&thread.active_token(), &latched));

        // The next entry observes the new token.
        thread.kernel_exit();
        assert!(Arc::ptr_eq(&thread.active_token(), &reduced));
    }

    #[test]
    fn test_interrupt_is_consumed_once() {
        let process = crate::process::Process::new("intr-test", security::system_token(), 1);
        let thread = Thread::new(process);
        assert!(!thread.take_interrupt());
        thread.interrupt();
        assert!(thread.take_interrupt());
        assert!(!thread.take_interrupt());
    }
}
