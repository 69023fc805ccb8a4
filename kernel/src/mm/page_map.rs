//! Software page-map driver.
//!
//! The arch-agnostic contract consumed by the address-space manager:
//! insert/remove/protect/lookup over single-page mappings, plus batched
//! TLB invalidation. This implementation keeps the translation state in
//! an ordered map, which makes it the authoritative MMU on hosted builds
//! and the reference semantics for a hardware page-table walker.
//!
//! Invalidation batching: addresses queued while the driver lock is held
//! are flushed on the final unlock, as a shootdown to every CPU that has
//! the address space installed. Overflowing the batch degrades to a full
//! TLB flush; touching a kernel-half address additionally flushes global
//! pages.

use alloc::collections::BTreeMap;
use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::{
    arch::{self, CpuSet},
    error::{KernelError, KernelResult},
    mm::{PhysicalAddress, VirtualAddress},
};

/// Start of the shared kernel half of every address space.
pub const KERNEL_SPLIT: u64 = 0xFFFF_8000_0000_0000;

/// Queued invalidations beyond this degrade to a full TLB flush.
const INVALIDATE_BATCH_MAX: usize = 16;

/// Cacheability class of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    /// Ordinary write-back memory.
    Normal,
    /// Device registers; never cached.
    Device,
}

/// One installed translation.
#[derive(Debug, Clone, Copy)]
pub struct Mapping {
    pub phys: PhysicalAddress,
    pub writable: bool,
    pub executable: bool,
    pub mem_type: MemoryType,
    pub accessed: bool,
    pub dirty: bool,
}

/// Result of removing a translation: what the hardware knew about it.
#[derive(Debug, Clone, Copy)]
pub struct RemovedMapping {
    pub phys: PhysicalAddress,
    pub dirty: bool,
    pub accessed: bool,
}

/// Outcome of a software page-table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Translation exists and permits the access.
    Hit(PhysicalAddress),
    /// No translation installed.
    NotPresent,
    /// Translation exists but is read-only and the access was a write.
    ReadOnly,
}

struct PageMapInner {
    entries: BTreeMap<u64, Mapping>,
    pending: [u64; INVALIDATE_BATCH_MAX],
    pending_count: usize,
    flush_global: bool,
}

impl PageMapInner {
    fn queue_invalidate(&mut self, va: u64) {
        if va >= KERNEL_SPLIT {
            self.flush_global = true;
        }
        if self.pending_count < INVALIDATE_BATCH_MAX {
            self.pending[self.pending_count] = va;
        }
        // Overflow past the array triggers a full flush on unlock.
        self.pending_count += 1;
    }
}

/// Per-address-space page map. The kernel half is shared: lookups above
/// [`KERNEL_SPLIT`] consult the global kernel map, and destroying a page
/// map frees only its user-half entries.
pub struct PageMap {
    inner: Mutex<PageMapInner>,
    /// CPUs that currently have this address space installed.
    pub cpus: CpuSet,
}

lazy_static::lazy_static! {
    /// The shared kernel half, populated by boot glue.
    static ref KERNEL_HALF: Mutex<BTreeMap<u64, Mapping>> = Mutex::new(BTreeMap::new());
}

impl PageMap {
    /// Create a page map pre-populated with the shared kernel half.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PageMapInner {
                entries: BTreeMap::new(),
                pending: [0; INVALIDATE_BATCH_MAX],
                pending_count: 0,
                flush_global: false,
            }),
            cpus: CpuSet::new(),
        }
    }

    /// Acquire the driver lock. Queued invalidations flush when the
    /// returned guard drops.
    pub fn lock(&self) -> PageMapLock<'_> {
        PageMapLock {
            inner: self.inner.lock(),
            cpus: &self.cpus,
        }
    }

    /// Install a translation into the shared kernel half.
    pub fn insert_kernel(va: VirtualAddress, mapping: Mapping) -> KernelResult<()> {
        let mut kernel = KERNEL_HALF.lock();
        if kernel.contains_key(&va.as_u64()) {
            return Err(KernelError::AlreadyExists);
        }
        kernel.insert(va.as_u64(), mapping);
        Ok(())
    }
}

impl Default for PageMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Locked view of a page map. All mutations queue their TLB maintenance
/// here; dropping the guard performs one shootdown for the whole batch.
pub struct PageMapLock<'a> {
    inner: MutexGuard<'a, PageMapInner>,
    cpus: &'a CpuSet,
}

impl PageMapLock<'_> {
    /// Install a translation. Fails if one is already present; the
    /// address-space layer treats that as a fatal invariant violation.
    pub fn insert(
        &mut self,
        va: VirtualAddress,
        phys: PhysicalAddress,
        writable: bool,
        executable: bool,
        mem_type: MemoryType,
    ) -> KernelResult<()> {
        let key = va.page_base().as_u64();
        if self.inner.entries.contains_key(&key) {
            return Err(KernelError::AlreadyExists);
        }
        self.inner.entries.insert(
            key,
            Mapping {
                phys,
                writable,
                executable,
                mem_type,
                accessed: false,
                dirty: false,
            },
        );
        Ok(())
    }

    /// Atomically clear a translation. Returns what the walker had
    /// recorded so the caller can propagate dirty state back to the
    /// owning object; `shared` requests remote invalidation as well.
    pub fn remove(&mut self, va: VirtualAddress, shared: bool) -> Option<RemovedMapping> {
        let key = va.page_base().as_u64();
        let mapping = self.inner.entries.remove(&key)?;
        if shared || mapping.accessed {
            self.inner.queue_invalidate(key);
        }
        Some(RemovedMapping {
            phys: mapping.phys,
            dirty: mapping.dirty,
            accessed: mapping.accessed,
        })
    }

    /// Downgrade or upgrade the protection of an existing translation.
    /// No-op when absent. Queues invalidation for the old entry.
    pub fn protect(&mut self, va: VirtualAddress, writable: bool, executable: bool) {
        let key = va.page_base().as_u64();
        if let Some(mapping) = self.inner.entries.get_mut(&key) {
            mapping.writable = writable;
            mapping.executable = executable;
            self.inner.queue_invalidate(key);
        }
    }

    /// Current translation for `va`, if any. Kernel-half addresses
    /// consult the shared kernel map.
    pub fn lookup(&self, va: VirtualAddress) -> Option<Mapping> {
        let key = va.page_base().as_u64();
        if key >= KERNEL_SPLIT {
            return KERNEL_HALF.lock().get(&key).copied();
        }
        self.inner.entries.get(&key).copied()
    }

    /// Software page-table walk with the hardware walker's side effects:
    /// a successful read sets the accessed bit, a successful write sets
    /// accessed and dirty.
    pub fn probe(&mut self, va: VirtualAddress, write: bool) -> Probe {
        let key = va.page_base().as_u64();
        if key >= KERNEL_SPLIT {
            return match KERNEL_HALF.lock().get(&key) {
                Some(m) if !write || m.writable => Probe::Hit(m.phys),
                Some(_) => Probe::ReadOnly,
                None => Probe::NotPresent,
            };
        }
        match self.inner.entries.get_mut(&key) {
            None => Probe::NotPresent,
            Some(m) if write && !m.writable => Probe::ReadOnly,
            Some(m) => {
                m.accessed = true;
                if write {
                    m.dirty = true;
                }
                Probe::Hit(m.phys)
            }
        }
    }

    /// Number of installed user-half translations.
    pub fn mapped_pages(&self) -> usize {
        self.inner.entries.len()
    }
}

impl Drop for PageMapLock<'_> {
    fn drop(&mut self) {
        let count = self.inner.pending_count;
        if count == 0 && !self.inner.flush_global {
            return;
        }
        if self.inner.flush_global {
            arch::flush_global_pages();
        }
        if count > INVALIDATE_BATCH_MAX {
            // Too many addresses; a full flush is cheaper than issuing
            // them one at a time on every CPU.
            arch::tlb_shootdown(self.cpus, &[]);
        } else if count > 0 {
            arch::tlb_shootdown(self.cpus, &self.inner.pending[..count]);
        }
        self.inner.pending_count = 0;
        self.inner.flush_global = false;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;

    fn va(n: u64) -> VirtualAddress {
        VirtualAddress::new(n * PAGE_SIZE as u64 + 0x10000)
    }

    fn pa(n: u64) -> PhysicalAddress {
        PhysicalAddress::new(n * PAGE_SIZE as u64)
    }

    #[test]
    fn test_insert_rejects_double_map() {
        let map = PageMap::new();
        let mut guard = map.lock();
        guard
            .insert(va(1), pa(1), true, false, MemoryType::Normal)
            .unwrap();
        assert_eq!(
            guard.insert(va(1), pa(2), true, false, MemoryType::Normal),
            Err(KernelError::AlreadyExists)
        );
    }

    #[test]
    fn test_remove_reports_dirty_and_accessed() {
        let map = PageMap::new();
        let mut guard = map.lock();
        guard
            .insert(va(2), pa(2), true, false, MemoryType::Normal)
            .unwrap();
        assert_eq!(guard.probe(va(2), true), Probe::Hit(pa(2)));
        let removed = guard.remove(va(2), true).unwrap();
        assert!(removed.dirty);
        assert!(removed.accessed);
        assert!(guard.remove(va(2), true).is_none());
    }

    #[test]
    fn test_probe_write_to_readonly() {
        let map = PageMap::new();
        let mut guard = map.lock();
        guard
            .insert(va(3), pa(3), false, false, MemoryType::Normal)
            .unwrap();
        assert_eq!(guard.probe(va(3), true), Probe::ReadOnly);
        assert_eq!(guard.probe(va(3), false), Probe::Hit(pa(3)));
        // The read must not have set the dirty bit.
        assert!(!guard.lookup(va(3)).unwrap().dirty);
    }

    #[test]
    fn test_protect_then_probe() {
        let map = PageMap::new();
        let mut guard = map.lock();
        guard
            .insert(va(4), pa(4), true, false, MemoryType::Normal)
            .unwrap();
        guard.protect(va(4), false, false);
        assert_eq!(guard.probe(va(4), true), Probe::ReadOnly);
        // Protecting an absent page is a no-op.
        guard.protect(va(99), false, false);
        assert!(guard.lookup(va(99)).is_none());
    }

    #[test]
    fn test_batch_overflow_resets_on_unlock() {
        let map = PageMap::new();
        {
            let mut guard = map.lock();
            for i in 0..(INVALIDATE_BATCH_MAX as u64 + 4) {
                guard
                    .insert(va(10 + i), pa(10 + i), true, false, MemoryType::Normal)
                    .unwrap();
            }
            for i in 0..(INVALIDATE_BATCH_MAX as u64 + 4) {
                guard.remove(va(10 + i), true);
            }
        }
        // A fresh lock starts with an empty batch.
        let guard = map.lock();
        assert_eq!(guard.inner.pending_count, 0);
    }
}
