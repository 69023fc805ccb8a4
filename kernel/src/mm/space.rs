//! Per-process address spaces.
//!
//! An address space is an ordered, non-overlapping set of page-aligned
//! regions plus a page map. One mutex guards the region set and is held
//! across fault resolution and every region mutation; the page-map lock
//! nests inside it (address space -> object -> page map, never the
//! reverse).

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::{
    arch,
    error::{KernelError, KernelResult},
    mm::{
        anon::AnonObject,
        object::{FaultInfo, VmObject},
        page_map::{MemoryType, PageMap},
        region::{AccessKind, FaultReason, MapFlags, Region, RegionFlags},
        VirtualAddress, PAGE_SIZE, USER_BASE, USER_TOP,
    },
};

static NEXT_SPACE_ID: AtomicU64 = AtomicU64::new(1);

struct SpaceInner {
    /// Regions keyed by start address. Invariant: non-overlapping.
    regions: BTreeMap<u64, Region>,
    /// Start key of the most recently found region; repeated faults in
    /// the same region skip the tree walk.
    cached: Option<u64>,
}

/// One process's virtual memory: region set plus page map.
pub struct AddressSpace {
    id: u64,
    inner: Mutex<SpaceInner>,
    page_map: PageMap,
}

impl AddressSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SPACE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(SpaceInner {
                regions: BTreeMap::new(),
                cached: None,
            }),
            page_map: PageMap::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_map(&self) -> &PageMap {
        &self.page_map
    }

    /// Reserve `[start, start + size)`: the range is occupied, carries
    /// no object, rejects faults, and is skipped by non-fixed placement.
    pub fn reserve(&self, start: VirtualAddress, size: usize) -> KernelResult<()> {
        validate_range(start, size)?;
        let end = start.add(size);
        let mut inner = self.inner.lock();
        if overlaps_any(&inner.regions, start, end) {
            return Err(KernelError::AlreadyExists);
        }
        inner
            .regions
            .insert(start.as_u64(), Region::reserved(start, end));
        Ok(())
    }

    /// Map `size` bytes of fresh anonymous memory.
    pub fn map_anonymous(
        &self,
        hint: Option<VirtualAddress>,
        size: usize,
        flags: MapFlags,
    ) -> KernelResult<VirtualAddress> {
        if size == 0 || !crate::mm::is_page_aligned(size) {
            return Err(KernelError::InvalidArgument {
                what: "unaligned mapping size",
            });
        }
        let object = AnonObject::new(size / PAGE_SIZE);
        self.map_object(hint, size, flags, object, 0)
    }

    /// Map `[offset, offset + size)` of `object`.
    pub fn map_object(
        &self,
        hint: Option<VirtualAddress>,
        size: usize,
        flags: MapFlags,
        object: Arc<dyn VmObject>,
        offset: u64,
    ) -> KernelResult<VirtualAddress> {
        if size == 0 || !crate::mm::is_page_aligned(size) || offset % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument {
                what: "unaligned mapping",
            });
        }
        if !flags.intersects(MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC) {
            return Err(KernelError::InvalidArgument {
                what: "mapping without access flags",
            });
        }

        let region_flags = flags.region_flags();
        let mut inner = self.inner.lock();

        let start = if flags.contains(MapFlags::FIXED) {
            let start = hint.ok_or(KernelError::InvalidArgument {
                what: "fixed mapping without address",
            })?;
            validate_range(start, size)?;
            // Fixed placement evicts whatever overlaps, reservations
            // included.
            self.unmap_locked(&mut inner, start, start.add(size))?;
            start
        } else {
            self.find_free(&inner, size)?
        };

        object.attach(offset, size, region_flags)?;
        inner.regions.insert(
            start.as_u64(),
            Region::new(start, start.add(size), region_flags, Some(object), offset),
        );
        inner.cached = None;
        Ok(start)
    }

    /// Remove all mappings intersecting `[start, start + size)`.
    /// Unmapping a range with nothing mapped succeeds.
    pub fn unmap(&self, start: VirtualAddress, size: usize) -> KernelResult<()> {
        validate_range(start, size)?;
        let mut inner = self.inner.lock();
        self.unmap_locked(&mut inner, start, start.add(size))
    }

    /// Change the access flags of every mapping inside the range.
    /// Losing write permission downgrades installed translations
    /// immediately; gained permissions materialize on the next fault.
    pub fn protect(
        &self,
        start: VirtualAddress,
        size: usize,
        flags: MapFlags,
    ) -> KernelResult<()> {
        validate_range(start, size)?;
        if !flags.intersects(MapFlags::READ | MapFlags::WRITE | MapFlags::EXEC) {
            return Err(KernelError::InvalidArgument {
                what: "protection without access flags",
            });
        }
        let end = start.add(size);
        let access = flags.region_flags()
            & (RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXEC);

        let mut inner = self.inner.lock();
        let keys: Vec<u64> = inner
            .regions
            .range(..end.as_u64())
            .filter(|(_, r)| r.end > start)
            .map(|(k, _)| *k)
            .collect();

        for key in keys {
            let region = inner.regions.get(&key).expect("region vanished");
            if region.is_reserved() {
                return Err(KernelError::InvalidArgument {
                    what: "protect of reserved region",
                });
            }
            let (r_start, r_end) = (region.start, region.end);

            // Carve the region so the protected part stands alone.
            if r_start < start {
                let mut region = inner.regions.remove(&key).expect("region vanished");
                let tail = region.split_at(start);
                inner.regions.insert(region.start.as_u64(), region);
                inner.regions.insert(tail.start.as_u64(), tail);
                inner.cached = None;
            }
            let key = r_start.max(start).as_u64();
            if r_end > end {
                let mut region = inner.regions.remove(&key).expect("region vanished");
                let tail = region.split_at(end);
                inner.regions.insert(region.start.as_u64(), region);
                inner.regions.insert(tail.start.as_u64(), tail);
                inner.cached = None;
            }

            let region = inner.regions.get_mut(&key).expect("region vanished");
            let lost_write =
                region.flags.contains(RegionFlags::WRITE) && !access.contains(RegionFlags::WRITE);
            region.flags = (region.flags - (RegionFlags::READ | RegionFlags::WRITE | RegionFlags::EXEC))
                | access;

            if lost_write {
                let exec = region.flags.contains(RegionFlags::EXEC);
                let (from, to) = (region.start, region.end);
                let mut map = self.page_map.lock();
                let mut va = from;
                while va < to {
                    map.protect(va, false, exec);
                    va = va.add(PAGE_SIZE);
                }
            }
        }
        Ok(())
    }

    /// Resolve a page fault. Returns `true` when the access may be
    /// retried, `false` when the fault is unhandled.
    pub fn fault(&self, addr: VirtualAddress, reason: FaultReason, access: AccessKind) -> bool {
        // Protection faults are write faults on read-only mappings;
        // anything else escaping the MMU is not ours to fix.
        if reason == FaultReason::Protection && access != AccessKind::Write {
            return false;
        }

        let mut inner = self.inner.lock();
        let key = match self.find_region(&mut inner, addr) {
            Some(key) => key,
            None => return false,
        };
        let region = inner.regions.get(&key).expect("cached region vanished");
        if region.is_reserved() || !region.allows(access) {
            return false;
        }
        let object = match &region.object {
            Some(object) => Arc::clone(object),
            None => return false,
        };

        let info = FaultInfo {
            addr,
            reason,
            access,
        };

        // Object-specific handler first (anonymous objects always have
        // one), generic page_get path otherwise.
        if let Some(result) = object.fault(&self.page_map, region, &info) {
            if let Err(e) = &result {
                log::warn!("fault at {:#x} failed: {}", addr.as_u64(), e);
            }
            return result.is_ok();
        }

        self.generic_fault(region, &object, &info)
    }

    fn generic_fault(
        &self,
        region: &Region,
        object: &Arc<dyn VmObject>,
        info: &FaultInfo,
    ) -> bool {
        let offset = region.object_offset(info.addr);
        let page = match object.page_get(offset) {
            Ok(page) => page,
            Err(e) => {
                log::warn!("page_get at offset {:#x} failed: {}", offset, e);
                return false;
            }
        };

        let va = info.addr.page_base();
        let exec = region.flags.contains(RegionFlags::EXEC);
        let mut map = self.page_map.lock();

        match info.reason {
            FaultReason::Protection => {
                if map.remove(va, true).is_none() {
                    panic!("missing mapping during protection fault at {:#x}", va.as_u64());
                }
                page.mark_dirty();
                object.page_dirty(offset);
                if map
                    .insert(va, page.phys(), true, exec, MemoryType::Normal)
                    .is_err()
                {
                    panic!("double map at {:#x}", va.as_u64());
                }
            }
            FaultReason::NotPresent => {
                // Clean pages map read-only so the first write faults and
                // marks them dirty; a write fault dirties immediately.
                if info.access == AccessKind::Write {
                    page.mark_dirty();
                    object.page_dirty(offset);
                }
                let writable = region.flags.contains(RegionFlags::WRITE) && page.is_dirty();
                if map
                    .insert(va, page.phys(), writable, exec, MemoryType::Normal)
                    .is_err()
                {
                    panic!("double map at {:#x}", va.as_u64());
                }
            }
        }
        object.page_release(offset, page);
        true
    }

    /// Copy this address space for fork. Private copyable regions become
    /// copy-on-write; shared regions reference the same object; reserved
    /// regions are recreated reserved. The child starts with no
    /// installed translations and faults its pages lazily.
    pub fn duplicate(&self) -> KernelResult<Arc<AddressSpace>> {
        let new = AddressSpace::new();
        let inner = self.inner.lock();
        {
            let mut new_inner = new.inner.lock();

            for region in inner.regions.values() {
                if region.is_reserved() {
                    new_inner.regions.insert(
                        region.start.as_u64(),
                        Region::reserved(region.start, region.end),
                    );
                    continue;
                }

                let object = region.object.as_ref().expect("mapped region without object");
                let len = region.len();

                let (child_object, child_offset) =
                    if region.flags.contains(RegionFlags::PRIVATE) {
                        match object.copy_region(region.offset, len) {
                            Ok(copy) => {
                                // Write-protect the whole source region so
                                // the parent's next write triggers the COW
                                // split.
                                let exec = region.flags.contains(RegionFlags::EXEC);
                                let mut map = self.page_map.lock();
                                let mut va = region.start;
                                while va < region.end {
                                    map.protect(va, false, exec);
                                    va = va.add(PAGE_SIZE);
                                }
                                (copy, 0)
                            }
                            Err(KernelError::NotSupported { .. }) => {
                                (Arc::clone(object), region.offset)
                            }
                            Err(e) => return Err(e),
                        }
                    } else {
                        (Arc::clone(object), region.offset)
                    };

                child_object.attach(child_offset, len, region.flags)?;
                new_inner.regions.insert(
                    region.start.as_u64(),
                    Region::new(
                        region.start,
                        region.end,
                        region.flags,
                        Some(child_object),
                        child_offset,
                    ),
                );
            }
        }
        Ok(new)
    }

    /// Install `space` on the current CPU.
    pub fn switch_to(space: &Arc<Self>) {
        let cpu = arch::cpu_id();
        let previous = set_current(Some(Arc::clone(space)));
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, space) {
                previous.page_map.cpus.remove(cpu);
            }
        }
        space.page_map.cpus.add(cpu);
    }

    /// Number of installed regions. Diagnostics surface.
    pub fn region_count(&self) -> usize {
        self.inner.lock().regions.len()
    }

    /// Snapshot of `(start, end, flags)` per region, for the debugger
    /// and the invariant checks in tests.
    pub fn regions_snapshot(&self) -> Vec<(u64, u64, RegionFlags)> {
        self.inner
            .lock()
            .regions
            .values()
            .map(|r| (r.start.as_u64(), r.end.as_u64(), r.flags))
            .collect()
    }

    fn find_region(&self, inner: &mut MutexGuard<'_, SpaceInner>, addr: VirtualAddress) -> Option<u64> {
        if let Some(key) = inner.cached {
            if let Some(region) = inner.regions.get(&key) {
                if region.contains(addr) {
                    return Some(key);
                }
            }
        }
        let (key, region) = inner.regions.range(..=addr.as_u64()).next_back()?;
        if !region.contains(addr) {
            return None;
        }
        let key = *key;
        inner.cached = Some(key);
        Some(key)
    }

    /// First-fit walk of the ordered region set: the lowest hole large
    /// enough, reservations treated as occupied.
    fn find_free(&self, inner: &SpaceInner, size: usize) -> KernelResult<VirtualAddress> {
        let mut candidate = USER_BASE;
        for region in inner.regions.values() {
            if region.start.as_u64() >= candidate
                && (region.start.as_u64() - candidate) as usize >= size
            {
                break;
            }
            candidate = candidate.max(region.end.as_u64());
        }
        if candidate + size as u64 > USER_TOP {
            return Err(KernelError::OutOfMemory);
        }
        Ok(VirtualAddress::new(candidate))
    }

    fn unmap_locked(
        &self,
        inner: &mut MutexGuard<'_, SpaceInner>,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> KernelResult<()> {
        let keys: Vec<u64> = inner
            .regions
            .range(..end.as_u64())
            .filter(|(_, r)| r.end > start)
            .map(|(k, _)| *k)
            .collect();

        for key in keys {
            let mut region = inner.regions.remove(&key).expect("region vanished");

            if region.start >= start && region.end <= end {
                // Fully covered: the whole region goes.
                self.release_span(&region, region.start, region.end);
            } else if region.start < start && region.end > end {
                // Hole punch: keep front and back.
                let mut middle = region.split_at(start);
                let back = middle.split_at(end);
                self.release_span(&middle, middle.start, middle.end);
                inner.regions.insert(region.start.as_u64(), region);
                inner.regions.insert(back.start.as_u64(), back);
            } else if region.start < start {
                // Trim the back.
                let removed = region.split_at(start);
                self.release_span(&removed, removed.start, removed.end);
                inner.regions.insert(region.start.as_u64(), region);
            } else {
                // Trim the front.
                let back = region.split_at(end);
                self.release_span(&region, region.start, region.end);
                inner.regions.insert(back.start.as_u64(), back);
            }
        }
        inner.cached = None;
        Ok(())
    }

    /// Tear down translations and object coverage for `[from, to)` of a
    /// region being removed. Hardware dirty state is propagated to the
    /// object before the coverage drop releases the pages.
    fn release_span(&self, region: &Region, from: VirtualAddress, to: VirtualAddress) {
        if region.is_reserved() {
            return;
        }
        let object = region.object.as_ref().expect("mapped region without object");

        {
            let mut map = self.page_map.lock();
            let mut va = from;
            while va < to {
                if let Some(removed) = map.remove(va, true) {
                    if removed.dirty {
                        object.page_dirty(region.object_offset(va));
                    }
                }
                va = va.add(PAGE_SIZE);
            }
        }

        let offset = region.object_offset(from);
        object.detach(offset, (to.as_u64() - from.as_u64()) as usize);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let regions: Vec<u64> = inner.regions.keys().copied().collect();
        for key in regions {
            let region = inner.regions.remove(&key).expect("region vanished");
            if region.is_reserved() {
                continue;
            }
            // Translations die with the page map; coverage must still be
            // returned so shared objects release their pages.
            if let Some(object) = &region.object {
                object.detach(region.offset, region.len());
            }
        }
    }
}

fn validate_range(start: VirtualAddress, size: usize) -> KernelResult<()> {
    if size == 0 || !crate::mm::is_page_aligned(size) || !start.is_page_aligned() {
        return Err(KernelError::InvalidArgument {
            what: "unaligned range",
        });
    }
    if !start.is_user() || start.as_u64() + size as u64 > USER_TOP {
        return Err(KernelError::InvalidArgument {
            what: "range outside user space",
        });
    }
    Ok(())
}

fn overlaps_any(regions: &BTreeMap<u64, Region>, start: VirtualAddress, end: VirtualAddress) -> bool {
    regions
        .range(..end.as_u64())
        .next_back()
        .map(|(_, r)| r.end > start)
        .unwrap_or(false)
}

// --- current address space -------------------------------------------------

#[cfg(target_os = "none")]
mod active {
    use super::AddressSpace;
    use alloc::sync::Arc;
    use spin::Mutex;

    const NONE: Mutex<Option<Arc<AddressSpace>>> = Mutex::new(None);
    /// Per-CPU active address space, updated by the scheduler inside an
    /// IRQ-disabled window.
    static ACTIVE: [Mutex<Option<Arc<AddressSpace>>>; crate::arch::MAX_CPUS] =
        [NONE; crate::arch::MAX_CPUS];

    pub fn set_current(space: Option<Arc<AddressSpace>>) -> Option<Arc<AddressSpace>> {
        let cpu = crate::arch::cpu_id();
        core::mem::replace(&mut *ACTIVE[cpu].lock(), space)
    }

    pub fn current_space() -> Option<Arc<AddressSpace>> {
        let cpu = crate::arch::cpu_id();
        ACTIVE[cpu].lock().clone()
    }
}

#[cfg(not(target_os = "none"))]
mod active {
    use super::AddressSpace;
    use alloc::sync::Arc;
    use std::cell::RefCell;

    std::thread_local! {
        // Hosted builds give every test thread its own "CPU".
        static ACTIVE: RefCell<Option<Arc<AddressSpace>>> = const { RefCell::new(None) };
    }

    pub fn set_current(space: Option<Arc<AddressSpace>>) -> Option<Arc<AddressSpace>> {
        ACTIVE.with(|slot| slot.replace(space))
    }

    pub fn current_space() -> Option<Arc<AddressSpace>> {
        ACTIVE.with(|slot| slot.borrow().clone())
    }
}

pub use active::{current_space, set_current};
