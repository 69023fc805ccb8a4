//! Anonymous VM objects with copy-on-write semantics.
//!
//! An anonymous object is a sparse per-page store over an optional
//! backing source. Three parallel per-slot facts are maintained: the
//! page pointer (null until first touch), the region-reference count
//! (how many regions cover the slot), and the owner count on the page
//! itself (how many anonymous objects share it after forks). A page
//! with more than one owner is only ever mapped read-only; the first
//! write splits it.

use alloc::{sync::Arc, vec, vec::Vec};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        frame::Page,
        object::{FaultInfo, VmObject},
        page_map::{MemoryType, PageMap, PageMapLock},
        region::{AccessKind, FaultReason, Region, RegionFlags},
        VirtualAddress, PAGE_SIZE,
    },
};

/// Backing source: pages not yet private to this object are read from
/// here at `offset + slot * PAGE_SIZE`.
struct AnonSource {
    object: Arc<dyn VmObject>,
    offset: u64,
}

struct AnonInner {
    /// Per-slot page pointer; `None` until the slot is faulted.
    pages: Vec<Option<Arc<Page>>>,
    /// Per-slot count of covering regions.
    refs: Vec<u16>,
}

/// A copy-on-write anonymous memory object.
pub struct AnonObject {
    max_pages: usize,
    source: Option<AnonSource>,
    inner: Mutex<AnonInner>,
}

impl AnonObject {
    /// An object of `max_pages` zero-filled pages.
    pub fn new(max_pages: usize) -> Arc<Self> {
        Arc::new(Self {
            max_pages,
            source: None,
            inner: Mutex::new(AnonInner {
                pages: vec![None; max_pages],
                refs: vec![0; max_pages],
            }),
        })
    }

    /// An object whose unfaulted slots read through to `source` at
    /// `source_offset`. Such objects attach only to private regions.
    pub fn with_source(
        max_pages: usize,
        source: Arc<dyn VmObject>,
        source_offset: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_pages,
            source: Some(AnonSource {
                object: source,
                offset: source_offset,
            }),
            inner: Mutex::new(AnonInner {
                pages: vec![None; max_pages],
                refs: vec![0; max_pages],
            }),
        })
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    /// Distinct pages currently materialized in this object.
    pub fn resident_pages(&self) -> usize {
        self.inner.lock().pages.iter().filter(|p| p.is_some()).count()
    }

    /// Owner count of the page at `slot`, if materialized. Test and
    /// debugger surface.
    pub fn page_owner_count(&self, slot: usize) -> Option<u32> {
        self.inner
            .lock()
            .pages
            .get(slot)
            .and_then(|p| p.as_ref().map(|p| p.owner_count()))
    }

    fn slot_range(&self, offset: u64, len: usize) -> KernelResult<(usize, usize)> {
        if offset % PAGE_SIZE as u64 != 0 || len % PAGE_SIZE != 0 || len == 0 {
            return Err(KernelError::InvalidArgument {
                what: "unaligned object range",
            });
        }
        let first = (offset / PAGE_SIZE as u64) as usize;
        let count = len / PAGE_SIZE;
        if first + count > self.max_pages {
            return Err(KernelError::InvalidArgument {
                what: "object range out of bounds",
            });
        }
        Ok((first, count))
    }

    /// Install a translation, clearing the previous one first when the
    /// fault was a protection fault (the TLB entry for the old mapping
    /// is queued for shootdown by the removal).
    fn install(
        map: &mut PageMapLock<'_>,
        va: VirtualAddress,
        page: &Page,
        writable: bool,
        executable: bool,
        reason: FaultReason,
    ) {
        if reason == FaultReason::Protection && map.remove(va, true).is_none() {
            panic!("protection fault with no mapping at {:#x}", va.as_u64());
        }
        if map
            .insert(va, page.phys(), writable, executable, MemoryType::Normal)
            .is_err()
        {
            panic!("double map at {:#x}", va.as_u64());
        }
    }
}

impl VmObject for AnonObject {
    fn attach(&self, offset: u64, len: usize, flags: RegionFlags) -> KernelResult<()> {
        if self.source.is_some() && !flags.contains(RegionFlags::PRIVATE) {
            return Err(KernelError::InvalidArgument {
                what: "sourced object requires a private mapping",
            });
        }
        let (first, count) = self.slot_range(offset, len)?;
        let mut inner = self.inner.lock();
        for slot in first..first + count {
            inner.refs[slot] = inner.refs[slot]
                .checked_add(1)
                .unwrap_or_else(|| panic!("region reference count saturated at slot {}", slot));
        }
        Ok(())
    }

    fn detach(&self, offset: u64, len: usize) {
        let (first, count) = match self.slot_range(offset, len) {
            Ok(range) => range,
            Err(_) => return,
        };
        let mut inner = self.inner.lock();
        for slot in first..first + count {
            debug_assert!(inner.refs[slot] > 0, "detach of uncovered slot");
            inner.refs[slot] -= 1;
            if inner.refs[slot] == 0 {
                if let Some(page) = inner.pages[slot].take() {
                    page.release();
                }
            }
        }
    }

    fn copy_region(&self, offset: u64, len: usize) -> KernelResult<Arc<dyn VmObject>> {
        let (first, count) = self.slot_range(offset, len)?;
        let inner = self.inner.lock();

        let mut pages: Vec<Option<Arc<Page>>> = vec![None; count];
        for (dst, slot) in (first..first + count).enumerate() {
            if let Some(page) = &inner.pages[slot] {
                page.retain();
                pages[dst] = Some(Arc::clone(page));
            }
        }

        let source = self.source.as_ref().map(|src| AnonSource {
            object: Arc::clone(&src.object),
            offset: src.offset + offset,
        });

        Ok(Arc::new(Self {
            max_pages: count,
            source,
            inner: Mutex::new(AnonInner {
                pages,
                refs: vec![0; count],
            }),
        }))
    }

    fn fault(&self, map: &PageMap, region: &Region, info: &FaultInfo) -> Option<KernelResult<()>> {
        let offset = region.object_offset(info.addr);
        let slot = (offset / PAGE_SIZE as u64) as usize;
        if slot >= self.max_pages {
            return Some(Err(KernelError::InvalidArgument {
                what: "fault beyond object",
            }));
        }

        let va = info.addr.page_base();
        let executable = region.flags.contains(RegionFlags::EXEC);
        let writable_region = region.flags.contains(RegionFlags::WRITE);

        let mut inner = self.inner.lock();
        let mut map = map.lock();

        // First touch with no source: fresh zero-filled page.
        if inner.pages[slot].is_none() && self.source.is_none() {
            let page = match Page::alloc_zeroed(offset) {
                Ok(page) => page,
                Err(e) => return Some(Err(e)),
            };
            if info.access == AccessKind::Write {
                page.mark_dirty();
            }
            Self::install(&mut map, va, &page, writable_region, executable, info.reason);
            inner.pages[slot] = Some(page);
            return Some(Ok(()));
        }

        if info.access == AccessKind::Write {
            // Clone the slot out so the COW split can reassign it.
            let existing = inner.pages[slot].clone();
            match existing {
                Some(page) if page.owner_count() > 1 => {
                    // COW split: private copy for this object, drop our
                    // share of the old page.
                    let copy = match Page::alloc_copy_of_frame(page.phys(), offset) {
                        Ok(copy) => copy,
                        Err(e) => return Some(Err(e)),
                    };
                    copy.mark_dirty();
                    page.release();
                    Self::install(&mut map, va, &copy, true, executable, info.reason);
                    inner.pages[slot] = Some(copy);
                }
                Some(page) => {
                    // Sole owner: write in place.
                    page.mark_dirty();
                    Self::install(&mut map, va, &page, true, executable, info.reason);
                }
                None => {
                    // Slot reads through to the source; writing it makes
                    // a private copy of the source contents.
                    let src = self.source.as_ref().expect("sourced slot without source");
                    let src_offset = src.offset + offset;
                    let copy = if info.reason == FaultReason::Protection {
                        // The source page is already mapped read-only
                        // here; reuse the installed translation rather
                        // than fetching again.
                        let mapping = match map.lookup(va) {
                            Some(m) => m,
                            None => panic!(
                                "protection fault with no mapping at {:#x}",
                                va.as_u64()
                            ),
                        };
                        Page::alloc_copy_of_frame(mapping.phys, offset)
                    } else {
                        match src.object.page_get(src_offset) {
                            Ok(src_page) => {
                                let copy = Page::alloc_copy_of_frame(src_page.phys(), offset);
                                src.object.page_release(src_offset, src_page);
                                copy
                            }
                            Err(e) => return Some(Err(e)),
                        }
                    };
                    let copy = match copy {
                        Ok(copy) => copy,
                        Err(e) => return Some(Err(e)),
                    };
                    copy.mark_dirty();
                    Self::install(&mut map, va, &copy, true, executable, info.reason);
                    inner.pages[slot] = Some(copy);
                }
            }
            return Some(Ok(()));
        }

        // Read or execute access.
        match &inner.pages[slot] {
            Some(page) => {
                // Shared pages stay read-only so the next write faults
                // and splits.
                let writable = writable_region && page.owner_count() == 1;
                Self::install(&mut map, va, page, writable, executable, info.reason);
            }
            None => {
                // Map the source page in place, read-only; the copy is
                // deferred to the first write.
                let src = self.source.as_ref().expect("sourced slot without source");
                let src_offset = src.offset + offset;
                let src_page = match src.object.page_get(src_offset) {
                    Ok(page) => page,
                    Err(e) => return Some(Err(e)),
                };
                Self::install(&mut map, va, &src_page, false, executable, info.reason);
                src.object.page_release(src_offset, src_page);
            }
        }
        Some(Ok(()))
    }

    fn page_get(&self, offset: u64) -> KernelResult<Arc<Page>> {
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(KernelError::InvalidArgument {
                what: "unaligned page offset",
            });
        }
        let slot = (offset / PAGE_SIZE as u64) as usize;
        if slot >= self.max_pages {
            return Err(KernelError::InvalidArgument {
                what: "page offset out of bounds",
            });
        }
        let mut inner = self.inner.lock();
        if let Some(page) = &inner.pages[slot] {
            return Ok(Arc::clone(page));
        }
        let page = Page::alloc_zeroed(offset)?;
        inner.pages[slot] = Some(Arc::clone(&page));
        Ok(page)
    }

    fn page_dirty(&self, offset: u64) {
        let slot = (offset / PAGE_SIZE as u64) as usize;
        let inner = self.inner.lock();
        if let Some(Some(page)) = inner.pages.get(slot) {
            page.mark_dirty();
        }
    }
}

impl Drop for AnonObject {
    fn drop(&mut self) {
        // Slots normally empty out as regions detach; pages materialized
        // through bare page_get (no covering region) are released here.
        let inner = self.inner.get_mut();
        for page in inner.pages.iter_mut().filter_map(Option::take) {
            page.release();
        }
    }
}
