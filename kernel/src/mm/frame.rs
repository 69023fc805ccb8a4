//! Physical frame arena and the per-frame `Page` bookkeeping.
//!
//! The arena is the fixed-interface stand-in for the platform physical
//! allocator: it hands out zero-filled page-sized frames and takes them
//! back, and it exposes an in-use counter the copy-on-write tests assert
//! against. Frames are carved from the kernel heap, which keeps the
//! arena identical on hosted and bare-metal builds.

use core::{
    alloc::Layout,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use alloc::sync::Arc;

use crate::{
    error::{KernelError, KernelResult},
    mm::{PhysicalAddress, PAGE_SIZE},
};

/// Size of one physical frame.
pub const FRAME_SIZE: usize = PAGE_SIZE;

/// Frames currently allocated from the arena.
static FRAMES_IN_USE: AtomicUsize = AtomicUsize::new(0);

fn frame_layout() -> Layout {
    // PAGE_SIZE is a power of two, so the layout is always valid.
    Layout::from_size_align(FRAME_SIZE, FRAME_SIZE).unwrap()
}

/// Allocate one zero-filled frame.
pub fn allocate_frame() -> KernelResult<PhysicalAddress> {
    // SAFETY: frame_layout() has non-zero size.
    let ptr = unsafe { alloc::alloc::alloc_zeroed(frame_layout()) };
    if ptr.is_null() {
        return Err(KernelError::OutOfMemory);
    }
    FRAMES_IN_USE.fetch_add(1, Ordering::AcqRel);
    Ok(PhysicalAddress::new(ptr as u64))
}

/// Return a frame to the arena.
pub fn free_frame(pa: PhysicalAddress) {
    // SAFETY: `pa` was produced by `allocate_frame` with the same layout
    // and is freed exactly once (the caller owns the frame).
    unsafe { alloc::alloc::dealloc(pa.as_u64() as *mut u8, frame_layout()) };
    FRAMES_IN_USE.fetch_sub(1, Ordering::AcqRel);
}

/// Number of frames currently allocated.
pub fn frames_in_use() -> usize {
    FRAMES_IN_USE.load(Ordering::Acquire)
}

/// Translate a frame address into a kernel-accessible pointer.
///
/// Frames come from the kernel heap, so the translation is the identity;
/// a platform with a physical-memory window would apply its offset here.
pub fn phys_to_virt(pa: PhysicalAddress) -> *mut u8 {
    pa.as_u64() as *mut u8
}

/// Byte view of one frame.
///
/// # Safety
///
/// The caller must hold a reference that keeps the frame allocated for
/// the lifetime of the slice and must not alias a concurrent mutable
/// view of the same frame.
pub unsafe fn frame_bytes<'a>(pa: PhysicalAddress) -> &'a mut [u8] {
    // SAFETY: deferred to the caller per the function contract.
    unsafe { core::slice::from_raw_parts_mut(phys_to_virt(pa), FRAME_SIZE) }
}

/// One physical frame plus the bookkeeping the VM layer needs: how many
/// anonymous objects share it, whether it has been written since it was
/// filled, and the object offset it backs.
#[derive(Debug)]
pub struct Page {
    phys: PhysicalAddress,
    owners: AtomicU32,
    dirty: AtomicBool,
    offset: u64,
}

impl Page {
    /// Allocate a zero-filled page with a single owner.
    pub fn alloc_zeroed(offset: u64) -> KernelResult<Arc<Self>> {
        let phys = allocate_frame()?;
        Ok(Arc::new(Self {
            phys,
            owners: AtomicU32::new(1),
            dirty: AtomicBool::new(false),
            offset,
        }))
    }

    /// Allocate a page containing a byte copy of `src`'s frame.
    pub fn alloc_copy_of_frame(src: PhysicalAddress, offset: u64) -> KernelResult<Arc<Self>> {
        let page = Self::alloc_zeroed(offset)?;
        // SAFETY: both frames are live (src is kept alive by the caller,
        // dst was just allocated) and distinct.
        unsafe {
            core::ptr::copy_nonoverlapping(phys_to_virt(src), phys_to_virt(page.phys), FRAME_SIZE);
        }
        Ok(page)
    }

    pub fn phys(&self) -> PhysicalAddress {
        self.phys
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// How many anonymous objects currently reference this page.
    pub fn owner_count(&self) -> u32 {
        self.owners.load(Ordering::Acquire)
    }

    /// Add an owner (a second object began sharing the page).
    pub fn retain(&self) {
        self.owners.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop an owner; returns the remaining count. The frame itself is
    /// reclaimed when the last `Arc` goes away, which coincides with the
    /// count reaching zero when every owner holds exactly one reference.
    pub fn release(&self) -> u32 {
        let prev = self.owners.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "page owner count underflow");
        prev - 1
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        free_frame(self.phys);
    }
}

/// Frame arena bring-up hook. The heap-backed arena has no setup of its
/// own; the message keeps the boot log shape consistent.
pub fn init() {
    println!("[MM] Frame arena ready");
}

/// Serializes tests that allocate frames, so assertions against the
/// global in-use counter do not observe a concurrent test's frames.
#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn test_arena_lock() -> spin::MutexGuard<'static, ()> {
    static LOCK: spin::Mutex<()> = spin::Mutex::new(());
    LOCK.lock()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_frame_accounting() {
        let _guard = test_arena_lock();
        let before = frames_in_use();
        let pa = allocate_frame().unwrap();
        assert_eq!(frames_in_use(), before + 1);
        // Fresh frames are zeroed.
        // SAFETY: the frame was just allocated and is exclusively ours.
        let bytes = unsafe { frame_bytes(pa) };
        assert!(bytes.iter().all(|&b| b == 0));
        free_frame(pa);
        assert_eq!(frames_in_use(), before);
    }

    #[test]
    fn test_page_lifecycle_frees_frame() {
        let _guard = test_arena_lock();
        let before = frames_in_use();
        let page = Page::alloc_zeroed(0).unwrap();
        assert_eq!(page.owner_count(), 1);
        assert!(!page.is_dirty());
        assert_eq!(frames_in_use(), before + 1);
        assert_eq!(page.release(), 0);
        drop(page);
        assert_eq!(frames_in_use(), before);
    }

    #[test]
    fn test_page_copy_duplicates_contents() {
        let _guard = test_arena_lock();
        let src = Page::alloc_zeroed(0).unwrap();
        // SAFETY: src was just allocated and is exclusively ours.
        unsafe { frame_bytes(src.phys())[123] = 0xA5 };
        let dst = Page::alloc_copy_of_frame(src.phys(), 0).unwrap();
        // SAFETY: dst was just allocated and is exclusively ours.
        assert_eq!(unsafe { frame_bytes(dst.phys())[123] }, 0xA5);
        assert_ne!(src.phys(), dst.phys());
    }
}
