//! The VM object interface.
//!
//! A VM object is a source of pages: anonymous memory, a file node, a
//! device aperture. The address-space manager talks to all of them
//! through this trait. Capabilities are optional with fallbacks: an
//! object without its own `fault` handler is served by the generic path
//! (which calls `page_get`), and an object without `copy_region` is
//! shared rather than copied across `duplicate`.

use alloc::sync::Arc;

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        frame::Page,
        page_map::PageMap,
        region::{AccessKind, FaultReason, Region, RegionFlags},
        VirtualAddress,
    },
};

/// Everything the arch trap handler knows about a fault.
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    pub addr: VirtualAddress,
    pub reason: FaultReason,
    pub access: AccessKind,
}

/// A provider of pages backing regions.
pub trait VmObject: Send + Sync {
    /// A region began covering `[offset, offset + len)`. Objects that
    /// track per-page coverage bump their counts here; objects with a
    /// backing source must reject non-private attachments.
    fn attach(&self, offset: u64, len: usize, flags: RegionFlags) -> KernelResult<()>;

    /// A region stopped covering `[offset, offset + len)`.
    fn detach(&self, offset: u64, len: usize);

    /// Clone `[offset, offset + len)` for copy-on-write duplication.
    /// The returned object is rebased: its offset 0 corresponds to
    /// `offset` here. Objects that cannot be copied report
    /// `not_supported` and are shared instead.
    fn copy_region(&self, _offset: u64, _len: usize) -> KernelResult<Arc<dyn VmObject>> {
        Err(KernelError::NotSupported {
            operation: "vm object copy",
        })
    }

    /// Object-specific fault handler. `None` routes the fault to the
    /// generic `page_get` path.
    fn fault(
        &self,
        _map: &PageMap,
        _region: &Region,
        _info: &FaultInfo,
    ) -> Option<KernelResult<()>> {
        None
    }

    /// Produce the page backing `offset`, materializing it if needed.
    fn page_get(&self, offset: u64) -> KernelResult<Arc<Page>>;

    /// Release a page previously produced by `page_get`.
    fn page_release(&self, _offset: u64, _page: Arc<Page>) {}

    /// A mapping of `offset` was torn down with the hardware dirty bit
    /// set; objects that track per-page dirty state record it here.
    fn page_dirty(&self, _offset: u64) {}
}
