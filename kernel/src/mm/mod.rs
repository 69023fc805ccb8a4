//! Virtual memory management
//!
//! The per-address-space region tree, the copy-on-write anonymous
//! object, the software page-map driver and the frame arena. Page
//! faults arrive here from the architecture trap handler via [`fault`].

pub mod anon;
pub mod frame;
pub mod object;
pub mod page_map;
pub mod region;
pub mod space;
pub mod uaccess;

pub use anon::AnonObject;
pub use frame::{Page, FRAME_SIZE};
pub use object::{FaultInfo, VmObject};
pub use page_map::{MemoryType, PageMap};
pub use region::{AccessKind, FaultReason, MapFlags, Region, RegionFlags};
pub use space::AddressSpace;

/// Size of one page/frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// First virtual address available to user mappings.
pub const USER_BASE: u64 = 0x0000_0000_0001_0000;

/// Exclusive upper bound of user space; everything above the canonical
/// hole belongs to the shared kernel half.
pub const USER_TOP: u64 = 0x0000_8000_0000_0000;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }

    /// Round down to the containing page boundary.
    pub fn page_base(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u64 - 1))
    }

    pub fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    pub fn is_user(&self) -> bool {
        self.0 >= USER_BASE && self.0 < USER_TOP
    }
}

/// Whether a byte count is an exact multiple of the page size.
pub fn is_page_aligned(len: usize) -> bool {
    len % PAGE_SIZE == 0
}

/// Resolve a page fault against the current CPU's address space.
///
/// Returns `true` when the fault was resolved and the faulting access
/// can be retried; `false` (unhandled) when no address space is
/// installed, no region covers the address, or the region forbids the
/// access. The trap handler turns `false` into process termination.
pub fn fault(addr: VirtualAddress, reason: FaultReason, access: AccessKind) -> bool {
    match space::current_space() {
        Some(space) => space.fault(addr, reason, access),
        None => false,
    }
}

/// Initialize memory management bring-up state.
pub fn init() {
    frame::init();
    println!("[MM] Memory management initialized");
}
