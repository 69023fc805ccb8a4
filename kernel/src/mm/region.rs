//! Regions: contiguous, flag-tagged virtual-address intervals.

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::mm::{object::VmObject, VirtualAddress};

bitflags! {
    /// Flags carried by an installed region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const EXEC     = 1 << 2;
        /// Copy-on-write semantics across `duplicate`; required for
        /// regions backed by a sourced object.
        const PRIVATE  = 1 << 3;
        /// Address-space reservation: occupies the range, carries no
        /// object, rejects faults, never overlaid by non-fixed placement.
        const RESERVED = 1 << 4;
    }
}

bitflags! {
    /// Flags accepted by the map syscalls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXEC    = 1 << 2;
        /// Fail placement rather than picking a free hole; existing
        /// overlap is unmapped first.
        const FIXED   = 1 << 3;
        const PRIVATE = 1 << 4;
    }
}

impl MapFlags {
    /// The region flags this request installs.
    pub fn region_flags(self) -> RegionFlags {
        let mut flags = RegionFlags::empty();
        if self.contains(Self::READ) {
            flags |= RegionFlags::READ;
        }
        if self.contains(Self::WRITE) {
            flags |= RegionFlags::WRITE;
        }
        if self.contains(Self::EXEC) {
            flags |= RegionFlags::EXEC;
        }
        if self.contains(Self::PRIVATE) {
            flags |= RegionFlags::PRIVATE;
        }
        flags
    }
}

/// The access class of a faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

/// Why the MMU raised a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultReason {
    /// No translation was installed for the address.
    NotPresent,
    /// A translation exists but forbids the access (write to a page
    /// mapped read-only).
    Protection,
}

/// A contiguous interval of one address space, backed by at most one VM
/// object. `end` is exclusive; both bounds are page-aligned.
pub struct Region {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: RegionFlags,
    pub object: Option<Arc<dyn VmObject>>,
    /// Byte offset into the object at which this region begins.
    pub offset: u64,
}

impl Region {
    pub fn new(
        start: VirtualAddress,
        end: VirtualAddress,
        flags: RegionFlags,
        object: Option<Arc<dyn VmObject>>,
        offset: u64,
    ) -> Self {
        debug_assert!(start.is_page_aligned() && end.is_page_aligned());
        debug_assert!(start < end);
        Self {
            start,
            end,
            flags,
            object,
            offset,
        }
    }

    /// A reservation covering `[start, end)`.
    pub fn reserved(start: VirtualAddress, end: VirtualAddress) -> Self {
        Self::new(start, end, RegionFlags::RESERVED, None, 0)
    }

    pub fn len(&self) -> usize {
        (self.end.as_u64() - self.start.as_u64()) as usize
    }

    pub fn contains(&self, addr: VirtualAddress) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn is_reserved(&self) -> bool {
        self.flags.contains(RegionFlags::RESERVED)
    }

    /// Whether the region's flags permit the given access.
    pub fn allows(&self, access: AccessKind) -> bool {
        match access {
            AccessKind::Read => self.flags.contains(RegionFlags::READ),
            AccessKind::Write => self.flags.contains(RegionFlags::WRITE),
            AccessKind::Execute => self.flags.contains(RegionFlags::EXEC),
        }
    }

    /// Object offset backing `addr`'s page.
    pub fn object_offset(&self, addr: VirtualAddress) -> u64 {
        debug_assert!(self.contains(addr));
        self.offset + (addr.page_base().as_u64() - self.start.as_u64())
    }

    /// Split off and return the tail `[at, end)`, leaving `self` as
    /// `[start, at)`. The tail inherits the object with an advanced
    /// offset; coverage counts are unchanged (the same bytes remain
    /// covered, now by two regions' halves).
    pub fn split_at(&mut self, at: VirtualAddress) -> Region {
        debug_assert!(at.is_page_aligned());
        debug_assert!(at > self.start && at < self.end);
        let tail = Region {
            start: at,
            end: self.end,
            flags: self.flags,
            object: self.object.clone(),
            offset: self.offset + (at.as_u64() - self.start.as_u64()),
        };
        self.end = at;
        tail
    }
}
