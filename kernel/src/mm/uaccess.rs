//! User-memory access.
//!
//! Syscall argument marshalling: copies between kernel buffers and a
//! target address space. Accesses walk the software page map; a miss or
//! a write to a read-only translation is resolved through the address
//! space's fault path exactly as the hardware access would be, then the
//! walk retries once. Unresolvable addresses surface `invalid_arg`.

use alloc::{vec, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    mm::{
        page_map::Probe,
        region::{AccessKind, FaultReason},
        space::AddressSpace,
        PhysicalAddress, VirtualAddress, PAGE_SIZE,
    },
};

/// Resolve one page of `va` for the given access, faulting it in if
/// needed.
fn resolve(space: &AddressSpace, va: VirtualAddress, write: bool) -> KernelResult<PhysicalAddress> {
    for _ in 0..2 {
        let probe = space.page_map().lock().probe(va, write);
        match probe {
            Probe::Hit(pa) => return Ok(pa),
            Probe::NotPresent => {
                let access = if write { AccessKind::Write } else { AccessKind::Read };
                if !space.fault(va, FaultReason::NotPresent, access) {
                    return Err(KernelError::InvalidArgument {
                        what: "unmapped user address",
                    });
                }
            }
            Probe::ReadOnly => {
                if !space.fault(va, FaultReason::Protection, AccessKind::Write) {
                    return Err(KernelError::InvalidArgument {
                        what: "write to read-only user address",
                    });
                }
            }
        }
    }
    // Two rounds of fault resolution did not yield a usable translation.
    Err(KernelError::InvalidArgument {
        what: "unresolvable user address",
    })
}

/// Copy `src` into the address space at `dst`.
pub fn copy_to(space: &AddressSpace, dst: VirtualAddress, src: &[u8]) -> KernelResult<()> {
    let mut copied = 0usize;
    while copied < src.len() {
        let va = dst.add(copied);
        let page_off = (va.as_u64() % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - page_off).min(src.len() - copied);
        let pa = resolve(space, va.page_base(), true)?;
        // SAFETY: `resolve` returned a live frame for this page and the
        // chunk stays within it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_ptr().add(copied),
                crate::mm::frame::phys_to_virt(pa).add(page_off),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy `len` bytes out of the address space at `src`.
pub fn copy_from(space: &AddressSpace, src: VirtualAddress, len: usize) -> KernelResult<Vec<u8>> {
    let mut out = vec![0u8; len];
    let mut copied = 0usize;
    while copied < len {
        let va = src.add(copied);
        let page_off = (va.as_u64() % PAGE_SIZE as u64) as usize;
        let chunk = (PAGE_SIZE - page_off).min(len - copied);
        let pa = resolve(space, va.page_base(), false)?;
        // SAFETY: `resolve` returned a live frame for this page and the
        // chunk stays within it.
        unsafe {
            core::ptr::copy_nonoverlapping(
                crate::mm::frame::phys_to_virt(pa).add(page_off),
                out.as_mut_ptr().add(copied),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(out)
}

/// Read one plain-data value from the address space.
pub fn read_val<T: Copy>(space: &AddressSpace, src: VirtualAddress) -> KernelResult<T> {
    let bytes = copy_from(space, src, core::mem::size_of::<T>())?;
    // SAFETY: the buffer holds size_of::<T>() bytes and T is plain data
    // per the Copy bound; read_unaligned tolerates any alignment.
    Ok(unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const T) })
}

/// Write one plain-data value into the address space.
pub fn write_val<T: Copy>(space: &AddressSpace, dst: VirtualAddress, val: &T) -> KernelResult<()> {
    // SAFETY: T is plain data per the Copy bound; the slice view covers
    // exactly the value.
    let bytes = unsafe {
        core::slice::from_raw_parts(val as *const T as *const u8, core::mem::size_of::<T>())
    };
    copy_to(space, dst, bytes)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::{frame, MapFlags};

    fn rw_private() -> MapFlags {
        MapFlags::READ | MapFlags::WRITE | MapFlags::PRIVATE
    }

    #[test]
    fn test_round_trip_across_page_boundary() {
        let _guard = frame::test_arena_lock();
        let space = AddressSpace::new();
        let base = space.map_anonymous(None, 2 * PAGE_SIZE, rw_private()).unwrap();

        let data: Vec<u8> = (0..512u32).map(|i| (i % 251) as u8).collect();
        let dst = base.add(PAGE_SIZE - 128);
        copy_to(&space, dst, &data).unwrap();
        assert_eq!(copy_from(&space, dst, data.len()).unwrap(), data);
    }

    #[test]
    fn test_unmapped_address_is_invalid() {
        let space = AddressSpace::new();
        let err = copy_to(&space, VirtualAddress::new(0x10000), &[1, 2, 3]);
        assert!(matches!(err, Err(KernelError::InvalidArgument { .. })));
    }

    #[test]
    fn test_write_to_readonly_region_is_invalid() {
        let _guard = frame::test_arena_lock();
        let space = AddressSpace::new();
        let base = space
            .map_anonymous(None, PAGE_SIZE, MapFlags::READ | MapFlags::PRIVATE)
            .unwrap();
        assert!(copy_from(&space, base, 8).is_ok());
        assert!(copy_to(&space, base, &[0xFF]).is_err());
    }

    #[test]
    fn test_typed_value_round_trip() {
        let _guard = frame::test_arena_lock();
        let space = AddressSpace::new();
        let base = space.map_anonymous(None, PAGE_SIZE, rw_private()).unwrap();
        write_val(&space, base.add(3), &0xDEAD_BEEF_u64).unwrap();
        assert_eq!(read_val::<u64>(&space, base.add(3)).unwrap(), 0xDEAD_BEEF_u64);
    }
}
