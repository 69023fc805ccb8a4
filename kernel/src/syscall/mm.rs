//! Address-space syscalls.

use crate::{
    error::{KernelError, KernelResult},
    mm::{uaccess, MapFlags, VirtualAddress},
    process,
};

fn decode_flags(raw: usize) -> KernelResult<MapFlags> {
    MapFlags::from_bits(raw as u32).ok_or(KernelError::InvalidArgument {
        what: "mapping flags",
    })
}

/// `map_anon(addr?, size, flags, &out_addr)`
pub fn sys_map_anon(args: &[usize; 6]) -> KernelResult<isize> {
    let hint = match args[0] {
        0 => None,
        addr => Some(VirtualAddress::new(addr as u64)),
    };
    let size = args[1];
    let flags = decode_flags(args[2])?;
    let out_addr = VirtualAddress::new(args[3] as u64);

    let process = process::current_process();
    let addr = process.space().map_anonymous(hint, size, flags)?;
    uaccess::write_val(process.space(), out_addr, &addr.as_u64())?;
    Ok(0)
}

/// `map_file(handle, addr?, size, flags, offset, &out_addr)`
///
/// Filesystem and device objects are contributed by their subsystems;
/// none of the core's handle-addressable objects back memory, so this
/// reports what the object cannot do rather than guessing.
pub fn sys_map_file(args: &[usize; 6]) -> KernelResult<isize> {
    let process = process::current_process();
    let object = process.lookup_handle(args[0] as u32)?;
    decode_flags(args[3])?;
    Err(KernelError::NotSupported {
        operation: match object.kind_name() {
            "port" => "mapping a port",
            "endpoint" => "mapping an endpoint",
            _ => "mapping this object",
        },
    })
}

/// `unmap(addr, size)`
pub fn sys_unmap(args: &[usize; 6]) -> KernelResult<isize> {
    let addr = VirtualAddress::new(args[0] as u64);
    let process = process::current_process();
    process.space().unmap(addr, args[1])?;
    Ok(0)
}
