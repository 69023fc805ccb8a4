//! Port, connection and message syscalls.

use alloc::sync::Arc;

use crate::{
    error::{KernelError, KernelResult},
    ipc::{
        self, header_flags, ConnectionState, Endpoint, IpcFlags, Message, MessageHeader, Port,
        DATA_MAX,
    },
    mm::{uaccess, VirtualAddress},
    process::{self, ObjectRef},
    syscall::UserSecurityContext,
};

fn endpoint_arg(handle: usize) -> KernelResult<Arc<Endpoint>> {
    let object = process::current_process().lookup_handle(handle as u32)?;
    object
        .as_endpoint()
        .cloned()
        .ok_or(KernelError::InvalidArgument {
            what: "handle is not an endpoint",
        })
}

/// `port_create(&out_handle)`
pub fn sys_port_create(args: &[usize; 6]) -> KernelResult<isize> {
    let out_handle = VirtualAddress::new(args[0] as u64);
    let process = process::current_process();
    let port = Port::create()?;
    let handle = process.attach_handle(ObjectRef::Port(port))?;
    uaccess::write_val(process.space(), out_handle, &handle)?;
    Ok(0)
}

/// `port_listen(handle, timeout, &out_endpoint)`
pub fn sys_port_listen(args: &[usize; 6]) -> KernelResult<isize> {
    let process = process::current_process();
    let object = process.lookup_handle(args[0] as u32)?;
    let port = object.as_port().ok_or(KernelError::InvalidArgument {
        what: "handle is not a port",
    })?;
    let out_endpoint = VirtualAddress::new(args[2] as u64);

    let endpoint = ipc::listen(port, args[1] as i64, true)?;
    let handle = process.attach_handle(ObjectRef::Endpoint(endpoint))?;
    uaccess::write_val(process.space(), out_endpoint, &handle)?;
    Ok(0)
}

/// `connect(port_or_special, timeout, &out_endpoint)`
pub fn sys_connect(args: &[usize; 6]) -> KernelResult<isize> {
    let port = Port::resolve(args[0] as i32)?;
    let out_endpoint = VirtualAddress::new(args[2] as u64);

    let endpoint = ipc::connect(&port, args[1] as i64, true)?;
    let process = process::current_process();
    let handle = process.attach_handle(ObjectRef::Endpoint(endpoint))?;
    uaccess::write_val(process.space(), out_endpoint, &handle)?;
    Ok(0)
}

/// `connection_status(endpoint)` — returns the state as a small code.
pub fn sys_connection_status(args: &[usize; 6]) -> KernelResult<isize> {
    let endpoint = endpoint_arg(args[0])?;
    Ok(match endpoint.status() {
        ConnectionState::Setup => 0,
        ConnectionState::Active => 1,
        ConnectionState::Closed => 2,
    })
}

/// `connection_open_remote(endpoint, &out_process)`
pub fn sys_connection_open_remote(args: &[usize; 6]) -> KernelResult<isize> {
    let endpoint = endpoint_arg(args[0])?;
    let out_process = VirtualAddress::new(args[1] as u64);
    let remote = endpoint.remote().ok_or(KernelError::NotFound {
        resource: "remote process",
    })?;
    let process = process::current_process();
    uaccess::write_val(process.space(), out_process, &remote.0)?;
    Ok(0)
}

/// `send(endpoint, &msg_header, data?, handle?, timeout)`
pub fn sys_send(args: &[usize; 6]) -> KernelResult<isize> {
    let endpoint = endpoint_arg(args[0])?;
    let process = process::current_process();
    let header: MessageHeader =
        uaccess::read_val(process.space(), VirtualAddress::new(args[1] as u64))?;

    let size = header.size as usize;
    if size > DATA_MAX {
        return Err(KernelError::TooLarge {
            size,
            max: DATA_MAX,
        });
    }

    let mut msg = Message::new(header.msg_type);
    if size > 0 {
        let data =
            uaccess::copy_from(process.space(), VirtualAddress::new(args[2] as u64), size)?;
        msg = msg.with_data(data.into_boxed_slice())?;
    }
    if header.flags & header_flags::HAS_HANDLE != 0 {
        let object = process.lookup_handle(args[3] as u32)?;
        msg = msg.with_handle(object)?;
    }

    // FORCE is reserved for in-kernel senders and never decodes from
    // the user header.
    let mut flags = IpcFlags::INTERRUPTIBLE;
    if header.flags & header_flags::HAS_SECURITY != 0 {
        flags |= IpcFlags::ATTACH_SECURITY;
    }
    endpoint.send(msg, flags, args[4] as i64)?;
    Ok(0)
}

/// `receive(endpoint, &out_msg, &out_security?, timeout)`
pub fn sys_receive(args: &[usize; 6]) -> KernelResult<isize> {
    let endpoint = endpoint_arg(args[0])?;
    let out_header = VirtualAddress::new(args[1] as u64);

    let received = endpoint.receive(IpcFlags::INTERRUPTIBLE, args[3] as i64)?;
    let process = process::current_process();
    uaccess::write_val(process.space(), out_header, &received.header())?;

    if args[2] != 0 {
        if let Some(ctx) = &received.security {
            let mut user_ctx = UserSecurityContext {
                uid: ctx.uid,
                gid: ctx.gid,
                group_count: ctx.groups.len() as u32,
                groups: [-1; crate::security::MAX_GROUPS],
                effective: ctx.effective.bits(),
                inherit: ctx.inherit.bits(),
            };
            user_ctx.groups[..ctx.groups.len()].copy_from_slice(&ctx.groups);
            uaccess::write_val(
                process.space(),
                VirtualAddress::new(args[2] as u64),
                &user_ctx,
            )?;
        }
    }
    Ok(0)
}

/// `receive_data(endpoint, user_buf?)` — claims the pending payload.
/// A null buffer discards it. Returns the payload length.
pub fn sys_receive_data(args: &[usize; 6]) -> KernelResult<isize> {
    let endpoint = endpoint_arg(args[0])?;
    let data = match endpoint.take_data() {
        Some(data) => data,
        None => return Ok(0),
    };
    if args[1] != 0 {
        let process = process::current_process();
        uaccess::copy_to(process.space(), VirtualAddress::new(args[1] as u64), &data)?;
    }
    Ok(data.len() as isize)
}

/// `receive_handle(endpoint, &out_handle)` — claims the pending handle,
/// installing it in the caller's table. Port ownership follows the
/// handle.
pub fn sys_receive_handle(args: &[usize; 6]) -> KernelResult<isize> {
    let endpoint = endpoint_arg(args[0])?;
    let out_handle = VirtualAddress::new(args[1] as u64);
    let object = endpoint.take_handle().ok_or(KernelError::NotFound {
        resource: "pending handle",
    })?;
    let process = process::current_process();
    let handle = process.adopt_received_handle(object)?;
    uaccess::write_val(process.space(), out_handle, &handle)?;
    Ok(0)
}

/// `handle_close(handle)`
pub fn sys_handle_close(args: &[usize; 6]) -> KernelResult<isize> {
    process::current_process().close_handle(args[0] as u32)?;
    Ok(0)
}
