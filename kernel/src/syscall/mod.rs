//! System call surface.
//!
//! Numbered calls with up to six register arguments. Pointer arguments
//! are marshalled through [`crate::mm::uaccess`] against the calling
//! process's address space; errors surface as small negative integers,
//! success as zero or a handle. The dispatcher brackets each call with
//! the kernel-entry token latch discipline: whatever token the first
//! authorization check latches stays active until the call returns.

mod ipc;
mod mm;
mod security;

use crate::{
    error::KernelResult,
    process::thread,
    security::MAX_GROUPS,
};

// Address space
pub const SYS_MAP_ANON: usize = 0x10;
pub const SYS_MAP_FILE: usize = 0x11;
pub const SYS_UNMAP: usize = 0x12;

// Ports and connections
pub const SYS_PORT_CREATE: usize = 0x20;
pub const SYS_PORT_LISTEN: usize = 0x21;
pub const SYS_CONNECT: usize = 0x22;
pub const SYS_CONNECTION_STATUS: usize = 0x23;
pub const SYS_CONNECTION_OPEN_REMOTE: usize = 0x24;
pub const SYS_SEND: usize = 0x25;
pub const SYS_RECEIVE: usize = 0x26;
pub const SYS_RECEIVE_DATA: usize = 0x27;
pub const SYS_RECEIVE_HANDLE: usize = 0x28;

// Security
pub const SYS_TOKEN_CREATE: usize = 0x30;
pub const SYS_TOKEN_QUERY: usize = 0x31;
pub const SYS_TOKEN_CURRENT: usize = 0x32;
pub const SYS_OBJECT_SECURITY_GET: usize = 0x33;
pub const SYS_OBJECT_SECURITY_SET: usize = 0x34;

// Handles
pub const SYS_HANDLE_CLOSE: usize = 0x40;

/// Security context exchange format.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserSecurityContext {
    pub uid: i32,
    pub gid: i32,
    pub group_count: u32,
    pub groups: [i32; MAX_GROUPS],
    pub effective: u64,
    pub inherit: u64,
}

/// ACL entry exchange format. `kind`: 0 user, 1 group, 2 others,
/// 3 session, 4 capability.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserAclEntry {
    pub kind: u32,
    pub rights: u32,
    pub value: i64,
}

/// Object security exchange format.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct UserObjectSecurity {
    pub uid: i32,
    pub gid: i32,
    pub entry_count: u32,
    pub entries: [UserAclEntry; crate::security::ACL_MAX_ENTRIES],
}

/// Entry point used by the architecture syscall trap.
pub fn dispatch(number: usize, args: &[usize; 6]) -> isize {
    let result = dispatch_inner(number, args);
    // Return to userspace: drop the latched active token.
    thread::current_thread().kernel_exit();
    match result {
        Ok(value) => value,
        Err(e) => e.to_errno(),
    }
}

fn dispatch_inner(number: usize, args: &[usize; 6]) -> KernelResult<isize> {
    match number {
        SYS_MAP_ANON => mm::sys_map_anon(args),
        SYS_MAP_FILE => mm::sys_map_file(args),
        SYS_UNMAP => mm::sys_unmap(args),
        SYS_PORT_CREATE => ipc::sys_port_create(args),
        SYS_PORT_LISTEN => ipc::sys_port_listen(args),
        SYS_CONNECT => ipc::sys_connect(args),
        SYS_CONNECTION_STATUS => ipc::sys_connection_status(args),
        SYS_CONNECTION_OPEN_REMOTE => ipc::sys_connection_open_remote(args),
        SYS_SEND => ipc::sys_send(args),
        SYS_RECEIVE => ipc::sys_receive(args),
        SYS_RECEIVE_DATA => ipc::sys_receive_data(args),
        SYS_RECEIVE_HANDLE => ipc::sys_receive_handle(args),
        SYS_TOKEN_CREATE => security::sys_token_create(args),
        SYS_TOKEN_QUERY => security::sys_token_query(args),
        SYS_TOKEN_CURRENT => security::sys_token_current(args),
        SYS_OBJECT_SECURITY_GET => security::sys_object_security_get(args),
        SYS_OBJECT_SECURITY_SET => security::sys_object_security_set(args),
        SYS_HANDLE_CLOSE => ipc::sys_handle_close(args),
        _ => Err(crate::error::KernelError::InvalidArgument {
            what: "syscall number",
        }),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::{
        mm::{MapFlags, VirtualAddress, PAGE_SIZE},
        process::{self, Process},
        security as sec,
    };

    /// A process with one page of scratch "user" memory for syscall
    /// out-parameters.
    fn scratch_process(name: &str) -> (alloc::sync::Arc<Process>, VirtualAddress) {
        let process = Process::new(name, sec::system_token(), 1);
        process::adopt_current(&process);
        let scratch = process
            .space()
            .map_anonymous(
                None,
                PAGE_SIZE,
                MapFlags::READ | MapFlags::WRITE | MapFlags::PRIVATE,
            )
            .unwrap();
        (process, scratch)
    }

    #[test]
    fn test_map_anon_and_unmap_via_syscall() {
        let _guard = crate::mm::frame::test_arena_lock();
        let (process, scratch) = scratch_process("sys-map");

        let flags = (MapFlags::READ | MapFlags::WRITE | MapFlags::PRIVATE).bits() as usize;
        let out_addr = scratch.as_u64() as usize;
        let ret = dispatch(
            SYS_MAP_ANON,
            &[0, 4 * PAGE_SIZE, flags, out_addr, 0, 0],
        );
        assert_eq!(ret, 0);

        let mapped: u64 =
            crate::mm::uaccess::read_val(process.space(), scratch).unwrap();
        assert!(mapped >= crate::mm::USER_BASE);

        let ret = dispatch(SYS_UNMAP, &[mapped as usize, 4 * PAGE_SIZE, 0, 0, 0, 0]);
        assert_eq!(ret, 0);
    }

    #[test]
    fn test_invalid_syscall_number() {
        let (_process, _scratch) = scratch_process("sys-bad");
        assert_eq!(dispatch(0xFFFF, &[0; 6]), -1);
    }

    #[test]
    fn test_map_file_without_backing_object() {
        let (process, scratch) = scratch_process("sys-file");
        // A token handle is not a mappable object.
        let handle = process
            .attach_handle(process::ObjectRef::Token(sec::system_token()))
            .unwrap();
        let ret = dispatch(
            SYS_MAP_FILE,
            &[
                handle as usize,
                0,
                PAGE_SIZE,
                MapFlags::READ.bits() as usize,
                0,
                scratch.as_u64() as usize,
            ],
        );
        assert_eq!(
            ret,
            crate::error::KernelError::NotSupported { operation: "" }.to_errno()
        );
    }

    #[test]
    fn test_port_create_listen_would_block() {
        let _guard = crate::mm::frame::test_arena_lock();
        let (process, scratch) = scratch_process("sys-port");
        let out = scratch.as_u64() as usize;
        assert_eq!(dispatch(SYS_PORT_CREATE, &[out, 0, 0, 0, 0, 0]), 0);
        let handle: u32 = crate::mm::uaccess::read_val(process.space(), scratch).unwrap();

        // No connection waiting, timeout 0: would_block.
        let ret = dispatch(
            SYS_PORT_LISTEN,
            &[handle as usize, 0, out, 0, 0, 0],
        );
        assert_eq!(ret, crate::error::KernelError::WouldBlock.to_errno());

        assert_eq!(dispatch(SYS_HANDLE_CLOSE, &[handle as usize, 0, 0, 0, 0, 0]), 0);
    }

    #[test]
    fn test_message_round_trip_via_syscalls() {
        let _guard = crate::mm::frame::test_arena_lock();
        let (process, scratch) = scratch_process("sys-msg");
        let (a, b) = crate::ipc::Connection::create(8);
        let send_handle = process
            .attach_handle(process::ObjectRef::Endpoint(a))
            .unwrap();
        let recv_handle = process
            .attach_handle(process::ObjectRef::Endpoint(b))
            .unwrap();

        // Header and payload in "user" memory.
        let payload = b"ferron ipc";
        let header = crate::ipc::MessageHeader {
            msg_type: 77,
            size: payload.len() as u32,
            flags: 0,
            reserved: 0,
            timestamp_ns: 0,
        };
        let header_ptr = scratch;
        let data_ptr = scratch.add(64);
        crate::mm::uaccess::write_val(process.space(), header_ptr, &header).unwrap();
        crate::mm::uaccess::copy_to(process.space(), data_ptr, payload).unwrap();

        let ret = dispatch(
            SYS_SEND,
            &[
                send_handle as usize,
                header_ptr.as_u64() as usize,
                data_ptr.as_u64() as usize,
                0,
                0,
                0,
            ],
        );
        assert_eq!(ret, 0);

        let out_header = scratch.add(128);
        let out_data = scratch.add(256);
        let ret = dispatch(
            SYS_RECEIVE,
            &[
                recv_handle as usize,
                out_header.as_u64() as usize,
                0,
                0,
                0,
                0,
            ],
        );
        assert_eq!(ret, 0);
        let received: crate::ipc::MessageHeader =
            crate::mm::uaccess::read_val(process.space(), out_header).unwrap();
        assert_eq!(received.msg_type, 77);
        assert_eq!(received.size, payload.len() as u32);
        assert_eq!(received.flags, 0);

        let len = dispatch(
            SYS_RECEIVE_DATA,
            &[recv_handle as usize, out_data.as_u64() as usize, 0, 0, 0, 0],
        );
        assert_eq!(len, payload.len() as isize);
        let bytes =
            crate::mm::uaccess::copy_from(process.space(), out_data, payload.len()).unwrap();
        assert_eq!(&bytes, payload);
    }

    #[test]
    fn test_token_create_rejects_bad_inherit() {
        let _guard = crate::mm::frame::test_arena_lock();
        let (_process, scratch) = scratch_process("sys-token");
        let ctx = UserSecurityContext {
            uid: 0,
            gid: 0,
            group_count: 0,
            groups: [-1; MAX_GROUPS],
            effective: sec::Privileges::DEBUG.bits(),
            inherit: (sec::Privileges::DEBUG | sec::Privileges::SHUTDOWN).bits(),
        };
        let ctx_ptr = scratch;
        crate::mm::uaccess::write_val(process::current_process().space(), ctx_ptr, &ctx).unwrap();

        let out = scratch.as_u64() as usize + 0x800;
        let ret = dispatch(
            SYS_TOKEN_CREATE,
            &[ctx_ptr.as_u64() as usize, out, 0, 0, 0, 0],
        );
        assert_eq!(
            ret,
            crate::error::KernelError::InvalidArgument { what: "" }.to_errno()
        );
    }
}
