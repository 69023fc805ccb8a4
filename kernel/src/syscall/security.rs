//! Security syscalls.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    mm::{uaccess, VirtualAddress},
    process::{self, ObjectRef},
    security::{
        self, Acl, AclEntry, AclEntryKind, Privileges, SecurityContext, SecurityToken,
        ACL_MAX_ENTRIES, MAX_GROUPS,
    },
    syscall::{UserAclEntry, UserObjectSecurity, UserSecurityContext},
};

fn decode_privileges(raw: u64) -> KernelResult<Privileges> {
    Privileges::from_bits(raw).ok_or(KernelError::InvalidArgument {
        what: "privilege bits",
    })
}

fn decode_context(user: &UserSecurityContext) -> KernelResult<SecurityContext> {
    let count = user.group_count as usize;
    if count > MAX_GROUPS {
        return Err(KernelError::InvalidArgument {
            what: "group count",
        });
    }
    Ok(SecurityContext {
        uid: user.uid,
        gid: user.gid,
        groups: user.groups[..count].to_vec(),
        effective: decode_privileges(user.effective)?,
        inherit: decode_privileges(user.inherit)?,
    })
}

fn encode_context(token: &SecurityToken) -> UserSecurityContext {
    let groups = token.groups();
    let mut user = UserSecurityContext {
        uid: token.uid(),
        gid: token.gid(),
        group_count: groups.len() as u32,
        groups: [-1; MAX_GROUPS],
        effective: token.effective().bits(),
        inherit: token.inherit().bits(),
    };
    user.groups[..groups.len()].copy_from_slice(groups);
    user
}

fn decode_acl_entry(user: &UserAclEntry) -> KernelResult<AclEntry> {
    let kind = match user.kind {
        0 => AclEntryKind::User,
        1 => AclEntryKind::Group,
        2 => AclEntryKind::Others,
        3 => AclEntryKind::Session,
        4 => AclEntryKind::Capability,
        _ => {
            return Err(KernelError::InvalidArgument {
                what: "acl entry kind",
            })
        }
    };
    let rights = security::Rights::from_bits(user.rights).ok_or(KernelError::InvalidArgument {
        what: "acl rights",
    })?;
    Ok(AclEntry {
        kind,
        value: user.value,
        rights,
    })
}

/// `token_create(&ctx, &out_handle)`
pub fn sys_token_create(args: &[usize; 6]) -> KernelResult<isize> {
    let process = process::current_process();
    let user_ctx: UserSecurityContext =
        uaccess::read_val(process.space(), VirtualAddress::new(args[0] as u64))?;
    let ctx = decode_context(&user_ctx)?;

    let token = SecurityToken::create(&security::current_token(), &ctx)?;
    let handle = process.attach_handle(ObjectRef::Token(token))?;
    uaccess::write_val(process.space(), VirtualAddress::new(args[1] as u64), &handle)?;
    Ok(0)
}

/// `token_query(handle, &out_ctx)`
pub fn sys_token_query(args: &[usize; 6]) -> KernelResult<isize> {
    let process = process::current_process();
    let object = process.lookup_handle(args[0] as u32)?;
    let token = object.as_token().ok_or(KernelError::InvalidArgument {
        what: "handle is not a token",
    })?;
    uaccess::write_val(
        process.space(),
        VirtualAddress::new(args[1] as u64),
        &encode_context(token),
    )?;
    Ok(0)
}

/// `token_current(&out_ctx)` — the caller's active token.
pub fn sys_token_current(args: &[usize; 6]) -> KernelResult<isize> {
    let process = process::current_process();
    let token = security::current_token();
    uaccess::write_val(
        process.space(),
        VirtualAddress::new(args[0] as u64),
        &encode_context(&token),
    )?;
    Ok(0)
}

/// Objects carrying security attributes; ports are the only such core
/// object.
fn securable_port(object: &ObjectRef) -> KernelResult<&Arc<crate::ipc::Port>> {
    object.as_port().ok_or(KernelError::NotSupported {
        operation: "object security on this object",
    })
}

/// `object_security_get(handle, &uid?, &gid?, &acl?)`
pub fn sys_object_security_get(args: &[usize; 6]) -> KernelResult<isize> {
    let process = process::current_process();
    let object = process.lookup_handle(args[0] as u32)?;
    let security = securable_port(&object)?.security();

    if args[1] != 0 {
        uaccess::write_val(
            process.space(),
            VirtualAddress::new(args[1] as u64),
            &security.uid(),
        )?;
    }
    if args[2] != 0 {
        uaccess::write_val(
            process.space(),
            VirtualAddress::new(args[2] as u64),
            &security.gid(),
        )?;
    }
    if args[3] != 0 {
        let mut user = UserObjectSecurity {
            uid: security.uid(),
            gid: security.gid(),
            entry_count: security.acl().entries().len() as u32,
            entries: [UserAclEntry {
                kind: 0,
                rights: 0,
                value: 0,
            }; ACL_MAX_ENTRIES],
        };
        for (dst, entry) in user.entries.iter_mut().zip(security.acl().entries()) {
            *dst = UserAclEntry {
                kind: match entry.kind {
                    AclEntryKind::User => 0,
                    AclEntryKind::Group => 1,
                    AclEntryKind::Others => 2,
                    AclEntryKind::Session => 3,
                    AclEntryKind::Capability => 4,
                },
                rights: entry.rights.bits(),
                value: entry.value,
            };
        }
        uaccess::write_val(process.space(), VirtualAddress::new(args[3] as u64), &user)?;
    }
    Ok(0)
}

/// `object_security_set(handle, &sec)`
pub fn sys_object_security_set(args: &[usize; 6]) -> KernelResult<isize> {
    let process = process::current_process();
    let object = process.lookup_handle(args[0] as u32)?;
    let port = securable_port(&object)?;

    let user: UserObjectSecurity =
        uaccess::read_val(process.space(), VirtualAddress::new(args[1] as u64))?;
    let count = user.entry_count as usize;
    if count > ACL_MAX_ENTRIES {
        return Err(KernelError::TooLarge {
            size: count,
            max: ACL_MAX_ENTRIES,
        });
    }
    let entries: Vec<AclEntry> = user.entries[..count]
        .iter()
        .map(decode_acl_entry)
        .collect::<KernelResult<_>>()?;
    let acl = Acl::from_entries(&entries)?;
    port.update_security(user.uid, user.gid, acl)?;
    Ok(0)
}
