//! Security subsystem: tokens, privileges and object ACLs.
//!
//! Authorization always consults the *active* token: the token latched
//! by the current thread on its first query inside a kernel entry, so
//! every check within one syscall observes the same identity even if
//! the process token is swapped concurrently.

pub mod acl;
pub mod token;

use alloc::sync::Arc;

pub use acl::{Acl, AclEntry, AclEntryKind, ObjectSecurity, Rights, ACL_MAX_ENTRIES};
pub use token::{Privileges, SecurityContext, SecurityToken, MAX_GROUPS};

lazy_static::lazy_static! {
    /// The boot token; parent of every token in the system.
    static ref SYSTEM_TOKEN: Arc<SecurityToken> = SecurityToken::system();
}

/// The kernel's own all-privilege token.
pub fn system_token() -> Arc<SecurityToken> {
    Arc::clone(&SYSTEM_TOKEN)
}

/// The active token for the calling thread, latching it if this is the
/// first query in the current kernel entry.
pub fn current_token() -> Arc<SecurityToken> {
    crate::process::thread::current_thread().active_token()
}

/// Security bring-up: force the system token into existence.
pub fn init() {
    let _ = system_token();
    println!("[SECURITY] Security subsystem initialized");
}
