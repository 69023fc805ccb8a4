//! Security tokens.
//!
//! A token is an immutable snapshot of identity (uid, gid, supplementary
//! groups) and privilege (effective and inheritable bitmaps). Tokens are
//! never mutated: every change mints a new token, and minting is only
//! possible from an existing token whose effective set covers the new
//! one. The boot-time system token carries every privilege.

use alloc::{sync::Arc, vec::Vec};

use bitflags::bitflags;

use crate::error::{KernelError, KernelResult};

/// Maximum supplementary groups per token.
pub const MAX_GROUPS: usize = 32;

bitflags! {
    /// Privilege bitmap.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Privileges: u64 {
        /// Blanket administrative override.
        const ADMIN           = 1 << 0;
        /// Change uid/gid/groups when minting a token.
        const CHANGE_IDENTITY = 1 << 1;
        /// Change ownership of objects not owned by the caller.
        const CHANGE_OWNER    = 1 << 2;
        /// Initiate system shutdown.
        const SHUTDOWN        = 1 << 3;
        /// Use kernel debugging interfaces.
        const DEBUG           = 1 << 4;
    }
}

impl Privileges {
    /// The privilege corresponding to bit position `bit`, if defined.
    pub fn from_bit(bit: u32) -> Option<Self> {
        if bit >= 64 {
            return None;
        }
        Self::from_bits(1 << bit)
    }
}

/// Identity and privilege attributes in exchange form, used to mint
/// tokens and to snapshot a sender's context onto a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    pub uid: i32,
    pub gid: i32,
    pub groups: Vec<i32>,
    pub effective: Privileges,
    pub inherit: Privileges,
}

impl SecurityContext {
    pub fn from_token(token: &SecurityToken) -> Self {
        Self {
            uid: token.uid(),
            gid: token.gid(),
            groups: token.groups().to_vec(),
            effective: token.effective(),
            inherit: token.inherit(),
        }
    }
}

/// An immutable identity + privilege snapshot.
#[derive(Debug)]
pub struct SecurityToken {
    uid: i32,
    gid: i32,
    /// Sorted ascending, padded with -1 so the negatives trail; identity
    /// comparison is then plain array equality.
    groups: [i32; MAX_GROUPS],
    effective: Privileges,
    inherit: Privileges,
    /// Set when effective != inherit: process creation must mint a
    /// reduced token instead of sharing this one.
    copy_on_inherit: bool,
}

impl SecurityToken {
    /// The boot token: root identity, every privilege.
    pub(super) fn system() -> Arc<Self> {
        Arc::new(Self {
            uid: 0,
            gid: 0,
            groups: [-1; MAX_GROUPS],
            effective: Privileges::all(),
            inherit: Privileges::all(),
            copy_on_inherit: false,
        })
    }

    /// Mint a token from `creator`'s authority.
    ///
    /// Rules: inheritable must be a subset of effective
    /// (`invalid_arg`), effective must be a subset of the creator's
    /// effective (`perm_denied`), and any identity change requires the
    /// creator to hold `CHANGE_IDENTITY` (`perm_denied`).
    pub fn create(creator: &SecurityToken, ctx: &SecurityContext) -> KernelResult<Arc<Self>> {
        if !ctx.effective.contains(ctx.inherit) {
            return Err(KernelError::InvalidArgument {
                what: "inheritable privileges exceed effective",
            });
        }
        if !creator.effective.contains(ctx.effective) {
            return Err(KernelError::PermissionDenied {
                privilege: "privilege escalation",
            });
        }

        let groups = normalize_groups(&ctx.groups)?;
        let identity_changed =
            ctx.uid != creator.uid || ctx.gid != creator.gid || groups != creator.groups;
        if identity_changed && !creator.has_privilege(Privileges::CHANGE_IDENTITY) {
            return Err(KernelError::PermissionDenied {
                privilege: "change_identity",
            });
        }

        Ok(Arc::new(Self {
            uid: ctx.uid,
            gid: ctx.gid,
            groups,
            effective: ctx.effective,
            inherit: ctx.inherit,
            copy_on_inherit: ctx.effective != ctx.inherit,
        }))
    }

    /// The token a child process receives. Tokens whose two bitmaps
    /// match are shared; otherwise the child gets a fresh token whose
    /// effective set collapses to the inheritable one.
    pub fn inherit_for_child(token: &Arc<Self>) -> Arc<Self> {
        if !token.copy_on_inherit {
            return Arc::clone(token);
        }
        Arc::new(Self {
            uid: token.uid,
            gid: token.gid,
            groups: token.groups,
            effective: token.inherit,
            inherit: token.inherit,
            copy_on_inherit: false,
        })
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn gid(&self) -> i32 {
        self.gid
    }

    /// The valid (non-negative) supplementary groups.
    pub fn groups(&self) -> &[i32] {
        let len = self.groups.iter().position(|&g| g < 0).unwrap_or(MAX_GROUPS);
        &self.groups[..len]
    }

    pub fn effective(&self) -> Privileges {
        self.effective
    }

    pub fn inherit(&self) -> Privileges {
        self.inherit
    }

    pub fn copy_on_inherit(&self) -> bool {
        self.copy_on_inherit
    }

    pub fn has_privilege(&self, privilege: Privileges) -> bool {
        self.effective.contains(privilege)
    }

    /// Whether the token's identity includes group `gid` (primary or
    /// supplementary).
    pub fn in_group(&self, gid: i32) -> bool {
        self.gid == gid || self.groups().contains(&gid)
    }

    /// Identity equality: uid, gid and the normalized group array.
    pub fn same_identity(&self, other: &SecurityToken) -> bool {
        self.uid == other.uid && self.gid == other.gid && self.groups == other.groups
    }
}

/// Sort and pad a group list so equality compares byte-for-byte:
/// valid ids ascending first, -1 padding trailing.
fn normalize_groups(groups: &[i32]) -> KernelResult<[i32; MAX_GROUPS]> {
    if groups.len() > MAX_GROUPS {
        return Err(KernelError::InvalidArgument {
            what: "too many supplementary groups",
        });
    }
    if groups.iter().any(|&g| g < 0) {
        return Err(KernelError::InvalidArgument {
            what: "negative group id",
        });
    }
    let mut sorted = [-1i32; MAX_GROUPS];
    sorted[..groups.len()].copy_from_slice(groups);
    sorted[..groups.len()].sort_unstable();
    Ok(sorted)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec;

    fn ctx(effective: Privileges, inherit: Privileges) -> SecurityContext {
        SecurityContext {
            uid: 0,
            gid: 0,
            groups: vec![],
            effective,
            inherit,
        }
    }

    #[test]
    fn test_create_rejects_escalation() {
        let system = SecurityToken::system();
        let limited = SecurityToken::create(
            &system,
            &ctx(Privileges::CHANGE_IDENTITY | Privileges::DEBUG, Privileges::empty()),
        )
        .unwrap();

        // {A, B} cannot mint {A, B, C}.
        let err = SecurityToken::create(
            &limited,
            &ctx(
                Privileges::CHANGE_IDENTITY | Privileges::DEBUG | Privileges::SHUTDOWN,
                Privileges::empty(),
            ),
        );
        assert!(matches!(err, Err(KernelError::PermissionDenied { .. })));

        // Subsets are fine.
        assert!(SecurityToken::create(
            &limited,
            &ctx(Privileges::DEBUG, Privileges::DEBUG)
        )
        .is_ok());
    }

    #[test]
    fn test_inherit_must_be_subset_of_effective() {
        let system = SecurityToken::system();
        let err = SecurityToken::create(
            &system,
            &ctx(
                Privileges::DEBUG,
                Privileges::DEBUG | Privileges::SHUTDOWN,
            ),
        );
        assert!(matches!(err, Err(KernelError::InvalidArgument { .. })));
    }

    #[test]
    fn test_identity_change_requires_privilege() {
        let system = SecurityToken::system();
        let unprivileged = SecurityToken::create(
            &system,
            &SecurityContext {
                uid: 100,
                gid: 100,
                groups: vec![],
                effective: Privileges::empty(),
                inherit: Privileges::empty(),
            },
        )
        .unwrap();

        let err = SecurityToken::create(
            &unprivileged,
            &SecurityContext {
                uid: 101,
                gid: 100,
                groups: vec![],
                effective: Privileges::empty(),
                inherit: Privileges::empty(),
            },
        );
        assert!(matches!(err, Err(KernelError::PermissionDenied { .. })));
    }

    #[test]
    fn test_groups_normalized_for_identity_compare() {
        let system = SecurityToken::system();
        let a = SecurityToken::create(
            &system,
            &SecurityContext {
                uid: 5,
                gid: 5,
                groups: vec![9, 3, 7],
                effective: Privileges::empty(),
                inherit: Privileges::empty(),
            },
        )
        .unwrap();
        let b = SecurityToken::create(
            &system,
            &SecurityContext {
                uid: 5,
                gid: 5,
                groups: vec![3, 7, 9],
                effective: Privileges::empty(),
                inherit: Privileges::empty(),
            },
        )
        .unwrap();
        assert!(a.same_identity(&b));
        assert_eq!(a.groups(), &[3, 7, 9]);
        assert!(a.in_group(7));
        assert!(!a.in_group(8));
    }

    #[test]
    fn test_copy_on_inherit_collapses_to_inheritable() {
        let system = SecurityToken::system();
        let token = SecurityToken::create(
            &system,
            &ctx(Privileges::DEBUG | Privileges::SHUTDOWN, Privileges::DEBUG),
        )
        .unwrap();
        assert!(token.copy_on_inherit());

        let child = SecurityToken::inherit_for_child(&token);
        assert_eq!(child.effective(), Privileges::DEBUG);
        assert_eq!(child.inherit(), Privileges::DEBUG);
        assert!(!child.copy_on_inherit());

        // Matching bitmaps share the token outright.
        let shared = SecurityToken::inherit_for_child(&child);
        assert!(Arc::ptr_eq(&shared, &child));
    }
}
