//! Object security: ownership and access control lists.
//!
//! Every securable kernel object carries an owner uid/gid, a
//! user-modifiable ACL and a system ACL. The user ACL follows classic
//! first-match-wins semantics over the user/group/others classes, with
//! session and capability entries always unioned in; the system ACL
//! unions every matching entry. ACLs are canonicalized on ingress.

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::{
    error::{KernelError, KernelResult},
    security::token::{Privileges, SecurityToken},
};

/// Upper bound on entries per ACL after canonicalization.
pub const ACL_MAX_ENTRIES: usize = 64;

bitflags! {
    /// Rights grantable through an ACL entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Rights: u32 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Open a connection to a port.
        const CONNECT = 1 << 3;
        /// Modify the object's security attributes.
        const MODIFY  = 1 << 4;
        const DESTROY = 1 << 5;
    }
}

/// Who an ACL entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclEntryKind {
    /// A specific uid.
    User,
    /// A specific gid (primary or supplementary).
    Group,
    /// Every caller not matched by a user or group entry.
    Others,
    /// Callers in a specific session.
    Session,
    /// Callers whose effective set holds the privilege at bit `value`.
    Capability,
}

/// One (type, value, rights) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclEntry {
    pub kind: AclEntryKind,
    pub value: i64,
    pub rights: Rights,
}

impl AclEntry {
    pub fn user(uid: i32, rights: Rights) -> Self {
        Self {
            kind: AclEntryKind::User,
            value: uid as i64,
            rights,
        }
    }

    pub fn group(gid: i32, rights: Rights) -> Self {
        Self {
            kind: AclEntryKind::Group,
            value: gid as i64,
            rights,
        }
    }

    pub fn others(rights: Rights) -> Self {
        Self {
            kind: AclEntryKind::Others,
            value: 0,
            rights,
        }
    }

    pub fn session(session: u32, rights: Rights) -> Self {
        Self {
            kind: AclEntryKind::Session,
            value: session as i64,
            rights,
        }
    }

    pub fn capability(bit: u32, rights: Rights) -> Self {
        Self {
            kind: AclEntryKind::Capability,
            value: bit as i64,
            rights,
        }
    }

    /// Structurally valid: identifiers in range for their kind.
    fn is_valid(&self) -> bool {
        match self.kind {
            AclEntryKind::User | AclEntryKind::Group => {
                self.value >= 0 && self.value <= i32::MAX as i64
            }
            AclEntryKind::Others => true,
            AclEntryKind::Session => self.value >= 0 && self.value <= u32::MAX as i64,
            AclEntryKind::Capability => {
                self.value >= 0 && Privileges::from_bit(self.value as u32).is_some()
            }
        }
    }

    fn matches(&self, token: &SecurityToken, session: u32) -> bool {
        match self.kind {
            AclEntryKind::User => self.value == token.uid() as i64,
            AclEntryKind::Group => token.in_group(self.value as i32),
            AclEntryKind::Others => true,
            AclEntryKind::Session => self.value == session as i64,
            AclEntryKind::Capability => Privileges::from_bit(self.value as u32)
                .map(|p| token.has_privilege(p))
                .unwrap_or(false),
        }
    }
}

/// A canonical access control list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    entries: Vec<AclEntry>,
}

impl Acl {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Canonicalize `entries` into an ACL: invalid entries are dropped,
    /// duplicates (same kind and value) merge their rights, and the
    /// result must fit the length bound.
    pub fn from_entries(entries: &[AclEntry]) -> KernelResult<Self> {
        let mut canonical: Vec<AclEntry> = Vec::new();
        for entry in entries.iter().filter(|e| e.is_valid()) {
            // Others and session entries with equal values are duplicates
            // too; the value field distinguishes everything needed.
            match canonical
                .iter_mut()
                .find(|c| c.kind == entry.kind && c.value == entry.value)
            {
                Some(existing) => existing.rights |= entry.rights,
                None => canonical.push(*entry),
            }
        }
        if canonical.len() > ACL_MAX_ENTRIES {
            return Err(KernelError::TooLarge {
                size: canonical.len(),
                max: ACL_MAX_ENTRIES,
            });
        }
        Ok(Self { entries: canonical })
    }

    pub fn entries(&self) -> &[AclEntry] {
        &self.entries
    }

    /// User-ACL evaluation: first-match-wins across the identity classes
    /// (any matching user entry, else the union of matching group
    /// entries, else others), with session and capability entries always
    /// unioned in.
    fn rights_classic(&self, token: &SecurityToken, session: u32) -> Rights {
        let mut rights = Rights::empty();
        let mut identity: Option<Rights> = None;

        if let Some(user) = self
            .entries
            .iter()
            .find(|e| e.kind == AclEntryKind::User && e.matches(token, session))
        {
            identity = Some(user.rights);
        }
        if identity.is_none() {
            let mut group_rights = Rights::empty();
            let mut group_matched = false;
            for entry in self
                .entries
                .iter()
                .filter(|e| e.kind == AclEntryKind::Group && e.matches(token, session))
            {
                group_rights |= entry.rights;
                group_matched = true;
            }
            if group_matched {
                identity = Some(group_rights);
            }
        }
        if identity.is_none() {
            identity = self
                .entries
                .iter()
                .find(|e| e.kind == AclEntryKind::Others)
                .map(|e| e.rights);
        }
        rights |= identity.unwrap_or(Rights::empty());

        for entry in self.entries.iter().filter(|e| {
            matches!(e.kind, AclEntryKind::Session | AclEntryKind::Capability)
                && e.matches(token, session)
        }) {
            rights |= entry.rights;
        }
        rights
    }

    /// System-ACL evaluation: union of every matching entry.
    fn rights_union(&self, token: &SecurityToken, session: u32) -> Rights {
        self.entries
            .iter()
            .filter(|e| e.matches(token, session))
            .fold(Rights::empty(), |acc, e| acc | e.rights)
    }
}

/// The security attributes carried by every securable object.
#[derive(Debug, Clone)]
pub struct ObjectSecurity {
    uid: i32,
    gid: i32,
    acl: Acl,
    sacl: Acl,
}

impl ObjectSecurity {
    pub fn new(uid: i32, gid: i32, acl: Acl) -> Self {
        Self {
            uid,
            gid,
            acl,
            sacl: Acl::new(),
        }
    }

    /// Attributes for an object created by `token`, with the given
    /// initial user ACL.
    pub fn for_creator(token: &SecurityToken, acl: Acl) -> Self {
        Self::new(token.uid(), token.gid(), acl)
    }

    pub fn uid(&self) -> i32 {
        self.uid
    }

    pub fn gid(&self) -> i32 {
        self.gid
    }

    pub fn acl(&self) -> &Acl {
        &self.acl
    }

    pub fn system_acl(&self) -> &Acl {
        &self.sacl
    }

    /// Rights `token` holds on this object: the user ACL's classic
    /// semantics combined with the system ACL's union.
    pub fn rights_for(&self, token: &SecurityToken, session: u32) -> Rights {
        self.acl.rights_classic(token, session) | self.sacl.rights_union(token, session)
    }

    /// Replace the security attributes. Allowed for the owner and for
    /// holders of the MODIFY right; ownership changes additionally
    /// require `CHANGE_OWNER` unless the caller keeps them unchanged.
    pub fn update(
        &mut self,
        token: &SecurityToken,
        session: u32,
        uid: i32,
        gid: i32,
        acl: Acl,
    ) -> KernelResult<()> {
        let is_owner = token.uid() == self.uid || token.has_privilege(Privileges::ADMIN);
        if !is_owner && !self.rights_for(token, session).contains(Rights::MODIFY) {
            return Err(KernelError::AccessDenied);
        }
        if (uid != self.uid || gid != self.gid)
            && !token.has_privilege(Privileges::CHANGE_OWNER)
        {
            return Err(KernelError::PermissionDenied {
                privilege: "change_owner",
            });
        }
        self.uid = uid;
        self.gid = gid;
        self.acl = acl;
        Ok(())
    }

    /// Install a system ACL. Kernel-internal surface.
    pub fn set_system_acl(&mut self, sacl: Acl) {
        self.sacl = sacl;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::security::{self, token::SecurityContext};
    use alloc::{sync::Arc, vec};

    fn token(uid: i32, gid: i32, groups: Vec<i32>) -> Arc<SecurityToken> {
        SecurityToken::create(
            &security::system_token(),
            &SecurityContext {
                uid,
                gid,
                groups,
                effective: Privileges::empty(),
                inherit: Privileges::empty(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_user_entry_wins_over_group_and_others() {
        let acl = Acl::from_entries(&[
            AclEntry::others(Rights::READ | Rights::WRITE),
            AclEntry::group(50, Rights::READ | Rights::CONNECT),
            AclEntry::user(10, Rights::READ),
        ])
        .unwrap();
        let sec = ObjectSecurity::new(10, 50, acl);

        // uid matches: group and others are ignored.
        let caller = token(10, 50, vec![]);
        assert_eq!(sec.rights_for(&caller, 0), Rights::READ);

        // No user match, group matches.
        let grouped = token(11, 50, vec![]);
        assert_eq!(sec.rights_for(&grouped, 0), Rights::READ | Rights::CONNECT);

        // Neither: others.
        let other = token(12, 51, vec![]);
        assert_eq!(sec.rights_for(&other, 0), Rights::READ | Rights::WRITE);
    }

    #[test]
    fn test_session_and_capability_union() {
        let acl = Acl::from_entries(&[
            AclEntry::user(10, Rights::READ),
            AclEntry::session(7, Rights::CONNECT),
            AclEntry::capability(0, Rights::MODIFY), // bit 0 = ADMIN
        ])
        .unwrap();
        let sec = ObjectSecurity::new(10, 10, acl);

        // Session rights union with the identity match.
        let caller = token(10, 10, vec![]);
        assert_eq!(sec.rights_for(&caller, 7), Rights::READ | Rights::CONNECT);
        assert_eq!(sec.rights_for(&caller, 8), Rights::READ);

        // Capability entry matches the system token's ADMIN bit.
        let admin = security::system_token();
        assert!(sec.rights_for(&admin, 8).contains(Rights::MODIFY));
    }

    #[test]
    fn test_canonicalization_merges_and_drops() {
        let acl = Acl::from_entries(&[
            AclEntry::user(10, Rights::READ),
            AclEntry::user(10, Rights::WRITE),
            AclEntry::user(-5, Rights::DESTROY), // invalid uid: dropped
            AclEntry::capability(63, Rights::READ), // undefined privilege bit: dropped
        ])
        .unwrap();
        assert_eq!(acl.entries().len(), 1);
        assert_eq!(acl.entries()[0].rights, Rights::READ | Rights::WRITE);
    }

    #[test]
    fn test_canonicalization_bounds_length() {
        let entries: Vec<AclEntry> = (0..(ACL_MAX_ENTRIES as i32 + 1))
            .map(|i| AclEntry::user(i, Rights::READ))
            .collect();
        assert!(matches!(
            Acl::from_entries(&entries),
            Err(KernelError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_update_requires_owner_or_modify() {
        let acl = Acl::from_entries(&[AclEntry::others(Rights::READ)]).unwrap();
        let mut sec = ObjectSecurity::new(10, 10, acl.clone());

        let stranger = token(11, 11, vec![]);
        assert_eq!(
            sec.update(&stranger, 0, 10, 10, acl.clone()),
            Err(KernelError::AccessDenied)
        );

        let owner = token(10, 10, vec![]);
        assert!(sec.update(&owner, 0, 10, 10, acl.clone()).is_ok());

        // Ownership transfer needs CHANGE_OWNER.
        assert!(matches!(
            sec.update(&owner, 0, 11, 10, acl.clone()),
            Err(KernelError::PermissionDenied { .. })
        ));
        assert!(sec
            .update(&security::system_token(), 0, 11, 10, acl)
            .is_ok());
    }
}
