//! Ports: named rendezvous endpoints for new connections.
//!
//! A port is owned by exactly one process. Prospective clients install
//! setup-state connections on the port's waiting list and block until
//! the owner accepts them with `listen`. Disowning a port (owner exit
//! or last owner handle dropped) hangs up every waiting connection and
//! makes the port unreachable; connections already active are not
//! affected.

use alloc::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    ipc::{
        connection::{Connection, Endpoint},
        message::QUEUE_MAX,
    },
    process::{self, ProcessId},
    security::{self, Acl, AclEntry, ObjectSecurity, Rights},
    sync::WaitQueue,
    timer::Deadline,
};

/// Lowest special port id; special ids are `[PORT_SPECIAL_MIN, -1]`.
pub const PORT_SPECIAL_MIN: i32 = -(crate::process::SPECIAL_PORT_MAX as i32);

/// The per-process root port id.
pub const PORT_ROOT: i32 = -1;

static NEXT_PORT_ID: AtomicU32 = AtomicU32::new(1);

lazy_static::lazy_static! {
    /// Port namespace: id -> port, for `connect` lookup.
    static ref PORT_REGISTRY: Mutex<BTreeMap<u32, Arc<Port>>> = Mutex::new(BTreeMap::new());
}

struct PortInner {
    /// Connections in setup state, oldest first.
    waiting: VecDeque<Arc<Connection>>,
    /// Connections accepted through this port.
    open: Vec<Weak<Connection>>,
    disowned: bool,
}

/// A connection rendezvous point.
pub struct Port {
    id: u32,
    owner: Mutex<Option<ProcessId>>,
    /// Handles to this port held by the owning process; zero disowns.
    owner_refs: AtomicU32,
    inner: Mutex<PortInner>,
    listen_wq: WaitQueue,
    security: Mutex<ObjectSecurity>,
}

impl Port {
    /// Create a port owned by the calling process and publish it in the
    /// namespace. The default ACL grants the creator everything and
    /// everyone else connect-only.
    pub fn create() -> KernelResult<Arc<Self>> {
        let token = security::current_token();
        let acl = Acl::from_entries(&[
            AclEntry::user(token.uid(), Rights::all()),
            AclEntry::others(Rights::CONNECT),
        ])?;

        let port = Arc::new(Self {
            id: NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed),
            owner: Mutex::new(Some(process::current_process().id())),
            owner_refs: AtomicU32::new(0),
            inner: Mutex::new(PortInner {
                waiting: VecDeque::new(),
                open: Vec::new(),
                disowned: false,
            }),
            listen_wq: WaitQueue::new(),
            security: Mutex::new(ObjectSecurity::for_creator(&token, acl)),
        });
        PORT_REGISTRY.lock().insert(port.id, Arc::clone(&port));
        Ok(port)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn owner(&self) -> Option<ProcessId> {
        *self.owner.lock()
    }

    pub fn security(&self) -> ObjectSecurity {
        self.security.lock().clone()
    }

    pub fn update_security(
        &self,
        uid: i32,
        gid: i32,
        acl: Acl,
    ) -> KernelResult<()> {
        let token = security::current_token();
        let session = process::current_process().session();
        self.security.lock().update(&token, session, uid, gid, acl)
    }

    /// Namespace lookup by positive id.
    pub fn lookup(id: u32) -> Option<Arc<Self>> {
        PORT_REGISTRY.lock().get(&id).cloned()
    }

    /// Resolve a connect target: non-negative ids name registry ports,
    /// ids in `[PORT_SPECIAL_MIN, -1]` name the calling process's
    /// well-known ports (-1 is the root port).
    pub fn resolve(id: i32) -> KernelResult<Arc<Self>> {
        if id >= 0 {
            return Self::lookup(id as u32).ok_or(KernelError::NotFound { resource: "port" });
        }
        if id < PORT_SPECIAL_MIN {
            return Err(KernelError::InvalidArgument {
                what: "special port id",
            });
        }
        let slot = (-id - 1) as usize;
        process::current_process()
            .special_port(slot)
            .ok_or(KernelError::NotFound {
                resource: "special port",
            })
    }

    /// One more owner handle.
    pub fn owner_ref(&self) {
        self.owner_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// One owner handle fewer; the last disowns the port.
    pub fn owner_unref(&self) {
        if self.owner_refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.disown();
        }
    }

    /// Ownership follows a transferred handle. Disowned ports stay
    /// dead.
    pub fn transfer_owner(&self, to: ProcessId) {
        let mut owner = self.owner.lock();
        if self.inner.lock().disowned {
            return;
        }
        *owner = Some(to);
        self.owner_refs.store(1, Ordering::Release);
    }

    /// Revoke ownership: hang up every waiting connection, wake any
    /// listener, drop the port from the namespace. Active connections
    /// continue until closed normally.
    pub fn disown(&self) {
        let waiting = {
            let mut owner = self.owner.lock();
            let mut inner = self.inner.lock();
            if inner.disowned {
                return;
            }
            inner.disowned = true;
            *owner = None;
            inner.open.clear();
            inner.waiting.drain(..).collect::<Vec<_>>()
        };
        for conn in waiting {
            conn.close_disowned();
        }
        self.listen_wq.wake_all();
        PORT_REGISTRY.lock().remove(&self.id);
    }

    pub(super) fn remove_waiting(&self, conn: &Connection) {
        let conn = conn as *const Connection;
        self.inner
            .lock()
            .waiting
            .retain(|c| !core::ptr::eq(Arc::as_ptr(c), conn));
    }

    pub(super) fn remove_open(&self, conn: &Connection) {
        let conn = conn as *const Connection;
        self.inner
            .lock()
            .open
            .retain(|c| !core::ptr::eq(c.as_ptr(), conn) && c.strong_count() > 0);
    }

    /// Setup connections currently waiting. Diagnostics surface.
    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiting.len()
    }
}

/// Open a connection to `port`.
///
/// Requires the CONNECT right on the port. The connection is installed
/// on the waiting list in setup state and the caller blocks on its open
/// queue until the owner accepts, the port dies, or the deadline
/// passes. A timed-out or interrupted attempt removes itself from the
/// waiting list, racing carefully with a concurrent accept.
pub fn connect(
    port: &Arc<Port>,
    timeout_ns: i64,
    interruptible: bool,
) -> KernelResult<Arc<Endpoint>> {
    let token = security::current_token();
    let session = process::current_process().session();
    if !port
        .security
        .lock()
        .rights_for(&token, session)
        .contains(Rights::CONNECT)
    {
        return Err(KernelError::AccessDenied);
    }

    let deadline = Deadline::after_ns(timeout_ns);

    let conn = {
        let mut inner = port.inner.lock();
        if inner.disowned {
            return Err(KernelError::ConnectionHungUp);
        }
        let conn = Connection::new_setup(QUEUE_MAX, Arc::downgrade(port));
        inner.waiting.push_back(Arc::clone(&conn));
        conn
    };
    port.listen_wq.wake_all();

    let endpoint = Endpoint::client(&conn);
    loop {
        use crate::ipc::connection::ConnectionState;

        let state = conn.state();
        match state {
            ConnectionState::Active => return Ok(endpoint),
            ConnectionState::Closed => return Err(KernelError::ConnectionHungUp),
            ConnectionState::Setup => {}
        }
        let wait_token = conn.open_wq.prepare();
        // Re-check: accept may have landed between the state read and
        // the token snapshot.
        if conn.state() != ConnectionState::Setup {
            continue;
        }
        if let Err(e) = conn.open_wq.wait(wait_token, deadline, interruptible) {
            conn.cancel_setup(e)?;
            return Ok(endpoint);
        }
    }
}

/// Accept the oldest waiting connection on `port`.
///
/// Owner only. Blocks on the port's listen queue until a connection
/// arrives, the port is disowned, or the deadline passes.
pub fn listen(
    port: &Arc<Port>,
    timeout_ns: i64,
    interruptible: bool,
) -> KernelResult<Arc<Endpoint>> {
    let caller = process::current_process().id();
    if port.owner() != Some(caller) {
        return Err(KernelError::PermissionDenied {
            privilege: "port ownership",
        });
    }

    let deadline = Deadline::after_ns(timeout_ns);
    loop {
        let candidate = {
            let mut inner = port.inner.lock();
            if inner.disowned {
                return Err(KernelError::ConnectionHungUp);
            }
            inner.waiting.pop_front()
        };

        if let Some(conn) = candidate {
            // A connect that timed out after queuing leaves a closed
            // connection behind; skip it.
            if let Some(endpoint) = Connection::accept(&conn, caller) {
                port.inner.lock().open.push(Arc::downgrade(&conn));
                return Ok(endpoint);
            }
            continue;
        }

        let token = port.listen_wq.prepare();
        {
            // Predicate re-check under the lock before sleeping.
            let inner = port.inner.lock();
            if inner.disowned || !inner.waiting.is_empty() {
                continue;
            }
        }
        port.listen_wq.wait(token, deadline, interruptible)?;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::{
        ipc::message::{IpcFlags, Message},
        process::Process,
        security::{Privileges, SecurityContext},
    };
    use alloc::vec;

    fn test_process(name: &str) -> Arc<Process> {
        Process::new(name, security::system_token(), 1)
    }

    #[test]
    fn test_resolve_registry_and_special() {
        let process = test_process("resolve");
        process::adopt_current(&process);

        let port = Port::create().unwrap();
        assert!(Arc::ptr_eq(
            &Port::resolve(port.id() as i32).unwrap(),
            &port
        ));
        assert!(matches!(
            Port::resolve(999_999),
            Err(KernelError::NotFound { .. })
        ));

        // Root port resolves through the process's slot 0.
        process.set_special_port(0, Some(Arc::clone(&port))).unwrap();
        assert!(Arc::ptr_eq(&Port::resolve(PORT_ROOT).unwrap(), &port));
        assert!(matches!(
            Port::resolve(-2),
            Err(KernelError::NotFound { .. })
        ));
        assert!(matches!(
            Port::resolve(PORT_SPECIAL_MIN - 1),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_connect_timeout_leaves_waiting_list_empty() {
        let process = test_process("race");
        process::adopt_current(&process);

        let port = Port::create().unwrap();
        let err = connect(&port, 10_000_000, false); // 10ms, nobody listens
        assert_eq!(err.err(), Some(KernelError::TimedOut));
        assert_eq!(port.waiting_count(), 0);
    }

    #[test]
    fn test_connect_listen_handshake() {
        let owner = test_process("owner");
        process::adopt_current(&owner);
        let port = Port::create().unwrap();

        let port_for_client = Arc::clone(&port);
        let client = std::thread::spawn(move || {
            let client_proc = test_process("client");
            process::adopt_current(&client_proc);
            let ep = connect(&port_for_client, -1, false)?;
            ep.send(Message::new(11), IpcFlags::empty(), -1)?;
            Ok::<_, KernelError>((ep, client_proc))
        });

        let server_ep = listen(&port, -1, false).unwrap();
        let received = server_ep.receive(IpcFlags::empty(), -1).unwrap();
        assert_eq!(received.msg_type, 11);

        let (client_ep, client_proc) = client.join().unwrap().unwrap();
        // Each side sees the other's process.
        assert_eq!(server_ep.remote(), Some(client_proc.id()));
        assert_eq!(client_ep.remote(), Some(owner.id()));
    }

    #[test]
    fn test_listen_requires_ownership() {
        let owner = test_process("listen-owner");
        process::adopt_current(&owner);
        let port = Port::create().unwrap();

        let stranger = test_process("stranger");
        process::adopt_current(&stranger);
        assert!(matches!(
            listen(&port, 0, false),
            Err(KernelError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn test_disown_hangs_up_waiting_connect() {
        let owner = test_process("disown-owner");
        process::adopt_current(&owner);
        let port = Port::create().unwrap();

        let port_for_client = Arc::clone(&port);
        let client = std::thread::spawn(move || {
            let client_proc = test_process("disown-client");
            process::adopt_current(&client_proc);
            connect(&port_for_client, -1, false).err()
        });
        std::thread::sleep(std::time::Duration::from_millis(10));

        port.disown();
        assert_eq!(client.join().unwrap(), Some(KernelError::ConnectionHungUp));

        // The port is gone from the namespace and rejects new connects.
        assert!(Port::lookup(port.id()).is_none());
        assert_eq!(
            connect(&port, 0, false).err(),
            Some(KernelError::ConnectionHungUp)
        );
    }

    #[test]
    fn test_connect_requires_connect_right() {
        let owner = test_process("acl-owner");
        process::adopt_current(&owner);
        let port = Port::create().unwrap();
        // Owner-only ACL: no others entry.
        let acl = Acl::from_entries(&[AclEntry::user(0, Rights::all())]).unwrap();
        port.update_security(0, 0, acl).unwrap();

        // A caller with a different uid and no privileges is refused.
        let stranger = Process::new("acl-stranger", restricted_token(), 1);
        process::adopt_current(&stranger);
        assert_eq!(connect(&port, 0, false).err(), Some(KernelError::AccessDenied));
    }

    fn restricted_token() -> Arc<crate::security::SecurityToken> {
        crate::security::SecurityToken::create(
            &security::system_token(),
            &SecurityContext {
                uid: 501,
                gid: 501,
                groups: vec![],
                effective: Privileges::empty(),
                inherit: Privileges::empty(),
            },
        )
        .unwrap()
    }
}
