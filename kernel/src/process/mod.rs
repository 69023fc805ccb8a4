//! Processes, reduced to the surface the core subsystems consume: the
//! current-process notion, the security token, the address space, the
//! handle table and the well-known special ports.

pub mod handle;
pub mod thread;

use alloc::{collections::BTreeMap, string::String, sync::Arc};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

pub use handle::{HandleTable, ObjectRef, HANDLE_MAX};

use crate::{
    error::{KernelError, KernelResult},
    ipc::port::Port,
    mm::space::AddressSpace,
    security::{SecurityToken, SecurityContext},
};

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProcessId(pub u64);

/// Number of well-known special-port slots per process. Slot `n` is
/// addressed from userspace as port id `-(n + 1)`; slot 0 is the root
/// port.
pub const SPECIAL_PORT_MAX: usize = 16;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

lazy_static::lazy_static! {
    static ref PROCESS_TABLE: Mutex<BTreeMap<u64, Arc<Process>>> = Mutex::new(BTreeMap::new());
    static ref KERNEL_PROCESS: Arc<Process> = Process::register(Arc::new(Process {
        id: ProcessId(0),
        name: String::from("kernel"),
        session: 0,
        token: Mutex::new(crate::security::system_token()),
        space: AddressSpace::new(),
        handles: Mutex::new(HandleTable::new()),
        special_ports: Mutex::new([const { None }; SPECIAL_PORT_MAX]),
    }));
}

pub struct Process {
    id: ProcessId,
    name: String,
    session: u32,
    token: Mutex<Arc<SecurityToken>>,
    space: Arc<AddressSpace>,
    handles: Mutex<HandleTable>,
    special_ports: Mutex<[Option<Arc<Port>>; SPECIAL_PORT_MAX]>,
}

impl Process {
    /// Create a process with a fresh address space.
    pub fn new(name: &str, token: Arc<SecurityToken>, session: u32) -> Arc<Self> {
        Self::register(Arc::new(Self {
            id: ProcessId(NEXT_PID.fetch_add(1, Ordering::Relaxed)),
            name: String::from(name),
            session,
            token: Mutex::new(token),
            space: AddressSpace::new(),
            handles: Mutex::new(HandleTable::new()),
            special_ports: Mutex::new([const { None }; SPECIAL_PORT_MAX]),
        }))
    }

    fn register(process: Arc<Self>) -> Arc<Self> {
        PROCESS_TABLE
            .lock()
            .insert(process.id.0, Arc::clone(&process));
        process
    }

    /// Fork: duplicate the address space (copy-on-write for private
    /// mappings), inherit the token, clone the special ports. The child
    /// starts with an empty handle table.
    pub fn fork(&self, name: &str) -> KernelResult<Arc<Self>> {
        let space = self.space.duplicate()?;
        let token = SecurityToken::inherit_for_child(&self.token());
        let special_ports = self.special_ports.lock().clone();
        Ok(Self::register(Arc::new(Self {
            id: ProcessId(NEXT_PID.fetch_add(1, Ordering::Relaxed)),
            name: String::from(name),
            session: self.session,
            token: Mutex::new(token),
            space,
            handles: Mutex::new(HandleTable::new()),
            special_ports: Mutex::new(special_ports),
        })))
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> u32 {
        self.session
    }

    pub fn token(&self) -> Arc<SecurityToken> {
        Arc::clone(&self.token.lock())
    }

    pub fn set_token(&self, token: Arc<SecurityToken>) {
        *self.token.lock() = token;
    }

    /// Swap the process token for one minted from the caller's context.
    pub fn update_token(&self, ctx: &SecurityContext) -> KernelResult<Arc<SecurityToken>> {
        let token = SecurityToken::create(&crate::security::current_token(), ctx)?;
        *self.token.lock() = Arc::clone(&token);
        Ok(token)
    }

    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    /// Install an object into the handle table. A port handle held by
    /// the port's owner counts toward the owner's reference total.
    pub fn attach_handle(&self, object: ObjectRef) -> KernelResult<u32> {
        if let ObjectRef::Port(port) = &object {
            if port.owner() == Some(self.id) {
                port.owner_ref();
            }
        }
        self.handles.lock().attach(object)
    }

    /// Install a handle received through IPC. Port ownership follows the
    /// transferred handle: the receiving process becomes the owner.
    pub fn adopt_received_handle(&self, object: ObjectRef) -> KernelResult<u32> {
        if let ObjectRef::Port(port) = &object {
            port.transfer_owner(self.id);
        }
        self.handles.lock().attach(object)
    }

    pub fn lookup_handle(&self, id: u32) -> KernelResult<ObjectRef> {
        self.handles.lock().lookup(id)
    }

    /// Close a handle. Dropping the owner's last port handle disowns the
    /// port.
    pub fn close_handle(&self, id: u32) -> KernelResult<()> {
        let object = self.handles.lock().detach(id)?;
        self.release_object(object);
        Ok(())
    }

    fn release_object(&self, object: ObjectRef) {
        if let ObjectRef::Port(port) = &object {
            if port.owner() == Some(self.id) {
                port.owner_unref();
            }
        }
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn special_port(&self, slot: usize) -> Option<Arc<Port>> {
        self.special_ports.lock().get(slot)?.clone()
    }

    pub fn set_special_port(&self, slot: usize, port: Option<Arc<Port>>) -> KernelResult<()> {
        let mut ports = self.special_ports.lock();
        let entry = ports.get_mut(slot).ok_or(KernelError::InvalidArgument {
            what: "special port slot",
        })?;
        *entry = port;
        Ok(())
    }

    /// Process teardown: release every handle (disowning owned ports),
    /// drop the special ports, forget the process. The address space
    /// dies with its last reference.
    pub fn exit(&self) {
        let drained = self.handles.lock().drain();
        for object in drained {
            self.release_object(object);
        }
        *self.special_ports.lock() = [const { None }; SPECIAL_PORT_MAX];
        PROCESS_TABLE.lock().remove(&self.id.0);
    }
}

/// The kernel's own process.
pub fn kernel_process() -> Arc<Process> {
    Arc::clone(&KERNEL_PROCESS)
}

/// The process of the calling thread.
pub fn current_process() -> Arc<Process> {
    thread::current_thread().process()
}

/// Process lookup by id, for `connection_open_remote`.
pub fn find_process(id: ProcessId) -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().get(&id.0).cloned()
}

/// Rebind the calling thread to `process` and install its address
/// space.
pub fn adopt_current(process: &Arc<Process>) {
    thread::current_thread().adopt(Arc::clone(process));
}

/// Process bring-up: materialize the kernel process.
pub fn init() {
    let _ = kernel_process();
    println!("[PROCESS] Process management initialized");
}
