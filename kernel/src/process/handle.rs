//! Handle tables: per-process references to kernel objects.

use alloc::{collections::BTreeMap, sync::Arc};

use crate::{
    error::{KernelError, KernelResult},
    ipc::{connection::Endpoint, port::Port},
    security::SecurityToken,
};

/// Maximum live handles per process.
pub const HANDLE_MAX: usize = 1024;

/// A reference to a kernel object addressable by handle.
#[derive(Clone)]
pub enum ObjectRef {
    Port(Arc<Port>),
    Endpoint(Arc<Endpoint>),
    Token(Arc<SecurityToken>),
}

impl ObjectRef {
    /// Whether the object may be attached to an IPC message. Endpoints
    /// are bound to their holder and do not transfer.
    pub fn transferrable(&self) -> bool {
        !matches!(self, Self::Endpoint(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Port(_) => "port",
            Self::Endpoint(_) => "endpoint",
            Self::Token(_) => "token",
        }
    }

    pub fn as_port(&self) -> Option<&Arc<Port>> {
        match self {
            Self::Port(port) => Some(port),
            _ => None,
        }
    }

    pub fn as_endpoint(&self) -> Option<&Arc<Endpoint>> {
        match self {
            Self::Endpoint(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    pub fn as_token(&self) -> Option<&Arc<SecurityToken>> {
        match self {
            Self::Token(token) => Some(token),
            _ => None,
        }
    }
}

/// A process's handle table. Ids are small integers, reused after
/// close, allocated lowest-free-first.
pub struct HandleTable {
    entries: BTreeMap<u32, ObjectRef>,
}

impl HandleTable {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Install an object; returns the new handle id.
    pub fn attach(&mut self, object: ObjectRef) -> KernelResult<u32> {
        if self.entries.len() >= HANDLE_MAX {
            return Err(KernelError::NoHandles);
        }
        // Lowest unused id.
        let mut id = 0u32;
        for &used in self.entries.keys() {
            if used != id {
                break;
            }
            id += 1;
        }
        self.entries.insert(id, object);
        Ok(id)
    }

    pub fn lookup(&self, id: u32) -> KernelResult<ObjectRef> {
        self.entries
            .get(&id)
            .cloned()
            .ok_or(KernelError::NotFound { resource: "handle" })
    }

    pub fn detach(&mut self, id: u32) -> KernelResult<ObjectRef> {
        self.entries
            .remove(&id)
            .ok_or(KernelError::NotFound { resource: "handle" })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, returning them for owner bookkeeping.
    pub fn drain(&mut self) -> alloc::vec::Vec<ObjectRef> {
        let drained = core::mem::take(&mut self.entries);
        drained.into_values().collect()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
