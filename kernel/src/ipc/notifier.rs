//! Observer lists for endpoint events.
//!
//! Endpoints expose two of these: hangup observers and message-arrival
//! observers. Callbacks are registered under the connection lock but
//! fired after it is released, so a callback may re-enter the IPC layer.
//! No ordering is promised between a notification and the wake-up of a
//! thread blocked on the same event.

use alloc::{sync::Arc, vec::Vec};

/// An observer callback.
pub type Observer = Arc<dyn Fn() + Send + Sync>;

/// A registration id, used to unregister.
pub type ObserverId = u64;

#[derive(Default)]
pub struct NotifierList {
    entries: Vec<(ObserverId, Observer)>,
    next_id: ObserverId,
}

impl NotifierList {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    pub fn register(&mut self, observer: Observer) -> ObserverId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, observer));
        id
    }

    pub fn unregister(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Snapshot the callbacks for firing outside the lock.
    pub fn snapshot(&self) -> Vec<Observer> {
        self.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Fire a snapshot taken under a lock that has since been released.
pub fn fire(observers: &[Observer]) {
    for observer in observers {
        observer();
    }
}
