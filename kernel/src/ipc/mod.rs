//! Inter-process communication.
//!
//! Capability-style message passing built from three pieces: ports
//! (rendezvous points for new connections), connections (bidirectional
//! channels with two symmetric endpoints and bounded queues), and
//! messages (typed envelopes carrying optional data, one transferrable
//! handle, and an optional sender security context).

pub mod connection;
pub mod message;
pub mod notifier;
pub mod port;

pub use connection::{Connection, ConnectionState, Endpoint};
pub use message::{
    header_flags, IpcFlags, Message, MessageHeader, ReceivedMessage, DATA_MAX, QUEUE_MAX,
};
pub use port::{connect, listen, Port, PORT_ROOT, PORT_SPECIAL_MIN};

/// IPC bring-up.
pub fn init() {
    println!("[IPC] IPC system initialized");
}
