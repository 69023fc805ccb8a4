//! IPC message format.
//!
//! A message is a typed envelope with three independent attachments: a
//! heap data payload bounded by [`DATA_MAX`], one transferrable object
//! handle, and optionally the sender's captured security context. The
//! wire header is the fixed syscall ABI; the attachments travel out of
//! band and are claimed by the receiver through the pending slot.

use alloc::boxed::Box;

use bitflags::bitflags;

use crate::{
    error::{KernelError, KernelResult},
    process::ObjectRef,
    security::SecurityContext,
};

/// Maximum data payload per message.
pub const DATA_MAX: usize = 16 * 1024;

/// Default per-endpoint queue capacity.
pub const QUEUE_MAX: usize = 256;

bitflags! {
    /// Flags accepted by send/receive.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcFlags: u32 {
        /// Bypass queue capacity. In-kernel senders only.
        const FORCE           = 1 << 0;
        /// Stamp the sender's security context onto the message.
        const ATTACH_SECURITY = 1 << 1;
        /// The queue wait may be cancelled by a thread interrupt.
        const INTERRUPTIBLE   = 1 << 2;
    }
}

/// Attachment flags carried in the wire header.
pub mod header_flags {
    pub const HAS_HANDLE: u32 = 1 << 0;
    pub const HAS_SECURITY: u32 = 1 << 1;
}

/// The fixed wire header, host-endian. The field order leaves no
/// padding, so the in-memory layout is exactly the 24 packed bytes of
/// the wire format.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: u32,
    pub size: u32,
    pub flags: u32,
    pub reserved: u32,
    pub timestamp_ns: u64,
}

/// An in-flight message.
pub struct Message {
    msg_type: u32,
    data: Option<Box<[u8]>>,
    handle: Option<ObjectRef>,
    security: Option<SecurityContext>,
    /// Stamped at send time, after any queue wait.
    timestamp_ns: u64,
}

impl Message {
    /// A message with no attachments.
    pub fn new(msg_type: u32) -> Self {
        Self {
            msg_type,
            data: None,
            handle: None,
            security: None,
            timestamp_ns: 0,
        }
    }

    /// Attach a data payload. Fails with `too_large` beyond [`DATA_MAX`].
    pub fn with_data(mut self, data: Box<[u8]>) -> KernelResult<Self> {
        if data.len() > DATA_MAX {
            return Err(KernelError::TooLarge {
                size: data.len(),
                max: DATA_MAX,
            });
        }
        self.data = Some(data);
        Ok(self)
    }

    /// Attach an object handle. Non-transferrable objects are rejected
    /// at send time with `not_supported`.
    pub fn with_handle(mut self, handle: ObjectRef) -> KernelResult<Self> {
        if !handle.transferrable() {
            return Err(KernelError::NotSupported {
                operation: "handle transfer",
            });
        }
        self.handle = Some(handle);
        Ok(self)
    }

    pub fn msg_type(&self) -> u32 {
        self.msg_type
    }

    pub fn data_len(&self) -> usize {
        self.data.as_ref().map(|d| d.len()).unwrap_or(0)
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    pub(super) fn stamp(&mut self, timestamp_ns: u64, security: Option<SecurityContext>) {
        self.timestamp_ns = timestamp_ns;
        self.security = security;
    }

    pub(super) fn into_parts(
        self,
    ) -> (
        u32,
        u64,
        Option<Box<[u8]>>,
        Option<ObjectRef>,
        Option<SecurityContext>,
    ) {
        (
            self.msg_type,
            self.timestamp_ns,
            self.data,
            self.handle,
            self.security,
        )
    }

    /// The wire header describing this message.
    pub fn header(&self) -> MessageHeader {
        let mut flags = 0;
        if self.handle.is_some() {
            flags |= header_flags::HAS_HANDLE;
        }
        if self.security.is_some() {
            flags |= header_flags::HAS_SECURITY;
        }
        MessageHeader {
            msg_type: self.msg_type,
            size: self.data_len() as u32,
            flags,
            reserved: 0,
            timestamp_ns: self.timestamp_ns,
        }
    }
}

/// What `receive` hands back: the header facts plus the captured
/// security context. Data and handle stay pending on the endpoint until
/// claimed or discarded.
#[derive(Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub msg_type: u32,
    pub size: usize,
    pub has_handle: bool,
    pub timestamp_ns: u64,
    pub security: Option<SecurityContext>,
}

impl ReceivedMessage {
    pub fn header(&self) -> MessageHeader {
        let mut flags = 0;
        if self.has_handle {
            flags |= header_flags::HAS_HANDLE;
        }
        if self.security.is_some() {
            flags |= header_flags::HAS_SECURITY;
        }
        MessageHeader {
            msg_type: self.msg_type,
            size: self.size as u32,
            flags,
            reserved: 0,
            timestamp_ns: self.timestamp_ns,
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_header_layout() {
        assert_eq!(core::mem::size_of::<MessageHeader>(), 24);
    }

    #[test]
    fn test_data_size_limit() {
        let ok = Message::new(1).with_data(vec![0u8; DATA_MAX].into_boxed_slice());
        assert!(ok.is_ok());
        let err = Message::new(1).with_data(vec![0u8; DATA_MAX + 1].into_boxed_slice());
        assert!(matches!(err, Err(KernelError::TooLarge { .. })));
    }

    #[test]
    fn test_header_reflects_attachments() {
        let msg = Message::new(42)
            .with_data(vec![1, 2, 3].into_boxed_slice())
            .unwrap();
        let header = msg.header();
        assert_eq!(header.msg_type, 42);
        assert_eq!(header.size, 3);
        assert_eq!(header.flags, 0);

        let msg = msg
            .with_handle(crate::process::ObjectRef::Token(
                crate::security::system_token(),
            ))
            .unwrap();
        assert_eq!(msg.header().flags, header_flags::HAS_HANDLE);
    }

    #[test]
    fn test_endpoint_handles_do_not_transfer() {
        let (a, _b) = crate::ipc::connection::Connection::create(4);
        let err = Message::new(1).with_handle(crate::process::ObjectRef::Endpoint(a));
        assert!(matches!(err, Err(KernelError::NotSupported { .. })));
    }
}
