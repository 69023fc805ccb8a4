//! Connections: bidirectional channels with two symmetric endpoints.
//!
//! A connection is born in `setup` by a connect attempt, becomes
//! `active` when the port owner accepts it, and is `closed` by either
//! endpoint (or by the port being disowned while still in setup). The
//! transitions are monotonic. One non-recursive mutex guards the whole
//! connection; the wait queues live outside it and every waiter
//! re-checks its predicate after waking.

use alloc::{boxed::Box, collections::VecDeque, sync::Arc, sync::Weak, vec::Vec};

use spin::Mutex;

use crate::{
    error::{KernelError, KernelResult},
    ipc::{
        message::{IpcFlags, Message, ReceivedMessage},
        notifier::{self, NotifierList, Observer, ObserverId},
        port::Port,
    },
    process::{self, ObjectRef, ProcessId},
    security::SecurityContext,
    sync::WaitQueue,
    timer::{self, Deadline},
};

/// Endpoint index held by the connecting side.
pub const CLIENT: usize = 0;
/// Endpoint index held by the accepting side.
pub const SERVER: usize = 1;

/// Connection lifecycle. Transitions: setup -> active -> closed and
/// setup -> closed only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Setup,
    Active,
    Closed,
}

/// Attachments of the most recently received message, retained until
/// the next send/receive on the endpoint or an explicit claim.
#[derive(Default)]
pub struct Pending {
    data: Option<Box<[u8]>>,
    handle: Option<ObjectRef>,
}

struct EndState {
    queue: VecDeque<Message>,
    pending: Pending,
    /// Sends toward this end succeed silently without queuing.
    drop_messages: bool,
    hangup_observers: NotifierList,
    message_observers: NotifierList,
    process: Option<ProcessId>,
}

impl EndState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            pending: Pending::default(),
            drop_messages: false,
            hangup_observers: NotifierList::new(),
            message_observers: NotifierList::new(),
            process: None,
        }
    }
}

struct ConnInner {
    state: ConnectionState,
    ends: [EndState; 2],
}

/// A bidirectional channel. Freed when both endpoints have released it
/// (the endpoint handles hold the only long-lived references).
pub struct Connection {
    capacity: usize,
    inner: Mutex<ConnInner>,
    /// Signals the initiator once the acceptor transitions the state.
    pub(super) open_wq: WaitQueue,
    /// Per-end arrival signal, indexed by the receiving side.
    data_wq: [WaitQueue; 2],
    /// Per-end queue-room signal, indexed by the side whose queue
    /// drained.
    space_wq: [WaitQueue; 2],
    /// Back-reference to the port while in setup or on its open list.
    port: Mutex<Option<Weak<Port>>>,
}

impl Connection {
    pub(super) fn new_setup(capacity: usize, port: Weak<Port>) -> Arc<Self> {
        let conn = Self::new_inner(capacity, ConnectionState::Setup);
        *conn.port.lock() = Some(port);
        conn.inner.lock().ends[CLIENT].process = Some(process::current_process().id());
        conn
    }

    fn new_inner(capacity: usize, state: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(ConnInner {
                state,
                ends: [EndState::new(), EndState::new()],
            }),
            open_wq: WaitQueue::new(),
            data_wq: [WaitQueue::new(), WaitQueue::new()],
            space_wq: [WaitQueue::new(), WaitQueue::new()],
            port: Mutex::new(None),
        })
    }

    /// In-kernel connection pair: already active, no port involved.
    pub fn create(capacity: usize) -> (Arc<Endpoint>, Arc<Endpoint>) {
        let conn = Self::new_inner(capacity, ConnectionState::Active);
        {
            let pid = process::current_process().id();
            let mut inner = conn.inner.lock();
            inner.ends[CLIENT].process = Some(pid);
            inner.ends[SERVER].process = Some(pid);
        }
        (
            Arc::new(Endpoint {
                conn: Arc::clone(&conn),
                side: CLIENT,
            }),
            Arc::new(Endpoint {
                conn,
                side: SERVER,
            }),
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    /// Accept: transition setup -> active and hand out the server
    /// endpoint. Called by the port with its own lock released.
    pub(super) fn accept(conn: &Arc<Self>, acceptor: ProcessId) -> Option<Arc<Endpoint>> {
        let mut inner = conn.inner.lock();
        if inner.state != ConnectionState::Setup {
            return None;
        }
        inner.state = ConnectionState::Active;
        inner.ends[SERVER].process = Some(acceptor);
        drop(inner);
        conn.open_wq.wake_all();
        Some(Arc::new(Endpoint {
            conn: Arc::clone(conn),
            side: SERVER,
        }))
    }

    /// Close from the port-disown path: the connection is still in
    /// setup, the port lock is held, and the initiator must observe
    /// hangup.
    pub(super) fn close_disowned(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConnectionState::Closed {
            return;
        }
        inner.state = ConnectionState::Closed;
        drop(inner);
        *self.port.lock() = None;
        self.open_wq.wake_all();
    }

    /// Close the connection: idempotent, wakes every waiter, drains both
    /// queues, fires hangup observers.
    pub fn close(&self) {
        let (previous, observers);
        {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            previous = inner.state;
            inner.state = ConnectionState::Closed;

            let mut snapshot: Vec<Observer> = Vec::new();
            for end in inner.ends.iter_mut() {
                end.queue.clear();
                end.pending = Pending::default();
                snapshot.extend(end.hangup_observers.snapshot());
            }
            observers = snapshot;
        }

        self.open_wq.wake_all();
        for side in [CLIENT, SERVER] {
            self.data_wq[side].wake_all();
            self.space_wq[side].wake_all();
        }

        if let Some(port) = self.port.lock().take().and_then(|weak| weak.upgrade()) {
            match previous {
                ConnectionState::Setup => port.remove_waiting(self),
                ConnectionState::Active => port.remove_open(self),
                ConnectionState::Closed => {}
            }
        }

        notifier::fire(&observers);
    }

    /// Remove this connection from the port's waiting list after a
    /// timed-out or interrupted connect, racing carefully with the
    /// acceptor: if the acceptor won, the connect succeeded after all.
    pub(super) fn cancel_setup(&self, error: KernelError) -> KernelResult<()> {
        let port = self.port.lock().clone().and_then(|weak| weak.upgrade());
        if let Some(port) = &port {
            port.remove_waiting(self);
        }
        let mut inner = self.inner.lock();
        match inner.state {
            ConnectionState::Active => Ok(()),
            ConnectionState::Closed => Err(KernelError::ConnectionHungUp),
            ConnectionState::Setup => {
                inner.state = ConnectionState::Closed;
                drop(inner);
                *self.port.lock() = None;
                Err(error)
            }
        }
    }
}

/// One side of a connection. The kernel object behind endpoint handles;
/// dropping the last reference closes the connection.
pub struct Endpoint {
    conn: Arc<Connection>,
    side: usize,
}

impl Endpoint {
    pub(super) fn client(conn: &Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            conn: Arc::clone(conn),
            side: CLIENT,
        })
    }

    fn peer(&self) -> usize {
        1 - self.side
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Queue a message toward the peer.
    ///
    /// Hung-up connections fail immediately; a peer flagged
    /// drop-messages consumes the message silently. When the peer queue
    /// is at capacity and `FORCE` is absent, the call waits for room
    /// against the absolute deadline computed here at entry. A wait that
    /// times out or is interrupted queues nothing and stamps nothing.
    pub fn send(&self, msg: Message, flags: IpcFlags, timeout_ns: i64) -> KernelResult<()> {
        let deadline = Deadline::after_ns(timeout_ns);
        let peer = self.peer();
        let mut inner = self.conn.inner.lock();

        // A send retires this end's pending attachments from the
        // previous receive.
        inner.ends[self.side].pending = Pending::default();

        loop {
            if inner.state == ConnectionState::Closed {
                return Err(KernelError::ConnectionHungUp);
            }
            if inner.ends[peer].drop_messages {
                return Ok(());
            }
            if inner.ends[peer].queue.len() < self.conn.capacity
                || flags.contains(IpcFlags::FORCE)
            {
                break;
            }
            let token = self.conn.space_wq[peer].prepare();
            drop(inner);
            self.conn.space_wq[peer].wait(
                token,
                deadline,
                flags.contains(IpcFlags::INTERRUPTIBLE),
            )?;
            inner = self.conn.inner.lock();
        }

        let mut msg = msg;
        let security = if flags.contains(IpcFlags::ATTACH_SECURITY) {
            Some(SecurityContext::from_token(&crate::security::current_token()))
        } else {
            None
        };
        msg.stamp(timer::current_time_ns(), security);
        inner.ends[peer].queue.push_back(msg);
        let observers = inner.ends[peer].message_observers.snapshot();
        drop(inner);

        self.conn.data_wq[peer].wake_all();
        notifier::fire(&observers);
        Ok(())
    }

    /// Dequeue the next message for this end.
    ///
    /// Attachments are retained as pending on this endpoint until the
    /// next send/receive or an explicit [`Endpoint::take_data`] /
    /// [`Endpoint::take_handle`]. A closed connection drains its queue
    /// before reporting hangup.
    pub fn receive(&self, flags: IpcFlags, timeout_ns: i64) -> KernelResult<ReceivedMessage> {
        let deadline = Deadline::after_ns(timeout_ns);
        let mut inner = self.conn.inner.lock();

        inner.ends[self.side].pending = Pending::default();

        loop {
            if let Some(msg) = inner.ends[self.side].queue.pop_front() {
                let (msg_type, timestamp_ns, data, handle, security) = msg.into_parts();
                let received = ReceivedMessage {
                    msg_type,
                    size: data.as_ref().map(|d| d.len()).unwrap_or(0),
                    has_handle: handle.is_some(),
                    timestamp_ns,
                    security,
                };
                inner.ends[self.side].pending = Pending { data, handle };
                drop(inner);
                self.conn.space_wq[self.side].wake_all();
                return Ok(received);
            }
            if inner.state == ConnectionState::Closed {
                return Err(KernelError::ConnectionHungUp);
            }
            let token = self.conn.data_wq[self.side].prepare();
            drop(inner);
            self.conn.data_wq[self.side].wait(
                token,
                deadline,
                flags.contains(IpcFlags::INTERRUPTIBLE),
            )?;
            inner = self.conn.inner.lock();
        }
    }

    /// Claim the pending data payload of the last received message.
    pub fn take_data(&self) -> Option<Box<[u8]>> {
        self.conn.inner.lock().ends[self.side].pending.data.take()
    }

    /// Claim the pending handle of the last received message.
    pub fn take_handle(&self) -> Option<ObjectRef> {
        self.conn.inner.lock().ends[self.side].pending.handle.take()
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.conn.close();
    }

    pub fn status(&self) -> ConnectionState {
        self.conn.state()
    }

    /// The process holding the peer endpoint.
    pub fn remote(&self) -> Option<ProcessId> {
        self.conn.inner.lock().ends[self.peer()].process
    }

    pub(super) fn set_process(&self, process: ProcessId) {
        self.conn.inner.lock().ends[self.side].process = Some(process);
    }

    /// Sends toward this endpoint succeed silently without queuing.
    pub fn set_drop_messages(&self, drop_messages: bool) {
        self.conn.inner.lock().ends[self.side].drop_messages = drop_messages;
    }

    pub fn register_hangup_observer(&self, observer: Observer) -> ObserverId {
        self.conn.inner.lock().ends[self.side]
            .hangup_observers
            .register(observer)
    }

    pub fn register_message_observer(&self, observer: Observer) -> ObserverId {
        self.conn.inner.lock().ends[self.side]
            .message_observers
            .register(observer)
    }

    pub fn unregister_hangup_observer(&self, id: ObserverId) -> bool {
        self.conn.inner.lock().ends[self.side]
            .hangup_observers
            .unregister(id)
    }

    pub fn unregister_message_observer(&self, id: ObserverId) -> bool {
        self.conn.inner.lock().ends[self.side]
            .message_observers
            .unregister(id)
    }

    /// Messages currently queued toward this end. Diagnostics surface.
    pub fn queued(&self) -> usize {
        self.conn.inner.lock().ends[self.side].queue.len()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.conn.close();
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec;
    use core::sync::atomic::{AtomicU32, Ordering};

    fn data_msg(ty: u32, bytes: &[u8]) -> Message {
        Message::new(ty)
            .with_data(bytes.to_vec().into_boxed_slice())
            .unwrap()
    }

    #[test]
    fn test_send_receive_round_trip() {
        let (a, b) = Connection::create(QUEUE_CAP);
        let before = crate::timer::current_time_ns();
        a.send(data_msg(7, b"hello"), IpcFlags::empty(), -1).unwrap();

        let received = b.receive(IpcFlags::empty(), -1).unwrap();
        assert_eq!(received.msg_type, 7);
        assert_eq!(received.size, 5);
        assert!(!received.has_handle);
        assert!(received.timestamp_ns >= before);
        assert_eq!(&*b.take_data().unwrap(), b"hello");
        // A second claim finds nothing.
        assert!(b.take_data().is_none());
    }

    const QUEUE_CAP: usize = 4;

    #[test]
    fn test_queue_backpressure_would_block() {
        let (a, b) = Connection::create(QUEUE_CAP);
        for i in 0..QUEUE_CAP as u32 {
            a.send(Message::new(i), IpcFlags::empty(), 0).unwrap();
        }
        // Fifth send with an immediate deadline reports would_block.
        assert_eq!(
            a.send(Message::new(99), IpcFlags::empty(), 0),
            Err(KernelError::WouldBlock)
        );

        // Draining one makes room for the next.
        b.receive(IpcFlags::empty(), 0).unwrap();
        a.send(Message::new(100), IpcFlags::empty(), 0).unwrap();

        // Force bypasses capacity entirely.
        a.send(Message::new(101), IpcFlags::FORCE, 0).unwrap();
        assert_eq!(b.queued(), QUEUE_CAP + 1);
    }

    #[test]
    fn test_fifo_per_sender() {
        let (a, b) = Connection::create(16);
        for i in 0..8u32 {
            a.send(Message::new(i), IpcFlags::empty(), 0).unwrap();
        }
        for i in 0..8u32 {
            assert_eq!(b.receive(IpcFlags::empty(), 0).unwrap().msg_type, i);
        }
    }

    #[test]
    fn test_close_is_idempotent_and_hangs_up() {
        let (a, b) = Connection::create(QUEUE_CAP);
        a.send(Message::new(1), IpcFlags::empty(), 0).unwrap();
        b.close();
        b.close();
        assert_eq!(a.status(), ConnectionState::Closed);
        assert_eq!(
            a.send(Message::new(2), IpcFlags::empty(), 0),
            Err(KernelError::ConnectionHungUp)
        );
        // The queues were drained at close; receive reports hangup
        // rather than the stale message.
        assert_eq!(
            b.receive(IpcFlags::empty(), 0),
            Err(KernelError::ConnectionHungUp)
        );
    }

    #[test]
    fn test_receive_timeout_and_would_block() {
        let (_a, b) = Connection::create(QUEUE_CAP);
        assert_eq!(
            b.receive(IpcFlags::empty(), 0),
            Err(KernelError::WouldBlock)
        );
        assert_eq!(
            b.receive(IpcFlags::empty(), 2_000_000),
            Err(KernelError::TimedOut)
        );
    }

    #[test]
    fn test_hangup_wakes_blocked_receiver() {
        let (a, b) = Connection::create(QUEUE_CAP);
        let receiver = std::thread::spawn(move || b.receive(IpcFlags::empty(), -1));
        std::thread::sleep(std::time::Duration::from_millis(10));
        a.close();
        assert_eq!(
            receiver.join().unwrap(),
            Err(KernelError::ConnectionHungUp)
        );
    }

    #[test]
    fn test_blocked_sender_wakes_on_drain() {
        let (a, b) = Connection::create(1);
        a.send(Message::new(0), IpcFlags::empty(), 0).unwrap();
        let sender = std::thread::spawn(move || {
            let result = a.send(Message::new(1), IpcFlags::empty(), -1);
            (a, result)
        });
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(b.receive(IpcFlags::empty(), 0).unwrap().msg_type, 0);
        let (_a, result) = sender.join().unwrap();
        assert!(result.is_ok());
        assert_eq!(b.receive(IpcFlags::empty(), -1).unwrap().msg_type, 1);
    }

    #[test]
    fn test_drop_messages_discards_silently() {
        let (a, b) = Connection::create(QUEUE_CAP);
        b.set_drop_messages(true);
        for i in 0..20u32 {
            a.send(Message::new(i), IpcFlags::empty(), 0).unwrap();
        }
        assert_eq!(b.queued(), 0);
    }

    #[test]
    fn test_pending_attachments_dropped_on_next_receive() {
        let (a, b) = Connection::create(QUEUE_CAP);
        a.send(data_msg(1, b"first"), IpcFlags::empty(), 0).unwrap();
        a.send(data_msg(2, b"second"), IpcFlags::empty(), 0).unwrap();

        b.receive(IpcFlags::empty(), 0).unwrap();
        // Unclaimed "first" payload is discarded by the next receive.
        b.receive(IpcFlags::empty(), 0).unwrap();
        assert_eq!(&*b.take_data().unwrap(), b"second");
    }

    #[test]
    fn test_message_and_hangup_observers() {
        let (a, b) = Connection::create(QUEUE_CAP);
        let arrivals = Arc::new(AtomicU32::new(0));
        let hangups = Arc::new(AtomicU32::new(0));

        let counted = Arc::clone(&arrivals);
        b.register_message_observer(Arc::new(move || {
            counted.fetch_add(1, Ordering::Relaxed);
        }));
        let counted = Arc::clone(&hangups);
        b.register_hangup_observer(Arc::new(move || {
            counted.fetch_add(1, Ordering::Relaxed);
        }));

        a.send(Message::new(1), IpcFlags::empty(), 0).unwrap();
        a.send(Message::new(2), IpcFlags::empty(), 0).unwrap();
        assert_eq!(arrivals.load(Ordering::Relaxed), 2);

        a.close();
        assert_eq!(hangups.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_timestamps_are_monotonic_per_sender() {
        let (a, b) = Connection::create(QUEUE_CAP);
        a.send(Message::new(1), IpcFlags::empty(), 0).unwrap();
        a.send(Message::new(2), IpcFlags::empty(), 0).unwrap();
        let first = b.receive(IpcFlags::empty(), 0).unwrap();
        let second = b.receive(IpcFlags::empty(), 0).unwrap();
        assert!(second.timestamp_ns >= first.timestamp_ns);
    }

    #[test]
    fn test_interrupt_cancels_send_without_queuing() {
        let (a, b) = Connection::create(1);
        a.send(Message::new(0), IpcFlags::empty(), 0).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let sender = std::thread::spawn(move || {
            tx.send(crate::process::thread::current_thread()).unwrap();
            let result = a.send(Message::new(1), IpcFlags::INTERRUPTIBLE, -1);
            (a, result)
        });
        let thread = rx.recv().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        thread.interrupt();
        let (a, result) = sender.join().unwrap();
        assert_eq!(result, Err(KernelError::Interrupted));
        // The interrupted message was never queued.
        assert_eq!(b.receive(IpcFlags::empty(), 0).unwrap().msg_type, 0);
        assert_eq!(
            b.receive(IpcFlags::empty(), 0),
            Err(KernelError::WouldBlock)
        );
        drop(a);
    }
}
