//! Per-connection session state
//!
//! A session is created when a transport is accepted (or, for calls forwarded
//! from another node, when the first call of a remote session arrives) and is
//! closed exactly once. Groups hold `Arc<Session>` references but never own
//! the session's lifetime.
//!
//! State machine: `Connecting -> Active -> Closing -> Closed`. Only `Active`
//! sessions accept outbound calls, responses and pushes; everything else
//! fails fast with [`Error::SessionClosed`].

use crate::error::{Error, Result};
use crate::router::Router;
use crate::utils::{lock, panic_message};
use bytes::Bytes;
use log::{debug, warn};
use shared::{encode, Decoder, Message, PacketType, ProtocolError};
use std::collections::HashMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};

const CONNECTING: u8 = 0;
const ACTIVE: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            CONNECTING => SessionState::Connecting,
            ACTIVE => SessionState::Active,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Where a proxy session's real connection lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteOrigin {
    pub node_id: u64,
    pub session_id: u64,
}

/// Outbound half of a session's transport.
pub trait Outbound: Send + Sync {
    /// Queues one complete frame for writing.
    fn send(&self, frame: Bytes) -> Result<()>;
    /// Flushes queued frames and closes the transport.
    fn close(&self);
}

#[derive(Debug)]
pub enum OutboundFrame {
    Frame(Bytes),
    Close,
}

/// Outbound path backed by a writer task draining a channel.
pub struct ChannelOutbound {
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

impl ChannelOutbound {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Outbound for ChannelOutbound {
    fn send(&self, frame: Bytes) -> Result<()> {
        self.tx.send(OutboundFrame::Frame(frame)).map_err(|_| {
            Error::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection writer has stopped",
            ))
        })
    }

    fn close(&self) {
        let _ = self.tx.send(OutboundFrame::Close);
    }
}

/// Drains queued frames into `writer` until closed or the write fails.
pub async fn run_writer<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<OutboundFrame>, peer: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            OutboundFrame::Frame(frame) => {
                if let Err(e) = writer.write_all(&frame).await {
                    debug!("Write to {} failed: {}", peer, e);
                    break;
                }
            }
            OutboundFrame::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

/// In-memory outbound that records frames; can be switched into a broken
/// state to simulate a dead transport.
#[derive(Default)]
pub struct MemoryOutbound {
    frames: Mutex<Vec<Bytes>>,
    broken: AtomicBool,
    closed: AtomicBool,
}

impl MemoryOutbound {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn broken() -> Arc<Self> {
        let outbound = Self::default();
        outbound.broken.store(true, Ordering::SeqCst);
        Arc::new(outbound)
    }

    pub fn break_transport(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn frames(&self) -> Vec<Bytes> {
        lock(&self.frames).clone()
    }

    /// Decodes every recorded `Data` frame into a message.
    pub fn messages(&self) -> Vec<Message> {
        let mut decoder = Decoder::new();
        let mut messages = Vec::new();
        for frame in self.frames() {
            for packet in decoder.decode(&frame).packets {
                if packet.kind == PacketType::Data {
                    if let Ok(message) = Message::decode(&packet.payload) {
                        messages.push(message);
                    }
                }
            }
        }
        messages
    }
}

impl Outbound for MemoryOutbound {
    fn send(&self, frame: Bytes) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "transport is broken",
            )));
        }
        lock(&self.frames).push(frame);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

type ClosedCallback = Box<dyn FnOnce(&Session) + Send>;

pub struct Session {
    id: u64,
    uid: AtomicI64,
    state: AtomicU8,
    last_mid: AtomicU64,
    last_seen: Mutex<Instant>,
    outbound: Arc<dyn Outbound>,
    router: Arc<Router>,
    origin: Option<RemoteOrigin>,
    callbacks: Mutex<Option<Vec<ClosedCallback>>>,
    closed: Notify,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("state", &self.state())
            .field("origin", &self.origin)
            .finish()
    }
}

impl Session {
    /// Creates a session for a freshly accepted transport.
    pub fn new(id: u64, outbound: Arc<dyn Outbound>, router: Arc<Router>) -> Arc<Self> {
        Arc::new(Self::build(id, outbound, router, None, CONNECTING))
    }

    /// Creates an active session standing in for a session on another node.
    pub fn proxy(
        id: u64,
        outbound: Arc<dyn Outbound>,
        router: Arc<Router>,
        origin: RemoteOrigin,
        uid: i64,
    ) -> Arc<Self> {
        let session = Self::build(id, outbound, router, Some(origin), ACTIVE);
        if uid > 0 {
            session.uid.store(uid, Ordering::SeqCst);
        }
        Arc::new(session)
    }

    fn build(
        id: u64,
        outbound: Arc<dyn Outbound>,
        router: Arc<Router>,
        origin: Option<RemoteOrigin>,
        state: u8,
    ) -> Self {
        Self {
            id,
            uid: AtomicI64::new(0),
            state: AtomicU8::new(state),
            last_mid: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
            outbound,
            router,
            origin,
            callbacks: Mutex::new(Some(Vec::new())),
            closed: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bound identity, 0 while unbound.
    pub fn uid(&self) -> i64 {
        self.uid.load(Ordering::SeqCst)
    }

    pub fn is_bound(&self) -> bool {
        self.uid() != 0
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_raw(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    pub fn origin(&self) -> Option<RemoteOrigin> {
        self.origin
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Completes the handshake. Returns false unless the session was connecting.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(CONNECTING, ACTIVE, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Binds the session to an application identity. Rebinding to the same
    /// uid is a no-op; rebinding to a different one fails.
    pub fn bind(&self, uid: i64) -> Result<()> {
        if uid <= 0 {
            return Err(Error::InvalidUid(uid));
        }
        match self
            .uid
            .compare_exchange(0, uid, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                debug!("Session {} bound to uid {}", self.id, uid);
                Ok(())
            }
            Err(current) if current == uid => Ok(()),
            Err(current) => Err(Error::Bind {
                current,
                requested: uid,
            }),
        }
    }

    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    pub fn last_seen(&self) -> Instant {
        *lock(&self.last_seen)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen().elapsed()
    }

    pub(crate) fn set_last_mid(&self, mid: u64) {
        self.last_mid.store(mid, Ordering::SeqCst);
    }

    /// Id of the request currently being answered.
    pub fn last_mid(&self) -> u64 {
        self.last_mid.load(Ordering::SeqCst)
    }

    /// Issues an RPC with this session as origin. Fire-and-forget calls
    /// return once the router has accepted them.
    pub async fn call(
        self: &Arc<Self>,
        route: &str,
        payload: Vec<u8>,
        wants_response: bool,
    ) -> Result<Option<Vec<u8>>> {
        self.ensure_active()?;
        let router = Arc::clone(&self.router);
        router.route_call(self, route, payload, wants_response).await
    }

    /// Answers the request currently being handled.
    pub fn respond(&self, payload: Vec<u8>) -> Result<()> {
        self.respond_to(self.last_mid(), payload)
    }

    pub fn respond_to(&self, mid: u64, payload: Vec<u8>) -> Result<()> {
        self.send_message(&Message::response(mid, payload))
    }

    pub fn respond_error(&self, mid: u64, reason: &str) -> Result<()> {
        self.send_message(&Message::error_response(mid, reason))
    }

    pub fn push(&self, route: &str, payload: Vec<u8>) -> Result<()> {
        self.send_message(&Message::push(route, payload))
    }

    fn send_message(&self, message: &Message) -> Result<()> {
        self.ensure_active()?;
        let frame = message_frame(message, self.router.max_packet_size())?;
        self.outbound.send(frame)
    }

    /// Writes an already encoded frame. Used for broadcasts and relayed pushes.
    pub(crate) fn send_frame(&self, frame: Bytes) -> Result<()> {
        self.ensure_active()?;
        self.outbound.send(frame)
    }

    /// Writes a control packet; allowed during the handshake as well.
    pub(crate) fn send_packet(&self, kind: PacketType, payload: &[u8]) -> Result<()> {
        match self.state() {
            SessionState::Connecting | SessionState::Active => {
                let frame = encode(kind, payload)?;
                self.outbound.send(Bytes::from(frame))
            }
            _ => Err(Error::SessionClosed(self.id)),
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(Error::SessionClosed(self.id))
        }
    }

    /// Registers a callback run once, in registration order, when the session
    /// closes. On an already closed session the callback runs immediately.
    pub fn on_closed<F>(&self, callback: F)
    where
        F: FnOnce(&Session) + Send + 'static,
    {
        let mut callbacks = lock(&self.callbacks);
        match callbacks.as_mut() {
            Some(pending) => pending.push(Box::new(callback)),
            None => {
                drop(callbacks);
                callback(self);
            }
        }
    }

    /// Sends a `Kick` packet and closes the session.
    pub fn kick(&self, reason: &str) -> Result<()> {
        let sent = self.send_packet(PacketType::Kick, reason.as_bytes());
        self.close();
        sent
    }

    /// Transitions to closed, firing callbacks exactly once.
    pub fn close(&self) {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if current >= CLOSING {
                return;
            }
            match self
                .state
                .compare_exchange(current, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        let callbacks = lock(&self.callbacks).take().unwrap_or_default();
        for callback in callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(self))) {
                warn!(
                    "Close callback of session {} panicked: {}",
                    self.id,
                    panic_message(payload.as_ref())
                );
            }
        }

        self.outbound.close();
        self.state.store(CLOSED, Ordering::SeqCst);
        self.closed.notify_waiters();
        debug!("Session {} closed", self.id);
    }

    /// Resolves once the session has reached `Closed`.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.closed.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Encodes a message as one `Data` frame, enforcing the packet size limit.
pub(crate) fn message_frame(message: &Message, max_packet_size: usize) -> Result<Bytes> {
    let payload = message.encode()?;
    let frame = encode(PacketType::Data, &payload)?;
    if frame.len() > max_packet_size {
        return Err(Error::Protocol(ProtocolError::PacketTooLarge {
            size: frame.len(),
            max: max_packet_size,
        }));
    }
    Ok(Bytes::from(frame))
}

/// Live client sessions of this process, keyed by session id.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Issues a process-unique session id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn insert(&self, session: Arc<Session>) {
        lock(&self.sessions).insert(session.id(), session);
    }

    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        lock(&self.sessions).remove(&id)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        lock(&self.sessions).get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.sessions).is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Removes and returns sessions that have been silent for longer than
    /// `timeout`. The caller closes them outside the registry lock.
    pub fn check_timeouts(&self, timeout: Duration) -> Vec<Arc<Session>> {
        let mut sessions = lock(&self.sessions);
        let expired: Vec<u64> = sessions
            .iter()
            .filter(|(_, s)| s.idle_for() > timeout)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .collect()
    }

    /// Closes every session and empties the table.
    pub fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }
}
