//! # RPC Client Library
//!
//! Client side of the runtime's packet protocol. A [`Connector`] opens a
//! stream to a gate node, performs the handshake, keeps the connection alive
//! with heartbeats and then multiplexes requests, notifies and server pushes
//! over it.
//!
//! ## Connection Lifecycle
//!
//! 1. The client sends `Handshake` carrying its protocol version.
//! 2. The server answers `Handshake` with the session id and the heartbeat
//!    interval it expects.
//! 3. The client acknowledges with `HandshakeAck`; the session is active.
//! 4. Either side may send `Kick` to end the session.
//!
//! ## Request Matching
//!
//! Every request carries a fresh id. Responses are matched to the waiting
//! caller by that id, so several requests may be in flight at once. Pushes
//! (group broadcasts, `Session::push` on the server) arrive on a separate
//! queue read with [`Connector::next_push`].
//!
//! ## Usage Example
//!
//! ```no_run
//! use client::Connector;
//!
//! # async fn run() -> client::Result<()> {
//! let client = Connector::connect("127.0.0.1:3251").await?;
//! let members = client.request("Room.Join", b"1001".to_vec()).await?;
//! println!("lobby: {}", String::from_utf8_lossy(&members));
//!
//! while let Some(push) = client.next_push().await {
//!     println!("{}: {:?}", push.route, push.data);
//! }
//! # Ok(())
//! # }
//! ```

mod error;

pub use error::{ClientError, Result};

use log::{debug, info, warn};
use shared::{
    encode, frame_type, Decoder, HandshakeRequest, HandshakeResponse, Message, MessageKind, Packet,
    PacketType, PROTOCOL_VERSION,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const READ_BUFFER_SIZE: usize = 4096;
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// A message the server sent without being asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub route: String,
    pub data: Vec<u8>,
}

// State shared between the connector and its reader task
struct Inner {
    pending: Mutex<HashMap<u64, oneshot::Sender<Message>>>,
    closed: AtomicBool,
    kicked: AtomicBool,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Message>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Dropping the senders wakes every waiting request with an error.
    fn shut(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending().clear();
    }

    fn failure(&self) -> ClientError {
        if self.kicked.load(Ordering::SeqCst) {
            ClientError::Kicked
        } else {
            ClientError::Closed
        }
    }
}

/// An established client connection.
pub struct Connector {
    session_id: u64,
    heartbeat: Duration,
    next_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inner: Arc<Inner>,
    pushes: tokio::sync::Mutex<mpsc::UnboundedReceiver<Push>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
}

impl Connector {
    pub async fn connect(addr: &str) -> Result<Self> {
        info!("Connecting to {}...", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::handshake(stream).await
    }

    /// Runs the handshake over an already open stream and starts the
    /// reader, writer and heartbeat tasks.
    pub async fn handshake<S>(mut stream: S) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let request = HandshakeRequest {
            version: PROTOCOL_VERSION.to_string(),
        };
        stream
            .write_all(&encode(PacketType::Handshake, &request.encode()?)?)
            .await?;

        let mut decoder = Decoder::new();
        let mut backlog: VecDeque<Packet> = VecDeque::new();
        let response = loop {
            if let Some(packet) = backlog.pop_front() {
                match packet.kind {
                    PacketType::Handshake => break HandshakeResponse::decode(&packet.payload)?,
                    PacketType::Kick => {
                        return Err(ClientError::Handshake("server refused the connection".into()))
                    }
                    other => {
                        return Err(ClientError::Handshake(format!(
                            "expected a handshake reply, got {:?}",
                            other
                        )))
                    }
                }
            }
            if !read_packets(&mut stream, &mut decoder, &mut backlog).await? {
                return Err(ClientError::Handshake("connection closed during handshake".into()));
            }
        };

        stream.write_all(&encode(PacketType::HandshakeAck, &[])?).await?;

        let heartbeat = Duration::from_secs(response.heartbeat_secs.max(1));
        info!(
            "Connected! Session ID: {}, heartbeat every {:?}",
            response.session_id, heartbeat
        );

        let (read_half, write_half) = tokio::io::split(stream);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            kicked: AtomicBool::new(false),
        });

        let writer = tokio::spawn(write_loop(write_half, outbound_rx));
        let reader = tokio::spawn(read_loop(
            read_half,
            decoder,
            backlog,
            Arc::clone(&inner),
            push_tx,
        ));
        let heartbeat_task = tokio::spawn(heartbeat_loop(outbound.clone(), heartbeat));

        Ok(Self {
            session_id: response.session_id,
            heartbeat,
            next_id: AtomicU64::new(1),
            outbound,
            inner,
            pushes: tokio::sync::Mutex::new(push_rx),
            writer: Mutex::new(Some(writer)),
            reader,
            heartbeat_task,
        })
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn was_kicked(&self) -> bool {
        self.inner.kicked.load(Ordering::SeqCst)
    }

    /// Sends a request and waits for the response with the same id.
    ///
    /// An error response from the server becomes [`ClientError::Remote`].
    pub async fn request(&self, route: &str, data: Vec<u8>) -> Result<Vec<u8>> {
        check_route(route)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(id, tx);

        // The reader may have shut down between the caller's last check and
        // the insert above; nothing would ever resolve the entry then.
        if self.is_closed() {
            self.inner.pending().remove(&id);
            return Err(self.inner.failure());
        }

        if let Err(e) = self.send(&Message::request(id, route, data)) {
            self.inner.pending().remove(&id);
            return Err(e);
        }

        let response = rx.await.map_err(|_| self.inner.failure())?;
        match response.error_text() {
            Some(text) => Err(ClientError::Remote(text)),
            None => Ok(response.data),
        }
    }

    /// Fire-and-forget call; the server never answers it.
    pub fn notify(&self, route: &str, data: Vec<u8>) -> Result<()> {
        check_route(route)?;
        self.send(&Message::notify(route, data))
    }

    /// Next server push, or `None` once the connection is gone and every
    /// buffered push has been read.
    pub async fn next_push(&self) -> Option<Push> {
        self.pushes.lock().await.recv().await
    }

    /// Kicks the session from the client side and waits briefly for the
    /// frame to leave. Works through a shared handle; later calls do nothing.
    pub async fn close(&self) {
        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(writer) = writer else {
            return;
        };
        if let Ok(frame) = encode(PacketType::Kick, &[]) {
            let _ = self.outbound.send(frame);
        }
        self.heartbeat_task.abort();
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await;
        self.inner.shut();
        info!("Disconnected from session {}", self.session_id);
    }

    fn send(&self, message: &Message) -> Result<()> {
        if self.is_closed() {
            return Err(self.inner.failure());
        }
        let frame = encode(PacketType::Data, &message.encode()?)?;
        self.outbound
            .send(frame)
            .map_err(|_| self.inner.failure())
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.heartbeat_task.abort();
        self.reader.abort();
        if let Some(writer) = self
            .writer
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            writer.abort();
        }
        self.inner.shut();
    }
}

fn check_route(route: &str) -> Result<()> {
    match route.split_once('.') {
        Some((service, method))
            if !service.is_empty() && !method.is_empty() && !method.contains('.') =>
        {
            Ok(())
        }
        _ => Err(ClientError::InvalidRoute(route.to_string())),
    }
}

// Reads one chunk into the backlog. Returns false on end of stream.
async fn read_packets<R>(
    reader: &mut R,
    decoder: &mut Decoder,
    backlog: &mut VecDeque<Packet>,
) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let n = reader.read(&mut buf).await?;
    if n == 0 {
        return Ok(false);
    }
    let decoded = decoder.decode(&buf[..n]);
    backlog.extend(decoded.packets);
    match decoded.error {
        Some(e) => Err(e.into()),
        None => Ok(true),
    }
}

async fn read_loop<R>(
    mut reader: R,
    mut decoder: Decoder,
    mut backlog: VecDeque<Packet>,
    inner: Arc<Inner>,
    pushes: mpsc::UnboundedSender<Push>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        while let Some(packet) = backlog.pop_front() {
            if !handle_packet(packet, &inner, &pushes) {
                inner.shut();
                return;
            }
        }
        match read_packets(&mut reader, &mut decoder, &mut backlog).await {
            Ok(true) => {}
            Ok(false) => {
                info!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Connection lost: {}", e);
                break;
            }
        }
    }
    inner.shut();
}

// Returns false when the connection must end.
fn handle_packet(packet: Packet, inner: &Inner, pushes: &mpsc::UnboundedSender<Push>) -> bool {
    match packet.kind {
        PacketType::Heartbeat => debug!("Heartbeat from server"),
        PacketType::Kick => {
            warn!("Kicked by server");
            inner.kicked.store(true, Ordering::SeqCst);
            return false;
        }
        PacketType::Data => {
            let message = match Message::decode(&packet.payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!("Undecodable message from server: {}", e);
                    return false;
                }
            };
            match message.kind {
                MessageKind::Response => match inner.pending().remove(&message.id) {
                    Some(waiter) => {
                        let _ = waiter.send(message);
                    }
                    None => debug!("Dropping response to unknown request {}", message.id),
                },
                MessageKind::Push => {
                    let _ = pushes.send(Push {
                        route: message.route,
                        data: message.data,
                    });
                }
                other => warn!("Ignoring {:?} message from server", other),
            }
        }
        other => {
            warn!("Unexpected {:?} packet after handshake", other);
            return false;
        }
    }
    true
}

async fn write_loop<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!("Failed to send to server: {}", e);
            return;
        }
        if frame_type(&frame) == Some(PacketType::Kick) {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn heartbeat_loop(outbound: mpsc::UnboundedSender<Vec<u8>>, period: Duration) {
    let Ok(frame) = encode(PacketType::Heartbeat, &[]) else {
        return;
    };
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if outbound.send(frame.clone()).is_err() {
            return;
        }
    }
}
