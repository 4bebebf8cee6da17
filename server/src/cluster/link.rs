//! Inter-node links
//!
//! A link is one bidirectional byte stream between two nodes carrying
//! [`NodeMessage`]s inside `Data` frames. Each link runs a reader task and a
//! writer task. Replies are matched to their calls here; every other message
//! goes to the link's [`LinkHandler`] in arrival order.

use crate::error::{Error, Result};
use crate::session::{run_writer, OutboundFrame};
use crate::utils::lock;
use bytes::Bytes;
use log::{debug, warn};
use shared::{CallResult, Decoder, NodeMessage, PacketType, RemoteCall};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};

const READ_BUFFER_SIZE: usize = 8192;

pub trait LinkHandler: Send + Sync + 'static {
    /// Called from the link's reader task for every message except replies.
    fn on_message(&self, link: &Arc<NodeLink>, message: NodeMessage);

    fn on_closed(&self, _link: &Arc<NodeLink>) {}
}

pub struct NodeLink {
    peer: String,
    tx: mpsc::UnboundedSender<OutboundFrame>,
    pending: Mutex<HashMap<u64, oneshot::Sender<CallResult>>>,
    next_call: AtomicU64,
    closed: AtomicBool,
    closed_notify: Notify,
    max_packet_size: usize,
}

impl std::fmt::Debug for NodeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLink")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl NodeLink {
    /// Dials `addr` over TCP and starts the link tasks.
    pub async fn connect(
        addr: &str,
        handler: Arc<dyn LinkHandler>,
        max_packet_size: usize,
    ) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::spawn(stream, addr.to_string(), handler, max_packet_size))
    }

    /// Starts the link tasks over an already established stream.
    pub fn spawn<S>(
        stream: S,
        peer: String,
        handler: Arc<dyn LinkHandler>,
        max_packet_size: usize,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Self {
            peer: peer.clone(),
            tx,
            pending: Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            max_packet_size,
        });

        tokio::spawn(run_writer(writer, rx, peer));
        tokio::spawn(read_loop(reader, Arc::clone(&link), handler));
        link
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn send(&self, message: &NodeMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::LinkClosed(self.peer.clone()));
        }
        let frame = message.to_frame()?;
        if frame.len() > self.max_packet_size {
            return Err(Error::Protocol(shared::ProtocolError::PacketTooLarge {
                size: frame.len(),
                max: self.max_packet_size,
            }));
        }
        self.tx
            .send(OutboundFrame::Frame(Bytes::from(frame)))
            .map_err(|_| Error::LinkClosed(self.peer.clone()))
    }

    /// Forwards a call. Fire-and-forget calls return once queued; others wait
    /// for the matching reply for at most `timeout`.
    pub async fn call(&self, mut call: RemoteCall, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let route = call.route.clone();
        if !call.wants_response {
            call.call_id = 0;
            self.send(&NodeMessage::Call(call))?;
            return Ok(None);
        }

        let call_id = self.next_call.fetch_add(1, Ordering::SeqCst);
        call.call_id = call_id;
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.pending).insert(call_id, reply_tx);

        if let Err(e) = self.send(&NodeMessage::Call(call)) {
            lock(&self.pending).remove(&call_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(payload))) => Ok(payload),
            Ok(Ok(Err(failure))) => Err(Error::from_remote(&route, failure)),
            Ok(Err(_)) => Err(Error::LinkClosed(self.peer.clone())),
            Err(_) => {
                lock(&self.pending).remove(&call_id);
                Err(Error::Timeout { route, timeout })
            }
        }
    }

    fn complete(&self, call_id: u64, result: CallResult) {
        match lock(&self.pending).remove(&call_id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!("Late reply {} from {} dropped", call_id, self.peer),
        }
    }

    /// Flushes queued frames, then closes the stream. Pending calls fail.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(OutboundFrame::Close);
        lock(&self.pending).clear();
        self.closed_notify.notify_waiters();
    }

    pub async fn wait_closed(&self) {
        loop {
            let notified = self.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

async fn read_loop<R>(mut reader: R, link: Arc<NodeLink>, handler: Arc<dyn LinkHandler>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = Decoder::with_max_packet_size(link.max_packet_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'read: loop {
        let n = tokio::select! {
            _ = link.wait_closed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Link to {} failed: {}", link.peer, e);
                    break;
                }
            },
        };

        let decoded = decoder.decode(&buf[..n]);
        for packet in decoded.packets {
            match packet.kind {
                PacketType::Data => match NodeMessage::decode(&packet.payload) {
                    Ok(NodeMessage::Reply { call_id, result }) => link.complete(call_id, result),
                    Ok(message) => handler.on_message(&link, message),
                    Err(e) => {
                        warn!("Malformed message from {}: {}", link.peer, e);
                        break 'read;
                    }
                },
                PacketType::Heartbeat => {}
                other => {
                    warn!("Unexpected {:?} packet on link to {}", other, link.peer);
                    break 'read;
                }
            }
        }
        if let Some(e) = decoded.error {
            warn!("Protocol violation on link to {}: {}", link.peer, e);
            break;
        }
    }

    link.close();
    handler.on_closed(&link);
}
