//! Client connection handling
//!
//! Each accepted client stream gets one task running [`serve_client`]: it
//! owns the read half, decodes packets and dispatches them strictly in
//! arrival order. Writes go through a separate writer task so handlers never
//! block on a slow socket.
//!
//! Connection lifecycle:
//! 1. client sends `Handshake`, server answers `Handshake` with the session id
//!    and heartbeat interval,
//! 2. client sends `HandshakeAck`, the session becomes active,
//! 3. `Data` packets carry requests and notifies, `Heartbeat` packets are
//!    echoed,
//! 4. any protocol violation closes the connection.

use crate::error::{Error, Result};
use crate::router::Router;
use crate::session::{run_writer, ChannelOutbound, Session, SessionState};
use log::{debug, info, warn};
use shared::{
    Decoder, HandshakeRequest, HandshakeResponse, Message, MessageKind, Packet, PacketType,
    ProtocolError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

const READ_BUFFER_SIZE: usize = 4096;

/// Serves one client stream until it closes, is kicked, or violates the
/// protocol. Returns once the session is closed and unregistered.
pub async fn serve_client<S>(stream: S, peer: String, router: Arc<Router>, heartbeat: Duration)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (outbound, rx) = ChannelOutbound::new();
    tokio::spawn(run_writer(writer, rx, peer.clone()));

    let id = router.sessions().next_id();
    let session = Session::new(id, Arc::new(outbound), Arc::clone(&router));
    router.attach_hooks(&session);
    router.sessions().insert(Arc::clone(&session));
    info!("Session {} opened for {}", id, peer);

    let mut decoder = Decoder::with_max_packet_size(router.max_packet_size());
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'read: loop {
        let n = tokio::select! {
            _ = session.wait_closed() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Read from {} failed: {}", peer, e);
                    break;
                }
            },
        };

        let decoded = decoder.decode(&buf[..n]);
        for packet in decoded.packets {
            if let Err(e) = handle_packet(&session, &router, packet, heartbeat).await {
                warn!("Closing session {} ({}): {}", id, peer, e);
                break 'read;
            }
            if session.is_closed() {
                break 'read;
            }
        }
        if let Some(e) = decoded.error {
            warn!("Protocol violation from {}: {}", peer, e);
            break;
        }
    }

    router.sessions().remove(id);
    session.close();
    info!("Session {} for {} closed", id, peer);
}

/// Handles one packet. An error means the connection can no longer be
/// trusted and must close.
async fn handle_packet(
    session: &Arc<Session>,
    router: &Router,
    packet: Packet,
    heartbeat: Duration,
) -> Result<()> {
    session.touch();
    match packet.kind {
        PacketType::Handshake => {
            if session.state() != SessionState::Connecting {
                return Err(violation("repeated handshake"));
            }
            let request = HandshakeRequest::decode(&packet.payload)?;
            debug!("Session {} handshake, client version {}", session.id(), request.version);
            let response = HandshakeResponse {
                session_id: session.id(),
                heartbeat_secs: heartbeat.as_secs().max(1),
            };
            session.send_packet(PacketType::Handshake, &response.encode()?)
        }
        PacketType::HandshakeAck => {
            if session.activate() {
                Ok(())
            } else {
                Err(violation("handshake ack outside of handshake"))
            }
        }
        PacketType::Heartbeat => session.send_packet(PacketType::Heartbeat, &[]),
        PacketType::Data => {
            if !session.is_active() {
                return Err(violation("data before handshake completed"));
            }
            let message = Message::decode(&packet.payload)?;
            dispatch(session, router, message).await;
            Ok(())
        }
        PacketType::Kick => {
            debug!("Session {} left", session.id());
            session.close();
            Ok(())
        }
    }
}

/// Runs a client message through the router. Failures are reported to the
/// client, never escalated to the connection.
async fn dispatch(session: &Arc<Session>, router: &Router, message: Message) {
    match message.kind {
        MessageKind::Request => {
            session.set_last_mid(message.id);
            let result = router.serve(session, &message.route, message.data, true).await;
            let written = match result {
                Ok(Some(payload)) => session.respond_to(message.id, payload),
                Ok(None) => Ok(()),
                Err(e) => {
                    debug!("Request {} from session {} failed: {}", message.route, session.id(), e);
                    session.respond_error(message.id, &e.to_string())
                }
            };
            if let Err(e) = written {
                debug!("Response to session {} not written: {}", session.id(), e);
            }
        }
        MessageKind::Notify => {
            session.set_last_mid(0);
            if let Err(e) = router.serve(session, &message.route, message.data, false).await {
                warn!("Notify {} from session {} failed: {}", message.route, session.id(), e);
            }
        }
        MessageKind::Response | MessageKind::Push => {
            warn!("Session {} sent a server-only {:?} message", session.id(), message.kind);
        }
    }
}

fn violation(reason: &str) -> Error {
    Error::Protocol(ProtocolError::Malformed(reason.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, Components};
    use shared::{encode, PROTOCOL_VERSION};
    use std::collections::VecDeque;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    fn router() -> Arc<Router> {
        let mut components = Components::new();
        components
            .register(
                Component::new("Echo")
                    .method("Say", |_, payload| async move { Ok(Some(payload)) })
                    .method("Bind", |session, payload| async move {
                        let uid = String::from_utf8_lossy(&payload).parse::<i64>().unwrap_or(0);
                        session.bind(uid)?;
                        session.respond(b"bound".to_vec())?;
                        Ok(None)
                    })
                    .method("Crash", |_, _| async {
                        if true {
                            panic!("handler bug");
                        }
                        Ok(None)
                    }),
            )
            .unwrap();
        Router::builder().components(Arc::new(components)).build()
    }

    struct TestClient {
        stream: DuplexStream,
        decoder: Decoder,
        backlog: VecDeque<Packet>,
    }

    impl TestClient {
        async fn send(&mut self, kind: PacketType, payload: &[u8]) {
            let frame = encode(kind, payload).unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn request(&mut self, id: u64, route: &str, data: &[u8]) {
            let message = Message::request(id, route, data.to_vec());
            self.send(PacketType::Data, &message.encode().unwrap()).await;
        }

        async fn next(&mut self) -> Option<Packet> {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(packet) = self.backlog.pop_front() {
                    return Some(packet);
                }
                let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                if n == 0 {
                    return None;
                }
                self.backlog.extend(self.decoder.decode(&buf[..n]).packets);
            }
        }

        async fn next_message(&mut self) -> Message {
            match self.next().await {
                Some(packet) if packet.kind == PacketType::Data => Message::decode(&packet.payload).unwrap(),
                other => panic!("Unexpected packet {other:?}"),
            }
        }

        async fn handshake(&mut self) -> HandshakeResponse {
            let request = HandshakeRequest {
                version: PROTOCOL_VERSION.to_string(),
            };
            self.send(PacketType::Handshake, &request.encode().unwrap()).await;
            let packet = self.next().await.unwrap();
            assert_eq!(packet.kind, PacketType::Handshake);
            let response = HandshakeResponse::decode(&packet.payload).unwrap();
            self.send(PacketType::HandshakeAck, &[]).await;
            response
        }
    }

    fn connect(router: &Arc<Router>) -> (TestClient, tokio::task::JoinHandle<()>) {
        let (client, server) = duplex(64 * 1024);
        let task = tokio::spawn(serve_client(
            server,
            "test".into(),
            Arc::clone(router),
            Duration::from_secs(10),
        ));
        (
            TestClient {
                stream: client,
                decoder: Decoder::new(),
                backlog: VecDeque::new(),
            },
            task,
        )
    }

    #[tokio::test]
    async fn test_handshake_and_request() {
        let router = router();
        let (mut client, _task) = connect(&router);

        let response = client.handshake().await;
        assert_eq!(response.heartbeat_secs, 10);
        assert_eq!(router.sessions().len(), 1);

        client.request(1, "Echo.Say", b"hello").await;
        let reply = client.next_message().await;
        assert_eq!(reply.kind, MessageKind::Response);
        assert_eq!(reply.id, 1);
        assert_eq!(reply.data, b"hello");
    }

    #[tokio::test]
    async fn test_handler_responding_itself() {
        let router = router();
        let (mut client, _task) = connect(&router);
        let handshake = client.handshake().await;

        client.request(5, "Echo.Bind", b"77").await;
        let reply = client.next_message().await;
        assert_eq!(reply.id, 5);
        assert_eq!(reply.data, b"bound");
        assert_eq!(router.sessions().get(handshake.session_id).unwrap().uid(), 77);
    }

    #[tokio::test]
    async fn test_errors_become_error_responses() {
        let router = router();
        let (mut client, _task) = connect(&router);
        client.handshake().await;

        client.request(1, "Room.Join", b"").await;
        let reply = client.next_message().await;
        assert!(reply.error);
        assert!(reply.error_text().unwrap().contains("Room"));

        client.request(2, "Echo.Crash", b"").await;
        let reply = client.next_message().await;
        assert_eq!(reply.id, 2);
        assert!(reply.error_text().unwrap().contains("panicked"));

        client.request(3, "Echo.Say", b"alive").await;
        assert_eq!(client.next_message().await.data, b"alive");
    }

    #[tokio::test]
    async fn test_heartbeat_is_echoed() {
        let router = router();
        let (mut client, _task) = connect(&router);
        client.handshake().await;

        client.send(PacketType::Heartbeat, &[]).await;
        assert_eq!(client.next().await.unwrap().kind, PacketType::Heartbeat);
    }

    #[tokio::test]
    async fn test_data_before_handshake_closes_connection() {
        let router = router();
        let (mut client, task) = connect(&router);

        client.request(1, "Echo.Say", b"too early").await;
        assert!(client.next().await.is_none());
        task.await.unwrap();
        assert!(router.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_oversize_packet_closes_only_this_connection() {
        let router = Router::builder().max_packet_size(128).build();
        let (mut bad, bad_task) = connect(&router);
        let (mut good, _good_task) = connect(&router);
        bad.handshake().await;
        good.handshake().await;

        bad.send(PacketType::Data, &[0u8; 512]).await;
        assert!(bad.next().await.is_none());
        bad_task.await.unwrap();

        good.send(PacketType::Heartbeat, &[]).await;
        assert_eq!(good.next().await.unwrap().kind, PacketType::Heartbeat);
        assert_eq!(router.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_kick_from_server_closes_connection() {
        let router = router();
        let (mut client, task) = connect(&router);
        let handshake = client.handshake().await;

        let session = router.sessions().get(handshake.session_id).unwrap();
        session.kick("maintenance").unwrap();

        let packet = client.next().await.unwrap();
        assert_eq!(packet.kind, PacketType::Kick);
        assert_eq!(packet.payload, b"maintenance");
        task.await.unwrap();
        assert!(router.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_client_disconnect_fires_close_callbacks() {
        let router = router();
        let (mut client, task) = connect(&router);
        let handshake = client.handshake().await;
        client.send(PacketType::Heartbeat, &[]).await;
        client.next().await.unwrap();

        let session = router.sessions().get(handshake.session_id).unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        session.on_closed(move |s| {
            let _ = tx.send(s.id());
        });

        drop(client);
        task.await.unwrap();
        assert_eq!(rx.await.unwrap(), handshake.session_id);
    }

    #[tokio::test]
    async fn test_scripted_client_sending_data_before_ack() {
        let request = HandshakeRequest {
            version: PROTOCOL_VERSION.to_string(),
        };
        let response = HandshakeResponse {
            session_id: 1,
            heartbeat_secs: 10,
        };
        let early = Message::request(1, "Echo.Say", b"too soon".to_vec());
        let stream = tokio_test::io::Builder::new()
            .read(&encode(PacketType::Handshake, &request.encode().unwrap()).unwrap())
            .write(&encode(PacketType::Handshake, &response.encode().unwrap()).unwrap())
            .read(&encode(PacketType::Data, &early.encode().unwrap()).unwrap())
            .build();

        let router = router();
        tokio::time::timeout(
            Duration::from_secs(2),
            serve_client(stream, "scripted".into(), Arc::clone(&router), Duration::from_secs(10)),
        )
        .await
        .unwrap();
        assert!(router.sessions().is_empty());
    }
}
