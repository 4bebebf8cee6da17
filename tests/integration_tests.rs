//! Integration tests for the cluster RPC runtime
//!
//! These tests run real nodes on loopback sockets and talk to them through
//! the client library, validating cross-crate behavior end to end.

use client::{ClientError, Connector};
use server::{Component, Group, JsonSerializer, Node, NodeConfig, Serializer};
use shared::{encode, Decoder, MemberInfo, Message, PacketType};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};

const WAIT: Duration = Duration::from_secs(5);

async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "condition never held");
        sleep(Duration::from_millis(10)).await;
    }
}

fn service_config(master: &Node, node_id: u64) -> NodeConfig {
    NodeConfig::new("127.0.0.1:0")
        .with_master_addr(master.service_addr())
        .with_node_id(node_id)
        .with_retry_interval(Duration::from_millis(50))
}

/// WIRE CODEC TESTS
mod codec_tests {
    use super::*;

    /// A frame written by one side decodes to the same packet on the other
    #[test]
    fn hello_frame_survives_the_wire() {
        let frame = encode(PacketType::Data, b"hello").unwrap();
        assert_eq!(&frame[..3], &[0x04, 0x00, 0x05]);

        let decoded = Decoder::new().decode(&frame);
        assert!(decoded.error.is_none());
        assert_eq!(decoded.packets.len(), 1);
        assert_eq!(decoded.packets[0].kind, PacketType::Data);
        assert_eq!(decoded.packets[0].payload, b"hello");
    }

    /// Packets produced depend only on the bytes received, not on chunking
    #[test]
    fn arbitrary_chunking_yields_identical_packets() {
        let mut stream = Vec::new();
        for (i, kind) in [PacketType::Heartbeat, PacketType::Data, PacketType::Kick]
            .into_iter()
            .enumerate()
        {
            stream.extend(encode(kind, &vec![i as u8; i * 40]).unwrap());
        }
        stream.extend(encode(PacketType::Data, &vec![9u8; 70_000]).unwrap());

        let whole = Decoder::new().decode(&stream).packets;
        assert_eq!(whole.len(), 4);

        for chunk_size in [1, 2, 3, 7, 64, 4096] {
            let mut decoder = Decoder::new();
            let mut packets = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                let decoded = decoder.decode(chunk);
                assert!(decoded.error.is_none());
                packets.extend(decoded.packets);
            }
            assert_eq!(packets, whole, "chunk size {chunk_size}");
        }
    }

    /// Messages ride inside Data frames unchanged
    #[test]
    fn request_message_roundtrip_in_frame() {
        let message = Message::request(42, "Room.Join", b"1001".to_vec());
        let frame = encode(PacketType::Data, &message.encode().unwrap()).unwrap();
        let packet = Decoder::new().decode(&frame).packets.remove(0);
        assert_eq!(Message::decode(&packet.payload).unwrap(), message);
    }
}

/// CLUSTER ROUTING TESTS
mod cluster_tests {
    use super::*;

    fn room(joined: Arc<AtomicUsize>) -> Component {
        Component::new("Room").method("Join", move |session, payload| {
            let joined = Arc::clone(&joined);
            async move {
                let uid = String::from_utf8_lossy(&payload)
                    .parse::<i64>()
                    .map_err(|e| e.to_string())?;
                session.bind(uid)?;
                joined.fetch_add(1, Ordering::SeqCst);
                Ok(Some(format!("welcome {uid}").into_bytes()))
            }
        })
    }

    /// A call from a node without the service is forwarded to the member
    /// advertising it
    #[tokio::test]
    async fn call_is_forwarded_to_the_advertising_member() {
        let master = Node::builder(
            NodeConfig::new("127.0.0.1:0")
                .master()
                .with_node_id(1)
                .with_client_addr("127.0.0.1:0"),
        )
        .startup()
        .await
        .unwrap();

        let joined = Arc::new(AtomicUsize::new(0));
        let backend = Node::builder(service_config(&master, 2))
            .register(room(Arc::clone(&joined)))
            .unwrap()
            .startup()
            .await
            .unwrap();
        backend.wait_registered(WAIT).await.unwrap();

        let advertising: Vec<MemberInfo> = master
            .members()
            .into_iter()
            .filter(|m| m.advertises("Room"))
            .collect();
        assert_eq!(advertising.len(), 1);
        assert_eq!(advertising[0].node_id, 2);

        let client = Connector::connect(master.client_addr().unwrap()).await.unwrap();
        let reply = client.request("Room.Join", b"1001".to_vec()).await.unwrap();
        assert_eq!(reply, b"welcome 1001");
        assert_eq!(joined.load(Ordering::SeqCst), 1);

        client.close().await;
        backend.shutdown().await;
        master.shutdown().await;
    }

    /// A gate learns about a backend registered before it and routes to it
    #[tokio::test]
    async fn gate_routes_through_master_membership() {
        let master = Node::builder(NodeConfig::new("127.0.0.1:0").master().with_node_id(1))
            .startup()
            .await
            .unwrap();
        let joined = Arc::new(AtomicUsize::new(0));
        let backend = Node::builder(service_config(&master, 2))
            .register(room(Arc::clone(&joined)))
            .unwrap()
            .startup()
            .await
            .unwrap();
        backend.wait_registered(WAIT).await.unwrap();

        let gate = Node::builder(service_config(&master, 3).with_client_addr("127.0.0.1:0"))
            .startup()
            .await
            .unwrap();
        gate.wait_registered(WAIT).await.unwrap();
        eventually(|| gate.members().iter().any(|m| m.advertises("Room"))).await;

        let client = Connector::connect(gate.client_addr().unwrap()).await.unwrap();
        assert_eq!(client.request("Room.Join", b"7".to_vec()).await.unwrap(), b"welcome 7");

        match client.request("Shop.Buy", Vec::new()).await {
            Err(ClientError::Remote(reason)) => assert!(reason.contains("Shop")),
            other => panic!("Unexpected result {other:?}"),
        }

        client.close().await;
        gate.shutdown().await;
        backend.shutdown().await;
        master.shutdown().await;
    }

    /// A forwarded call to a member that never answers times out and the
    /// calling session keeps working
    #[tokio::test]
    async fn silent_member_times_out_and_session_survives() {
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent_addr = silent.local_addr().unwrap().to_string();
        let hold = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = silent.accept().await {
                open.push(stream);
            }
        });

        let node = Node::builder(
            NodeConfig::new("127.0.0.1:0")
                .with_node_id(1)
                .with_call_timeout(Duration::from_millis(300)),
        )
        .register(Component::new("Echo").method("Say", |_, payload| async move { Ok(Some(payload)) }))
        .unwrap()
        .startup()
        .await
        .unwrap();
        node.router().members().add(MemberInfo {
            node_id: 99,
            service_addr: silent_addr,
            client_addr: None,
            is_master: false,
            services: vec!["Ghost".to_string()],
        });

        let client = Connector::connect(node.client_addr().unwrap()).await.unwrap();
        let started = Instant::now();
        match client.request("Ghost.Haunt", Vec::new()).await {
            Err(ClientError::Remote(reason)) => assert!(reason.contains("timed out"), "{reason}"),
            other => panic!("Unexpected result {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(300));

        assert_eq!(client.request("Echo.Say", b"still here".to_vec()).await.unwrap(), b"still here");

        client.close().await;
        node.shutdown().await;
        hold.abort();
    }

    /// Shutting a backend down removes it from every other member's view
    #[tokio::test]
    async fn backend_shutdown_withdraws_its_services() {
        let master = Node::builder(NodeConfig::new("127.0.0.1:0").master().with_node_id(1))
            .startup()
            .await
            .unwrap();
        let backend = Node::builder(service_config(&master, 2))
            .register(room(Arc::new(AtomicUsize::new(0))))
            .unwrap()
            .startup()
            .await
            .unwrap();
        backend.wait_registered(WAIT).await.unwrap();
        let gate = Node::builder(service_config(&master, 3))
            .startup()
            .await
            .unwrap();
        gate.wait_registered(WAIT).await.unwrap();
        eventually(|| gate.members().iter().any(|m| m.node_id == 2)).await;

        backend.shutdown().await;
        eventually(|| master.members().iter().all(|m| m.node_id != 2)).await;
        eventually(|| gate.members().iter().all(|m| m.node_id != 2)).await;

        gate.shutdown().await;
        master.shutdown().await;
    }
}

/// BROADCAST GROUP TESTS
mod group_tests {
    use super::*;

    fn lobby_node(lobby: Arc<Group>) -> Component {
        let join_lobby = Arc::clone(&lobby);
        Component::new("Lobby")
            .method("Join", move |session, payload| {
                let lobby = Arc::clone(&join_lobby);
                async move {
                    let uid = String::from_utf8_lossy(&payload)
                        .parse::<i64>()
                        .map_err(|e| e.to_string())?;
                    session.bind(uid)?;
                    let leaving = Arc::clone(&lobby);
                    session.on_closed(move |s| {
                        let _ = leaving.leave(s.id());
                    });
                    lobby.add(Arc::clone(&session))?;
                    Ok(Some(Vec::new()))
                }
            })
            .method("Leave", {
                let lobby = Arc::clone(&lobby);
                move |session, _| {
                    let lobby = Arc::clone(&lobby);
                    async move {
                        lobby.leave(session.id())?;
                        Ok(Some(Vec::new()))
                    }
                }
            })
            .method("Chat", move |_, payload| {
                let lobby = Arc::clone(&lobby);
                async move {
                    let report = lobby.broadcast("chat", payload)?;
                    Ok(Some(JsonSerializer.marshal(&report.delivered)?))
                }
            })
    }

    async fn expect_push(client: &Connector, data: &[u8]) {
        let push = tokio::time::timeout(WAIT, client.next_push())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(push.route, "chat");
        assert_eq!(push.data, data);
    }

    async fn expect_silence(client: &Connector) {
        let push = tokio::time::timeout(Duration::from_millis(200), client.next_push()).await;
        assert!(push.is_err(), "unexpected push {push:?}");
    }

    /// Lobby with A, B, C: everyone hears the first chat, B misses the
    /// second after leaving
    #[tokio::test]
    async fn lobby_broadcast_follows_membership() {
        let lobby = Group::new("lobby");
        let node = Node::builder(NodeConfig::new("127.0.0.1:0").with_node_id(1))
            .register(lobby_node(Arc::clone(&lobby)))
            .unwrap()
            .startup()
            .await
            .unwrap();
        let addr = node.client_addr().unwrap().to_string();

        let a = Connector::connect(&addr).await.unwrap();
        let b = Connector::connect(&addr).await.unwrap();
        let c = Connector::connect(&addr).await.unwrap();
        for (client, uid) in [(&a, "1"), (&b, "2"), (&c, "3")] {
            client.request("Lobby.Join", uid.as_bytes().to_vec()).await.unwrap();
        }
        assert_eq!(lobby.members(), vec![1, 2, 3]);

        let delivered = a.request("Lobby.Chat", b"m1".to_vec()).await.unwrap();
        assert_eq!(delivered, b"3");
        for client in [&a, &b, &c] {
            expect_push(client, b"m1").await;
        }

        b.request("Lobby.Leave", Vec::new()).await.unwrap();
        let delivered = c.request("Lobby.Chat", b"m2".to_vec()).await.unwrap();
        assert_eq!(delivered, b"2");
        assert_eq!(lobby.members(), vec![1, 3]);
        expect_push(&a, b"m2").await;
        expect_push(&c, b"m2").await;
        expect_silence(&b).await;

        a.close().await;
        b.close().await;
        c.close().await;
        node.shutdown().await;
    }

    /// A disconnecting client drops out of the group through its close
    /// callback
    #[tokio::test]
    async fn disconnect_leaves_the_group() {
        let lobby = Group::new("lobby");
        let node = Node::builder(NodeConfig::new("127.0.0.1:0").with_node_id(1))
            .register(lobby_node(Arc::clone(&lobby)))
            .unwrap()
            .startup()
            .await
            .unwrap();
        let addr = node.client_addr().unwrap().to_string();

        let stays = Connector::connect(&addr).await.unwrap();
        let goes = Connector::connect(&addr).await.unwrap();
        stays.request("Lobby.Join", b"10".to_vec()).await.unwrap();
        goes.request("Lobby.Join", b"20".to_vec()).await.unwrap();
        assert_eq!(lobby.count(), 2);

        goes.close().await;
        eventually(|| lobby.count() == 1).await;
        assert!(lobby.contains(10));
        assert!(!lobby.contains(20));

        let delivered = stays.request("Lobby.Chat", b"anyone?".to_vec()).await.unwrap();
        assert_eq!(delivered, b"1");
        expect_push(&stays, b"anyone?").await;

        stays.close().await;
        node.shutdown().await;
    }
}
