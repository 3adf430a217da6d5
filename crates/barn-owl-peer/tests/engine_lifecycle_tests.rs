//! Engine lifecycle and request queue tests
//!
//! NIST 800-53: SC-5 (Denial of Service Protection), SI-10 (Input Validation)
//! Implementation: One bad client must not stop the engine unless the
//! stream it sent can no longer be trusted; requests are handled strictly
//! one at a time in arrival order.

mod common;

use barn_owl_peer::protocol::{InboundFileTransfer, RequestType, build};
use barn_owl_peer::{
    EngineMode, Error, EventKind, NetworkIdentity, RequestDirection, RequestStatus, Server,
};
use common::{ScriptedPeer, TestPeer, test_config};
use std::net::SocketAddr;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_concurrent_clients_are_processed_one_at_a_time() {
    let peer = TestPeer::start().await;
    let target = peer.addr;

    let mut clients = JoinSet::new();
    for i in 0..20u16 {
        clients.spawn(async move {
            let sender: SocketAddr = format!("127.0.0.1:{}", 30000 + i).parse().unwrap();
            let frame = build::string(RequestType::TextMessage, sender, &format!("msg {}", i))
                .unwrap();
            let mut stream = TcpStream::connect(target).await.unwrap();
            stream.write_all(&frame).await.unwrap();
            stream.shutdown().await.unwrap();
        });
    }
    while let Some(joined) = clients.join_next().await {
        joined.unwrap();
    }

    common::eventually(|| {
        let server = peer.server.clone();
        async move {
            server
                .requests()
                .await
                .iter()
                .filter(|r| r.status == RequestStatus::Processed)
                .count()
                == 20
        }
    })
    .await;
    assert_eq!(peer.server.unread_message_count(), 20);
    assert_eq!(peer.server.text_sessions().len(), 20);

    // Every start is followed by the completion of the same request
    let processing: Vec<_> = peer
        .recorder
        .events()
        .into_iter()
        .filter(|e| {
            matches!(
                e.kind,
                EventKind::ProcessRequestStarted { .. } | EventKind::ProcessRequestComplete { .. }
            )
        })
        .collect();
    assert_eq!(processing.len(), 40);
    for pair in processing.chunks(2) {
        assert!(matches!(pair[0].kind, EventKind::ProcessRequestStarted { .. }));
        assert!(matches!(pair[1].kind, EventKind::ProcessRequestComplete { .. }));
        assert_eq!(pair[0].request_id, pair[1].request_id);
    }

    let requests = peer.server.requests().await;
    assert_eq!(requests.len(), 20);
    assert!(requests.windows(2).all(|w| w[0].id < w[1].id));
    assert!(requests
        .iter()
        .all(|r| r.direction == RequestDirection::Inbound && r.status == RequestStatus::Processed));

    peer.stop().await.unwrap();
}

#[tokio::test]
async fn test_queued_transfer_waits_for_the_host() {
    let peer = TestPeer::start().await;
    let remote = ScriptedPeer::bind().await;

    let offer = InboundFileTransfer {
        response_code: 77,
        remote_transfer_id: 0,
        retry_counter: 0,
        retry_limit: 3,
        file_path: "/tmp/offered.bin".into(),
        file_size: 10,
        remote_folder: String::new(),
    };
    remote
        .send(
            peer.addr,
            build::inbound_file_transfer_request(remote.addr, offer).unwrap(),
        )
        .await;
    peer.wait_for_queued(1).await;

    // Later requests are still handled while the transfer waits
    remote
        .send(
            peer.addr,
            build::string(RequestType::TextMessage, remote.addr, "after").unwrap(),
        )
        .await;
    common::eventually(|| {
        let server = peer.server.clone();
        async move { server.unread_message_count() == 1 }
    })
    .await;

    assert_eq!(peer.server.queued_file_transfer_count().await, 1);
    assert!(peer.server.file_transfers().await.is_empty());
    let pending = peer
        .wait_for_event(|k| matches!(k, EventKind::PendingFileTransfer { .. }))
        .await;
    assert_eq!(pending.kind, EventKind::PendingFileTransfer { items_in_queue: 1 });

    peer.server.process_next_queued_file_transfer().await.unwrap();
    remote
        .expect_request(RequestType::FileTransferAccepted)
        .await;
    assert_eq!(peer.server.queued_file_transfer_count().await, 0);
    assert!(matches!(
        peer.server.process_next_queued_file_transfer().await,
        Err(Error::QueueEmpty)
    ));

    peer.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_stops_the_engine() {
    let peer = TestPeer::start().await;

    // Valid length prefix, unknown request type
    let mut stream = TcpStream::connect(peer.addr).await.unwrap();
    stream
        .write_all(&[0, 0, 0, 3, 99, 0, 0])
        .await
        .unwrap();
    stream.shutdown().await.unwrap();

    let server = peer.server.clone();
    let err = peer.join().await.unwrap_err();
    assert!(err.is_protocol_error());
    assert_eq!(server.mode(), EngineMode::Stopped);
}

#[tokio::test]
async fn test_client_closing_early_is_survived() {
    let peer = TestPeer::start().await;
    let remote = ScriptedPeer::bind().await;

    drop(TcpStream::connect(peer.addr).await.unwrap());
    peer.wait_for_event(|k| matches!(k, EventKind::ErrorOccurred { .. }))
        .await;
    assert!(peer.server.is_listening());

    remote
        .send(
            peer.addr,
            build::string(RequestType::TextMessage, remote.addr, "still there?").unwrap(),
        )
        .await;
    common::eventually(|| {
        let server = peer.server.clone();
        async move { server.unread_message_count() == 1 }
    })
    .await;

    peer.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_command_from_another_peer_is_ignored() {
    let peer = TestPeer::start().await;
    let remote = ScriptedPeer::bind().await;

    remote
        .send(
            peer.addr,
            build::empty(RequestType::ShutdownServerCommand, remote.addr).unwrap(),
        )
        .await;
    peer.wait_for_event(|k| matches!(k, EventKind::ReceivedShutdownServerCommand))
        .await;
    peer.wait_for_event(|k| matches!(k, EventKind::ErrorOccurred { .. }))
        .await;
    assert!(peer.server.is_listening());

    peer.stop().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_run_and_closes_socket() {
    let peer = TestPeer::start().await;
    let addr = peer.addr;
    let server = peer.server.clone();
    let recorder = peer.recorder.clone();

    peer.stop().await.unwrap();
    assert_eq!(server.mode(), EngineMode::Stopped);
    assert!(TcpStream::connect(addr).await.is_err());

    let kinds: Vec<_> = recorder.events().into_iter().map(|e| e.kind).collect();
    let position = |wanted: EventKind| kinds.iter().position(|k| *k == wanted).unwrap();
    assert!(
        position(EventKind::ShutdownListenSocketStarted)
            < position(EventKind::ShutdownListenSocketCompleted)
    );
    assert!(
        position(EventKind::ShutdownListenSocketCompleted)
            < position(EventKind::ServerStoppedListening)
    );
    assert_eq!(
        recorder.count(|k| matches!(k, EventKind::ShutdownListenSocketStarted)),
        1
    );
}

#[tokio::test]
async fn test_cancellation_stops_run() {
    let dir = TempDir::new().unwrap();
    let server = Server::new(test_config(&dir)).unwrap();
    server.initialize(NetworkIdentity::loopback()).await.unwrap();

    let cancel = CancellationToken::new();
    let handle = {
        let server = server.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server.run(cancel).await })
    };
    common::eventually(|| {
        let server = server.clone();
        async move { server.is_listening() }
    })
    .await;

    cancel.cancel();
    handle.await.unwrap().unwrap();
    assert_eq!(server.mode(), EngineMode::Stopped);
}

#[tokio::test]
async fn test_listen_requires_initialize() {
    let dir = TempDir::new().unwrap();
    let server = Server::new(test_config(&dir)).unwrap();

    assert!(matches!(server.listen().await, Err(Error::NotInitialized)));
    assert!(!server.is_initialized());

    // Stopping an engine that never listened is a no-op
    server.shutdown().await.unwrap();
    assert_eq!(server.mode(), EngineMode::Stopped);
}
