//! Shared fixtures for barn-owl-peer integration tests
//!
//! `TestPeer` runs a real engine on an ephemeral loopback port inside a
//! temporary transfer folder. `ScriptedPeer` speaks the wire protocol by hand
//! so tests can play the remote side step by step, pauses included.

#![allow(dead_code)]

use barn_owl_peer::framing::FramedConnection;
use barn_owl_peer::protocol::{Request, RequestType};
use barn_owl_peer::{
    Config, EventHandler, EventKind, FileTransfer, FileTransferState, NetworkIdentity, Server,
    ServerEvent,
};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(10);
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Records every event, bookkeeping included, in emission order
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<ServerEvent>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&EventKind) -> bool) -> usize {
        self.events().iter().filter(|e| matches(&e.kind)).count()
    }
}

impl EventHandler for Recorder {
    fn on_event(&self, event: &ServerEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// A running engine plus everything needed to stop and inspect it
pub struct TestPeer {
    pub server: Server,
    pub addr: SocketAddr,
    pub dir: TempDir,
    pub recorder: Arc<Recorder>,
    cancel: CancellationToken,
    handle: JoinHandle<barn_owl_peer::Result<()>>,
}

pub fn test_config(dir: &TempDir) -> Config {
    Config {
        name: "test-peer".into(),
        transfer_folder: dir.path().join("inbox"),
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..Config::default()
    }
}

impl TestPeer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        tweak(&mut config);

        let server = Server::new(config).unwrap();
        let recorder = Arc::new(Recorder::default());
        server.add_handler(recorder.clone());
        server.initialize(NetworkIdentity::loopback()).await.unwrap();
        let addr = server.listen().await.unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let server = server.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { server.run(cancel).await })
        };

        Self {
            server,
            addr,
            dir,
            recorder,
            cancel,
            handle,
        }
    }

    pub fn inbox(&self) -> std::path::PathBuf {
        self.server.config().transfer_folder.clone()
    }

    /// Stop through the protocol and return what `run` returned
    pub async fn stop(self) -> barn_owl_peer::Result<()> {
        self.server.shutdown().await?;
        let result = tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("engine did not stop")
            .unwrap();
        self.cancel.cancel();
        result
    }

    /// Wait for the run loop to end on its own
    pub async fn join(self) -> barn_owl_peer::Result<()> {
        tokio::time::timeout(WAIT, self.handle)
            .await
            .expect("engine did not stop")
            .unwrap()
    }

    pub async fn wait_for_state(&self, transfer_id: u64, state: FileTransferState) -> FileTransfer {
        wait_for_state(&self.server, transfer_id, state).await
    }

    pub async fn wait_for_queued(&self, count: usize) {
        let server = self.server.clone();
        eventually(|| {
            let server = server.clone();
            async move { server.queued_file_transfer_count().await == count }
        })
        .await;
    }

    pub async fn wait_for_event(&self, matches: impl Fn(&EventKind) -> bool) -> ServerEvent {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(event) = self.recorder.events().into_iter().find(|e| matches(&e.kind)) {
                return event;
            }
            assert!(tokio::time::Instant::now() < deadline, "event never arrived");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Poll `check` until it holds, failing the test after `WAIT`
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_state(
    server: &Server,
    transfer_id: u64,
    state: FileTransferState,
) -> FileTransfer {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let transfer = server.file_transfer(transfer_id).await.unwrap();
        if transfer.state() == state {
            return transfer;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "transfer {} stuck in {} waiting for {}: {:?}",
            transfer_id,
            transfer.state(),
            state,
            transfer.error_message
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Deterministic file content so a restarted transfer can be told apart
/// from a resumed one
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// The remote side of a conversation, driven by hand
pub struct ScriptedPeer {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl ScriptedPeer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    /// Accept the next connection from the engine and decode its request
    pub async fn expect_request(&self, request_type: RequestType) -> (Request, FramedConnection) {
        let (stream, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("engine never connected")
            .unwrap();
        let mut conn = FramedConnection::new(stream, 4096).unwrap();
        let (payload, _) = conn.receive_frame(IO_TIMEOUT).await.unwrap();
        let request = Request::decode_payload(&payload).unwrap();
        assert_eq!(request.request_type, request_type, "unexpected {:?}", request);
        (request, conn)
    }

    /// Assert the engine opens no connection for `within`
    pub async fn expect_silence(&self, within: Duration) {
        let accepted = tokio::time::timeout(within, self.listener.accept()).await;
        assert!(accepted.is_err(), "engine unexpectedly connected");
    }

    /// Send one frame to `target` and close the connection
    pub async fn send(&self, target: SocketAddr, frame: Bytes) {
        let mut stream = TcpStream::connect(target).await.unwrap();
        stream.write_all(&frame).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    /// Send one frame to `target` and keep the connection for raw bytes
    pub async fn send_keep_open(&self, target: SocketAddr, frame: Bytes) -> TcpStream {
        let mut stream = TcpStream::connect(target).await.unwrap();
        stream.write_all(&frame).await.unwrap();
        stream
    }
}
