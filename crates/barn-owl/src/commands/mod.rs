pub mod peer;
pub mod serve;

use anyhow::{Context, Result};
use barn_owl_peer::{
    Config, Error, EventKind, NetworkIdentity, Server, ServerEvent, StallWatchdog,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkSettings;

/// A running engine with the background tasks every host runs beside it
pub struct Host {
    pub server: Server,
    pub address: SocketAddr,
    cancel: CancellationToken,
    engine: JoinHandle<barn_owl_peer::Result<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Host {
    /// Create, initialize and start an engine
    ///
    /// NIST 800-53: SC-7 (Boundary Protection)
    pub async fn start(config: Config, network: &NetworkSettings) -> Result<Self> {
        let identity = resolve_identity(network, config.bind_address).await;
        let server = Server::new(config).context("Invalid peer configuration")?;
        server
            .initialize(identity)
            .await
            .context("Failed to initialize peer")?;
        let address = server.listen().await.context("Failed to open listening socket")?;

        let cancel = CancellationToken::new();
        let engine = {
            let server = server.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { server.run(cancel).await })
        };

        let tasks = vec![
            StallWatchdog::new(server.clone()).spawn(cancel.child_token()),
            spawn_reactions(server.clone(), cancel.child_token()),
        ];

        Ok(Self {
            server,
            address,
            cancel,
            engine,
            tasks,
        })
    }

    /// Whether the engine's run loop already ended
    pub fn is_finished(&self) -> bool {
        self.engine.is_finished()
    }

    /// Stop through the protocol, then wait for the run loop and the
    /// background tasks
    pub async fn stop(self) -> Result<()> {
        if let Err(e) = self.server.shutdown().await {
            warn!(event = "shutdown_command_failed", error = %e, "stopping engine directly");
        }
        let stopped = tokio::time::timeout(
            self.server.config().socket.timeout() * 2,
            self.engine,
        )
        .await;
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }

        match stopped {
            Ok(joined) => joined
                .context("Engine task panicked")?
                .context("Engine stopped with an error"),
            Err(_) => anyhow::bail!("Engine did not stop in time"),
        }
    }
}

/// Addresses to announce: configured ones first, then whatever the
/// routing table picks for outbound traffic, then loopback.
pub async fn resolve_identity(network: &NetworkSettings, bind_address: IpAddr) -> NetworkIdentity {
    let local_ip = match network.local_ip {
        Some(ip) => ip,
        None if !bind_address.is_unspecified() => bind_address,
        None => match detect_local_ip().await {
            Some(ip) => ip,
            None => {
                warn!(
                    event = "local_ip_detection_failed",
                    "could not detect a local address, announcing loopback"
                );
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            }
        },
    };

    NetworkIdentity {
        local_ip,
        public_ip: network.public_ip,
        network_range: network.network_range,
    }
}

async fn detect_local_ip() -> Option<IpAddr> {
    // Connecting a UDP socket sends nothing; it only selects a route
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("192.0.2.1:9").await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Dispatch every queued inbound file transfer, waiting out a busy engine
pub async fn accept_queued(server: &Server) -> Result<usize> {
    let mut accepted = 0;
    loop {
        match server.process_next_queued_file_transfer().await {
            Ok(()) => accepted += 1,
            Err(Error::QueueEmpty) => return Ok(accepted),
            Err(Error::Busy) => tokio::time::sleep(Duration::from_millis(50)).await,
            // A refused transfer is already recorded and reported by the engine
            Err(e) if !e.is_consistency_error() => {
                debug!(event = "queued_transfer_failed", error = %e);
                accepted += 1;
            }
            Err(e) => return Err(e).context("Engine bookkeeping failed"),
        }
    }
}

/// Host policy: accept incoming transfers, retry stalled downloads and
/// surface text messages
fn spawn_reactions(server: Server, cancel: CancellationToken) -> JoinHandle<()> {
    let mut events = server.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                received = events.recv() => match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(event = "event_stream_lagged", skipped);
                        // Missed notices may hide a queued transfer
                        if let Err(e) = accept_queued(&server).await {
                            warn!(event = "accept_queued_failed", error = %e);
                        }
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                },
            };
            react(&server, &event).await;
        }
    })
}

async fn react(server: &Server, event: &ServerEvent) {
    match &event.kind {
        EventKind::PendingFileTransfer { .. } => {
            if let Err(e) = accept_queued(server).await {
                warn!(event = "accept_queued_failed", error = %e);
            }
        }
        // Only once the sender knows about the stall
        EventKind::SendFileTransferStalledComplete => {
            let Some(transfer_id) = event.file_transfer_id else {
                return;
            };
            match server.retry_file_transfer(transfer_id).await {
                Ok(()) => info!(event = "retry_requested", file_transfer_id = transfer_id),
                Err(e) => warn!(
                    event = "retry_request_failed",
                    file_transfer_id = transfer_id,
                    error = %e
                ),
            }
        }
        EventKind::ReceivedTextMessage { message, .. } => {
            let from = event
                .remote_server
                .map_or_else(|| "unknown peer".to_string(), |r| r.to_string());
            info!(event = "text_message", remote = %from, "{}", message);
        }
        _ => {}
    }
}

/// Wait for the first event matching `wanted`, up to `wait`
pub async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<ServerEvent>,
    wait: Duration,
    wanted: impl Fn(&ServerEvent) -> bool,
) -> Result<ServerEvent> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let received = tokio::time::timeout_at(deadline, events.recv())
            .await
            .context("Timed out waiting for the remote peer")?;
        match received {
            Ok(event) if wanted(&event) => return Ok(event),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!(event = "event_stream_lagged", skipped),
            Err(RecvError::Closed) => anyhow::bail!("Engine stopped"),
        }
    }
}
