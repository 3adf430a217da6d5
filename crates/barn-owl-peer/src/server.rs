//! Server engine
//!
//! NIST 800-53: SC-5 (Denial of Service Protection), AU-12 (Audit Generation)
//! Implementation: One accept loop receives and classifies every inbound
//! frame, bounded by per-operation timeouts. Requests are appended to the
//! request table in arrival order; non-transfer requests are dispatched one
//! at a time behind the busy flag, while inbound file transfers wait in the
//! queue until the host pulls them with
//! [`Server::process_next_queued_file_transfer`].

use barn_owl_core::{FileInfoList, NetworkRange, ServerInfo, ServerPlatform};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{Mutex, Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{EventHandler, EventHub, EventKind, LogLevel, ServerEvent};
use crate::framing::FramedConnection;
use crate::protocol::{
    InboundFileTransfer, OutboundFileTransfer, Payload, Request, RequestType,
};
use crate::request::{
    ExchangeSettings, RequestDirection, RequestStatus, RequestSummary, ServerRequest,
};
use crate::text::{MessageAuthor, TextSession, TextSessions};
use crate::transfer::{
    FileTransfer, FileTransferState, NewFileTransfer, PumpSettings, TransferDirection,
    TransferInitiator, Transfers,
};

/// Addresses the host resolved for this peer before it starts
#[derive(Debug, Clone)]
pub struct NetworkIdentity {
    pub local_ip: IpAddr,
    pub public_ip: Option<IpAddr>,
    /// LAN of `local_ip`; decides which address of a remote server is used
    pub network_range: Option<NetworkRange>,
}

impl NetworkIdentity {
    /// Identity for a peer only reachable on the loopback interface
    pub fn loopback() -> Self {
        Self {
            local_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            public_ip: None,
            network_range: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    Idle,
    Listening,
    ShuttingDown,
    Stopped,
}

/// Engine-wide flags, always read and written together
#[derive(Debug)]
struct EngineState {
    mode: EngineMode,
    initialized: bool,
    busy: bool,
    my_info: Option<ServerInfo>,
    network_range: Option<NetworkRange>,
    fatal: Option<String>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            mode: EngineMode::Idle,
            initialized: false,
            busy: false,
            my_info: None,
            network_range: None,
            fatal: None,
        }
    }
}

/// File list last received from a remote peer
#[derive(Debug, Clone)]
pub struct RemoteFileList {
    pub folder: String,
    pub files: FileInfoList,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RemoteCatalogue {
    servers: HashMap<SocketAddr, ServerInfo>,
    file_lists: HashMap<SocketAddr, RemoteFileList>,
}

#[derive(Debug)]
struct RequestEntry {
    summary: RequestSummary,
    exchange: Arc<Mutex<ServerRequest>>,
}

/// Every request this engine received or sent, in arrival order
#[derive(Debug, Default)]
struct RequestTable {
    entries: Vec<RequestEntry>,
}

impl RequestTable {
    fn push(&mut self, exchange: ServerRequest) -> u64 {
        let summary = RequestSummary::from(&exchange);
        let id = summary.id;
        self.entries.push(RequestEntry {
            summary,
            exchange: Arc::new(Mutex::new(exchange)),
        });
        id
    }

    fn is_queued(entry: &RequestEntry, file_transfers: bool) -> bool {
        entry.summary.direction == RequestDirection::Inbound
            && entry.summary.status == RequestStatus::Pending
            && (entry.summary.request_type == Some(RequestType::InboundFileTransferRequest))
                == file_transfers
    }

    /// Oldest pending inbound request, either of the file transfer kind or not
    fn next_pending(&self, file_transfers: bool) -> Option<Arc<Mutex<ServerRequest>>> {
        self.entries
            .iter()
            .find(|e| Self::is_queued(e, file_transfers))
            .map(|e| e.exchange.clone())
    }

    fn pending_count(&self, file_transfers: bool) -> usize {
        self.entries
            .iter()
            .filter(|e| Self::is_queued(e, file_transfers))
            .count()
    }

    fn refresh(&mut self, exchange: &ServerRequest) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.summary.id == exchange.id()) {
            entry.summary = RequestSummary::from(exchange);
        }
    }
}

pub(crate) struct ServerInner {
    pub(crate) config: Config,
    state: StdMutex<EngineState>,
    listener: Mutex<Option<TcpListener>>,
    requests: Mutex<RequestTable>,
    next_request_id: AtomicU64,
    pub(crate) transfers: Transfers,
    pub(crate) events: EventHub,
    text_sessions: StdMutex<TextSessions>,
    catalogue: StdMutex<RemoteCatalogue>,
    pumps: StdMutex<HashMap<u64, CancellationToken>>,
    shutdown: Notify,
    root_cancel: CancellationToken,
}

/// Peer-to-peer file transfer and messaging engine
///
/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.config.name)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Server {
    /// Create an engine from a validated configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let events = EventHub::default();
        Ok(Self {
            inner: Arc::new(ServerInner {
                transfers: Transfers::new(events.clone()),
                events,
                config,
                state: StdMutex::new(EngineState::new()),
                listener: Mutex::new(None),
                requests: Mutex::new(RequestTable::default()),
                next_request_id: AtomicU64::new(1),
                text_sessions: StdMutex::new(TextSessions::default()),
                catalogue: StdMutex::new(RemoteCatalogue::default()),
                pumps: StdMutex::new(HashMap::new()),
                shutdown: Notify::new(),
                root_cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Record the addresses the host resolved and prepare the transfer folder
    pub async fn initialize(&self, identity: NetworkIdentity) -> Result<()> {
        let config = &self.inner.config;
        tokio::fs::create_dir_all(&config.transfer_folder).await?;

        let info = ServerInfo {
            name: config.name.clone(),
            local_ip: identity.local_ip,
            public_ip: identity.public_ip,
            session_ip: identity.local_ip,
            port: config.port,
            platform: ServerPlatform::current(),
            transfer_folder: config.transfer_folder.to_string_lossy().into_owned(),
        };

        let mut state = lock(&self.inner.state);
        if state.mode != EngineMode::Idle {
            return Err(Error::InvalidState(format!(
                "cannot initialize an engine that is {:?}",
                state.mode
            )));
        }
        state.my_info = Some(info);
        state.network_range = identity.network_range;
        state.initialized = true;
        Ok(())
    }

    /// Bind the listening socket. Port 0 binds an ephemeral port, which then
    /// becomes the port this peer announces.
    pub async fn listen(&self) -> Result<SocketAddr> {
        {
            let state = lock(&self.inner.state);
            if !state.initialized {
                return Err(Error::NotInitialized);
            }
            if state.mode != EngineMode::Idle {
                return Err(Error::InvalidState(format!(
                    "cannot listen while {:?}",
                    state.mode
                )));
            }
        }

        let config = &self.inner.config;
        let bind = SocketAddr::new(config.bind_address, config.port);
        let socket = if bind.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| Error::socket("creating listen socket", &e))?;
        socket
            .set_reuseaddr(true)
            .map_err(|e| Error::socket("set_reuseaddr", &e))?;
        socket
            .bind(bind)
            .map_err(|e| Error::socket(&format!("binding {}", bind), &e))?;
        let listener = socket
            .listen(config.socket.listen_backlog)
            .map_err(|e| Error::socket("listen", &e))?;
        let local_address = listener
            .local_addr()
            .map_err(|e| Error::socket("listen address", &e))?;

        *self.inner.listener.lock().await = Some(listener);
        {
            let mut state = lock(&self.inner.state);
            if let Some(info) = state.my_info.as_mut() {
                info.port = local_address.port();
            }
            state.mode = EngineMode::Listening;
        }

        info!(
            event = "server_started_listening",
            name = %config.name,
            address = %local_address,
            "barn-owl peer listening"
        );
        self.emit(ServerEvent::new(EventKind::ServerStartedListening { local_address }));
        Ok(local_address)
    }

    /// Accept and dispatch requests until `cancel` fires or a shutdown
    /// command from this peer arrives.
    ///
    /// Transport failures of a single exchange are reported as events and
    /// the loop continues. A malformed frame leaves the stream in an unknown
    /// state and fails the whole run, as does a consistency violation found
    /// while dispatching.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.mode() == EngineMode::Idle {
            self.listen().await?;
        }

        let listener = self
            .inner
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::InvalidState("engine is not listening".to_string()))?;

        let result = self.accept_loop(&listener, &cancel).await;

        self.emit(ServerEvent::new(EventKind::ShutdownListenSocketStarted));
        drop(listener);
        self.emit(ServerEvent::new(EventKind::ShutdownListenSocketCompleted));

        self.inner.root_cancel.cancel();
        let fatal = {
            let mut state = lock(&self.inner.state);
            state.mode = EngineMode::Stopped;
            state.fatal.take()
        };
        self.emit(ServerEvent::new(EventKind::ServerStoppedListening));
        info!(
            event = "server_stopped_listening",
            name = %self.inner.config.name,
            "barn-owl peer stopped"
        );

        result?;
        match fatal {
            Some(message) => Err(Error::Consistency(message)),
            None => Ok(()),
        }
    }

    async fn accept_loop(&self, listener: &TcpListener, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.mode() != EngineMode::Listening {
                return Ok(());
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!(event = "accept_loop_cancelled");
                    return Ok(());
                }
                () = self.inner.shutdown.notified() => {
                    debug!(event = "accept_loop_shutdown");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, endpoint) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            let error = Error::socket("accepting connection", &e);
                            self.report_error(None, None, &error);
                            continue;
                        }
                    };

                    self.emit(ServerEvent::new(EventKind::ConnectionAccepted {
                        remote_endpoint: endpoint,
                    }));

                    let id = self.next_request_id();
                    let mut exchange = ServerRequest::inbound(
                        id,
                        self.exchange_settings(),
                        self.inner.events.clone(),
                    );
                    match exchange.receive(stream).await {
                        Ok(()) => self.enqueue(exchange).await,
                        Err(e) if e.is_recoverable() => self.report_error(Some(id), None, &e),
                        Err(e) => {
                            self.report_error(Some(id), None, &e);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Ask the running engine to stop, through the same protocol channel
    /// every other request uses
    pub async fn shutdown(&self) -> Result<()> {
        let target = {
            let mut state = lock(&self.inner.state);
            match state.mode {
                EngineMode::Listening => {}
                EngineMode::Idle => {
                    state.mode = EngineMode::Stopped;
                    return Ok(());
                }
                EngineMode::ShuttingDown | EngineMode::Stopped => return Ok(()),
            }
            let info = state.my_info.as_ref().ok_or(Error::NotInitialized)?;
            let ip = match info.local_ip {
                IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
                ip => ip,
            };
            SocketAddr::new(ip, info.port)
        };

        self.send_request(
            target,
            RequestType::ShutdownServerCommand,
            Payload::Empty,
            None,
            EventKind::SendShutdownServerCommandStarted,
            EventKind::SendShutdownServerCommandComplete,
        )
        .await
        .map(|_| ())
    }

    /// Flip to shutting down and wake the accept loop
    pub(crate) fn begin_shutdown(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.mode == EngineMode::Listening {
                state.mode = EngineMode::ShuttingDown;
            }
        }
        self.inner.shutdown.notify_one();
    }

    /// Stop the engine after a consistency violation
    fn abort(&self, error: &Error) {
        error!(event = "engine_aborted", error = %error, "consistency violation, stopping engine");
        lock(&self.inner.state).fatal = Some(error.to_string());
        self.begin_shutdown();
    }

    // ---------------------------------------------------------------------
    // Request queue
    // ---------------------------------------------------------------------

    pub(crate) fn next_request_id(&self) -> u64 {
        self.inner.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn enqueue(&self, exchange: ServerRequest) {
        let id = exchange.id();
        let remote = exchange.remote();
        let is_transfer = exchange.request_type() == Some(RequestType::InboundFileTransferRequest);

        let queued_transfers = {
            let mut table = self.inner.requests.lock().await;
            table.push(exchange);
            table.pending_count(true)
        };

        if is_transfer {
            let mut event = ServerEvent::new(EventKind::PendingFileTransfer {
                items_in_queue: queued_transfers,
            })
            .with_request(id);
            if let Some(remote) = remote {
                event = event.with_remote(remote);
            }
            self.emit(event);
        } else {
            self.spawn_dispatch();
        }
    }

    fn spawn_dispatch(&self) {
        let server = self.clone();
        tokio::spawn(async move { server.dispatch_pending().await });
    }

    fn try_begin_dispatch(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.busy {
            return false;
        }
        state.busy = true;
        true
    }

    fn end_dispatch(&self) {
        lock(&self.inner.state).busy = false;
    }

    /// Dispatch every queued non-transfer request, one at a time.
    ///
    /// Whoever holds the busy flag drains the queue; a caller that cannot
    /// take it leaves its request to the holder, which re-checks the queue
    /// after releasing the flag.
    async fn dispatch_pending(&self) {
        loop {
            if !self.try_begin_dispatch() {
                return;
            }
            let drained = self.drain_queue().await;
            self.end_dispatch();

            if let Err(e) = drained {
                self.abort(&e);
                return;
            }
            if self.inner.requests.lock().await.pending_count(false) == 0 {
                return;
            }
        }
    }

    async fn drain_queue(&self) -> Result<()> {
        let queued = self.inner.requests.lock().await.pending_count(false);
        self.emit(ServerEvent::new(EventKind::ProcessRequestBacklogStarted {
            items_in_queue: queued,
        }));

        loop {
            let next = self.inner.requests.lock().await.next_pending(false);
            let Some(exchange) = next else { break };

            if let Err(e) = self.process(&exchange).await {
                if e.is_consistency_error() {
                    return Err(e);
                }
            }
        }

        self.emit(ServerEvent::new(EventKind::ProcessRequestBacklogComplete));
        Ok(())
    }

    /// Run the handler of one request and mark it processed
    async fn process(&self, exchange: &Arc<Mutex<ServerRequest>>) -> Result<()> {
        let mut request = exchange.lock().await;
        let Some(request_type) = request.request_type() else {
            // Never leave it pending, or the queue would hand it out again
            let _ = request.mark_processed();
            self.inner.requests.lock().await.refresh(&request);
            return Err(Error::InvalidState(format!(
                "request {} was queued without a type",
                request.id()
            )));
        };

        self.emit_request(&request, EventKind::ProcessRequestStarted { request_type });
        let result = self.dispatch(&mut request).await;
        request.close_connection();
        let marked = request.mark_processed();
        self.emit_request(&request, EventKind::ProcessRequestComplete { request_type });

        if let Err(e) = &result {
            self.report_error(Some(request.id()), request.file_transfer_id(), e);
        }
        self.inner.requests.lock().await.refresh(&request);
        result.and(marked)
    }

    /// Dispatch the oldest queued inbound file transfer request.
    ///
    /// Lets the host decide when an incoming transfer starts. Fails with
    /// `Busy` while another handler runs and `QueueEmpty` when nothing waits.
    pub async fn process_next_queued_file_transfer(&self) -> Result<()> {
        if !self.try_begin_dispatch() {
            return Err(Error::Busy);
        }

        let next = self.inner.requests.lock().await.next_pending(true);
        let result = match next {
            Some(exchange) => self.process(&exchange).await,
            None => Err(Error::QueueEmpty),
        };
        self.end_dispatch();

        if let Err(e) = &result {
            if e.is_consistency_error() {
                self.abort(e);
            }
        }
        // Requests that arrived while this one held the busy flag
        self.spawn_dispatch();
        result
    }

    // ---------------------------------------------------------------------
    // Outbound exchanges
    // ---------------------------------------------------------------------

    pub(crate) fn exchange_settings(&self) -> ExchangeSettings {
        ExchangeSettings {
            buffer_size: self.inner.config.socket.buffer_size,
            io_timeout: self.inner.config.socket.timeout(),
        }
    }

    pub(crate) fn pump_settings(&self) -> PumpSettings {
        let config = &self.inner.config;
        PumpSettings {
            buffer_size: config.socket.buffer_size,
            io_timeout: config.socket.timeout(),
            update_interval: config.transfer.update_interval(),
            file_open_attempts: config.transfer.file_open_attempts,
            file_open_retry_delay: config.transfer.file_open_retry_delay(),
        }
    }

    /// Send one request to `target` and record it; returns its request id
    pub(crate) async fn send_request(
        &self,
        target: SocketAddr,
        request_type: RequestType,
        payload: Payload,
        file_transfer_id: Option<u64>,
        start: EventKind,
        complete: EventKind,
    ) -> Result<u64> {
        let (id, _) = self
            .exchange(target, request_type, payload, file_transfer_id, start, complete, false)
            .await?;
        Ok(id)
    }

    /// Send one request to `target` and keep the connection for a byte pump
    pub(crate) async fn send_request_keep_open(
        &self,
        target: SocketAddr,
        request_type: RequestType,
        payload: Payload,
        file_transfer_id: Option<u64>,
        start: EventKind,
        complete: EventKind,
    ) -> Result<FramedConnection> {
        let (_, conn) = self
            .exchange(target, request_type, payload, file_transfer_id, start, complete, true)
            .await?;
        conn.ok_or_else(|| {
            Error::ConnectionUnavailable(format!("no connection kept open to {}", target))
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        target: SocketAddr,
        request_type: RequestType,
        payload: Payload,
        file_transfer_id: Option<u64>,
        start: EventKind,
        complete: EventKind,
        keep_open: bool,
    ) -> Result<(u64, Option<FramedConnection>)> {
        let request = Request::new(request_type, self.my_address()?, payload)?;
        let id = self.next_request_id();
        let mut exchange = ServerRequest::outbound(
            id,
            request,
            self.exchange_settings(),
            self.inner.events.clone(),
        );
        if let Some(transfer_id) = file_transfer_id {
            exchange.set_file_transfer_id(transfer_id);
        }

        let result = if keep_open {
            match exchange.send_and_keep_open(target, start, complete).await {
                Ok(()) => exchange.take_connection().map(Some),
                Err(e) => Err(e),
            }
        } else {
            exchange.send(target, start, complete).await.map(|()| None)
        };

        self.inner.requests.lock().await.push(exchange);
        result.map(|conn| (id, conn))
    }

    // ---------------------------------------------------------------------
    // Host requests
    // ---------------------------------------------------------------------

    pub async fn send_text_message(&self, remote: SocketAddr, message: &str) -> Result<()> {
        self.send_request(
            remote,
            RequestType::TextMessage,
            Payload::Text(message.to_string()),
            None,
            EventKind::SendTextMessageStarted {
                message: message.to_string(),
            },
            EventKind::SendTextMessageComplete,
        )
        .await?;

        lock(&self.inner.text_sessions).record(remote, MessageAuthor::Local, message);
        Ok(())
    }

    /// Offer a local file to `remote`, to be written into `remote_folder`
    /// on its side (its transfer folder when empty). Returns the transfer id.
    pub async fn send_file(
        &self,
        remote: SocketAddr,
        local_path: &Path,
        remote_folder: &str,
    ) -> Result<u64> {
        let metadata = match tokio::fs::metadata(local_path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                return Err(Error::NotFound(format!(
                    "file {}",
                    local_path.display()
                )));
            }
        };
        let file_name = local_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::NotFound(format!("file name of {}", local_path.display())))?;
        let local_folder = local_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let response_code = self.inner.transfers.new_response_code().await;
        let transfer_id = self
            .inner
            .transfers
            .insert(NewFileTransfer {
                response_code,
                remote_transfer_id: None,
                direction: TransferDirection::Outbound,
                initiator: TransferInitiator::Local,
                file_name,
                file_size: metadata.len(),
                local_folder,
                remote_folder: remote_folder.to_string(),
                local_server: self.my_info()?,
                remote_server: self.remote_server_info(remote),
                retry_limit: self.inner.config.transfer.retry_limit,
            })
            .await?;

        self.send_inbound_file_transfer_request(transfer_id).await?;
        Ok(transfer_id)
    }

    /// Offer the file of an outbound transfer to its receiver
    pub(crate) async fn send_inbound_file_transfer_request(&self, transfer_id: u64) -> Result<()> {
        let transfer = self.inner.transfers.snapshot(transfer_id).await?;
        let payload = InboundFileTransfer {
            response_code: transfer.response_code,
            remote_transfer_id: transfer.remote_transfer_id.unwrap_or(0),
            retry_counter: transfer.retry_counter,
            retry_limit: transfer.retry_limit,
            file_path: transfer.local_file_path().to_string_lossy().into_owned(),
            file_size: transfer.file_size,
            remote_folder: transfer.remote_folder.clone(),
        };

        let sent = self
            .send_request(
                transfer.remote_address(),
                RequestType::InboundFileTransferRequest,
                Payload::InboundFileTransfer(payload),
                Some(transfer_id),
                EventKind::RequestInboundFileTransferStarted {
                    file_name: transfer.file_name.clone(),
                    file_size: transfer.file_size,
                    remote_folder: transfer.remote_folder.clone(),
                },
                EventKind::RequestInboundFileTransferComplete,
            )
            .await;

        if let Err(e) = &sent {
            self.fail_transfer(transfer_id, None, e).await;
        }
        sent.map(|_| ())
    }

    /// Ask `remote` to send `remote_file_path` into `local_folder` here.
    /// Returns the id of the inbound transfer that will receive it.
    pub async fn get_file(
        &self,
        remote: SocketAddr,
        remote_file_path: &str,
        file_size: u64,
        local_folder: &Path,
    ) -> Result<u64> {
        let file_name = remote_file_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(remote_file_path)
            .to_string();
        let remote_folder = remote_file_path
            .strip_suffix(file_name.as_str())
            .unwrap_or_default()
            .trim_end_matches(['/', '\\'])
            .to_string();

        let transfer_id = self
            .inner
            .transfers
            .insert(NewFileTransfer {
                response_code: 0,
                remote_transfer_id: None,
                direction: TransferDirection::Inbound,
                initiator: TransferInitiator::Local,
                file_name,
                file_size,
                local_folder: local_folder.to_path_buf(),
                remote_folder,
                local_server: self.my_info()?,
                remote_server: self.remote_server_info(remote),
                retry_limit: 0,
            })
            .await?;

        let local_folder_text = local_folder.to_string_lossy().into_owned();
        let sent = self
            .send_request(
                remote,
                RequestType::OutboundFileTransferRequest,
                Payload::OutboundFileTransfer(OutboundFileTransfer {
                    remote_transfer_id: transfer_id,
                    file_path: remote_file_path.to_string(),
                    local_folder: local_folder_text.clone(),
                }),
                Some(transfer_id),
                EventKind::RequestOutboundFileTransferStarted {
                    remote_file_path: remote_file_path.to_string(),
                    local_folder: local_folder_text,
                },
                EventKind::RequestOutboundFileTransferComplete,
            )
            .await;

        if let Err(e) = &sent {
            self.fail_transfer(transfer_id, None, e).await;
        }
        sent.map(|_| transfer_id)
    }

    /// Ask `remote` for the files in `folder` (its transfer folder when empty)
    pub async fn request_file_list(&self, remote: SocketAddr, folder: &str) -> Result<()> {
        self.send_request(
            remote,
            RequestType::FileListRequest,
            Payload::Text(folder.to_string()),
            None,
            EventKind::RequestFileListStarted {
                folder: folder.to_string(),
            },
            EventKind::RequestFileListComplete,
        )
        .await
        .map(|_| ())
    }

    pub async fn request_server_info(&self, remote: SocketAddr) -> Result<()> {
        self.send_request(
            remote,
            RequestType::ServerInfoRequest,
            Payload::Empty,
            None,
            EventKind::RequestServerInfoStarted,
            EventKind::RequestServerInfoComplete,
        )
        .await
        .map(|_| ())
    }

    // ---------------------------------------------------------------------
    // Transfer control
    // ---------------------------------------------------------------------

    /// Ask the sender of a stalled or cancelled transfer to start it over
    pub async fn retry_file_transfer(&self, transfer_id: u64) -> Result<()> {
        let transfer = self.inner.transfers.snapshot(transfer_id).await?;
        match transfer.state() {
            state if state.is_retryable() => {}
            FileTransferState::RetryLimitExceeded => {
                return match transfer.retry_lockout_expires {
                    Some(expires) if expires > Utc::now() => Err(Error::RetryLockout { expires }),
                    _ => Err(Error::InvalidState(format!(
                        "transfer {} exhausted its retries, request the file again",
                        transfer_id
                    ))),
                };
            }
            state => {
                return Err(Error::InvalidState(format!(
                    "transfer {} cannot be retried while {}",
                    transfer_id, state
                )));
            }
        }

        self.send_request(
            transfer.remote_address(),
            RequestType::RetryOutboundFileTransfer,
            Payload::Int64(transfer.response_code),
            Some(transfer_id),
            EventKind::RetryOutboundFileTransferStarted,
            EventKind::RetryOutboundFileTransferComplete,
        )
        .await
        .map(|_| ())
    }

    /// Mark an inbound transfer stalled, stop its pump and tell the sender
    pub async fn notify_file_transfer_stalled(&self, transfer_id: u64) -> Result<()> {
        let transfer = self
            .inner
            .transfers
            .update_state(transfer_id, |t| {
                if t.direction != TransferDirection::Inbound {
                    return Err(Error::InvalidState(format!(
                        "transfer {} is outbound, only the receiver detects stalls",
                        transfer_id
                    )));
                }
                if !t.state().is_active() {
                    return Err(Error::InvalidState(format!(
                        "transfer {} is {}, only accepted transfers can stall",
                        transfer_id,
                        t.state()
                    )));
                }
                t.transition(FileTransferState::Stalled)?;
                t.error_message = Some("no data received within the stall timeout".to_string());
                Ok(t.clone())
            })
            .await?;

        self.cancel_pump(transfer_id);
        self.emit(
            ServerEvent::new(EventKind::FileTransferStalled)
                .with_transfer(transfer_id)
                .with_remote(transfer.remote_address()),
        );
        warn!(
            event = "file_transfer_stalled",
            file_transfer_id = transfer_id,
            bytes_transferred = transfer.bytes_transferred,
            "inbound transfer stalled"
        );

        self.send_request(
            transfer.remote_address(),
            RequestType::FileTransferStalled,
            Payload::Int64(transfer.response_code),
            Some(transfer_id),
            EventKind::SendFileTransferStalledStarted,
            EventKind::SendFileTransferStalledComplete,
        )
        .await
        .map(|_| ())
    }

    /// Token for the pump of `transfer_id`, replacing any earlier one
    pub(crate) fn register_pump(&self, transfer_id: u64) -> CancellationToken {
        let token = self.inner.root_cancel.child_token();
        if let Some(previous) = lock(&self.inner.pumps).insert(transfer_id, token.clone()) {
            previous.cancel();
        }
        token
    }

    pub(crate) fn cancel_pump(&self, transfer_id: u64) {
        if let Some(token) = lock(&self.inner.pumps).remove(&transfer_id) {
            token.cancel();
        }
    }

    /// Move a transfer to `Error` unless it already left the active states
    pub(crate) async fn fail_transfer(
        &self,
        transfer_id: u64,
        attempt: Option<u32>,
        error: &Error,
    ) {
        let message = error.to_string();
        let failed = self
            .inner
            .transfers
            .update_state(transfer_id, |t| {
                let current_attempt = attempt.is_none_or(|a| a == t.attempt);
                let open = matches!(
                    t.state(),
                    FileTransferState::Pending
                        | FileTransferState::Accepted
                        | FileTransferState::InProgress
                );
                if current_attempt && open {
                    t.fail(message.clone())?;
                }
                Ok(())
            })
            .await;
        if let Err(e) = failed {
            warn!(event = "fail_transfer_skipped", file_transfer_id = transfer_id, error = %e);
        }
    }

    // ---------------------------------------------------------------------
    // Identity and remote catalogue
    // ---------------------------------------------------------------------

    /// This peer as announced to others
    pub fn my_info(&self) -> Result<ServerInfo> {
        lock(&self.inner.state)
            .my_info
            .clone()
            .ok_or(Error::NotInitialized)
    }

    /// Address and listening port written into every frame header
    pub(crate) fn my_address(&self) -> Result<SocketAddr> {
        let info = self.my_info()?;
        Ok(SocketAddr::new(info.local_ip, info.port))
    }

    pub(crate) fn network_range(&self) -> Option<NetworkRange> {
        lock(&self.inner.state).network_range
    }

    /// Best description of `remote` this engine has
    pub fn remote_server_info(&self, remote: SocketAddr) -> ServerInfo {
        lock(&self.inner.catalogue)
            .servers
            .get(&remote)
            .cloned()
            .unwrap_or_else(|| ServerInfo::from_endpoint(remote))
    }

    pub fn known_remote_servers(&self) -> Vec<ServerInfo> {
        lock(&self.inner.catalogue).servers.values().cloned().collect()
    }

    pub(crate) fn store_remote_server(&self, remote: SocketAddr, info: ServerInfo) {
        lock(&self.inner.catalogue).servers.insert(remote, info);
    }

    pub fn remote_file_list(&self, remote: SocketAddr) -> Option<RemoteFileList> {
        lock(&self.inner.catalogue).file_lists.get(&remote).cloned()
    }

    pub(crate) fn store_remote_file_list(&self, remote: SocketAddr, list: RemoteFileList) {
        lock(&self.inner.catalogue).file_lists.insert(remote, list);
    }

    // ---------------------------------------------------------------------
    // Text sessions
    // ---------------------------------------------------------------------

    pub(crate) fn record_text(
        &self,
        remote: SocketAddr,
        author: MessageAuthor,
        message: &str,
    ) -> u64 {
        lock(&self.inner.text_sessions).record(remote, author, message)
    }

    pub fn text_sessions(&self) -> Vec<TextSession> {
        lock(&self.inner.text_sessions).sessions().to_vec()
    }

    pub fn unread_message_count(&self) -> usize {
        lock(&self.inner.text_sessions).unread_count()
    }

    pub fn mark_text_session_read(&self, session_id: u64) -> Result<()> {
        let remote = {
            let mut sessions = lock(&self.inner.text_sessions);
            if !sessions.mark_read(session_id) {
                return Err(Error::NotFound(format!("text session {}", session_id)));
            }
            sessions.get(session_id).map(|s| s.remote)
        };

        let mut event = ServerEvent::new(EventKind::MarkTextMessageAsRead {
            text_session_id: session_id,
        });
        if let Some(remote) = remote {
            event = event.with_remote(remote);
        }
        self.emit(event);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // State queries
    // ---------------------------------------------------------------------

    pub fn mode(&self) -> EngineMode {
        lock(&self.inner.state).mode
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.inner.state).initialized
    }

    pub fn is_listening(&self) -> bool {
        self.mode() == EngineMode::Listening
    }

    /// Whether a handler is running right now
    pub fn is_busy(&self) -> bool {
        lock(&self.inner.state).busy
    }

    pub async fn file_transfer(&self, transfer_id: u64) -> Result<FileTransfer> {
        self.inner.transfers.snapshot(transfer_id).await
    }

    pub async fn file_transfers(&self) -> Vec<FileTransfer> {
        self.inner.transfers.list().await
    }

    pub async fn requests(&self) -> Vec<RequestSummary> {
        self.inner
            .requests
            .lock()
            .await
            .entries
            .iter()
            .map(|e| e.summary.clone())
            .collect()
    }

    /// Inbound file transfer requests waiting for the host
    pub async fn queued_file_transfer_count(&self) -> usize {
        self.inner.requests.lock().await.pending_count(true)
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.events.subscribe()
    }

    /// Register a synchronous observer. It runs on the engine's own task and
    /// must neither block nor call back into the engine.
    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner.events.add_handler(handler);
    }

    pub fn event_log_for_transfer(&self, transfer_id: u64, level: LogLevel) -> Vec<ServerEvent> {
        self.inner.events.for_transfer(transfer_id, level)
    }

    pub fn event_log_for_request(&self, request_id: u64, level: LogLevel) -> Vec<ServerEvent> {
        self.inner.events.for_request(request_id, level)
    }

    pub fn complete_event_log(&self, level: LogLevel) -> Vec<ServerEvent> {
        self.inner.events.all(level)
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        self.inner.events.emit(event);
    }

    /// Emit an event tagged with a request, its peer and its transfer
    pub(crate) fn emit_request(&self, request: &ServerRequest, kind: EventKind) {
        let mut event = ServerEvent::new(kind).with_request(request.id());
        if let Some(remote) = request.remote() {
            event = event.with_remote(remote);
        }
        if let Some(transfer_id) = request.file_transfer_id() {
            event = event.with_transfer(transfer_id);
        }
        self.emit(event);
    }

    pub(crate) fn report_error(
        &self,
        request_id: Option<u64>,
        transfer_id: Option<u64>,
        error: &Error,
    ) {
        warn!(
            event = "error_occurred",
            request_id = ?request_id,
            file_transfer_id = ?transfer_id,
            error = %error,
        );
        let mut event = ServerEvent::new(EventKind::ErrorOccurred {
            message: error.to_string(),
        });
        if let Some(id) = request_id {
            event = event.with_request(id);
        }
        if let Some(id) = transfer_id {
            event = event.with_transfer(id);
        }
        self.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            name: "unit".into(),
            transfer_folder: dir.path().to_path_buf(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_listen_requires_initialize() {
        let dir = TempDir::new().unwrap();
        let server = Server::new(test_config(&dir)).unwrap();
        assert!(matches!(server.listen().await, Err(Error::NotInitialized)));
        assert!(matches!(server.my_info(), Err(Error::NotInitialized)));
    }

    #[tokio::test]
    async fn test_listen_on_ephemeral_port_updates_identity() {
        let dir = TempDir::new().unwrap();
        let server = Server::new(test_config(&dir)).unwrap();
        server.initialize(NetworkIdentity::loopback()).await.unwrap();

        let addr = server.listen().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.my_info().unwrap().port, addr.port());
        assert!(server.is_listening());
        assert!(server.initialize(NetworkIdentity::loopback()).await.is_err());
    }

    #[tokio::test]
    async fn test_busy_flag_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let server = Server::new(test_config(&dir)).unwrap();

        assert!(server.try_begin_dispatch());
        assert!(server.is_busy());
        assert!(!server.try_begin_dispatch());
        assert!(matches!(
            server.process_next_queued_file_transfer().await,
            Err(Error::Busy)
        ));
        server.end_dispatch();

        assert!(matches!(
            server.process_next_queued_file_transfer().await,
            Err(Error::QueueEmpty)
        ));
        assert!(!server.is_busy());
    }

    #[tokio::test]
    async fn test_shutdown_before_listening_stops_engine() {
        let dir = TempDir::new().unwrap();
        let server = Server::new(test_config(&dir)).unwrap();
        server.initialize(NetworkIdentity::loopback()).await.unwrap();
        server.shutdown().await.unwrap();
        assert_eq!(server.mode(), EngineMode::Stopped);
    }

    #[tokio::test]
    async fn test_mark_unknown_text_session() {
        let dir = TempDir::new().unwrap();
        let server = Server::new(test_config(&dir)).unwrap();
        assert!(matches!(
            server.mark_text_session_read(7),
            Err(Error::NotFound(_))
        ));
    }
}
