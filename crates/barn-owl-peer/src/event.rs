//! Server events
//!
//! NIST 800-53: AU-2 (Audit Events), AU-3 (Content of Audit Records), AU-12 (Audit Generation)
//! Implementation: Every state change of the engine is recorded as an
//! immutable `ServerEvent`. Events are appended to an in-memory log for
//! retrospective queries, fanned out to live subscribers through a bounded
//! broadcast channel, and written to `tracing` as structured JSON.

use barn_owl_core::{FileInfoList, ServerInfo};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{Level, event};

use crate::protocol::RequestType;
use crate::transfer::FileTransferState;

/// Verbosity hint attached to every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Debug,
    Trace,
}

/// Which of the three event streams an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStream {
    General,
    Socket,
    FileTransferProgress,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum EventKind {
    ServerStartedListening {
        local_address: SocketAddr,
    },
    ServerStoppedListening,
    ShutdownListenSocketStarted,
    ShutdownListenSocketCompleted,

    ConnectionAccepted {
        remote_endpoint: SocketAddr,
    },
    ConnectToRemoteServerStarted,
    ConnectToRemoteServerComplete,

    ReceiveRequestFromRemoteServerStarted,
    ReceiveRequestFromRemoteServerComplete {
        request_type: RequestType,
    },
    ReceiveRequestLengthStarted,
    ReceivedRequestLengthBytesFromSocket {
        bytes_received: usize,
    },
    ReceiveRequestLengthComplete {
        request_length: usize,
    },
    ReceiveRequestBytesStarted,
    ReceivedRequestBytesFromSocket {
        bytes_received: usize,
        total_received: usize,
        remaining: usize,
    },
    ReceiveRequestBytesComplete,
    SaveUnreadBytesAfterAllRequestBytesReceived {
        unread_bytes: usize,
    },
    DetermineRequestTypeStarted,
    DetermineRequestTypeComplete {
        request_type: RequestType,
    },
    CopySavedBytesToIncomingFile {
        bytes: usize,
    },

    PendingFileTransfer {
        items_in_queue: usize,
    },
    ProcessRequestBacklogStarted {
        items_in_queue: usize,
    },
    ProcessRequestBacklogComplete,
    ProcessRequestStarted {
        request_type: RequestType,
    },
    ProcessRequestComplete {
        request_type: RequestType,
    },

    SendTextMessageStarted {
        message: String,
    },
    SendTextMessageComplete,
    ReceivedTextMessage {
        message: String,
        text_session_id: u64,
    },
    MarkTextMessageAsRead {
        text_session_id: u64,
    },

    FileTransferStatusChange {
        previous: FileTransferState,
        current: FileTransferState,
    },
    RequestInboundFileTransferStarted {
        file_name: String,
        file_size: u64,
        remote_folder: String,
    },
    RequestInboundFileTransferComplete,
    ReceivedInboundFileTransferRequest {
        file_name: String,
        file_size: u64,
        local_folder: String,
        retry_counter: u32,
        retry_limit: u32,
    },
    RequestOutboundFileTransferStarted {
        remote_file_path: String,
        local_folder: String,
    },
    RequestOutboundFileTransferComplete,
    ReceivedOutboundFileTransferRequest {
        local_file_path: String,
        remote_folder: String,
    },
    SendFileTransferRejectedStarted,
    SendFileTransferRejectedComplete,
    RemoteServerRejectedFileTransfer,
    SendFileTransferAcceptedStarted,
    SendFileTransferAcceptedComplete,
    RemoteServerAcceptedFileTransfer,
    SendFileTransferCompletedStarted,
    SendFileTransferCompletedComplete,
    RemoteServerConfirmedFileTransferCompleted,
    SendFileTransferStalledStarted,
    SendFileTransferStalledComplete,
    FileTransferStalled,
    RetryOutboundFileTransferStarted,
    RetryOutboundFileTransferComplete,
    ReceivedRetryOutboundFileTransferRequest {
        retry_counter: u32,
        retry_limit: u32,
    },
    SendRetryLimitExceededStarted,
    SendRetryLimitExceededComplete,
    ReceivedRetryLimitExceeded {
        retry_limit: u32,
        lockout_expires: DateTime<Utc>,
    },
    SendNotificationFileDoesNotExistStarted,
    SendNotificationFileDoesNotExistComplete,
    ReceivedNotificationFileDoesNotExist,

    SendFileBytesStarted {
        file_size: u64,
    },
    SendFileBytesComplete {
        bytes_sent: u64,
    },
    ReceiveFileBytesStarted {
        file_size: u64,
    },
    ReceiveFileBytesComplete {
        bytes_received: u64,
        elapsed_ms: u64,
        transfer_rate: f64,
    },
    MultipleFileWriteAttemptsNeeded {
        attempts: u32,
    },
    UpdateFileTransferProgress {
        bytes_transferred: u64,
        file_size: u64,
        percent_complete: f64,
        transfer_rate: f64,
    },

    RequestFileListStarted {
        folder: String,
    },
    RequestFileListComplete,
    ReceivedFileListRequest {
        folder: String,
    },
    SendFileListStarted {
        file_count: usize,
    },
    SendFileListComplete,
    ReceivedFileList {
        folder: String,
        files: FileInfoList,
    },
    SendNotificationNoFilesToDownloadStarted,
    SendNotificationNoFilesToDownloadComplete,
    ReceivedNotificationNoFilesToDownload,
    SendNotificationFolderDoesNotExistStarted,
    SendNotificationFolderDoesNotExistComplete,
    ReceivedNotificationFolderDoesNotExist,

    RequestServerInfoStarted,
    RequestServerInfoComplete,
    ReceivedServerInfoRequest,
    SendServerInfoStarted,
    SendServerInfoComplete,
    ReceivedServerInfo {
        info: ServerInfo,
    },

    SendShutdownServerCommandStarted,
    SendShutdownServerCommandComplete,
    ReceivedShutdownServerCommand,

    ErrorOccurred {
        message: String,
    },
}

impl EventKind {
    pub fn stream(&self) -> EventStream {
        match self {
            EventKind::ConnectionAccepted { .. }
            | EventKind::ConnectToRemoteServerStarted
            | EventKind::ConnectToRemoteServerComplete
            | EventKind::ReceiveRequestFromRemoteServerStarted
            | EventKind::ReceiveRequestFromRemoteServerComplete { .. }
            | EventKind::ReceiveRequestLengthStarted
            | EventKind::ReceivedRequestLengthBytesFromSocket { .. }
            | EventKind::ReceiveRequestLengthComplete { .. }
            | EventKind::ReceiveRequestBytesStarted
            | EventKind::ReceivedRequestBytesFromSocket { .. }
            | EventKind::ReceiveRequestBytesComplete
            | EventKind::SaveUnreadBytesAfterAllRequestBytesReceived { .. }
            | EventKind::DetermineRequestTypeStarted
            | EventKind::DetermineRequestTypeComplete { .. }
            | EventKind::CopySavedBytesToIncomingFile { .. } => EventStream::Socket,
            EventKind::UpdateFileTransferProgress { .. } => EventStream::FileTransferProgress,
            _ => EventStream::General,
        }
    }

    pub fn log_level(&self) -> LogLevel {
        match self {
            EventKind::UpdateFileTransferProgress { .. } => LogLevel::Trace,
            EventKind::ProcessRequestBacklogStarted { .. }
            | EventKind::ProcessRequestBacklogComplete
            | EventKind::ProcessRequestStarted { .. }
            | EventKind::ProcessRequestComplete { .. }
            | EventKind::MultipleFileWriteAttemptsNeeded { .. } => LogLevel::Debug,
            other if other.stream() == EventStream::Socket => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    /// Internal bookkeeping that log views never show
    pub fn do_not_display(&self) -> bool {
        matches!(
            self,
            EventKind::ProcessRequestStarted { .. }
                | EventKind::ProcessRequestComplete { .. }
                | EventKind::ConnectToRemoteServerStarted
                | EventKind::ConnectToRemoteServerComplete
        )
    }
}

/// One immutable event record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_transfer_id: Option<u64>,
    /// Listening address of the peer on the other side
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_server: Option<SocketAddr>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ServerEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: None,
            file_transfer_id: None,
            remote_server: None,
            kind,
        }
    }

    pub fn with_request(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_transfer(mut self, file_transfer_id: u64) -> Self {
        self.file_transfer_id = Some(file_transfer_id);
        self
    }

    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote_server = Some(remote);
        self
    }

    /// Whether a log view at `level` shows this event
    pub fn visible_at(&self, level: LogLevel) -> bool {
        !self.kind.do_not_display() && self.kind.log_level() <= level
    }

    /// Log this event using structured tracing
    ///
    /// NIST 800-53: AU-12 (Audit Generation)
    pub fn log(&self) {
        let json = serde_json::to_string(self).unwrap_or_else(|_| {
            format!("{{\"error\": \"Failed to serialize server event: {:?}\"}}", self)
        });

        if matches!(self.kind, EventKind::ErrorOccurred { .. }) {
            event!(Level::ERROR, server_event = %json);
            return;
        }

        match self.kind.log_level() {
            LogLevel::Info => event!(Level::INFO, server_event = %json),
            LogLevel::Debug => event!(Level::DEBUG, server_event = %json),
            LogLevel::Trace => event!(Level::TRACE, server_event = %json),
        }
    }
}

/// Synchronous observer of server events
///
/// Called on the engine's own task while the event is being raised.
/// Implementations must return quickly and must not call back into the
/// engine; hosts needing either should use [`EventHub::subscribe`] instead.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ServerEvent);
}

struct HubInner {
    sender: broadcast::Sender<ServerEvent>,
    log: Mutex<Vec<ServerEvent>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

/// Event log plus live fan-out
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    /// `capacity` bounds how far a live subscriber may fall behind before it
    /// starts missing events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                sender,
                log: Mutex::new(Vec::new()),
                handlers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.inner.sender.subscribe()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler>) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Record and publish an event. Never blocks on subscribers and never fails.
    pub fn emit(&self, event: ServerEvent) {
        event.log();

        self.inner
            .log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());

        for handler in self
            .inner
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            handler.on_event(&event);
        }

        // No receivers is not an error
        let _ = self.inner.sender.send(event);
    }

    fn query(&self, level: LogLevel, keep: impl Fn(&ServerEvent) -> bool) -> Vec<ServerEvent> {
        self.inner
            .log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.visible_at(level) && keep(e))
            .cloned()
            .collect()
    }

    pub fn for_transfer(&self, file_transfer_id: u64, level: LogLevel) -> Vec<ServerEvent> {
        self.query(level, |e| e.file_transfer_id == Some(file_transfer_id))
    }

    pub fn for_request(&self, request_id: u64, level: LogLevel) -> Vec<ServerEvent> {
        self.query(level, |e| e.request_id == Some(request_id))
    }

    pub fn all(&self, level: LogLevel) -> Vec<ServerEvent> {
        self.query(level, |_| true)
    }

    /// Every recorded event, bookkeeping included
    pub fn raw(&self) -> Vec<ServerEvent> {
        self.inner
            .log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("receivers", &self.inner.sender.receiver_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl EventHandler for Counter {
        fn on_event(&self, _event: &ServerEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_classification() {
        let progress = EventKind::UpdateFileTransferProgress {
            bytes_transferred: 1,
            file_size: 2,
            percent_complete: 50.0,
            transfer_rate: 1.0,
        };
        assert_eq!(progress.stream(), EventStream::FileTransferProgress);
        assert_eq!(progress.log_level(), LogLevel::Trace);

        let socket = EventKind::ReceiveRequestLengthStarted;
        assert_eq!(socket.stream(), EventStream::Socket);
        assert_eq!(socket.log_level(), LogLevel::Debug);

        let text = EventKind::ReceivedTextMessage {
            message: "hi".into(),
            text_session_id: 1,
        };
        assert_eq!(text.stream(), EventStream::General);
        assert_eq!(text.log_level(), LogLevel::Info);

        assert!(
            EventKind::ProcessRequestStarted {
                request_type: RequestType::TextMessage
            }
            .do_not_display()
        );
    }

    #[test]
    fn test_log_queries_filter_by_level_and_display_hint() {
        let hub = EventHub::new(16);
        hub.emit(ServerEvent::new(EventKind::RemoteServerAcceptedFileTransfer).with_transfer(1));
        hub.emit(
            ServerEvent::new(EventKind::UpdateFileTransferProgress {
                bytes_transferred: 10,
                file_size: 20,
                percent_complete: 50.0,
                transfer_rate: 5.0,
            })
            .with_transfer(1),
        );
        hub.emit(
            ServerEvent::new(EventKind::ProcessRequestStarted {
                request_type: RequestType::FileTransferAccepted,
            })
            .with_request(4)
            .with_transfer(1),
        );
        hub.emit(ServerEvent::new(EventKind::ReceiveRequestLengthStarted).with_request(4));

        assert_eq!(hub.for_transfer(1, LogLevel::Info).len(), 1);
        assert_eq!(hub.for_transfer(1, LogLevel::Trace).len(), 2);
        assert_eq!(hub.for_request(4, LogLevel::Info).len(), 0);
        assert_eq!(hub.for_request(4, LogLevel::Debug).len(), 1);
        assert_eq!(hub.all(LogLevel::Trace).len(), 3);
        assert_eq!(hub.raw().len(), 4);
    }

    #[tokio::test]
    async fn test_subscribers_and_handlers_receive_events() {
        let hub = EventHub::new(16);
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        hub.add_handler(counter.clone());
        let mut rx = hub.subscribe();

        hub.emit(ServerEvent::new(EventKind::ServerStoppedListening));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::ServerStoppedListening);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_without_subscribers_does_not_fail() {
        let hub = EventHub::new(1);
        for _ in 0..10 {
            hub.emit(ServerEvent::new(EventKind::ProcessRequestBacklogComplete));
        }
        assert_eq!(hub.raw().len(), 10);
    }

    #[test]
    fn test_serialized_event_is_flat() {
        let event = ServerEvent::new(EventKind::ErrorOccurred {
            message: "boom".into(),
        })
        .with_request(3);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "error_occurred");
        assert_eq!(json["message"], "boom");
        assert_eq!(json["request_id"], 3);
        assert!(json.get("file_transfer_id").is_none());
    }
}
