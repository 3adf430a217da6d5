//! File transfers: records, the shared transfer table, and the byte pump
//!
//! A transfer is looked up either by its local id or by the response code
//! both peers use before they know each other's ids. Both lookups go through
//! one table guarded by one lock, so they can never disagree.

use barn_owl_core::ServerInfo;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::event::{EventHub, EventKind, ServerEvent};
use crate::framing::FramedConnection;

/// Lifecycle state of a file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileTransferState {
    Pending,
    Accepted,
    InProgress,
    Complete,
    Rejected,
    Stalled,
    Cancelled,
    RetryLimitExceeded,
    Error,
}

impl FileTransferState {
    /// States no transition leaves
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileTransferState::Complete
                | FileTransferState::Rejected
                | FileTransferState::RetryLimitExceeded
                | FileTransferState::Error
        )
    }

    /// States a retry may start from
    pub fn is_retryable(self) -> bool {
        matches!(self, FileTransferState::Stalled | FileTransferState::Cancelled)
    }

    /// Accepted or moving bytes
    pub fn is_active(self) -> bool {
        matches!(self, FileTransferState::Accepted | FileTransferState::InProgress)
    }

    pub fn can_transition_to(self, next: FileTransferState) -> bool {
        use FileTransferState::{
            Accepted, Cancelled, Complete, Error, InProgress, Pending, Rejected,
            RetryLimitExceeded, Stalled,
        };

        match self {
            Pending => matches!(next, Accepted | Rejected | Cancelled | RetryLimitExceeded | Error),
            Accepted => matches!(next, InProgress | Complete | Stalled | Cancelled | Error),
            InProgress => matches!(next, Complete | Stalled | Cancelled | Error),
            Stalled | Cancelled => matches!(next, Pending | RetryLimitExceeded),
            Complete | Rejected | RetryLimitExceeded | Error => false,
        }
    }
}

impl std::fmt::Display for FileTransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Direction bytes flow, seen from this peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Inbound,
    Outbound,
}

/// Which peer started the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferInitiator {
    Local,
    Remote,
}

/// One file moving in one direction between two peers
#[derive(Debug, Clone, Serialize)]
pub struct FileTransfer {
    pub id: u64,
    /// 0 until the peer holding the file assigns one
    pub response_code: i64,
    /// Id the remote peer uses for the same transfer, when it told us
    pub remote_transfer_id: Option<u64>,
    pub direction: TransferDirection,
    pub initiator: TransferInitiator,
    /// Most recent request correlated with this transfer
    pub request_id: Option<u64>,

    pub file_name: String,
    pub file_size: u64,
    /// Folder on this peer the file is read from or written to
    pub local_folder: PathBuf,
    /// Folder on the remote peer
    pub remote_folder: String,
    pub local_server: ServerInfo,
    pub remote_server: ServerInfo,

    state: FileTransferState,
    pub bytes_transferred: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bytes per second since the pump started
    pub transfer_rate: f64,
    #[serde(skip)]
    last_progress: Option<Instant>,

    pub retry_counter: u32,
    pub retry_limit: u32,
    pub retry_lockout_expires: Option<DateTime<Utc>>,
    pub error_message: Option<String>,

    /// Bumped on every reset so a pump from an earlier attempt cannot
    /// overwrite the progress of the current one
    pub attempt: u32,
    /// Set once the receive pump has created the destination file
    pub destination_created: bool,
}

/// Descriptive fields needed to create a transfer record
#[derive(Debug, Clone)]
pub struct NewFileTransfer {
    pub response_code: i64,
    pub remote_transfer_id: Option<u64>,
    pub direction: TransferDirection,
    pub initiator: TransferInitiator,
    pub file_name: String,
    pub file_size: u64,
    pub local_folder: PathBuf,
    pub remote_folder: String,
    pub local_server: ServerInfo,
    pub remote_server: ServerInfo,
    pub retry_limit: u32,
}

impl FileTransfer {
    fn new(id: u64, fields: NewFileTransfer) -> Self {
        Self {
            id,
            response_code: fields.response_code,
            remote_transfer_id: fields.remote_transfer_id,
            direction: fields.direction,
            initiator: fields.initiator,
            request_id: None,
            file_name: fields.file_name,
            file_size: fields.file_size,
            local_folder: fields.local_folder,
            remote_folder: fields.remote_folder,
            local_server: fields.local_server,
            remote_server: fields.remote_server,
            state: FileTransferState::Pending,
            bytes_transferred: 0,
            started_at: None,
            completed_at: None,
            transfer_rate: 0.0,
            last_progress: None,
            retry_counter: 0,
            retry_limit: fields.retry_limit,
            retry_lockout_expires: None,
            error_message: None,
            attempt: 0,
            destination_created: false,
        }
    }

    pub fn state(&self) -> FileTransferState {
        self.state
    }

    pub fn local_file_path(&self) -> PathBuf {
        self.local_folder.join(&self.file_name)
    }

    /// Listening address of the remote peer
    pub fn remote_address(&self) -> SocketAddr {
        self.remote_server.session_address()
    }

    pub fn percent_complete(&self) -> f64 {
        if self.file_size == 0 {
            return 100.0;
        }
        self.bytes_transferred as f64 * 100.0 / self.file_size as f64
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: FileTransferState) -> Result<FileTransferState> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        let previous = self.state;
        self.state = next;
        match next {
            FileTransferState::InProgress => {
                self.started_at = Some(Utc::now());
                self.last_progress = Some(Instant::now());
            }
            FileTransferState::Complete => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        Ok(previous)
    }

    /// Record a failure and move to `Error`
    pub fn fail(&mut self, message: impl Into<String>) -> Result<FileTransferState> {
        let previous = self.transition(FileTransferState::Error)?;
        self.error_message = Some(message.into());
        Ok(previous)
    }

    /// Clear progress, timestamps and error state ahead of a new attempt.
    /// Id, response code and retry bookkeeping are kept.
    pub fn reset_transfer_values(&mut self) {
        self.bytes_transferred = 0;
        self.started_at = None;
        self.completed_at = None;
        self.transfer_rate = 0.0;
        self.last_progress = None;
        self.error_message = None;
        self.destination_created = false;
        self.attempt += 1;
    }

    pub fn record_progress(&mut self, bytes_transferred: u64) {
        self.bytes_transferred = bytes_transferred;
        self.last_progress = Some(Instant::now());
        if let Some(started) = self.started_at {
            let elapsed = (Utc::now() - started).num_milliseconds().max(1) as f64 / 1000.0;
            self.transfer_rate = bytes_transferred as f64 / elapsed;
        }
    }

    /// Whether the lockout set by an exhausted retry limit is still running
    pub fn is_locked_out(&self, now: DateTime<Utc>) -> bool {
        self.state == FileTransferState::RetryLimitExceeded
            && self.retry_lockout_expires.is_some_and(|expires| expires > now)
    }

    /// Active transfer without progress for longer than `threshold`
    pub fn is_stalled(&self, threshold: Duration, now: Instant) -> bool {
        self.state.is_active()
            && self
                .last_progress
                .is_some_and(|last| now.saturating_duration_since(last) > threshold)
    }
}

/// All transfers of one engine plus their id and response code indexes
#[derive(Debug, Default)]
pub struct TransferTable {
    transfers: Vec<FileTransfer>,
    by_id: HashMap<u64, usize>,
    by_code: HashMap<i64, usize>,
    next_id: u64,
}

impl TransferTable {
    /// Append a transfer under the next id. A response code already owned by
    /// another transfer is a consistency violation; code 0 is left unindexed.
    pub fn insert(&mut self, new_transfer: NewFileTransfer) -> Result<u64> {
        self.ensure_code_free(new_transfer.response_code)?;

        self.next_id += 1;
        let id = self.next_id;
        let index = self.transfers.len();
        if new_transfer.response_code != 0 {
            self.by_code.insert(new_transfer.response_code, index);
        }
        self.by_id.insert(id, index);
        self.transfers.push(FileTransfer::new(id, new_transfer));
        Ok(id)
    }

    /// Give a transfer created without a response code the one its peer chose
    pub fn assign_response_code(&mut self, id: u64, response_code: i64) -> Result<()> {
        let index = self.index_for_id(id)?;
        let current = self.transfers[index].response_code;
        if current == response_code {
            return Ok(());
        }
        if current != 0 {
            return Err(Error::Consistency(format!(
                "transfer {} already holds response code {}, peer sent {}",
                id, current, response_code
            )));
        }
        self.ensure_code_free(response_code)?;
        self.by_code.insert(response_code, index);
        self.transfers[index].response_code = response_code;
        Ok(())
    }

    fn ensure_code_free(&self, response_code: i64) -> Result<()> {
        if response_code == 0 {
            return Ok(());
        }
        match self.by_code.get(&response_code) {
            Some(&index) => Err(Error::Consistency(format!(
                "response code {} already belongs to transfer {}",
                response_code, self.transfers[index].id
            ))),
            None => Ok(()),
        }
    }

    pub fn contains_code(&self, response_code: i64) -> bool {
        self.by_code.contains_key(&response_code)
    }

    pub fn get(&self, id: u64) -> Result<&FileTransfer> {
        let index = self.index_for_id(id)?;
        Ok(&self.transfers[index])
    }

    pub fn get_mut(&mut self, id: u64) -> Result<&mut FileTransfer> {
        let index = self.index_for_id(id)?;
        Ok(&mut self.transfers[index])
    }

    pub fn id_for_code(&self, response_code: i64) -> Result<u64> {
        let index = *self.by_code.get(&response_code).ok_or_else(|| {
            Error::NotFound(format!("file transfer with response code {}", response_code))
        })?;
        let transfer = self.transfers.get(index).ok_or_else(|| {
            Error::Consistency(format!("response code {} indexes past the table", response_code))
        })?;
        if transfer.response_code != response_code {
            return Err(Error::Consistency(format!(
                "response code {} indexes transfer {} holding code {}",
                response_code, transfer.id, transfer.response_code
            )));
        }
        Ok(transfer.id)
    }

    pub fn all(&self) -> &[FileTransfer] {
        &self.transfers
    }

    fn index_for_id(&self, id: u64) -> Result<usize> {
        let index = *self
            .by_id
            .get(&id)
            .ok_or_else(|| Error::NotFound(format!("file transfer {}", id)))?;
        match self.transfers.get(index) {
            Some(transfer) if transfer.id == id => Ok(index),
            _ => Err(Error::Consistency(format!(
                "transfer id {} indexes the wrong record",
                id
            ))),
        }
    }
}

/// Handle on the transfer table shared by the engine and its pumps
#[derive(Clone, Debug)]
pub struct Transfers {
    table: Arc<Mutex<TransferTable>>,
    events: EventHub,
}

impl Transfers {
    pub fn new(events: EventHub) -> Self {
        Self {
            table: Arc::new(Mutex::new(TransferTable::default())),
            events,
        }
    }

    pub async fn insert(&self, new_transfer: NewFileTransfer) -> Result<u64> {
        self.table.lock().await.insert(new_transfer)
    }

    /// A response code no transfer owns yet
    pub async fn new_response_code(&self) -> i64 {
        let table = self.table.lock().await;
        loop {
            let code = rand::random::<i64>() & i64::MAX;
            if code != 0 && !table.contains_code(code) {
                return code;
            }
        }
    }

    pub async fn snapshot(&self, id: u64) -> Result<FileTransfer> {
        self.table.lock().await.get(id).cloned()
    }

    pub async fn id_for_code(&self, response_code: i64) -> Result<u64> {
        self.table.lock().await.id_for_code(response_code)
    }

    pub async fn assign_response_code(&self, id: u64, response_code: i64) -> Result<()> {
        self.table
            .lock()
            .await
            .assign_response_code(id, response_code)
    }

    pub async fn list(&self) -> Vec<FileTransfer> {
        self.table.lock().await.all().to_vec()
    }

    /// Mutate one transfer in place
    pub async fn update<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut FileTransfer) -> Result<R>,
    ) -> Result<R> {
        let mut table = self.table.lock().await;
        f(table.get_mut(id)?)
    }

    /// Mutate one transfer and report a state change if it happened
    pub async fn update_state<R>(
        &self,
        id: u64,
        f: impl FnOnce(&mut FileTransfer) -> Result<R>,
    ) -> Result<R> {
        let (before, after, remote, result) = {
            let mut table = self.table.lock().await;
            let transfer = table.get_mut(id)?;
            let before = transfer.state();
            let result = f(transfer)?;
            (before, transfer.state(), transfer.remote_address(), result)
        };

        if before != after {
            self.events.emit(
                ServerEvent::new(EventKind::FileTransferStatusChange {
                    previous: before,
                    current: after,
                })
                .with_transfer(id)
                .with_remote(remote),
            );
        }
        Ok(result)
    }

    pub async fn set_state(&self, id: u64, next: FileTransferState) -> Result<()> {
        self.update_state(id, |t| t.transition(next).map(|_| ())).await
    }

    /// Ids of active transfers without progress for longer than `threshold`
    pub async fn stalled(&self, threshold: Duration) -> Vec<u64> {
        let now = Instant::now();
        self.table
            .lock()
            .await
            .all()
            .iter()
            .filter(|t| t.direction == TransferDirection::Inbound && t.is_stalled(threshold, now))
            .map(|t| t.id)
            .collect()
    }

    /// Outbound transfer of `file_name` to `remote` whose lockout is still
    /// running, the one expiring last if there are several
    pub async fn active_lockout(
        &self,
        remote: SocketAddr,
        file_name: &str,
    ) -> Option<FileTransfer> {
        let now = Utc::now();
        self.table
            .lock()
            .await
            .all()
            .iter()
            .filter(|t| {
                t.direction == TransferDirection::Outbound
                    && t.file_name == file_name
                    && t.remote_address() == remote
                    && t.is_locked_out(now)
            })
            .max_by_key(|t| t.retry_lockout_expires)
            .cloned()
    }

    /// Download we asked `remote` for that has not been answered yet
    pub async fn awaiting_code(&self, remote: SocketAddr, file_name: &str) -> Option<u64> {
        self.table
            .lock()
            .await
            .all()
            .iter()
            .find(|t| {
                t.response_code == 0
                    && t.direction == TransferDirection::Inbound
                    && t.initiator == TransferInitiator::Local
                    && t.state() == FileTransferState::Pending
                    && t.file_name == file_name
                    && t.remote_address() == remote
            })
            .map(|t| t.id)
    }
}

/// Emits progress no more often than `interval`
#[derive(Debug)]
struct ProgressThrottle {
    interval: Duration,
    last: Instant,
}

impl ProgressThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    fn ready(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// Settings the pump needs from the engine configuration
#[derive(Debug, Clone)]
pub struct PumpSettings {
    pub buffer_size: usize,
    pub io_timeout: Duration,
    pub update_interval: Duration,
    pub file_open_attempts: u32,
    pub file_open_retry_delay: Duration,
}

/// Streams the content of one transfer over a handed-off connection
#[derive(Debug, Clone)]
pub struct TransferPump {
    transfer_id: u64,
    attempt: u32,
    path: PathBuf,
    file_size: u64,
    remote: SocketAddr,
    settings: PumpSettings,
    transfers: Transfers,
    events: EventHub,
}

impl TransferPump {
    /// Build a pump for the current attempt of transfer `transfer_id`
    pub async fn new(
        transfer_id: u64,
        settings: PumpSettings,
        transfers: Transfers,
        events: EventHub,
    ) -> Result<Self> {
        let transfer = transfers.snapshot(transfer_id).await?;
        Ok(Self {
            transfer_id,
            attempt: transfer.attempt,
            path: transfer.local_file_path(),
            file_size: transfer.file_size,
            remote: transfer.remote_address(),
            settings,
            transfers,
            events,
        })
    }

    pub fn transfer_id(&self) -> u64 {
        self.transfer_id
    }

    /// Attempt of the transfer this pump was built for
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn emit(&self, kind: EventKind) {
        self.events.emit(
            ServerEvent::new(kind)
                .with_transfer(self.transfer_id)
                .with_remote(self.remote),
        );
    }

    /// Move to `InProgress`, unless a newer attempt replaced this one.
    ///
    /// A transfer that already left the active states (the peer confirmed an
    /// empty file before the pump got here, or it stalled) ends the pump with
    /// `Cancelled`.
    async fn start(&self) -> Result<()> {
        let attempt = self.attempt;
        self.transfers
            .update_state(self.transfer_id, |t| {
                if t.attempt != attempt {
                    return Err(Error::Cancelled);
                }
                match t.state() {
                    FileTransferState::InProgress => Ok(()),
                    FileTransferState::Accepted => {
                        t.transition(FileTransferState::InProgress).map(|_| ())
                    }
                    _ => Err(Error::Cancelled),
                }
            })
            .await
    }

    async fn report_progress(&self, bytes: u64) {
        let attempt = self.attempt;
        let update = self
            .transfers
            .update(self.transfer_id, |t| {
                if t.attempt != attempt {
                    return Ok(None);
                }
                t.record_progress(bytes);
                Ok(Some(EventKind::UpdateFileTransferProgress {
                    bytes_transferred: bytes,
                    file_size: t.file_size,
                    percent_complete: t.percent_complete(),
                    transfer_rate: t.transfer_rate,
                }))
            })
            .await;

        if let Ok(Some(kind)) = update {
            self.emit(kind);
        }
    }

    /// Stream the local file to the peer.
    ///
    /// Cancellation is checked between chunks and interrupts a pending
    /// write; the connection is left open for the caller either way.
    pub async fn send_file_bytes(
        &self,
        conn: &mut FramedConnection,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut file = File::open(&self.path).await?;
        self.emit(EventKind::SendFileBytesStarted {
            file_size: self.file_size,
        });
        self.start().await?;

        let mut buf = vec![0u8; self.settings.buffer_size.max(1)];
        let mut throttle = ProgressThrottle::new(self.settings.update_interval);
        let mut sent: u64 = 0;

        while sent < self.file_size {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let want = buf
                .len()
                .min(usize::try_from(self.file_size - sent).unwrap_or(usize::MAX));
            let read = file.read(&mut buf[..want]).await?;
            if read == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "{} ended after {} of {} bytes",
                        self.path.display(),
                        sent,
                        self.file_size
                    ),
                )));
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                written = conn.write_chunk(&buf[..read], self.settings.io_timeout) => written?,
            }

            sent += read as u64;
            if throttle.ready() {
                self.report_progress(sent).await;
            }
        }

        self.report_progress(sent).await;
        self.emit(EventKind::SendFileBytesComplete { bytes_sent: sent });
        Ok(sent)
    }

    /// Receive exactly `file_size` bytes into a newly created local file.
    ///
    /// `overflow` holds bytes already read off the connection and is written
    /// first. A partial file is left in place when the transfer fails.
    pub async fn receive_file(
        &self,
        conn: &mut FramedConnection,
        overflow: Bytes,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut file = self.open_destination().await?;
        self.emit(EventKind::ReceiveFileBytesStarted {
            file_size: self.file_size,
        });
        self.start().await?;

        let started = Instant::now();
        let result = self.receive_into(&mut file, conn, overflow, cancel).await;
        file.flush().await?;
        let received = result?;

        self.report_progress(received).await;
        let elapsed = started.elapsed();
        self.emit(EventKind::ReceiveFileBytesComplete {
            bytes_received: received,
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            transfer_rate: received as f64 / elapsed.as_secs_f64().max(0.001),
        });
        Ok(received)
    }

    async fn receive_into(
        &self,
        file: &mut File,
        conn: &mut FramedConnection,
        overflow: Bytes,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut throttle = ProgressThrottle::new(self.settings.update_interval);
        let mut received: u64 = 0;

        if !overflow.is_empty() {
            let take = overflow
                .len()
                .min(usize::try_from(self.file_size).unwrap_or(usize::MAX));
            file.write_all(&overflow[..take]).await?;
            received += take as u64;
            self.emit(EventKind::CopySavedBytesToIncomingFile { bytes: take });
        }

        while received < self.file_size {
            let want = self
                .settings
                .buffer_size
                .min(usize::try_from(self.file_size - received).unwrap_or(usize::MAX));

            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = conn.read_chunk(want, self.settings.io_timeout) => chunk?,
            };

            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if throttle.ready() {
                self.report_progress(received).await;
            }
        }

        Ok(received)
    }

    async fn open_destination(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .await
            {
                Ok(file) => {
                    if attempts > 1 {
                        self.emit(EventKind::MultipleFileWriteAttemptsNeeded { attempts });
                    }
                    let attempt = self.attempt;
                    self.transfers
                        .update(self.transfer_id, |t| {
                            if t.attempt == attempt {
                                t.destination_created = true;
                            }
                            Ok(())
                        })
                        .await?;
                    return Ok(file);
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::PermissionDenied
                        && attempts < self.settings.file_open_attempts =>
                {
                    tokio::time::sleep(self.settings.file_open_retry_delay).await;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}
