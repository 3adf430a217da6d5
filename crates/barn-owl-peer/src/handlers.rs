//! Request handlers, one per request type
//!
//! Every response type is correlated with its file transfer through the
//! response code carried in the payload, except `RequestedFileDoesNotExist`,
//! which echoes the local transfer id of the download it answers.

use barn_owl_core::{FileInfo, FileInfoList, ServerInfo};
use bytes::Bytes;
use chrono::Utc;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::event::EventKind;
use crate::framing::FramedConnection;
use crate::protocol::{
    InboundFileTransfer, Payload, RequestType, RetryLimitNotice, ServerInfoResponse,
};
use crate::request::ServerRequest;
use crate::server::{RemoteFileList, Server};
use crate::text::MessageAuthor;
use crate::transfer::{
    FileTransferState, NewFileTransfer, TransferDirection, TransferInitiator, TransferPump,
};

fn remote_of(request: &ServerRequest) -> Result<SocketAddr> {
    request.remote().ok_or_else(|| {
        Error::InvalidState(format!("request {} has no remote peer", request.id()))
    })
}

impl Server {
    pub(crate) async fn dispatch(&self, request: &mut ServerRequest) -> Result<()> {
        let request_type = request
            .request_type()
            .ok_or_else(|| Error::InvalidState(format!("request {} has no type", request.id())))?;
        debug!(event = "dispatch", request_id = request.id(), request_type = %request_type);

        match request_type {
            RequestType::TextMessage => self.handle_text_message(request),
            RequestType::InboundFileTransferRequest => {
                self.handle_inbound_file_transfer_request(request).await
            }
            RequestType::OutboundFileTransferRequest => {
                self.handle_outbound_file_transfer_request(request).await
            }
            RequestType::RequestedFileDoesNotExist => {
                self.handle_requested_file_does_not_exist(request).await
            }
            RequestType::FileTransferRejected => self.handle_file_transfer_rejected(request).await,
            RequestType::FileTransferAccepted => self.handle_file_transfer_accepted(request).await,
            RequestType::FileTransferStalled => self.handle_file_transfer_stalled(request).await,
            RequestType::FileTransferComplete => self.handle_file_transfer_complete(request).await,
            RequestType::RetryOutboundFileTransfer => self.handle_retry_request(request).await,
            RequestType::RetryLimitExceeded => self.handle_retry_limit_exceeded(request).await,
            RequestType::FileListRequest => self.handle_file_list_request(request).await,
            RequestType::FileListResponse => self.handle_file_list_response(request),
            RequestType::NoFilesAvailableForDownload => {
                self.emit_request(request, EventKind::ReceivedNotificationNoFilesToDownload);
                Ok(())
            }
            RequestType::RequestedFolderDoesNotExist => {
                self.emit_request(request, EventKind::ReceivedNotificationFolderDoesNotExist);
                Ok(())
            }
            RequestType::ServerInfoRequest => self.handle_server_info_request(request).await,
            RequestType::ServerInfoResponse => self.handle_server_info_response(request),
            RequestType::ShutdownServerCommand => self.handle_shutdown_command(request),
        }
    }

    fn handle_text_message(&self, request: &ServerRequest) -> Result<()> {
        let remote = remote_of(request)?;
        let message = request.text_message()?.to_string();
        let text_session_id = self.record_text(remote, MessageAuthor::Remote, &message);
        self.emit_request(
            request,
            EventKind::ReceivedTextMessage {
                message,
                text_session_id,
            },
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Receiving side of a transfer
    // ---------------------------------------------------------------------

    async fn handle_inbound_file_transfer_request(
        &self,
        request: &mut ServerRequest,
    ) -> Result<()> {
        let remote = remote_of(request)?;
        let offer = request.inbound_file_transfer()?.clone();
        let request_id = request.id();

        let transfer_id = self.sync_inbound_transfer(remote, &offer).await?;
        request.set_file_transfer_id(transfer_id);
        let transfer = self
            .inner
            .transfers
            .update(transfer_id, |t| {
                t.request_id = Some(request_id);
                Ok(t.clone())
            })
            .await?;

        self.emit_request(
            request,
            EventKind::ReceivedInboundFileTransferRequest {
                file_name: transfer.file_name.clone(),
                file_size: transfer.file_size,
                local_folder: transfer.local_folder.to_string_lossy().into_owned(),
                retry_counter: transfer.retry_counter,
                retry_limit: transfer.retry_limit,
            },
        );

        let code = Payload::Int64(transfer.response_code);
        if tokio::fs::try_exists(transfer.local_file_path()).await? {
            info!(
                event = "file_transfer_rejected",
                file_transfer_id = transfer_id,
                path = %transfer.local_file_path().display(),
                "destination file already exists"
            );
            self.inner
                .transfers
                .set_state(transfer_id, FileTransferState::Rejected)
                .await?;
            self.send_request(
                remote,
                RequestType::FileTransferRejected,
                code,
                Some(transfer_id),
                EventKind::SendFileTransferRejectedStarted,
                EventKind::SendFileTransferRejectedComplete,
            )
            .await?;
            return Ok(());
        }

        self.inner
            .transfers
            .set_state(transfer_id, FileTransferState::Accepted)
            .await?;
        let conn = match self
            .send_request_keep_open(
                remote,
                RequestType::FileTransferAccepted,
                code,
                Some(transfer_id),
                EventKind::SendFileTransferAcceptedStarted,
                EventKind::SendFileTransferAcceptedComplete,
            )
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                self.fail_transfer(transfer_id, None, &e).await;
                return Err(e);
            }
        };

        self.spawn_receive_pump(transfer_id, conn).await
    }

    /// Find or create the transfer an inbound file transfer request is about
    async fn sync_inbound_transfer(
        &self,
        remote: SocketAddr,
        offer: &InboundFileTransfer,
    ) -> Result<u64> {
        let transfers = &self.inner.transfers;

        // A download we asked for: the sender echoes our id
        if offer.remote_transfer_id != 0 {
            let id = offer.remote_transfer_id;
            let existing = transfers.snapshot(id).await?;
            if existing.direction != TransferDirection::Inbound {
                return Err(Error::Consistency(format!(
                    "peer offered a file for outbound transfer {}",
                    id
                )));
            }
            transfers.assign_response_code(id, offer.response_code).await?;
            if existing.state().is_retryable() {
                self.prepare_retry(id, offer).await?;
            } else if existing.state() != FileTransferState::Pending {
                return Err(Error::Consistency(format!(
                    "peer offered a file for transfer {} while {}",
                    id,
                    existing.state()
                )));
            }
            transfers
                .update(id, |t| {
                    t.file_size = offer.file_size;
                    t.retry_counter = offer.retry_counter;
                    t.retry_limit = offer.retry_limit;
                    Ok(())
                })
                .await?;
            return Ok(id);
        }

        match transfers.id_for_code(offer.response_code).await {
            Ok(id) => {
                let existing = transfers.snapshot(id).await?;
                if !existing.state().is_retryable() {
                    return Err(Error::Consistency(format!(
                        "response code {} already belongs to transfer {} ({})",
                        offer.response_code,
                        id,
                        existing.state()
                    )));
                }
                self.prepare_retry(id, offer).await?;
                Ok(id)
            }
            Err(Error::NotFound(_)) => {
                let local_folder = if offer.remote_folder.is_empty() {
                    self.inner.config.transfer_folder.clone()
                } else {
                    PathBuf::from(&offer.remote_folder)
                };
                let remote_folder = offer
                    .file_path
                    .strip_suffix(offer.file_name())
                    .unwrap_or_default()
                    .trim_end_matches(['/', '\\'])
                    .to_string();

                let id = transfers
                    .insert(NewFileTransfer {
                        response_code: offer.response_code,
                        remote_transfer_id: None,
                        direction: TransferDirection::Inbound,
                        initiator: TransferInitiator::Remote,
                        file_name: offer.file_name().to_string(),
                        file_size: offer.file_size,
                        local_folder,
                        remote_folder,
                        local_server: self.my_info()?,
                        remote_server: self.remote_server_info(remote),
                        retry_limit: offer.retry_limit,
                    })
                    .await?;
                transfers
                    .update(id, |t| {
                        t.retry_counter = offer.retry_counter;
                        Ok(())
                    })
                    .await?;
                Ok(id)
            }
            Err(e) => Err(e),
        }
    }

    /// Reset a stalled inbound transfer for the sender's next attempt,
    /// removing the partial file an earlier attempt left behind
    async fn prepare_retry(&self, transfer_id: u64, offer: &InboundFileTransfer) -> Result<()> {
        let transfer = self.inner.transfers.snapshot(transfer_id).await?;
        if transfer.destination_created {
            let path = transfer.local_file_path();
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(
                    event = "partial_file_removed",
                    file_transfer_id = transfer_id,
                    path = %path.display()
                ),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        self.inner
            .transfers
            .update_state(transfer_id, |t| {
                t.reset_transfer_values();
                t.retry_counter = offer.retry_counter;
                t.retry_limit = offer.retry_limit;
                t.file_size = offer.file_size;
                t.transition(FileTransferState::Pending).map(|_| ())
            })
            .await
    }

    async fn spawn_receive_pump(&self, transfer_id: u64, mut conn: FramedConnection) -> Result<()> {
        let pump = TransferPump::new(
            transfer_id,
            self.pump_settings(),
            self.inner.transfers.clone(),
            self.inner.events.clone(),
        )
        .await?;
        let overflow: Bytes = conn.take_overflow();
        let token = self.register_pump(transfer_id);
        let server = self.clone();

        tokio::spawn(async move {
            let received = pump.receive_file(&mut conn, overflow, &token).await;
            drop(conn);
            server.finish_receive(&pump, received).await;
        });
        Ok(())
    }

    async fn finish_receive(&self, pump: &TransferPump, received: Result<u64>) {
        let transfer_id = pump.transfer_id();
        let attempt = pump.attempt();

        match received {
            Ok(_) => {
                let completed = self
                    .inner
                    .transfers
                    .update_state(transfer_id, |t| {
                        if t.attempt != attempt || !t.state().is_active() {
                            return Ok(None);
                        }
                        t.transition(FileTransferState::Complete)?;
                        Ok(Some((t.remote_address(), t.response_code)))
                    })
                    .await;

                match completed {
                    Ok(Some((remote, code))) => {
                        self.cancel_pump(transfer_id);
                        if let Err(e) = self
                            .send_request(
                                remote,
                                RequestType::FileTransferComplete,
                                Payload::Int64(code),
                                Some(transfer_id),
                                EventKind::SendFileTransferCompletedStarted,
                                EventKind::SendFileTransferCompletedComplete,
                            )
                            .await
                        {
                            self.report_error(None, Some(transfer_id), &e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => self.report_error(None, Some(transfer_id), &e),
                }
            }
            // Whoever cancelled the pump already set the state
            Err(Error::Cancelled) => {}
            Err(e) => {
                self.fail_transfer(transfer_id, Some(attempt), &e).await;
                self.report_error(None, Some(transfer_id), &e);
            }
        }
    }

    async fn handle_retry_limit_exceeded(&self, request: &mut ServerRequest) -> Result<()> {
        let notice = request.retry_limit_notice()?.clone();
        let remote = remote_of(request)?;
        let locked_id = self.inner.transfers.id_for_code(notice.response_code).await?;
        let locked = self.inner.transfers.snapshot(locked_id).await?;

        // A repeated download of a file still under lockout is answered with
        // the code of the transfer that exhausted its retries
        let transfer_id = if locked.state() == FileTransferState::RetryLimitExceeded {
            match self
                .inner
                .transfers
                .awaiting_code(remote, &locked.file_name)
                .await
            {
                Some(id) => id,
                None => locked_id,
            }
        } else {
            locked_id
        };
        request.set_file_transfer_id(transfer_id);

        self.inner
            .transfers
            .update_state(transfer_id, |t| {
                if t.state() != FileTransferState::RetryLimitExceeded {
                    t.transition(FileTransferState::RetryLimitExceeded)?;
                }
                t.retry_limit = notice.retry_limit;
                t.retry_lockout_expires = Some(notice.lockout_expires);
                t.error_message = Some(format!(
                    "retry limit of {} reached, locked out until {}",
                    notice.retry_limit, notice.lockout_expires
                ));
                Ok(())
            })
            .await?;
        self.cancel_pump(transfer_id);

        self.emit_request(
            request,
            EventKind::ReceivedRetryLimitExceeded {
                retry_limit: notice.retry_limit,
                lockout_expires: notice.lockout_expires,
            },
        );
        Ok(())
    }

    async fn handle_requested_file_does_not_exist(
        &self,
        request: &mut ServerRequest,
    ) -> Result<()> {
        let transfer_id = request.remote_transfer_id()?;
        request.set_file_transfer_id(transfer_id);
        self.inner
            .transfers
            .set_state(transfer_id, FileTransferState::Rejected)
            .await?;
        self.emit_request(request, EventKind::ReceivedNotificationFileDoesNotExist);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Sending side of a transfer
    // ---------------------------------------------------------------------

    async fn handle_outbound_file_transfer_request(
        &self,
        request: &mut ServerRequest,
    ) -> Result<()> {
        let remote = remote_of(request)?;
        let wanted = request.outbound_file_transfer()?.clone();
        let path = PathBuf::from(&wanted.file_path);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| wanted.file_path.clone());

        self.emit_request(
            request,
            EventKind::ReceivedOutboundFileTransferRequest {
                local_file_path: wanted.file_path.clone(),
                remote_folder: wanted.local_folder.clone(),
            },
        );

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => {
                let id = i64::try_from(wanted.remote_transfer_id).map_err(|_| {
                    Error::decode("remote_transfer_id", "does not fit a signed 64-bit value")
                })?;
                self.send_request(
                    remote,
                    RequestType::RequestedFileDoesNotExist,
                    Payload::Int64(id),
                    None,
                    EventKind::SendNotificationFileDoesNotExistStarted,
                    EventKind::SendNotificationFileDoesNotExistComplete,
                )
                .await?;
                return Ok(());
            }
        };

        if let Some(locked) = self.inner.transfers.active_lockout(remote, &file_name).await {
            let expires = locked.retry_lockout_expires.unwrap_or_else(Utc::now);
            info!(
                event = "retry_lockout_enforced",
                file_transfer_id = locked.id,
                remote = %remote,
                lockout_expires = %expires,
                "refusing file requested during retry lockout"
            );
            request.set_file_transfer_id(locked.id);
            self.send_request(
                remote,
                RequestType::RetryLimitExceeded,
                Payload::RetryLimitExceeded(RetryLimitNotice {
                    response_code: locked.response_code,
                    retry_limit: locked.retry_limit,
                    lockout_expires: expires,
                }),
                Some(locked.id),
                EventKind::SendRetryLimitExceededStarted,
                EventKind::SendRetryLimitExceededComplete,
            )
            .await?;
            return Ok(());
        }

        let response_code = self.inner.transfers.new_response_code().await;
        let transfer_id = self
            .inner
            .transfers
            .insert(NewFileTransfer {
                response_code,
                remote_transfer_id: Some(wanted.remote_transfer_id),
                direction: TransferDirection::Outbound,
                initiator: TransferInitiator::Remote,
                file_name,
                file_size: metadata.len(),
                local_folder: path.parent().map(Path::to_path_buf).unwrap_or_default(),
                remote_folder: wanted.local_folder.clone(),
                local_server: self.my_info()?,
                remote_server: self.remote_server_info(remote),
                retry_limit: self.inner.config.transfer.retry_limit,
            })
            .await?;
        request.set_file_transfer_id(transfer_id);

        self.send_inbound_file_transfer_request(transfer_id).await
    }

    async fn handle_file_transfer_rejected(&self, request: &mut ServerRequest) -> Result<()> {
        let transfer_id = self.correlate(request).await?;
        self.inner
            .transfers
            .set_state(transfer_id, FileTransferState::Rejected)
            .await?;
        self.emit_request(request, EventKind::RemoteServerRejectedFileTransfer);
        Ok(())
    }

    async fn handle_file_transfer_accepted(&self, request: &mut ServerRequest) -> Result<()> {
        let transfer_id = self.correlate(request).await?;
        self.inner
            .transfers
            .set_state(transfer_id, FileTransferState::Accepted)
            .await?;
        self.emit_request(request, EventKind::RemoteServerAcceptedFileTransfer);

        // In progress before the pump runs: the receiver may confirm a short
        // file before the pump is scheduled
        self.inner
            .transfers
            .set_state(transfer_id, FileTransferState::InProgress)
            .await?;

        let mut conn = request.take_connection()?;
        let pump = TransferPump::new(
            transfer_id,
            self.pump_settings(),
            self.inner.transfers.clone(),
            self.inner.events.clone(),
        )
        .await?;
        let token = self.register_pump(transfer_id);
        let server = self.clone();

        tokio::spawn(async move {
            let sent = pump.send_file_bytes(&mut conn, &token).await;
            if sent.is_ok() {
                // Every byte is written; the receiver confirms with FileTransferComplete
                let _ = conn.shutdown().await;
            }
            drop(conn);
            match sent {
                Ok(_) | Err(Error::Cancelled) => {}
                // A receiver that dropped the connection may have found the
                // transfer stalled; keep it open for a retry
                Err(e) if e.is_recoverable() => {
                    server.park_transfer(transfer_id, pump.attempt(), &e).await;
                    server.report_error(None, Some(transfer_id), &e);
                }
                Err(e) => {
                    server.fail_transfer(transfer_id, Some(pump.attempt()), &e).await;
                    server.report_error(None, Some(transfer_id), &e);
                }
            }
        });
        Ok(())
    }

    /// Move an in-flight outbound transfer to `Cancelled` after a transport failure
    async fn park_transfer(&self, transfer_id: u64, attempt: u32, error: &Error) {
        let message = error.to_string();
        let parked = self
            .inner
            .transfers
            .update_state(transfer_id, |t| {
                if t.attempt != attempt || !t.state().is_active() {
                    return Ok(false);
                }
                t.transition(FileTransferState::Cancelled)?;
                t.error_message = Some(message);
                Ok(true)
            })
            .await;
        match parked {
            Ok(true) => self.cancel_pump(transfer_id),
            Ok(false) => {}
            Err(e) => {
                debug!(event = "park_transfer_skipped", file_transfer_id = transfer_id, error = %e);
            }
        }
    }

    async fn handle_file_transfer_complete(&self, request: &mut ServerRequest) -> Result<()> {
        let transfer_id = self.correlate(request).await?;
        self.inner
            .transfers
            .set_state(transfer_id, FileTransferState::Complete)
            .await?;
        self.cancel_pump(transfer_id);
        self.emit_request(request, EventKind::RemoteServerConfirmedFileTransferCompleted);
        Ok(())
    }

    async fn handle_file_transfer_stalled(&self, request: &mut ServerRequest) -> Result<()> {
        let transfer_id = self.correlate(request).await?;
        self.inner
            .transfers
            .update_state(transfer_id, |t| {
                if t.state() != FileTransferState::Cancelled {
                    t.transition(FileTransferState::Cancelled)?;
                }
                t.error_message = Some("receiver reported the transfer stalled".to_string());
                Ok(())
            })
            .await?;
        self.cancel_pump(transfer_id);
        self.emit_request(request, EventKind::FileTransferStalled);
        Ok(())
    }

    /// The receiver asks for another attempt. Granted while the retry
    /// counter is below our limit, answered with a lockout otherwise.
    async fn handle_retry_request(&self, request: &mut ServerRequest) -> Result<()> {
        let transfer_id = self.correlate(request).await?;
        let transfer = self.inner.transfers.snapshot(transfer_id).await?;
        let retry_limit = self.inner.config.transfer.retry_limit;

        self.emit_request(
            request,
            EventKind::ReceivedRetryOutboundFileTransferRequest {
                retry_counter: transfer.retry_counter,
                retry_limit,
            },
        );

        if transfer.retry_counter >= retry_limit {
            let expires = Utc::now() + self.inner.config.transfer.retry_lockout();
            self.inner
                .transfers
                .update_state(transfer_id, |t| {
                    t.transition(FileTransferState::RetryLimitExceeded)?;
                    t.retry_limit = retry_limit;
                    t.retry_lockout_expires = Some(expires);
                    t.error_message = Some(format!(
                        "{} failed attempts to send {}",
                        retry_limit, t.file_name
                    ));
                    Ok(())
                })
                .await?;

            info!(
                event = "retry_limit_exceeded",
                file_transfer_id = transfer_id,
                retry_limit,
                lockout_expires = %expires,
                "transfer locked out"
            );
            self.send_request(
                transfer.remote_address(),
                RequestType::RetryLimitExceeded,
                Payload::RetryLimitExceeded(RetryLimitNotice {
                    response_code: transfer.response_code,
                    retry_limit,
                    lockout_expires: expires,
                }),
                Some(transfer_id),
                EventKind::SendRetryLimitExceededStarted,
                EventKind::SendRetryLimitExceededComplete,
            )
            .await?;
            return Ok(());
        }

        self.inner
            .transfers
            .update_state(transfer_id, |t| {
                if !t.state().is_retryable() {
                    return Err(Error::InvalidState(format!(
                        "transfer {} cannot be retried while {}",
                        t.id,
                        t.state()
                    )));
                }
                t.retry_counter += 1;
                t.retry_limit = retry_limit;
                t.reset_transfer_values();
                t.transition(FileTransferState::Pending).map(|_| ())
            })
            .await?;

        self.send_inbound_file_transfer_request(transfer_id).await
    }

    /// Transfer a response is about, recorded against the request
    async fn correlate(&self, request: &mut ServerRequest) -> Result<u64> {
        let code = request.response_code()?;
        let transfer_id = self.inner.transfers.id_for_code(code).await?;
        let request_id = request.id();
        request.set_file_transfer_id(transfer_id);
        self.inner
            .transfers
            .update(transfer_id, |t| {
                t.request_id = Some(request_id);
                Ok(())
            })
            .await?;
        Ok(transfer_id)
    }

    // ---------------------------------------------------------------------
    // File lists, server info, shutdown
    // ---------------------------------------------------------------------

    async fn handle_file_list_request(&self, request: &ServerRequest) -> Result<()> {
        let remote = remote_of(request)?;
        let requested = request.folder_path()?.to_string();
        self.emit_request(
            request,
            EventKind::ReceivedFileListRequest {
                folder: requested.clone(),
            },
        );

        let folder = if requested.is_empty() {
            self.inner.config.transfer_folder.clone()
        } else {
            PathBuf::from(&requested)
        };

        if !tokio::fs::metadata(&folder).await.is_ok_and(|m| m.is_dir()) {
            self.send_request(
                remote,
                RequestType::RequestedFolderDoesNotExist,
                Payload::Empty,
                None,
                EventKind::SendNotificationFolderDoesNotExistStarted,
                EventKind::SendNotificationFolderDoesNotExistComplete,
            )
            .await?;
            return Ok(());
        }

        let files = list_files(&folder).await?;
        if files.is_empty() {
            self.send_request(
                remote,
                RequestType::NoFilesAvailableForDownload,
                Payload::Empty,
                None,
                EventKind::SendNotificationNoFilesToDownloadStarted,
                EventKind::SendNotificationNoFilesToDownloadComplete,
            )
            .await?;
            return Ok(());
        }

        let separators = &self.inner.config.file_list;
        let file_count = files.len();
        self.send_request(
            remote,
            RequestType::FileListResponse,
            Payload::FileList(crate::protocol::FileListResponse {
                folder: folder.to_string_lossy().into_owned(),
                files,
                field_separator: separators.field_separator,
                record_separator: separators.record_separator,
            }),
            None,
            EventKind::SendFileListStarted { file_count },
            EventKind::SendFileListComplete,
        )
        .await
        .map(|_| ())
    }

    fn handle_file_list_response(&self, request: &ServerRequest) -> Result<()> {
        let remote = remote_of(request)?;
        let list = request.file_list()?.clone();
        self.store_remote_file_list(
            remote,
            RemoteFileList {
                folder: list.folder.clone(),
                files: list.files.clone(),
                received_at: Utc::now(),
            },
        );
        self.emit_request(
            request,
            EventKind::ReceivedFileList {
                folder: list.folder,
                files: list.files,
            },
        );
        Ok(())
    }

    async fn handle_server_info_request(&self, request: &ServerRequest) -> Result<()> {
        let remote = remote_of(request)?;
        self.emit_request(request, EventKind::ReceivedServerInfoRequest);

        let me = self.my_info()?;
        self.send_request(
            remote,
            RequestType::ServerInfoResponse,
            Payload::ServerInfo(ServerInfoResponse {
                name: me.name,
                local_ip: me.local_ip,
                public_ip: me.public_ip,
                platform: me.platform,
                transfer_folder: me.transfer_folder,
            }),
            None,
            EventKind::SendServerInfoStarted,
            EventKind::SendServerInfoComplete,
        )
        .await
        .map(|_| ())
    }

    fn handle_server_info_response(&self, request: &ServerRequest) -> Result<()> {
        let remote = remote_of(request)?;
        let response = request.server_info()?.clone();

        let mut info = ServerInfo {
            name: response.name,
            local_ip: response.local_ip,
            public_ip: response.public_ip,
            session_ip: remote.ip(),
            port: remote.port(),
            platform: response.platform,
            transfer_folder: response.transfer_folder,
        };
        info.select_session_ip(self.network_range().as_ref());

        self.store_remote_server(remote, info.clone());
        self.emit_request(request, EventKind::ReceivedServerInfo { info });
        Ok(())
    }

    fn handle_shutdown_command(&self, request: &ServerRequest) -> Result<()> {
        let sender = remote_of(request)?;
        self.emit_request(request, EventKind::ReceivedShutdownServerCommand);

        if !self.my_info()?.matches_endpoint(sender) {
            return Err(Error::InvalidState(format!(
                "ignoring shutdown command from {}",
                sender
            )));
        }

        self.begin_shutdown();
        Ok(())
    }
}

/// Regular files directly inside `folder`, sorted by name
async fn list_files(folder: &Path) -> Result<FileInfoList> {
    let mut entries = tokio::fs::read_dir(folder).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() {
            files.push(FileInfo::new(
                entry.path().to_string_lossy().into_owned(),
                metadata.len(),
            ));
        }
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(FileInfoList::new(files))
}
