//! Request exchanges
//!
//! A `ServerRequest` drives one exchange: either receiving and classifying a
//! single frame from an accepted connection, or connecting to a peer and
//! sending one. It keeps the decoded request, any bytes read past the frame,
//! and the connection itself until a file transfer takes it over.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::error::{Error, RequestPhase, Result};
use crate::event::{EventHub, EventKind, ServerEvent};
use crate::framing::{FrameProgress, FramedConnection};
use crate::protocol::{
    FileListResponse, InboundFileTransfer, OutboundFileTransfer, Payload, Request, RequestType,
    RetryLimitNotice, ServerInfoResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Processed,
}

/// Socket settings of one exchange
#[derive(Debug, Clone, Copy)]
pub struct ExchangeSettings {
    pub buffer_size: usize,
    pub io_timeout: Duration,
}

/// One request exchange
#[derive(Debug)]
pub struct ServerRequest {
    id: u64,
    direction: RequestDirection,
    status: RequestStatus,
    timestamp: DateTime<Utc>,
    request: Option<Request>,
    remote_endpoint: Option<SocketAddr>,
    overflow: Bytes,
    connection: Option<FramedConnection>,
    connection_taken: bool,
    file_transfer_id: Option<u64>,
    settings: ExchangeSettings,
    events: EventHub,
}

impl ServerRequest {
    /// Exchange that will receive a frame from an accepted connection
    pub fn inbound(id: u64, settings: ExchangeSettings, events: EventHub) -> Self {
        Self::new(id, RequestDirection::Inbound, None, settings, events)
    }

    /// Exchange that will send `request` to a peer
    pub fn outbound(
        id: u64,
        request: Request,
        settings: ExchangeSettings,
        events: EventHub,
    ) -> Self {
        Self::new(id, RequestDirection::Outbound, Some(request), settings, events)
    }

    fn new(
        id: u64,
        direction: RequestDirection,
        request: Option<Request>,
        settings: ExchangeSettings,
        events: EventHub,
    ) -> Self {
        Self {
            id,
            direction,
            status: RequestStatus::Pending,
            timestamp: Utc::now(),
            request,
            remote_endpoint: None,
            overflow: Bytes::new(),
            connection: None,
            connection_taken: false,
            file_transfer_id: None,
            settings,
            events,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn direction(&self) -> RequestDirection {
        self.direction
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn request_type(&self) -> Option<RequestType> {
        self.request.as_ref().map(|r| r.request_type)
    }

    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// Listening address of the peer on the other side.
    ///
    /// For inbound requests this is the address the sender announced in the
    /// frame header; an unspecified announced IP is replaced by the IP the
    /// connection actually came from.
    pub fn remote(&self) -> Option<SocketAddr> {
        let request = self.request.as_ref()?;
        match (self.direction, self.remote_endpoint) {
            (RequestDirection::Inbound, Some(endpoint)) if request.sender.ip().is_unspecified() => {
                Some(SocketAddr::new(endpoint.ip(), request.sender.port()))
            }
            (RequestDirection::Outbound, Some(endpoint)) => Some(endpoint),
            _ => Some(request.sender),
        }
    }

    /// Socket endpoint the exchange ran over
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.remote_endpoint
    }

    /// Bytes read past the end of the request frame
    pub fn overflow(&self) -> &Bytes {
        &self.overflow
    }

    pub fn file_transfer_id(&self) -> Option<u64> {
        self.file_transfer_id
    }

    pub fn set_file_transfer_id(&mut self, id: u64) {
        self.file_transfer_id = Some(id);
    }

    /// A request is processed exactly once, after its handler returned
    pub fn mark_processed(&mut self) -> Result<()> {
        if self.status == RequestStatus::Processed {
            return Err(Error::InvalidState(format!(
                "request {} was already processed",
                self.id
            )));
        }
        self.status = RequestStatus::Processed;
        Ok(())
    }

    fn emit(&self, kind: EventKind) {
        let mut event = ServerEvent::new(kind).with_request(self.id);
        if let Some(remote) = self.remote().or(self.remote_endpoint) {
            event = event.with_remote(remote);
        }
        if let Some(transfer_id) = self.file_transfer_id {
            event = event.with_transfer(transfer_id);
        }
        self.events.emit(event);
    }

    /// Receive and decode one frame from an accepted connection
    pub async fn receive(&mut self, stream: TcpStream) -> Result<()> {
        self.receive_inner(stream)
            .await
            .map_err(|e| e.in_phase(RequestPhase::Receive))
    }

    async fn receive_inner(&mut self, stream: TcpStream) -> Result<()> {
        let mut conn = FramedConnection::new(stream, self.settings.buffer_size)?;
        self.remote_endpoint = Some(conn.peer_addr());

        self.emit(EventKind::ReceiveRequestFromRemoteServerStarted);
        self.emit(EventKind::ReceiveRequestLengthStarted);

        let events = self.events.clone();
        let id = self.id;
        let endpoint = conn.peer_addr();
        let mut observer = move |progress: FrameProgress| {
            let kinds: &[EventKind] = &match progress {
                FrameProgress::LengthBytesRead { count } => {
                    vec![EventKind::ReceivedRequestLengthBytesFromSocket {
                        bytes_received: count,
                    }]
                }
                FrameProgress::LengthReceived { length } => vec![
                    EventKind::ReceiveRequestLengthComplete {
                        request_length: length,
                    },
                    EventKind::ReceiveRequestBytesStarted,
                ],
                FrameProgress::PayloadBytesRead {
                    count,
                    total,
                    remaining,
                } => vec![EventKind::ReceivedRequestBytesFromSocket {
                    bytes_received: count,
                    total_received: total,
                    remaining,
                }],
                FrameProgress::OverflowSaved { count } => {
                    vec![EventKind::SaveUnreadBytesAfterAllRequestBytesReceived {
                        unread_bytes: count,
                    }]
                }
            };
            for kind in kinds {
                events.emit(
                    ServerEvent::new(kind.clone())
                        .with_request(id)
                        .with_remote(endpoint),
                );
            }
        };

        let (payload, overflow) = conn
            .receive_frame_observed(self.settings.io_timeout, &mut observer)
            .await?;
        self.emit(EventKind::ReceiveRequestBytesComplete);

        self.emit(EventKind::DetermineRequestTypeStarted);
        let request = Request::decode_payload(&payload)?;
        let request_type = request.request_type;
        self.request = Some(request);
        self.overflow = overflow;
        self.connection = Some(conn);
        self.emit(EventKind::DetermineRequestTypeComplete { request_type });
        self.emit(EventKind::ReceiveRequestFromRemoteServerComplete { request_type });
        Ok(())
    }

    /// Connect to `target`, send the request and close the connection
    pub async fn send(
        &mut self,
        target: SocketAddr,
        start: EventKind,
        complete: EventKind,
    ) -> Result<()> {
        self.send_inner(target, start, complete, false).await
    }

    /// Connect to `target` and send the request, keeping the connection
    /// available through [`ServerRequest::take_connection`]
    pub async fn send_and_keep_open(
        &mut self,
        target: SocketAddr,
        start: EventKind,
        complete: EventKind,
    ) -> Result<()> {
        self.send_inner(target, start, complete, true).await
    }

    async fn send_inner(
        &mut self,
        target: SocketAddr,
        start: EventKind,
        complete: EventKind,
        keep_open: bool,
    ) -> Result<()> {
        let frame = self
            .request
            .as_ref()
            .ok_or_else(|| Error::InvalidState(format!("request {} has nothing to send", self.id)))?
            .encode()?;
        self.remote_endpoint = Some(target);

        self.emit(EventKind::ConnectToRemoteServerStarted);
        let mut conn =
            FramedConnection::connect(target, self.settings.buffer_size, self.settings.io_timeout)
                .await
            .map_err(|e| e.in_phase(RequestPhase::Connect))?;
        self.emit(EventKind::ConnectToRemoteServerComplete);

        self.emit(start);
        conn.send_frame(&frame, self.settings.io_timeout)
            .await
            .map_err(|e| e.in_phase(RequestPhase::Send))?;
        self.emit(complete);

        if keep_open {
            self.connection = Some(conn);
        } else {
            // The frame is already written; a failed close changes nothing for the peer.
            let _ = conn.shutdown().await;
        }
        self.status = RequestStatus::Processed;
        Ok(())
    }

    /// Hand the still-open connection to a file transfer. Only one caller
    /// ever gets it.
    pub fn take_connection(&mut self) -> Result<FramedConnection> {
        if self.connection_taken {
            return Err(Error::ConnectionUnavailable(format!(
                "connection of request {} was already handed off",
                self.id
            )));
        }
        let conn = self.connection.take().ok_or_else(|| {
            Error::ConnectionUnavailable(format!("request {} holds no open connection", self.id))
        })?;
        self.connection_taken = true;
        Ok(conn)
    }

    /// Drop the connection if nobody took it
    pub fn close_connection(&mut self) {
        self.connection = None;
    }

    fn decoded(&self) -> Result<&Request> {
        self.request.as_ref().ok_or_else(|| {
            Error::InvalidState(format!("request {} has not been received", self.id))
        })
    }

    fn wrong(&self, expected: &'static str) -> Error {
        match self.request_type() {
            Some(actual) => Error::WrongRequestType { expected, actual },
            None => Error::InvalidState(format!("request {} has not been received", self.id)),
        }
    }

    pub fn text_message(&self) -> Result<&str> {
        let request = self.decoded()?;
        match (&request.request_type, &request.payload) {
            (RequestType::TextMessage, Payload::Text(text)) => Ok(text),
            _ => Err(self.wrong("TextMessage")),
        }
    }

    pub fn folder_path(&self) -> Result<&str> {
        let request = self.decoded()?;
        match (&request.request_type, &request.payload) {
            (RequestType::FileListRequest, Payload::Text(folder)) => Ok(folder),
            _ => Err(self.wrong("FileListRequest")),
        }
    }

    /// Response code of any request correlated to a transfer by code
    pub fn response_code(&self) -> Result<i64> {
        let request = self.decoded()?;
        match &request.payload {
            Payload::Int64(code) if request.request_type.carries_response_code() => Ok(*code),
            Payload::RetryLimitExceeded(notice) => Ok(notice.response_code),
            Payload::InboundFileTransfer(transfer) => Ok(transfer.response_code),
            _ => Err(self.wrong("response code")),
        }
    }

    /// Our own transfer id, echoed back in `RequestedFileDoesNotExist`
    pub fn remote_transfer_id(&self) -> Result<u64> {
        let request = self.decoded()?;
        match (&request.request_type, &request.payload) {
            (RequestType::RequestedFileDoesNotExist, Payload::Int64(id)) => u64::try_from(*id)
                .map_err(|_| Error::decode("remote_transfer_id", format!("negative id {}", id))),
            _ => Err(self.wrong("RequestedFileDoesNotExist")),
        }
    }

    pub fn inbound_file_transfer(&self) -> Result<&InboundFileTransfer> {
        match &self.decoded()?.payload {
            Payload::InboundFileTransfer(transfer) => Ok(transfer),
            _ => Err(self.wrong("InboundFileTransferRequest")),
        }
    }

    pub fn outbound_file_transfer(&self) -> Result<&OutboundFileTransfer> {
        match &self.decoded()?.payload {
            Payload::OutboundFileTransfer(transfer) => Ok(transfer),
            _ => Err(self.wrong("OutboundFileTransferRequest")),
        }
    }

    pub fn retry_limit_notice(&self) -> Result<&RetryLimitNotice> {
        match &self.decoded()?.payload {
            Payload::RetryLimitExceeded(notice) => Ok(notice),
            _ => Err(self.wrong("RetryLimitExceeded")),
        }
    }

    pub fn file_list(&self) -> Result<&FileListResponse> {
        match &self.decoded()?.payload {
            Payload::FileList(list) => Ok(list),
            _ => Err(self.wrong("FileListResponse")),
        }
    }

    pub fn server_info(&self) -> Result<&ServerInfoResponse> {
        match &self.decoded()?.payload {
            Payload::ServerInfo(info) => Ok(info),
            _ => Err(self.wrong("ServerInfoResponse")),
        }
    }
}

/// Read-only view of a request kept in the request table
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub id: u64,
    pub direction: RequestDirection,
    pub status: RequestStatus,
    pub timestamp: DateTime<Utc>,
    pub request_type: Option<RequestType>,
    pub remote: Option<SocketAddr>,
    pub file_transfer_id: Option<u64>,
}

impl From<&ServerRequest> for RequestSummary {
    fn from(request: &ServerRequest) -> Self {
        Self {
            id: request.id,
            direction: request.direction,
            status: request.status,
            timestamp: request.timestamp,
            request_type: request.request_type(),
            remote: request.remote(),
            file_transfer_id: request.file_transfer_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::build;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn settings() -> ExchangeSettings {
        ExchangeSettings {
            buffer_size: 8,
            io_timeout: Duration::from_secs(2),
        }
    }

    async fn receive_bytes(bytes: Vec<u8>) -> (ServerRequest, EventHub) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let writer = tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&bytes).await.unwrap();
            client
        });
        let (stream, _) = listener.accept().await.unwrap();
        let events = EventHub::new(64);
        let mut request = ServerRequest::inbound(1, settings(), events.clone());
        request.receive(stream).await.unwrap();
        drop(writer.await.unwrap());
        (request, events)
    }

    #[tokio::test]
    async fn test_receive_classifies_and_exposes_typed_fields() {
        let sender: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let frame = build::string(RequestType::TextMessage, sender, "ping").unwrap();
        let (request, events) = receive_bytes(frame.to_vec()).await;

        assert_eq!(request.request_type(), Some(RequestType::TextMessage));
        assert_eq!(request.text_message().unwrap(), "ping");
        assert_eq!(request.remote(), Some(sender));
        assert!(matches!(
            request.response_code(),
            Err(Error::WrongRequestType {
                actual: RequestType::TextMessage,
                ..
            })
        ));

        let kinds: Vec<EventKind> = events.raw().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::ReceiveRequestBytesStarted));
        assert!(kinds.contains(&EventKind::DetermineRequestTypeComplete {
            request_type: RequestType::TextMessage
        }));
    }

    #[tokio::test]
    async fn test_unspecified_sender_ip_uses_endpoint() {
        let sender: SocketAddr = "0.0.0.0:6000".parse().unwrap();
        let frame = build::empty(RequestType::ServerInfoRequest, sender).unwrap();
        let (request, _) = receive_bytes(frame.to_vec()).await;
        assert_eq!(request.remote(), Some("127.0.0.1:6000".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_overflow_and_single_connection_handoff() {
        let sender: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let mut bytes = build::int64(RequestType::FileTransferAccepted, sender, 77)
            .unwrap()
            .to_vec();
        bytes.extend_from_slice(b"xyz");
        let (mut request, _) = receive_bytes(bytes).await;

        assert_eq!(request.response_code().unwrap(), 77);
        assert_eq!(&request.overflow()[..], b"xyz");

        let conn = request.take_connection().unwrap();
        assert_eq!(conn.overflow(), b"xyz");
        assert!(matches!(
            request.take_connection(),
            Err(Error::ConnectionUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_send_reports_connect_phase() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sender: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let request = Request::new(RequestType::ServerInfoRequest, sender, Payload::Empty).unwrap();
        let mut exchange = ServerRequest::outbound(2, request, settings(), EventHub::new(8));
        let err = exchange
            .send(
                addr,
                EventKind::RequestServerInfoStarted,
                EventKind::RequestServerInfoComplete,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::RequestFailed {
                phase: RequestPhase::Connect,
                ..
            }
        ));
    }

    #[test]
    fn test_mark_processed_once() {
        let mut request = ServerRequest::inbound(3, settings(), EventHub::new(4));
        request.mark_processed().unwrap();
        assert!(request.mark_processed().is_err());
    }
}
