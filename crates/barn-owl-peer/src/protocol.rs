//! Barn Owl wire protocol
//!
//! Every request travels as one frame:
//!
//! ```text
//! [u32 payload length, BE][u8 request type][string sender ip][u16 sender port][fields...]
//! ```
//!
//! Strings are a u32 byte length followed by UTF-8. Integers are fixed width,
//! big endian. The sender's address and listening port ride in every payload
//! so the receiver knows where to send its reply.

use barn_owl_core::{FileInfoList, ServerPlatform};
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use crate::error::{Error, Result};

/// Size of the length prefix in front of every frame
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Largest payload accepted from a peer
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Request types
///
/// Names describe the request from the point of view of the peer receiving
/// it: a peer pushing a file sends `InboundFileTransferRequest`, a peer
/// asking for a file sends `OutboundFileTransferRequest`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    TextMessage = 1,
    InboundFileTransferRequest = 2,
    OutboundFileTransferRequest = 3,
    RequestedFileDoesNotExist = 4,
    FileTransferRejected = 5,
    FileTransferAccepted = 6,
    FileTransferStalled = 7,
    FileTransferComplete = 8,
    RetryOutboundFileTransfer = 9,
    RetryLimitExceeded = 10,
    FileListRequest = 11,
    FileListResponse = 12,
    NoFilesAvailableForDownload = 13,
    RequestedFolderDoesNotExist = 14,
    ServerInfoRequest = 15,
    ServerInfoResponse = 16,
    ShutdownServerCommand = 17,
}

impl TryFrom<u8> for RequestType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RequestType::TextMessage),
            2 => Ok(RequestType::InboundFileTransferRequest),
            3 => Ok(RequestType::OutboundFileTransferRequest),
            4 => Ok(RequestType::RequestedFileDoesNotExist),
            5 => Ok(RequestType::FileTransferRejected),
            6 => Ok(RequestType::FileTransferAccepted),
            7 => Ok(RequestType::FileTransferStalled),
            8 => Ok(RequestType::FileTransferComplete),
            9 => Ok(RequestType::RetryOutboundFileTransfer),
            10 => Ok(RequestType::RetryLimitExceeded),
            11 => Ok(RequestType::FileListRequest),
            12 => Ok(RequestType::FileListResponse),
            13 => Ok(RequestType::NoFilesAvailableForDownload),
            14 => Ok(RequestType::RequestedFolderDoesNotExist),
            15 => Ok(RequestType::ServerInfoRequest),
            16 => Ok(RequestType::ServerInfoResponse),
            17 => Ok(RequestType::ShutdownServerCommand),
            _ => Err(Error::UnknownRequestType(value)),
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Payload layout carried by a request type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Empty,
    Text,
    Int64,
    InboundFileTransfer,
    OutboundFileTransfer,
    RetryLimitExceeded,
    FileList,
    ServerInfo,
}

impl RequestType {
    pub fn shape(self) -> PayloadShape {
        match self {
            RequestType::TextMessage | RequestType::FileListRequest => PayloadShape::Text,
            RequestType::InboundFileTransferRequest => PayloadShape::InboundFileTransfer,
            RequestType::OutboundFileTransferRequest => PayloadShape::OutboundFileTransfer,
            RequestType::RequestedFileDoesNotExist
            | RequestType::FileTransferRejected
            | RequestType::FileTransferAccepted
            | RequestType::FileTransferStalled
            | RequestType::FileTransferComplete
            | RequestType::RetryOutboundFileTransfer => PayloadShape::Int64,
            RequestType::RetryLimitExceeded => PayloadShape::RetryLimitExceeded,
            RequestType::FileListResponse => PayloadShape::FileList,
            RequestType::ServerInfoResponse => PayloadShape::ServerInfo,
            RequestType::NoFilesAvailableForDownload
            | RequestType::RequestedFolderDoesNotExist
            | RequestType::ServerInfoRequest
            | RequestType::ShutdownServerCommand => PayloadShape::Empty,
        }
    }

    /// Responses correlated to a file transfer through its response code
    pub fn carries_response_code(self) -> bool {
        matches!(
            self,
            RequestType::FileTransferRejected
                | RequestType::FileTransferAccepted
                | RequestType::FileTransferStalled
                | RequestType::FileTransferComplete
                | RequestType::RetryOutboundFileTransfer
                | RequestType::RetryLimitExceeded
        )
    }
}

/// Fields of an `InboundFileTransferRequest`, sent by the peer holding the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFileTransfer {
    pub response_code: i64,
    /// Transfer id on the receiving peer when it asked for the file, 0 otherwise
    pub remote_transfer_id: u64,
    pub retry_counter: u32,
    pub retry_limit: u32,
    /// Path of the file on the sending peer
    pub file_path: String,
    pub file_size: u64,
    /// Destination folder on the receiving peer
    pub remote_folder: String,
}

impl InboundFileTransfer {
    /// Final component of `file_path`
    pub fn file_name(&self) -> &str {
        self.file_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(self.file_path.as_str())
    }
}

/// Fields of an `OutboundFileTransferRequest`, sent by the peer asking for a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFileTransfer {
    /// Transfer id the requesting peer assigned to the download
    pub remote_transfer_id: u64,
    /// Path of the requested file on the receiving peer
    pub file_path: String,
    /// Folder on the requesting peer the file will be written to
    pub local_folder: String,
}

/// Fields of a `RetryLimitExceeded` notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryLimitNotice {
    pub response_code: i64,
    pub retry_limit: u32,
    pub lockout_expires: DateTime<Utc>,
}

/// Fields of a `FileListResponse`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListResponse {
    pub folder: String,
    pub files: FileInfoList,
    pub field_separator: char,
    pub record_separator: char,
}

/// Fields of a `ServerInfoResponse`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfoResponse {
    pub name: String,
    pub local_ip: IpAddr,
    pub public_ip: Option<IpAddr>,
    pub platform: ServerPlatform,
    pub transfer_folder: String,
}

/// Decoded type-specific fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Empty,
    Text(String),
    Int64(i64),
    InboundFileTransfer(InboundFileTransfer),
    OutboundFileTransfer(OutboundFileTransfer),
    RetryLimitExceeded(RetryLimitNotice),
    FileList(FileListResponse),
    ServerInfo(ServerInfoResponse),
}

impl Payload {
    pub fn shape(&self) -> PayloadShape {
        match self {
            Payload::Empty => PayloadShape::Empty,
            Payload::Text(_) => PayloadShape::Text,
            Payload::Int64(_) => PayloadShape::Int64,
            Payload::InboundFileTransfer(_) => PayloadShape::InboundFileTransfer,
            Payload::OutboundFileTransfer(_) => PayloadShape::OutboundFileTransfer,
            Payload::RetryLimitExceeded(_) => PayloadShape::RetryLimitExceeded,
            Payload::FileList(_) => PayloadShape::FileList,
            Payload::ServerInfo(_) => PayloadShape::ServerInfo,
        }
    }
}

/// One typed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub request_type: RequestType,
    /// Address and listening port of the peer that sent the request
    pub sender: SocketAddr,
    pub payload: Payload,
}

impl Request {
    /// Pair a request type with a payload, rejecting mismatched shapes
    pub fn new(request_type: RequestType, sender: SocketAddr, payload: Payload) -> Result<Self> {
        if request_type.shape() != payload.shape() {
            return Err(Error::WrongRequestType {
                expected: shape_name(payload.shape()),
                actual: request_type,
            });
        }
        Ok(Self {
            request_type,
            sender,
            payload,
        })
    }

    /// Serialize into a complete frame, length prefix included
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(64);
        body.put_u8(self.request_type as u8);
        codec::put_string(&mut body, &self.sender.ip().to_string());
        body.put_u16(self.sender.port());

        match &self.payload {
            Payload::Empty => {}
            Payload::Text(text) => codec::put_string(&mut body, text),
            Payload::Int64(value) => body.put_i64(*value),
            Payload::InboundFileTransfer(t) => {
                body.put_i64(t.response_code);
                body.put_u64(t.remote_transfer_id);
                body.put_u32(t.retry_counter);
                body.put_u32(t.retry_limit);
                codec::put_string(&mut body, &t.file_path);
                body.put_u64(t.file_size);
                codec::put_string(&mut body, &t.remote_folder);
            }
            Payload::OutboundFileTransfer(t) => {
                body.put_u64(t.remote_transfer_id);
                codec::put_string(&mut body, &t.file_path);
                codec::put_string(&mut body, &t.local_folder);
            }
            Payload::RetryLimitExceeded(n) => {
                body.put_i64(n.response_code);
                body.put_u32(n.retry_limit);
                body.put_i64(n.lockout_expires.timestamp_millis());
            }
            Payload::FileList(list) => {
                codec::put_string(&mut body, &list.folder);
                body.put_u32(u32::from(list.field_separator));
                body.put_u32(u32::from(list.record_separator));
                let encoded = list
                    .files
                    .encode(list.field_separator, list.record_separator);
                codec::put_string(&mut body, &encoded);
            }
            Payload::ServerInfo(info) => {
                codec::put_string(&mut body, &info.name);
                codec::put_string(&mut body, &info.local_ip.to_string());
                let public = info.public_ip.map(|ip| ip.to_string()).unwrap_or_default();
                codec::put_string(&mut body, &public);
                codec::put_string(&mut body, info.platform.as_str());
                codec::put_string(&mut body, &info.transfer_folder);
            }
        }

        if body.len() > MAX_FRAME_SIZE {
            return Err(Error::decode(
                "length",
                format!("payload of {} bytes exceeds {}", body.len(), MAX_FRAME_SIZE),
            ));
        }

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body.len());
        frame.put_u32(body.len() as u32);
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }

    /// Decode a payload (the bytes after the length prefix)
    pub fn decode_payload(payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let request_type = RequestType::try_from(codec::get_u8(&mut buf, "request_type")?)?;

        let address = codec::get_string(&mut buf, "sender_address")?;
        let address: IpAddr = address
            .parse()
            .map_err(|e| Error::decode("sender_address", format!("'{}': {}", address, e)))?;
        let port = codec::get_u16(&mut buf, "sender_port")?;

        let payload = match request_type.shape() {
            PayloadShape::Empty => Payload::Empty,
            PayloadShape::Text => Payload::Text(codec::get_string(&mut buf, "text")?),
            PayloadShape::Int64 => Payload::Int64(codec::get_i64(&mut buf, "value")?),
            PayloadShape::InboundFileTransfer => {
                Payload::InboundFileTransfer(InboundFileTransfer {
                    response_code: codec::get_i64(&mut buf, "response_code")?,
                    remote_transfer_id: codec::get_u64(&mut buf, "remote_transfer_id")?,
                    retry_counter: codec::get_u32(&mut buf, "retry_counter")?,
                    retry_limit: codec::get_u32(&mut buf, "retry_limit")?,
                    file_path: codec::get_string(&mut buf, "file_path")?,
                    file_size: codec::get_u64(&mut buf, "file_size")?,
                    remote_folder: codec::get_string(&mut buf, "remote_folder")?,
                })
            }
            PayloadShape::OutboundFileTransfer => {
                Payload::OutboundFileTransfer(OutboundFileTransfer {
                    remote_transfer_id: codec::get_u64(&mut buf, "remote_transfer_id")?,
                    file_path: codec::get_string(&mut buf, "file_path")?,
                    local_folder: codec::get_string(&mut buf, "local_folder")?,
                })
            }
            PayloadShape::RetryLimitExceeded => {
                let response_code = codec::get_i64(&mut buf, "response_code")?;
                let retry_limit = codec::get_u32(&mut buf, "retry_limit")?;
                let millis = codec::get_i64(&mut buf, "lockout_expires")?;
                let lockout_expires = Utc
                    .timestamp_millis_opt(millis)
                    .single()
                    .ok_or_else(|| Error::decode("lockout_expires", "timestamp out of range"))?;
                Payload::RetryLimitExceeded(RetryLimitNotice {
                    response_code,
                    retry_limit,
                    lockout_expires,
                })
            }
            PayloadShape::FileList => {
                let folder = codec::get_string(&mut buf, "folder")?;
                let field_separator = codec::get_char(&mut buf, "field_separator")?;
                let record_separator = codec::get_char(&mut buf, "record_separator")?;
                let encoded = codec::get_string(&mut buf, "file_list")?;
                let files = FileInfoList::decode(&encoded, field_separator, record_separator)
                    .map_err(|e| Error::decode("file_list", e.to_string()))?;
                Payload::FileList(FileListResponse {
                    folder,
                    files,
                    field_separator,
                    record_separator,
                })
            }
            PayloadShape::ServerInfo => {
                let name = codec::get_string(&mut buf, "name")?;
                let local_ip = codec::get_string(&mut buf, "local_ip")?;
                let local_ip: IpAddr = local_ip
                    .parse()
                    .map_err(|e| Error::decode("local_ip", format!("'{}': {}", local_ip, e)))?;
                let public_ip = codec::get_string(&mut buf, "public_ip")?;
                let public_ip = if public_ip.is_empty() {
                    None
                } else {
                    Some(public_ip.parse::<IpAddr>().map_err(|e| {
                        Error::decode("public_ip", format!("'{}': {}", public_ip, e))
                    })?)
                };
                let platform_name = codec::get_string(&mut buf, "platform")?;
                let platform = platform_name.parse::<ServerPlatform>().unwrap_or_else(|e| {
                    debug!(
                        event = "unrecognized_peer_platform",
                        platform = %platform_name,
                        error = %e,
                        "peer platform recorded as unknown"
                    );
                    ServerPlatform::Unknown
                });
                let transfer_folder = codec::get_string(&mut buf, "transfer_folder")?;
                Payload::ServerInfo(ServerInfoResponse {
                    name,
                    local_ip,
                    public_ip,
                    platform,
                    transfer_folder,
                })
            }
        };

        if !buf.is_empty() {
            return Err(Error::decode(
                "payload",
                format!("{} unexpected trailing bytes", buf.len()),
            ));
        }

        Ok(Self {
            request_type,
            sender: SocketAddr::new(address, port),
            payload,
        })
    }
}

/// Parse the length prefix of a frame
pub fn parse_length_prefix(prefix: [u8; LENGTH_PREFIX_SIZE]) -> Result<usize> {
    let length = u32::from_be_bytes(prefix) as usize;
    if length == 0 {
        return Err(Error::decode("length", "empty frame"));
    }
    if length > MAX_FRAME_SIZE {
        return Err(Error::decode(
            "length",
            format!("frame of {} bytes exceeds {}", length, MAX_FRAME_SIZE),
        ));
    }
    Ok(length)
}

/// Decode one frame from the front of `buf`.
///
/// Exactly the declared length is consumed; whatever follows is returned as
/// overflow for the next consumer.
pub fn decode_frame(buf: &[u8]) -> Result<(Request, Bytes)> {
    let prefix: [u8; LENGTH_PREFIX_SIZE] = buf
        .get(..LENGTH_PREFIX_SIZE)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| Error::decode("length", "insufficient data for length prefix"))?;
    let length = parse_length_prefix(prefix)?;

    let end = LENGTH_PREFIX_SIZE + length;
    let payload = buf.get(LENGTH_PREFIX_SIZE..end).ok_or_else(|| {
        Error::decode(
            "payload",
            format!(
                "truncated frame: declared {} bytes, {} available",
                length,
                buf.len() - LENGTH_PREFIX_SIZE
            ),
        )
    })?;

    let request = Request::decode_payload(payload)?;
    Ok((request, Bytes::copy_from_slice(&buf[end..])))
}

fn shape_name(shape: PayloadShape) -> &'static str {
    match shape {
        PayloadShape::Empty => "empty",
        PayloadShape::Text => "string",
        PayloadShape::Int64 => "int64",
        PayloadShape::InboundFileTransfer => "inbound file transfer",
        PayloadShape::OutboundFileTransfer => "outbound file transfer",
        PayloadShape::RetryLimitExceeded => "retry limit exceeded",
        PayloadShape::FileList => "file list",
        PayloadShape::ServerInfo => "server info",
    }
}

/// Frame builders, one per payload shape
pub mod build {
    use super::{
        FileListResponse, InboundFileTransfer, OutboundFileTransfer, Payload, Request,
        RequestType, RetryLimitNotice, ServerInfoResponse,
    };
    use crate::error::Result;
    use barn_owl_core::FileInfoList;
    use bytes::Bytes;
    use std::net::SocketAddr;

    pub fn empty(request_type: RequestType, sender: SocketAddr) -> Result<Bytes> {
        Request::new(request_type, sender, Payload::Empty)?.encode()
    }

    pub fn string(request_type: RequestType, sender: SocketAddr, value: &str) -> Result<Bytes> {
        Request::new(request_type, sender, Payload::Text(value.to_string()))?.encode()
    }

    pub fn int64(request_type: RequestType, sender: SocketAddr, value: i64) -> Result<Bytes> {
        Request::new(request_type, sender, Payload::Int64(value))?.encode()
    }

    pub fn inbound_file_transfer_request(
        sender: SocketAddr,
        transfer: InboundFileTransfer,
    ) -> Result<Bytes> {
        Request::new(
            RequestType::InboundFileTransferRequest,
            sender,
            Payload::InboundFileTransfer(transfer),
        )?
        .encode()
    }

    pub fn outbound_file_transfer_request(
        sender: SocketAddr,
        transfer: OutboundFileTransfer,
    ) -> Result<Bytes> {
        Request::new(
            RequestType::OutboundFileTransferRequest,
            sender,
            Payload::OutboundFileTransfer(transfer),
        )?
        .encode()
    }

    pub fn retry_limit_exceeded(sender: SocketAddr, notice: RetryLimitNotice) -> Result<Bytes> {
        Request::new(
            RequestType::RetryLimitExceeded,
            sender,
            Payload::RetryLimitExceeded(notice),
        )?
        .encode()
    }

    pub fn file_list_response(
        sender: SocketAddr,
        folder: &str,
        files: FileInfoList,
        field_separator: char,
        record_separator: char,
    ) -> Result<Bytes> {
        Request::new(
            RequestType::FileListResponse,
            sender,
            Payload::FileList(FileListResponse {
                folder: folder.to_string(),
                files,
                field_separator,
                record_separator,
            }),
        )?
        .encode()
    }

    pub fn server_info_response(sender: SocketAddr, info: ServerInfoResponse) -> Result<Bytes> {
        Request::new(
            RequestType::ServerInfoResponse,
            sender,
            Payload::ServerInfo(info),
        )?
        .encode()
    }
}

/// Encoding helpers for protocol data types
pub mod codec {
    use crate::error::{Error, Result};
    use bytes::{Buf, BufMut, BytesMut};

    /// Encode a string (u32 length + UTF-8 data)
    pub fn put_string(buf: &mut BytesMut, s: &str) {
        buf.put_u32(s.len() as u32);
        buf.put_slice(s.as_bytes());
    }

    /// Decode a string
    pub fn get_string(buf: &mut &[u8], field: &'static str) -> Result<String> {
        if buf.remaining() < 4 {
            return Err(Error::decode(field, "insufficient data for string length"));
        }

        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(Error::decode(
                field,
                format!("insufficient data for string of {} bytes", len),
            ));
        }

        let bytes = &buf[..len];
        buf.advance(len);

        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::decode(field, format!("invalid UTF-8 string: {}", e)))
    }

    /// Decode a single character stored as its u32 scalar value
    pub fn get_char(buf: &mut &[u8], field: &'static str) -> Result<char> {
        let value = get_u32(buf, field)?;
        char::from_u32(value)
            .ok_or_else(|| Error::decode(field, format!("invalid character {:#x}", value)))
    }

    pub fn get_u8(buf: &mut &[u8], field: &'static str) -> Result<u8> {
        if buf.remaining() < 1 {
            return Err(Error::decode(field, "insufficient data"));
        }
        Ok(buf.get_u8())
    }

    pub fn get_u16(buf: &mut &[u8], field: &'static str) -> Result<u16> {
        if buf.remaining() < 2 {
            return Err(Error::decode(field, "insufficient data"));
        }
        Ok(buf.get_u16())
    }

    pub fn get_u32(buf: &mut &[u8], field: &'static str) -> Result<u32> {
        if buf.remaining() < 4 {
            return Err(Error::decode(field, "insufficient data"));
        }
        Ok(buf.get_u32())
    }

    pub fn get_u64(buf: &mut &[u8], field: &'static str) -> Result<u64> {
        if buf.remaining() < 8 {
            return Err(Error::decode(field, "insufficient data"));
        }
        Ok(buf.get_u64())
    }

    pub fn get_i64(buf: &mut &[u8], field: &'static str) -> Result<i64> {
        if buf.remaining() < 8 {
            return Err(Error::decode(field, "insufficient data"));
        }
        Ok(buf.get_i64())
    }
}
