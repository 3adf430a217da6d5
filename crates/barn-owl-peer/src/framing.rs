//! Length-prefixed framing over a TCP stream
//!
//! Reads are issued in `buffer_size` chunks, so one read can return the tail
//! of a frame together with the start of whatever the peer sent next. Those
//! bytes are kept on the connection and handed to the next consumer, whether
//! that is another frame read or a file transfer pump.

use bytes::{Buf, Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::protocol::{LENGTH_PREFIX_SIZE, parse_length_prefix};

/// Progress of a frame read, reported to an observer as it happens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameProgress {
    /// Bytes read while waiting for the length prefix
    LengthBytesRead { count: usize },
    /// Length prefix decoded
    LengthReceived { length: usize },
    /// Bytes read while waiting for the payload
    PayloadBytesRead {
        count: usize,
        total: usize,
        remaining: usize,
    },
    /// Bytes past the frame boundary kept for the next consumer
    OverflowSaved { count: usize },
}

/// A TCP stream carrying barn-owl frames
#[derive(Debug)]
pub struct FramedConnection {
    stream: TcpStream,
    peer: SocketAddr,
    read_buf: Box<[u8]>,
    pending: BytesMut,
}

impl FramedConnection {
    pub fn new(stream: TcpStream, buffer_size: usize) -> Result<Self> {
        let peer = stream
            .peer_addr()
            .map_err(|e| Error::socket("peer address", &e))?;
        Ok(Self {
            stream,
            peer,
            read_buf: vec![0u8; buffer_size.max(1)].into_boxed_slice(),
            pending: BytesMut::new(),
        })
    }

    /// Open a connection to `addr`, bounded by `connect_timeout`
    pub async fn connect(
        addr: SocketAddr,
        buffer_size: usize,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout(format!("connecting to {}", addr)))?
            .map_err(|e| Error::socket(&format!("connecting to {}", addr), &e))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::socket("set_nodelay", &e))?;
        Self::new(stream, buffer_size)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Bytes already read past the last frame boundary
    pub fn overflow(&self) -> &[u8] {
        &self.pending
    }

    /// Remove and return the bytes read past the last frame boundary
    pub fn take_overflow(&mut self) -> Bytes {
        self.pending.split().freeze()
    }

    /// Receive one frame, returning its payload and a copy of any overflow.
    ///
    /// Overflow stays on the connection: the next receive or chunk read
    /// consumes it first.
    pub async fn receive_frame(&mut self, io_timeout: Duration) -> Result<(Bytes, Bytes)> {
        self.receive_frame_observed(io_timeout, &mut |_| {}).await
    }

    pub async fn receive_frame_observed(
        &mut self,
        io_timeout: Duration,
        observer: &mut (dyn FnMut(FrameProgress) + Send),
    ) -> Result<(Bytes, Bytes)> {
        while self.pending.len() < LENGTH_PREFIX_SIZE {
            let count = self.fill(io_timeout, "reading frame length").await?;
            observer(FrameProgress::LengthBytesRead { count });
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.pending[..LENGTH_PREFIX_SIZE]);
        let length = parse_length_prefix(prefix)?;
        self.pending.advance(LENGTH_PREFIX_SIZE);
        observer(FrameProgress::LengthReceived { length });

        while self.pending.len() < length {
            let count = self.fill(io_timeout, "reading frame payload").await?;
            observer(FrameProgress::PayloadBytesRead {
                count,
                total: self.pending.len().min(length),
                remaining: length.saturating_sub(self.pending.len()),
            });
        }

        let payload = self.pending.split_to(length).freeze();
        let overflow = Bytes::copy_from_slice(&self.pending);
        if !overflow.is_empty() {
            observer(FrameProgress::OverflowSaved {
                count: overflow.len(),
            });
        }

        Ok((payload, overflow))
    }

    /// Send a complete frame (length prefix included)
    pub async fn send_frame(&mut self, frame: &[u8], io_timeout: Duration) -> Result<()> {
        self.write_all_timed(frame, io_timeout, "sending frame")
            .await
    }

    /// Read up to `max` raw bytes, draining saved overflow before the socket
    pub async fn read_chunk(&mut self, max: usize, io_timeout: Duration) -> Result<Bytes> {
        if self.pending.is_empty() {
            self.fill(io_timeout, "reading file bytes").await?;
        }
        let take = self.pending.len().min(max.max(1));
        Ok(self.pending.split_to(take).freeze())
    }

    /// Write raw bytes, each socket write bounded by `io_timeout`
    pub async fn write_chunk(&mut self, data: &[u8], io_timeout: Duration) -> Result<()> {
        self.write_all_timed(data, io_timeout, "writing file bytes")
            .await
    }

    /// Flush and close the write half
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| Error::socket("shutting down connection", &e))
    }

    async fn fill(&mut self, io_timeout: Duration, context: &str) -> Result<usize> {
        let count = timeout(io_timeout, self.stream.read(&mut self.read_buf))
            .await
            .map_err(|_| Error::timeout(format!("{} from {}", context, self.peer)))?
            .map_err(|e| Error::socket(context, &e))?;

        if count == 0 {
            return Err(Error::peer_closed(format!("{} from {}", context, self.peer)));
        }

        self.pending.extend_from_slice(&self.read_buf[..count]);
        Ok(count)
    }

    async fn write_all_timed(
        &mut self,
        mut data: &[u8],
        io_timeout: Duration,
        context: &str,
    ) -> Result<()> {
        while !data.is_empty() {
            let written = timeout(io_timeout, self.stream.write(data))
                .await
                .map_err(|_| Error::timeout(format!("{} to {}", context, self.peer)))?
                .map_err(|e| Error::socket(context, &e))?;
            if written == 0 {
                return Err(Error::peer_closed(format!("{} to {}", context, self.peer)));
            }
            data = &data[written..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Payload, Request, RequestType, build};
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    async fn pair(buffer_size: usize) -> (FramedConnection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let framed = FramedConnection::new(accepted.unwrap().0, buffer_size).unwrap();
        (framed, client.unwrap())
    }

    #[tokio::test]
    async fn test_small_buffer_reassembles_frame() {
        let (mut framed, mut client) = pair(3).await;
        let sender: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let frame =
            build::string(RequestType::TextMessage, sender, "hello over tiny reads").unwrap();

        client.write_all(&frame).await.unwrap();

        let mut steps = Vec::new();
        let (payload, overflow) = framed
            .receive_frame_observed(TIMEOUT, &mut |p| steps.push(p))
            .await
            .unwrap();

        assert!(overflow.is_empty());
        assert!(steps.contains(&FrameProgress::LengthReceived {
            length: frame.len() - LENGTH_PREFIX_SIZE
        }));
        let request = Request::decode_payload(&payload).unwrap();
        assert_eq!(request.payload, Payload::Text("hello over tiny reads".into()));
    }

    #[tokio::test]
    async fn test_overflow_is_kept_for_next_consumer() {
        let (mut framed, mut client) = pair(4096).await;
        let sender: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let frame = build::int64(RequestType::FileTransferAccepted, sender, 5).unwrap();

        let mut bytes = frame.to_vec();
        bytes.extend_from_slice(b"0123456789");
        client.write_all(&bytes).await.unwrap();

        let (_, overflow) = framed.receive_frame(TIMEOUT).await.unwrap();
        assert_eq!(&overflow[..], b"0123456789");
        assert_eq!(framed.overflow(), b"0123456789");

        let chunk = framed.read_chunk(4, TIMEOUT).await.unwrap();
        assert_eq!(&chunk[..], b"0123");
        assert_eq!(&framed.take_overflow()[..], b"456789");
        assert!(framed.overflow().is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_before_length() {
        let (mut framed, mut client) = pair(16).await;
        client.write_all(&[0, 0]).await.unwrap();
        drop(client);

        let err = framed.receive_frame(TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::PeerClosed(_)));
    }

    #[tokio::test]
    async fn test_timeout_waiting_for_payload() {
        let (mut framed, mut client) = pair(16).await;
        client.write_all(&[0, 0, 0, 10, 1]).await.unwrap();

        let err = framed
            .receive_frame(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        drop(client);
    }

    #[tokio::test]
    async fn test_connect_refused_is_socket_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = FramedConnection::connect(addr, 1024, TIMEOUT)
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
