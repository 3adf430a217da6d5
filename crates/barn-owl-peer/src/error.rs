//! Error types for peer operations
//!
//! NIST 800-53: SI-11 (Error Handling)
//! Implementation: Errors are grouped by how the engine reacts to them:
//! transport errors fail one operation, protocol errors fail one exchange,
//! consistency errors indicate corrupted bookkeeping and are never swallowed.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::protocol::RequestType;
use crate::transfer::FileTransferState;

/// Result type alias for peer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which step of a request exchange failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Connect,
    Send,
    Receive,
}

impl std::fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestPhase::Connect => write!(f, "connect"),
            RequestPhase::Send => write!(f, "send"),
            RequestPhase::Receive => write!(f, "receive"),
        }
    }
}

/// Peer error types
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    ///
    /// NIST 800-53: SI-11
    /// Implementation: Local file system failures (open, read, write)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A socket read or write did not finish within its timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The remote end closed the connection (zero-byte read)
    #[error("Peer closed connection: {0}")]
    PeerClosed(String),

    /// Any other socket failure
    #[error("Socket error: {0}")]
    Socket(String),

    /// Malformed frame or payload
    ///
    /// NIST 800-53: SI-10 (Information Input Validation)
    #[error("Failed to decode {field}: {reason}")]
    Decode {
        field: &'static str,
        reason: String,
    },

    /// Request type discriminator outside the known set
    #[error("Unknown request type: {0}")]
    UnknownRequestType(u8),

    /// A typed accessor or builder was used against a request of another type
    #[error("Expected {expected} request, found {actual}")]
    WrongRequestType {
        expected: &'static str,
        actual: RequestType,
    },

    /// The connection of a request was already handed off or closed
    #[error("Connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// A request exchange failed in the given phase
    #[error("Request {phase} failed: {source}")]
    RequestFailed {
        phase: RequestPhase,
        #[source]
        source: Box<Error>,
    },

    /// Duplicate or ambiguous id / response code lookup
    ///
    /// NIST 800-53: SI-7 (Software, Firmware, and Information Integrity)
    /// Implementation: Signals corrupted engine bookkeeping; always surfaced
    #[error("Consistency violation: {0}")]
    Consistency(String),

    /// Referenced request or transfer does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Rejected file transfer state transition
    #[error("Invalid file transfer transition from {from} to {to}")]
    InvalidTransition {
        from: FileTransferState,
        to: FileTransferState,
    },

    /// Another handler is running
    #[error("Server is busy processing another request")]
    Busy,

    /// No queued inbound file transfer request
    #[error("No pending file transfer requests")]
    QueueEmpty,

    /// Host entry point used before `initialize`
    #[error("Server has not been initialized")]
    NotInitialized,

    /// Retry refused while the retry lockout is active
    #[error("Retry limit exceeded, locked out until {expires}")]
    RetryLockout { expires: DateTime<Utc> },

    /// Operation aborted by a cancellation signal
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error
    ///
    /// NIST 800-53: CM-6 (Configuration Settings)
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Check if error is recoverable
    ///
    /// # Returns
    ///
    /// `true` if only the current operation failed and the engine may carry on
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::PeerClosed(_) | Error::Socket(_) | Error::Cancelled => true,
            Error::RequestFailed { source, .. } => source.is_recoverable(),
            _ => false,
        }
    }

    /// Check if error comes from bytes received off the wire
    pub fn is_protocol_error(&self) -> bool {
        match self {
            Error::Decode { .. }
            | Error::UnknownRequestType(_)
            | Error::WrongRequestType { .. } => true,
            Error::RequestFailed { source, .. } => source.is_protocol_error(),
            _ => false,
        }
    }

    /// Check if error signals corrupted engine bookkeeping
    pub fn is_consistency_error(&self) -> bool {
        matches!(self, Error::Consistency(_))
    }
}

// Additional error constructors and helpers
impl Error {
    /// Create decode error for a named field
    pub fn decode(field: &'static str, reason: impl Into<String>) -> Self {
        Error::Decode {
            field,
            reason: reason.into(),
        }
    }

    /// Create timeout error with context
    pub fn timeout(context: impl Into<String>) -> Self {
        Error::Timeout(context.into())
    }

    /// Create peer closed error with context
    pub fn peer_closed(context: impl Into<String>) -> Self {
        Error::PeerClosed(context.into())
    }

    /// Map a socket-level I/O error into the transport taxonomy
    pub fn socket(context: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => {
                Error::Timeout(format!("{}: {}", context, err))
            }
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Error::PeerClosed(format!("{}: {}", context, err)),
            _ => Error::Socket(format!("{}: {}", context, err)),
        }
    }

    /// Tag an error with the request phase it happened in
    pub fn in_phase(self, phase: RequestPhase) -> Self {
        match self {
            Error::RequestFailed { .. } => self,
            other => Error::RequestFailed {
                phase,
                source: Box::new(other),
            },
        }
    }
}
