//! # Barn Owl Peer
//!
//! Symmetric peer-to-peer file transfer and messaging engine.
//!
//! Two peers run the same engine and talk over TCP with one length-prefixed
//! frame per connection. Either side can:
//!
//! - Send text messages
//! - Push a file to the other peer, or pull one from it
//! - List the files in a remote folder
//! - Ask for the remote server's identity and platform
//!
//! ## Features
//!
//! - Async/await with Tokio
//! - Request queue with one handler running at a time
//! - File transfer state machine with stall detection, bounded retry and
//!   a lockout once the retry limit is reached
//! - Structured event log with live subscriptions

pub mod config;
pub mod error;
pub mod event;
pub mod framing;
mod handlers;
pub mod protocol;
pub mod request;
pub mod server;
pub mod text;
pub mod transfer;
pub mod watchdog;

pub use config::Config;
pub use error::{Error, RequestPhase, Result};
pub use event::{EventHandler, EventKind, EventStream, LogLevel, ServerEvent};
pub use protocol::{Payload, Request, RequestType};
pub use request::{RequestDirection, RequestStatus, RequestSummary};
pub use server::{EngineMode, NetworkIdentity, RemoteFileList, Server};
pub use text::{MessageAuthor, TextMessage, TextSession};
pub use transfer::{FileTransfer, FileTransferState, TransferDirection, TransferInitiator};
pub use watchdog::StallWatchdog;
