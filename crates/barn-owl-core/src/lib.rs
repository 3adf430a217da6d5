//! # Barn Owl Core
//!
//! Domain types shared by the barn-owl peer engine and its command line host.

pub mod error;
pub mod types;

pub use error::{BarnOwlError, Result};
pub use types::{FileInfo, FileInfoList, NetworkRange, ServerInfo, ServerPlatform};
