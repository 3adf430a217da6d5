//! Configuration for a barn-owl peer
//!
//! NIST 800-53: CM-6 (Configuration Settings)
//! Implementation: Plain serde structures with defaults; loading and saving
//! is left to the host.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

/// Peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Name announced to remote peers
    #[serde(default = "default_name")]
    pub name: String,

    /// Folder incoming files are written to and file lists are served from
    #[serde(default = "default_transfer_folder")]
    pub transfer_folder: PathBuf,

    /// Address the listening socket binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Listening port (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Socket settings
    #[serde(default)]
    pub socket: SocketConfig,

    /// File transfer settings
    #[serde(default)]
    pub transfer: TransferConfig,

    /// File list wire format
    #[serde(default)]
    pub file_list: FileListConfig,
}

/// Socket settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Size of each socket read and file chunk in bytes
    pub buffer_size: usize,
    /// Pending connection backlog of the listening socket
    pub listen_backlog: u32,
    /// Timeout applied to each individual socket operation, in milliseconds
    pub timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            listen_backlog: 5,
            timeout_ms: 5000,
        }
    }
}

impl SocketConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// File transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Minimum time between two progress events of one transfer
    pub update_interval_ms: u64,
    /// An in-flight transfer without progress for this long is stalled
    pub stall_timeout_ms: u64,
    /// How often the stall watchdog scans the transfer table
    pub watchdog_interval_ms: u64,
    /// Retries granted to a remote peer before the lockout starts
    pub retry_limit: u32,
    /// Lockout duration after the retry limit is exhausted, in seconds
    pub retry_lockout_secs: u64,
    /// Attempts at opening the destination file before giving up
    pub file_open_attempts: u32,
    /// Delay between two attempts at opening the destination file
    pub file_open_retry_delay_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 250,
            stall_timeout_ms: 3000,
            watchdog_interval_ms: 1000,
            retry_limit: 3,
            retry_lockout_secs: 600,
            file_open_attempts: 10,
            file_open_retry_delay_ms: 100,
        }
    }
}

impl TransferConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn retry_lockout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.retry_lockout_secs).unwrap_or(i64::MAX))
    }

    pub fn file_open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.file_open_retry_delay_ms)
    }
}

/// Separators of the file list encoding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileListConfig {
    pub field_separator: char,
    pub record_separator: char,
}

impl Default for FileListConfig {
    fn default() -> Self {
        Self {
            field_separator: '*',
            record_separator: '|',
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            transfer_folder: default_transfer_folder(),
            bind_address: default_bind_address(),
            port: default_port(),
            socket: SocketConfig::default(),
            transfer: TransferConfig::default(),
            file_list: FileListConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.socket.buffer_size == 0 {
            return Err(crate::Error::Config(
                "socket.buffer_size must be greater than zero".to_string(),
            ));
        }

        if self.socket.timeout_ms == 0 {
            return Err(crate::Error::Config(
                "socket.timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.transfer.file_open_attempts == 0 {
            return Err(crate::Error::Config(
                "transfer.file_open_attempts must be at least 1".to_string(),
            ));
        }

        if self.transfer.stall_timeout_ms <= self.transfer.update_interval_ms {
            return Err(crate::Error::Config(format!(
                "transfer.stall_timeout_ms ({}) must exceed transfer.update_interval_ms ({})",
                self.transfer.stall_timeout_ms, self.transfer.update_interval_ms
            )));
        }

        // A paused peer must be reported stalled before the pump's read times out
        if self.transfer.stall_timeout_ms >= self.socket.timeout_ms {
            return Err(crate::Error::Config(format!(
                "transfer.stall_timeout_ms ({}) must be below socket.timeout_ms ({})",
                self.transfer.stall_timeout_ms, self.socket.timeout_ms
            )));
        }

        if self.file_list.field_separator == self.file_list.record_separator {
            return Err(crate::Error::Config(
                "file_list separators must differ".to_string(),
            ));
        }

        if self.transfer_folder.exists() && !self.transfer_folder.is_dir() {
            return Err(crate::Error::Config(format!(
                "Transfer folder is not a directory: {:?}",
                self.transfer_folder
            )));
        }

        Ok(())
    }
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "barn-owl".to_string())
}

fn default_transfer_folder() -> PathBuf {
    PathBuf::from("/var/lib/barn-owl/transfer")
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    45600
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.socket.buffer_size, 1024);
        assert_eq!(config.socket.listen_backlog, 5);
        assert_eq!(config.socket.timeout(), Duration::from_secs(5));
        assert_eq!(config.transfer.retry_limit, 3);
        assert_eq!(config.file_list.field_separator, '*');
        assert_eq!(config.file_list.record_separator, '|');
    }

    #[test]
    fn test_validate_rejects_equal_separators() {
        let mut config = Config::default();
        config.file_list.record_separator = '*';
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_stall_below_update_interval() {
        let mut config = Config::default();
        config.transfer.stall_timeout_ms = 100;
        config.transfer.update_interval_ms = 250;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_stall_above_socket_timeout() {
        let mut config = Config::default();
        config.transfer.stall_timeout_ms = 6000;
        config.socket.timeout_ms = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_deserialize_uses_defaults() {
        let json = r#"{ "name": "loft", "port": 0, "socket": { "buffer_size": 8192 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.name, "loft");
        assert_eq!(config.port, 0);
        assert_eq!(config.socket.buffer_size, 8192);
        assert_eq!(config.socket.timeout_ms, 5000);
        assert_eq!(config.transfer.retry_lockout_secs, 600);
    }
}
