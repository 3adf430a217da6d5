use anyhow::{Context, Result};
use barn_owl_core::NetworkRange;
use barn_owl_peer::Config;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Everything the `barn-owl` host reads from its configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Engine configuration
    #[serde(default)]
    pub peer: Config,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Addresses this host announces to other peers
///
/// Unset addresses are detected at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub local_ip: Option<IpAddr>,
    pub public_ip: Option<IpAddr>,
    /// LAN of `local_ip` in CIDR notation, e.g. `192.168.1.0/24`
    pub network_range: Option<NetworkRange>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
///
/// NIST 800-53: AU-9 (Protection of Audit Information)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// `tracing` filter directive
    pub level: String,
    pub format: LogFormat,
    /// Daily rolling log file; stderr when unset
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "barn_owl=info,barn_owl_peer=info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

pub async fn load_config(path: &Path) -> Result<Settings> {
    let contents = fs::read_to_string(path)
        .await
        .context("Failed to read configuration file")?;

    let settings: Settings =
        toml::from_str(&contents).context("Failed to parse configuration file")?;

    settings
        .peer
        .validate()
        .context("Invalid peer configuration")?;

    Ok(settings)
}

/// Load `path` when it exists, defaults otherwise
pub async fn load_or_default(path: &Path) -> Result<Settings> {
    if fs::try_exists(path).await.unwrap_or(false) {
        load_config(path).await
    } else {
        Ok(Settings::default())
    }
}

pub async fn save_config(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let contents =
        toml::to_string_pretty(settings).context("Failed to serialize configuration")?;

    fs::write(path, contents)
        .await
        .context("Failed to write configuration file")?;

    Ok(())
}
