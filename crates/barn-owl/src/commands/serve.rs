use anyhow::{Context, Result};
use std::path::Path;
use tracing::{error, info};

use super::Host;
use crate::config::{self, Settings};

pub async fn init_config(config_path: &Path) -> Result<()> {
    let settings = Settings::default();
    config::save_config(config_path, &settings).await?;
    println!("Configuration file created at: {}", config_path.display());
    println!("\nPlease review and edit the configuration before starting the peer.");
    Ok(())
}

/// Run a barn-owl peer until Ctrl+C
///
/// NIST Controls:
/// - CM-6: Configuration Settings (load from config file)
/// - AU-3: Content of Audit Records (log startup events)
/// - SC-7: Boundary Protection (network service initialization)
pub async fn run(settings: Settings) -> Result<()> {
    info!(
        event = "peer_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting barn-owl peer"
    );

    tokio::fs::create_dir_all(&settings.peer.transfer_folder)
        .await
        .with_context(|| {
            format!(
                "Failed to create transfer folder {}",
                settings.peer.transfer_folder.display()
            )
        })?;

    let host = Host::start(settings.peer.clone(), &settings.network).await?;
    let me = host.server.my_info()?;

    info!(
        event = "peer_configuration",
        name = %me.name,
        listen_address = %host.address,
        local_ip = %me.local_ip,
        public_ip = ?me.public_ip,
        transfer_folder = %me.transfer_folder,
        retry_limit = settings.peer.transfer.retry_limit,
        stall_timeout_ms = settings.peer.transfer.stall_timeout_ms,
        "barn-owl peer is running. Press Ctrl+C to stop."
    );

    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                info!(event = "peer_stopping", "Shutting down...");
                break;
            }
            _ = ticker.tick() => {
                // A consistency violation stops the engine on its own
                if host.is_finished() {
                    error!(event = "engine_stopped_unexpectedly");
                    break;
                }
            }
        }
    }

    host.stop().await
}
