//! barn-owl host
//!
//! NIST 800-53: AU-2 (Audit Events), AU-9 (Protection of Audit Information), AU-12 (Audit Generation)
//! Implementation: Runs a peer until interrupted, or starts a short-lived
//! peer to issue one request to a remote peer and report the answer.

mod commands;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingSettings};

#[derive(Parser)]
#[command(name = "barn-owl")]
#[command(about = "Peer-to-peer file transfer and messaging", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/barn-owl/config.toml")]
    config: PathBuf,

    /// Log format, overrides the configuration file
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Log file, overrides the configuration file
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a peer until Ctrl+C, accepting every incoming file transfer
    Serve {
        /// Generate default configuration file
        #[arg(long)]
        init_config: bool,
    },

    /// Send a text message
    SendMessage {
        /// Remote peer address (ip:port)
        remote: SocketAddr,

        message: String,
    },

    /// Push a local file to a remote peer
    SendFile {
        remote: SocketAddr,

        /// Local file to send
        path: PathBuf,

        /// Destination folder on the remote peer (its transfer folder when omitted)
        #[arg(short, long, default_value = "")]
        folder: String,
    },

    /// Download a file from a remote peer
    GetFile {
        remote: SocketAddr,

        /// Path of the file on the remote peer
        remote_path: String,

        /// Local folder to write into (the transfer folder when omitted)
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// File size in bytes, looked up through a file list when omitted
        #[arg(long)]
        size: Option<u64>,
    },

    /// List the files a remote peer offers
    ListFiles {
        remote: SocketAddr,

        /// Remote folder (its transfer folder when omitted)
        #[arg(short, long, default_value = "")]
        folder: String,
    },

    /// Show what a remote peer reports about itself
    ServerInfo { remote: SocketAddr },
}

/// Install the global subscriber. The returned guard must live as long as
/// logging is needed, or buffered file output is lost.
fn init_logging(logging: &LoggingSettings) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.clone()));

    let Some(log_file) = &logging.file else {
        match logging.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(std::io::stderr)
                .init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init(),
        }
        return Ok(None);
    };

    let directory = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = log_file
        .file_name()
        .with_context(|| format!("Log file has no file name: {}", log_file.display()))?;
    std::fs::create_dir_all(directory)
        .with_context(|| format!("Failed to create log directory {}", directory.display()))?;

    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(writer)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(writer)
            .init(),
    }

    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Serve { init_config: true } = cli.command {
        return commands::serve::init_config(&cli.config).await;
    }

    let mut settings = match &cli.command {
        Commands::Serve { .. } => config::load_config(&cli.config)
            .await
            .with_context(|| format!("Failed to load {}", cli.config.display()))?,
        _ => config::load_or_default(&cli.config).await?,
    };

    if let Some(format) = cli.log_format {
        settings.logging.format = format;
    }
    if let Some(file) = cli.log_file {
        settings.logging.file = Some(file);
    }
    if cli.verbose {
        settings.logging.level = "barn_owl=debug,barn_owl_peer=debug".to_string();
    }
    let _log_guard = init_logging(&settings.logging)?;

    match cli.command {
        Commands::Serve { .. } => commands::serve::run(settings).await,
        command => commands::peer::handle(settings, command).await,
    }
}
