//! One-shot client commands
//!
//! Each command starts a short-lived engine on an ephemeral port, since
//! every answer arrives as a request of its own, then issues one request
//! and waits for the answer. The engine talks to no one else, so the first
//! answer of the right type is the one.

use anyhow::{Context, Result, bail};
use barn_owl_peer::{EventKind, FileTransfer, FileTransferState, Server};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{Host, wait_for_event};
use crate::Commands;
use crate::config::Settings;

/// How long to wait for a remote peer to answer
const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn handle(settings: Settings, command: Commands) -> Result<()> {
    let mut config = settings.peer.clone();
    config.port = 0;

    let host = Host::start(config, &settings.network).await?;
    let result = execute(&host.server, command).await;
    let stopped = host.stop().await;

    result?;
    stopped
}

async fn execute(server: &Server, command: Commands) -> Result<()> {
    match command {
        Commands::SendMessage { remote, message } => send_message(server, remote, &message).await,
        Commands::SendFile {
            remote,
            path,
            folder,
        } => send_file(server, remote, &path, &folder).await,
        Commands::GetFile {
            remote,
            remote_path,
            dest,
            size,
        } => get_file(server, remote, &remote_path, dest, size).await,
        Commands::ListFiles { remote, folder } => list_files(server, remote, &folder).await,
        Commands::ServerInfo { remote } => server_info(server, remote).await,
        Commands::Serve { .. } => bail!("serve is not a client command"),
    }
}

async fn send_message(server: &Server, remote: SocketAddr, message: &str) -> Result<()> {
    server
        .send_text_message(remote, message)
        .await
        .with_context(|| format!("Failed to send message to {}", remote))?;
    println!("Message delivered to {}", remote);
    Ok(())
}

async fn send_file(server: &Server, remote: SocketAddr, path: &Path, folder: &str) -> Result<()> {
    let transfer_id = server
        .send_file(remote, path, folder)
        .await
        .with_context(|| format!("Failed to offer {} to {}", path.display(), remote))?;
    println!("Offered {} to {}, waiting for the transfer...", path.display(), remote);

    let transfer = wait_for_transfer(server, transfer_id).await?;
    report_transfer(&transfer)
}

async fn get_file(
    server: &Server,
    remote: SocketAddr,
    remote_path: &str,
    dest: Option<PathBuf>,
    size: Option<u64>,
) -> Result<()> {
    let file_size = match size {
        Some(size) => size,
        None => remote_file_size(server, remote, remote_path).await?,
    };
    let local_folder = dest.unwrap_or_else(|| server.config().transfer_folder.clone());

    let transfer_id = server
        .get_file(remote, remote_path, file_size, &local_folder)
        .await
        .with_context(|| format!("Failed to request {} from {}", remote_path, remote))?;
    println!("Requested {} from {}, waiting for the transfer...", remote_path, remote);

    let transfer = wait_for_transfer(server, transfer_id).await?;
    report_transfer(&transfer)
}

/// Look the file up in a listing of its parent folder
async fn remote_file_size(server: &Server, remote: SocketAddr, remote_path: &str) -> Result<u64> {
    let folder = remote_path
        .rfind(['/', '\\'])
        .map_or("", |index| &remote_path[..index]);

    let mut events = server.subscribe();
    server.request_file_list(remote, folder).await?;
    let answer =
        wait_for_event(&mut events, ANSWER_TIMEOUT, |e| is_file_list_answer(&e.kind)).await?;

    let EventKind::ReceivedFileList { files, .. } = answer.kind else {
        bail!("{} has no files to offer in '{}'", remote, folder);
    };
    files
        .files()
        .iter()
        .find(|f| f.path == remote_path)
        .map(|f| f.size)
        .with_context(|| format!("{} does not offer {}", remote, remote_path))
}

fn is_file_list_answer(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::ReceivedFileList { .. }
            | EventKind::ReceivedNotificationNoFilesToDownload
            | EventKind::ReceivedNotificationFolderDoesNotExist
    )
}

/// Poll the transfer until it ends. A stalled transfer keeps the wait
/// going: the host retries it and the sender decides whether to resend.
async fn wait_for_transfer(server: &Server, transfer_id: u64) -> Result<FileTransfer> {
    let mut idle = Duration::ZERO;
    let mut last_progress = None;
    let poll = Duration::from_millis(100);

    loop {
        let transfer = server.file_transfer(transfer_id).await?;
        if transfer.state().is_terminal() {
            return Ok(transfer);
        }

        let progress = (transfer.state(), transfer.bytes_transferred, transfer.attempt);
        if last_progress == Some(progress) {
            idle += poll;
        } else {
            idle = Duration::ZERO;
            last_progress = Some(progress);
        }
        if idle >= ANSWER_TIMEOUT {
            bail!(
                "Transfer {} made no progress for {}s while {}",
                transfer_id,
                ANSWER_TIMEOUT.as_secs(),
                transfer.state()
            );
        }

        tokio::time::sleep(poll).await;
    }
}

fn report_transfer(transfer: &FileTransfer) -> Result<()> {
    match transfer.state() {
        FileTransferState::Complete => {
            println!(
                "Transferred {} ({} bytes, {:.0} B/s, {} retries)",
                transfer.local_file_path().display(),
                transfer.bytes_transferred,
                transfer.transfer_rate,
                transfer.retry_counter
            );
            Ok(())
        }
        FileTransferState::Rejected => bail!(
            "{} was rejected by {}",
            transfer.file_name,
            transfer.remote_address()
        ),
        FileTransferState::RetryLimitExceeded => match transfer.retry_lockout_expires {
            Some(expires) => bail!(
                "{} exceeded its retry limit of {}, locked out until {}",
                transfer.file_name,
                transfer.retry_limit,
                expires
            ),
            None => bail!("{} exceeded its retry limit", transfer.file_name),
        },
        state => bail!(
            "{} ended in state {}: {}",
            transfer.file_name,
            state,
            transfer.error_message.as_deref().unwrap_or("no details")
        ),
    }
}

async fn list_files(server: &Server, remote: SocketAddr, folder: &str) -> Result<()> {
    let mut events = server.subscribe();
    server
        .request_file_list(remote, folder)
        .await
        .with_context(|| format!("Failed to request the file list of {}", remote))?;

    let answer =
        wait_for_event(&mut events, ANSWER_TIMEOUT, |e| is_file_list_answer(&e.kind)).await?;

    match answer.kind {
        EventKind::ReceivedFileList { folder, files } => {
            println!("\nFiles in {} on {}:\n", folder, remote);
            println!("{:<60} {:>14}", "Path", "Size");
            println!("{}", "-".repeat(75));
            for file in files.files() {
                println!("{:<60} {:>14}", file.path, file.size);
            }
            println!("\n{} files, {} bytes total", files.len(), files.total_size());
        }
        EventKind::ReceivedNotificationNoFilesToDownload => {
            println!("{} has no files to offer.", remote);
        }
        _ => bail!("Folder '{}' does not exist on {}", folder, remote),
    }
    Ok(())
}

async fn server_info(server: &Server, remote: SocketAddr) -> Result<()> {
    let mut events = server.subscribe();
    server
        .request_server_info(remote)
        .await
        .with_context(|| format!("Failed to request server info from {}", remote))?;

    let answer = wait_for_event(&mut events, ANSWER_TIMEOUT, |e| {
        matches!(e.kind, EventKind::ReceivedServerInfo { .. })
    })
    .await?;
    let EventKind::ReceivedServerInfo { info } = answer.kind else {
        bail!("Unexpected answer from {}", remote);
    };

    println!("Name:            {}", info.name);
    println!("Platform:        {}", info.platform.as_str());
    println!("Local address:   {}", info.local_ip);
    match info.public_ip {
        Some(ip) => println!("Public address:  {}", ip),
        None => println!("Public address:  -"),
    }
    println!("Session address: {}", info.session_address());
    println!("Transfer folder: {}", info.transfer_folder);
    Ok(())
}
