//! Stall watchdog
//!
//! Transfers never time themselves out. The watchdog periodically looks for
//! inbound transfers that stopped making progress and reports them through
//! [`Server::notify_file_transfer_stalled`], exactly as a host would.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::server::Server;

/// Periodic scan for stalled inbound transfers
#[derive(Debug, Clone)]
pub struct StallWatchdog {
    server: Server,
    scan_interval: Duration,
    stall_timeout: Duration,
}

impl StallWatchdog {
    /// Watchdog using the cadence and threshold of the engine configuration
    pub fn new(server: Server) -> Self {
        let transfer = &server.config().transfer;
        let scan_interval = transfer.watchdog_interval();
        let stall_timeout = transfer.stall_timeout();
        Self {
            server,
            scan_interval,
            stall_timeout,
        }
    }

    pub fn with_timing(mut self, scan_interval: Duration, stall_timeout: Duration) -> Self {
        self.scan_interval = scan_interval;
        self.stall_timeout = stall_timeout;
        self
    }

    /// Report every stalled transfer once. Returns how many were reported.
    pub async fn scan_once(&self) -> usize {
        let mut reported = 0;
        for transfer_id in self.server.inner.transfers.stalled(self.stall_timeout).await {
            match self.server.notify_file_transfer_stalled(transfer_id).await {
                Ok(()) => reported += 1,
                Err(e) => warn!(
                    event = "stall_notification_failed",
                    file_transfer_id = transfer_id,
                    error = %e
                ),
            }
        }
        reported
    }

    /// Run until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.scan_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(event = "stall_watchdog_stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let reported = self.scan_once().await;
                    if reported > 0 {
                        debug!(event = "stall_watchdog_scan", reported);
                    }
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
