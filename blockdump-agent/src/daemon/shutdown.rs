//! Graceful shutdown on SIGTERM and SIGINT.
//!
//! A signal cancels every tracked operation. Operations stop admitting
//! extents, let running transfers finish and record a partial run.

use crate::executor::tracker::OperationTracker;
use tokio::signal;
use tracing::{error, info};

pub struct ShutdownCoordinator {
    tracker: OperationTracker,
}

impl ShutdownCoordinator {
    pub fn new(tracker: OperationTracker) -> Self {
        Self { tracker }
    }

    /// Wait for SIGINT or SIGTERM, then cancel all tracked operations.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), cancelling running operations...");
            }
            _ = terminate => {
                info!("Received SIGTERM, cancelling running operations...");
            }
        }

        self.trigger().await;
    }

    /// Cancel every tracked operation. Returns how many were cancelled.
    pub async fn trigger(&self) -> usize {
        let cancelled = self.tracker.cancel_all().await;
        info!(operations = cancelled, "Shutdown requested");
        cancelled
    }
}
