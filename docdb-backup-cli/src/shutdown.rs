//! Cancellation on SIGTERM and SIGINT.
//!
//! A running job polls the coordinator's token between collections and
//! documents, so a signal stops it at the next item. A cancelled zip export
//! is deleted; a directory export is left in place.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token handed to the running job
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGTERM or SIGINT, then cancel the token.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
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
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), stopping after the current item...");
            }
            _ = terminate => {
                info!("Received SIGTERM, stopping after the current item...");
            }
        }

        self.shutdown();
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
