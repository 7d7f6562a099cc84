//! Graceful shutdown on SIGTERM and SIGINT.
//!
//! The coordinator owns a [`CancellationToken`]; the orchestrator loop stops
//! at the next timer boundary once it is cancelled and gives an in-flight poll
//! cycle a grace period to finish.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token observed by long-running tasks
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown without a signal
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM, then cancel the token.
    ///
    /// A handler that cannot be installed is logged and never fires, so the
    /// other signal still works.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
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
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                info!("Shutdown requested");
            }
        }

        self.token.cancel();
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_cancels_token() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.trigger();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(coordinator.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_signal_returns_after_trigger() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();
        tokio::time::timeout(Duration::from_secs(1), coordinator.wait_for_signal())
            .await
            .unwrap();
    }
}
