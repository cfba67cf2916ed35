//! Shutdown signals to cooperative cancellation.
//!
//! ```text
//! SIGTERM / SIGINT (Ctrl-C on Windows)
//!    │
//!    ▼
//! CancellationToken::cancel()
//!    │
//!    ├─► WorkflowEngine: stops before the next step, records FAILED
//!    └─► AvailabilityMonitor: stops before the next poll
//! ```
//!
//! Nothing is interrupted mid-action; a session finishes the page action it
//! is performing before it notices the token.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;

/// Which signal ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
}

/// Wait for the first shutdown signal.
///
/// # Errors
///
/// Returns an error if the signal handlers cannot be registered.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, cancelling sessions");
                Ok(ShutdownSignal::Terminate)
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, cancelling sessions");
                Ok(ShutdownSignal::Interrupt)
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, cancelling sessions");
        Ok(ShutdownSignal::Interrupt)
    }
}

/// Cancel `token` when `trigger` completes, unless the token is cancelled
/// first.
pub fn cancel_when<F>(token: CancellationToken, trigger: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            () = trigger => token.cancel(),
        }
    })
}

/// Cancel `token` on SIGINT or SIGTERM.
///
/// Returns the watcher task; it ends on its own once the token is cancelled
/// from anywhere.
pub fn cancel_on_shutdown(token: CancellationToken) -> JoinHandle<()> {
    cancel_when(token, async {
        if let Err(e) = wait_for_shutdown().await {
            warn!("Signal handlers unavailable, shutdown only via cancellation: {}", e);
            std::future::pending::<()>().await;
        }
    })
}
