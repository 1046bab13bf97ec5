//! Graceful shutdown coordination via `CancellationToken`.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Coordinates shutdown of the listener and background tasks.
///
/// Tasks that must finish before the process exits are handed over with
/// [`track`](Self::track); [`graceful_shutdown`](Self::graceful_shutdown)
/// cancels the token and waits for them.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no tracked tasks.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Signal shutdown without waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for a tracked task during shutdown.
    pub fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Number of tracked tasks not yet drained.
    pub fn tracked(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Cancel the token and wait up to `timeout` for tracked tasks.
    ///
    /// Tasks still running after the timeout are aborted.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        self.shutdown();
        let handles = std::mem::take(&mut *self.tasks.lock());
        info!(task_count = handles.len(), timeout_ms = timeout.as_millis(), "draining tasks");

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

/// Resolve on SIGINT or, on Unix, SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                let _ = sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received ctrl-c"),
        () = terminate => info!("received SIGTERM"),
    }
}
