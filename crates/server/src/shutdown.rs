//! Graceful shutdown built on `tokio_util::sync::CancellationToken`
//!
//! One controller owns the root token. The HTTP server and the scheduler each
//! get a child token, so cancelling the root stops both while either can
//! still be stopped on its own.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Coordinates shutdown across the server and the background pipeline
///
/// # Example
///
/// ```ignore
/// let shutdown = ShutdownController::with_signals();
///
/// let scheduler = tokio::spawn(scheduler.run(shutdown.child_token()));
/// http.run(shutdown.child_token()).await?;
/// scheduler.await?;
/// ```
#[derive(Clone)]
pub struct ShutdownController {
    token: CancellationToken,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Controller cancelled on Ctrl+C, and on SIGTERM on Unix
    pub fn with_signals() -> Self {
        let controller = Self::new();
        let token = controller.token.clone();

        tokio::spawn(async move {
            wait_for_signal().await;
            token.cancel();
        });

        controller
    }

    /// Token cancelled with this controller; cancelling it alone leaves the
    /// controller untouched
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        info!("Manual shutdown triggered");
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            return wait_for_ctrl_c().await;
        }
    };

    tokio::select! {
        _ = wait_for_ctrl_c() => {}
        _ = term.recv() => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating graceful shutdown..."),
        Err(e) => {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await
        }
    }
}

/// Run `future` until it completes or `token` is cancelled
///
/// Returns `None` if cancellation came first.
pub async fn run_until_shutdown<F, T>(token: CancellationToken, future: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::select! {
        result = future => Some(result),
        _ = token.cancelled() => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_manual_shutdown_cancels_children() {
        let controller = ShutdownController::new();
        let token = controller.child_token();

        assert!(!controller.is_cancelled());
        controller.shutdown();

        assert!(controller.is_cancelled());
        assert!(token.is_cancelled());
        tokio_test::assert_ready!(tokio_test::task::spawn(controller.wait_for_shutdown()).poll());
    }

    #[tokio::test]
    async fn test_child_token_independence() {
        let controller = ShutdownController::new();
        let server = controller.child_token();
        let scheduler = controller.child_token();

        server.cancel();
        assert!(!scheduler.is_cancelled());
        assert!(!controller.is_cancelled());

        controller.shutdown();
        assert!(scheduler.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let token = CancellationToken::new();
        assert_eq!(run_until_shutdown(token.clone(), async { 42 }).await, Some(42));

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let result = run_until_shutdown(token, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            42
        })
        .await;
        assert_eq!(result, None);
    }
}
