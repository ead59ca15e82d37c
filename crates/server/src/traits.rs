//! Server lifecycle traits
//!
//! [`Server`] is what a listener implements; [`ServerExt`] adds spawning and
//! signal handling on top of it.

use async_trait::async_trait;
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// A long-running listener with graceful shutdown
///
/// Implemented by [`HttpServer`](crate::http::HttpServer).
#[async_trait]
pub trait Server: Send + Sync + 'static {
    /// Name for logging and identification
    fn name(&self) -> &str;

    /// Bound address while running
    fn address(&self) -> Option<SocketAddr>;

    fn is_running(&self) -> bool;

    /// Bind, serve until `shutdown` is cancelled, then drain open
    /// connections and return `Ok(())`
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails or the listener hits a fatal error.
    async fn run(&self, shutdown: CancellationToken) -> Result<()>;
}

/// Convenience methods available on every [`Server`]
pub trait ServerExt: Server + Sized {
    /// Run on a new task; cancel the returned token to stop it
    fn spawn(self) -> (tokio::task::JoinHandle<Result<()>>, CancellationToken) {
        let token = CancellationToken::new();
        let token_clone = token.clone();
        let handle = tokio::spawn(async move { self.run(token_clone).await });
        (handle, token)
    }

    /// Run until Ctrl+C or SIGTERM
    fn run_with_signals(self) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            let shutdown = crate::shutdown::ShutdownController::with_signals();
            self.run(shutdown.token()).await
        }
    }
}

impl<T: Server + Sized> ServerExt for T {}
