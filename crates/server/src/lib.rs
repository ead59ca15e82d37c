//! Server infrastructure for the premium oracle
//!
//! An Axum HTTP listener with graceful shutdown, liveness and component
//! health endpoints, and a signal-driven shutdown controller shared with the
//! background pipeline.
//!
//! # Quick Start
//!
//! ```ignore
//! use server::{HttpServer, ServerConfig, ServerExt, ShutdownController};
//!
//! let shutdown = ShutdownController::with_signals();
//! let server = HttpServer::new(ServerConfig::http_only("0.0.0.0", 8080), router);
//! server.run(shutdown.child_token()).await?;
//! ```
//!
//! # Modules
//!
//! - [`config`] - Bind configuration and default ports
//! - [`traits`] - `Server` and `ServerExt` traits
//! - [`http`] - HTTP server using Axum
//! - [`health`] - Liveness and component health endpoints
//! - [`shutdown`] - Graceful shutdown utilities

pub mod config;
pub mod error;
pub mod health;
pub mod http;
pub mod shutdown;
pub mod traits;

pub use self::config::{ports, ServerConfig};
pub use error::{Result, ServerError};
pub use health::{health_routes, ComponentStatus, HealthState};
pub use http::HttpServer;
pub use shutdown::{run_until_shutdown, ShutdownController};
pub use traits::{Server, ServerExt};
