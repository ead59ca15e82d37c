//! Server configuration
//!
//! Bind settings for the oracle's HTTP listener.

use crate::error::{Result, ServerError};
use std::net::SocketAddr;

/// Default port assignments
pub mod ports {
    /// Oracle read API and health endpoints
    pub const ORACLE_HTTP: u16 = 8087;
    /// Prometheus scrape endpoint, when enabled
    pub const METRICS: u16 = 9090;
}

/// Bind configuration for the HTTP server
///
/// # Example
///
/// ```
/// use server::config::ServerConfig;
///
/// let config = ServerConfig::http_only("127.0.0.1", 8087);
/// assert_eq!(config.http_addr().unwrap().unwrap().port(), 8087);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// `None` disables the HTTP listener
    pub http_port: Option<u16>,
}

impl ServerConfig {
    pub fn http_only(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            http_port: Some(port),
        }
    }

    /// Configuration without any listener
    pub fn disabled(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            http_port: None,
        }
    }

    pub fn http_addr(&self) -> Option<Result<SocketAddr>> {
        self.http_port.map(|p| self.parse_addr(p))
    }

    pub fn has_servers(&self) -> bool {
        self.http_port.is_some()
    }

    fn parse_addr(&self, port: u16) -> Result<SocketAddr> {
        format!("{}:{}", self.host, port)
            .parse()
            .map_err(|_| ServerError::InvalidAddress(format!("{}:{}", self.host, port)))
    }
}

impl From<&::config::ServerSection> for ServerConfig {
    fn from(section: &::config::ServerSection) -> Self {
        Self::http_only(section.host.clone(), section.http_port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::http_only("0.0.0.0", ports::ORACLE_HTTP)
    }
}
