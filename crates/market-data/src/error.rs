//! Error types for the price pipeline

use common::SourceId;
use std::time::Duration;
use storage::StorageError;
use thiserror::Error;

/// Failure class of a single adapter call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    Network,
    Parse,
    RateLimited,
    Timeout,
}

impl SourceErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceErrorKind::Network => "network",
            SourceErrorKind::Parse => "parse",
            SourceErrorKind::RateLimited => "rate_limited",
            SourceErrorKind::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform adapter error; never escapes the resilience layer
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{provider}: {kind} error: {message}")]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub provider: SourceId,
    pub message: String,
    /// Server-provided wait before the next call, for rate limits
    pub retry_after: Option<Duration>,
}

impl SourceError {
    pub fn new(kind: SourceErrorKind, provider: &SourceId, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.clone(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network(provider: &SourceId, message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Network, provider, message)
    }

    pub fn parse(provider: &SourceId, message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Parse, provider, message)
    }

    pub fn timeout(provider: &SourceId, message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::Timeout, provider, message)
    }

    pub fn rate_limited(provider: &SourceId, retry_after: Option<Duration>) -> Self {
        Self {
            kind: SourceErrorKind::RateLimited,
            provider: provider.clone(),
            message: "rate limited".to_string(),
            retry_after,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == SourceErrorKind::RateLimited
    }
}

/// How a consumer should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No current answer, try again shortly
    Retryable,
    /// The request or configuration is wrong
    Rejected,
}

/// Errors surfaced by the oracle's read API and pipeline
#[derive(Error, Debug)]
pub enum OracleError {
    #[error("Insufficient consensus: {contributing} sources contributed, {required} required")]
    InsufficientConsensus { contributing: usize, required: usize },

    #[error("Insufficient data for {window_days}-day {methodology}: {available} of {required} closes")]
    InsufficientData {
        window_days: u32,
        methodology: String,
        available: usize,
        required: usize,
    },

    /// Stored history is flat, so no premium can be priced from it
    #[error("Zero volatility for {window_days}-day {methodology}")]
    ZeroVolatility { window_days: u32, methodology: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Every source for a capability is open or failed
    #[error("No source available for {0}")]
    Unavailable(String),
}

impl From<StorageError> for OracleError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::DataIntegrity(msg) => OracleError::DataIntegrity(msg),
            other => OracleError::Storage(other),
        }
    }
}

impl OracleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OracleError::InsufficientConsensus { .. }
            | OracleError::InsufficientData { .. }
            | OracleError::ZeroVolatility { .. }
            | OracleError::Storage(_)
            | OracleError::Unavailable(_) => ErrorKind::Retryable,
            OracleError::InvalidInput(_) | OracleError::DataIntegrity(_) => ErrorKind::Rejected,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            OracleError::InsufficientConsensus { .. } => "insufficient_consensus",
            OracleError::InsufficientData { .. } => "insufficient_data",
            OracleError::ZeroVolatility { .. } => "zero_volatility",
            OracleError::InvalidInput(_) => "invalid_input",
            OracleError::DataIntegrity(_) => "data_integrity",
            OracleError::Storage(_) => "storage",
            OracleError::Unavailable(_) => "unavailable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }
}

pub type Result<T> = std::result::Result<T, OracleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let e = OracleError::InsufficientConsensus { contributing: 1, required: 2 };
        assert_eq!(e.kind(), ErrorKind::Retryable);
        assert_eq!(e.code(), "insufficient_consensus");

        let e = OracleError::InvalidInput("strike must be positive".into());
        assert_eq!(e.kind(), ErrorKind::Rejected);
        assert!(!e.is_retryable());

        let e = OracleError::ZeroVolatility { window_days: 30, methodology: "log_return".into() };
        assert!(e.is_retryable());
        assert_eq!(e.code(), "zero_volatility");
    }

    #[test]
    fn test_storage_integrity_maps_to_data_integrity() {
        let e: OracleError = StorageError::DataIntegrity("price 0".into()).into();
        assert_eq!(e.code(), "data_integrity");

        let e: OracleError = StorageError::NotFound("x".into()).into();
        assert_eq!(e.code(), "storage");
    }

    #[test]
    fn test_source_error_display() {
        let e = SourceError::rate_limited(&SourceId::from("coingecko"), Some(Duration::from_secs(60)));
        assert!(e.is_rate_limited());
        assert_eq!(e.to_string(), "coingecko: rate_limited error: rate limited");
    }
}
