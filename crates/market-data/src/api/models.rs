//! API request/response models

use serde::{Deserialize, Serialize};

/// Query for `GET /api/v1/oracle/volatility`
///
/// Fields are kept as strings so malformed values produce the API's own
/// `invalid_input` body.
#[derive(Debug, Default, Deserialize)]
pub struct VolatilityParams {
    pub window_days: Option<String>,
    pub methodology: Option<String>,
}

/// Query for `GET /api/v1/oracle/premium`
#[derive(Debug, Default, Deserialize)]
pub struct PremiumParams {
    pub option_type: Option<String>,
    pub strike: Option<String>,
    /// RFC 3339 timestamp
    pub expiry: Option<String>,
}

/// Body of every non-2xx response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable code, e.g. `insufficient_consensus`
    pub error: String,
    pub message: String,
    /// The same request may succeed shortly
    pub retryable: bool,
}
