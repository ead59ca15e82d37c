//! Axum route definitions for the oracle read API

use axum::routing::get;
use axum::Router;
use std::sync::Arc;

use crate::api::handlers::{self, OracleApiState};

/// Create all oracle routes
///
/// # Routes
///
/// - `GET /api/v1/oracle/price` - Latest consensus price
/// - `GET /api/v1/oracle/volatility?window_days=&methodology=` - Volatility estimate
/// - `GET /api/v1/oracle/premium?option_type=&strike=&expiry=` - Option premium quote
/// - `GET /api/v1/oracle/sources` - Per-source health
pub fn oracle_routes(state: Arc<OracleApiState>) -> Router {
    Router::new()
        .route("/api/v1/oracle/price", get(handlers::get_price))
        .route("/api/v1/oracle/volatility", get(handlers::get_volatility))
        .route("/api/v1/oracle/premium", get(handlers::get_premium))
        .route("/api/v1/oracle/sources", get(handlers::get_sources))
        .with_state(state)
}
