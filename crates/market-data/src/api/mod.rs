//! HTTP read API over [`PriceOracle`](crate::oracle::PriceOracle)
//!
//! - `handlers` - Axum handlers and shared state
//! - `models` - Query parameters and error body
//! - `routes` - Router

pub mod handlers;
pub mod models;
pub mod routes;

pub use handlers::{ApiError, OracleApiState};
pub use routes::oracle_routes;
