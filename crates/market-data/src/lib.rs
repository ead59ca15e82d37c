//! Price pipeline for the premium oracle
//!
//! This crate turns raw market-data responses into a consensus spot price,
//! historical volatility and option premiums.
//!
//! # Core Components
//!
//! - [`sources`] - Source adapters (HTTP/JSON and fixed-price)
//! - [`circuit_breaker`] - Per-source circuit breaker state machine
//! - [`resilience`] - Breakers, cached fallback and historical priority order
//! - [`reliability`] - Per-source reliability weights
//! - [`aggregator`] - Weighted-median consensus with outlier rejection
//! - [`volatility`] - Log-return, Parkinson and EWMA volatility estimators
//! - [`black_scholes`] - Black-Scholes premium engine with Greeks
//! - [`scheduler`] - Adaptive spot cadence and the daily close job
//! - [`oracle`] - Pipeline coordinator and consumer read API
//! - `api` - Axum HTTP API (feature `api`)
//!
//! # Key Invariants
//!
//! - Adapter errors never escape the resilience layer; they shrink the
//!   contributing source set instead
//! - Too few agreeing sources is `InsufficientConsensus`, never a stale or
//!   single-source price
//! - An under-populated volatility window is `InsufficientData`, never a
//!   fabricated value

pub mod aggregator;
pub mod black_scholes;
pub mod circuit_breaker;
pub mod error;
pub mod oracle;
pub mod reliability;
pub mod resilience;
pub mod scheduler;
pub mod sources;
pub mod types;
pub mod volatility;

#[cfg(feature = "api")]
pub mod api;

pub use aggregator::{Aggregator, AggregatorSettings};
pub use black_scholes::PremiumEngine;
pub use circuit_breaker::{Admission, BreakerSettings, CircuitBreaker};
pub use error::{ErrorKind, OracleError, Result, SourceError, SourceErrorKind};
pub use oracle::{DailyCloseReport, PriceOracle};
pub use reliability::{ReliabilitySettings, ReliabilityTracker};
pub use resilience::{ResilienceController, SpotFetch, SpotOutcome};
pub use scheduler::{AdaptivePolicy, Scheduler};
pub use sources::{build_adapters, SharedAdapter, SourceAdapter};
pub use types::{BSInputs, ConsensusPrice, Greeks, OptionType, PremiumQuote, VolatilityEstimate};
pub use volatility::{VolatilityEngine, VolatilitySettings};
