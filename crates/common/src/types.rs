//! Common types used across the oracle
//!
//! Every record here describes an observation at a point in time. Records are
//! never mutated after creation: a newer observation is a new value with a
//! later timestamp.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a configured market-data provider (e.g. `coingecko`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// What a source is asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Current spot price
    Spot,
    /// Daily closing price series
    Historical,
}

/// A single spot observation from one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub source_id: SourceId,
    pub price: f64,
    pub observed_at: DateTime<Utc>,
    /// Round-trip time of the fetch that produced this point
    pub fetch_latency_ms: u64,
}

impl PricePoint {
    pub fn new(
        source_id: SourceId,
        price: f64,
        observed_at: DateTime<Utc>,
        fetch_latency_ms: u64,
    ) -> Self {
        Self {
            source_id,
            price,
            observed_at,
            fetch_latency_ms,
        }
    }

    /// Age of the observation relative to `now`, zero if observed in the future
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.observed_at).max(chrono::Duration::zero())
    }
}

/// Accepted (or candidate) closing price for one calendar day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalClose {
    pub date: NaiveDate,
    pub asset: String,
    pub price: f64,
    /// Intraday high, when the source or the intraday tier provides it
    #[serde(default)]
    pub high: Option<f64>,
    /// Intraday low, when the source or the intraday tier provides it
    #[serde(default)]
    pub low: Option<f64>,
    pub source_id: SourceId,
    pub stored_at: DateTime<Utc>,
}

impl HistoricalClose {
    pub fn new(
        date: NaiveDate,
        asset: impl Into<String>,
        price: f64,
        source_id: SourceId,
        stored_at: DateTime<Utc>,
    ) -> Self {
        Self {
            date,
            asset: asset.into(),
            price,
            high: None,
            low: None,
            source_id,
            stored_at,
        }
    }

    /// Attach an intraday range to a freshly built close
    pub fn with_range(mut self, high: f64, low: f64) -> Self {
        self.high = Some(high);
        self.low = Some(low);
        self
    }

    /// Intraday (high, low) if both are known
    pub fn range(&self) -> Option<(f64, f64)> {
        match (self.high, self.low) {
            (Some(h), Some(l)) => Some((h, l)),
            _ => None,
        }
    }
}

/// Volatility estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Methodology {
    /// Sample standard deviation of daily log returns
    LogReturn,
    /// High/low range estimator
    Parkinson,
    /// Exponentially weighted squared log returns
    Ewma,
}

impl Methodology {
    pub const ALL: [Methodology; 3] = [
        Methodology::LogReturn,
        Methodology::Parkinson,
        Methodology::Ewma,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Methodology::LogReturn => "log_return",
            Methodology::Parkinson => "parkinson",
            Methodology::Ewma => "ewma",
        }
    }

    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "log_return" | "logreturn" | "stddev" => Some(Self::LogReturn),
            "parkinson" => Some(Self::Parkinson),
            "ewma" => Some(Self::Ewma),
            _ => None,
        }
    }
}

impl std::fmt::Display for Methodology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Methodology {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown volatility methodology: {}", s))
    }
}

/// Circuit breaker state of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are short-circuited until the cooldown elapses
    Open,
    /// One trial call is allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health record for one configured source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub source_id: SourceId,
    pub weight: f64,
    pub consecutive_failures: u32,
    pub circuit_state: CircuitState,
    pub last_success_at: Option<DateTime<Utc>>,
    /// Relative deviation from consensus at the last contribution
    pub last_deviation: Option<f64>,
}

impl SourceHealth {
    pub fn new(source_id: SourceId, weight: f64) -> Self {
        Self {
            source_id,
            weight,
            consecutive_failures: 0,
            circuit_state: CircuitState::Closed,
            last_success_at: None,
            last_deviation: None,
        }
    }
}
