//! Values produced by the pipeline

use chrono::{DateTime, Utc};
use common::{Methodology, SourceId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Option type (Call or Put)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "call" | "c" => Some(Self::Call),
            "put" | "p" => Some(Self::Put),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "call",
            OptionType::Put => "put",
        }
    }
}

impl std::str::FromStr for OptionType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown option type: {} (expected call or put)", s))
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs for Black-Scholes pricing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BSInputs {
    /// Spot price of the underlying
    pub spot: f64,
    pub strike: f64,
    /// Time to expiry in years
    pub time: f64,
    /// Annualized volatility as a decimal (0.5 = 50%)
    pub vol: f64,
    /// Continuously compounded risk-free rate
    pub rate: f64,
    pub option_type: OptionType,
}

/// Option Greeks
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    /// Delta: ∂V/∂S
    pub delta: f64,
    /// Gamma: ∂²V/∂S²
    pub gamma: f64,
    /// Vega: ∂V/∂σ
    pub vega: f64,
    /// Theta: ∂V/∂t, per year
    pub theta: f64,
    /// Rho: ∂V/∂r
    pub rho: f64,
}

/// Consensus spot price of one aggregation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusPrice {
    pub price: f64,
    /// Non-outlier weight over total configured weight, in `[0, 1]`
    pub confidence: f64,
    pub contributing_sources: BTreeSet<SourceId>,
    /// Sources whose point was excluded as an outlier
    #[serde(default)]
    pub outliers: Vec<SourceId>,
    pub computed_at: DateTime<Utc>,
}

/// Annualized volatility over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityEstimate {
    pub window_days: u32,
    pub methodology: Methodology,
    /// Estimator actually applied; Parkinson falls back to log returns when
    /// a close in the window has no intraday range
    pub effective_methodology: Methodology,
    /// `None` marks an under-populated window (insufficient data)
    pub value: Option<f64>,
    pub computed_at: DateTime<Utc>,
    pub sample_count: usize,
}

impl VolatilityEstimate {
    pub fn insufficient_data(&self) -> bool {
        self.value.is_none()
    }
}

/// Derived option premium; recomputable from its inputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PremiumQuote {
    pub underlying_price: f64,
    pub strike: f64,
    pub time_to_expiry_years: f64,
    pub risk_free_rate: f64,
    pub volatility_used: VolatilityEstimate,
    pub option_type: OptionType,
    pub premium: f64,
    pub intrinsic_value: f64,
    pub greeks: Greeks,
    pub computed_at: DateTime<Utc>,
}
