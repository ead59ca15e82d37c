use chrono::NaiveTime;
use common::Methodology;
use serde::{Deserialize, Serialize};

pub mod defaults;
pub mod parser;
pub mod substitution;
pub mod validator;

pub use defaults::*;
pub use parser::*;
pub use substitution::*;
pub use validator::*;

/// Root of the YAML configuration file
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OracleConfig {
    pub oracle: OracleSection,
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
    #[serde(default)]
    pub volatility: VolatilityConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub premium: PremiumConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl OracleConfig {
    /// Sources that take part in polling, in configured priority order
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OracleSection {
    pub name: String,
    #[serde(default = "default_asset")]
    pub asset: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Http,
    /// Fixed price, for local runs and tests
    Static,
}

/// Known response layouts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaKind {
    Coingecko,
    Coinbase,
    Kraken,
    Binance,
    Bitstamp,
    /// Spot price located by `price_pointer`
    #[default]
    JsonPointer,
}

/// One market-data provider
///
/// Order in the `sources` list is the fallback priority order, both for
/// spot/historical fetches and for breaking same-day close ties.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub provider_id: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub spot_path: String,
    #[serde(default)]
    pub historical_path: Option<String>,
    #[serde(default = "default_weight_prior")]
    pub weight_prior: f64,
    #[serde(default = "default_schema_version")]
    pub response_schema_version: u32,
    #[serde(default)]
    pub schema: SchemaKind,
    /// JSON pointer to the spot price for `json_pointer` schemas
    #[serde(default)]
    pub price_pointer: Option<String>,
    /// Pair key for schemas keyed by pair (kraken)
    #[serde(default)]
    pub pair: Option<String>,
    #[serde(default)]
    pub static_price: Option<f64>,
    /// Cooldown after a rate-limit response, overrides the global default
    #[serde(default)]
    pub rate_limit_cooldown_secs: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl SourceConfig {
    pub fn supports_historical(&self) -> bool {
        self.kind == SourceKind::Http && self.historical_path.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AggregationConfig {
    #[serde(default = "default_staleness_threshold_secs")]
    pub staleness_threshold_secs: u64,
    #[serde(default = "default_outlier_deviation_multiple")]
    pub outlier_deviation_multiple: f64,
    #[serde(default = "default_min_sources")]
    pub min_sources: usize,
    /// Floor for the dispersion estimate, as a fraction of the median
    #[serde(default = "default_min_deviation_fraction")]
    pub min_deviation_fraction: f64,
    /// Number of recent consensus prices kept for the rolling deviation
    #[serde(default = "default_rolling_window")]
    pub rolling_window: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: default_staleness_threshold_secs(),
            outlier_deviation_multiple: default_outlier_deviation_multiple(),
            min_sources: default_min_sources(),
            min_deviation_fraction: default_min_deviation_fraction(),
            rolling_window: default_rolling_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
    #[serde(default = "default_rate_limit_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReliabilityConfig {
    /// Number of recent fetch outcomes per source
    #[serde(default = "default_reliability_window")]
    pub window_size: usize,
    /// Weight given to the newest score in the exponential average
    #[serde(default = "default_reliability_smoothing")]
    pub smoothing: f64,
    #[serde(default = "default_weight_floor")]
    pub weight_floor: f64,
    #[serde(default = "default_weight_ceiling")]
    pub weight_ceiling: f64,
    /// p90 latency at which the latency factor halves
    #[serde(default = "default_latency_reference_ms")]
    pub latency_reference_ms: u64,
    /// Relative deviation at which the deviation factor falls to 1/e
    #[serde(default = "default_deviation_scale")]
    pub deviation_scale: f64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            window_size: default_reliability_window(),
            smoothing: default_reliability_smoothing(),
            weight_floor: default_weight_floor(),
            weight_ceiling: default_weight_ceiling(),
            latency_reference_ms: default_latency_reference_ms(),
            deviation_scale: default_deviation_scale(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VolatilityConfig {
    #[serde(default = "default_volatility_windows")]
    pub windows: Vec<u32>,
    #[serde(default = "default_methodologies")]
    pub methodologies: Vec<Methodology>,
    #[serde(default = "default_ewma_lambda")]
    pub ewma_lambda: f64,
    #[serde(default = "default_annualization_days")]
    pub annualization_days: f64,
    /// Fraction of the window that must be populated
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,
}

impl VolatilityConfig {
    pub fn shortest_window(&self) -> Option<u32> {
        self.windows.iter().copied().min()
    }

    pub fn longest_window(&self) -> Option<u32> {
        self.windows.iter().copied().max()
    }
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            windows: default_volatility_windows(),
            methodologies: default_methodologies(),
            ewma_lambda: default_ewma_lambda(),
            annualization_days: default_annualization_days(),
            min_coverage: default_min_coverage(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_spot_interval_secs")]
    pub spot_interval_secs: u64,
    #[serde(default = "default_min_spot_interval_secs")]
    pub min_spot_interval_secs: u64,
    #[serde(default = "default_max_spot_interval_secs")]
    pub max_spot_interval_secs: u64,
    /// Short-window vol above `trailing_avg * turbulence_ratio` speeds polling up
    #[serde(default = "default_turbulence_ratio")]
    pub turbulence_ratio: f64,
    /// Short-window vol below `trailing_avg * calm_ratio` slows polling down
    #[serde(default = "default_calm_ratio")]
    pub calm_ratio: f64,
    #[serde(default = "default_speedup_factor")]
    pub speedup_factor: f64,
    #[serde(default = "default_slowdown_factor")]
    pub slowdown_factor: f64,
    /// Number of short-window estimates in the trailing average
    #[serde(default = "default_trailing_len")]
    pub trailing_len: usize,
    #[serde(default = "default_daily_close_time_utc")]
    pub daily_close_time_utc: String,
    #[serde(default = "default_backfill_days")]
    pub backfill_days: u32,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl SchedulerConfig {
    pub fn daily_close_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(&self.daily_close_time_utc, "%H:%M").ok()
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            spot_interval_secs: default_spot_interval_secs(),
            min_spot_interval_secs: default_min_spot_interval_secs(),
            max_spot_interval_secs: default_max_spot_interval_secs(),
            turbulence_ratio: default_turbulence_ratio(),
            calm_ratio: default_calm_ratio(),
            speedup_factor: default_speedup_factor(),
            slowdown_factor: default_slowdown_factor(),
            trailing_len: default_trailing_len(),
            daily_close_time_utc: default_daily_close_time_utc(),
            backfill_days: default_backfill_days(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PremiumConfig {
    #[serde(default)]
    pub risk_free_rate: f64,
    #[serde(default = "default_premium_window")]
    pub volatility_window_days: u32,
    #[serde(default = "default_premium_methodology")]
    pub methodology: Methodology,
    /// Days per year when converting an expiry timestamp to years
    #[serde(default = "default_day_count")]
    pub day_count: f64,
}

impl Default for PremiumConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.0,
            volatility_window_days: default_premium_window(),
            methodology: default_premium_methodology(),
            day_count: default_day_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_full_fidelity_days")]
    pub full_fidelity_days: u32,
    #[serde(default = "default_daily_granularity_days")]
    pub daily_granularity_days: u32,
    #[serde(default = "default_min_retention_days")]
    pub min_retention_days: u32,
    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            full_fidelity_days: default_full_fidelity_days(),
            daily_granularity_days: default_daily_granularity_days(),
            min_retention_days: default_min_retention_days(),
            audit_retention_days: default_audit_retention_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}
