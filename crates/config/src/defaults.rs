use common::Methodology;

pub fn default_enabled() -> bool {
    true
}

pub fn default_asset() -> String {
    "BTC".to_string()
}

pub fn default_weight_prior() -> f64 {
    1.0
}

pub fn default_schema_version() -> u32 {
    1
}

pub fn default_staleness_threshold_secs() -> u64 {
    120
}

pub fn default_outlier_deviation_multiple() -> f64 {
    3.0
}

pub fn default_min_sources() -> usize {
    2
}

pub fn default_min_deviation_fraction() -> f64 {
    0.005
}

pub fn default_rolling_window() -> usize {
    30
}

pub fn default_failure_threshold() -> u32 {
    3
}

pub fn default_cooldown_secs() -> u64 {
    30
}

pub fn default_max_cooldown_secs() -> u64 {
    600
}

pub fn default_rate_limit_cooldown_secs() -> u64 {
    300
}

pub fn default_request_timeout_secs() -> u64 {
    10
}

pub fn default_reliability_window() -> usize {
    50
}

pub fn default_reliability_smoothing() -> f64 {
    0.2
}

pub fn default_weight_floor() -> f64 {
    0.1
}

pub fn default_weight_ceiling() -> f64 {
    2.0
}

pub fn default_latency_reference_ms() -> u64 {
    1000
}

pub fn default_deviation_scale() -> f64 {
    0.01
}

pub fn default_volatility_windows() -> Vec<u32> {
    vec![30, 60, 90, 180, 360]
}

pub fn default_methodologies() -> Vec<Methodology> {
    Methodology::ALL.to_vec()
}

pub fn default_ewma_lambda() -> f64 {
    0.94
}

pub fn default_annualization_days() -> f64 {
    252.0
}

pub fn default_min_coverage() -> f64 {
    1.0
}

pub fn default_spot_interval_secs() -> u64 {
    60
}

pub fn default_min_spot_interval_secs() -> u64 {
    15
}

pub fn default_max_spot_interval_secs() -> u64 {
    300
}

pub fn default_turbulence_ratio() -> f64 {
    1.5
}

pub fn default_calm_ratio() -> f64 {
    0.75
}

pub fn default_speedup_factor() -> f64 {
    0.5
}

pub fn default_slowdown_factor() -> f64 {
    1.5
}

pub fn default_trailing_len() -> usize {
    30
}

pub fn default_daily_close_time_utc() -> String {
    "00:10".to_string()
}

pub fn default_backfill_days() -> u32 {
    365
}

pub fn default_snapshot_interval_secs() -> u64 {
    300
}

pub fn default_premium_window() -> u32 {
    30
}

pub fn default_premium_methodology() -> Methodology {
    Methodology::LogReturn
}

pub fn default_day_count() -> f64 {
    365.25
}

pub fn default_data_dir() -> String {
    "./data".to_string()
}

pub fn default_full_fidelity_days() -> u32 {
    7
}

pub fn default_daily_granularity_days() -> u32 {
    90
}

pub fn default_min_retention_days() -> u32 {
    360
}

pub fn default_audit_retention_days() -> u32 {
    400
}

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub fn default_http_port() -> u16 {
    8087
}

pub fn default_log_format() -> String {
    "pretty".to_string()
}
