use crate::*;
use std::collections::HashSet;
use thiserror::Error;

/// Smallest lookback the history must always be able to serve
pub const MIN_LOOKBACK_DAYS: u32 = 360;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Oracle name is required")]
    MissingOracleName,

    #[error("Asset symbol is required")]
    MissingAsset,

    #[error("No sources defined")]
    NoSources,

    #[error("Source '{name}': {message}")]
    InvalidSource { name: String, message: String },

    #[error("Duplicate provider_id '{0}'")]
    DuplicateSource(String),

    #[error("{enabled} enabled sources but min_sources is {required}")]
    NotEnoughSources { enabled: usize, required: usize },

    #[error("Aggregation: {message}")]
    InvalidAggregation { message: String },

    #[error("Circuit breaker: {message}")]
    InvalidCircuitBreaker { message: String },

    #[error("Reliability: {message}")]
    InvalidReliability { message: String },

    #[error("Volatility: {message}")]
    InvalidVolatility { message: String },

    #[error("Scheduler: {message}")]
    InvalidScheduler { message: String },

    #[error("Invalid time format '{time}': expected HH:MM")]
    InvalidTimeFormat { time: String },

    #[error("Premium: {message}")]
    InvalidPremium { message: String },

    #[error("Storage: {message}")]
    InvalidStorage { message: String },

    #[error("Monitoring: {message}")]
    InvalidMonitoring { message: String },

    #[error("{field} must be a positive integer")]
    InvalidPositiveInteger { field: String },

    #[error("{field} must be a positive float")]
    InvalidPositiveFloat { field: String },

    #[error("Environment variable placeholder left unresolved in '{field}'")]
    UnresolvedEnvVar { field: String },
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DefaultApplied {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub defaults_applied: Vec<DefaultApplied>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            defaults_applied: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationWarning {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_default(&mut self, field: &str, value: &str) {
        self.defaults_applied.push(DefaultApplied {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_config(config: &OracleConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    validate_oracle(&config.oracle, &mut report);
    validate_sources(config, &mut report);
    validate_aggregation(&config.aggregation, &mut report);
    validate_circuit_breaker(&config.circuit_breaker, &mut report);
    validate_reliability(&config.reliability, &mut report);
    validate_volatility(&config.volatility, &mut report);
    validate_scheduler(&config.scheduler, &mut report);
    validate_premium(&config.premium, &config.volatility, &mut report);
    validate_storage(&config.storage, &config.volatility, &mut report);
    validate_monitoring(&config.monitoring, &mut report);

    report
}

fn validate_oracle(oracle: &OracleSection, report: &mut ValidationReport) {
    if oracle.name.trim().is_empty() {
        report.add_error(ValidationError::MissingOracleName);
    }
    if oracle.asset.trim().is_empty() {
        report.add_error(ValidationError::MissingAsset);
    }
}

fn validate_sources(config: &OracleConfig, report: &mut ValidationReport) {
    if config.sources.is_empty() {
        report.add_error(ValidationError::NoSources);
        return;
    }

    let mut seen = HashSet::new();
    for source in &config.sources {
        if !seen.insert(source.provider_id.as_str()) {
            report.add_error(ValidationError::DuplicateSource(source.provider_id.clone()));
        }
        validate_source(source, report);
    }

    let enabled = config.enabled_sources().count();
    if enabled < config.aggregation.min_sources {
        report.add_error(ValidationError::NotEnoughSources {
            enabled,
            required: config.aggregation.min_sources,
        });
    }
    if enabled == 1 {
        report.add_warning(
            "sources",
            "Only one source is enabled; consensus cannot reject a bad price",
        );
    }
    if !config.enabled_sources().any(|s| s.supports_historical()) {
        report.add_warning(
            "sources",
            "No enabled source provides historical closes; volatility will rely on intraday consensus only",
        );
    }
}

fn source_error(source: &SourceConfig, message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidSource {
        name: source.provider_id.clone(),
        message: message.into(),
    }
}

fn validate_source(source: &SourceConfig, report: &mut ValidationReport) {
    if source.provider_id.trim().is_empty() {
        report.add_error(ValidationError::InvalidSource {
            name: "unknown".to_string(),
            message: "provider_id is required".to_string(),
        });
    }

    if !(source.weight_prior.is_finite() && source.weight_prior > 0.0) {
        report.add_error(source_error(source, "weight_prior must be positive"));
    }

    match source.kind {
        SourceKind::Static => match source.static_price {
            Some(p) if p.is_finite() && p > 0.0 => {}
            _ => report.add_error(source_error(source, "static_price must be positive")),
        },
        SourceKind::Http => {
            if has_unresolved_env_vars(&source.base_url) {
                report.add_error(ValidationError::UnresolvedEnvVar {
                    field: format!("sources.{}.base_url", source.provider_id),
                });
            } else if url::Url::parse(&source.base_url).is_err() {
                report.add_error(source_error(
                    source,
                    format!("base_url '{}' is not a valid URL", source.base_url),
                ));
            }

            if source.spot_path.is_empty() {
                report.add_error(source_error(source, "spot_path is required"));
            }

            if source.schema == SchemaKind::JsonPointer {
                match source.price_pointer.as_deref() {
                    Some(p) if p.starts_with('/') => {}
                    _ => report.add_error(source_error(
                        source,
                        "json_pointer schema requires price_pointer starting with '/'",
                    )),
                }
                if source.historical_path.is_some() {
                    report.add_warning(
                        &format!("sources.{}.historical_path", source.provider_id),
                        "json_pointer schema has no historical parser; historical_path ignored",
                    );
                }
            }

            if source.schema == SchemaKind::Kraken && source.pair.is_none() {
                report.add_default(&format!("sources.{}.pair", source.provider_id), "first pair in response");
            }

            if matches!(source.schema, SchemaKind::Coinbase | SchemaKind::Bitstamp)
                && source.historical_path.is_some()
            {
                report.add_warning(
                    &format!("sources.{}.historical_path", source.provider_id),
                    "schema has no historical parser; historical_path ignored",
                );
            }
        }
    }

    if source.rate_limit_cooldown_secs == Some(0) {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: format!("sources.{}.rate_limit_cooldown_secs", source.provider_id),
        });
    }
}

fn validate_aggregation(agg: &AggregationConfig, report: &mut ValidationReport) {
    if agg.staleness_threshold_secs == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "aggregation.staleness_threshold_secs".to_string(),
        });
    }
    if !(agg.outlier_deviation_multiple.is_finite() && agg.outlier_deviation_multiple > 0.0) {
        report.add_error(ValidationError::InvalidPositiveFloat {
            field: "aggregation.outlier_deviation_multiple".to_string(),
        });
    }
    if agg.min_sources == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "aggregation.min_sources".to_string(),
        });
    }
    if !(agg.min_deviation_fraction >= 0.0 && agg.min_deviation_fraction < 1.0) {
        report.add_error(ValidationError::InvalidAggregation {
            message: "min_deviation_fraction must be in [0, 1)".to_string(),
        });
    }
    if agg.rolling_window < 2 {
        report.add_error(ValidationError::InvalidAggregation {
            message: "rolling_window must be at least 2".to_string(),
        });
    }
}

fn validate_circuit_breaker(cb: &CircuitBreakerConfig, report: &mut ValidationReport) {
    if cb.failure_threshold == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "circuit_breaker.failure_threshold".to_string(),
        });
    }
    if cb.cooldown_secs == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "circuit_breaker.cooldown_secs".to_string(),
        });
    }
    if cb.max_cooldown_secs < cb.cooldown_secs {
        report.add_error(ValidationError::InvalidCircuitBreaker {
            message: "max_cooldown_secs must be >= cooldown_secs".to_string(),
        });
    }
    if cb.rate_limit_cooldown_secs == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "circuit_breaker.rate_limit_cooldown_secs".to_string(),
        });
    }
    if cb.request_timeout_secs == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "circuit_breaker.request_timeout_secs".to_string(),
        });
    }
}

fn validate_reliability(rel: &ReliabilityConfig, report: &mut ValidationReport) {
    if rel.window_size == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "reliability.window_size".to_string(),
        });
    }
    if !(rel.smoothing > 0.0 && rel.smoothing <= 1.0) {
        report.add_error(ValidationError::InvalidReliability {
            message: "smoothing must be in (0, 1]".to_string(),
        });
    }
    if !(rel.weight_floor > 0.0 && rel.weight_floor <= rel.weight_ceiling) {
        report.add_error(ValidationError::InvalidReliability {
            message: "weights must satisfy 0 < weight_floor <= weight_ceiling".to_string(),
        });
    }
    if rel.latency_reference_ms == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "reliability.latency_reference_ms".to_string(),
        });
    }
    if !(rel.deviation_scale.is_finite() && rel.deviation_scale > 0.0) {
        report.add_error(ValidationError::InvalidPositiveFloat {
            field: "reliability.deviation_scale".to_string(),
        });
    }
}

fn validate_volatility(vol: &VolatilityConfig, report: &mut ValidationReport) {
    if vol.windows.is_empty() {
        report.add_error(ValidationError::InvalidVolatility {
            message: "at least one window is required".to_string(),
        });
    }
    for window in &vol.windows {
        if *window < 2 {
            report.add_error(ValidationError::InvalidVolatility {
                message: format!("window {} is shorter than 2 days", window),
            });
        }
    }
    if vol.methodologies.is_empty() {
        report.add_error(ValidationError::InvalidVolatility {
            message: "at least one methodology is required".to_string(),
        });
    }
    if !(vol.ewma_lambda > 0.0 && vol.ewma_lambda < 1.0) {
        report.add_error(ValidationError::InvalidVolatility {
            message: "ewma_lambda must be in (0, 1)".to_string(),
        });
    }
    if !(vol.annualization_days.is_finite() && vol.annualization_days > 0.0) {
        report.add_error(ValidationError::InvalidPositiveFloat {
            field: "volatility.annualization_days".to_string(),
        });
    }
    if !(vol.min_coverage > 0.0 && vol.min_coverage <= 1.0) {
        report.add_error(ValidationError::InvalidVolatility {
            message: "min_coverage must be in (0, 1]".to_string(),
        });
    }
}

fn validate_scheduler(sched: &SchedulerConfig, report: &mut ValidationReport) {
    if sched.min_spot_interval_secs == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "scheduler.min_spot_interval_secs".to_string(),
        });
    }
    if !(sched.min_spot_interval_secs <= sched.spot_interval_secs
        && sched.spot_interval_secs <= sched.max_spot_interval_secs)
    {
        report.add_error(ValidationError::InvalidScheduler {
            message: "intervals must satisfy min <= spot_interval <= max".to_string(),
        });
    }
    if !(sched.speedup_factor > 0.0 && sched.speedup_factor < 1.0) {
        report.add_error(ValidationError::InvalidScheduler {
            message: "speedup_factor must be in (0, 1)".to_string(),
        });
    }
    if sched.slowdown_factor <= 1.0 {
        report.add_error(ValidationError::InvalidScheduler {
            message: "slowdown_factor must be greater than 1".to_string(),
        });
    }
    if !(sched.calm_ratio > 0.0 && sched.calm_ratio < sched.turbulence_ratio) {
        report.add_error(ValidationError::InvalidScheduler {
            message: "ratios must satisfy 0 < calm_ratio < turbulence_ratio".to_string(),
        });
    }
    if sched.trailing_len == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "scheduler.trailing_len".to_string(),
        });
    }
    if sched.daily_close_time().is_none() {
        report.add_error(ValidationError::InvalidTimeFormat {
            time: sched.daily_close_time_utc.clone(),
        });
    }
    if sched.snapshot_interval_secs == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "scheduler.snapshot_interval_secs".to_string(),
        });
    }
}

fn validate_premium(premium: &PremiumConfig, vol: &VolatilityConfig, report: &mut ValidationReport) {
    if !premium.risk_free_rate.is_finite() {
        report.add_error(ValidationError::InvalidPremium {
            message: "risk_free_rate must be a finite number".to_string(),
        });
    } else if !(-0.05..=0.25).contains(&premium.risk_free_rate) {
        report.add_warning(
            "premium.risk_free_rate",
            "risk_free_rate outside [-5%, 25%]; check that it is expressed as a decimal",
        );
    }
    if !vol.windows.contains(&premium.volatility_window_days) {
        report.add_error(ValidationError::InvalidPremium {
            message: format!(
                "volatility_window_days {} is not one of the configured windows",
                premium.volatility_window_days
            ),
        });
    }
    if !vol.methodologies.contains(&premium.methodology) {
        report.add_error(ValidationError::InvalidPremium {
            message: format!("methodology {} is not enabled", premium.methodology),
        });
    }
    if !(premium.day_count.is_finite() && premium.day_count > 0.0) {
        report.add_error(ValidationError::InvalidPositiveFloat {
            field: "premium.day_count".to_string(),
        });
    }
}

fn validate_storage(storage: &StorageConfig, vol: &VolatilityConfig, report: &mut ValidationReport) {
    if storage.data_dir.trim().is_empty() {
        report.add_error(ValidationError::InvalidStorage {
            message: "data_dir is required".to_string(),
        });
    }
    if storage.full_fidelity_days == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "storage.full_fidelity_days".to_string(),
        });
    }
    if storage.full_fidelity_days >= storage.daily_granularity_days {
        report.add_error(ValidationError::InvalidStorage {
            message: "full_fidelity_days must be less than daily_granularity_days".to_string(),
        });
    }
    let required = vol.longest_window().unwrap_or(0).max(MIN_LOOKBACK_DAYS);
    if storage.min_retention_days < required {
        report.add_error(ValidationError::InvalidStorage {
            message: format!(
                "min_retention_days {} must cover at least {} days",
                storage.min_retention_days, required
            ),
        });
    }
}

fn validate_monitoring(monitoring: &MonitoringConfig, report: &mut ValidationReport) {
    let valid = ["pretty", "json", "compact"];
    if !valid.contains(&monitoring.log_format.to_lowercase().as_str()) {
        report.add_error(ValidationError::InvalidMonitoring {
            message: format!(
                "log_format '{}' must be one of: pretty, json, compact",
                monitoring.log_format
            ),
        });
    }
    if monitoring.metrics_port == Some(0) {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "monitoring.metrics_port".to_string(),
        });
    }
}
