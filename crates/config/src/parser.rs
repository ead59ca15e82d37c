use crate::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

#[instrument(skip(path))]
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<OracleConfig> {
    let path = path.as_ref();
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    debug!("Config file content length: {} bytes", content.len());

    parse_config(&content)
}

/// Parse configuration text, substituting environment variables first
pub fn parse_config(content: &str) -> Result<OracleConfig> {
    let substituted = substitution::substitute_env_vars(content)?;
    debug!("Environment variable substitution completed");

    let config: OracleConfig = serde_yaml::from_str(&substituted)
        .with_context(|| "Failed to parse YAML configuration")?;

    info!(sources = config.sources.len(), "Configuration loaded successfully");
    Ok(config)
}

#[instrument]
pub fn generate_default_config() -> OracleConfig {
    OracleConfig {
        oracle: OracleSection {
            name: "BTC Premium Oracle".to_string(),
            asset: default_asset(),
        },
        sources: vec![
            SourceConfig {
                provider_id: "coingecko".to_string(),
                kind: SourceKind::Http,
                base_url: "https://api.coingecko.com/api/v3".to_string(),
                spot_path: "/simple/price?ids=bitcoin&vs_currencies=usd".to_string(),
                historical_path: Some(
                    "/coins/bitcoin/market_chart/range?vs_currency=usd&from={from}&to={to}"
                        .to_string(),
                ),
                weight_prior: 1.0,
                response_schema_version: 1,
                schema: SchemaKind::Coingecko,
                price_pointer: None,
                pair: None,
                static_price: None,
                rate_limit_cooldown_secs: Some(600),
                enabled: true,
            },
            SourceConfig {
                provider_id: "binance".to_string(),
                kind: SourceKind::Http,
                base_url: "https://api.binance.com".to_string(),
                spot_path: "/api/v3/ticker/price?symbol=BTCUSDT".to_string(),
                historical_path: Some(
                    "/api/v3/klines?symbol=BTCUSDT&interval=1d&startTime={from_ms}&endTime={to_ms}"
                        .to_string(),
                ),
                weight_prior: 1.0,
                response_schema_version: 1,
                schema: SchemaKind::Binance,
                price_pointer: None,
                pair: None,
                static_price: None,
                rate_limit_cooldown_secs: None,
                enabled: true,
            },
            SourceConfig {
                provider_id: "kraken".to_string(),
                kind: SourceKind::Http,
                base_url: "https://api.kraken.com".to_string(),
                spot_path: "/0/public/Ticker?pair=XBTUSD".to_string(),
                historical_path: Some(
                    "/0/public/OHLC?pair=XBTUSD&interval=1440&since={from}".to_string(),
                ),
                weight_prior: 1.0,
                response_schema_version: 1,
                schema: SchemaKind::Kraken,
                price_pointer: None,
                pair: Some("XXBTZUSD".to_string()),
                static_price: None,
                rate_limit_cooldown_secs: None,
                enabled: true,
            },
            SourceConfig {
                provider_id: "coinbase".to_string(),
                kind: SourceKind::Http,
                base_url: "https://api.coinbase.com".to_string(),
                spot_path: "/v2/prices/BTC-USD/spot".to_string(),
                historical_path: None,
                weight_prior: 1.0,
                response_schema_version: 1,
                schema: SchemaKind::Coinbase,
                price_pointer: None,
                pair: None,
                static_price: None,
                rate_limit_cooldown_secs: None,
                enabled: true,
            },
            SourceConfig {
                provider_id: "bitstamp".to_string(),
                kind: SourceKind::Http,
                base_url: "https://www.bitstamp.net".to_string(),
                spot_path: "/api/v2/ticker/btcusd/".to_string(),
                historical_path: None,
                weight_prior: 0.8,
                response_schema_version: 1,
                schema: SchemaKind::Bitstamp,
                price_pointer: None,
                pair: None,
                static_price: None,
                rate_limit_cooldown_secs: None,
                enabled: true,
            },
        ],
        aggregation: AggregationConfig::default(),
        circuit_breaker: CircuitBreakerConfig::default(),
        reliability: ReliabilityConfig::default(),
        volatility: VolatilityConfig::default(),
        scheduler: SchedulerConfig::default(),
        premium: PremiumConfig::default(),
        storage: StorageConfig::default(),
        server: ServerSection::default(),
        monitoring: MonitoringConfig::default(),
    }
}

#[instrument]
pub fn save_config<P: AsRef<Path> + std::fmt::Debug>(config: &OracleConfig, path: P) -> Result<()> {
    let path = path.as_ref();
    info!("Saving configuration to: {:?}", path);

    let yaml = serde_yaml::to_string(config)
        .with_context(|| "Failed to serialize configuration to YAML")?;

    fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    info!("Configuration saved successfully");
    Ok(())
}
