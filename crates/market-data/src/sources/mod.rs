//! Market-data source adapters
//!
//! An adapter fetches from exactly one provider and normalizes the response.
//! Adapters never retry; retry and fallback policy lives in
//! [`ResilienceController`](crate::resilience::ResilienceController).

pub mod fixed;
pub mod http;
pub mod schema;

use async_trait::async_trait;
use chrono::NaiveDate;
use common::{Capability, HistoricalClose, PricePoint, SharedClock, SourceId};
use config::{OracleConfig, SourceKind};
use std::sync::Arc;
use std::time::Duration;

use crate::error::SourceError;

pub use fixed::StaticSourceAdapter;
pub use http::HttpSourceAdapter;
pub use schema::{DailyBar, ResponseSchema};

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &SourceId;

    fn supports(&self, capability: Capability) -> bool;

    async fn fetch_spot(&self) -> Result<PricePoint, SourceError>;

    /// Daily closes with `from <= date <= to`, oldest first
    async fn fetch_historical(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HistoricalClose>, SourceError>;
}

pub type SharedAdapter = Arc<dyn SourceAdapter>;

/// Build one adapter per enabled source, in configured order
pub fn build_adapters(
    config: &OracleConfig,
    clock: SharedClock,
) -> Result<Vec<SharedAdapter>, SourceError> {
    let timeout = Duration::from_secs(config.circuit_breaker.request_timeout_secs);

    config
        .enabled_sources()
        .map(|source| -> Result<SharedAdapter, SourceError> {
            match source.kind {
                SourceKind::Http => Ok(Arc::new(HttpSourceAdapter::new(
                    source,
                    &config.oracle.asset,
                    timeout,
                    clock.clone(),
                )?)),
                SourceKind::Static => Ok(Arc::new(StaticSourceAdapter::from_config(
                    source,
                    clock.clone(),
                )?)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::SystemClock;

    #[test]
    fn test_build_adapters_skips_disabled_sources() {
        let mut config = config::generate_default_config();
        config.sources[1].enabled = false;

        let adapters = build_adapters(&config, SystemClock::shared()).unwrap();
        let ids: Vec<&str> = adapters.iter().map(|a| a.id().as_str()).collect();
        assert_eq!(ids, vec!["coingecko", "kraken", "coinbase", "bitstamp"]);
        assert!(adapters[0].supports(Capability::Historical));
        assert!(!adapters[2].supports(Capability::Historical));
    }
}
