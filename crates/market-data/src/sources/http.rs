//! HTTP/JSON source adapter

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use common::{Capability, HistoricalClose, PricePoint, SharedClock, SourceId};
use config::SourceConfig;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::debug;
use url::Url;

use super::schema::ResponseSchema;
use super::SourceAdapter;
use crate::error::SourceError;

/// Adapter for one REST endpoint described by a [`SourceConfig`]
///
/// Historical paths may contain `{from}`/`{to}` (unix seconds) and
/// `{from_ms}`/`{to_ms}` placeholders; `to` covers the whole final day.
pub struct HttpSourceAdapter {
    id: SourceId,
    asset: String,
    client: reqwest::Client,
    base_url: String,
    spot_path: String,
    historical_path: Option<String>,
    schema: ResponseSchema,
    clock: SharedClock,
}

impl HttpSourceAdapter {
    pub fn new(
        source: &SourceConfig,
        asset: &str,
        timeout: Duration,
        clock: SharedClock,
    ) -> Result<Self, SourceError> {
        let id = SourceId::new(source.provider_id.clone());
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("premium-oracle/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::network(&id, format!("failed to build HTTP client: {}", e)))?;

        let schema = ResponseSchema::from_config(source);
        let historical_path = source
            .historical_path
            .clone()
            .filter(|_| schema.supports_historical());

        Ok(Self {
            id,
            asset: asset.to_string(),
            client,
            base_url: source.base_url.trim_end_matches('/').to_string(),
            spot_path: source.spot_path.clone(),
            historical_path,
            schema,
            clock,
        })
    }

    fn url(&self, path: &str) -> Result<Url, SourceError> {
        let joined = format!("{}{}", self.base_url, path);
        Url::parse(&joined).map_err(|e| SourceError::network(&self.id, format!("invalid URL {}: {}", joined, e)))
    }

    async fn get_json(&self, url: Url) -> Result<Value, SourceError> {
        debug!(source = %self.id, %url, "Fetching");

        let response = self.client.get(url).send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(SourceError::rate_limited(&self.id, retry_after));
        }
        if !status.is_success() {
            return Err(SourceError::network(&self.id, format!("HTTP {}", status)));
        }

        response.json::<Value>().await.map_err(|e| {
            if e.is_timeout() {
                SourceError::timeout(&self.id, e.to_string())
            } else {
                SourceError::parse(&self.id, format!("invalid JSON: {}", e))
            }
        })
    }

    fn classify(&self, e: reqwest::Error) -> SourceError {
        if e.is_timeout() {
            SourceError::timeout(&self.id, e.to_string())
        } else {
            SourceError::network(&self.id, e.to_string())
        }
    }
}

/// Substitute the date-range placeholders of a historical path
pub fn expand_range(path: &str, from: NaiveDate, to: NaiveDate) -> String {
    let from_secs = from.and_time(NaiveTime::MIN).and_utc().timestamp();
    let to_secs = to.and_time(NaiveTime::MIN).and_utc().timestamp() + 86_399;

    path.replace("{from_ms}", &(from_secs * 1000).to_string())
        .replace("{to_ms}", &(to_secs * 1000 + 999).to_string())
        .replace("{from}", &from_secs.to_string())
        .replace("{to}", &to_secs.to_string())
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Spot => true,
            Capability::Historical => self.historical_path.is_some(),
        }
    }

    async fn fetch_spot(&self) -> Result<PricePoint, SourceError> {
        let started = Instant::now();
        let body = self.get_json(self.url(&self.spot_path)?).await?;
        let price = self
            .schema
            .parse_spot(&body)
            .map_err(|msg| SourceError::parse(&self.id, msg))?;

        Ok(PricePoint::new(
            self.id.clone(),
            price,
            self.clock.now(),
            started.elapsed().as_millis() as u64,
        ))
    }

    async fn fetch_historical(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<HistoricalClose>, SourceError> {
        let Some(path) = self.historical_path.as_deref() else {
            return Err(SourceError::network(&self.id, "historical data not supported"));
        };

        let body = self.get_json(self.url(&expand_range(path, from, to))?).await?;
        let bars = self
            .schema
            .parse_historical(&body)
            .map_err(|msg| SourceError::parse(&self.id, msg))?;

        let stored_at = self.clock.now();
        Ok(bars
            .into_iter()
            .filter(|bar| bar.date >= from && bar.date <= to)
            .map(|bar| {
                let close = HistoricalClose::new(bar.date, self.asset.clone(), bar.close, self.id.clone(), stored_at);
                match (bar.high, bar.low) {
                    (Some(high), Some(low)) => close.with_range(high, low),
                    _ => close,
                }
            })
            .collect())
    }
}
