//! Fixed-price adapter for local runs

use async_trait::async_trait;
use chrono::NaiveDate;
use common::{Capability, HistoricalClose, PricePoint, SharedClock, SourceId};
use config::SourceConfig;

use super::SourceAdapter;
use crate::error::SourceError;

/// Always reports the configured price; has no history
#[derive(Debug)]
pub struct StaticSourceAdapter {
    id: SourceId,
    price: f64,
    clock: SharedClock,
}

impl StaticSourceAdapter {
    pub fn new(id: SourceId, price: f64, clock: SharedClock) -> Self {
        Self { id, price, clock }
    }

    pub fn from_config(source: &SourceConfig, clock: SharedClock) -> Result<Self, SourceError> {
        let id = SourceId::new(source.provider_id.clone());
        match source.static_price {
            Some(price) if price.is_finite() && price > 0.0 => Ok(Self::new(id, price, clock)),
            _ => Err(SourceError::parse(&id, "static source requires a positive static_price")),
        }
    }
}

#[async_trait]
impl SourceAdapter for StaticSourceAdapter {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn supports(&self, capability: Capability) -> bool {
        capability == Capability::Spot
    }

    async fn fetch_spot(&self) -> Result<PricePoint, SourceError> {
        Ok(PricePoint::new(self.id.clone(), self.price, self.clock.now(), 0))
    }

    async fn fetch_historical(
        &self,
        _from: NaiveDate,
        _to: NaiveDate,
    ) -> Result<Vec<HistoricalClose>, SourceError> {
        Err(SourceError::network(&self.id, "historical data not supported"))
    }
}
