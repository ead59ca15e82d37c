//! Historical store contract

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use common::HistoricalClose;

use crate::error::StorageResult;
use crate::types::{
    AppendOutcome, AuditEntry, CompactionReport, DailyRange, HistorySnapshot, IntradaySample,
};

/// Time-indexed store of daily closes
///
/// At most one close is accepted per calendar day per asset. Conflicts are
/// resolved by source priority and every losing record is kept in an audit
/// trail. Implementations serialize appends so concurrent writers for the
/// same day cannot both win.
#[async_trait]
pub trait HistoricalStore: Send + Sync {
    // ------------------------------------------------------------------------
    // Daily closes
    // ------------------------------------------------------------------------

    /// Append a close, resolving a same-day conflict by source priority
    ///
    /// Non-positive or non-finite prices and closes dated after their own
    /// `stored_at` are rejected with `DataIntegrity` and nothing is stored.
    async fn append_close(&self, close: HistoricalClose) -> StorageResult<AppendOutcome>;

    /// Accepted closes with `from <= date <= to`, oldest first, across all tiers
    async fn range(
        &self,
        asset: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<HistoricalClose>>;

    async fn latest(&self, asset: &str) -> StorageResult<Option<HistoricalClose>>;

    /// Losing and superseded closes recorded for a day
    async fn audit_trail(&self, asset: &str, date: NaiveDate) -> StorageResult<Vec<AuditEntry>>;

    // ------------------------------------------------------------------------
    // Intraday tier
    // ------------------------------------------------------------------------

    /// Record a consensus sample; timestamps must be strictly increasing
    async fn record_intraday(&self, asset: &str, sample: IntradaySample) -> StorageResult<()>;

    async fn intraday(
        &self,
        asset: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<IntradaySample>>;

    async fn daily_ranges(
        &self,
        asset: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<DailyRange>>;

    // ------------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------------

    /// Move aged records to lower-resolution tiers
    async fn compact(&self, today: NaiveDate) -> StorageResult<CompactionReport>;

    async fn snapshot(&self, now: DateTime<Utc>) -> StorageResult<HistorySnapshot>;
}
