//! Records kept by the historical store

use chrono::{DateTime, NaiveDate, Utc};
use common::{HistoricalClose, SourceId};
use serde::{Deserialize, Serialize};

/// One consensus observation kept at full fidelity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntradaySample {
    pub observed_at: DateTime<Utc>,
    pub price: f64,
}

impl IntradaySample {
    pub fn new(observed_at: DateTime<Utc>, price: f64) -> Self {
        Self { observed_at, price }
    }
}

/// Intraday samples of one day folded into a range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyRange {
    pub date: NaiveDate,
    pub high: f64,
    pub low: f64,
    pub count: u32,
}

impl DailyRange {
    pub fn from_sample(sample: &IntradaySample) -> Self {
        Self {
            date: sample.observed_at.date_naive(),
            high: sample.price,
            low: sample.price,
            count: 1,
        }
    }

    pub fn merge(&mut self, other: &DailyRange) {
        self.high = self.high.max(other.high);
        self.low = self.low.min(other.low);
        self.count += other.count;
    }
}

/// Why a close ended up in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Lost the tie-break against an already stored close
    Rejected,
    /// Was stored, then displaced by a higher priority close
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub close: HistoricalClose,
    pub disposition: Disposition,
    pub winner_source: SourceId,
    pub recorded_at: DateTime<Utc>,
}

/// Result of [`HistoricalStore::append_close`](crate::HistoricalStore::append_close)
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    /// First close for the day
    Inserted,
    /// The new close won and the previous one moved to the audit trail
    Replaced { previous: HistoricalClose },
    /// The stored close kept the day; the new one is in the audit trail
    Rejected { winner: SourceId },
    /// Same source, same day, same price
    Duplicate,
}

impl AppendOutcome {
    /// Whether the accepted close for the day changed
    pub fn changed(&self) -> bool {
        matches!(self, AppendOutcome::Inserted | AppendOutcome::Replaced { .. })
    }
}

/// Age boundaries of the storage tiers, in days
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Raw intraday samples are kept this long
    pub full_fidelity_days: u32,
    /// Closes older than this move to the archive tier, daily ranges are dropped
    pub daily_granularity_days: u32,
    pub audit_retention_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            full_fidelity_days: 7,
            daily_granularity_days: 90,
            audit_retention_days: 400,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub samples_folded: usize,
    pub ranges_dropped: usize,
    pub closes_archived: usize,
    pub audit_dropped: usize,
}

impl CompactionReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Serializable state of one asset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetSnapshot {
    pub asset: String,
    pub closes: Vec<HistoricalClose>,
    #[serde(default)]
    pub archived: Vec<HistoricalClose>,
    #[serde(default)]
    pub intraday: Vec<IntradaySample>,
    #[serde(default)]
    pub daily_ranges: Vec<DailyRange>,
    #[serde(default)]
    pub audit: Vec<AuditEntry>,
}

/// Serializable state of the whole store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    pub assets: Vec<AssetSnapshot>,
}
