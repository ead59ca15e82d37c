//! In-memory tiered historical store
//!
//! Tiers per asset:
//! - intraday samples younger than `full_fidelity_days`
//! - daily closes (plus folded intraday ranges) up to `daily_granularity_days`
//! - archived closes beyond that, still subject to source priority
//!
//! Closes are never deleted; only folded intraday samples, aged daily ranges
//! and expired audit entries leave the store.

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use common::{HistoricalClose, SourceId};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::history::HistoricalStore;
use crate::types::{
    AppendOutcome, AssetSnapshot, AuditEntry, CompactionReport, DailyRange, Disposition,
    HistorySnapshot, IntradaySample, RetentionPolicy,
};

#[derive(Debug, Default)]
struct AssetHistory {
    daily: BTreeMap<NaiveDate, HistoricalClose>,
    archive: BTreeMap<NaiveDate, HistoricalClose>,
    intraday: Vec<IntradaySample>,
    ranges: BTreeMap<NaiveDate, DailyRange>,
    audit: Vec<AuditEntry>,
    last_intraday_at: Option<DateTime<Utc>>,
}

impl AssetHistory {
    fn from_snapshot(snapshot: AssetSnapshot) -> Self {
        let mut intraday = snapshot.intraday;
        intraday.sort_by_key(|s| s.observed_at);
        let last_intraday_at = intraday.last().map(|s| s.observed_at);

        Self {
            daily: snapshot.closes.into_iter().map(|c| (c.date, c)).collect(),
            archive: snapshot.archived.into_iter().map(|c| (c.date, c)).collect(),
            intraday,
            ranges: snapshot.daily_ranges.into_iter().map(|r| (r.date, r)).collect(),
            audit: snapshot.audit,
            last_intraday_at,
        }
    }

    fn to_snapshot(&self, asset: &str) -> AssetSnapshot {
        AssetSnapshot {
            asset: asset.to_string(),
            closes: self.daily.values().cloned().collect(),
            archived: self.archive.values().cloned().collect(),
            intraday: self.intraday.clone(),
            daily_ranges: self.ranges.values().copied().collect(),
            audit: self.audit.clone(),
        }
    }
}

/// In-memory [`HistoricalStore`]
///
/// A single write lock covers every asset, so appends for the same day are
/// serialized.
pub struct InMemoryHistoricalStore {
    assets: RwLock<HashMap<String, AssetHistory>>,
    /// Tie-break order, highest priority first
    priority: Vec<SourceId>,
    policy: RetentionPolicy,
}

impl InMemoryHistoricalStore {
    pub fn new(priority: Vec<SourceId>, policy: RetentionPolicy) -> Self {
        Self {
            assets: RwLock::new(HashMap::new()),
            priority,
            policy,
        }
    }

    /// Rebuild a store from a snapshot written by [`HistoricalStore::snapshot`]
    pub fn from_snapshot(
        snapshot: HistorySnapshot,
        priority: Vec<SourceId>,
        policy: RetentionPolicy,
    ) -> Self {
        let assets = snapshot
            .assets
            .into_iter()
            .map(|a| (a.asset.clone(), AssetHistory::from_snapshot(a)))
            .collect();

        Self {
            assets: RwLock::new(assets),
            priority,
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Position in the priority list; unknown sources rank last
    fn rank(&self, source: &SourceId) -> usize {
        self.priority
            .iter()
            .position(|s| s == source)
            .unwrap_or(usize::MAX)
    }

    /// Whether `candidate` should displace `existing` for the same day
    fn wins_over(&self, candidate: &HistoricalClose, existing: &HistoricalClose) -> bool {
        if candidate.source_id == existing.source_id {
            // Later correction from the same source
            return candidate.stored_at > existing.stored_at;
        }
        self.rank(&candidate.source_id) < self.rank(&existing.source_id)
    }
}

fn audit_entry(
    close: HistoricalClose,
    disposition: Disposition,
    winner: &SourceId,
    at: DateTime<Utc>,
) -> AuditEntry {
    AuditEntry {
        close,
        disposition,
        winner_source: winner.clone(),
        recorded_at: at,
    }
}

fn is_valid_price(p: f64) -> bool {
    p.is_finite() && p > 0.0
}

fn validate_close(close: &HistoricalClose) -> StorageResult<()> {
    if !is_valid_price(close.price) {
        return Err(StorageError::DataIntegrity(format!(
            "close for {} from {} has non-positive price {}",
            close.date, close.source_id, close.price
        )));
    }
    if close.date > close.stored_at.date_naive() {
        return Err(StorageError::DataIntegrity(format!(
            "close for {} from {} is dated after its stored_at {}",
            close.date, close.source_id, close.stored_at
        )));
    }
    if let Some((high, low)) = close.range() {
        if !is_valid_price(high) || !is_valid_price(low) || low > high {
            return Err(StorageError::DataIntegrity(format!(
                "close for {} from {} has invalid range high={} low={}",
                close.date, close.source_id, high, low
            )));
        }
    }
    Ok(())
}

fn days_before(today: NaiveDate, days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MIN)
}

#[async_trait]
impl HistoricalStore for InMemoryHistoricalStore {
    async fn append_close(&self, close: HistoricalClose) -> StorageResult<AppendOutcome> {
        validate_close(&close)?;

        let mut assets = self.assets.write().await;
        let history = assets.entry(close.asset.clone()).or_default();
        let at = close.stored_at;

        // Archiving changes resolution only; ties on archived days follow the
        // same priority and stay in the archive tier.
        let AssetHistory {
            daily,
            archive,
            audit,
            ..
        } = history;
        let tier = if archive.contains_key(&close.date) {
            archive
        } else {
            daily
        };

        if !tier.contains_key(&close.date) {
            debug!(date = %close.date, source = %close.source_id, price = close.price, "Close inserted");
            tier.insert(close.date, close);
            return Ok(AppendOutcome::Inserted);
        }
        let Some(existing) = tier.get(&close.date) else {
            return Ok(AppendOutcome::Inserted);
        };

        if existing.source_id == close.source_id && existing.price == close.price {
            return Ok(AppendOutcome::Duplicate);
        }

        if self.wins_over(&close, existing) {
            let winner = close.source_id.clone();
            let date = close.date;
            match tier.insert(date, close) {
                Some(previous) => {
                    debug!(%date, winner = %winner, loser = %previous.source_id, "Close superseded");
                    audit.push(audit_entry(previous.clone(), Disposition::Superseded, &winner, at));
                    Ok(AppendOutcome::Replaced { previous })
                }
                None => Ok(AppendOutcome::Inserted),
            }
        } else {
            let winner = existing.source_id.clone();
            debug!(date = %close.date, winner = %winner, loser = %close.source_id, "Close rejected");
            audit.push(audit_entry(close, Disposition::Rejected, &winner, at));
            Ok(AppendOutcome::Rejected { winner })
        }
    }

    async fn range(
        &self,
        asset: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<HistoricalClose>> {
        if from > to {
            return Ok(Vec::new());
        }
        let assets = self.assets.read().await;
        let Some(history) = assets.get(asset) else {
            return Ok(Vec::new());
        };

        let mut closes: Vec<HistoricalClose> = history
            .archive
            .range(from..=to)
            .chain(history.daily.range(from..=to))
            .map(|(_, c)| c.clone())
            .collect();
        closes.sort_by_key(|c| c.date);
        Ok(closes)
    }

    async fn latest(&self, asset: &str) -> StorageResult<Option<HistoricalClose>> {
        let assets = self.assets.read().await;
        let Some(history) = assets.get(asset) else {
            return Ok(None);
        };

        let daily = history.daily.values().next_back();
        let archived = history.archive.values().next_back();
        let latest = match (daily, archived) {
            (Some(d), Some(a)) => Some(if d.date >= a.date { d } else { a }),
            (d, a) => d.or(a),
        };
        Ok(latest.cloned())
    }

    async fn audit_trail(&self, asset: &str, date: NaiveDate) -> StorageResult<Vec<AuditEntry>> {
        let assets = self.assets.read().await;
        Ok(assets
            .get(asset)
            .map(|h| {
                h.audit
                    .iter()
                    .filter(|e| e.close.date == date)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn record_intraday(&self, asset: &str, sample: IntradaySample) -> StorageResult<()> {
        if !is_valid_price(sample.price) {
            return Err(StorageError::DataIntegrity(format!(
                "intraday sample at {} has non-positive price {}",
                sample.observed_at, sample.price
            )));
        }

        let mut assets = self.assets.write().await;
        let history = assets.entry(asset.to_string()).or_default();
        if let Some(last) = history.last_intraday_at {
            if sample.observed_at <= last {
                return Err(StorageError::DataIntegrity(format!(
                    "intraday sample at {} is not after previous sample at {}",
                    sample.observed_at, last
                )));
            }
        }

        history.last_intraday_at = Some(sample.observed_at);
        history.intraday.push(sample);
        Ok(())
    }

    async fn intraday(
        &self,
        asset: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<IntradaySample>> {
        let assets = self.assets.read().await;
        Ok(assets
            .get(asset)
            .map(|h| {
                h.intraday
                    .iter()
                    .filter(|s| s.observed_at >= from && s.observed_at <= to)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn daily_ranges(
        &self,
        asset: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> StorageResult<Vec<DailyRange>> {
        if from > to {
            return Ok(Vec::new());
        }
        let assets = self.assets.read().await;
        Ok(assets
            .get(asset)
            .map(|h| h.ranges.range(from..=to).map(|(_, r)| *r).collect())
            .unwrap_or_default())
    }

    async fn compact(&self, today: NaiveDate) -> StorageResult<CompactionReport> {
        let fidelity_cutoff = days_before(today, self.policy.full_fidelity_days);
        let granularity_cutoff = days_before(today, self.policy.daily_granularity_days);
        let audit_cutoff = days_before(today, self.policy.audit_retention_days);

        let mut report = CompactionReport::default();
        let mut assets = self.assets.write().await;

        for (asset, history) in assets.iter_mut() {
            // Fold aged intraday samples into daily ranges
            let keep_from = history
                .intraday
                .partition_point(|s| s.observed_at.date_naive() < fidelity_cutoff);
            for sample in history.intraday.drain(..keep_from) {
                let folded = DailyRange::from_sample(&sample);
                history
                    .ranges
                    .entry(folded.date)
                    .and_modify(|r| r.merge(&folded))
                    .or_insert(folded);
                report.samples_folded += 1;
            }

            let aged_ranges = history.ranges.len();
            history.ranges = history.ranges.split_off(&granularity_cutoff);
            report.ranges_dropped += aged_ranges - history.ranges.len();

            let recent = history.daily.split_off(&granularity_cutoff);
            let aged = std::mem::replace(&mut history.daily, recent);
            report.closes_archived += aged.len();
            history.archive.extend(aged);

            let audit_before = history.audit.len();
            history
                .audit
                .retain(|e| e.recorded_at.date_naive() >= audit_cutoff);
            report.audit_dropped += audit_before - history.audit.len();

            debug!(asset = %asset, archive = history.archive.len(), daily = history.daily.len(), "Asset compacted");
        }

        if !report.is_empty() {
            info!(
                samples_folded = report.samples_folded,
                ranges_dropped = report.ranges_dropped,
                closes_archived = report.closes_archived,
                audit_dropped = report.audit_dropped,
                "Historical store compacted"
            );
        }
        Ok(report)
    }

    async fn snapshot(&self, now: DateTime<Utc>) -> StorageResult<HistorySnapshot> {
        let assets = self.assets.read().await;
        let mut snapshots: Vec<AssetSnapshot> = assets
            .iter()
            .map(|(asset, history)| history.to_snapshot(asset))
            .collect();
        snapshots.sort_by(|a, b| a.asset.cmp(&b.asset));

        Ok(HistorySnapshot {
            taken_at: Some(now),
            assets: snapshots,
        })
    }
}
