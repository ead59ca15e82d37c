//! Pipeline coordinator and consumer read API
//!
//! [`PriceOracle`] owns one instance of every pipeline stage. The scheduler
//! drives the write side (`run_spot_cycle`, `run_daily_close`,
//! `run_maintenance`); consumers only call the `get_*` methods, which never
//! trigger a fetch.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use common::{HistoricalClose, Methodology, PricePoint, SharedClock, SourceHealth, SourceId};
use config::OracleConfig;
use observability::PipelineMetrics;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use storage::{
    AppendOutcome, CompactionReport, DailyRange, HistoricalStore, InMemoryHistoricalStore, IntradaySample,
    RetentionPolicy, SnapshotStore, StorageError,
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::aggregator::{Aggregator, AggregatorSettings};
use crate::black_scholes::PremiumEngine;
use crate::error::{OracleError, Result};
use crate::reliability::{ReliabilitySettings, ReliabilityTracker};
use crate::resilience::{ResilienceController, SpotOutcome};
use crate::sources::{build_adapters, SharedAdapter};
use crate::types::{ConsensusPrice, OptionType, PremiumQuote, VolatilityEstimate};
use crate::volatility::{VolatilityEngine, VolatilitySettings};

#[derive(Debug, Clone)]
enum ConsensusState {
    Pending,
    Ready(ConsensusPrice),
    Failed { contributing: usize, required: usize },
}

/// What one daily-close run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyCloseReport {
    pub fetched: usize,
    pub inserted: usize,
    pub replaced: usize,
    /// Lost the same-day tie-break
    pub rejected: usize,
    /// Failed integrity checks and were dropped
    pub invalid: usize,
}

fn retention_policy(config: &config::StorageConfig) -> RetentionPolicy {
    RetentionPolicy {
        full_fidelity_days: config.full_fidelity_days,
        daily_granularity_days: config.daily_granularity_days,
        audit_retention_days: config.audit_retention_days,
    }
}

/// Tie-break priority for same-day closes: configured source order
fn source_priority(config: &OracleConfig) -> Vec<SourceId> {
    config
        .enabled_sources()
        .map(|s| SourceId::new(s.provider_id.clone()))
        .collect()
}

pub struct PriceOracle {
    asset: String,
    clock: SharedClock,
    resilience: ResilienceController,
    reliability: ReliabilityTracker,
    aggregator: Aggregator,
    volatility: VolatilityEngine,
    premium: PremiumEngine,
    premium_window: u32,
    premium_methodology: Methodology,
    backfill_days: u32,
    store: Arc<dyn HistoricalStore>,
    snapshots: Option<SnapshotStore>,
    consensus: RwLock<ConsensusState>,
    metrics: PipelineMetrics,
}

impl PriceOracle {
    /// Assemble a pipeline around existing adapters and store
    ///
    /// Per-request timeouts are capped at the staleness threshold so a spot
    /// cycle never waits longer than a point stays usable.
    pub fn new(
        config: &OracleConfig,
        adapters: Vec<SharedAdapter>,
        store: Arc<dyn HistoricalStore>,
        clock: SharedClock,
    ) -> Self {
        let mut bounded = config.clone();
        bounded.circuit_breaker.request_timeout_secs = config
            .circuit_breaker
            .request_timeout_secs
            .min(config.aggregation.staleness_threshold_secs)
            .max(1);

        let priors = config
            .enabled_sources()
            .map(|s| (SourceId::new(s.provider_id.clone()), s.weight_prior));

        Self {
            asset: config.oracle.asset.clone(),
            resilience: ResilienceController::from_config(&bounded, adapters, clock.clone()),
            reliability: ReliabilityTracker::new(ReliabilitySettings::from(&config.reliability), priors),
            aggregator: Aggregator::new(AggregatorSettings::from(&config.aggregation)),
            volatility: VolatilityEngine::new(VolatilitySettings::from_config(
                &config.volatility,
                config.scheduler.trailing_len,
            )),
            premium: PremiumEngine::new(config.premium.risk_free_rate, config.premium.day_count),
            premium_window: config.premium.volatility_window_days,
            premium_methodology: config.premium.methodology,
            backfill_days: config.scheduler.backfill_days,
            store,
            snapshots: None,
            consensus: RwLock::new(ConsensusState::Pending),
            metrics: PipelineMetrics::new(),
            clock,
        }
    }

    /// Build adapters and storage from configuration, restoring persisted
    /// history and source health from `storage.data_dir`
    pub async fn from_config(config: &OracleConfig, clock: SharedClock) -> Result<Self> {
        let adapters =
            build_adapters(config, clock.clone()).map_err(|e| OracleError::InvalidInput(e.to_string()))?;
        let snapshots = SnapshotStore::open(&config.storage.data_dir)?;

        let priority = source_priority(config);
        let policy = retention_policy(&config.storage);
        let store: Arc<dyn HistoricalStore> = match snapshots.load_history()? {
            Some(snapshot) => {
                info!(
                    dir = %snapshots.dir().display(),
                    taken_at = ?snapshot.taken_at,
                    "Restored history snapshot"
                );
                Arc::new(InMemoryHistoricalStore::from_snapshot(snapshot, priority, policy))
            }
            None => Arc::new(InMemoryHistoricalStore::new(priority, policy)),
        };

        let health = snapshots.load_health()?;
        let oracle = Self::new(config, adapters, store, clock).with_snapshots(snapshots);
        if let Some(records) = health {
            oracle.restore_health(&records);
        }
        oracle.recompute_volatility().await?;
        Ok(oracle)
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotStore) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn store(&self) -> &Arc<dyn HistoricalStore> {
        &self.store
    }

    pub fn resilience(&self) -> &ResilienceController {
        &self.resilience
    }

    pub fn volatility_engine(&self) -> &VolatilityEngine {
        &self.volatility
    }

    pub fn restore_health(&self, records: &[SourceHealth]) {
        self.resilience.restore(records, self.clock.now());
        for record in records {
            self.reliability.restore(record);
        }
        info!(sources = records.len(), "Restored source health");
    }

    // ------------------------------------------------------------------------
    // Write side
    // ------------------------------------------------------------------------

    /// Fetch every source, aggregate, update weights and record the sample
    pub async fn run_spot_cycle(&self) -> Result<ConsensusPrice> {
        let fetches = self.resilience.fetch_all_spot().await;
        let now = self.clock.now();

        for fetch in &fetches {
            match &fetch.outcome {
                SpotOutcome::Fresh(point) => {
                    self.reliability
                        .record_success(&fetch.source_id, point.fetch_latency_ms, now)
                }
                _ if fetch.attempted => self.reliability.record_failure(&fetch.source_id),
                _ => {}
            }
        }

        let points: Vec<PricePoint> = fetches
            .iter()
            .filter_map(|f| f.outcome.point().cloned())
            .collect();
        let result = self.aggregator.aggregate(
            &points,
            &self.reliability.weights(),
            self.reliability.total_weight(),
            now,
        );

        match &result {
            Ok(consensus) => {
                for point in &points {
                    if consensus.contributing_sources.contains(&point.source_id)
                        || consensus.outliers.contains(&point.source_id)
                    {
                        let deviation = (point.price - consensus.price).abs() / consensus.price;
                        self.reliability.record_deviation(&point.source_id, deviation);
                    }
                }
                for outlier in &consensus.outliers {
                    warn!(source = %outlier, consensus = consensus.price, "Outlier rejected");
                    self.metrics.outlier_rejected(outlier.as_str());
                }
                self.metrics.record_consensus(consensus.price, consensus.confidence);
                info!(
                    price = consensus.price,
                    confidence = consensus.confidence,
                    sources = consensus.contributing_sources.len(),
                    "Consensus price updated"
                );

                let sample = IntradaySample::new(consensus.computed_at, consensus.price);
                if let Err(e) = self.store.record_intraday(&self.asset, sample).await {
                    error!(error = %e, "Dropped intraday sample");
                }
                *self.consensus.write().await = ConsensusState::Ready(consensus.clone());
            }
            Err(OracleError::InsufficientConsensus { contributing, required }) => {
                warn!(contributing, required, "Insufficient consensus");
                self.metrics.consensus_failed();
                *self.consensus.write().await = ConsensusState::Failed {
                    contributing: *contributing,
                    required: *required,
                };
            }
            Err(e) => {
                warn!(error = %e, "Aggregation failed");
                self.metrics.consensus_failed();
            }
        }

        self.reliability.recompute();
        result
    }

    /// Fetch closes missing since the latest stored day (or the backfill
    /// horizon) up to yesterday, store them and recompute volatility
    pub async fn run_daily_close(&self) -> Result<DailyCloseReport> {
        let today = self.clock.now().date_naive();
        let yesterday = today - Duration::days(1);
        let from = match self.store.latest(&self.asset).await? {
            Some(latest) => latest.date + Duration::days(1),
            None => today - Duration::days(i64::from(self.backfill_days)),
        };

        let mut report = DailyCloseReport::default();
        if from <= yesterday {
            let closes = self.resilience.fetch_historical(from, yesterday).await?;
            report.fetched = closes.len();
            for close in closes {
                self.append(close, &mut report).await?;
            }
            info!(
                %from,
                to = %yesterday,
                fetched = report.fetched,
                inserted = report.inserted,
                rejected = report.rejected,
                invalid = report.invalid,
                "Daily closes stored"
            );
        } else {
            debug!(%today, "Daily closes already up to date");
        }

        self.recompute_volatility().await?;
        Ok(report)
    }

    /// Append one close, counting the outcome; only storage failures other
    /// than integrity violations abort the run
    pub async fn append(&self, close: HistoricalClose, report: &mut DailyCloseReport) -> Result<()> {
        let (date, source) = (close.date, close.source_id.clone());
        match self.store.append_close(close).await {
            Ok(AppendOutcome::Inserted) => report.inserted += 1,
            Ok(AppendOutcome::Replaced { previous }) => {
                debug!(%date, winner = %source, loser = %previous.source_id, "Close superseded");
                report.replaced += 1;
            }
            Ok(AppendOutcome::Rejected { winner }) => {
                debug!(%date, %source, %winner, "Close lost the same-day tie-break");
                self.metrics.close_rejected("priority");
                report.rejected += 1;
            }
            Ok(AppendOutcome::Duplicate) => {}
            Err(StorageError::DataIntegrity(msg)) => {
                error!(%date, %source, reason = %msg, "Dropped close");
                self.metrics.close_rejected("integrity");
                report.invalid += 1;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Recompute every configured estimate from stored history
    pub async fn recompute_volatility(&self) -> Result<Vec<VolatilityEstimate>> {
        let Some(longest) = self.volatility.settings().windows.iter().copied().max() else {
            return Ok(Vec::new());
        };
        let closes = self.window_closes(longest).await?;
        if closes.is_empty() {
            return Ok(Vec::new());
        }

        let estimates = self.volatility.recompute_all(&closes, self.clock.now())?;
        for estimate in &estimates {
            if let Some(value) = estimate.value {
                self.metrics
                    .set_volatility(estimate.window_days, estimate.methodology.as_str(), value);
            }
        }
        debug!(count = estimates.len(), "Volatility recomputed");
        Ok(estimates)
    }

    /// Closes of the `window_days` ending at the latest stored day, with
    /// missing high/low filled from intraday history
    async fn window_closes(&self, window_days: u32) -> Result<Vec<HistoricalClose>> {
        let Some(latest) = self.store.latest(&self.asset).await? else {
            return Ok(Vec::new());
        };
        let from = latest.date - Duration::days(i64::from(window_days.max(1)) - 1);
        let mut closes = self.store.range(&self.asset, from, latest.date).await?;
        self.fill_ranges(&mut closes, from, latest.date).await?;
        Ok(closes)
    }

    async fn fill_ranges(&self, closes: &mut [HistoricalClose], from: NaiveDate, to: NaiveDate) -> Result<()> {
        if closes.iter().all(|c| c.range().is_some()) {
            return Ok(());
        }

        let mut ranges: BTreeMap<NaiveDate, DailyRange> = BTreeMap::new();
        for range in self.store.daily_ranges(&self.asset, from, to).await? {
            ranges.insert(range.date, range);
        }

        let start = from.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        let end = (to + Duration::days(1)).and_hms_opt(0, 0, 0).map(|t| t.and_utc());
        if let (Some(start), Some(end)) = (start, end) {
            for sample in self.store.intraday(&self.asset, start, end).await? {
                let folded = DailyRange::from_sample(&sample);
                ranges
                    .entry(folded.date)
                    .and_modify(|r| r.merge(&folded))
                    .or_insert(folded);
            }
        }

        for close in closes.iter_mut().filter(|c| c.range().is_none()) {
            if let Some(range) = ranges.get(&close.date) {
                close.high = Some(range.high.max(close.price));
                close.low = Some(range.low.min(close.price));
            }
        }
        Ok(())
    }

    /// Fold aged history into lower tiers and persist a snapshot
    pub async fn run_maintenance(&self) -> Result<CompactionReport> {
        let report = self.store.compact(self.clock.now().date_naive()).await?;
        if !report.is_empty() {
            info!(
                samples_folded = report.samples_folded,
                closes_archived = report.closes_archived,
                audit_dropped = report.audit_dropped,
                "History compacted"
            );
        }
        self.snapshot().await?;
        Ok(report)
    }

    /// Persist history and source health atomically; no-op without a
    /// snapshot directory
    pub async fn snapshot(&self) -> Result<()> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(());
        };
        let history = self.store.snapshot(self.clock.now()).await?;
        snapshots.save_history(&history)?;
        snapshots.save_health(&self.source_health())?;
        debug!(dir = %snapshots.dir().display(), "Snapshot written");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------------

    /// Latest consensus, or `InsufficientConsensus` if the last cycle failed
    /// or the last price is older than the staleness threshold
    pub async fn get_consensus_price(&self) -> Result<ConsensusPrice> {
        let required = self.aggregator.settings().min_sources;
        match &*self.consensus.read().await {
            ConsensusState::Ready(consensus)
                if self.clock.now() - consensus.computed_at <= self.aggregator.settings().staleness =>
            {
                Ok(consensus.clone())
            }
            ConsensusState::Failed { contributing, required } => Err(OracleError::InsufficientConsensus {
                contributing: *contributing,
                required: *required,
            }),
            _ => Err(OracleError::InsufficientConsensus {
                contributing: 0,
                required,
            }),
        }
    }

    /// Estimate for a window; configured windows are served from the latest
    /// recomputation, others are computed from stored history
    pub async fn get_volatility(&self, window_days: u32, methodology: Methodology) -> Result<VolatilityEstimate> {
        if window_days < 2 {
            return Err(OracleError::InvalidInput(format!(
                "window_days must be at least 2, got {}",
                window_days
            )));
        }

        let estimate = match self.volatility.latest(window_days, methodology) {
            Some(estimate) => estimate,
            None => {
                let closes = self.window_closes(window_days).await?;
                self.volatility
                    .compute(&closes, window_days, methodology, self.clock.now())?
            }
        };

        if estimate.insufficient_data() {
            return Err(OracleError::InsufficientData {
                window_days,
                methodology: methodology.to_string(),
                available: estimate.sample_count,
                required: self
                    .volatility
                    .settings()
                    .required_samples(window_days, estimate.effective_methodology),
            });
        }
        Ok(estimate)
    }

    /// Premium for an option expiring at `expiry`, priced off the current
    /// consensus and the configured volatility window
    pub async fn get_premium(
        &self,
        option_type: OptionType,
        strike: f64,
        expiry: DateTime<Utc>,
    ) -> Result<PremiumQuote> {
        if !strike.is_finite() || strike <= 0.0 {
            return Err(OracleError::InvalidInput(format!("strike must be positive, got {}", strike)));
        }
        let now = self.clock.now();
        if expiry <= now {
            return Err(OracleError::InvalidInput(format!("expiry {} is not in the future", expiry)));
        }

        let consensus = self.get_consensus_price().await?;
        let volatility = self
            .get_volatility(self.premium_window, self.premium_methodology)
            .await?;
        if volatility.value.map_or(true, |v| v <= 0.0) {
            return Err(OracleError::ZeroVolatility {
                window_days: volatility.window_days,
                methodology: volatility.effective_methodology.to_string(),
            });
        }
        self.premium
            .quote(option_type, consensus.price, strike, expiry, &volatility, now)
    }

    /// Health of every configured source, in configured order
    pub fn source_health(&self) -> Vec<SourceHealth> {
        self.resilience
            .health()
            .into_iter()
            .map(|mut health| {
                self.reliability.fill_health(&mut health);
                health
            })
            .collect()
    }

    /// Current reliability weights
    pub fn weights(&self) -> HashMap<SourceId, f64> {
        self.reliability.weights()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::StaticSourceAdapter;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use common::{Clock, ManualClock};

    fn config(min_sources: usize) -> OracleConfig {
        let mut config = config::generate_default_config();
        config.aggregation.min_sources = min_sources;
        config
    }

    fn static_oracle(prices: &[(&str, f64)], clock: &ManualClock) -> PriceOracle {
        let adapters: Vec<SharedAdapter> = prices
            .iter()
            .map(|(id, p)| Arc::new(StaticSourceAdapter::new((*id).into(), *p, clock.shared())) as SharedAdapter)
            .collect();
        let mut cfg = config(2);
        cfg.sources.retain(|s| prices.iter().any(|(id, _)| *id == s.provider_id));
        let store: Arc<dyn HistoricalStore> =
            Arc::new(InMemoryHistoricalStore::new(source_priority(&cfg), RetentionPolicy::default()));
        PriceOracle::new(&cfg, adapters, store, clock.shared())
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_no_consensus_before_first_cycle() {
        let clock = clock();
        let oracle = static_oracle(&[("coingecko", 60_000.0), ("kraken", 60_010.0)], &clock);

        assert_matches!(
            oracle.get_consensus_price().await,
            Err(OracleError::InsufficientConsensus { contributing: 0, required: 2 })
        );
    }

    #[tokio::test]
    async fn test_consensus_goes_stale() {
        let clock = clock();
        let oracle = static_oracle(&[("coingecko", 60_000.0), ("kraken", 60_010.0)], &clock);

        let consensus = oracle.run_spot_cycle().await.unwrap();
        assert_eq!(consensus.price, 60_005.0);
        assert_eq!(oracle.get_consensus_price().await.unwrap(), consensus);

        clock.advance(Duration::seconds(121));
        assert_matches!(
            oracle.get_consensus_price().await,
            Err(OracleError::InsufficientConsensus { .. })
        );
    }

    #[tokio::test]
    async fn test_spot_cycle_records_intraday_sample() {
        let clock = clock();
        let oracle = static_oracle(&[("coingecko", 60_000.0), ("kraken", 60_010.0)], &clock);
        oracle.run_spot_cycle().await.unwrap();

        let samples = oracle
            .store()
            .intraday("BTC", clock.now() - Duration::hours(1), clock.now())
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].price, 60_005.0);
    }

    #[tokio::test]
    async fn test_premium_input_validation_precedes_data_checks() {
        let clock = clock();
        let oracle = static_oracle(&[("coingecko", 60_000.0), ("kraken", 60_010.0)], &clock);
        let expiry = clock.now() + Duration::days(30);

        assert_matches!(
            oracle.get_premium(OptionType::Call, -1.0, expiry).await,
            Err(OracleError::InvalidInput(_))
        );
        assert_matches!(
            oracle.get_premium(OptionType::Call, 60_000.0, clock.now()).await,
            Err(OracleError::InvalidInput(_))
        );
        // Valid request, but nothing has been fetched yet
        assert_matches!(
            oracle.get_premium(OptionType::Call, 60_000.0, expiry).await,
            Err(OracleError::InsufficientConsensus { .. })
        );
    }

    #[tokio::test]
    async fn test_volatility_insufficient_without_history() {
        let clock = clock();
        let oracle = static_oracle(&[("coingecko", 60_000.0), ("kraken", 60_010.0)], &clock);

        assert_matches!(
            oracle.get_volatility(30, Methodology::LogReturn).await,
            Err(OracleError::InsufficientData { window_days: 30, available: 0, required: 30, .. })
        );
        assert_matches!(
            oracle.get_volatility(1, Methodology::LogReturn).await,
            Err(OracleError::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn test_source_health_lists_configured_sources() {
        let clock = clock();
        let oracle = static_oracle(&[("coingecko", 60_000.0), ("kraken", 60_010.0)], &clock);
        oracle.run_spot_cycle().await.unwrap();

        let health = oracle.source_health();
        let ids: Vec<&str> = health.iter().map(|h| h.source_id.as_str()).collect();
        assert_eq!(ids, vec!["coingecko", "kraken"]);
        assert!(health.iter().all(|h| h.last_success_at == Some(clock.now())));
        assert!(health.iter().all(|h| h.weight > 0.0));
    }
}
