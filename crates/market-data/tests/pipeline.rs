//! End-to-end pipeline tests: scripted sources, manual clock, in-memory store

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use common::{Capability, CircuitState, Clock, HistoricalClose, ManualClock, Methodology, PricePoint, SourceId};
use config::{OracleConfig, SourceKind};
use market_data::{OptionType, OracleError, PriceOracle, SharedAdapter, SourceAdapter, SourceError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use storage::{Disposition, HistoricalStore, InMemoryHistoricalStore, RetentionPolicy};

const IDS: [&str; 5] = ["coingecko", "binance", "kraken", "coinbase", "bitstamp"];

/// Replays queued spot responses, then reports `steady` (or a network error)
#[derive(Debug)]
struct ScriptedSource {
    id: SourceId,
    spot: Mutex<VecDeque<Result<f64, SourceError>>>,
    steady: Option<f64>,
    history: Vec<(NaiveDate, f64)>,
    calls: Mutex<u32>,
    clock: ManualClock,
}

impl ScriptedSource {
    fn new(id: &str, steady: Option<f64>, clock: &ManualClock) -> Self {
        Self {
            id: id.into(),
            spot: Mutex::new(VecDeque::new()),
            steady,
            history: Vec::new(),
            calls: Mutex::new(0),
            clock: clock.clone(),
        }
    }

    fn with_history(mut self, history: Vec<(NaiveDate, f64)>) -> Self {
        self.history = history;
        self
    }

    fn fail_next(&self, times: usize) {
        let mut spot = self.spot.lock();
        for _ in 0..times {
            spot.push_back(Err(SourceError::network(&self.id, "connection reset")));
        }
    }

    fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl SourceAdapter for ScriptedSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn supports(&self, capability: Capability) -> bool {
        capability == Capability::Spot || !self.history.is_empty()
    }

    async fn fetch_spot(&self) -> Result<PricePoint, SourceError> {
        *self.calls.lock() += 1;
        let next = self.spot.lock().pop_front();
        match next.or(self.steady.map(Ok)) {
            Some(Ok(price)) => Ok(PricePoint::new(self.id.clone(), price, self.clock.now(), 25)),
            Some(Err(e)) => Err(e),
            None => Err(SourceError::network(&self.id, "unreachable")),
        }
    }

    async fn fetch_historical(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<HistoricalClose>, SourceError> {
        Ok(self
            .history
            .iter()
            .filter(|(date, _)| *date >= from && *date <= to)
            .map(|(date, price)| HistoricalClose::new(*date, "BTC", *price, self.id.clone(), self.clock.now()))
            .collect())
    }
}

fn clock() -> ManualClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap())
}

fn test_config() -> OracleConfig {
    let mut config = config::generate_default_config();
    config.aggregation.min_sources = 3;
    for source in &mut config.sources {
        source.weight_prior = 1.0;
    }
    config.volatility.windows = vec![5];
    config.premium.volatility_window_days = 5;
    config.scheduler.backfill_days = 5;
    config
}

fn in_memory_store() -> Arc<dyn HistoricalStore> {
    let priority = IDS.iter().map(|id| SourceId::from(*id)).collect();
    Arc::new(InMemoryHistoricalStore::new(priority, RetentionPolicy::default()))
}

fn five_day_history(clock: &ManualClock) -> Vec<(NaiveDate, f64)> {
    let today = clock.now().date_naive();
    [58_000.0, 59_200.0, 58_700.0, 60_100.0, 59_600.0]
        .into_iter()
        .enumerate()
        .map(|(i, price)| (today - Duration::days(5 - i as i64), price))
        .collect()
}

fn oracle_with(sources: Vec<Arc<ScriptedSource>>, config: &OracleConfig, clock: &ManualClock) -> PriceOracle {
    let adapters: Vec<SharedAdapter> = sources.into_iter().map(|s| s as SharedAdapter).collect();
    PriceOracle::new(config, adapters, in_memory_store(), clock.shared())
}

#[tokio::test]
async fn test_five_sources_one_outlier() {
    let clock = clock();
    let prices = [60_000.0, 60_050.0, 60_100.0, 59_950.0, 80_000.0];
    let sources = IDS
        .iter()
        .zip(prices)
        .map(|(id, price)| Arc::new(ScriptedSource::new(id, Some(price), &clock)))
        .collect();
    let oracle = oracle_with(sources, &test_config(), &clock);

    let consensus = oracle.run_spot_cycle().await.unwrap();

    assert!((consensus.price - 60_025.0).abs() < 1e-9);
    assert!((consensus.confidence - 0.8).abs() < 1e-9);
    assert_eq!(consensus.contributing_sources.len(), 4);
    assert_eq!(consensus.outliers, vec![SourceId::from("bitstamp")]);

    let served = oracle.get_consensus_price().await.unwrap();
    assert_eq!(served.price, consensus.price);

    let health = oracle.source_health();
    let bitstamp = health.iter().find(|h| h.source_id.as_str() == "bitstamp").unwrap();
    assert!(bitstamp.last_deviation.unwrap() > 0.3);
}

#[tokio::test]
async fn test_too_few_agreeing_sources_is_insufficient_consensus() {
    let clock = clock();
    let sources = vec![
        Arc::new(ScriptedSource::new("coingecko", Some(60_000.0), &clock)),
        Arc::new(ScriptedSource::new("binance", Some(60_010.0), &clock)),
        Arc::new(ScriptedSource::new("kraken", None, &clock)),
        Arc::new(ScriptedSource::new("coinbase", None, &clock)),
        Arc::new(ScriptedSource::new("bitstamp", None, &clock)),
    ];
    let oracle = oracle_with(sources, &test_config(), &clock);

    let err = oracle.run_spot_cycle().await.unwrap_err();
    assert!(matches!(
        err,
        OracleError::InsufficientConsensus { contributing: 2, required: 3 }
    ));
    assert!(err.is_retryable());
    assert!(oracle.get_consensus_price().await.is_err());
}

#[tokio::test]
async fn test_stale_consensus_is_not_served() {
    let clock = clock();
    let sources = IDS
        .iter()
        .map(|id| Arc::new(ScriptedSource::new(id, Some(60_000.0), &clock)))
        .collect();
    let oracle = oracle_with(sources, &test_config(), &clock);

    oracle.run_spot_cycle().await.unwrap();
    clock.advance(Duration::seconds(121));

    assert!(matches!(
        oracle.get_consensus_price().await,
        Err(OracleError::InsufficientConsensus { .. })
    ));
}

#[tokio::test]
async fn test_failing_source_opens_then_closes_circuit() {
    let clock = clock();
    let sources: Vec<Arc<ScriptedSource>> = IDS
        .iter()
        .map(|id| Arc::new(ScriptedSource::new(id, Some(60_000.0), &clock)))
        .collect();
    let flaky = sources[4].clone();
    flaky.fail_next(3);
    let oracle = oracle_with(sources, &test_config(), &clock);
    let flaky_id = SourceId::from("bitstamp");

    for _ in 0..3 {
        let consensus = oracle.run_spot_cycle().await.unwrap();
        assert_eq!(consensus.contributing_sources.len(), 4);
    }
    assert_eq!(oracle.resilience().circuit_state(&flaky_id), Some(CircuitState::Open));

    let weights = oracle.weights();
    assert!(weights[&flaky_id] < weights[&SourceId::from("coingecko")]);

    // Open circuit: no call reaches the adapter
    oracle.run_spot_cycle().await.unwrap();
    assert_eq!(flaky.calls(), 3);

    clock.advance(Duration::seconds(31));
    assert_eq!(oracle.resilience().circuit_state(&flaky_id), Some(CircuitState::HalfOpen));

    let consensus = oracle.run_spot_cycle().await.unwrap();
    assert_eq!(consensus.contributing_sources.len(), 5);
    assert_eq!(oracle.resilience().circuit_state(&flaky_id), Some(CircuitState::Closed));

    let health = oracle.source_health();
    assert_eq!(health[4].consecutive_failures, 0);
    assert_eq!(health[4].circuit_state, CircuitState::Closed);
}

#[tokio::test]
async fn test_daily_close_backfill_and_same_day_conflict() {
    let clock = clock();
    let history = five_day_history(&clock);
    let sources = IDS
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let source = ScriptedSource::new(id, Some(60_000.0), &clock);
            Arc::new(if i == 0 { source.with_history(history.clone()) } else { source })
        })
        .collect();
    let oracle = oracle_with(sources, &test_config(), &clock);

    let report = oracle.run_daily_close().await.unwrap();
    assert_eq!(report.fetched, 5);
    assert_eq!(report.inserted, 5);

    // Same day again from a lower-priority source loses and is audited
    let yesterday = clock.now().date_naive() - Duration::days(1);
    let mut report = Default::default();
    let late = HistoricalClose::new(yesterday, "BTC", 61_000.0, "bitstamp".into(), clock.now());
    oracle.append(late, &mut report).await.unwrap();
    assert_eq!(report.rejected, 1);

    let stored = oracle.store().latest("BTC").await.unwrap().unwrap();
    assert_eq!(stored.price, 59_600.0);
    assert_eq!(stored.source_id.as_str(), "coingecko");

    let audit = oracle.store().audit_trail("BTC", yesterday).await.unwrap();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].disposition, Disposition::Rejected);
    assert_eq!(audit[0].close.source_id.as_str(), "bitstamp");

    // Nothing left to fetch today
    let again = oracle.run_daily_close().await.unwrap();
    assert_eq!(again.fetched, 0);

    let vol = oracle.get_volatility(5, Methodology::LogReturn).await.unwrap();
    assert_eq!(vol.sample_count, 5);
    assert!(vol.value.unwrap() > 0.0);
}

#[tokio::test]
async fn test_premium_from_consensus_and_history() {
    let clock = clock();
    let history = five_day_history(&clock);
    let sources = IDS
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let source = ScriptedSource::new(id, Some(60_000.0), &clock);
            Arc::new(if i == 0 { source.with_history(history.clone()) } else { source })
        })
        .collect();
    let oracle = oracle_with(sources, &test_config(), &clock);

    let expiry = clock.now() + Duration::days(30);
    assert!(matches!(
        oracle.get_premium(OptionType::Call, 60_000.0, expiry).await,
        Err(OracleError::InsufficientConsensus { .. })
    ));

    oracle.run_spot_cycle().await.unwrap();
    assert!(matches!(
        oracle.get_premium(OptionType::Call, 60_000.0, expiry).await,
        Err(OracleError::InsufficientData { .. })
    ));

    oracle.run_daily_close().await.unwrap();
    let call = oracle.get_premium(OptionType::Call, 60_000.0, expiry).await.unwrap();
    let put = oracle.get_premium(OptionType::Put, 60_000.0, expiry).await.unwrap();

    assert!(call.premium > 0.0);
    assert_eq!(call.underlying_price, 60_000.0);
    // Zero rate, at the money: put-call parity gives equal premiums
    assert!((call.premium - put.premium).abs() < 1e-6);

    assert!(matches!(
        oracle.get_premium(OptionType::Call, -1.0, expiry).await,
        Err(OracleError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_flat_history_is_retryable_not_an_input_error() {
    let clock = clock();
    let today = clock.now().date_naive();
    let flat: Vec<(NaiveDate, f64)> = (1..=5).rev().map(|d| (today - Duration::days(d), 60_000.0)).collect();
    let sources = IDS
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let source = ScriptedSource::new(id, Some(60_000.0), &clock);
            Arc::new(if i == 0 { source.with_history(flat.clone()) } else { source })
        })
        .collect();
    let oracle = oracle_with(sources, &test_config(), &clock);

    oracle.run_daily_close().await.unwrap();
    oracle.run_spot_cycle().await.unwrap();

    let vol = oracle.get_volatility(5, Methodology::LogReturn).await.unwrap();
    assert_eq!(vol.value, Some(0.0));

    let err = oracle
        .get_premium(OptionType::Call, 60_000.0, clock.now() + Duration::days(30))
        .await
        .unwrap_err();
    assert!(matches!(err, OracleError::ZeroVolatility { window_days: 5, .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_snapshot_restores_history_and_health() {
    let clock = clock();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.storage.data_dir = dir.path().to_string_lossy().into_owned();
    for source in &mut config.sources {
        source.kind = SourceKind::Static;
        source.static_price = Some(60_000.0);
    }

    let history = five_day_history(&clock);
    let sources: Vec<Arc<ScriptedSource>> = IDS
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let source = ScriptedSource::new(id, Some(60_000.0), &clock);
            Arc::new(if i == 0 { source.with_history(history.clone()) } else { source })
        })
        .collect();
    sources[2].fail_next(3);
    let oracle = oracle_with(sources, &config, &clock)
        .with_snapshots(storage::SnapshotStore::open(dir.path()).unwrap());

    oracle.run_daily_close().await.unwrap();
    for _ in 0..3 {
        oracle.run_spot_cycle().await.unwrap();
    }
    oracle.snapshot().await.unwrap();

    let restored = PriceOracle::from_config(&config, clock.shared()).await.unwrap();

    let latest = restored.store().latest("BTC").await.unwrap().unwrap();
    assert_eq!(latest.price, 59_600.0);
    assert_eq!(
        restored.resilience().circuit_state(&"kraken".into()),
        Some(CircuitState::Open)
    );
    assert!(restored.weights()[&SourceId::from("kraken")] < 1.0);
    assert!(restored.get_volatility(5, Methodology::Ewma).await.is_ok());
}
