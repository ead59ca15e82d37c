//! Circuit breakers and fallback around the source adapters
//!
//! Every adapter call goes through here. A spot fetch that cannot be made or
//! fails falls back to the source's last known point; historical fetches walk
//! the configured priority list, trying each source at most once.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use common::{Capability, CircuitState, HistoricalClose, PricePoint, SharedClock, SourceHealth, SourceId};
use futures::future::join_all;
use observability::PipelineMetrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{Admission, BreakerSettings, CircuitBreaker};
use crate::error::{OracleError, Result, SourceError};
use crate::sources::SharedAdapter;

/// Result of asking one source for a spot price
#[derive(Debug, Clone, PartialEq)]
pub enum SpotOutcome {
    Fresh(PricePoint),
    /// Last known good point, served because the source is open or failed
    Cached(PricePoint),
    Unavailable(String),
}

impl SpotOutcome {
    pub fn point(&self) -> Option<&PricePoint> {
        match self {
            SpotOutcome::Fresh(p) | SpotOutcome::Cached(p) => Some(p),
            SpotOutcome::Unavailable(_) => None,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, SpotOutcome::Fresh(_))
    }
}

/// One source's spot fetch within a cycle
#[derive(Debug, Clone)]
pub struct SpotFetch {
    pub source_id: SourceId,
    pub outcome: SpotOutcome,
    /// The adapter was actually called (the circuit admitted the request)
    pub attempted: bool,
}

struct SourceSlot {
    adapter: SharedAdapter,
    breaker: Mutex<CircuitBreaker>,
    last_known: Mutex<Option<PricePoint>>,
    rate_limit_cooldown: Duration,
}

/// Hands a granted half-open trial back if the fetch is dropped before it
/// records an outcome
struct TrialGuard<'a> {
    breaker: Option<&'a Mutex<CircuitBreaker>>,
}

impl<'a> TrialGuard<'a> {
    fn new(breaker: &'a Mutex<CircuitBreaker>, admission: Admission) -> Self {
        Self {
            breaker: (admission == Admission::Trial).then_some(breaker),
        }
    }

    fn disarm(&mut self) {
        self.breaker = None;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(breaker) = self.breaker.take() {
            breaker.lock().abandon_trial();
        }
    }
}

pub struct ResilienceController {
    slots: Vec<SourceSlot>,
    by_id: HashMap<SourceId, usize>,
    settings: BreakerSettings,
    request_timeout: std::time::Duration,
    clock: SharedClock,
    metrics: PipelineMetrics,
}

fn state_code(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

impl ResilienceController {
    /// `adapters` in configured order; per-provider rate-limit cooldowns are
    /// looked up in `cooldowns`
    pub fn new(
        adapters: Vec<SharedAdapter>,
        settings: BreakerSettings,
        cooldowns: &HashMap<SourceId, Duration>,
        request_timeout: std::time::Duration,
        clock: SharedClock,
    ) -> Self {
        let metrics = PipelineMetrics::new();
        let mut by_id = HashMap::new();
        let slots = adapters
            .into_iter()
            .enumerate()
            .map(|(i, adapter)| {
                by_id.insert(adapter.id().clone(), i);
                metrics.set_circuit_state(adapter.id().as_str(), 0);
                SourceSlot {
                    rate_limit_cooldown: cooldowns
                        .get(adapter.id())
                        .copied()
                        .unwrap_or(settings.rate_limit_cooldown),
                    adapter,
                    breaker: Mutex::new(CircuitBreaker::new(settings)),
                    last_known: Mutex::new(None),
                }
            })
            .collect();

        Self {
            slots,
            by_id,
            settings,
            request_timeout,
            clock,
            metrics,
        }
    }

    pub fn from_config(config: &config::OracleConfig, adapters: Vec<SharedAdapter>, clock: SharedClock) -> Self {
        let cooldowns = config
            .enabled_sources()
            .filter_map(|s| {
                s.rate_limit_cooldown_secs
                    .map(|secs| (SourceId::new(s.provider_id.clone()), Duration::seconds(secs as i64)))
            })
            .collect();
        Self::new(
            adapters,
            BreakerSettings::from(&config.circuit_breaker),
            &cooldowns,
            std::time::Duration::from_secs(config.circuit_breaker.request_timeout_secs),
            clock,
        )
    }

    /// Sources in spot priority (configured) order
    pub fn spot_priority(&self) -> Vec<SourceId> {
        self.slots.iter().map(|s| s.adapter.id().clone()).collect()
    }

    /// Sources with historical capability, in priority order
    pub fn historical_priority(&self) -> Vec<SourceId> {
        self.slots
            .iter()
            .filter(|s| s.adapter.supports(Capability::Historical))
            .map(|s| s.adapter.id().clone())
            .collect()
    }

    pub fn circuit_state(&self, source: &SourceId) -> Option<CircuitState> {
        let now = self.clock.now();
        self.slot(source).map(|s| s.breaker.lock().state(now))
    }

    fn slot(&self, source: &SourceId) -> Option<&SourceSlot> {
        self.by_id.get(source).and_then(|&i| self.slots.get(i))
    }

    /// Spot fetch from every configured source concurrently
    pub async fn fetch_all_spot(&self) -> Vec<SpotFetch> {
        join_all(self.slots.iter().map(|slot| self.fetch_slot_spot(slot))).await
    }

    /// Spot fetch from one source
    pub async fn fetch_spot(&self, source: &SourceId) -> SpotOutcome {
        match self.slot(source) {
            Some(slot) => self.fetch_slot_spot(slot).await.outcome,
            None => SpotOutcome::Unavailable(format!("unknown source {}", source)),
        }
    }

    async fn fetch_slot_spot(&self, slot: &SourceSlot) -> SpotFetch {
        let id = slot.adapter.id().clone();
        let admission = slot.breaker.lock().try_acquire(self.clock.now());

        if let Admission::Rejected { retry_at } = admission {
            debug!(source = %id, ?retry_at, "Circuit open, skipping fetch");
            return SpotFetch {
                outcome: self.fallback(slot, "circuit open".to_string()),
                source_id: id,
                attempted: false,
            };
        }

        let mut trial = TrialGuard::new(&slot.breaker, admission);
        let started = Instant::now();
        let result = match tokio::time::timeout(self.request_timeout, slot.adapter.fetch_spot()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::timeout(&id, "request timed out")),
        };
        let latency = started.elapsed();
        trial.disarm();

        let outcome = match result {
            Ok(point) => {
                self.metrics.record_fetch(id.as_str(), "ok", latency);
                self.on_success(slot);
                *slot.last_known.lock() = Some(point.clone());
                SpotOutcome::Fresh(point)
            }
            Err(e) => {
                self.metrics.record_fetch(id.as_str(), e.kind.as_str(), latency);
                warn!(source = %id, error = %e, "Spot fetch failed");
                self.on_failure(slot, &e);
                self.fallback(slot, e.to_string())
            }
        };

        SpotFetch {
            source_id: id,
            outcome,
            attempted: true,
        }
    }

    fn fallback(&self, slot: &SourceSlot, reason: String) -> SpotOutcome {
        match slot.last_known.lock().clone() {
            Some(point) => SpotOutcome::Cached(point),
            None => SpotOutcome::Unavailable(reason),
        }
    }

    /// Closes for `[from, to]` from the first historical source that answers
    pub async fn fetch_historical(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<HistoricalClose>> {
        let mut reasons = Vec::new();

        for slot in self.slots.iter().filter(|s| s.adapter.supports(Capability::Historical)) {
            let id = slot.adapter.id();
            let admission = slot.breaker.lock().try_acquire(self.clock.now());
            if let Admission::Rejected { .. } = admission {
                reasons.push(format!("{}: circuit open", id));
                continue;
            }

            let mut trial = TrialGuard::new(&slot.breaker, admission);
            let started = Instant::now();
            let result = match tokio::time::timeout(self.request_timeout, slot.adapter.fetch_historical(from, to)).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::timeout(id, "request timed out")),
            };
            trial.disarm();

            match result {
                Ok(closes) => {
                    self.metrics.record_fetch(id.as_str(), "ok", started.elapsed());
                    self.on_success(slot);
                    debug!(source = %id, count = closes.len(), %from, %to, "Fetched historical closes");
                    return Ok(closes);
                }
                Err(e) => {
                    self.metrics.record_fetch(id.as_str(), e.kind.as_str(), started.elapsed());
                    warn!(source = %id, error = %e, "Historical fetch failed, trying next source");
                    self.on_failure(slot, &e);
                    reasons.push(e.to_string());
                }
            }
        }

        Err(OracleError::Unavailable(if reasons.is_empty() {
            "historical data: no source configured".to_string()
        } else {
            format!("historical data: {}", reasons.join("; "))
        }))
    }

    fn on_success(&self, slot: &SourceSlot) {
        let now = self.clock.now();
        if let Some(state) = slot.breaker.lock().record_success(now) {
            info!(source = %slot.adapter.id(), "Circuit closed");
            self.metrics.set_circuit_state(slot.adapter.id().as_str(), state_code(state));
        }
    }

    fn on_failure(&self, slot: &SourceSlot, error: &SourceError) {
        let now = self.clock.now();
        let changed = {
            let mut breaker = slot.breaker.lock();
            if error.is_rate_limited() {
                let retry_after = error
                    .retry_after
                    .and_then(|d| Duration::from_std(d).ok())
                    .unwrap_or_else(Duration::zero);
                breaker.record_rate_limited(now, slot.rate_limit_cooldown.max(retry_after))
            } else {
                breaker.record_failure(now)
            }
        };

        if let Some(state) = changed {
            let until = slot.breaker.lock().open_until();
            warn!(source = %slot.adapter.id(), ?until, error = %error, "Circuit opened");
            self.metrics.set_circuit_state(slot.adapter.id().as_str(), state_code(state));
        }
    }

    /// Circuit fields of every source's health record, configured order
    pub fn health(&self) -> Vec<SourceHealth> {
        let now = self.clock.now();
        self.slots
            .iter()
            .map(|slot| {
                let breaker = slot.breaker.lock();
                let mut health = SourceHealth::new(slot.adapter.id().clone(), 0.0);
                health.circuit_state = breaker.state(now);
                health.consecutive_failures = breaker.consecutive_failures();
                health
            })
            .collect()
    }

    /// Resume circuit state from persisted records; unknown sources are ignored
    pub fn restore(&self, records: &[SourceHealth], now: DateTime<Utc>) {
        for record in records {
            if let Some(slot) = self.slot(&record.source_id) {
                let breaker = CircuitBreaker::from_health(self.settings, record, now);
                self.metrics
                    .set_circuit_state(record.source_id.as_str(), state_code(breaker.state(now)));
                *slot.breaker.lock() = breaker;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::SourceAdapter;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use common::{Clock, ManualClock};
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Adapter replaying queued responses; empty queue means network error
    #[derive(Debug)]
    struct Scripted {
        id: SourceId,
        historical: bool,
        spot: Mutex<VecDeque<std::result::Result<f64, SourceError>>>,
        calls: Mutex<u32>,
        clock: SharedClock,
    }

    impl Scripted {
        fn new(id: &str, historical: bool, clock: SharedClock) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                historical,
                spot: Mutex::new(VecDeque::new()),
                calls: Mutex::new(0),
                clock,
            })
        }

        fn push(&self, r: std::result::Result<f64, SourceError>) {
            self.spot.lock().push_back(r);
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl SourceAdapter for Scripted {
        fn id(&self) -> &SourceId {
            &self.id
        }

        fn supports(&self, capability: Capability) -> bool {
            capability == Capability::Spot || self.historical
        }

        async fn fetch_spot(&self) -> std::result::Result<PricePoint, SourceError> {
            *self.calls.lock() += 1;
            let next = self.spot.lock().pop_front();
            match next {
                Some(Ok(price)) => Ok(PricePoint::new(self.id.clone(), price, self.clock.now(), 10)),
                Some(Err(e)) => Err(e),
                None => Err(SourceError::network(&self.id, "down")),
            }
        }

        async fn fetch_historical(
            &self,
            from: NaiveDate,
            _to: NaiveDate,
        ) -> std::result::Result<Vec<HistoricalClose>, SourceError> {
            *self.calls.lock() += 1;
            let next = self.spot.lock().pop_front();
            match next {
                Some(Ok(price)) => Ok(vec![HistoricalClose::new(from, "BTC", price, self.id.clone(), self.clock.now())]),
                Some(Err(e)) => Err(e),
                None => Err(SourceError::network(&self.id, "down")),
            }
        }
    }

    /// Answers the first `answers` spot calls, then never completes
    #[derive(Debug)]
    struct Hanging {
        id: SourceId,
        answers: Mutex<u32>,
        calls: Mutex<u32>,
        clock: SharedClock,
    }

    impl Hanging {
        fn new(id: &str, answers: u32, clock: SharedClock) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                answers: Mutex::new(answers),
                calls: Mutex::new(0),
                clock,
            })
        }
    }

    #[async_trait]
    impl SourceAdapter for Hanging {
        fn id(&self) -> &SourceId {
            &self.id
        }

        fn supports(&self, capability: Capability) -> bool {
            capability == Capability::Spot
        }

        async fn fetch_spot(&self) -> std::result::Result<PricePoint, SourceError> {
            *self.calls.lock() += 1;
            let answer = {
                let mut answers = self.answers.lock();
                let answer = *answers > 0;
                *answers = answers.saturating_sub(1);
                answer
            };
            if answer {
                return Ok(PricePoint::new(self.id.clone(), 100.0, self.clock.now(), 10));
            }
            std::future::pending().await
        }

        async fn fetch_historical(
            &self,
            _from: NaiveDate,
            _to: NaiveDate,
        ) -> std::result::Result<Vec<HistoricalClose>, SourceError> {
            std::future::pending().await
        }
    }

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 2,
            base_cooldown: Duration::seconds(30),
            max_cooldown: Duration::seconds(120),
            rate_limit_cooldown: Duration::seconds(60),
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap())
    }

    fn controller(adapters: Vec<SharedAdapter>, clock: &ManualClock) -> ResilienceController {
        ResilienceController::new(
            adapters,
            settings(),
            &HashMap::new(),
            std::time::Duration::from_secs(5),
            clock.shared(),
        )
    }

    #[tokio::test]
    async fn test_failure_serves_cached_then_open_circuit_skips_calls() {
        let clock = clock();
        let a = Scripted::new("a", false, clock.shared());
        a.push(Ok(100.0));
        let rc = controller(vec![a.clone()], &clock);
        let id = SourceId::from("a");

        assert_matches!(rc.fetch_spot(&id).await, SpotOutcome::Fresh(p) if p.price == 100.0);
        assert_matches!(rc.fetch_spot(&id).await, SpotOutcome::Cached(p) if p.price == 100.0);
        assert_matches!(rc.fetch_spot(&id).await, SpotOutcome::Cached(_));
        assert_eq!(rc.circuit_state(&id), Some(CircuitState::Open));
        assert_eq!(a.calls(), 3);

        // Open: served from cache without calling the adapter
        assert_matches!(rc.fetch_spot(&id).await, SpotOutcome::Cached(_));
        assert_eq!(a.calls(), 3);

        clock.advance(Duration::seconds(30));
        a.push(Ok(101.0));
        assert_matches!(rc.fetch_spot(&id).await, SpotOutcome::Fresh(p) if p.price == 101.0);
        assert_eq!(rc.circuit_state(&id), Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_unavailable_without_cache() {
        let clock = clock();
        let rc = controller(vec![Scripted::new("a", false, clock.shared())], &clock);
        let fetches = rc.fetch_all_spot().await;

        assert_eq!(fetches.len(), 1);
        assert!(fetches[0].attempted);
        assert_matches!(fetches[0].outcome, SpotOutcome::Unavailable(_));
    }

    #[tokio::test]
    async fn test_rate_limit_uses_longer_of_configured_and_retry_after() {
        let clock = clock();
        let a = Scripted::new("a", false, clock.shared());
        a.push(Err(SourceError::rate_limited(
            &SourceId::from("a"),
            Some(std::time::Duration::from_secs(90)),
        )));
        let rc = controller(vec![a.clone()], &clock);
        let id = SourceId::from("a");

        rc.fetch_spot(&id).await;
        assert_eq!(rc.circuit_state(&id), Some(CircuitState::Open));

        clock.advance(Duration::seconds(89));
        assert_eq!(rc.circuit_state(&id), Some(CircuitState::Open));
        clock.advance(Duration::seconds(1));
        assert_eq!(rc.circuit_state(&id), Some(CircuitState::HalfOpen));
    }

    #[tokio::test]
    async fn test_historical_falls_back_in_priority_order() {
        let clock = clock();
        let primary = Scripted::new("primary", true, clock.shared());
        let spot_only = Scripted::new("spot", false, clock.shared());
        let secondary = Scripted::new("secondary", true, clock.shared());
        secondary.push(Ok(50_000.0));

        let rc = controller(vec![primary.clone(), spot_only.clone(), secondary.clone()], &clock);
        assert_eq!(
            rc.historical_priority(),
            vec![SourceId::from("primary"), SourceId::from("secondary")]
        );

        let day = NaiveDate::from_ymd_opt(2024, 5, 31).unwrap();
        let closes = rc.fetch_historical(day, day).await.unwrap();
        assert_eq!(closes[0].source_id, SourceId::from("secondary"));
        assert_eq!(primary.calls(), 1);
        assert_eq!(spot_only.calls(), 0);

        let err = rc.fetch_historical(day, day).await.unwrap_err();
        assert_matches!(err, OracleError::Unavailable(_));
        assert_eq!(primary.calls(), 2);
        assert_eq!(secondary.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_source_is_abandoned_and_served_from_cache() {
        let clock = clock();
        let slow = Hanging::new("slow", 1, clock.shared());
        let fast = Scripted::new("fast", false, clock.shared());
        fast.push(Ok(100.5));
        fast.push(Ok(101.0));
        let rc = controller(vec![slow.clone(), fast.clone()], &clock);

        let first = rc.fetch_all_spot().await;
        assert!(first.iter().all(|f| f.outcome.is_fresh()));

        let started = tokio::time::Instant::now();
        let second = rc.fetch_all_spot().await;
        let waited = started.elapsed();
        assert!(waited >= std::time::Duration::from_secs(5));
        assert!(waited < std::time::Duration::from_secs(6));

        assert!(second[0].attempted);
        assert_matches!(&second[0].outcome, SpotOutcome::Cached(p) if p.price == 100.0);
        assert_matches!(&second[1].outcome, SpotOutcome::Fresh(p) if p.price == 101.0);

        let health = rc.health();
        assert_eq!(health[0].consecutive_failures, 1);
        assert_eq!(health[1].consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_dropped_trial_fetch_releases_half_open_circuit() {
        use futures::FutureExt;

        let clock = clock();
        let slow = Hanging::new("slow", 0, clock.shared());
        let rc = controller(vec![slow.clone()], &clock);
        let id = SourceId::from("slow");

        let mut record = SourceHealth::new(id.clone(), 1.0);
        record.circuit_state = CircuitState::Open;
        rc.restore(&[record], clock.now());
        clock.advance(Duration::seconds(30));

        // Trial admitted, then abandoned mid-flight
        assert!(rc.fetch_spot(&id).now_or_never().is_none());
        assert_eq!(*slow.calls.lock(), 1);
        assert_eq!(rc.circuit_state(&id), Some(CircuitState::HalfOpen));

        assert!(rc.fetch_spot(&id).now_or_never().is_none());
        assert_eq!(*slow.calls.lock(), 2);
    }

    #[tokio::test]
    async fn test_restore_reopens_circuit() {
        let clock = clock();
        let rc = controller(vec![Scripted::new("a", false, clock.shared())], &clock);
        let mut record = SourceHealth::new("a".into(), 1.0);
        record.circuit_state = CircuitState::Open;
        record.consecutive_failures = 4;

        rc.restore(&[record], clock.now());
        let health = rc.health();
        assert_eq!(health[0].circuit_state, CircuitState::Open);
        assert_eq!(health[0].consecutive_failures, 4);
    }
}
