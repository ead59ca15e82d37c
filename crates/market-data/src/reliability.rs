//! Per-source reliability weights
//!
//! Raw score = success ratio × latency factor × deviation factor × prior, where
//! the latency factor is `1 / (1 + p90 / reference)` and the deviation factor
//! is `exp(-deviation / scale)`. The published weight is an exponential
//! average of raw scores clamped to `[floor, ceiling]`.
//!
//! Weights only change a source's influence on the consensus; whether a
//! source is called at all is the circuit breaker's decision.

use chrono::{DateTime, Utc};
use common::{SourceHealth, SourceId};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliabilitySettings {
    pub window_size: usize,
    pub smoothing: f64,
    pub weight_floor: f64,
    pub weight_ceiling: f64,
    pub latency_reference_ms: f64,
    pub deviation_scale: f64,
}

impl From<&config::ReliabilityConfig> for ReliabilitySettings {
    fn from(config: &config::ReliabilityConfig) -> Self {
        Self {
            window_size: config.window_size.max(1),
            smoothing: config.smoothing,
            weight_floor: config.weight_floor,
            weight_ceiling: config.weight_ceiling,
            latency_reference_ms: config.latency_reference_ms.max(1) as f64,
            deviation_scale: config.deviation_scale,
        }
    }
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        Self::from(&config::ReliabilityConfig::default())
    }
}

#[derive(Debug, Clone, Copy)]
struct Outcome {
    success: bool,
    latency_ms: u64,
}

#[derive(Debug)]
struct SourceStats {
    prior: f64,
    weight: f64,
    outcomes: VecDeque<Outcome>,
    last_success_at: Option<DateTime<Utc>>,
    last_deviation: Option<f64>,
}

impl SourceStats {
    fn success_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let ok = self.outcomes.iter().filter(|o| o.success).count();
        ok as f64 / self.outcomes.len() as f64
    }

    fn p90_latency_ms(&self) -> Option<f64> {
        let mut latencies: Vec<u64> = self
            .outcomes
            .iter()
            .filter(|o| o.success)
            .map(|o| o.latency_ms)
            .collect();
        if latencies.is_empty() {
            return None;
        }
        latencies.sort_unstable();
        let rank = ((latencies.len() as f64) * 0.9).ceil() as usize;
        latencies.get(rank.saturating_sub(1)).map(|&l| l as f64)
    }
}

/// Weight table for the configured sources
///
/// Each source has its own lock, so updates for one source never wait on
/// another.
#[derive(Debug)]
pub struct ReliabilityTracker {
    settings: ReliabilitySettings,
    sources: HashMap<SourceId, Mutex<SourceStats>>,
    order: Vec<SourceId>,
}

impl ReliabilityTracker {
    /// Sources with their configured `weight_prior`
    pub fn new(settings: ReliabilitySettings, priors: impl IntoIterator<Item = (SourceId, f64)>) -> Self {
        let mut sources = HashMap::new();
        let mut order = Vec::new();
        for (id, prior) in priors {
            let weight = prior.clamp(settings.weight_floor, settings.weight_ceiling);
            order.push(id.clone());
            sources.insert(
                id,
                Mutex::new(SourceStats {
                    prior,
                    weight,
                    outcomes: VecDeque::with_capacity(settings.window_size),
                    last_success_at: None,
                    last_deviation: None,
                }),
            );
        }
        Self {
            settings,
            sources,
            order,
        }
    }

    fn push(&self, id: &SourceId, outcome: Outcome) {
        if let Some(stats) = self.sources.get(id) {
            let mut stats = stats.lock();
            if stats.outcomes.len() == self.settings.window_size {
                stats.outcomes.pop_front();
            }
            stats.outcomes.push_back(outcome);
        }
    }

    pub fn record_success(&self, id: &SourceId, latency_ms: u64, at: DateTime<Utc>) {
        self.push(id, Outcome { success: true, latency_ms });
        if let Some(stats) = self.sources.get(id) {
            stats.lock().last_success_at = Some(at);
        }
    }

    pub fn record_failure(&self, id: &SourceId) {
        self.push(id, Outcome { success: false, latency_ms: 0 });
    }

    /// Relative deviation `|price - consensus| / consensus` of the source's
    /// last contribution
    pub fn record_deviation(&self, id: &SourceId, deviation: f64) {
        if let Some(stats) = self.sources.get(id) {
            stats.lock().last_deviation = Some(deviation.abs());
        }
    }

    fn raw_score(&self, stats: &SourceStats) -> f64 {
        let latency_factor = stats
            .p90_latency_ms()
            .map(|p90| 1.0 / (1.0 + p90 / self.settings.latency_reference_ms))
            .unwrap_or(1.0);
        let deviation_factor = stats
            .last_deviation
            .map(|d| (-d / self.settings.deviation_scale).exp())
            .unwrap_or(1.0);
        stats.success_ratio() * latency_factor * deviation_factor * stats.prior
    }

    /// Fold the latest observations into every weight; run once per
    /// aggregation cycle
    pub fn recompute(&self) {
        let alpha = self.settings.smoothing;
        for stats in self.sources.values() {
            let mut stats = stats.lock();
            let score = self.raw_score(&stats);
            let smoothed = (1.0 - alpha) * stats.weight + alpha * score;
            stats.weight = smoothed.clamp(self.settings.weight_floor, self.settings.weight_ceiling);
        }
    }

    /// Current weight; unknown sources get the floor
    pub fn weight(&self, id: &SourceId) -> f64 {
        self.sources
            .get(id)
            .map(|s| s.lock().weight)
            .unwrap_or(self.settings.weight_floor)
    }

    pub fn weights(&self) -> HashMap<SourceId, f64> {
        self.sources
            .iter()
            .map(|(id, s)| (id.clone(), s.lock().weight))
            .collect()
    }

    /// Sum of the weights of every configured source
    pub fn total_weight(&self) -> f64 {
        self.sources.values().map(|s| s.lock().weight).sum()
    }

    /// Overwrite weight and history markers from a persisted record
    pub fn restore(&self, health: &SourceHealth) {
        if let Some(stats) = self.sources.get(&health.source_id) {
            let mut stats = stats.lock();
            stats.weight = health
                .weight
                .clamp(self.settings.weight_floor, self.settings.weight_ceiling);
            stats.last_success_at = health.last_success_at;
            stats.last_deviation = health.last_deviation;
        }
    }

    /// Weight-related fields of a health record, in configured order
    pub fn fill_health(&self, health: &mut SourceHealth) {
        if let Some(stats) = self.sources.get(&health.source_id) {
            let stats = stats.lock();
            health.weight = stats.weight;
            health.last_success_at = stats.last_success_at;
            health.last_deviation = stats.last_deviation;
        }
    }

    pub fn sources(&self) -> &[SourceId] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tracker() -> ReliabilityTracker {
        ReliabilityTracker::new(
            ReliabilitySettings {
                window_size: 10,
                smoothing: 0.5,
                weight_floor: 0.1,
                weight_ceiling: 2.0,
                latency_reference_ms: 1000.0,
                deviation_scale: 0.01,
            },
            vec![("a".into(), 1.0), ("b".into(), 1.0), ("c".into(), 5.0)],
        )
    }

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_initial_weights_are_clamped_priors() {
        let t = tracker();
        assert_eq!(t.weight(&"a".into()), 1.0);
        assert_eq!(t.weight(&"c".into()), 2.0);
        assert_eq!(t.weight(&"unknown".into()), 0.1);
        assert_eq!(t.total_weight(), 4.0);
    }

    #[test]
    fn test_failures_and_deviation_reduce_weight_to_floor_gradually() {
        let t = tracker();
        let a: SourceId = "a".into();
        let b: SourceId = "b".into();

        for _ in 0..5 {
            t.record_success(&a, 100, at());
            t.record_failure(&b);
        }
        t.record_deviation(&a, 0.0001);
        t.recompute();

        let wa = t.weight(&a);
        let wb = t.weight(&b);
        assert!(wa > wb);
        // Smoothing: a single bad cycle halves the weight at most
        assert!(wb >= 0.5 - 1e-12);

        for _ in 0..20 {
            t.recompute();
        }
        assert_eq!(t.weight(&b), 0.1);
        assert!(t.weight(&a) > 0.85);
    }

    #[test]
    fn test_outlier_deviation_penalized() {
        let t = tracker();
        let a: SourceId = "a".into();
        let b: SourceId = "b".into();
        t.record_success(&a, 100, at());
        t.record_success(&b, 100, at());
        t.record_deviation(&a, 0.0);
        t.record_deviation(&b, 0.05);
        t.recompute();

        assert!(t.weight(&a) > t.weight(&b));
    }

    #[test]
    fn test_health_round_trip() {
        let t = tracker();
        let mut health = SourceHealth::new("b".into(), 0.3);
        health.last_success_at = Some(at());
        t.restore(&health);

        let mut out = SourceHealth::new("b".into(), 0.0);
        t.fill_health(&mut out);
        assert_eq!(out.weight, 0.3);
        assert_eq!(out.last_success_at, Some(at()));
    }
}
