//! Weighted-median consensus with outlier rejection
//!
//! One aggregation cycle:
//! 1. drop points older than the staleness threshold, keep the freshest per source
//! 2. weighted median of what is left
//! 3. drop points further than `multiple × dispersion` from that median
//! 4. weighted median again over the survivors
//!
//! Dispersion is the largest of the rolling standard deviation of recent
//! consensus prices, the scaled weighted MAD of the current points, and a
//! floor proportional to the median.

use chrono::{DateTime, Duration, Utc};
use common::{PricePoint, SourceId};
use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tracing::debug;

use crate::error::{OracleError, Result};
use crate::types::ConsensusPrice;

/// Scales MAD to a standard deviation for normal data
const MAD_SCALE: f64 = 1.4826;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorSettings {
    pub staleness: Duration,
    pub outlier_multiple: f64,
    pub min_sources: usize,
    pub min_deviation_fraction: f64,
    pub rolling_window: usize,
}

impl From<&config::AggregationConfig> for AggregatorSettings {
    fn from(config: &config::AggregationConfig) -> Self {
        Self {
            staleness: Duration::seconds(config.staleness_threshold_secs as i64),
            outlier_multiple: config.outlier_deviation_multiple,
            min_sources: config.min_sources.max(1),
            min_deviation_fraction: config.min_deviation_fraction,
            rolling_window: config.rolling_window.max(2),
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self::from(&config::AggregationConfig::default())
    }
}

/// Weighted median of `(price, weight)` pairs
///
/// When the cumulative weight lands exactly on half the total, the result is
/// the midpoint of that price and the next one. Non-positive weights are
/// ignored; returns `None` if nothing remains.
pub fn weighted_median(values: &[(f64, f64)]) -> Option<f64> {
    let mut sorted: Vec<(f64, f64)> = values.iter().copied().filter(|(_, w)| *w > 0.0).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by_key(|(price, _)| OrderedFloat(*price));

    let total: f64 = sorted.iter().map(|(_, w)| w).sum();
    let half = total / 2.0;
    let eps = total * 1e-12;

    let mut cumulative = 0.0;
    for (i, (price, weight)) in sorted.iter().enumerate() {
        cumulative += weight;
        if (cumulative - half).abs() <= eps {
            let next = sorted.get(i + 1).map(|(p, _)| *p).unwrap_or(*price);
            return Some((price + next) / 2.0);
        }
        if cumulative > half {
            return Some(*price);
        }
    }
    sorted.last().map(|(p, _)| *p)
}

fn std_dev(values: &VecDeque<f64>) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}

/// Computes one consensus price per cycle and remembers recent results for
/// the rolling dispersion estimate
#[derive(Debug)]
pub struct Aggregator {
    settings: AggregatorSettings,
    recent: Mutex<VecDeque<f64>>,
}

impl Aggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            settings,
            recent: Mutex::new(VecDeque::with_capacity(settings.rolling_window)),
        }
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    /// Aggregate the latest points of one cycle
    ///
    /// `weights` maps sources to reliability weights (missing sources count
    /// as 1.0); `total_weight` is the weight of every configured source and
    /// is the denominator of the confidence.
    pub fn aggregate(
        &self,
        points: &[PricePoint],
        weights: &HashMap<SourceId, f64>,
        total_weight: f64,
        now: DateTime<Utc>,
    ) -> Result<ConsensusPrice> {
        let mut freshest: BTreeMap<&SourceId, &PricePoint> = BTreeMap::new();
        for point in points {
            if point.age(now) > self.settings.staleness || !point.price.is_finite() || point.price <= 0.0 {
                continue;
            }
            match freshest.get(&point.source_id) {
                Some(existing) if existing.observed_at >= point.observed_at => {}
                _ => {
                    freshest.insert(&point.source_id, point);
                }
            }
        }

        if freshest.len() < self.settings.min_sources {
            return Err(OracleError::InsufficientConsensus {
                contributing: freshest.len(),
                required: self.settings.min_sources,
            });
        }

        let weight_of = |id: &SourceId| weights.get(id).copied().unwrap_or(1.0);
        let weighted: Vec<(f64, f64)> = freshest
            .values()
            .map(|p| (p.price, weight_of(&p.source_id)))
            .collect();

        let median = weighted_median(&weighted).ok_or(OracleError::InsufficientConsensus {
            contributing: 0,
            required: self.settings.min_sources,
        })?;

        let threshold = self.settings.outlier_multiple * self.dispersion(&weighted, median);

        let (kept, rejected): (Vec<&PricePoint>, Vec<&PricePoint>) = freshest
            .values()
            .copied()
            .partition(|p| (p.price - median).abs() <= threshold);

        if kept.len() < self.settings.min_sources {
            return Err(OracleError::InsufficientConsensus {
                contributing: kept.len(),
                required: self.settings.min_sources,
            });
        }

        let survivors: Vec<(f64, f64)> = kept.iter().map(|p| (p.price, weight_of(&p.source_id))).collect();
        let price = weighted_median(&survivors).ok_or(OracleError::InsufficientConsensus {
            contributing: 0,
            required: self.settings.min_sources,
        })?;

        let kept_weight: f64 = survivors.iter().map(|(_, w)| w).sum();
        let confidence = if total_weight > 0.0 {
            (kept_weight / total_weight).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let outliers: Vec<SourceId> = rejected.iter().map(|p| p.source_id.clone()).collect();
        if !outliers.is_empty() {
            debug!(median, threshold, ?outliers, "Rejected outliers");
        }

        {
            let mut recent = self.recent.lock();
            if recent.len() == self.settings.rolling_window {
                recent.pop_front();
            }
            recent.push_back(price);
        }

        Ok(ConsensusPrice {
            price,
            confidence,
            contributing_sources: kept.iter().map(|p| p.source_id.clone()).collect::<BTreeSet<_>>(),
            outliers,
            computed_at: now,
        })
    }

    fn dispersion(&self, weighted: &[(f64, f64)], median: f64) -> f64 {
        let deviations: Vec<(f64, f64)> = weighted.iter().map(|(p, w)| ((p - median).abs(), *w)).collect();
        let mad = weighted_median(&deviations).unwrap_or(0.0) * MAD_SCALE;
        let rolling = std_dev(&self.recent.lock());
        let floor = self.settings.min_deviation_fraction * median.abs();
        rolling.max(mad).max(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn point(source: &str, price: f64, age_secs: i64) -> PricePoint {
        PricePoint::new(source.into(), price, now() - Duration::seconds(age_secs), 50)
    }

    fn settings() -> AggregatorSettings {
        AggregatorSettings {
            staleness: Duration::seconds(60),
            outlier_multiple: 3.0,
            min_sources: 3,
            min_deviation_fraction: 0.005,
            rolling_window: 30,
        }
    }

    fn equal_weights(ids: &[&str]) -> HashMap<SourceId, f64> {
        ids.iter().map(|id| (SourceId::from(*id), 1.0)).collect()
    }

    #[test]
    fn test_weighted_median() {
        assert_eq!(weighted_median(&[(3.0, 1.0), (1.0, 1.0), (2.0, 1.0)]), Some(2.0));
        assert_eq!(weighted_median(&[(1.0, 1.0), (2.0, 1.0), (3.0, 1.0), (4.0, 1.0)]), Some(2.5));
        assert_eq!(weighted_median(&[(1.0, 1.0), (2.0, 1.0), (3.0, 5.0)]), Some(3.0));
        assert_eq!(weighted_median(&[(1.0, 0.0)]), None);
        assert_eq!(weighted_median(&[]), None);
    }

    #[test]
    fn test_single_outlier_rejected() {
        let agg = Aggregator::new(settings());
        let ids = ["a", "b", "c", "d", "e"];
        let points = vec![
            point("a", 60_000.0, 1),
            point("b", 60_050.0, 1),
            point("c", 60_100.0, 1),
            point("d", 59_950.0, 1),
            point("e", 80_000.0, 1),
        ];

        let consensus = agg.aggregate(&points, &equal_weights(&ids), 5.0, now()).unwrap();
        assert!((consensus.price - 60_025.0).abs() < 1e-9);
        assert!((consensus.confidence - 0.8).abs() < 1e-12);
        assert_eq!(consensus.outliers, vec![SourceId::from("e")]);
        assert_eq!(consensus.contributing_sources.len(), 4);
        assert!(!consensus.contributing_sources.contains(&SourceId::from("e")));
    }

    #[test]
    fn test_outlier_does_not_move_consensus() {
        let ids = ["a", "b", "c", "x"];
        let honest = vec![point("a", 100.0, 1), point("b", 101.0, 1), point("c", 102.0, 1)];
        let mut attacked = honest.clone();
        attacked.push(point("x", 1_010.0, 1));

        let clean = Aggregator::new(settings())
            .aggregate(&honest, &equal_weights(&ids), 4.0, now())
            .unwrap();
        let dirty = Aggregator::new(settings())
            .aggregate(&attacked, &equal_weights(&ids), 4.0, now())
            .unwrap();

        assert!((clean.price - dirty.price).abs() < 1e-9);
        assert_eq!(dirty.outliers, vec![SourceId::from("x")]);
    }

    #[test]
    fn test_stale_points_excluded_and_min_sources_enforced() {
        let agg = Aggregator::new(settings());
        let points = vec![
            point("a", 60_000.0, 1),
            point("b", 60_010.0, 10),
            point("c", 60_020.0, 120),
        ];

        let err = agg
            .aggregate(&points, &equal_weights(&["a", "b", "c"]), 3.0, now())
            .unwrap_err();
        assert_matches!(
            err,
            OracleError::InsufficientConsensus { contributing: 2, required: 3 }
        );
    }

    #[test]
    fn test_freshest_point_per_source_wins() {
        let agg = Aggregator::new(settings());
        let points = vec![
            point("a", 50_000.0, 30),
            point("a", 60_000.0, 1),
            point("b", 60_010.0, 1),
            point("c", 60_020.0, 1),
        ];

        let consensus = agg
            .aggregate(&points, &equal_weights(&["a", "b", "c"]), 3.0, now())
            .unwrap();
        assert_eq!(consensus.price, 60_010.0);
        assert!(consensus.outliers.is_empty());
        assert_eq!(consensus.confidence, 1.0);
    }

    #[test]
    fn test_weights_shift_the_median() {
        let agg = Aggregator::new(settings());
        let points = vec![
            point("a", 60_000.0, 1),
            point("b", 60_010.0, 1),
            point("c", 60_020.0, 1),
        ];
        let mut weights = equal_weights(&["a", "b", "c"]);
        weights.insert("c".into(), 3.0);

        let consensus = agg.aggregate(&points, &weights, 5.0, now()).unwrap();
        assert_eq!(consensus.price, 60_020.0);
        assert_eq!(consensus.confidence, 1.0);
    }

    #[test]
    fn test_too_many_outliers_fails() {
        let mut s = settings();
        s.min_sources = 4;
        let agg = Aggregator::new(s);
        let points = vec![
            point("a", 60_000.0, 1),
            point("b", 60_010.0, 1),
            point("c", 60_020.0, 1),
            point("d", 90_000.0, 1),
        ];

        let err = agg
            .aggregate(&points, &equal_weights(&["a", "b", "c", "d"]), 4.0, now())
            .unwrap_err();
        assert_matches!(err, OracleError::InsufficientConsensus { contributing: 3, .. });
    }
}
