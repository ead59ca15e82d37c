//! Historical volatility estimators
//!
//! Every window is anchored on the most recent close and covers
//! `window_days` calendar days ending there. Results are annualized with
//! `sqrt(annualization_days)`.

use chrono::{DateTime, Duration, Utc};
use common::{HistoricalClose, Methodology};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::f64::consts::LN_2;

use crate::error::{OracleError, Result};
use crate::types::VolatilityEstimate;

#[derive(Debug, Clone, PartialEq)]
pub struct VolatilitySettings {
    pub windows: Vec<u32>,
    pub methodologies: Vec<Methodology>,
    pub ewma_lambda: f64,
    pub annualization_days: f64,
    pub min_coverage: f64,
    /// Shortest-window estimates kept for the trailing average
    pub trailing_len: usize,
}

impl VolatilitySettings {
    pub fn from_config(config: &config::VolatilityConfig, trailing_len: usize) -> Self {
        Self {
            windows: config.windows.clone(),
            methodologies: config.methodologies.clone(),
            ewma_lambda: config.ewma_lambda,
            annualization_days: config.annualization_days,
            min_coverage: config.min_coverage,
            trailing_len: trailing_len.max(1),
        }
    }

    /// Closes needed for a full-enough window
    ///
    /// A sample standard deviation needs two returns, so three closes; EWMA
    /// is seeded from a single return.
    pub fn required_samples(&self, window_days: u32, methodology: Methodology) -> usize {
        let needed = (f64::from(window_days) * self.min_coverage).ceil() as usize;
        let floor = match methodology {
            Methodology::Ewma => 2,
            Methodology::LogReturn | Methodology::Parkinson => 3,
        };
        needed.max(floor)
    }
}

impl Default for VolatilitySettings {
    fn default() -> Self {
        Self::from_config(&config::VolatilityConfig::default(), 30)
    }
}

/// `ln(p_t / p_{t-1})` for consecutive prices
pub fn log_returns(prices: &[f64]) -> Vec<f64> {
    prices.windows(2).map(|w| (w[1] / w[0]).ln()).collect()
}

/// Daily sample standard deviation of log returns; needs two returns
pub fn log_return_vol(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

/// Daily Parkinson volatility from `(high, low)` pairs
pub fn parkinson_vol(ranges: &[(f64, f64)]) -> Option<f64> {
    if ranges.is_empty() {
        return None;
    }
    let sum: f64 = ranges.iter().map(|(h, l)| (h / l).ln().powi(2)).sum();
    Some((sum / (4.0 * ranges.len() as f64 * LN_2)).sqrt())
}

/// Daily EWMA volatility, seeded with the first squared return
pub fn ewma_vol(returns: &[f64], lambda: f64) -> Option<f64> {
    let (first, rest) = returns.split_first()?;
    let variance = rest
        .iter()
        .fold(first * first, |var, r| lambda * var + (1.0 - lambda) * r * r);
    Some(variance.sqrt())
}

fn check_series(closes: &[HistoricalClose]) -> Result<()> {
    for close in closes {
        if !close.price.is_finite() || close.price <= 0.0 {
            return Err(OracleError::DataIntegrity(format!(
                "non-positive close {} on {} from {}",
                close.price, close.date, close.source_id
            )));
        }
        if let Some((high, low)) = close.range() {
            if !(low > 0.0 && high >= low && high.is_finite()) {
                return Err(OracleError::DataIntegrity(format!(
                    "invalid range {}..{} on {}",
                    low, high, close.date
                )));
            }
        }
    }
    Ok(())
}

/// Computes estimates and remembers the latest one per window/methodology
#[derive(Debug)]
pub struct VolatilityEngine {
    settings: VolatilitySettings,
    latest: RwLock<HashMap<(u32, Methodology), VolatilityEstimate>>,
    trailing: Mutex<VecDeque<f64>>,
}

impl VolatilityEngine {
    pub fn new(settings: VolatilitySettings) -> Self {
        Self {
            trailing: Mutex::new(VecDeque::with_capacity(settings.trailing_len)),
            settings,
            latest: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &VolatilitySettings {
        &self.settings
    }

    /// One estimate over `closes` (ordered by date, oldest first)
    ///
    /// An under-populated window yields an estimate with `value: None`
    /// rather than an error; non-positive prices are an error.
    pub fn compute(
        &self,
        closes: &[HistoricalClose],
        window_days: u32,
        methodology: Methodology,
        now: DateTime<Utc>,
    ) -> Result<VolatilityEstimate> {
        if window_days < 2 {
            return Err(OracleError::InvalidInput(format!(
                "window must cover at least 2 days, got {}",
                window_days
            )));
        }

        let window: &[HistoricalClose] = match closes.last() {
            Some(anchor) => {
                let start = anchor.date - Duration::days(i64::from(window_days) - 1);
                let first = closes.partition_point(|c| c.date < start);
                &closes[first..]
            }
            None => &[],
        };
        check_series(window)?;

        let mut estimate = VolatilityEstimate {
            window_days,
            methodology,
            effective_methodology: methodology,
            value: None,
            computed_at: now,
            sample_count: window.len(),
        };

        if window.len() < self.settings.required_samples(window_days, methodology) {
            return Ok(estimate);
        }

        let prices: Vec<f64> = window.iter().map(|c| c.price).collect();
        let returns = log_returns(&prices);

        let daily = match methodology {
            Methodology::LogReturn => log_return_vol(&returns),
            Methodology::Ewma => ewma_vol(&returns, self.settings.ewma_lambda),
            Methodology::Parkinson => {
                let ranges: Option<Vec<(f64, f64)>> = window.iter().map(|c| c.range()).collect();
                match ranges {
                    Some(ranges) => parkinson_vol(&ranges),
                    None => {
                        estimate.effective_methodology = Methodology::LogReturn;
                        log_return_vol(&returns)
                    }
                }
            }
        };

        estimate.value = daily.map(|v| v * self.settings.annualization_days.sqrt());
        Ok(estimate)
    }

    /// Recompute every configured window and methodology from `closes`,
    /// which must reach back at least the longest window
    pub fn recompute_all(&self, closes: &[HistoricalClose], now: DateTime<Utc>) -> Result<Vec<VolatilityEstimate>> {
        let mut estimates = Vec::with_capacity(self.settings.windows.len() * self.settings.methodologies.len());
        for &window in &self.settings.windows {
            for &methodology in &self.settings.methodologies {
                estimates.push(self.compute(closes, window, methodology, now)?);
            }
        }

        {
            let mut latest = self.latest.write();
            for estimate in &estimates {
                latest.insert((estimate.window_days, estimate.methodology), estimate.clone());
            }
        }

        if let Some(value) = self.signal_estimate(&estimates).and_then(|e| e.value) {
            let mut trailing = self.trailing.lock();
            if trailing.len() == self.settings.trailing_len {
                trailing.pop_front();
            }
            trailing.push_back(value);
        }

        Ok(estimates)
    }

    /// Shortest window with the first configured methodology drives the
    /// scheduler
    fn signal_estimate<'a>(&self, estimates: &'a [VolatilityEstimate]) -> Option<&'a VolatilityEstimate> {
        let window = self.settings.windows.iter().copied().min()?;
        let methodology = *self.settings.methodologies.first()?;
        estimates
            .iter()
            .find(|e| e.window_days == window && e.methodology == methodology)
    }

    pub fn latest(&self, window_days: u32, methodology: Methodology) -> Option<VolatilityEstimate> {
        self.latest.read().get(&(window_days, methodology)).cloned()
    }

    /// Latest shortest-window value and the average of the trailing series
    pub fn trend(&self) -> Option<(f64, f64)> {
        let trailing = self.trailing.lock();
        let latest = *trailing.back()?;
        let avg = trailing.iter().sum::<f64>() / trailing.len() as f64;
        Some((latest, avg))
    }
}
