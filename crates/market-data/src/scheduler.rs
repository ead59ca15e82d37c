//! Polling cadence
//!
//! Three independent loops share one cancellation token:
//! - spot: one aggregation cycle, then sleep for the adaptive interval
//! - daily close: once per day after the configured UTC time (and once at start)
//! - maintenance: compaction and snapshot every `snapshot_interval_secs`
//!
//! A final snapshot is written after every loop has stopped.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use common::SharedClock;
use config::SchedulerConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::oracle::PriceOracle;

/// Spot interval adjustment driven by short-window volatility
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdaptivePolicy {
    pub base: Duration,
    pub min: Duration,
    pub max: Duration,
    pub turbulence_ratio: f64,
    pub calm_ratio: f64,
    pub speedup_factor: f64,
    pub slowdown_factor: f64,
}

impl From<&SchedulerConfig> for AdaptivePolicy {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            base: Duration::from_secs(config.spot_interval_secs),
            min: Duration::from_secs(config.min_spot_interval_secs),
            max: Duration::from_secs(config.max_spot_interval_secs),
            turbulence_ratio: config.turbulence_ratio,
            calm_ratio: config.calm_ratio,
            speedup_factor: config.speedup_factor,
            slowdown_factor: config.slowdown_factor,
        }
    }
}

impl AdaptivePolicy {
    /// Next spot interval given the latest short-window volatility and its
    /// trailing average
    ///
    /// Turbulent (latest above `avg × turbulence_ratio`) multiplies the
    /// interval by `speedup_factor`, calm (below `avg × calm_ratio`) by
    /// `slowdown_factor`. The result stays within `[min, max]`.
    pub fn next_interval(&self, current: Duration, trend: Option<(f64, f64)>) -> Duration {
        let factor = match trend {
            Some((latest, avg)) if avg > 0.0 && latest > avg * self.turbulence_ratio => self.speedup_factor,
            Some((latest, avg)) if avg > 0.0 && latest < avg * self.calm_ratio => self.slowdown_factor,
            _ => 1.0,
        };
        let factor = if factor.is_finite() && factor > 0.0 { factor } else { 1.0 };
        current.mul_f64(factor).max(self.min).min(self.max)
    }
}

/// First run of the daily job strictly after `now`
pub fn next_daily_run(now: DateTime<Utc>, at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

pub struct Scheduler {
    oracle: Arc<PriceOracle>,
    policy: AdaptivePolicy,
    close_time: NaiveTime,
    snapshot_interval: Duration,
    clock: SharedClock,
}

impl Scheduler {
    pub fn new(oracle: Arc<PriceOracle>, config: &SchedulerConfig, clock: SharedClock) -> Self {
        Self {
            oracle,
            policy: AdaptivePolicy::from(config),
            close_time: config.daily_close_time().unwrap_or(NaiveTime::MIN),
            snapshot_interval: Duration::from_secs(config.snapshot_interval_secs.max(1)),
            clock,
        }
    }

    /// Run until `token` is cancelled, then write a final snapshot
    pub async fn run(self, token: CancellationToken) {
        info!(
            base_interval = ?self.policy.base,
            close_time = %self.close_time,
            "Scheduler started"
        );

        tokio::join!(
            self.spot_loop(token.clone()),
            self.daily_loop(token.clone()),
            self.maintenance_loop(token.clone()),
        );

        match self.oracle.snapshot().await {
            Ok(()) => info!("Final snapshot written"),
            Err(e) => error!(error = %e, "Final snapshot failed"),
        }
        info!("Scheduler stopped");
    }

    async fn spot_loop(&self, token: CancellationToken) {
        let mut interval = self.policy.base.max(self.policy.min).min(self.policy.max);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                // Errors are logged by the oracle; the next cycle is the retry
                _ = self.oracle.run_spot_cycle() => {}
            }

            let next = self
                .policy
                .next_interval(interval, self.oracle.volatility_engine().trend());
            if next != interval {
                info!(from = ?interval, to = ?next, "Spot interval adjusted");
                interval = next;
            }

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        debug!("Spot loop stopped");
    }

    async fn daily_loop(&self, token: CancellationToken) {
        loop {
            let ok = tokio::select! {
                _ = token.cancelled() => break,
                result = self.oracle.run_daily_close() => match result {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(error = %e, "Daily close run failed");
                        false
                    }
                },
            };

            let now = self.clock.now();
            let next = next_daily_run(now, self.close_time);
            let mut wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            if !ok {
                wait = wait.min(self.policy.max);
            }
            debug!(?wait, "Next daily close run");

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        debug!("Daily loop stopped");
    }

    async fn maintenance_loop(&self, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.snapshot_interval) => {}
            }
            if let Err(e) = self.oracle.run_maintenance().await {
                error!(error = %e, "Maintenance failed");
            }
        }
        debug!("Maintenance loop stopped");
    }
}
