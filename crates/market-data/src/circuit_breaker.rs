//! Per-source circuit breaker
//!
//! A pure state machine: every method takes `now`, so transitions are driven
//! by whatever clock the caller holds.
//!
//! - `closed`: calls pass through
//! - `open`: calls are short-circuited until the cooldown elapses
//! - `half_open`: exactly one trial call; success closes, failure reopens
//!   with the cooldown doubled up to the ceiling

use chrono::{DateTime, Duration, Utc};
use common::{CircuitState, SourceHealth};

/// Breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
    /// Default cooldown after a rate-limit response
    pub rate_limit_cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&config::CircuitBreakerConfig::default())
    }
}

impl From<&config::CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &config::CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            base_cooldown: Duration::seconds(config.cooldown_secs as i64),
            max_cooldown: Duration::seconds(config.max_cooldown_secs.max(config.cooldown_secs) as i64),
            rate_limit_cooldown: Duration::seconds(config.rate_limit_cooldown_secs as i64),
        }
    }
}

/// Whether a call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial call
    Trial,
    Rejected { retry_at: Option<DateTime<Utc>> },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: CircuitState,
    consecutive_failures: u32,
    /// Cooldown applied at the next generic open
    cooldown: Duration,
    open_until: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            cooldown: settings.base_cooldown,
            open_until: None,
            trial_in_flight: false,
        }
    }

    /// Resume from a persisted health record; an open circuit restarts its
    /// base cooldown from `now`
    pub fn from_health(settings: BreakerSettings, health: &SourceHealth, now: DateTime<Utc>) -> Self {
        let mut breaker = Self::new(settings);
        breaker.consecutive_failures = health.consecutive_failures;
        if health.circuit_state != CircuitState::Closed {
            breaker.open(now, settings.base_cooldown);
        }
        breaker
    }

    /// State as observed at `now`; an open circuit whose cooldown has
    /// elapsed reports `half_open`
    pub fn state(&self, now: DateTime<Utc>) -> CircuitState {
        match (self.state, self.open_until) {
            (CircuitState::Open, Some(until)) if now >= until => CircuitState::HalfOpen,
            (state, _) => state,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn open_until(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CircuitState::Open => self.open_until,
            _ => None,
        }
    }

    /// Ask to make a call. A granted `Trial` must be followed by a
    /// `record_*` call or by [`abandon_trial`](Self::abandon_trial).
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Admission {
        match self.state(now) {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => Admission::Rejected {
                retry_at: self.open_until,
            },
            CircuitState::HalfOpen => {
                self.state = CircuitState::HalfOpen;
                if self.trial_in_flight {
                    Admission::Rejected { retry_at: None }
                } else {
                    self.trial_in_flight = true;
                    Admission::Trial
                }
            }
        }
    }

    /// Returns the new state if it changed
    pub fn record_success(&mut self, _now: DateTime<Utc>) -> Option<CircuitState> {
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        self.cooldown = self.settings.base_cooldown;

        if self.state == CircuitState::Closed {
            return None;
        }
        self.state = CircuitState::Closed;
        self.open_until = None;
        Some(CircuitState::Closed)
    }

    /// Returns the new state if it changed
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> Option<CircuitState> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.trial_in_flight = false;

        match self.state {
            CircuitState::HalfOpen => {
                self.cooldown = (self.cooldown * 2).min(self.settings.max_cooldown);
                self.open(now, self.cooldown);
                Some(CircuitState::Open)
            }
            CircuitState::Closed if self.consecutive_failures >= self.settings.failure_threshold => {
                self.open(now, self.cooldown);
                Some(CircuitState::Open)
            }
            _ => None,
        }
    }

    /// Rate limits open the circuit at once for `cooldown`, leaving the
    /// generic backoff untouched
    pub fn record_rate_limited(&mut self, now: DateTime<Utc>, cooldown: Duration) -> Option<CircuitState> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.trial_in_flight = false;

        let changed = self.state != CircuitState::Open;
        self.open(now, cooldown);
        changed.then_some(CircuitState::Open)
    }

    /// Give back a trial whose call never completed; the circuit stays
    /// half-open and the next caller gets the trial
    pub fn abandon_trial(&mut self) {
        self.trial_in_flight = false;
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    fn open(&mut self, now: DateTime<Utc>, cooldown: Duration) {
        self.state = CircuitState::Open;
        self.open_until = Some(now + cooldown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use common::SourceId;

    fn settings() -> BreakerSettings {
        BreakerSettings {
            failure_threshold: 3,
            base_cooldown: Duration::seconds(30),
            max_cooldown: Duration::seconds(100),
            rate_limit_cooldown: Duration::seconds(300),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_opens_after_threshold_and_closes_after_trial_success() {
        let mut cb = CircuitBreaker::new(settings());
        let now = t0();

        assert_eq!(cb.record_failure(now), None);
        assert_eq!(cb.record_failure(now), None);
        assert_eq!(cb.record_failure(now), Some(CircuitState::Open));
        assert_eq!(cb.state(now), CircuitState::Open);
        assert_matches!(cb.try_acquire(now + Duration::seconds(29)), Admission::Rejected { .. });

        let later = now + Duration::seconds(30);
        assert_eq!(cb.state(later), CircuitState::HalfOpen);
        assert_eq!(cb.try_acquire(later), Admission::Trial);
        assert_eq!(cb.record_success(later), Some(CircuitState::Closed));
        assert_eq!(cb.state(later), CircuitState::Closed);
        assert_eq!(cb.consecutive_failures(), 0);
    }

    #[test]
    fn test_half_open_admits_one_trial() {
        let mut cb = CircuitBreaker::new(settings());
        for _ in 0..3 {
            cb.record_failure(t0());
        }
        let later = t0() + Duration::seconds(31);

        assert_eq!(cb.try_acquire(later), Admission::Trial);
        assert_eq!(cb.try_acquire(later), Admission::Rejected { retry_at: None });

        cb.abandon_trial();
        assert_eq!(cb.state(later), CircuitState::HalfOpen);
        assert_eq!(cb.try_acquire(later), Admission::Trial);
    }

    #[test]
    fn test_trial_failure_doubles_cooldown_up_to_ceiling() {
        let mut cb = CircuitBreaker::new(settings());
        for _ in 0..3 {
            cb.record_failure(t0());
        }

        let mut now = t0();
        let mut expected = [60, 100, 100].into_iter();
        let mut cooldown = Duration::seconds(30);
        for _ in 0..3 {
            now = now + cooldown;
            assert_eq!(cb.try_acquire(now), Admission::Trial);
            assert_eq!(cb.record_failure(now), Some(CircuitState::Open));
            cooldown = Duration::seconds(expected.next().unwrap());
            assert_eq!(cb.open_until(), Some(now + cooldown));
        }

        now = now + cooldown;
        assert_eq!(cb.try_acquire(now), Admission::Trial);
        cb.record_success(now);

        // Backoff resets after recovery
        for _ in 0..3 {
            cb.record_failure(now);
        }
        assert_eq!(cb.open_until(), Some(now + Duration::seconds(30)));
    }

    #[test]
    fn test_rate_limit_opens_immediately_with_provider_cooldown() {
        let mut cb = CircuitBreaker::new(settings());
        let now = t0();

        assert_eq!(cb.record_rate_limited(now, Duration::seconds(600)), Some(CircuitState::Open));
        assert_eq!(cb.open_until(), Some(now + Duration::seconds(600)));
        assert_eq!(cb.state(now + Duration::seconds(599)), CircuitState::Open);
        assert_eq!(cb.state(now + Duration::seconds(600)), CircuitState::HalfOpen);
    }

    #[test]
    fn test_restore_from_open_health() {
        let mut health = SourceHealth::new(SourceId::from("kraken"), 1.0);
        health.circuit_state = CircuitState::Open;
        health.consecutive_failures = 5;

        let cb = CircuitBreaker::from_health(settings(), &health, t0());
        assert_eq!(cb.state(t0()), CircuitState::Open);
        assert_eq!(cb.consecutive_failures(), 5);
        assert_eq!(cb.state(t0() + Duration::seconds(30)), CircuitState::HalfOpen);
    }
}
