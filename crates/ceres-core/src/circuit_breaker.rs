//! Per-source circuit breaker.
//!
//! Isolates a failing source so its jobs fail fast instead of hammering it.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[N consecutive failures]--> OPEN --[now >= open_until]--> HALF_OPEN (one trial)
//!                                        ^                               |
//!                                        +---[failure, cooldown x2]------+
//!                                                                        |
//! CLOSED <----------------------------[success]--------------------------+
//! ```
//!
//! The breaker is a plain value: every transition takes `now` explicitly and
//! the whole state serializes, so it can be persisted and restored. Locking
//! and the per-source running flag live in [`crate::registry`].

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Jobs run normally.
    Closed,
    /// Jobs are short-circuited until `open_until`.
    Open,
    /// A single trial job is allowed to test recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CircuitState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half-open" => Ok(CircuitState::HalfOpen),
            _ => Err(format!("Unknown circuit state: {}", s)),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Cooldown applied the first time the circuit opens.
    pub base_cooldown: Duration,

    /// Upper bound for the cooldown after repeated failed trials.
    pub max_cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_cooldown: Duration::from_secs(300),
            max_cooldown: Duration::from_secs(3600),
        }
    }
}

/// Trial jobs allowed through while half-open.
pub const HALF_OPEN_TRIALS: u32 = 1;

/// Result of asking the breaker for permission to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Allowed,
    /// Circuit is open; retry after the given delay.
    Open { retry_after: Duration },
    /// Half-open and the trial is already in flight.
    TrialInFlight,
}

/// Breaker state for a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
    /// Remaining trial budget while half-open.
    pub half_open_trials: u32,
    /// Cooldown used the next time the circuit opens from half-open.
    pub cooldown_secs: u64,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            open_until: None,
            half_open_trials: HALF_OPEN_TRIALS,
            cooldown_secs: config.base_cooldown.as_secs(),
            last_error: None,
            last_success_at: None,
        }
    }

    /// Handles the lazy Open -> HalfOpen transition. Returns true if it happened.
    pub fn refresh(&mut self, now: DateTime<Utc>) -> bool {
        if self.state == CircuitState::Open
            && let Some(open_until) = self.open_until
            && now >= open_until
        {
            self.state = CircuitState::HalfOpen;
            self.half_open_trials = HALF_OPEN_TRIALS;
            return true;
        }
        false
    }

    /// Time left until the breaker half-opens, if it is open.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.state != CircuitState::Open {
            return None;
        }
        let open_until = self.open_until?;
        Some((open_until - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Consumes a trial slot when half-open. Call [`Self::refresh`] first.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Gate {
        match self.state {
            CircuitState::Closed => Gate::Allowed,
            CircuitState::Open => Gate::Open {
                retry_after: self.retry_after(now).unwrap_or(Duration::ZERO),
            },
            CircuitState::HalfOpen if self.half_open_trials > 0 => {
                self.half_open_trials -= 1;
                Gate::Allowed
            }
            CircuitState::HalfOpen => Gate::TrialInFlight,
        }
    }

    /// Gives back a trial slot that was acquired but never used.
    pub fn release_trial(&mut self) {
        if self.state == CircuitState::HalfOpen && self.half_open_trials < HALF_OPEN_TRIALS {
            self.half_open_trials += 1;
        }
    }

    pub fn record_success(&mut self, config: &CircuitBreakerConfig, now: DateTime<Utc>) {
        self.last_success_at = Some(now);
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.open_until = None;
                self.half_open_trials = HALF_OPEN_TRIALS;
                self.cooldown_secs = config.base_cooldown.as_secs();
                self.last_error = None;
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(
        &mut self,
        config: &CircuitBreakerConfig,
        error: &AppError,
        now: DateTime<Utc>,
    ) {
        self.last_error = Some(error.to_string());
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                self.last_failure_at = Some(now);
                if self.consecutive_failures >= config.failure_threshold {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => {
                self.consecutive_failures += 1;
                self.last_failure_at = Some(now);
                let doubled = self.cooldown_secs.saturating_mul(2);
                self.cooldown_secs = doubled.min(config.max_cooldown.as_secs());
                self.open(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Forces the breaker closed with counters zeroed.
    pub fn reset(&mut self, config: &CircuitBreakerConfig) {
        let last_success_at = self.last_success_at;
        *self = Self::new(config);
        self.last_success_at = last_success_at;
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.half_open_trials = 0;
        let cooldown = TimeDelta::seconds(i64::try_from(self.cooldown_secs).unwrap_or(i64::MAX));
        self.open_until = Some(now + cooldown);
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub source_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
    pub cooldown_remaining_secs: Option<u64>,
    pub cooldown_secs: u64,
    pub last_error: Option<String>,
    pub running_job: Option<uuid::Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            base_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(300),
        }
    }

    fn fail() -> AppError {
        AppError::SearchTimeout(20)
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new(&config(3));
        assert_eq!(cb.state, CircuitState::Closed);
        assert_eq!(cb.half_open_trials, HALF_OPEN_TRIALS);
    }

    #[test]
    fn test_opens_exactly_at_threshold() {
        let cfg = config(3);
        let mut cb = CircuitBreaker::new(&cfg);
        let now = t0();

        cb.record_failure(&cfg, &fail(), now);
        cb.record_failure(&cfg, &fail(), now);
        assert_eq!(cb.state, CircuitState::Closed);

        cb.record_failure(&cfg, &fail(), now);
        assert_eq!(cb.state, CircuitState::Open);
        assert_eq!(cb.open_until, Some(now + TimeDelta::seconds(60)));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cfg = config(3);
        let mut cb = CircuitBreaker::new(&cfg);
        let now = t0();

        cb.record_failure(&cfg, &fail(), now);
        cb.record_failure(&cfg, &fail(), now);
        cb.record_success(&cfg, now);
        cb.record_failure(&cfg, &fail(), now);
        cb.record_failure(&cfg, &fail(), now);

        assert_eq!(cb.state, CircuitState::Closed);
        assert_eq!(cb.consecutive_failures, 2);
    }

    #[test]
    fn test_never_half_opens_before_cooldown() {
        let cfg = config(1);
        let mut cb = CircuitBreaker::new(&cfg);
        let now = t0();
        cb.record_failure(&cfg, &fail(), now);

        for secs in [0, 1, 30, 59] {
            let mut trial = cb.clone();
            assert!(!trial.refresh(now + TimeDelta::seconds(secs)));
            assert_eq!(trial.state, CircuitState::Open);
            assert!(matches!(
                trial.try_acquire(now + TimeDelta::seconds(secs)),
                Gate::Open { .. }
            ));
        }

        assert!(cb.refresh(now + TimeDelta::seconds(60)));
        assert_eq!(cb.state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_allows_exactly_one_trial() {
        let cfg = config(1);
        let mut cb = CircuitBreaker::new(&cfg);
        let now = t0();
        cb.record_failure(&cfg, &fail(), now);

        let later = now + TimeDelta::seconds(61);
        cb.refresh(later);
        assert_eq!(cb.try_acquire(later), Gate::Allowed);
        assert_eq!(cb.try_acquire(later), Gate::TrialInFlight);

        cb.release_trial();
        assert_eq!(cb.try_acquire(later), Gate::Allowed);
    }

    #[test]
    fn test_half_open_closes_on_success() {
        let cfg = config(1);
        let mut cb = CircuitBreaker::new(&cfg);
        let now = t0();
        cb.record_failure(&cfg, &fail(), now);

        let later = now + TimeDelta::seconds(61);
        cb.refresh(later);
        cb.try_acquire(later);
        cb.record_success(&cfg, later);

        assert_eq!(cb.state, CircuitState::Closed);
        assert_eq!(cb.consecutive_failures, 0);
        assert_eq!(cb.open_until, None);
        assert_eq!(cb.last_success_at, Some(later));
    }

    #[test]
    fn test_half_open_failure_doubles_cooldown_up_to_cap() {
        let cfg = config(1);
        let mut cb = CircuitBreaker::new(&cfg);
        let mut now = t0();
        cb.record_failure(&cfg, &fail(), now);

        let mut seen = Vec::new();
        for _ in 0..4 {
            now = cb.open_until.unwrap();
            cb.refresh(now);
            assert_eq!(cb.state, CircuitState::HalfOpen);
            cb.try_acquire(now);
            cb.record_failure(&cfg, &fail(), now);
            assert_eq!(cb.state, CircuitState::Open);
            seen.push(cb.cooldown_secs);
        }

        assert_eq!(seen, vec![120, 240, 300, 300]);
        assert_eq!(cb.open_until, Some(now + TimeDelta::seconds(300)));
    }

    #[test]
    fn test_success_after_backoff_restores_base_cooldown() {
        let cfg = config(1);
        let mut cb = CircuitBreaker::new(&cfg);
        let now = t0();
        cb.record_failure(&cfg, &fail(), now);
        let t1 = cb.open_until.unwrap();
        cb.refresh(t1);
        cb.record_failure(&cfg, &fail(), t1);
        assert_eq!(cb.cooldown_secs, 120);

        let t2 = cb.open_until.unwrap();
        cb.refresh(t2);
        cb.record_success(&cfg, t2);
        assert_eq!(cb.cooldown_secs, 60);
    }

    #[test]
    fn test_manual_reset() {
        let cfg = config(1);
        let mut cb = CircuitBreaker::new(&cfg);
        cb.record_failure(&cfg, &fail(), t0());
        assert_eq!(cb.state, CircuitState::Open);

        cb.reset(&cfg);
        assert_eq!(cb.state, CircuitState::Closed);
        assert_eq!(cb.consecutive_failures, 0);
        assert_eq!(cb.try_acquire(t0()), Gate::Allowed);
    }

    #[test]
    fn test_retry_after_counts_down() {
        let cfg = config(1);
        let mut cb = CircuitBreaker::new(&cfg);
        let now = t0();
        cb.record_failure(&cfg, &fail(), now);

        assert_eq!(
            cb.retry_after(now + TimeDelta::seconds(15)),
            Some(Duration::from_secs(45))
        );
        assert_eq!(
            cb.retry_after(now + TimeDelta::seconds(90)),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_snapshot_roundtrips_through_json() {
        let cfg = config(1);
        let mut cb = CircuitBreaker::new(&cfg);
        cb.record_failure(&cfg, &fail(), t0());

        let json = serde_json::to_string(&cb).unwrap();
        let restored: CircuitBreaker = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, cb);
    }
}
