//! Table of per-source breakers and running flags.
//!
//! Each source owns one slot behind its own mutex. The outer map is only
//! locked to look up or insert a slot, never while a slot is held.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, Gate,
};
use crate::error::AppError;

#[derive(Debug)]
struct SourceSlot {
    breaker: CircuitBreaker,
    running: Option<Uuid>,
}

/// Outcome of asking to run a job for a source.
#[derive(Debug)]
pub enum Admission {
    /// The job may run; the permit holds the source's running flag.
    Granted(RunPermit),
    /// Another job for this source is running (or holds the half-open trial).
    Busy,
    /// The breaker is open.
    Rejected { retry_after: Duration },
}

/// Per-source breaker registry.
pub struct SourceRegistry {
    config: Arc<CircuitBreakerConfig>,
    slots: RwLock<HashMap<String, Arc<Mutex<SourceSlot>>>>,
}

impl SourceRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Builds a registry seeded from persisted breaker snapshots.
    pub fn with_snapshots(
        config: CircuitBreakerConfig,
        snapshots: impl IntoIterator<Item = (String, CircuitBreaker)>,
    ) -> Self {
        let registry = Self::new(config);
        {
            let mut slots = registry.write_slots();
            for (source_id, breaker) in snapshots {
                slots.insert(
                    source_id,
                    Arc::new(Mutex::new(SourceSlot {
                        breaker,
                        running: None,
                    })),
                );
            }
        }
        registry
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Asks to run `job_id` for `source_id`.
    ///
    /// Checks the running flag before the breaker so a busy source never
    /// consumes its half-open trial.
    pub fn admit(&self, source_id: &str, job_id: Uuid, now: DateTime<Utc>) -> Admission {
        let slot = self.slot(source_id);
        let mut guard = lock_slot(&slot, source_id);

        if guard.running.is_some() {
            return Admission::Busy;
        }

        if guard.breaker.refresh(now) {
            tracing::info!(source = %source_id, "Circuit breaker transitioning to half-open state");
        }

        match guard.breaker.try_acquire(now) {
            Gate::Allowed => {
                let trial = guard.breaker.state == CircuitState::HalfOpen;
                guard.running = Some(job_id);
                drop(guard);
                Admission::Granted(RunPermit {
                    source_id: source_id.to_string(),
                    job_id,
                    trial,
                    slot,
                    config: Arc::clone(&self.config),
                    finished: false,
                })
            }
            Gate::TrialInFlight => Admission::Busy,
            Gate::Open { retry_after } => Admission::Rejected { retry_after },
        }
    }

    /// Fails with `CircuitOpen` if the source's breaker is open right now.
    pub fn check(&self, source_id: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        let slot = self.slot(source_id);
        let mut guard = lock_slot(&slot, source_id);
        guard.breaker.refresh(now);
        match guard.breaker.retry_after(now) {
            Some(retry_after) => Err(AppError::CircuitOpen {
                source_id: source_id.to_string(),
                retry_after_secs: retry_after.as_secs(),
            }),
            None => Ok(()),
        }
    }

    pub fn state(&self, source_id: &str, now: DateTime<Utc>) -> CircuitState {
        let slot = self.slot(source_id);
        let mut guard = lock_slot(&slot, source_id);
        guard.breaker.refresh(now);
        guard.breaker.state
    }

    /// Forces the breaker closed. Returns the new snapshot for persistence.
    pub fn reset(&self, source_id: &str) -> CircuitBreaker {
        let slot = self.slot(source_id);
        let mut guard = lock_slot(&slot, source_id);
        let previous = guard.breaker.state;
        guard.breaker.reset(&self.config);
        tracing::warn!(source = %source_id, previous = %previous, "Circuit breaker manually reset");
        guard.breaker.clone()
    }

    pub fn running_job(&self, source_id: &str) -> Option<Uuid> {
        let slot = self.slot(source_id);
        let guard = lock_slot(&slot, source_id);
        guard.running
    }

    pub fn stats(&self, source_id: &str, now: DateTime<Utc>) -> CircuitBreakerStats {
        let slot = self.slot(source_id);
        let mut guard = lock_slot(&slot, source_id);
        guard.breaker.refresh(now);
        build_stats(source_id, &guard, &self.config, now)
    }

    /// Stats for every known source, sorted by id.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Vec<CircuitBreakerStats> {
        let entries: Vec<(String, Arc<Mutex<SourceSlot>>)> = self
            .read_slots()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect();

        let mut stats: Vec<CircuitBreakerStats> = entries
            .iter()
            .map(|(id, slot)| {
                let mut guard = lock_slot(slot, id);
                guard.breaker.refresh(now);
                build_stats(id, &guard, &self.config, now)
            })
            .collect();
        stats.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        stats
    }

    /// Makes sure a slot exists for each id, e.g. for sources added at runtime.
    pub fn register<'a>(&self, source_ids: impl IntoIterator<Item = &'a str>) {
        for id in source_ids {
            self.slot(id);
        }
    }

    fn slot(&self, source_id: &str) -> Arc<Mutex<SourceSlot>> {
        if let Some(slot) = self.read_slots().get(source_id) {
            return Arc::clone(slot);
        }
        let mut slots = self.write_slots();
        Arc::clone(slots.entry(source_id.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(SourceSlot {
                breaker: CircuitBreaker::new(&self.config),
                running: None,
            }))
        }))
    }

    fn read_slots(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<SourceSlot>>>> {
        self.slots.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned registry lock");
            poisoned.into_inner()
        })
    }

    fn write_slots(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<SourceSlot>>>> {
        self.slots.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned registry lock");
            poisoned.into_inner()
        })
    }
}

/// Acquires a slot lock, recovering from poison if necessary.
fn lock_slot<'a>(slot: &'a Mutex<SourceSlot>, source_id: &str) -> MutexGuard<'a, SourceSlot> {
    slot.lock().unwrap_or_else(|poisoned| {
        tracing::warn!(source = %source_id, "Recovered from poisoned mutex");
        poisoned.into_inner()
    })
}

fn build_stats(
    source_id: &str,
    slot: &SourceSlot,
    config: &CircuitBreakerConfig,
    now: DateTime<Utc>,
) -> CircuitBreakerStats {
    let breaker = &slot.breaker;
    CircuitBreakerStats {
        source_id: source_id.to_string(),
        state: breaker.state,
        consecutive_failures: breaker.consecutive_failures,
        failure_threshold: config.failure_threshold,
        last_failure_at: breaker.last_failure_at,
        last_success_at: breaker.last_success_at,
        open_until: breaker.open_until.filter(|_| breaker.state == CircuitState::Open),
        cooldown_remaining_secs: breaker.retry_after(now).map(|d| d.as_secs()),
        cooldown_secs: breaker.cooldown_secs,
        last_error: breaker.last_error.clone(),
        running_job: slot.running,
    }
}

/// Exclusive right to run one job for one source.
///
/// Dropping the permit without calling [`RunPermit::finish`] clears the
/// running flag and gives back an unused half-open trial.
#[derive(Debug)]
pub struct RunPermit {
    source_id: String,
    job_id: Uuid,
    trial: bool,
    slot: Arc<Mutex<SourceSlot>>,
    config: Arc<CircuitBreakerConfig>,
    finished: bool,
}

impl RunPermit {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// True when this run is the half-open trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Records the run's outcome on the breaker and releases the source.
    ///
    /// Errors that do not trip the circuit leave the breaker untouched.
    /// Returns the updated snapshot for persistence.
    pub fn finish(mut self, outcome: Result<(), &AppError>, now: DateTime<Utc>) -> CircuitBreaker {
        self.finished = true;
        let mut guard = lock_slot(&self.slot, &self.source_id);
        let before = guard.breaker.state;

        match outcome {
            Ok(()) => guard.breaker.record_success(&self.config, now),
            Err(error) if error.should_trip_circuit() => {
                guard.breaker.record_failure(&self.config, error, now)
            }
            Err(_) => guard.breaker.release_trial(),
        }
        guard.running = None;

        let after = guard.breaker.state;
        if before != after {
            match after {
                CircuitState::Open => tracing::warn!(
                    source = %self.source_id,
                    failures = guard.breaker.consecutive_failures,
                    cooldown_secs = guard.breaker.cooldown_secs,
                    error = guard.breaker.last_error.as_deref().unwrap_or_default(),
                    "Circuit breaker opened"
                ),
                CircuitState::Closed => {
                    tracing::info!(source = %self.source_id, "Circuit breaker closed after successful trial")
                }
                CircuitState::HalfOpen => {}
            }
        }
        guard.breaker.clone()
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut guard = lock_slot(&self.slot, &self.source_id);
        if guard.running == Some(self.job_id) {
            guard.running = None;
        }
        guard.breaker.release_trial();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn registry(threshold: u32) -> SourceRegistry {
        SourceRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            base_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(600),
        })
    }

    fn granted(admission: Admission) -> RunPermit {
        match admission {
            Admission::Granted(permit) => permit,
            other => panic!("expected Granted, got {other:?}"),
        }
    }

    #[test]
    fn test_one_running_job_per_source() {
        let reg = registry(3);
        let now = Utc::now();

        let permit = granted(reg.admit("hal", Uuid::new_v4(), now));
        assert!(matches!(
            reg.admit("hal", Uuid::new_v4(), now),
            Admission::Busy
        ));
        // Other sources are unaffected.
        let other = granted(reg.admit("tzob", Uuid::new_v4(), now));

        permit.finish(Ok(()), now);
        drop(other);
        let _again = granted(reg.admit("hal", Uuid::new_v4(), now));
    }

    #[test]
    fn test_dropped_permit_releases_source() {
        let reg = registry(3);
        let now = Utc::now();
        let job = Uuid::new_v4();
        {
            let _permit = granted(reg.admit("hal", job, now));
            assert_eq!(reg.running_job("hal"), Some(job));
        }
        assert_eq!(reg.running_job("hal"), None);
    }

    #[test]
    fn test_failures_open_then_reject() {
        let reg = registry(3);
        let now = Utc::now();
        let err = AppError::SearchTimeout(20);

        for _ in 0..3 {
            let permit = granted(reg.admit("camgoz", Uuid::new_v4(), now));
            permit.finish(Err(&err), now);
        }

        assert_eq!(reg.state("camgoz", now), CircuitState::Open);
        match reg.admit("camgoz", Uuid::new_v4(), now) {
            Admission::Rejected { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(60))
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert!(matches!(
            reg.check("camgoz", now),
            Err(AppError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_non_tripping_error_leaves_breaker_alone() {
        let reg = registry(1);
        let now = Utc::now();
        let permit = granted(reg.admit("hal", Uuid::new_v4(), now));
        permit.finish(Err(&AppError::DatabaseError("down".into())), now);
        assert_eq!(reg.state("hal", now), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_trial_is_exclusive_and_restored_on_drop() {
        let reg = registry(1);
        let now = Utc::now();
        let permit = granted(reg.admit("hal", Uuid::new_v4(), now));
        permit.finish(Err(&AppError::SearchError("boom".into())), now);

        let later = now + TimeDelta::seconds(61);
        let trial = granted(reg.admit("hal", Uuid::new_v4(), later));
        assert!(trial.is_trial());
        assert!(matches!(
            reg.admit("hal", Uuid::new_v4(), later),
            Admission::Busy
        ));

        drop(trial);
        let trial = granted(reg.admit("hal", Uuid::new_v4(), later));
        let snapshot = trial.finish(Ok(()), later);
        assert_eq!(snapshot.state, CircuitState::Closed);
    }

    #[test]
    fn test_reset_and_snapshot() {
        let reg = registry(1);
        let now = Utc::now();
        reg.register(["a", "b"]);
        let permit = granted(reg.admit("b", Uuid::new_v4(), now));
        permit.finish(Err(&AppError::Timeout(5)), now);

        let stats = reg.snapshot(now);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].source_id, "a");
        assert_eq!(stats[1].state, CircuitState::Open);
        assert_eq!(stats[1].cooldown_remaining_secs, Some(60));

        let snapshot = reg.reset("b");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert!(reg.check("b", now).is_ok());
    }

    #[test]
    fn test_restored_snapshot_keeps_open_state() {
        let config = CircuitBreakerConfig::default();
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(&config);
        for _ in 0..config.failure_threshold {
            breaker.record_failure(&config, &AppError::Timeout(1), now);
        }

        let reg = SourceRegistry::with_snapshots(config, [("hal".to_string(), breaker)]);
        assert!(matches!(
            reg.admit("hal", Uuid::new_v4(), now),
            Admission::Rejected { .. }
        ));
    }

    #[test]
    fn test_concurrent_admission_grants_one() {
        let reg = Arc::new(registry(3));
        let now = Utc::now();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || match reg.admit("hal", Uuid::new_v4(), now) {
                    Admission::Granted(permit) => {
                        std::mem::forget(permit);
                        1
                    }
                    _ => 0,
                })
            })
            .collect();
        let granted: i32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 1);
    }
}
