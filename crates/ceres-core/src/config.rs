//! Engine configuration read from `CERES_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;

use crate::admin::AdminConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::job::{RetryConfig, WorkerConfig};
use crate::pricing::PricingConfig;
use crate::scheduler::SchedulerConfig;
use crate::scrape::ScrapeConfig;
use crate::seasonal::SeasonalConfig;
use crate::trust::TrustConfig;

/// Everything the engine needs besides its store and network clients.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub breaker: CircuitBreakerConfig,
    pub scheduler: SchedulerConfig,
    pub scrape: ScrapeConfig,
    pub trust: TrustConfig,
    pub pricing: PricingConfig,
    pub seasonal: SeasonalConfig,
    pub admin: AdminConfig,
    /// Entries kept by the in-memory job journal.
    pub journal_capacity: usize,
    /// How often trust scores, then active prices, are recomputed.
    pub trust_sweep_interval: Duration,
    /// How often seasonal coefficients are rebuilt from history.
    pub seasonal_refresh_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            scheduler: SchedulerConfig::default(),
            scrape: ScrapeConfig::default(),
            trust: TrustConfig::default(),
            pricing: PricingConfig::default(),
            seasonal: SeasonalConfig::default(),
            admin: AdminConfig::default(),
            journal_capacity: 1000,
            trust_sweep_interval: Duration::from_secs(15 * 60),
            seasonal_refresh_interval: Duration::from_secs(24 * 3600),
        }
    }
}

impl EngineConfig {
    /// Reads the process environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `CERES_WORKER_ID` | random `worker-xxxxxxxx` |
    /// | `CERES_WORKER_CONCURRENCY` | 4 |
    /// | `CERES_POLL_INTERVAL_SECS` | 5 |
    /// | `CERES_MAX_ATTEMPTS` | 3 |
    /// | `CERES_RETRY_BASE_DELAY_SECS` / `CERES_RETRY_MAX_DELAY_SECS` | 60 / 1800 |
    /// | `CERES_BREAKER_THRESHOLD` | 5 |
    /// | `CERES_BREAKER_COOLDOWN_SECS` / `CERES_BREAKER_MAX_COOLDOWN_SECS` | 300 / 3600 |
    /// | `CERES_SCHEDULER_TICK_SECS` | 30 |
    /// | `CERES_SEARCH_DELAY_MS` | 2000 |
    /// | `CERES_SEARCH_TIMEOUT_SECS` | 30 |
    /// | `CERES_MAX_SEARCH_PRODUCTS` | 100 |
    /// | `CERES_MIN_TRUST` | 0.3 |
    /// | `CERES_AI_CONFIDENCE` | 0.15 |
    /// | `CERES_MANUAL_STALENESS_DAYS` | 90 |
    /// | `CERES_STALE_AFTER_HOURS` | 72 |
    /// | `CERES_JOURNAL_CAPACITY` | 1000 |
    /// | `CERES_TRUST_SWEEP_SECS` | 900 |
    /// | `CERES_SEASONAL_REFRESH_SECS` | 86400 |
    /// | `CERES_CLEANUP_DAYS` | 7 |
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let mut config = Self::default();

        if let Some(id) = lookup("CERES_WORKER_ID").filter(|id| !id.trim().is_empty()) {
            config.worker.worker_id = id;
        }
        if let Some(n) = vars.get::<usize>("CERES_WORKER_CONCURRENCY")? {
            if n == 0 {
                return Err(AppError::ConfigError(
                    "CERES_WORKER_CONCURRENCY must be at least 1".into(),
                ));
            }
            config.worker.concurrency = n;
        }
        if let Some(secs) = vars.get("CERES_POLL_INTERVAL_SECS")? {
            config.worker.poll_interval = Duration::from_secs(secs);
        }

        let retry = &mut config.worker.retry_config;
        if let Some(n) = vars.get::<u32>("CERES_MAX_ATTEMPTS")? {
            if n == 0 {
                return Err(AppError::ConfigError(
                    "CERES_MAX_ATTEMPTS must be at least 1".into(),
                ));
            }
            retry.max_attempts = n;
        }
        if let Some(secs) = vars.get("CERES_RETRY_BASE_DELAY_SECS")? {
            retry.base_delay = TimeDelta::seconds(secs);
        }
        if let Some(secs) = vars.get("CERES_RETRY_MAX_DELAY_SECS")? {
            retry.max_delay = TimeDelta::seconds(secs);
        }
        check_delays(retry)?;
        config.scheduler.max_attempts = retry.max_attempts;
        config.admin.max_attempts = retry.max_attempts;

        if let Some(n) = vars.get::<u32>("CERES_BREAKER_THRESHOLD")? {
            if n == 0 {
                return Err(AppError::ConfigError(
                    "CERES_BREAKER_THRESHOLD must be at least 1".into(),
                ));
            }
            config.breaker.failure_threshold = n;
        }
        if let Some(secs) = vars.get("CERES_BREAKER_COOLDOWN_SECS")? {
            config.breaker.base_cooldown = Duration::from_secs(secs);
        }
        if let Some(secs) = vars.get("CERES_BREAKER_MAX_COOLDOWN_SECS")? {
            config.breaker.max_cooldown = Duration::from_secs(secs);
        }
        if config.breaker.max_cooldown < config.breaker.base_cooldown {
            return Err(AppError::ConfigError(
                "CERES_BREAKER_MAX_COOLDOWN_SECS is below CERES_BREAKER_COOLDOWN_SECS".into(),
            ));
        }

        if let Some(secs) = vars.get::<u64>("CERES_SCHEDULER_TICK_SECS")? {
            config.scheduler.tick = Duration::from_secs(secs.max(1));
        }

        if let Some(ms) = vars.get("CERES_SEARCH_DELAY_MS")? {
            config.scrape.search_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = vars.get("CERES_SEARCH_TIMEOUT_SECS")? {
            config.scrape.search_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = vars.get("CERES_MAX_SEARCH_PRODUCTS")? {
            config.scrape.max_search_products = n;
        }

        if let Some(v) = vars.get("CERES_MIN_TRUST")? {
            config.pricing.min_trust = v;
        }
        if let Some(v) = vars.get("CERES_AI_CONFIDENCE")? {
            config.pricing.ai_confidence = v;
        }
        if let Some(days) = vars.get("CERES_MANUAL_STALENESS_DAYS")? {
            config.pricing.manual_staleness = TimeDelta::days(days);
        }
        if let Some(hours) = vars.get("CERES_STALE_AFTER_HOURS")? {
            config.pricing.stale_after = TimeDelta::hours(hours);
        }
        config.pricing.validate()?;

        if let Some(n) = vars.get("CERES_JOURNAL_CAPACITY")? {
            config.journal_capacity = n;
        }
        if let Some(secs) = vars.get::<u64>("CERES_TRUST_SWEEP_SECS")? {
            config.trust_sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = vars.get::<u64>("CERES_SEASONAL_REFRESH_SECS")? {
            config.seasonal_refresh_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(days) = vars.get("CERES_CLEANUP_DAYS")? {
            config.admin.cleanup_days = days;
        }

        Ok(config)
    }
}

fn check_delays(retry: &RetryConfig) -> Result<(), AppError> {
    if retry.base_delay < TimeDelta::zero() || retry.max_delay < retry.base_delay {
        return Err(AppError::ConfigError(
            "retry delays must satisfy 0 <= base <= max".into(),
        ));
    }
    Ok(())
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Parses `key` if set. Empty values count as unset.
    fn get<T>(&self, key: &str) -> Result<Option<T>, AppError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            None => Ok(None),
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
                AppError::ConfigError(format!("{key} has invalid value '{raw}': {e}"))
            }),
        }
    }
}
