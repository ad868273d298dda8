//! Read and control operations over the engine, shared by the HTTP server
//! and the CLI.
//!
//! Every operation takes the calling [`Actor`]. Reads need `Viewer`,
//! mutations need `Admin`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerStats;
use crate::error::AppError;
use crate::job::{JobFilter, JobPage, QueueStats, ScrapeJob};
use crate::logbook::{JobJournal, LogEntry, LogFilter, JournalReporter};
use crate::models::{ActivePrice, ManualPriceEntry, SeasonalCoefficient, SourceKind};
use crate::pricing::{PriceEngine, PriceUpdate, RecomputeReport};
use crate::registry::SourceRegistry;
use crate::scheduler::Scheduler;
use crate::traits::{PriceEstimator, Storage};
use crate::worker::{WorkerEvent, WorkerReporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Viewer => "viewer",
            Role::Admin => "admin",
        })
    }
}

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub identity: String,
    pub role: Role,
}

impl Actor {
    pub fn new(identity: impl Into<String>, role: Role) -> Self {
        Self {
            identity: identity.into(),
            role,
        }
    }

    /// The operator running the CLI has full rights.
    pub fn operator() -> Self {
        Self::new("cli", Role::Admin)
    }

    pub fn require(&self, role: Role) -> Result<(), AppError> {
        if self.role >= role {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!(
                "{} role required, '{}' is {}",
                role, self.identity, self.role
            )))
        }
    }
}

/// Health of one source.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub name: String,
    pub kind: SourceKind,
    pub enabled: bool,
    pub trust: Option<f64>,
    pub breaker: CircuitBreakerStats,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Attempt budget for operator retries.
    pub max_attempts: u32,
    /// Upper bound on jobs re-enqueued by one retry call.
    pub retry_limit: usize,
    pub cleanup_days: u32,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_limit: 100,
            cleanup_days: 7,
        }
    }
}

pub struct AdminService<S, E>
where
    S: Storage,
    E: PriceEstimator,
{
    store: S,
    registry: Arc<SourceRegistry>,
    scheduler: Scheduler<S>,
    pricing: PriceEngine<S, E>,
    reporter: Arc<JournalReporter>,
    config: AdminConfig,
}

impl<S, E> AdminService<S, E>
where
    S: Storage + 'static,
    E: PriceEstimator,
{
    pub fn new(
        store: S,
        registry: Arc<SourceRegistry>,
        scheduler: Scheduler<S>,
        pricing: PriceEngine<S, E>,
        reporter: Arc<JournalReporter>,
        config: AdminConfig,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
            pricing,
            reporter,
            config,
        }
    }

    pub fn journal(&self) -> &Arc<JobJournal> {
        self.reporter.journal()
    }

    pub async fn health(&self, actor: &Actor, now: DateTime<Utc>) -> Result<Vec<SourceHealth>, AppError> {
        actor.require(Role::Viewer)?;
        let trust: HashMap<String, f64> = self
            .store
            .trust_scores()
            .await?
            .into_iter()
            .map(|t| (t.source_id, t.score))
            .collect();

        Ok(self
            .store
            .list_sources()
            .await?
            .into_iter()
            .map(|source| SourceHealth {
                breaker: self.registry.stats(&source.id, now),
                trust: trust.get(&source.id).copied(),
                source_id: source.id,
                name: source.name,
                kind: source.kind,
                enabled: source.enabled,
            })
            .collect())
    }

    pub async fn stats(&self, actor: &Actor, now: DateTime<Utc>) -> Result<QueueStats, AppError> {
        actor.require(Role::Viewer)?;
        self.store.stats(now).await
    }

    pub async fn jobs(&self, actor: &Actor, filter: &JobFilter) -> Result<JobPage, AppError> {
        actor.require(Role::Viewer)?;
        self.store.list_jobs(filter).await
    }

    pub fn logs(&self, actor: &Actor, filter: &LogFilter) -> Result<Vec<LogEntry>, AppError> {
        actor.require(Role::Viewer)?;
        Ok(self.journal().query(filter))
    }

    /// Enqueues a manual job; `CircuitOpen` while the breaker is open.
    pub async fn trigger(
        &self,
        actor: &Actor,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ScrapeJob, AppError> {
        actor.require(Role::Admin)?;
        let job = self
            .scheduler
            .trigger(source_id, now, self.reporter.as_ref())
            .await?;
        tracing::info!(source = %source_id, job_id = %job.id, by = %actor.identity, "Manual trigger");
        Ok(job)
    }

    /// Forces a source's breaker closed and persists the snapshot.
    pub async fn reset(
        &self,
        actor: &Actor,
        source_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerStats, AppError> {
        actor.require(Role::Admin)?;
        if self.store.get_source(source_id).await?.is_none() {
            return Err(AppError::NotFound(format!("source '{source_id}'")));
        }
        let snapshot = self.registry.reset(source_id);
        self.store.save_breaker(source_id, &snapshot).await?;
        self.reporter.report(WorkerEvent::BreakerChanged {
            source_id,
            state: snapshot.state,
        });
        Ok(self.registry.stats(source_id, now))
    }

    /// Re-enqueues failed jobs that have no successor, with a fresh budget.
    pub async fn retry(
        &self,
        actor: &Actor,
        source_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, AppError> {
        actor.require(Role::Admin)?;
        let jobs = self
            .store
            .retry_failed(
                source_id,
                self.config.max_attempts,
                self.config.retry_limit,
                now,
            )
            .await?;
        for job in &jobs {
            self.reporter.report(WorkerEvent::JobEnqueued { job });
        }
        Ok(jobs)
    }

    /// Cancels queued jobs, optionally for one source.
    pub async fn cancel(
        &self,
        actor: &Actor,
        source_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        actor.require(Role::Admin)?;
        let cancelled = self.store.cancel_queued(source_id, now).await?;
        tracing::info!(source = source_id.unwrap_or("*"), cancelled, by = %actor.identity, "Queued jobs cancelled");
        Ok(cancelled)
    }

    /// Cancels a queued job, or flags a running one so its results are
    /// discarded when it finishes.
    pub async fn cancel_job(
        &self,
        actor: &Actor,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ScrapeJob, AppError> {
        actor.require(Role::Admin)?;
        let job = self
            .store
            .request_cancel(job_id, now)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;
        tracing::info!(%job_id, status = %job.status, by = %actor.identity, "Job cancel requested");
        Ok(job)
    }

    /// Deletes finished jobs older than `days` (default from config).
    pub async fn cleanup(
        &self,
        actor: &Actor,
        days: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        actor.require(Role::Admin)?;
        let days = days.unwrap_or(self.config.cleanup_days);
        let cutoff = TimeDelta::try_days(i64::from(days))
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| {
                AppError::InvalidInput(format!("cleanup age of {days} days is out of range"))
            })?;
        let purged = self.store.purge_finished(cutoff).await?;
        tracing::info!(days, purged, "Finished jobs purged");
        Ok(purged)
    }

    pub async fn price(&self, actor: &Actor, product_key: &str) -> Result<ActivePrice, AppError> {
        actor.require(Role::Viewer)?;
        self.store
            .current_price(product_key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("price for '{product_key}'")))
    }

    pub async fn prices(&self, actor: &Actor) -> Result<Vec<ActivePrice>, AppError> {
        actor.require(Role::Viewer)?;
        self.store.current_prices().await
    }

    pub async fn price_history(
        &self,
        actor: &Actor,
        product_key: &str,
        limit: usize,
    ) -> Result<Vec<ActivePrice>, AppError> {
        actor.require(Role::Viewer)?;
        if self.store.get_product(product_key).await?.is_none() {
            return Err(AppError::NotFound(format!("product '{product_key}'")));
        }
        self.store.price_history(product_key, limit).await
    }

    /// Records a manual price entered by the actor. Without a unit, the
    /// product's default unit is used.
    pub async fn set_manual_price(
        &self,
        actor: &Actor,
        product_key: &str,
        price: f64,
        unit: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<PriceUpdate, AppError> {
        actor.require(Role::Admin)?;
        let product = self
            .store
            .get_product(product_key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("product '{product_key}'")))?;
        let entry = ManualPriceEntry {
            product_key: product.key,
            price,
            unit: unit.unwrap_or(product.unit),
            entered_by: actor.identity.clone(),
            entered_at: now,
        };
        self.pricing.set_manual_price(entry, now).await
    }

    /// Recomputes the given products, or every product when none are named.
    pub async fn recompute(
        &self,
        actor: &Actor,
        products: &[String],
        now: DateTime<Utc>,
    ) -> Result<RecomputeReport, AppError> {
        actor.require(Role::Admin)?;
        if products.is_empty() {
            self.pricing.recompute_all(now).await
        } else {
            Ok(self.pricing.recompute_products(products, now).await)
        }
    }

    pub async fn refresh_seasonal(
        &self,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Vec<SeasonalCoefficient>, AppError> {
        actor.require(Role::Admin)?;
        self.pricing.refresh_seasonal(now).await
    }
}
