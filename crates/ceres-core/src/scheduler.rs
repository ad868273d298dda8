//! Periodic and manual enqueueing of scrape jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::CircuitState;
use crate::error::AppError;
use crate::job::{NewScrapeJob, RetryConfig, ScrapeJob, TriggerKind};
use crate::models::Source;
use crate::registry::SourceRegistry;
use crate::traits::Storage;
use crate::worker::{WorkerEvent, WorkerReporter};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often sources are checked for due jobs.
    pub tick: Duration,
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            max_attempts: RetryConfig::default().max_attempts,
        }
    }
}

/// True when an enabled source has gone a full polling interval since its
/// last job was enqueued.
pub fn is_due(source: &Source, last_enqueued: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    source.enabled && last_enqueued.is_none_or(|last| now - last >= source.polling_interval())
}

#[derive(Clone)]
pub struct Scheduler<S: Storage> {
    store: S,
    registry: Arc<SourceRegistry>,
    config: SchedulerConfig,
}

impl<S: Storage + 'static> Scheduler<S> {
    pub fn new(store: S, registry: Arc<SourceRegistry>, config: SchedulerConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Enqueues a scheduled job for every due source.
    ///
    /// Disabled sources, sources with a Queued or Running job and sources
    /// whose breaker is open are skipped.
    pub async fn tick<WR: WorkerReporter>(
        &self,
        now: DateTime<Utc>,
        reporter: &WR,
    ) -> Result<Vec<ScrapeJob>, AppError> {
        let mut enqueued = Vec::new();
        for source in self.store.list_sources().await? {
            if !source.enabled {
                continue;
            }
            if self.registry.state(&source.id, now) == CircuitState::Open {
                tracing::debug!(source = %source.id, "Breaker open, not scheduling");
                continue;
            }
            if self.store.has_open_job(&source.id).await? {
                continue;
            }
            let last = self.store.last_enqueued_at(&source.id).await?;
            if !is_due(&source, last, now) {
                continue;
            }

            let job = self
                .store
                .create_job(
                    NewScrapeJob::new(&source.id, TriggerKind::Scheduled, now)
                        .with_max_attempts(self.config.max_attempts),
                )
                .await?;
            reporter.report(WorkerEvent::JobEnqueued { job: &job });
            enqueued.push(job);
        }
        Ok(enqueued)
    }

    /// Enqueues a manual job right away.
    ///
    /// Fails with `CircuitOpen` while the breaker is open and with
    /// `Conflict` when the source is disabled or already has an open job.
    pub async fn trigger<WR: WorkerReporter>(
        &self,
        source_id: &str,
        now: DateTime<Utc>,
        reporter: &WR,
    ) -> Result<ScrapeJob, AppError> {
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("source '{source_id}'")))?;
        if !source.enabled {
            return Err(AppError::Conflict(format!("source '{source_id}' is disabled")));
        }
        self.registry.check(source_id, now)?;
        if self.store.has_open_job(source_id).await? {
            return Err(AppError::Conflict(format!(
                "source '{source_id}' already has a queued or running job"
            )));
        }

        let job = self
            .store
            .create_job(
                NewScrapeJob::new(source_id, TriggerKind::Manual, now)
                    .with_max_attempts(self.config.max_attempts),
            )
            .await?;
        reporter.report(WorkerEvent::JobEnqueued { job: &job });
        Ok(job)
    }

    /// Ticks until cancelled. Errors are logged and the loop continues.
    pub async fn run<WR: WorkerReporter>(&self, cancel_token: CancellationToken, reporter: Arc<WR>) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.tick(Utc::now(), reporter.as_ref()).await {
                Ok(jobs) if !jobs.is_empty() => {
                    tracing::info!(count = jobs.len(), "Scheduled scrape jobs");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Scheduler tick failed"),
            }
        }
        tracing::info!("Scheduler stopped");
    }
}
