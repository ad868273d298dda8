//! Wiring of the engine services and their background loops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::admin::AdminService;
use crate::config::EngineConfig;
use crate::error::AppError;
use crate::logbook::{JobJournal, JournalReporter};
use crate::pricing::PriceEngine;
use crate::registry::SourceRegistry;
use crate::scheduler::Scheduler;
use crate::scrape::ScrapeService;
use crate::traits::{Fetcher, PriceEstimator, SessionFactory, Storage};
use crate::trust::TrustScorer;
use crate::worker::{TracingWorkerReporter, WorkerService};

/// All engine services sharing one store and one source registry.
pub struct Engine<S, F, SF, E>
where
    S: Storage,
    F: Fetcher,
    SF: SessionFactory,
    E: PriceEstimator,
{
    store: S,
    registry: Arc<SourceRegistry>,
    worker: Arc<WorkerService<S, F, SF, E>>,
    scheduler: Scheduler<S>,
    trust: TrustScorer<S>,
    pricing: PriceEngine<S, E>,
    admin: Arc<AdminService<S, E>>,
    reporter: Arc<JournalReporter>,
    config: EngineConfig,
}

impl<S, F, SF, E> Engine<S, F, SF, E>
where
    S: Storage + 'static,
    F: Fetcher + 'static,
    SF: SessionFactory + 'static,
    E: PriceEstimator + Clone + 'static,
{
    /// Recovers state left by a previous process and builds the services.
    ///
    /// Jobs still Running are failed, persisted breakers are restored and
    /// every known source gets a registry slot.
    pub async fn bootstrap(
        store: S,
        fetcher: F,
        sessions: SF,
        estimator: E,
        config: EngineConfig,
    ) -> Result<Self, AppError> {
        let abandoned = store.fail_abandoned(Utc::now()).await?;
        if abandoned > 0 {
            tracing::warn!(count = abandoned, "Failed jobs abandoned by a previous run");
        }
        Self::attach(store, fetcher, sessions, estimator, config).await
    }

    /// Builds the services over an existing store without touching jobs left
    /// Running, for short-lived processes next to a live worker.
    pub async fn attach(
        store: S,
        fetcher: F,
        sessions: SF,
        estimator: E,
        config: EngineConfig,
    ) -> Result<Self, AppError> {
        let breakers = store.load_breakers().await?;
        tracing::info!(count = breakers.len(), "Restored circuit breakers");
        let registry = Arc::new(SourceRegistry::with_snapshots(
            config.breaker.clone(),
            breakers,
        ));
        let sources = store.list_sources().await?;
        registry.register(sources.iter().map(|s| s.id.as_str()));

        let reporter = Arc::new(JournalReporter::new(
            Arc::new(JobJournal::new(config.journal_capacity)),
            TracingWorkerReporter,
        ));
        let pricing = PriceEngine::new(
            store.clone(),
            estimator,
            config.pricing.clone(),
            config.seasonal.clone(),
        )?;
        let trust = TrustScorer::new(store.clone(), config.trust.clone());
        let scheduler = Scheduler::new(
            store.clone(),
            Arc::clone(&registry),
            config.scheduler.clone(),
        );
        let worker = Arc::new(WorkerService::new(
            store.clone(),
            Arc::clone(&registry),
            ScrapeService::new(fetcher, sessions, config.scrape.clone()),
            trust.clone(),
            pricing.clone(),
            config.worker.clone(),
        ));
        let admin = Arc::new(AdminService::new(
            store.clone(),
            Arc::clone(&registry),
            scheduler.clone(),
            pricing.clone(),
            Arc::clone(&reporter),
            config.admin.clone(),
        ));

        Ok(Self {
            store,
            registry,
            worker,
            scheduler,
            trust,
            pricing,
            admin,
            reporter,
            config,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    pub fn admin(&self) -> Arc<AdminService<S, E>> {
        Arc::clone(&self.admin)
    }

    pub fn worker(&self) -> &Arc<WorkerService<S, F, SF, E>> {
        &self.worker
    }

    pub fn pricing(&self) -> &PriceEngine<S, E> {
        &self.pricing
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Rescores every source, then re-resolves every product against the new
    /// scores so aged-out prices turn stale without a successful scrape.
    /// Returns how many active prices changed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        self.trust.recompute_all(now).await?;
        let report = self.pricing.recompute_all(now).await?;
        Ok(report.updated.len())
    }

    /// Runs the scheduler, the worker pool, the trust sweep and the seasonal
    /// refresh until `cancel_token` fires. Both periodic tasks end with a
    /// full price recompute. Returns after in-flight jobs end.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<(), AppError> {
        tracing::info!(
            worker_id = %self.config.worker.worker_id,
            concurrency = self.config.worker.concurrency,
            "Engine starting"
        );

        let scheduler = self
            .scheduler
            .run(cancel_token.clone(), Arc::clone(&self.reporter));
        let workers = Arc::clone(&self.worker).run(cancel_token.clone(), Arc::clone(&self.reporter));
        let trust = every(
            "trust sweep",
            self.config.trust_sweep_interval,
            cancel_token.clone(),
            |now| self.sweep(now),
        );
        let seasonal = every(
            "seasonal refresh",
            self.config.seasonal_refresh_interval,
            cancel_token.clone(),
            |now| async move {
                let coefficients = self.pricing.refresh_seasonal(now).await?;
                self.pricing.recompute_all(now).await?;
                Ok(coefficients.len())
            },
        );

        let ((), worker_result, (), ()) = tokio::join!(scheduler, workers, trust, seasonal);
        tracing::info!("Engine stopped");
        worker_result
    }
}

/// Calls `task` on a fixed interval until cancelled. Failures are logged.
async fn every<T, Fut>(
    name: &'static str,
    interval: Duration,
    cancel_token: CancellationToken,
    task: T,
) where
    T: Fn(DateTime<Utc>) -> Fut,
    Fut: Future<Output = Result<usize, AppError>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match task(Utc::now()).await {
            Ok(count) => tracing::debug!(task = name, count, "Periodic task finished"),
            Err(e) => tracing::error!(task = name, error = %e, "Periodic task failed"),
        }
    }
}
