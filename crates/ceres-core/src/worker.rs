use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::error::AppError;
use crate::job::{JobStatus, JobSummary, ScrapeJob, WorkerConfig};
use crate::models::Source;
use crate::pricing::PriceEngine;
use crate::registry::{Admission, RunPermit, SourceRegistry};
use crate::scrape::{ScrapeOutcome, ScrapeService};
use crate::traits::{Fetcher, PriceEstimator, SessionFactory, Storage};
use crate::trust::TrustScorer;

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling,
    JobEnqueued {
        job: &'a ScrapeJob,
    },
    JobStarted {
        job: &'a ScrapeJob,
    },
    JobCompleted {
        job: &'a ScrapeJob,
        summary: &'a JobSummary,
    },
    JobFailed {
        job: &'a ScrapeJob,
        error: &'a str,
        code: &'a str,
        will_retry: bool,
    },
    /// The breaker was open; the job failed without running.
    JobShortCircuited {
        job: &'a ScrapeJob,
        retry_after_secs: u64,
    },
    /// Cancellation was requested while the job ran; its results were dropped.
    JobCancelled {
        job: &'a ScrapeJob,
    },
    BreakerChanged {
        source_id: &'a str,
        state: CircuitState,
    },
    ShuttingDown {
        worker_id: &'a str,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::debug!("Polling for jobs");
            }
            WorkerEvent::JobEnqueued { job } => {
                tracing::info!(job_id = %job.id, source = %job.source_id, trigger = %job.trigger, "Job enqueued");
            }
            WorkerEvent::JobStarted { job } => {
                tracing::info!(job_id = %job.id, source = %job.source_id, attempt = job.attempt, "Processing job");
            }
            WorkerEvent::JobCompleted { job, summary } => {
                tracing::info!(
                    job_id = %job.id,
                    source = %job.source_id,
                    observations = summary.observations,
                    skipped = summary.skipped_rows,
                    "Job completed"
                );
            }
            WorkerEvent::JobFailed {
                job,
                error,
                code,
                will_retry,
            } => {
                tracing::warn!(job_id = %job.id, source = %job.source_id, %error, %code, %will_retry, "Job failed");
            }
            WorkerEvent::JobShortCircuited {
                job,
                retry_after_secs,
            } => {
                tracing::warn!(job_id = %job.id, source = %job.source_id, retry_after_secs, "Circuit open, job short-circuited");
            }
            WorkerEvent::JobCancelled { job } => {
                tracing::info!(job_id = %job.id, source = %job.source_id, "Job cancelled while running, results discarded");
            }
            WorkerEvent::BreakerChanged { source_id, state } => {
                tracing::warn!(source = %source_id, %state, "Circuit breaker state changed");
            }
            WorkerEvent::ShuttingDown { worker_id } => {
                tracing::info!(%worker_id, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

impl<R: WorkerReporter + ?Sized> WorkerReporter for Arc<R> {
    fn report(&self, event: WorkerEvent<'_>) {
        (**self).report(event);
    }
}

/// Pool of claim loops that dispatch queued jobs through the source
/// registry and record their outcomes.
pub struct WorkerService<S, F, SF, E>
where
    S: Storage,
    F: Fetcher,
    SF: SessionFactory,
    E: PriceEstimator,
{
    store: S,
    registry: Arc<SourceRegistry>,
    scraper: ScrapeService<F, SF>,
    trust: TrustScorer<S>,
    pricing: PriceEngine<S, E>,
    config: WorkerConfig,
}

impl<S, F, SF, E> WorkerService<S, F, SF, E>
where
    S: Storage + 'static,
    F: Fetcher + 'static,
    SF: SessionFactory + 'static,
    E: PriceEstimator + 'static,
{
    pub fn new(
        store: S,
        registry: Arc<SourceRegistry>,
        scraper: ScrapeService<F, SF>,
        trust: TrustScorer<S>,
        pricing: PriceEngine<S, E>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            scraper,
            trust,
            pricing,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run `concurrency` claim loops until cancellation. Jobs in flight
    /// finish before this returns.
    pub async fn run<WR: WorkerReporter + 'static>(
        self: Arc<Self>,
        cancel_token: CancellationToken,
        reporter: Arc<WR>,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        let handles: Vec<_> = (0..self.config.concurrency.max(1))
            .map(|slot| {
                let worker = Arc::clone(&self);
                let cancel = cancel_token.clone();
                let reporter = Arc::clone(&reporter);
                tokio::spawn(async move {
                    let worker_id = format!("{}-{}", worker.config.worker_id, slot);
                    worker.claim_loop(&worker_id, cancel, reporter.as_ref()).await;
                })
            })
            .collect();

        let joined = futures::future::join_all(handles);
        tokio::pin!(joined);
        let results = tokio::select! {
            biased;
            () = cancel_token.cancelled() => {
                reporter.report(WorkerEvent::ShuttingDown {
                    worker_id: &self.config.worker_id,
                });
                joined.await
            }
            results = &mut joined => results,
        };
        for result in results {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });
        Ok(())
    }

    async fn claim_loop<WR: WorkerReporter>(
        &self,
        worker_id: &str,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) {
        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling);

            match self.dispatch_next(worker_id, reporter).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(%worker_id, error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }
    }

    /// Walks the dispatchable jobs and runs the first one admitted.
    ///
    /// Returns `Ok(true)` when a job ran, `Ok(false)` when nothing could.
    pub async fn dispatch_next<WR: WorkerReporter>(
        &self,
        worker_id: &str,
        reporter: &WR,
    ) -> Result<bool, AppError> {
        let now = Utc::now();
        let candidates = self
            .store
            .list_dispatchable(now, self.config.claim_batch)
            .await?;

        for job in candidates {
            match self.registry.admit(&job.source_id, job.id, now) {
                Admission::Busy => continue,
                Admission::Rejected { retry_after } => {
                    self.short_circuit(&job, retry_after.as_secs(), reporter).await;
                }
                Admission::Granted(permit) => {
                    let Some(running) = self.store.start_job(job.id, worker_id, now).await? else {
                        // Cancelled or claimed elsewhere since it was listed.
                        continue;
                    };
                    self.process(running, permit, reporter).await;
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn short_circuit<WR: WorkerReporter>(
        &self,
        job: &ScrapeJob,
        retry_after_secs: u64,
        reporter: &WR,
    ) {
        let error = AppError::CircuitOpen {
            source_id: job.source_id.clone(),
            retry_after_secs,
        };
        match self.store.fail_job(job.id, &error, None, Utc::now()).await {
            Ok((JobStatus::Failed, _)) => {
                reporter.report(WorkerEvent::JobShortCircuited {
                    job,
                    retry_after_secs,
                });
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to short-circuit job");
            }
        }
    }

    async fn process<WR: WorkerReporter>(&self, job: ScrapeJob, permit: RunPermit, reporter: &WR) {
        reporter.report(WorkerEvent::JobStarted { job: &job });

        let source = match self.load_source(&job.source_id).await {
            Ok(source) => source,
            Err(e) => {
                self.record_failure(&job, permit, None, e, reporter).await;
                return;
            }
        };

        match self.scrape(&source).await {
            Ok(outcome) => self.record_success(&job, permit, &source, outcome, reporter).await,
            Err(e) => {
                self.record_failure(&job, permit, Some(&source), e, reporter)
                    .await
            }
        }
    }

    async fn load_source(&self, source_id: &str) -> Result<Source, AppError> {
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("source '{source_id}'")))?;
        if !source.enabled {
            return Err(AppError::Conflict(format!("source '{source_id}' is disabled")));
        }
        Ok(source)
    }

    async fn scrape(&self, source: &Source) -> Result<ScrapeOutcome, AppError> {
        let products = self.store.list_products().await?;
        let last_observed: HashMap<_, _> = self
            .store
            .last_observed_by_product(&source.id)
            .await?
            .into_iter()
            .collect();
        self.scraper.scrape(source, &products, &last_observed).await
    }

    async fn record_success<WR: WorkerReporter>(
        &self,
        job: &ScrapeJob,
        permit: RunPermit,
        source: &Source,
        outcome: ScrapeOutcome,
        reporter: &WR,
    ) {
        let now = Utc::now();
        let status = match self
            .store
            .complete_job(job.id, &outcome.summary, &outcome.observations, now)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                // Nothing was committed; the permit is released untouched.
                tracing::error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                self.release_job(job, &e).await;
                return;
            }
        };

        // The source answered correctly either way.
        let before = self.registry.state(&source.id, now);
        let snapshot = permit.finish(Ok(()), now);
        self.persist_breaker(&source.id, before, &snapshot, reporter)
            .await;

        match status {
            JobStatus::Succeeded => {
                reporter.report(WorkerEvent::JobCompleted {
                    job,
                    summary: &outcome.summary,
                });
                self.refresh_trust(source).await;
                if !outcome.summary.products.is_empty() {
                    self.pricing
                        .recompute_products(&outcome.summary.products, Utc::now())
                        .await;
                }
            }
            JobStatus::Cancelled => {
                reporter.report(WorkerEvent::JobCancelled { job });
                self.refresh_trust(source).await;
            }
            other => {
                tracing::warn!(job_id = %job.id, status = %other, "Unexpected status after completion");
            }
        }
    }

    async fn record_failure<WR: WorkerReporter>(
        &self,
        job: &ScrapeJob,
        permit: RunPermit,
        source: Option<&Source>,
        error: AppError,
        reporter: &WR,
    ) {
        let now = Utc::now();
        let before = self.registry.state(&job.source_id, now);
        let snapshot = permit.finish(Err(&error), now);
        self.persist_breaker(&job.source_id, before, &snapshot, reporter)
            .await;

        let retryable = error.is_retryable();
        let will_retry = retryable && job.can_retry();
        let recorded = if retryable && !will_retry {
            AppError::RetryExhausted {
                attempts: job.attempt,
                last_error: error.to_string(),
            }
        } else {
            error
        };
        let retry = will_retry.then(|| job.next_attempt(&self.config.retry_config, now));

        match self.store.fail_job(job.id, &recorded, retry, now).await {
            Ok((JobStatus::Cancelled, _)) => {
                reporter.report(WorkerEvent::JobCancelled { job });
            }
            Ok((_, successor)) => {
                reporter.report(WorkerEvent::JobFailed {
                    job,
                    error: &recorded.to_string(),
                    code: recorded.code(),
                    will_retry: successor.is_some(),
                });
                if let Some(next) = &successor {
                    reporter.report(WorkerEvent::JobEnqueued { job: next });
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
                self.release_job(job, &e).await;
            }
        }

        if let Some(source) = source {
            self.refresh_trust(source).await;
        }
    }

    /// Best-effort terminal write after the outcome could not be stored, so
    /// the job does not keep its source's running slot.
    async fn release_job(&self, job: &ScrapeJob, cause: &AppError) {
        let error = AppError::DatabaseError(format!("outcome not recorded: {cause}"));
        match self.store.fail_job(job.id, &error, None, Utc::now()).await {
            Ok((status, _)) => {
                tracing::warn!(job_id = %job.id, status = %status, "Job released after write failure");
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Job left running");
            }
        }
    }

    async fn persist_breaker<WR: WorkerReporter>(
        &self,
        source_id: &str,
        before: CircuitState,
        snapshot: &CircuitBreaker,
        reporter: &WR,
    ) {
        if let Err(e) = self.store.save_breaker(source_id, snapshot).await {
            tracing::error!(source = %source_id, error = %e, "Failed to persist circuit breaker");
        }
        if snapshot.state != before {
            reporter.report(WorkerEvent::BreakerChanged {
                source_id,
                state: snapshot.state,
            });
        }
    }

    async fn refresh_trust(&self, source: &Source) {
        if let Err(e) = self.trust.recompute(source, Utc::now()).await {
            tracing::warn!(source = %source.id, error = %e, "Trust recompute failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::error::CIRCUIT_OPEN_CODE;
    use crate::job::{JobFilter, NewScrapeJob, TriggerKind};
    use crate::job_queue::JobQueue;
    use crate::memory::MemoryStore;
    use crate::pricing::PricingConfig;
    use crate::scrape::ScrapeConfig;
    use crate::seasonal::SeasonalConfig;
    use crate::testutil::*;
    use crate::traits::{BreakerStore, ObservationStore, PriceStore};
    use crate::trust::TrustConfig;

    const INDEX: &str = r#"[{"product": "Domates", "price": 30}]"#;

    fn worker<F: Fetcher + 'static>(
        store: &MemoryStore,
        fetcher: F,
        threshold: u32,
    ) -> WorkerService<MemoryStore, F, MockSessionFactory, MockEstimator> {
        let registry = Arc::new(SourceRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            base_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(600),
        }));
        WorkerService::new(
            store.clone(),
            registry,
            ScrapeService::new(
                fetcher,
                MockSessionFactory::with_pages(vec![]),
                ScrapeConfig::default(),
            ),
            TrustScorer::new(store.clone(), TrustConfig::default()),
            PriceEngine::new(
                store.clone(),
                MockEstimator::none(),
                PricingConfig::default(),
                SeasonalConfig::default(),
            )
            .unwrap(),
            WorkerConfig::default(),
        )
    }

    async fn enqueue(store: &MemoryStore, source: &str) -> ScrapeJob {
        store
            .create_job(NewScrapeJob::new(source, TriggerKind::Manual, Utc::now()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_commits_observations_and_prices() {
        let store = seeded_store().await;
        let w = worker(&store, MockFetcher::new(INDEX), 3);
        let job = enqueue(&store, "tzob").await;

        assert!(w.dispatch_next("w-0", &TracingWorkerReporter).await.unwrap());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.result_summary.as_ref().unwrap().observations, 1);
        assert_eq!(job.worker_id.as_deref(), Some("w-0"));
        assert_eq!(store.latest_per_source("domates").await.unwrap().len(), 1);

        let price = store.current_price("domates").await.unwrap().unwrap();
        assert_eq!(price.price, 30.0);
        assert_eq!(price.basis, crate::models::PriceBasis::Source("tzob".into()));

        let trust = store.trust_scores().await.unwrap();
        assert!(trust.iter().any(|t| t.source_id == "tzob" && t.score > 0.9));
        let breakers = store.load_breakers().await.unwrap();
        assert!(breakers.iter().any(|(id, b)| id == "tzob" && b.state == CircuitState::Closed));
    }

    #[tokio::test]
    async fn test_lost_completion_write_releases_job() {
        let store = seeded_store().await;
        let fetcher = MockFetcher::with_responses(vec![Ok(INDEX.into()), Ok(INDEX.into())]);
        let w = worker(&store, fetcher, 3);
        let job = enqueue(&store, "tzob").await;
        store.fail_next_completion();

        assert!(w.dispatch_next("w-0", &TracingWorkerReporter).await.unwrap());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code.as_deref(), Some("database_error"));
        assert!(store.latest_per_source("domates").await.unwrap().is_empty());

        // The source is not wedged: the next job runs and commits.
        let next = enqueue(&store, "tzob").await;
        assert!(w.dispatch_next("w-0", &TracingWorkerReporter).await.unwrap());
        let next = store.get_job(next.id).await.unwrap().unwrap();
        assert_eq!(next.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_transient_failure_enqueues_linked_retry() {
        let store = seeded_store().await;
        let w = worker(
            &store,
            MockFetcher::with_error(AppError::NetworkError("reset".into())),
            5,
        );
        let job = enqueue(&store, "tzob").await;

        assert!(w.dispatch_next("w-0", &TracingWorkerReporter).await.unwrap());

        let failed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error_code.as_deref(), Some("network_error"));
        let successor = store
            .get_job(failed.superseded_by.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(successor.trigger, TriggerKind::Retry);
        assert_eq!(successor.attempt, 2);
        assert_eq!(successor.retry_of, Some(job.id));
        assert!(successor.not_before > Utc::now());

        // Backoff keeps the retry out of the next dispatch.
        assert!(!w.dispatch_next("w-0", &TracingWorkerReporter).await.unwrap());
    }

    #[tokio::test]
    async fn test_last_attempt_reports_exhaustion() {
        let store = seeded_store().await;
        let w = worker(
            &store,
            MockFetcher::with_error(AppError::Timeout(30)),
            5,
        );
        let mut request = NewScrapeJob::new("tzob", TriggerKind::Retry, Utc::now());
        request.attempt = 3;
        let job = store.create_job(request).await.unwrap();

        w.dispatch_next("w-0", &TracingWorkerReporter).await.unwrap();

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_code.as_deref(), Some("retry_exhausted"));
        assert!(job.superseded_by.is_none());
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits_without_fetching() {
        let store = seeded_store().await;
        let fetcher = MockFetcher::with_responses(vec![
            Ok("<html>bakım</html>".into()),
            Ok("<html>bakım</html>".into()),
            Ok("<html>bakım</html>".into()),
            Ok(INDEX.into()),
        ]);
        let w = worker(&store, fetcher.clone(), 3);

        for _ in 0..3 {
            enqueue(&store, "tzob").await;
            assert!(w.dispatch_next("w-0", &TracingWorkerReporter).await.unwrap());
        }
        let breakers = store.load_breakers().await.unwrap();
        assert!(breakers.iter().any(|(id, b)| id == "tzob" && b.state == CircuitState::Open));

        let fourth = enqueue(&store, "tzob").await;
        assert!(!w.dispatch_next("w-0", &TracingWorkerReporter).await.unwrap());

        let fourth = store.get_job(fourth.id).await.unwrap().unwrap();
        assert_eq!(fourth.status, JobStatus::Failed);
        assert_eq!(fourth.error_code.as_deref(), Some(CIRCUIT_OPEN_CODE));
        assert!(fourth.started_at.is_none());
        assert!(fourth.superseded_by.is_none());
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_job_never_runs() {
        let store = seeded_store().await;
        let fetcher = MockFetcher::new(INDEX);
        let w = worker(&store, fetcher.clone(), 3);
        let job = enqueue(&store, "tzob").await;

        let cancelled = store.request_cancel(job.id, Utc::now()).await.unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        assert!(!w.dispatch_next("w-0", &TracingWorkerReporter).await.unwrap());
        assert_eq!(fetcher.calls(), 0);
    }

    /// Requests cancellation of every running job while "fetching".
    #[derive(Clone)]
    struct CancellingFetcher {
        store: MemoryStore,
    }

    impl Fetcher for CancellingFetcher {
        async fn fetch(&self, _url: &str) -> Result<String, AppError> {
            let running = self
                .store
                .list_jobs(&JobFilter {
                    status: Some(JobStatus::Running),
                    limit: 10,
                    ..JobFilter::default()
                })
                .await?;
            for job in running.jobs {
                self.store.request_cancel(job.id, Utc::now()).await?;
            }
            Ok(INDEX.to_string())
        }

        async fn submit_form(&self, url: &str, _form: &[(String, String)]) -> Result<String, AppError> {
            self.fetch(url).await
        }
    }

    #[tokio::test]
    async fn test_cancel_while_running_discards_results() {
        let store = seeded_store().await;
        let w = worker(&store, CancellingFetcher { store: store.clone() }, 3);
        let job = enqueue(&store, "tzob").await;

        assert!(w.dispatch_next("w-0", &TracingWorkerReporter).await.unwrap());

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(store.latest_per_source("domates").await.unwrap().is_empty());
        assert!(store.current_price("domates").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pool_stops_on_cancellation() {
        let store = seeded_store().await;
        let w = Arc::new(worker(&store, MockFetcher::new(INDEX), 3));
        enqueue(&store, "tzob").await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&w).run(cancel.clone(), Arc::new(TracingWorkerReporter)));

        for _ in 0..50 {
            let stats = store.stats(Utc::now()).await.unwrap();
            if stats.succeeded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(store.stats(Utc::now()).await.unwrap().succeeded, 1);
    }
}
