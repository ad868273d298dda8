//! In-memory implementation of every store trait.
//!
//! Backs the engine tests and `--memory` runs of the binaries. All state
//! sits behind one mutex, so each trait call is atomic the same way a
//! single Postgres transaction is.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{AppError, CIRCUIT_OPEN_CODE};
use crate::job::{
    JobFilter, JobPage, JobStatus, JobSummary, NewScrapeJob, QueueStats, ScrapeJob, SourceActivity,
};
use crate::job_queue::JobQueue;
use crate::models::{
    ActivePrice, ManualPriceEntry, NewObservation, PriceObservation, Product, SeasonalCoefficient,
    Source, SourceTrustScore,
};
use crate::traits::{BreakerStore, CatalogStore, MonthlyAverage, ObservationStore, PriceStore};

/// Page size used when a job listing asks for no explicit limit.
const DEFAULT_PAGE: usize = 50;

#[derive(Debug, Default)]
struct State {
    sources: BTreeMap<String, Source>,
    products: BTreeMap<String, Product>,
    jobs: Vec<ScrapeJob>,
    observations: Vec<PriceObservation>,
    prices: Vec<ActivePrice>,
    manual: Vec<ManualPriceEntry>,
    seasonal: HashMap<(String, u32), SeasonalCoefficient>,
    trust: BTreeMap<String, SourceTrustScore>,
    breakers: BTreeMap<String, CircuitBreaker>,
    /// Set by tests to make the next completion write fail.
    fail_next_complete: bool,
}

impl State {
    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut ScrapeJob, AppError> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))
    }

    fn push_job(&mut self, request: NewScrapeJob, now: DateTime<Utc>) -> ScrapeJob {
        let job = ScrapeJob {
            id: Uuid::new_v4(),
            source_id: request.source_id,
            trigger: request.trigger,
            status: JobStatus::Queued,
            attempt: request.attempt,
            max_attempts: request.max_attempts,
            created_at: now,
            started_at: None,
            finished_at: None,
            not_before: request.not_before,
            result_summary: None,
            error_detail: None,
            error_code: None,
            cancel_requested: false,
            retry_of: request.retry_of,
            superseded_by: None,
            worker_id: None,
        };
        self.jobs.push(job.clone());
        job
    }
}

/// Shared in-memory store. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `complete_job` call fail as a lost connection would.
    #[cfg(any(test, feature = "testutil"))]
    pub fn fail_next_completion(&self) {
        self.lock().fail_next_complete = true;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn finish_failed(job: &mut ScrapeJob, error: &AppError, now: DateTime<Utc>) {
    job.status = JobStatus::Failed;
    job.finished_at = Some(now);
    job.error_detail = Some(error.to_string());
    job.error_code = Some(error.code().to_string());
}

impl JobQueue for MemoryStore {
    async fn create_job(&self, request: NewScrapeJob) -> Result<ScrapeJob, AppError> {
        Ok(self.lock().push_job(request, Utc::now()))
    }

    async fn list_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScrapeJob>, AppError> {
        let state = self.lock();
        let mut jobs: Vec<_> = state
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Queued && j.not_before <= now)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn start_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScrapeJob>, AppError> {
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Queued {
            return Ok(None);
        }
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.worker_id = Some(worker_id.to_string());
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        summary: &JobSummary,
        observations: &[NewObservation],
        now: DateTime<Utc>,
    ) -> Result<JobStatus, AppError> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_complete) {
            return Err(AppError::DatabaseError("connection reset".into()));
        }
        let job = state.job_mut(job_id)?;
        if job.status != JobStatus::Running {
            return Err(AppError::Conflict(format!(
                "job {job_id} is {}, not running",
                job.status
            )));
        }
        job.finished_at = Some(now);
        if job.cancel_requested {
            job.status = JobStatus::Cancelled;
            return Ok(JobStatus::Cancelled);
        }
        job.status = JobStatus::Succeeded;
        job.result_summary = Some(summary.clone());

        state
            .observations
            .extend(observations.iter().map(|o| PriceObservation {
                id: Uuid::new_v4(),
                product_key: o.product_key.clone(),
                source_id: o.source_id.clone(),
                price: o.price,
                unit: o.unit.clone(),
                observed_at: o.observed_at,
                recorded_at: now,
                quality: o.quality,
            }));
        Ok(JobStatus::Succeeded)
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &AppError,
        retry: Option<NewScrapeJob>,
        now: DateTime<Utc>,
    ) -> Result<(JobStatus, Option<ScrapeJob>), AppError> {
        let mut state = self.lock();
        let job = state.job_mut(job_id)?;
        if job.status.is_terminal() {
            return Ok((job.status, None));
        }
        if job.cancel_requested {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(now);
            return Ok((JobStatus::Cancelled, None));
        }
        finish_failed(job, error, now);

        let successor = retry.map(|request| state.push_job(request, now));
        if let Some(next) = &successor {
            state.job_mut(job_id)?.superseded_by = Some(next.id);
        }
        Ok((JobStatus::Failed, successor))
    }

    async fn request_cancel(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ScrapeJob>, AppError> {
        let mut state = self.lock();
        let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(None);
        };
        match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::Cancelled;
                job.finished_at = Some(now);
            }
            JobStatus::Running => job.cancel_requested = true,
            _ => {}
        }
        Ok(Some(job.clone()))
    }

    async fn cancel_queued(
        &self,
        source_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut state = self.lock();
        let mut cancelled = 0;
        for job in state.jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Queued && source_id.is_none_or(|s| j.source_id == s)
        }) {
            job.status = JobStatus::Cancelled;
            job.finished_at = Some(now);
            cancelled += 1;
        }
        Ok(cancelled)
    }

    async fn retry_failed(
        &self,
        source_id: Option<&str>,
        max_attempts: u32,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, AppError> {
        let mut state = self.lock();
        let mut failed: Vec<ScrapeJob> = state
            .jobs
            .iter()
            .filter(|j| {
                j.status == JobStatus::Failed
                    && j.superseded_by.is_none()
                    && source_id.is_none_or(|s| j.source_id == s)
            })
            .cloned()
            .collect();
        failed.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        failed.truncate(limit);

        let mut created = Vec::with_capacity(failed.len());
        for job in failed {
            let next = state.push_job(NewScrapeJob::operator_retry(&job, max_attempts, now), now);
            state.job_mut(job.id)?.superseded_by = Some(next.id);
            created.push(next);
        }
        Ok(created)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ScrapeJob>, AppError> {
        Ok(self.lock().jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, AppError> {
        let state = self.lock();
        let mut jobs: Vec<_> = state
            .jobs
            .iter()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        let total = jobs.len();
        let limit = if filter.limit == 0 {
            DEFAULT_PAGE
        } else {
            filter.limit
        };
        let jobs = jobs.into_iter().skip(filter.offset).take(limit).collect();
        Ok(JobPage { jobs, total })
    }

    async fn recent_outcomes(
        &self,
        source_id: &str,
        limit: usize,
    ) -> Result<Vec<ScrapeJob>, AppError> {
        let state = self.lock();
        let mut jobs: Vec<_> = state
            .jobs
            .iter()
            .filter(|j| {
                j.source_id == source_id
                    && matches!(j.status, JobStatus::Succeeded | JobStatus::Failed)
                    && j.error_code.as_deref() != Some(CIRCUIT_OPEN_CODE)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.finished_at.unwrap_or(j.created_at)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn has_open_job(&self, source_id: &str) -> Result<bool, AppError> {
        Ok(self.lock().jobs.iter().any(|j| {
            j.source_id == source_id && matches!(j.status, JobStatus::Queued | JobStatus::Running)
        }))
    }

    async fn last_enqueued_at(&self, source_id: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .filter(|j| j.source_id == source_id)
            .map(|j| j.created_at)
            .max())
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, AppError> {
        let state = self.lock();
        let since = now - TimeDelta::hours(24);
        let mut stats = QueueStats::default();
        let mut durations = Vec::new();
        let mut activity: BTreeMap<&str, SourceActivity> = BTreeMap::new();

        for job in &state.jobs {
            *stats.count_for(job.status) += 1;

            let recent = job.finished_at.is_some_and(|t| t >= since);
            match job.status {
                JobStatus::Succeeded if recent => {
                    stats.last_24h_succeeded += 1;
                    if let Some(d) = job.duration() {
                        durations.push(d.num_milliseconds() as f64 / 1000.0);
                    }
                }
                JobStatus::Failed if recent => stats.last_24h_failed += 1,
                _ => {}
            }

            let entry = activity
                .entry(job.source_id.as_str())
                .or_insert_with(|| SourceActivity {
                    source_id: job.source_id.clone(),
                    last_started_at: None,
                    last_finished_at: None,
                });
            entry.last_started_at = entry.last_started_at.max(job.started_at);
            entry.last_finished_at = entry.last_finished_at.max(job.finished_at);
        }

        if !durations.is_empty() {
            stats.avg_duration_secs = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        stats.sources = activity.into_values().collect();
        Ok(stats)
    }

    async fn fail_abandoned(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.lock();
        let error = AppError::Generic("abandoned: worker stopped before finishing".into());
        let mut count = 0;
        for job in state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Running)
        {
            finish_failed(job, &error, now);
            count += 1;
        }
        Ok(count)
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = self.lock();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|j| !(j.status.is_terminal() && j.created_at < older_than));
        Ok((before - state.jobs.len()) as u64)
    }
}

impl CatalogStore for MemoryStore {
    async fn list_sources(&self) -> Result<Vec<Source>, AppError> {
        Ok(self.lock().sources.values().cloned().collect())
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>, AppError> {
        Ok(self.lock().sources.get(id).cloned())
    }

    async fn upsert_source(&self, source: &Source) -> Result<(), AppError> {
        self.lock()
            .sources
            .insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn set_source_enabled(&self, id: &str, enabled: bool) -> Result<bool, AppError> {
        let mut state = self.lock();
        match state.sources.get_mut(id) {
            Some(source) => {
                source.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_products(&self) -> Result<Vec<Product>, AppError> {
        Ok(self.lock().products.values().cloned().collect())
    }

    async fn get_product(&self, key: &str) -> Result<Option<Product>, AppError> {
        Ok(self.lock().products.get(key).cloned())
    }

    async fn upsert_product(&self, product: &Product) -> Result<(), AppError> {
        self.lock()
            .products
            .insert(product.key.clone(), product.clone());
        Ok(())
    }
}

impl ObservationStore for MemoryStore {
    async fn insert_observations(
        &self,
        observations: &[NewObservation],
        recorded_at: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let mut state = self.lock();
        state
            .observations
            .extend(observations.iter().map(|o| PriceObservation {
                id: Uuid::new_v4(),
                product_key: o.product_key.clone(),
                source_id: o.source_id.clone(),
                price: o.price,
                unit: o.unit.clone(),
                observed_at: o.observed_at,
                recorded_at,
                quality: o.quality,
            }));
        Ok(observations.len())
    }

    async fn latest_per_source(&self, product_key: &str) -> Result<Vec<PriceObservation>, AppError> {
        let state = self.lock();
        let mut latest: BTreeMap<&str, &PriceObservation> = BTreeMap::new();
        for obs in state
            .observations
            .iter()
            .filter(|o| o.product_key == product_key)
        {
            let newer = latest.get(obs.source_id.as_str()).is_none_or(|current| {
                (obs.observed_at, obs.recorded_at) >= (current.observed_at, current.recorded_at)
            });
            if newer {
                latest.insert(obs.source_id.as_str(), obs);
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn observation_history(
        &self,
        product_key: &str,
        limit: usize,
    ) -> Result<Vec<PriceObservation>, AppError> {
        let state = self.lock();
        let mut history: Vec<_> = state
            .observations
            .iter()
            .filter(|o| o.product_key == product_key)
            .cloned()
            .collect();
        history.sort_by_key(|o| std::cmp::Reverse((o.observed_at, o.recorded_at)));
        history.truncate(limit);
        Ok(history)
    }

    async fn newest_observed_at(&self, source_id: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        Ok(self
            .lock()
            .observations
            .iter()
            .filter(|o| o.source_id == source_id)
            .map(|o| o.observed_at)
            .max())
    }

    async fn last_observed_by_product(
        &self,
        source_id: &str,
    ) -> Result<Vec<(String, DateTime<Utc>)>, AppError> {
        let state = self.lock();
        let mut last: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
        for obs in state.observations.iter().filter(|o| o.source_id == source_id) {
            let entry = last.entry(obs.product_key.as_str()).or_insert(obs.observed_at);
            *entry = (*entry).max(obs.observed_at);
        }
        Ok(last
            .into_iter()
            .map(|(key, at)| (key.to_string(), at))
            .collect())
    }

    async fn monthly_averages(&self, since: DateTime<Utc>) -> Result<Vec<MonthlyAverage>, AppError> {
        let state = self.lock();
        let mut sums: BTreeMap<(&str, u32), (f64, u64)> = BTreeMap::new();
        for obs in state.observations.iter().filter(|o| o.observed_at >= since) {
            let Some(product) = state.products.get(&obs.product_key) else {
                continue;
            };
            let entry = sums
                .entry((product.category.as_str(), obs.observed_at.month()))
                .or_insert((0.0, 0));
            entry.0 += obs.price;
            entry.1 += 1;
        }
        Ok(sums
            .into_iter()
            .map(|((category, month), (sum, samples))| MonthlyAverage {
                category: category.to_string(),
                month,
                average: sum / samples as f64,
                samples,
            })
            .collect())
    }
}

impl PriceStore for MemoryStore {
    async fn current_price(&self, product_key: &str) -> Result<Option<ActivePrice>, AppError> {
        Ok(self
            .lock()
            .prices
            .iter()
            .find(|p| p.is_current && p.product_key == product_key)
            .cloned())
    }

    async fn current_prices(&self) -> Result<Vec<ActivePrice>, AppError> {
        let state = self.lock();
        let mut prices: Vec<_> = state.prices.iter().filter(|p| p.is_current).cloned().collect();
        prices.sort_by(|a, b| a.product_key.cmp(&b.product_key));
        Ok(prices)
    }

    async fn price_history(
        &self,
        product_key: &str,
        limit: usize,
    ) -> Result<Vec<ActivePrice>, AppError> {
        // Versions are appended, so reverse insertion order is newest first.
        Ok(self
            .lock()
            .prices
            .iter()
            .rev()
            .filter(|p| p.product_key == product_key)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replace_current_price(&self, price: &ActivePrice) -> Result<(), AppError> {
        let mut state = self.lock();
        for existing in state
            .prices
            .iter_mut()
            .filter(|p| p.is_current && p.product_key == price.product_key)
        {
            existing.is_current = false;
        }
        state.prices.push(ActivePrice {
            is_current: true,
            ..price.clone()
        });
        Ok(())
    }

    async fn manual_entry(&self, product_key: &str) -> Result<Option<ManualPriceEntry>, AppError> {
        Ok(self
            .lock()
            .manual
            .iter()
            .filter(|m| m.product_key == product_key)
            .max_by_key(|m| m.entered_at)
            .cloned())
    }

    async fn save_manual_entry(&self, entry: &ManualPriceEntry) -> Result<(), AppError> {
        self.lock().manual.push(entry.clone());
        Ok(())
    }

    async fn seasonal_factor(&self, category: &str, month: u32) -> Result<Option<f64>, AppError> {
        Ok(self
            .lock()
            .seasonal
            .get(&(category.to_string(), month))
            .map(|c| c.factor))
    }

    async fn save_seasonal_coefficients(
        &self,
        coefficients: &[SeasonalCoefficient],
    ) -> Result<(), AppError> {
        let mut state = self.lock();
        for c in coefficients {
            state
                .seasonal
                .insert((c.category.clone(), c.month), c.clone());
        }
        Ok(())
    }

    async fn trust_scores(&self) -> Result<Vec<SourceTrustScore>, AppError> {
        Ok(self.lock().trust.values().cloned().collect())
    }

    async fn save_trust_score(&self, score: &SourceTrustScore) -> Result<(), AppError> {
        self.lock()
            .trust
            .insert(score.source_id.clone(), score.clone());
        Ok(())
    }
}

impl BreakerStore for MemoryStore {
    async fn load_breakers(&self) -> Result<Vec<(String, CircuitBreaker)>, AppError> {
        Ok(self
            .lock()
            .breakers
            .iter()
            .map(|(id, b)| (id.clone(), b.clone()))
            .collect())
    }

    async fn save_breaker(&self, source_id: &str, breaker: &CircuitBreaker) -> Result<(), AppError> {
        self.lock()
            .breakers
            .insert(source_id.to_string(), breaker.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::TriggerKind;

    async fn queued(store: &MemoryStore, source: &str) -> ScrapeJob {
        store
            .create_job(NewScrapeJob::new(source, TriggerKind::Manual, Utc::now()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_is_compare_and_set() {
        let store = MemoryStore::new();
        let job = queued(&store, "hal").await;
        let now = Utc::now();

        assert!(store.start_job(job.id, "w-0", now).await.unwrap().is_some());
        assert!(store.start_job(job.id, "w-1", now).await.unwrap().is_none());

        let cancelled = queued(&store, "hal").await;
        store.request_cancel(cancelled.id, now).await.unwrap();
        assert!(store.start_job(cancelled.id, "w-0", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_requested_while_running_discards_observations() {
        let store = MemoryStore::new();
        let job = queued(&store, "hal").await;
        let now = Utc::now();
        store.start_job(job.id, "w-0", now).await.unwrap();

        let flagged = store.request_cancel(job.id, now).await.unwrap().unwrap();
        assert_eq!(flagged.status, JobStatus::Running);
        assert!(flagged.cancel_requested);

        let obs = NewObservation {
            product_key: "domates".into(),
            source_id: "hal".into(),
            price: 20.0,
            unit: "kg".into(),
            observed_at: now,
            quality: crate::models::MatchQuality::Exact,
        };
        let status = store
            .complete_job(job.id, &JobSummary::default(), &[obs], now)
            .await
            .unwrap();
        assert_eq!(status, JobStatus::Cancelled);
        assert!(store.latest_per_source("domates").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fail_with_retry_links_successor() {
        let store = MemoryStore::new();
        let job = queued(&store, "hal").await;
        let now = Utc::now();
        store.start_job(job.id, "w-0", now).await.unwrap();
        let running = store.get_job(job.id).await.unwrap().unwrap();

        let retry = running.next_attempt(&crate::job::RetryConfig::default(), now);
        let (status, successor) = store
            .fail_job(job.id, &AppError::NetworkError("reset".into()), Some(retry), now)
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Failed);
        let successor = successor.unwrap();
        assert_eq!(successor.attempt, 2);
        let failed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(failed.superseded_by, Some(successor.id));
        assert_eq!(failed.error_code.as_deref(), Some("network_error"));

        // Already linked, so an operator retry skips it.
        assert!(store.retry_failed(None, 3, 10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recent_outcomes_skip_fast_fails_and_cancels() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let short = queued(&store, "hal").await;
        let open = AppError::CircuitOpen {
            source_id: "hal".into(),
            retry_after_secs: 30,
        };
        store.fail_job(short.id, &open, None, now).await.unwrap();
        let cancelled = queued(&store, "hal").await;
        store.request_cancel(cancelled.id, now).await.unwrap();
        let real = queued(&store, "hal").await;
        store.start_job(real.id, "w-0", now).await.unwrap();
        store
            .fail_job(real.id, &AppError::Timeout(30), None, now)
            .await
            .unwrap();

        let outcomes = store.recent_outcomes("hal", 20).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].id, real.id);
    }

    #[tokio::test]
    async fn test_list_jobs_pages_newest_first() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            queued(&store, "hal").await;
        }
        queued(&store, "tzob").await;

        let page = store
            .list_jobs(&JobFilter {
                source_id: Some("hal".into()),
                limit: 2,
                ..JobFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.jobs.len(), 2);
        assert!(page.jobs[0].created_at >= page.jobs[1].created_at);
    }

    #[tokio::test]
    async fn test_replace_keeps_one_current_version() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let price = |value: f64| ActivePrice {
            id: Uuid::new_v4(),
            product_key: "domates".into(),
            price: value,
            unit: "kg".into(),
            basis: crate::models::PriceBasis::Manual,
            confidence: 1.0,
            base_price: value,
            seasonal_factor: 1.0,
            stale: false,
            computed_at: now,
            is_current: true,
        };
        store.replace_current_price(&price(20.0)).await.unwrap();
        store.replace_current_price(&price(25.0)).await.unwrap();

        let history = store.price_history("domates", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].price, 25.0);
        assert!(history[0].is_current);
        assert!(!history[1].is_current);
        assert_eq!(store.current_prices().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_running_jobs_fail_at_startup() {
        let store = MemoryStore::new();
        let job = queued(&store, "hal").await;
        store.start_job(job.id, "w-0", Utc::now()).await.unwrap();

        assert_eq!(store.fail_abandoned(Utc::now()).await.unwrap(), 1);
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(!store.has_open_job("hal").await.unwrap());
    }
}
