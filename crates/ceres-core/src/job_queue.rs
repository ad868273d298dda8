use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobFilter, JobPage, JobStatus, JobSummary, NewScrapeJob, QueueStats, ScrapeJob};
use crate::models::NewObservation;

/// Persistent job queue for scrape jobs.
///
/// Status changes are compare-and-set on the current status so a job never
/// moves backwards, and a cancelled job can never be started.
pub trait JobQueue: Send + Sync + Clone {
    fn create_job(
        &self,
        request: NewScrapeJob,
    ) -> impl Future<Output = Result<ScrapeJob, AppError>> + Send;

    /// Queued jobs whose `not_before` has passed, oldest first.
    fn list_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ScrapeJob>, AppError>> + Send;

    /// Atomically move a job from Queued to Running.
    ///
    /// Returns `None` if the job is no longer queued.
    fn start_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<ScrapeJob>, AppError>> + Send;

    /// Record a successful run: persist observations and mark the job
    /// Succeeded in one transaction. If cancellation was requested while the
    /// job ran, the observations are discarded and the job ends Cancelled.
    fn complete_job(
        &self,
        job_id: Uuid,
        summary: &JobSummary,
        observations: &[NewObservation],
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<JobStatus, AppError>> + Send;

    /// Mark a job Failed. When `retry` is provided the successor is enqueued
    /// and linked in the same transaction. A job with a pending cancellation
    /// ends Cancelled instead and no successor is created.
    fn fail_job(
        &self,
        job_id: Uuid,
        error: &AppError,
        retry: Option<NewScrapeJob>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<(JobStatus, Option<ScrapeJob>), AppError>> + Send;

    /// Cancel a queued job immediately, or flag a running one so its result
    /// is discarded. Returns the job as it stands afterwards.
    fn request_cancel(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<ScrapeJob>, AppError>> + Send;

    /// Cancel every queued job, optionally scoped to one source.
    fn cancel_queued(
        &self,
        source_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Enqueue a fresh retry for each failed job without a successor.
    fn retry_failed(
        &self,
        source_id: Option<&str>,
        max_attempts: u32,
        limit: usize,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<ScrapeJob>, AppError>> + Send;

    fn get_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<ScrapeJob>, AppError>> + Send;

    fn list_jobs(
        &self,
        filter: &JobFilter,
    ) -> impl Future<Output = Result<JobPage, AppError>> + Send;

    /// Jobs that actually ran to Succeeded or Failed for a source, newest
    /// first. Circuit-open fast fails and cancellations are left out.
    fn recent_outcomes(
        &self,
        source_id: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ScrapeJob>, AppError>> + Send;

    /// True when the source has a Queued or Running job.
    fn has_open_job(&self, source_id: &str)
    -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Created-at of the newest job for a source, whatever its trigger.
    fn last_enqueued_at(
        &self,
        source_id: &str,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, AppError>> + Send;

    fn stats(&self, now: DateTime<Utc>)
    -> impl Future<Output = Result<QueueStats, AppError>> + Send;

    /// Fail jobs left Running by a process that stopped without finishing them.
    fn fail_abandoned(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Delete finished jobs created before `older_than`.
    fn purge_finished(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}
