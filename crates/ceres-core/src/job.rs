use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a scrape job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Lifecycle is forward-only. Queued may skip straight to Failed
    /// (circuit open) or Cancelled (operator cancel).
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => next != JobStatus::Queued && next != JobStatus::Succeeded,
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// What caused a job to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    Retry,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Manual => "manual",
            TriggerKind::Retry => "retry",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scheduled" => Ok(TriggerKind::Scheduled),
            "manual" => Ok(TriggerKind::Manual),
            "retry" => Ok(TriggerKind::Retry),
            _ => Err(format!("Unknown trigger kind: {}", s)),
        }
    }
}

/// Job-level retry configuration with exponential backoff.
///
/// Independent of the circuit breaker cooldown.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per job chain, including the first.
    pub max_attempts: u32,
    pub base_delay: TimeDelta,
    pub max_delay: TimeDelta,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: TimeDelta::minutes(1),
            max_delay: TimeDelta::minutes(30),
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows `attempt` (1-indexed).
    ///
    /// - Attempt 1: base
    /// - Attempt 2: base * 2
    /// - Attempt n: base * 2^(n-1), capped by max_delay
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self
            .base_delay
            .checked_mul(1i32 << exponent)
            .unwrap_or(self.max_delay);
        std::cmp::min(delay, self.max_delay)
    }
}

/// Counts reported by a successful job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub observations: usize,
    pub skipped_rows: usize,
    pub products: Vec<String>,
    /// SHA-256 of the raw payloads, in fetch order.
    pub payload_hash: Option<String>,
}

/// A scrape job in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub source_id: String,
    pub trigger: TriggerKind,
    pub status: JobStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest dispatch time; set on retries.
    pub not_before: DateTime<Utc>,
    pub result_summary: Option<JobSummary>,
    pub error_detail: Option<String>,
    pub error_code: Option<String>,
    pub cancel_requested: bool,
    pub retry_of: Option<Uuid>,
    pub superseded_by: Option<Uuid>,
    pub worker_id: Option<String>,
}

impl ScrapeJob {
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Builds the follow-up job for a transient failure.
    pub fn next_attempt(&self, config: &RetryConfig, now: DateTime<Utc>) -> NewScrapeJob {
        NewScrapeJob {
            source_id: self.source_id.clone(),
            trigger: TriggerKind::Retry,
            attempt: self.attempt + 1,
            max_attempts: self.max_attempts,
            not_before: now + config.delay_for_attempt(self.attempt),
            retry_of: Some(self.id),
        }
    }

    pub fn duration(&self) -> Option<TimeDelta> {
        Some(self.finished_at? - self.started_at?)
    }
}

/// Request to create a new scrape job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScrapeJob {
    pub source_id: String,
    pub trigger: TriggerKind,
    pub attempt: u32,
    pub max_attempts: u32,
    pub not_before: DateTime<Utc>,
    pub retry_of: Option<Uuid>,
}

impl NewScrapeJob {
    pub fn new(source_id: impl Into<String>, trigger: TriggerKind, now: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            trigger,
            attempt: 1,
            max_attempts: RetryConfig::default().max_attempts,
            not_before: now,
            retry_of: None,
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    /// A fresh retry chain for a failed job, requested by an operator.
    pub fn operator_retry(failed: &ScrapeJob, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            source_id: failed.source_id.clone(),
            trigger: TriggerKind::Retry,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            not_before: now,
            retry_of: Some(failed.id),
        }
    }
}

/// Filter for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub source_id: Option<String>,
    pub status: Option<JobStatus>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl JobFilter {
    pub fn matches(&self, job: &ScrapeJob) -> bool {
        self.source_id.as_ref().is_none_or(|s| *s == job.source_id)
            && self.status.is_none_or(|s| s == job.status)
            && self.created_from.is_none_or(|t| job.created_at >= t)
            && self.created_to.is_none_or(|t| job.created_at <= t)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<ScrapeJob>,
    pub total: usize,
}

/// Per-source last activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceActivity {
    pub source_id: String,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

/// Queue statistics for the admin surface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub last_24h_succeeded: u64,
    pub last_24h_failed: u64,
    pub avg_duration_secs: Option<f64>,
    pub sources: Vec<SourceActivity>,
}

impl QueueStats {
    pub fn count_for(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Succeeded => &mut self.succeeded,
            JobStatus::Failed => &mut self.failed,
            JobStatus::Cancelled => &mut self.cancelled,
        }
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Number of concurrent worker tasks.
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// How many queued candidates a worker inspects per claim.
    pub claim_batch: usize,
    pub retry_config: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            concurrency: 4,
            poll_interval: Duration::from_secs(5),
            claim_batch: 16,
            retry_config: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry_config = retry;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_lifecycle_is_forward_only() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Succeeded));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Queued));
    }

    #[test]
    fn test_retry_delay_schedule() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: TimeDelta::minutes(1),
            max_delay: TimeDelta::minutes(10),
        };
        assert_eq!(config.delay_for_attempt(1), TimeDelta::minutes(1));
        assert_eq!(config.delay_for_attempt(2), TimeDelta::minutes(2));
        assert_eq!(config.delay_for_attempt(3), TimeDelta::minutes(4));
        assert_eq!(config.delay_for_attempt(5), TimeDelta::minutes(10));
        assert_eq!(config.delay_for_attempt(60), TimeDelta::minutes(10));
    }

    #[test]
    fn test_next_attempt_links_chain() {
        let now = Utc::now();
        let job = ScrapeJob {
            id: Uuid::new_v4(),
            source_id: "hal".into(),
            trigger: TriggerKind::Scheduled,
            status: JobStatus::Running,
            attempt: 1,
            max_attempts: 3,
            created_at: now,
            started_at: Some(now),
            finished_at: None,
            not_before: now,
            result_summary: None,
            error_detail: None,
            error_code: None,
            cancel_requested: false,
            retry_of: None,
            superseded_by: None,
            worker_id: None,
        };
        let next = job.next_attempt(&RetryConfig::default(), now);
        assert_eq!(next.attempt, 2);
        assert_eq!(next.trigger, TriggerKind::Retry);
        assert_eq!(next.retry_of, Some(job.id));
        assert_eq!(next.not_before, now + TimeDelta::minutes(1));
        assert!(job.can_retry());
    }

    #[test]
    fn test_new_job_builder() {
        let now = Utc::now();
        let req = NewScrapeJob::new("tzob", TriggerKind::Manual, now).with_max_attempts(0);
        assert_eq!(req.source_id, "tzob");
        assert_eq!(req.attempt, 1);
        assert_eq!(req.max_attempts, 1);
    }
}
