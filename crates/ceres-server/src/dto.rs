use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ceres_core::admin::SourceHealth;
use ceres_core::circuit_breaker::CircuitBreakerStats;
use ceres_core::job::{JobSummary, QueueStats, ScrapeJob};
use ceres_core::logbook::LogEntry;
use ceres_core::models::ActivePrice;
use ceres_core::pricing::{PriceUpdate, RecomputeReport};

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobSummaryResponse {
    pub observations: usize,
    pub skipped_rows: usize,
    pub products: Vec<String>,
    pub payload_hash: Option<String>,
}

impl From<JobSummary> for JobSummaryResponse {
    fn from(summary: JobSummary) -> Self {
        Self {
            observations: summary.observations,
            skipped_rows: summary.skipped_rows,
            products: summary.products,
            payload_hash: summary.payload_hash,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobResponse {
    pub id: Uuid,
    pub source_id: String,
    pub trigger: String,
    pub status: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub not_before: DateTime<Utc>,
    pub duration_secs: Option<f64>,
    pub result_summary: Option<JobSummaryResponse>,
    pub error_detail: Option<String>,
    pub error_code: Option<String>,
    pub cancel_requested: bool,
    pub retry_of: Option<Uuid>,
    pub superseded_by: Option<Uuid>,
    pub worker_id: Option<String>,
}

impl From<ScrapeJob> for JobResponse {
    fn from(job: ScrapeJob) -> Self {
        Self {
            duration_secs: job
                .duration()
                .map(|d| d.num_milliseconds() as f64 / 1000.0),
            id: job.id,
            source_id: job.source_id,
            trigger: job.trigger.as_str().to_string(),
            status: job.status.to_string(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            not_before: job.not_before,
            result_summary: job.result_summary.map(JobSummaryResponse::from),
            error_detail: job.error_detail,
            error_code: job.error_code,
            cancel_requested: job.cancel_requested,
            retry_of: job.retry_of,
            superseded_by: job.superseded_by,
            worker_id: job.worker_id,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListJobsQuery {
    /// Filter by source id.
    pub source: Option<String>,
    /// Filter by status (queued, running, succeeded, failed, cancelled).
    pub status: Option<String>,
    /// Only jobs created at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Only jobs created at or before this instant.
    pub to: Option<DateTime<Utc>>,
    /// Page size (default 50, max 500).
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

// ---------------------------------------------------------------------------
// Admin commands
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct SourceRequest {
    pub source: String,
}

/// Optional source scope; an empty body applies to every source.
#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct ScopeRequest {
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct CleanupRequest {
    /// Age in days of the finished jobs to purge (default 7).
    #[serde(default)]
    pub days: Option<u32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct CountResponse {
    pub count: u64,
}

// ---------------------------------------------------------------------------
// Health, stats, logs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct BreakerResponse {
    pub state: String,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub open_until: Option<DateTime<Utc>>,
    pub cooldown_remaining_secs: Option<u64>,
    pub cooldown_secs: u64,
    pub last_error: Option<String>,
    pub running_job: Option<Uuid>,
}

impl From<CircuitBreakerStats> for BreakerResponse {
    fn from(stats: CircuitBreakerStats) -> Self {
        Self {
            state: stats.state.as_str().to_string(),
            consecutive_failures: stats.consecutive_failures,
            failure_threshold: stats.failure_threshold,
            last_failure_at: stats.last_failure_at,
            last_success_at: stats.last_success_at,
            open_until: stats.open_until,
            cooldown_remaining_secs: stats.cooldown_remaining_secs,
            cooldown_secs: stats.cooldown_secs,
            last_error: stats.last_error,
            running_job: stats.running_job,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceHealthResponse {
    pub source_id: String,
    pub name: String,
    pub kind: String,
    pub enabled: bool,
    pub trust: Option<f64>,
    pub breaker: BreakerResponse,
}

impl From<SourceHealth> for SourceHealthResponse {
    fn from(health: SourceHealth) -> Self {
        Self {
            source_id: health.source_id,
            name: health.name,
            kind: health.kind.as_str().to_string(),
            enabled: health.enabled,
            trust: health.trust,
            breaker: health.breaker.into(),
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct SourceActivityResponse {
    pub source_id: String,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StatsResponse {
    /// Jobs waiting to run.
    pub queue_depth: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub last_24h_succeeded: u64,
    pub last_24h_failed: u64,
    pub avg_duration_secs: Option<f64>,
    pub sources: Vec<SourceActivityResponse>,
}

impl From<QueueStats> for StatsResponse {
    fn from(stats: QueueStats) -> Self {
        Self {
            queue_depth: stats.queued,
            running: stats.running,
            succeeded: stats.succeeded,
            failed: stats.failed,
            cancelled: stats.cancelled,
            last_24h_succeeded: stats.last_24h_succeeded,
            last_24h_failed: stats.last_24h_failed,
            avg_duration_secs: stats.avg_duration_secs,
            sources: stats
                .sources
                .into_iter()
                .map(|s| SourceActivityResponse {
                    source_id: s.source_id,
                    last_started_at: s.last_started_at,
                    last_finished_at: s.last_finished_at,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct LogsQuery {
    /// Minimum level (debug, info, warn, error).
    pub level: Option<String>,
    pub source: Option<String>,
    /// Number of entries, newest first (default 100).
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct LogEntryResponse {
    pub at: DateTime<Utc>,
    pub level: String,
    pub source_id: Option<String>,
    pub job_id: Option<Uuid>,
    pub message: String,
}

impl From<LogEntry> for LogEntryResponse {
    fn from(entry: LogEntry) -> Self {
        Self {
            at: entry.at,
            level: entry.level.as_str().to_string(),
            source_id: entry.source_id,
            job_id: entry.job_id,
            message: entry.message,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PriceResponse {
    pub id: Uuid,
    pub product_key: String,
    pub price: f64,
    pub unit: String,
    /// `manual`, `ai-estimate` or `source:<id>`.
    pub basis: String,
    pub confidence: f64,
    pub base_price: f64,
    pub seasonal_factor: f64,
    pub stale: bool,
    pub computed_at: DateTime<Utc>,
    pub is_current: bool,
}

impl From<ActivePrice> for PriceResponse {
    fn from(price: ActivePrice) -> Self {
        Self {
            id: price.id,
            product_key: price.product_key,
            price: price.price,
            unit: price.unit,
            basis: price.basis.to_db_string(),
            confidence: price.confidence,
            base_price: price.base_price,
            seasonal_factor: price.seasonal_factor,
            stale: price.stale,
            computed_at: price.computed_at,
            is_current: price.is_current,
        }
    }
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PriceListResponse {
    pub prices: Vec<PriceResponse>,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct HistoryQuery {
    /// Number of versions, newest first (default 20, max 200).
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct ManualPriceRequest {
    pub price: f64,
    /// Defaults to the product's unit.
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct PriceUpdateResponse {
    pub price: PriceResponse,
    /// False when the resolved price matched the current version.
    pub changed: bool,
}

impl From<PriceUpdate> for PriceUpdateResponse {
    fn from(update: PriceUpdate) -> Self {
        Self {
            price: update.price.into(),
            changed: update.changed,
        }
    }
}

#[derive(Debug, Default, Deserialize, utoipa::ToSchema)]
pub struct RecomputeRequest {
    /// Products to recompute; every product when empty.
    #[serde(default)]
    pub products: Vec<String>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RecomputeFailure {
    pub product: String,
    pub error: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct RecomputeResponse {
    pub updated: Vec<String>,
    pub unchanged: usize,
    pub missing: Vec<String>,
    pub failed: Vec<RecomputeFailure>,
}

impl From<RecomputeReport> for RecomputeResponse {
    fn from(report: RecomputeReport) -> Self {
        Self {
            updated: report.updated,
            unchanged: report.unchanged,
            missing: report.missing,
            failed: report
                .failed
                .into_iter()
                .map(|(product, error)| RecomputeFailure { product, error })
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Stable error code, e.g. `circuit_open`.
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}
