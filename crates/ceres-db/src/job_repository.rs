use chrono::{DateTime, TimeDelta, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgExecutor};
use uuid::Uuid;

use ceres_core::error::{AppError, CIRCUIT_OPEN_CODE};
use ceres_core::job::{
    JobFilter, JobPage, JobStatus, JobSummary, NewScrapeJob, QueueStats, ScrapeJob, SourceActivity,
};
use ceres_core::job_queue::JobQueue;
use ceres_core::models::NewObservation;

use crate::database::{Database, db_err, decode_err, is_unique_violation};
use crate::observation_repository::insert_observation_rows;

/// Page size used when a job listing asks for no explicit limit.
const DEFAULT_PAGE: i64 = 50;

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ScrapeJobRow {
    id: Uuid,
    source_id: String,
    trigger: String,
    status: String,
    attempt: i32,
    max_attempts: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    not_before: DateTime<Utc>,
    result_summary: Option<Json<JobSummary>>,
    error_detail: Option<String>,
    error_code: Option<String>,
    cancel_requested: bool,
    retry_of: Option<Uuid>,
    superseded_by: Option<Uuid>,
    worker_id: Option<String>,
}

impl TryFrom<ScrapeJobRow> for ScrapeJob {
    type Error = AppError;

    fn try_from(row: ScrapeJobRow) -> Result<Self, AppError> {
        Ok(ScrapeJob {
            id: row.id,
            source_id: row.source_id,
            trigger: row.trigger.parse().map_err(|e| decode_err("trigger", e))?,
            status: row.status.parse().map_err(|e| decode_err("status", e))?,
            attempt: row.attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            not_before: row.not_before,
            result_summary: row.result_summary.map(|s| s.0),
            error_detail: row.error_detail,
            error_code: row.error_code,
            cancel_requested: row.cancel_requested,
            retry_of: row.retry_of,
            superseded_by: row.superseded_by,
            worker_id: row.worker_id,
        })
    }
}

fn into_jobs(rows: Vec<ScrapeJobRow>) -> Result<Vec<ScrapeJob>, AppError> {
    rows.into_iter().map(ScrapeJob::try_from).collect()
}

async fn insert_job<'e, E: PgExecutor<'e>>(
    executor: E,
    request: &NewScrapeJob,
) -> Result<ScrapeJob, AppError> {
    sqlx::query_as::<_, ScrapeJobRow>(
        r#"
        INSERT INTO scrape_jobs (source_id, trigger, attempt, max_attempts, not_before, retry_of)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING *
        "#,
    )
    .bind(&request.source_id)
    .bind(request.trigger.as_str())
    .bind(request.attempt as i32)
    .bind(request.max_attempts as i32)
    .bind(request.not_before)
    .bind(request.retry_of)
    .fetch_one(executor)
    .await
    .map_err(db_err)?
    .try_into()
}

/// Locks a job row for the rest of the transaction.
async fn lock_job(
    conn: &mut PgConnection,
    job_id: Uuid,
) -> Result<(JobStatus, bool), AppError> {
    let row: Option<(String, bool)> = sqlx::query_as(
        "SELECT status, cancel_requested FROM scrape_jobs WHERE id = $1 FOR UPDATE",
    )
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;

    let (status, cancel_requested) =
        row.ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;
    let status = status.parse().map_err(|e| decode_err("status", e))?;
    Ok((status, cancel_requested))
}

async fn mark_cancelled(
    conn: &mut PgConnection,
    job_id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    sqlx::query("UPDATE scrape_jobs SET status = 'cancelled', finished_at = $2 WHERE id = $1")
        .bind(job_id)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

async fn link_successor(
    conn: &mut PgConnection,
    job_id: Uuid,
    successor: Uuid,
) -> Result<(), AppError> {
    sqlx::query("UPDATE scrape_jobs SET superseded_by = $2 WHERE id = $1")
        .bind(job_id)
        .bind(successor)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}

impl JobQueue for Database {
    async fn create_job(&self, request: NewScrapeJob) -> Result<ScrapeJob, AppError> {
        insert_job(&self.pool, &request).await
    }

    async fn list_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScrapeJob>, AppError> {
        let rows = sqlx::query_as::<_, ScrapeJobRow>(
            r#"
            SELECT * FROM scrape_jobs
            WHERE status = 'queued' AND not_before <= $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        into_jobs(rows)
    }

    async fn start_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ScrapeJob>, AppError> {
        let result = sqlx::query_as::<_, ScrapeJobRow>(
            r#"
            UPDATE scrape_jobs
            SET status = 'running', worker_id = $2, started_at = $3
            WHERE id = $1 AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.map(ScrapeJob::try_from).transpose(),
            // Another process already runs a job for this source.
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(job_id = %job_id, "Source already has a running job");
                Ok(None)
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        summary: &JobSummary,
        observations: &[NewObservation],
        now: DateTime<Utc>,
    ) -> Result<JobStatus, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (status, cancel_requested) = lock_job(&mut tx, job_id).await?;
        if status != JobStatus::Running {
            return Err(AppError::Conflict(format!(
                "job {job_id} is {status}, not running"
            )));
        }

        if cancel_requested {
            mark_cancelled(&mut tx, job_id, now).await?;
            tx.commit().await.map_err(db_err)?;
            return Ok(JobStatus::Cancelled);
        }

        sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET status = 'succeeded', finished_at = $2, result_summary = $3,
                error_detail = NULL, error_code = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(now)
        .bind(Json(summary))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        insert_observation_rows(&mut *tx, observations, now).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(JobStatus::Succeeded)
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &AppError,
        retry: Option<NewScrapeJob>,
        now: DateTime<Utc>,
    ) -> Result<(JobStatus, Option<ScrapeJob>), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (status, cancel_requested) = lock_job(&mut tx, job_id).await?;
        if status.is_terminal() {
            return Ok((status, None));
        }
        if cancel_requested {
            mark_cancelled(&mut tx, job_id, now).await?;
            tx.commit().await.map_err(db_err)?;
            return Ok((JobStatus::Cancelled, None));
        }

        sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET status = 'failed', finished_at = $2, error_detail = $3, error_code = $4
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(now)
        .bind(error.to_string())
        .bind(error.code())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let successor = match retry {
            Some(request) => {
                let next = insert_job(&mut *tx, &request).await?;
                link_successor(&mut tx, job_id, next.id).await?;
                Some(next)
            }
            None => None,
        };

        tx.commit().await.map_err(db_err)?;
        Ok((JobStatus::Failed, successor))
    }

    async fn request_cancel(
        &self,
        job_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ScrapeJob>, AppError> {
        // SET expressions see the row as it was before the update.
        let row = sqlx::query_as::<_, ScrapeJobRow>(
            r#"
            UPDATE scrape_jobs
            SET status = CASE WHEN status = 'queued' THEN 'cancelled' ELSE status END,
                finished_at = CASE WHEN status = 'queued' THEN $2 ELSE finished_at END,
                cancel_requested = cancel_requested OR status = 'running'
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(ScrapeJob::try_from).transpose()
    }

    async fn cancel_queued(
        &self,
        source_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET status = 'cancelled', finished_at = $2
            WHERE status = 'queued' AND ($1::text IS NULL OR source_id = $1)
            "#,
        )
        .bind(source_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn retry_failed(
        &self,
        source_id: Option<&str>,
        max_attempts: u32,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScrapeJob>, AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let rows = sqlx::query_as::<_, ScrapeJobRow>(
            r#"
            SELECT * FROM scrape_jobs
            WHERE status = 'failed' AND superseded_by IS NULL
              AND ($1::text IS NULL OR source_id = $1)
            ORDER BY created_at DESC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(source_id)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?;

        let mut created = Vec::with_capacity(rows.len());
        for failed in into_jobs(rows)? {
            let next =
                insert_job(&mut *tx, &NewScrapeJob::operator_retry(&failed, max_attempts, now))
                    .await?;
            link_successor(&mut tx, failed.id, next.id).await?;
            created.push(next);
        }

        tx.commit().await.map_err(db_err)?;
        Ok(created)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ScrapeJob>, AppError> {
        let row = sqlx::query_as::<_, ScrapeJobRow>("SELECT * FROM scrape_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(ScrapeJob::try_from).transpose()
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<JobPage, AppError> {
        const WHERE: &str = r#"
            WHERE ($1::text IS NULL OR source_id = $1)
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at <= $4)
        "#;
        let source_id = filter.source_id.as_deref();
        let status = filter.status.map(|s| s.as_str());
        let limit = if filter.limit == 0 {
            DEFAULT_PAGE
        } else {
            filter.limit as i64
        };

        let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM scrape_jobs {WHERE}"))
            .bind(source_id)
            .bind(status)
            .bind(filter.created_from)
            .bind(filter.created_to)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        let rows = sqlx::query_as::<_, ScrapeJobRow>(&format!(
            "SELECT * FROM scrape_jobs {WHERE} ORDER BY created_at DESC LIMIT $5 OFFSET $6"
        ))
        .bind(source_id)
        .bind(status)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(limit)
        .bind(filter.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(JobPage {
            jobs: into_jobs(rows)?,
            total: total as usize,
        })
    }

    async fn recent_outcomes(
        &self,
        source_id: &str,
        limit: usize,
    ) -> Result<Vec<ScrapeJob>, AppError> {
        let rows = sqlx::query_as::<_, ScrapeJobRow>(
            r#"
            SELECT * FROM scrape_jobs
            WHERE source_id = $1
              AND status IN ('succeeded', 'failed')
              AND error_code IS DISTINCT FROM $2
            ORDER BY COALESCE(finished_at, created_at) DESC
            LIMIT $3
            "#,
        )
        .bind(source_id)
        .bind(CIRCUIT_OPEN_CODE)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        into_jobs(rows)
    }

    async fn has_open_job(&self, source_id: &str) -> Result<bool, AppError> {
        let (open,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM scrape_jobs
                WHERE source_id = $1 AND status IN ('queued', 'running')
            )
            "#,
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(open)
    }

    async fn last_enqueued_at(&self, source_id: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        let (last,): (Option<DateTime<Utc>>,) =
            sqlx::query_as("SELECT MAX(created_at) FROM scrape_jobs WHERE source_id = $1")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(last)
    }

    async fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, AppError> {
        let mut stats = QueueStats::default();

        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM scrape_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        for (status, count) in counts {
            let status: JobStatus = status.parse().map_err(|e| decode_err("status", e))?;
            *stats.count_for(status) = count as u64;
        }

        let (succeeded, failed, avg): (i64, i64, Option<f64>) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'succeeded'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                (AVG(EXTRACT(EPOCH FROM (finished_at - started_at)))
                    FILTER (WHERE status = 'succeeded' AND started_at IS NOT NULL))::float8
            FROM scrape_jobs
            WHERE finished_at >= $1
            "#,
        )
        .bind(now - TimeDelta::hours(24))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        stats.last_24h_succeeded = succeeded as u64;
        stats.last_24h_failed = failed as u64;
        stats.avg_duration_secs = avg;

        let activity: Vec<(String, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT source_id, MAX(started_at), MAX(finished_at)
            FROM scrape_jobs
            GROUP BY source_id
            ORDER BY source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        stats.sources = activity
            .into_iter()
            .map(|(source_id, last_started_at, last_finished_at)| SourceActivity {
                source_id,
                last_started_at,
                last_finished_at,
            })
            .collect();

        Ok(stats)
    }

    async fn fail_abandoned(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let error = AppError::Generic("abandoned: worker stopped before finishing".into());
        let result = sqlx::query(
            r#"
            UPDATE scrape_jobs
            SET status = 'failed', finished_at = $1, error_detail = $2, error_code = $3
            WHERE status = 'running'
            "#,
        )
        .bind(now)
        .bind(error.to_string())
        .bind(error.code())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM scrape_jobs
            WHERE status IN ('succeeded', 'failed', 'cancelled') AND created_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}
