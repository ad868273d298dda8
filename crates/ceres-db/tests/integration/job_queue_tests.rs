use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use ceres_core::error::AppError;
use ceres_core::job::{JobFilter, JobStatus, JobSummary, NewScrapeJob, RetryConfig, TriggerKind};
use ceres_core::job_queue::JobQueue;
use ceres_core::models::{MatchQuality, NewObservation};
use ceres_core::traits::ObservationStore;
use ceres_db::Database;

use crate::common::setup_test_db;

async fn queued(db: &Database, source: &str) -> ceres_core::ScrapeJob {
    db.create_job(NewScrapeJob::new(source, TriggerKind::Scheduled, Utc::now()))
        .await
        .unwrap()
}

fn observation(product: &str, source: &str, price: f64) -> NewObservation {
    NewObservation {
        product_key: product.into(),
        source_id: source.into(),
        price,
        unit: "kg".into(),
        observed_at: Utc::now(),
        quality: MatchQuality::Exact,
    }
}

#[tokio::test]
async fn test_create_job_and_verify_fields() {
    let (db, _container) = setup_test_db().await;

    let job = db
        .create_job(NewScrapeJob::new("hal", TriggerKind::Manual, Utc::now()).with_max_attempts(5))
        .await
        .unwrap();

    assert_eq!(job.source_id, "hal");
    assert_eq!(job.trigger, TriggerKind::Manual);
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.max_attempts, 5);
    assert!(job.worker_id.is_none());
    assert!(job.started_at.is_none());

    let fetched = db.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(fetched, job);
}

#[tokio::test]
async fn test_dispatchable_respects_not_before() {
    let (db, _container) = setup_test_db().await;
    let now = Utc::now();

    let ready = queued(&db, "hal").await;
    let mut later = NewScrapeJob::new("tzob", TriggerKind::Retry, now);
    later.not_before = now + TimeDelta::minutes(5);
    db.create_job(later).await.unwrap();

    let jobs = db.list_dispatchable(now, 10).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, ready.id);

    let jobs = db
        .list_dispatchable(now + TimeDelta::minutes(6), 10)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 2);
}

#[tokio::test]
async fn test_start_job_is_compare_and_set() {
    let (db, _container) = setup_test_db().await;
    let job = queued(&db, "hal").await;

    let started = db
        .start_job(job.id, "worker-1", Utc::now())
        .await
        .unwrap()
        .expect("Should start the job");
    assert_eq!(started.status, JobStatus::Running);
    assert_eq!(started.worker_id.as_deref(), Some("worker-1"));
    assert!(started.started_at.is_some());

    assert!(db.start_job(job.id, "worker-2", Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_one_running_job_per_source() {
    let (db, _container) = setup_test_db().await;
    let first = queued(&db, "hal").await;
    let second = queued(&db, "hal").await;

    assert!(db.start_job(first.id, "w-1", Utc::now()).await.unwrap().is_some());
    assert!(db.start_job(second.id, "w-2", Utc::now()).await.unwrap().is_none());

    let second = db.get_job(second.id).await.unwrap().unwrap();
    assert_eq!(second.status, JobStatus::Queued);
}

#[tokio::test]
async fn test_complete_job_persists_observations() {
    let (db, _container) = setup_test_db().await;
    let job = queued(&db, "tzob").await;
    db.start_job(job.id, "w-1", Utc::now()).await.unwrap();

    let summary = JobSummary {
        observations: 2,
        skipped_rows: 1,
        products: vec!["domates".into(), "limon".into()],
        payload_hash: Some("abc".into()),
    };
    let status = db
        .complete_job(
            job.id,
            &summary,
            &[observation("domates", "tzob", 30.0), observation("limon", "tzob", 45.5)],
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Succeeded);

    let job = db.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result_summary, Some(summary));
    assert!(job.duration().is_some());

    let history = db.observation_history("limon", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].price, 45.5);
}

#[tokio::test]
async fn test_complete_requires_running() {
    let (db, _container) = setup_test_db().await;
    let job = queued(&db, "tzob").await;

    let err = db
        .complete_job(job.id, &JobSummary::default(), &[], Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let err = db
        .complete_job(Uuid::new_v4(), &JobSummary::default(), &[], Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_cancel_while_running_discards_result() {
    let (db, _container) = setup_test_db().await;
    let job = queued(&db, "tzob").await;
    db.start_job(job.id, "w-1", Utc::now()).await.unwrap();

    let flagged = db.request_cancel(job.id, Utc::now()).await.unwrap().unwrap();
    assert_eq!(flagged.status, JobStatus::Running);
    assert!(flagged.cancel_requested);

    let status = db
        .complete_job(
            job.id,
            &JobSummary::default(),
            &[observation("domates", "tzob", 30.0)],
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Cancelled);
    assert!(db.observation_history("domates", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_queued_job_is_immediate() {
    let (db, _container) = setup_test_db().await;
    let job = queued(&db, "hal").await;

    let cancelled = db.request_cancel(job.id, Utc::now()).await.unwrap().unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.finished_at.is_some());
    assert!(db.start_job(job.id, "w-1", Utc::now()).await.unwrap().is_none());

    assert!(db.request_cancel(Uuid::new_v4(), Utc::now()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_queued_scopes_to_source() {
    let (db, _container) = setup_test_db().await;
    queued(&db, "hal").await;
    queued(&db, "hal").await;
    queued(&db, "tzob").await;

    assert_eq!(db.cancel_queued(Some("hal"), Utc::now()).await.unwrap(), 2);
    assert_eq!(db.cancel_queued(None, Utc::now()).await.unwrap(), 1);
    assert!(!db.has_open_job("tzob").await.unwrap());
}

#[tokio::test]
async fn test_fail_with_retry_links_successor() {
    let (db, _container) = setup_test_db().await;
    let job = queued(&db, "hal").await;
    let job = db.start_job(job.id, "w-1", Utc::now()).await.unwrap().unwrap();

    let now = Utc::now();
    let retry = job.next_attempt(&RetryConfig::default(), now);
    let (status, successor) = db
        .fail_job(job.id, &AppError::Timeout(30), Some(retry), now)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Failed);
    let successor = successor.unwrap();
    assert_eq!(successor.attempt, 2);
    assert_eq!(successor.retry_of, Some(job.id));
    assert_eq!(successor.trigger, TriggerKind::Retry);

    let failed = db.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(failed.superseded_by, Some(successor.id));
    assert_eq!(failed.error_code.as_deref(), Some("timeout"));

    // A second failure report for a terminal job is a no-op.
    let (status, none) = db
        .fail_job(job.id, &AppError::Timeout(30), None, now)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Failed);
    assert!(none.is_none());
}

#[tokio::test]
async fn test_retry_failed_creates_fresh_budget_once() {
    let (db, _container) = setup_test_db().await;
    let now = Utc::now();
    let job = queued(&db, "hal").await;
    db.start_job(job.id, "w-1", now).await.unwrap();
    db.fail_job(job.id, &AppError::NetworkError("reset".into()), None, now)
        .await
        .unwrap();

    let created = db.retry_failed(Some("hal"), 3, 100, now).await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].attempt, 1);
    assert_eq!(created[0].max_attempts, 3);
    assert_eq!(created[0].retry_of, Some(job.id));

    assert!(db.retry_failed(Some("hal"), 3, 100, now).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recent_outcomes_skip_fast_fails_and_cancels() {
    let (db, _container) = setup_test_db().await;
    let now = Utc::now();

    let fast = queued(&db, "hal").await;
    let open = AppError::CircuitOpen {
        source_id: "hal".into(),
        retry_after_secs: 30,
    };
    db.fail_job(fast.id, &open, None, now).await.unwrap();
    let cancelled = queued(&db, "hal").await;
    db.request_cancel(cancelled.id, now).await.unwrap();
    let real = queued(&db, "hal").await;
    db.start_job(real.id, "w-0", now).await.unwrap();
    db.fail_job(real.id, &AppError::Timeout(30), None, now)
        .await
        .unwrap();

    let outcomes = db.recent_outcomes("hal", 20).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].id, real.id);
}

#[tokio::test]
async fn test_list_jobs_filters_and_pages() {
    let (db, _container) = setup_test_db().await;
    for _ in 0..3 {
        queued(&db, "hal").await;
    }
    let tzob = queued(&db, "tzob").await;
    db.request_cancel(tzob.id, Utc::now()).await.unwrap();

    let page = db
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

    let page = db
        .list_jobs(&JobFilter {
            status: Some(JobStatus::Cancelled),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.jobs[0].id, tzob.id);
}

#[tokio::test]
async fn test_stats_count_statuses_and_activity() {
    let (db, _container) = setup_test_db().await;
    let now = Utc::now();
    let done = queued(&db, "tzob").await;
    db.start_job(done.id, "w-1", now).await.unwrap();
    db.complete_job(done.id, &JobSummary::default(), &[], now + TimeDelta::seconds(4))
        .await
        .unwrap();
    queued(&db, "hal").await;

    let stats = db.stats(now + TimeDelta::seconds(5)).await.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.last_24h_succeeded, 1);
    assert_eq!(stats.last_24h_failed, 0);
    assert!((stats.avg_duration_secs.unwrap() - 4.0).abs() < 0.01);
    assert_eq!(stats.sources.len(), 2);
    assert!(db.last_enqueued_at("hal").await.unwrap().is_some());
}

#[tokio::test]
async fn test_abandoned_running_jobs_fail_and_old_jobs_purge() {
    let (db, _container) = setup_test_db().await;
    let job = queued(&db, "hal").await;
    db.start_job(job.id, "gone", Utc::now()).await.unwrap();

    assert_eq!(db.fail_abandoned(Utc::now()).await.unwrap(), 1);
    let job = db.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_code.as_deref(), Some("internal_error"));

    queued(&db, "hal").await;
    let purged = db
        .purge_finished(Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(db.has_open_job("hal").await.unwrap());
}
