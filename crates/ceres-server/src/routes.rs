use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Router, middleware};
use chrono::Utc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use ceres_core::Actor;
use ceres_core::error::AppError;
use ceres_core::job::{JobFilter, JobStatus};
use ceres_core::logbook::{LogFilter, LogLevel};

use crate::auth::authenticate;
use crate::dto::{
    BreakerResponse, CleanupRequest, CountResponse, HealthResponse, HistoryQuery,
    JobListResponse, JobResponse, ListJobsQuery, LogEntryResponse, LogsQuery,
    ManualPriceRequest, PriceListResponse, PriceResponse, PriceUpdateResponse, RecomputeRequest,
    RecomputeResponse, ScopeRequest, SourceHealthResponse, SourceRequest, StatsResponse,
};
use crate::error::ApiError;
use crate::openapi::ApiDoc;
use crate::state::AppState;

const MAX_JOB_PAGE: usize = 500;
const MAX_HISTORY: usize = 200;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/admin/health", get(source_health))
        .route("/v1/admin/stats", get(stats))
        .route("/v1/admin/jobs", get(list_jobs))
        .route("/v1/admin/logs", get(logs))
        .route("/v1/admin/trigger", post(trigger))
        .route("/v1/admin/reset", post(reset))
        .route("/v1/admin/retry", post(retry))
        .route("/v1/admin/cancel", post(cancel))
        .route("/v1/admin/cancel/{job_id}", post(cancel_job))
        .route("/v1/admin/cleanup", post(cleanup))
        .route("/v1/prices", get(list_prices))
        .route("/v1/prices/recompute", post(recompute))
        .route("/v1/prices/{product}", get(get_price))
        .route("/v1/prices/{product}/history", get(price_history))
        .route("/v1/prices/{product}/manual", post(set_manual_price))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

fn optional_source(source: Option<String>) -> Option<String> {
    source.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Admin: reads
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/admin/health",
    responses(
        (status = 200, description = "Breaker state per source", body = Vec<SourceHealthResponse>),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn source_health(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let health = state.admin.health(&actor, Utc::now()).await?;
    let body: Vec<SourceHealthResponse> = health.into_iter().map(Into::into).collect();
    Ok(axum::Json(body))
}

#[utoipa::path(
    get,
    path = "/v1/admin/stats",
    responses(
        (status = 200, description = "Queue statistics", body = StatsResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn stats(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.admin.stats(&actor, Utc::now()).await?;
    Ok(axum::Json(StatsResponse::from(stats)))
}

#[utoipa::path(
    get,
    path = "/v1/admin/jobs",
    params(ListJobsQuery),
    responses(
        (status = 200, description = "Page of jobs, newest first", body = JobListResponse),
        (status = 400, description = "Bad filter", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .map(|s| s.parse::<JobStatus>().map_err(AppError::InvalidInput))
        .transpose()?;

    let filter = JobFilter {
        source_id: optional_source(query.source),
        status,
        created_from: query.from,
        created_to: query.to,
        limit: query.limit.unwrap_or(0).min(MAX_JOB_PAGE),
        offset: query.offset.unwrap_or(0),
    };
    let page = state.admin.jobs(&actor, &filter).await?;

    Ok(axum::Json(JobListResponse {
        jobs: page.jobs.into_iter().map(JobResponse::from).collect(),
        total: page.total,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/admin/logs",
    params(LogsQuery),
    responses(
        (status = 200, description = "Recent journal entries, newest first", body = Vec<LogEntryResponse>),
        (status = 400, description = "Bad level", body = crate::dto::ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn logs(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Query(query): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let level = query
        .level
        .map(|l| l.parse::<LogLevel>().map_err(AppError::InvalidInput))
        .transpose()?;
    let filter = LogFilter {
        level,
        source_id: optional_source(query.source),
        limit: query.limit.unwrap_or(0),
    };

    let entries = state.admin.logs(&actor, &filter)?;
    let body: Vec<LogEntryResponse> = entries.into_iter().map(Into::into).collect();
    Ok(axum::Json(body))
}

// ---------------------------------------------------------------------------
// Admin: commands
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/admin/trigger",
    request_body = SourceRequest,
    responses(
        (status = 202, description = "Job enqueued", body = JobResponse),
        (status = 403, description = "Admin role required", body = crate::dto::ErrorResponse),
        (status = 404, description = "Unknown source", body = crate::dto::ErrorResponse),
        (status = 409, description = "Breaker open or job already pending", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    axum::Json(body): axum::Json<SourceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .admin
        .trigger(&actor, body.source.trim(), Utc::now())
        .await?;
    Ok((StatusCode::ACCEPTED, axum::Json(JobResponse::from(job))))
}

#[utoipa::path(
    post,
    path = "/v1/admin/reset",
    request_body = SourceRequest,
    responses(
        (status = 200, description = "Breaker closed", body = BreakerResponse),
        (status = 403, description = "Admin role required", body = crate::dto::ErrorResponse),
        (status = 404, description = "Unknown source", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn reset(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    axum::Json(body): axum::Json<SourceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state
        .admin
        .reset(&actor, body.source.trim(), Utc::now())
        .await?;
    Ok(axum::Json(BreakerResponse::from(stats)))
}

#[utoipa::path(
    post,
    path = "/v1/admin/retry",
    request_body = ScopeRequest,
    responses(
        (status = 202, description = "Retry jobs enqueued", body = JobListResponse),
        (status = 403, description = "Admin role required", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn retry(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    axum::Json(body): axum::Json<ScopeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let source = optional_source(body.source);
    let jobs = state
        .admin
        .retry(&actor, source.as_deref(), Utc::now())
        .await?;
    let total = jobs.len();
    Ok((
        StatusCode::ACCEPTED,
        axum::Json(JobListResponse {
            jobs: jobs.into_iter().map(JobResponse::from).collect(),
            total,
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/v1/admin/cancel",
    request_body = ScopeRequest,
    responses(
        (status = 200, description = "Number of queued jobs cancelled", body = CountResponse),
        (status = 403, description = "Admin role required", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    axum::Json(body): axum::Json<ScopeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let source = optional_source(body.source);
    let count = state
        .admin
        .cancel(&actor, source.as_deref(), Utc::now())
        .await?;
    Ok(axum::Json(CountResponse { count }))
}

#[utoipa::path(
    post,
    path = "/v1/admin/cancel/{job_id}",
    params(
        ("job_id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job as it stands after the request", body = JobResponse),
        (status = 403, description = "Admin role required", body = crate::dto::ErrorResponse),
        (status = 404, description = "Not found", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(job_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.admin.cancel_job(&actor, job_id, Utc::now()).await?;
    Ok(axum::Json(JobResponse::from(job)))
}

#[utoipa::path(
    post,
    path = "/v1/admin/cleanup",
    request_body = CleanupRequest,
    responses(
        (status = 200, description = "Number of finished jobs purged", body = CountResponse),
        (status = 403, description = "Admin role required", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "admin"
)]
pub async fn cleanup(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    axum::Json(body): axum::Json<CleanupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let count = state.admin.cleanup(&actor, body.days, Utc::now()).await?;
    Ok(axum::Json(CountResponse { count }))
}

// ---------------------------------------------------------------------------
// Prices
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/prices",
    responses(
        (status = 200, description = "Current price of every product", body = PriceListResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "prices"
)]
pub async fn list_prices(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let prices = state.admin.prices(&actor).await?;
    Ok(axum::Json(PriceListResponse {
        prices: prices.into_iter().map(PriceResponse::from).collect(),
    }))
}

#[utoipa::path(
    get,
    path = "/v1/prices/{product}",
    params(
        ("product" = String, Path, description = "Product key")
    ),
    responses(
        (status = 200, description = "Current active price", body = PriceResponse),
        (status = 404, description = "No price yet", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "prices"
)]
pub async fn get_price(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(product): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let price = state.admin.price(&actor, &product).await?;
    Ok(axum::Json(PriceResponse::from(price)))
}

#[utoipa::path(
    get,
    path = "/v1/prices/{product}/history",
    params(
        ("product" = String, Path, description = "Product key"),
        HistoryQuery,
    ),
    responses(
        (status = 200, description = "Price versions, newest first", body = PriceListResponse),
        (status = 404, description = "Unknown product", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "prices"
)]
pub async fn price_history(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(product): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, MAX_HISTORY);
    let prices = state.admin.price_history(&actor, &product, limit).await?;
    Ok(axum::Json(PriceListResponse {
        prices: prices.into_iter().map(PriceResponse::from).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/v1/prices/{product}/manual",
    params(
        ("product" = String, Path, description = "Product key")
    ),
    request_body = ManualPriceRequest,
    responses(
        (status = 200, description = "Manual price recorded and applied", body = PriceUpdateResponse),
        (status = 400, description = "Invalid price", body = crate::dto::ErrorResponse),
        (status = 403, description = "Admin role required", body = crate::dto::ErrorResponse),
        (status = 404, description = "Unknown product", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "prices"
)]
pub async fn set_manual_price(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    Path(product): Path<String>,
    axum::Json(body): axum::Json<ManualPriceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !body.price.is_finite() || body.price <= 0.0 {
        return Err(AppError::InvalidInput(format!(
            "price must be a positive number, got {}",
            body.price
        ))
        .into());
    }
    let unit = body.unit.filter(|u| !u.trim().is_empty());
    let update = state
        .admin
        .set_manual_price(&actor, &product, body.price, unit, Utc::now())
        .await?;
    Ok(axum::Json(PriceUpdateResponse::from(update)))
}

#[utoipa::path(
    post,
    path = "/v1/prices/recompute",
    request_body = RecomputeRequest,
    responses(
        (status = 200, description = "Recompute report", body = RecomputeResponse),
        (status = 403, description = "Admin role required", body = crate::dto::ErrorResponse),
    ),
    security(("bearer" = [])),
    tag = "prices"
)]
pub async fn recompute(
    State(state): State<Arc<AppState>>,
    Extension(actor): Extension<Actor>,
    axum::Json(body): axum::Json<RecomputeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .admin
        .recompute(&actor, &body.products, Utc::now())
        .await?;
    Ok(axum::Json(RecomputeResponse::from(report)))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let db_ok = state.db.health_check().await.is_ok();

    let (status, response) = if db_ok {
        (
            StatusCode::OK,
            HealthResponse {
                status: "healthy",
                database: "ok",
            },
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            HealthResponse {
                status: "unhealthy",
                database: "error",
            },
        )
    };

    (status, axum::Json(response))
}
