use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response};
use chrono::{TimeDelta, Utc};
use http_body_util::BodyExt;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tower::ServiceExt;

use ceres_core::circuit_breaker::{CircuitBreaker, CircuitState};
use ceres_core::estimate::{ChainedEstimator, TrendEstimator};
use ceres_core::models::SourceKind;
use ceres_core::testutil::{MockFetcher, MockSessionFactory, sample_catalog, sample_source};
use ceres_core::traits::{BreakerStore, CatalogStore};
use ceres_core::{Engine, EngineConfig};
use ceres_db::Database;
use ceres_server::auth::AuthTokens;
use ceres_server::routes;
use ceres_server::state::AppState;

pub const ADMIN_TOKEN: &str = "admin-secret";
pub const VIEWER_TOKEN: &str = "viewer-secret";

pub struct TestApp {
    pub router: Router,
    pub db: Database,
    _container: ContainerAsync<GenericImage>,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// Reads a response body as JSON.
pub async fn json(response: Response<Body>) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

pub fn get(uri: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

pub fn post(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::post(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// App with both tokens configured and the `hal` breaker persisted Open.
pub async fn setup_test_app() -> TestApp {
    setup_with_tokens(AuthTokens {
        admin: Some(ADMIN_TOKEN.into()),
        viewer: Some(VIEWER_TOKEN.into()),
    })
    .await
}

pub async fn setup_test_app_no_auth() -> TestApp {
    setup_with_tokens(AuthTokens::default()).await
}

async fn setup_with_tokens(tokens: AuthTokens) -> TestApp {
    let container = GenericImage::new("postgres", "16")
        .with_exposed_port(ContainerPort::Tcp(5432))
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_PASSWORD", "postgres")
        .with_env_var("POSTGRES_DB", "ceres_test")
        .start()
        .await
        .expect("Failed to start PostgreSQL container");

    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");

    let url = format!("postgresql://postgres:postgres@{host}:{port}/ceres_test");
    let db = Database::from_pool(retry_connect(&url).await);
    db.migrate().await.expect("Failed to run migrations");

    for source in [
        sample_source("tzob", SourceKind::ReferenceIndex),
        sample_source("hal", SourceKind::WholesaleListing),
        sample_source("camgoz", SourceKind::MarketSearch),
    ] {
        db.upsert_source(&source).await.unwrap();
    }
    for product in sample_catalog() {
        db.upsert_product(&product).await.unwrap();
    }

    let config = EngineConfig::default();
    let mut open = CircuitBreaker::new(&config.breaker);
    open.state = CircuitState::Open;
    open.consecutive_failures = config.breaker.failure_threshold;
    open.open_until = Some(Utc::now() + TimeDelta::minutes(10));
    db.save_breaker("hal", &open).await.unwrap();

    let engine = Engine::bootstrap(
        db.clone(),
        MockFetcher::new(""),
        MockSessionFactory::with_pages(vec![]),
        ChainedEstimator::new(None, TrendEstimator::default()),
        config,
    )
    .await
    .unwrap();

    let state = Arc::new(AppState {
        db: db.clone(),
        admin: engine.admin(),
        tokens,
    });

    TestApp {
        router: routes::router(state),
        db,
        _container: container,
    }
}

async fn retry_connect(url: &str) -> sqlx::PgPool {
    for _ in 0..30 {
        if let Ok(pool) = PgPoolOptions::new().max_connections(5).connect(url).await {
            return pool;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("Failed to connect to test database");
}
