use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use ceres_client::{OpenAiEstimator, ReqwestFetcher, SearchBackend, SearchBackendKind};
use ceres_core::estimate::{ChainedEstimator, TrendEstimator};
use ceres_core::{Engine, EngineConfig};
use ceres_db::{Database, DatabaseConfig};
use ceres_server::auth::AuthTokens;
use ceres_server::routes;
use ceres_server::state::AppState;

const BODY_LIMIT: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ceres=info".parse()?))
        .with_target(false)
        .init();

    let tokens = AuthTokens::from_env();
    if tokens.admin.is_none() {
        tracing::warn!("ADMIN_TOKEN not set; the /v1 API will refuse every request");
    }
    let addr = std::env::var("CERES_BIND").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    let config = EngineConfig::from_env()?;
    let db = Database::connect(&DatabaseConfig::from_env()?).await?;
    db.migrate().await?;

    let mut fetcher = ReqwestFetcher::new()?;
    if std::env::var("CERES_ALLOW_PRIVATE_URLS").is_ok_and(|v| v == "true") {
        fetcher = fetcher.allow_private_urls();
    }
    let backend_kind = match std::env::var("CERES_SEARCH_BACKEND") {
        Ok(kind) if !kind.is_empty() => kind.parse()?,
        _ => SearchBackendKind::default(),
    };
    let sessions = SearchBackend::build(backend_kind, fetcher.clone()).await?;

    let model = OpenAiEstimator::from_env()?;
    if model.is_none() {
        tracing::info!("OPENAI_API_KEY not set; estimates fall back to the trend estimator");
    }
    let estimator = ChainedEstimator::new(model, TrendEstimator::default());

    let engine = Arc::new(Engine::bootstrap(db.clone(), fetcher, sessions, estimator, config).await?);
    let state = Arc::new(AppState {
        db,
        admin: engine.admin(),
        tokens,
    });

    let cancel = CancellationToken::new();
    let engine_task = {
        let engine = Arc::clone(&engine);
        let cancel = cancel.clone();
        tokio::spawn(async move { engine.run(cancel).await })
    };

    let governor = GovernorConfigBuilder::default()
        .per_second(1)
        .burst_size(30)
        .finish()
        .context("invalid rate limit configuration")?;

    let app = routes::router(state)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(GovernorLayer::new(Arc::new(governor)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting server on {addr}");
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(cancel.clone()))
    .await?;

    cancel.cancel();
    engine_task.await??;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for CTRL+C");
            }
        }
        () = cancel.cancelled() => {}
    }
    tracing::info!("Shutdown signal received");
}
