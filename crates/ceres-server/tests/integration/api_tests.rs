use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;

use ceres_core::traits::PriceStore;

use crate::common::{
    ADMIN_TOKEN, VIEWER_TOKEN, get, json, post, setup_test_app, setup_test_app_no_auth,
};

#[tokio::test]
async fn test_health_returns_200() {
    let app = setup_test_app().await;

    let response = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "ok");
}

#[tokio::test]
async fn test_missing_or_wrong_token_returns_401() {
    let app = setup_test_app().await;

    let response = app
        .send(Request::get("/v1/admin/stats").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.send(get("/v1/admin/stats", "wrong-token")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unconfigured_tokens_return_403() {
    let app = setup_test_app_no_auth().await;

    let response = app.send(get("/v1/admin/stats", "any-token")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json(response).await["error"], "forbidden");
}

#[tokio::test]
async fn test_viewer_reads_but_cannot_mutate() {
    let app = setup_test_app().await;

    let response = app.send(get("/v1/admin/health", VIEWER_TOKEN)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let sources = json(response).await;
    let sources = sources.as_array().unwrap();
    assert_eq!(sources.len(), 3);
    let hal = sources.iter().find(|s| s["source_id"] == "hal").unwrap();
    assert_eq!(hal["breaker"]["state"], "open");
    assert!(hal["breaker"]["cooldown_remaining_secs"].as_u64().unwrap() > 0);

    let response = app
        .send(post("/v1/admin/trigger", VIEWER_TOKEN, json!({"source": "tzob"})))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json(response).await["error"], "forbidden");
}

#[tokio::test]
async fn test_trigger_enqueues_once() {
    let app = setup_test_app().await;

    let response = app
        .send(post("/v1/admin/trigger", ADMIN_TOKEN, json!({"source": "tzob"})))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let job = json(response).await;
    assert_eq!(job["status"], "queued");
    assert_eq!(job["trigger"], "manual");

    let response = app
        .send(post("/v1/admin/trigger", ADMIN_TOKEN, json!({"source": "tzob"})))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json(response).await["error"], "conflict");

    let response = app
        .send(post("/v1/admin/trigger", ADMIN_TOKEN, json!({"source": "nope"})))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_open_breaker_rejects_trigger_until_reset() {
    let app = setup_test_app().await;

    let response = app
        .send(post("/v1/admin/trigger", ADMIN_TOKEN, json!({"source": "hal"})))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(response.headers().contains_key("retry-after"));
    let body = json(response).await;
    assert_eq!(body["error"], "circuit_open");
    assert!(body["retry_after_secs"].as_u64().unwrap() > 0);

    let response = app
        .send(post("/v1/admin/reset", ADMIN_TOKEN, json!({"source": "hal"})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["state"], "closed");

    let response = app
        .send(post("/v1/admin/trigger", ADMIN_TOKEN, json!({"source": "hal"})))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn test_jobs_can_be_listed_and_cancelled() {
    let app = setup_test_app().await;
    let response = app
        .send(post("/v1/admin/trigger", ADMIN_TOKEN, json!({"source": "tzob"})))
        .await;
    let job_id = json(response).await["id"].as_str().unwrap().to_string();

    let response = app
        .send(get("/v1/admin/jobs?status=queued&source=tzob", VIEWER_TOKEN))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let page = json(response).await;
    assert_eq!(page["total"], 1);
    assert_eq!(page["jobs"][0]["id"], job_id.as_str());

    let response = app
        .send(get("/v1/admin/jobs?status=exploded", VIEWER_TOKEN))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(post(&format!("/v1/admin/cancel/{job_id}"), ADMIN_TOKEN, json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json(response).await["status"], "cancelled");

    let response = app
        .send(post(
            "/v1/admin/cancel/00000000-0000-0000-0000-000000000000",
            ADMIN_TOKEN,
            json!({}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .send(post("/v1/admin/cancel", ADMIN_TOKEN, json!({})))
        .await;
    assert_eq!(json(response).await["count"], 0);

    let response = app
        .send(post("/v1/admin/cleanup", ADMIN_TOKEN, json!({"days": 0})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_logs_and_stats_reflect_activity() {
    let app = setup_test_app().await;
    app.send(post("/v1/admin/trigger", ADMIN_TOKEN, json!({"source": "tzob"})))
        .await;

    let response = app
        .send(get("/v1/admin/logs?source=tzob&level=info", VIEWER_TOKEN))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let entries = json(response).await;
    assert!(
        entries
            .as_array()
            .unwrap()
            .iter()
            .any(|e| e["message"].as_str().unwrap().contains("enqueued"))
    );

    let response = app.send(get("/v1/admin/stats", VIEWER_TOKEN)).await;
    let stats = json(response).await;
    assert_eq!(stats["queue_depth"], 1);
}

#[tokio::test]
async fn test_manual_price_wins_and_is_versioned() {
    let app = setup_test_app().await;

    let response = app.send(get("/v1/prices/domates", VIEWER_TOKEN)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .send(post(
            "/v1/prices/domates/manual",
            ADMIN_TOKEN,
            json!({"price": 42.5}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let update = json(response).await;
    assert_eq!(update["price"]["basis"], "manual");
    assert_eq!(update["price"]["unit"], "kg");

    let response = app.send(get("/v1/prices/domates", VIEWER_TOKEN)).await;
    let price = json(response).await;
    assert_eq!(price["price"], 42.5);
    assert_eq!(price["is_current"], true);

    let response = app
        .send(get("/v1/prices/domates/history?limit=5", VIEWER_TOKEN))
        .await;
    assert_eq!(json(response).await["prices"].as_array().unwrap().len(), 1);
    let stored = app.db.current_price("domates").await.unwrap().unwrap();
    assert_eq!(stored.price, 42.5);

    let response = app
        .send(post("/v1/prices/domates/manual", ADMIN_TOKEN, json!({"price": -1})))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(post("/v1/prices/karpuz/manual", ADMIN_TOKEN, json!({"price": 12})))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_recompute_reports_products() {
    let app = setup_test_app().await;
    app.send(post(
        "/v1/prices/limon/manual",
        ADMIN_TOKEN,
        json!({"price": 60}),
    ))
    .await;

    let response = app
        .send(post("/v1/prices/recompute", ADMIN_TOKEN, json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let report = json(response).await;
    assert_eq!(report["unchanged"], 1);
    assert_eq!(report["missing"].as_array().unwrap().len(), 3);

    let response = app
        .send(post("/v1/prices/recompute", VIEWER_TOKEN, json!({})))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.send(get("/v1/prices", VIEWER_TOKEN)).await;
    assert_eq!(json(response).await["prices"].as_array().unwrap().len(), 1);
}
