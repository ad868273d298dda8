use std::time::Duration;

use chrono::{TimeDelta, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use ceres_core::circuit_breaker::{CircuitBreaker, CircuitState};
use ceres_core::models::{
    ActivePrice, ManualPriceEntry, MatchQuality, NewObservation, PriceBasis, SeasonalCoefficient,
    SourceTrustScore,
};
use ceres_core::testutil::{MockEstimator, MockFetcher, MockSessionFactory, sample_product};
use ceres_core::traits::{BreakerStore, CatalogStore, ObservationStore, PriceStore};
use ceres_core::{Engine, EngineConfig};

use crate::common::{seeded_db, setup_test_db};

fn observation(product: &str, source: &str, price: f64, days_ago: i64) -> NewObservation {
    NewObservation {
        product_key: product.into(),
        source_id: source.into(),
        price,
        unit: "kg".into(),
        observed_at: Utc::now() - TimeDelta::days(days_ago),
        quality: MatchQuality::Exact,
    }
}

fn active(product: &str, price: f64) -> ActivePrice {
    ActivePrice {
        id: Uuid::new_v4(),
        product_key: product.into(),
        price,
        unit: "kg".into(),
        basis: PriceBasis::Source("tzob".into()),
        confidence: 0.9,
        base_price: price,
        seasonal_factor: 1.0,
        stale: false,
        computed_at: Utc::now(),
        is_current: true,
    }
}

#[tokio::test]
async fn test_catalog_upserts_are_idempotent() {
    let (db, _container) = seeded_db().await;

    let mut product = sample_product("domates", "Domates", "sebze");
    product.search_term = Some("domates kg".into());
    product.aliases = vec!["Domates (Sofralık)".into()];
    db.upsert_product(&product).await.unwrap();
    db.upsert_product(&product).await.unwrap();

    let stored = db.get_product("domates").await.unwrap().unwrap();
    assert_eq!(stored, product);
    assert_eq!(db.list_products().await.unwrap().len(), 4);

    let sources = db.list_sources().await.unwrap();
    assert_eq!(sources.len(), 3);
    assert!(db.set_source_enabled("hal", false).await.unwrap());
    assert!(!db.get_source("hal").await.unwrap().unwrap().enabled);
    assert!(!db.set_source_enabled("nope", false).await.unwrap());
}

#[tokio::test]
async fn test_latest_per_source_picks_newest() {
    let (db, _container) = seeded_db().await;
    let now = Utc::now();
    db.insert_observations(
        &[
            observation("domates", "tzob", 28.0, 3),
            observation("domates", "tzob", 30.0, 1),
            observation("domates", "hal", 25.0, 2),
            observation("biber", "hal", 55.0, 1),
        ],
        now,
    )
    .await
    .unwrap();

    let latest = db.latest_per_source("domates").await.unwrap();
    assert_eq!(latest.len(), 2);
    assert_eq!(latest[0].source_id, "hal");
    assert_eq!(latest[1].price, 30.0);

    let history = db.observation_history("domates", 2).await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history[0].observed_at >= history[1].observed_at);

    let by_product = db.last_observed_by_product("hal").await.unwrap();
    assert_eq!(by_product.len(), 2);
    assert_eq!(by_product[0].0, "biber");
    assert!(db.newest_observed_at("tzob").await.unwrap().is_some());
    assert!(db.newest_observed_at("camgoz").await.unwrap().is_none());
}

#[tokio::test]
async fn test_monthly_averages_group_by_category() {
    let (db, _container) = seeded_db().await;
    let march = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap();
    let mut rows = vec![
        observation("domates", "tzob", 20.0, 0),
        observation("patates", "tzob", 10.0, 0),
        observation("limon", "tzob", 40.0, 0),
    ];
    for row in &mut rows {
        row.observed_at = march;
    }
    db.insert_observations(&rows, march).await.unwrap();

    let averages = db
        .monthly_averages(march - TimeDelta::days(365))
        .await
        .unwrap();
    assert_eq!(averages.len(), 2);
    let sebze = averages.iter().find(|a| a.category == "sebze").unwrap();
    assert_eq!(sebze.month, 3);
    assert_eq!(sebze.samples, 2);
    assert!((sebze.average - 15.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_replace_keeps_one_current_version() {
    let (db, _container) = setup_test_db().await;

    let first = active("domates", 30.0);
    db.replace_current_price(&first).await.unwrap();
    let mut second = active("domates", 32.0);
    second.basis = PriceBasis::AiEstimate;
    db.replace_current_price(&second).await.unwrap();

    let current = db.current_price("domates").await.unwrap().unwrap();
    assert_eq!(current.id, second.id);
    assert_eq!(current.basis, PriceBasis::AiEstimate);

    let history = db.price_history("domates", 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second.id);
    assert!(history[0].is_current);
    assert!(!history[1].is_current);
    assert_eq!(db.current_prices().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_manual_seasonal_and_trust_round_trip() {
    let (db, _container) = setup_test_db().await;
    let now = Utc::now();

    for (price, offset) in [(20.0, 2), (22.0, 1)] {
        db.save_manual_entry(&ManualPriceEntry {
            product_key: "limon".into(),
            price,
            unit: "kg".into(),
            entered_by: "admin".into(),
            entered_at: now - TimeDelta::hours(offset),
        })
        .await
        .unwrap();
    }
    assert_eq!(db.manual_entry("limon").await.unwrap().unwrap().price, 22.0);
    assert!(db.manual_entry("domates").await.unwrap().is_none());

    let coefficient = |factor| SeasonalCoefficient {
        category: "sebze".into(),
        month: 7,
        factor,
        updated_at: now,
    };
    db.save_seasonal_coefficients(&[coefficient(0.8)]).await.unwrap();
    db.save_seasonal_coefficients(&[coefficient(0.85)]).await.unwrap();
    assert_eq!(db.seasonal_factor("sebze", 7).await.unwrap(), Some(0.85));
    assert_eq!(db.seasonal_factor("sebze", 8).await.unwrap(), None);

    db.save_trust_score(&SourceTrustScore {
        source_id: "hal".into(),
        score: 0.7,
        computed_at: now,
    })
    .await
    .unwrap();
    db.save_trust_score(&SourceTrustScore {
        source_id: "hal".into(),
        score: 0.9,
        computed_at: now,
    })
    .await
    .unwrap();
    let scores = db.trust_scores().await.unwrap();
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].score, 0.9);
}

#[tokio::test]
async fn test_breaker_snapshots_survive_reload() {
    let (db, _container) = setup_test_db().await;
    let config = EngineConfig::default().breaker;

    let mut breaker = CircuitBreaker::new(&config);
    breaker.state = CircuitState::Open;
    breaker.consecutive_failures = 5;
    breaker.open_until = Some(Utc::now() + TimeDelta::minutes(2));
    breaker.last_error = Some("503".into());
    db.save_breaker("hal", &breaker).await.unwrap();

    breaker.consecutive_failures = 6;
    db.save_breaker("hal", &breaker).await.unwrap();

    let loaded = db.load_breakers().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].0, "hal");
    assert_eq!(loaded[0].1.state, CircuitState::Open);
    assert_eq!(loaded[0].1.consecutive_failures, 6);
}

#[tokio::test]
async fn test_engine_runs_against_postgres() {
    let (db, _container) = seeded_db().await;
    let index = r#"[{"product": "Domates", "price": 30}]"#;
    let fetcher = MockFetcher::with_responses((0..4).map(|_| Ok(index.to_string())).collect());

    let mut config = EngineConfig::default();
    config.worker.concurrency = 1;
    config.worker.poll_interval = Duration::from_millis(20);
    config.scheduler.tick = Duration::from_millis(20);
    let engine = Engine::bootstrap(
        db.clone(),
        fetcher,
        MockSessionFactory::with_pages(vec![]),
        MockEstimator::none(),
        config,
    )
    .await
    .unwrap();

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    let watcher = db.clone();
    tokio::spawn(async move {
        for _ in 0..250 {
            if watcher.current_price("domates").await.ok().flatten().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        stopper.cancel();
    });

    tokio::time::timeout(Duration::from_secs(10), engine.run(cancel))
        .await
        .unwrap()
        .unwrap();

    let price = db.current_price("domates").await.unwrap().unwrap();
    assert_eq!(price.price, 30.0);
    assert_eq!(price.basis, PriceBasis::Source("tzob".into()));
}
