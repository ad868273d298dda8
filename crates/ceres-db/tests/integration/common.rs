use std::time::Duration;

use ceres_db::Database;
use sqlx::postgres::PgPoolOptions;
use testcontainers::core::{ContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};

/// Spins up a PostgreSQL container and returns a migrated database.
///
/// The `ContainerAsync` must be kept in scope for the test duration;
/// dropping it stops the container.
pub async fn setup_test_db() -> (Database, ContainerAsync<GenericImage>) {
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

    let connection_string = format!("postgresql://postgres:postgres@{host}:{port}/ceres_test");

    // The server restarts once after init, so the first attempts can fail.
    const MAX_RETRIES: u32 = 30;
    let mut retries = 0;
    let pool = loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await
        {
            Ok(pool) => break pool,
            Err(e) => {
                retries += 1;
                if retries >= MAX_RETRIES {
                    panic!("Failed to connect to database after {MAX_RETRIES} retries: {e}");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    };

    let db = Database::from_pool(pool);
    db.migrate().await.expect("Failed to run migrations");
    (db, container)
}

/// A database holding the sample sources and products.
pub async fn seeded_db() -> (Database, ContainerAsync<GenericImage>) {
    use ceres_core::models::SourceKind;
    use ceres_core::testutil::{sample_catalog, sample_source};
    use ceres_core::traits::CatalogStore;

    let (db, container) = setup_test_db().await;
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
    (db, container)
}
