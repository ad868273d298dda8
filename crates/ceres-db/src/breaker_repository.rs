use sqlx::types::Json;

use ceres_core::circuit_breaker::CircuitBreaker;
use ceres_core::error::AppError;
use ceres_core::traits::BreakerStore;

use crate::database::{Database, db_err};

impl BreakerStore for Database {
    async fn load_breakers(&self) -> Result<Vec<(String, CircuitBreaker)>, AppError> {
        let rows: Vec<(String, Json<CircuitBreaker>)> =
            sqlx::query_as("SELECT source_id, snapshot FROM circuit_breakers ORDER BY source_id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|(source_id, snapshot)| (source_id, snapshot.0))
            .collect())
    }

    async fn save_breaker(&self, source_id: &str, breaker: &CircuitBreaker) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breakers (source_id, snapshot, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (source_id) DO UPDATE SET
                snapshot = EXCLUDED.snapshot,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(source_id)
        .bind(Json(breaker))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}
