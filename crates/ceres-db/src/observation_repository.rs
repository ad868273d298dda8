use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use uuid::Uuid;

use ceres_core::error::AppError;
use ceres_core::models::{NewObservation, PriceObservation};
use ceres_core::traits::{MonthlyAverage, ObservationStore};

use crate::database::{Database, db_err, decode_err};

#[derive(sqlx::FromRow)]
struct ObservationRow {
    id: Uuid,
    product_key: String,
    source_id: String,
    price: f64,
    unit: String,
    observed_at: DateTime<Utc>,
    recorded_at: DateTime<Utc>,
    quality: String,
}

impl TryFrom<ObservationRow> for PriceObservation {
    type Error = AppError;

    fn try_from(row: ObservationRow) -> Result<Self, AppError> {
        Ok(PriceObservation {
            id: row.id,
            product_key: row.product_key,
            source_id: row.source_id,
            price: row.price,
            unit: row.unit,
            observed_at: row.observed_at,
            recorded_at: row.recorded_at,
            quality: row.quality.parse().map_err(|e| decode_err("quality", e))?,
        })
    }
}

fn into_observations(rows: Vec<ObservationRow>) -> Result<Vec<PriceObservation>, AppError> {
    rows.into_iter().map(PriceObservation::try_from).collect()
}

/// Bulk insert through `UNNEST`, one round trip per batch. Shared with job
/// completion so observations land in the same transaction as the status.
pub(crate) async fn insert_observation_rows<'e, E: PgExecutor<'e>>(
    executor: E,
    observations: &[NewObservation],
    recorded_at: DateTime<Utc>,
) -> Result<usize, AppError> {
    if observations.is_empty() {
        return Ok(0);
    }

    let mut product_keys = Vec::with_capacity(observations.len());
    let mut source_ids = Vec::with_capacity(observations.len());
    let mut prices = Vec::with_capacity(observations.len());
    let mut units = Vec::with_capacity(observations.len());
    let mut observed = Vec::with_capacity(observations.len());
    let mut qualities = Vec::with_capacity(observations.len());
    for obs in observations {
        product_keys.push(obs.product_key.clone());
        source_ids.push(obs.source_id.clone());
        prices.push(obs.price);
        units.push(obs.unit.clone());
        observed.push(obs.observed_at);
        qualities.push(obs.quality.as_str().to_string());
    }

    let result = sqlx::query(
        r#"
        INSERT INTO price_observations
            (product_key, source_id, price, unit, observed_at, recorded_at, quality)
        SELECT p, s, pr, u, o, $7, q
        FROM UNNEST($1::text[], $2::text[], $3::float8[], $4::text[], $5::timestamptz[], $6::text[])
            AS t(p, s, pr, u, o, q)
        "#,
    )
    .bind(&product_keys)
    .bind(&source_ids)
    .bind(&prices)
    .bind(&units)
    .bind(&observed)
    .bind(&qualities)
    .bind(recorded_at)
    .execute(executor)
    .await
    .map_err(db_err)?;

    Ok(result.rows_affected() as usize)
}

impl ObservationStore for Database {
    async fn insert_observations(
        &self,
        observations: &[NewObservation],
        recorded_at: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        insert_observation_rows(&self.pool, observations, recorded_at).await
    }

    async fn latest_per_source(&self, product_key: &str) -> Result<Vec<PriceObservation>, AppError> {
        let rows = sqlx::query_as::<_, ObservationRow>(
            r#"
            SELECT DISTINCT ON (source_id) *
            FROM price_observations
            WHERE product_key = $1
            ORDER BY source_id, observed_at DESC, recorded_at DESC
            "#,
        )
        .bind(product_key)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        into_observations(rows)
    }

    async fn observation_history(
        &self,
        product_key: &str,
        limit: usize,
    ) -> Result<Vec<PriceObservation>, AppError> {
        let rows = sqlx::query_as::<_, ObservationRow>(
            r#"
            SELECT * FROM price_observations
            WHERE product_key = $1
            ORDER BY observed_at DESC, recorded_at DESC
            LIMIT $2
            "#,
        )
        .bind(product_key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        into_observations(rows)
    }

    async fn newest_observed_at(&self, source_id: &str) -> Result<Option<DateTime<Utc>>, AppError> {
        let (newest,): (Option<DateTime<Utc>>,) =
            sqlx::query_as("SELECT MAX(observed_at) FROM price_observations WHERE source_id = $1")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;

        Ok(newest)
    }

    async fn last_observed_by_product(
        &self,
        source_id: &str,
    ) -> Result<Vec<(String, DateTime<Utc>)>, AppError> {
        sqlx::query_as(
            r#"
            SELECT product_key, MAX(observed_at)
            FROM price_observations
            WHERE source_id = $1
            GROUP BY product_key
            ORDER BY product_key
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn monthly_averages(&self, since: DateTime<Utc>) -> Result<Vec<MonthlyAverage>, AppError> {
        let rows: Vec<(String, i32, f64, i64)> = sqlx::query_as(
            r#"
            SELECT p.category,
                   EXTRACT(MONTH FROM o.observed_at AT TIME ZONE 'UTC')::int4 AS month,
                   AVG(o.price)::float8,
                   COUNT(*)
            FROM price_observations o
            JOIN products p ON p.key = o.product_key
            WHERE o.observed_at >= $1
            GROUP BY p.category, month
            ORDER BY p.category, month
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|(category, month, average, samples)| MonthlyAverage {
                category,
                month: month as u32,
                average,
                samples: samples as u64,
            })
            .collect())
    }
}
