use chrono::{DateTime, Utc};
use uuid::Uuid;

use ceres_core::error::AppError;
use ceres_core::models::{
    ActivePrice, ManualPriceEntry, PriceBasis, SeasonalCoefficient, SourceTrustScore,
};
use ceres_core::traits::PriceStore;

use crate::database::{Database, db_err, decode_err};

#[derive(sqlx::FromRow)]
struct ActivePriceRow {
    id: Uuid,
    product_key: String,
    price: f64,
    unit: String,
    basis: String,
    confidence: f64,
    base_price: f64,
    seasonal_factor: f64,
    stale: bool,
    computed_at: DateTime<Utc>,
    is_current: bool,
}

impl TryFrom<ActivePriceRow> for ActivePrice {
    type Error = AppError;

    fn try_from(row: ActivePriceRow) -> Result<Self, AppError> {
        Ok(ActivePrice {
            id: row.id,
            product_key: row.product_key,
            price: row.price,
            unit: row.unit,
            basis: PriceBasis::from_db_string(&row.basis).map_err(|e| decode_err("basis", e))?,
            confidence: row.confidence,
            base_price: row.base_price,
            seasonal_factor: row.seasonal_factor,
            stale: row.stale,
            computed_at: row.computed_at,
            is_current: row.is_current,
        })
    }
}

fn into_prices(rows: Vec<ActivePriceRow>) -> Result<Vec<ActivePrice>, AppError> {
    rows.into_iter().map(ActivePrice::try_from).collect()
}

const PRICE_COLUMNS: &str = "id, product_key, price, unit, basis, confidence, base_price, \
                             seasonal_factor, stale, computed_at, is_current";

impl PriceStore for Database {
    async fn current_price(&self, product_key: &str) -> Result<Option<ActivePrice>, AppError> {
        let row = sqlx::query_as::<_, ActivePriceRow>(&format!(
            "SELECT {PRICE_COLUMNS} FROM active_prices WHERE product_key = $1 AND is_current"
        ))
        .bind(product_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(ActivePrice::try_from).transpose()
    }

    async fn current_prices(&self) -> Result<Vec<ActivePrice>, AppError> {
        let rows = sqlx::query_as::<_, ActivePriceRow>(&format!(
            "SELECT {PRICE_COLUMNS} FROM active_prices WHERE is_current ORDER BY product_key"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        into_prices(rows)
    }

    async fn price_history(
        &self,
        product_key: &str,
        limit: usize,
    ) -> Result<Vec<ActivePrice>, AppError> {
        let rows = sqlx::query_as::<_, ActivePriceRow>(&format!(
            "SELECT {PRICE_COLUMNS} FROM active_prices WHERE product_key = $1 \
             ORDER BY seq DESC LIMIT $2"
        ))
        .bind(product_key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        into_prices(rows)
    }

    async fn replace_current_price(&self, price: &ActivePrice) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "UPDATE active_prices SET is_current = FALSE WHERE product_key = $1 AND is_current",
        )
        .bind(&price.product_key)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO active_prices
                (id, product_key, price, unit, basis, confidence, base_price,
                 seasonal_factor, stale, computed_at, is_current)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, TRUE)
            "#,
        )
        .bind(price.id)
        .bind(&price.product_key)
        .bind(price.price)
        .bind(&price.unit)
        .bind(price.basis.to_db_string())
        .bind(price.confidence)
        .bind(price.base_price)
        .bind(price.seasonal_factor)
        .bind(price.stale)
        .bind(price.computed_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn manual_entry(&self, product_key: &str) -> Result<Option<ManualPriceEntry>, AppError> {
        let row: Option<(String, f64, String, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT product_key, price, unit, entered_by, entered_at
            FROM manual_prices
            WHERE product_key = $1
            ORDER BY entered_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(product_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(
            |(product_key, price, unit, entered_by, entered_at)| ManualPriceEntry {
                product_key,
                price,
                unit,
                entered_by,
                entered_at,
            },
        ))
    }

    async fn save_manual_entry(&self, entry: &ManualPriceEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO manual_prices (product_key, price, unit, entered_by, entered_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&entry.product_key)
        .bind(entry.price)
        .bind(&entry.unit)
        .bind(&entry.entered_by)
        .bind(entry.entered_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn seasonal_factor(&self, category: &str, month: u32) -> Result<Option<f64>, AppError> {
        let row: Option<(f64,)> = sqlx::query_as(
            "SELECT factor FROM seasonal_coefficients WHERE category = $1 AND month = $2",
        )
        .bind(category)
        .bind(month as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|(factor,)| factor))
    }

    async fn save_seasonal_coefficients(
        &self,
        coefficients: &[SeasonalCoefficient],
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for c in coefficients {
            sqlx::query(
                r#"
                INSERT INTO seasonal_coefficients (category, month, factor, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (category, month) DO UPDATE SET
                    factor = EXCLUDED.factor,
                    updated_at = EXCLUDED.updated_at
                "#,
            )
            .bind(&c.category)
            .bind(c.month as i32)
            .bind(c.factor)
            .bind(c.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn trust_scores(&self) -> Result<Vec<SourceTrustScore>, AppError> {
        let rows: Vec<(String, f64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT source_id, score, computed_at FROM source_trust_scores ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|(source_id, score, computed_at)| SourceTrustScore {
                source_id,
                score,
                computed_at,
            })
            .collect())
    }

    async fn save_trust_score(&self, score: &SourceTrustScore) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO source_trust_scores (source_id, score, computed_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (source_id) DO UPDATE SET
                score = EXCLUDED.score,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(&score.source_id)
        .bind(score.score)
        .bind(score.computed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}
