use ceres_core::error::AppError;
use ceres_core::models::{Product, Source};
use ceres_core::traits::CatalogStore;

use crate::database::{Database, db_err, decode_err};

#[derive(sqlx::FromRow)]
struct SourceRow {
    id: String,
    name: String,
    kind: String,
    url: String,
    polling_interval_secs: i64,
    freshness_window_secs: i64,
    enabled: bool,
}

impl TryFrom<SourceRow> for Source {
    type Error = AppError;

    fn try_from(row: SourceRow) -> Result<Self, AppError> {
        Ok(Source {
            id: row.id,
            name: row.name,
            kind: row.kind.parse().map_err(|e| decode_err("kind", e))?,
            url: row.url,
            polling_interval_secs: row.polling_interval_secs,
            freshness_window_secs: row.freshness_window_secs,
            enabled: row.enabled,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    key: String,
    name: String,
    category: String,
    unit: String,
    search_term: Option<String>,
    aliases: Vec<String>,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            key: row.key,
            name: row.name,
            category: row.category,
            unit: row.unit,
            search_term: row.search_term,
            aliases: row.aliases,
        }
    }
}

impl CatalogStore for Database {
    async fn list_sources(&self) -> Result<Vec<Source>, AppError> {
        let rows = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        rows.into_iter().map(Source::try_from).collect()
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>, AppError> {
        let row = sqlx::query_as::<_, SourceRow>("SELECT * FROM sources WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(Source::try_from).transpose()
    }

    async fn upsert_source(&self, source: &Source) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO sources (id, name, kind, url, polling_interval_secs, freshness_window_secs, enabled)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                kind = EXCLUDED.kind,
                url = EXCLUDED.url,
                polling_interval_secs = EXCLUDED.polling_interval_secs,
                freshness_window_secs = EXCLUDED.freshness_window_secs,
                enabled = EXCLUDED.enabled
            "#,
        )
        .bind(&source.id)
        .bind(&source.name)
        .bind(source.kind.as_str())
        .bind(&source.url)
        .bind(source.polling_interval_secs)
        .bind(source.freshness_window_secs)
        .bind(source.enabled)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }

    async fn set_source_enabled(&self, id: &str, enabled: bool) -> Result<bool, AppError> {
        let result = sqlx::query("UPDATE sources SET enabled = $2 WHERE id = $1")
            .bind(id)
            .bind(enabled)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_products(&self) -> Result<Vec<Product>, AppError> {
        let rows = sqlx::query_as::<_, ProductRow>("SELECT * FROM products ORDER BY key")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(Product::from).collect())
    }

    async fn get_product(&self, key: &str) -> Result<Option<Product>, AppError> {
        let row = sqlx::query_as::<_, ProductRow>("SELECT * FROM products WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(Product::from))
    }

    async fn upsert_product(&self, product: &Product) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO products (key, name, category, unit, search_term, aliases)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (key) DO UPDATE SET
                name = EXCLUDED.name,
                category = EXCLUDED.category,
                unit = EXCLUDED.unit,
                search_term = EXCLUDED.search_term,
                aliases = EXCLUDED.aliases
            "#,
        )
        .bind(&product.key)
        .bind(&product.name)
        .bind(&product.category)
        .bind(&product.unit)
        .bind(&product.search_term)
        .bind(&product.aliases)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}
