//! Loading sources and products from a JSON catalog file.
//!
//! ```json
//! {
//!   "sources": [
//!     { "id": "tzob", "name": "TZOB", "kind": "reference-index", "url": "https://..." }
//!   ],
//!   "products": [
//!     { "key": "domates", "name": "Domates", "category": "sebze", "unit": "kg" }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::AppError;
use crate::models::{Product, Source, SourceKind};
use crate::traits::CatalogStore;

const DEFAULT_POLLING_SECS: i64 = 3600;
const DEFAULT_FRESHNESS_SECS: i64 = 2 * 86_400;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_polling")]
    pub polling_interval_secs: i64,
    #[serde(default = "default_freshness")]
    pub freshness_window_secs: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_polling() -> i64 {
    DEFAULT_POLLING_SECS
}

fn default_freshness() -> i64 {
    DEFAULT_FRESHNESS_SECS
}

fn default_enabled() -> bool {
    true
}

impl From<SourceEntry> for Source {
    fn from(entry: SourceEntry) -> Self {
        Source {
            id: entry.id,
            name: entry.name,
            kind: entry.kind,
            url: entry.url,
            polling_interval_secs: entry.polling_interval_secs,
            freshness_window_secs: entry.freshness_window_secs,
            enabled: entry.enabled,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub products: Vec<Product>,
}

/// Counts written by [`CatalogFile::seed`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub sources: usize,
    pub products: usize,
}

fn is_slug(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl CatalogFile {
    pub fn parse(json: &str) -> Result<Self, AppError> {
        let catalog: CatalogFile = serde_json::from_str(json)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    /// Rejects duplicate or malformed ids, bad intervals and market search
    /// templates without a `{term}` placeholder.
    pub fn validate(&self) -> Result<(), AppError> {
        let mut ids = HashSet::new();
        for source in &self.sources {
            if !is_slug(&source.id) {
                return Err(AppError::InvalidInput(format!(
                    "source id '{}' is not a slug",
                    source.id
                )));
            }
            if !ids.insert(source.id.as_str()) {
                return Err(AppError::InvalidInput(format!(
                    "duplicate source '{}'",
                    source.id
                )));
            }
            url::Url::parse(&source.url.replace("{term}", "x")).map_err(|e| {
                AppError::InvalidInput(format!("source '{}' has a bad url: {e}", source.id))
            })?;
            if source.kind == SourceKind::MarketSearch && !source.url.contains("{term}") {
                return Err(AppError::InvalidInput(format!(
                    "market search source '{}' needs a {{term}} placeholder",
                    source.id
                )));
            }
            if source.polling_interval_secs <= 0 || source.freshness_window_secs <= 0 {
                return Err(AppError::InvalidInput(format!(
                    "source '{}' needs positive intervals",
                    source.id
                )));
            }
        }

        let mut keys = HashSet::new();
        for product in &self.products {
            if !is_slug(&product.key) {
                return Err(AppError::InvalidInput(format!(
                    "product key '{}' is not a slug",
                    product.key
                )));
            }
            if !keys.insert(product.key.as_str()) {
                return Err(AppError::InvalidInput(format!(
                    "duplicate product '{}'",
                    product.key
                )));
            }
            if product.name.trim().is_empty() || product.unit.trim().is_empty() {
                return Err(AppError::InvalidInput(format!(
                    "product '{}' needs a name and a unit",
                    product.key
                )));
            }
        }
        Ok(())
    }

    /// Upserts every entry. Existing rows are overwritten.
    pub async fn seed<S: CatalogStore>(&self, store: &S) -> Result<SeedReport, AppError> {
        for entry in &self.sources {
            store.upsert_source(&Source::from(entry.clone())).await?;
        }
        for product in &self.products {
            store.upsert_product(product).await?;
        }
        tracing::info!(
            sources = self.sources.len(),
            products = self.products.len(),
            "Catalog seeded"
        );
        Ok(SeedReport {
            sources: self.sources.len(),
            products: self.products.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::io::Write;

    const CATALOG: &str = r#"{
        "sources": [
            { "id": "tzob", "name": "TZOB", "kind": "reference-index", "url": "https://tzob.example.com/fiyat" },
            { "id": "camgoz", "name": "Camgöz", "kind": "market-search",
              "url": "https://camgoz.example.com/ara?q={term}", "polling_interval_secs": 21600, "enabled": false }
        ],
        "products": [
            { "key": "domates", "name": "Domates", "category": "sebze", "unit": "kg" },
            { "key": "sut", "name": "Süt", "category": "sut-urunleri", "unit": "lt",
              "search_term": "sut 1 lt", "aliases": ["günlük süt"] }
        ]
    }"#;

    #[test]
    fn test_applies_source_defaults() {
        let catalog = CatalogFile::parse(CATALOG).unwrap();
        let tzob = &catalog.sources[0];
        assert_eq!(tzob.polling_interval_secs, DEFAULT_POLLING_SECS);
        assert_eq!(tzob.freshness_window_secs, DEFAULT_FRESHNESS_SECS);
        assert!(tzob.enabled);
        assert!(!catalog.sources[1].enabled);
        assert_eq!(catalog.products[1].search_term(), "sut 1 lt");
    }

    #[test]
    fn test_rejects_search_template_without_placeholder() {
        let json = r#"{"sources": [
            { "id": "m", "name": "M", "kind": "market-search", "url": "https://m.example.com/ara" }
        ]}"#;
        let err = CatalogFile::parse(json).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[test]
    fn test_rejects_duplicates() {
        let json = r#"{"products": [
            { "key": "a", "name": "A", "category": "x", "unit": "kg" },
            { "key": "a", "name": "A2", "category": "x", "unit": "kg" }
        ]}"#;
        assert!(CatalogFile::parse(json).is_err());
    }

    #[tokio::test]
    async fn test_loads_file_and_seeds_store() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CATALOG.as_bytes()).unwrap();

        let catalog = CatalogFile::load(file.path()).unwrap();
        let store = MemoryStore::new();
        let report = catalog.seed(&store).await.unwrap();
        assert_eq!(
            report,
            SeedReport {
                sources: 2,
                products: 2
            }
        );

        let camgoz = store.get_source("camgoz").await.unwrap().unwrap();
        assert_eq!(camgoz.polling_interval_secs, 21600);
        assert!(store.get_product("sut").await.unwrap().is_some());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = CatalogFile::load(Path::new("/nonexistent/catalog.json")).unwrap_err();
        assert_eq!(err.code(), "config_error");
    }
}
