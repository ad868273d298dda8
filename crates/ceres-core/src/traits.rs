use std::future::Future;

use chrono::{DateTime, Utc};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::AppError;
use crate::job_queue::JobQueue;
use crate::models::{
    ActivePrice, ManualPriceEntry, NewObservation, PriceObservation, Product, SeasonalCoefficient,
    Source, SourceTrustScore,
};

/// Fetches raw documents for reference-index and wholesale sources.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<String, AppError>> + Send;

    /// Posts a url-encoded form (used for paginated listings).
    fn submit_form(
        &self,
        url: &str,
        form: &[(String, String)],
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// An open market-search session. Must be closed explicitly.
pub trait SearchSession: Send {
    /// Runs a search and returns the raw results page.
    fn search(&mut self, term: &str) -> impl Future<Output = Result<String, AppError>> + Send;

    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Opens market-search sessions for a source.
pub trait SessionFactory: Send + Sync + Clone {
    type Session: SearchSession;

    fn open(
        &self,
        source: &Source,
    ) -> impl Future<Output = Result<Self::Session, AppError>> + Send;
}

/// Inputs for a fallback price estimate.
#[derive(Debug, Clone)]
pub struct EstimateRequest {
    pub product: Product,
    /// Observations from any source and of any age, newest first.
    pub history: Vec<PriceObservation>,
    /// Current prices of products in the same category.
    pub comparables: Vec<(Product, ActivePrice)>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceEstimate {
    pub price: f64,
    pub unit: String,
    pub rationale: String,
}

/// Produces a price when no manual entry or fresh observation exists.
pub trait PriceEstimator: Send + Sync + Clone {
    /// Returns `Ok(None)` when there is nothing to base an estimate on.
    fn estimate(
        &self,
        request: &EstimateRequest,
    ) -> impl Future<Output = Result<Option<PriceEstimate>, AppError>> + Send;
}

/// Sources and products.
pub trait CatalogStore: Send + Sync + Clone {
    fn list_sources(&self) -> impl Future<Output = Result<Vec<Source>, AppError>> + Send;

    fn get_source(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<Source>, AppError>> + Send;

    fn upsert_source(&self, source: &Source) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Returns false when the source does not exist.
    fn set_source_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn list_products(&self) -> impl Future<Output = Result<Vec<Product>, AppError>> + Send;

    fn get_product(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<Option<Product>, AppError>> + Send;

    fn upsert_product(
        &self,
        product: &Product,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Average observed price for one category and month of year.
#[derive(Debug, Clone, PartialEq)]
pub struct MonthlyAverage {
    pub category: String,
    pub month: u32,
    pub average: f64,
    pub samples: u64,
}

/// Append-only observation history.
pub trait ObservationStore: Send + Sync + Clone {
    fn insert_observations(
        &self,
        observations: &[NewObservation],
        recorded_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<usize, AppError>> + Send;

    /// Newest observation from each source for a product.
    fn latest_per_source(
        &self,
        product_key: &str,
    ) -> impl Future<Output = Result<Vec<PriceObservation>, AppError>> + Send;

    /// Observations for a product, newest first.
    fn observation_history(
        &self,
        product_key: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<PriceObservation>, AppError>> + Send;

    fn newest_observed_at(
        &self,
        source_id: &str,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, AppError>> + Send;

    /// Newest observed-at per product for one source.
    fn last_observed_by_product(
        &self,
        source_id: &str,
    ) -> impl Future<Output = Result<Vec<(String, DateTime<Utc>)>, AppError>> + Send;

    /// Month-of-year averages per category for observations since `since`.
    fn monthly_averages(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<MonthlyAverage>, AppError>> + Send;
}

/// Active prices, manual entries, seasonal coefficients and trust scores.
pub trait PriceStore: Send + Sync + Clone {
    fn current_price(
        &self,
        product_key: &str,
    ) -> impl Future<Output = Result<Option<ActivePrice>, AppError>> + Send;

    fn current_prices(&self) -> impl Future<Output = Result<Vec<ActivePrice>, AppError>> + Send;

    /// Versions for a product, newest first, current included.
    fn price_history(
        &self,
        product_key: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ActivePrice>, AppError>> + Send;

    /// Atomically retire the current price and make `price` current.
    fn replace_current_price(
        &self,
        price: &ActivePrice,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// The most recent manual entry for a product.
    fn manual_entry(
        &self,
        product_key: &str,
    ) -> impl Future<Output = Result<Option<ManualPriceEntry>, AppError>> + Send;

    fn save_manual_entry(
        &self,
        entry: &ManualPriceEntry,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn seasonal_factor(
        &self,
        category: &str,
        month: u32,
    ) -> impl Future<Output = Result<Option<f64>, AppError>> + Send;

    fn save_seasonal_coefficients(
        &self,
        coefficients: &[SeasonalCoefficient],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn trust_scores(
        &self,
    ) -> impl Future<Output = Result<Vec<SourceTrustScore>, AppError>> + Send;

    fn save_trust_score(
        &self,
        score: &SourceTrustScore,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Persisted circuit breaker snapshots, so breaker state survives restarts.
pub trait BreakerStore: Send + Sync + Clone {
    fn load_breakers(
        &self,
    ) -> impl Future<Output = Result<Vec<(String, CircuitBreaker)>, AppError>> + Send;

    fn save_breaker(
        &self,
        source_id: &str,
        breaker: &CircuitBreaker,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Everything the engine persists, behind one bound.
pub trait Storage: JobQueue + CatalogStore + ObservationStore + PriceStore + BreakerStore {}

impl<T> Storage for T where T: JobQueue + CatalogStore + ObservationStore + PriceStore + BreakerStore
{}
