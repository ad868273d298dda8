//! Active price resolution.
//!
//! Resolution order for one product:
//!
//! 1. a manual entry younger than `manual_staleness`;
//! 2. the best fresh observation from an eligible source;
//! 3. an estimate from the configured [`PriceEstimator`].
//!
//! The chosen base price is then multiplied by the seasonal coefficient for
//! the product's category and the current month.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use moka::future::Cache;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    ActivePrice, ManualPriceEntry, PARTIAL_MATCH_FACTOR, PriceBasis, PriceObservation, Product,
    SeasonalCoefficient, Source, round_to,
};
use crate::seasonal::{self, SeasonalConfig};
use crate::traits::{EstimateRequest, PriceEstimate, PriceEstimator, Storage};

#[derive(Debug, Clone)]
pub struct PricingConfig {
    /// Manual entries older than this no longer win.
    pub manual_staleness: TimeDelta,
    /// Sources below this trust are ignored.
    pub min_trust: f64,
    /// Confidence attached to estimated prices.
    pub ai_confidence: f64,
    /// Observation or estimate basis older than this is flagged stale.
    pub stale_after: TimeDelta,
    /// Observations handed to the estimator.
    pub history_limit: usize,
    /// How long a seasonal coefficient lookup is cached.
    pub seasonal_cache_ttl: Duration,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            manual_staleness: TimeDelta::days(90),
            min_trust: 0.3,
            ai_confidence: 0.15,
            stale_after: TimeDelta::days(3),
            history_limit: 60,
            seasonal_cache_ttl: Duration::from_secs(3600),
        }
    }
}

impl PricingConfig {
    /// The weakest real observation has confidence `min_trust * 0.7`; an
    /// estimate must stay strictly below it.
    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.0..=1.0).contains(&self.min_trust) {
            return Err(AppError::ConfigError(format!(
                "min_trust must be within [0, 1], got {}",
                self.min_trust
            )));
        }
        let ceiling = self.min_trust * PARTIAL_MATCH_FACTOR;
        if !(self.ai_confidence >= 0.0 && self.ai_confidence < ceiling) {
            return Err(AppError::ConfigError(format!(
                "ai_confidence must be in [0, {ceiling}), got {}",
                self.ai_confidence
            )));
        }
        if self.manual_staleness <= TimeDelta::zero() || self.stale_after <= TimeDelta::zero() {
            return Err(AppError::ConfigError(
                "staleness thresholds must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A resolved price before the seasonal adjustment.
#[derive(Debug, Clone, PartialEq)]
pub struct BasePrice {
    pub price: f64,
    pub unit: String,
    pub basis: PriceBasis,
    pub confidence: f64,
    pub stale: bool,
}

/// Step 1: a manual entry, if it is still recent enough.
pub fn manual_base(
    entry: &ManualPriceEntry,
    config: &PricingConfig,
    now: DateTime<Utc>,
) -> Option<BasePrice> {
    (now - entry.entered_at <= config.manual_staleness).then(|| BasePrice {
        price: entry.price,
        unit: entry.unit.clone(),
        basis: PriceBasis::Manual,
        confidence: 1.0,
        stale: false,
    })
}

/// Step 2: the best observation among eligible sources.
///
/// A source is eligible when it is enabled, trusted at least `min_trust`,
/// and its observation is within the source's freshness window. Ranking is
/// trust, then source kind priority, then match quality, then recency, then
/// source id.
pub fn best_observation<'a>(
    observations: &'a [PriceObservation],
    sources: &HashMap<String, Source>,
    trust: &HashMap<String, f64>,
    config: &PricingConfig,
    now: DateTime<Utc>,
) -> Option<(&'a PriceObservation, &'a str, f64)> {
    let mut candidates: Vec<(&PriceObservation, &Source, f64)> = observations
        .iter()
        .filter_map(|obs| {
            let source = sources.get(&obs.source_id)?;
            let score = trust.get(&obs.source_id).copied().unwrap_or(0.0);
            let eligible = source.enabled
                && score >= config.min_trust
                && now - obs.observed_at <= source.freshness_window();
            eligible.then_some((obs, source, score))
        })
        .collect();

    candidates.sort_by(|(a, sa, ta), (b, sb, tb)| {
        tb.total_cmp(ta)
            .then_with(|| sa.kind.priority().cmp(&sb.kind.priority()))
            .then_with(|| b.quality.cmp(&a.quality))
            .then_with(|| b.observed_at.cmp(&a.observed_at))
            .then_with(|| a.source_id.cmp(&b.source_id))
    });

    candidates
        .into_iter()
        .next()
        .map(|(obs, _, score)| (obs, obs.source_id.as_str(), score))
}

pub fn observation_base(
    observation: &PriceObservation,
    trust: f64,
    config: &PricingConfig,
    now: DateTime<Utc>,
) -> BasePrice {
    BasePrice {
        price: observation.price,
        unit: observation.unit.clone(),
        basis: PriceBasis::Source(observation.source_id.clone()),
        confidence: round_to(trust * observation.quality.factor(), 4),
        stale: now - observation.observed_at > config.stale_after,
    }
}

/// Step 3: an estimate. Without any history behind it, it is always stale.
pub fn estimate_base(
    estimate: PriceEstimate,
    history: &[PriceObservation],
    config: &PricingConfig,
    now: DateTime<Utc>,
) -> BasePrice {
    let newest = history.iter().map(|o| o.observed_at).max();
    BasePrice {
        price: estimate.price,
        unit: estimate.unit,
        basis: PriceBasis::AiEstimate,
        confidence: config.ai_confidence,
        stale: newest.is_none_or(|at| now - at > config.stale_after),
    }
}

/// Applies the seasonal factor and stamps a new current version.
pub fn finalize(
    product_key: &str,
    base: BasePrice,
    seasonal_factor: f64,
    now: DateTime<Utc>,
) -> ActivePrice {
    ActivePrice {
        id: Uuid::new_v4(),
        product_key: product_key.to_string(),
        price: round_to(base.price * seasonal_factor, 2),
        unit: base.unit,
        basis: base.basis,
        confidence: base.confidence,
        base_price: base.price,
        seasonal_factor,
        stale: base.stale,
        computed_at: now,
        is_current: true,
    }
}

/// Result of computing one product's price.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceUpdate {
    pub price: ActivePrice,
    /// False when the resolution matched the current version and nothing
    /// was written.
    pub changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecomputeReport {
    pub updated: Vec<String>,
    pub unchanged: usize,
    /// Products with no manual entry, observation, or estimate.
    pub missing: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Computes and persists active prices.
#[derive(Clone)]
pub struct PriceEngine<S, E>
where
    S: Storage,
    E: PriceEstimator,
{
    store: S,
    estimator: E,
    config: PricingConfig,
    seasonal: SeasonalConfig,
    seasonal_cache: Cache<(String, u32), f64>,
}

impl<S, E> PriceEngine<S, E>
where
    S: Storage,
    E: PriceEstimator,
{
    pub fn new(
        store: S,
        estimator: E,
        config: PricingConfig,
        seasonal: SeasonalConfig,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let seasonal_cache = Cache::builder()
            .max_capacity(1024)
            .time_to_live(config.seasonal_cache_ttl)
            .build();
        Ok(Self {
            store,
            estimator,
            config,
            seasonal,
            seasonal_cache,
        })
    }

    pub fn config(&self) -> &PricingConfig {
        &self.config
    }

    /// Resolves a product's price and makes it current.
    ///
    /// Returns `NoEligiblePrice` when nothing could price the product. A
    /// current version still flagged fresh is then superseded by a stale copy.
    pub async fn compute_active_price(
        &self,
        product_key: &str,
        now: DateTime<Utc>,
    ) -> Result<PriceUpdate, AppError> {
        let product = self
            .store
            .get_product(product_key)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("product '{product_key}'")))?;

        let base = match self.resolve_base(&product, now).await {
            Ok(base) => base,
            Err(AppError::NoEligiblePrice(key)) => {
                self.expire_current(&key, now).await?;
                return Err(AppError::NoEligiblePrice(key));
            }
            Err(e) => return Err(e),
        };
        let factor = self.seasonal_factor(&product.category, now.month()).await?;
        let candidate = finalize(&product.key, base, factor, now);

        if let Some(current) = self.store.current_price(&product.key).await? {
            if current.same_resolution(&candidate) {
                return Ok(PriceUpdate {
                    price: current,
                    changed: false,
                });
            }
        }

        self.store.replace_current_price(&candidate).await?;
        tracing::info!(
            product = %candidate.product_key,
            price = candidate.price,
            basis = %candidate.basis,
            confidence = candidate.confidence,
            stale = candidate.stale,
            "Active price updated"
        );
        Ok(PriceUpdate {
            price: candidate,
            changed: true,
        })
    }

    async fn expire_current(&self, product_key: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        let Some(current) = self.store.current_price(product_key).await? else {
            return Ok(());
        };
        if current.stale {
            return Ok(());
        }
        let expired = ActivePrice {
            id: Uuid::new_v4(),
            stale: true,
            computed_at: now,
            ..current
        };
        self.store.replace_current_price(&expired).await?;
        tracing::warn!(
            product = %product_key,
            basis = %expired.basis,
            "No eligible basis left; active price marked stale"
        );
        Ok(())
    }

    async fn resolve_base(
        &self,
        product: &Product,
        now: DateTime<Utc>,
    ) -> Result<BasePrice, AppError> {
        if let Some(entry) = self.store.manual_entry(&product.key).await? {
            if let Some(base) = manual_base(&entry, &self.config, now) {
                return Ok(base);
            }
            tracing::debug!(product = %product.key, "Manual entry is stale");
        }

        let observations = self.store.latest_per_source(&product.key).await?;
        if !observations.is_empty() {
            let sources: HashMap<String, Source> = self
                .store
                .list_sources()
                .await?
                .into_iter()
                .map(|s| (s.id.clone(), s))
                .collect();
            let trust: HashMap<String, f64> = self
                .store
                .trust_scores()
                .await?
                .into_iter()
                .map(|t| (t.source_id, t.score))
                .collect();
            if let Some((obs, _, score)) =
                best_observation(&observations, &sources, &trust, &self.config, now)
            {
                return Ok(observation_base(obs, score, &self.config, now));
            }
        }

        let history = self
            .store
            .observation_history(&product.key, self.config.history_limit)
            .await?;
        let comparables = self.comparables(product).await?;
        let request = EstimateRequest {
            product: product.clone(),
            history,
            comparables,
            now,
        };
        match self.estimator.estimate(&request).await? {
            Some(estimate) if estimate.price > 0.0 && estimate.price.is_finite() => {
                Ok(estimate_base(estimate, &request.history, &self.config, now))
            }
            _ => Err(AppError::NoEligiblePrice(product.key.clone())),
        }
    }

    /// Current prices of other products in the same category.
    async fn comparables(&self, product: &Product) -> Result<Vec<(Product, ActivePrice)>, AppError> {
        let peers: HashMap<String, Product> = self
            .store
            .list_products()
            .await?
            .into_iter()
            .filter(|p| p.category == product.category && p.key != product.key)
            .map(|p| (p.key.clone(), p))
            .collect();
        if peers.is_empty() {
            return Ok(vec![]);
        }
        let mut out = Vec::new();
        for price in self.store.current_prices().await? {
            if let Some(peer) = peers.get(&price.product_key) {
                out.push((peer.clone(), price));
            }
        }
        Ok(out)
    }

    async fn seasonal_factor(&self, category: &str, month: u32) -> Result<f64, AppError> {
        let key = (category.to_string(), month);
        if let Some(factor) = self.seasonal_cache.get(&key).await {
            return Ok(factor);
        }
        let factor = self
            .store
            .seasonal_factor(category, month)
            .await?
            .filter(|f| f.is_finite() && *f > 0.0)
            .unwrap_or(1.0);
        self.seasonal_cache.insert(key, factor).await;
        Ok(factor)
    }

    /// Recomputes the given products, collecting outcomes instead of failing
    /// fast.
    pub async fn recompute_products(&self, keys: &[String], now: DateTime<Utc>) -> RecomputeReport {
        let mut report = RecomputeReport::default();
        for key in keys {
            match self.compute_active_price(key, now).await {
                Ok(update) if update.changed => report.updated.push(key.clone()),
                Ok(_) => report.unchanged += 1,
                Err(AppError::NoEligiblePrice(_)) => {
                    tracing::warn!(product = %key, "No eligible price");
                    report.missing.push(key.clone());
                }
                Err(e) => {
                    tracing::error!(product = %key, error = %e, "Price computation failed");
                    report.failed.push((key.clone(), e.to_string()));
                }
            }
        }
        report
    }

    pub async fn recompute_all(&self, now: DateTime<Utc>) -> Result<RecomputeReport, AppError> {
        let keys: Vec<String> = self
            .store
            .list_products()
            .await?
            .into_iter()
            .map(|p| p.key)
            .collect();
        let report = self.recompute_products(&keys, now).await;
        tracing::info!(
            updated = report.updated.len(),
            unchanged = report.unchanged,
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Price recompute finished"
        );
        Ok(report)
    }

    /// Records a manual entry and recomputes the product.
    pub async fn set_manual_price(
        &self,
        entry: ManualPriceEntry,
        now: DateTime<Utc>,
    ) -> Result<PriceUpdate, AppError> {
        if !(entry.price.is_finite() && entry.price > 0.0) {
            return Err(AppError::InvalidInput(format!(
                "price must be positive, got {}",
                entry.price
            )));
        }
        if self.store.get_product(&entry.product_key).await?.is_none() {
            return Err(AppError::NotFound(format!("product '{}'", entry.product_key)));
        }
        self.store.save_manual_entry(&entry).await?;
        tracing::info!(product = %entry.product_key, by = %entry.entered_by, "Manual price entered");
        self.compute_active_price(&entry.product_key, now).await
    }

    /// Rebuilds the seasonal coefficients from observation history.
    pub async fn refresh_seasonal(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<SeasonalCoefficient>, AppError> {
        let coefficients = seasonal::refresh(&self.store, &self.seasonal, now).await?;
        self.seasonal_cache.invalidate_all();
        Ok(coefficients)
    }
}
