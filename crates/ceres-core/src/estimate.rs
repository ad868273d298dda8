//! Fallback price estimators.

use chrono::TimeDelta;

use crate::error::AppError;
use crate::models::round_to;
use crate::traits::{EstimateRequest, PriceEstimate, PriceEstimator};

/// Estimates from the product's own history, falling back to the median of
/// comparable products.
///
/// With enough recent points the price is a least-squares projection to
/// `now`, kept within half and one-and-a-half times the observed range.
#[derive(Debug, Clone)]
pub struct TrendEstimator {
    pub window: TimeDelta,
    pub min_points: usize,
}

impl Default for TrendEstimator {
    fn default() -> Self {
        Self {
            window: TimeDelta::days(90),
            min_points: 3,
        }
    }
}

impl TrendEstimator {
    fn trend_estimate(&self, request: &EstimateRequest) -> Option<PriceEstimate> {
        let newest = request.history.first()?;
        let unit = newest.unit.clone();
        let points: Vec<(f64, f64)> = request
            .history
            .iter()
            .filter(|o| o.unit == unit && request.now - o.observed_at <= self.window)
            .map(|o| {
                let days = (o.observed_at - request.now).num_seconds() as f64 / 86_400.0;
                (days, o.price)
            })
            .collect();

        if points.len() < self.min_points {
            return Some(PriceEstimate {
                price: newest.price,
                unit,
                rationale: format!(
                    "last observed price from {} ({})",
                    newest.source_id,
                    newest.observed_at.format("%Y-%m-%d")
                ),
            });
        }

        let (slope, intercept) = least_squares(&points)?;
        let low = points.iter().map(|p| p.1).fold(f64::INFINITY, f64::min);
        let high = points.iter().map(|p| p.1).fold(f64::NEG_INFINITY, f64::max);
        // x = 0 is `now`.
        let projected = intercept.clamp(low * 0.5, high * 1.5);
        Some(PriceEstimate {
            price: round_to(projected, 2),
            unit,
            rationale: format!(
                "linear trend over {} observations ({:+.3}/day)",
                points.len(),
                slope
            ),
        })
    }

    fn comparable_estimate(&self, request: &EstimateRequest) -> Option<PriceEstimate> {
        let mut prices: Vec<f64> = request
            .comparables
            .iter()
            .filter(|(_, price)| price.unit == request.product.unit)
            .map(|(_, price)| price.price)
            .collect();
        if prices.is_empty() {
            return None;
        }
        prices.sort_by(f64::total_cmp);
        let mid = prices.len() / 2;
        let median = if prices.len() % 2 == 0 {
            (prices[mid - 1] + prices[mid]) / 2.0
        } else {
            prices[mid]
        };
        Some(PriceEstimate {
            price: round_to(median, 2),
            unit: request.product.unit.clone(),
            rationale: format!(
                "median of {} comparable {} products",
                prices.len(),
                request.product.category
            ),
        })
    }
}

impl PriceEstimator for TrendEstimator {
    async fn estimate(&self, request: &EstimateRequest) -> Result<Option<PriceEstimate>, AppError> {
        Ok(self
            .trend_estimate(request)
            .or_else(|| self.comparable_estimate(request)))
    }
}

/// Returns (slope, intercept), or `None` when all x values coincide.
fn least_squares(points: &[(f64, f64)]) -> Option<(f64, f64)> {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let sxx: f64 = points.iter().map(|p| (p.0 - mean_x).powi(2)).sum();
    if sxx.abs() < f64::EPSILON {
        return Some((0.0, mean_y));
    }
    let sxy: f64 = points
        .iter()
        .map(|p| (p.0 - mean_x) * (p.1 - mean_y))
        .sum();
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    (slope.is_finite() && intercept.is_finite()).then_some((slope, intercept))
}

/// Tries `primary`, then `fallback` when the primary has nothing or fails.
#[derive(Debug, Clone)]
pub struct ChainedEstimator<A, B> {
    pub primary: A,
    pub fallback: B,
}

impl<A, B> ChainedEstimator<A, B> {
    pub fn new(primary: A, fallback: B) -> Self {
        Self { primary, fallback }
    }
}

impl<A, B> PriceEstimator for ChainedEstimator<A, B>
where
    A: PriceEstimator,
    B: PriceEstimator,
{
    async fn estimate(&self, request: &EstimateRequest) -> Result<Option<PriceEstimate>, AppError> {
        match self.primary.estimate(request).await {
            Ok(Some(estimate)) => return Ok(Some(estimate)),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(product = %request.product.key, error = %e, "Primary estimator failed");
            }
        }
        self.fallback.estimate(request).await
    }
}

/// An absent estimator never produces a price.
impl<E: PriceEstimator> PriceEstimator for Option<E> {
    async fn estimate(&self, request: &EstimateRequest) -> Result<Option<PriceEstimate>, AppError> {
        match self {
            Some(inner) => inner.estimate(request).await,
            None => Ok(None),
        }
    }
}
