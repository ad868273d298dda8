use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AppError;
use crate::models::{SeasonalCoefficient, round_to};
use crate::traits::{MonthlyAverage, ObservationStore, PriceStore};

#[derive(Debug, Clone)]
pub struct SeasonalConfig {
    /// History considered when computing coefficients.
    pub lookback: TimeDelta,
    /// Categories with fewer distinct months of data are left unadjusted.
    pub min_months: usize,
}

impl Default for SeasonalConfig {
    fn default() -> Self {
        Self {
            lookback: TimeDelta::days(730),
            min_months: 6,
        }
    }
}

/// Month factors per category: the month's average over the mean of all
/// monthly averages, rounded to two decimals.
pub fn coefficients(
    averages: &[MonthlyAverage],
    config: &SeasonalConfig,
    now: DateTime<Utc>,
) -> Vec<SeasonalCoefficient> {
    let mut by_category: BTreeMap<&str, BTreeMap<u32, f64>> = BTreeMap::new();
    for avg in averages {
        if avg.samples == 0 || !(1..=12).contains(&avg.month) || avg.average <= 0.0 {
            continue;
        }
        by_category
            .entry(avg.category.as_str())
            .or_default()
            .insert(avg.month, avg.average);
    }

    let mut out = Vec::new();
    for (category, months) in by_category {
        if months.len() < config.min_months {
            tracing::debug!(category, months = months.len(), "Not enough history for seasonality");
            continue;
        }
        let overall = months.values().sum::<f64>() / months.len() as f64;
        for (month, average) in months {
            out.push(SeasonalCoefficient {
                category: category.to_string(),
                month,
                factor: round_to(average / overall, 2),
                updated_at: now,
            });
        }
    }
    out
}

/// Recomputes and stores coefficients from the observation history.
pub async fn refresh<S>(
    store: &S,
    config: &SeasonalConfig,
    now: DateTime<Utc>,
) -> Result<Vec<SeasonalCoefficient>, AppError>
where
    S: ObservationStore + PriceStore,
{
    let averages = store.monthly_averages(now - config.lookback).await?;
    let computed = coefficients(&averages, config, now);
    store.save_seasonal_coefficients(&computed).await?;
    tracing::info!(coefficients = computed.len(), "Seasonal coefficients refreshed");
    Ok(computed)
}
