//! Per-source trust scores.
//!
//! A score blends the recent job success ratio with how fresh the source's
//! newest observation is. Scores never drop below the floor unless the
//! source is disabled.

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::job::{JobStatus, ScrapeJob};
use crate::models::{Source, SourceTrustScore, round_to};
use crate::traits::Storage;

#[derive(Debug, Clone)]
pub struct TrustConfig {
    /// Number of most recent counted jobs considered.
    pub window: usize,
    /// Freshness reaches zero at `polling_interval * horizon`.
    pub horizon: f64,
    pub success_weight: f64,
    pub floor: f64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            window: 20,
            horizon: 4.0,
            success_weight: 0.6,
            floor: 0.1,
        }
    }
}

/// Share of succeeded jobs, or 0.5 when nothing was counted.
pub fn success_ratio(outcomes: &[ScrapeJob]) -> f64 {
    let counted: Vec<_> = outcomes
        .iter()
        .filter(|j| matches!(j.status, JobStatus::Succeeded | JobStatus::Failed))
        .collect();
    if counted.is_empty() {
        return 0.5;
    }
    let succeeded = counted
        .iter()
        .filter(|j| j.status == JobStatus::Succeeded)
        .count();
    succeeded as f64 / counted.len() as f64
}

/// 1.0 while the newest observation is within one polling interval, then a
/// linear decay to 0.0 at `interval * horizon`.
pub fn freshness(
    source: &Source,
    newest: Option<DateTime<Utc>>,
    config: &TrustConfig,
    now: DateTime<Utc>,
) -> f64 {
    let Some(newest) = newest else {
        return 0.0;
    };
    let age = (now - newest).num_seconds().max(0) as f64;
    let interval = source.polling_interval_secs.max(1) as f64;
    let limit = interval * config.horizon.max(1.0);

    if age <= interval {
        1.0
    } else if age >= limit || limit <= interval {
        0.0
    } else {
        1.0 - (age - interval) / (limit - interval)
    }
}

pub fn score(
    source: &Source,
    outcomes: &[ScrapeJob],
    newest: Option<DateTime<Utc>>,
    config: &TrustConfig,
    now: DateTime<Utc>,
) -> f64 {
    if !source.enabled {
        return 0.0;
    }
    let w = config.success_weight.clamp(0.0, 1.0);
    let blended = w * success_ratio(outcomes) + (1.0 - w) * freshness(source, newest, config, now);
    round_to(config.floor + (1.0 - config.floor) * blended, 4)
}

/// Recomputes and persists trust scores.
#[derive(Clone)]
pub struct TrustScorer<S: Storage> {
    store: S,
    config: TrustConfig,
}

impl<S: Storage> TrustScorer<S> {
    pub fn new(store: S, config: TrustConfig) -> Self {
        Self { store, config }
    }

    pub async fn recompute(
        &self,
        source: &Source,
        now: DateTime<Utc>,
    ) -> Result<SourceTrustScore, AppError> {
        let outcomes = self
            .store
            .recent_outcomes(&source.id, self.config.window)
            .await?;
        let newest = self.store.newest_observed_at(&source.id).await?;

        let trust = SourceTrustScore {
            source_id: source.id.clone(),
            score: score(source, &outcomes, newest, &self.config, now),
            computed_at: now,
        };
        self.store.save_trust_score(&trust).await?;
        tracing::debug!(source = %source.id, score = trust.score, "Trust score updated");
        Ok(trust)
    }

    /// Periodic sweep; decays sources that stopped producing data without
    /// failing.
    pub async fn recompute_all(&self, now: DateTime<Utc>) -> Result<Vec<SourceTrustScore>, AppError> {
        let mut scores = Vec::new();
        for source in self.store.list_sources().await? {
            match self.recompute(&source, now).await {
                Ok(score) => scores.push(score),
                Err(e) => tracing::warn!(source = %source.id, error = %e, "Trust recompute failed"),
            }
        }
        Ok(scores)
    }
}
