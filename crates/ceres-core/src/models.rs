use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The kind of external origin a source represents.
///
/// Declaration order is the tie-break priority used by the price engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    ReferenceIndex,
    WholesaleListing,
    MarketSearch,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ReferenceIndex => "reference-index",
            SourceKind::WholesaleListing => "wholesale-listing",
            SourceKind::MarketSearch => "market-search",
        }
    }

    /// Lower value wins ties between equally trusted observations.
    pub fn priority(&self) -> u8 {
        match self {
            SourceKind::ReferenceIndex => 0,
            SourceKind::WholesaleListing => 1,
            SourceKind::MarketSearch => 2,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "reference-index" => Ok(SourceKind::ReferenceIndex),
            "wholesale-listing" => Ok(SourceKind::WholesaleListing),
            "market-search" => Ok(SourceKind::MarketSearch),
            _ => Err(format!("Unknown source kind: {}", s)),
        }
    }
}

/// An external origin of price data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub kind: SourceKind,
    /// Page URL, or a search template containing `{term}` for market search.
    pub url: String,
    pub polling_interval_secs: i64,
    pub freshness_window_secs: i64,
    pub enabled: bool,
}

impl Source {
    pub fn polling_interval(&self) -> TimeDelta {
        TimeDelta::seconds(self.polling_interval_secs.max(1))
    }

    pub fn freshness_window(&self) -> TimeDelta {
        TimeDelta::seconds(self.freshness_window_secs.max(0))
    }
}

/// A priced product tracked by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub key: String,
    pub name: String,
    pub category: String,
    pub unit: String,
    #[serde(default)]
    pub search_term: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Product {
    /// The term sent to market search sources.
    pub fn search_term(&self) -> &str {
        self.search_term.as_deref().unwrap_or(&self.name)
    }
}

/// How confidently a parser tied a raw row to a catalog product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchQuality {
    Partial,
    Exact,
}

impl MatchQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchQuality::Partial => "partial",
            MatchQuality::Exact => "exact",
        }
    }

    /// Multiplier applied to source trust when deriving observation confidence.
    pub fn factor(&self) -> f64 {
        match self {
            MatchQuality::Exact => 1.0,
            MatchQuality::Partial => PARTIAL_MATCH_FACTOR,
        }
    }
}

pub const PARTIAL_MATCH_FACTOR: f64 = 0.7;

impl FromStr for MatchQuality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(MatchQuality::Exact),
            "partial" => Ok(MatchQuality::Partial),
            _ => Err(format!("Unknown match quality: {}", s)),
        }
    }
}

/// A parser's output before it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObservation {
    pub product_key: String,
    pub source_id: String,
    pub price: f64,
    pub unit: String,
    pub observed_at: DateTime<Utc>,
    pub quality: MatchQuality,
}

/// A recorded, immutable price observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub id: Uuid,
    pub product_key: String,
    pub source_id: String,
    pub price: f64,
    pub unit: String,
    pub observed_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub quality: MatchQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceTrustScore {
    pub source_id: String,
    pub score: f64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonalCoefficient {
    pub category: String,
    /// Month of year, 1-12.
    pub month: u32,
    pub factor: f64,
    pub updated_at: DateTime<Utc>,
}

/// What an active price was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "source_id", rename_all = "kebab-case")]
pub enum PriceBasis {
    Manual,
    Source(String),
    AiEstimate,
}

impl PriceBasis {
    /// Flat string form used for persistence (`manual`, `ai-estimate`, or `source:<id>`).
    pub fn to_db_string(&self) -> String {
        match self {
            PriceBasis::Manual => "manual".to_string(),
            PriceBasis::AiEstimate => "ai-estimate".to_string(),
            PriceBasis::Source(id) => format!("source:{id}"),
        }
    }

    pub fn from_db_string(s: &str) -> Result<Self, String> {
        match s {
            "manual" => Ok(PriceBasis::Manual),
            "ai-estimate" => Ok(PriceBasis::AiEstimate),
            other => other
                .strip_prefix("source:")
                .map(|id| PriceBasis::Source(id.to_string()))
                .ok_or_else(|| format!("Unknown price basis: {}", s)),
        }
    }
}

impl fmt::Display for PriceBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_db_string())
    }
}

/// A resolved product price. Only one row per product is current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePrice {
    pub id: Uuid,
    pub product_key: String,
    pub price: f64,
    pub unit: String,
    pub basis: PriceBasis,
    pub confidence: f64,
    /// Price before the seasonal adjustment.
    pub base_price: f64,
    pub seasonal_factor: f64,
    pub stale: bool,
    pub computed_at: DateTime<Utc>,
    pub is_current: bool,
}

impl ActivePrice {
    /// True when both describe the same resolution, ignoring identity and timestamps.
    pub fn same_resolution(&self, other: &ActivePrice) -> bool {
        self.product_key == other.product_key
            && self.price.to_bits() == other.price.to_bits()
            && self.unit == other.unit
            && self.basis == other.basis
            && self.confidence.to_bits() == other.confidence.to_bits()
            && self.seasonal_factor.to_bits() == other.seasonal_factor.to_bits()
            && self.stale == other.stale
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualPriceEntry {
    pub product_key: String,
    pub price: f64,
    pub unit: String,
    pub entered_by: String,
    pub entered_at: DateTime<Utc>,
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Round to `places` decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}
