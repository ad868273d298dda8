//! Source payload parsers.
//!
//! Every parser is a pure function from a raw payload to canonical
//! [`NewObservation`]s. Rows that cannot be read or matched are skipped and
//! counted; only a payload that is unusable as a whole yields `ParseError`.

pub mod market_search;
pub mod reference_index;
pub mod text;
pub mod wholesale;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{MatchQuality, NewObservation, Product, SourceKind};
use text::ProductMatcher;

pub use market_search::{MarketListing, MarketSearchConfig};
pub use wholesale::next_page_form;

/// Inputs shared by every parser.
#[derive(Debug, Clone)]
pub struct ParseContext<'a> {
    pub source_id: &'a str,
    pub products: &'a [Product],
    /// When the payload was fetched; used if the payload carries no date.
    pub fetched_at: DateTime<Utc>,
}

/// A parsed batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseOutput {
    pub observations: Vec<NewObservation>,
    /// Rows that were malformed, priced out of range, or matched no product.
    pub skipped: usize,
}

impl ParseOutput {
    pub fn merge(&mut self, other: ParseOutput) {
        self.observations.extend(other.observations);
        self.skipped += other.skipped;
    }
}

/// Parses a document-style payload (reference index or wholesale listing).
///
/// Market-search payloads are parsed per product with
/// [`market_search::parse_results`], since each search targets one product.
pub fn parse_document(
    kind: SourceKind,
    payload: &str,
    ctx: &ParseContext<'_>,
) -> Result<ParseOutput, AppError> {
    match kind {
        SourceKind::ReferenceIndex => reference_index::parse(payload, ctx),
        SourceKind::WholesaleListing => wholesale::parse(payload, ctx),
        SourceKind::MarketSearch => Err(AppError::parse(
            "market-search payloads are parsed per product",
            payload,
        )),
    }
}

/// A matched row before per-product collapsing.
#[derive(Debug, Clone)]
pub(crate) struct MatchedRow {
    pub product_key: String,
    pub price: f64,
    pub unit: String,
    pub weight: f64,
    pub quality: MatchQuality,
}

/// Collapses several rows for one product into a single weighted-average
/// observation. The best match quality seen wins; the unit of the heaviest
/// row is kept and rows in other units are dropped into `skipped`.
pub(crate) fn collapse_rows(
    rows: Vec<MatchedRow>,
    ctx: &ParseContext<'_>,
    observed_at: DateTime<Utc>,
) -> ParseOutput {
    let mut grouped: BTreeMap<String, Vec<MatchedRow>> = BTreeMap::new();
    for row in rows {
        grouped.entry(row.product_key.clone()).or_default().push(row);
    }

    let mut out = ParseOutput::default();
    for (product_key, rows) in grouped {
        let Some(lead) = rows
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
            .map(|r| r.unit.clone())
        else {
            continue;
        };

        let (same_unit, other): (Vec<_>, Vec<_>) = rows.into_iter().partition(|r| r.unit == lead);
        out.skipped += other.len();

        let total_weight: f64 = same_unit.iter().map(|r| r.weight).sum();
        let price = if total_weight > 0.0 {
            same_unit.iter().map(|r| r.price * r.weight).sum::<f64>() / total_weight
        } else {
            same_unit.iter().map(|r| r.price).sum::<f64>() / same_unit.len() as f64
        };
        let quality = same_unit
            .iter()
            .map(|r| r.quality)
            .max()
            .unwrap_or(MatchQuality::Partial);

        out.observations.push(NewObservation {
            product_key,
            source_id: ctx.source_id.to_string(),
            price: crate::models::round_to(price, 2),
            unit: lead,
            observed_at,
            quality,
        });
    }
    out
}

pub(crate) fn matcher(ctx: &ParseContext<'_>) -> ProductMatcher {
    ProductMatcher::new(ctx.products)
}
