//! Market price-comparison search results.
//!
//! A results page lists product rows (`tr.table-light`), each followed by a
//! `tr.price-details` row holding one box per market. A search targets one
//! catalog product, so the whole page reduces to a single observation.

use std::collections::{HashMap, HashSet};

use scraper::{ElementRef, Html, Selector};

use super::text::{BaseUnit, normalize, package_size, parse_price};
use super::{ParseContext, ParseOutput};
use crate::error::AppError;
use crate::models::{MatchQuality, NewObservation, Product, round_to};

#[derive(Debug, Clone)]
pub struct MarketSearchConfig {
    pub min_price: f64,
    pub max_price: f64,
    /// Share of search words that must appear in a listing title.
    pub min_word_ratio: f64,
    /// Number of cheapest unit prices averaged into the observation.
    pub economic_sample: usize,
    /// Listings sharing the dominant unit needed for an exact match.
    pub exact_min_listings: usize,
}

impl Default for MarketSearchConfig {
    fn default() -> Self {
        Self {
            min_price: 1.0,
            max_price: 50_000.0,
            min_word_ratio: 0.4,
            economic_sample: 5,
            exact_min_listings: 3,
        }
    }
}

/// One market's offer for one listing.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketListing {
    pub market: String,
    pub title: String,
    pub price: f64,
    pub unit_price: f64,
    pub unit: BaseUnit,
}

/// Words that mark a listing as something other than food.
const NON_FOOD: &[&str] = &[
    "deterjan", "temizlik", "camasir", "bulasik", "yumusatici", "sampuan", "losyon", "parfum",
    "deodorant", "kolonya", "dus jeli", "bebek bezi", "islak mendil", "tuvalet kagidi", "pecete",
    "mendil", "cop torbasi", "poset", "folyo", "strec", "silikon", "demlik", "bardak", "tabak",
    "catal", "kasik", "bicak", "tencere", "tava", "kavanoz", "saklama kabi", "mamasi", "oyuncak",
    "kitap", "kirtasiye", "mum", "dekoratif", "aksesuar", "kalem", "havlu", "kokulu", "vitamin",
    "takviye", "kapsul", "tablet", "omega",
];

/// Extracts every (market, title, price) box from a results page.
///
/// Returns the listings and the number of boxes that were unreadable or
/// priced outside the configured range.
pub fn extract_listings(
    payload: &str,
    config: &MarketSearchConfig,
) -> Result<(Vec<MarketListing>, usize), AppError> {
    if payload.trim().is_empty() {
        return Err(AppError::parse("empty search response", payload));
    }

    let document = Html::parse_document(payload);
    let row_selector = Selector::parse("tr").expect("valid selector");
    let title_selector = Selector::parse("td[data-label=\"Ürün\"], td").expect("valid selector");
    let box_selector = Selector::parse(".border.rounded").expect("valid selector");
    let market_selector = Selector::parse(".fw-semibold").expect("valid selector");
    let price_selector = Selector::parse(".fw-bold").expect("valid selector");

    let mut listings = Vec::new();
    let mut skipped = 0;
    let mut current_title: Option<String> = None;

    for row in document.select(&row_selector) {
        if has_class(&row, "table-light") {
            current_title = row
                .select(&title_selector)
                .map(|cell| element_text(&cell))
                .find(|text| !text.is_empty());
            continue;
        }
        if !has_class(&row, "price-details") {
            continue;
        }
        let Some(title) = current_title.take() else {
            continue;
        };

        for price_box in row.select(&box_selector) {
            let market = price_box
                .select(&market_selector)
                .next()
                .map(|el| element_text(&el))
                .unwrap_or_default();
            let price = price_box
                .select(&price_selector)
                .next()
                .and_then(|el| parse_price(&element_text(&el)))
                .filter(|p| (config.min_price..=config.max_price).contains(p));

            let Some(price) = price.filter(|_| !market.is_empty()) else {
                skipped += 1;
                continue;
            };
            let (unit_price, unit) = unit_price(price, &title);
            listings.push(MarketListing {
                market,
                title: title.clone(),
                price,
                unit_price,
                unit,
            });
        }
    }

    Ok((listings, skipped))
}

/// Drops non-food listings and listings that share too few words with the
/// search term.
pub fn is_relevant(term: &str, title: &str, config: &MarketSearchConfig) -> bool {
    let search = normalize(term);
    let product = normalize(title);

    if NON_FOOD
        .iter()
        .any(|word| product.contains(word) && !search.contains(word))
    {
        return false;
    }

    let words: Vec<&str> = search
        .split(' ')
        .filter(|w| w.chars().count() >= 2 && !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !matches!(*w, "kg" | "gr" | "g" | "lt" | "l" | "ml" | "adet"))
        .collect();
    if words.is_empty() {
        return true;
    }
    let matched = words.iter().filter(|w| product.contains(**w)).count();
    matched as f64 >= words.len() as f64 * config.min_word_ratio
}

/// Price per kg or L when the title names a package size, otherwise per piece.
pub fn unit_price(price: f64, title: &str) -> (f64, BaseUnit) {
    match package_size(title) {
        Some(size) if size.quantity > 0.0 => (round_to(price / size.quantity, 2), size.unit),
        _ => (price, BaseUnit::Piece),
    }
}

/// Reduces one product's search page to a single observation.
pub fn parse_results(
    payload: &str,
    product: &Product,
    ctx: &ParseContext<'_>,
    config: &MarketSearchConfig,
) -> Result<ParseOutput, AppError> {
    let (listings, mut skipped) = extract_listings(payload, config)?;
    let term = product.search_term();

    let mut seen = HashSet::new();
    let mut relevant = Vec::new();
    for listing in listings {
        if !is_relevant(term, &listing.title, config) {
            skipped += 1;
            continue;
        }
        if !seen.insert((listing.market.clone(), listing.price.to_bits())) {
            skipped += 1;
            continue;
        }
        relevant.push(listing);
    }

    let Some(unit) = dominant_unit(&relevant, config) else {
        return Ok(ParseOutput {
            observations: vec![],
            skipped,
        });
    };

    let mut prices: Vec<f64> = relevant
        .iter()
        .filter(|l| l.unit == unit)
        .map(|l| l.unit_price)
        .collect();
    skipped += relevant.len() - prices.len();
    prices.sort_by(f64::total_cmp);

    let sample = &prices[..prices.len().min(config.economic_sample.max(1))];
    let average = sample.iter().sum::<f64>() / sample.len() as f64;
    let quality = if prices.len() >= config.exact_min_listings {
        MatchQuality::Exact
    } else {
        MatchQuality::Partial
    };

    Ok(ParseOutput {
        observations: vec![NewObservation {
            product_key: product.key.clone(),
            source_id: ctx.source_id.to_string(),
            price: round_to(average, 2),
            unit: unit.as_str().to_string(),
            observed_at: ctx.fetched_at,
            quality,
        }],
        skipped,
    })
}

/// kg or L when at least `exact_min_listings` share it, otherwise the most
/// common weighed unit, falling back to pieces.
fn dominant_unit(listings: &[MarketListing], config: &MarketSearchConfig) -> Option<BaseUnit> {
    if listings.is_empty() {
        return None;
    }
    let mut counts: HashMap<BaseUnit, usize> = HashMap::new();
    for listing in listings {
        *counts.entry(listing.unit).or_default() += 1;
    }
    let count = |unit: BaseUnit| counts.get(&unit).copied().unwrap_or(0);

    if count(BaseUnit::Kilogram) >= config.exact_min_listings {
        return Some(BaseUnit::Kilogram);
    }
    if count(BaseUnit::Litre) >= config.exact_min_listings {
        return Some(BaseUnit::Litre);
    }
    match (count(BaseUnit::Kilogram), count(BaseUnit::Litre)) {
        (0, 0) => Some(BaseUnit::Piece),
        (kg, l) if kg >= l => Some(BaseUnit::Kilogram),
        _ => Some(BaseUnit::Litre),
    }
}

fn has_class(element: &ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

fn element_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
