//! Text helpers shared by the source parsers: Turkish-aware normalization,
//! price parsing, package-size detection and catalog matching.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{MatchQuality, Product};

/// Lowercases with Turkish casing rules, folds diacritics to ASCII, strips
/// punctuation and collapses whitespace.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        let folded = match ch {
            'I' | 'ı' | 'İ' | 'i' => 'i',
            'Ğ' | 'ğ' => 'g',
            'Ü' | 'ü' => 'u',
            'Ş' | 'ş' => 's',
            'Ö' | 'ö' => 'o',
            'Ç' | 'ç' => 'c',
            'Â' | 'â' => 'a',
            c if c.is_alphanumeric() => {
                out.extend(c.to_lowercase());
                continue;
            }
            _ => ' ',
        };
        out.push(folded);
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parses a price written with Turkish or plain formatting.
///
/// - `"1.249,90"` -> 1249.90
/// - `"39,5"` -> 39.5
/// - `"249.90"` -> 249.90
/// - `"₺ 12,50 TL"` -> 12.50
pub fn parse_price(text: &str) -> Option<f64> {
    static NUMBER: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\d[\d.,]*").expect("valid price regex"));

    let raw = NUMBER.find(text)?.as_str().trim_end_matches(['.', ',']);
    let cleaned = if raw.contains(',') {
        raw.replace('.', "").replace(',', ".")
    } else if raw.matches('.').count() > 1 {
        raw.replace('.', "")
    } else {
        raw.to_string()
    };
    let value: f64 = cleaned.parse().ok()?;
    value.is_finite().then_some(value)
}

/// Parses an integer volume such as `"12.500"`.
pub fn parse_volume(text: &str) -> Option<f64> {
    let digits: String = text
        .chars()
        .take_while(|c| *c != ',')
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Canonical unit names used across sources.
pub fn canonical_unit(raw: &str) -> String {
    match normalize(raw).as_str() {
        "kg" | "kilo" | "kilogram" => "kg".to_string(),
        "g" | "gr" | "gram" => "g".to_string(),
        "l" | "lt" | "litre" | "liter" => "L".to_string(),
        "ml" => "ml".to_string(),
        "" | "adet" | "ad" | "tane" => "adet".to_string(),
        "demet" | "bag" => "demet".to_string(),
        other => other.to_string(),
    }
}

/// Package size detected in a listing title.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PackageSize {
    /// Quantity expressed in the base unit (kg, L or pieces).
    pub quantity: f64,
    pub unit: BaseUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseUnit {
    Kilogram,
    Litre,
    Piece,
}

impl BaseUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            BaseUnit::Kilogram => "kg",
            BaseUnit::Litre => "L",
            BaseUnit::Piece => "adet",
        }
    }
}

/// Detects the package size of a listing title, e.g. "Un 5 kg" or "Süt 6x1 lt".
pub fn package_size(title: &str) -> Option<PackageSize> {
    static MULTI: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)(\d+)\s*[x×]\s*(\d+(?:[.,]\d+)?)\s*(kg|kilo|gr|g|lt|l|litre|ml)\b")
            .expect("valid multipack regex")
    });
    static SINGLE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)(\d+(?:[.,]\d+)?)\s*(kg|kilo|gr|g|lt|l|litre|ml)\b")
            .expect("valid size regex")
    });
    static PIECES: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)(\d+)\s*(?:'?\s*(?:li|lu|lı|lü)|\s*adet)\b").expect("valid piece regex")
    });

    let lower = title.to_lowercase();

    if let Some(caps) = MULTI.captures(&lower) {
        let count: f64 = caps[1].parse().ok()?;
        let each = parse_amount(&caps[2])?;
        let (quantity, unit) = to_base(each, &caps[3]);
        return Some(PackageSize {
            quantity: quantity * count,
            unit,
        });
    }
    if let Some(caps) = SINGLE.captures(&lower) {
        let amount = parse_amount(&caps[1])?;
        let (quantity, unit) = to_base(amount, &caps[2]);
        return Some(PackageSize { quantity, unit });
    }
    if let Some(caps) = PIECES.captures(&lower) {
        let count: f64 = caps[1].parse().ok()?;
        return (count > 0.0).then_some(PackageSize {
            quantity: count,
            unit: BaseUnit::Piece,
        });
    }
    None
}

fn parse_amount(raw: &str) -> Option<f64> {
    let value: f64 = raw.replace(',', ".").parse().ok()?;
    (value > 0.0).then_some(value)
}

fn to_base(amount: f64, unit: &str) -> (f64, BaseUnit) {
    match unit {
        "kg" | "kilo" => (amount, BaseUnit::Kilogram),
        "gr" | "g" => (amount / 1000.0, BaseUnit::Kilogram),
        "ml" => (amount / 1000.0, BaseUnit::Litre),
        _ => (amount, BaseUnit::Litre),
    }
}

/// Matches free-text product names against the catalog.
#[derive(Debug, Clone)]
pub struct ProductMatcher {
    /// (normalized name or alias, product key)
    names: Vec<(String, String)>,
}

impl ProductMatcher {
    pub fn new(products: &[Product]) -> Self {
        let mut names = Vec::new();
        for product in products {
            names.push((normalize(&product.name), product.key.clone()));
            for alias in &product.aliases {
                names.push((normalize(alias), product.key.clone()));
            }
        }
        names.retain(|(name, _)| !name.is_empty());
        // Longest names first so "kirmizi mercimek" beats "mercimek".
        names.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self { names }
    }

    /// Returns the product key and how well it matched.
    pub fn find(&self, raw: &str) -> Option<(&str, MatchQuality)> {
        let needle = normalize(raw);
        if needle.is_empty() {
            return None;
        }
        if let Some((_, key)) = self.names.iter().find(|(name, _)| *name == needle) {
            return Some((key.as_str(), MatchQuality::Exact));
        }
        self.names
            .iter()
            .find(|(name, _)| contains_words(&needle, name) || contains_words(name, &needle))
            .map(|(_, key)| (key.as_str(), MatchQuality::Partial))
    }
}

/// True if every word of `needle` appears, in order and contiguous, in `haystack`.
fn contains_words(haystack: &str, needle: &str) -> bool {
    let hay: Vec<&str> = haystack.split(' ').collect();
    let words: Vec<&str> = needle.split(' ').collect();
    !words.is_empty() && hay.windows(words.len()).any(|window| window == words.as_slice())
}
