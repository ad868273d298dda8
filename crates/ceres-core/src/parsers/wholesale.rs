//! Wholesale market (hal) daily listings.
//!
//! Rows carry six cells: name, variety, type, average price, traded volume
//! and unit. Varieties of the same product collapse into one
//! volume-weighted observation.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use scraper::{Html, Selector};

use super::text::{canonical_unit, parse_price, parse_volume};
use super::{MatchedRow, ParseContext, ParseOutput, collapse_rows, matcher};
use crate::error::AppError;
use crate::models::MatchQuality;

/// Upper bound on listing pages fetched per job.
pub const MAX_PAGES: usize = 25;

const MIN_CELLS: usize = 6;

static BULLETIN_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Bülten Tarihi\s*:\s*(\d{2})\.(\d{2})\.(\d{4})").expect("valid date regex")
});

static POSTBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__doPostBack\('([^']+)','([^']+)'\)").expect("valid postback regex")
});

pub fn parse(payload: &str, ctx: &ParseContext<'_>) -> Result<ParseOutput, AppError> {
    let document = Html::parse_document(payload);
    let table_selector = Selector::parse("table").expect("valid selector");
    if document.select(&table_selector).next().is_none() {
        return Err(AppError::parse("no listing table found", payload));
    }

    let row_selector = Selector::parse("table tr").expect("valid selector");
    let cell_selector = Selector::parse("td").expect("valid selector");
    let matcher = matcher(ctx);
    let mut skipped = 0;
    let mut matched = Vec::new();

    for row in document.select(&row_selector) {
        let cells: Vec<String> = row
            .select(&cell_selector)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();
        if cells.len() < MIN_CELLS {
            // Header and pager rows.
            continue;
        }

        let (name, variety) = (&cells[0], &cells[1]);
        let Some(price) = parse_price(&cells[3]).filter(|p| *p > 0.0) else {
            skipped += 1;
            continue;
        };

        let with_variety = format!("{name} {variety}");
        let found = match matcher.find(&with_variety) {
            Some((key, MatchQuality::Exact)) => Some((key, MatchQuality::Exact)),
            _ => matcher.find(name),
        };
        let Some((key, quality)) = found else {
            skipped += 1;
            continue;
        };

        matched.push(MatchedRow {
            product_key: key.to_string(),
            price,
            unit: canonical_unit(if cells[5].is_empty() { "kg" } else { &cells[5] }),
            weight: parse_volume(&cells[4]).unwrap_or(0.0),
            quality,
        });
    }

    let observed_at = bulletin_date(&document).unwrap_or(ctx.fetched_at);
    let mut out = collapse_rows(matched, ctx, observed_at);
    out.skipped += skipped;
    Ok(out)
}

/// Reads the "Bülten Tarihi : dd.mm.yyyy" stamp, as midnight UTC.
fn bulletin_date(document: &Html) -> Option<DateTime<Utc>> {
    let text: String = document.root_element().text().collect();
    let caps = BULLETIN_DATE.captures(&text)?;
    let date = NaiveDate::from_ymd_opt(
        caps[3].parse().ok()?,
        caps[2].parse().ok()?,
        caps[1].parse().ok()?,
    )?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc())
}

/// Builds the postback form that requests `page` of a paginated listing.
///
/// Returns `None` when the current page has no pager link to `page`.
pub fn next_page_form(payload: &str, page: usize) -> Option<Vec<(String, String)>> {
    let document = Html::parse_document(payload);
    let link_selector = Selector::parse("a[href]").expect("valid selector");
    let wanted = format!("Page${page}");

    let target = document.select(&link_selector).find_map(|link| {
        let href = link.value().attr("href")?;
        let caps = POSTBACK.captures(href)?;
        (caps[2] == wanted).then(|| caps[1].to_string())
    })?;

    let hidden_selector = Selector::parse("input[type=hidden]").expect("valid selector");
    let mut form: Vec<(String, String)> = document
        .select(&hidden_selector)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            if name == "__EVENTTARGET" || name == "__EVENTARGUMENT" {
                return None;
            }
            Some((
                name.to_string(),
                input.value().attr("value").unwrap_or_default().to_string(),
            ))
        })
        .collect();
    form.push(("__EVENTTARGET".to_string(), target));
    form.push(("__EVENTARGUMENT".to_string(), wanted));
    Some(form)
}
