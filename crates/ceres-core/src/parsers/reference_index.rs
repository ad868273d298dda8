//! Reference-index bulletins (chamber of agriculture style price lists).
//!
//! Two payload shapes are accepted: a JSON array of rows, or an HTML table
//! whose rows read `product | price | unit`.

use chrono::{DateTime, NaiveDate, Utc};
use scraper::{Html, Selector};
use serde_json::Value;

use super::text::{canonical_unit, parse_price};
use super::{MatchedRow, ParseContext, ParseOutput, collapse_rows, matcher};
use crate::error::AppError;

pub fn parse(payload: &str, ctx: &ParseContext<'_>) -> Result<ParseOutput, AppError> {
    let trimmed = payload.trim_start();
    if trimmed.starts_with('[') {
        parse_json(trimmed, ctx)
    } else {
        parse_table(payload, ctx)
    }
}

fn parse_json(payload: &str, ctx: &ParseContext<'_>) -> Result<ParseOutput, AppError> {
    let rows: Vec<Value> = serde_json::from_str(payload)
        .map_err(|e| AppError::parse(format!("invalid reference index JSON: {e}"), payload))?;

    let matcher = matcher(ctx);
    let mut skipped = 0;
    let mut matched = Vec::new();
    let mut bulletin_date: Option<DateTime<Utc>> = None;

    for row in &rows {
        let Some(name) = row.get("product").and_then(Value::as_str) else {
            skipped += 1;
            continue;
        };
        let price = ["market_price", "price", "producer_price"]
            .iter()
            .find_map(|field| row.get(*field).and_then(json_price).filter(|p| *p > 0.0));
        let Some(price) = price else {
            skipped += 1;
            continue;
        };
        let Some((key, quality)) = matcher.find(name) else {
            skipped += 1;
            continue;
        };
        if let Some(date) = row.get("date").and_then(Value::as_str).and_then(parse_iso_date) {
            bulletin_date = Some(bulletin_date.map_or(date, |d| d.max(date)));
        }
        let unit = row.get("unit").and_then(Value::as_str).unwrap_or("kg");
        matched.push(MatchedRow {
            product_key: key.to_string(),
            price,
            unit: canonical_unit(unit),
            weight: 0.0,
            quality,
        });
    }

    let mut out = collapse_rows(matched, ctx, bulletin_date.unwrap_or(ctx.fetched_at));
    out.skipped += skipped;
    Ok(out)
}

fn parse_table(payload: &str, ctx: &ParseContext<'_>) -> Result<ParseOutput, AppError> {
    let document = Html::parse_document(payload);
    let row_selector = Selector::parse("table tr").expect("valid selector");
    let cell_selector = Selector::parse("td").expect("valid selector");

    let rows: Vec<_> = document.select(&row_selector).collect();
    if rows.is_empty() {
        return Err(AppError::parse("no price table found", payload));
    }

    let matcher = matcher(ctx);
    let mut skipped = 0;
    let mut matched = Vec::new();

    for row in rows {
        let cells: Vec<String> = row
            .select(&cell_selector)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();
        // Header rows use <th> and have no cells.
        if cells.is_empty() {
            continue;
        }
        if cells.len() < 2 {
            skipped += 1;
            continue;
        }
        let Some(price) = parse_price(&cells[1]).filter(|p| *p > 0.0) else {
            skipped += 1;
            continue;
        };
        let Some((key, quality)) = matcher.find(&cells[0]) else {
            skipped += 1;
            continue;
        };
        matched.push(MatchedRow {
            product_key: key.to_string(),
            price,
            unit: canonical_unit(cells.get(2).map(String::as_str).unwrap_or("kg")),
            weight: 0.0,
            quality,
        });
    }

    let mut out = collapse_rows(matched, ctx, ctx.fetched_at);
    out.skipped += skipped;
    Ok(out)
}

fn json_price(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_price(s),
        _ => None,
    }
}

fn parse_iso_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()?
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
}
