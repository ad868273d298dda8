use std::io::Write;

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;

use ceres_core::models::ActivePrice;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
}

/// One exported price row; flat so it maps onto CSV columns.
#[derive(Debug, Serialize)]
struct PriceRow<'a> {
    product: &'a str,
    price: f64,
    unit: &'a str,
    basis: String,
    confidence: f64,
    base_price: f64,
    seasonal_factor: f64,
    stale: bool,
    computed_at: DateTime<Utc>,
}

impl<'a> From<&'a ActivePrice> for PriceRow<'a> {
    fn from(price: &'a ActivePrice) -> Self {
        Self {
            product: &price.product_key,
            price: round2(price.price),
            unit: &price.unit,
            basis: price.basis.to_db_string(),
            confidence: round2(price.confidence),
            base_price: round2(price.base_price),
            seasonal_factor: price.seasonal_factor,
            stale: price.stale,
            computed_at: price.computed_at,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn write_prices<W: Write>(prices: &[ActivePrice], format: ExportFormat, out: W) -> Result<()> {
    let rows: Vec<PriceRow<'_>> = prices.iter().map(PriceRow::from).collect();
    match format {
        ExportFormat::Csv => {
            let mut writer = csv::Writer::from_writer(out);
            for row in &rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        ExportFormat::Json => {
            let mut out = out;
            serde_json::to_writer_pretty(&mut out, &rows)?;
            writeln!(out)?;
        }
    }
    Ok(())
}
