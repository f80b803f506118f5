//! Pricing-read surface for front-ends and chart services.
//!
//! Quotes always go through the kernel, never through a raw formula, so
//! the numbers here are the same ones the trade engine charges against.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::EngineError;
use crate::lmsr_core;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    Hour,
    Day,
    Week,
    Month,
    All,
}

impl TimeRange {
    fn since(&self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        match self {
            TimeRange::Hour => Some(now - Duration::hours(1)),
            TimeRange::Day => Some(now - Duration::hours(24)),
            TimeRange::Week => Some(now - Duration::days(7)),
            TimeRange::Month => Some(now - Duration::days(30)),
            TimeRange::All => None,
        }
    }
}

impl FromStr for TimeRange {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "1H" => Ok(TimeRange::Hour),
            "24H" => Ok(TimeRange::Day),
            "7D" => Ok(TimeRange::Week),
            "30D" => Ok(TimeRange::Month),
            "ALL" => Ok(TimeRange::All),
            other => Err(EngineError::Validation(format!(
                "unknown time range '{other}', expected 1H, 24H, 7D, 30D or ALL"
            ))),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PriceQuote {
    pub option_id: Uuid,
    pub yes_price: i64,
    pub no_price: i64,
    pub yes_quantity: i64,
    pub no_quantity: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub yes_price: i64,
    pub no_price: i64,
}

/// Current kernel quote for an option.
pub async fn price_at(pool: &PgPool, option_id: Uuid) -> Result<PriceQuote, EngineError> {
    let row = sqlx::query(
        "SELECT o.yes_quantity, o.no_quantity, m.liquidity_parameter
         FROM market_options o
         JOIN markets m ON m.id = o.market_id
         WHERE o.id = $1",
    )
    .bind(option_id)
    .fetch_optional(pool)
    .await
    .map_err(EngineError::from)?
    .ok_or(EngineError::NotFound("option"))?;

    let yes_quantity: i64 = row.get("yes_quantity");
    let no_quantity: i64 = row.get("no_quantity");
    let b: i64 = row.get("liquidity_parameter");

    let yes_price = lmsr_core::calculate_yes_price(
        yes_quantity.max(0) as u64,
        no_quantity.max(0) as u64,
        b.max(0) as u64,
    )? as i64;

    Ok(PriceQuote {
        option_id,
        yes_price,
        no_price: lmsr_core::PRECISION as i64 - yes_price,
        yes_quantity,
        no_quantity,
    })
}

/// Trade-sampled price history for one option, oldest first.
pub async fn price_history(
    pool: &PgPool,
    option_id: Uuid,
    range: TimeRange,
) -> Result<Vec<PricePoint>, EngineError> {
    let rows = match range.since() {
        Some(since) => {
            sqlx::query(
                "SELECT yes_price, no_price, created_at
                 FROM price_history
                 WHERE option_id = $1 AND created_at >= $2
                 ORDER BY created_at ASC",
            )
            .bind(option_id)
            .bind(since)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query(
                "SELECT yes_price, no_price, created_at
                 FROM price_history
                 WHERE option_id = $1
                 ORDER BY created_at ASC",
            )
            .bind(option_id)
            .fetch_all(pool)
            .await
        }
    }
    .map_err(EngineError::from)?;

    Ok(rows
        .iter()
        .map(|row| PricePoint {
            timestamp: row.get("created_at"),
            yes_price: row.get("yes_price"),
            no_price: row.get("no_price"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_ranges_parse_case_insensitively() {
        assert_eq!("1h".parse::<TimeRange>().unwrap(), TimeRange::Hour);
        assert_eq!("24H".parse::<TimeRange>().unwrap(), TimeRange::Day);
        assert_eq!("7d".parse::<TimeRange>().unwrap(), TimeRange::Week);
        assert_eq!("30D".parse::<TimeRange>().unwrap(), TimeRange::Month);
        assert_eq!("all".parse::<TimeRange>().unwrap(), TimeRange::All);
        assert!("2W".parse::<TimeRange>().is_err());
    }
}
