//! Fee calculator and the moodring configuration row.
//!
//! The moodring table holds one row of tunable parameters: fee rates in
//! basis points of gross cost, risk thresholds, and trade limits. It is
//! read once per trade, inside the trade's transaction.

use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::error::EngineError;
use crate::ledger::Tx;

/// Process-wide tunables, one row in the `moodring` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodringConfig {
    pub protocol_fee_bps: i64,
    pub creator_fee_bps: i64,
    pub lp_fee_bps: i64,
    /// Single-trade gross amount at which a trade is flagged, micro-units.
    pub suspicious_trade_threshold: i64,
    /// Hourly per-market volume at which the circuit breaker logs, micro-units.
    pub circuit_breaker_threshold: i64,
    /// Base volatility ceiling in basis points of the pre-trade price.
    pub max_market_volatility_bps: i64,
    /// Per-trade total cost bounds, micro-units.
    pub min_trade_amount: i64,
    pub max_trade_amount: i64,
    /// Per (user, option) share ceiling, micro-shares.
    pub max_option_position: i64,
    /// Per (user, market) cumulative cost-basis ceiling, micro-units.
    pub max_market_exposure: i64,
    pub trading_paused: bool,
}

impl Default for MoodringConfig {
    fn default() -> Self {
        Self {
            protocol_fee_bps: 200,
            creator_fee_bps: 100,
            lp_fee_bps: 200,
            suspicious_trade_threshold: 1_000_000_000,
            circuit_breaker_threshold: 10_000_000_000,
            max_market_volatility_bps: 500,
            min_trade_amount: 10_000,
            max_trade_amount: 100_000_000_000,
            max_option_position: 1_000_000_000_000,
            max_market_exposure: 1_000_000_000_000,
            trading_paused: false,
        }
    }
}

impl MoodringConfig {
    /// Read the configuration row. The row is mutated only through a
    /// dedicated admin transaction, so a plain read suffices here.
    pub async fn load(tx: &mut Tx<'_>) -> Result<Self, EngineError> {
        let row = sqlx::query(
            "SELECT protocol_fee_bps, creator_fee_bps, lp_fee_bps,
                    suspicious_trade_threshold, circuit_breaker_threshold,
                    max_market_volatility_bps, min_trade_amount,
                    max_trade_amount, max_option_position,
                    max_market_exposure, trading_paused
             FROM moodring
             LIMIT 1",
        )
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("moodring row is missing")))?;

        Ok(Self {
            protocol_fee_bps: row.get("protocol_fee_bps"),
            creator_fee_bps: row.get("creator_fee_bps"),
            lp_fee_bps: row.get("lp_fee_bps"),
            suspicious_trade_threshold: row.get("suspicious_trade_threshold"),
            circuit_breaker_threshold: row.get("circuit_breaker_threshold"),
            max_market_volatility_bps: row.get("max_market_volatility_bps"),
            min_trade_amount: row.get("min_trade_amount"),
            max_trade_amount: row.get("max_trade_amount"),
            max_option_position: row.get("max_option_position"),
            max_market_exposure: row.get("max_market_exposure"),
            trading_paused: row.get("trading_paused"),
        })
    }
}

/// A gross amount split into its fee components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeBreakdown {
    pub protocol_fee: i64,
    pub creator_fee: i64,
    pub lp_fee: i64,
    pub total_fee: i64,
    pub net_amount: i64,
}

/// Split `gross` by the configured basis-point rates. Each split is
/// floored; the rounding residual of the combined rate goes to the
/// protocol share, so total_fee + net_amount == gross exactly.
pub fn calculate_fees(gross: i64, config: &MoodringConfig) -> FeeBreakdown {
    let gross_wide = gross as i128;
    let mut protocol_fee = (gross_wide * config.protocol_fee_bps as i128 / 10_000) as i64;
    let creator_fee = (gross_wide * config.creator_fee_bps as i128 / 10_000) as i64;
    let lp_fee = (gross_wide * config.lp_fee_bps as i128 / 10_000) as i64;

    let combined_bps =
        (config.protocol_fee_bps + config.creator_fee_bps + config.lp_fee_bps) as i128;
    let total_fee = (gross_wide * combined_bps / 10_000) as i64;
    protocol_fee += total_fee - (protocol_fee + creator_fee + lp_fee);

    FeeBreakdown {
        protocol_fee,
        creator_fee,
        lp_fee,
        total_fee,
        net_amount: gross - total_fee,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_the_reference_trade() {
        // 50 units gross at 2% / 1% / 2%.
        let fees = calculate_fees(50_000_000, &MoodringConfig::default());
        assert_eq!(fees.protocol_fee, 1_000_000);
        assert_eq!(fees.creator_fee, 500_000);
        assert_eq!(fees.lp_fee, 1_000_000);
        assert_eq!(fees.total_fee, 2_500_000);
        assert_eq!(fees.net_amount, 47_500_000);
    }

    #[test]
    fn residual_goes_to_the_protocol_share() {
        let config = MoodringConfig {
            protocol_fee_bps: 333,
            creator_fee_bps: 333,
            lp_fee_bps: 333,
            ..MoodringConfig::default()
        };
        let fees = calculate_fees(1_003, &config);
        // floor(1003 * 999 / 10000) = 100; individual floors are 33 each.
        assert_eq!(fees.total_fee, 100);
        assert_eq!(fees.creator_fee, 33);
        assert_eq!(fees.lp_fee, 33);
        assert_eq!(fees.protocol_fee, 34);
        assert_eq!(fees.protocol_fee + fees.creator_fee + fees.lp_fee, fees.total_fee);
        assert_eq!(fees.net_amount + fees.total_fee, 1_003);
    }

    #[test]
    fn zero_gross_splits_to_zero() {
        let fees = calculate_fees(0, &MoodringConfig::default());
        assert_eq!(fees.total_fee, 0);
        assert_eq!(fees.net_amount, 0);
    }
}
