//! Risk controller: suspicious-trade detection, circuit-breaker telemetry,
//! and volatility gating.
//!
//! All checks are advisory today — they log and record, never reject. The
//! report keeps a `passed` flag so a deployment can promote any check to
//! enforcement without changing call sites. The controller writes only to
//! the suspicious_trades ledger; failures there are swallowed, because
//! risk telemetry must never fail a trade.

use serde_json::json;
use sqlx::types::JsonValue;
use tracing::warn;
use uuid::Uuid;

use crate::error::EngineError;
use crate::fees::MoodringConfig;
use crate::ledger::Tx;
use crate::lmsr_core::Side;

/// Everything the checks need to know about the candidate trade.
#[derive(Debug, Clone, Copy)]
pub struct RiskContext {
    pub user_id: Uuid,
    pub market_id: Uuid,
    pub option_id: Uuid,
    pub side: Side,
    /// Shares moved by this trade, micro-shares.
    pub trade_size: i64,
    /// Gross monetary size of this trade, micro-units.
    pub total_amount: i64,
    /// Combined option inventory before the trade, micro-shares.
    pub inventory_before: i64,
    /// Kernel YES quote before / after the candidate trade.
    pub price_before: i64,
    pub price_after: i64,
}

#[derive(Debug, Clone)]
pub enum RiskTrigger {
    SuspiciousAmount { risk_score: i32 },
    CircuitBreaker { hourly_volume: i64 },
    Volatility { volatility_bps: i64, threshold_bps: i64 },
}

#[derive(Debug, Clone)]
pub struct RiskReport {
    pub passed: bool,
    pub triggers: Vec<RiskTrigger>,
}

impl RiskReport {
    fn clean() -> Self {
        Self {
            passed: true,
            triggers: Vec::new(),
        }
    }
}

/// Maturity multiplier: thin options move more per trade, so young
/// inventories get a wider volatility band.
fn maturity_multiplier(inventory_before: i64, trade_size: i64) -> i64 {
    let size = trade_size.max(1);
    if inventory_before < 10 * size {
        5
    } else if inventory_before < 50 * size {
        3
    } else if inventory_before < 100 * size {
        2
    } else {
        1
    }
}

/// Run all checks in order. Never errors and never rejects: telemetry
/// insert failures are logged and the trade proceeds.
pub async fn evaluate_trade(
    tx: &mut Tx<'_>,
    config: &MoodringConfig,
    ctx: &RiskContext,
) -> RiskReport {
    let mut report = RiskReport::clean();

    if config.suspicious_trade_threshold > 0
        && ctx.total_amount >= config.suspicious_trade_threshold
    {
        let score = (50i128 * ctx.total_amount as i128
            / config.suspicious_trade_threshold as i128)
            .min(100) as i32;
        report
            .triggers
            .push(RiskTrigger::SuspiciousAmount { risk_score: score });
        record_suspicious(
            tx,
            ctx,
            "suspicious_amount",
            json!({ "threshold": config.suspicious_trade_threshold }),
            score,
        )
        .await;
    }

    match hourly_market_volume(tx, ctx.market_id).await {
        Ok(hourly_volume) => {
            if config.circuit_breaker_threshold > 0
                && hourly_volume + ctx.total_amount >= config.circuit_breaker_threshold
            {
                report
                    .triggers
                    .push(RiskTrigger::CircuitBreaker { hourly_volume });
                record_suspicious(
                    tx,
                    ctx,
                    "circuit_breaker",
                    json!({
                        "hourly_volume": hourly_volume,
                        "threshold": config.circuit_breaker_threshold,
                    }),
                    100,
                )
                .await;
            }
        }
        Err(e) => warn!(market_id = %ctx.market_id, error = %e, "circuit breaker query failed"),
    }

    if ctx.price_before > 0 {
        let swing = (ctx.price_after - ctx.price_before).abs();
        let volatility_bps = (10_000i128 * swing as i128 / ctx.price_before as i128) as i64;
        let threshold_bps = config.max_market_volatility_bps
            * maturity_multiplier(ctx.inventory_before, ctx.trade_size);
        if volatility_bps >= threshold_bps {
            report.triggers.push(RiskTrigger::Volatility {
                volatility_bps,
                threshold_bps,
            });
            record_suspicious(
                tx,
                ctx,
                "volatility",
                json!({
                    "volatility_bps": volatility_bps,
                    "threshold_bps": threshold_bps,
                    "price_before": ctx.price_before,
                    "price_after": ctx.price_after,
                }),
                (volatility_bps.min(10_000) / 100) as i32,
            )
            .await;
        }
    }

    report
}

async fn hourly_market_volume(tx: &mut Tx<'_>, market_id: Uuid) -> Result<i64, EngineError> {
    let volume: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(total_cost), 0)::BIGINT
         FROM trades
         WHERE market_id = $1 AND created_at > NOW() - INTERVAL '1 hour'",
    )
    .bind(market_id)
    .fetch_one(tx.as_mut())
    .await?;
    Ok(volume)
}

async fn record_suspicious(
    tx: &mut Tx<'_>,
    ctx: &RiskContext,
    reason: &str,
    metadata: JsonValue,
    risk_score: i32,
) {
    let result = sqlx::query(
        "INSERT INTO suspicious_trades
            (id, user_id, market_id, option_id, side, quantity, total_amount,
             detection_reason, detection_metadata, risk_score, automated_action_taken)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'logged')",
    )
    .bind(Uuid::new_v4())
    .bind(ctx.user_id)
    .bind(ctx.market_id)
    .bind(ctx.option_id)
    .bind(ctx.side.as_str())
    .bind(ctx.trade_size)
    .bind(ctx.total_amount)
    .bind(reason)
    .bind(metadata)
    .bind(risk_score)
    .execute(tx.as_mut())
    .await;

    match result {
        Ok(_) => warn!(
            user_id = %ctx.user_id,
            market_id = %ctx.market_id,
            reason,
            risk_score,
            "risk check triggered"
        ),
        Err(e) => warn!(reason, error = %e, "failed to record suspicious trade"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maturity_multiplier_widens_for_thin_inventory() {
        assert_eq!(maturity_multiplier(0, 1_000), 5);
        assert_eq!(maturity_multiplier(9_999, 1_000), 5);
        assert_eq!(maturity_multiplier(10_000, 1_000), 3);
        assert_eq!(maturity_multiplier(49_999, 1_000), 3);
        assert_eq!(maturity_multiplier(50_000, 1_000), 2);
        assert_eq!(maturity_multiplier(100_000, 1_000), 1);
    }

    #[test]
    fn maturity_multiplier_survives_zero_trade_size() {
        assert_eq!(maturity_multiplier(1_000, 0), 1);
    }

    #[test]
    fn suspicious_score_is_linear_and_capped() {
        let threshold = 1_000_000_000i128;
        let score = |amount: i128| (50 * amount / threshold).min(100) as i32;
        assert_eq!(score(1_000_000_000), 50);
        assert_eq!(score(1_500_000_000), 75);
        assert_eq!(score(10_000_000_000), 100);
    }
}
