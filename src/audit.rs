//! Ledger invariant verification.
//!
//! Read-only consistency checks over a market's rows: non-negative
//! inventories and balances, price complementarity, pool coverage of
//! unclaimed winners, and LP share supply. Operators run these after
//! incidents or on a schedule; a failed check means operator attention,
//! not a user error.

use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::EngineError;
use crate::lmsr_core::{self, PRECISION};

/// Verify one market's ledger invariants and report each check.
pub async fn verify_market_invariants(
    pool: &PgPool,
    market_id: Uuid,
) -> Result<Value, EngineError> {
    let market = sqlx::query(
        "SELECT liquidity_parameter, shared_pool_liquidity, total_open_interest,
                total_lp_shares, is_resolved
         FROM markets WHERE id = $1",
    )
    .bind(market_id)
    .fetch_optional(pool)
    .await
    .map_err(EngineError::from)?
    .ok_or(EngineError::NotFound("market"))?;

    let liquidity_parameter: i64 = market.get("liquidity_parameter");
    let shared_pool_liquidity: i64 = market.get("shared_pool_liquidity");
    let total_open_interest: i64 = market.get("total_open_interest");
    let total_lp_shares: i64 = market.get("total_lp_shares");
    let is_resolved: bool = market.get("is_resolved");

    let pool_non_negative = shared_pool_liquidity >= 0 && total_open_interest >= 0;

    // Negative inventories or position shares cannot pass the CHECK
    // constraints, but a drifted schema would; count them anyway.
    let negative_inventories: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM market_options
         WHERE market_id = $1 AND (yes_quantity < 0 OR no_quantity < 0)",
    )
    .bind(market_id)
    .fetch_one(pool)
    .await
    .map_err(EngineError::from)?;

    let negative_positions: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM user_positions p
         JOIN market_options o ON o.id = p.option_id
         WHERE o.market_id = $1 AND (p.yes_shares < 0 OR p.no_shares < 0)",
    )
    .bind(market_id)
    .fetch_one(pool)
    .await
    .map_err(EngineError::from)?;

    // Quote complementarity per option, through the kernel.
    let options = sqlx::query(
        "SELECT id, yes_quantity, no_quantity FROM market_options WHERE market_id = $1",
    )
    .bind(market_id)
    .fetch_all(pool)
    .await
    .map_err(EngineError::from)?;

    let mut prices_complementary = true;
    for option in &options {
        let yes: i64 = option.get("yes_quantity");
        let no: i64 = option.get("no_quantity");
        let yes_price = lmsr_core::calculate_yes_price(
            yes.max(0) as u64,
            no.max(0) as u64,
            liquidity_parameter.max(0) as u64,
        )?;
        let no_price = lmsr_core::calculate_no_price(
            yes.max(0) as u64,
            no.max(0) as u64,
            liquidity_parameter.max(0) as u64,
        )?;
        if yes_price + no_price != PRECISION {
            prices_complementary = false;
        }
    }

    // Unclaimed winning-side shares must stay covered by the pool.
    let outstanding: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(CASE WHEN o.winning_side = 1 THEN p.yes_shares
                                  ELSE p.no_shares END), 0)::BIGINT
         FROM user_positions p
         JOIN market_options o ON o.id = p.option_id
         WHERE o.market_id = $1
           AND o.is_resolved
           AND o.winning_side IS NOT NULL
           AND NOT p.is_claimed",
    )
    .bind(market_id)
    .fetch_one(pool)
    .await
    .map_err(EngineError::from)?;
    let pool_covers_winners = !is_resolved || outstanding <= shared_pool_liquidity;

    // LP share supply on the market row equals the sum over positions.
    let lp_share_sum: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(shares), 0)::BIGINT FROM lp_positions WHERE market_id = $1",
    )
    .bind(market_id)
    .fetch_one(pool)
    .await
    .map_err(EngineError::from)?;
    let lp_supply_consistent = lp_share_sum == total_lp_shares;

    let valid = pool_non_negative
        && negative_inventories == 0
        && negative_positions == 0
        && prices_complementary
        && pool_covers_winners
        && lp_supply_consistent;

    Ok(json!({
        "market_id": market_id,
        "valid": valid,
        "checks": {
            "pool_non_negative": {
                "passed": pool_non_negative,
                "shared_pool_liquidity": shared_pool_liquidity,
                "total_open_interest": total_open_interest,
            },
            "no_negative_inventories": {
                "passed": negative_inventories == 0,
                "violations": negative_inventories,
            },
            "no_negative_positions": {
                "passed": negative_positions == 0,
                "violations": negative_positions,
            },
            "prices_complementary": {
                "passed": prices_complementary,
                "options_checked": options.len(),
            },
            "pool_covers_unclaimed_winners": {
                "passed": pool_covers_winners,
                "outstanding_redeemable": outstanding,
            },
            "lp_supply_consistent": {
                "passed": lp_supply_consistent,
                "market_row": total_lp_shares,
                "position_sum": lp_share_sum,
            },
        },
    }))
}

/// Verify that no wallet has slipped below zero. Scans everything; meant
/// for operator tooling, not the trade path.
pub async fn verify_wallet_invariants(pool: &PgPool) -> Result<Value, EngineError> {
    let negative_wallets: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM wallets WHERE balance_usdc < 0")
            .fetch_one(pool)
            .await
            .map_err(EngineError::from)?;

    let total_balance: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(balance_usdc), 0)::BIGINT FROM wallets",
    )
    .fetch_one(pool)
    .await
    .map_err(EngineError::from)?;

    Ok(json!({
        "valid": negative_wallets == 0,
        "negative_wallets": negative_wallets,
        "total_balance": total_balance,
    }))
}
