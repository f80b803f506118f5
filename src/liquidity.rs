//! Liquidity lifecycle: pool seeding, LP share minting, and
//! resolution-gated withdrawal.
//!
//! LP shares are a proportional claim on the market's residual pool after
//! resolution plus accrued LP fees. Withdrawal before resolution is
//! always rejected; after resolution the pool first covers outstanding
//! redeemable winning shares, and only the remainder is distributable.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EngineError, Resource};
use crate::fanout::{EngineEvent, Fanout};
use crate::ledger::{self, MarketExpectation};

#[derive(Debug, Clone, serde::Serialize)]
pub struct LpReceipt {
    pub market_id: Uuid,
    pub shares_minted: i64,
    pub lp_shares_total: i64,
    pub pool_after: i64,
    pub balance_after: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WithdrawReceipt {
    pub market_id: Uuid,
    pub shares_burned: i64,
    pub user_value: i64,
    pub fees_paid_out: i64,
    pub total_payout: i64,
    pub remaining_shares: i64,
    pub balance_after: i64,
}

fn require_positive(amount: i64, what: &str) -> Result<(), EngineError> {
    if amount <= 0 {
        return Err(EngineError::Validation(format!("{what} must be positive")));
    }
    Ok(())
}

/// Seed an uninitialized market's collateral pool, minting the founder's
/// LP position one-for-one and opening the market for trading.
pub async fn initialize_market(
    pool: &PgPool,
    fanout: &Fanout,
    user_id: Uuid,
    market_id: Uuid,
    amount: i64,
) -> Result<LpReceipt, EngineError> {
    require_positive(amount, "seed amount")?;

    let (receipt, events) = ledger::with_engine_tx!(pool, tx, {
        let market = ledger::get_market_with_lock(&mut tx, market_id, MarketExpectation::Any).await?;
        if market.is_initialized {
            return Err(EngineError::Conflict("market is already initialized".into()));
        }
        if market.is_resolved {
            return Err(EngineError::Precondition("market is resolved".into()));
        }
        if market.liquidity_parameter <= 0 {
            return Err(EngineError::Precondition(
                "market has no liquidity parameter".into(),
            ));
        }

        let wallet = ledger::get_wallet_with_lock(&mut tx, user_id).await?;
        if wallet.balance_usdc < amount {
            return Err(EngineError::Insufficient {
                resource: Resource::Balance,
                available: wallet.balance_usdc,
                required: amount,
            });
        }
        let lp = ledger::get_or_create_lp_position(&mut tx, user_id, market_id).await?;

        ledger::update_wallet_balance(&mut tx, wallet.id, -amount).await?;
        ledger::update_market_stats(&mut tx, market_id, 0, 0, 0, 0, 0, amount).await?;
        ledger::update_market_lp(&mut tx, market_id, amount, 0).await?;
        ledger::mark_market_initialized(&mut tx, market_id).await?;
        ledger::credit_lp_position(&mut tx, lp.id, amount, amount).await?;
        ledger::set_lp_position_values(&mut tx, lp.id, lp.current_value + amount, 0).await?;

        let receipt = LpReceipt {
            market_id,
            shares_minted: amount,
            lp_shares_total: market.total_lp_shares + amount,
            pool_after: market.shared_pool_liquidity + amount,
            balance_after: wallet.balance_usdc - amount,
        };
        let events = vec![EngineEvent::BalanceUpdate {
            user_id,
            balance_usdc: wallet.balance_usdc - amount,
        }];
        Ok((receipt, events))
    })?;

    fanout.publish_all(user_id, events);
    Ok(receipt)
}

/// Add collateral to an open market. The first provider receives shares
/// one-for-one; later providers receive shares proportional to the pool.
pub async fn add_liquidity(
    pool: &PgPool,
    fanout: &Fanout,
    user_id: Uuid,
    market_id: Uuid,
    amount: i64,
) -> Result<LpReceipt, EngineError> {
    require_positive(amount, "liquidity amount")?;

    let (receipt, events) = ledger::with_engine_tx!(pool, tx, {
        let market =
            ledger::get_market_with_lock(&mut tx, market_id, MarketExpectation::Open).await?;
        let wallet = ledger::get_wallet_with_lock(&mut tx, user_id).await?;
        if wallet.balance_usdc < amount {
            return Err(EngineError::Insufficient {
                resource: Resource::Balance,
                available: wallet.balance_usdc,
                required: amount,
            });
        }
        let lp = ledger::get_or_create_lp_position(&mut tx, user_id, market_id).await?;

        let shares_minted = if market.total_lp_shares == 0 || market.shared_pool_liquidity == 0 {
            amount
        } else {
            (amount as i128 * market.total_lp_shares as i128
                / market.shared_pool_liquidity as i128) as i64
        };
        if shares_minted <= 0 {
            return Err(EngineError::Validation(
                "liquidity amount is too small to mint a share".into(),
            ));
        }

        ledger::update_wallet_balance(&mut tx, wallet.id, -amount).await?;
        ledger::update_market_stats(&mut tx, market_id, 0, 0, 0, 0, 0, amount).await?;
        ledger::update_market_lp(&mut tx, market_id, shares_minted, 0).await?;
        ledger::credit_lp_position(&mut tx, lp.id, shares_minted, amount).await?;

        // Refresh the cached value against the post-deposit pool.
        let total_after = market.total_lp_shares + shares_minted;
        let pool_after = market.shared_pool_liquidity + amount;
        let current_value =
            ((lp.shares + shares_minted) as i128 * pool_after as i128 / total_after as i128) as i64;
        ledger::set_lp_position_values(&mut tx, lp.id, current_value, lp.claimable_value).await?;

        let receipt = LpReceipt {
            market_id,
            shares_minted,
            lp_shares_total: total_after,
            pool_after,
            balance_after: wallet.balance_usdc - amount,
        };
        let events = vec![EngineEvent::BalanceUpdate {
            user_id,
            balance_usdc: wallet.balance_usdc - amount,
        }];
        Ok((receipt, events))
    })?;

    fanout.publish_all(user_id, events);
    Ok(receipt)
}

/// Burn LP shares of a resolved market for a proportional slice of the
/// residual pool plus accrued fees.
pub async fn remove_liquidity(
    pool: &PgPool,
    fanout: &Fanout,
    user_id: Uuid,
    market_id: Uuid,
    shares: i64,
) -> Result<WithdrawReceipt, EngineError> {
    require_positive(shares, "share amount")?;

    let (receipt, events) = ledger::with_engine_tx!(pool, tx, {
        let market =
            ledger::get_market_with_lock(&mut tx, market_id, MarketExpectation::Resolved).await?;
        let lp = ledger::get_lp_position_with_lock(&mut tx, user_id, market_id)
            .await?
            .ok_or(EngineError::NotFound("lp position"))?;
        if lp.shares < shares {
            return Err(EngineError::Insufficient {
                resource: Resource::LpShares,
                available: lp.shares,
                required: shares,
            });
        }
        if market.total_lp_shares <= 0 {
            return Err(EngineError::Internal(anyhow::anyhow!(
                "resolved market has LP positions but no LP share supply"
            )));
        }
        let wallet = ledger::get_wallet_with_lock(&mut tx, user_id).await?;

        // The pool still owes every unclaimed winning share one micro-unit
        // each; only what is left after that is distributable.
        let outstanding = ledger::outstanding_redeemable(&mut tx, market_id).await?;
        let distributable = (market.shared_pool_liquidity - outstanding).max(0);

        let user_value =
            (shares as i128 * distributable as i128 / market.total_lp_shares as i128) as i64;
        let fees_paid_out = (shares as i128 * market.accumulated_lp_fees as i128
            / market.total_lp_shares as i128) as i64;
        let total_payout = user_value + fees_paid_out;

        ledger::update_market_lp(&mut tx, market_id, -shares, -fees_paid_out).await?;
        ledger::update_market_stats(&mut tx, market_id, 0, 0, 0, 0, 0, -total_payout).await?;
        ledger::credit_lp_position(&mut tx, lp.id, -shares, 0).await?;
        ledger::update_wallet_balance(&mut tx, wallet.id, total_payout).await?;

        let remaining_shares = lp.shares - shares;
        let remaining_value = (remaining_shares as i128
            * (distributable - user_value).max(0) as i128
            / (market.total_lp_shares - shares).max(1) as i128) as i64;
        ledger::set_lp_position_values(&mut tx, lp.id, remaining_value, remaining_value).await?;

        let receipt = WithdrawReceipt {
            market_id,
            shares_burned: shares,
            user_value,
            fees_paid_out,
            total_payout,
            remaining_shares,
            balance_after: wallet.balance_usdc + total_payout,
        };
        let events = vec![EngineEvent::BalanceUpdate {
            user_id,
            balance_usdc: wallet.balance_usdc + total_payout,
        }];
        Ok((receipt, events))
    })?;

    fanout.publish_all(user_id, events);
    Ok(receipt)
}
