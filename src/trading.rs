//! Trade engine: buy, sell, and claim.
//!
//! Each operation is a single database transaction. Rows are locked in
//! the canonical order (market → option → wallet → position), the kernel
//! prices the trade, the fee calculator splits it, the risk controller
//! logs what it sees, and the mutations commit atomically. Events go out
//! only after the commit.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{EngineError, Resource};
use crate::fanout::{EngineEvent, Fanout};
use crate::fees::{calculate_fees, FeeBreakdown, MoodringConfig};
use crate::ledger::{self, MarketExpectation, OptionExpectation};
use crate::lmsr_core::{self, Side, PRECISION};
use crate::risk::{self, RiskContext};

/// Floor on the pre-fee cost of a buy: 0.01 units. Prevents zero-cost
/// dust trades when the kernel quote rounds to nothing.
const MIN_RAW_COST: i64 = (PRECISION / 100) as i64;

#[derive(Debug, Clone)]
pub struct BuyRequest {
    pub user_id: Uuid,
    pub market_id: Uuid,
    pub option_id: Uuid,
    pub yes_quantity: i64,
    pub no_quantity: i64,
    /// With `slippage_bps`: the expected total; alone: a hard ceiling.
    pub max_cost: Option<i64>,
    pub slippage_bps: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TradeResult {
    pub trade_id: Uuid,
    pub option_id: Uuid,
    pub side: Side,
    pub quantity: i64,
    pub raw_cost: i64,
    pub fees: FeeBreakdown,
    pub total_cost: i64,
    pub yes_price: i64,
    pub no_price: i64,
    pub balance_after: i64,
}

#[derive(Debug, Clone)]
pub struct SellRequest {
    pub user_id: Uuid,
    pub market_id: Uuid,
    pub option_id: Uuid,
    pub yes_quantity: i64,
    pub no_quantity: i64,
    /// With `slippage_bps`: the expected payout; alone: a hard floor.
    pub min_payout: Option<i64>,
    pub slippage_bps: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SellTradeResult {
    pub trade_id: Uuid,
    pub option_id: Uuid,
    pub side: Side,
    pub quantity: i64,
    pub raw_payout: i64,
    pub fees: FeeBreakdown,
    pub net_payout: i64,
    pub realized_pnl: i64,
    pub yes_price: i64,
    pub no_price: i64,
    pub balance_after: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ClaimResult {
    pub option_id: Uuid,
    pub payout: i64,
    pub realized_pnl: i64,
    pub balance_after: i64,
}

fn validate_quantities(yes: i64, no: i64) -> Result<(Side, i64), EngineError> {
    if yes < 0 || no < 0 {
        return Err(EngineError::Validation(
            "share quantities must be non-negative".into(),
        ));
    }
    match (yes > 0, no > 0) {
        (true, false) => Ok((Side::Yes, yes)),
        (false, true) => Ok((Side::No, no)),
        (false, false) => Err(EngineError::Validation("zero-quantity trade".into())),
        (true, true) => Err(EngineError::Validation(
            "a trade moves exactly one side".into(),
        )),
    }
}

fn validate_slippage(slippage_bps: Option<i64>) -> Result<(), EngineError> {
    if let Some(bps) = slippage_bps {
        if !(0..=10_000).contains(&bps) {
            return Err(EngineError::Validation(
                "slippage_bps must be between 0 and 10000".into(),
            ));
        }
    }
    Ok(())
}

fn enforce_trade_limits(
    config: &MoodringConfig,
    total_amount: i64,
    position_after: i64,
    exposure_after: i64,
) -> Result<(), EngineError> {
    if total_amount < config.min_trade_amount {
        return Err(EngineError::LimitExceeded(format!(
            "trade of {total_amount} is below the minimum of {}",
            config.min_trade_amount
        )));
    }
    if total_amount > config.max_trade_amount {
        return Err(EngineError::LimitExceeded(format!(
            "trade of {total_amount} exceeds the maximum of {}",
            config.max_trade_amount
        )));
    }
    if position_after > config.max_option_position {
        return Err(EngineError::LimitExceeded(format!(
            "position of {position_after} shares exceeds the per-option ceiling of {}",
            config.max_option_position
        )));
    }
    if exposure_after > config.max_market_exposure {
        return Err(EngineError::LimitExceeded(format!(
            "market exposure of {exposure_after} exceeds the ceiling of {}",
            config.max_market_exposure
        )));
    }
    Ok(())
}

pub async fn buy(
    pool: &PgPool,
    fanout: &Fanout,
    request: BuyRequest,
) -> Result<TradeResult, EngineError> {
    let (side, quantity) = validate_quantities(request.yes_quantity, request.no_quantity)?;
    validate_slippage(request.slippage_bps)?;

    let (result, events) = ledger::with_engine_tx!(pool, tx, {
        buy_transaction(&mut tx, &request, side, quantity).await
    })?;

    fanout.publish_all(request.user_id, events);
    Ok(result)
}

async fn buy_transaction(
    tx: &mut ledger::Tx<'_>,
    request: &BuyRequest,
    side: Side,
    quantity: i64,
) -> Result<(TradeResult, Vec<EngineEvent>), EngineError> {
    let config = MoodringConfig::load(tx).await?;
    if config.trading_paused {
        return Err(EngineError::Precondition("trading is paused".into()));
    }

    let market = ledger::get_market_with_lock(tx, request.market_id, MarketExpectation::Open).await?;
    if chrono::Utc::now() >= market.expires_at {
        return Err(EngineError::Precondition("market has expired".into()));
    }
    let option =
        ledger::get_option_with_lock(tx, request.option_id, request.market_id, OptionExpectation::Open)
            .await?;
    let wallet = ledger::get_wallet_with_lock(tx, request.user_id).await?;
    let position = ledger::get_or_create_position(tx, request.user_id, request.option_id).await?;

    let b = market.liquidity_parameter.max(0) as u64;
    let (yes, no) = option.quantities();
    let delta_yes = request.yes_quantity as u64;
    let delta_no = request.no_quantity as u64;

    let price_before = lmsr_core::calculate_yes_price(yes, no, b)? as i64;
    let quoted_cost = lmsr_core::calculate_buy_cost(yes, no, delta_yes, delta_no, b)? as i64;
    let raw_cost = quoted_cost.max(MIN_RAW_COST);
    let price_after =
        lmsr_core::calculate_yes_price(yes + delta_yes, no + delta_no, b)? as i64;

    let fees = calculate_fees(raw_cost, &config);
    let total_cost = raw_cost + fees.total_fee;

    let exposure = ledger::user_market_exposure(tx, request.user_id, request.market_id).await?;
    enforce_trade_limits(
        &config,
        total_cost,
        position.shares(side) + quantity,
        exposure + raw_cost,
    )?;

    let risk_ctx = RiskContext {
        user_id: request.user_id,
        market_id: request.market_id,
        option_id: request.option_id,
        side,
        trade_size: quantity,
        total_amount: total_cost,
        inventory_before: (yes + no) as i64,
        price_before,
        price_after,
    };
    let report = risk::evaluate_trade(tx, &config, &risk_ctx).await;
    if !report.passed {
        return Err(EngineError::RiskRejected);
    }

    if let Some(max_cost) = request.max_cost {
        let ceiling = match request.slippage_bps {
            Some(bps) => max_cost + (max_cost as i128 * bps as i128 / 10_000) as i64,
            None => max_cost,
        };
        if total_cost > ceiling {
            return Err(EngineError::SlippageExceeded {
                expected: ceiling,
                actual: total_cost,
            });
        }
    }

    if wallet.balance_usdc < total_cost {
        return Err(EngineError::Insufficient {
            resource: Resource::Balance,
            available: wallet.balance_usdc,
            required: total_cost,
        });
    }

    ledger::update_wallet_balance(tx, wallet.id, -total_cost).await?;
    ledger::update_option_quantities(tx, option.id, request.yes_quantity, request.no_quantity)
        .await?;
    ledger::update_market_stats(
        tx,
        market.id,
        total_cost,
        quantity,
        fees.creator_fee,
        fees.protocol_fee,
        fees.lp_fee,
        raw_cost,
    )
    .await?;
    // Cost basis is the pre-fee amount; fees are immediate PnL, not
    // invested capital.
    ledger::update_position_shares(tx, position.id, side, quantity, raw_cost).await?;
    ledger::add_lifetime_protocol_fees(tx, fees.protocol_fee).await?;

    let trade_id = ledger::insert_trade(
        tx,
        request.user_id,
        market.id,
        option.id,
        side,
        quantity,
        total_cost,
        fees.total_fee,
    )
    .await?;
    ledger::insert_price_point(tx, option.id, price_after, PRECISION as i64 - price_after).await?;

    let (yes_after, no_after) = (
        option.yes_quantity + request.yes_quantity,
        option.no_quantity + request.no_quantity,
    );
    let events = vec![
        EngineEvent::PriceUpdate {
            option_id: option.id,
            yes_price: price_after,
            no_price: PRECISION as i64 - price_after,
            yes_quantity: yes_after,
            no_quantity: no_after,
        },
        EngineEvent::TradeCreated {
            trade_id,
            market_id: market.id,
            option_id: option.id,
            user_id: request.user_id,
            side,
            quantity,
            total_cost,
        },
        EngineEvent::PositionUpdate {
            user_id: request.user_id,
            option_id: option.id,
            yes_shares: position.yes_shares + request.yes_quantity,
            no_shares: position.no_shares + request.no_quantity,
            realized_pnl: position.realized_pnl,
        },
        EngineEvent::BalanceUpdate {
            user_id: request.user_id,
            balance_usdc: wallet.balance_usdc - total_cost,
        },
    ];

    let result = TradeResult {
        trade_id,
        option_id: option.id,
        side,
        quantity,
        raw_cost,
        fees,
        total_cost,
        yes_price: price_after,
        no_price: PRECISION as i64 - price_after,
        balance_after: wallet.balance_usdc - total_cost,
    };
    Ok((result, events))
}

pub async fn sell(
    pool: &PgPool,
    fanout: &Fanout,
    request: SellRequest,
) -> Result<SellTradeResult, EngineError> {
    let (side, quantity) = validate_quantities(request.yes_quantity, request.no_quantity)?;
    validate_slippage(request.slippage_bps)?;

    let (result, events) = ledger::with_engine_tx!(pool, tx, {
        sell_transaction(&mut tx, &request, side, quantity).await
    })?;

    fanout.publish_all(request.user_id, events);
    Ok(result)
}

async fn sell_transaction(
    tx: &mut ledger::Tx<'_>,
    request: &SellRequest,
    side: Side,
    quantity: i64,
) -> Result<(SellTradeResult, Vec<EngineEvent>), EngineError> {
    let config = MoodringConfig::load(tx).await?;
    if config.trading_paused {
        return Err(EngineError::Precondition("trading is paused".into()));
    }

    let market = ledger::get_market_with_lock(tx, request.market_id, MarketExpectation::Open).await?;
    if chrono::Utc::now() >= market.expires_at {
        return Err(EngineError::Precondition("market has expired".into()));
    }
    let option =
        ledger::get_option_with_lock(tx, request.option_id, request.market_id, OptionExpectation::Open)
            .await?;
    let wallet = ledger::get_wallet_with_lock(tx, request.user_id).await?;
    let position = ledger::get_position_with_lock(tx, request.user_id, request.option_id)
        .await?
        .ok_or(EngineError::Insufficient {
            resource: Resource::Shares,
            available: 0,
            required: quantity,
        })?;

    let held = position.shares(side);
    if held < quantity {
        return Err(EngineError::Insufficient {
            resource: Resource::Shares,
            available: held,
            required: quantity,
        });
    }

    let b = market.liquidity_parameter.max(0) as u64;
    let (yes, no) = option.quantities();
    let delta_yes = request.yes_quantity as u64;
    let delta_no = request.no_quantity as u64;

    let price_before = lmsr_core::calculate_yes_price(yes, no, b)? as i64;
    let raw_payout =
        lmsr_core::calculate_sell_payout(yes, no, delta_yes, delta_no, b)? as i64;
    let price_after =
        lmsr_core::calculate_yes_price(yes - delta_yes, no - delta_no, b)? as i64;

    let fees = calculate_fees(raw_payout, &config);
    let net_payout = fees.net_amount;

    // Exit PnL against the side's average entry price; entry fees were
    // booked as PnL at entry and stay out of the basis.
    let basis_removed =
        (quantity as i128 * position.avg_price(side) as i128 / PRECISION as i128) as i64;
    let realized_pnl = net_payout - basis_removed;

    let exposure = ledger::user_market_exposure(tx, request.user_id, request.market_id).await?;
    enforce_trade_limits(
        &config,
        raw_payout,
        held - quantity,
        (exposure - basis_removed).max(0),
    )?;

    let risk_ctx = RiskContext {
        user_id: request.user_id,
        market_id: request.market_id,
        option_id: request.option_id,
        side,
        trade_size: quantity,
        total_amount: raw_payout,
        inventory_before: (yes + no) as i64,
        price_before,
        price_after,
    };
    let report = risk::evaluate_trade(tx, &config, &risk_ctx).await;
    if !report.passed {
        return Err(EngineError::RiskRejected);
    }

    if let Some(min_payout) = request.min_payout {
        let floor = match request.slippage_bps {
            Some(bps) => min_payout - (min_payout as i128 * bps as i128 / 10_000) as i64,
            None => min_payout,
        };
        if net_payout < floor {
            return Err(EngineError::SlippageExceeded {
                expected: floor,
                actual: net_payout,
            });
        }
    }

    if market.shared_pool_liquidity < raw_payout {
        return Err(EngineError::Insufficient {
            resource: Resource::PoolLiquidity,
            available: market.shared_pool_liquidity,
            required: raw_payout,
        });
    }

    ledger::update_wallet_balance(tx, wallet.id, net_payout).await?;
    ledger::update_option_quantities(tx, option.id, -request.yes_quantity, -request.no_quantity)
        .await?;
    ledger::update_market_stats(
        tx,
        market.id,
        raw_payout,
        -quantity,
        fees.creator_fee,
        fees.protocol_fee,
        fees.lp_fee,
        -raw_payout,
    )
    .await?;
    ledger::update_position_shares(tx, position.id, side, -quantity, -basis_removed).await?;
    ledger::apply_realized_pnl(tx, position.id, realized_pnl).await?;
    ledger::add_lifetime_protocol_fees(tx, fees.protocol_fee).await?;

    let trade_id = ledger::insert_trade(
        tx,
        request.user_id,
        market.id,
        option.id,
        side,
        quantity,
        raw_payout,
        fees.total_fee,
    )
    .await?;
    ledger::insert_price_point(tx, option.id, price_after, PRECISION as i64 - price_after).await?;

    let events = vec![
        EngineEvent::PriceUpdate {
            option_id: option.id,
            yes_price: price_after,
            no_price: PRECISION as i64 - price_after,
            yes_quantity: option.yes_quantity - request.yes_quantity,
            no_quantity: option.no_quantity - request.no_quantity,
        },
        EngineEvent::TradeCreated {
            trade_id,
            market_id: market.id,
            option_id: option.id,
            user_id: request.user_id,
            side,
            quantity,
            total_cost: raw_payout,
        },
        EngineEvent::PositionUpdate {
            user_id: request.user_id,
            option_id: option.id,
            yes_shares: position.yes_shares - request.yes_quantity,
            no_shares: position.no_shares - request.no_quantity,
            realized_pnl: position.realized_pnl + realized_pnl,
        },
        EngineEvent::BalanceUpdate {
            user_id: request.user_id,
            balance_usdc: wallet.balance_usdc + net_payout,
        },
    ];

    let result = SellTradeResult {
        trade_id,
        option_id: option.id,
        side,
        quantity,
        raw_payout,
        fees,
        net_payout,
        realized_pnl,
        yes_price: price_after,
        no_price: PRECISION as i64 - price_after,
        balance_after: wallet.balance_usdc + net_payout,
    };
    Ok((result, events))
}

pub async fn claim(
    pool: &PgPool,
    fanout: &Fanout,
    user_id: Uuid,
    market_id: Uuid,
    option_id: Uuid,
) -> Result<ClaimResult, EngineError> {
    let (result, events) = ledger::with_engine_tx!(pool, tx, {
        claim_transaction(&mut tx, user_id, market_id, option_id).await
    })?;

    fanout.publish_all(user_id, events);
    Ok(result)
}

async fn claim_transaction(
    tx: &mut ledger::Tx<'_>,
    user_id: Uuid,
    market_id: Uuid,
    option_id: Uuid,
) -> Result<(ClaimResult, Vec<EngineEvent>), EngineError> {
    // Resolved options are immutable, so a plain read suffices; the
    // position row lock below serializes competing claims.
    let option = ledger::get_option(tx, option_id).await?;
    if option.market_id != market_id {
        return Err(EngineError::Validation(
            "option does not belong to this market".into(),
        ));
    }
    let winning_side = match (option.is_resolved, option.winning_side) {
        (true, Some(side)) => side,
        _ => return Err(EngineError::Precondition("option is not resolved".into())),
    };

    let position = ledger::get_position_with_lock(tx, user_id, option_id)
        .await?
        .ok_or_else(|| EngineError::Precondition("no winning shares to claim".into()))?;
    if position.is_claimed {
        return Err(EngineError::Conflict("winnings already claimed".into()));
    }

    let winning_shares = position.shares(winning_side.side());
    if winning_shares <= 0 {
        return Err(EngineError::Precondition("no winning shares to claim".into()));
    }

    let market = ledger::get_market_with_lock(tx, market_id, MarketExpectation::Any).await?;
    let wallet = ledger::get_wallet_with_lock(tx, user_id).await?;

    // One micro-winning-share pays one micro-unit.
    let payout = winning_shares;
    if market.shared_pool_liquidity < payout {
        return Err(EngineError::Insufficient {
            resource: Resource::PoolLiquidity,
            available: market.shared_pool_liquidity,
            required: payout,
        });
    }

    // The losing side's cost is written off into PnL here.
    let realized_pnl = payout - (position.total_yes_cost + position.total_no_cost);

    ledger::update_market_stats(tx, market.id, 0, 0, 0, 0, 0, -payout).await?;
    ledger::update_wallet_balance(tx, wallet.id, payout).await?;
    ledger::settle_position_claim(tx, position.id, realized_pnl).await?;

    let events = vec![
        EngineEvent::PositionUpdate {
            user_id,
            option_id,
            yes_shares: 0,
            no_shares: 0,
            realized_pnl: position.realized_pnl + realized_pnl,
        },
        EngineEvent::BalanceUpdate {
            user_id,
            balance_usdc: wallet.balance_usdc + payout,
        },
    ];

    let result = ClaimResult {
        option_id,
        payout,
        realized_pnl,
        balance_after: wallet.balance_usdc + payout,
    };
    Ok((result, events))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_validation_accepts_exactly_one_side() {
        assert_eq!(validate_quantities(100, 0).unwrap(), (Side::Yes, 100));
        assert_eq!(validate_quantities(0, 250).unwrap(), (Side::No, 250));
        assert!(matches!(
            validate_quantities(0, 0),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_quantities(10, 10),
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            validate_quantities(-1, 0),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn slippage_bps_must_be_a_fraction() {
        assert!(validate_slippage(None).is_ok());
        assert!(validate_slippage(Some(0)).is_ok());
        assert!(validate_slippage(Some(10_000)).is_ok());
        assert!(validate_slippage(Some(-1)).is_err());
        assert!(validate_slippage(Some(10_001)).is_err());
    }

    #[test]
    fn trade_limits_bound_both_ends() {
        let config = MoodringConfig::default();
        assert!(enforce_trade_limits(&config, 9_999, 0, 0).is_err());
        assert!(enforce_trade_limits(&config, 10_000, 0, 0).is_ok());
        assert!(enforce_trade_limits(&config, config.max_trade_amount + 1, 0, 0).is_err());
        assert!(
            enforce_trade_limits(&config, 10_000, config.max_option_position + 1, 0).is_err()
        );
        assert!(
            enforce_trade_limits(&config, 10_000, 0, config.max_market_exposure + 1).is_err()
        );
    }
}
