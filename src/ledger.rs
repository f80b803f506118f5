//! Lock-ordered persistence façade.
//!
//! Canonical lock order: markets → market_options → wallets →
//! user_positions. Every pair of trade paths acquires rows in this order,
//! which is what rules out lock cycles. The helpers here are the only code
//! that issues FOR UPDATE reads or mutates ledger rows; callers compose
//! them inside a single transaction.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::EngineError;
use crate::lmsr_core::{Side, PRECISION};

pub type Tx<'a> = Transaction<'a, Postgres>;

pub(crate) const MAX_TX_ATTEMPTS: u32 = 5;
pub(crate) const BASE_RETRY_DELAY_MS: u64 = 10;
const LOCK_TIMEOUT_MS: u64 = 5_000;

/// How a market is resolved once trading ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    /// Platform admin resolution, immediate effect.
    Oracle,
    /// Designated resolver, followed by a dispute window.
    Authority,
    /// Price at expiration decides.
    Opinion,
}

impl ResolutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMode::Oracle => "oracle",
            ResolutionMode::Authority => "authority",
            ResolutionMode::Opinion => "opinion",
        }
    }

    fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "oracle" => Ok(ResolutionMode::Oracle),
            "authority" => Ok(ResolutionMode::Authority),
            "opinion" => Ok(ResolutionMode::Opinion),
            other => Err(EngineError::Internal(anyhow::anyhow!(
                "unknown resolution mode '{other}'"
            ))),
        }
    }
}

/// The side an option resolved to. Stored as 1 (YES) / 2 (NO).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WinningSide {
    Yes,
    No,
}

impl WinningSide {
    pub fn code(&self) -> i16 {
        match self {
            WinningSide::Yes => 1,
            WinningSide::No => 2,
        }
    }

    pub fn from_code(code: i16) -> Result<Self, EngineError> {
        match code {
            1 => Ok(WinningSide::Yes),
            2 => Ok(WinningSide::No),
            other => Err(EngineError::Internal(anyhow::anyhow!(
                "invalid winning side code {other}"
            ))),
        }
    }

    pub fn side(&self) -> Side {
        match self {
            WinningSide::Yes => Side::Yes,
            WinningSide::No => Side::No,
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            WinningSide::Yes => WinningSide::No,
            WinningSide::No => WinningSide::Yes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Market {
    pub id: Uuid,
    pub question: String,
    pub description: String,
    pub expires_at: DateTime<Utc>,
    pub is_binary: bool,
    pub is_initialized: bool,
    pub is_resolved: bool,
    pub liquidity_parameter: i64,
    pub shared_pool_liquidity: i64,
    pub total_volume: i64,
    pub total_open_interest: i64,
    pub creator_fees_collected: i64,
    pub lifetime_creator_fees_generated: i64,
    pub protocol_fees_collected: i64,
    pub accumulated_lp_fees: i64,
    pub total_lp_shares: i64,
    pub resolution_mode: ResolutionMode,
    pub creator_id: Uuid,
    pub resolver_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct MarketOption {
    pub id: Uuid,
    pub market_id: Uuid,
    pub label: String,
    pub yes_quantity: i64,
    pub no_quantity: i64,
    pub is_resolved: bool,
    pub winning_side: Option<WinningSide>,
    pub dispute_deadline: Option<DateTime<Utc>>,
}

impl MarketOption {
    /// Kernel-facing quantities. CHECK constraints keep these non-negative.
    pub fn quantities(&self) -> (u64, u64) {
        (self.yes_quantity.max(0) as u64, self.no_quantity.max(0) as u64)
    }
}

#[derive(Debug, Clone)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub balance_usdc: i64,
}

#[derive(Debug, Clone)]
pub struct UserPosition {
    pub id: Uuid,
    pub user_id: Uuid,
    pub option_id: Uuid,
    pub yes_shares: i64,
    pub no_shares: i64,
    pub total_yes_cost: i64,
    pub total_no_cost: i64,
    pub avg_yes_price: i64,
    pub avg_no_price: i64,
    pub realized_pnl: i64,
    pub is_claimed: bool,
}

impl UserPosition {
    pub fn shares(&self, side: Side) -> i64 {
        match side {
            Side::Yes => self.yes_shares,
            Side::No => self.no_shares,
        }
    }

    pub fn avg_price(&self, side: Side) -> i64 {
        match side {
            Side::Yes => self.avg_yes_price,
            Side::No => self.avg_no_price,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LpPosition {
    pub id: Uuid,
    pub user_id: Uuid,
    pub market_id: Uuid,
    pub shares: i64,
    pub deposited_amount: i64,
    pub current_value: i64,
    pub claimable_value: i64,
}

/// What state the caller requires the market row to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketExpectation {
    /// Initialized and not resolved: accepting trades.
    Open,
    /// Fully resolved: claims and LP withdrawal.
    Resolved,
    Any,
}

/// What state the caller requires the option row to be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionExpectation {
    /// No resolution issued or pending: accepting trades.
    Open,
    Any,
}

pub(crate) async fn set_lock_timeout(tx: &mut Tx<'_>) -> Result<(), EngineError> {
    sqlx::query(&format!("SET LOCAL lock_timeout = '{LOCK_TIMEOUT_MS}ms'"))
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

/// True for transient serialization conflicts worth an in-engine retry.
/// Lock timeouts are not retried here; they surface to the caller.
pub(crate) fn is_retryable_tx_error(error: &EngineError) -> bool {
    let EngineError::Internal(inner) = error else {
        return false;
    };
    let mut current: &dyn std::error::Error = inner.as_ref();
    loop {
        if let Some(sqlx_error) = current.downcast_ref::<sqlx::Error>() {
            if let sqlx::Error::Database(db_error) = sqlx_error {
                return matches!(db_error.code().as_deref(), Some("40001") | Some("40P01"));
            }
            return false;
        }
        match current.source() {
            Some(source) => current = source,
            None => return false,
        }
    }
}

/// Run a transaction body with the engine's lock timeout, retrying
/// serialization failures and deadlocks with exponential backoff + jitter.
/// The body evaluates to `Result<T, EngineError>`; any error aborts and
/// rolls back, so no partial state survives.
macro_rules! with_engine_tx {
    ($pool:expr, $tx_var:ident, $body:block) => {{
        let mut attempt: u32 = 1;
        loop {
            let mut $tx_var = $pool.begin().await.map_err($crate::error::EngineError::from)?;
            $crate::ledger::set_lock_timeout(&mut $tx_var).await?;

            let result: Result<_, $crate::error::EngineError> = async { $body }.await;

            match result {
                Ok(value) => {
                    $tx_var
                        .commit()
                        .await
                        .map_err($crate::error::EngineError::from)?;
                    break Ok(value);
                }
                Err(e) => {
                    $tx_var.rollback().await.ok();
                    if $crate::ledger::is_retryable_tx_error(&e)
                        && attempt < $crate::ledger::MAX_TX_ATTEMPTS
                    {
                        let jitter = rand::Rng::gen_range(&mut rand::thread_rng(), 0..10u64);
                        let delay_ms =
                            $crate::ledger::BASE_RETRY_DELAY_MS * (1 << (attempt - 1)) + jitter;
                        tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                        attempt += 1;
                        continue;
                    }
                    break Err(e);
                }
            }
        }
    }};
}
pub(crate) use with_engine_tx;

fn market_from_row(row: &PgRow) -> Result<Market, EngineError> {
    let mode: String = row.get("resolution_mode");
    Ok(Market {
        id: row.get("id"),
        question: row.get("question"),
        description: row.get("description"),
        expires_at: row.get("expires_at"),
        is_binary: row.get("is_binary"),
        is_initialized: row.get("is_initialized"),
        is_resolved: row.get("is_resolved"),
        liquidity_parameter: row.get("liquidity_parameter"),
        shared_pool_liquidity: row.get("shared_pool_liquidity"),
        total_volume: row.get("total_volume"),
        total_open_interest: row.get("total_open_interest"),
        creator_fees_collected: row.get("creator_fees_collected"),
        lifetime_creator_fees_generated: row.get("lifetime_creator_fees_generated"),
        protocol_fees_collected: row.get("protocol_fees_collected"),
        accumulated_lp_fees: row.get("accumulated_lp_fees"),
        total_lp_shares: row.get("total_lp_shares"),
        resolution_mode: ResolutionMode::parse(&mode)?,
        creator_id: row.get("creator_id"),
        resolver_id: row.get("resolver_id"),
    })
}

fn option_from_row(row: &PgRow) -> Result<MarketOption, EngineError> {
    let winning: Option<i16> = row.get("winning_side");
    Ok(MarketOption {
        id: row.get("id"),
        market_id: row.get("market_id"),
        label: row.get("label"),
        yes_quantity: row.get("yes_quantity"),
        no_quantity: row.get("no_quantity"),
        is_resolved: row.get("is_resolved"),
        winning_side: winning.map(WinningSide::from_code).transpose()?,
        dispute_deadline: row.get("dispute_deadline"),
    })
}

fn position_from_row(row: &PgRow) -> UserPosition {
    UserPosition {
        id: row.get("id"),
        user_id: row.get("user_id"),
        option_id: row.get("option_id"),
        yes_shares: row.get("yes_shares"),
        no_shares: row.get("no_shares"),
        total_yes_cost: row.get("total_yes_cost"),
        total_no_cost: row.get("total_no_cost"),
        avg_yes_price: row.get("avg_yes_price"),
        avg_no_price: row.get("avg_no_price"),
        realized_pnl: row.get("realized_pnl"),
        is_claimed: row.get("is_claimed"),
    }
}

fn lp_position_from_row(row: &PgRow) -> LpPosition {
    LpPosition {
        id: row.get("id"),
        user_id: row.get("user_id"),
        market_id: row.get("market_id"),
        shares: row.get("shares"),
        deposited_amount: row.get("deposited_amount"),
        current_value: row.get("current_value"),
        claimable_value: row.get("claimable_value"),
    }
}

pub async fn get_market_with_lock(
    tx: &mut Tx<'_>,
    market_id: Uuid,
    expectation: MarketExpectation,
) -> Result<Market, EngineError> {
    let row = sqlx::query("SELECT * FROM markets WHERE id = $1 FOR UPDATE")
        .bind(market_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(EngineError::NotFound("market"))?;

    let market = market_from_row(&row)?;
    match expectation {
        MarketExpectation::Open => {
            if !market.is_initialized {
                return Err(EngineError::Precondition("market is not initialized".into()));
            }
            if market.is_resolved {
                return Err(EngineError::Precondition("market is resolved".into()));
            }
        }
        MarketExpectation::Resolved => {
            if !market.is_resolved {
                return Err(EngineError::Precondition("market is not resolved".into()));
            }
        }
        MarketExpectation::Any => {}
    }
    Ok(market)
}

pub async fn get_option_with_lock(
    tx: &mut Tx<'_>,
    option_id: Uuid,
    market_id: Uuid,
    expectation: OptionExpectation,
) -> Result<MarketOption, EngineError> {
    let row = sqlx::query("SELECT * FROM market_options WHERE id = $1 FOR UPDATE")
        .bind(option_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(EngineError::NotFound("option"))?;

    let option = option_from_row(&row)?;
    if option.market_id != market_id {
        return Err(EngineError::Validation(
            "option does not belong to this market".into(),
        ));
    }
    if expectation == OptionExpectation::Open {
        if option.is_resolved {
            return Err(EngineError::Precondition("option is resolved".into()));
        }
        if option.winning_side.is_some() {
            return Err(EngineError::Precondition(
                "option has a pending resolution".into(),
            ));
        }
    }
    Ok(option)
}

/// Read-committed read of an option, no lock. Used by the claim path:
/// resolved options are immutable except for positions claiming against
/// them, and the claim holds the position row lock.
pub async fn get_option(tx: &mut Tx<'_>, option_id: Uuid) -> Result<MarketOption, EngineError> {
    let row = sqlx::query("SELECT * FROM market_options WHERE id = $1")
        .bind(option_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(EngineError::NotFound("option"))?;
    option_from_row(&row)
}

pub async fn get_wallet_with_lock(tx: &mut Tx<'_>, user_id: Uuid) -> Result<Wallet, EngineError> {
    let row = sqlx::query("SELECT * FROM wallets WHERE user_id = $1 FOR UPDATE")
        .bind(user_id)
        .fetch_optional(tx.as_mut())
        .await?
        .ok_or(EngineError::NotFound("wallet"))?;
    Ok(Wallet {
        id: row.get("id"),
        user_id: row.get("user_id"),
        balance_usdc: row.get("balance_usdc"),
    })
}

pub async fn get_position_with_lock(
    tx: &mut Tx<'_>,
    user_id: Uuid,
    option_id: Uuid,
) -> Result<Option<UserPosition>, EngineError> {
    let row = sqlx::query(
        "SELECT * FROM user_positions WHERE user_id = $1 AND option_id = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(option_id)
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(row.map(|r| position_from_row(&r)))
}

/// Fetch-or-create the (user, option) position row, locked.
pub async fn get_or_create_position(
    tx: &mut Tx<'_>,
    user_id: Uuid,
    option_id: Uuid,
) -> Result<UserPosition, EngineError> {
    sqlx::query(
        "INSERT INTO user_positions (id, user_id, option_id)
         VALUES ($1, $2, $3)
         ON CONFLICT (user_id, option_id) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(option_id)
    .execute(tx.as_mut())
    .await?;

    get_position_with_lock(tx, user_id, option_id)
        .await?
        .ok_or_else(|| EngineError::Internal(anyhow::anyhow!("position row vanished after upsert")))
}

pub async fn get_lp_position_with_lock(
    tx: &mut Tx<'_>,
    user_id: Uuid,
    market_id: Uuid,
) -> Result<Option<LpPosition>, EngineError> {
    let row = sqlx::query(
        "SELECT * FROM lp_positions WHERE user_id = $1 AND market_id = $2 FOR UPDATE",
    )
    .bind(user_id)
    .bind(market_id)
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(row.map(|r| lp_position_from_row(&r)))
}

pub async fn get_or_create_lp_position(
    tx: &mut Tx<'_>,
    user_id: Uuid,
    market_id: Uuid,
) -> Result<LpPosition, EngineError> {
    sqlx::query(
        "INSERT INTO lp_positions (id, user_id, market_id)
         VALUES ($1, $2, $3)
         ON CONFLICT (user_id, market_id) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(market_id)
    .execute(tx.as_mut())
    .await?;

    get_lp_position_with_lock(tx, user_id, market_id)
        .await?
        .ok_or_else(|| {
            EngineError::Internal(anyhow::anyhow!("lp position row vanished after upsert"))
        })
}

/// Apply a signed delta to a wallet. The conditional WHERE defends the
/// non-negative balance invariant even if a caller's pre-check was stale.
pub async fn update_wallet_balance(
    tx: &mut Tx<'_>,
    wallet_id: Uuid,
    delta: i64,
) -> Result<(), EngineError> {
    let rows = sqlx::query(
        "UPDATE wallets SET balance_usdc = balance_usdc + $1
         WHERE id = $2 AND balance_usdc + $1 >= 0",
    )
    .bind(delta)
    .bind(wallet_id)
    .execute(tx.as_mut())
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(EngineError::Internal(anyhow::anyhow!(
            "wallet balance update rejected (delta {delta})"
        )));
    }
    Ok(())
}

/// Apply signed deltas to an option's share inventories.
pub async fn update_option_quantities(
    tx: &mut Tx<'_>,
    option_id: Uuid,
    yes_delta: i64,
    no_delta: i64,
) -> Result<(), EngineError> {
    let rows = sqlx::query(
        "UPDATE market_options
         SET yes_quantity = yes_quantity + $1,
             no_quantity = no_quantity + $2
         WHERE id = $3
           AND yes_quantity + $1 >= 0
           AND no_quantity + $2 >= 0",
    )
    .bind(yes_delta)
    .bind(no_delta)
    .bind(option_id)
    .execute(tx.as_mut())
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(EngineError::Internal(anyhow::anyhow!(
            "option inventory update rejected"
        )));
    }
    Ok(())
}

/// Roll a trade's aggregate effects into the market row. Pool liquidity
/// and open interest saturate at zero rather than going negative.
#[allow(clippy::too_many_arguments)]
pub async fn update_market_stats(
    tx: &mut Tx<'_>,
    market_id: Uuid,
    volume_delta: i64,
    open_interest_delta: i64,
    creator_fee: i64,
    protocol_fee: i64,
    lp_fee: i64,
    pool_delta: i64,
) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE markets SET
            total_volume = total_volume + $1,
            total_open_interest = GREATEST(0, total_open_interest + $2),
            creator_fees_collected = creator_fees_collected + $3,
            lifetime_creator_fees_generated = lifetime_creator_fees_generated + $3,
            protocol_fees_collected = protocol_fees_collected + $4,
            accumulated_lp_fees = accumulated_lp_fees + $5,
            shared_pool_liquidity = GREATEST(0, shared_pool_liquidity + $6)
         WHERE id = $7",
    )
    .bind(volume_delta)
    .bind(open_interest_delta)
    .bind(creator_fee)
    .bind(protocol_fee)
    .bind(lp_fee)
    .bind(pool_delta)
    .bind(market_id)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// LP accounting deltas on the market row, saturating at zero.
pub async fn update_market_lp(
    tx: &mut Tx<'_>,
    market_id: Uuid,
    lp_shares_delta: i64,
    lp_fees_delta: i64,
) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE markets SET
            total_lp_shares = GREATEST(0, total_lp_shares + $1),
            accumulated_lp_fees = GREATEST(0, accumulated_lp_fees + $2)
         WHERE id = $3",
    )
    .bind(lp_shares_delta)
    .bind(lp_fees_delta)
    .bind(market_id)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub async fn mark_market_initialized(tx: &mut Tx<'_>, market_id: Uuid) -> Result<(), EngineError> {
    sqlx::query("UPDATE markets SET is_initialized = TRUE WHERE id = $1")
        .bind(market_id)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

pub async fn mark_market_resolved(tx: &mut Tx<'_>, market_id: Uuid) -> Result<(), EngineError> {
    sqlx::query("UPDATE markets SET is_resolved = TRUE WHERE id = $1")
        .bind(market_id)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

/// The process-wide protocol-fee accumulator lives on the moodring row.
/// Every contributing trade already holds its market row lock, which is
/// the serializer for this increment.
pub async fn add_lifetime_protocol_fees(tx: &mut Tx<'_>, amount: i64) -> Result<(), EngineError> {
    sqlx::query("UPDATE moodring SET lifetime_protocol_fees = lifetime_protocol_fees + $1")
        .bind(amount)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

/// Apply a share/cost delta to one side of a position. The average price
/// is recomputed from the new totals (PRECISION-scaled per share, floored).
pub async fn update_position_shares(
    tx: &mut Tx<'_>,
    position_id: Uuid,
    side: Side,
    share_delta: i64,
    cost_delta: i64,
) -> Result<(), EngineError> {
    let sql = match side {
        Side::Yes => {
            "UPDATE user_positions SET
                yes_shares = yes_shares + $1,
                total_yes_cost = total_yes_cost + $2,
                avg_yes_price = CASE WHEN yes_shares + $1 > 0
                    THEN FLOOR(((total_yes_cost + $2)::NUMERIC * $3) / (yes_shares + $1))::BIGINT
                    ELSE 0 END
             WHERE id = $4
               AND yes_shares + $1 >= 0
               AND total_yes_cost + $2 >= 0"
        }
        Side::No => {
            "UPDATE user_positions SET
                no_shares = no_shares + $1,
                total_no_cost = total_no_cost + $2,
                avg_no_price = CASE WHEN no_shares + $1 > 0
                    THEN FLOOR(((total_no_cost + $2)::NUMERIC * $3) / (no_shares + $1))::BIGINT
                    ELSE 0 END
             WHERE id = $4
               AND no_shares + $1 >= 0
               AND total_no_cost + $2 >= 0"
        }
    };

    let rows = sqlx::query(sql)
        .bind(share_delta)
        .bind(cost_delta)
        .bind(PRECISION as i64)
        .bind(position_id)
        .execute(tx.as_mut())
        .await?
        .rows_affected();

    if rows == 0 {
        return Err(EngineError::Internal(anyhow::anyhow!(
            "position share update rejected"
        )));
    }
    Ok(())
}

pub async fn apply_realized_pnl(
    tx: &mut Tx<'_>,
    position_id: Uuid,
    pnl_delta: i64,
) -> Result<(), EngineError> {
    sqlx::query("UPDATE user_positions SET realized_pnl = realized_pnl + $1 WHERE id = $2")
        .bind(pnl_delta)
        .bind(position_id)
        .execute(tx.as_mut())
        .await?;
    Ok(())
}

/// Terminal claim settlement: zero the shares and cost basis, book the
/// PnL, and mark the row claimed.
pub async fn settle_position_claim(
    tx: &mut Tx<'_>,
    position_id: Uuid,
    pnl_delta: i64,
) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE user_positions SET
            yes_shares = 0,
            no_shares = 0,
            total_yes_cost = 0,
            total_no_cost = 0,
            avg_yes_price = 0,
            avg_no_price = 0,
            realized_pnl = realized_pnl + $1,
            is_claimed = TRUE
         WHERE id = $2",
    )
    .bind(pnl_delta)
    .bind(position_id)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

pub async fn credit_lp_position(
    tx: &mut Tx<'_>,
    lp_position_id: Uuid,
    share_delta: i64,
    deposit_delta: i64,
) -> Result<(), EngineError> {
    let rows = sqlx::query(
        "UPDATE lp_positions SET
            shares = shares + $1,
            deposited_amount = deposited_amount + $2
         WHERE id = $3 AND shares + $1 >= 0",
    )
    .bind(share_delta)
    .bind(deposit_delta)
    .bind(lp_position_id)
    .execute(tx.as_mut())
    .await?
    .rows_affected();

    if rows == 0 {
        return Err(EngineError::Internal(anyhow::anyhow!(
            "lp position update rejected"
        )));
    }
    Ok(())
}

pub async fn set_lp_position_values(
    tx: &mut Tx<'_>,
    lp_position_id: Uuid,
    current_value: i64,
    claimable_value: i64,
) -> Result<(), EngineError> {
    sqlx::query(
        "UPDATE lp_positions SET current_value = $1, claimable_value = $2 WHERE id = $3",
    )
    .bind(current_value)
    .bind(claimable_value)
    .bind(lp_position_id)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// Append-only trade record; audit and circuit-breaker input.
#[allow(clippy::too_many_arguments)]
pub async fn insert_trade(
    tx: &mut Tx<'_>,
    user_id: Uuid,
    market_id: Uuid,
    option_id: Uuid,
    side: Side,
    quantity: i64,
    total_cost: i64,
    fees: i64,
) -> Result<Uuid, EngineError> {
    let trade_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO trades (id, user_id, market_id, option_id, side, quantity, total_cost, fees)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
    )
    .bind(trade_id)
    .bind(user_id)
    .bind(market_id)
    .bind(option_id)
    .bind(side.as_str())
    .bind(quantity)
    .bind(total_cost)
    .bind(fees)
    .execute(tx.as_mut())
    .await?;
    Ok(trade_id)
}

/// One price sample per trade, feeding the chart read surface.
pub async fn insert_price_point(
    tx: &mut Tx<'_>,
    option_id: Uuid,
    yes_price: i64,
    no_price: i64,
) -> Result<(), EngineError> {
    sqlx::query(
        "INSERT INTO price_history (option_id, yes_price, no_price) VALUES ($1, $2, $3)",
    )
    .bind(option_id)
    .bind(yes_price)
    .bind(no_price)
    .execute(tx.as_mut())
    .await?;
    Ok(())
}

/// Sum of a user's cost basis across all options of one market.
pub async fn user_market_exposure(
    tx: &mut Tx<'_>,
    user_id: Uuid,
    market_id: Uuid,
) -> Result<i64, EngineError> {
    let exposure: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(p.total_yes_cost + p.total_no_cost), 0)::BIGINT
         FROM user_positions p
         JOIN market_options o ON o.id = p.option_id
         WHERE p.user_id = $1 AND o.market_id = $2",
    )
    .bind(user_id)
    .bind(market_id)
    .fetch_one(tx.as_mut())
    .await?;
    Ok(exposure)
}

/// Unclaimed winning-side shares across every position of a resolved
/// market. These are liabilities the pool still owes.
pub async fn outstanding_redeemable(
    tx: &mut Tx<'_>,
    market_id: Uuid,
) -> Result<i64, EngineError> {
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
    .fetch_one(tx.as_mut())
    .await?;
    Ok(outstanding)
}

pub async fn unresolved_option_count(
    tx: &mut Tx<'_>,
    market_id: Uuid,
) -> Result<i64, EngineError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM market_options WHERE market_id = $1 AND NOT is_resolved",
    )
    .bind(market_id)
    .fetch_one(tx.as_mut())
    .await?;
    Ok(count)
}
