//! Pool construction and schema bootstrap.
//!
//! The schema lives here as idempotent DDL so the service and the test
//! harness bring up identical tables. All monetary and share columns are
//! BIGINT micro-units with non-negative CHECK constraints.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Create every table and index the engine uses. Safe to run repeatedly.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS markets (
            id UUID PRIMARY KEY,
            question TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            expires_at TIMESTAMP WITH TIME ZONE NOT NULL,
            is_binary BOOLEAN NOT NULL DEFAULT TRUE,
            is_initialized BOOLEAN NOT NULL DEFAULT FALSE,
            is_resolved BOOLEAN NOT NULL DEFAULT FALSE,
            liquidity_parameter BIGINT NOT NULL,
            shared_pool_liquidity BIGINT NOT NULL DEFAULT 0,
            total_volume BIGINT NOT NULL DEFAULT 0,
            total_open_interest BIGINT NOT NULL DEFAULT 0,
            creator_fees_collected BIGINT NOT NULL DEFAULT 0,
            lifetime_creator_fees_generated BIGINT NOT NULL DEFAULT 0,
            protocol_fees_collected BIGINT NOT NULL DEFAULT 0,
            accumulated_lp_fees BIGINT NOT NULL DEFAULT 0,
            total_lp_shares BIGINT NOT NULL DEFAULT 0,
            resolution_mode TEXT NOT NULL DEFAULT 'oracle',
            creator_id UUID NOT NULL,
            resolver_id UUID,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
            CONSTRAINT markets_pool_non_negative CHECK (shared_pool_liquidity >= 0),
            CONSTRAINT markets_oi_non_negative CHECK (total_open_interest >= 0),
            CONSTRAINT markets_liquidity_positive CHECK (liquidity_parameter > 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS market_options (
            id UUID PRIMARY KEY,
            market_id UUID NOT NULL REFERENCES markets(id) ON DELETE CASCADE,
            label TEXT NOT NULL DEFAULT '',
            yes_quantity BIGINT NOT NULL DEFAULT 0,
            no_quantity BIGINT NOT NULL DEFAULT 0,
            is_resolved BOOLEAN NOT NULL DEFAULT FALSE,
            winning_side SMALLINT,
            dispute_deadline TIMESTAMP WITH TIME ZONE,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
            CONSTRAINT options_yes_non_negative CHECK (yes_quantity >= 0),
            CONSTRAINT options_no_non_negative CHECK (no_quantity >= 0),
            CONSTRAINT options_winning_side_valid CHECK (winning_side IN (1, 2))
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wallets (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL UNIQUE,
            balance_usdc BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
            CONSTRAINT wallets_balance_non_negative CHECK (balance_usdc >= 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS user_positions (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            option_id UUID NOT NULL REFERENCES market_options(id) ON DELETE CASCADE,
            yes_shares BIGINT NOT NULL DEFAULT 0,
            no_shares BIGINT NOT NULL DEFAULT 0,
            total_yes_cost BIGINT NOT NULL DEFAULT 0,
            total_no_cost BIGINT NOT NULL DEFAULT 0,
            avg_yes_price BIGINT NOT NULL DEFAULT 0,
            avg_no_price BIGINT NOT NULL DEFAULT 0,
            realized_pnl BIGINT NOT NULL DEFAULT 0,
            is_claimed BOOLEAN NOT NULL DEFAULT FALSE,
            CONSTRAINT positions_yes_non_negative CHECK (yes_shares >= 0),
            CONSTRAINT positions_no_non_negative CHECK (no_shares >= 0),
            CONSTRAINT positions_user_option_unique UNIQUE (user_id, option_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS lp_positions (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            market_id UUID NOT NULL REFERENCES markets(id) ON DELETE CASCADE,
            shares BIGINT NOT NULL DEFAULT 0,
            deposited_amount BIGINT NOT NULL DEFAULT 0,
            current_value BIGINT NOT NULL DEFAULT 0,
            claimable_value BIGINT NOT NULL DEFAULT 0,
            CONSTRAINT lp_shares_non_negative CHECK (shares >= 0),
            CONSTRAINT lp_user_market_unique UNIQUE (user_id, market_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            market_id UUID NOT NULL,
            option_id UUID NOT NULL,
            side TEXT NOT NULL,
            quantity BIGINT NOT NULL,
            total_cost BIGINT NOT NULL,
            fees BIGINT NOT NULL,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS trades_market_created_idx
         ON trades (market_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS suspicious_trades (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL,
            market_id UUID NOT NULL,
            option_id UUID NOT NULL,
            side TEXT NOT NULL,
            quantity BIGINT NOT NULL,
            total_amount BIGINT NOT NULL,
            detection_reason TEXT NOT NULL,
            detection_metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            risk_score INTEGER NOT NULL,
            automated_action_taken TEXT NOT NULL DEFAULT 'logged',
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS price_history (
            id BIGSERIAL PRIMARY KEY,
            option_id UUID NOT NULL,
            yes_price BIGINT NOT NULL,
            no_price BIGINT NOT NULL,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS price_history_option_created_idx
         ON price_history (option_id, created_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS comments (
            id UUID PRIMARY KEY,
            market_id UUID NOT NULL REFERENCES markets(id) ON DELETE CASCADE,
            parent_id UUID REFERENCES comments(id) ON DELETE CASCADE,
            author_id UUID NOT NULL,
            content TEXT NOT NULL,
            upvotes INTEGER NOT NULL DEFAULT 0,
            downvotes INTEGER NOT NULL DEFAULT 0,
            reply_count INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS comment_votes (
            user_id UUID NOT NULL,
            comment_id UUID NOT NULL REFERENCES comments(id) ON DELETE CASCADE,
            direction SMALLINT NOT NULL,
            PRIMARY KEY (user_id, comment_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS disputes (
            id UUID PRIMARY KEY,
            option_id UUID NOT NULL REFERENCES market_options(id) ON DELETE CASCADE,
            disputer_id UUID NOT NULL,
            bond BIGINT NOT NULL,
            status TEXT NOT NULL DEFAULT 'open',
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
            reviewed_at TIMESTAMP WITH TIME ZONE,
            CONSTRAINT disputes_bond_positive CHECK (bond > 0)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS moodring (
            singleton BOOLEAN PRIMARY KEY DEFAULT TRUE,
            protocol_fee_bps BIGINT NOT NULL DEFAULT 200,
            creator_fee_bps BIGINT NOT NULL DEFAULT 100,
            lp_fee_bps BIGINT NOT NULL DEFAULT 200,
            suspicious_trade_threshold BIGINT NOT NULL DEFAULT 1000000000,
            circuit_breaker_threshold BIGINT NOT NULL DEFAULT 10000000000,
            max_market_volatility_bps BIGINT NOT NULL DEFAULT 500,
            min_trade_amount BIGINT NOT NULL DEFAULT 10000,
            max_trade_amount BIGINT NOT NULL DEFAULT 100000000000,
            max_option_position BIGINT NOT NULL DEFAULT 1000000000000,
            max_market_exposure BIGINT NOT NULL DEFAULT 1000000000000,
            trading_paused BOOLEAN NOT NULL DEFAULT FALSE,
            lifetime_protocol_fees BIGINT NOT NULL DEFAULT 0,
            CONSTRAINT moodring_single_row CHECK (singleton)
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("INSERT INTO moodring (singleton) VALUES (TRUE) ON CONFLICT DO NOTHING")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create a user's wallet if it does not exist yet. Used by the deposit
/// path of the outer platform and by the test harness.
pub async fn ensure_wallet(pool: &PgPool, user_id: Uuid, initial_balance: i64) -> Result<Uuid> {
    let wallet_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO wallets (id, user_id, balance_usdc)
         VALUES ($1, $2, $3)
         ON CONFLICT (user_id) DO NOTHING",
    )
    .bind(wallet_id)
    .bind(user_id)
    .bind(initial_balance)
    .execute(pool)
    .await?;

    let id: Uuid = sqlx::query_scalar("SELECT id FROM wallets WHERE user_id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(id)
}
