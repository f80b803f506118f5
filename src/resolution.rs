//! Resolution and dispute management.
//!
//! Per-option state machine:
//!
//! ```text
//! Open ──(resolution issued)──► AwaitingDispute ──(window expires)──► Settled
//!                                    │
//!                                    └(dispute filed)──► UnderReview ──(admin decides)──► Settled
//! ```
//!
//! ORACLE resolutions skip AwaitingDispute entirely. OPINION resolutions
//! read the price at expiration: YES wins at or above one half. An option
//! is "settled" once `is_resolved` flips true, which is what unblocks
//! claims; `winning_side` set with `is_resolved` false marks the dispute
//! window.

use chrono::{Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{EngineError, Resource};
use crate::fanout::{EngineEvent, Fanout};
use crate::ledger::{self, MarketExpectation, MarketOption, ResolutionMode, Tx, WinningSide};
use crate::lmsr_core::{self, PRECISION};

/// Fixed dispute window after an AUTHORITY resolution.
pub const DISPUTE_WINDOW_HOURS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisputeStatus {
    Open,
    Upheld,
    Overturned,
}

impl DisputeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisputeStatus::Open => "open",
            DisputeStatus::Upheld => "upheld",
            DisputeStatus::Overturned => "overturned",
        }
    }

    fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "open" => Ok(DisputeStatus::Open),
            "upheld" => Ok(DisputeStatus::Upheld),
            "overturned" => Ok(DisputeStatus::Overturned),
            other => Err(EngineError::Internal(anyhow::anyhow!(
                "unknown dispute status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dispute {
    pub id: Uuid,
    pub option_id: Uuid,
    pub disputer_id: Uuid,
    pub bond: i64,
    pub status: DisputeStatus,
}

fn dispute_from_row(row: &PgRow) -> Result<Dispute, EngineError> {
    let status: String = row.get("status");
    Ok(Dispute {
        id: row.get("id"),
        option_id: row.get("option_id"),
        disputer_id: row.get("disputer_id"),
        bond: row.get("bond"),
        status: DisputeStatus::parse(&status)?,
    })
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ResolutionOutcome {
    pub option_id: Uuid,
    pub winning_side: i16,
    pub settled: bool,
    pub dispute_deadline: Option<chrono::DateTime<chrono::Utc>>,
}

/// Issue a resolution for an option, following the owning market's mode.
pub async fn resolve_option(
    pool: &PgPool,
    fanout: &Fanout,
    resolver_id: Uuid,
    market_id: Uuid,
    option_id: Uuid,
    winning_side: Option<WinningSide>,
) -> Result<ResolutionOutcome, EngineError> {
    let (outcome, events) = ledger::with_engine_tx!(pool, tx, {
        let market =
            ledger::get_market_with_lock(&mut tx, market_id, MarketExpectation::Any).await?;
        if market.is_resolved {
            return Err(EngineError::Precondition("market is resolved".into()));
        }
        let option = ledger::get_option_with_lock(
            &mut tx,
            option_id,
            market_id,
            crate::ledger::OptionExpectation::Any,
        )
        .await?;
        if option.is_resolved || option.winning_side.is_some() {
            return Err(EngineError::Conflict(
                "option already has a resolution".into(),
            ));
        }

        match market.resolution_mode {
            ResolutionMode::Oracle => {
                let side = winning_side
                    .ok_or_else(|| EngineError::Validation("winning side is required".into()))?;
                let events = settle_option(&mut tx, &option, side, market_id, market.liquidity_parameter).await?;
                Ok((
                    ResolutionOutcome {
                        option_id,
                        winning_side: side.code(),
                        settled: true,
                        dispute_deadline: None,
                    },
                    events,
                ))
            }
            ResolutionMode::Authority => {
                if market.resolver_id != Some(resolver_id) {
                    return Err(EngineError::Validation(
                        "caller is not the designated resolver".into(),
                    ));
                }
                let side = winning_side
                    .ok_or_else(|| EngineError::Validation("winning side is required".into()))?;
                let deadline = Utc::now() + Duration::hours(DISPUTE_WINDOW_HOURS);
                sqlx::query(
                    "UPDATE market_options SET winning_side = $1, dispute_deadline = $2
                     WHERE id = $3",
                )
                .bind(side.code())
                .bind(deadline)
                .bind(option_id)
                .execute(tx.as_mut())
                .await?;
                Ok((
                    ResolutionOutcome {
                        option_id,
                        winning_side: side.code(),
                        settled: false,
                        dispute_deadline: Some(deadline),
                    },
                    Vec::new(),
                ))
            }
            ResolutionMode::Opinion => {
                if Utc::now() < market.expires_at {
                    return Err(EngineError::Precondition(
                        "market has not reached expiration".into(),
                    ));
                }
                // Deterministic snapshot: the kernel quote at expiration
                // decides. YES wins at or above one half.
                let (yes, no) = option.quantities();
                let b = market.liquidity_parameter.max(0) as u64;
                let yes_price = lmsr_core::calculate_yes_price(yes, no, b)?;
                let side = if yes_price >= PRECISION / 2 {
                    WinningSide::Yes
                } else {
                    WinningSide::No
                };
                let events = settle_option(&mut tx, &option, side, market_id, market.liquidity_parameter).await?;
                Ok((
                    ResolutionOutcome {
                        option_id,
                        winning_side: side.code(),
                        settled: true,
                        dispute_deadline: None,
                    },
                    events,
                ))
            }
        }
    })?;

    fanout.publish_all(resolver_id, events);
    Ok(outcome)
}

/// Post a bond to contest an AUTHORITY resolution during its window.
pub async fn file_dispute(
    pool: &PgPool,
    user_id: Uuid,
    market_id: Uuid,
    option_id: Uuid,
    bond: i64,
) -> Result<Dispute, EngineError> {
    if bond <= 0 {
        return Err(EngineError::Validation("dispute bond must be positive".into()));
    }

    ledger::with_engine_tx!(pool, tx, {
        let _market =
            ledger::get_market_with_lock(&mut tx, market_id, MarketExpectation::Any).await?;
        let option = ledger::get_option_with_lock(
            &mut tx,
            option_id,
            market_id,
            crate::ledger::OptionExpectation::Any,
        )
        .await?;

        if option.is_resolved {
            return Err(EngineError::Conflict("dispute window has expired".into()));
        }
        let deadline = match (option.winning_side, option.dispute_deadline) {
            (Some(_), Some(deadline)) => deadline,
            _ => {
                return Err(EngineError::Precondition(
                    "option has no pending resolution to dispute".into(),
                ))
            }
        };
        if Utc::now() >= deadline {
            return Err(EngineError::Conflict("dispute window has expired".into()));
        }
        if open_dispute(&mut tx, option_id).await?.is_some() {
            return Err(EngineError::Conflict(
                "option is already under dispute review".into(),
            ));
        }

        let wallet = ledger::get_wallet_with_lock(&mut tx, user_id).await?;
        if wallet.balance_usdc < bond {
            return Err(EngineError::Insufficient {
                resource: Resource::Balance,
                available: wallet.balance_usdc,
                required: bond,
            });
        }
        ledger::update_wallet_balance(&mut tx, wallet.id, -bond).await?;

        let dispute_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO disputes (id, option_id, disputer_id, bond, status)
             VALUES ($1, $2, $3, $4, 'open')",
        )
        .bind(dispute_id)
        .bind(option_id)
        .bind(user_id)
        .bind(bond)
        .execute(tx.as_mut())
        .await?;

        Ok(Dispute {
            id: dispute_id,
            option_id,
            disputer_id: user_id,
            bond,
            status: DisputeStatus::Open,
        })
    })
}

/// Admin review of an open dispute: uphold keeps the resolution and
/// forfeits the bond to the protocol; overturn flips the winning side and
/// returns the bond. Either way the option settles.
pub async fn review_dispute(
    pool: &PgPool,
    fanout: &Fanout,
    admin_id: Uuid,
    dispute_id: Uuid,
    uphold: bool,
) -> Result<ResolutionOutcome, EngineError> {
    let (outcome, events) = ledger::with_engine_tx!(pool, tx, {
        let row = sqlx::query("SELECT * FROM disputes WHERE id = $1 FOR UPDATE")
            .bind(dispute_id)
            .fetch_optional(tx.as_mut())
            .await?
            .ok_or(EngineError::NotFound("dispute"))?;
        let dispute = dispute_from_row(&row)?;
        if dispute.status != DisputeStatus::Open {
            return Err(EngineError::Conflict("dispute already reviewed".into()));
        }

        let option = ledger::get_option(&mut tx, dispute.option_id).await?;
        let market =
            ledger::get_market_with_lock(&mut tx, option.market_id, MarketExpectation::Any).await?;
        let option = ledger::get_option_with_lock(
            &mut tx,
            dispute.option_id,
            market.id,
            crate::ledger::OptionExpectation::Any,
        )
        .await?;
        let proposed = option.winning_side.ok_or_else(|| {
            EngineError::Internal(anyhow::anyhow!("disputed option has no proposed side"))
        })?;

        let (status, final_side) = if uphold {
            (DisputeStatus::Upheld, proposed)
        } else {
            (DisputeStatus::Overturned, proposed.flipped())
        };

        sqlx::query("UPDATE disputes SET status = $1, reviewed_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(dispute_id)
            .execute(tx.as_mut())
            .await?;

        if uphold {
            // Forfeited bonds accrue to the protocol.
            ledger::update_market_stats(&mut tx, market.id, 0, 0, 0, dispute.bond, 0, 0).await?;
            ledger::add_lifetime_protocol_fees(&mut tx, dispute.bond).await?;
        } else {
            let wallet = ledger::get_wallet_with_lock(&mut tx, dispute.disputer_id).await?;
            ledger::update_wallet_balance(&mut tx, wallet.id, dispute.bond).await?;
        }

        let events = settle_option(&mut tx, &option, final_side, market.id, market.liquidity_parameter).await?;
        Ok((
            ResolutionOutcome {
                option_id: option.id,
                winning_side: final_side.code(),
                settled: true,
                dispute_deadline: None,
            },
            events,
        ))
    })?;

    fanout.publish_all(admin_id, events);
    Ok(outcome)
}

/// Settle an option whose dispute window has expired without a dispute.
/// Callable by anyone; settlement is lazy rather than scheduled.
pub async fn settle_expired(
    pool: &PgPool,
    fanout: &Fanout,
    caller_id: Uuid,
    market_id: Uuid,
    option_id: Uuid,
) -> Result<ResolutionOutcome, EngineError> {
    let (outcome, events) = ledger::with_engine_tx!(pool, tx, {
        let market =
            ledger::get_market_with_lock(&mut tx, market_id, MarketExpectation::Any).await?;
        let option = ledger::get_option_with_lock(
            &mut tx,
            option_id,
            market_id,
            crate::ledger::OptionExpectation::Any,
        )
        .await?;

        if option.is_resolved {
            return Err(EngineError::Conflict("option is already settled".into()));
        }
        let (side, deadline) = match (option.winning_side, option.dispute_deadline) {
            (Some(side), Some(deadline)) => (side, deadline),
            _ => {
                return Err(EngineError::Precondition(
                    "option has no pending resolution".into(),
                ))
            }
        };
        if Utc::now() < deadline {
            return Err(EngineError::Precondition(
                "dispute window is still open".into(),
            ));
        }
        if open_dispute(&mut tx, option_id).await?.is_some() {
            return Err(EngineError::Precondition(
                "option is under dispute review".into(),
            ));
        }

        let events =
            settle_option(&mut tx, &option, side, market_id, market.liquidity_parameter).await?;
        Ok((
            ResolutionOutcome {
                option_id,
                winning_side: side.code(),
                settled: true,
                dispute_deadline: None,
            },
            events,
        ))
    })?;

    fanout.publish_all(caller_id, events);
    Ok(outcome)
}

async fn open_dispute(tx: &mut Tx<'_>, option_id: Uuid) -> Result<Option<Uuid>, EngineError> {
    let id: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM disputes WHERE option_id = $1 AND status = 'open' LIMIT 1",
    )
    .bind(option_id)
    .fetch_optional(tx.as_mut())
    .await?;
    Ok(id)
}

/// Flip an option to Settled, roll the market forward if it was the last
/// open option, and build the broadcast that unblocks claims.
async fn settle_option(
    tx: &mut Tx<'_>,
    option: &MarketOption,
    side: WinningSide,
    market_id: Uuid,
    liquidity_parameter: i64,
) -> Result<Vec<EngineEvent>, EngineError> {
    sqlx::query(
        "UPDATE market_options SET is_resolved = TRUE, winning_side = $1 WHERE id = $2",
    )
    .bind(side.code())
    .bind(option.id)
    .execute(tx.as_mut())
    .await?;

    if ledger::unresolved_option_count(tx, market_id).await? == 0 {
        ledger::mark_market_resolved(tx, market_id).await?;
    }

    let (yes, no) = option.quantities();
    let b = liquidity_parameter.max(0) as u64;
    let yes_price = lmsr_core::calculate_yes_price(yes, no, b)? as i64;

    Ok(vec![
        EngineEvent::Resolved {
            option_id: option.id,
            winning_side: side.code(),
        },
        EngineEvent::PriceUpdate {
            option_id: option.id,
            yes_price,
            no_price: PRECISION as i64 - yes_price,
            yes_quantity: option.yes_quantity,
            no_quantity: option.no_quantity,
        },
    ])
}
