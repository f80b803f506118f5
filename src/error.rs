//! Engine error taxonomy.
//!
//! Every failure surfaced to callers is one of the `EngineError` kinds below.
//! Kernel failures have their own small enum; the trade engine decides
//! whether a kernel failure is a user error (overselling) or an internal
//! numerics bug before converting.

use std::fmt;

use thiserror::Error;

/// Failure modes of the fixed-point pricing kernel.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    #[error("arithmetic overflow in pricing kernel")]
    ArithmeticOverflow,

    #[error("arithmetic underflow: {0}")]
    ArithmeticUnderflow(&'static str),

    #[error("liquidity parameter is zero")]
    DivisionByZero,
}

/// The ledger resource a request ran out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Balance,
    Shares,
    PoolLiquidity,
    LpShares,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Balance => "balance",
            Resource::Shares => "shares",
            Resource::PoolLiquidity => "pool liquidity",
            Resource::LpShares => "LP shares",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("insufficient {resource}: available {available}, required {required}")]
    Insufficient {
        resource: Resource,
        available: i64,
        required: i64,
    },

    #[error("slippage exceeded: expected {expected}, actual {actual}")]
    SlippageExceeded { expected: i64, actual: i64 },

    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Reserved: risk checks are advisory today and never raise this.
    #[error("rejected by risk controls")]
    RiskRejected,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Retryable; callers should back off with jitter, up to 3 attempts.
    #[error("lock wait timed out")]
    LockTimeout,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// HTTP status the outer layer maps this kind to.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::Validation(_)
            | EngineError::Precondition(_)
            | EngineError::Insufficient { .. }
            | EngineError::SlippageExceeded { .. }
            | EngineError::LimitExceeded(_)
            | EngineError::RiskRejected => 400,
            EngineError::NotFound(_) => 404,
            EngineError::Conflict(_) => 409,
            EngineError::LockTimeout => 503,
            EngineError::Internal(_) => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LockTimeout)
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(error: sqlx::Error) -> Self {
        // Class 55P03 (lock_not_available) fires when a statement exceeds the
        // per-transaction lock_timeout.
        if let sqlx::Error::Database(db_error) = &error {
            if db_error.code().as_deref() == Some("55P03") {
                return EngineError::LockTimeout;
            }
        }
        EngineError::Internal(error.into())
    }
}

impl From<KernelError> for EngineError {
    fn from(error: KernelError) -> Self {
        EngineError::Internal(anyhow::anyhow!(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(EngineError::Validation("x".into()).status_code(), 400);
        assert_eq!(EngineError::NotFound("market").status_code(), 404);
        assert_eq!(EngineError::Conflict("claimed".into()).status_code(), 409);
        assert_eq!(EngineError::LockTimeout.status_code(), 503);
        assert_eq!(
            EngineError::Internal(anyhow::anyhow!("boom")).status_code(),
            500
        );
    }

    #[test]
    fn only_lock_timeout_is_retryable() {
        assert!(EngineError::LockTimeout.is_retryable());
        assert!(!EngineError::RiskRejected.is_retryable());
        assert!(!EngineError::Internal(anyhow::anyhow!("boom")).is_retryable());
    }
}
