use thiserror::Error;

use crate::amount::FixedPointAmount;
use crate::types::{AccountId, LedgerId};

/// Failures of fixed-point arithmetic and unit conversion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    #[error("Arithmetic overflow")]
    Overflow,

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Negative amount cannot be sent to a ledger: {0}")]
    NegativeChainAmount(FixedPointAmount),

    #[error("Unsupported token precision: {0} decimals")]
    UnsupportedDecimals(u32),

    #[error("Invalid decimal amount: {0}")]
    Parse(String),
}

/// Failures reported by a ledger collaborator while reading or submitting.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("{ledger} query failed: {message}")]
    Query { ledger: LedgerId, message: String },

    #[error("{ledger} transport error: {message}")]
    Transport { ledger: LedgerId, message: String },
}

/// Which side of a user-supplied bound was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundViolation {
    /// Zero means no action is required.
    Zero,
    TooLow,
    TooHigh,
}

impl std::fmt::Display for BoundViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BoundViolation::Zero => write!(f, "zero"),
            BoundViolation::TooLow => write!(f, "too low"),
            BoundViolation::TooHigh => write!(f, "too high"),
        }
    }
}

/// Error taxonomy of the capacity engine and the step pipeline.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Mint capacity {available} is below the minimum {minimum}")]
    InsufficientCapacity {
        available: FixedPointAmount,
        minimum: FixedPointAmount,
    },

    #[error("Insufficient {asset}: {available} available, {required} required")]
    InsufficientFunds {
        asset: String,
        available: FixedPointAmount,
        required: FixedPointAmount,
    },

    #[error("Vault already has {pending} pending issue requests")]
    PendingRequestExists { pending: FixedPointAmount },

    #[error("Requested value {requested} is {violation} (allowed {min} to {max})")]
    InvalidUserBound {
        violation: BoundViolation,
        requested: FixedPointAmount,
        min: FixedPointAmount,
        max: FixedPointAmount,
    },

    #[error("Submission to {ledger} was dropped: {reason}")]
    SubmissionDropped { ledger: LedgerId, reason: String },

    #[error("Submission to {ledger} was rejected as invalid: {reason}")]
    SubmissionInvalid { ledger: LedgerId, reason: String },

    #[error("No {asset} arrival observed on {ledger} after {iterations} polls")]
    BridgeTimeout {
        ledger: LedgerId,
        asset: String,
        iterations: u32,
    },

    #[error("Batch on {ledger} finalized only partially: {detail}")]
    BatchPartialFailure { ledger: LedgerId, detail: String },

    #[error("No vault found for {account}")]
    VaultNotFound { account: AccountId },

    #[error("Finalized result is missing the {event} event")]
    MissingEvent { event: String },

    #[error("Event {event} has a malformed `{field}` field")]
    MalformedEvent { event: String, field: String },

    #[error("Aborted by user")]
    UserAborted,

    #[error("Amount error: {0}")]
    Amount(#[from] AmountError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl VaultError {
    /// Raised before any ledger mutation; nothing was submitted.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            VaultError::InsufficientCapacity { .. }
                | VaultError::InsufficientFunds { .. }
                | VaultError::PendingRequestExists { .. }
                | VaultError::InvalidUserBound { .. }
                | VaultError::VaultNotFound { .. }
                | VaultError::UserAborted
        )
    }

    /// Resubmitting the same request cannot double-spend.
    pub fn is_retry_safe(&self) -> bool {
        matches!(self, VaultError::SubmissionDropped { .. })
    }

    /// Funds may be committed or in flight; an operator must reconcile.
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            VaultError::SubmissionDropped { .. }
                | VaultError::BridgeTimeout { .. }
                | VaultError::BatchPartialFailure { .. }
                | VaultError::MissingEvent { .. }
                | VaultError::MalformedEvent { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let dropped = VaultError::SubmissionDropped {
            ledger: LedgerId::Home,
            reason: "reorg".to_string(),
        };
        assert!(dropped.is_retry_safe());
        assert!(dropped.needs_operator());
        assert!(!dropped.is_precondition());

        let invalid = VaultError::SubmissionInvalid {
            ledger: LedgerId::Liquidity,
            reason: "bad origin".to_string(),
        };
        assert!(!invalid.is_retry_safe());

        let bound = VaultError::InvalidUserBound {
            violation: BoundViolation::Zero,
            requested: FixedPointAmount::ZERO,
            min: FixedPointAmount::ZERO,
            max: FixedPointAmount::ONE,
        };
        assert!(bound.is_precondition());
        assert!(!bound.needs_operator());
    }

    #[test]
    fn test_messages_name_the_ledger() {
        let timeout = VaultError::BridgeTimeout {
            ledger: LedgerId::Liquidity,
            asset: "KINT".to_string(),
            iterations: 12,
        };
        assert_eq!(
            timeout.to_string(),
            "No KINT arrival observed on liquidity after 12 polls"
        );
    }
}
