//! Collaborator contracts the engine drives.
//!
//! Implementations own connection handling, key management and the wire
//! encoding of `Operation`s. Handles are built once by the caller and passed
//! by reference into every component.

use async_trait::async_trait;

use kt_common::amount::FixedPointAmount;
use kt_common::error::{BoundViolation, LedgerError, VaultError};
use kt_common::types::{
    AccountId, Asset, Balance, LedgerId, LiquidityPair, Operation, SubmissionOutcome, Vault,
};

/// Read and submit access to one ledger for the signing identity.
///
/// Reads are idempotent and may interleave freely. `submit` and
/// `submit_batch` resolve exactly once, at finalization or rejection.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Which ledger this client talks to.
    fn ledger(&self) -> LedgerId;

    /// Held for the duration of every submission through this client.
    ///
    /// Handles for the same signer and ledger must return the same slot, so
    /// submissions stay serialized however many submitters share the ledger.
    fn submission_slot(&self) -> &tokio::sync::Mutex<()>;

    async fn query_balance(
        &self,
        account: &AccountId,
        asset: &Asset,
    ) -> Result<Balance, LedgerError>;

    /// `None` when the account runs no vault on this ledger.
    async fn query_vault_state(&self, account: &AccountId) -> Result<Option<Vault>, LedgerError>;

    async fn submit(&self, op: Operation) -> Result<SubmissionOutcome, LedgerError>;

    /// All operations commit together or none do.
    async fn submit_batch(&self, ops: Vec<Operation>) -> Result<SubmissionOutcome, LedgerError>;
}

/// Vault ledger reads beyond the base contract.
#[async_trait]
pub trait HomeLedger: LedgerClient {
    /// Rewards that `Operation::ClaimRewards` would currently pay out.
    async fn query_pending_rewards(
        &self,
        account: &AccountId,
    ) -> Result<FixedPointAmount, LedgerError>;
}

/// Pool reserves in token units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolReserves {
    pub base: FixedPointAmount,
    pub quote: FixedPointAmount,
}

/// Exchange reads on the liquidity ledger.
#[async_trait]
pub trait LiquidityLedger: LedgerClient {
    async fn pool_reserves(&self, pair: &LiquidityPair) -> Result<PoolReserves, LedgerError>;

    /// Total share issuance of the pool.
    async fn total_shares(&self, pair: &LiquidityPair) -> Result<FixedPointAmount, LedgerError>;

    /// Shares the account has staked in the incentives program.
    async fn staked_shares(
        &self,
        account: &AccountId,
        pair: &LiquidityPair,
    ) -> Result<FixedPointAmount, LedgerError>;
}

/// Vault oracle.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    /// Price of one unit of `asset` expressed in collateral units.
    async fn price(&self, asset: &Asset) -> Result<FixedPointAmount, LedgerError>;
}

/// Inclusive numeric range offered to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputBounds {
    pub min: FixedPointAmount,
    pub max: FixedPointAmount,
}

impl InputBounds {
    pub fn new(min: FixedPointAmount, max: FixedPointAmount) -> Self {
        Self { min, max }
    }

    /// Zero is always rejected: it asks for no action.
    pub fn check(&self, requested: FixedPointAmount) -> Result<(), VaultError> {
        let violation = if requested.is_zero() {
            BoundViolation::Zero
        } else if requested < self.min {
            BoundViolation::TooLow
        } else if requested > self.max {
            BoundViolation::TooHigh
        } else {
            return Ok(());
        };

        Err(VaultError::InvalidUserBound {
            violation,
            requested,
            min: self.min,
            max: self.max,
        })
    }
}

impl std::fmt::Display for InputBounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} <-> {}", self.min, self.max)
    }
}

/// Operator prompts. Rendering is left to the implementation.
#[async_trait]
pub trait UserInteraction: Send + Sync {
    async fn confirm(&self, prompt: &str) -> bool;

    /// Ask for a number; `None` when the operator declines to answer.
    async fn numeric_input(&self, prompt: &str, bounds: InputBounds) -> Option<FixedPointAmount>;
}
