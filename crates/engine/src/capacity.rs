//! Collateral ratio and issuance capacity.
//!
//! CR = collateral / (issued * price) * 100, where `price` is the oracle price
//! of one debt unit in collateral units.
//!
//! Capacity at a target ratio R:
//! capacity = collateral / (R / 100) / price - issued, clamped at zero.

use serde::Serialize;

use kt_common::amount::FixedPointAmount;
use kt_common::config::AppConfig;
use kt_common::error::{AmountError, VaultError};
use kt_common::types::AccountId;

use crate::ledger::{HomeLedger, PriceOracle};

/// Collateral ratio in percent. No issued debt means no upper limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CollateralRatio {
    Finite(FixedPointAmount),
    Unbounded,
}

impl CollateralRatio {
    pub fn finite(&self) -> Option<FixedPointAmount> {
        match self {
            CollateralRatio::Finite(value) => Some(*value),
            CollateralRatio::Unbounded => None,
        }
    }

    /// True if this ratio is at or above `threshold` percent.
    pub fn at_least(&self, threshold: FixedPointAmount) -> bool {
        match self {
            CollateralRatio::Finite(value) => *value >= threshold,
            CollateralRatio::Unbounded => true,
        }
    }
}

impl std::fmt::Display for CollateralRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollateralRatio::Finite(value) => write!(f, "{}%", value.floor_to(2)),
            CollateralRatio::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Derives collateral ratio and residual issuance capacity.
#[derive(Debug, Clone)]
pub struct CapacityCalculator {
    min_mint_capacity: FixedPointAmount,
    min_fee_balance: FixedPointAmount,
    pending_issue_epsilon: FixedPointAmount,
}

impl CapacityCalculator {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            min_mint_capacity: config.min_mint_capacity,
            min_fee_balance: config.min_fee_balance,
            pending_issue_epsilon: config.pending_issue_epsilon,
        }
    }

    pub fn ratio(
        collateral: FixedPointAmount,
        issued: FixedPointAmount,
        price: FixedPointAmount,
    ) -> Result<CollateralRatio, AmountError> {
        let issued_value = issued.checked_mul(price)?;
        if issued_value.is_zero() {
            return Ok(CollateralRatio::Unbounded);
        }

        let ratio = collateral
            .checked_div(issued_value)?
            .checked_mul(FixedPointAmount::ONE_HUNDRED)?;
        Ok(CollateralRatio::Finite(ratio))
    }

    /// Debt that can still be issued while keeping `desired_ratio` percent.
    pub fn mint_capacity(
        collateral: FixedPointAmount,
        issued: FixedPointAmount,
        price: FixedPointAmount,
        desired_ratio: FixedPointAmount,
    ) -> Result<FixedPointAmount, AmountError> {
        let raw = collateral
            .checked_div(desired_ratio.percent_to_factor()?)?
            .checked_div(price)?
            .checked_sub(issued)?;

        Ok(raw.clamp_non_negative())
    }

    /// Gate every issuance: no dust, enough fee balance, nothing pending.
    ///
    /// Runs before any submission; a failure leaves the ledger untouched.
    pub fn check_issue_preconditions(
        &self,
        capacity: FixedPointAmount,
        fee_balance: FixedPointAmount,
        fee_asset: &str,
        to_be_issued: FixedPointAmount,
    ) -> Result<(), VaultError> {
        if capacity <= self.min_mint_capacity {
            return Err(VaultError::InsufficientCapacity {
                available: capacity,
                minimum: self.min_mint_capacity,
            });
        }

        if fee_balance <= self.min_fee_balance {
            return Err(VaultError::InsufficientFunds {
                asset: fee_asset.to_string(),
                available: fee_balance,
                required: self.min_fee_balance,
            });
        }

        if to_be_issued > self.pending_issue_epsilon {
            return Err(VaultError::PendingRequestExists {
                pending: to_be_issued,
            });
        }

        Ok(())
    }
}

/// Everything the operator needs to judge the vault, read in one pass.
#[derive(Debug, Clone, Serialize)]
pub struct VaultSnapshot {
    pub account: AccountId,
    pub active: bool,
    pub unbanned: bool,
    pub collateral: FixedPointAmount,
    pub issued: FixedPointAmount,
    pub to_be_issued: FixedPointAmount,
    pub price: FixedPointAmount,
    pub ratio: CollateralRatio,
    /// Capacity at the configured minimum issue ratio.
    pub mint_capacity: FixedPointAmount,
    /// Free balance of the issue-fee asset.
    pub fee_balance: FixedPointAmount,
    pub pending_rewards: FixedPointAmount,
}

impl VaultSnapshot {
    /// Read fresh state from the home ledger and the oracle.
    pub async fn read<H, O>(home: &H, oracle: &O, config: &AppConfig) -> Result<Self, VaultError>
    where
        H: HomeLedger + ?Sized,
        O: PriceOracle + ?Sized,
    {
        let vault = home
            .query_vault_state(&config.account)
            .await?
            .ok_or_else(|| VaultError::VaultNotFound {
                account: config.account.clone(),
            })?;

        let price = oracle.price(&vault.debt_asset).await?;
        let fee_balance = home
            .query_balance(&config.account, &config.assets.reward)
            .await?
            .spendable();
        let pending_rewards = home.query_pending_rewards(&config.account).await?;

        let ratio = CapacityCalculator::ratio(vault.collateral, vault.issued, price)?;
        let mint_capacity = CapacityCalculator::mint_capacity(
            vault.collateral,
            vault.issued,
            price,
            config.min_issue_ratio,
        )?;

        tracing::debug!(
            account = %config.account,
            collateral = %vault.collateral,
            issued = %vault.issued,
            ratio = %ratio,
            "Vault snapshot read"
        );

        Ok(Self {
            account: vault.account,
            active: vault.active,
            unbanned: vault.unbanned,
            collateral: vault.collateral,
            issued: vault.issued,
            to_be_issued: vault.to_be_issued,
            price,
            ratio,
            mint_capacity,
            fee_balance,
            pending_rewards,
        })
    }
}
