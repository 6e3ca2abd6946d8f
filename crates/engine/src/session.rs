//! Interactive front of the orchestrator: ask for a value inside the allowed
//! range, ask for confirmation, then run the workflow.

use kt_common::amount::FixedPointAmount;
use kt_common::error::VaultError;

use crate::capacity::{CapacityCalculator, VaultSnapshot};
use crate::ledger::{HomeLedger, InputBounds, LiquidityLedger, PriceOracle, UserInteraction};
use crate::pipeline::{MintOutcome, PipelineError, PipelineOrchestrator, PipelineRun};

pub struct OperatorSession<'a, H, L, O, U>
where
    H: HomeLedger + ?Sized,
    L: LiquidityLedger + ?Sized,
    O: PriceOracle + ?Sized,
    U: UserInteraction + ?Sized,
{
    orchestrator: &'a PipelineOrchestrator<'a, H, L, O>,
    user: &'a U,
}

impl<'a, H, L, O, U> OperatorSession<'a, H, L, O, U>
where
    H: HomeLedger + ?Sized,
    L: LiquidityLedger + ?Sized,
    O: PriceOracle + ?Sized,
    U: UserInteraction + ?Sized,
{
    pub fn new(orchestrator: &'a PipelineOrchestrator<'a, H, L, O>, user: &'a U) -> Self {
        Self { orchestrator, user }
    }

    pub async fn stats(&self) -> Result<VaultSnapshot, VaultError> {
        let snapshot = self.orchestrator.snapshot().await?;
        tracing::info!(
            account = %snapshot.account,
            collateral = %snapshot.collateral,
            issued = %snapshot.issued,
            ratio = %snapshot.ratio,
            mint_capacity = %snapshot.mint_capacity,
            pending_rewards = %snapshot.pending_rewards,
            "Vault stats"
        );
        Ok(snapshot)
    }

    pub async fn self_mint(&self) -> Result<MintOutcome, PipelineError> {
        let snapshot = self.orchestrator.snapshot().await?;
        let bounds = self.orchestrator.issue_ratio_bounds().await?;
        let ratio = self
            .ask("Collateral ratio to mint down to (%)", bounds)
            .await?;

        let debt = &self.orchestrator.config().assets.debt;
        let capacity = CapacityCalculator::mint_capacity(
            snapshot.collateral,
            snapshot.issued,
            snapshot.price,
            ratio,
        )
        .map_err(VaultError::from)?
        .floor_to(debt.decimals);

        self.confirm(&format!("Request issue of {capacity} {debt} at {ratio}%?"))
            .await?;
        self.orchestrator.self_mint(ratio).await
    }

    pub async fn harvest(&self) -> Result<PipelineRun, PipelineError> {
        let reward = &self.orchestrator.config().assets.reward;
        let bounds = self.orchestrator.harvest_bounds().await?;
        let amount = self
            .ask(&format!("Amount of {reward} to harvest"), bounds)
            .await?;

        self.confirm(&format!(
            "Claim and swap {amount} {reward} into collateral?"
        ))
        .await?;
        self.orchestrator.harvest(amount).await
    }

    /// Positive moves liquidity into the vault, negative the reverse.
    pub async fn rebalance(&self) -> Result<PipelineRun, PipelineError> {
        let bounds = self.orchestrator.rebalance_bounds().await?;
        let percent = self
            .ask(
                "Collateral ratio points to move (+ into vault, - into pool)",
                bounds.to_input_bounds(),
            )
            .await?;

        let prompt = if percent.is_positive() {
            format!("Unstake liquidity to raise the ratio by {percent} points?")
        } else {
            format!(
                "Withdraw collateral to lower the ratio by {} points?",
                percent.abs()
            )
        };
        self.confirm(&prompt).await?;
        self.orchestrator.rebalance(percent).await
    }

    async fn ask(&self, prompt: &str, bounds: InputBounds) -> Result<FixedPointAmount, VaultError> {
        let value = self
            .user
            .numeric_input(&format!("{prompt} [{bounds}]"), bounds)
            .await
            .ok_or(VaultError::UserAborted)?;
        bounds.check(value)?;
        Ok(value)
    }

    async fn confirm(&self, prompt: &str) -> Result<(), VaultError> {
        if self.user.confirm(prompt).await {
            Ok(())
        } else {
            tracing::info!(prompt, "Declined by operator");
            Err(VaultError::UserAborted)
        }
    }
}
