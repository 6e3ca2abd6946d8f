//! Cross-ledger step pipeline.
//!
//! Every workflow is a fixed sequence of steps. A step confined to one ledger
//! waits for the submission's finality; a step that crosses the bridge is
//! followed by an arrival watch on the destination ledger. Each amount after
//! the first is the *observed* result of the previous step, never the amount
//! that was requested.
//!
//! State machine:
//!
//! ```text
//! Init → Submitted(1) → Confirmed(1) → Submitted(2) → … → Complete
//!              ↘ FailedAtStep(i) from any submitted state
//! ```
//!
//! Nothing is retried. The first failure halts the run and reports where the
//! moved funds were last seen.

use std::fmt;

use alloy::primitives::B256;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use kt_common::amount::FixedPointAmount;
use kt_common::config::AppConfig;
use kt_common::error::{LedgerError, VaultError};
use kt_common::types::{
    AccountId, Asset, FinalizedResult, IssueReceipt, LedgerId, Operation, SwapOutput,
};

use crate::capacity::{CapacityCalculator, VaultSnapshot};
use crate::ledger::{HomeLedger, InputBounds, LiquidityLedger, PriceOracle};
use crate::rebalance_bounds::{
    LiquidityPosition, RebalanceBounds, RebalanceBoundsCalculator, RebalanceDirection,
};
use crate::submitter::BatchSubmitter;
use crate::watcher::{BalanceWatcher, WatchError};

/// Upper end of the self-mint ratio range when no debt is issued yet.
const UNBOUNDED_RATIO_CEILING: FixedPointAmount =
    FixedPointAmount::from_decimal(Decimal::from_parts(100_000, 0, 0, false, 0));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Workflow {
    SelfMint,
    Harvest,
    RebalanceUnstake,
    RebalanceWithdraw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    RequestIssue,
    ClaimAndBridge,
    WithdrawAndBridge,
    AwaitArrival,
    UnstakeLiquidity,
    Swap,
    BridgeBack,
    DepositCollateral,
    ProvideLiquidity,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::RequestIssue => "request_issue",
            StepKind::ClaimAndBridge => "claim_and_bridge",
            StepKind::WithdrawAndBridge => "withdraw_and_bridge",
            StepKind::AwaitArrival => "await_arrival",
            StepKind::UnstakeLiquidity => "unstake_liquidity",
            StepKind::Swap => "swap",
            StepKind::BridgeBack => "bridge_back",
            StepKind::DepositCollateral => "deposit_collateral",
            StepKind::ProvideLiquidity => "provide_liquidity",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum PipelineState {
    Init,
    Submitted(usize),
    Confirmed(usize),
    Complete,
    FailedAtStep(usize),
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Init => write!(f, "init"),
            PipelineState::Submitted(step) => write!(f, "step{step}_submitted"),
            PipelineState::Confirmed(step) => write!(f, "step{step}_confirmed"),
            PipelineState::Complete => write!(f, "complete"),
            PipelineState::FailedAtStep(step) => write!(f, "failed_at_step{step}"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    /// 1-based position in the run.
    pub index: usize,
    pub kind: StepKind,
    pub ledger: LedgerId,
    pub requested: Option<FixedPointAmount>,
    pub observed: Option<FixedPointAmount>,
    pub block_hash: Option<B256>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Funds moved by the run and not yet back in the vault or the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Holding {
    pub asset: String,
    pub amount: FixedPointAmount,
    pub ledger: LedgerId,
    /// Sent over the bridge and not yet seen on `ledger`.
    pub in_transit: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    FailedAtStep {
        step: usize,
        cause: String,
        holdings: Vec<Holding>,
    },
}

/// Ordered record of one workflow invocation.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub workflow: Workflow,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: PipelineState,
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    pub holdings: Vec<Holding>,
}

impl PipelineRun {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow,
            started_at: Utc::now(),
            finished_at: None,
            state: PipelineState::Init,
            status: RunStatus::Running,
            steps: Vec::new(),
            holdings: Vec::new(),
        }
    }

    /// Index of the latest step, 0 before the first one starts.
    pub fn current_step(&self) -> usize {
        self.steps.len()
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, RunStatus::Completed)
    }

    pub fn step(&self, index: usize) -> Option<&StepRecord> {
        index.checked_sub(1).and_then(|i| self.steps.get(i))
    }

    pub fn last_observed(&self) -> Option<FixedPointAmount> {
        self.steps.last().and_then(|s| s.observed)
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::info!(
            run = %self.id,
            workflow = ?self.workflow,
            from = %self.state,
            to = %next,
            "Pipeline transition"
        );
        self.state = next;
    }

    fn begin(&mut self, kind: StepKind, ledger: LedgerId, requested: Option<FixedPointAmount>) {
        let index = self.steps.len() + 1;
        tracing::info!(
            run = %self.id,
            step = index,
            kind = %kind,
            %ledger,
            requested = ?requested.map(|a| a.to_string()),
            "Step started"
        );
        self.steps.push(StepRecord {
            index,
            kind,
            ledger,
            requested,
            observed: None,
            block_hash: None,
            finished_at: None,
        });
        self.transition(PipelineState::Submitted(index));
    }

    fn confirm(&mut self, observed: FixedPointAmount, block_hash: Option<B256>) {
        let Some(step) = self.steps.last_mut() else {
            return;
        };
        step.observed = Some(observed);
        step.block_hash = block_hash;
        step.finished_at = Some(Utc::now());
        let index = step.index;

        tracing::info!(
            run = %self.id,
            step = index,
            observed = %observed,
            block = ?block_hash,
            "Step confirmed"
        );
        self.transition(PipelineState::Confirmed(index));
    }

    fn hold(&mut self, holdings: Vec<Holding>) {
        self.holdings = holdings;
    }

    fn complete(&mut self) {
        self.holdings.clear();
        self.finished_at = Some(Utc::now());
        self.status = RunStatus::Completed;
        self.transition(PipelineState::Complete);
    }

    fn fail(&mut self, cause: &VaultError) {
        let step = self.current_step();
        self.finished_at = Some(Utc::now());
        self.status = RunStatus::FailedAtStep {
            step,
            cause: cause.to_string(),
            holdings: self.holdings.clone(),
        };
        self.transition(PipelineState::FailedAtStep(step));
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Raised before the first submission; no ledger state changed.
    #[error(transparent)]
    Precondition(VaultError),

    #[error("Run {} halted at step {step}: {source}", .run.id)]
    Halted {
        run: Box<PipelineRun>,
        step: usize,
        source: VaultError,
    },
}

impl PipelineError {
    pub fn cause(&self) -> &VaultError {
        match self {
            PipelineError::Precondition(cause) => cause,
            PipelineError::Halted { source, .. } => source,
        }
    }

    pub fn run(&self) -> Option<&PipelineRun> {
        match self {
            PipelineError::Precondition(_) => None,
            PipelineError::Halted { run, .. } => Some(run),
        }
    }
}

impl From<VaultError> for PipelineError {
    fn from(e: VaultError) -> Self {
        PipelineError::Precondition(e)
    }
}

/// Completed self-mint: the run and the payment details of the request.
#[derive(Debug, Clone, Serialize)]
pub struct MintOutcome {
    pub run: PipelineRun,
    pub receipt: IssueReceipt,
}

struct HarvestPlan {
    amount: FixedPointAmount,
    claim: bool,
}

struct RebalanceContext {
    snapshot: VaultSnapshot,
    issued_value: FixedPointAmount,
    position: LiquidityPosition,
    bounds: RebalanceBounds,
}

/// Drives the vault workflows across the home and liquidity ledgers.
pub struct PipelineOrchestrator<'a, H, L, O>
where
    H: HomeLedger + ?Sized,
    L: LiquidityLedger + ?Sized,
    O: PriceOracle + ?Sized,
{
    home: &'a H,
    liquidity: &'a L,
    oracle: &'a O,
    config: &'a AppConfig,
    home_submitter: BatchSubmitter<'a, H>,
    liquidity_submitter: BatchSubmitter<'a, L>,
    watcher: BalanceWatcher,
    capacity: CapacityCalculator,
    rebalance: RebalanceBoundsCalculator,
    /// Held from the vault read until the issue request finalizes.
    issuance: Mutex<()>,
}

impl<'a, H, L, O> PipelineOrchestrator<'a, H, L, O>
where
    H: HomeLedger + ?Sized,
    L: LiquidityLedger + ?Sized,
    O: PriceOracle + ?Sized,
{
    pub fn new(home: &'a H, liquidity: &'a L, oracle: &'a O, config: &'a AppConfig) -> Self {
        Self {
            home,
            liquidity,
            oracle,
            config,
            home_submitter: BatchSubmitter::new(home),
            liquidity_submitter: BatchSubmitter::new(liquidity),
            watcher: BalanceWatcher::from_config(config),
            capacity: CapacityCalculator::new(config),
            rebalance: RebalanceBoundsCalculator::new(config),
            issuance: Mutex::new(()),
        }
    }

    pub fn with_watcher(mut self, watcher: BalanceWatcher) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn config(&self) -> &AppConfig {
        self.config
    }

    fn account(&self) -> &AccountId {
        &self.config.account
    }

    pub async fn snapshot(&self) -> Result<VaultSnapshot, VaultError> {
        VaultSnapshot::read(self.home, self.oracle, self.config).await
    }

    /// Target ratios a self-mint may request: `[min_issue_ratio, current]`.
    pub async fn issue_ratio_bounds(&self) -> Result<InputBounds, VaultError> {
        let snapshot = self.snapshot().await?;
        Ok(self.issue_bounds_for(&snapshot))
    }

    fn issue_bounds_for(&self, snapshot: &VaultSnapshot) -> InputBounds {
        let max = snapshot.ratio.finite().unwrap_or(UNBOUNDED_RATIO_CEILING);
        InputBounds::new(self.config.min_issue_ratio, max)
    }

    /// Reward amounts a harvest may bridge.
    ///
    /// The maximum is everything claimable minus the reserve kept for fees.
    pub async fn harvest_bounds(&self) -> Result<InputBounds, VaultError> {
        let reward = &self.config.assets.reward;
        let free = self.home.query_balance(self.account(), reward).await?.spendable();
        let pending = self.home.query_pending_rewards(self.account()).await?;
        let max = free
            .checked_add(pending)?
            .checked_sub(self.config.reward_fee_reserve)?
            .clamp_non_negative()
            .floor_to(reward.decimals);

        Ok(InputBounds::new(self.config.min_harvest, max))
    }

    pub async fn rebalance_bounds(&self) -> Result<RebalanceBounds, VaultError> {
        Ok(self.rebalance_context().await?.bounds)
    }

    async fn rebalance_context(&self) -> Result<RebalanceContext, VaultError> {
        let snapshot = self.snapshot().await?;
        let issued_value = snapshot.issued.checked_mul(snapshot.price)?;
        let position =
            LiquidityPosition::read(self.liquidity, self.account(), &self.config.assets).await?;
        let bounds = self.rebalance.bounds(snapshot.ratio, issued_value, &position)?;

        tracing::debug!(
            ratio = %snapshot.ratio,
            negative = %bounds.negative,
            positive = %bounds.positive,
            "Rebalance bounds"
        );
        Ok(RebalanceContext {
            snapshot,
            issued_value,
            position,
            bounds,
        })
    }

    /// Issue debt against the vault down to `desired_ratio` percent.
    ///
    /// The vault is opened to issue requests, the request is placed and the
    /// vault is closed again, all in one atomic batch. Concurrent calls are
    /// serialized, so a second caller sees the first request as pending.
    pub async fn self_mint(
        &self,
        desired_ratio: FixedPointAmount,
    ) -> Result<MintOutcome, PipelineError> {
        let debt = &self.config.assets.debt;
        let _issuing = self.issuance.lock().await;
        let snapshot = self.snapshot().await?;
        self.issue_bounds_for(&snapshot).check(desired_ratio)?;

        let capacity = CapacityCalculator::mint_capacity(
            snapshot.collateral,
            snapshot.issued,
            snapshot.price,
            desired_ratio,
        )
        .map_err(VaultError::from)?
        .floor_to(debt.decimals);
        self.capacity.check_issue_preconditions(
            capacity,
            snapshot.fee_balance,
            &self.config.assets.reward.symbol,
            snapshot.to_be_issued,
        )?;

        tracing::info!(ratio = %desired_ratio, capacity = %capacity, asset = %debt, "Self-mint planned");
        let mut run = PipelineRun::new(Workflow::SelfMint);
        let outcome = self.execute_self_mint(&mut run, capacity).await;
        let (run, receipt) = self.finish(run, outcome)?;
        Ok(MintOutcome { run, receipt })
    }

    async fn execute_self_mint(
        &self,
        run: &mut PipelineRun,
        capacity: FixedPointAmount,
    ) -> Result<IssueReceipt, VaultError> {
        let ops = vec![
            Operation::AcceptNewIssues { accept: true },
            Operation::RequestIssue { amount: capacity },
            Operation::AcceptNewIssues { accept: false },
        ];
        let result = self
            .submit_step(run, StepKind::RequestIssue, LedgerId::Home, ops, Some(capacity))
            .await?;
        let receipt = result.issue_request()?;
        run.confirm(receipt.amount, Some(result.block_hash));

        tracing::info!(
            request = %receipt.request_id,
            amount = %receipt.amount,
            fee = %receipt.fee,
            deposit_address = %receipt.deposit_address,
            "Issue requested"
        );
        Ok(receipt)
    }

    /// Claim rewards, sell them for collateral on the liquidity ledger and
    /// deposit the proceeds into the vault.
    pub async fn harvest(&self, amount: FixedPointAmount) -> Result<PipelineRun, PipelineError> {
        let plan = self.plan_harvest(amount).await?;
        let mut run = PipelineRun::new(Workflow::Harvest);
        let outcome = self.execute_harvest(&mut run, plan).await;
        self.finish(run, outcome).map(|(run, ())| run)
    }

    async fn plan_harvest(&self, amount: FixedPointAmount) -> Result<HarvestPlan, VaultError> {
        let amount = amount.floor_to(self.config.assets.reward.decimals);
        self.harvest_bounds().await?.check(amount)?;
        let pending = self.home.query_pending_rewards(self.account()).await?;

        Ok(HarvestPlan {
            amount,
            claim: pending.is_positive(),
        })
    }

    async fn execute_harvest(
        &self,
        run: &mut PipelineRun,
        plan: HarvestPlan,
    ) -> Result<(), VaultError> {
        let assets = &self.config.assets;
        run.hold(vec![holding(&assets.reward, plan.amount, LedgerId::Home, false)]);

        let initial = self.free_balance(LedgerId::Liquidity, &assets.reward).await?;
        let mut ops = Vec::with_capacity(2);
        if plan.claim {
            ops.push(Operation::ClaimRewards);
        }
        ops.push(Operation::Bridge {
            asset: assets.reward.clone(),
            amount: plan.amount,
            destination: LedgerId::Liquidity,
        });
        let result = self
            .submit_step(run, StepKind::ClaimAndBridge, LedgerId::Home, ops, Some(plan.amount))
            .await?;
        run.confirm(plan.amount, Some(result.block_hash));

        let bridged = self
            .await_arrival(run, LedgerId::Liquidity, &assets.reward, initial, plan.amount)
            .await?;

        let outputs = self
            .swap_step(run, vec![(assets.reward_to_collateral(), bridged)], Some(bridged))
            .await?;
        let collateral = sum_outputs(&outputs)?.floor_to(assets.collateral.decimals);

        self.return_and_deposit(run, collateral).await
    }

    /// Move `percent` collateral-ratio points between the vault and the
    /// staked liquidity position. The sign picks the direction.
    pub async fn rebalance(&self, percent: FixedPointAmount) -> Result<PipelineRun, PipelineError> {
        if percent.is_zero() {
            InputBounds::new(FixedPointAmount::ZERO, FixedPointAmount::ZERO).check(percent)?;
        }

        let context = self.rebalance_context().await?;
        match self.rebalance.validate(&context.bounds, percent)? {
            RebalanceDirection::Unstake { percent } => {
                let pair = self.config.assets.pair();
                let shares = RebalanceBoundsCalculator::shares_for_percent(
                    percent,
                    context.issued_value,
                    &context.position,
                )
                .map_err(VaultError::from)?
                .floor_to(pair.base.decimals);

                tracing::info!(
                    percent = %percent,
                    shares = %shares,
                    ratio = %context.snapshot.ratio,
                    "Rebalance: unstaking liquidity into collateral"
                );
                let mut run = PipelineRun::new(Workflow::RebalanceUnstake);
                let outcome = self.execute_unstake(&mut run, shares).await;
                self.finish(run, outcome).map(|(run, ())| run)
            }
            RebalanceDirection::Withdraw { percent } => {
                let collateral = &self.config.assets.collateral;
                let amount =
                    RebalanceBoundsCalculator::collateral_for_percent(percent, context.issued_value)
                        .map_err(VaultError::from)?
                        .floor_to(collateral.decimals);
                let min_split =
                    FixedPointAmount::new(2, collateral.decimals).map_err(VaultError::from)?;
                if amount < min_split {
                    return Err(VaultError::InsufficientFunds {
                        asset: collateral.symbol.clone(),
                        available: amount,
                        required: min_split,
                    }
                    .into());
                }

                tracing::info!(
                    percent = %percent,
                    amount = %amount,
                    ratio = %context.snapshot.ratio,
                    "Rebalance: withdrawing collateral into liquidity"
                );
                let mut run = PipelineRun::new(Workflow::RebalanceWithdraw);
                let outcome = self.execute_withdraw(&mut run, amount).await;
                self.finish(run, outcome).map(|(run, ())| run)
            }
        }
    }

    async fn execute_unstake(
        &self,
        run: &mut PipelineRun,
        shares: FixedPointAmount,
    ) -> Result<(), VaultError> {
        let assets = &self.config.assets;
        let pair = assets.pair();

        let ops = vec![
            Operation::UnstakeShares {
                pair: pair.clone(),
                shares,
            },
            Operation::RemoveLiquidity {
                pair: pair.clone(),
                shares,
            },
        ];
        let result = self
            .submit_step(run, StepKind::UnstakeLiquidity, LedgerId::Liquidity, ops, Some(shares))
            .await?;
        let removed = result.removed_liquidity()?;
        run.confirm(removed.shares, Some(result.block_hash));
        run.hold(vec![
            holding(&pair.base, removed.base_amount, LedgerId::Liquidity, false),
            holding(&pair.quote, removed.quote_amount, LedgerId::Liquidity, false),
        ]);

        let outputs = self
            .swap_step(
                run,
                vec![
                    (assets.stable_to_collateral(), removed.base_amount),
                    (assets.debt_to_collateral(), removed.quote_amount),
                ],
                None,
            )
            .await?;
        let collateral = sum_outputs(&outputs)?.floor_to(assets.collateral.decimals);

        self.return_and_deposit(run, collateral).await
    }

    async fn execute_withdraw(
        &self,
        run: &mut PipelineRun,
        amount: FixedPointAmount,
    ) -> Result<(), VaultError> {
        let assets = &self.config.assets;
        let collateral = &assets.collateral;
        run.hold(vec![holding(collateral, amount, LedgerId::Home, false)]);

        let initial = self.free_balance(LedgerId::Liquidity, collateral).await?;
        let ops = vec![
            Operation::WithdrawCollateral { amount },
            Operation::Bridge {
                asset: collateral.clone(),
                amount,
                destination: LedgerId::Liquidity,
            },
        ];
        let result = self
            .submit_step(run, StepKind::WithdrawAndBridge, LedgerId::Home, ops, Some(amount))
            .await?;
        run.confirm(amount, Some(result.block_hash));

        let arrived = self
            .await_arrival(run, LedgerId::Liquidity, collateral, initial, amount)
            .await?;

        // half buys the stable side of the pool, the rest the debt side
        let half = arrived
            .checked_div(FixedPointAmount::from_units(2))?
            .floor_to(collateral.decimals);
        let rest = arrived.checked_sub(half)?;
        let outputs = self
            .swap_step(
                run,
                vec![
                    (assets.collateral_to_stable(), half),
                    (assets.collateral_to_debt(), rest),
                ],
                Some(arrived),
            )
            .await?;
        let [stable, debt] = outputs.as_slice() else {
            return Err(VaultError::MissingEvent {
                event: "dex.Swap".to_string(),
            });
        };
        run.hold(vec![
            holding(&assets.stable, stable.output, LedgerId::Liquidity, false),
            holding(&assets.debt, debt.output, LedgerId::Liquidity, false),
        ]);
        let base = stable.output.floor_to(assets.stable.decimals);
        let quote = debt.output.floor_to(assets.debt.decimals);

        let ops = vec![Operation::AddLiquidity {
            pair: assets.pair(),
            base,
            quote,
            stake: true,
        }];
        let result = self
            .submit_step(run, StepKind::ProvideLiquidity, LedgerId::Liquidity, ops, Some(base))
            .await?;
        run.confirm(base, Some(result.block_hash));
        Ok(())
    }

    /// Bridge collateral home, wait for it, deposit exactly what arrived.
    async fn return_and_deposit(
        &self,
        run: &mut PipelineRun,
        amount: FixedPointAmount,
    ) -> Result<(), VaultError> {
        let collateral = &self.config.assets.collateral;
        run.hold(vec![holding(collateral, amount, LedgerId::Liquidity, false)]);

        let initial = self.free_balance(LedgerId::Home, collateral).await?;
        let ops = vec![Operation::Bridge {
            asset: collateral.clone(),
            amount,
            destination: LedgerId::Home,
        }];
        let result = self
            .submit_step(run, StepKind::BridgeBack, LedgerId::Liquidity, ops, Some(amount))
            .await?;
        run.confirm(amount, Some(result.block_hash));

        let arrived = self
            .await_arrival(run, LedgerId::Home, collateral, initial, amount)
            .await?;

        let ops = vec![Operation::DepositCollateral { amount: arrived }];
        let result = self
            .submit_step(run, StepKind::DepositCollateral, LedgerId::Home, ops, Some(arrived))
            .await?;
        run.confirm(arrived, Some(result.block_hash));
        Ok(())
    }

    /// Submit the swaps of one step as a batch; zero-supply legs are skipped.
    ///
    /// `supplied` is recorded as the step's request only when every leg
    /// spends the same asset.
    async fn swap_step(
        &self,
        run: &mut PipelineRun,
        legs: Vec<(Vec<Asset>, FixedPointAmount)>,
        supplied: Option<FixedPointAmount>,
    ) -> Result<Vec<SwapOutput>, VaultError> {
        let ops = legs
            .into_iter()
            .filter_map(|(path, supply)| {
                let decimals = path.first()?.decimals;
                let supply = supply.floor_to(decimals);
                supply.is_positive().then_some(Operation::Swap {
                    path,
                    supply,
                    min_output: FixedPointAmount::ZERO,
                })
            })
            .collect::<Vec<_>>();

        let result = self
            .submit_step(run, StepKind::Swap, LedgerId::Liquidity, ops, supplied)
            .await?;
        let outputs = result.swap_outputs()?;
        run.confirm(sum_outputs(&outputs)?, Some(result.block_hash));
        Ok(outputs)
    }

    async fn submit_step(
        &self,
        run: &mut PipelineRun,
        kind: StepKind,
        ledger: LedgerId,
        ops: Vec<Operation>,
        requested: Option<FixedPointAmount>,
    ) -> Result<FinalizedResult, VaultError> {
        run.begin(kind, ledger, requested);
        match ledger {
            LedgerId::Home => self.home_submitter.submit(ops).await,
            LedgerId::Liquidity => self.liquidity_submitter.submit(ops).await,
        }
    }

    /// Watch `ledger` for the arrival of a bridge transfer of `sent` units.
    ///
    /// `initial` must be read before the bridging submission.
    async fn await_arrival(
        &self,
        run: &mut PipelineRun,
        ledger: LedgerId,
        asset: &Asset,
        initial: FixedPointAmount,
        sent: FixedPointAmount,
    ) -> Result<FixedPointAmount, VaultError> {
        run.begin(StepKind::AwaitArrival, ledger, Some(sent));
        run.hold(vec![holding(asset, sent, ledger, true)]);

        let arrived = self
            .watcher
            .wait_for_change(initial, move || self.free_balance(ledger, asset))
            .await
            .map_err(|e| match e {
                WatchError::Timeout { iterations, .. } => VaultError::BridgeTimeout {
                    ledger,
                    asset: asset.symbol.clone(),
                    iterations,
                },
                WatchError::Amount(e) => VaultError::Amount(e),
            })?
            .floor_to(asset.decimals);

        run.confirm(arrived, None);
        run.hold(vec![holding(asset, arrived, ledger, false)]);
        Ok(arrived)
    }

    async fn free_balance(
        &self,
        ledger: LedgerId,
        asset: &Asset,
    ) -> Result<FixedPointAmount, LedgerError> {
        let balance = match ledger {
            LedgerId::Home => self.home.query_balance(self.account(), asset).await?,
            LedgerId::Liquidity => self.liquidity.query_balance(self.account(), asset).await?,
        };
        Ok(balance.spendable())
    }

    fn finish<T>(
        &self,
        mut run: PipelineRun,
        outcome: Result<T, VaultError>,
    ) -> Result<(PipelineRun, T), PipelineError> {
        match outcome {
            Ok(value) => {
                run.complete();
                tracing::info!(run = %run.id, workflow = ?run.workflow, steps = run.steps.len(), "Run completed");
                Ok((run, value))
            }
            Err(source) if run.steps.is_empty() => Err(PipelineError::Precondition(source)),
            Err(source) => {
                run.fail(&source);
                let step = run.current_step();
                tracing::error!(
                    run = %run.id,
                    workflow = ?run.workflow,
                    step,
                    error = %source,
                    retry_safe = source.is_retry_safe(),
                    holdings = ?run.holdings,
                    "Run halted"
                );
                Err(PipelineError::Halted {
                    run: Box::new(run),
                    step,
                    source,
                })
            }
        }
    }
}

fn holding(asset: &Asset, amount: FixedPointAmount, ledger: LedgerId, in_transit: bool) -> Holding {
    Holding {
        asset: asset.symbol.clone(),
        amount,
        ledger,
        in_transit,
    }
}

fn sum_outputs(outputs: &[SwapOutput]) -> Result<FixedPointAmount, VaultError> {
    outputs
        .iter()
        .try_fold(FixedPointAmount::ZERO, |acc, s| -> Result<_, VaultError> {
            Ok(acc.checked_add(s.output)?)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use kt_common::error::BoundViolation;
    use rust_decimal_macros::dec;

    use crate::sim::{Fault, SimNetwork};

    fn amt(value: Decimal) -> FixedPointAmount {
        FixedPointAmount::from(value)
    }

    fn config() -> AppConfig {
        AppConfig::with_account(AccountId::new("alice"))
    }

    #[test]
    fn test_state_names() {
        assert_eq!(PipelineState::Submitted(2).to_string(), "step2_submitted");
        assert_eq!(PipelineState::FailedAtStep(4).to_string(), "failed_at_step4");
    }

    #[test]
    fn test_run_records_steps() {
        let mut run = PipelineRun::new(Workflow::Harvest);
        run.begin(StepKind::ClaimAndBridge, LedgerId::Home, Some(amt(dec!(50))));
        run.confirm(amt(dec!(50)), Some(B256::ZERO));
        run.begin(StepKind::AwaitArrival, LedgerId::Liquidity, Some(amt(dec!(50))));
        run.confirm(amt(dec!(49.7)), None);

        assert_eq!(run.state, PipelineState::Confirmed(2));
        assert_eq!(run.last_observed(), Some(amt(dec!(49.7))));
        assert_eq!(run.step(1).unwrap().kind, StepKind::ClaimAndBridge);
        assert!(run.step(0).is_none());

        run.complete();
        assert!(run.is_completed());
        assert_eq!(run.state, PipelineState::Complete);
    }

    #[test]
    fn test_failed_run_serializes_holdings() {
        let mut run = PipelineRun::new(Workflow::Harvest);
        run.begin(StepKind::AwaitArrival, LedgerId::Liquidity, Some(amt(dec!(50))));
        run.hold(vec![Holding {
            asset: "KINT".to_string(),
            amount: amt(dec!(50)),
            ledger: LedgerId::Liquidity,
            in_transit: true,
        }]);
        run.fail(&VaultError::BridgeTimeout {
            ledger: LedgerId::Liquidity,
            asset: "KINT".to_string(),
            iterations: 12,
        });

        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"]["status"], "failed_at_step");
        assert_eq!(json["status"]["step"], 1);
        assert_eq!(json["status"]["holdings"][0]["in_transit"], true);
        assert_eq!(json["state"]["state"], "failed_at_step");
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_and_bounds_on_paper_network() {
        let config = config();
        let network = SimNetwork::paper(&config);
        let home = network.home(config.account.clone());
        let liquidity = network.liquidity(config.account.clone());
        let orchestrator = PipelineOrchestrator::new(&home, &liquidity, &network, &config);

        let snapshot = orchestrator.snapshot().await.unwrap();
        assert_eq!(snapshot.price, amt(dec!(700)));
        assert!(snapshot.ratio.at_least(amt(dec!(285))));

        let harvest = orchestrator.harvest_bounds().await.unwrap();
        // 5 free + 120 pending - 1 reserve
        assert_eq!(harvest.max, amt(dec!(124)));
        assert_eq!(harvest.min, amt(dec!(1)));

        let rebalance = orchestrator.rebalance_bounds().await.unwrap();
        assert_eq!(rebalance.positive, amt(dec!(40)));
        assert!(rebalance.negative.is_negative());
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_mint_rejects_ratio_above_current() {
        let config = config();
        let network = SimNetwork::paper(&config);
        let home = network.home(config.account.clone());
        let liquidity = network.liquidity(config.account.clone());
        let orchestrator = PipelineOrchestrator::new(&home, &liquidity, &network, &config);

        let err = orchestrator.self_mint(amt(dec!(400))).await.unwrap_err();
        assert!(matches!(
            err.cause(),
            VaultError::InvalidUserBound {
                violation: BoundViolation::TooHigh,
                ..
            }
        ));
        assert!(err.run().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_first_step_halts_with_funds_at_source() {
        let config = config();
        let network = SimNetwork::paper(&config);
        network.inject_fault(LedgerId::Home, Fault::Drop);
        let home = network.home(config.account.clone());
        let liquidity = network.liquidity(config.account.clone());
        let orchestrator = PipelineOrchestrator::new(&home, &liquidity, &network, &config)
            .with_watcher(BalanceWatcher::new(3, Duration::from_secs(1)));

        let err = orchestrator.harvest(amt(dec!(50))).await.unwrap_err();

        let PipelineError::Halted { run, step, source } = err else {
            panic!("expected a halted run");
        };
        assert_eq!(step, 1);
        assert!(source.is_retry_safe());
        assert_eq!(run.state, PipelineState::FailedAtStep(1));
        assert_eq!(
            run.holdings,
            vec![Holding {
                asset: "KINT".to_string(),
                amount: amt(dec!(50)),
                ledger: LedgerId::Home,
                in_transit: false,
            }]
        );
    }
}
