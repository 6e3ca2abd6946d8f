//! In-memory paper network.
//!
//! A home ledger with vaults and rewards and a liquidity ledger with an
//! exchange, joined by a bridge that delivers after a delay and clips a
//! per-asset fee. Submissions are atomic: a batch runs against a draft of the
//! state and is committed only if every call succeeds. Faults can be queued per
//! ledger to make the next submission drop, fail validation or finalize
//! partially.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex as SubmissionSlot;
use tokio::time::Instant;

use kt_common::amount::FixedPointAmount;
use kt_common::config::AppConfig;
use kt_common::error::{AmountError, LedgerError};
use kt_common::types::{
    AccountId, Asset, Balance, FinalizedResult, LedgerEvent, LedgerId, LiquidityPair, Operation,
    SubmissionOutcome, Vault,
};

use crate::ledger::{HomeLedger, LedgerClient, LiquidityLedger, PoolReserves, PriceOracle};

/// Share tokens carry twelve decimals on the exchange.
const SHARE_DECIMALS: u32 = 12;

/// Outcome forced onto the next submission to a ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Dropped from the pool before finalization; nothing changes.
    Drop,
    /// Rejected by validation; nothing changes.
    Invalid,
    /// Only the first call commits and the batch reports an interruption.
    Interrupt,
}

#[derive(Debug, Clone)]
pub struct SimSettings {
    pub bridge_delay: Duration,
    /// Flat fee taken from every swap output, in output units.
    pub swap_fee: FixedPointAmount,
    /// Issue fee as a fraction of the requested amount.
    pub issue_fee_rate: FixedPointAmount,
    pub deposit_address: String,
    /// Symbol prices are quoted against by the oracle.
    pub collateral_symbol: String,
    /// Asset paid out by `ClaimRewards`.
    pub reward_symbol: String,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            bridge_delay: Duration::from_secs(3),
            swap_fee: FixedPointAmount::ZERO,
            issue_fee_rate: FixedPointAmount::from_decimal(rust_decimal::Decimal::new(5, 3)),
            deposit_address: "bc1qpaper0vault0deposit0address".to_string(),
            collateral_symbol: "KSM".to_string(),
            reward_symbol: "KINT".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Pool {
    base: FixedPointAmount,
    quote: FixedPointAmount,
    total_shares: FixedPointAmount,
}

#[derive(Debug, Clone)]
struct Transfer {
    destination: LedgerId,
    account: AccountId,
    symbol: String,
    amount: FixedPointAmount,
    arrives_at: Instant,
}

/// Why a call could not be applied.
struct Rejection(String);

impl From<AmountError> for Rejection {
    fn from(e: AmountError) -> Self {
        Rejection(e.to_string())
    }
}

fn reject<T>(reason: impl Into<String>) -> Result<T, Rejection> {
    Err(Rejection(reason.into()))
}

type BalanceKey = (LedgerId, AccountId, String);

#[derive(Debug, Clone, Default)]
struct NetworkState {
    balances: HashMap<BalanceKey, Balance>,
    vaults: HashMap<AccountId, Vault>,
    pending_rewards: HashMap<AccountId, FixedPointAmount>,
    /// Prices in stable units, used by swaps and the oracle.
    prices: HashMap<String, FixedPointAmount>,
    bridge_fees: HashMap<String, FixedPointAmount>,
    /// Per-asset override of `SimSettings::bridge_delay`.
    bridge_delays: HashMap<String, Duration>,
    pools: HashMap<String, Pool>,
    staked: HashMap<(AccountId, String), FixedPointAmount>,
    transfers: Vec<Transfer>,
    faults: HashMap<LedgerId, VecDeque<Fault>>,
    /// Call labels every submission rejects.
    disabled: HashSet<&'static str>,
    blocks: u64,
    issue_requests: u64,
}

impl NetworkState {
    fn balance(&self, ledger: LedgerId, account: &AccountId, symbol: &str) -> Balance {
        self.balances
            .get(&(ledger, account.clone(), symbol.to_string()))
            .copied()
            .unwrap_or_default()
    }

    fn balance_mut(&mut self, ledger: LedgerId, account: &AccountId, symbol: &str) -> &mut Balance {
        self.balances
            .entry((ledger, account.clone(), symbol.to_string()))
            .or_default()
    }

    fn credit(
        &mut self,
        ledger: LedgerId,
        account: &AccountId,
        symbol: &str,
        amount: FixedPointAmount,
    ) -> Result<(), Rejection> {
        let balance = self.balance_mut(ledger, account, symbol);
        balance.free = balance.free.checked_add(amount)?;
        Ok(())
    }

    fn debit(
        &mut self,
        ledger: LedgerId,
        account: &AccountId,
        symbol: &str,
        amount: FixedPointAmount,
    ) -> Result<(), Rejection> {
        if !amount.is_positive() {
            return reject(format!("{symbol} amount must be positive, got {amount}"));
        }
        let balance = self.balance_mut(ledger, account, symbol);
        if balance.free < amount {
            return reject(format!(
                "insufficient {symbol}: {} free, {amount} required",
                balance.free
            ));
        }
        balance.free = balance.free.checked_sub(amount)?;
        Ok(())
    }

    /// Deliver every transfer whose arrival time has passed.
    fn settle(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) = self
            .transfers
            .drain(..)
            .partition(|t| t.arrives_at <= now);
        self.transfers = waiting;

        for transfer in due {
            let balance = self.balance_mut(transfer.destination, &transfer.account, &transfer.symbol);
            match balance.free.checked_add(transfer.amount) {
                Ok(free) => balance.free = free,
                Err(e) => tracing::warn!(error = %e, symbol = %transfer.symbol, "Dropping undeliverable transfer"),
            }
        }
    }

    fn next_block_hash(&mut self) -> B256 {
        self.blocks += 1;
        B256::left_padding_from(&self.blocks.to_be_bytes())
    }

    fn next_fault(&mut self, ledger: LedgerId) -> Option<Fault> {
        self.faults.get_mut(&ledger).and_then(VecDeque::pop_front)
    }

    fn price(&self, symbol: &str) -> Result<FixedPointAmount, Rejection> {
        match self.prices.get(symbol) {
            Some(price) if price.is_positive() => Ok(*price),
            _ => reject(format!("no market for {symbol}")),
        }
    }

    fn pool_mut(&mut self, pair: &LiquidityPair) -> Result<&mut Pool, Rejection> {
        let symbol = pair.share_symbol();
        match self.pools.get_mut(&symbol) {
            Some(pool) => Ok(pool),
            None => reject(format!("no pool {symbol}")),
        }
    }

    fn vault_mut(&mut self, account: &AccountId) -> Result<&mut Vault, Rejection> {
        match self.vaults.get_mut(account) {
            Some(vault) => Ok(vault),
            None => reject(format!("{account} has no vault")),
        }
    }

    fn apply(
        &mut self,
        ledger: LedgerId,
        account: &AccountId,
        op: &Operation,
        settings: &SimSettings,
        now: Instant,
    ) -> Result<Vec<LedgerEvent>, Rejection> {
        match (ledger, op) {
            (_, Operation::Bridge {
                asset,
                amount,
                destination,
            }) => {
                if *destination != ledger.counterpart() {
                    return reject("bridge destination must be the other ledger");
                }
                self.debit(ledger, account, &asset.symbol, *amount)?;

                let fee = self
                    .bridge_fees
                    .get(&asset.symbol)
                    .copied()
                    .unwrap_or_default();
                let delivered = amount.checked_sub(fee)?.clamp_non_negative();
                let delay = self
                    .bridge_delays
                    .get(&asset.symbol)
                    .copied()
                    .unwrap_or(settings.bridge_delay);
                if delivered.is_positive() {
                    self.transfers.push(Transfer {
                        destination: *destination,
                        account: account.clone(),
                        symbol: asset.symbol.clone(),
                        amount: delivered,
                        arrives_at: now + delay,
                    });
                }

                Ok(vec![LedgerEvent::new(
                    "xTokens",
                    "Transferred",
                    json!({
                        "asset": asset.symbol,
                        "amount": amount.to_string(),
                        "destination": destination.to_string(),
                    }),
                )])
            }

            (LedgerId::Home, Operation::ClaimRewards) => {
                let pending = self.pending_rewards.remove(account).unwrap_or_default();
                if pending.is_positive() {
                    self.credit(ledger, account, &settings.reward_symbol, pending)?;
                }
                Ok(vec![LedgerEvent::new(
                    "fee",
                    "WithdrawRewards",
                    json!({ "amount": pending.to_string() }),
                )])
            }

            (LedgerId::Home, Operation::DepositCollateral { amount }) => {
                let symbol = self.vault_mut(account)?.collateral_asset.symbol.clone();
                self.debit(ledger, account, &symbol, *amount)?;
                let balance = self.balance_mut(ledger, account, &symbol);
                balance.reserved = balance.reserved.checked_add(*amount)?;
                Ok(vec![LedgerEvent::new(
                    "vaultRegistry",
                    "DepositCollateral",
                    json!({ "amount": amount.to_string() }),
                )])
            }

            (LedgerId::Home, Operation::WithdrawCollateral { amount }) => {
                let symbol = self.vault_mut(account)?.collateral_asset.symbol.clone();
                if !amount.is_positive() {
                    return reject("withdraw amount must be positive");
                }
                let balance = self.balance_mut(ledger, account, &symbol);
                if balance.reserved < *amount {
                    return reject(format!(
                        "vault holds {} {symbol}, cannot withdraw {amount}",
                        balance.reserved
                    ));
                }
                balance.reserved = balance.reserved.checked_sub(*amount)?;
                balance.free = balance.free.checked_add(*amount)?;
                Ok(vec![LedgerEvent::new(
                    "vaultRegistry",
                    "WithdrawCollateral",
                    json!({ "amount": amount.to_string() }),
                )])
            }

            (LedgerId::Home, Operation::AcceptNewIssues { accept }) => {
                self.vault_mut(account)?.accepting_issues = *accept;
                Ok(vec![LedgerEvent::new(
                    "vaultRegistry",
                    "SetAcceptNewIssues",
                    json!({ "accept": accept }),
                )])
            }

            (LedgerId::Home, Operation::RequestIssue { amount }) => {
                let vault = self.vault_mut(account)?;
                if !vault.active || !vault.unbanned {
                    return reject("vault cannot issue");
                }
                if !vault.accepting_issues {
                    return reject("vault is not accepting issue requests");
                }
                if !amount.is_positive() {
                    return reject("issue amount must be positive");
                }
                let fee = amount
                    .checked_mul(settings.issue_fee_rate)?
                    .floor_to(vault.debt_asset.decimals);
                vault.to_be_issued = vault.to_be_issued.checked_add(*amount)?;

                self.issue_requests += 1;
                Ok(vec![LedgerEvent::new(
                    "issue",
                    "RequestIssue",
                    json!({
                        "request_id": format!("0x{:064x}", self.issue_requests),
                        "amount": amount.to_string(),
                        "fee": fee.to_string(),
                        "vault_address": settings.deposit_address,
                    }),
                )])
            }

            (LedgerId::Liquidity, Operation::Swap {
                path,
                supply,
                min_output,
            }) => {
                let (Some(input), Some(output)) = (path.first(), path.last()) else {
                    return reject("empty swap path");
                };
                if path.len() < 2 {
                    return reject("swap path needs two assets");
                }
                self.debit(ledger, account, &input.symbol, *supply)?;

                let received = supply
                    .checked_mul(self.price(&input.symbol)?)?
                    .checked_div(self.price(&output.symbol)?)?
                    .floor_to(output.decimals)
                    .checked_sub(settings.swap_fee)?;
                if !received.is_positive() {
                    return reject("swap output does not cover the fee");
                }
                if received < *min_output {
                    return reject(format!("output {received} below minimum {min_output}"));
                }
                self.credit(ledger, account, &output.symbol, received)?;

                Ok(vec![LedgerEvent::new(
                    "dex",
                    "Swap",
                    json!({
                        "path": path.iter().map(|a| a.symbol.clone()).collect::<Vec<_>>(),
                        "supply": supply.to_string(),
                        "output": received.to_string(),
                    }),
                )])
            }

            (LedgerId::Liquidity, Operation::UnstakeShares { pair, shares }) => {
                let key = (account.clone(), pair.share_symbol());
                let staked = self.staked.get(&key).copied().unwrap_or_default();
                if !shares.is_positive() || staked < *shares {
                    return reject(format!("{staked} shares staked, cannot unstake {shares}"));
                }
                self.staked.insert(key, staked.checked_sub(*shares)?);
                self.credit(ledger, account, &pair.share_symbol(), *shares)?;
                Ok(vec![LedgerEvent::new(
                    "incentives",
                    "WithdrawDexShare",
                    json!({ "shares": shares.to_string() }),
                )])
            }

            (LedgerId::Liquidity, Operation::RemoveLiquidity { pair, shares }) => {
                self.debit(ledger, account, &pair.share_symbol(), *shares)?;
                let pool = self.pool_mut(pair)?;
                if pool.total_shares < *shares {
                    return reject("more shares than issued");
                }
                let base = pool
                    .base
                    .checked_mul(*shares)?
                    .checked_div(pool.total_shares)?
                    .floor_to(pair.base.decimals);
                let quote = pool
                    .quote
                    .checked_mul(*shares)?
                    .checked_div(pool.total_shares)?
                    .floor_to(pair.quote.decimals);
                pool.base = pool.base.checked_sub(base)?;
                pool.quote = pool.quote.checked_sub(quote)?;
                pool.total_shares = pool.total_shares.checked_sub(*shares)?;

                self.credit(ledger, account, &pair.base.symbol, base)?;
                self.credit(ledger, account, &pair.quote.symbol, quote)?;
                Ok(vec![LedgerEvent::new(
                    "dex",
                    "RemoveLiquidity",
                    json!({
                        "base_amount": base.to_string(),
                        "quote_amount": quote.to_string(),
                        "shares": shares.to_string(),
                    }),
                )])
            }

            (LedgerId::Liquidity, Operation::AddLiquidity {
                pair,
                base,
                quote,
                stake,
            }) => {
                self.debit(ledger, account, &pair.base.symbol, *base)?;
                self.debit(ledger, account, &pair.quote.symbol, *quote)?;
                let pool = self.pool_mut(pair)?;
                let minted = if pool.base.is_zero() || pool.total_shares.is_zero() {
                    *base
                } else {
                    base.checked_mul(pool.total_shares)?.checked_div(pool.base)?
                };
                let minted = minted.floor_to(SHARE_DECIMALS);
                pool.base = pool.base.checked_add(*base)?;
                pool.quote = pool.quote.checked_add(*quote)?;
                pool.total_shares = pool.total_shares.checked_add(minted)?;

                let mut events = vec![LedgerEvent::new(
                    "dex",
                    "AddLiquidity",
                    json!({
                        "base_amount": base.to_string(),
                        "quote_amount": quote.to_string(),
                        "shares": minted.to_string(),
                    }),
                )];
                if *stake {
                    let key = (account.clone(), pair.share_symbol());
                    let staked = self.staked.get(&key).copied().unwrap_or_default();
                    self.staked.insert(key, staked.checked_add(minted)?);
                    events.push(LedgerEvent::new(
                        "incentives",
                        "DepositDexShare",
                        json!({ "shares": minted.to_string() }),
                    ));
                } else {
                    self.credit(ledger, account, &pair.share_symbol(), minted)?;
                }
                Ok(events)
            }

            (ledger, op) => reject(format!("{} is not available on the {ledger} ledger", op.label())),
        }
    }
}

/// Shared handle to the paper network. Clones see the same state.
#[derive(Debug, Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<NetworkState>>,
    settings: Arc<SimSettings>,
    home_slot: Arc<SubmissionSlot<()>>,
    liquidity_slot: Arc<SubmissionSlot<()>>,
}

impl SimNetwork {
    pub fn new(settings: SimSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(NetworkState::default())),
            settings: Arc::new(settings),
            home_slot: Arc::new(SubmissionSlot::new(())),
            liquidity_slot: Arc::new(SubmissionSlot::new(())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn home(&self, account: AccountId) -> SimLedger {
        SimLedger {
            network: self.clone(),
            ledger: LedgerId::Home,
            account,
            slot: self.home_slot.clone(),
        }
    }

    pub fn liquidity(&self, account: AccountId) -> SimLedger {
        SimLedger {
            network: self.clone(),
            ledger: LedgerId::Liquidity,
            account,
            slot: self.liquidity_slot.clone(),
        }
    }

    /// Set the free balance, keeping whatever is reserved.
    pub fn set_balance(
        &self,
        ledger: LedgerId,
        account: &AccountId,
        asset: &Asset,
        free: FixedPointAmount,
    ) {
        self.lock().balance_mut(ledger, account, &asset.symbol).free = free;
    }

    /// Current balance after delivering due transfers.
    pub fn balance(&self, ledger: LedgerId, account: &AccountId, asset: &Asset) -> Balance {
        let mut state = self.lock();
        state.settle(Instant::now());
        state.balance(ledger, account, &asset.symbol)
    }

    /// Register a vault; its collateral becomes the reserved collateral balance.
    pub fn set_vault(&self, vault: Vault) {
        let mut state = self.lock();
        state
            .balance_mut(LedgerId::Home, &vault.account, &vault.collateral_asset.symbol)
            .reserved = vault.collateral;
        state.vaults.insert(vault.account.clone(), vault);
    }

    pub fn vault(&self, account: &AccountId) -> Option<Vault> {
        let state = self.lock();
        state.vaults.get(account).map(|vault| with_locked_collateral(&state, vault))
    }

    pub fn set_pending_rewards(&self, account: &AccountId, amount: FixedPointAmount) {
        self.lock().pending_rewards.insert(account.clone(), amount);
    }

    /// Price of one unit of `asset` in stable units.
    pub fn set_price(&self, asset: &Asset, price: FixedPointAmount) {
        self.lock().prices.insert(asset.symbol.clone(), price);
    }

    /// Delivery delay for transfers of `asset`, overriding the default.
    pub fn set_bridge_delay(&self, asset: &Asset, delay: Duration) {
        self.lock().bridge_delays.insert(asset.symbol.clone(), delay);
    }

    /// Amount the bridge keeps from every transfer of `asset`.
    pub fn set_bridge_fee(&self, asset: &Asset, fee: FixedPointAmount) {
        self.lock().bridge_fees.insert(asset.symbol.clone(), fee);
    }

    pub fn add_pool(
        &self,
        pair: &LiquidityPair,
        base: FixedPointAmount,
        quote: FixedPointAmount,
        total_shares: FixedPointAmount,
    ) {
        self.lock().pools.insert(
            pair.share_symbol(),
            Pool {
                base,
                quote,
                total_shares,
            },
        );
    }

    pub fn set_staked_shares(&self, account: &AccountId, pair: &LiquidityPair, shares: FixedPointAmount) {
        self.lock()
            .staked
            .insert((account.clone(), pair.share_symbol()), shares);
    }

    pub fn staked(&self, account: &AccountId, pair: &LiquidityPair) -> FixedPointAmount {
        self.lock()
            .staked
            .get(&(account.clone(), pair.share_symbol()))
            .copied()
            .unwrap_or_default()
    }

    /// Reject every later call labelled `label` as invalid.
    pub fn disable_call(&self, label: &'static str) {
        self.lock().disabled.insert(label);
    }

    pub fn inject_fault(&self, ledger: LedgerId, fault: Fault) {
        self.lock().faults.entry(ledger).or_default().push_back(fault);
    }

    /// Sum of undelivered bridge transfers of `asset` heading to `destination`.
    pub fn in_transit(&self, destination: LedgerId, asset: &Asset) -> FixedPointAmount {
        let mut state = self.lock();
        state.settle(Instant::now());
        state
            .transfers
            .iter()
            .filter(|t| t.destination == destination && t.symbol == asset.symbol)
            .fold(FixedPointAmount::ZERO, |acc, t| {
                acc.checked_add(t.amount).unwrap_or(acc)
            })
    }

    /// A network seeded with a healthy vault for `config.account`.
    ///
    /// 1000 collateral against 0.5 debt at 700 collateral per debt unit
    /// (285.71%), 120 pending rewards and 1% of the stable/debt pool staked.
    pub fn paper(config: &AppConfig) -> Self {
        let assets = &config.assets;
        let network = Self::new(SimSettings {
            collateral_symbol: assets.collateral.symbol.clone(),
            reward_symbol: assets.reward.symbol.clone(),
            swap_fee: FixedPointAmount::ZERO,
            ..SimSettings::default()
        });
        let units = FixedPointAmount::from_units;
        let fixed = |digits: i64, scale: u32| {
            FixedPointAmount::from_decimal(rust_decimal::Decimal::new(digits, scale))
        };
        let account = &config.account;

        network.set_price(&assets.stable, units(1));
        network.set_price(&assets.collateral, units(30));
        network.set_price(&assets.staking, fixed(45, 1));
        network.set_price(&assets.reward, fixed(6, 1));
        network.set_price(&assets.debt, units(21000));
        network.set_bridge_fee(&assets.reward, fixed(3, 1));
        network.set_bridge_fee(&assets.collateral, fixed(1, 3));

        network.add_pool(&assets.pair(), units(210_000), units(10), units(420_000));
        network.add_pool(
            &LiquidityPair::new(assets.stable.clone(), assets.collateral.clone()),
            units(300_000),
            units(10_000),
            units(600_000),
        );
        network.set_staked_shares(account, &assets.pair(), units(4200));

        network.set_vault(Vault {
            account: account.clone(),
            collateral_asset: assets.collateral.clone(),
            debt_asset: assets.debt.clone(),
            collateral: units(1000),
            issued: fixed(5, 1),
            to_be_issued: FixedPointAmount::ZERO,
            active: true,
            unbanned: true,
            accepting_issues: false,
        });
        network.set_pending_rewards(account, units(120));
        network.set_balance(LedgerId::Home, account, &assets.reward, units(5));

        network
    }
}

fn with_locked_collateral(state: &NetworkState, vault: &Vault) -> Vault {
    let locked = state
        .balance(LedgerId::Home, &vault.account, &vault.collateral_asset.symbol)
        .reserved;
    Vault {
        collateral: locked,
        ..vault.clone()
    }
}

#[async_trait]
impl PriceOracle for SimNetwork {
    async fn price(&self, asset: &Asset) -> Result<FixedPointAmount, LedgerError> {
        let state = self.lock();
        let quote = |symbol: &str| {
            state.price(symbol).map_err(|Rejection(message)| LedgerError::Query {
                ledger: LedgerId::Home,
                message,
            })
        };
        let asset_price = quote(&asset.symbol)?;
        let collateral_price = quote(&self.settings.collateral_symbol)?;

        asset_price
            .checked_div(collateral_price)
            .map_err(|e| LedgerError::Query {
                ledger: LedgerId::Home,
                message: e.to_string(),
            })
    }
}

/// One ledger of a [`SimNetwork`], bound to a signing account.
#[derive(Debug, Clone)]
pub struct SimLedger {
    network: SimNetwork,
    ledger: LedgerId,
    account: AccountId,
    /// Shared by every handle to this ledger.
    slot: Arc<SubmissionSlot<()>>,
}

impl SimLedger {
    fn query_error(&self, message: impl Into<String>) -> LedgerError {
        LedgerError::Query {
            ledger: self.ledger,
            message: message.into(),
        }
    }

    fn execute(&self, ops: &[Operation], batch: bool) -> SubmissionOutcome {
        let mut state = self.network.lock();
        let now = Instant::now();
        state.settle(now);

        let fault = state.next_fault(self.ledger);
        match fault {
            Some(Fault::Drop) => {
                return SubmissionOutcome::Dropped {
                    reason: "dropped from the transaction pool".to_string(),
                };
            }
            Some(Fault::Invalid) => {
                return SubmissionOutcome::Invalid {
                    reason: "bad proof".to_string(),
                };
            }
            Some(Fault::Interrupt) | None => {}
        }

        let mut draft = state.clone();
        let mut events = Vec::new();
        let settings = &self.network.settings;
        let interrupt = fault == Some(Fault::Interrupt);

        for (index, op) in ops.iter().enumerate() {
            if interrupt && index == 1 {
                events.push(LedgerEvent::new(
                    "utility",
                    "BatchInterrupted",
                    json!({ "index": index, "error": "injected fault" }),
                ));
                break;
            }
            let applied = if draft.disabled.contains(op.label()) {
                reject(format!("{} is disabled", op.label()))
            } else {
                draft.apply(self.ledger, &self.account, op, settings, now)
            };
            match applied {
                Ok(emitted) => events.extend(emitted),
                Err(Rejection(reason)) => {
                    tracing::debug!(ledger = %self.ledger, call = op.label(), reason = %reason, "Paper call rejected");
                    return SubmissionOutcome::Invalid {
                        reason: format!("call {index} ({}) failed: {reason}", op.label()),
                    };
                }
            }
        }

        if batch && !interrupt {
            events.push(LedgerEvent::new("utility", "BatchCompleted", json!({})));
        }

        let block_hash = draft.next_block_hash();
        *state = draft;
        SubmissionOutcome::Finalized(FinalizedResult { block_hash, events })
    }
}

#[async_trait]
impl LedgerClient for SimLedger {
    fn ledger(&self) -> LedgerId {
        self.ledger
    }

    fn submission_slot(&self) -> &SubmissionSlot<()> {
        &self.slot
    }

    async fn query_balance(&self, account: &AccountId, asset: &Asset) -> Result<Balance, LedgerError> {
        Ok(self.network.balance(self.ledger, account, asset))
    }

    async fn query_vault_state(&self, account: &AccountId) -> Result<Option<Vault>, LedgerError> {
        if self.ledger != LedgerId::Home {
            return Ok(None);
        }
        Ok(self.network.vault(account))
    }

    async fn submit(&self, op: Operation) -> Result<SubmissionOutcome, LedgerError> {
        Ok(self.execute(std::slice::from_ref(&op), false))
    }

    async fn submit_batch(&self, ops: Vec<Operation>) -> Result<SubmissionOutcome, LedgerError> {
        Ok(self.execute(&ops, true))
    }
}

#[async_trait]
impl HomeLedger for SimLedger {
    async fn query_pending_rewards(&self, account: &AccountId) -> Result<FixedPointAmount, LedgerError> {
        if self.ledger != LedgerId::Home {
            return Err(self.query_error("vault rewards live on the home ledger"));
        }
        Ok(self
            .network
            .lock()
            .pending_rewards
            .get(account)
            .copied()
            .unwrap_or_default())
    }
}

#[async_trait]
impl LiquidityLedger for SimLedger {
    async fn pool_reserves(&self, pair: &LiquidityPair) -> Result<PoolReserves, LedgerError> {
        let state = self.network.lock();
        let pool = state
            .pools
            .get(&pair.share_symbol())
            .ok_or_else(|| self.query_error(format!("no pool {}", pair.share_symbol())))?;
        Ok(PoolReserves {
            base: pool.base,
            quote: pool.quote,
        })
    }

    async fn total_shares(&self, pair: &LiquidityPair) -> Result<FixedPointAmount, LedgerError> {
        let state = self.network.lock();
        state
            .pools
            .get(&pair.share_symbol())
            .map(|pool| pool.total_shares)
            .ok_or_else(|| self.query_error(format!("no pool {}", pair.share_symbol())))
    }

    async fn staked_shares(
        &self,
        account: &AccountId,
        pair: &LiquidityPair,
    ) -> Result<FixedPointAmount, LedgerError> {
        Ok(self.network.staked(account, pair))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn amt(value: Decimal) -> FixedPointAmount {
        FixedPointAmount::from(value)
    }

    fn alice() -> AccountId {
        AccountId::new("alice")
    }

    fn ksm() -> Asset {
        Asset::new("KSM", 12)
    }

    fn kint() -> Asset {
        Asset::new("KINT", 12)
    }

    fn finalized(outcome: SubmissionOutcome) -> FinalizedResult {
        match outcome {
            SubmissionOutcome::Finalized(result) => result,
            other => panic!("expected finalization, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_delivers_after_delay_minus_fee() {
        let network = SimNetwork::new(SimSettings::default());
        network.set_balance(LedgerId::Home, &alice(), &kint(), amt(dec!(60)));
        network.set_bridge_fee(&kint(), amt(dec!(0.3)));
        let home = network.home(alice());

        let outcome = home
            .submit(Operation::Bridge {
                asset: kint(),
                amount: amt(dec!(50)),
                destination: LedgerId::Liquidity,
            })
            .await
            .unwrap();
        finalized(outcome);

        assert_eq!(network.balance(LedgerId::Home, &alice(), &kint()).free, amt(dec!(10)));
        assert_eq!(network.balance(LedgerId::Liquidity, &alice(), &kint()).free, FixedPointAmount::ZERO);
        assert_eq!(network.in_transit(LedgerId::Liquidity, &kint()), amt(dec!(49.7)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(network.balance(LedgerId::Liquidity, &alice(), &kint()).free, amt(dec!(49.7)));
        assert_eq!(network.in_transit(LedgerId::Liquidity, &kint()), FixedPointAmount::ZERO);
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let network = SimNetwork::new(SimSettings::default());
        network.set_balance(LedgerId::Home, &alice(), &kint(), amt(dec!(10)));
        let home = network.home(alice());

        let outcome = home
            .submit_batch(vec![
                Operation::Bridge {
                    asset: kint(),
                    amount: amt(dec!(4)),
                    destination: LedgerId::Liquidity,
                },
                Operation::Bridge {
                    asset: kint(),
                    amount: amt(dec!(40)),
                    destination: LedgerId::Liquidity,
                },
            ])
            .await
            .unwrap();

        assert!(matches!(outcome, SubmissionOutcome::Invalid { ref reason } if reason.starts_with("call 1")));
        assert_eq!(network.balance(LedgerId::Home, &alice(), &kint()).free, amt(dec!(10)));
        assert_eq!(network.in_transit(LedgerId::Liquidity, &kint()), FixedPointAmount::ZERO);
    }

    #[tokio::test]
    async fn test_swap_uses_price_table_and_fee() {
        let network = SimNetwork::new(SimSettings {
            swap_fee: amt(dec!(0.01)),
            ..SimSettings::default()
        });
        network.set_price(&kint(), amt(dec!(2)));
        network.set_price(&ksm(), amt(dec!(10)));
        network.set_balance(LedgerId::Liquidity, &alice(), &kint(), amt(dec!(49.7)));
        let liquidity = network.liquidity(alice());

        let result = finalized(
            liquidity
                .submit(Operation::Swap {
                    path: vec![kint(), Asset::new("KUSD", 12), ksm()],
                    supply: amt(dec!(49.7)),
                    min_output: FixedPointAmount::ZERO,
                })
                .await
                .unwrap(),
        );

        assert_eq!(result.total_swap_output().unwrap(), amt(dec!(9.93)));
        assert_eq!(network.balance(LedgerId::Liquidity, &alice(), &ksm()).free, amt(dec!(9.93)));
    }

    #[tokio::test]
    async fn test_issue_requires_accepting_vault() {
        let config = AppConfig::with_account(alice());
        let network = SimNetwork::paper(&config);
        let home = network.home(alice());
        let request = Operation::RequestIssue {
            amount: amt(dec!(0.04)),
        };

        let closed = home.submit(request.clone()).await.unwrap();
        assert!(matches!(closed, SubmissionOutcome::Invalid { .. }));

        let result = finalized(
            home.submit_batch(vec![
                Operation::AcceptNewIssues { accept: true },
                request,
                Operation::AcceptNewIssues { accept: false },
            ])
            .await
            .unwrap(),
        );

        let receipt = result.issue_request().unwrap();
        assert_eq!(receipt.fee, amt(dec!(0.0002)));
        let vault = network.vault(&alice()).unwrap();
        assert_eq!(vault.to_be_issued, amt(dec!(0.04)));
        assert!(!vault.accepting_issues);
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw_move_reserved_collateral() {
        let config = AppConfig::with_account(alice());
        let network = SimNetwork::paper(&config);
        network.set_balance(LedgerId::Home, &alice(), &ksm(), amt(dec!(5)));
        let home = network.home(alice());

        finalized(home.submit(Operation::DepositCollateral { amount: amt(dec!(5)) }).await.unwrap());
        assert_eq!(network.vault(&alice()).unwrap().collateral, amt(dec!(1005)));

        finalized(home.submit(Operation::WithdrawCollateral { amount: amt(dec!(105)) }).await.unwrap());
        assert_eq!(network.vault(&alice()).unwrap().collateral, amt(dec!(900)));
        assert_eq!(network.balance(LedgerId::Home, &alice(), &ksm()).free, amt(dec!(105)));
    }

    #[tokio::test]
    async fn test_unstake_and_remove_liquidity() {
        let config = AppConfig::with_account(alice());
        let network = SimNetwork::paper(&config);
        let pair = config.assets.pair();
        let liquidity = network.liquidity(alice());

        let result = finalized(
            liquidity
                .submit_batch(vec![
                    Operation::UnstakeShares {
                        pair: pair.clone(),
                        shares: amt(dec!(1050)),
                    },
                    Operation::RemoveLiquidity {
                        pair: pair.clone(),
                        shares: amt(dec!(1050)),
                    },
                ])
                .await
                .unwrap(),
        );

        let removed = result.removed_liquidity().unwrap();
        assert_eq!(removed.base_amount, amt(dec!(525)));
        assert_eq!(removed.quote_amount, amt(dec!(0.025)));
        assert_eq!(network.staked(&alice(), &pair), amt(dec!(3150)));
        assert_eq!(liquidity.total_shares(&pair).await.unwrap(), amt(dec!(418950)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_delay_override_is_per_asset() {
        let network = SimNetwork::new(SimSettings::default());
        network.set_balance(LedgerId::Liquidity, &alice(), &ksm(), amt(dec!(10)));
        network.set_balance(LedgerId::Liquidity, &alice(), &kint(), amt(dec!(10)));
        network.set_bridge_delay(&ksm(), Duration::from_secs(60));
        let liquidity = network.liquidity(alice());

        for asset in [ksm(), kint()] {
            finalized(
                liquidity
                    .submit(Operation::Bridge {
                        asset,
                        amount: amt(dec!(10)),
                        destination: LedgerId::Home,
                    })
                    .await
                    .unwrap(),
            );
        }

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(network.balance(LedgerId::Home, &alice(), &kint()).free, amt(dec!(10)));
        assert_eq!(network.in_transit(LedgerId::Home, &ksm()), amt(dec!(10)));

        tokio::time::sleep(Duration::from_secs(57)).await;
        assert_eq!(network.balance(LedgerId::Home, &alice(), &ksm()).free, amt(dec!(10)));
    }

    #[tokio::test]
    async fn test_disabled_call_rejects_whole_batch() {
        let config = AppConfig::with_account(alice());
        let network = SimNetwork::paper(&config);
        network.set_balance(LedgerId::Home, &alice(), &ksm(), amt(dec!(5)));
        network.disable_call("xTokens.transfer");
        let home = network.home(alice());

        let outcome = home
            .submit_batch(vec![
                Operation::DepositCollateral { amount: amt(dec!(1)) },
                Operation::Bridge {
                    asset: ksm(),
                    amount: amt(dec!(1)),
                    destination: LedgerId::Liquidity,
                },
            ])
            .await
            .unwrap();

        assert!(matches!(outcome, SubmissionOutcome::Invalid { ref reason } if reason.contains("xTokens.transfer is disabled")));
        assert_eq!(network.vault(&alice()).unwrap().collateral, amt(dec!(1000)));
        finalized(home.submit(Operation::DepositCollateral { amount: amt(dec!(1)) }).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_faults_leave_state_untouched() {
        let network = SimNetwork::new(SimSettings::default());
        network.set_balance(LedgerId::Home, &alice(), &kint(), amt(dec!(10)));
        network.inject_fault(LedgerId::Home, Fault::Drop);
        network.inject_fault(LedgerId::Home, Fault::Invalid);
        let home = network.home(alice());
        let bridge = Operation::Bridge {
            asset: kint(),
            amount: amt(dec!(4)),
            destination: LedgerId::Liquidity,
        };

        let first = home.submit(bridge.clone()).await.unwrap();
        let second = home.submit(bridge.clone()).await.unwrap();
        assert!(matches!(first, SubmissionOutcome::Dropped { .. }));
        assert!(matches!(second, SubmissionOutcome::Invalid { .. }));
        assert_eq!(network.balance(LedgerId::Home, &alice(), &kint()).free, amt(dec!(10)));

        finalized(home.submit(bridge).await.unwrap());
        assert_eq!(network.balance(LedgerId::Home, &alice(), &kint()).free, amt(dec!(6)));
    }

    #[tokio::test]
    async fn test_oracle_quotes_in_collateral() {
        let network = SimNetwork::paper(&AppConfig::with_account(alice()));
        let price = network.price(&Asset::new("KBTC", 8)).await.unwrap();
        assert_eq!(price, amt(dec!(700)));
    }
}
