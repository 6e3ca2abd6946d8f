use std::str::FromStr;

use serde::Deserialize;

use crate::amount::FixedPointAmount;
use crate::types::{AccountId, Asset, LiquidityPair};

/// Tokens involved in the vault workflows, with their on-chain precision.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AssetBook {
    /// Locked in the vault on the home ledger (KSM).
    pub collateral: Asset,
    /// Issued against the collateral (kBTC).
    pub debt: Asset,
    /// Vault rewards, also the issue-fee asset (KINT).
    pub reward: Asset,
    /// Stable asset routing most swaps (kUSD).
    pub stable: Asset,
    /// Liquid-staking hop used when selling collateral (LKSM).
    pub staking: Asset,
}

impl AssetBook {
    /// The stable/debt pool whose staked shares back rebalancing.
    pub fn pair(&self) -> LiquidityPair {
        LiquidityPair::new(self.stable.clone(), self.debt.clone())
    }

    pub fn reward_to_collateral(&self) -> Vec<Asset> {
        vec![
            self.reward.clone(),
            self.stable.clone(),
            self.collateral.clone(),
        ]
    }

    pub fn stable_to_collateral(&self) -> Vec<Asset> {
        vec![self.stable.clone(), self.collateral.clone()]
    }

    pub fn debt_to_collateral(&self) -> Vec<Asset> {
        vec![
            self.debt.clone(),
            self.stable.clone(),
            self.collateral.clone(),
        ]
    }

    pub fn collateral_to_stable(&self) -> Vec<Asset> {
        vec![
            self.collateral.clone(),
            self.staking.clone(),
            self.stable.clone(),
        ]
    }

    pub fn collateral_to_debt(&self) -> Vec<Asset> {
        vec![
            self.collateral.clone(),
            self.staking.clone(),
            self.stable.clone(),
            self.debt.clone(),
        ]
    }
}

impl Default for AssetBook {
    fn default() -> Self {
        Self {
            collateral: Asset::new("KSM", 12),
            debt: Asset::new("KBTC", 8),
            reward: Asset::new("KINT", 12),
            stable: Asset::new("KUSD", 12),
            staking: Asset::new("LKSM", 12),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Signing identity used on both ledgers
    pub account: AccountId,

    /// Lowest collateral ratio (%) a self-mint may target (default: 261)
    pub min_issue_ratio: FixedPointAmount,

    /// Safety floor (%) a collateral withdrawal must keep (default: 260)
    pub rebalance_floor_ratio: FixedPointAmount,

    /// Mint capacity below this is dust and is not requested (default: 0.0001)
    pub min_mint_capacity: FixedPointAmount,

    /// Reward-asset balance needed to pay issue fees (default: 0.01)
    pub min_fee_balance: FixedPointAmount,

    /// To-be-issued amount above which a request counts as pending (default: 0.0001)
    pub pending_issue_epsilon: FixedPointAmount,

    /// Smallest harvest worth bridging (default: 1)
    pub min_harvest: FixedPointAmount,

    /// Reward units left on the home ledger for fees (default: 1)
    pub reward_fee_reserve: FixedPointAmount,

    /// Balance polls before a bridge transfer is reported as timed out (default: 12)
    pub watcher_max_iterations: u32,

    /// Delay between balance polls in milliseconds (default: 1000)
    pub watcher_interval_ms: u64,

    pub assets: AssetBook,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::with_account(AccountId::new(""));

        Ok(Self {
            account: std::env::var("SIGNER_ADDRESS")
                .map(AccountId::new)
                .map_err(|_| anyhow::anyhow!("SIGNER_ADDRESS environment variable is required"))?,
            min_issue_ratio: env_or("MIN_ISSUE_RATIO", defaults.min_issue_ratio)?,
            rebalance_floor_ratio: env_or("REBALANCE_FLOOR_RATIO", defaults.rebalance_floor_ratio)?,
            min_mint_capacity: env_or("MIN_MINT_CAPACITY", defaults.min_mint_capacity)?,
            min_fee_balance: env_or("MIN_FEE_BALANCE", defaults.min_fee_balance)?,
            pending_issue_epsilon: env_or("PENDING_ISSUE_EPSILON", defaults.pending_issue_epsilon)?,
            min_harvest: env_or("MIN_HARVEST", defaults.min_harvest)?,
            reward_fee_reserve: env_or("REWARD_FEE_RESERVE", defaults.reward_fee_reserve)?,
            watcher_max_iterations: env_or("WATCHER_MAX_ITERATIONS", defaults.watcher_max_iterations)?,
            watcher_interval_ms: env_or("WATCHER_INTERVAL_MS", defaults.watcher_interval_ms)?,
            assets: AssetBook {
                collateral: asset_from_env("COLLATERAL", &defaults.assets.collateral)?,
                debt: asset_from_env("DEBT", &defaults.assets.debt)?,
                reward: asset_from_env("REWARD", &defaults.assets.reward)?,
                stable: asset_from_env("STABLE", &defaults.assets.stable)?,
                staking: asset_from_env("STAKING", &defaults.assets.staking)?,
            },
        })
    }

    /// Default thresholds for the given signer.
    pub fn with_account(account: AccountId) -> Self {
        Self {
            account,
            min_issue_ratio: FixedPointAmount::from_units(261),
            rebalance_floor_ratio: FixedPointAmount::from_units(260),
            min_mint_capacity: fixed(1, 4),
            min_fee_balance: fixed(1, 2),
            pending_issue_epsilon: fixed(1, 4),
            min_harvest: FixedPointAmount::ONE,
            reward_fee_reserve: FixedPointAmount::ONE,
            watcher_max_iterations: 12,
            watcher_interval_ms: 1000,
            assets: AssetBook::default(),
        }
    }
}

fn fixed(digits: i64, scale: u32) -> FixedPointAmount {
    FixedPointAmount::from_decimal(rust_decimal::Decimal::new(digits, scale))
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} has an invalid value: {raw}")),
        Err(_) => Ok(default),
    }
}

fn asset_from_env(prefix: &str, default: &Asset) -> anyhow::Result<Asset> {
    let symbol = std::env::var(format!("{prefix}_SYMBOL")).unwrap_or_else(|_| default.symbol.clone());
    let decimals = env_or(&format!("{prefix}_DECIMALS"), default.decimals)?;
    Ok(Asset::new(symbol, decimals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::with_account(AccountId::new("alice"));
        assert_eq!(config.min_issue_ratio, FixedPointAmount::from(dec!(261)));
        assert_eq!(config.rebalance_floor_ratio, FixedPointAmount::from(dec!(260)));
        assert_eq!(config.min_mint_capacity, FixedPointAmount::from(dec!(0.0001)));
        assert_eq!(config.min_fee_balance, FixedPointAmount::from(dec!(0.01)));
        assert_eq!(config.watcher_max_iterations, 12);
        assert_eq!(config.watcher_interval_ms, 1000);
    }

    #[test]
    fn test_swap_routes() {
        let assets = AssetBook::default();
        let symbols = |path: Vec<Asset>| path.into_iter().map(|a| a.symbol).collect::<Vec<_>>();

        assert_eq!(symbols(assets.reward_to_collateral()), ["KINT", "KUSD", "KSM"]);
        assert_eq!(symbols(assets.collateral_to_debt()), ["KSM", "LKSM", "KUSD", "KBTC"]);
        assert_eq!(assets.pair().share_symbol(), "LP_KUSD_KBTC");
    }

    #[test]
    fn test_env_or_falls_back_to_default() {
        let value: u32 = env_or("KT_TEST_UNSET_VARIABLE", 7).unwrap();
        assert_eq!(value, 7);
    }
}
