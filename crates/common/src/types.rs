use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

use crate::amount::FixedPointAmount;
use crate::error::VaultError;

/// The two ledgers the runner drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerId {
    /// Ledger holding the vault (issue, collateral, rewards).
    Home,
    /// Ledger hosting the exchange and the liquidity pool.
    Liquidity,
}

impl LedgerId {
    pub fn counterpart(self) -> Self {
        match self {
            LedgerId::Home => LedgerId::Liquidity,
            LedgerId::Liquidity => LedgerId::Home,
        }
    }
}

impl std::fmt::Display for LedgerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerId::Home => write!(f, "home"),
            LedgerId::Liquidity => write!(f, "liquidity"),
        }
    }
}

/// Signing identity, identical on both ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A token known to both ledgers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Asset {
    pub symbol: String,
    /// Digits of the smallest on-chain unit.
    pub decimals: u32,
}

impl Asset {
    pub fn new(symbol: impl Into<String>, decimals: u32) -> Self {
        Self {
            symbol: symbol.into(),
            decimals,
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol)
    }
}

/// A two-asset liquidity pool on the liquidity ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LiquidityPair {
    pub base: Asset,
    pub quote: Asset,
}

impl LiquidityPair {
    pub fn new(base: Asset, quote: Asset) -> Self {
        Self { base, quote }
    }

    /// Symbol of the share token minted by the pool.
    pub fn share_symbol(&self) -> String {
        format!("LP_{}_{}", self.base.symbol, self.quote.symbol)
    }
}

/// Per-asset balance record. Only `free` is ever spendable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Balance {
    pub free: FixedPointAmount,
    pub reserved: FixedPointAmount,
}

impl Balance {
    pub fn new(free: FixedPointAmount, reserved: FixedPointAmount) -> Self {
        Self { free, reserved }
    }

    pub fn spendable(&self) -> FixedPointAmount {
        self.free
    }
}

/// Vault state as read from the home ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub account: AccountId,
    pub collateral_asset: Asset,
    pub debt_asset: Asset,
    /// Locked collateral (the reserved collateral balance).
    pub collateral: FixedPointAmount,
    pub issued: FixedPointAmount,
    pub to_be_issued: FixedPointAmount,
    pub active: bool,
    pub unbanned: bool,
    pub accepting_issues: bool,
}

/// A single ledger operation. Encoding and signing belong to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Withdraw accrued vault rewards into the free reward balance.
    ClaimRewards,
    Bridge {
        asset: Asset,
        amount: FixedPointAmount,
        destination: LedgerId,
    },
    /// Swap an exact `supply` of `path[0]` along `path`.
    Swap {
        path: Vec<Asset>,
        supply: FixedPointAmount,
        min_output: FixedPointAmount,
    },
    DepositCollateral {
        amount: FixedPointAmount,
    },
    WithdrawCollateral {
        amount: FixedPointAmount,
    },
    AcceptNewIssues {
        accept: bool,
    },
    RequestIssue {
        amount: FixedPointAmount,
    },
    /// Withdraw staked pool shares into the free share balance.
    UnstakeShares {
        pair: LiquidityPair,
        shares: FixedPointAmount,
    },
    RemoveLiquidity {
        pair: LiquidityPair,
        shares: FixedPointAmount,
    },
    AddLiquidity {
        pair: LiquidityPair,
        base: FixedPointAmount,
        quote: FixedPointAmount,
        stake: bool,
    },
}

impl Operation {
    /// `section.call` label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            Operation::ClaimRewards => "fee.withdrawRewards",
            Operation::Bridge { .. } => "xTokens.transfer",
            Operation::Swap { .. } => "dex.swapWithExactSupply",
            Operation::DepositCollateral { .. } => "vaultRegistry.depositCollateral",
            Operation::WithdrawCollateral { .. } => "vaultRegistry.withdrawCollateral",
            Operation::AcceptNewIssues { .. } => "vaultRegistry.acceptNewIssues",
            Operation::RequestIssue { .. } => "issue.requestIssue",
            Operation::UnstakeShares { .. } => "incentives.withdrawDexShare",
            Operation::RemoveLiquidity { .. } => "dex.removeLiquidity",
            Operation::AddLiquidity { .. } => "dex.addLiquidity",
        }
    }
}

/// An event emitted by a finalized submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub section: String,
    pub method: String,
    /// Named event fields; amounts are decimal strings in token units.
    pub data: serde_json::Value,
}

impl LedgerEvent {
    pub fn new(section: &str, method: &str, data: serde_json::Value) -> Self {
        Self {
            section: section.to_string(),
            method: method.to_string(),
            data,
        }
    }

    pub fn is(&self, section: &str, method: &str) -> bool {
        self.section == section && self.method == method
    }

    fn amount(&self, key: &str) -> Result<FixedPointAmount, VaultError> {
        self.data
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| VaultError::MalformedEvent {
                event: format!("{}.{}", self.section, self.method),
                field: key.to_string(),
            })
    }
}

/// Output of one `dex.Swap` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapOutput {
    pub supply: FixedPointAmount,
    pub output: FixedPointAmount,
}

/// Assets released by one `dex.RemoveLiquidity` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedLiquidity {
    pub base_amount: FixedPointAmount,
    pub quote_amount: FixedPointAmount,
    pub shares: FixedPointAmount,
}

/// Payment details of an accepted issue request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueReceipt {
    pub request_id: String,
    pub amount: FixedPointAmount,
    pub fee: FixedPointAmount,
    /// Address the issuer must pay the debt asset's backing coin to.
    pub deposit_address: String,
}

impl IssueReceipt {
    /// Amount the issuer must send: issued amount plus fee.
    pub fn amount_to_send(&self) -> Result<FixedPointAmount, VaultError> {
        Ok(self.amount.checked_add(self.fee)?)
    }
}

/// Terminal, irreversible result of a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizedResult {
    pub block_hash: B256,
    pub events: Vec<LedgerEvent>,
}

impl FinalizedResult {
    fn events_of<'a>(
        &'a self,
        section: &'a str,
        method: &'a str,
    ) -> impl Iterator<Item = &'a LedgerEvent> + 'a {
        self.events.iter().filter(move |e| e.is(section, method))
    }

    /// Every `dex.Swap` in emission order. Fails if none was emitted.
    pub fn swap_outputs(&self) -> Result<Vec<SwapOutput>, VaultError> {
        let outputs = self
            .events_of("dex", "Swap")
            .map(|e| {
                Ok(SwapOutput {
                    supply: e.amount("supply")?,
                    output: e.amount("output")?,
                })
            })
            .collect::<Result<Vec<_>, VaultError>>()?;

        if outputs.is_empty() {
            return Err(VaultError::MissingEvent {
                event: "dex.Swap".to_string(),
            });
        }
        Ok(outputs)
    }

    /// Sum of all swap outputs in this result.
    pub fn total_swap_output(&self) -> Result<FixedPointAmount, VaultError> {
        self.swap_outputs()?
            .iter()
            .try_fold(FixedPointAmount::ZERO, |acc, s| -> Result<_, VaultError> {
                Ok(acc.checked_add(s.output)?)
            })
    }

    pub fn removed_liquidity(&self) -> Result<RemovedLiquidity, VaultError> {
        let event = self
            .events_of("dex", "RemoveLiquidity")
            .next()
            .ok_or_else(|| VaultError::MissingEvent {
                event: "dex.RemoveLiquidity".to_string(),
            })?;

        Ok(RemovedLiquidity {
            base_amount: event.amount("base_amount")?,
            quote_amount: event.amount("quote_amount")?,
            shares: event.amount("shares")?,
        })
    }

    pub fn issue_request(&self) -> Result<IssueReceipt, VaultError> {
        let event = self
            .events_of("issue", "RequestIssue")
            .next()
            .ok_or_else(|| VaultError::MissingEvent {
                event: "issue.RequestIssue".to_string(),
            })?;

        let text = |key: &str| {
            event
                .data
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| VaultError::MalformedEvent {
                    event: "issue.RequestIssue".to_string(),
                    field: key.to_string(),
                })
        };

        Ok(IssueReceipt {
            request_id: text("request_id")?,
            amount: event.amount("amount")?,
            fee: event.amount("fee")?,
            deposit_address: text("vault_address")?,
        })
    }

    /// True when the ledger reports that a batch stopped part-way.
    pub fn is_batch_interrupted(&self) -> bool {
        self.events_of("utility", "BatchInterrupted").next().is_some()
    }
}

/// Tagged outcome of handing a submission to a ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Finalized(FinalizedResult),
    /// Dropped or reorged before finalization; resubmitting is safe.
    Dropped { reason: String },
    /// Rejected by validation; must not be resubmitted unmodified.
    Invalid { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn finalized(events: Vec<LedgerEvent>) -> FinalizedResult {
        FinalizedResult {
            block_hash: B256::ZERO,
            events,
        }
    }

    #[test]
    fn test_swap_outputs_summed_in_order() {
        let result = finalized(vec![
            LedgerEvent::new("dex", "Swap", serde_json::json!({"supply": "10", "output": "1.5"})),
            LedgerEvent::new("system", "ExtrinsicSuccess", serde_json::json!({})),
            LedgerEvent::new("dex", "Swap", serde_json::json!({"supply": "4", "output": "0.25"})),
        ]);

        let outputs = result.swap_outputs().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[1].output, FixedPointAmount::from(dec!(0.25)));
        assert_eq!(result.total_swap_output().unwrap(), FixedPointAmount::from(dec!(1.75)));
    }

    #[test]
    fn test_swap_outputs_missing_event() {
        let result = finalized(vec![]);
        assert!(matches!(
            result.swap_outputs(),
            Err(VaultError::MissingEvent { .. })
        ));
    }

    #[test]
    fn test_malformed_amount_field() {
        let result = finalized(vec![LedgerEvent::new(
            "dex",
            "Swap",
            serde_json::json!({"supply": "10", "output": 3}),
        )]);
        assert!(matches!(
            result.swap_outputs(),
            Err(VaultError::MalformedEvent { field, .. }) if field == "output"
        ));
    }

    #[test]
    fn test_issue_request_receipt() {
        let result = finalized(vec![LedgerEvent::new(
            "issue",
            "RequestIssue",
            serde_json::json!({
                "request_id": "0x01",
                "amount": "0.5",
                "fee": "0.0025",
                "vault_address": "bc1qexample",
            }),
        )]);

        let receipt = result.issue_request().unwrap();
        assert_eq!(receipt.deposit_address, "bc1qexample");
        assert_eq!(receipt.amount_to_send().unwrap(), FixedPointAmount::from(dec!(0.5025)));
    }

    #[test]
    fn test_batch_interrupted_detection() {
        let ok = finalized(vec![LedgerEvent::new("utility", "BatchCompleted", serde_json::json!({}))]);
        let broken = finalized(vec![LedgerEvent::new(
            "utility",
            "BatchInterrupted",
            serde_json::json!({"index": 1}),
        )]);
        assert!(!ok.is_batch_interrupted());
        assert!(broken.is_batch_interrupted());
    }

    #[test]
    fn test_spendable_ignores_reserved() {
        let balance = Balance::new(FixedPointAmount::from(dec!(3)), FixedPointAmount::from(dec!(100)));
        assert_eq!(balance.spendable(), FixedPointAmount::from(dec!(3)));
    }

    #[test]
    fn test_ledger_display() {
        assert_eq!(LedgerId::Home.to_string(), "home");
        assert_eq!(LedgerId::Liquidity.counterpart(), LedgerId::Home);
    }
}
