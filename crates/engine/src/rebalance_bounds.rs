//! Two-sided adjustment window for moving value between the staked liquidity
//! position and the vault collateral.
//!
//! Bounds are expressed in collateral-ratio percentage points:
//! - positive: ratio increase reachable by unstaking the whole position and
//!   depositing its collateral value.
//! - negative: ratio decrease allowed before hitting the safety floor.

use serde::Serialize;

use kt_common::amount::FixedPointAmount;
use kt_common::config::{AppConfig, AssetBook};
use kt_common::error::{AmountError, VaultError};
use kt_common::types::{AccountId, LiquidityPair};

use crate::capacity::CollateralRatio;
use crate::ledger::{InputBounds, LiquidityLedger, PoolReserves};

/// Price of the pair's quote asset in base units: `reserve_base / reserve_quote`.
pub fn pool_price(reserves: &PoolReserves) -> Result<FixedPointAmount, AmountError> {
    reserves.base.checked_div(reserves.quote)
}

/// The signer's staked pool shares and what they are worth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiquidityPosition {
    pub shares: FixedPointAmount,
    pub total_shares: FixedPointAmount,
    /// Base-asset (stable) amount redeemable for `shares`.
    pub base_amount: FixedPointAmount,
    /// Quote-asset (debt) amount redeemable for `shares`.
    pub quote_amount: FixedPointAmount,
    pub value_in_collateral: FixedPointAmount,
}

impl LiquidityPosition {
    pub fn empty() -> Self {
        Self {
            shares: FixedPointAmount::ZERO,
            total_shares: FixedPointAmount::ZERO,
            base_amount: FixedPointAmount::ZERO,
            quote_amount: FixedPointAmount::ZERO,
            value_in_collateral: FixedPointAmount::ZERO,
        }
    }

    /// Value `shares` of a pool.
    ///
    /// `quote_price` is the quote asset in base units (the pool price) and
    /// `collateral_price` the collateral asset in base units.
    pub fn value(
        shares: FixedPointAmount,
        total_shares: FixedPointAmount,
        reserves: PoolReserves,
        quote_price: FixedPointAmount,
        collateral_price: FixedPointAmount,
    ) -> Result<Self, AmountError> {
        if shares.is_zero() || total_shares.is_zero() {
            return Ok(Self::empty());
        }

        let base_amount = reserves.base.checked_mul(shares)?.checked_div(total_shares)?;
        let quote_amount = reserves.quote.checked_mul(shares)?.checked_div(total_shares)?;
        let value_in_base = base_amount.checked_add(quote_amount.checked_mul(quote_price)?)?;
        let value_in_collateral = value_in_base.checked_div(collateral_price)?;

        Ok(Self {
            shares,
            total_shares,
            base_amount,
            quote_amount,
            value_in_collateral,
        })
    }

    /// Read and value the signer's staked position in the debt pool.
    pub async fn read<L>(
        liquidity: &L,
        account: &AccountId,
        assets: &AssetBook,
    ) -> Result<Self, VaultError>
    where
        L: LiquidityLedger + ?Sized,
    {
        let pair = assets.pair();
        let shares = liquidity.staked_shares(account, &pair).await?;
        if shares.is_zero() {
            return Ok(Self::empty());
        }

        let total_shares = liquidity.total_shares(&pair).await?;
        let reserves = liquidity.pool_reserves(&pair).await?;
        let collateral_pool = LiquidityPair::new(assets.stable.clone(), assets.collateral.clone());
        let collateral_reserves = liquidity.pool_reserves(&collateral_pool).await?;

        let position = Self::value(
            shares,
            total_shares,
            reserves,
            pool_price(&reserves)?,
            pool_price(&collateral_reserves)?,
        )?;

        tracing::debug!(
            shares = %position.shares,
            base = %position.base_amount,
            quote = %position.quote_amount,
            value = %position.value_in_collateral,
            "Liquidity position valued"
        );
        Ok(position)
    }
}

/// `negative <= 0 <= positive` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RebalanceBounds {
    pub negative: FixedPointAmount,
    pub positive: FixedPointAmount,
}

impl RebalanceBounds {
    pub fn closed() -> Self {
        Self {
            negative: FixedPointAmount::ZERO,
            positive: FixedPointAmount::ZERO,
        }
    }

    pub fn to_input_bounds(&self) -> InputBounds {
        InputBounds::new(self.negative, self.positive)
    }
}

/// Pipeline direction selected by the sign of a rebalance request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceDirection {
    /// Unstake liquidity and deposit it as collateral.
    Unstake { percent: FixedPointAmount },
    /// Withdraw collateral and provide it as liquidity.
    Withdraw { percent: FixedPointAmount },
}

#[derive(Debug, Clone)]
pub struct RebalanceBoundsCalculator {
    floor: FixedPointAmount,
}

impl RebalanceBoundsCalculator {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            floor: config.rebalance_floor_ratio,
        }
    }

    pub fn floor(&self) -> FixedPointAmount {
        self.floor
    }

    /// Without issued debt a percentage move is undefined, so the window closes.
    pub fn bounds(
        &self,
        ratio: CollateralRatio,
        issued_value: FixedPointAmount,
        position: &LiquidityPosition,
    ) -> Result<RebalanceBounds, AmountError> {
        let current = match ratio {
            CollateralRatio::Finite(value) if !issued_value.is_zero() => value,
            _ => return Ok(RebalanceBounds::closed()),
        };

        let positive = position
            .value_in_collateral
            .checked_div(issued_value)?
            .checked_mul(FixedPointAmount::ONE_HUNDRED)?
            .clamp_non_negative();
        let negative = self.floor.checked_sub(current)?.clamp_non_positive();

        Ok(RebalanceBounds { negative, positive })
    }

    pub fn validate(
        &self,
        bounds: &RebalanceBounds,
        requested: FixedPointAmount,
    ) -> Result<RebalanceDirection, VaultError> {
        bounds.to_input_bounds().check(requested)?;

        if requested.is_positive() {
            Ok(RebalanceDirection::Unstake { percent: requested })
        } else {
            Ok(RebalanceDirection::Withdraw {
                percent: requested.abs(),
            })
        }
    }

    /// Collateral that moves the ratio by `percent` points.
    pub fn collateral_for_percent(
        percent: FixedPointAmount,
        issued_value: FixedPointAmount,
    ) -> Result<FixedPointAmount, AmountError> {
        percent.percent_to_factor()?.checked_mul(issued_value)
    }

    /// Shares whose collateral value lifts the ratio by `percent` points,
    /// capped at the position size.
    pub fn shares_for_percent(
        percent: FixedPointAmount,
        issued_value: FixedPointAmount,
        position: &LiquidityPosition,
    ) -> Result<FixedPointAmount, AmountError> {
        let needed = Self::collateral_for_percent(percent, issued_value)?;
        let shares = needed
            .checked_mul(position.shares)?
            .checked_div(position.value_in_collateral)?;
        Ok(shares.min(position.shares))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kt_common::error::BoundViolation;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn amt(value: Decimal) -> FixedPointAmount {
        FixedPointAmount::from(value)
    }

    fn calculator() -> RebalanceBoundsCalculator {
        RebalanceBoundsCalculator::new(&AppConfig::with_account(AccountId::new("alice")))
    }

    /// 1% of a 210000 kUSD / 10 kBTC pool, kBTC at 21000 kUSD, KSM at 30 kUSD.
    fn position() -> LiquidityPosition {
        let reserves = PoolReserves {
            base: amt(dec!(210000)),
            quote: amt(dec!(10)),
        };
        LiquidityPosition::value(
            amt(dec!(4200)),
            amt(dec!(420000)),
            reserves,
            pool_price(&reserves).unwrap(),
            amt(dec!(30)),
        )
        .unwrap()
    }

    #[test]
    fn test_position_value() {
        let position = position();
        assert_eq!(position.base_amount, amt(dec!(2100)));
        assert_eq!(position.quote_amount, amt(dec!(0.1)));
        // 2100 + 0.1 * 21000 = 4200 kUSD = 140 KSM
        assert_eq!(position.value_in_collateral, amt(dec!(140)));
    }

    #[test]
    fn test_empty_position() {
        let position = LiquidityPosition::value(
            FixedPointAmount::ZERO,
            amt(dec!(100)),
            PoolReserves {
                base: amt(dec!(1)),
                quote: amt(dec!(1)),
            },
            FixedPointAmount::ONE,
            FixedPointAmount::ONE,
        )
        .unwrap();
        assert_eq!(position, LiquidityPosition::empty());
    }

    #[test]
    fn test_bounds_straddle_zero() {
        // 1000 KSM against 350 KSM of debt → 285.71%
        let ratio = CollateralRatio::Finite(amt(dec!(1000)).checked_div(amt(dec!(3.5))).unwrap());
        let bounds = calculator().bounds(ratio, amt(dec!(350)), &position()).unwrap();

        assert_eq!(bounds.positive, amt(dec!(40)));
        assert!(bounds.negative < FixedPointAmount::ZERO);
        assert!(bounds.negative > amt(dec!(-25.72)));
        assert!(bounds.negative <= FixedPointAmount::ZERO && FixedPointAmount::ZERO <= bounds.positive);
    }

    #[test]
    fn test_negative_bound_zero_below_floor() {
        let bounds = calculator()
            .bounds(CollateralRatio::Finite(amt(dec!(240))), amt(dec!(350)), &position())
            .unwrap();
        assert_eq!(bounds.negative, FixedPointAmount::ZERO);
        assert!(bounds.positive.is_positive());
    }

    #[test]
    fn test_unbounded_ratio_closes_window() {
        let bounds = calculator()
            .bounds(CollateralRatio::Unbounded, FixedPointAmount::ZERO, &position())
            .unwrap();
        assert_eq!(bounds, RebalanceBounds::closed());
    }

    #[test]
    fn test_validate_selects_direction() {
        let bounds = RebalanceBounds {
            negative: amt(dec!(-25)),
            positive: amt(dec!(40)),
        };

        assert_eq!(
            calculator().validate(&bounds, amt(dec!(10))).unwrap(),
            RebalanceDirection::Unstake { percent: amt(dec!(10)) }
        );
        assert_eq!(
            calculator().validate(&bounds, amt(dec!(-5))).unwrap(),
            RebalanceDirection::Withdraw { percent: amt(dec!(5)) }
        );
    }

    #[test]
    fn test_validate_rejects_zero_and_out_of_range() {
        let bounds = RebalanceBounds {
            negative: amt(dec!(-25)),
            positive: amt(dec!(40)),
        };

        for (requested, expected) in [
            (dec!(0), BoundViolation::Zero),
            (dec!(-26), BoundViolation::TooLow),
            (dec!(41), BoundViolation::TooHigh),
        ] {
            let err = calculator().validate(&bounds, amt(requested)).unwrap_err();
            assert!(
                matches!(err, VaultError::InvalidUserBound { violation, .. } if violation == expected),
                "{requested}: {err}"
            );
        }
    }

    #[test]
    fn test_shares_for_percent() {
        // 10 points of a 350 KSM debt = 35 KSM; one share is worth 140/4200 KSM
        let shares =
            RebalanceBoundsCalculator::shares_for_percent(amt(dec!(10)), amt(dec!(350)), &position())
                .unwrap();
        assert_eq!(shares, amt(dec!(1050)));

        let all = RebalanceBoundsCalculator::shares_for_percent(amt(dec!(40)), amt(dec!(350)), &position())
            .unwrap();
        assert_eq!(all, amt(dec!(4200)));
    }

    #[test]
    fn test_collateral_for_percent() {
        let amount =
            RebalanceBoundsCalculator::collateral_for_percent(amt(dec!(20)), amt(dec!(350))).unwrap();
        assert_eq!(amount, amt(dec!(70)));
    }
}
