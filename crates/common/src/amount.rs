//! Fixed-point money type shared by every component.
//!
//! `FixedPointAmount` wraps `rust_decimal::Decimal` (96-bit mantissa plus an
//! explicit base-10 scale). Amounts are expressed in whole token units, e.g.
//! `49.7` KINT rather than `49_700_000_000_000` planck.
//!
//! Rounding rules:
//! - `checked_mul` / `checked_div` normalise to [`WORKING_SCALE`] digits,
//!   truncating toward negative infinity.
//! - Anything placed into a ledger operation goes through
//!   [`FixedPointAmount::floor_to`] first, so a request never exceeds the
//!   funds it was derived from.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::AmountError;

/// Scale (digits after the decimal point) kept by products and quotients.
pub const WORKING_SCALE: u32 = 18;

/// Largest token precision accepted by chain-unit conversions.
const MAX_TOKEN_DECIMALS: u32 = 18;

/// Exact decimal amount with an explicit scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FixedPointAmount(Decimal);

impl FixedPointAmount {
    pub const ZERO: Self = Self(Decimal::ZERO);
    pub const ONE: Self = Self(Decimal::ONE);
    pub const ONE_HUNDRED: Self = Self(Decimal::ONE_HUNDRED);

    /// Build from raw digits and a scale: `new(4970, 2)` is `49.70`.
    pub fn new(digits: i64, scale: u32) -> Result<Self, AmountError> {
        Decimal::try_from_i128_with_scale(i128::from(digits), scale)
            .map(Self)
            .map_err(|_| AmountError::Overflow)
    }

    pub const fn from_decimal(value: Decimal) -> Self {
        Self(value)
    }

    pub fn from_units(units: u64) -> Self {
        Self(Decimal::from(units))
    }

    /// Convert a raw ledger integer into token units.
    ///
    /// `from_chain_units(49_700_000_000_000, 12)` is `49.7`.
    pub fn from_chain_units(raw: u128, decimals: u32) -> Result<Self, AmountError> {
        if decimals > MAX_TOKEN_DECIMALS {
            return Err(AmountError::UnsupportedDecimals(decimals));
        }
        let mantissa = i128::try_from(raw).map_err(|_| AmountError::Overflow)?;
        Decimal::try_from_i128_with_scale(mantissa, decimals)
            .map(|value| Self(value.normalize()))
            .map_err(|_| AmountError::Overflow)
    }

    /// Convert to a raw ledger integer, flooring any digits past `decimals`.
    pub fn to_chain_units(self, decimals: u32) -> Result<u128, AmountError> {
        if decimals > MAX_TOKEN_DECIMALS {
            return Err(AmountError::UnsupportedDecimals(decimals));
        }
        if self.is_negative() {
            return Err(AmountError::NegativeChainAmount(self));
        }
        let factor = Decimal::from(10u64.pow(decimals));
        self.floor_to(decimals)
            .0
            .checked_mul(factor)
            .and_then(|scaled| scaled.trunc().to_u128())
            .ok_or(AmountError::Overflow)
    }

    /// Raw mantissa of the underlying decimal.
    pub fn digits(&self) -> i128 {
        self.0.mantissa()
    }

    /// Number of digits after the decimal point.
    pub fn scale(&self) -> u32 {
        self.0.scale()
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self, AmountError> {
        self.0.checked_add(rhs.0).map(Self).ok_or(AmountError::Overflow)
    }

    pub fn checked_sub(self, rhs: Self) -> Result<Self, AmountError> {
        self.0.checked_sub(rhs.0).map(Self).ok_or(AmountError::Overflow)
    }

    pub fn checked_mul(self, rhs: Self) -> Result<Self, AmountError> {
        self.0
            .checked_mul(rhs.0)
            .map(|value| Self(floor_decimal(value, WORKING_SCALE)))
            .ok_or(AmountError::Overflow)
    }

    pub fn checked_div(self, rhs: Self) -> Result<Self, AmountError> {
        if rhs.is_zero() {
            return Err(AmountError::DivisionByZero);
        }
        self.0
            .checked_div(rhs.0)
            .map(|value| Self(floor_decimal(value, WORKING_SCALE)))
            .ok_or(AmountError::Overflow)
    }

    /// `self / 100`, used to turn a percentage into a factor.
    pub fn percent_to_factor(self) -> Result<Self, AmountError> {
        self.checked_div(Self::ONE_HUNDRED)
    }

    /// Truncate toward negative infinity at `decimals` digits.
    pub fn floor_to(self, decimals: u32) -> Self {
        Self(floor_decimal(self.0, decimals))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Negative values become zero.
    pub fn clamp_non_negative(self) -> Self {
        if self.is_negative() { Self::ZERO } else { self }
    }

    /// Positive values become zero.
    pub fn clamp_non_positive(self) -> Self {
        if self.is_positive() { Self::ZERO } else { self }
    }

    pub fn neg(self) -> Self {
        Self(-self.0)
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }
}

fn floor_decimal(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::ToNegativeInfinity)
}

impl From<Decimal> for FixedPointAmount {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl From<FixedPointAmount> for Decimal {
    fn from(value: FixedPointAmount) -> Self {
        value.0
    }
}

impl FromStr for FixedPointAmount {
    type Err = AmountError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Decimal::from_str_exact(value.trim())
            .map(Self)
            .map_err(|_| AmountError::Parse(value.to_string()))
    }
}

impl fmt::Display for FixedPointAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.normalize())
    }
}
