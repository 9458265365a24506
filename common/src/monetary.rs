//! Fixed-point monetary types.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LedgerError, Result};

/// Number of fractional digits every stored amount and balance carries.
pub const MONEY_SCALE: u32 = 2;

/// Largest amount or balance the store can hold, matching `NUMERIC(20,2)`.
pub fn max_balance() -> Decimal {
    Decimal::from_i128_with_scale(99_999_999_999_999_999_999, MONEY_SCALE)
}

/// Rescale a decimal to the store representation.
///
/// Returns `None` when the value has more significant fractional digits than
/// [`MONEY_SCALE`] and would lose precision.
pub fn to_money_scale(value: Decimal) -> Option<Decimal> {
    if value.normalize().scale() > MONEY_SCALE {
        return None;
    }
    let mut scaled = value;
    scaled.rescale(MONEY_SCALE);
    Some(scaled)
}

/// A strictly positive operation amount in the store's fixed-point
/// representation.
///
/// Every operation request carries one of these before any sign adjustment;
/// the engine derives the signed record amount from the operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    /// Validate a requested amount.
    pub fn new(value: Decimal) -> Result<Self> {
        if value <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "amount must be greater than zero, got {}",
                value
            )));
        }
        if value > max_balance() {
            return Err(LedgerError::InvalidAmount(format!(
                "amount {} exceeds the maximum of {}",
                value,
                max_balance()
            )));
        }
        let scaled = to_money_scale(value).ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "amount {} has more than {} decimal places",
                value, MONEY_SCALE
            ))
        })?;
        Ok(Self(scaled))
    }

    /// Parse a caller-supplied decimal string.
    pub fn parse(value: &str) -> Result<Self> {
        let decimal = Decimal::from_str(value.trim()).map_err(|_| {
            LedgerError::InvalidAmount(format!("\"{}\" is not a decimal amount", value))
        })?;
        Self::new(decimal)
    }

    /// Get the unsigned value.
    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Get the value as a debit (negative) delta.
    pub fn as_debit(&self) -> Decimal {
        -self.0
    }

    /// Get the value as a credit (positive) delta.
    pub fn as_credit(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl FromStr for Amount {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Zero balance in the store representation.
pub fn zero_balance() -> Decimal {
    let mut zero = Decimal::ZERO;
    zero.rescale(MONEY_SCALE);
    zero
}
