//! Token amounts
//!
//! `Tokens` is the only money-like quantity in the engine. It is an exact
//! decimal held at a fixed scale of two fractional digits, so millions of
//! `0.01` charges add up without drift. Backends that need integer columns
//! use minor units (hundredths).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{DomainError, DomainResult};

/// Fractional digits carried by every token amount
pub const TOKEN_SCALE: u32 = 2;

/// Non-negative token amount with exactly two fractional digits
///
/// # Invariants
/// - Never negative
/// - Scale is always `TOKEN_SCALE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Tokens(Decimal);

impl Tokens {
    /// Zero tokens
    pub const ZERO: Tokens = Tokens(Decimal::from_parts(0, 0, 0, false, TOKEN_SCALE));

    /// Create from a decimal, rejecting negatives and sub-cent precision
    pub fn new(value: Decimal) -> DomainResult<Self> {
        if value < Decimal::ZERO {
            return Err(DomainError::InvalidAmount(format!("{} is negative", value)));
        }
        if value.normalize().scale() > TOKEN_SCALE {
            return Err(DomainError::InvalidAmount(format!(
                "{} has more than {} fractional digits",
                value, TOKEN_SCALE
            )));
        }

        let mut scaled = if value.is_zero() { Decimal::ZERO } else { value };
        scaled.rescale(TOKEN_SCALE);
        Ok(Self(scaled))
    }

    /// Create from hundredths of a token
    pub fn from_minor_units(minor: i64) -> DomainResult<Self> {
        if minor < 0 {
            return Err(DomainError::InvalidAmount(format!(
                "{} minor units is negative",
                minor
            )));
        }
        Ok(Self(Decimal::new(minor, TOKEN_SCALE)))
    }

    /// Amount in hundredths of a token
    pub fn to_minor_units(&self) -> DomainResult<i64> {
        i64::try_from(self.0.mantissa())
            .map_err(|_| DomainError::InvalidAmount(format!("{} exceeds storage range", self.0)))
    }

    /// Get the decimal value
    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Check for zero
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Sum of two amounts, `None` on overflow
    pub fn checked_add(&self, other: Tokens) -> Option<Tokens> {
        self.0.checked_add(other.0).map(Tokens)
    }

    /// Difference of two amounts, `None` if the result would be negative
    pub fn checked_sub(&self, other: Tokens) -> Option<Tokens> {
        if other.0 > self.0 {
            return None;
        }
        self.0.checked_sub(other.0).map(|mut v| {
            v.rescale(TOKEN_SCALE);
            Tokens(v)
        })
    }
}

impl Default for Tokens {
    fn default() -> Self {
        Self::ZERO
    }
}

impl TryFrom<Decimal> for Tokens {
    type Error = DomainError;

    fn try_from(value: Decimal) -> DomainResult<Self> {
        Self::new(value)
    }
}

impl From<Tokens> for Decimal {
    fn from(tokens: Tokens) -> Self {
        tokens.0
    }
}

impl FromStr for Tokens {
    type Err = DomainError;

    fn from_str(s: &str) -> DomainResult<Self> {
        let value = Decimal::from_str(s.trim())
            .map_err(|e| DomainError::InvalidAmount(format!("'{}': {}", s, e)))?;
        Self::new(value)
    }
}

impl fmt::Display for Tokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
