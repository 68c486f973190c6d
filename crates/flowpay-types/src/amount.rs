//! Token amounts as advertised in 402 challenges and as settled on a ledger.
//!
//! Servers advertise prices as human decimal strings (`"0.0001"` per second,
//! `"0.36"` minimum deposit). Ledgers work in integer smallest units. The
//! [`MoneyAmount`] type bridges the two: it parses the human form into an exact
//! [`Decimal`] and converts it to a [`U256`] for a token with a given number of
//! decimals.
//!
//! ```rust
//! use flowpay_types::amount::{MoneyAmount, format_token_amount};
//!
//! let rate = MoneyAmount::parse("0.0001").unwrap();
//! let units = rate.as_token_amount(18).unwrap();
//! assert_eq!(format_token_amount(units, 18), "0.0001");
//! ```

use alloy_primitives::U256;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

/// Precision used when nothing else is configured. Matches ether-style tokens.
pub const DEFAULT_TOKEN_DECIMALS: u32 = 18;

/// Largest precision whose unit, `10^decimals`, still fits in a [`U256`].
pub const MAX_TOKEN_DECIMALS: u32 = 77;

/// A non-negative decimal amount in whole-token units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MoneyAmount(Decimal);

/// Errors that can occur when parsing or converting an amount.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyAmountParseError {
    /// The input string could not be parsed as a number.
    #[error("Invalid number format")]
    InvalidFormat,
    /// Zero, above the maximum, or too large for the token's smallest units.
    #[error("Amount must be above 0 and at most {}", bounds::MAX_STR)]
    OutOfRange,
    /// Negative values are not allowed.
    #[error("Negative value is not allowed")]
    Negative,
    /// The input has more decimal places than the token supports.
    #[error("Too big of a precision: {money} vs {token} on token")]
    WrongPrecision {
        /// Decimal places in the input.
        money: u32,
        /// Decimal places supported by the token.
        token: u32,
    },
    #[error("Token precision {0} exceeds {MAX_TOKEN_DECIMALS} decimals")]
    UnsupportedDecimals(u32),
}

mod bounds {
    use super::*;

    pub const MAX_STR: &str = "999999999";

    pub static MAX: LazyLock<Decimal> =
        LazyLock::new(|| Decimal::from_str(MAX_STR).expect("valid decimal"));
}

static NOISE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\d\.\-]+").expect("valid noise pattern"));

impl MoneyAmount {
    /// Parses a human amount. Currency symbols, separators and whitespace are ignored.
    pub fn parse(input: &str) -> Result<Self, MoneyAmountParseError> {
        let cleaned = NOISE.replace_all(input, "");
        let parsed =
            Decimal::from_str(&cleaned).map_err(|_| MoneyAmountParseError::InvalidFormat)?;
        Self::try_from_decimal(parsed)
    }

    fn try_from_decimal(value: Decimal) -> Result<Self, MoneyAmountParseError> {
        if value.is_sign_negative() {
            return Err(MoneyAmountParseError::Negative);
        }
        if value.is_zero() || value > *bounds::MAX {
            return Err(MoneyAmountParseError::OutOfRange);
        }
        Ok(MoneyAmount(value.normalize()))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Decimal places after normalization, so `"0.10"` has scale 1.
    pub fn scale(&self) -> u32 {
        self.0.scale()
    }

    pub fn mantissa(&self) -> u128 {
        self.0.mantissa().unsigned_abs()
    }

    /// Converts to integer smallest units of a token with `decimals` places.
    ///
    /// Fails with [`MoneyAmountParseError::WrongPrecision`] rather than rounding.
    pub fn as_token_amount(&self, decimals: u32) -> Result<U256, MoneyAmountParseError> {
        if decimals > MAX_TOKEN_DECIMALS {
            return Err(MoneyAmountParseError::UnsupportedDecimals(decimals));
        }
        let scale = self.scale();
        if scale > decimals {
            return Err(MoneyAmountParseError::WrongPrecision {
                money: scale,
                token: decimals,
            });
        }
        let multiplier = U256::from(10u8)
            .checked_pow(U256::from(decimals - scale))
            .ok_or(MoneyAmountParseError::OutOfRange)?;
        U256::from(self.mantissa())
            .checked_mul(multiplier)
            .ok_or(MoneyAmountParseError::OutOfRange)
    }
}

/// Renders smallest units as a trimmed decimal string, e.g. `360000000000000000` at 18 decimals is `"0.36"`.
pub fn format_token_amount(amount: U256, decimals: u32) -> String {
    let digits = amount.to_string();
    if decimals == 0 {
        return digits;
    }
    let decimals = decimals as usize;
    let padded = if digits.len() <= decimals {
        format!("{}{}", "0".repeat(decimals + 1 - digits.len()), digits)
    } else {
        digits
    };
    let (whole, fraction) = padded.split_at(padded.len() - decimals);
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        whole.to_string()
    } else {
        format!("{whole}.{fraction}")
    }
}

impl FromStr for MoneyAmount {
    type Err = MoneyAmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MoneyAmount::parse(s)
    }
}

impl TryFrom<&str> for MoneyAmount {
    type Error = MoneyAmountParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        MoneyAmount::parse(value)
    }
}

impl From<u32> for MoneyAmount {
    fn from(value: u32) -> Self {
        MoneyAmount(Decimal::from(value))
    }
}

impl fmt::Display for MoneyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for MoneyAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MoneyAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MoneyAmount::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strips_currency_noise() {
        let amount = MoneyAmount::parse("$1,000.50").unwrap();
        assert_eq!(amount.to_string(), "1000.5");
        assert_eq!(amount.scale(), 1);
    }

    #[test]
    fn test_parse_rejects_negative_and_garbage() {
        assert_eq!(
            MoneyAmount::parse("-1"),
            Err(MoneyAmountParseError::Negative)
        );
        assert_eq!(
            MoneyAmount::parse("abc"),
            Err(MoneyAmountParseError::InvalidFormat)
        );
        assert_eq!(
            MoneyAmount::parse("0"),
            Err(MoneyAmountParseError::OutOfRange)
        );
    }

    #[test]
    fn test_rate_converts_to_wei() {
        let rate = MoneyAmount::parse("0.0001").unwrap();
        assert_eq!(
            rate.as_token_amount(18).unwrap(),
            U256::from(100_000_000_000_000u64)
        );
    }

    #[test]
    fn test_trailing_zeros_do_not_count_as_precision() {
        let amount = MoneyAmount::parse("1.500000").unwrap();
        assert_eq!(amount.as_token_amount(6).unwrap(), U256::from(1_500_000u64));
        assert_eq!(amount.as_token_amount(1).unwrap(), U256::from(15u64));
    }

    #[test]
    fn test_too_precise_for_token() {
        let amount = MoneyAmount::parse("0.001").unwrap();
        assert!(matches!(
            amount.as_token_amount(2),
            Err(MoneyAmountParseError::WrongPrecision { money: 3, token: 2 })
        ));
    }

    #[test]
    fn test_sub_nano_rates_are_accepted() {
        let rate = MoneyAmount::parse("0.000000000001").unwrap();
        assert_eq!(rate.as_token_amount(18).unwrap(), U256::from(1_000_000u64));
        let one_wei = MoneyAmount::parse("0.000000000000000001").unwrap();
        assert_eq!(one_wei.as_token_amount(18).unwrap(), U256::from(1u8));
    }

    #[test]
    fn test_precision_is_bounded_by_u256() {
        let amount = MoneyAmount::parse("1").unwrap();
        assert_eq!(
            amount.as_token_amount(MAX_TOKEN_DECIMALS).unwrap(),
            U256::from(10u8).pow(U256::from(77u8))
        );
        assert_eq!(
            amount.as_token_amount(78),
            Err(MoneyAmountParseError::UnsupportedDecimals(78))
        );
        assert_eq!(
            MoneyAmount::parse("2").unwrap().as_token_amount(77),
            Err(MoneyAmountParseError::OutOfRange)
        );
    }

    #[test]
    fn test_format_token_amount() {
        assert_eq!(
            format_token_amount(U256::from(360_000_000_000_000_000u64), 18),
            "0.36"
        );
        assert_eq!(
            format_token_amount(U256::from(100u64) * U256::from(10u8).pow(U256::from(18u8)), 18),
            "100"
        );
        assert_eq!(format_token_amount(U256::ZERO, 18), "0");
        assert_eq!(format_token_amount(U256::from(42u8), 0), "42");
    }

    #[test]
    fn test_serde_as_string() {
        let amount: MoneyAmount = serde_json::from_str("\"25.5\"").unwrap();
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"25.5\"");
    }
}
