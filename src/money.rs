//! Money Module
//!
//! Fixed-point money handling. Every persisted amount is a `rust_decimal::Decimal`
//! carried at [`MONEY_SCALE`] fractional digits; binary floating point never
//! enters a persisted record.
//!
//! ## Conventions
//! - Positive amounts credit the account holder, negative amounts debit.
//! - Client input is parsed strictly: no silent truncation of extra digits.
//! - Profit-share rates are percentages with at most [`RATE_SCALE`] digits.
//!
//! ```rust
//! use resell_ledger::money::{parse_money, format_money};
//!
//! let amount = parse_money("12.5").unwrap();
//! assert_eq!(format_money(amount), "12.5000");
//! ```

use rust_decimal::prelude::*;
use thiserror::Error;

/// Fractional digits kept for every monetary quantity.
pub const MONEY_SCALE: u32 = 4;

/// Fractional digits allowed in a profit-share percentage.
pub const RATE_SCALE: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must be positive")]
    NotPositive,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Round to money precision (half away from zero).
pub fn round_money(value: Decimal) -> Decimal {
    let mut rounded = value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(MONEY_SCALE);
    rounded
}

/// Parse a client-supplied amount string into a positive money value.
///
/// Rejects signs, empty strings, ambiguous `.5` / `5.` forms, and more than
/// [`MONEY_SCALE`] fractional digits.
pub fn parse_money(amount_str: &str) -> Result<Decimal, MoneyError> {
    let s = amount_str.trim();
    if s.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    if s.starts_with('-') || s.starts_with('+') {
        return Err(MoneyError::NotPositive);
    }
    if let Some((whole, frac)) = s.split_once('.') {
        if whole.is_empty() {
            return Err(MoneyError::InvalidFormat(
                "missing leading zero (e.g., use 0.5 instead of .5)".into(),
            ));
        }
        if frac.is_empty() {
            return Err(MoneyError::InvalidFormat(
                "missing fractional part (e.g., use 5.0 instead of 5.)".into(),
            ));
        }
    }
    let value = Decimal::from_str_exact(s).map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;
    checked_money(value)
}

/// Validate an already-decoded positive amount (e.g. from JSON).
pub fn checked_money(value: Decimal) -> Result<Decimal, MoneyError> {
    let normalized = value.normalize();
    if normalized.scale() > MONEY_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: MONEY_SCALE,
        });
    }
    if normalized <= Decimal::ZERO {
        return Err(MoneyError::NotPositive);
    }
    Ok(round_money(normalized))
}

/// Validate a profit-share rate (0..=100, two fractional digits).
pub fn checked_rate(value: Decimal) -> Result<Decimal, MoneyError> {
    let normalized = value.normalize();
    if normalized.scale() > RATE_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: normalized.scale(),
            max: RATE_SCALE,
        });
    }
    if normalized.is_sign_negative() || normalized > Decimal::ONE_HUNDRED {
        return Err(MoneyError::InvalidFormat(format!("rate out of range: {}", value)));
    }
    Ok(normalized)
}

/// Format with exactly [`MONEY_SCALE`] fractional digits.
pub fn format_money(value: Decimal) -> String {
    format!("{:.prec$}", value, prec = MONEY_SCALE as usize)
}
