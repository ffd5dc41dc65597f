//! Money Conversion Module
//!
//! Conversion between on-chain integer base units (wei, lamports, token
//! atoms) and the `Decimal` amounts stored in the ledger. All chain-facing
//! conversions go through here.
//!
//! ## Rules
//! 1. Decimal -> base units rounds DOWN to the asset precision (never send more
//!    than we hold).
//! 2. Base units -> Decimal is exact or an error; no silent truncation.

use rust_decimal::prelude::*;
use thiserror::Error;

/// Max decimals representable by `Decimal`
const MAX_SCALE: u32 = 28;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Precision overflow: {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("Amount must not be negative")]
    NegativeAmount,

    #[error("Amount too large, would overflow")]
    Overflow,

    #[error("Invalid format: {0}")]
    InvalidFormat(String),
}

/// Convert a ledger amount into integer base units, rounding down.
///
/// ```ignore
/// assert_eq!(to_base_units(Decimal::new(15, 1), 6)?, 1_500_000);
/// ```
pub fn to_base_units(amount: Decimal, decimals: u32) -> Result<u128, MoneyError> {
    if decimals > MAX_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: decimals,
            max: MAX_SCALE,
        });
    }
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(MoneyError::NegativeAmount);
    }

    let truncated = amount.round_dp_with_strategy(decimals, RoundingStrategy::ToZero);
    let multiplier = Decimal::from_i128_with_scale(10i128.pow(decimals), 0);
    let scaled = truncated
        .checked_mul(multiplier)
        .ok_or(MoneyError::Overflow)?;

    scaled.trunc().to_u128().ok_or(MoneyError::Overflow)
}

/// Convert integer base units into a ledger amount.
pub fn from_base_units(raw: u128, decimals: u32) -> Result<Decimal, MoneyError> {
    if decimals > MAX_SCALE {
        return Err(MoneyError::PrecisionOverflow {
            provided: decimals,
            max: MAX_SCALE,
        });
    }
    let raw = i128::try_from(raw).map_err(|_| MoneyError::Overflow)?;
    let value = Decimal::try_from_i128_with_scale(raw, decimals).map_err(|_| MoneyError::Overflow)?;
    Ok(value.normalize())
}

/// Parse a `0x`-prefixed hex quantity (JSON-RPC encoding) into u128.
pub fn parse_hex_quantity(hex_str: &str) -> Result<u128, MoneyError> {
    let digits = hex_str.trim().trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    // ABI words are 32 bytes; anything with more than 32 significant hex digits overflows u128
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(0);
    }
    if digits.len() > 32 {
        return Err(MoneyError::Overflow);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| MoneyError::InvalidFormat(format!("{}: {}", hex_str, e)))
}

/// Parse a decimal integer string (Solana token amounts are strings).
pub fn parse_base_units(s: &str) -> Result<u128, MoneyError> {
    s.trim()
        .parse::<u128>()
        .map_err(|e| MoneyError::InvalidFormat(format!("{}: {}", s, e)))
}
