//! Fixed-point helpers. Every stored amount carries two fraction digits.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::error::{ReferralError, Result};

pub const SCALE: u32 = 2;

/// Round to the ledger scale (banker's rounding).
pub fn round(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp(SCALE);
    rounded.rescale(SCALE);
    rounded
}

/// Parse a caller-supplied amount string; it must be positive and carry at
/// most two fraction digits.
pub fn parse_amount(raw: &str) -> Result<Decimal> {
    let amount = Decimal::from_str(raw.trim())
        .map_err(|err| ReferralError::Validation(format!("invalid amount '{raw}': {err}")))?;
    validate_amount(amount)
}

/// Positive, at most two fraction digits; returned at ledger scale.
pub fn validate_amount(amount: Decimal) -> Result<Decimal> {
    ensure_positive(amount)?;
    if amount.normalize().scale() > SCALE {
        return Err(ReferralError::Validation(format!(
            "amount {amount} has more than {SCALE} fraction digits"
        )));
    }
    Ok(round(amount))
}

pub fn ensure_positive(amount: Decimal) -> Result<()> {
    if amount <= Decimal::ZERO {
        return Err(ReferralError::Validation(format!(
            "amount must be greater than 0, got {amount}"
        )));
    }
    Ok(())
}
