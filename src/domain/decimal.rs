//! Conversion of task values into observations.
//!
//! Values are first parsed as exact decimals, then truncated toward zero
//! into an arbitrary-precision integer. The integer part is capped at
//! `MAX_INTEGER_DIGITS` digits, since an exponent like `1e500000000`
//! parses cheaply but expands into a huge integer.

use std::str::FromStr;

use bigdecimal::BigDecimal;
use num_bigint::BigInt;
use serde_json::Value;
use thiserror::Error;

/// Most decimal digits allowed before the decimal point
pub const MAX_INTEGER_DIGITS: i64 = 1000;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("unable to parse '{input}' as a decimal: {reason}")]
    Parse { input: String, reason: String },

    #[error("type {0} cannot be converted to a decimal")]
    UnsupportedType(&'static str),

    #[error("decimal has {digits} integer digits, more than the {max} allowed", max = MAX_INTEGER_DIGITS)]
    TooLarge { digits: i64 },
}

/// Parse a JSON value (number or numeric string) as an exact decimal
pub fn to_decimal(value: &Value) -> Result<BigDecimal, ConversionError> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        Value::Null => return Err(ConversionError::UnsupportedType("null")),
        Value::Bool(_) => return Err(ConversionError::UnsupportedType("bool")),
        Value::Array(_) => return Err(ConversionError::UnsupportedType("array")),
        Value::Object(_) => return Err(ConversionError::UnsupportedType("object")),
    };

    let decimal = match BigDecimal::from_str(&text) {
        Ok(decimal) => decimal,
        Err(e) => {
            return Err(ConversionError::Parse {
                input: text,
                reason: e.to_string(),
            })
        }
    };

    check_integer_digits(&decimal)?;
    Ok(decimal)
}

/// Integer part of a decimal, truncated toward zero
pub fn to_observation(decimal: &BigDecimal) -> Result<BigInt, ConversionError> {
    if check_integer_digits(decimal)? <= 0 {
        // |decimal| < 1
        return Ok(BigInt::from(0));
    }

    let (int_val, _) = decimal.with_scale(0).into_bigint_and_exponent();
    Ok(int_val)
}

/// Digits before the decimal point, computed without expanding the exponent
fn integer_digits(decimal: &BigDecimal) -> i64 {
    let (_, scale) = decimal.as_bigint_and_exponent();
    (decimal.digits() as i64).saturating_sub(scale)
}

fn check_integer_digits(decimal: &BigDecimal) -> Result<i64, ConversionError> {
    let digits = integer_digits(decimal);
    if digits > MAX_INTEGER_DIGITS {
        return Err(ConversionError::TooLarge { digits });
    }
    Ok(digits)
}
