//! Conversion between JSON values and their stored SQLite form.
//!
//! Dates are stored as integers (`20200115`, `202001`, `2020`), booleans as
//! `0`/`1` and JSON as text. Parameters are converted on the way in with
//! [`convert_input`]; result columns on the way out with [`convert_output`].

use serde_json::{Number, Value};

use super::types::{parse_date_literal, ValueType};

/// Errors raised while converting a bound parameter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConvertError {
    #[error("Invalid date for {ty}: {value}")]
    InvalidDate { ty: ValueType, value: String },

    #[error("Expected {expected}, got {value}")]
    Unexpected { expected: ValueType, value: Value },
}

fn date_input(value: &Value, ty: ValueType, digits: usize) -> Result<Value, ConvertError> {
    let invalid = || ConvertError::InvalidDate {
        ty,
        value: value.to_string(),
    };
    match value {
        Value::Null => Ok(Value::Null),
        Value::String(s) => {
            // `digits` is the formatted length: 10, 7 or 4
            let prefix = s.get(..digits).ok_or_else(invalid)?;
            parse_date_literal(prefix)
                .map(|n| Value::Number(n.into()))
                .ok_or_else(invalid)
        }
        Value::Number(_) => Ok(value.clone()),
        _ => Err(invalid()),
    }
}

/// Convert a parameter value into the form stored for `ty`.
pub fn convert_input(value: &Value, ty: ValueType) -> Result<Value, ConvertError> {
    match ty {
        ValueType::Date => date_input(value, ty, 10),
        ValueType::DateMonth => date_input(value, ty, 7),
        ValueType::DateYear => date_input(value, ty, 4),
        ValueType::Boolean => match value {
            Value::Bool(b) => Ok(Value::Number(Number::from(*b as i64))),
            Value::Null => Ok(Value::Number(0.into())),
            Value::Number(_) => Ok(value.clone()),
            other => Err(ConvertError::Unexpected {
                expected: ty,
                value: other.clone(),
            }),
        },
        ValueType::Id => match value {
            Value::String(_) | Value::Null => Ok(value.clone()),
            other => Err(ConvertError::Unexpected {
                expected: ty,
                value: other.clone(),
            }),
        },
        ValueType::Json | ValueType::JsonFallback => match value {
            Value::Null => Ok(Value::Null),
            other => Ok(Value::String(other.to_string())),
        },
        _ => Ok(value.clone()),
    }
}

fn format_date(n: i64) -> Option<String> {
    let s = n.to_string();
    match s.len() {
        8 => Some(format!("{}-{}-{}", &s[..4], &s[4..6], &s[6..])),
        6 => Some(format!("{}-{}", &s[..4], &s[4..])),
        4 => Some(s),
        _ => None,
    }
}

/// Convert a stored column value back into its JSON form for `ty`.
pub fn convert_output(value: Value, ty: ValueType) -> Value {
    match (ty, value) {
        (ValueType::Boolean, Value::Null) => Value::Bool(false),
        (ValueType::Boolean, Value::Number(n)) => Value::Bool(n.as_i64() == Some(1)),
        (ValueType::Date | ValueType::DateMonth | ValueType::DateYear, Value::Number(n)) => {
            match n.as_i64().and_then(format_date) {
                Some(date) => Value::String(date),
                None => Value::Number(n),
            }
        }
        (ValueType::Json, Value::String(s)) => serde_json::from_str(&s).unwrap_or(Value::Null),
        (ValueType::JsonFallback, Value::String(s)) => match serde_json::from_str(&s) {
            Ok(parsed) => parsed,
            Err(_) => Value::String(s),
        },
        (_, value) => value,
    }
}
