//! Semantic value types and the cast table.
//!
//! Casting only ever widens:
//!
//! | target       | accepted sources                          |
//! |--------------|-------------------------------------------|
//! | `date`       | string literal (`YYYY-MM-DD`/`YYYY-MM`/`YYYY`) |
//! | `date-month` | `date`, `string`, `any`                   |
//! | `date-year`  | `date`, `date-month`, `string`            |
//! | `id`         | `string`                                  |
//! | `float`      | `integer`                                 |
//! | anything     | same type, `any`, literal `null`          |
//!
//! Parameters are re-tagged instead of converted, but the first type a
//! parameter name is inferred as must be reachable from every later one via
//! [`param_accepts`].

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{CompileErrorKind, CompileResult};
use super::state::CompilerState;
use crate::schema::FieldType;

static DATE_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4})(?:-(\d{2})(?:-(\d{2}))?)?$").expect("date literal pattern is valid")
});

/// Type of a compiled value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueType {
    Id,
    Boolean,
    String,
    Integer,
    Float,
    Date,
    Json,
    #[serde(rename = "json/fallback")]
    JsonFallback,
    DateMonth,
    DateYear,
    Array,
    Null,
    Any,
    Param,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Id => "id",
            ValueType::Boolean => "boolean",
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::Date => "date",
            ValueType::Json => "json",
            ValueType::JsonFallback => "json/fallback",
            ValueType::DateMonth => "date-month",
            ValueType::DateYear => "date-year",
            ValueType::Array => "array",
            ValueType::Null => "null",
            ValueType::Any => "any",
            ValueType::Param => "param",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<FieldType> for ValueType {
    fn from(ty: FieldType) -> Self {
        match ty {
            FieldType::Id => ValueType::Id,
            FieldType::Boolean => ValueType::Boolean,
            FieldType::String => ValueType::String,
            FieldType::Integer => ValueType::Integer,
            FieldType::Float => ValueType::Float,
            FieldType::Date => ValueType::Date,
            FieldType::Json => ValueType::Json,
            FieldType::JsonFallback => ValueType::JsonFallback,
        }
    }
}

/// Reference to one bind site of a named parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamRef {
    pub id: usize,
    pub name: String,
}

/// Where a compiled value came from.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedKind {
    /// A SQL fragment (column, expression or rendered literal).
    Fragment,
    /// An unbound `?` placeholder.
    Param(ParamRef),
    /// A literal array, kept as raw elements until an operator renders it.
    Array(Vec<Value>),
}

/// A compiled value: SQL text plus its semantic type.
#[derive(Debug, Clone, PartialEq)]
pub struct Typed {
    pub sql: String,
    pub ty: ValueType,
    /// The value is baked into the SQL text rather than read from a column.
    pub literal: bool,
    pub kind: TypedKind,
}

impl Typed {
    pub fn fragment(sql: impl Into<String>, ty: ValueType) -> Self {
        Self {
            sql: sql.into(),
            ty,
            literal: false,
            kind: TypedKind::Fragment,
        }
    }

    pub fn literal(sql: impl Into<String>, ty: ValueType) -> Self {
        Self {
            sql: sql.into(),
            ty,
            literal: true,
            kind: TypedKind::Fragment,
        }
    }

    pub fn param(param: ParamRef) -> Self {
        Self {
            sql: "?".into(),
            ty: ValueType::Param,
            literal: false,
            kind: TypedKind::Param(param),
        }
    }

    pub fn array(items: Vec<Value>) -> Self {
        Self {
            sql: String::new(),
            ty: ValueType::Array,
            literal: true,
            kind: TypedKind::Array(items),
        }
    }

    pub fn is_param(&self) -> bool {
        matches!(self.kind, TypedKind::Param(_))
    }

    pub fn param_ref(&self) -> Option<&ParamRef> {
        match &self.kind {
            TypedKind::Param(p) => Some(p),
            _ => None,
        }
    }

    fn retag(&self, ty: ValueType) -> Self {
        Self {
            sql: self.sql.clone(),
            ty,
            literal: self.literal,
            kind: match &self.kind {
                TypedKind::Array(items) => TypedKind::Array(items.clone()),
                _ => TypedKind::Fragment,
            },
        }
    }
}

/// Whether a parameter first inferred as `existing` may also be used as
/// `requested`.
pub fn param_accepts(existing: ValueType, requested: ValueType) -> bool {
    use ValueType::*;
    existing == requested
        || matches!(
            (requested, existing),
            (Date, String)
                | (DateMonth, Date)
                | (DateYear, Date)
                | (DateYear, DateMonth)
                | (Id, String)
                | (Float, Integer)
        )
}

/// Parse a `YYYY-MM-DD`, `YYYY-MM` or `YYYY` string into its integer form.
pub fn parse_date_literal(text: &str) -> Option<i64> {
    let caps = DATE_LITERAL.captures(text)?;
    let digits: String = caps
        .iter()
        .skip(1)
        .flatten()
        .map(|m| m.as_str())
        .collect();
    digits.parse().ok()
}

/// Strip the quotes from a rendered SQL string literal.
pub(crate) fn unquote(sql: &str) -> String {
    let inner = sql
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(sql);
    inner.replace("''", "'")
}

fn truncate_date(expr: &Typed, digits: usize, ty: ValueType) -> Typed {
    if expr.literal {
        let text: String = expr.sql.chars().take(digits).collect();
        Typed::literal(text, ty)
    } else {
        Typed::fragment(
            format!("CAST(SUBSTR({}, 1, {}) AS integer)", expr.sql, digits),
            ty,
        )
    }
}

/// Cast `expr` to `to`, or fail if no widening rule applies.
pub fn cast_input(state: &mut CompilerState, expr: &Typed, to: ValueType) -> CompileResult<Typed> {
    if expr.ty == to {
        return Ok(expr.clone());
    }

    if let Some(param) = expr.param_ref() {
        state.infer_param(param, to)?;
        return Ok(expr.retag(to));
    }

    if expr.ty == ValueType::Null {
        if !expr.literal {
            return Err(CompileErrorKind::NonLiteralNull.into());
        }
        if to == ValueType::Boolean {
            return Ok(Typed::literal("0", ValueType::Boolean));
        }
        return Ok(expr.clone());
    }

    let cannot = || CompileErrorKind::CannotConvert { from: expr.ty, to };

    match to {
        ValueType::Date => match expr.ty {
            ValueType::String if expr.literal => {
                let text = unquote(&expr.sql);
                let value = parse_date_literal(&text).ok_or(CompileErrorKind::InvalidDate(text))?;
                Ok(Typed::literal(value.to_string(), ValueType::Date))
            }
            ValueType::String => Err(CompileErrorKind::StringFieldToDate.into()),
            ValueType::Any => Ok(expr.retag(to)),
            _ => Err(cannot().into()),
        },
        ValueType::DateMonth => {
            let date = match expr.ty {
                ValueType::Date => expr.clone(),
                ValueType::String | ValueType::Any => cast_input(state, expr, ValueType::Date)?,
                _ => return Err(cannot().into()),
            };
            Ok(truncate_date(&date, 6, ValueType::DateMonth))
        }
        ValueType::DateYear => {
            let date = match expr.ty {
                ValueType::Date | ValueType::DateMonth => expr.clone(),
                ValueType::String => cast_input(state, expr, ValueType::Date)?,
                ValueType::Any => expr.retag(ValueType::Date),
                _ => return Err(cannot().into()),
            };
            Ok(truncate_date(&date, 4, ValueType::DateYear))
        }
        ValueType::Id if expr.ty == ValueType::String => Ok(expr.retag(to)),
        ValueType::Float if expr.ty == ValueType::Integer => Ok(expr.retag(to)),
        _ if expr.ty == ValueType::Any => Ok(expr.retag(to)),
        _ => Err(cannot().into()),
    }
}
