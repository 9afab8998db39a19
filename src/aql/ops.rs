//! Comparison operators and filter conditions.

use serde_json::{Map, Value};

use super::error::{CompileErrorKind, CompileResult, FrameKind};
use super::expr::{compile_expr, compile_function};
use super::state::CompilerState;
use super::types::{cast_input, Typed, TypedKind, ValueType};

/// Operators usable on a field: `{field: {"$op": rhs}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Gte,
    Lte,
    Gt,
    Lt,
    Eq,
    OneOf,
    Like,
}

impl Operator {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$gte" => Operator::Gte,
            "$lte" => Operator::Lte,
            "$gt" => Operator::Gt,
            "$lt" => Operator::Lt,
            "$eq" => Operator::Eq,
            "$oneof" => Operator::OneOf,
            "$like" => Operator::Like,
            _ => return None,
        })
    }

    fn comparator(&self) -> Option<&'static str> {
        match self {
            Operator::Gte => Some(">="),
            Operator::Lte => Some("<="),
            Operator::Gt => Some(">"),
            Operator::Lt => Some("<"),
            _ => None,
        }
    }
}

const TRANSFORM: &str = "$transform";

/// Compile `{"$op": rhs, "$transform"?: f}` applied to `field`.
pub fn compile_op(state: &mut CompilerState, field: &str, op_data: &Value) -> CompileResult<String> {
    state.with_frame(
        FrameKind::Op,
        || vec![Value::String(field.into()), op_data.clone()],
        |state| {
            let obj = op_data
                .as_object()
                .ok_or_else(|| CompileErrorKind::InvalidCondition(op_data.to_string()))?;
            let (name, rhs_value) = obj
                .iter()
                .find(|(k, _)| k.as_str() != TRANSFORM)
                .ok_or_else(|| CompileErrorKind::InvalidCondition(op_data.to_string()))?;
            let op = Operator::from_name(name)
                .ok_or_else(|| CompileErrorKind::UnknownOperator(name.clone()))?;

            let mark = state.param_mark();
            let lhs = compile_lhs(state, field, obj.get(TRANSFORM))?;
            let rhs = compile_expr(state, rhs_value)?;

            if let Some(cmp) = op.comparator() {
                let rhs = cast_input(state, &rhs, lhs.ty)?;
                return Ok(format!("{} {} {}", lhs.sql, cmp, rhs.sql));
            }

            match op {
                Operator::Eq => {
                    let is_param = rhs.is_param();
                    let rhs = cast_input(state, &rhs, lhs.ty)?;
                    if rhs.literal && rhs.ty == ValueType::Null {
                        Ok(format!("{} IS NULL", lhs.sql))
                    } else if is_param {
                        // `?` may be bound to NULL
                        state.repeat_params_from(mark);
                        Ok(format!(
                            "CASE WHEN {l} IS NULL THEN ? IS NULL ELSE {l} = ? END",
                            l = lhs.sql
                        ))
                    } else {
                        Ok(format!("{} = {}", lhs.sql, rhs.sql))
                    }
                }
                Operator::OneOf => compile_one_of(state, &lhs, &rhs),
                Operator::Like => {
                    let lhs = cast_input(state, &lhs, ValueType::String)?;
                    let rhs = cast_input(state, &rhs, ValueType::String)?;
                    Ok(format!("{} LIKE {}", lhs.sql, rhs.sql))
                }
                _ => Err(CompileErrorKind::UnknownOperator(name.clone()).into()),
            }
        },
    )
}

fn compile_lhs(
    state: &mut CompilerState,
    field: &str,
    transform: Option<&Value>,
) -> CompileResult<Typed> {
    let func = match transform {
        None => return compile_expr(state, &Value::String(format!("${}", field))),
        Some(Value::String(name)) => {
            let mut func = Map::new();
            func.insert(name.clone(), Value::String("$".into()));
            func
        }
        Some(Value::Object(func)) => func.clone(),
        Some(other) => {
            return Err(CompileErrorKind::UnsupportedExpression(other.to_string()).into())
        }
    };

    let previous = state.implicit_field.replace(field.to_string());
    let result = compile_function(state, &func);
    state.implicit_field = previous;
    result
}

fn compile_one_of(state: &mut CompilerState, lhs: &Typed, rhs: &Typed) -> CompileResult<String> {
    let items = match &rhs.kind {
        TypedKind::Array(items) => items,
        _ => {
            return Err(CompileErrorKind::CannotConvert {
                from: rhs.ty,
                to: ValueType::Array,
            }
            .into())
        }
    };

    let mut unique: Vec<&Value> = Vec::new();
    for item in items {
        if !unique.contains(&item) {
            unique.push(item);
        }
    }
    if unique.is_empty() {
        return Ok("0".into());
    }

    let mut rendered = Vec::with_capacity(unique.len());
    for item in unique {
        let value = state.with_frame(
            FrameKind::Value,
            || vec![item.clone()],
            |state| {
                let compiled = compile_expr(state, item)?;
                cast_input(state, &compiled, lhs.ty)
            },
        )?;
        rendered.push(value.sql);
    }
    Ok(format!("{} IN ({})", lhs.sql, rendered.join(",")))
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Normalize the object form `{a: x, b: y}` into `[{a: x}, {b: y}]`.
fn condition_list(conds: &Value) -> CompileResult<Vec<Map<String, Value>>> {
    let entries: Vec<Value> = match conds {
        Value::Array(items) => items.clone(),
        Value::Object(obj) => obj
            .iter()
            .map(|(k, v)| {
                let mut single = Map::new();
                single.insert(k.clone(), v.clone());
                Value::Object(single)
            })
            .collect(),
        other if is_falsy(other) => Vec::new(),
        other => return Err(CompileErrorKind::InvalidCondition(other.to_string()).into()),
    };

    entries
        .into_iter()
        .filter(|c| !is_falsy(c))
        .map(|c| match c {
            Value::Object(obj) => Ok(obj),
            other => Err(CompileErrorKind::InvalidCondition(other.to_string()).into()),
        })
        .collect()
}

/// Compile a condition list into SQL predicates, one per field test.
pub fn compile_conditions(state: &mut CompilerState, conds: &Value) -> CompileResult<Vec<String>> {
    let mut out = Vec::new();
    for cond in condition_list(conds)? {
        for (field, value) in &cond {
            match field.as_str() {
                "$and" => {
                    if !is_falsy(value) {
                        out.push(compile_and(state, value)?);
                    }
                }
                "$or" => {
                    let empty = value.as_array().is_some_and(|a| a.is_empty());
                    if !is_falsy(value) && !empty {
                        out.push(compile_or(state, value)?);
                    }
                }
                _ => match value {
                    Value::Array(ops) => {
                        for op in ops {
                            out.push(compile_op(state, field, op)?);
                        }
                    }
                    Value::Object(_) => out.push(compile_op(state, field, value)?),
                    scalar => {
                        let mut eq = Map::new();
                        eq.insert("$eq".into(), scalar.clone());
                        out.push(compile_op(state, field, &Value::Object(eq))?);
                    }
                },
            }
        }
    }
    Ok(out)
}

/// AND the conditions together; an empty list is `1`.
pub fn compile_and(state: &mut CompilerState, conds: &Value) -> CompileResult<String> {
    if is_falsy(conds) {
        return Ok("1".into());
    }
    let parts = compile_conditions(state, conds)?;
    if parts.is_empty() {
        return Ok("1".into());
    }
    Ok(format!("({})", parts.join("\n  AND ")))
}

/// OR the conditions together; an empty list is `0`.
pub fn compile_or(state: &mut CompilerState, conds: &Value) -> CompileResult<String> {
    if is_falsy(conds) {
        return Ok("0".into());
    }
    let parts = compile_conditions(state, conds)?;
    if parts.is_empty() {
        return Ok("0".into());
    }
    Ok(format!("({})", parts.join("\n  OR ")))
}
