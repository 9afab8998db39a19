//! Expression and function compilation.

use serde_json::{Map, Number, Value};

use super::compiler::compile_order_by;
use super::error::{CompileErrorKind, CompileResult, FrameKind};
use super::ops::compile_conditions;
use super::path::compile_field;
use super::state::CompilerState;
use super::types::{cast_input, Typed, ValueType};

/// Built-in functions callable as `{"$name": args}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sum,
    SumOver,
    Count,
    Substr,
    Lower,
    Neg,
    Abs,
    Idiv,
    Month,
    Year,
    Condition,
    Nocase,
    Literal,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "$sum" => Function::Sum,
            "$sumOver" => Function::SumOver,
            "$count" => Function::Count,
            "$substr" => Function::Substr,
            "$lower" => Function::Lower,
            "$neg" => Function::Neg,
            "$abs" => Function::Abs,
            "$idiv" => Function::Idiv,
            "$month" => Function::Month,
            "$year" => Function::Year,
            "$condition" => Function::Condition,
            "$nocase" => Function::Nocase,
            "$literal" => Function::Literal,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Sum => "$sum",
            Function::SumOver => "$sumOver",
            Function::Count => "$count",
            Function::Substr => "$substr",
            Function::Lower => "$lower",
            Function::Neg => "$neg",
            Function::Abs => "$abs",
            Function::Idiv => "$idiv",
            Function::Month => "$month",
            Function::Year => "$year",
            Function::Condition => "$condition",
            Function::Nocase => "$nocase",
            Function::Literal => "$literal",
        }
    }

    /// Accepted argument counts, inclusive.
    fn arity(&self) -> (usize, usize) {
        match self {
            Function::Substr => (2, 3),
            Function::Idiv => (2, 2),
            _ => (1, 1),
        }
    }

    /// Functions that make a select an aggregate query.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Function::Sum | Function::Count)
    }
}

/// Compile any expression: field reference, parameter, literal, array or
/// function call.
pub fn compile_expr(state: &mut CompilerState, expr: &Value) -> CompileResult<Typed> {
    state.with_frame(
        FrameKind::Expr,
        || vec![expr.clone()],
        |state| match expr {
            Value::String(s) if s.starts_with('$') => compile_field(state, &s[1..]),
            Value::String(s) if s.starts_with(':') && s.len() > 1 => {
                let param = state.push_param(&s[1..]);
                Ok(Typed::param(param))
            }
            Value::Array(items) => Ok(Typed::array(items.clone())),
            Value::Object(obj) => compile_function(state, obj),
            literal => compile_literal(literal),
        },
    )
}

/// Render a JSON scalar as a SQL literal.
pub fn compile_literal(value: &Value) -> CompileResult<Typed> {
    match value {
        Value::Null => Ok(Typed::literal("NULL", ValueType::Null)),
        Value::Bool(b) => Ok(Typed::literal(
            if *b { "1" } else { "0" },
            ValueType::Boolean,
        )),
        Value::Number(n) => Ok(compile_number(n)),
        Value::String(s) => {
            let text = s.replace("\\$", "$").replace('\'', "''");
            Ok(Typed::literal(format!("'{}'", text), ValueType::String))
        }
        other => Err(CompileErrorKind::UnsupportedExpression(other.to_string()).into()),
    }
}

fn compile_number(n: &Number) -> Typed {
    if n.is_i64() || n.is_u64() {
        return Typed::literal(n.to_string(), ValueType::Integer);
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
            Typed::literal((f as i64).to_string(), ValueType::Integer)
        }
        _ => Typed::literal(n.to_string(), ValueType::Float),
    }
}

fn function_args(args: &Value) -> Vec<Value> {
    match args {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

fn check_arity(func: Function, args: &[Value]) -> CompileResult<()> {
    let (min, max) = func.arity();
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            min.to_string()
        } else {
            format!("{}-{}", min, max)
        };
        return Err(CompileErrorKind::Arity {
            function: func.name().into(),
            expected,
            got: args.len(),
        }
        .into());
    }
    Ok(())
}

/// Compile each argument and check it casts to the matching type. The
/// original (uncast) values are returned.
fn validate_args(
    state: &mut CompilerState,
    args: &[Value],
    types: &[ValueType],
) -> CompileResult<Vec<Typed>> {
    let mut out = Vec::with_capacity(args.len());
    for (arg, ty) in args.iter().zip(types) {
        let compiled = compile_expr(state, arg)?;
        cast_input(state, &compiled, *ty)?;
        out.push(compiled);
    }
    Ok(out)
}

/// Compile each argument and cast it to the matching type.
fn cast_args(
    state: &mut CompilerState,
    args: &[Value],
    types: &[ValueType],
) -> CompileResult<Vec<Typed>> {
    let mut out = Vec::with_capacity(args.len());
    for (arg, ty) in args.iter().zip(types) {
        let compiled = compile_expr(state, arg)?;
        out.push(cast_input(state, &compiled, *ty)?);
    }
    Ok(out)
}

/// Compile a `{"$name": args}` object.
pub fn compile_function(state: &mut CompilerState, obj: &Map<String, Value>) -> CompileResult<Typed> {
    state.with_frame(
        FrameKind::Function,
        || vec![Value::Object(obj.clone())],
        |state| {
            let (name, raw) = obj
                .iter()
                .next()
                .ok_or_else(|| CompileErrorKind::UnsupportedExpression("{}".into()))?;
            if !name.starts_with('$') {
                return Err(CompileErrorKind::MissingDollar(name.clone()).into());
            }
            let func = Function::from_name(name)
                .ok_or_else(|| CompileErrorKind::UnknownFunction(name.clone()))?;

            if func == Function::Condition {
                return compile_condition(state, raw);
            }

            let args = function_args(raw);
            check_arity(func, &args)?;
            apply_function(state, func, &args)
        },
    )
}

fn compile_condition(state: &mut CompilerState, conds: &Value) -> CompileResult<Typed> {
    let conds = compile_conditions(state, conds)?;
    let sql = if conds.is_empty() {
        "1".to_string()
    } else {
        conds.join(" AND ")
    };
    Ok(Typed::fragment(sql, ValueType::Boolean))
}

fn apply_function(state: &mut CompilerState, func: Function, args: &[Value]) -> CompileResult<Typed> {
    use ValueType::{DateMonth, DateYear, Float, Integer};
    match func {
        Function::Sum => {
            let arg = first(func, validate_args(state, args, &[Float])?)?;
            Ok(Typed::fragment(format!("SUM({})", arg.sql), arg.ty))
        }
        Function::SumOver => {
            let arg = first(func, validate_args(state, args, &[Float])?)?;
            let window = match state.orders.clone() {
                Some(orders) if !orders.is_empty() => {
                    format!("ORDER BY {} ", compile_order_by(state, &orders)?)
                }
                _ => String::new(),
            };
            Ok(Typed::fragment(
                format!(
                    "(SUM({}) OVER ({}ROWS BETWEEN CURRENT ROW AND UNBOUNDED FOLLOWING))",
                    arg.sql, window
                ),
                arg.ty,
            ))
        }
        Function::Count => {
            let arg = compile_expr(state, &args[0])?;
            Ok(Typed::fragment(format!("COUNT({})", arg.sql), Integer))
        }
        Function::Substr => {
            let parts = cast_args(state, args, &[ValueType::String, Integer, Integer])?;
            let sql: Vec<&str> = parts.iter().map(|p| p.sql.as_str()).collect();
            Ok(Typed::fragment(format!("SUBSTR({})", sql.join(", ")), ValueType::String))
        }
        Function::Lower => {
            let arg = first(func, cast_args(state, args, &[ValueType::String])?)?;
            Ok(Typed::fragment(format!("LOWER({})", arg.sql), ValueType::String))
        }
        Function::Neg => {
            let arg = first(func, validate_args(state, args, &[Float])?)?;
            Ok(Typed::fragment(format!("(-{})", arg.sql), arg.ty))
        }
        Function::Abs => {
            let arg = first(func, validate_args(state, args, &[Float])?)?;
            Ok(Typed::fragment(format!("ABS({})", arg.sql), arg.ty))
        }
        Function::Idiv => {
            let parts = validate_args(state, args, &[Integer, Integer])?;
            Ok(Typed::fragment(
                format!("({} / {})", parts[0].sql, parts[1].sql),
                parts[0].ty,
            ))
        }
        Function::Month => {
            let arg = first(func, cast_args(state, args, &[DateMonth])?)?;
            Ok(arg)
        }
        Function::Year => {
            let arg = first(func, cast_args(state, args, &[DateYear])?)?;
            Ok(arg)
        }
        Function::Nocase => {
            let arg = first(func, cast_args(state, args, &[ValueType::String])?)?;
            Ok(Typed::fragment(format!("{} COLLATE NOCASE", arg.sql), ValueType::String))
        }
        Function::Literal => {
            let arg = compile_expr(state, &args[0])?;
            if !arg.literal {
                return Err(CompileErrorKind::NotALiteral.into());
            }
            Ok(arg)
        }
        Function::Condition => compile_condition(state, &Value::Array(args.to_vec())),
    }
}

fn first(func: Function, args: Vec<Typed>) -> CompileResult<Typed> {
    let got = args.len();
    args.into_iter().next().ok_or_else(|| {
        CompileErrorKind::Arity {
            function: func.name().into(),
            expected: "1".into(),
            got,
        }
        .into()
    })
}
