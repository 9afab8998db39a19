//! Compile errors and the expression stack attached to them.
//!
//! Each compiler entry point runs inside [`CompilerState::with_frame`],
//! which records a [`Frame`] on the error as it propagates outward. The
//! trail is therefore stored innermost first, and the outermost (root) call
//! is always the last frame.
//!
//! [`CompilerState::with_frame`]: super::state::CompilerState::with_frame

use std::fmt;

use serde_json::Value;

use super::types::ValueType;

/// Result type for compiler operations.
pub type CompileResult<T> = Result<T, CompileError>;

/// Frames longer than this are pretty-printed over several lines.
const MAX_INLINE_FRAME_WIDTH: usize = 70;

/// Broad class of a compile failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Referenced table or field does not exist.
    Schema,
    /// A dotted segment is not a foreign key, or its parent is unresolved.
    Path,
    /// Incompatible type conversion, parameter conflict, bad date literal.
    Cast,
    /// Wrong number of arguments.
    Arity,
    /// The expression is well-formed but not allowed in this position.
    Policy,
    /// Unknown function/operator or a malformed expression.
    Syntax,
}

/// What went wrong, without the expression trail.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileErrorKind {
    #[error("Table \"{0}\" does not exist in the schema")]
    UnknownTable(String),

    #[error("Field \"{field}\" does not exist in table \"{table}\"")]
    UnknownField { table: String, field: String },

    #[error("Path error: {0} table does not exist")]
    PathTableMissing(String),

    #[error("Field not joinable on table {table}: \"{field}\"")]
    NotJoinable { table: String, field: String },

    #[error("Path does not exist: {0}")]
    MissingParentPath(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Can't convert {from} to {to}")]
    CannotConvert { from: ValueType, to: ValueType },

    #[error("Parameter \"{name}\" can't convert to {requested} (already inferred as {existing})")]
    ParamConflict {
        name: String,
        existing: ValueType,
        requested: ValueType,
    },

    #[error("Invalid date literal {0}: expected YYYY-MM-DD, YYYY-MM or YYYY")]
    InvalidDate(String),

    #[error("Casting string fields to dates is not supported")]
    StringFieldToDate,

    #[error("A non-literal null doesn't make sense")]
    NonLiteralNull,

    #[error("Invalid number of arguments to {function}: expected {expected}, got {got}")]
    Arity {
        function: String,
        expected: String,
        got: usize,
    },

    #[error("Literal not passed to $literal")]
    NotALiteral,

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Unknown property \"{0}\". Did you mean to call a function? Try prefixing it with $")]
    MissingDollar(String),

    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    #[error("Invalid field reference: {0}")]
    InvalidFieldReference(String),

    #[error("Unsupported type of expression: {0}")]
    UnsupportedExpression(String),

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[error("Invalid order direction: {0}")]
    InvalidOrderDirection(String),

    #[error("Table filters cannot have joins: {0}")]
    JoinInTableFilter(String),

    #[error(
        "Invalid field \"{0}\", are you trying to select a function? You need to name the expression"
    )]
    UnnamedSelectFunction(String),
}

impl CompileErrorKind {
    pub fn category(&self) -> ErrorCategory {
        use CompileErrorKind::*;
        match self {
            UnknownTable(_) | UnknownField { .. } => ErrorCategory::Schema,
            PathTableMissing(_) | NotJoinable { .. } | MissingParentPath(_) | InvalidPath(_) => {
                ErrorCategory::Path
            }
            CannotConvert { .. }
            | ParamConflict { .. }
            | InvalidDate(_)
            | StringFieldToDate
            | NonLiteralNull => ErrorCategory::Cast,
            Arity { .. } => ErrorCategory::Arity,
            JoinInTableFilter(_) | UnnamedSelectFunction(_) | NotALiteral => ErrorCategory::Policy,
            UnknownFunction(_)
            | MissingDollar(_)
            | UnknownOperator(_)
            | InvalidFieldReference(_)
            | UnsupportedExpression(_)
            | InvalidCondition(_)
            | InvalidOrderDirection(_) => ErrorCategory::Syntax,
        }
    }
}

/// Kind of compiler entry point a frame was recorded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Expr,
    Function,
    Op,
    Select,
    Filter,
    GroupBy,
    OrderBy,
    Value,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Expr => "expr",
            FrameKind::Function => "function",
            FrameKind::Op => "op",
            FrameKind::Select => "select",
            FrameKind::Filter => "filter",
            FrameKind::GroupBy => "groupBy",
            FrameKind::OrderBy => "orderBy",
            FrameKind::Value => "value",
        }
    }
}

/// One entry of the expression stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub kind: FrameKind,
    pub args: Vec<Value>,
}

impl Frame {
    pub fn new(kind: FrameKind, args: Vec<Value>) -> Self {
        Self { kind, args }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(pretty_value).collect();
        write!(f, "{}: {}", self.kind.as_str(), args.join(" "))
    }
}

fn pretty_value(value: &Value) -> String {
    if let Value::String(s) = value {
        return s.clone();
    }
    let compact = value.to_string();
    if compact.len() <= MAX_INLINE_FRAME_WIDTH {
        return compact;
    }
    match serde_json::to_string_pretty(value) {
        Ok(expanded) => expanded.replace('\n', "\n  "),
        Err(_) => compact,
    }
}

/// A failed compile, with the expression trail that led to it.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    /// Frames innermost first; the root call is last.
    pub trail: Vec<Frame>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind) -> Self {
        Self {
            kind,
            trail: Vec::new(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// The frames rendered under "Expression stack:".
    ///
    /// The innermost frame is dropped since the message already describes
    /// it; the remaining frames run innermost to outermost, ending with the
    /// root call.
    pub fn stack_frames(&self) -> &[Frame] {
        match self.trail.len() {
            0 => &[],
            1 => &self.trail[..],
            _ => &self.trail[1..],
        }
    }

    pub fn render_stack(&self) -> Option<String> {
        let frames = self.stack_frames();
        if frames.is_empty() {
            return None;
        }
        let mut out = String::from("Expression stack:");
        for frame in frames {
            out.push_str("\n  ");
            out.push_str(&frame.to_string());
        }
        Some(out)
    }
}

impl From<CompileErrorKind> for CompileError {
    fn from(kind: CompileErrorKind) -> Self {
        CompileError::new(kind)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(stack) = self.render_stack() {
            write!(f, "\n\n{}", stack)?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileError {}
