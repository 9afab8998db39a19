//! AQL: a JSON query language compiled to SQLite.
//!
//! A query names a root table and lists filter, select, group and order
//! expressions. Fields of related tables are reached through dotted paths
//! (`payee.name`), which compile to LEFT JOINs along foreign keys declared
//! in the [`Schema`](crate::schema::Schema).
//!
//! # Example
//!
//! ```ignore
//! use tally::aql::{compile_query, q};
//! use tally::schema::DefaultSchemaConfig;
//!
//! let query = q("transactions")
//!     .filter(json!({"amount": {"$gte": 100}}))
//!     .select(json!(["amount", "payee.name"]));
//! let compiled = compile_query(&query, &schema, &DefaultSchemaConfig)?;
//! println!("{}", compiled.sql());
//! ```

pub mod compiler;
pub mod convert;
pub mod error;
pub mod expr;
pub mod ops;
pub mod path;
pub mod query;
pub mod state;
pub mod types;

pub use compiler::{
    compile_order_by, compile_query, construct_sql, is_aggregate_query, quote_alias,
    CompiledQuery, SqlPieces,
};
pub use convert::{convert_input, convert_output, ConvertError};
pub use error::{CompileError, CompileErrorKind, CompileResult, ErrorCategory, Frame, FrameKind};
pub use expr::{compile_expr, compile_function, Function};
pub use ops::{compile_and, compile_conditions, compile_op, compile_or, Operator};
pub use path::{resolve_path, resolve_ref_path};
pub use query::{q, Query, QueryState};
pub use state::{CompilerState, NamedParam, PathInfo, PathMap};
pub use types::{cast_input, Typed, TypedKind, ValueType};
