//! # tally
//!
//! A schema-typed query compiler and reactive cell store over SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Query description (AQL, JSON or builder)          │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [aql + schema]
//! ┌─────────────────────────────────────────────────────────┐
//! │   CompiledQuery: SQL pieces, bind sites, output types,   │
//! │   table dependencies                                     │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [exec]
//! ┌─────────────────────────────────────────────────────────┐
//! │                 SQLite rows → JSON                       │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [sheet]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Reactive cells: static, dynamic and query-bound        │
//! │   values, recomputed in dependency order                 │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod aql;
pub mod cache;
pub mod compile;
pub mod config;
pub mod exec;
pub mod schema;
pub mod sheet;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::aql::{compile_query, q, CompileError, CompiledQuery, Query, ValueType};
    pub use crate::exec::{run_compiled_query, SqliteExecutor};
    pub use crate::schema::{DefaultSchemaConfig, FieldDesc, FieldType, Schema, SchemaConfig, TableSchema};
    pub use crate::sheet::{
        CellError, CellsChanged, Computed, DynamicCell, QueryExecutor, Spreadsheet, TableChanges,
    };
}

pub use aql::{compile_query, q, Query};
pub use schema::Schema;
pub use sheet::Spreadsheet;
