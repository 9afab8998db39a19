//! End-to-end compilation from JSON inputs to SQL.
//!
//! ```text
//! schema JSON ─┐
//!              ├→ Schema + Query → compile_query → CompiledQuery → SQL
//! query JSON  ─┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tally::compile::compile_json;
//! use tally::schema::DefaultSchemaConfig;
//!
//! let schema = r#"{"transactions": {"id": {"type": "id"}, "amount": {"type": "integer"}}}"#;
//! let query = r#"{"table": "transactions", "selectExpressions": ["amount"]}"#;
//!
//! let output = compile_json(schema, query, &DefaultSchemaConfig)?;
//! println!("{}", output.sql);
//! ```

use std::sync::Arc;

use crate::aql::{compile_query, CompileError, CompiledQuery, Query, QueryState};
use crate::schema::{Schema, SchemaConfig, SchemaError};

// ============================================================================
// Error Types
// ============================================================================

/// Errors from any stage of [`compile_json`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("Invalid query description: {0}")]
    Query(#[from] serde_json::Error),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

// ============================================================================
// Result Types
// ============================================================================

#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// The generated SQL string.
    pub sql: String,

    /// Pieces, parameters, output types and table dependencies.
    pub compiled: CompiledQuery,
}

// ============================================================================
// Compilation Functions
// ============================================================================

/// Parse a query description (the serialized form of [`Query`]).
pub fn parse_query(query_json: &str) -> PipelineResult<Query> {
    let state: QueryState = serde_json::from_str(query_json)?;
    Ok(Query::from(state))
}

/// Compile a query against an already loaded schema.
pub fn compile_with_schema(
    schema: &Arc<Schema>,
    query: &Query,
    config: &dyn SchemaConfig,
) -> PipelineResult<CompileOutput> {
    let compiled = compile_query(query, schema, config)?;
    Ok(CompileOutput {
        sql: compiled.sql(),
        compiled,
    })
}

/// Parse the schema and query description, then compile.
pub fn compile_json(
    schema_json: &str,
    query_json: &str,
    config: &dyn SchemaConfig,
) -> PipelineResult<CompileOutput> {
    let schema = Schema::from_json(schema_json)?;
    let query = parse_query(query_json)?;
    compile_with_schema(&Arc::new(schema), &query, config)
}

// ============================================================================
// Tests
// ============================================================================
