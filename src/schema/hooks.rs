//! Per-table customization hooks supplied by the host application.

use serde_json::Value;

use crate::aql::Query;

/// Context passed to [`SchemaConfig::table_view`].
#[derive(Debug, Clone, Copy)]
pub struct ViewContext<'a> {
    /// The query asked for soft-deleted rows.
    pub with_dead: bool,
    /// The table is being joined rather than selected from.
    pub is_join: bool,
    /// Free-form options attached to the query with `Query::options`.
    pub table_options: Option<&'a Value>,
}

/// Hooks that let the caller shape how logical tables compile.
///
/// Every method has a no-op default, so `DefaultSchemaConfig` compiles
/// straight against the physical tables.
pub trait SchemaConfig {
    /// Physical table or view to read `table` from. `None` means the table
    /// name itself.
    fn table_view(&self, _table: &str, _ctx: &ViewContext<'_>) -> Option<String> {
        None
    }

    /// Conditions always ANDed into queries against `table` (unless the
    /// query is in raw mode). Keys must be plain fields of `table`.
    fn table_filters(&self, _table: &str) -> Vec<Value> {
        Vec::new()
    }

    /// Rewrite a query before it is compiled.
    fn customize_query(&self, query: &Query) -> Query {
        query.clone()
    }
}

/// Hooks that change nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSchemaConfig;

impl SchemaConfig for DefaultSchemaConfig {}
