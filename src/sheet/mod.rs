//! Reactive cells: named values recomputed when the cells or tables they
//! read change.

pub mod cell;
pub mod error;
pub mod graph;
pub mod store;

pub use cell::{
    resolve_name, unresolve_name, Binding, CacheStatus, Cell, CellSnapshot, CellsChanged,
    Computed, DynamicCell, ListenerId, RunFn,
};
pub use error::{CellError, CellResult, GraphError};
pub use graph::DependencyGraph;
pub use store::{Spreadsheet, TableChanges};

use crate::aql::CompiledQuery;

/// Runs the compiled query behind a query cell.
pub trait QueryExecutor {
    fn execute(&self, compiled: &CompiledQuery) -> CellResult<Computed>;
}

impl<F> QueryExecutor for F
where
    F: Fn(&CompiledQuery) -> CellResult<Computed>,
{
    fn execute(&self, compiled: &CompiledQuery) -> CellResult<Computed> {
        self(compiled)
    }
}
