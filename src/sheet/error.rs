//! Errors raised by the dependency graph and the cell store.

use crate::aql::CompileError;
use crate::exec::ExecError;

/// Result type for cell store operations.
pub type CellResult<T> = Result<T, CellError>;

/// Errors from [`DependencyGraph`](super::DependencyGraph) edits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Adding {from} -> {to} would create a dependency cycle")]
    Cycle { from: String, to: String },
}

/// Errors from the cell store.
#[derive(Debug, thiserror::Error)]
pub enum CellError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Failed to compile query: {0}")]
    Compile(#[from] CompileError),

    #[error("Failed to run query: {0}")]
    Exec(#[from] ExecError),

    #[error("Cell does not exist: {0}")]
    UnknownCell(String),

    #[error("No query executor configured for cell {0}")]
    NoExecutor(String),

    #[error("Computation of {cell} failed: {message}")]
    Computation { cell: String, message: String },
}

impl CellError {
    pub fn computation(cell: &str, message: impl Into<String>) -> Self {
        CellError::Computation {
            cell: cell.into(),
            message: message.into(),
        }
    }
}
