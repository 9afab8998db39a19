//! Cells and the values they compute.

use std::fmt;
use std::future::Future;

use futures::future::LocalBoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::CellResult;
use crate::aql::{CompiledQuery, Query};

/// Qualified cell name: `sheet!name`, or just `name` without a sheet.
pub fn resolve_name(sheet: &str, name: &str) -> String {
    if sheet.is_empty() {
        name.to_string()
    } else {
        format!("{}!{}", sheet, name)
    }
}

/// Split a qualified name into `(sheet, name)`.
pub fn unresolve_name(resolved: &str) -> (&str, &str) {
    match resolved.split_once('!') {
        Some((sheet, name)) => (sheet, name),
        None => ("", resolved),
    }
}

/// Result of running a cell: ready now, or once the future settles.
pub enum Computed {
    Immediate(Value),
    Deferred(LocalBoxFuture<'static, CellResult<Value>>),
}

impl Computed {
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = CellResult<Value>> + 'static,
    {
        Computed::Deferred(fut.boxed_local())
    }
}

impl From<Value> for Computed {
    fn from(value: Value) -> Self {
        Computed::Immediate(value)
    }
}

impl fmt::Debug for Computed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Computed::Immediate(v) => f.debug_tuple("Immediate").field(v).finish(),
            Computed::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// Computation over the values of a cell's dependencies, in dependency order.
pub type RunFn = Box<dyn Fn(&[Value]) -> CellResult<Computed>>;

/// What a cell's value comes from.
pub enum Binding {
    Unbound,
    Static,
    Dynamic { run: RunFn },
    Query {
        query: Query,
        compiled: Box<CompiledQuery>,
    },
}

impl Binding {
    pub fn kind(&self) -> &'static str {
        match self {
            Binding::Unbound => "unbound",
            Binding::Static => "static",
            Binding::Dynamic { .. } => "dynamic",
            Binding::Query { .. } => "query",
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

#[derive(Debug)]
pub struct Cell {
    pub name: String,
    pub sheet: String,
    pub value: Value,
    pub binding: Binding,
    /// Qualified names this cell reads, in argument order.
    pub dependencies: Vec<String>,
}

impl Cell {
    /// A fresh unbound cell for a qualified name.
    pub fn new(resolved: &str) -> Self {
        let (sheet, _) = unresolve_name(resolved);
        Self {
            name: resolved.to_string(),
            sheet: sheet.to_string(),
            value: Value::Null,
            binding: Binding::Unbound,
            dependencies: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> CellSnapshot {
        CellSnapshot {
            name: self.name.clone(),
            value: self.value.clone(),
        }
    }
}

/// Arguments to `Spreadsheet::create_dynamic`.
pub struct DynamicCell {
    /// Dependency names; unqualified names resolve against the cell's sheet.
    pub dependencies: Vec<String>,
    pub run: RunFn,
    pub initial_value: Value,
    /// Rebind even if the cell is already dynamic, resetting its value.
    pub refresh: bool,
}

impl DynamicCell {
    pub fn new<F>(dependencies: &[&str], run: F) -> Self
    where
        F: Fn(&[Value]) -> CellResult<Computed> + 'static,
    {
        Self {
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            run: Box::new(run),
            initial_value: Value::Null,
            refresh: false,
        }
    }

    pub fn with_initial_value(mut self, value: Value) -> Self {
        self.initial_value = value;
        self
    }

    pub fn with_refresh(mut self) -> Self {
        self.refresh = true;
        self
    }
}

/// A cell's name and value, as handed to listeners and the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellSnapshot {
    pub name: String,
    pub value: Value,
}

/// Emitted once per settled computation batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellsChanged {
    pub names: Vec<String>,
}

/// Whether every cell value is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Clean,
    Dirty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
