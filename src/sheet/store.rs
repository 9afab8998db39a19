//! The reactive cell store.
//!
//! Cells live in a [`DependencyGraph`]; writes mark cells dirty inside a
//! transaction, and closing the outermost transaction queues the dirty cells
//! plus everything downstream, in dependency order.
//!
//! The queue runs synchronously. A cell whose computation returns
//! [`Computed::Deferred`] suspends it: the future is parked and
//! [`Spreadsheet::wait_for_computations`] drives it, resuming the queue at
//! the next cell. Only one queue is ever in flight; cells queued meanwhile
//! are appended to it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use super::cell::{
    resolve_name, Binding, CacheStatus, Cell, CellSnapshot, CellsChanged, Computed, DynamicCell,
    ListenerId,
};
use super::error::{CellError, CellResult};
use super::graph::DependencyGraph;
use super::QueryExecutor;
use crate::aql::{compile_query, CompileResult, Query};
use crate::schema::{Schema, SchemaConfig};

/// Changed rows per table: table → row id → row.
pub type TableChanges = HashMap<String, HashMap<String, Value>>;

type Listener = Box<dyn FnMut(&CellsChanged)>;
type SaveCacheFn = Box<dyn FnMut(&[CellSnapshot])>;
type CacheStatusFn = Box<dyn FnMut(CacheStatus)>;

struct Suspended {
    index: usize,
    name: String,
    future: LocalBoxFuture<'static, CellResult<Value>>,
}

pub struct Spreadsheet {
    schema: Arc<Schema>,
    config: Arc<dyn SchemaConfig>,
    executor: Option<Box<dyn QueryExecutor>>,
    graph: DependencyGraph,
    cells: HashMap<String, Cell>,

    transaction_depth: usize,
    dirty_cells: Vec<String>,
    compute_queue: Vec<String>,
    running: bool,
    suspended: Option<Suspended>,
    last_error: Option<CellError>,

    cache_barrier: bool,
    cache_status: CacheStatus,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    save_cache: Option<SaveCacheFn>,
    cache_status_hook: Option<CacheStatusFn>,
}

impl Spreadsheet {
    pub fn new(schema: Arc<Schema>, config: Arc<dyn SchemaConfig>) -> Self {
        Self {
            schema,
            config,
            executor: None,
            graph: DependencyGraph::new(),
            cells: HashMap::new(),
            transaction_depth: 0,
            dirty_cells: Vec::new(),
            compute_queue: Vec::new(),
            running: false,
            suspended: None,
            last_error: None,
            cache_barrier: false,
            cache_status: CacheStatus::Clean,
            listeners: Vec::new(),
            next_listener: 0,
            save_cache: None,
            cache_status_hook: None,
        }
    }

    /// Run query cells through `executor`.
    pub fn with_executor(mut self, executor: impl QueryExecutor + 'static) -> Self {
        self.executor = Some(Box::new(executor));
        self
    }

    // =========================================================================
    // Cells
    // =========================================================================

    fn cell_mut(&mut self, name: &str) -> &mut Cell {
        if !self.cells.contains_key(name) {
            self.graph.add_node(name);
        }
        self.cells
            .entry(name.to_string())
            .or_insert_with(|| Cell::new(name))
    }

    fn resolve_dependency(sheet: &str, dep: &str) -> String {
        if dep.contains('!') {
            dep.to_string()
        } else {
            resolve_name(sheet, dep)
        }
    }

    pub fn has_cell(&self, name: &str) -> bool {
        self.cells.contains_key(name)
    }

    pub fn get(&self, name: &str) -> CellResult<&Cell> {
        self.cells
            .get(name)
            .ok_or_else(|| CellError::UnknownCell(name.into()))
    }

    /// The cell's value, or `null` if it does not exist.
    pub fn get_value(&self, name: &str) -> Value {
        self.cells
            .get(name)
            .map(|c| c.value.clone())
            .unwrap_or(Value::Null)
    }

    /// Qualified names of every cell on `sheet`, sorted.
    pub fn get_cell_names(&self, sheet: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .cells
            .values()
            .filter(|c| c.sheet == sheet)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Assign a value, recomputing everything downstream.
    pub fn set(&mut self, name: &str, value: Value) {
        self.transaction(|sheet| {
            let cell = sheet.cell_mut(name);
            if matches!(cell.binding, Binding::Unbound) {
                cell.binding = Binding::Static;
            }
            cell.value = value;
            sheet.mark_dirty(name);
        });
    }

    pub fn create(&mut self, name: &str, value: Value) {
        self.set(name, value);
    }

    /// Create a constant cell; does nothing if it already exists.
    pub fn create_static(&mut self, sheet: &str, name: &str, value: Value) {
        let resolved = resolve_name(sheet, name);
        if !self.cells.contains_key(&resolved) {
            self.set(&resolved, value);
        }
    }

    /// Bind a cell to a computation over other cells.
    ///
    /// Rebinding a dynamic cell is ignored unless `refresh` is set. The cell
    /// is queued when it has no value yet (nothing was prewarmed) or on
    /// refresh.
    pub fn create_dynamic(&mut self, sheet: &str, name: &str, def: DynamicCell) -> CellResult<()> {
        let resolved = resolve_name(sheet, name);
        let already_dynamic = self
            .cells
            .get(&resolved)
            .is_some_and(|c| matches!(c.binding, Binding::Dynamic { .. }));
        if already_dynamic && !def.refresh {
            return Ok(());
        }

        let deps: Vec<String> = def
            .dependencies
            .iter()
            .map(|d| Self::resolve_dependency(sheet, d))
            .collect();
        for dep in &deps {
            self.cell_mut(dep);
        }
        self.cell_mut(&resolved);

        // reachability from the cell is unaffected by dropping its inputs
        for dep in &deps {
            if *dep == resolved || self.graph.has_path(&resolved, dep) {
                return Err(super::GraphError::Cycle {
                    from: dep.clone(),
                    to: resolved.clone(),
                }
                .into());
            }
        }

        self.graph.remove_incoming_edges(&resolved);
        for dep in &deps {
            self.graph.add_edge(dep, &resolved)?;
        }

        let cell = self.cell_mut(&resolved);
        cell.binding = Binding::Dynamic { run: def.run };
        cell.dependencies = deps;
        if def.refresh || cell.value.is_null() {
            cell.value = def.initial_value;
            self.transaction(|sheet| sheet.mark_dirty(&resolved));
        }
        Ok(())
    }

    /// Bind a cell to a query, compiling it unless this exact query object
    /// is already bound.
    pub fn create_query(&mut self, sheet: &str, name: &str, query: Query) -> CompileResult<()> {
        let resolved = resolve_name(sheet, name);
        let unchanged = self.cells.get(&resolved).is_some_and(|c| match &c.binding {
            Binding::Query { query: bound, .. } => bound.ptr_eq(&query),
            _ => false,
        });

        if !unchanged {
            let compiled = compile_query(&query, &self.schema, self.config.as_ref())?;
            debug!(cell = %resolved, sql = %compiled.sql(), "bound query cell");
            self.graph.remove_incoming_edges(&resolved);
            let cell = self.cell_mut(&resolved);
            cell.dependencies.clear();
            cell.binding = Binding::Query {
                query,
                compiled: Box::new(compiled),
            };
        }

        self.transaction(|sheet| sheet.mark_dirty(&resolved));
        Ok(())
    }

    /// Add inputs to a dynamic cell without rebinding it.
    pub fn add_dependencies(&mut self, sheet: &str, name: &str, deps: &[&str]) -> CellResult<()> {
        let resolved = resolve_name(sheet, name);
        self.get(&resolved)?;
        for dep in deps {
            let dep = Self::resolve_dependency(sheet, dep);
            self.cell_mut(&dep);
            self.graph.add_edge(&dep, &resolved)?;
            let cell = self.cell_mut(&resolved);
            if !cell.dependencies.contains(&dep) {
                cell.dependencies.push(dep);
            }
        }
        self.transaction(|sheet| sheet.mark_dirty(&resolved));
        Ok(())
    }

    pub fn remove_dependencies(&mut self, sheet: &str, name: &str, deps: &[&str]) -> CellResult<()> {
        let resolved = resolve_name(sheet, name);
        self.get(&resolved)?;
        for dep in deps {
            let dep = Self::resolve_dependency(sheet, dep);
            self.graph.remove_edge(&dep, &resolved);
            self.cell_mut(&resolved).dependencies.retain(|d| *d != dep);
        }
        self.transaction(|sheet| sheet.mark_dirty(&resolved));
        Ok(())
    }

    /// Drop a cell's binding and inputs, keeping its current value.
    pub fn unbind(&mut self, name: &str) {
        if let Some(cell) = self.cells.get_mut(name) {
            cell.binding = Binding::Unbound;
            cell.dependencies.clear();
            self.graph.remove_incoming_edges(name);
        }
    }

    /// Unbind a cell and clear its value.
    pub fn void_cell(&mut self, name: &str) {
        self.unbind(name);
        if let Some(cell) = self.cells.get_mut(name) {
            cell.value = Value::Null;
        }
    }

    pub fn delete_cell(&mut self, name: &str) {
        self.void_cell(name);
        self.graph.remove_node(name);
        self.cells.remove(name);
    }

    pub fn clear_sheet(&mut self, sheet: &str) {
        for name in self.get_cell_names(sheet) {
            self.delete_cell(&name);
        }
    }

    /// Seed a value before the cell is bound, without recomputing anything.
    pub fn prewarm_cache(&mut self, name: &str, value: Value) {
        self.cell_mut(name).value = value;
    }

    pub fn load_cache(&mut self, snapshots: impl IntoIterator<Item = CellSnapshot>) {
        for snapshot in snapshots {
            self.prewarm_cache(&snapshot.name, snapshot.value);
        }
    }

    pub fn generate_dot(&self) -> String {
        self.graph.generate_dot()
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub fn subscribe(&mut self, listener: impl FnMut(&CellsChanged) + 'static) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: ListenerId) {
        self.listeners.retain(|(l, _)| *l != id);
    }

    /// Called with the recomputed cells after every settled batch.
    pub fn on_save_cache(&mut self, save: impl FnMut(&[CellSnapshot]) + 'static) {
        self.save_cache = Some(Box::new(save));
    }

    /// Called whenever the cache status flips.
    pub fn on_cache_status(&mut self, hook: impl FnMut(CacheStatus) + 'static) {
        self.cache_status_hook = Some(Box::new(hook));
    }

    pub fn cache_status(&self) -> CacheStatus {
        self.cache_status
    }

    fn set_cache_status(&mut self, status: CacheStatus) {
        if self.cache_status != status {
            self.cache_status = status;
            if let Some(hook) = self.cache_status_hook.as_mut() {
                hook(status);
            }
        }
    }

    fn mark_cache_clean(&mut self) {
        if !self.cache_barrier {
            self.set_cache_status(CacheStatus::Clean);
        }
    }

    /// Keep the cache status from returning to clean until
    /// [`Spreadsheet::end_cache_barrier`]. The status itself is left as is.
    pub fn start_cache_barrier(&mut self) {
        self.cache_barrier = true;
    }

    pub fn end_cache_barrier(&mut self) {
        self.cache_barrier = false;
        if !self.running && self.compute_queue.is_empty() {
            self.mark_cache_clean();
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    fn mark_dirty(&mut self, name: &str) {
        self.dirty_cells.push(name.to_string());
    }

    pub fn start_transaction(&mut self) {
        self.transaction_depth += 1;
    }

    /// Close a transaction; the outermost one queues every dirty cell.
    pub fn end_transaction(&mut self) {
        self.transaction_depth = self.transaction_depth.saturating_sub(1);
        if self.transaction_depth == 0 {
            let dirty = std::mem::take(&mut self.dirty_cells);
            let order = self.graph.topological_sort(&dirty);
            self.queue_computation(order);
        }
    }

    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        self.start_transaction();
        let result = f(self);
        self.end_transaction();
        result
    }

    /// Mark every query cell reading a changed table dirty.
    pub fn trigger_database_changes(&mut self, old: &TableChanges, new: &TableChanges) {
        let tables: HashSet<&str> = old.keys().chain(new.keys()).map(String::as_str).collect();

        let stale: BTreeSet<String> = self
            .cells
            .values()
            .filter(|cell| match &cell.binding {
                Binding::Query { compiled, .. } => compiled
                    .dependencies()
                    .iter()
                    .any(|t| tables.contains(t.as_str())),
                _ => false,
            })
            .map(|cell| cell.name.clone())
            .collect();

        if !stale.is_empty() {
            debug!(cells = stale.len(), "tables changed");
        }
        self.transaction(|sheet| {
            for name in &stale {
                sheet.mark_dirty(name);
            }
        });
    }

    // =========================================================================
    // Computation
    // =========================================================================

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Error that aborted the most recent batch, if not yet collected by
    /// [`Spreadsheet::wait_for_computations`].
    pub fn last_error(&self) -> Option<&CellError> {
        self.last_error.as_ref()
    }

    fn queue_computation(&mut self, names: Vec<String>) {
        if names.is_empty() {
            return;
        }
        self.set_cache_status(CacheStatus::Dirty);
        self.compute_queue.extend(names);
        if !self.running {
            self.run_computations(0);
        }
    }

    fn compute(&self, name: &str) -> CellResult<Option<Computed>> {
        let Some(cell) = self.cells.get(name) else {
            return Ok(None);
        };
        match &cell.binding {
            Binding::Dynamic { run } => {
                let args: Vec<Value> = cell
                    .dependencies
                    .iter()
                    .map(|dep| self.get_value(dep))
                    .collect();
                run(&args).map(Some)
            }
            Binding::Query { compiled, .. } => {
                let executor = self
                    .executor
                    .as_ref()
                    .ok_or_else(|| CellError::NoExecutor(name.into()))?;
                executor.execute(compiled).map(Some)
            }
            Binding::Static | Binding::Unbound => Ok(None),
        }
    }

    fn assign(&mut self, name: &str, value: Value) {
        if let Some(cell) = self.cells.get_mut(name) {
            cell.value = value;
        }
    }

    fn run_computations(&mut self, start: usize) {
        self.running = true;
        let mut index = start;
        while index < self.compute_queue.len() {
            let name = self.compute_queue[index].clone();
            match self.compute(&name) {
                Ok(None) => {}
                Ok(Some(Computed::Immediate(value))) => self.assign(&name, value),
                Ok(Some(Computed::Deferred(future))) => {
                    self.suspended = Some(Suspended {
                        index,
                        name,
                        future,
                    });
                    return;
                }
                Err(err) => {
                    self.fail(&name, err);
                    return;
                }
            }
            index += 1;
        }
        self.finish();
    }

    fn fail(&mut self, name: &str, err: CellError) {
        warn!(
            cell = %name,
            dropped = self.compute_queue.len(),
            error = %err,
            "computation failed, discarding queue"
        );
        self.compute_queue.clear();
        self.running = false;
        self.last_error = Some(err);
    }

    fn finish(&mut self) {
        let mut seen = HashSet::new();
        let names: Vec<String> = std::mem::take(&mut self.compute_queue)
            .into_iter()
            .filter(|n| seen.insert(n.clone()))
            .collect();
        self.running = false;
        debug!(cells = names.len(), "computations finished");

        let changed = CellsChanged {
            names: names.clone(),
        };
        for (_, listener) in self.listeners.iter_mut() {
            listener(&changed);
        }

        let snapshots: Vec<CellSnapshot> = names
            .iter()
            .filter_map(|n| self.cells.get(n).map(Cell::snapshot))
            .collect();
        if let Some(save) = self.save_cache.as_mut() {
            save(&snapshots);
        }
        self.mark_cache_clean();
    }

    /// Drive a suspended queue to completion.
    ///
    /// Returns the error that aborted the batch, if any.
    pub async fn wait_for_computations(&mut self) -> CellResult<()> {
        while let Some(Suspended {
            index,
            name,
            future,
        }) = self.suspended.take()
        {
            match future.await {
                Ok(value) => {
                    self.assign(&name, value);
                    self.run_computations(index + 1);
                }
                Err(err) => self.fail(&name, err),
            }
        }
        match self.last_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
