//! Query compilation: a [`Query`] plus a [`Schema`] into SQL pieces.
//!
//! Phases run in a fixed order since later ones read what earlier ones
//! recorded on the [`CompilerState`]:
//!
//! 1. `customize_query` hook
//! 2. select list (adds `id` unless the query aggregates)
//! 3. where clause, plus table filters unless in raw mode
//! 4. group by
//! 5. order by
//! 6. one LEFT JOIN per resolved path

use std::collections::BTreeMap;
use std::mem;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::error::{CompileErrorKind, CompileResult, FrameKind};
use super::expr::{compile_expr, compile_function, Function};
use super::ops::compile_and;
use super::query::{Query, QueryState};
use super::state::{CompilerState, NamedParam, PathInfo};
use super::types::ValueType;
use crate::schema::{Schema, SchemaConfig, ViewContext};

// =============================================================================
// Output
// =============================================================================

/// SQL fragments of a compiled query.
///
/// `where_clause`, `group_by` and `order_by` carry their keyword; empty
/// strings mean the clause is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SqlPieces {
    pub select: String,
    pub from: String,
    pub joins: String,
    #[serde(rename = "where")]
    pub where_clause: String,
    pub group_by: String,
    pub order_by: String,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// Result of [`compile_query`].
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub pieces: SqlPieces,
    pub state: CompilerState,
    /// The query as rewritten by the `customize_query` hook.
    pub query: Query,
}

impl CompiledQuery {
    /// The full statement.
    pub fn sql(&self) -> String {
        construct_sql(self)
    }

    /// Tables read by the query, root first.
    pub fn dependencies(&self) -> &[String] {
        &self.state.dependencies
    }

    pub fn output_types(&self) -> &BTreeMap<String, ValueType> {
        &self.state.output_types
    }

    /// Bind sites in statement order.
    pub fn named_parameters(&self) -> &[NamedParam] {
        &self.state.named_parameters
    }

    pub fn is_calculation(&self) -> bool {
        self.query.state().calculation
    }
}

// =============================================================================
// Compilation
// =============================================================================

/// Double-quote aliases SQLite would otherwise misread.
pub fn quote_alias(alias: &str) -> String {
    if alias.contains('.') || alias == "group" {
        format!("\"{}\"", alias)
    } else {
        alias.to_string()
    }
}

fn contains_aggregate(value: &Value) -> bool {
    match value {
        Value::Object(obj) => obj.iter().any(|(k, v)| {
            Function::from_name(k).is_some_and(|f| f.is_aggregate()) || contains_aggregate(v)
        }),
        Value::Array(items) => items.iter().any(contains_aggregate),
        _ => false,
    }
}

/// A query aggregates when it groups or selects `$sum`/`$count` anywhere.
pub fn is_aggregate_query(query: &QueryState) -> bool {
    !query.group_expressions.is_empty()
        || query.select_expressions.iter().any(contains_aggregate)
}

fn field_ref(name: &str) -> Value {
    Value::String(format!("${}", name))
}

/// Compile `query` against `schema`.
pub fn compile_query(
    query: &Query,
    schema: &Arc<Schema>,
    config: &dyn SchemaConfig,
) -> CompileResult<CompiledQuery> {
    let query = config.customize_query(query);
    let qs = query.state();

    if schema.table(&qs.table).is_none() {
        return Err(CompileErrorKind::UnknownTable(qs.table.clone()).into());
    }

    let ctx = ViewContext {
        with_dead: qs.with_dead,
        is_join: false,
        table_options: qs.table_options.as_ref(),
    };
    let from = config
        .table_view(&qs.table, &ctx)
        .unwrap_or_else(|| qs.table.clone());
    let mut state = CompilerState::new(Arc::clone(schema), &qs.table, &from, qs.validate_refs);

    let select = compile_select(&mut state, qs)?;
    let select_params = state.param_mark();

    let filters = Value::Array(qs.filter_expressions.as_ref().clone());
    let mut where_clause = state.with_frame(
        FrameKind::Filter,
        || vec![filters.clone()],
        |state| compile_and(state, &filters),
    )?;
    if !qs.raw_mode {
        if let Some(extra) = compile_table_filters(&mut state, config, &qs.table)? {
            where_clause = format!("{} AND {}", where_clause, extra);
        }
    }

    let group_by = if qs.group_expressions.is_empty() {
        String::new()
    } else {
        format!("GROUP BY {}", compile_group_by(&mut state, &qs.group_expressions)?)
    };

    let order_by = if qs.order_expressions.is_empty() {
        String::new()
    } else {
        format!("ORDER BY {}", compile_order_by(&mut state, &qs.order_expressions)?)
    };

    // join filters compile last but their text precedes WHERE
    let join_params = state.param_mark();
    let joins = compile_joins(&mut state, config, qs)?;
    state.move_params_to(join_params, select_params);

    debug!(
        table = %qs.table,
        joins = state.paths.len(),
        params = state.named_parameters.len(),
        "compiled query"
    );

    let pieces = SqlPieces {
        select,
        from,
        joins,
        where_clause: format!("WHERE {}", where_clause),
        group_by,
        order_by,
        limit: qs.limit,
        offset: qs.offset,
    };
    Ok(CompiledQuery {
        pieces,
        state,
        query,
    })
}

fn compile_select(state: &mut CompilerState, query: &QueryState) -> CompileResult<String> {
    let exprs = query.select_expressions.as_ref();
    state.with_frame(
        FrameKind::Select,
        || vec![Value::Array(exprs.clone())],
        |state| {
            let mut items: Vec<Value> = exprs.clone();
            let selects_id = items.iter().any(|e| match e {
                Value::String(s) => s == "id" || s == "*",
                Value::Object(obj) => obj.contains_key("id"),
                _ => false,
            });
            if !is_aggregate_query(query) && !selects_id {
                items.insert(0, Value::String("id".into()));
            }

            let mut columns = Vec::with_capacity(items.len());
            for item in &items {
                match item {
                    Value::String(s) if s == "*" => {
                        let table = state
                            .schema
                            .table(&state.implicit_table_name)
                            .ok_or_else(|| {
                                CompileErrorKind::UnknownTable(state.implicit_table_name.clone())
                            })?;
                        let types: Vec<(String, ValueType)> = table
                            .fields()
                            .map(|(name, desc)| (name.to_string(), desc.field_type.into()))
                            .collect();
                        state.output_types.extend(types);
                        columns.push(format!("{}.*", state.implicit_table_id));
                    }
                    Value::String(s) => {
                        let typed = compile_expr(state, &field_ref(s))?;
                        columns.push(format!("{} AS {}", typed.sql, quote_alias(s)));
                        state.output_types.insert(s.clone(), typed.ty);
                    }
                    Value::Object(obj) => {
                        for (alias, value) in obj {
                            columns.push(compile_named_select(state, query, alias, value)?);
                        }
                    }
                    other => {
                        return Err(
                            CompileErrorKind::UnsupportedExpression(other.to_string()).into()
                        )
                    }
                }
            }
            Ok(columns.join(", "))
        },
    )
}

fn compile_named_select(
    state: &mut CompilerState,
    query: &QueryState,
    alias: &str,
    value: &Value,
) -> CompileResult<String> {
    if alias.starts_with('$') {
        return Err(CompileErrorKind::UnnamedSelectFunction(alias.into()).into());
    }
    let typed = match value {
        Value::String(field) => compile_expr(state, &field_ref(field))?,
        Value::Object(func) => {
            state.orders = Some(query.order_expressions.as_ref().clone());
            let result = compile_function(state, func);
            state.orders = None;
            result?
        }
        other => compile_expr(state, other)?,
    };
    state.output_types.insert(alias.into(), typed.ty);
    Ok(format!("{} AS {}", typed.sql, quote_alias(alias)))
}

fn compile_group_by(state: &mut CompilerState, exprs: &[Value]) -> CompileResult<String> {
    state.with_frame(
        FrameKind::GroupBy,
        || vec![Value::Array(exprs.to_vec())],
        |state| {
            let mut out = Vec::with_capacity(exprs.len());
            for expr in exprs {
                let typed = match expr {
                    Value::String(field) => compile_expr(state, &field_ref(field))?,
                    other => compile_expr(state, other)?,
                };
                out.push(typed.sql);
            }
            Ok(out.join(", "))
        },
    )
}

/// Compile order expressions (`field`, `{field: dir}` or
/// `{"$fn": args, "$dir": dir}`) without the `ORDER BY` keyword.
pub fn compile_order_by(state: &mut CompilerState, exprs: &[Value]) -> CompileResult<String> {
    state.with_frame(
        FrameKind::OrderBy,
        || vec![Value::Array(exprs.to_vec())],
        |state| {
            let mut out = Vec::with_capacity(exprs.len());
            for expr in exprs {
                let (sql, dir) = match expr {
                    Value::String(field) => (compile_expr(state, &field_ref(field))?.sql, None),
                    Value::Object(obj) => {
                        let first = obj
                            .keys()
                            .find(|k| k.as_str() != "$dir")
                            .ok_or_else(|| {
                                CompileErrorKind::UnsupportedExpression(expr.to_string())
                            })?;
                        if first.starts_with('$') {
                            let func: Map<String, Value> = obj
                                .iter()
                                .filter(|(k, _)| k.as_str() != "$dir")
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect();
                            let typed = compile_expr(state, &Value::Object(func))?;
                            (typed.sql, obj.get("$dir"))
                        } else {
                            let typed = compile_expr(state, &field_ref(first))?;
                            (typed.sql, obj.get(first))
                        }
                    }
                    other => compile_expr(state, other).map(|t| (t.sql, None))?,
                };

                match dir {
                    None | Some(Value::Null) => out.push(sql),
                    Some(Value::String(d)) if d == "asc" || d == "desc" => {
                        out.push(format!("{} {}", sql, d))
                    }
                    Some(other) => {
                        let text = other.as_str().map(str::to_string).unwrap_or_else(|| other.to_string());
                        return Err(CompileErrorKind::InvalidOrderDirection(text).into());
                    }
                }
            }
            Ok(out.join(", "))
        },
    )
}

/// First condition key that names a path, searching inside `$and`/`$or`.
fn find_path_key(conds: &Value) -> Option<String> {
    match conds {
        Value::Array(items) => items.iter().find_map(find_path_key),
        Value::Object(obj) => obj.iter().find_map(|(k, v)| {
            if k == "$and" || k == "$or" {
                find_path_key(v)
            } else if k.contains('.') {
                Some(k.clone())
            } else {
                None
            }
        }),
        _ => None,
    }
}

/// Compile the configured filters for `table` against the current implicit
/// table. Foreign keys are read as stored.
fn compile_table_filters(
    state: &mut CompilerState,
    config: &dyn SchemaConfig,
    table: &str,
) -> CompileResult<Option<String>> {
    let filters = config.table_filters(table);
    if filters.is_empty() {
        return Ok(None);
    }
    let filters = Value::Array(filters);
    if let Some(key) = find_path_key(&filters) {
        return Err(CompileErrorKind::JoinInTableFilter(key).into());
    }

    let validate_refs = mem::replace(&mut state.validate_refs, false);
    let result = state.with_frame(
        FrameKind::Filter,
        || vec![filters.clone()],
        |state| compile_and(state, &filters),
    );
    state.validate_refs = validate_refs;
    result.map(Some)
}

fn compile_join_filters(
    state: &mut CompilerState,
    config: &dyn SchemaConfig,
    info: &PathInfo,
) -> CompileResult<Option<String>> {
    let table_name = mem::replace(&mut state.implicit_table_name, info.table_name.clone());
    let table_id = mem::replace(&mut state.implicit_table_id, info.table_id.clone());
    let paths = mem::take(&mut state.paths);

    let result = compile_table_filters(state, config, &info.table_name);

    state.implicit_table_name = table_name;
    state.implicit_table_id = table_id;
    state.paths = paths;
    result
}

fn compile_joins(
    state: &mut CompilerState,
    config: &dyn SchemaConfig,
    query: &QueryState,
) -> CompileResult<String> {
    let paths: Vec<PathInfo> = state.paths.iter().map(|(_, info)| info.clone()).collect();
    let ctx = ViewContext {
        with_dead: query.with_dead,
        is_join: true,
        table_options: query.table_options.as_ref(),
    };

    let mut joins = Vec::with_capacity(paths.len());
    for info in &paths {
        let table = if info.no_mapping {
            info.table_name.clone()
        } else {
            config
                .table_view(&info.table_name, &ctx)
                .unwrap_or_else(|| info.table_name.clone())
        };

        let mut sql = format!(
            "LEFT JOIN {} AS {} ON {}.id = {}.{}",
            table,
            info.table_id,
            info.table_id,
            info.join_table,
            quote_alias(&info.join_field)
        );
        if !query.with_dead && state.schema.has_tombstone(&info.table_name) {
            sql.push_str(&format!(" AND {}.tombstone = 0", info.table_id));
        }
        if !query.raw_mode {
            if let Some(filters) = compile_join_filters(state, config, info)? {
                sql.push_str(&format!(" AND {}", filters));
            }
        }

        if !state.dependencies.contains(&info.table_name) {
            state.dependencies.push(info.table_name.clone());
        }
        joins.push(sql);
    }
    Ok(joins.join("\n"))
}

// =============================================================================
// Assembly
// =============================================================================

/// Assemble the pieces into one statement, guarding soft-deleted root rows
/// unless the query asked for them.
pub fn construct_sql(compiled: &CompiledQuery) -> String {
    let query = compiled.query.state();
    let pieces = &compiled.pieces;

    let mut where_clause = pieces.where_clause.clone();
    if !query.with_dead && compiled.state.schema.has_tombstone(&query.table) {
        where_clause.push_str(&format!(
            " AND {}.tombstone = 0",
            compiled.state.implicit_table_id
        ));
    }

    let mut lines = vec![format!("SELECT {} FROM {}", pieces.select, pieces.from)];
    for part in [&pieces.joins, &where_clause, &pieces.group_by, &pieces.order_by] {
        if !part.is_empty() {
            lines.push(part.clone());
        }
    }
    if let Some(limit) = pieces.limit {
        lines.push(format!("LIMIT {}", limit));
    }
    if let Some(offset) = pieces.offset {
        lines.push(format!("OFFSET {}", offset));
    }
    lines.join("\n")
}
