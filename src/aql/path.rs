//! Dotted-path resolution into LEFT JOINs.
//!
//! `payee.category.name` on `transactions` resolves `transactions.payee`
//! first, then `transactions.payee.category`, each hop becoming one join
//! whose alias is allocated from the compiler state. Resolved paths are
//! memoized, so every field sharing a prefix reuses its join.

use super::error::{CompileErrorKind, CompileResult};
use super::state::{CompilerState, PathInfo};
use super::types::{Typed, ValueType};

/// Split `a.b.c` into (`Some("a.b")`, `"c"`).
pub fn pop_path(name: &str) -> (Option<&str>, &str) {
    match name.rfind('.') {
        Some(i) => (Some(&name[..i]), &name[i + 1..]),
        None => (None, name),
    }
}

fn path_key(state: &CompilerState, path: &str) -> String {
    format!("{}.{}", state.implicit_table_name, path)
}

/// Resolve every prefix of `path`, parent first, and return the join the
/// full path lands on.
pub fn resolve_path(state: &mut CompilerState, path: &str) -> CompileResult<PathInfo> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(CompileErrorKind::InvalidPath(path.into()).into());
    }

    let mut parent_key: Option<String> = None;
    for i in 0..segments.len() {
        let key = path_key(state, &segments[..=i].join("."));
        if !state.paths.contains(&key) {
            let info = make_path(state, parent_key.as_deref(), segments[i])?;
            state.paths.insert(key.clone(), info);
        }
        parent_key = Some(key);
    }

    let key = path_key(state, path);
    state
        .paths
        .get(&key)
        .cloned()
        .ok_or_else(|| CompileErrorKind::MissingParentPath(key).into())
}

fn make_path(
    state: &mut CompilerState,
    parent_key: Option<&str>,
    field: &str,
) -> CompileResult<PathInfo> {
    let (parent_table, parent_id) = match parent_key {
        None => (
            state.implicit_table_name.clone(),
            state.implicit_table_id.clone(),
        ),
        Some(key) => {
            let parent = state
                .paths
                .get(key)
                .ok_or_else(|| CompileErrorKind::MissingParentPath(key.into()))?;
            (parent.table_name.clone(), parent.table_id.clone())
        }
    };

    let table = state
        .schema
        .table(&parent_table)
        .ok_or_else(|| CompileErrorKind::PathTableMissing(parent_table.clone()))?;
    let desc = table.field(field).ok_or_else(|| CompileErrorKind::UnknownField {
        table: parent_table.clone(),
        field: field.into(),
    })?;
    let target = desc
        .references
        .clone()
        .ok_or_else(|| CompileErrorKind::NotJoinable {
            table: parent_table.clone(),
            field: field.into(),
        })?;

    let table_id = state.next_alias(&target);
    Ok(PathInfo {
        table_name: target,
        table_id,
        join_field: field.into(),
        join_table: parent_id,
        no_mapping: false,
    })
}

/// Join the row a foreign key points at, bypassing table views, so the
/// selected id is only non-null when the referenced row exists.
pub fn resolve_ref_path(
    state: &mut CompilerState,
    prefix: Option<&str>,
    field: &str,
    target: &str,
) -> CompileResult<PathInfo> {
    let full = match prefix {
        Some(p) => format!("{}.{}", p, field),
        None => field.to_string(),
    };
    let key = path_key(state, &full);
    if let Some(info) = state.paths.get(&key) {
        return Ok(info.clone());
    }

    let join_table = match prefix {
        Some(p) => resolve_path(state, p)?.table_id,
        None => state.implicit_table_id.clone(),
    };
    let info = PathInfo {
        table_name: target.into(),
        table_id: state.next_alias(target),
        join_field: field.into(),
        join_table,
        no_mapping: true,
    };
    state.paths.insert(key, info.clone());
    Ok(info)
}

/// Compile a field reference (without its leading `$`). An empty name is
/// the implicit field set by `$transform`.
pub fn compile_field(state: &mut CompilerState, name: &str) -> CompileResult<Typed> {
    let name = if name.is_empty() {
        state
            .implicit_field
            .clone()
            .ok_or_else(|| CompileErrorKind::InvalidFieldReference("$".into()))?
    } else {
        name.to_string()
    };

    let (prefix, field) = pop_path(&name);
    if field.is_empty() {
        return Err(CompileErrorKind::InvalidPath(name.clone()).into());
    }

    let (table_name, table_id) = match prefix {
        Some(p) => {
            let info = resolve_path(state, p)?;
            (info.table_name, info.table_id)
        }
        None => (
            state.implicit_table_name.clone(),
            state.implicit_table_id.clone(),
        ),
    };

    let table = state
        .schema
        .table(&table_name)
        .ok_or_else(|| CompileErrorKind::UnknownTable(table_name.clone()))?;
    let desc = table
        .field(field)
        .ok_or_else(|| CompileErrorKind::UnknownField {
            table: table_name.clone(),
            field: field.into(),
        })?
        .clone();

    if state.validate_refs && field != "id" {
        if let Some(target) = &desc.references {
            let info = resolve_ref_path(state, prefix, field, target)?;
            return Ok(Typed::fragment(
                format!("{}.id", info.table_id),
                ValueType::Id,
            ));
        }
    }

    Ok(Typed::fragment(
        format!("{}.{}", table_id, field),
        desc.field_type.into(),
    ))
}
