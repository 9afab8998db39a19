//! Running compiled queries against SQLite.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde_json::{Map, Number, Value};
use tracing::debug;

use crate::aql::{convert_input, convert_output, CompiledQuery, ConvertError};
use crate::sheet::{CellResult, Computed, QueryExecutor};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Missing value for parameter :{0}")]
    MissingParam(String),

    #[error("Invalid value for parameter: {0}")]
    Convert(#[from] ConvertError),
}

pub type ExecResult<T> = Result<T, ExecError>;

fn to_sql(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Bind values for every `?` of `compiled`, in statement order.
fn bind_values(compiled: &CompiledQuery, params: &Map<String, Value>) -> ExecResult<Vec<SqlValue>> {
    compiled
        .named_parameters()
        .iter()
        .map(|p| {
            let value = params
                .get(&p.name)
                .ok_or_else(|| ExecError::MissingParam(p.name.clone()))?;
            let value = match p.param_type {
                Some(ty) => convert_input(value, ty)?,
                None => value.clone(),
            };
            Ok(to_sql(value))
        })
        .collect()
}

/// Execute `compiled` and return its rows as JSON objects keyed by select
/// alias, or the single `result` value for calculations.
pub fn run_compiled_query(
    conn: &Connection,
    compiled: &CompiledQuery,
    params: &Map<String, Value>,
) -> ExecResult<Value> {
    let sql = compiled.sql();
    let binds = bind_values(compiled, params)?;
    debug!(sql = %sql, params = binds.len(), "running query");

    let mut stmt = conn.prepare(&sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let output_types = compiled.output_types();

    let mut rows = stmt.query(rusqlite::params_from_iter(binds))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut obj = Map::new();
        for (i, name) in columns.iter().enumerate() {
            let raw = from_sql(row.get_ref(i)?);
            let value = match output_types.get(name) {
                Some(ty) => convert_output(raw, *ty),
                None => raw,
            };
            obj.insert(name.clone(), value);
        }
        out.push(Value::Object(obj));
    }

    if compiled.is_calculation() {
        return Ok(out
            .into_iter()
            .next()
            .and_then(|mut row| row.get_mut("result").map(Value::take))
            .unwrap_or(Value::Null));
    }
    Ok(Value::Array(out))
}

/// Runs query cells synchronously on one connection.
pub struct SqliteExecutor {
    conn: Connection,
    params: Map<String, Value>,
}

impl SqliteExecutor {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            params: Map::new(),
        }
    }

    /// Values bound to named parameters of every query.
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl QueryExecutor for SqliteExecutor {
    fn execute(&self, compiled: &CompiledQuery) -> CellResult<Computed> {
        let value = run_compiled_query(&self.conn, compiled, &self.params)?;
        Ok(Computed::Immediate(value))
    }
}
