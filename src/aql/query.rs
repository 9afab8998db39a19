//! Immutable query descriptions with a fluent builder.
//!
//! ```ignore
//! let query = q("transactions")
//!     .filter(json!({"amount": {"$gt": 0}}))
//!     .select(json!(["date", "payee.name"]))
//!     .order_by(json!({"date": "desc"}));
//! ```
//!
//! Every builder method returns a new [`Query`]; the parts it did not touch
//! are shared with the parent query.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// =============================================================================
// Query State
// =============================================================================

fn default_validate_refs() -> bool {
    true
}

/// The serializable description behind a [`Query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryState {
    pub table: String,
    #[serde(default)]
    pub filter_expressions: Arc<Vec<Value>>,
    #[serde(default)]
    pub select_expressions: Arc<Vec<Value>>,
    #[serde(default)]
    pub group_expressions: Arc<Vec<Value>>,
    #[serde(default)]
    pub order_expressions: Arc<Vec<Value>>,
    #[serde(default)]
    pub calculation: bool,
    #[serde(default)]
    pub raw_mode: bool,
    #[serde(default)]
    pub with_dead: bool,
    #[serde(default = "default_validate_refs")]
    pub validate_refs: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_options: Option<Value>,
}

impl QueryState {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.into(),
            filter_expressions: Arc::default(),
            select_expressions: Arc::default(),
            group_expressions: Arc::default(),
            order_expressions: Arc::default(),
            calculation: false,
            raw_mode: false,
            with_dead: false,
            validate_refs: true,
            limit: None,
            offset: None,
            table_options: None,
        }
    }
}

// =============================================================================
// Query
// =============================================================================

/// An immutable query description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
#[must_use = "builders have no effect until used"]
pub struct Query {
    state: Arc<QueryState>,
}

/// Start a query against `table`.
pub fn q(table: &str) -> Query {
    Query::new(table)
}

fn as_list(exprs: Value) -> Vec<Value> {
    match exprs {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn appended(list: &Arc<Vec<Value>>, exprs: Value) -> Arc<Vec<Value>> {
    let mut next = list.as_ref().clone();
    next.extend(as_list(exprs));
    Arc::new(next)
}

impl Query {
    pub fn new(table: &str) -> Self {
        Self::from_state(QueryState::new(table))
    }

    pub fn from_state(state: QueryState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    fn derive(&self, f: impl FnOnce(&mut QueryState)) -> Self {
        let mut state = self.state.as_ref().clone();
        f(&mut state);
        Self::from_state(state)
    }

    pub fn state(&self) -> &QueryState {
        &self.state
    }

    pub fn table(&self) -> &str {
        &self.state.table
    }

    /// The description as plain JSON.
    pub fn serialize(&self) -> Value {
        serde_json::to_value(self.state.as_ref()).unwrap_or(Value::Null)
    }

    /// Same description object, not merely an equal one.
    pub fn ptr_eq(&self, other: &Query) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Add a filter condition; conditions are ANDed.
    pub fn filter(&self, expr: Value) -> Self {
        self.derive(|s| {
            let mut next = s.filter_expressions.as_ref().clone();
            next.push(expr);
            s.filter_expressions = Arc::new(next);
        })
    }

    /// Remove filters testing any of `keys`.
    pub fn unfilter(&self, keys: &[&str]) -> Self {
        self.derive(|s| {
            let kept: Vec<Value> = s
                .filter_expressions
                .iter()
                .filter(|f| match f.as_object() {
                    Some(obj) => !obj.keys().any(|k| keys.contains(&k.as_str())),
                    None => true,
                })
                .cloned()
                .collect();
            s.filter_expressions = Arc::new(kept);
        })
    }

    /// Replace the select list. A JSON array selects each element.
    pub fn select(&self, exprs: impl Into<Value>) -> Self {
        let exprs = as_list(exprs.into());
        self.derive(|s| {
            s.select_expressions = Arc::new(exprs);
            s.calculation = false;
        })
    }

    /// Select a single expression whose value is the query result.
    pub fn calculate(&self, expr: Value) -> Self {
        let mut select = Map::new();
        select.insert("result".into(), expr);
        self.derive(|s| {
            s.select_expressions = Arc::new(vec![Value::Object(select)]);
            s.calculation = true;
        })
    }

    pub fn group_by(&self, exprs: impl Into<Value>) -> Self {
        let exprs = exprs.into();
        self.derive(|s| s.group_expressions = appended(&s.group_expressions, exprs))
    }

    pub fn order_by(&self, exprs: impl Into<Value>) -> Self {
        let exprs = exprs.into();
        self.derive(|s| s.order_expressions = appended(&s.order_expressions, exprs))
    }

    pub fn limit(&self, n: u64) -> Self {
        self.derive(|s| s.limit = Some(n))
    }

    pub fn offset(&self, n: u64) -> Self {
        self.derive(|s| s.offset = Some(n))
    }

    /// Skip table filters supplied by the schema configuration.
    pub fn raw(&self) -> Self {
        self.derive(|s| s.raw_mode = true)
    }

    /// Include soft-deleted rows.
    pub fn with_dead(&self) -> Self {
        self.derive(|s| s.with_dead = true)
    }

    /// Read foreign keys as stored instead of joining the referenced row.
    pub fn without_validated_refs(&self) -> Self {
        self.derive(|s| s.validate_refs = false)
    }

    /// Attach options forwarded to the table view hook.
    pub fn options(&self, opts: Value) -> Self {
        self.derive(|s| s.table_options = Some(opts))
    }
}

impl From<QueryState> for Query {
    fn from(state: QueryState) -> Self {
        Query::from_state(state)
    }
}
