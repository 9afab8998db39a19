//! Per-compile mutable state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::error::{CompileErrorKind, CompileResult, Frame, FrameKind};
use super::types::{param_accepts, ParamRef, ValueType};
use crate::schema::Schema;

/// A resolved join for one dotted path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathInfo {
    /// Logical table the path lands on.
    pub table_name: String,
    /// Alias of the join (`table_name` + counter).
    pub table_id: String,
    /// Foreign-key field on the parent.
    pub join_field: String,
    /// Alias (or root table id) the join hangs off.
    pub join_table: String,
    /// Join the physical table, bypassing any view.
    pub no_mapping: bool,
}

/// Insertion-ordered map of full dotted path → [`PathInfo`].
#[derive(Debug, Clone, Default)]
pub struct PathMap {
    entries: Vec<(String, PathInfo)>,
    index: HashMap<String, usize>,
}

impl PathMap {
    pub fn get(&self, path: &str) -> Option<&PathInfo> {
        self.index.get(path).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.index.contains_key(path)
    }

    pub fn insert(&mut self, path: String, info: PathInfo) {
        if let Some(&i) = self.index.get(&path) {
            self.entries[i].1 = info;
        } else {
            self.index.insert(path.clone(), self.entries.len());
            self.entries.push((path, info));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PathInfo)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// One `?` bind site, in SQL order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamedParam {
    #[serde(skip)]
    pub id: usize,
    pub name: String,
    /// Type the bind value is converted to; `None` binds it unconverted.
    #[serde(rename = "type")]
    pub param_type: Option<ValueType>,
}

/// Mutable state owned by a single `compile_query` call.
#[derive(Debug, Clone)]
pub struct CompilerState {
    pub schema: Arc<Schema>,
    pub implicit_table_name: String,
    pub implicit_table_id: String,
    /// Field `$` refers to inside a `$transform`.
    pub implicit_field: Option<String>,
    pub paths: PathMap,
    /// Every table the query reads, root first.
    pub dependencies: Vec<String>,
    /// Select alias → semantic type.
    pub output_types: BTreeMap<String, ValueType>,
    pub named_parameters: Vec<NamedParam>,
    pub validate_refs: bool,
    /// Order expressions visible to `$sumOver` while compiling the select.
    pub orders: Option<Vec<Value>>,
    param_types: HashMap<String, ValueType>,
    next_alias: usize,
    next_param: usize,
    stack: Vec<FrameKind>,
}

impl CompilerState {
    pub fn new(schema: Arc<Schema>, table_name: &str, table_id: &str, validate_refs: bool) -> Self {
        Self {
            schema,
            implicit_table_name: table_name.into(),
            implicit_table_id: table_id.into(),
            implicit_field: None,
            paths: PathMap::default(),
            dependencies: vec![table_name.into()],
            output_types: BTreeMap::new(),
            named_parameters: Vec::new(),
            validate_refs,
            orders: None,
            param_types: HashMap::new(),
            next_alias: 0,
            next_param: 0,
            stack: Vec::new(),
        }
    }

    /// Allocate a fresh join alias for `table`.
    pub fn next_alias(&mut self, table: &str) -> String {
        self.next_alias += 1;
        format!("{}{}", table, self.next_alias)
    }

    /// Register a new `?` bind site for `name`.
    pub fn push_param(&mut self, name: &str) -> ParamRef {
        self.next_param += 1;
        let param = ParamRef {
            id: self.next_param,
            name: name.into(),
        };
        self.named_parameters.push(NamedParam {
            id: param.id,
            name: param.name.clone(),
            param_type: None,
        });
        param
    }

    /// Record that `param` is used as `ty`, rejecting conflicts with earlier
    /// uses of the same parameter name.
    pub fn infer_param(&mut self, param: &ParamRef, ty: ValueType) -> CompileResult<()> {
        match self.param_types.get(&param.name) {
            Some(&existing) if !param_accepts(existing, ty) => {
                return Err(CompileErrorKind::ParamConflict {
                    name: param.name.clone(),
                    existing,
                    requested: ty,
                }
                .into());
            }
            Some(_) => {}
            None => {
                self.param_types.insert(param.name.clone(), ty);
            }
        }
        for site in self.named_parameters.iter_mut().filter(|p| p.id == param.id) {
            if site.param_type.is_none() {
                site.param_type = Some(ty);
            }
        }
        Ok(())
    }

    /// Position marker for [`CompilerState::repeat_params_from`].
    pub fn param_mark(&self) -> usize {
        self.named_parameters.len()
    }

    /// Bind every site recorded since `mark` a second time, in the same
    /// order, for an expression whose SQL text repeats.
    pub fn repeat_params_from(&mut self, mark: usize) {
        let start = mark.min(self.named_parameters.len());
        let repeated: Vec<NamedParam> = self.named_parameters[start..].to_vec();
        self.named_parameters.extend(repeated);
    }

    /// Move the sites recorded since `from` back to position `at`, for SQL
    /// text that lands earlier in the statement than it was compiled.
    pub fn move_params_to(&mut self, from: usize, at: usize) {
        let len = self.named_parameters.len();
        let from = from.min(len);
        let at = at.min(from);
        self.named_parameters[at..].rotate_right(len - from);
    }

    /// Type inferred for a parameter name so far.
    pub fn param_type(&self, name: &str) -> Option<ValueType> {
        self.param_types.get(name).copied()
    }

    /// Current nesting depth of compiler entry points.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Run `f` as a compiler entry point of kind `kind`.
    ///
    /// The frame is pushed before `f` runs and popped on every exit path.
    /// On failure the frame, rendered from `args`, is appended to the
    /// error's trail.
    pub fn with_frame<T, A, F>(&mut self, kind: FrameKind, args: A, f: F) -> CompileResult<T>
    where
        A: FnOnce() -> Vec<Value>,
        F: FnOnce(&mut Self) -> CompileResult<T>,
    {
        self.stack.push(kind);
        let result = f(self);
        self.stack.pop();
        result.map_err(|mut err| {
            err.trail.push(Frame::new(kind, args()));
            err
        })
    }
}
