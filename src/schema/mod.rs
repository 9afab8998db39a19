//! Static schema consumed by the AQL compiler.
//!
//! A schema maps table names to field descriptors:
//!
//! ```json
//! {
//!   "transactions": {
//!     "id": { "type": "id" },
//!     "amount": { "type": "integer" },
//!     "payee": { "type": "id", "ref": "payees" },
//!     "tombstone": { "type": "boolean" }
//!   },
//!   "payees": {
//!     "id": { "type": "id" },
//!     "name": { "type": "string" }
//!   }
//! }
//! ```
//!
//! A field with `ref` is a foreign key into the named table. A table that
//! declares a `tombstone` field is soft-deletable and gets a
//! `tombstone = 0` guard in compiled queries.

mod hooks;

pub use hooks::{DefaultSchemaConfig, SchemaConfig, ViewContext};

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while loading a schema.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Failed to read schema file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse schema: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Field \"{field}\" on table \"{table}\" references unknown table \"{target}\"")]
    UnknownReference {
        table: String,
        field: String,
        target: String,
    },
}

/// Storage type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Id,
    Boolean,
    String,
    Integer,
    Float,
    Date,
    Json,
    #[serde(rename = "json/fallback")]
    JsonFallback,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Id => "id",
            FieldType::Boolean => "boolean",
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Date => "date",
            FieldType::Json => "json",
            FieldType::JsonFallback => "json/fallback",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Descriptor of a single field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDesc {
    #[serde(rename = "type")]
    pub field_type: FieldType,

    /// Target table when this field is a foreign key.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub references: Option<String>,

    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldDesc {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            references: None,
            required: false,
            default: None,
        }
    }

    pub fn id() -> Self {
        Self::new(FieldType::Id)
    }

    /// A foreign key into `table`.
    pub fn reference(table: &str) -> Self {
        Self::new(FieldType::Id).with_ref(table)
    }

    pub fn with_ref(mut self, table: &str) -> Self {
        self.references = Some(table.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn is_ref(&self) -> bool {
        self.references.is_some()
    }
}

/// Fields of one table, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableSchema {
    fields: BTreeMap<String, FieldDesc>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: &str, desc: FieldDesc) -> Self {
        self.fields.insert(name.into(), desc);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDesc> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldDesc)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn has_tombstone(&self) -> bool {
        self.fields.contains_key("tombstone")
    }
}

/// The full schema: table name → fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    tables: BTreeMap<String, TableSchema>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, table: TableSchema) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    /// Parse a schema from JSON and check that every `ref` names a table.
    pub fn from_json(json: &str) -> Result<Self, SchemaError> {
        let schema: Schema = serde_json::from_str(json)?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        for (table_name, table) in &self.tables {
            for (field_name, desc) in table.fields() {
                if let Some(target) = &desc.references {
                    if !self.tables.contains_key(target) {
                        return Err(SchemaError::UnknownReference {
                            table: table_name.clone(),
                            field: field_name.to_string(),
                            target: target.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    pub fn field(&self, table: &str, field: &str) -> Option<&FieldDesc> {
        self.tables.get(table).and_then(|t| t.field(field))
    }

    pub fn has_tombstone(&self, table: &str) -> bool {
        self.tables.get(table).is_some_and(TableSchema::has_tombstone)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }
}
