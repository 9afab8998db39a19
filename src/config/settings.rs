//! TOML-based configuration for tally.
//!
//! Supports a config file (tally.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [database]
//! path = "${HOME}/budgets/my-budget.sqlite"
//!
//! [cache]
//! enabled = true
//! path = "./cells.db"
//!
//! [tables.transactions]
//! view = "v_transactions"
//! join_view = "v_transactions_internal"
//! dead_view = "v_transactions_all"
//! filters = [{ is_parent = false }]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::schema::{SchemaConfig, ViewContext};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid filter for table {table}: {message}")]
    InvalidFilter { table: String, message: String },
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    /// Per-table compile hooks, keyed by logical table name.
    pub tables: HashMap<String, TableSettings>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// SQLite file queries run against (supports ${ENV_VAR} expansion).
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Persist computed cell values between runs.
    pub enabled: bool,
    /// Cache file; defaults to `~/.tally/cells.db`.
    pub path: Option<String>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

/// How one logical table compiles.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TableSettings {
    /// View read in place of the table.
    pub view: Option<String>,
    /// View used when the table is joined; falls back to `view`.
    pub join_view: Option<String>,
    /// View used for `with_dead` queries; falls back to `view`.
    pub dead_view: Option<String>,
    /// Conditions ANDed into every query on the table.
    pub filters: Vec<toml::Value>,
}

impl TableSettings {
    fn view_for(&self, ctx: &ViewContext<'_>) -> Option<&str> {
        let specific = if ctx.is_join {
            self.join_view.as_deref()
        } else if ctx.with_dead {
            self.dead_view.as_deref()
        } else {
            None
        };
        specific.or(self.view.as_deref())
    }
}

impl Settings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `TALLY_CONFIG`
    /// 2. `./tally.toml`
    /// 3. `~/.config/tally/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var("TALLY_CONFIG") {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("tally.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("tally").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    /// Table filters must be TOML tables (one condition object each).
    fn validate(&self) -> Result<(), SettingsError> {
        for (table, t) in &self.tables {
            if let Some(bad) = t.filters.iter().find(|f| !f.is_table()) {
                return Err(SettingsError::InvalidFilter {
                    table: table.clone(),
                    message: format!("expected a table, got {}", bad.type_str()),
                });
            }
        }
        Ok(())
    }

    /// Database path with environment variables expanded.
    pub fn database_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.database
            .path
            .as_deref()
            .map(|p| expand_env_vars(p).map(PathBuf::from))
            .transpose()
    }

    /// Cache path with environment variables expanded; `None` if caching is
    /// off or the default location should be used.
    pub fn cache_path(&self) -> Result<Option<PathBuf>, SettingsError> {
        if !self.cache.enabled {
            return Ok(None);
        }
        self.cache
            .path
            .as_deref()
            .map(|p| expand_env_vars(p).map(PathBuf::from))
            .transpose()
    }
}

impl SchemaConfig for Settings {
    fn table_view(&self, table: &str, ctx: &ViewContext<'_>) -> Option<String> {
        self.tables.get(table)?.view_for(ctx).map(str::to_string)
    }

    fn table_filters(&self, table: &str) -> Vec<Value> {
        let Some(t) = self.tables.get(table) else {
            return Vec::new();
        };
        t.filters
            .iter()
            .filter_map(|f| serde_json::to_value(f).ok())
            .collect()
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if !(ch.is_alphanumeric() || ch == '_') {
                    break;
                }
                var_name.push(ch);
                chars.next();
            }
            if var_name.is_empty() {
                // lone $
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
