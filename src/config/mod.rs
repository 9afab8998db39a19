//! Configuration: the database, the cell cache and per-table compile hooks.

mod settings;

pub use settings::{
    expand_env_vars, CacheSettings, DatabaseSettings, Settings, SettingsError, TableSettings,
};
