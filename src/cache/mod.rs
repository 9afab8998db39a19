//! SQLite-backed cache of computed cell values.
//!
//! Values computed by a [`Spreadsheet`](crate::sheet::Spreadsheet) are saved
//! here after every settled batch and loaded back with
//! [`Spreadsheet::load_cache`](crate::sheet::Spreadsheet::load_cache) on the
//! next start, so dynamic cells can show their last value before they are
//! recomputed. The default location is `~/.tally/cells.db`.
//!
//! # Design
//!
//! - One row per qualified cell name, value stored as JSON text
//! - No TTL; entries live until overwritten or cleared
//! - Versioned; a version mismatch clears every entry

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::debug;

use crate::config::{Settings, SettingsError};
use crate::sheet::{unresolve_name, CellSnapshot};

/// Bump when the stored format changes.
const CACHE_VERSION: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to determine cache directory")]
    NoCacheDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache settings error: {0}")]
    Settings(#[from] SettingsError),
}

pub type CacheResult<T> = Result<T, CacheError>;

pub struct CellCache {
    conn: Connection,
}

impl CellCache {
    /// Open or create the cache at `~/.tally/cells.db`.
    pub fn open() -> CacheResult<Self> {
        Self::open_at(Self::default_path()?)
    }

    /// Open or create the cache at `path`, creating parent directories.
    pub fn open_at<P: AsRef<Path>>(path: P) -> CacheResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let cache = Self {
            conn: Connection::open(path)?,
        };
        cache.init()?;
        Ok(cache)
    }

    /// Open the cache the `[cache]` section asks for; `None` when caching
    /// is disabled.
    pub fn from_settings(settings: &Settings) -> CacheResult<Option<Self>> {
        if !settings.cache.enabled {
            return Ok(None);
        }
        let cache = match settings.cache_path()? {
            Some(path) => Self::open_at(path)?,
            None => Self::open()?,
        };
        Ok(Some(cache))
    }

    pub fn open_in_memory() -> CacheResult<Self> {
        let cache = Self {
            conn: Connection::open_in_memory()?,
        };
        cache.init()?;
        Ok(cache)
    }

    pub fn default_path() -> CacheResult<PathBuf> {
        let base = dirs::home_dir().ok_or(CacheError::NoCacheDir)?;
        Ok(base.join(".tally").join("cells.db"))
    }

    fn init(&self) -> CacheResult<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS cells (
                name TEXT PRIMARY KEY,
                sheet TEXT NOT NULL,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            ",
        )?;

        let stored_version: Option<i32> = self
            .conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            })
            .optional()?;

        match stored_version {
            Some(v) if v == CACHE_VERSION => {}
            Some(v) => {
                debug!(stored = v, current = CACHE_VERSION, "cell cache version changed, clearing");
                self.clear_all()?;
                self.set_version()?;
            }
            None => self.set_version()?,
        }
        Ok(())
    }

    fn set_version(&self) -> CacheResult<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
            params![CACHE_VERSION.to_string()],
        )?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> CacheResult<Option<Value>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM cells WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub fn set(&self, name: &str, value: &Value) -> CacheResult<()> {
        let (sheet, _) = unresolve_name(name);
        self.conn.execute(
            "INSERT OR REPLACE INTO cells (name, sheet, value) VALUES (?, ?, ?)",
            params![name, sheet, serde_json::to_string(value)?],
        )?;
        Ok(())
    }

    /// Write a batch of snapshots in one transaction.
    pub fn save_cells(&self, cells: &[CellSnapshot]) -> CacheResult<()> {
        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO cells (name, sheet, value) VALUES (?, ?, ?)",
            )?;
            for cell in cells {
                let (sheet, _) = unresolve_name(&cell.name);
                stmt.execute(params![cell.name, sheet, serde_json::to_string(&cell.value)?])?;
            }
        }
        tx.commit()?;
        debug!(cells = cells.len(), "saved cell values");
        Ok(())
    }

    /// Every saved cell, ordered by name.
    pub fn load_cells(&self) -> CacheResult<Vec<CellSnapshot>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM cells ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(name, json)| {
                Ok(CellSnapshot {
                    name,
                    value: serde_json::from_str(&json)?,
                })
            })
            .collect()
    }

    pub fn delete(&self, name: &str) -> CacheResult<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM cells WHERE name = ?", params![name])?;
        Ok(rows > 0)
    }

    /// Drop every cell saved for `sheet`.
    pub fn delete_sheet(&self, sheet: &str) -> CacheResult<usize> {
        let rows = self
            .conn
            .execute("DELETE FROM cells WHERE sheet = ?", params![sheet])?;
        Ok(rows)
    }

    pub fn clear_all(&self) -> CacheResult<()> {
        self.conn.execute("DELETE FROM cells", [])?;
        Ok(())
    }

    pub fn stats(&self) -> CacheResult<CacheStats> {
        let entry_count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM cells", [], |row| row.get(0))?;

        let total_size: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(value)), 0) FROM cells",
            [],
            |row| row.get(0),
        )?;

        Ok(CacheStats {
            entry_count: entry_count as usize,
            total_size_bytes: total_size as usize,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entry_count: usize,
    /// Total length of the stored JSON, in bytes.
    pub total_size_bytes: usize,
}
