//! Settings for quarry.
//!
//! [`Settings`] holds the configuration consumed by the engine: log output,
//! the database to open, and query defaults such as the timeout applied to
//! every statement. Every field has a default, so a configuration file only
//! needs to name what it changes.
//!
//! ## Loading Order
//!
//! 1. Start with default settings.
//! 2. Load from a TOML file or string (overriding defaults).
//! 3. Apply environment variable overrides (highest priority).
//!
//! | Env Var | Setting |
//! |---|---|
//! | `QUARRY_DEBUG` | `debug` |
//! | `QUARRY_LOG_LEVEL` | `log_level` |
//! | `QUARRY_DATABASE_NAME` | `database.name` |
//! | `QUARRY_QUERY_TIMEOUT_MS` | `query.timeout_ms` |

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, QuarryResult};

/// Database connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// The database engine (e.g. `sqlite`).
    pub engine: String,
    /// The database name (or file path for `SQLite`).
    pub name: String,
    /// Additional engine-specific options.
    pub options: HashMap<String, String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: "sqlite".to_string(),
            name: ":memory:".to_string(),
            options: HashMap::new(),
        }
    }
}

/// Defaults applied to every query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Timeout for a single statement, in milliseconds. `None` disables it.
    pub timeout_ms: Option<u64>,
    /// Whether compiled SQL is logged at `debug` level.
    pub log_sql: bool,
}

impl QuerySettings {
    /// Returns the configured timeout as a [`Duration`].
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// The complete set of quarry settings.
///
/// # Examples
///
/// ```
/// use quarry_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert!(!settings.debug);
/// assert_eq!(settings.log_level, "info");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether debug mode is enabled (pretty log output).
    pub debug: bool,
    /// The log filter directive (e.g. "info", "quarry_db=debug").
    pub log_level: String,
    /// The database to connect to.
    pub database: DatabaseSettings,
    /// Query defaults.
    pub query: QuerySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "info".to_string(),
            database: DatabaseSettings::default(),
            query: QuerySettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from a TOML string.
    ///
    /// Fields not present in the TOML keep their default values.
    pub fn from_toml_str(toml_str: &str) -> QuarryResult<Self> {
        toml::from_str(toml_str)
            .map_err(|e| QuarryError::ConfigurationError(format!("failed to parse TOML: {e}")))
    }

    /// Loads settings from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> QuarryResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            QuarryError::ConfigurationError(format!(
                "failed to read settings file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Applies `QUARRY_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) -> QuarryResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup function.
    ///
    /// [`Settings::apply_env_overrides`] passes the process environment;
    /// tests pass a map.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> QuarryResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(debug) = lookup("QUARRY_DEBUG") {
            self.debug = matches!(debug.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(level) = lookup("QUARRY_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(name) = lookup("QUARRY_DATABASE_NAME") {
            self.database.name = name;
        }
        if let Some(timeout) = lookup("QUARRY_QUERY_TIMEOUT_MS") {
            let ms = timeout.parse::<u64>().map_err(|e| {
                QuarryError::ConfigurationError(format!(
                    "QUARRY_QUERY_TIMEOUT_MS must be an integer: {e}"
                ))
            })?;
            self.query.timeout_ms = Some(ms);
        }
        Ok(())
    }
}
