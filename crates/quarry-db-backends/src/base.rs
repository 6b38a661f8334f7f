//! Base database backend trait and connection configuration.
//!
//! [`DatabaseBackend`] extends [`DbExecutor`] with the connection-level
//! operations a query never needs: the vendor name and running a batch of
//! statements, typically a schema. [`DatabaseConfig`] holds what is needed
//! to open a backend and can be derived from [`Settings`].

use std::collections::HashMap;

use quarry_core::settings::Settings;
use quarry_core::{QuarryError, QuarryResult};
use quarry_db::{DatabaseBackendType, DbExecutor};

/// The core trait for database backends.
///
/// All methods are async because database operations are inherently I/O-bound.
/// Backends over synchronous drivers (like `rusqlite`) wrap their work in
/// `spawn_blocking` to keep the async interface.
#[async_trait::async_trait]
pub trait DatabaseBackend: DbExecutor {
    /// Returns the vendor name (e.g. "sqlite").
    fn vendor(&self) -> &str;

    /// Runs several `;`-separated statements without parameters.
    async fn execute_batch(&self, sql: &str) -> QuarryResult<()>;
}

/// Configuration for connecting to a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// The backend type.
    pub backend: DatabaseBackendType,
    /// The database name or file path.
    pub name: String,
    /// Additional connection options.
    pub options: HashMap<String, String>,
}

impl DatabaseConfig {
    /// Creates a configuration for an in-memory SQLite database.
    pub fn sqlite_memory() -> Self {
        Self::sqlite_file(":memory:")
    }

    /// Creates a configuration for a SQLite file database.
    pub fn sqlite_file(path: impl Into<String>) -> Self {
        Self {
            backend: DatabaseBackendType::SQLite,
            name: path.into(),
            options: HashMap::new(),
        }
    }

    /// Builds the configuration from the `database` section of `settings`.
    pub fn from_settings(settings: &Settings) -> QuarryResult<Self> {
        let db = &settings.database;
        let backend = match db.engine.to_lowercase().as_str() {
            "sqlite" | "sqlite3" => DatabaseBackendType::SQLite,
            "postgres" | "postgresql" => DatabaseBackendType::PostgreSQL,
            "mysql" => DatabaseBackendType::MySQL,
            other => {
                return Err(QuarryError::ConfigurationError(format!(
                    "unknown database engine '{other}'"
                )))
            }
        };
        Ok(Self {
            backend,
            name: db.name.clone(),
            options: db.options.clone(),
        })
    }

    /// Returns the option `key`, if set.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}
