//! # quarry-db-backends
//!
//! Database backend implementations for quarry. A backend implements
//! [`DbExecutor`](quarry_db::DbExecutor), the interface every
//! [`QuerySet`](quarry_db::QuerySet) terminal runs against, plus the
//! connection-level [`DatabaseBackend`] trait.
//!
//! Supported backends:
//! - `SQLite` (feature `sqlite`, on by default)

#![allow(clippy::doc_markdown)]
#![allow(clippy::result_large_err)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
// significant_drop_tightening: false positives with async Mutex guards
#![allow(clippy::significant_drop_tightening)]

pub mod base;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use base::{DatabaseBackend, DatabaseConfig};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};
use quarry_db::DatabaseBackendType;

/// Opens the backend described by `config`.
pub fn connect(config: &DatabaseConfig) -> QuarryResult<Arc<dyn DatabaseBackend>> {
    match config.backend {
        #[cfg(feature = "sqlite")]
        DatabaseBackendType::SQLite => Ok(Arc::new(SqliteBackend::from_config(config)?)),
        other => Err(QuarryError::ConfigurationError(format!(
            "no backend compiled in for {other:?}"
        ))),
    }
}
