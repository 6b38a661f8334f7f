//! SQLite database backend using `rusqlite`.
//!
//! This module provides the [`SqliteBackend`] which implements
//! [`DbExecutor`] and [`DatabaseBackend`] using `rusqlite` wrapped in
//! `tokio::task::spawn_blocking` for async compatibility.
//!
//! Features:
//! - WAL mode for file databases, foreign keys enforced
//! - In-memory database support via `:memory:` path (great for testing)
//! - `INSERT ... RETURNING` reported as [`Returning::Columns`]
//! - A call whose future is dropped while its statement runs (cancellation,
//!   timeout) interrupts that statement; one dropped before its statement
//!   starts never runs it
//! - [`DbExecutor::reserve`] hands out the connection exclusively, which
//!   transactions rely on

use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use quarry_core::{QuarryError, QuarryResult};
use quarry_db::{DatabaseBackendType, DbExecutor, Returning, Row, Value};
use rusqlite::{Connection, ErrorCode, InterruptHandle};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::base::{DatabaseBackend, DatabaseConfig};

/// A SQLite database backend.
///
/// Uses `rusqlite` with a `Mutex`-based concurrency model: clones share one
/// connection and statements run one at a time. A reserved backend holds
/// the connection until it is dropped.
#[derive(Clone)]
pub struct SqliteBackend {
    path: PathBuf,
    handle: Handle,
    interrupt: Arc<InterruptHandle>,
    returning: Returning,
}

/// How a backend reaches its connection.
#[derive(Clone)]
enum Handle {
    /// Locked per statement.
    Shared(Arc<Mutex<Connection>>),
    /// Held for the lifetime of a reservation.
    Reserved(Arc<StdMutex<Reservation>>),
}

/// Exclusive hold on the connection. Rolls back a transaction left open
/// when released.
struct Reservation {
    conn: OwnedMutexGuard<Connection>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.conn.is_autocommit() {
            return;
        }
        tracing::warn!("rolling back transaction left open on a released SQLite connection");
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %e, "rollback of released SQLite connection failed");
        }
    }
}

/// Progress of one call's statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Running,
    Done,
    Abandoned,
}

/// Held by the awaiting caller. Dropping it before the call completes
/// interrupts the call's statement if it is running and keeps it from
/// starting otherwise.
struct CallGuard {
    phase: Arc<StdMutex<Phase>>,
    interrupt: Arc<InterruptHandle>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        match *phase {
            Phase::Pending => *phase = Phase::Abandoned,
            Phase::Running => {
                tracing::debug!("interrupting abandoned SQLite statement");
                self.interrupt.interrupt();
            }
            Phase::Done | Phase::Abandoned => {}
        }
    }
}

/// Runs `work` unless its caller went away first. The connection is locked
/// by the caller for the whole call, so an interrupt issued while the phase
/// is `Running` can only hit this call's statement.
fn run_call<T, F>(phase: &StdMutex<Phase>, conn: &Connection, work: F) -> QuarryResult<T>
where
    F: FnOnce(&Connection) -> QuarryResult<T>,
{
    {
        let mut phase = phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase == Phase::Abandoned {
            return Err(QuarryError::Cancelled("statement abandoned before it started".into()));
        }
        *phase = Phase::Running;
    }
    let out = work(conn);
    *phase.lock().unwrap_or_else(PoisonError::into_inner) = Phase::Done;
    out
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .field("returning", &self.returning)
            .finish_non_exhaustive()
    }
}

fn map_err(e: rusqlite::Error) -> QuarryError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => QuarryError::IntegrityError(e.to_string()),
        Some(ErrorCode::OperationInterrupted) => QuarryError::Cancelled(e.to_string()),
        Some(ErrorCode::CannotOpen | ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            QuarryError::OperationalError(e.to_string())
        }
        _ => QuarryError::DatabaseError(e.to_string()),
    }
}

fn join_err(e: tokio::task::JoinError) -> QuarryError {
    QuarryError::DatabaseError(format!("task join error: {e}"))
}

impl SqliteBackend {
    /// Opens a new SQLite database at the given path.
    ///
    /// If the path is `:memory:`, an in-memory database is created.
    /// WAL journal mode is enabled for file-based databases.
    pub fn open(path: impl Into<PathBuf>) -> QuarryResult<Self> {
        let config = DatabaseConfig::sqlite_file(path.into().to_string_lossy());
        Self::from_config(&config)
    }

    /// Opens an in-memory database (convenience constructor).
    pub fn memory() -> QuarryResult<Self> {
        Self::open(":memory:")
    }

    /// Opens the database named by `config`.
    ///
    /// The `journal_mode` option overrides the journal mode; `returning`
    /// (`columns`, `last_insert_id` or `nothing`) overrides how written rows
    /// are reported.
    pub fn from_config(config: &DatabaseConfig) -> QuarryResult<Self> {
        let path = PathBuf::from(&config.name);
        let memory = config.name == ":memory:";
        let conn = if memory {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| QuarryError::OperationalError(format!("SQLite open failed: {e}")))?;

        let journal = config
            .option("journal_mode")
            .unwrap_or(if memory { "MEMORY" } else { "WAL" });
        conn.execute_batch(&format!("PRAGMA journal_mode={journal}; PRAGMA foreign_keys=ON;"))
            .map_err(|e| QuarryError::OperationalError(format!("failed to set pragmas: {e}")))?;

        let returning = match config.option("returning") {
            None | Some("columns") => Returning::Columns,
            Some("last_insert_id") => Returning::LastInsertId,
            Some("nothing") => Returning::Nothing,
            Some(other) => {
                return Err(QuarryError::ConfigurationError(format!(
                    "unknown returning mode '{other}'"
                )))
            }
        };

        tracing::debug!(path = %path.display(), journal, "opened SQLite database");
        Ok(Self {
            path,
            interrupt: Arc::new(conn.get_interrupt_handle()),
            handle: Handle::Shared(Arc::new(Mutex::new(conn))),
            returning,
        })
    }

    /// Reports written rows as `returning` instead of reading them back
    /// with `RETURNING`.
    #[must_use]
    pub fn with_returning(mut self, returning: Returning) -> Self {
        self.returning = returning;
        self
    }

    /// Returns the database file path.
    pub const fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Binds `Value`s to a `rusqlite` statement.
    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> QuarryResult<()> {
        for (i, param) in params.iter().enumerate() {
            let idx = i + 1;
            match param {
                Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
                Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
                Value::Int(v) => stmt.raw_bind_parameter(idx, v),
                Value::Float(v) => stmt.raw_bind_parameter(idx, v),
                Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
                Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
                Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string()),
                Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.to_string()),
                Value::DateTimeTz(dt) => stmt.raw_bind_parameter(idx, dt.to_rfc3339()),
                Value::Time(t) => stmt.raw_bind_parameter(idx, t.to_string()),
                Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string()),
                Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string()),
                Value::List(vals) => {
                    let json = serde_json::to_string(
                        &vals.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    )
                    .map_err(|e| QuarryError::SerializationError(e.to_string()))?;
                    stmt.raw_bind_parameter(idx, json)
                }
            }
            .map_err(|e| QuarryError::DatabaseError(format!("bind error: {e}")))?;
        }
        Ok(())
    }

    /// Converts a `rusqlite::Row` to a quarry [`Row`].
    fn convert_row(sqlite_row: &rusqlite::Row<'_>, column_names: &[String]) -> QuarryResult<Row> {
        let values = (0..column_names.len())
            .map(|i| {
                let value = match sqlite_row.get_ref(i).map_err(map_err)? {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(v) => Value::Int(v),
                    rusqlite::types::ValueRef::Real(v) => Value::Float(v),
                    rusqlite::types::ValueRef::Text(b) => {
                        Value::String(String::from_utf8_lossy(b).into_owned())
                    }
                    rusqlite::types::ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
                };
                Ok(value)
            })
            .collect::<QuarryResult<Vec<_>>>()?;
        Ok(Row::new(column_names.to_vec(), values))
    }

    /// Returns `true` if this backend holds its connection exclusively.
    pub const fn is_reserved(&self) -> bool {
        matches!(self.handle, Handle::Reserved(_))
    }

    /// Runs `work` on the connection inside `spawn_blocking`.
    ///
    /// The shared connection is locked before the blocking task is spawned,
    /// so a caller dropped while waiting for it leaves nothing behind.
    async fn with_conn<T, F>(&self, work: F) -> QuarryResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> QuarryResult<T> + Send + 'static,
    {
        let phase = Arc::new(StdMutex::new(Phase::Pending));
        let task = match &self.handle {
            Handle::Shared(conn) => {
                let conn = Arc::clone(conn).lock_owned().await;
                let phase = Arc::clone(&phase);
                tokio::task::spawn_blocking(move || run_call(&phase, &conn, work))
            }
            Handle::Reserved(reservation) => {
                let reservation = Arc::clone(reservation);
                let phase = Arc::clone(&phase);
                tokio::task::spawn_blocking(move || {
                    let reservation = reservation.lock().unwrap_or_else(PoisonError::into_inner);
                    run_call(&phase, &reservation.conn, work)
                })
            }
        };
        let _guard = CallGuard {
            phase,
            interrupt: Arc::clone(&self.interrupt),
        };
        task.await.map_err(join_err)?
    }
}

#[async_trait::async_trait]
impl DbExecutor for SqliteBackend {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn returning(&self) -> Returning {
        self.returning
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> QuarryResult<u64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(map_err)?;
            Self::bind_params(&mut stmt, &params)?;
            let count = stmt.raw_execute().map_err(map_err)?;
            Ok(count as u64)
        })
        .await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(map_err)?;
            let column_names: Vec<String> =
                stmt.column_names().into_iter().map(String::from).collect();
            Self::bind_params(&mut stmt, &params)?;

            let mut raw_rows = stmt.raw_query();
            let mut rows = Vec::new();
            while let Some(row) = raw_rows.next().map_err(map_err)? {
                rows.push(Self::convert_row(row, &column_names)?);
            }
            Ok(rows)
        })
        .await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> QuarryResult<Value> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql).map_err(map_err)?;
            Self::bind_params(&mut stmt, &params)?;
            stmt.raw_execute().map_err(map_err)?;
            Ok(Value::Int(conn.last_insert_rowid()))
        })
        .await
    }

    async fn reserve<'a>(&'a self) -> QuarryResult<Box<dyn DbExecutor + 'a>> {
        let handle = match &self.handle {
            Handle::Shared(conn) => {
                let conn = Arc::clone(conn).lock_owned().await;
                Handle::Reserved(Arc::new(StdMutex::new(Reservation { conn })))
            }
            Handle::Reserved(_) => self.handle.clone(),
        };
        Ok(Box::new(Self {
            path: self.path.clone(),
            handle,
            interrupt: Arc::clone(&self.interrupt),
            returning: self.returning,
        }))
    }
}

#[async_trait::async_trait]
impl DatabaseBackend for SqliteBackend {
    fn vendor(&self) -> &str {
        "sqlite"
    }

    async fn execute_batch(&self, sql: &str) -> QuarryResult<()> {
        let sql = sql.to_string();
        self.with_conn(move |conn| conn.execute_batch(&sql).map_err(map_err))
            .await
    }
}
