//! The database executor trait.
//!
//! [`DbExecutor`] is the minimal async interface the query layer needs from a
//! database: run a statement, run a query, insert a row and report its key.
//! Backends in `quarry-db-backends` implement it; every terminal operation of
//! a [`QuerySet`](crate::query::QuerySet) takes `&dyn DbExecutor` as its
//! last argument.

use quarry_core::{QuarryError, QuarryResult};

use crate::query::compiler::DatabaseBackendType;
use crate::value::{Row, Value};

/// How a backend reports the rows an INSERT or UPDATE wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Returning {
    /// `RETURNING` clauses are supported; written rows are read back whole.
    Columns,
    /// Only the key of the last inserted row can be obtained.
    LastInsertId,
    /// Nothing is reported back.
    Nothing,
}

/// Minimal async database executor.
///
/// The trait lives in the query crate so that execution can be defined
/// without depending on any concrete backend.
#[async_trait::async_trait]
pub trait DbExecutor: Send + Sync {
    /// Returns the backend type used for SQL compilation.
    fn backend_type(&self) -> DatabaseBackendType;

    /// Reports how written rows can be read back.
    fn returning(&self) -> Returning {
        Returning::LastInsertId
    }

    /// Runs a statement that does not return rows.
    /// Returns the number of rows affected.
    async fn execute_sql(&self, sql: &str, params: &[Value]) -> QuarryResult<u64>;

    /// Runs a query and returns all result rows.
    async fn query(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>>;

    /// Runs a query that must return exactly one row.
    async fn query_one(&self, sql: &str, params: &[Value]) -> QuarryResult<Row> {
        let mut rows = self.query(sql, params).await?;
        match rows.len() {
            0 => Err(QuarryError::NotFound(sql.to_string())),
            1 => Ok(rows.remove(0)),
            n => Err(QuarryError::MultipleRows(format!("{n} rows for {sql}"))),
        }
    }

    /// Executes an INSERT and returns the key of the inserted row.
    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> QuarryResult<Value> {
        self.execute_sql(sql, params).await?;
        let rows = self.query("SELECT last_insert_rowid() AS id", &[]).await?;
        match rows.into_iter().next() {
            Some(row) => row.get::<Value>("id"),
            None => Err(QuarryError::DatabaseError(
                "failed to retrieve last inserted id".to_string(),
            )),
        }
    }

    /// Reserves one connection of this executor for the caller's exclusive
    /// use until the returned executor is dropped.
    ///
    /// Statements other callers run in the meantime wait for the
    /// reservation to end. Executors without a connection of their own
    /// (mocks, transactions) hand out a view of themselves.
    async fn reserve<'a>(&'a self) -> QuarryResult<Box<dyn DbExecutor + 'a>> {
        Ok(Box::new(Borrowed(self)))
    }

    /// Returns `true` if statements already run inside a transaction.
    fn in_transaction(&self) -> bool {
        false
    }
}

/// Runs every statement on the executor it borrows.
struct Borrowed<'a, E: ?Sized>(&'a E);

#[async_trait::async_trait]
impl<E: DbExecutor + ?Sized> DbExecutor for Borrowed<'_, E> {
    fn backend_type(&self) -> DatabaseBackendType {
        self.0.backend_type()
    }

    fn returning(&self) -> Returning {
        self.0.returning()
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> QuarryResult<u64> {
        self.0.execute_sql(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>> {
        self.0.query(sql, params).await
    }

    async fn query_one(&self, sql: &str, params: &[Value]) -> QuarryResult<Row> {
        self.0.query_one(sql, params).await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> QuarryResult<Value> {
        self.0.insert_returning_id(sql, params).await
    }

    async fn reserve<'a>(&'a self) -> QuarryResult<Box<dyn DbExecutor + 'a>> {
        Ok(Box::new(Borrowed(self.0)))
    }

    fn in_transaction(&self) -> bool {
        self.0.in_transaction()
    }
}
