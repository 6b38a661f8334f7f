//! Transaction support.
//!
//! [`run_in_transaction`] runs a callback inside a database transaction. The
//! callback receives a [`TransactionManager`], itself a [`DbExecutor`], to
//! run its queries on. Returning `Ok(true)` commits; returning `Ok(false)` or
//! an error rolls back, so partial writes are never visible afterwards.
//!
//! The manager reserves a connection of the executor for its whole
//! lifetime (see [`DbExecutor::reserve`]), so statements other tasks run
//! meanwhile never land inside the transaction. They wait for it to end
//! instead. The callback must therefore run its queries on the manager and
//! not on the executor it was started from.
//!
//! Running a transaction on an executor that is already a transaction
//! creates a savepoint rather than a nested transaction.
//!
//! # Examples
//!
//! ```ignore
//! use quarry_db::transactions::run_in_transaction;
//!
//! let committed = run_in_transaction(&db, |txn| async move {
//!     let mut todo = Todo { title: "draft".into(), ..Todo::default() };
//!     Todo::objects().create(&mut todo, &*txn).await?;
//!     Ok(false) // roll back
//! })
//! .await?;
//! assert!(!committed);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};
use tokio::sync::Mutex;

use crate::executor::{DbExecutor, Returning};
use crate::query::compiler::DatabaseBackendType;
use crate::value::{Row, Value};

/// Counter for generating unique savepoint names.
static SAVEPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_savepoint() -> String {
    format!("sp_{}", SAVEPOINT_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Where the manager stands in its transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Finished,
    Open,
    Savepoint(String),
}

/// Manages one transaction, or one savepoint inside an outer transaction.
pub struct TransactionManager<'a> {
    conn: Box<dyn DbExecutor + 'a>,
    nested: bool,
    state: Mutex<State>,
}

impl<'a> TransactionManager<'a> {
    /// Reserves a connection of `db` and begins a transaction on it, or a
    /// savepoint when `db` is already a transaction.
    pub async fn begin(db: &'a dyn DbExecutor) -> QuarryResult<Self> {
        let nested = db.in_transaction();
        let conn = db.reserve().await?;
        let state = if nested {
            let name = next_savepoint();
            conn.execute_sql(&format!("SAVEPOINT {name}"), &[]).await?;
            State::Savepoint(name)
        } else {
            conn.execute_sql("BEGIN", &[]).await?;
            State::Open
        };
        Ok(Self {
            conn,
            nested,
            state: Mutex::new(state),
        })
    }

    /// Returns the reserved executor.
    pub fn executor(&self) -> &dyn DbExecutor {
        &*self.conn
    }

    /// Returns `true` if this manager works on a savepoint.
    pub const fn is_nested(&self) -> bool {
        self.nested
    }

    /// Commits the transaction or releases the savepoint.
    pub async fn commit(&self) -> QuarryResult<()> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Finished => {
                return Err(QuarryError::DatabaseError(
                    "cannot commit: transaction already finished".to_string(),
                ))
            }
            State::Open => {
                self.conn.execute_sql("COMMIT", &[]).await?;
            }
            State::Savepoint(name) => {
                self.conn
                    .execute_sql(&format!("RELEASE SAVEPOINT {name}"), &[])
                    .await?;
            }
        }
        *state = State::Finished;
        Ok(())
    }

    /// Rolls back the transaction or the savepoint.
    pub async fn rollback(&self) -> QuarryResult<()> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Finished => {
                return Err(QuarryError::DatabaseError(
                    "cannot rollback: transaction already finished".to_string(),
                ))
            }
            State::Open => {
                self.conn.execute_sql("ROLLBACK", &[]).await?;
            }
            State::Savepoint(name) => {
                self.conn
                    .execute_sql(&format!("ROLLBACK TO SAVEPOINT {name}"), &[])
                    .await?;
                self.conn
                    .execute_sql(&format!("RELEASE SAVEPOINT {name}"), &[])
                    .await?;
            }
        }
        *state = State::Finished;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DbExecutor for TransactionManager<'_> {
    fn backend_type(&self) -> DatabaseBackendType {
        self.conn.backend_type()
    }

    fn returning(&self) -> Returning {
        self.conn.returning()
    }

    async fn execute_sql(&self, sql: &str, params: &[Value]) -> QuarryResult<u64> {
        self.conn.execute_sql(sql, params).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>> {
        self.conn.query(sql, params).await
    }

    async fn query_one(&self, sql: &str, params: &[Value]) -> QuarryResult<Row> {
        self.conn.query_one(sql, params).await
    }

    async fn insert_returning_id(&self, sql: &str, params: &[Value]) -> QuarryResult<Value> {
        self.conn.insert_returning_id(sql, params).await
    }

    fn in_transaction(&self) -> bool {
        true
    }
}

/// Runs `f` inside a transaction.
///
/// `Ok(true)` from the callback commits; `Ok(false)` rolls back. An error
/// rolls back and is returned unchanged. The returned flag reports whether
/// the work was committed.
///
/// The connection stays reserved until the callback and the final COMMIT or
/// ROLLBACK complete. Running queries on `db` itself from inside the
/// callback waits for that and therefore never finishes.
pub async fn run_in_transaction<'a, F, Fut>(db: &'a dyn DbExecutor, f: F) -> QuarryResult<bool>
where
    F: FnOnce(Arc<TransactionManager<'a>>) -> Fut,
    Fut: std::future::Future<Output = QuarryResult<bool>>,
{
    let txn = Arc::new(TransactionManager::begin(db).await?);

    match f(Arc::clone(&txn)).await {
        Ok(true) => {
            txn.commit().await?;
            Ok(true)
        }
        Ok(false) => {
            txn.rollback().await?;
            tracing::debug!(nested = txn.is_nested(), "transaction rolled back by callback");
            Ok(false)
        }
        Err(e) => {
            if let Err(rollback) = txn.rollback().await {
                tracing::warn!(error = %rollback, "rollback after failed transaction also failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDb;

    fn sql(stmts: &[(String, Vec<Value>)]) -> Vec<&str> {
        stmts.iter().map(|(s, _)| s.as_str()).collect()
    }

    #[tokio::test]
    async fn test_commit_on_true() {
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let committed = run_in_transaction(&db, |txn| async move {
            txn.execute_sql("INSERT INTO t VALUES (1)", &[]).await?;
            Ok(true)
        })
        .await
        .unwrap();
        assert!(committed);
        assert_eq!(
            sql(&db.statements().await),
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "COMMIT"]
        );
    }

    #[tokio::test]
    async fn test_rollback_on_false() {
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let committed = run_in_transaction(&db, |_txn| async move { Ok(false) })
            .await
            .unwrap();
        assert!(!committed);
        assert_eq!(sql(&db.statements().await), vec!["BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_rollback_on_error() {
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let err = run_in_transaction(&db, |_txn| async move {
            Err(QuarryError::IntegrityError("duplicate".into()))
        })
        .await
        .unwrap_err();
        assert_eq!(err, QuarryError::IntegrityError("duplicate".into()));
        assert_eq!(sql(&db.statements().await), vec!["BEGIN", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_nested_uses_savepoint() {
        let db = MockDb::new(DatabaseBackendType::SQLite);
        run_in_transaction(&db, |outer| async move {
            let inner_committed = run_in_transaction(&*outer, |inner| async move {
                assert!(inner.is_nested());
                Ok(false)
            })
            .await?;
            assert!(!inner_committed);
            Ok(true)
        })
        .await
        .unwrap();

        let stmts = db.statements().await;
        let stmts = sql(&stmts);
        assert_eq!(stmts.len(), 5);
        assert_eq!(stmts[0], "BEGIN");
        assert!(stmts[1].starts_with("SAVEPOINT sp_"));
        assert!(stmts[2].starts_with("ROLLBACK TO SAVEPOINT sp_"));
        assert!(stmts[3].starts_with("RELEASE SAVEPOINT sp_"));
        assert_eq!(stmts[4], "COMMIT");
    }

    #[tokio::test]
    async fn test_finished_transaction_rejects_commit() {
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let txn = TransactionManager::begin(&db).await.unwrap();
        txn.commit().await.unwrap();
        assert!(txn.commit().await.is_err());
        assert!(txn.rollback().await.is_err());
        assert_eq!(sql(&db.statements().await), vec!["BEGIN", "COMMIT"]);
    }

    #[tokio::test]
    async fn test_manager_is_executor() {
        let db = MockDb::new(DatabaseBackendType::PostgreSQL).with_returning(Returning::Columns);
        let txn = TransactionManager::begin(&db).await.unwrap();
        assert_eq!(txn.backend_type(), DatabaseBackendType::PostgreSQL);
        assert_eq!(txn.returning(), Returning::Columns);
        assert!(txn.in_transaction());
        assert!(!txn.is_nested());
    }
}
