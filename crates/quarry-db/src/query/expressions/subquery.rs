//! Subquery expressions.
//!
//! A [`Subquery`] embeds another query inside an expression. It holds the
//! query behind the [`CompileSubquery`] trait, which every
//! [`QuerySet`](crate::query::QuerySet) implements, and renders as
//! `(SELECT ...)`.
//!
//! ```ignore
//! // Todos owned by users named Ann.
//! let owners = User::objects().filter("Name", "Ann").select(&["ID"]);
//! let todos = Todo::objects().filter_q(Expr::col("User").is_in(Expr::subquery(owners)).into());
//! ```

use std::fmt;
use std::sync::Arc;

use quarry_core::QuarryResult;

use crate::query::compiler::{CompiledQuery, DatabaseBackendType};

/// A query that can be compiled as a nested SELECT.
pub trait CompileSubquery: Send + Sync + fmt::Debug {
    /// Compiles the query with `?` placeholders.
    fn compile_subquery(&self, backend: DatabaseBackendType) -> QuarryResult<CompiledQuery>;
}

/// A nested query inside an expression.
#[derive(Clone)]
pub struct Subquery(Arc<dyn CompileSubquery>);

impl Subquery {
    /// Wraps a query.
    pub fn new(query: impl CompileSubquery + 'static) -> Self {
        Self(Arc::new(query))
    }

    /// Compiles the wrapped query.
    pub fn compile(&self, backend: DatabaseBackendType) -> QuarryResult<CompiledQuery> {
        self.0.compile_subquery(backend)
    }
}

impl fmt::Debug for Subquery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Subquery").field(&self.0).finish()
    }
}

/// Two subqueries are equal when they wrap the same query value.
impl PartialEq for Subquery {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.0).cast::<()>() == Arc::as_ptr(&other.0).cast::<()>()
    }
}
