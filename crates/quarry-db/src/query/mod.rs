//! Query building, compilation, and execution.
//!
//! - [`alias`] - Deterministic table aliases for joins
//! - [`walker`] - Field-path resolution across relations
//! - [`lookups`] - Q objects and lookup types for filtering
//! - [`expressions`] - Column references, operators, aggregates, subqueries
//! - [`compiler`] - Query state and SQL compilation
//! - [`queryset`] - The lazy, chainable [`QuerySet`]
//! - [`bulk`] - Bulk create and bulk update
//! - [`raw`] - Raw SQL with field-path substitution

pub mod alias;
pub mod bulk;
pub mod compiler;
pub mod expressions;
pub mod lookups;
pub(crate) mod materialize;
pub mod queryset;
pub mod raw;
pub mod walker;

pub use alias::AliasGenerator;
pub use bulk::BulkCreateOptions;
pub use compiler::{CompiledQuery, DatabaseBackendType, Join, JoinType};
pub use expressions::{AggregateFunc, CompileSubquery, Expr, Op, Subquery, When};
pub use lookups::{Lookup, Q};
pub use materialize::Annotated;
pub use queryset::QuerySet;
pub use walker::{walk, PathNode, RelationChain};
