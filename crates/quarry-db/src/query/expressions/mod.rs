//! Query expressions, aggregates, and subqueries.
//!
//! # Submodules
//!
//! - [`core`] - The [`Expr`] tree: column references, values, raw SQL, functions, aggregates, CASE/WHEN, operators
//! - [`subquery`] - Nested queries usable inside expressions

pub mod core;
pub mod subquery;

pub use self::core::{AggregateFunc, Expr, Op, ResolveContext, When};
pub use self::subquery::{CompileSubquery, Subquery};
