//! # quarry-db
//!
//! Relational metadata and query layer for quarry. Plain Rust structs become
//! models by implementing [`Model`](model::Model); a [`Registry`](registry::Registry)
//! derives their metadata and the relation graph between them, and a
//! [`QuerySet`](query::QuerySet) compiles filters, joins, and annotations into
//! parameterized SQL.
//!
//! ## Architecture
//!
//! Query building is lazy. A [`QuerySet`](query::QuerySet) accumulates state
//! through method chaining without touching the database. SQL is generated
//! only when a terminal method (`.all()`, `.get()`, `.count()`, ...) runs,
//! which then goes through a [`DbExecutor`](executor::DbExecutor) supplied by
//! a backend crate. Rows come back as models, with the related objects a
//! query selected materialized into their relation containers.
//!
//! ## Module Overview
//!
//! - [`model`] - The [`Model`](model::Model) trait and field definitions
//! - [`registry`] - [`ModelMeta`](registry::ModelMeta) and the model registry
//! - [`relation`] - Relation descriptors and the relation graph
//! - [`related`] - Relation containers held on model structs
//! - [`fields`] - Field definitions ([`FieldDef`](fields::FieldDef)) and types
//! - [`value`] - The backend-agnostic [`Value`](value::Value) enum and rows
//! - [`query`] - Path walking, aliases, expressions, compilation, QuerySet
//! - [`context`] - Cancellation and statement timeouts
//! - [`executor`] - The trait backends implement
//! - [`transactions`] - Transaction management

// These clippy lints are intentionally allowed for the ORM crate:
// - too_many_lines: the SQL compiler methods are inherently large
// - result_large_err: QuarryError is used consistently across the crate
// - format_push_string: format! with push_str is clearer than write! for SQL
// - module_name_repetitions: QuerySet lives in query::queryset
#![allow(clippy::too_many_lines)]
#![allow(clippy::result_large_err)]
#![allow(clippy::format_push_string)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::type_complexity)]
// significant_drop_tightening: false positives with async Mutex guards
#![allow(clippy::significant_drop_tightening)]

pub mod context;
pub mod executor;
pub mod fields;
pub mod model;
pub mod query;
pub mod registry;
pub mod related;
pub mod relation;
pub mod transactions;
pub mod value;

#[cfg(test)]
mod testing;

// Re-export the most commonly used types at the crate root.
pub use context::{CancelHandle, QueryContext};
pub use executor::{DbExecutor, Returning};
pub use fields::{FieldDef, FieldType, ValueType};
pub use model::{pk_value, Definitions, Model};
pub use query::{
    AggregateFunc, Annotated, BulkCreateOptions, CompiledQuery, DatabaseBackendType, Expr, Lookup,
    QuerySet, When, Q,
};
pub use registry::{ModelMeta, Registry};
pub use related::{ForeignKey, RelM2M, RelO2O, RelRevFK, RelatedSlot, RelationScope};
pub use relation::{ModelKey, Relation, RelationTarget, RelationType, Through};
pub use transactions::{run_in_transaction, TransactionManager};
pub use value::{FromValue, Row, Value};
