//! QuerySet: the chainable, lazily compiled query builder.
//!
//! A [`QuerySet`] holds the accumulated select/filter/order/group/annotate
//! state of a query over one model. Chain methods never mutate: each takes
//! `&self` and returns a new `QuerySet` backed by a fresh copy of the state,
//! so one base query can be shared between tasks and specialized by each of
//! them. Nothing is compiled until a terminal method (`all`, `get`, `count`,
//! `update`, ...) runs; the terminal then compiles exactly one statement,
//! executes it under the bound [`QueryContext`] and records it for
//! [`QuerySet::latest_query`].
//!
//! # Examples
//!
//! ```no_run
//! # use quarry_db::executor::DbExecutor;
//! # use quarry_db::model::Model;
//! # use quarry_db::query::QuerySet;
//! # async fn demo<M: Model>(db: &dyn DbExecutor) -> quarry_core::QuarryResult<()> {
//! let open = QuerySet::<M>::new()
//!     .filter("Title__icontains", "test")
//!     .filter("Done", false)
//!     .order_by(&["-ID"])
//!     .limit(5);
//! let rows = open.all(db).await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use quarry_core::logging::query_span;
use quarry_core::{QuarryError, QuarryResult};
use tracing::Instrument;

use super::compiler::{
    compile_insert, compile_update_object, CompiledQuery, DatabaseBackendType, QueryCompiler, QueryState,
    ThroughScope,
};
use super::expressions::{CompileSubquery, Expr};
use super::lookups::{Lookup, Q};
use super::materialize::{bind_object, materialize, scan_into, Annotated};
use crate::context::QueryContext;
use crate::executor::{DbExecutor, Returning};
use crate::fields::FieldDef;
use crate::model::Model;
use crate::registry::{ModelMeta, Registry};
use crate::related::RelationScope;
use crate::relation::ModelKey;
use crate::value::{Row, Value};

/// A lazy query over the objects of `M`.
pub struct QuerySet<M: Model> {
    pub(crate) registry: Registry,
    pub(crate) meta: Result<Arc<ModelMeta>, QuarryError>,
    pub(crate) state: Arc<QueryState>,
    pub(crate) context: QueryContext,
    latest: Arc<StdMutex<Option<CompiledQuery>>>,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> Clone for QuerySet<M> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            meta: self.meta.clone(),
            state: Arc::clone(&self.state),
            context: self.context.clone(),
            latest: Arc::default(),
            _model: PhantomData,
        }
    }
}

impl<M: Model> fmt::Debug for QuerySet<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySet")
            .field("model", &std::any::type_name::<M>())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<M: Model> Default for QuerySet<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> QuerySet<M> {
    /// Creates a query over every object of `M`, registering the model in
    /// the global registry if needed.
    pub fn new() -> Self {
        Self::with_registry(&Registry::global())
    }

    /// Creates a query resolved against `registry`.
    pub fn with_registry(registry: &Registry) -> Self {
        Self {
            registry: registry.clone(),
            meta: registry.register_model::<M>(),
            state: Arc::new(QueryState::default()),
            context: QueryContext::default(),
            latest: Arc::default(),
            _model: PhantomData,
        }
    }

    /// A query set that fails every terminal call with `err`.
    pub(crate) fn failed(registry: Registry, err: QuarryError) -> Self {
        Self {
            registry,
            meta: Err(err),
            state: Arc::new(QueryState::default()),
            context: QueryContext::default(),
            latest: Arc::default(),
            _model: PhantomData,
        }
    }

    /// A query over the objects related to a parent through `scope`.
    pub(crate) fn for_relation(scope: &RelationScope) -> Self {
        let registry = &scope.registry;
        let relation = scope.relation();
        if relation.model() != Some(ModelKey::of::<M>()) {
            return Self::failed(
                registry.clone(),
                QuarryError::ConfigurationError(format!(
                    "relation {} does not point at {}",
                    relation.name(),
                    std::any::type_name::<M>()
                )),
            );
        }
        let mut base = Self::with_registry(registry);
        base.context = scope.context().clone();
        if let Some(through) = relation.through() {
            let Some(through_meta) = registry.meta(through.model()) else {
                return Self::failed(
                    registry.clone(),
                    QuarryError::ConfigurationError(format!(
                        "through model of relation {} is not registered",
                        relation.name()
                    )),
                );
            };
            let column = |name: &str| through_meta.field(name).and_then(FieldDef::column).map(str::to_string);
            let (Some(source_column), Some(target_column)) =
                (column(through.source_field()), column(through.target_field()))
            else {
                return Self::failed(
                    registry.clone(),
                    QuarryError::ConfigurationError(format!(
                        "through model {} lacks the foreign keys of relation {}",
                        through_meta.model_name(),
                        relation.name()
                    )),
                );
            };
            let scope = ThroughScope {
                table: through_meta.table().to_string(),
                source_column,
                target_column,
                value: scope.parent_pk().clone(),
            };
            return base.derive(|s| s.scope = Some(scope));
        }
        if relation.is_reverse() {
            if let Some(owning) = relation.field() {
                return base.filter(owning, scope.parent_pk().clone());
            }
        }
        Self::failed(
            registry.clone(),
            QuarryError::NotImplemented(format!(
                "relation {} cannot be queried from its parent",
                relation.name()
            )),
        )
    }

    fn derive(&self, f: impl FnOnce(&mut QueryState)) -> Self {
        let mut state = (*self.state).clone();
        f(&mut state);
        Self {
            registry: self.registry.clone(),
            meta: self.meta.clone(),
            state: Arc::new(state),
            context: self.context.clone(),
            latest: Arc::default(),
            _model: PhantomData,
        }
    }

    fn model_name(&self) -> String {
        self.meta.as_ref().map_or_else(
            |_| std::any::type_name::<M>().to_string(),
            |m| m.model_name().to_string(),
        )
    }

    fn fail(&self, err: QuarryError) -> Self {
        let err = match err {
            QuarryError::UnknownField { model, field, valid } if model.is_empty() => QuarryError::UnknownField {
                model: self.model_name(),
                field,
                valid,
            },
            other => other,
        };
        self.derive(|s| {
            if s.error.is_none() {
                s.error = Some(err);
            }
        })
    }

    // ── Chaining ────────────────────────────────────────────────────────

    /// Restricts the selected columns.
    ///
    /// Entries are field paths (`"Title"`, `"User.Name"`), `"*"` for every
    /// column of the model, or `"Rel.*"` for every column of a related
    /// model, which is then materialized into the relation field. Replaces
    /// any earlier selection.
    #[must_use]
    pub fn select(&self, fields: &[&str]) -> Self {
        self.derive(|s| s.select = fields.iter().map(ToString::to_string).collect())
    }

    /// Adds a filter from a suffixed path such as `"Title__icontains"`.
    #[must_use]
    pub fn filter(&self, path: &str, value: impl Into<Value>) -> Self {
        match Q::parse(path, value) {
            Ok(q) => self.filter_q(q),
            Err(e) => self.fail(e),
        }
    }

    /// Adds a filter built from [`Q`] objects.
    #[must_use]
    pub fn filter_q(&self, q: Q) -> Self {
        self.derive(|s| s.filters.push(q))
    }

    /// Adds a negated filter.
    #[must_use]
    pub fn exclude(&self, q: Q) -> Self {
        self.filter_q(!q)
    }

    /// Restricts the query to the object with primary key `pk`.
    #[must_use]
    pub fn filter_pk(&self, pk: impl Into<Value>) -> Self {
        self.filter_q(Q::filter("pk", Lookup::Exact(pk.into())))
    }

    /// Sets the ordering. A leading `-` sorts descending.
    #[must_use]
    pub fn order_by(&self, fields: &[&str]) -> Self {
        self.derive(|s| s.order_by = fields.iter().map(ToString::to_string).collect())
    }

    /// Sets the GROUP BY paths.
    #[must_use]
    pub fn group_by(&self, fields: &[&str]) -> Self {
        self.derive(|s| s.group_by = fields.iter().map(ToString::to_string).collect())
    }

    /// Adds a named computed value.
    ///
    /// The name can be used like a field in later filters, orderings and
    /// groupings of the same query.
    #[must_use]
    pub fn annotate(&self, name: &str, expr: Expr) -> Self {
        self.derive(|s| {
            if let Some(slot) = s.annotations.iter_mut().find(|(n, _)| n == name) {
                slot.1 = expr;
            } else {
                s.annotations.push((name.to_string(), expr));
            }
        })
    }

    /// Limits the number of rows.
    #[must_use]
    pub fn limit(&self, n: u64) -> Self {
        self.derive(|s| s.limit = Some(n))
    }

    /// Skips the first `n` rows.
    #[must_use]
    pub fn offset(&self, n: u64) -> Self {
        self.derive(|s| s.offset = Some(n))
    }

    /// Removes duplicate rows.
    #[must_use]
    pub fn distinct(&self) -> Self {
        self.derive(|s| s.distinct = true)
    }

    /// Binds the cancellation signal and timeout every terminal runs under.
    #[must_use]
    pub fn with_context(&self, context: QueryContext) -> Self {
        let mut qs = self.clone();
        qs.context = context;
        qs
    }

    /// Skips the `before_save`/`after_save` hooks on writes.
    #[must_use]
    pub fn explicit_save(&self) -> Self {
        self.derive(|s| s.explicit_save = true)
    }

    // ── Compilation ─────────────────────────────────────────────────────

    pub(crate) fn meta(&self) -> QuarryResult<Arc<ModelMeta>> {
        if let Some(err) = &self.state.error {
            return Err(err.clone());
        }
        self.meta.clone()
    }

    pub(crate) fn compiler<'a>(&'a self, meta: &Arc<ModelMeta>, backend: DatabaseBackendType) -> QueryCompiler<'a> {
        QueryCompiler::new(&self.registry, Arc::clone(meta), &self.state, backend)
    }

    /// Finishes `query` for `backend`, records it and logs it.
    pub(crate) fn record(&self, query: CompiledQuery, backend: DatabaseBackendType) -> CompiledQuery {
        let query = query.finish(backend);
        if self.context.log_sql() {
            tracing::debug!(sql = %query.sql, params = query.params.len(), "compiled query");
        } else {
            tracing::debug!(params = query.params.len(), "compiled query");
        }
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(query.clone());
        query
    }

    /// Runs `fut` under the bound context inside the query span.
    pub(crate) async fn run<T, F>(&self, operation: &str, fut: F) -> QuarryResult<T>
    where
        F: Future<Output = QuarryResult<T>>,
    {
        let span = query_span(&self.model_name(), operation);
        self.context.run(fut).instrument(span).await
    }

    /// Compiles the SELECT `all` would run.
    pub fn sql(&self, backend: DatabaseBackendType) -> QuarryResult<CompiledQuery> {
        let meta = self.meta()?;
        let (query, _) = self.compiler(&meta, backend).compile_select(false)?;
        Ok(query.finish(backend))
    }

    /// The statement most recently run by this value.
    pub fn latest_query(&self) -> Option<CompiledQuery> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    // ── Reading ─────────────────────────────────────────────────────────

    async fn fetch(&self, db: &dyn DbExecutor, operation: &str, cap: Option<u64>) -> QuarryResult<Vec<Annotated<M>>> {
        let meta = self.meta()?;
        let backend = db.backend_type();
        let mut compiler = self.compiler(&meta, backend);
        if let Some(n) = cap {
            compiler = compiler.cap_rows(n);
        }
        let (query, plan) = compiler.compile_select(false)?;
        let query = self.record(query, backend);
        let rows = self.run(operation, db.query(&query.sql, &query.params)).await?;
        materialize::<M>(&plan, &rows, &self.registry, &self.context)
    }

    /// Runs the query and returns every object.
    pub async fn all(&self, db: &dyn DbExecutor) -> QuarryResult<Vec<M>> {
        Ok(self.all_annotated(db).await?.into_iter().map(|a| a.object).collect())
    }

    /// Runs the query and returns every object with its annotations.
    pub async fn all_annotated(&self, db: &dyn DbExecutor) -> QuarryResult<Vec<Annotated<M>>> {
        self.fetch(db, "all", None).await
    }

    /// Returns the single matching object.
    ///
    /// Fails with `NotFound` when nothing matches and with `MultipleRows`
    /// when more than one object does.
    pub async fn get(&self, db: &dyn DbExecutor) -> QuarryResult<M> {
        let mut found = self.fetch(db, "get", Some(2)).await?;
        match found.len() {
            0 => Err(QuarryError::NotFound(format!(
                "{} matching query does not exist",
                self.model_name()
            ))),
            1 => Ok(found.remove(0).object),
            n => Err(QuarryError::MultipleRows(format!(
                "get() returned {n} {} objects",
                self.model_name()
            ))),
        }
    }

    /// Returns the first object, ordered by primary key unless the query
    /// is ordered.
    pub async fn first(&self, db: &dyn DbExecutor) -> QuarryResult<Option<M>> {
        let qs = if self.state.order_by.is_empty() {
            self.order_by(&["pk"])
        } else {
            self.clone()
        };
        let found = qs.fetch(db, "first", Some(1)).await?;
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = qs.latest_query();
        Ok(found.into_iter().next().map(|a| a.object))
    }

    /// Returns the last object, reversing the ordering `first` would use.
    pub async fn last(&self, db: &dyn DbExecutor) -> QuarryResult<Option<M>> {
        let reversed: Vec<String> = if self.state.order_by.is_empty() {
            vec!["-pk".to_string()]
        } else {
            self.state
                .order_by
                .iter()
                .map(|o| o.strip_prefix('-').map_or_else(|| format!("-{o}"), str::to_string))
                .collect()
        };
        let qs = self.derive(|s| s.order_by = reversed);
        let found = qs.fetch(db, "last", Some(1)).await?;
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = qs.latest_query();
        Ok(found.into_iter().next().map(|a| a.object))
    }

    /// Counts the matching objects.
    pub async fn count(&self, db: &dyn DbExecutor) -> QuarryResult<i64> {
        let meta = self.meta()?;
        let backend = db.backend_type();
        let query = self.record(self.compiler(&meta, backend).compile_count()?, backend);
        let rows = self.run("count", db.query(&query.sql, &query.params)).await?;
        match rows.first() {
            Some(row) => row.get_by_index::<i64>(0),
            None => Ok(0),
        }
    }

    /// Returns `true` if any object matches.
    pub async fn exists(&self, db: &dyn DbExecutor) -> QuarryResult<bool> {
        let meta = self.meta()?;
        let backend = db.backend_type();
        let query = self.record(self.compiler(&meta, backend).compile_exists()?, backend);
        let rows = self.run("exists", db.query(&query.sql, &query.params)).await?;
        Ok(!rows.is_empty())
    }

    /// Computes aggregates over the matching rows.
    ///
    /// The returned row has one column per `(name, expr)` pair.
    pub async fn aggregate(&self, aggregates: &[(&str, Expr)], db: &dyn DbExecutor) -> QuarryResult<Row> {
        let meta = self.meta()?;
        let backend = db.backend_type();
        let owned: Vec<(String, Expr)> = aggregates
            .iter()
            .map(|(name, expr)| ((*name).to_string(), expr.clone()))
            .collect();
        let query = self.record(self.compiler(&meta, backend).compile_aggregate(&owned)?, backend);
        let rows = self.run("aggregate", db.query(&query.sql, &query.params)).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| QuarryError::DatabaseError("aggregate returned no row".to_string()))
    }

    /// Returns the selected columns as rows labelled by field path.
    pub async fn values(&self, db: &dyn DbExecutor) -> QuarryResult<Vec<Row>> {
        let meta = self.meta()?;
        let backend = db.backend_type();
        let (query, _) = self.compiler(&meta, backend).compile_select(true)?;
        let query = self.record(query, backend);
        self.run("values", db.query(&query.sql, &query.params)).await
    }

    /// Returns the selected columns as plain value lists.
    pub async fn values_list(&self, db: &dyn DbExecutor) -> QuarryResult<Vec<Vec<Value>>> {
        Ok(self.values(db).await?.into_iter().map(Row::into_values).collect())
    }

    // ── Writing ─────────────────────────────────────────────────────────

    /// The fields written by an INSERT of `obj`: every editable column,
    /// skipping an unset primary key.
    pub(crate) fn insert_fields<'m>(meta: &'m ModelMeta, obj: &M) -> Vec<&'m FieldDef> {
        meta.concrete_fields()
            .filter(|f| f.is_editable())
            .filter(|f| !(f.is_primary_key() && f.value_of(obj).map_or(true, |v| v.is_unset_key())))
            .collect()
    }

    /// Inserts `obj`, then refreshes it from what the database reports.
    pub async fn create(&self, obj: &mut M, db: &dyn DbExecutor) -> QuarryResult<()> {
        let meta = self.meta()?;
        if !self.state.explicit_save {
            obj.before_save()?;
        }
        let backend = db.backend_type();
        let returning = db.returning();
        let fields = Self::insert_fields(&meta, obj);
        let values = fields
            .iter()
            .map(|f| f.value_of(&*obj).unwrap_or(Value::Null))
            .collect();
        let query = self.record(
            compile_insert(&meta, &fields, vec![values], returning == Returning::Columns),
            backend,
        );

        match returning {
            Returning::Columns => {
                let rows = self.run("create", db.query(&query.sql, &query.params)).await?;
                let row = rows
                    .first()
                    .ok_or_else(|| QuarryError::DatabaseError("INSERT returned no row".to_string()))?;
                scan_into(&meta, obj, row)?;
            }
            Returning::LastInsertId => {
                let id = self
                    .run("create", db.insert_returning_id(&query.sql, &query.params))
                    .await?;
                if let Some(pk) = meta.primary_key() {
                    if meta.pk_of(&*obj).is_unset_key() {
                        pk.set_value(obj, &id)?;
                    }
                }
            }
            Returning::Nothing => {
                self.run("create", db.execute_sql(&query.sql, &query.params)).await?;
            }
        }

        bind_object(obj, &meta, &self.registry, &self.context);
        if !self.state.explicit_save {
            obj.after_save()?;
        }
        Ok(())
    }

    /// Sets `fields` on every matching row. Returns the number of rows
    /// updated.
    pub async fn update(&self, fields: &[(&str, Value)], db: &dyn DbExecutor) -> QuarryResult<u64> {
        let exprs: Vec<(&str, Expr)> = fields
            .iter()
            .map(|(name, value)| (*name, Expr::Value(value.clone())))
            .collect();
        self.update_expr(&exprs, db).await
    }

    /// Sets fields to expressions, which may refer to the row's own
    /// columns: `("Title", Expr::col("Title") + Expr::value("!"))`.
    pub async fn update_expr(&self, fields: &[(&str, Expr)], db: &dyn DbExecutor) -> QuarryResult<u64> {
        let meta = self.meta()?;
        let backend = db.backend_type();
        let owned: Vec<(String, Expr)> = fields
            .iter()
            .map(|(name, expr)| ((*name).to_string(), expr.clone()))
            .collect();
        let query = self.record(self.compiler(&meta, backend).compile_update(&owned)?, backend);
        self.run("update", db.execute_sql(&query.sql, &query.params)).await
    }

    /// Writes `obj` back to its row.
    ///
    /// With an explicit selection only the selected fields are written.
    pub async fn update_object(&self, obj: &mut M, db: &dyn DbExecutor) -> QuarryResult<()> {
        let meta = self.meta()?;
        meta.require_pk()?;
        let pk = meta.pk_of(&*obj);
        if pk.is_unset_key() {
            return Err(QuarryError::ConfigurationError(format!(
                "cannot update a {} without primary key",
                meta.model_name()
            )));
        }
        if !self.state.explicit_save {
            obj.before_save()?;
        }
        let selected = &self.state.select;
        let fields: Vec<&FieldDef> = meta
            .concrete_fields()
            .filter(|f| f.is_editable() && !f.is_primary_key())
            .filter(|f| selected.is_empty() || selected.iter().any(|s| s == f.name()))
            .collect();
        if fields.is_empty() {
            return Err(QuarryError::ConfigurationError(format!(
                "no writable field of {} selected",
                meta.model_name()
            )));
        }
        let values = fields
            .iter()
            .map(|f| f.value_of(&*obj).unwrap_or(Value::Null))
            .collect();
        let backend = db.backend_type();
        let returning = db.returning() == Returning::Columns;
        let query = self.record(compile_update_object(&meta, &fields, values, pk, returning)?, backend);

        let not_found = || QuarryError::NotFound(format!("{} matching query does not exist", meta.model_name()));
        if returning {
            let rows = self.run("update_object", db.query(&query.sql, &query.params)).await?;
            let row = rows.first().ok_or_else(not_found)?;
            scan_into(&meta, obj, row)?;
        } else {
            let n = self
                .run("update_object", db.execute_sql(&query.sql, &query.params))
                .await?;
            if n == 0 {
                return Err(not_found());
            }
        }

        if !self.state.explicit_save {
            obj.after_save()?;
        }
        Ok(())
    }

    /// Deletes every matching row. Returns the number of rows deleted.
    pub async fn delete(&self, db: &dyn DbExecutor) -> QuarryResult<u64> {
        let meta = self.meta()?;
        let backend = db.backend_type();
        let query = self.record(self.compiler(&meta, backend).compile_delete()?, backend);
        self.run("delete", db.execute_sql(&query.sql, &query.params)).await
    }
}

impl<M: Model> CompileSubquery for QuerySet<M> {
    fn compile_subquery(&self, backend: DatabaseBackendType) -> QuarryResult<CompiledQuery> {
        let meta = self.meta()?;
        let (query, _) = self.compiler(&meta, backend).compile_select(true)?;
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::QueryContext;
    use crate::testing::{row, LogLine, MockDb, Profile, Tag, Todo, User};

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.register_model::<Todo>().unwrap();
        registry.register_model::<Profile>().unwrap();
        registry
    }

    fn todos(registry: &Registry) -> QuerySet<Todo> {
        QuerySet::with_registry(registry)
    }

    fn todo_row(id: i64, title: &str) -> Row {
        row(
            &["id", "title", "done", "user_id"],
            vec![id.into(), title.into(), false.into(), Value::Null],
        )
    }

    #[test]
    fn test_chaining_leaves_base_untouched() {
        let registry = registry();
        let base = todos(&registry).filter("Done", false);
        let narrowed = base.filter("Title", "x").limit(3);
        let base_sql = base.sql(DatabaseBackendType::SQLite).unwrap().sql;
        assert!(!base_sql.contains("title\" = ?"));
        assert!(!base_sql.contains("LIMIT"));
        let narrowed_sql = narrowed.sql(DatabaseBackendType::SQLite).unwrap().sql;
        assert!(narrowed_sql.ends_with(r#""todos"."done" = ? AND "todos"."title" = ? LIMIT 3"#));
    }

    #[test]
    fn test_unknown_lookup_names_model() {
        let registry = registry();
        let err = todos(&registry)
            .filter("Title__like", "x")
            .sql(DatabaseBackendType::SQLite)
            .unwrap_err();
        match err {
            QuarryError::UnknownField { model, .. } => assert_eq!(model, "Todo"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_unknown_path_fails_at_compile() {
        let registry = registry();
        let err = todos(&registry)
            .filter("Owner.Name", "x")
            .sql(DatabaseBackendType::SQLite)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_all_records_latest_query() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::PostgreSQL)
            .with_responses(vec![vec![todo_row(1, "a"), todo_row(2, "b")]]);
        let qs = todos(&registry).filter("Done", false);
        assert!(qs.latest_query().is_none());
        let found = qs.all(&db).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].title, "b");
        let latest = qs.latest_query().unwrap();
        assert!(latest.sql.ends_with(r#"WHERE "todos"."done" = $1"#));
        assert!(qs.clone().latest_query().is_none());
    }

    #[tokio::test]
    async fn test_get_cardinality() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::SQLite).with_responses(vec![
            vec![],
            vec![todo_row(1, "a")],
            vec![todo_row(1, "a"), todo_row(2, "a")],
        ]);
        let qs = todos(&registry).filter("Title", "a");
        assert!(qs.get(&db).await.unwrap_err().is_not_found());
        assert_eq!(qs.get(&db).await.unwrap().id, 1);
        assert!(qs.get(&db).await.unwrap_err().is_multiple_rows());
        assert!(qs.latest_query().unwrap().sql.ends_with("LIMIT 2"));
    }

    #[tokio::test]
    async fn test_first_and_last_ordering() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::SQLite).with_responses(vec![vec![todo_row(1, "a")], vec![]]);
        let qs = todos(&registry);
        assert_eq!(qs.first(&db).await.unwrap().unwrap().id, 1);
        assert!(qs.latest_query().unwrap().sql.ends_with(r#"ORDER BY "todos"."id" ASC LIMIT 1"#));
        assert!(qs.order_by(&["-Title"]).last(&db).await.unwrap().is_none());
        let statements = db.statements().await;
        assert!(statements[1].0.ends_with(r#"ORDER BY "todos"."title" ASC LIMIT 1"#));
    }

    #[tokio::test]
    async fn test_count_and_exists() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::SQLite)
            .with_responses(vec![vec![row(&["COUNT(*)"], vec![3.into()])], vec![]]);
        let qs = todos(&registry).filter("Done", true);
        assert_eq!(qs.count(&db).await.unwrap(), 3);
        assert!(!qs.exists(&db).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_with_returning_columns() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::SQLite)
            .with_returning(Returning::Columns)
            .with_responses(vec![vec![row(
                &["id", "title", "done", "user_id"],
                vec![9.into(), "new".into(), false.into(), Value::Null],
            )]]);
        let mut todo = Todo {
            title: "new".into(),
            ..Todo::default()
        };
        todos(&registry).create(&mut todo, &db).await.unwrap();
        assert_eq!(todo.id, 9);
        assert!(todo.tags.scope().is_some());
        let statements = db.statements().await;
        assert_eq!(
            statements[0].0,
            r#"INSERT INTO "todos" ("title", "done", "user_id") VALUES (?, ?, ?) RETURNING "id", "title", "done", "user_id""#
        );
        assert_eq!(statements[0].1, vec![Value::from("new"), Value::Bool(false), Value::Null]);
    }

    #[tokio::test]
    async fn test_create_with_last_insert_id_and_nothing() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let mut user = User {
            name: "Ann".into(),
            ..User::default()
        };
        QuerySet::<User>::with_registry(&registry).create(&mut user, &db).await.unwrap();
        assert_eq!(user.id, 1);

        let silent = MockDb::new(DatabaseBackendType::SQLite).with_returning(Returning::Nothing);
        let mut other = User {
            name: "Bob".into(),
            ..User::default()
        };
        QuerySet::<User>::with_registry(&registry).create(&mut other, &silent).await.unwrap();
        assert_eq!(other.id, 0);
    }

    #[tokio::test]
    async fn test_update_object_respects_selection() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::SQLite).with_returning(Returning::LastInsertId);
        let mut todo = Todo {
            id: 4,
            title: "t".into(),
            done: true,
            ..Todo::default()
        };
        todos(&registry).select(&["Done"]).update_object(&mut todo, &db).await.unwrap();
        let statements = db.statements().await;
        assert_eq!(statements[0].0, r#"UPDATE "todos" SET "done" = ? WHERE "id" = ?"#);
        assert_eq!(statements[0].1, vec![Value::Bool(true), Value::Int(4)]);

        let mut unsaved = Todo::default();
        let err = todos(&registry).update_object(&mut unsaved, &db).await.unwrap_err();
        assert!(err.is_configuration(), "{err:?}");
        assert_eq!(db.statements().await.len(), 1);

        let mut line = LogLine::default();
        let err = QuerySet::<LogLine>::with_registry(&registry)
            .update_object(&mut line, &db)
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_created_object_containers_inherit_context() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let (ctx, handle) = QueryContext::cancellable();
        let mut todo = Todo {
            title: "t".into(),
            ..Todo::default()
        };
        todos(&registry).with_context(ctx).create(&mut todo, &db).await.unwrap();
        handle.cancel();
        assert!(todo.tags.scope().unwrap().context().is_cancelled());
        let err = todo.tags.objects().count(&db).await.unwrap_err();
        assert!(matches!(err, QuarryError::Cancelled(_)));
        assert_eq!(db.statements().await.len(), 1);
    }

    #[tokio::test]
    async fn test_create_without_primary_key_under_each_returning_mode() {
        let registry = registry();
        let lines = QuerySet::<LogLine>::with_registry(&registry);
        let columns = MockDb::new(DatabaseBackendType::SQLite)
            .with_returning(Returning::Columns)
            .with_responses(vec![vec![row(&["message", "level"], vec!["up".into(), 2.into()])]]);
        let last_id = MockDb::new(DatabaseBackendType::SQLite).with_returning(Returning::LastInsertId);
        let nothing = MockDb::new(DatabaseBackendType::SQLite).with_returning(Returning::Nothing);

        for db in [&columns, &last_id, &nothing] {
            let mut line = LogLine {
                message: "up".into(),
                level: 2,
            };
            lines.create(&mut line, db).await.unwrap();
            assert_eq!(line.message, "up");
            assert_eq!(line.level, 2);
            let statements = db.statements().await;
            assert_eq!(statements.len(), 1);
            assert!(statements[0].0.starts_with(r#"INSERT INTO "log_lines" ("message", "level") VALUES (?, ?)"#));
        }
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let qs = todos(&registry).filter("User.Name", "Ann");
        assert_eq!(qs.update(&[("Done", Value::Bool(true))], &db).await.unwrap(), 1);
        assert_eq!(qs.delete(&db).await.unwrap(), 1);
        let statements = db.statements().await;
        assert!(statements[0].0.starts_with(r#"UPDATE "todos" SET "done" = ? WHERE "todos"."id" IN (SELECT"#));
        assert!(statements[1].0.starts_with(r#"DELETE FROM "todos" WHERE "todos"."id" IN (SELECT"#));
    }

    #[tokio::test]
    async fn test_values_and_aggregate() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::SQLite).with_responses(vec![
            vec![row(&["Title"], vec!["a".into()])],
            vec![row(&["n"], vec![2.into()])],
        ]);
        let qs = todos(&registry).select(&["Title"]);
        assert_eq!(qs.values_list(&db).await.unwrap(), vec![vec![Value::from("a")]]);
        let agg = qs.aggregate(&[("n", Expr::count_all())], &db).await.unwrap();
        assert_eq!(agg.get::<i64>("n").unwrap(), 2);
        let statements = db.statements().await;
        assert_eq!(statements[0].0, r#"SELECT "todos"."title" AS "Title" FROM "todos""#);
        assert_eq!(statements[1].0, r#"SELECT COUNT(*) AS "n" FROM "todos""#);
    }

    #[tokio::test]
    async fn test_cancelled_context_never_reaches_db() {
        let registry = registry();
        let db = MockDb::new(DatabaseBackendType::SQLite);
        let (ctx, handle) = QueryContext::cancellable();
        handle.cancel();
        let err = todos(&registry).with_context(ctx).all(&db).await.unwrap_err();
        assert!(matches!(err, QuarryError::Cancelled(_)));
        assert!(db.statements().await.is_empty());
    }

    #[test]
    fn test_subquery_filter() {
        let registry = registry();
        let done_users = QuerySet::<Todo>::with_registry(&registry)
            .select(&["User"])
            .filter("Done", true);
        let qs = QuerySet::<User>::with_registry(&registry)
            .filter_q(Q::from(Expr::col("ID").is_in(Expr::subquery(done_users))));
        let q = qs.sql(DatabaseBackendType::PostgreSQL).unwrap();
        assert_eq!(
            q.sql,
            concat!(
                r#"SELECT "users"."id", "users"."name" FROM "users" WHERE "users"."id" IN"#,
                r#" (SELECT "todos"."user_id" AS "User" FROM "todos" WHERE "todos"."done" = $1)"#
            )
        );
    }

    #[test]
    fn test_relation_scoped_query_sets() {
        let registry = registry();
        let user = registry.get_model_meta::<User>().unwrap();
        let scope = RelationScope::new(registry.clone(), Value::Int(5), user.reverse("TodoSet").unwrap());
        let sql = QuerySet::<Todo>::for_relation(&scope)
            .sql(DatabaseBackendType::SQLite)
            .unwrap()
            .sql;
        assert!(sql.ends_with(r#"WHERE "todos"."user_id" = ?"#));

        let tag = registry.get_model_meta::<Tag>().unwrap();
        let scope = RelationScope::new(registry.clone(), Value::Int(2), tag.reverse("TodoSet").unwrap());
        let sql = QuerySet::<Todo>::for_relation(&scope)
            .sql(DatabaseBackendType::SQLite)
            .unwrap()
            .sql;
        assert!(sql.contains(r#"INNER JOIN "todo_tags" AS "T_todo_tags" ON "T_todo_tags"."todo_id" = "todos"."id""#));
        assert!(sql.ends_with(r#"WHERE "T_todo_tags"."tag_id" = ?"#));

        let wrong = QuerySet::<Tag>::for_relation(&scope).sql(DatabaseBackendType::SQLite);
        assert!(wrong.unwrap_err().is_configuration());
    }
}
