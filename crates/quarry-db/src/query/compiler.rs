//! SQL compilation.
//!
//! A [`QueryCompiler`] turns the accumulated state of a
//! [`QuerySet`](crate::query::QuerySet) into one [`CompiledQuery`]. Each
//! compilation owns a fresh [`AliasGenerator`] and join list: every dotted
//! path referenced by the select list, filters, ordering, grouping or
//! annotations is walked, and each relation hop becomes one `LEFT JOIN`
//! (two for through-mediated relations) whose alias depends only on the path
//! leading to it.
//!
//! Statements are generated with `?` placeholders and identifiers in double
//! quotes; [`CompiledQuery::finish`] rewrites placeholders for backends that
//! number them.

use std::fmt::Write as _;
use std::sync::Arc;

use quarry_core::{QuarryError, QuarryResult};

use super::alias::AliasGenerator;
use super::expressions::{Expr, ResolveContext};
use super::lookups::Q;
use super::materialize::{ScanColumn, ScanNode, ScanPlan};
use super::walker::{walk, PathNode};
use crate::fields::FieldDef;
use crate::registry::{ModelMeta, Registry};
use crate::value::Value;

/// The type of database backend, used by the compiler to generate
/// backend-specific SQL syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseBackendType {
    /// PostgreSQL (uses `$1, $2, ...` placeholders).
    PostgreSQL,
    /// SQLite (uses `?` placeholders).
    SQLite,
    /// MySQL (uses `?` placeholders).
    MySQL,
}

/// A compiled statement: SQL text plus bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    /// The SQL text.
    pub sql: String,
    /// The parameters, in placeholder order.
    pub params: Vec<Value>,
}

impl CompiledQuery {
    /// Creates a compiled statement.
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Rewrites `?` placeholders into the backend's style.
    ///
    /// Question marks inside quoted strings or identifiers are left alone.
    #[must_use]
    pub fn finish(self, backend: DatabaseBackendType) -> Self {
        if backend != DatabaseBackendType::PostgreSQL {
            return self;
        }
        let mut sql = String::with_capacity(self.sql.len() + 8);
        let mut n = 0;
        let mut quote: Option<char> = None;
        for c in self.sql.chars() {
            match (quote, c) {
                (None, '\'' | '"') => {
                    quote = Some(c);
                    sql.push(c);
                }
                (Some(q), c) if c == q => {
                    quote = None;
                    sql.push(c);
                }
                (None, '?') => {
                    n += 1;
                    let _ = write!(sql, "${n}");
                }
                _ => sql.push(c),
            }
        }
        Self {
            sql,
            params: self.params,
        }
    }
}

/// Quotes an identifier.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_ref(alias: &str, column: &str) -> String {
    format!("{}.{}", quote(alias), quote(column))
}

/// SQL JOIN types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    /// INNER JOIN.
    Inner,
    /// LEFT OUTER JOIN.
    Left,
}

impl JoinType {
    /// Returns the SQL keyword for this join type.
    pub const fn sql_keyword(&self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
        }
    }
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// The type of join.
    pub join_type: JoinType,
    /// The table to join.
    pub table: String,
    /// The alias of the joined table.
    pub alias: String,
    /// The rendered ON condition.
    pub on: String,
}

impl Join {
    fn render(&self) -> String {
        format!(
            " {} {} AS {} ON {}",
            self.join_type.sql_keyword(),
            quote(&self.table),
            quote(&self.alias),
            self.on
        )
    }
}

/// Restricts a query to the rows linked to one parent through a through
/// model.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ThroughScope {
    pub(crate) table: String,
    /// The through column pointing at the parent.
    pub(crate) source_column: String,
    /// The through column pointing at the queried model.
    pub(crate) target_column: String,
    pub(crate) value: Value,
}

/// The accumulated state of a query chain.
#[derive(Debug, Clone, Default)]
pub(crate) struct QueryState {
    pub(crate) select: Vec<String>,
    pub(crate) filters: Vec<Q>,
    pub(crate) order_by: Vec<String>,
    pub(crate) group_by: Vec<String>,
    pub(crate) annotations: Vec<(String, Expr)>,
    pub(crate) limit: Option<u64>,
    pub(crate) offset: Option<u64>,
    pub(crate) distinct: bool,
    pub(crate) scope: Option<ThroughScope>,
    pub(crate) error: Option<QuarryError>,
    pub(crate) explicit_save: bool,
}

impl QueryState {
    pub(crate) fn annotation(&self, name: &str) -> Option<&Expr> {
        self.annotations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e)
    }

    fn is_aggregate_annotation(&self, name: &str, depth: usize) -> bool {
        if depth > self.annotations.len() {
            return false;
        }
        self.annotation(name).is_some_and(|e| {
            e.contains_aggregate()
                || e
                    .paths()
                    .iter()
                    .any(|p| self.is_aggregate_annotation(p, depth + 1))
        })
    }

    fn is_aggregate_filter(&self, q: &Q) -> bool {
        q.contains_aggregate() || q.paths().iter().any(|p| self.is_aggregate_annotation(p, 0))
    }

    fn has_aggregate_annotations(&self) -> bool {
        self.annotations
            .iter()
            .any(|(n, _)| self.is_aggregate_annotation(n, 0))
    }
}

/// The rendered WHERE and HAVING conditions of a query.
#[derive(Default)]
struct Conditions {
    wheres: Vec<String>,
    where_params: Vec<Value>,
    havings: Vec<String>,
    having_params: Vec<Value>,
}

/// Compiles one statement from a query state.
pub(crate) struct QueryCompiler<'a> {
    registry: &'a Registry,
    root: Arc<ModelMeta>,
    state: &'a QueryState,
    backend: DatabaseBackendType,
    aliases: AliasGenerator,
    joins: Vec<Join>,
    to_many: bool,
    resolving: Vec<String>,
    cap_rows: Option<u64>,
}

impl ResolveContext for QueryCompiler<'_> {
    fn backend(&self) -> DatabaseBackendType {
        self.backend
    }

    fn resolve_path(&mut self, path: &str, params: &mut Vec<Value>) -> QuarryResult<String> {
        let state = self.state;
        if let Some(expr) = state.annotation(path) {
            if self.resolving.iter().any(|r| r == path) {
                return Err(QuarryError::ConfigurationError(format!(
                    "annotation {path} refers to itself"
                )));
            }
            self.resolving.push(path.to_string());
            let sql = expr.to_sql(self, params);
            self.resolving.pop();
            return Ok(format!("({})", sql?));
        }
        self.column_for(path)
    }
}

impl<'a> QueryCompiler<'a> {
    pub(crate) fn new(
        registry: &'a Registry,
        root: Arc<ModelMeta>,
        state: &'a QueryState,
        backend: DatabaseBackendType,
    ) -> Self {
        Self {
            registry,
            root,
            state,
            backend,
            aliases: AliasGenerator::new(),
            joins: Vec::new(),
            to_many: false,
            resolving: Vec::new(),
            cap_rows: None,
        }
    }

    /// Caps the number of rows a select returns, unless a to-many join
    /// makes row counts differ from object counts.
    pub(crate) const fn cap_rows(mut self, n: u64) -> Self {
        self.cap_rows = Some(n);
        self
    }

    fn root_ref(&self) -> String {
        quote(self.root.table())
    }

    /// The root table followed by every join emitted so far.
    pub(crate) fn from_tables(&self) -> String {
        let mut sql = self.root_ref();
        for join in &self.joins {
            sql.push_str(&join.render());
        }
        sql
    }

    fn from_clause(&self) -> String {
        format!(" FROM {}", self.from_tables())
    }

    /// Renders the column `path` resolves to, joining every hop on the way.
    fn column_for(&mut self, path: &str) -> QuarryResult<String> {
        let chain = walk(self.registry, &self.root, path, false)?;
        let nodes = chain.nodes();
        let Some((last, prefix)) = nodes.split_last() else {
            return Err(QuarryError::UnknownField {
                model: self.root.model_name().to_string(),
                field: path.to_string(),
                valid: self.root.field_names(),
            });
        };
        if let Some(column) = last.field.column() {
            let alias = self.join_path(prefix)?;
            return Ok(column_ref(&alias, column));
        }
        // A relation without a column of its own resolves to the primary
        // key of the joined target.
        let chain = walk(self.registry, &self.root, path, true)?;
        let alias = self.join_path(chain.nodes())?;
        let target = chain
            .target_model()
            .ok_or_else(|| QuarryError::UnknownRelation {
                model: last.model.model_name().to_string(),
                name: last.field.name().to_string(),
            })?;
        Ok(column_ref(&alias, target.pk_column()?))
    }

    /// Joins every hop of `nodes`, returning the alias of the last table.
    fn join_path(&mut self, nodes: &[PathNode]) -> QuarryResult<String> {
        let mut alias = self.root.table().to_string();
        let mut signature = String::new();
        for node in nodes {
            if !signature.is_empty() {
                signature.push('.');
            }
            signature.push_str(node.field.name());
            alias = self.join_hop(node, &alias, &signature)?;
        }
        Ok(alias)
    }

    /// Emits the join(s) for one relation hop starting at `src`.
    fn join_hop(&mut self, node: &PathNode, src: &str, signature: &str) -> QuarryResult<String> {
        let unresolved = || QuarryError::UnknownRelation {
            model: node.model.model_name().to_string(),
            name: node.field.name().to_string(),
        };
        let relation = node.relation.as_ref().ok_or_else(unresolved)?;
        let target = node.target.as_ref().ok_or_else(unresolved)?;
        if relation.relation_type().is_to_many() {
            self.to_many = true;
        }
        if let Some(alias) = self.aliases.get(signature) {
            return Ok(alias.to_string());
        }

        if let Some(through) = relation.through() {
            let through_meta = self
                .registry
                .meta(through.model())
                .ok_or_else(unresolved)?;
            let fk_column = |name: &str| -> QuarryResult<String> {
                through_meta
                    .field(name)
                    .and_then(FieldDef::column)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        QuarryError::ConfigurationError(format!(
                            "through model {} has no foreign key {name}",
                            through_meta.model_name()
                        ))
                    })
            };
            let source_column = fk_column(through.source_field())?;
            let target_column = fk_column(through.target_field())?;

            let through_alias = self
                .aliases
                .next(through_meta.table(), &format!("{signature}#through"));
            self.joins.push(Join {
                join_type: JoinType::Left,
                table: through_meta.table().to_string(),
                alias: through_alias.clone(),
                on: format!(
                    "{} = {}",
                    column_ref(&through_alias, &source_column),
                    column_ref(src, node.model.pk_column()?)
                ),
            });
            let alias = self.aliases.next(target.table(), signature);
            self.joins.push(Join {
                join_type: JoinType::Left,
                table: target.table().to_string(),
                alias: alias.clone(),
                on: format!(
                    "{} = {}",
                    column_ref(&alias, target.pk_column()?),
                    column_ref(&through_alias, &target_column)
                ),
            });
            return Ok(alias);
        }

        // (column on the target, column on the source)
        let (target_column, source_column) = if relation.is_reverse() {
            let owning = relation.field().unwrap_or_default();
            let fk = target
                .field(owning)
                .and_then(FieldDef::column)
                .ok_or_else(unresolved)?;
            (fk.to_string(), node.model.pk_column()?.to_string())
        } else {
            let fk = node.field.column().ok_or_else(unresolved)?;
            (target.pk_column()?.to_string(), fk.to_string())
        };
        let alias = self.aliases.next(target.table(), signature);
        self.joins.push(Join {
            join_type: JoinType::Left,
            table: target.table().to_string(),
            alias: alias.clone(),
            on: format!(
                "{} = {}",
                column_ref(&alias, &target_column),
                column_ref(src, &source_column)
            ),
        });
        Ok(alias)
    }

    /// Joins the through scope, returning the condition restricting rows to
    /// the parent.
    fn apply_scope(&mut self, params: &mut Vec<Value>) -> QuarryResult<Option<String>> {
        let Some(scope) = &self.state.scope else {
            return Ok(None);
        };
        let alias = self.aliases.next(&scope.table, "#scope");
        self.joins.push(Join {
            join_type: JoinType::Inner,
            table: scope.table.clone(),
            alias: alias.clone(),
            on: format!(
                "{} = {}",
                column_ref(&alias, &scope.target_column),
                column_ref(self.root.table(), self.root.pk_column()?)
            ),
        });
        params.push(scope.value.clone());
        Ok(Some(format!("{} = ?", column_ref(&alias, &scope.source_column))))
    }

    fn conditions(&mut self) -> QuarryResult<Conditions> {
        let mut out = Conditions::default();
        if let Some(scope) = self.apply_scope(&mut out.where_params)? {
            out.wheres.push(scope);
        }
        self.push_filters(&mut out)?;
        Ok(out)
    }

    /// Renders every filter, routing those over aggregates to HAVING.
    fn push_filters(&mut self, out: &mut Conditions) -> QuarryResult<()> {
        let state = self.state;
        for q in &state.filters {
            if state.is_aggregate_filter(q) {
                let sql = q.to_sql(self, &mut out.having_params)?;
                out.havings.push(sql);
            } else {
                let sql = q.to_sql(self, &mut out.where_params)?;
                out.wheres.push(sql);
            }
        }
        Ok(())
    }

    fn order_clause(&mut self, params: &mut Vec<Value>) -> QuarryResult<String> {
        let state = self.state;
        let mut parts = Vec::with_capacity(state.order_by.len());
        for entry in &state.order_by {
            let (path, dir) = entry
                .strip_prefix('-')
                .map_or((entry.as_str(), "ASC"), |p| (p, "DESC"));
            let sql = self.resolve_path(path, params)?;
            parts.push(format!("{sql} {dir}"));
        }
        if parts.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!(" ORDER BY {}", parts.join(", ")))
        }
    }

    fn limit_clause(&self) -> String {
        let cap = if self.to_many { None } else { self.cap_rows };
        let limit = match (self.state.limit, cap) {
            (Some(l), Some(c)) => Some(l.min(c)),
            (l, c) => l.or(c),
        };
        match (limit, self.state.offset) {
            (Some(l), Some(o)) => format!(" LIMIT {l} OFFSET {o}"),
            (Some(l), None) => format!(" LIMIT {l}"),
            (None, Some(o)) => match self.backend {
                DatabaseBackendType::SQLite => format!(" LIMIT -1 OFFSET {o}"),
                DatabaseBackendType::MySQL => format!(" LIMIT {} OFFSET {o}", u64::MAX),
                DatabaseBackendType::PostgreSQL => format!(" OFFSET {o}"),
            },
            (None, None) => String::new(),
        }
    }

    /// Adds every scan node of a traversed path, returning the index of the
    /// last one.
    fn scan_nodes(&mut self, plan: &mut ScanPlan, nodes: &[PathNode]) -> QuarryResult<usize> {
        let mut parent = 0;
        let mut signature = String::new();
        for node in nodes {
            if !signature.is_empty() {
                signature.push('.');
            }
            signature.push_str(node.field.name());
            if let Some(idx) = plan.nodes.iter().position(|n| n.path == signature) {
                parent = idx;
                continue;
            }
            let src = plan.nodes[parent].alias.clone();
            let alias = self.join_hop(node, &src, &signature)?;
            let meta = node.target.clone().ok_or_else(|| QuarryError::UnknownRelation {
                model: node.model.model_name().to_string(),
                name: node.field.name().to_string(),
            })?;
            plan.nodes.push(ScanNode {
                path: signature.clone(),
                meta,
                parent: Some(parent),
                slot: Some(node.field.name().to_string()),
                alias,
            });
            parent = plan.nodes.len() - 1;
        }
        Ok(parent)
    }

    fn push_column(plan: &mut ScanPlan, node: usize, field: usize, label: String) {
        if !plan.columns.iter().any(|c| c.node == node && c.field == field) {
            plan.columns.push(ScanColumn { node, field, label });
        }
    }

    fn push_all_columns(plan: &mut ScanPlan, node: usize, prefix: &str) {
        let meta = Arc::clone(&plan.nodes[node].meta);
        for (idx, field) in meta.fields().iter().enumerate() {
            if field.is_concrete() {
                let label = if prefix.is_empty() {
                    field.name().to_string()
                } else {
                    format!("{prefix}.{}", field.name())
                };
                Self::push_column(plan, node, idx, label);
            }
        }
    }

    fn plan_entry(&mut self, plan: &mut ScanPlan, entry: &str) -> QuarryResult<()> {
        if entry == "*" {
            Self::push_all_columns(plan, 0, "");
            return Ok(());
        }
        if self.state.annotation(entry).is_some() {
            return Ok(());
        }
        if let Some(prefix) = entry.strip_suffix(".*") {
            let chain = walk(self.registry, &self.root, prefix, true)?;
            let node = self.scan_nodes(plan, chain.nodes())?;
            if node == 0 {
                return Err(QuarryError::UnknownRelation {
                    model: self.root.model_name().to_string(),
                    name: prefix.to_string(),
                });
            }
            Self::push_all_columns(plan, node, prefix);
            return Ok(());
        }
        let chain = walk(self.registry, &self.root, entry, false)?;
        let Some((last, prefix)) = chain.nodes().split_last() else {
            return Ok(());
        };
        if last.field.column().is_none() {
            return self.plan_entry(plan, &format!("{entry}.*"));
        }
        let node = self.scan_nodes(plan, prefix)?;
        let meta = Arc::clone(&plan.nodes[node].meta);
        if let Some(idx) = meta.fields().iter().position(|f| f.name() == last.field.name()) {
            Self::push_column(plan, node, idx, entry.to_string());
        }
        Ok(())
    }

    /// Builds the scan plan and the SELECT list.
    fn plan(&mut self, values: bool, params: &mut Vec<Value>) -> QuarryResult<(ScanPlan, Vec<String>)> {
        let mut plan = ScanPlan::new(Arc::clone(&self.root));
        let state = self.state;
        if state.select.is_empty() {
            self.plan_entry(&mut plan, "*")?;
        } else {
            for entry in &state.select {
                self.plan_entry(&mut plan, entry)?;
            }
        }

        if !values {
            for node in 0..plan.nodes.len() {
                let meta = Arc::clone(&plan.nodes[node].meta);
                if let Some(idx) = meta.fields().iter().position(FieldDef::is_primary_key) {
                    let label = meta.fields()[idx].name().to_string();
                    Self::push_column(&mut plan, node, idx, label);
                }
            }
        }

        let mut select = Vec::with_capacity(plan.columns.len() + state.annotations.len());
        for col in &plan.columns {
            let node = &plan.nodes[col.node];
            let field = &node.meta.fields()[col.field];
            let column = field.column().unwrap_or_default();
            let mut sql = column_ref(&node.alias, column);
            if values {
                let _ = write!(sql, " AS {}", quote(&col.label));
            }
            select.push(sql);
        }
        for (name, _) in &state.annotations {
            let sql = self.resolve_path(name, params)?;
            select.push(format!("{sql} AS {}", quote(name)));
            plan.annotations.push(name.clone());
        }
        Ok((plan, select))
    }

    fn select_body(&mut self, values: bool) -> QuarryResult<(String, Vec<Value>, ScanPlan)> {
        let mut cond = Conditions::default();
        // The scope join comes first so that its alias does not depend on
        // the select list.
        if let Some(scope) = self.apply_scope(&mut cond.where_params)? {
            cond.wheres.push(scope);
        }
        let mut select_params = Vec::new();
        let (mut plan, select) = self.plan(values, &mut select_params)?;
        self.push_filters(&mut cond)?;

        let state = self.state;
        let mut group_params = Vec::new();
        let mut group = Vec::new();
        for path in &state.group_by {
            group.push(self.resolve_path(path, &mut group_params)?);
        }
        if group.is_empty() && state.has_aggregate_annotations() {
            let implicit: Vec<String> = plan
                .columns
                .iter()
                .map(|c| {
                    let node = &plan.nodes[c.node];
                    column_ref(&node.alias, node.meta.fields()[c.field].column().unwrap_or_default())
                })
                .collect();
            group = implicit;
        }

        let mut order_params = Vec::new();
        let order = self.order_clause(&mut order_params)?;

        let mut sql = String::from("SELECT ");
        if state.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&select.join(", "));
        sql.push_str(&self.from_clause());
        if !cond.wheres.is_empty() {
            let _ = write!(sql, " WHERE {}", cond.wheres.join(" AND "));
        }
        if !group.is_empty() {
            let _ = write!(sql, " GROUP BY {}", group.join(", "));
        }
        if !cond.havings.is_empty() {
            let _ = write!(sql, " HAVING {}", cond.havings.join(" AND "));
        }
        sql.push_str(&order);
        sql.push_str(&self.limit_clause());

        let mut params = select_params;
        params.extend(cond.where_params);
        params.extend(group_params);
        params.extend(cond.having_params);
        params.extend(order_params);

        plan.dedupe = self.to_many;
        Ok((sql, params, plan))
    }

    /// Compiles a SELECT returning objects (`values == false`) or labelled
    /// columns (`values == true`).
    pub(crate) fn compile_select(mut self, values: bool) -> QuarryResult<(CompiledQuery, ScanPlan)> {
        let (sql, params, plan) = self.select_body(values)?;
        Ok((CompiledQuery::new(sql, params), plan))
    }

    fn needs_wrap(&self) -> bool {
        let state = self.state;
        state.distinct
            || !state.group_by.is_empty()
            || state.has_aggregate_annotations()
            || state.limit.is_some()
            || state.offset.is_some()
    }

    /// Compiles `SELECT COUNT(*)` over the query.
    pub(crate) fn compile_count(mut self) -> QuarryResult<CompiledQuery> {
        if self.needs_wrap() {
            let (inner, params, _) = self.select_body(false)?;
            return Ok(CompiledQuery::new(
                format!("SELECT COUNT(*) FROM ({inner}) AS \"subquery\""),
                params,
            ));
        }
        let cond = self.conditions()?;
        let count = if self.to_many {
            format!(
                "COUNT(DISTINCT {})",
                column_ref(self.root.table(), self.root.pk_column()?)
            )
        } else {
            "COUNT(*)".to_string()
        };
        let mut sql = format!("SELECT {count}{}", self.from_clause());
        if !cond.wheres.is_empty() {
            let _ = write!(sql, " WHERE {}", cond.wheres.join(" AND "));
        }
        Ok(CompiledQuery::new(sql, cond.where_params))
    }

    /// Compiles a statement returning one row if any row matches.
    pub(crate) fn compile_exists(mut self) -> QuarryResult<CompiledQuery> {
        if self.needs_wrap() {
            let (inner, params, _) = self.select_body(false)?;
            return Ok(CompiledQuery::new(
                format!("SELECT 1 FROM ({inner}) AS \"subquery\" LIMIT 1"),
                params,
            ));
        }
        let cond = self.conditions()?;
        let mut sql = format!("SELECT 1{}", self.from_clause());
        if !cond.wheres.is_empty() {
            let _ = write!(sql, " WHERE {}", cond.wheres.join(" AND "));
        }
        sql.push_str(" LIMIT 1");
        Ok(CompiledQuery::new(sql, cond.where_params))
    }

    /// Compiles `SELECT agg AS name, ...` over the filtered rows.
    pub(crate) fn compile_aggregate(mut self, aggregates: &[(String, Expr)]) -> QuarryResult<CompiledQuery> {
        if aggregates.is_empty() {
            return Err(QuarryError::ConfigurationError(
                "aggregate needs at least one expression".to_string(),
            ));
        }
        if self.needs_wrap() {
            return Err(QuarryError::NotImplemented(
                "aggregate over a grouped, distinct or sliced query".to_string(),
            ));
        }
        let mut select_params = Vec::new();
        let mut select = Vec::with_capacity(aggregates.len());
        for (name, expr) in aggregates {
            let sql = expr.to_sql(&mut self, &mut select_params)?;
            select.push(format!("{sql} AS {}", quote(name)));
        }
        let cond = self.conditions()?;
        if !cond.havings.is_empty() {
            return Err(QuarryError::NotImplemented(
                "aggregate over a query filtered on aggregates".to_string(),
            ));
        }
        let mut sql = format!("SELECT {}{}", select.join(", "), self.from_clause());
        if !cond.wheres.is_empty() {
            let _ = write!(sql, " WHERE {}", cond.wheres.join(" AND "));
        }
        select_params.extend(cond.where_params);
        Ok(CompiledQuery::new(sql, select_params))
    }

    /// Renders the WHERE clause of a single-table write. Filters crossing
    /// relations are rewritten to `pk IN (SELECT pk ...)`.
    fn write_filter(&mut self) -> QuarryResult<(String, Vec<Value>)> {
        let cond = self.conditions()?;
        if !cond.havings.is_empty() {
            return Err(QuarryError::NotImplemented(
                "update or delete filtered on aggregates".to_string(),
            ));
        }
        let sliced = self.state.limit.is_some() || self.state.offset.is_some();
        if self.joins.is_empty() && !sliced {
            if cond.wheres.is_empty() {
                return Ok((String::new(), Vec::new()));
            }
            return Ok((format!(" WHERE {}", cond.wheres.join(" AND ")), cond.where_params));
        }
        let pk = column_ref(self.root.table(), self.root.pk_column()?);
        let mut inner = format!("SELECT {pk}{}", self.from_clause());
        if !cond.wheres.is_empty() {
            let _ = write!(inner, " WHERE {}", cond.wheres.join(" AND "));
        }
        inner.push_str(&self.limit_clause());
        Ok((format!(" WHERE {pk} IN ({inner})"), cond.where_params))
    }

    /// Compiles `UPDATE table SET ...` over the filtered rows.
    pub(crate) fn compile_update(mut self, assignments: &[(String, Expr)]) -> QuarryResult<CompiledQuery> {
        if assignments.is_empty() {
            return Err(QuarryError::ConfigurationError(
                "update needs at least one field".to_string(),
            ));
        }
        let root = Arc::clone(&self.root);
        let mut params = Vec::new();
        let mut sets = Vec::with_capacity(assignments.len());
        for (name, expr) in assignments {
            let field = root
                .field(name)
                .filter(|f| f.is_concrete() && !f.is_reverse_slot())
                .ok_or_else(|| QuarryError::UnknownField {
                    model: root.model_name().to_string(),
                    field: name.clone(),
                    valid: root.concrete_fields().map(|f| f.name().to_string()).collect(),
                })?;
            if !field.is_editable() {
                return Err(QuarryError::ConfigurationError(format!(
                    "field {}.{name} is read-only",
                    root.model_name()
                )));
            }
            let sql = expr.to_sql(&mut self, &mut params)?;
            sets.push(format!("{} = {sql}", quote(field.column().unwrap_or_default())));
        }
        if !self.joins.is_empty() {
            return Err(QuarryError::NotImplemented(
                "update values referring to related models".to_string(),
            ));
        }
        let (filter, filter_params) = self.write_filter()?;
        params.extend(filter_params);
        Ok(CompiledQuery::new(
            format!("UPDATE {} SET {}{filter}", quote(root.table()), sets.join(", ")),
            params,
        ))
    }

    /// Compiles `DELETE FROM table` over the filtered rows.
    pub(crate) fn compile_delete(mut self) -> QuarryResult<CompiledQuery> {
        let (filter, params) = self.write_filter()?;
        Ok(CompiledQuery::new(
            format!("DELETE FROM {}{filter}", quote(self.root.table())),
            params,
        ))
    }
}

fn returning_clause(meta: &ModelMeta) -> String {
    let columns: Vec<String> = meta
        .concrete_fields()
        .map(|f| quote(f.column().unwrap_or_default()))
        .collect();
    format!(" RETURNING {}", columns.join(", "))
}

/// Compiles a multi-row INSERT of `fields`.
pub(crate) fn compile_insert(meta: &ModelMeta, fields: &[&FieldDef], rows: Vec<Vec<Value>>, returning: bool) -> CompiledQuery {
    let mut sql = format!("INSERT INTO {}", quote(meta.table()));
    let mut params = Vec::with_capacity(fields.len() * rows.len());
    if fields.is_empty() {
        sql.push_str(" DEFAULT VALUES");
    } else {
        let columns: Vec<String> = fields
            .iter()
            .map(|f| quote(f.column().unwrap_or_default()))
            .collect();
        let row_sql = format!("({})", vec!["?"; fields.len()].join(", "));
        let _ = write!(
            sql,
            " ({}) VALUES {}",
            columns.join(", "),
            vec![row_sql; rows.len()].join(", ")
        );
        params.extend(rows.into_iter().flatten());
    }
    if returning {
        sql.push_str(&returning_clause(meta));
    }
    CompiledQuery::new(sql, params)
}

/// Compiles an UPDATE of one object identified by its primary key.
pub(crate) fn compile_update_object(
    meta: &ModelMeta,
    fields: &[&FieldDef],
    mut values: Vec<Value>,
    pk: Value,
    returning: bool,
) -> QuarryResult<CompiledQuery> {
    let sets: Vec<String> = fields
        .iter()
        .map(|f| format!("{} = ?", quote(f.column().unwrap_or_default())))
        .collect();
    let mut sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote(meta.table()),
        sets.join(", "),
        quote(meta.pk_column()?)
    );
    if returning {
        sql.push_str(&returning_clause(meta));
    }
    values.push(pk);
    Ok(CompiledQuery::new(sql, values))
}
