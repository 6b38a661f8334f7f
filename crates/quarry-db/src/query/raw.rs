//! Raw SQL with field-path substitution.
//!
//! [`QuerySet::rows`] and [`QuerySet::row`] run hand-written SQL in which a
//! few escapes are expanded against the query's model before execution:
//!
//! - `![Field.Path]` becomes the quoted column the path resolves to, joining
//!   every relation on the way;
//! - `![FROM]` becomes the root table plus every join required by the
//!   `![...]` references of the statement;
//! - `EXPR(name)` becomes the expression of the annotation `name`;
//! - `?[n]` binds the n-th parameter (1-based), a plain `?` binds the next
//!   parameter not yet consumed by a plain `?`.
//!
//! Text inside single quotes is copied unchanged. Values are always bound,
//! never spliced into the statement.

use once_cell::sync::Lazy;
use quarry_core::{QuarryError, QuarryResult};
use regex::Regex;

use super::compiler::{CompiledQuery, DatabaseBackendType};
use super::expressions::ResolveContext;
use super::queryset::QuerySet;
use crate::executor::DbExecutor;
use crate::model::Model;
use crate::value::{Row, Value};

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"'(?:[^']|'')*'|!\[([^\]]+)\]|\?\[(\d+)\]|EXPR\((\w+)\)|\?").expect("valid regex")
});

const FROM_MARKER: &str = "\u{0}FROM\u{0}";

fn param_at(params: &[Value], n: usize) -> QuarryResult<Value> {
    n.checked_sub(1)
        .and_then(|i| params.get(i))
        .cloned()
        .ok_or_else(|| {
            QuarryError::ConfigurationError(format!(
                "raw statement refers to parameter {n} of {}",
                params.len()
            ))
        })
}

impl<M: Model> QuerySet<M> {
    /// Expands the escapes of a raw statement into a statement ready for
    /// `backend`.
    pub fn expand_raw(&self, sql: &str, params: &[Value], backend: DatabaseBackendType) -> QuarryResult<CompiledQuery> {
        Ok(self.expand(sql, params, backend)?.finish(backend))
    }

    fn expand(&self, sql: &str, params: &[Value], backend: DatabaseBackendType) -> QuarryResult<CompiledQuery> {
        let meta = self.meta()?;
        let mut compiler = self.compiler(&meta, backend);
        let mut out = String::with_capacity(sql.len());
        let mut bound = Vec::new();
        let mut sequential = 0;
        let mut last = 0;

        for caps in TOKEN.captures_iter(sql) {
            let Some(whole) = caps.get(0) else { continue };
            out.push_str(&sql[last..whole.start()]);
            last = whole.end();

            if let Some(path) = caps.get(1) {
                if path.as_str() == "FROM" {
                    out.push_str(FROM_MARKER);
                } else {
                    out.push_str(&compiler.resolve_path(path.as_str(), &mut bound)?);
                }
            } else if let Some(n) = caps.get(2) {
                let n: usize = n
                    .as_str()
                    .parse()
                    .map_err(|_| QuarryError::ConfigurationError(format!("bad parameter index {}", n.as_str())))?;
                bound.push(param_at(params, n)?);
                out.push('?');
            } else if let Some(name) = caps.get(3) {
                if self.state.annotation(name.as_str()).is_none() {
                    return Err(QuarryError::UnknownField {
                        model: meta.model_name().to_string(),
                        field: name.as_str().to_string(),
                        valid: self.state.annotations.iter().map(|(n, _)| n.clone()).collect(),
                    });
                }
                out.push_str(&compiler.resolve_path(name.as_str(), &mut bound)?);
            } else if whole.as_str() == "?" {
                sequential += 1;
                bound.push(param_at(params, sequential)?);
                out.push('?');
            } else {
                out.push_str(whole.as_str());
            }
        }
        out.push_str(&sql[last..]);

        let out = out.replace(FROM_MARKER, &compiler.from_tables());
        Ok(CompiledQuery::new(out, bound))
    }

    /// Runs a raw statement and returns its rows.
    pub async fn rows(&self, sql: &str, params: &[Value], db: &dyn DbExecutor) -> QuarryResult<Vec<Row>> {
        let backend = db.backend_type();
        let query = self.record(self.expand(sql, params, backend)?, backend);
        self.run("rows", db.query(&query.sql, &query.params)).await
    }

    /// Runs a raw statement that must return exactly one row.
    pub async fn row(&self, sql: &str, params: &[Value], db: &dyn DbExecutor) -> QuarryResult<Row> {
        let mut rows = self.rows(sql, params, db).await?;
        match rows.len() {
            0 => Err(QuarryError::NotFound(format!("raw statement returned no row: {sql}"))),
            1 => Ok(rows.remove(0)),
            n => Err(QuarryError::MultipleRows(format!("raw statement returned {n} rows: {sql}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::expressions::Expr;
    use crate::registry::Registry;
    use crate::testing::{row, MockDb, Todo};

    fn todos() -> QuerySet<Todo> {
        QuerySet::with_registry(&Registry::new())
    }

    #[test]
    fn test_path_and_from_expansion() {
        let q = todos()
            .expand_raw(
                "SELECT ![Title], ![User.Name] FROM ![FROM] WHERE ![Done] = ? AND ![ID] > ?",
                &[Value::Bool(false), Value::Int(3)],
                DatabaseBackendType::SQLite,
            )
            .unwrap();
        assert_eq!(
            q.sql,
            concat!(
                r#"SELECT "todos"."title", "T_users"."name" FROM "todos""#,
                r#" LEFT JOIN "users" AS "T_users" ON "T_users"."id" = "todos"."user_id""#,
                r#" WHERE "todos"."done" = ? AND "todos"."id" > ?"#
            )
        );
        assert_eq!(q.params, vec![Value::Bool(false), Value::Int(3)]);
    }

    #[test]
    fn test_indexed_parameters_and_quotes() {
        let q = todos()
            .expand_raw(
                "SELECT 'a?b' FROM ![FROM] WHERE ![ID] IN (?[2], ?[1], ?[2])",
                &[Value::Int(1), Value::Int(2)],
                DatabaseBackendType::PostgreSQL,
            )
            .unwrap();
        assert_eq!(
            q.sql,
            r#"SELECT 'a?b' FROM "todos" WHERE "todos"."id" IN ($1, $2, $3)"#
        );
        assert_eq!(q.params, vec![Value::Int(2), Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_annotation_expression() {
        let qs = todos().annotate("shout", Expr::func("UPPER", vec![Expr::col("Title")]));
        let q = qs
            .expand_raw("SELECT EXPR(shout) FROM ![FROM]", &[], DatabaseBackendType::SQLite)
            .unwrap();
        assert_eq!(q.sql, r#"SELECT (UPPER("todos"."title")) FROM "todos""#);

        let err = qs
            .expand_raw("SELECT EXPR(missing) FROM ![FROM]", &[], DatabaseBackendType::SQLite)
            .unwrap_err();
        assert!(matches!(err, QuarryError::UnknownField { .. }));
    }

    #[test]
    fn test_missing_parameter() {
        let err = todos()
            .expand_raw("SELECT 1 WHERE ? = ?", &[Value::Int(1)], DatabaseBackendType::SQLite)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_row_cardinality() {
        let db = MockDb::new(DatabaseBackendType::SQLite).with_responses(vec![
            vec![row(&["n"], vec![1.into()])],
            vec![],
        ]);
        let qs = todos();
        let found = qs.row("SELECT COUNT(*) AS n FROM ![FROM]", &[], &db).await.unwrap();
        assert_eq!(found.get::<i64>("n").unwrap(), 1);
        assert!(qs.row("SELECT 1 FROM ![FROM]", &[], &db).await.unwrap_err().is_not_found());
        assert_eq!(qs.latest_query().unwrap().sql, r#"SELECT 1 FROM "todos""#);
    }
}
