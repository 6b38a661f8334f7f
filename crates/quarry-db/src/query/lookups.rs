//! Query lookups and Q objects for building complex filters.
//!
//! This module provides the [`Lookup`] enum for field-level comparisons and
//! the [`Q`] enum for combining filters with AND, OR, and NOT operators.
//!
//! A filter path is a dotted field path optionally followed by a lookup
//! suffix: `"Title__icontains"`, `"User.Name__startswith"`, `"User__isnull"`.
//! Without a suffix the lookup is `exact`.
//!
//! # Examples
//!
//! ```
//! use quarry_db::query::lookups::{Lookup, Q};
//! use quarry_db::value::Value;
//!
//! // Simple filter: Name = "Alice"
//! let q = Q::filter("Name", Lookup::Exact(Value::from("Alice")));
//!
//! // Combining with AND: Name = "Alice" AND Age > 25
//! let combined = q & Q::filter("Age", Lookup::Gt(Value::from(25)));
//!
//! // OR: Name = "Alice" OR Name = "Bob"
//! let either = Q::filter("Name", Lookup::Exact(Value::from("Alice")))
//!     | Q::filter("Name", Lookup::Exact(Value::from("Bob")));
//!
//! // NOT: NOT(Done = false)
//! let negated = !Q::filter("Done", Lookup::Exact(Value::from(false)));
//! ```

use std::ops;

use quarry_core::{QuarryError, QuarryResult};

use super::compiler::DatabaseBackendType;
use super::expressions::{Expr, ResolveContext};
use crate::value::Value;

/// The lookup suffixes understood after `__`.
pub const LOOKUP_NAMES: &[&str] = &[
    "exact",
    "iexact",
    "contains",
    "icontains",
    "in",
    "gt",
    "gte",
    "lt",
    "lte",
    "startswith",
    "istartswith",
    "endswith",
    "iendswith",
    "range",
    "isnull",
];

/// A field-level lookup operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Exact match (`field = value`, or `IS NULL` for a null value).
    Exact(Value),
    /// Case-insensitive exact match.
    IExact(Value),
    /// Substring match (`field LIKE '%value%'`).
    Contains(String),
    /// Case-insensitive substring match.
    IContains(String),
    /// Membership test (`field IN (values...)`).
    In(Vec<Value>),
    /// Greater than.
    Gt(Value),
    /// Greater than or equal.
    Gte(Value),
    /// Less than.
    Lt(Value),
    /// Less than or equal.
    Lte(Value),
    /// Prefix match.
    StartsWith(String),
    /// Case-insensitive prefix match.
    IStartsWith(String),
    /// Suffix match.
    EndsWith(String),
    /// Case-insensitive suffix match.
    IEndsWith(String),
    /// Range test (`field BETWEEN low AND high`).
    Range(Value, Value),
    /// NULL test (`field IS NULL` or `field IS NOT NULL`).
    IsNull(bool),
}

fn text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

impl Lookup {
    /// Splits a filter path into its field path and lookup.
    ///
    /// `"Title__icontains"` with `"test"` yields `("Title", IContains("test"))`.
    /// An unknown suffix is an [`QuarryError::UnknownField`] whose `model` is
    /// left empty for the caller to fill in.
    pub fn parse(path: &str, value: Value) -> QuarryResult<(String, Self)> {
        let Some((field, suffix)) = path.rsplit_once("__") else {
            return Ok((path.to_string(), Self::Exact(value)));
        };
        let lookup = match suffix {
            "exact" => Self::Exact(value),
            "iexact" => Self::IExact(value),
            "contains" => Self::Contains(text(value)),
            "icontains" => Self::IContains(text(value)),
            "in" => match value {
                Value::List(values) => Self::In(values),
                other => Self::In(vec![other]),
            },
            "gt" => Self::Gt(value),
            "gte" => Self::Gte(value),
            "lt" => Self::Lt(value),
            "lte" => Self::Lte(value),
            "startswith" => Self::StartsWith(text(value)),
            "istartswith" => Self::IStartsWith(text(value)),
            "endswith" => Self::EndsWith(text(value)),
            "iendswith" => Self::IEndsWith(text(value)),
            "range" => match value {
                Value::List(mut values) if values.len() == 2 => {
                    let high = values.pop().unwrap_or(Value::Null);
                    let low = values.pop().unwrap_or(Value::Null);
                    Self::Range(low, high)
                }
                other => {
                    return Err(QuarryError::type_mismatch("a list of two values", other.kind()).with_field(path))
                }
            },
            "isnull" => match value {
                Value::Bool(b) => Self::IsNull(b),
                Value::Int(i) => Self::IsNull(i != 0),
                other => return Err(QuarryError::type_mismatch("bool", other.kind()).with_field(path)),
            },
            _ => {
                return Err(QuarryError::UnknownField {
                    model: String::new(),
                    field: path.to_string(),
                    valid: LOOKUP_NAMES.iter().map(|s| format!("{field}__{s}")).collect(),
                })
            }
        };
        Ok((field.to_string(), lookup))
    }

    /// Renders the lookup against the SQL fragment `lhs`, pushing its
    /// parameters.
    ///
    /// Pattern lookups escape `%`, `_` and `\` in the user's text so they
    /// match literally.
    pub fn to_sql(&self, lhs: &str, backend: DatabaseBackendType, params: &mut Vec<Value>) -> String {
        let escape = like_escape(backend);
        let like = |params: &mut Vec<Value>, pattern: String| {
            params.push(Value::String(pattern));
            format!("{lhs} LIKE ?{escape}")
        };
        let insensitive = |params: &mut Vec<Value>, pattern: String| {
            params.push(Value::String(pattern));
            match backend {
                DatabaseBackendType::PostgreSQL => format!("{lhs} ILIKE ?{escape}"),
                DatabaseBackendType::SQLite | DatabaseBackendType::MySQL => {
                    format!("LOWER({lhs}) LIKE LOWER(?){escape}")
                }
            }
        };
        let compare = |params: &mut Vec<Value>, op: &str, val: &Value| {
            params.push(val.clone());
            format!("{lhs} {op} ?")
        };

        match self {
            Self::Exact(val) => {
                if val.is_null() {
                    format!("{lhs} IS NULL")
                } else {
                    compare(params, "=", val)
                }
            }
            Self::IExact(val) => match (backend, val) {
                (DatabaseBackendType::PostgreSQL, Value::String(text)) => insensitive(params, escape_like(text)),
                (DatabaseBackendType::PostgreSQL, _) => {
                    params.push(val.clone());
                    format!("{lhs} ILIKE ?")
                }
                (DatabaseBackendType::SQLite | DatabaseBackendType::MySQL, _) => {
                    params.push(val.clone());
                    format!("LOWER({lhs}) = LOWER(?)")
                }
            },
            Self::Contains(val) => like(params, format!("%{}%", escape_like(val))),
            Self::IContains(val) => insensitive(params, format!("%{}%", escape_like(val))),
            Self::In(vals) => {
                if vals.is_empty() {
                    return "1=0".to_string();
                }
                params.extend(vals.iter().cloned());
                let placeholders = vec!["?"; vals.len()].join(", ");
                format!("{lhs} IN ({placeholders})")
            }
            Self::Gt(val) => compare(params, ">", val),
            Self::Gte(val) => compare(params, ">=", val),
            Self::Lt(val) => compare(params, "<", val),
            Self::Lte(val) => compare(params, "<=", val),
            Self::StartsWith(val) => like(params, format!("{}%", escape_like(val))),
            Self::IStartsWith(val) => insensitive(params, format!("{}%", escape_like(val))),
            Self::EndsWith(val) => like(params, format!("%{}", escape_like(val))),
            Self::IEndsWith(val) => insensitive(params, format!("%{}", escape_like(val))),
            Self::Range(low, high) => {
                params.push(low.clone());
                params.push(high.clone());
                format!("{lhs} BETWEEN ? AND ?")
            }
            Self::IsNull(true) => format!("{lhs} IS NULL"),
            Self::IsNull(false) => format!("{lhs} IS NOT NULL"),
        }
    }
}

/// The ESCAPE clause naming `\` as the LIKE escape character. MySQL
/// uses it by default and would read a `'\'` literal as an open string.
const fn like_escape(backend: DatabaseBackendType) -> &'static str {
    match backend {
        DatabaseBackendType::SQLite | DatabaseBackendType::PostgreSQL => r" ESCAPE '\'",
        DatabaseBackendType::MySQL => "",
    }
}

/// Escapes the LIKE wildcards in `text`.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// A composable query filter.
///
/// `Q` objects can be combined using `&` (AND), `|` (OR), and `!` (NOT)
/// operators to build arbitrarily complex WHERE clauses.
#[derive(Debug, Clone, PartialEq)]
pub enum Q {
    /// A single field lookup.
    Filter {
        /// The dotted field path, or an annotation name.
        field: String,
        /// The lookup operation.
        lookup: Lookup,
    },
    /// A boolean expression.
    Expr(Expr),
    /// Logical AND of multiple conditions.
    And(Vec<Q>),
    /// Logical OR of multiple conditions.
    Or(Vec<Q>),
    /// Logical negation of a condition.
    Not(Box<Q>),
}

impl Q {
    /// Creates a new filter Q object.
    pub fn filter(field: impl Into<String>, lookup: Lookup) -> Self {
        Self::Filter {
            field: field.into(),
            lookup,
        }
    }

    /// Parses a suffixed filter path, as [`QuerySet::filter`] does.
    ///
    /// [`QuerySet::filter`]: crate::query::QuerySet::filter
    pub fn parse(path: &str, value: impl Into<Value>) -> QuarryResult<Self> {
        let (field, lookup) = Lookup::parse(path, value.into())?;
        Ok(Self::Filter { field, lookup })
    }

    /// Returns `true` if this is an empty AND or OR.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(children) | Self::Or(children) => children.is_empty(),
            _ => false,
        }
    }

    /// Every field path or annotation name the filter references.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Filter { field, .. } => out.push(field),
            Self::Expr(expr) => expr.collect_paths(out),
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_paths(out);
                }
            }
            Self::Not(inner) => inner.collect_paths(out),
        }
    }

    /// Returns `true` if the filter applies an aggregate function directly.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Filter { .. } => false,
            Self::Expr(expr) => expr.contains_aggregate(),
            Self::And(children) | Self::Or(children) => children.iter().any(Self::contains_aggregate),
            Self::Not(inner) => inner.contains_aggregate(),
        }
    }

    /// Renders the filter in `ctx`, pushing its parameters.
    pub fn to_sql(&self, ctx: &mut dyn ResolveContext, params: &mut Vec<Value>) -> QuarryResult<String> {
        match self {
            Self::Filter { field, lookup } => {
                let lhs = ctx.resolve_path(field, params)?;
                Ok(lookup.to_sql(&lhs, ctx.backend(), params))
            }
            Self::Expr(expr) => expr.to_sql(ctx, params),
            Self::And(children) => join(children, " AND ", "1=1", ctx, params),
            Self::Or(children) => join(children, " OR ", "1=0", ctx, params),
            Self::Not(inner) => Ok(format!("NOT ({})", inner.to_sql(ctx, params)?)),
        }
    }
}

fn join(
    children: &[Q],
    sep: &str,
    empty: &str,
    ctx: &mut dyn ResolveContext,
    params: &mut Vec<Value>,
) -> QuarryResult<String> {
    match children {
        [] => Ok(empty.to_string()),
        [only] => only.to_sql(ctx, params),
        _ => {
            let parts = children
                .iter()
                .map(|c| c.to_sql(ctx, params))
                .collect::<QuarryResult<Vec<_>>>()?;
            Ok(format!("({})", parts.join(sep)))
        }
    }
}

impl ops::BitAnd for Q {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            // Flatten nested ANDs
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (other, Self::And(mut right)) => {
                right.insert(0, other);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }
}

impl ops::BitOr for Q {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            // Flatten nested ORs
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (other, Self::Or(mut right)) => {
                right.insert(0, other);
                Self::Or(right)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }
}

impl ops::Not for Q {
    type Output = Self;

    fn not(self) -> Self::Output {
        // Double negation cancellation
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}

impl From<Expr> for Q {
    fn from(expr: Expr) -> Self {
        Self::Expr(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Resolves paths to a quoted column of a fixed table.
    struct Plain(DatabaseBackendType);

    impl ResolveContext for Plain {
        fn backend(&self) -> DatabaseBackendType {
            self.0
        }

        fn resolve_path(&mut self, path: &str, _params: &mut Vec<Value>) -> QuarryResult<String> {
            Ok(format!("\"t\".\"{}\"", path.to_lowercase()))
        }
    }

    fn render(q: &Q, backend: DatabaseBackendType) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = q.to_sql(&mut Plain(backend), &mut params).unwrap();
        (sql, params)
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(
            Lookup::parse("Title__icontains", Value::from("test")).unwrap(),
            ("Title".to_string(), Lookup::IContains("test".into()))
        );
        assert_eq!(
            Lookup::parse("User.Name", Value::from("Ann")).unwrap(),
            ("User.Name".to_string(), Lookup::Exact(Value::from("Ann")))
        );
        assert_eq!(
            Lookup::parse("User__isnull", Value::from(true)).unwrap().1,
            Lookup::IsNull(true)
        );
        assert_eq!(
            Lookup::parse("ID__in", Value::List(vec![Value::Int(1), Value::Int(2)]))
                .unwrap()
                .1,
            Lookup::In(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(
            Lookup::parse("ID__range", Value::List(vec![Value::Int(1), Value::Int(5)]))
                .unwrap()
                .1,
            Lookup::Range(Value::Int(1), Value::Int(5))
        );
    }

    #[test]
    fn test_parse_unknown_suffix() {
        let err = Lookup::parse("Title__like", Value::from("x")).unwrap_err();
        match err {
            QuarryError::UnknownField { field, valid, .. } => {
                assert_eq!(field, "Title__like");
                assert!(valid.contains(&"Title__icontains".to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_bad_range() {
        assert!(Lookup::parse("ID__range", Value::Int(1)).is_err());
        assert!(Lookup::parse("User__isnull", Value::from("yes")).is_err());
    }

    #[test]
    fn test_icontains_per_backend() {
        let q = Q::filter("Title", Lookup::IContains("test".into()));
        let (sql, params) = render(&q, DatabaseBackendType::SQLite);
        assert_eq!(sql, r#"LOWER("t"."title") LIKE LOWER(?) ESCAPE '\'"#);
        assert_eq!(params, vec![Value::from("%test%")]);
        let (sql, _) = render(&q, DatabaseBackendType::PostgreSQL);
        assert_eq!(sql, r#""t"."title" ILIKE ? ESCAPE '\'"#);
        let (sql, _) = render(&q, DatabaseBackendType::MySQL);
        assert_eq!(sql, r#"LOWER("t"."title") LIKE LOWER(?)"#);
    }

    #[test]
    fn test_pattern_lookups_match_wildcards_literally() {
        let (sql, params) = render(
            &Q::filter("Title", Lookup::Contains("50%".into())),
            DatabaseBackendType::SQLite,
        );
        assert_eq!(sql, r#""t"."title" LIKE ? ESCAPE '\'"#);
        assert_eq!(params, vec![Value::from(r"%50\%%")]);

        let (_, params) = render(
            &Q::filter("Title", Lookup::IStartsWith(r"a_b\c".into())),
            DatabaseBackendType::SQLite,
        );
        assert_eq!(params, vec![Value::from(r"a\_b\\c%")]);

        let (_, params) = render(
            &Q::filter("Title", Lookup::IExact("10%".into())),
            DatabaseBackendType::PostgreSQL,
        );
        assert_eq!(params, vec![Value::from(r"10\%")]);
        let (_, params) = render(
            &Q::filter("Title", Lookup::IExact("10%".into())),
            DatabaseBackendType::SQLite,
        );
        assert_eq!(params, vec![Value::from("10%")]);
    }

    #[test]
    fn test_exact_null_and_isnull() {
        let (sql, params) = render(&Q::filter("User", Lookup::Exact(Value::Null)), DatabaseBackendType::SQLite);
        assert_eq!(sql, r#""t"."user" IS NULL"#);
        assert!(params.is_empty());
        let (sql, _) = render(&Q::filter("User", Lookup::IsNull(false)), DatabaseBackendType::SQLite);
        assert_eq!(sql, r#""t"."user" IS NOT NULL"#);
    }

    #[test]
    fn test_empty_in_is_false() {
        let (sql, params) = render(&Q::filter("ID", Lookup::In(vec![])), DatabaseBackendType::SQLite);
        assert_eq!(sql, "1=0");
        assert!(params.is_empty());
    }

    #[test]
    fn test_combinators_render() {
        let q = (Q::filter("Done", Lookup::Exact(Value::from(false)))
            | Q::filter("ID", Lookup::Gt(Value::from(3))))
            & !Q::filter("Title", Lookup::StartsWith("x".into()));
        let (sql, params) = render(&q, DatabaseBackendType::SQLite);
        assert_eq!(
            sql,
            r#"(("t"."done" = ? OR "t"."id" > ?) AND NOT ("t"."title" LIKE ? ESCAPE '\'))"#
        );
        assert_eq!(params, vec![Value::Bool(false), Value::Int(3), Value::from("x%")]);
    }

    #[test]
    fn test_empty_groups() {
        assert_eq!(render(&Q::And(vec![]), DatabaseBackendType::SQLite).0, "1=1");
        assert_eq!(render(&Q::Or(vec![]), DatabaseBackendType::SQLite).0, "1=0");
        assert!(Q::And(vec![]).is_empty());
    }

    #[test]
    fn test_and_flattening() {
        let q = Q::filter("A", Lookup::IsNull(true))
            & Q::filter("B", Lookup::IsNull(true))
            & Q::filter("C", Lookup::IsNull(true));
        match &q {
            Q::And(children) => assert_eq!(children.len(), 3),
            _ => panic!("Expected And"),
        }
        assert_eq!(q.paths(), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_double_negation() {
        let q = Q::filter("A", Lookup::IsNull(true));
        assert_eq!(!!q.clone(), q);
    }
}
