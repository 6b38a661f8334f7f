//! Core expression types.
//!
//! An [`Expr`] is a tree over column references, literal values, raw SQL,
//! function calls, aggregates, CASE expressions, binary operators and
//! subqueries. It is rendered by [`Expr::to_sql`] against a
//! [`ResolveContext`], which binds each column path to the alias of the join
//! that reaches it. The same tree rendered in two different join contexts
//! keeps its shape but may use different aliases.
//!
//! Values always become bound parameters; only identifiers end up in the
//! SQL text.
//!
//! # Examples
//!
//! ```
//! use quarry_db::query::expressions::{Expr, When};
//! use quarry_db::query::lookups::{Lookup, Q};
//!
//! // Price * 1.1
//! let expr = Expr::col("Price") * Expr::value(1.1);
//!
//! // COUNT("ID")
//! let count = Expr::count("ID");
//!
//! // CASE WHEN Done THEN 'closed' ELSE 'open' END
//! let state = Expr::case(
//!     vec![When::new(Q::filter("Done", Lookup::Exact(true.into())), Expr::value("closed"))],
//!     Some(Expr::value("open")),
//! );
//! ```

use std::ops;

use quarry_core::QuarryResult;

use super::subquery::{CompileSubquery, Subquery};
use crate::query::compiler::DatabaseBackendType;
use crate::query::lookups::Q;
use crate::value::Value;

/// Binds column paths while an expression is rendered.
pub trait ResolveContext {
    /// The backend SQL is generated for.
    fn backend(&self) -> DatabaseBackendType;

    /// Renders the column or annotation named by `path`, allocating joins
    /// as needed.
    fn resolve_path(&mut self, path: &str, params: &mut Vec<Value>) -> QuarryResult<String>;
}

/// A binary operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// `AND`
    And,
    /// `OR`
    Or,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `IN`
    In,
}

impl Op {
    /// The SQL spelling of the operator.
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::In => "IN",
        }
    }
}

/// Aggregate function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunc {
    /// COUNT.
    Count,
    /// SUM.
    Sum,
    /// AVG.
    Avg,
    /// MIN.
    Min,
    /// MAX.
    Max,
}

impl AggregateFunc {
    /// Returns the SQL function name for this aggregate.
    pub const fn sql_name(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

/// A single WHEN/THEN branch in a CASE expression.
#[derive(Debug, Clone, PartialEq)]
pub struct When {
    /// The condition for this branch.
    pub condition: Q,
    /// The value to return when the condition is met.
    pub then: Expr,
}

impl When {
    /// Creates a branch.
    pub fn new(condition: impl Into<Q>, then: Expr) -> Self {
        Self {
            condition: condition.into(),
            then,
        }
    }
}

/// A query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A column or annotation referenced by dotted path.
    Col(String),
    /// A literal value, always bound as a parameter.
    Value(Value),
    /// Raw SQL with its parameters.
    Raw {
        /// The SQL fragment, with `?` placeholders.
        sql: String,
        /// The parameters of the fragment.
        params: Vec<Value>,
    },
    /// A database function call.
    Func {
        /// Function name (e.g., "COALESCE", "UPPER").
        name: String,
        /// Function arguments.
        args: Vec<Expr>,
    },
    /// An aggregate function. `arg` is `None` for `COUNT(*)`.
    Aggregate {
        /// The aggregate operation.
        func: AggregateFunc,
        /// The expression being aggregated.
        arg: Option<Box<Expr>>,
        /// Whether to apply DISTINCT.
        distinct: bool,
    },
    /// A CASE expression. Branches are evaluated in declaration order.
    Case {
        /// The WHEN/THEN branches.
        whens: Vec<When>,
        /// The ELSE value.
        default: Option<Box<Expr>>,
    },
    /// A binary operation.
    Logical {
        /// The operator.
        op: Op,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Logical negation.
    Not(Box<Expr>),
    /// A nested query.
    Subquery(Subquery),
}

impl Expr {
    /// Creates a column reference.
    pub fn col(path: impl Into<String>) -> Self {
        Self::Col(path.into())
    }

    /// Creates a literal value.
    pub fn value(v: impl Into<Value>) -> Self {
        Self::Value(v.into())
    }

    /// Creates a raw SQL fragment.
    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::Raw {
            sql: sql.into(),
            params,
        }
    }

    /// Creates a function call.
    pub fn func(name: impl Into<String>, args: Vec<Self>) -> Self {
        Self::Func {
            name: name.into(),
            args,
        }
    }

    /// Creates an aggregate over `arg`.
    pub fn aggregate(func: AggregateFunc, arg: Self) -> Self {
        Self::Aggregate {
            func,
            arg: Some(Box::new(arg)),
            distinct: false,
        }
    }

    /// `COUNT(*)`.
    pub const fn count_all() -> Self {
        Self::Aggregate {
            func: AggregateFunc::Count,
            arg: None,
            distinct: false,
        }
    }

    /// `COUNT(path)`.
    pub fn count(path: impl Into<String>) -> Self {
        Self::aggregate(AggregateFunc::Count, Self::col(path))
    }

    /// `SUM(path)`.
    pub fn sum(path: impl Into<String>) -> Self {
        Self::aggregate(AggregateFunc::Sum, Self::col(path))
    }

    /// `AVG(path)`.
    pub fn avg(path: impl Into<String>) -> Self {
        Self::aggregate(AggregateFunc::Avg, Self::col(path))
    }

    /// `MIN(path)`.
    pub fn min(path: impl Into<String>) -> Self {
        Self::aggregate(AggregateFunc::Min, Self::col(path))
    }

    /// `MAX(path)`.
    pub fn max(path: impl Into<String>) -> Self {
        Self::aggregate(AggregateFunc::Max, Self::col(path))
    }

    /// Applies DISTINCT to an aggregate. Other expressions are unchanged.
    #[must_use]
    pub fn distinct(self) -> Self {
        match self {
            Self::Aggregate { func, arg, .. } => Self::Aggregate {
                func,
                arg,
                distinct: true,
            },
            other => other,
        }
    }

    /// Creates a CASE expression.
    pub fn case(whens: Vec<When>, default: Option<Self>) -> Self {
        Self::Case {
            whens,
            default: default.map(Box::new),
        }
    }

    /// Wraps a query as a subquery.
    pub fn subquery(query: impl CompileSubquery + 'static) -> Self {
        Self::Subquery(Subquery::new(query))
    }

    /// Creates a binary operation.
    pub fn logical(op: Op, lhs: Self, rhs: Self) -> Self {
        Self::Logical {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// `self = rhs`
    #[must_use]
    pub fn eq(self, rhs: Self) -> Self {
        Self::logical(Op::Eq, self, rhs)
    }

    /// `self <> rhs`
    #[must_use]
    pub fn ne(self, rhs: Self) -> Self {
        Self::logical(Op::Ne, self, rhs)
    }

    /// `self > rhs`
    #[must_use]
    pub fn gt(self, rhs: Self) -> Self {
        Self::logical(Op::Gt, self, rhs)
    }

    /// `self >= rhs`
    #[must_use]
    pub fn gte(self, rhs: Self) -> Self {
        Self::logical(Op::Gte, self, rhs)
    }

    /// `self < rhs`
    #[must_use]
    pub fn lt(self, rhs: Self) -> Self {
        Self::logical(Op::Lt, self, rhs)
    }

    /// `self <= rhs`
    #[must_use]
    pub fn lte(self, rhs: Self) -> Self {
        Self::logical(Op::Lte, self, rhs)
    }

    /// `self AND rhs`
    #[must_use]
    pub fn and(self, rhs: Self) -> Self {
        Self::logical(Op::And, self, rhs)
    }

    /// `self OR rhs`
    #[must_use]
    pub fn or(self, rhs: Self) -> Self {
        Self::logical(Op::Or, self, rhs)
    }

    /// `self IN rhs`, where `rhs` is a list value or a subquery.
    #[must_use]
    pub fn is_in(self, rhs: Self) -> Self {
        Self::logical(Op::In, self, rhs)
    }

    /// Returns `true` if the tree applies an aggregate function.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Col(_) | Self::Value(_) | Self::Raw { .. } | Self::Subquery(_) => false,
            Self::Func { args, .. } => args.iter().any(Self::contains_aggregate),
            Self::Case { whens, default } => {
                whens
                    .iter()
                    .any(|w| w.condition.contains_aggregate() || w.then.contains_aggregate())
                    || default.as_ref().is_some_and(|d| d.contains_aggregate())
            }
            Self::Logical { lhs, rhs, .. } => lhs.contains_aggregate() || rhs.contains_aggregate(),
            Self::Not(inner) => inner.contains_aggregate(),
        }
    }

    /// Every column path the tree references.
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    pub(crate) fn collect_paths<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::Col(path) => out.push(path),
            Self::Value(_) | Self::Raw { .. } | Self::Subquery(_) => {}
            Self::Func { args, .. } => {
                for arg in args {
                    arg.collect_paths(out);
                }
            }
            Self::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.collect_paths(out);
                }
            }
            Self::Case { whens, default } => {
                for when in whens {
                    out.extend(when.condition.paths());
                    when.then.collect_paths(out);
                }
                if let Some(default) = default {
                    default.collect_paths(out);
                }
            }
            Self::Logical { lhs, rhs, .. } => {
                lhs.collect_paths(out);
                rhs.collect_paths(out);
            }
            Self::Not(inner) => inner.collect_paths(out),
        }
    }

    /// Renders the expression in `ctx`, pushing its parameters in the order
    /// their placeholders appear.
    pub fn to_sql(&self, ctx: &mut dyn ResolveContext, params: &mut Vec<Value>) -> QuarryResult<String> {
        match self {
            Self::Col(path) => ctx.resolve_path(path, params),
            Self::Value(value) => {
                params.push(value.clone());
                Ok("?".to_string())
            }
            Self::Raw { sql, params: raw } => {
                params.extend(raw.iter().cloned());
                Ok(sql.clone())
            }
            Self::Func { name, args } => {
                let parts = args
                    .iter()
                    .map(|a| a.to_sql(ctx, params))
                    .collect::<QuarryResult<Vec<_>>>()?;
                Ok(format!("{name}({})", parts.join(", ")))
            }
            Self::Aggregate { func, arg, distinct } => {
                let inner = match arg {
                    Some(arg) => arg.to_sql(ctx, params)?,
                    None => "*".to_string(),
                };
                let distinct = if *distinct { "DISTINCT " } else { "" };
                Ok(format!("{}({distinct}{inner})", func.sql_name()))
            }
            Self::Case { whens, default } => {
                let mut sql = "CASE".to_string();
                for when in whens {
                    sql.push_str(" WHEN ");
                    sql.push_str(&when.condition.to_sql(ctx, params)?);
                    sql.push_str(" THEN ");
                    sql.push_str(&when.then.to_sql(ctx, params)?);
                }
                if let Some(default) = default {
                    sql.push_str(" ELSE ");
                    sql.push_str(&default.to_sql(ctx, params)?);
                }
                sql.push_str(" END");
                Ok(sql)
            }
            Self::Logical { op: Op::In, lhs, rhs } => {
                let l = lhs.to_sql(ctx, params)?;
                match rhs.as_ref() {
                    Self::Value(Value::List(values)) if values.is_empty() => Ok("1=0".to_string()),
                    Self::Value(Value::List(values)) => {
                        params.extend(values.iter().cloned());
                        Ok(format!("{l} IN ({})", vec!["?"; values.len()].join(", ")))
                    }
                    other => {
                        let r = other.to_sql(ctx, params)?;
                        if r.starts_with('(') {
                            Ok(format!("{l} IN {r}"))
                        } else {
                            Ok(format!("{l} IN ({r})"))
                        }
                    }
                }
            }
            Self::Logical { op, lhs, rhs } => {
                let l = lhs.to_sql(ctx, params)?;
                let r = rhs.to_sql(ctx, params)?;
                Ok(format!("({l} {} {r})", op.sql()))
            }
            Self::Not(inner) => Ok(format!("NOT ({})", inner.to_sql(ctx, params)?)),
            Self::Subquery(sub) => {
                let compiled = sub.compile(ctx.backend())?;
                params.extend(compiled.params);
                Ok(format!("({})", compiled.sql))
            }
        }
    }
}

impl ops::Not for Expr {
    type Output = Self;
    fn not(self) -> Self::Output {
        Self::Not(Box::new(self))
    }
}

impl ops::Add for Expr {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self::logical(Op::Add, self, rhs)
    }
}

impl ops::Sub for Expr {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self::logical(Op::Sub, self, rhs)
    }
}

impl ops::Mul for Expr {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Self::logical(Op::Mul, self, rhs)
    }
}

impl ops::Div for Expr {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        Self::logical(Op::Div, self, rhs)
    }
}
