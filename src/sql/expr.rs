//! Expression tree for column values.
//!
//! Mutations lower into an [`Expr`]; a single renderer
//! ([`StatementBuilder::write_expr`](super::builder::StatementBuilder::write_expr))
//! walks it to produce SQL text and bound arguments, and the in-memory
//! executor evaluates the same tree. Nothing here knows about `$n` numbering.

use std::fmt;

use super::value::Value;

/// A projection table, optionally schema-qualified (`projections.orgs`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Table {
    schema: Option<String>,
    name: String,
}

impl Table {
    pub fn new(schema: &str, name: &str) -> Self {
        Table {
            schema: (!schema.is_empty()).then(|| schema.to_string()),
            name: name.to_string(),
        }
    }

    /// Unqualified table name, used to qualify column references.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// `schema.name`, or just `name` without a schema.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn column(&self, name: &str) -> Column {
        Column {
            table: self.name.clone(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified())
    }
}

/// A column of a projection table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Column {
    table: String,
    name: String,
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `table.column`, as written inside value expressions.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.name)
    }
}

/// A value expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Current value of a column of the target row.
    Column(Column),
    /// A bound argument, rendered as the next `$n`.
    Arg(Value),
    /// Integer constant embedded in the statement text.
    Const(i64),
    /// Storage engine clock: `NOW()`.
    Now,
    /// `COALESCE(value, fallback)`.
    Coalesce(Box<Expr>, Box<Expr>),
    /// `lhs + rhs`.
    Add(Box<Expr>, Box<Expr>),
    /// `array_cat(lhs, rhs)`.
    ArrayCat(Box<Expr>, Box<Expr>),
    /// `array_remove(array, item)`.
    ArrayRemove(Box<Expr>, Box<Expr>),
    /// `ARRAY(SELECT DISTINCT unnest(array))`. Element order is unspecified.
    DistinctArray(Box<Expr>),
    /// Parenthesized sub-expression.
    Group(Box<Expr>),
    /// `EXCLUDED.column` inside an `ON CONFLICT DO UPDATE`.
    Excluded(String),
}

impl Expr {
    pub fn arg(value: impl Into<Value>) -> Self {
        Expr::Arg(value.into())
    }

    pub fn coalesce(value: Expr, fallback: Expr) -> Self {
        Expr::Coalesce(Box::new(value), Box::new(fallback))
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Expr::Add(Box::new(lhs), Box::new(rhs))
    }

    pub fn array_cat(lhs: Expr, rhs: Expr) -> Self {
        Expr::ArrayCat(Box::new(lhs), Box::new(rhs))
    }

    pub fn array_remove(array: Expr, item: Expr) -> Self {
        Expr::ArrayRemove(Box::new(array), Box::new(item))
    }

    pub fn distinct_array(array: Expr) -> Self {
        Expr::DistinctArray(Box::new(array))
    }

    pub fn group(inner: Expr) -> Self {
        Expr::Group(Box::new(inner))
    }

    /// Number of bound arguments this expression consumes when rendered.
    pub fn arg_count(&self) -> usize {
        match self {
            Expr::Arg(_) => 1,
            Expr::Column(_) | Expr::Const(_) | Expr::Now | Expr::Excluded(_) => 0,
            Expr::Coalesce(a, b)
            | Expr::Add(a, b)
            | Expr::ArrayCat(a, b)
            | Expr::ArrayRemove(a, b) => a.arg_count() + b.arg_count(),
            Expr::DistinctArray(inner) | Expr::Group(inner) => inner.arg_count(),
        }
    }

    /// Bound arguments in left-to-right rendering order.
    pub fn args(&self) -> Vec<&Value> {
        let mut out = Vec::new();
        self.collect_args(&mut out);
        out
    }

    fn collect_args<'a>(&'a self, out: &mut Vec<&'a Value>) {
        match self {
            Expr::Arg(v) => out.push(v),
            Expr::Column(_) | Expr::Const(_) | Expr::Now | Expr::Excluded(_) => {}
            Expr::Coalesce(a, b)
            | Expr::Add(a, b)
            | Expr::ArrayCat(a, b)
            | Expr::ArrayRemove(a, b) => {
                a.collect_args(out);
                b.collect_args(out);
            }
            Expr::DistinctArray(inner) | Expr::Group(inner) => inner.collect_args(out),
        }
    }
}
