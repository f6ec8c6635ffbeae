//! Column mutation algebra.
//!
//! A [`Mutation`] describes how one column's new value is computed. It is
//! pure data: constructing one cannot fail and has no side effects. It only
//! becomes SQL text and arguments when a statement is assembled.

use super::expr::{Column, Expr};
use super::value::Value;

/// How a column's new value is computed.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    /// `col = $n`
    Set(Value),
    /// `col = NOW()`
    Now,
    /// `col = COALESCE(tbl.col, $n)`
    CoalesceDefault(Value),
    /// `col = COALESCE(tbl.col, $n) + delta`, delta embedded as a constant.
    Increment { default: Value, delta: i64 },
    /// Distinct union of the current array and the given items.
    ArrayAppend(Vec<String>),
    /// Remove every occurrence of one item.
    ArrayRemove(String),
    /// Unconditional replacement of the whole array.
    ArrayReplace(Vec<String>),
}

/// One column assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    column: Column,
    kind: MutationKind,
}

impl Mutation {
    pub fn set(column: Column, value: impl Into<Value>) -> Self {
        Mutation {
            column,
            kind: MutationKind::Set(value.into()),
        }
    }

    pub fn now(column: Column) -> Self {
        Mutation {
            column,
            kind: MutationKind::Now,
        }
    }

    pub fn coalesce_default(column: Column, default: impl Into<Value>) -> Self {
        Mutation {
            column,
            kind: MutationKind::CoalesceDefault(default.into()),
        }
    }

    pub fn increment(column: Column, default: impl Into<Value>, delta: i64) -> Self {
        Mutation {
            column,
            kind: MutationKind::Increment {
                default: default.into(),
                delta,
            },
        }
    }

    pub fn array_append(column: Column, items: Vec<String>) -> Self {
        Mutation {
            column,
            kind: MutationKind::ArrayAppend(items),
        }
    }

    pub fn array_remove(column: Column, item: impl Into<String>) -> Self {
        Mutation {
            column,
            kind: MutationKind::ArrayRemove(item.into()),
        }
    }

    pub fn array_replace(column: Column, items: Vec<String>) -> Self {
        Mutation {
            column,
            kind: MutationKind::ArrayReplace(items),
        }
    }

    pub fn column(&self) -> &Column {
        &self.column
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    /// Lower into the expression tree assigned to the column.
    pub fn to_expr(&self) -> Expr {
        let current = || Expr::Column(self.column.clone());
        match &self.kind {
            MutationKind::Set(v) => Expr::Arg(v.clone()),
            MutationKind::Now => Expr::Now,
            MutationKind::CoalesceDefault(d) => Expr::coalesce(current(), Expr::Arg(d.clone())),
            MutationKind::Increment { default, delta } => Expr::add(
                Expr::coalesce(current(), Expr::Arg(default.clone())),
                Expr::Const(*delta),
            ),
            MutationKind::ArrayAppend(items) => Expr::group(Expr::distinct_array(
                Expr::array_cat(
                    Expr::coalesce(current(), Expr::Arg(Value::empty_array())),
                    Expr::Arg(Value::TextArray(items.clone())),
                ),
            )),
            MutationKind::ArrayRemove(item) => Expr::group(Expr::array_remove(
                current(),
                Expr::Arg(Value::Text(item.clone())),
            )),
            // Wholesale replacement needs no COALESCE or union.
            MutationKind::ArrayReplace(items) => Expr::Arg(Value::TextArray(items.clone())),
        }
    }
}

/// An ordered batch of mutations targeting the same row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changes(Vec<Mutation>);

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, mutation: Mutation) -> Self {
        self.0.push(mutation);
        self
    }

    pub fn extend(mut self, other: Changes) -> Self {
        self.0.extend(other.0);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mutation> {
        self.0.iter()
    }
}

impl From<Mutation> for Changes {
    fn from(m: Mutation) -> Self {
        Changes(vec![m])
    }
}

impl From<Vec<Mutation>> for Changes {
    fn from(v: Vec<Mutation>) -> Self {
        Changes(v)
    }
}

impl IntoIterator for Changes {
    type Item = Mutation;
    type IntoIter = std::vec::IntoIter<Mutation>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
