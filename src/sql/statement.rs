//! Statement assembly.
//!
//! A [`Statement`] is a fully rendered, parameterized write against one
//! row-set of one table. It keeps its structured form (assignments and
//! predicate) next to the rendered text so that executors that do not speak
//! SQL can apply it, and it is immutable once assembled: a retry resubmits
//! exactly the same text and arguments.
//!
//! Rendering rules:
//! - assignments render in caller order as one comma-separated list;
//! - every bound value takes the next `$n`, left to right, SET clause
//!   before the predicate;
//! - predicates are conjunctive equality conditions rendered
//!   `(col = $n) AND (col = $m)`.

use std::fmt;

use super::builder::StatementBuilder;
use super::expr::{Expr, Table};
use super::mutation::{Changes, Mutation};
use super::value::Value;
use crate::error::ProjectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Insert,
    Update,
    Delete,
    /// `INSERT ... ON CONFLICT (...) DO UPDATE`.
    Upsert,
}

impl StatementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Upsert => "UPSERT",
        }
    }
}

/// One `column = value` equality in a predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub column: String,
    pub value: Value,
}

/// Conjunction of equality conditions identifying the target row-set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Predicate(Vec<Condition>);

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.0.push(Condition {
            column: column.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn write(&self, b: &mut StatementBuilder) {
        b.write_str(" WHERE ");
        b.write_list(&self.0, " AND ", |b, cond| {
            b.write_str("(");
            b.write_str(&cond.column);
            b.write_str(" = ");
            b.write_arg(cond.value.clone());
            b.write_str(")");
        });
    }
}

/// A column assignment after lowering.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub expr: Expr,
}

impl From<Mutation> for Assignment {
    fn from(m: Mutation) -> Self {
        Assignment {
            column: m.column().name().to_string(),
            expr: m.to_expr(),
        }
    }
}

/// A fully bound write operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    kind: StatementKind,
    table: Table,
    assignments: Vec<Assignment>,
    predicate: Predicate,
    conflict_columns: Vec<String>,
    sql: String,
    args: Vec<Value>,
}

impl Statement {
    /// `INSERT INTO t (a, b) VALUES ($1, $2)`.
    pub fn insert(table: &Table, values: impl Into<Changes>) -> Result<Self, ProjectorError> {
        let assignments = lower(values.into());
        if assignments.is_empty() {
            return Err(ProjectorError::InvalidStatement(format!(
                "INSERT into {table} without columns"
            )));
        }
        let mut b = StatementBuilder::new();
        write_insert(&mut b, table, &assignments);
        Ok(Self::finish(
            b,
            StatementKind::Insert,
            table,
            assignments,
            Predicate::new(),
            Vec::new(),
        ))
    }

    /// `UPDATE t SET a = $1, b = NOW() WHERE (k = $2)`.
    pub fn update(
        table: &Table,
        changes: impl Into<Changes>,
        predicate: Predicate,
    ) -> Result<Self, ProjectorError> {
        let assignments = lower(changes.into());
        if assignments.is_empty() {
            return Err(ProjectorError::InvalidStatement(format!(
                "UPDATE of {table} without assignments"
            )));
        }
        require_scope(StatementKind::Update, table, &predicate)?;

        let mut b = StatementBuilder::new();
        b.write_str("UPDATE ");
        b.write_str(&table.qualified());
        b.write_str(" SET ");
        write_assignments(&mut b, &assignments);
        predicate.write(&mut b);
        Ok(Self::finish(
            b,
            StatementKind::Update,
            table,
            assignments,
            predicate,
            Vec::new(),
        ))
    }

    /// `DELETE FROM t WHERE (k = $1)`.
    pub fn delete(table: &Table, predicate: Predicate) -> Result<Self, ProjectorError> {
        require_scope(StatementKind::Delete, table, &predicate)?;

        let mut b = StatementBuilder::new();
        b.write_str("DELETE FROM ");
        b.write_str(&table.qualified());
        predicate.write(&mut b);
        Ok(Self::finish(
            b,
            StatementKind::Delete,
            table,
            Vec::new(),
            predicate,
            Vec::new(),
        ))
    }

    /// `INSERT ... ON CONFLICT (keys) DO UPDATE SET col = EXCLUDED.col` for
    /// every non-key column.
    pub fn upsert(
        table: &Table,
        values: impl Into<Changes>,
        conflict_columns: &[&str],
    ) -> Result<Self, ProjectorError> {
        let assignments = lower(values.into());
        if conflict_columns.is_empty() {
            return Err(ProjectorError::InvalidStatement(format!(
                "UPSERT into {table} without conflict columns"
            )));
        }
        for key in conflict_columns {
            if !assignments.iter().any(|a| a.column == *key) {
                return Err(ProjectorError::InvalidStatement(format!(
                    "UPSERT into {table}: conflict column {key} has no value"
                )));
            }
        }
        let updates: Vec<Assignment> = assignments
            .iter()
            .filter(|a| !conflict_columns.contains(&a.column.as_str()))
            .map(|a| Assignment {
                column: a.column.clone(),
                expr: Expr::Excluded(a.column.clone()),
            })
            .collect();
        if updates.is_empty() {
            return Err(ProjectorError::InvalidStatement(format!(
                "UPSERT into {table} has nothing to update"
            )));
        }

        let mut b = StatementBuilder::new();
        write_insert(&mut b, table, &assignments);
        b.write_str(" ON CONFLICT (");
        b.write_list(conflict_columns, ", ", |b, c| b.write_str(c));
        b.write_str(") DO UPDATE SET ");
        write_assignments(&mut b, &updates);
        Ok(Self::finish(
            b,
            StatementKind::Upsert,
            table,
            assignments,
            Predicate::new(),
            conflict_columns.iter().map(|c| c.to_string()).collect(),
        ))
    }

    fn finish(
        b: StatementBuilder,
        kind: StatementKind,
        table: &Table,
        assignments: Vec<Assignment>,
        predicate: Predicate,
        conflict_columns: Vec<String>,
    ) -> Self {
        let (sql, args) = b.finish();
        Statement {
            kind,
            table: table.clone(),
            assignments,
            predicate,
            conflict_columns,
            sql,
            args,
        }
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Inserted values (INSERT/UPSERT) or SET assignments (UPDATE).
    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    pub fn conflict_columns(&self) -> &[String] {
        &self.conflict_columns
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

fn lower(changes: Changes) -> Vec<Assignment> {
    changes.into_iter().map(Assignment::from).collect()
}

fn require_scope(
    kind: StatementKind,
    table: &Table,
    predicate: &Predicate,
) -> Result<(), ProjectorError> {
    if predicate.is_empty() {
        return Err(ProjectorError::InvalidStatement(format!(
            "{} of {table} without predicate",
            kind.as_str()
        )));
    }
    Ok(())
}

fn write_insert(b: &mut StatementBuilder, table: &Table, assignments: &[Assignment]) {
    b.write_str("INSERT INTO ");
    b.write_str(&table.qualified());
    b.write_str(" (");
    b.write_list(assignments, ", ", |b, a| b.write_str(&a.column));
    b.write_str(") VALUES (");
    b.write_list(assignments, ", ", |b, a| b.write_expr(&a.expr));
    b.write_str(")");
}

fn write_assignments(b: &mut StatementBuilder, assignments: &[Assignment]) {
    b.write_list(assignments, ", ", |b, a| {
        b.write_str(&a.column);
        b.write_str(" = ");
        b.write_expr(&a.expr);
    });
}
