//! In-memory statement executor.
//!
//! [`MemoryExecutor`] applies statements structurally (assignments,
//! predicates, expression trees) to in-memory tables instead of sending
//! SQL anywhere. It mirrors the PostgreSQL semantics the projections rely
//! on:
//!
//! - `col = NULL` never matches a predicate;
//! - `array_cat(NULL, x)` is `x`, `array_remove(NULL, x)` is `NULL`;
//! - `ARRAY(SELECT DISTINCT unnest(NULL))` is `{}`;
//! - `NULL + n` is `NULL`;
//! - expressions in one UPDATE all see the row as it was before the update.
//!
//! Distinct arrays come back sorted; callers must not rely on that.
//!
//! A batch runs against a copy of the tables that replaces them only when
//! every statement succeeded, like a transaction.
//!
//! Tables must be registered with their primary key before use, the way a
//! schema must exist in PostgreSQL. Executing against an unknown table is a
//! fatal error, as is inserting a duplicate key.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::executor::{ExecError, StatementExecutor};
use crate::projection::ProjectionRegistry;
use crate::sequence;
use crate::sql::{Expr, Predicate, Statement, StatementKind, Table, Value};

/// One row: column name to value. Absent columns read as `NULL`.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct MemTable {
    primary_key: Vec<String>,
    rows: Vec<Row>,
}

impl MemTable {
    fn key_of(&self, row: &Row) -> Vec<Value> {
        self.primary_key
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn position_of(&self, row: &Row, columns: &[String]) -> Option<usize> {
        if columns.is_empty() {
            return None;
        }
        self.rows.iter().position(|r| {
            columns
                .iter()
                .all(|c| r.get(c).is_some_and(|v| !v.is_null() && Some(v) == row.get(c)))
        })
    }
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemTable>,
    executed: Vec<Statement>,
    attempts: usize,
    failures: VecDeque<ExecError>,
    write_failures: Vec<(String, ExecError)>,
    frozen_now: Option<DateTime<Utc>>,
}

/// Executor applying statements to in-memory tables.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    state: Mutex<State>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// An executor with every table of `registry` plus the positions table
    /// registered under `schema`.
    pub fn for_registry(registry: &ProjectionRegistry, schema: &str) -> Self {
        let exec = Self::new();
        for p in registry.iter() {
            exec.register_table(p.table(), p.primary_key());
        }
        exec.register_table(
            &sequence::positions_table(schema),
            &[
                "projection_name",
                "instance_id",
                "aggregate_type",
                "aggregate_id",
            ],
        );
        exec
    }

    pub fn register_table(&self, table: &Table, primary_key: &[&str]) {
        self.lock().tables.insert(
            table.qualified(),
            MemTable {
                primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Queue a failure returned by the next call instead of applying it.
    pub fn fail_next(&self, err: ExecError) {
        self.lock().failures.push_back(err);
    }

    /// Fail the next statement that writes to `table`, wherever it sits in
    /// a batch. The statements before it in the batch are rolled back.
    pub fn fail_next_write_to(&self, table: &Table, err: ExecError) {
        self.lock().write_failures.push((table.qualified(), err));
    }

    /// Use a fixed instant for `NOW()`.
    pub fn freeze_clock(&self, at: DateTime<Utc>) {
        self.lock().frozen_now = Some(at);
    }

    /// Statements applied successfully, in order.
    pub fn executed(&self) -> Vec<Statement> {
        self.lock().executed.clone()
    }

    /// Calls to `execute`, including failed ones.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    pub fn rows(&self, table: &Table) -> Vec<Row> {
        self.lock()
            .tables
            .get(&table.qualified())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, table: &Table) -> usize {
        self.lock()
            .tables
            .get(&table.qualified())
            .map_or(0, |t| t.rows.len())
    }

    /// First row matching `predicate`.
    pub fn find(&self, table: &Table, predicate: &Predicate) -> Option<Row> {
        self.lock()
            .tables
            .get(&table.qualified())?
            .rows
            .iter()
            .find(|r| matches(r, predicate))
            .cloned()
    }

    /// Every table's rows ordered by primary key, for comparing two stores.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<Row>> {
        let state = self.lock();
        state
            .tables
            .iter()
            .map(|(name, t)| {
                let mut rows = t.rows.clone();
                rows.sort_by_cached_key(|r| format!("{:?}", t.key_of(r)));
                (name.clone(), rows)
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn apply(state: &mut State, stmt: &Statement) -> Result<u64, ExecError> {
        let now = state.frozen_now.unwrap_or_else(Utc::now);
        let name = stmt.table().qualified();
        if let Some(i) = state.write_failures.iter().position(|(t, _)| *t == name) {
            return Err(state.write_failures.remove(i).1);
        }
        let table = state
            .tables
            .get_mut(&name)
            .ok_or_else(|| ExecError::Fatal(format!("relation \"{name}\" does not exist")))?;

        match stmt.kind() {
            StatementKind::Insert => {
                let row = build_row(stmt, now)?;
                let pk = table.primary_key.clone();
                if table.position_of(&row, &pk).is_some() {
                    return Err(duplicate_key(&name, &table.key_of(&row)));
                }
                table.rows.push(row);
                Ok(1)
            }
            StatementKind::Upsert => {
                let row = build_row(stmt, now)?;
                match table.position_of(&row, stmt.conflict_columns()) {
                    Some(i) => {
                        let existing = &mut table.rows[i];
                        for a in stmt.assignments() {
                            if stmt.conflict_columns().contains(&a.column) {
                                continue;
                            }
                            let v = row.get(&a.column).cloned().unwrap_or(Value::Null);
                            existing.insert(a.column.clone(), v);
                        }
                    }
                    None => table.rows.push(row),
                }
                Ok(1)
            }
            StatementKind::Update => {
                // Evaluate everything before writing so a failing row leaves
                // the table untouched.
                let mut updates = Vec::new();
                for (i, row) in table.rows.iter().enumerate() {
                    if !matches(row, stmt.predicate()) {
                        continue;
                    }
                    let mut next = row.clone();
                    for a in stmt.assignments() {
                        next.insert(a.column.clone(), eval(&a.expr, row, now)?);
                    }
                    updates.push((i, next));
                }
                let affected = updates.len() as u64;
                for (i, next) in updates {
                    table.rows[i] = next;
                }
                Ok(affected)
            }
            StatementKind::Delete => {
                let before = table.rows.len();
                table.rows.retain(|r| !matches(r, stmt.predicate()));
                Ok((before - table.rows.len()) as u64)
            }
        }
    }
}

#[async_trait]
impl StatementExecutor for MemoryExecutor {
    async fn execute(&self, stmt: &Statement) -> Result<u64, ExecError> {
        let mut state = self.lock();
        state.attempts += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        let affected = Self::apply(&mut state, stmt)?;
        state.executed.push(stmt.clone());
        Ok(affected)
    }

    async fn execute_batch(&self, stmts: &[Statement]) -> Result<Vec<u64>, ExecError> {
        let mut state = self.lock();
        state.attempts += 1;
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        let before = state.tables.clone();
        let mut affected = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            match Self::apply(&mut state, stmt) {
                Ok(rows) => affected.push(rows),
                Err(err) => {
                    state.tables = before;
                    return Err(err);
                }
            }
        }
        state.executed.extend(stmts.iter().cloned());
        Ok(affected)
    }
}

fn build_row(stmt: &Statement, now: DateTime<Utc>) -> Result<Row, ExecError> {
    let empty = Row::new();
    let mut row = Row::new();
    for a in stmt.assignments() {
        row.insert(a.column.clone(), eval(&a.expr, &empty, now)?);
    }
    Ok(row)
}

fn duplicate_key(table: &str, key: &[Value]) -> ExecError {
    ExecError::Fatal(format!(
        "duplicate key value violates unique constraint on {table}: {key:?}"
    ))
}

fn matches(row: &Row, predicate: &Predicate) -> bool {
    predicate
        .conditions()
        .iter()
        .all(|c| !c.value.is_null() && row.get(&c.column) == Some(&c.value))
}

fn eval(expr: &Expr, row: &Row, now: DateTime<Utc>) -> Result<Value, ExecError> {
    Ok(match expr {
        Expr::Column(c) => row.get(c.name()).cloned().unwrap_or(Value::Null),
        Expr::Arg(v) => v.clone(),
        Expr::Const(c) => Value::Int(*c),
        Expr::Now => Value::Timestamp(now),
        Expr::Coalesce(value, fallback) => match eval(value, row, now)? {
            Value::Null => eval(fallback, row, now)?,
            v => v,
        },
        Expr::Add(lhs, rhs) => match (
            eval(lhs, row, now)?,
            eval(rhs, row, now)?,
        ) {
            (Value::Null, _) | (_, Value::Null) => Value::Null,
            (Value::Int(a), Value::Int(b)) => Value::Int(
                a.checked_add(b)
                    .ok_or_else(|| ExecError::Fatal("bigint out of range".into()))?,
            ),
            (a, b) => return Err(type_error("+", &a, &b)),
        },
        Expr::ArrayCat(lhs, rhs) => match (
            eval(lhs, row, now)?,
            eval(rhs, row, now)?,
        ) {
            (Value::Null, v) | (v, Value::Null) => v,
            (Value::TextArray(mut a), Value::TextArray(b)) => {
                a.extend(b);
                Value::TextArray(a)
            }
            (a, b) => return Err(type_error("array_cat", &a, &b)),
        },
        Expr::ArrayRemove(array, item) => match (
            eval(array, row, now)?,
            eval(item, row, now)?,
        ) {
            (Value::Null, _) => Value::Null,
            (Value::TextArray(a), Value::Text(item)) => {
                Value::TextArray(a.into_iter().filter(|x| *x != item).collect())
            }
            (a, b) => return Err(type_error("array_remove", &a, &b)),
        },
        Expr::DistinctArray(inner) => match eval(inner, row, now)? {
            Value::Null => Value::empty_array(),
            Value::TextArray(mut a) => {
                a.sort();
                a.dedup();
                Value::TextArray(a)
            }
            other => return Err(type_error("unnest", &other, &Value::Null)),
        },
        Expr::Group(inner) => eval(inner, row, now)?,
        // Upserts copy inserted values directly; see `apply`.
        Expr::Excluded(column) => {
            return Err(ExecError::Fatal(format!(
                "EXCLUDED.{column} outside ON CONFLICT"
            )));
        }
    })
}

fn type_error(op: &str, a: &Value, b: &Value) -> ExecError {
    ExecError::Fatal(format!("operator does not exist: {op}({a:?}, {b:?})"))
}
