//! Statement executor boundary.
//!
//! The engine hands fully assembled [`Statement`]s to a
//! [`StatementExecutor`] and gets back the number of affected rows or a
//! classified failure. The statements of one event, together with the
//! position upsert that records it, go through
//! [`StatementExecutor::execute_batch`] and commit or roll back as a unit. [`PgExecutor`] talks to PostgreSQL through
//! `tokio-postgres`; [`MemoryExecutor`](crate::memory::MemoryExecutor)
//! applies statements to in-memory tables.

use std::error::Error;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls};
use tracing::{error, info};

use crate::error::ProjectorError;
use crate::event::{AggregateKey, AggregateType};
use crate::sequence::{self, PositionKey};
use crate::sql::{Statement, Value};

/// Executor failure, classified where it is detected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    /// Safe to resubmit the same statement unchanged.
    #[error("transient: {0}")]
    Transient(String),
    /// Schema or constraint violation; retrying cannot help.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ExecError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Transient(_))
    }
}

impl From<ExecError> for ProjectorError {
    fn from(e: ExecError) -> Self {
        match e {
            ExecError::Transient(msg) => ProjectorError::TransientStorageFailure(msg),
            ExecError::Fatal(msg) => ProjectorError::FatalStorageFailure(msg),
        }
    }
}

/// Applies statements to a storage engine.
#[async_trait]
pub trait StatementExecutor: Send + Sync {
    /// Execute one statement atomically, returning the affected row count.
    /// Zero affected rows is a success.
    async fn execute(&self, stmt: &Statement) -> Result<u64, ExecError>;

    /// Execute `stmts` in order inside one transaction, returning the
    /// affected row count of each. On error nothing of the batch is
    /// visible.
    async fn execute_batch(&self, stmts: &[Statement]) -> Result<Vec<u64>, ExecError>;
}

// ── PostgreSQL ─────────────────────────────────────────────────────────────

/// Executor backed by a `tokio-postgres` connection.
///
/// The connection is shared by every lane; batches take it exclusively
/// for the length of their transaction.
pub struct PgExecutor {
    client: Mutex<Client>,
}

impl PgExecutor {
    pub fn new(client: Client) -> Self {
        PgExecutor {
            client: Mutex::new(client),
        }
    }

    /// Connect and drive the connection on a background task.
    pub async fn connect(url: &str) -> Result<(Self, JoinHandle<()>), ProjectorError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .map_err(|e| ProjectorError::from(classify(&e)))?;
        let handle = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection terminated");
            }
        });
        info!("connected to postgres");
        Ok((PgExecutor::new(client), handle))
    }

    /// Run DDL (e.g. [`projection::ddl`](crate::projection::ddl)).
    pub async fn apply_ddl(&self, ddl: &str) -> Result<(), ProjectorError> {
        self.client
            .lock()
            .await
            .batch_execute(ddl)
            .await
            .map_err(|e| ProjectorError::from(classify(&e)))
    }

    /// Read persisted positions to seed a
    /// [`SequenceTracker`](crate::sequence::SequenceTracker).
    pub async fn load_positions(
        &self,
        schema: &str,
    ) -> Result<Vec<(PositionKey, u64)>, ProjectorError> {
        let sql = format!(
            "SELECT projection_name, instance_id, aggregate_type, aggregate_id, sequence FROM {}",
            sequence::positions_table(schema).qualified()
        );
        let rows = self
            .client
            .lock()
            .await
            .query(sql.as_str(), &[])
            .await
            .map_err(|e| ProjectorError::from(classify(&e)))?;
        rows.iter()
            .map(|row| {
                let get = |i: usize| -> Result<String, ProjectorError> {
                    row.try_get(i)
                        .map_err(|e| ProjectorError::InternalError(e.to_string()))
                };
                let sequence: i64 = row
                    .try_get(4)
                    .map_err(|e| ProjectorError::InternalError(e.to_string()))?;
                let aggregate = AggregateKey {
                    instance_id: get(1)?,
                    aggregate_type: AggregateType::new(get(2)?),
                    aggregate_id: get(3)?,
                };
                let sequence = u64::try_from(sequence).map_err(|_| {
                    ProjectorError::InternalError(format!("negative position {sequence}"))
                })?;
                Ok((PositionKey::new(&get(0)?, aggregate), sequence))
            })
            .collect()
    }
}

#[async_trait]
impl StatementExecutor for PgExecutor {
    async fn execute(&self, stmt: &Statement) -> Result<u64, ExecError> {
        self.client
            .lock()
            .await
            .execute(stmt.sql(), &params(stmt))
            .await
            .map_err(|e| classify(&e))
    }

    async fn execute_batch(&self, stmts: &[Statement]) -> Result<Vec<u64>, ExecError> {
        let mut client = self.client.lock().await;
        // Dropping the transaction without commit rolls it back.
        let tx = client.transaction().await.map_err(|e| classify(&e))?;
        let mut affected = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            let rows = tx
                .execute(stmt.sql(), &params(stmt))
                .await
                .map_err(|e| classify(&e))?;
            affected.push(rows);
        }
        tx.commit().await.map_err(|e| classify(&e))?;
        Ok(affected)
    }
}

fn params(stmt: &Statement) -> Vec<&(dyn ToSql + Sync)> {
    stmt.args()
        .iter()
        .map(|v| v as &(dyn ToSql + Sync))
        .collect()
}

/// Map a driver error onto the transient/fatal split.
///
/// Serialization failures and deadlocks (`40xxx`), connection problems
/// (`08xxx`), resource exhaustion (`53xxx`) and operator intervention
/// (`57xxx`) are transient, as is a closed connection. Everything else
/// (constraint violations, undefined tables, type errors) is fatal.
pub fn classify(err: &tokio_postgres::Error) -> ExecError {
    match err.code() {
        Some(code) => classify_sqlstate(code, err.to_string()),
        None if err.is_closed() => ExecError::Transient(err.to_string()),
        None => match err.source() {
            // I/O errors without a SQLSTATE are connection level.
            Some(src) if src.is::<std::io::Error>() => ExecError::Transient(err.to_string()),
            _ => ExecError::Fatal(err.to_string()),
        },
    }
}

pub fn classify_sqlstate(code: &SqlState, message: String) -> ExecError {
    match &code.code()[..2] {
        "40" | "08" | "53" | "57" => ExecError::Transient(message),
        _ => ExecError::Fatal(message),
    }
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => bind(b, ty, out),
            Value::Int(i) => match *ty {
                Type::INT2 => bind(&i16::try_from(*i)?, ty, out),
                Type::INT4 => bind(&i32::try_from(*i)?, ty, out),
                _ => bind(i, ty, out),
            },
            Value::Text(s) => bind(s, ty, out),
            Value::TextArray(a) => bind(a, ty, out),
            Value::Timestamp(t) => bind(t, ty, out),
        }
    }

    // The variant is only known at bind time; `bind` checks it there.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn bind<T: ToSql>(
    v: &T,
    ty: &Type,
    out: &mut BytesMut,
) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
    if !T::accepts(ty) {
        return Err(format!("cannot bind {} to column of type {ty}", std::any::type_name::<T>()).into());
    }
    v.to_sql(ty, out)
}
