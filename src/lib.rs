//! pg_projector — event-sourced read-model projections for PostgreSQL.
//!
//! The engine consumes an ordered stream of immutable domain events and
//! reduces each one, per interested projection, into parameterized SQL
//! statements that keep denormalized read tables (organizations, projects,
//! project memberships, human users) in sync with the event log.
//!
//! # Architecture
//!
//! 1. **Events** (`event.rs`) — the envelope and typed payload decoding.
//! 2. **Mutations** (`sql/`) — column-change descriptors and the statement
//!    assembler that renders them into `$n`-numbered SQL.
//! 3. **Projections** (`projection/`) — per-table reducers registered by
//!    `(aggregate type, event type)`, plus cascade edges for root removals
//!    (`cascade.rs`).
//! 4. **Sequencing** (`sequence.rs`) — per-projection, per-aggregate
//!    positions making redelivery and replay idempotent.
//! 5. **Application** (`handler.rs`, `engine.rs`, `scheduler.rs`) — gate,
//!    reduce, execute with retry, commit; fanned out over projections and
//!    parallelized across aggregates on hash-routed worker lanes.
//! 6. **Storage** (`executor.rs`, `memory.rs`) — the executor boundary,
//!    backed by tokio-postgres or by an in-memory table model.
//!
//! # Guarantees
//!
//! - Every event of one aggregate instance is applied in sequence order;
//!   a sequence at or below the recorded position is a no-op.
//! - A failing projection never blocks the others.
//! - Statement text never interpolates event data; all values are bound.

pub mod cascade;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod handler;
pub mod hash;
pub mod memory;
pub mod monitor;
pub mod projection;
pub mod scheduler;
pub mod sequence;
pub mod sql;

pub use config::{EngineConfig, GapPolicy};
pub use engine::{DispatchResult, Projector};
pub use error::{ProjectorError, ProjectorErrorKind, RetryPolicy};
pub use event::{AggregateKey, AggregateType, Event, EventType};
pub use executor::{ExecError, PgExecutor, StatementExecutor};
pub use handler::ApplyOutcome;
pub use memory::MemoryExecutor;
pub use projection::{Projection, ProjectionRegistry};
pub use scheduler::WorkerPool;
pub use sequence::SequenceTracker;
