//! Column mutation algebra and statement assembly.
//!
//! # Architecture
//!
//! 1. **Mutation** (`mutation.rs`) — typed descriptors of how one column's
//!    new value is computed (literal, `NOW()`, coalesce-default, increment,
//!    array append-union / remove / replace).
//! 2. **Expr** (`expr.rs`) — the explicit expression tree each mutation
//!    lowers into.
//! 3. **StatementBuilder** (`builder.rs`) — walks expression trees into SQL
//!    text, numbering `$n` placeholders in emission order.
//! 4. **Statement** (`statement.rs`) — assembles INSERT / UPDATE / DELETE /
//!    UPSERT over one target row-set.

pub mod builder;
pub mod expr;
pub mod mutation;
pub mod statement;
pub mod value;

pub use builder::StatementBuilder;
pub use expr::{Column, Expr, Table};
pub use mutation::{Changes, Mutation, MutationKind};
pub use statement::{Assignment, Condition, Predicate, Statement, StatementKind};
pub use value::Value;
