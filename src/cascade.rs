//! Cascade fan-out graph for root removal events.
//!
//! Removing a user, org, project or instance makes every projection row that
//! references it meaningless. Each dependent projection declares a
//! [`CascadeEdge`] per owner column that stores such a reference; the
//! [`CascadeGraph`] groups edges by [`RootRemoval`] and turns a removal event
//! into one DELETE per edge.
//!
//! Cascade deletes carry no sequence check against the dependent row: once
//! the root is removed the row is deleted regardless of its own history.
//! They are idempotent, so deleting already-absent rows is a success with
//! zero rows affected.

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::error::ProjectorError;
use crate::event::Event;
use crate::sql::{Predicate, Statement, Table};

/// Aggregates whose removal cascades into dependent projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RootRemoval {
    User,
    Org,
    Project,
    Instance,
}

impl RootRemoval {
    pub const ALL: [RootRemoval; 4] = [
        RootRemoval::User,
        RootRemoval::Org,
        RootRemoval::Project,
        RootRemoval::Instance,
    ];

    pub fn aggregate_type(&self) -> &'static str {
        match self {
            RootRemoval::User => "user",
            RootRemoval::Org => "org",
            RootRemoval::Project => "project",
            RootRemoval::Instance => "instance",
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            RootRemoval::User => "user.removed",
            RootRemoval::Org => "org.removed",
            RootRemoval::Project => "project.removed",
            RootRemoval::Instance => "instance.removed",
        }
    }

    /// The root removal an event represents, if any.
    pub fn from_event(event: &Event) -> Option<Self> {
        Self::ALL.into_iter().find(|root| {
            event.aggregate_type.as_str() == root.aggregate_type()
                && event.event_type.as_str() == root.event_type()
        })
    }
}

impl fmt::Display for RootRemoval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.event_type())
    }
}

/// "Removal of `root` deletes rows of `table` whose `column` holds the
/// removed aggregate's id."
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CascadeEdge {
    pub root: RootRemoval,
    pub table: Table,
    pub column: String,
}

impl CascadeEdge {
    pub fn new(root: RootRemoval, table: Table, column: &str) -> Self {
        CascadeEdge {
            root,
            table,
            column: column.to_string(),
        }
    }

    /// The DELETE this edge contributes for a removal event.
    ///
    /// Instance removal is scoped by tenant alone; every other root is
    /// scoped by tenant plus the owner column.
    pub fn statement(&self, event: &Event) -> Result<Statement, ProjectorError> {
        event.expect_type(self.root.event_type())?;
        let predicate = match self.root {
            RootRemoval::Instance => Predicate::new().eq(&self.column, &event.aggregate_id),
            _ => Predicate::new()
                .eq("instance_id", &event.instance_id)
                .eq(&self.column, &event.aggregate_id),
        };
        Statement::delete(&self.table, predicate)
    }
}

/// Static fan-out graph from root removals to dependent table columns.
#[derive(Debug, Clone, Default)]
pub struct CascadeGraph {
    /// Edges per root, in registration order.
    edges: HashMap<RootRemoval, Vec<CascadeEdge>>,
    all_edges: HashSet<CascadeEdge>,
}

impl CascadeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an edge. Registering the same edge twice is a configuration
    /// error.
    pub fn add_edge(&mut self, edge: CascadeEdge) -> Result<(), ProjectorError> {
        if !self.all_edges.insert(edge.clone()) {
            return Err(ProjectorError::InvalidConfig(format!(
                "duplicate cascade edge {} -> {}.{}",
                edge.root, edge.table, edge.column
            )));
        }
        self.edges.entry(edge.root).or_default().push(edge);
        Ok(())
    }

    /// Merge all edges of `other` into this graph.
    pub fn merge(&mut self, other: &CascadeGraph) -> Result<(), ProjectorError> {
        for root in RootRemoval::ALL {
            for edge in other.dependents(root) {
                self.add_edge(edge.clone())?;
            }
        }
        Ok(())
    }

    /// Edges fired by `root`, in registration order.
    pub fn dependents(&self, root: RootRemoval) -> &[CascadeEdge] {
        self.edges.get(&root).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct tables that depend on `root`.
    pub fn dependent_tables(&self, root: RootRemoval) -> Vec<&Table> {
        let mut seen = HashSet::new();
        self.dependents(root)
            .iter()
            .filter(|e| seen.insert(&e.table))
            .map(|e| &e.table)
            .collect()
    }

    pub fn handles(&self, root: RootRemoval) -> bool {
        !self.dependents(root).is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.all_edges.len()
    }

    /// One DELETE per dependent (table, column) for a removal event. Events
    /// that are not root removals produce no statements.
    pub fn plan(&self, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
        match RootRemoval::from_event(event) {
            Some(root) => self
                .dependents(root)
                .iter()
                .map(|edge| edge.statement(event))
                .collect(),
            None => Ok(Vec::new()),
        }
    }
}
