//! Reducer registry and the shipped projections.
//!
//! A [`Projection`] owns one read-model table and a dispatch table
//! `(aggregate type, event type) -> Reducer`, built once when the
//! projection is constructed. Reducing an event looks up the reducer and
//! returns the statements it produces. A projection receives every event
//! of the aggregate types it has reducers for; those it has no reducer for
//! reduce to nothing and only advance the sequence position.
//!
//! Root removals (user, org, project, instance) that the projection does
//! not handle itself fall through to its [`CascadeGraph`], which emits one
//! DELETE per registered owner column.
//!
//! Each reducer validates the event type it was handed and returns
//! [`ProjectorError::InvalidEventMapping`] on a mismatch, so a registry
//! wiring mistake surfaces as an error instead of a silently wrong write.

pub mod org;
pub mod project;
pub mod project_member;
#[cfg(test)]
pub(crate) mod test_helpers;
pub mod user_human;

use std::collections::HashMap;

use tracing::debug;

use crate::cascade::{CascadeEdge, CascadeGraph, RootRemoval};
use crate::error::ProjectorError;
use crate::event::{AggregateType, Event, EventType};
use crate::sequence;
use crate::sql::{Statement, Table};

/// Turns one event into the statements applying it to `table`.
pub type Reducer = fn(&Table, &Event) -> Result<Vec<Statement>, ProjectorError>;

/// One read model: a table, its dispatch table and its cascade edges.
#[derive(Debug, Clone)]
pub struct Projection {
    name: String,
    table: Table,
    primary_key: Vec<&'static str>,
    columns: &'static str,
    reducers: HashMap<(AggregateType, EventType), Reducer>,
    cascade: CascadeGraph,
}

impl Projection {
    pub fn builder(name: &str, table: Table) -> ProjectionBuilder {
        ProjectionBuilder {
            name: name.to_string(),
            table,
            primary_key: Vec::new(),
            columns: "",
            reducers: HashMap::new(),
            cascades: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Columns identifying one row.
    pub fn primary_key(&self) -> &[&'static str] {
        &self.primary_key
    }

    pub fn cascade(&self) -> &CascadeGraph {
        &self.cascade
    }

    /// Whether reducing `event` can produce statements.
    pub fn handles(&self, event: &Event) -> bool {
        self.reducer_for(event).is_some()
            || RootRemoval::from_event(event).is_some_and(|root| self.cascade.handles(root))
    }

    /// Whether the event belongs to a stream this projection follows: an
    /// aggregate type it has reducers for, or a root removal it handles.
    ///
    /// Events of a followed aggregate without a reducer still have to pass
    /// through the handler so the position keeps up with the aggregate's
    /// `previous_sequence` chain.
    pub fn subscribes(&self, event: &Event) -> bool {
        self.handles(event)
            || self
                .reducers
                .keys()
                .any(|(aggregate, _)| *aggregate == event.aggregate_type)
    }

    /// Registered `(aggregate type, event type)` pairs, sorted.
    pub fn event_types(&self) -> Vec<(&AggregateType, &EventType)> {
        let mut keys: Vec<_> = self.reducers.keys().map(|(a, e)| (a, e)).collect();
        keys.sort();
        keys
    }

    /// Reduce one event into statements against this projection's table.
    pub fn reduce(&self, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
        if let Some(reducer) = self.reducer_for(event) {
            return reducer(&self.table, event);
        }
        if RootRemoval::from_event(event).is_some() {
            return self.cascade.plan(event);
        }
        debug!(
            projection = %self.name,
            event_type = %event.event_type,
            "no reducer registered"
        );
        Ok(Vec::new())
    }

    /// `CREATE TABLE IF NOT EXISTS` for this projection.
    pub fn ddl(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {table} ({columns}\n    PRIMARY KEY ({pk})\n);",
            table = self.table.qualified(),
            columns = self.columns,
            pk = self.primary_key.join(", "),
        )
    }

    fn reducer_for(&self, event: &Event) -> Option<Reducer> {
        self.reducers
            .get(&(event.aggregate_type.clone(), event.event_type.clone()))
            .copied()
    }
}

/// Collects reducers and cascade edges; [`build`](ProjectionBuilder::build)
/// rejects ambiguous registrations.
#[derive(Debug)]
pub struct ProjectionBuilder {
    name: String,
    table: Table,
    primary_key: Vec<&'static str>,
    columns: &'static str,
    reducers: HashMap<(AggregateType, EventType), Reducer>,
    cascades: Vec<(RootRemoval, &'static str)>,
}

impl ProjectionBuilder {
    pub fn primary_key(mut self, columns: &[&'static str]) -> Self {
        self.primary_key = columns.to_vec();
        self
    }

    /// Column definitions, each line ending in a comma, rendered before
    /// the primary key clause.
    pub fn columns(mut self, columns: &'static str) -> Self {
        self.columns = columns;
        self
    }

    pub fn on(
        mut self,
        aggregate_type: &str,
        event_type: &str,
        reducer: Reducer,
    ) -> Result<Self, ProjectorError> {
        let key = (AggregateType::new(aggregate_type), EventType::new(event_type));
        if self.reducers.insert(key, reducer).is_some() {
            return Err(ProjectorError::InvalidConfig(format!(
                "{}: more than one reducer for {aggregate_type}/{event_type}",
                self.name
            )));
        }
        Ok(self)
    }

    /// Delete rows whose `column` references the removed root.
    pub fn cascade_on(mut self, root: RootRemoval, column: &'static str) -> Self {
        self.cascades.push((root, column));
        self
    }

    pub fn build(self) -> Result<Projection, ProjectorError> {
        if self.primary_key.is_empty() {
            return Err(ProjectorError::InvalidConfig(format!(
                "{}: no primary key",
                self.name
            )));
        }
        let mut cascade = CascadeGraph::new();
        for (root, column) in self.cascades {
            let explicit = (
                AggregateType::new(root.aggregate_type()),
                EventType::new(root.event_type()),
            );
            if self.reducers.contains_key(&explicit) {
                return Err(ProjectorError::InvalidConfig(format!(
                    "{}: {root} has both a reducer and a cascade edge",
                    self.name
                )));
            }
            cascade.add_edge(CascadeEdge::new(root, self.table.clone(), column))?;
        }
        Ok(Projection {
            name: self.name,
            table: self.table,
            primary_key: self.primary_key,
            columns: self.columns,
            reducers: self.reducers,
            cascade,
        })
    }
}

/// The set of projections the engine maintains.
#[derive(Debug, Clone, Default)]
pub struct ProjectionRegistry {
    projections: Vec<Projection>,
}

impl ProjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All shipped projections inside `schema`.
    pub fn standard(schema: &str) -> Result<Self, ProjectorError> {
        let mut registry = Self::new();
        registry.register(org::projection(schema)?)?;
        registry.register(project::projection(schema)?)?;
        registry.register(project_member::projection(schema)?)?;
        registry.register(user_human::projection(schema)?)?;
        Ok(registry)
    }

    pub fn register(&mut self, projection: Projection) -> Result<(), ProjectorError> {
        if self
            .projections
            .iter()
            .any(|p| p.name == projection.name || p.table == projection.table)
        {
            return Err(ProjectorError::InvalidConfig(format!(
                "projection {} registered twice",
                projection.name
            )));
        }
        self.projections.push(projection);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Projection> {
        self.projections.iter().find(|p| p.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Projection> {
        self.projections.iter()
    }

    pub fn len(&self) -> usize {
        self.projections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projections.is_empty()
    }

    /// Projections following the stream `event` belongs to, in
    /// registration order.
    pub fn interested(&self, event: &Event) -> impl Iterator<Item = &Projection> {
        self.projections.iter().filter(move |p| p.subscribes(event))
    }

    /// Union of every projection's cascade edges.
    pub fn cascade_graph(&self) -> Result<CascadeGraph, ProjectorError> {
        let mut graph = CascadeGraph::new();
        for p in &self.projections {
            graph.merge(&p.cascade)?;
        }
        Ok(graph)
    }
}

/// DDL for every projection table plus the positions table.
pub fn ddl(registry: &ProjectionRegistry, schema: &str) -> String {
    let mut out = format!("CREATE SCHEMA IF NOT EXISTS {schema};\n\n");
    for p in registry.iter() {
        out.push_str(&p.ddl());
        out.push_str("\n\n");
    }
    out.push_str(&sequence::positions_ddl(schema));
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::test_helpers::test_event;
    use super::*;

    fn noop(_: &Table, _: &Event) -> Result<Vec<Statement>, ProjectorError> {
        Ok(Vec::new())
    }

    #[test]
    fn test_standard_registry_contains_all_projections() {
        let r = ProjectionRegistry::standard("projections").unwrap();
        let names: Vec<&str> = r.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["orgs", "projects", "project_members", "user_humans"]);
    }

    #[test]
    fn test_duplicate_reducer_rejected() {
        let err = Projection::builder("x", Table::new("", "x"))
            .on("org", "org.added", noop)
            .unwrap()
            .on("org", "org.added", noop)
            .unwrap_err();
        assert!(matches!(err, ProjectorError::InvalidConfig(_)));
    }

    #[test]
    fn test_reducer_and_cascade_for_same_root_rejected() {
        let err = Projection::builder("x", Table::new("", "x"))
            .primary_key(&["id"])
            .on("org", "org.removed", noop)
            .unwrap()
            .cascade_on(RootRemoval::Org, "resource_owner")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("org.removed"));
    }

    #[test]
    fn test_missing_primary_key_rejected() {
        assert!(Projection::builder("x", Table::new("", "x")).build().is_err());
    }

    #[test]
    fn test_unregistered_event_reduces_to_nothing() {
        let r = ProjectionRegistry::standard("projections").unwrap();
        let members = r.get("project_members").unwrap();
        let ev = test_event("project.grant.added", "project", serde_json::json!({}));
        assert!(!members.handles(&ev));
        assert!(members.reduce(&ev).unwrap().is_empty());
    }

    #[test]
    fn test_cascade_fallthrough() {
        let r = ProjectionRegistry::standard("projections").unwrap();
        let members = r.get("project_members").unwrap();
        let ev = test_event("org.removed", "org", serde_json::json!({}));
        assert!(members.handles(&ev));
        assert_eq!(members.reduce(&ev).unwrap().len(), 2);
    }

    #[test]
    fn test_interested_projections_for_org_removal() {
        let r = ProjectionRegistry::standard("projections").unwrap();
        let ev = test_event("org.removed", "org", serde_json::json!({}));
        let names: Vec<&str> = r.interested(&ev).map(|p| p.name()).collect();
        assert_eq!(names, vec!["orgs", "projects", "project_members", "user_humans"]);
    }

    #[test]
    fn test_followed_aggregate_is_dispatched_without_reducer() {
        let r = ProjectionRegistry::standard("projections").unwrap();
        let ev = test_event("project.added", "project", serde_json::json!({"name": "p"}));
        let names: Vec<&str> = r.interested(&ev).map(|p| p.name()).collect();
        assert_eq!(names, vec!["projects", "project_members"]);
        assert!(!r.get("project_members").unwrap().handles(&ev));
    }

    #[test]
    fn test_registry_cascade_graph_unions_edges() {
        let r = ProjectionRegistry::standard("projections").unwrap();
        let g = r.cascade_graph().unwrap();
        assert_eq!(g.dependents(RootRemoval::Org).len(), 4);
        assert_eq!(g.dependents(RootRemoval::Instance).len(), 4);
        assert_eq!(g.dependents(RootRemoval::User).len(), 1);
        assert_eq!(g.dependents(RootRemoval::Project).len(), 1);
    }

    #[test]
    fn test_duplicate_projection_rejected() {
        let mut r = ProjectionRegistry::standard("projections").unwrap();
        let again = org::projection("projections").unwrap();
        assert!(r.register(again).is_err());
    }

    #[test]
    fn test_ddl_covers_every_table() {
        let r = ProjectionRegistry::standard("projections").unwrap();
        let ddl = ddl(&r, "projections");
        assert!(ddl.starts_with("CREATE SCHEMA IF NOT EXISTS projections;"));
        for table in [
            "projections.orgs",
            "projections.projects",
            "projections.project_members",
            "projections.user_humans",
            "projections.current_sequences",
        ] {
            assert!(ddl.contains(table), "missing {table}");
        }
        assert!(ddl.contains("PRIMARY KEY (instance_id, project_id, user_id)"));
    }
}
