//! `projects`: one row per project, owned by an organization.

use serde::Deserialize;

use super::Projection;
use crate::cascade::RootRemoval;
use crate::error::ProjectorError;
use crate::event::Event;
use crate::sql::{Changes, Mutation, Predicate, Statement, Table};

pub const TABLE: &str = "projects";

pub const PROJECT_ADDED: &str = "project.added";
pub const PROJECT_CHANGED: &str = "project.changed";
pub const PROJECT_REMOVED: &str = "project.removed";

const COLUMNS: &str = "
    id                     TEXT NOT NULL,
    creation_date          TIMESTAMPTZ NOT NULL,
    change_date            TIMESTAMPTZ NOT NULL,
    sequence               BIGINT NOT NULL,
    resource_owner         TEXT NOT NULL,
    instance_id            TEXT NOT NULL,
    name                   TEXT NOT NULL,
    project_role_assertion BOOLEAN NOT NULL DEFAULT FALSE,
    project_role_check     BOOLEAN NOT NULL DEFAULT FALSE,";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectAdded {
    name: String,
    #[serde(default)]
    project_role_assertion: bool,
    #[serde(default)]
    project_role_check: bool,
}

/// Only the fields present in the payload changed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectChanged {
    name: Option<String>,
    project_role_assertion: Option<bool>,
    project_role_check: Option<bool>,
}

pub fn projection(schema: &str) -> Result<Projection, ProjectorError> {
    Projection::builder(TABLE, Table::new(schema, TABLE))
        .primary_key(&["instance_id", "id"])
        .columns(COLUMNS)
        .on("project", PROJECT_ADDED, reduce_added)?
        .on("project", PROJECT_CHANGED, reduce_changed)?
        .on("project", PROJECT_REMOVED, reduce_removed)?
        .cascade_on(RootRemoval::Org, "resource_owner")
        .cascade_on(RootRemoval::Instance, "instance_id")
        .build()
}

pub fn reduce_added(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(PROJECT_ADDED)?;
    let p: ProjectAdded = event.decode()?;
    let stmt = Statement::insert(
        t,
        vec![
            Mutation::set(t.column("id"), &event.aggregate_id),
            Mutation::set(t.column("creation_date"), event.creation_date),
            Mutation::set(t.column("change_date"), event.creation_date),
            Mutation::set(t.column("sequence"), event.sequence),
            Mutation::set(t.column("resource_owner"), &event.resource_owner),
            Mutation::set(t.column("instance_id"), &event.instance_id),
            Mutation::set(t.column("name"), p.name),
            Mutation::set(t.column("project_role_assertion"), p.project_role_assertion),
            Mutation::set(t.column("project_role_check"), p.project_role_check),
        ],
    )?;
    Ok(vec![stmt])
}

pub fn reduce_changed(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(PROJECT_CHANGED)?;
    let p: ProjectChanged = event.decode()?;
    let mut changes = Changes::new()
        .push(Mutation::set(t.column("change_date"), event.creation_date))
        .push(Mutation::set(t.column("sequence"), event.sequence));
    if let Some(name) = p.name {
        changes = changes.push(Mutation::set(t.column("name"), name));
    }
    if let Some(assertion) = p.project_role_assertion {
        changes = changes.push(Mutation::set(t.column("project_role_assertion"), assertion));
    }
    if let Some(check) = p.project_role_check {
        changes = changes.push(Mutation::set(t.column("project_role_check"), check));
    }
    Ok(vec![Statement::update(t, changes, project(event))?])
}

pub fn reduce_removed(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(PROJECT_REMOVED)?;
    Ok(vec![Statement::delete(t, project(event))?])
}

fn project(event: &Event) -> Predicate {
    Predicate::new()
        .eq("instance_id", &event.instance_id)
        .eq("id", &event.aggregate_id)
}
