//! `project_members`: users granted roles on a project.
//!
//! Rows are keyed by `(instance_id, project_id, user_id)`. The member's
//! own organization is kept in `user_resource_owner` next to the project
//! owner in `resource_owner`, so removing either org deletes the row.

use serde::Deserialize;

use super::Projection;
use crate::cascade::RootRemoval;
use crate::error::ProjectorError;
use crate::event::Event;
use crate::sql::{Mutation, Predicate, Statement, Table};

pub const TABLE: &str = "project_members";

pub const MEMBER_ADDED: &str = "project.member.added";
pub const MEMBER_CHANGED: &str = "project.member.changed";
pub const MEMBER_REMOVED: &str = "project.member.removed";
pub const MEMBER_CASCADE_REMOVED: &str = "project.member.cascade.removed";

const COLUMNS: &str = "
    user_id             TEXT NOT NULL,
    user_resource_owner TEXT NOT NULL,
    roles               TEXT[],
    creation_date       TIMESTAMPTZ NOT NULL,
    change_date         TIMESTAMPTZ NOT NULL,
    sequence            BIGINT NOT NULL,
    resource_owner      TEXT NOT NULL,
    instance_id         TEXT NOT NULL,
    project_id          TEXT NOT NULL,";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberAdded {
    user_id: String,
    #[serde(default)]
    roles: Vec<String>,
    /// Organization of the user. Older events omit it; the project owner
    /// is used then.
    #[serde(default)]
    user_resource_owner: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberChanged {
    user_id: String,
    #[serde(default)]
    roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberRemoved {
    user_id: String,
}

pub fn projection(schema: &str) -> Result<Projection, ProjectorError> {
    Projection::builder(TABLE, Table::new(schema, TABLE))
        .primary_key(&["instance_id", "project_id", "user_id"])
        .columns(COLUMNS)
        .on("project", MEMBER_ADDED, reduce_added)?
        .on("project", MEMBER_CHANGED, reduce_changed)?
        .on("project", MEMBER_REMOVED, reduce_removed)?
        .on("project", MEMBER_CASCADE_REMOVED, reduce_cascade_removed)?
        .cascade_on(RootRemoval::User, "user_id")
        .cascade_on(RootRemoval::Project, "project_id")
        .cascade_on(RootRemoval::Org, "resource_owner")
        .cascade_on(RootRemoval::Org, "user_resource_owner")
        .cascade_on(RootRemoval::Instance, "instance_id")
        .build()
}

pub fn reduce_added(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(MEMBER_ADDED)?;
    let p: MemberAdded = event.decode()?;
    let user_resource_owner = p
        .user_resource_owner
        .unwrap_or_else(|| event.resource_owner.clone());
    let stmt = Statement::insert(
        t,
        vec![
            Mutation::set(t.column("user_id"), p.user_id),
            Mutation::set(t.column("user_resource_owner"), user_resource_owner),
            Mutation::set(t.column("roles"), p.roles),
            Mutation::set(t.column("creation_date"), event.creation_date),
            Mutation::set(t.column("change_date"), event.creation_date),
            Mutation::set(t.column("sequence"), event.sequence),
            Mutation::set(t.column("resource_owner"), &event.resource_owner),
            Mutation::set(t.column("instance_id"), &event.instance_id),
            Mutation::set(t.column("project_id"), &event.aggregate_id),
        ],
    )?;
    Ok(vec![stmt])
}

pub fn reduce_changed(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(MEMBER_CHANGED)?;
    let p: MemberChanged = event.decode()?;
    let stmt = Statement::update(
        t,
        vec![
            Mutation::set(t.column("roles"), p.roles),
            Mutation::set(t.column("change_date"), event.creation_date),
            Mutation::set(t.column("sequence"), event.sequence),
        ],
        member(event, &p.user_id),
    )?;
    Ok(vec![stmt])
}

pub fn reduce_removed(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(MEMBER_REMOVED)?;
    delete_member(t, event)
}

/// Membership ended because the user's grant was removed elsewhere.
pub fn reduce_cascade_removed(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(MEMBER_CASCADE_REMOVED)?;
    delete_member(t, event)
}

fn delete_member(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    let p: MemberRemoved = event.decode()?;
    Ok(vec![Statement::delete(t, member(event, &p.user_id))?])
}

fn member(event: &Event, user_id: &str) -> Predicate {
    Predicate::new()
        .eq("instance_id", &event.instance_id)
        .eq("user_id", user_id)
        .eq("project_id", &event.aggregate_id)
}
