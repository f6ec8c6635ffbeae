//! `orgs`: one row per organization.

use serde::Deserialize;

use super::Projection;
use crate::cascade::RootRemoval;
use crate::error::ProjectorError;
use crate::event::Event;
use crate::sql::{Mutation, Predicate, Statement, Table};

pub const TABLE: &str = "orgs";

pub const ORG_ADDED: &str = "org.added";
pub const ORG_CHANGED: &str = "org.changed";
pub const ORG_REMOVED: &str = "org.removed";

const COLUMNS: &str = "
    id             TEXT NOT NULL,
    creation_date  TIMESTAMPTZ NOT NULL,
    change_date    TIMESTAMPTZ NOT NULL,
    sequence       BIGINT NOT NULL,
    resource_owner TEXT NOT NULL,
    instance_id    TEXT NOT NULL,
    name           TEXT NOT NULL,";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrgName {
    name: String,
}

pub fn projection(schema: &str) -> Result<Projection, ProjectorError> {
    Projection::builder(TABLE, Table::new(schema, TABLE))
        .primary_key(&["instance_id", "id"])
        .columns(COLUMNS)
        .on("org", ORG_ADDED, reduce_added)?
        .on("org", ORG_CHANGED, reduce_changed)?
        .on("org", ORG_REMOVED, reduce_removed)?
        .cascade_on(RootRemoval::Instance, "instance_id")
        .build()
}

pub fn reduce_added(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(ORG_ADDED)?;
    let p: OrgName = event.decode()?;
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
        ],
    )?;
    Ok(vec![stmt])
}

pub fn reduce_changed(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(ORG_CHANGED)?;
    let p: OrgName = event.decode()?;
    let stmt = Statement::update(
        t,
        vec![
            Mutation::set(t.column("change_date"), event.creation_date),
            Mutation::set(t.column("sequence"), event.sequence),
            Mutation::set(t.column("name"), p.name),
        ],
        org(event),
    )?;
    Ok(vec![stmt])
}

pub fn reduce_removed(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(ORG_REMOVED)?;
    Ok(vec![Statement::delete(t, org(event))?])
}

fn org(event: &Event) -> Predicate {
    Predicate::new()
        .eq("instance_id", &event.instance_id)
        .eq("id", &event.aggregate_id)
}
