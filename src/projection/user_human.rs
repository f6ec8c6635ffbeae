//! `user_humans`: human users, including their MFA recovery codes.
//!
//! Recovery codes are stored as an unordered `TEXT[]`. Adding codes is a
//! distinct union with what is stored, so redelivering an add is harmless;
//! a successful check removes the used code, stamps the check time and
//! resets the failure counter; a failed check increments the counter
//! starting from 0 when it was never set.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::Projection;
use crate::cascade::RootRemoval;
use crate::error::ProjectorError;
use crate::event::Event;
use crate::sql::{Changes, Mutation, Predicate, Statement, Table};

pub const TABLE: &str = "user_humans";

pub const HUMAN_ADDED: &str = "user.human.added";
pub const HUMAN_PROFILE_CHANGED: &str = "user.human.profile.changed";
pub const RECOVERY_CODES_ADDED: &str = "user.human.mfa.recoverycodes.added";
pub const RECOVERY_CODE_CHECK_SUCCEEDED: &str = "user.human.mfa.recoverycodes.check.succeeded";
pub const RECOVERY_CODE_CHECK_FAILED: &str = "user.human.mfa.recoverycodes.check.failed";
pub const RECOVERY_CODES_REMOVED: &str = "user.human.mfa.recoverycodes.removed";
pub const USER_REMOVED: &str = "user.removed";

const COLUMNS: &str = "
    user_id                             TEXT NOT NULL,
    instance_id                         TEXT NOT NULL,
    resource_owner                      TEXT NOT NULL,
    creation_date                       TIMESTAMPTZ NOT NULL,
    change_date                         TIMESTAMPTZ NOT NULL,
    sequence                            BIGINT NOT NULL,
    user_name                           TEXT NOT NULL,
    first_name                          TEXT,
    last_name                           TEXT,
    nick_name                           TEXT,
    display_name                        TEXT,
    preferred_language                  TEXT,
    gender                              BIGINT,
    email                               TEXT,
    recovery_codes                      TEXT[],
    recovery_code_failed_attempts       BIGINT,
    recovery_code_last_successful_check TIMESTAMPTZ,";

// ── column changes ─────────────────────────────────────────────────────────

/// Union `codes` into the stored set.
pub fn add_recovery_codes(t: &Table, codes: Vec<String>) -> Mutation {
    Mutation::array_append(t.column("recovery_codes"), codes)
}

pub fn remove_recovery_code(t: &Table, code: impl Into<String>) -> Mutation {
    Mutation::array_remove(t.column("recovery_codes"), code)
}

/// Replace the stored set with `{}`.
pub fn remove_all_recovery_codes(t: &Table) -> Mutation {
    Mutation::array_replace(t.column("recovery_codes"), Vec::new())
}

pub fn increment_recovery_code_failed_attempts(t: &Table) -> Mutation {
    Mutation::increment(t.column("recovery_code_failed_attempts"), 0i64, 1)
}

pub fn reset_recovery_code_failed_attempts(t: &Table) -> Mutation {
    Mutation::set(t.column("recovery_code_failed_attempts"), 0i64)
}

/// Stamp the last successful check and reset the failure counter. Without
/// a known check time the storage clock is used.
pub fn set_last_successful_recovery_code_check(
    t: &Table,
    checked_at: Option<DateTime<Utc>>,
) -> Changes {
    let column = t.column("recovery_code_last_successful_check");
    let stamp = match checked_at {
        Some(at) => Mutation::set(column, at),
        None => Mutation::now(column),
    };
    Changes::new()
        .push(stamp)
        .push(reset_recovery_code_failed_attempts(t))
}

// ── payloads ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HumanAdded {
    user_name: String,
    first_name: Option<String>,
    last_name: Option<String>,
    nick_name: Option<String>,
    display_name: Option<String>,
    preferred_language: Option<String>,
    gender: Option<i64>,
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileChanged {
    first_name: Option<String>,
    last_name: Option<String>,
    nick_name: Option<String>,
    display_name: Option<String>,
    preferred_language: Option<String>,
    gender: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RecoveryCodesAdded {
    codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecoveryCodeCheckSucceeded {
    code: String,
    #[serde(default)]
    checked_at: Option<DateTime<Utc>>,
}

// ── reducers ───────────────────────────────────────────────────────────────

pub fn projection(schema: &str) -> Result<Projection, ProjectorError> {
    Projection::builder(TABLE, Table::new(schema, TABLE))
        .primary_key(&["instance_id", "user_id"])
        .columns(COLUMNS)
        .on("user", HUMAN_ADDED, reduce_human_added)?
        .on("user", HUMAN_PROFILE_CHANGED, reduce_profile_changed)?
        .on("user", RECOVERY_CODES_ADDED, reduce_recovery_codes_added)?
        .on("user", RECOVERY_CODE_CHECK_SUCCEEDED, reduce_recovery_code_check_succeeded)?
        .on("user", RECOVERY_CODE_CHECK_FAILED, reduce_recovery_code_check_failed)?
        .on("user", RECOVERY_CODES_REMOVED, reduce_recovery_codes_removed)?
        .on("user", USER_REMOVED, reduce_user_removed)?
        .cascade_on(RootRemoval::Org, "resource_owner")
        .cascade_on(RootRemoval::Instance, "instance_id")
        .build()
}

pub fn reduce_human_added(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(HUMAN_ADDED)?;
    let p: HumanAdded = event.decode()?;
    let stmt = Statement::insert(
        t,
        vec![
            Mutation::set(t.column("user_id"), &event.aggregate_id),
            Mutation::set(t.column("instance_id"), &event.instance_id),
            Mutation::set(t.column("resource_owner"), &event.resource_owner),
            Mutation::set(t.column("creation_date"), event.creation_date),
            Mutation::set(t.column("change_date"), event.creation_date),
            Mutation::set(t.column("sequence"), event.sequence),
            Mutation::set(t.column("user_name"), p.user_name),
            Mutation::set(t.column("first_name"), p.first_name),
            Mutation::set(t.column("last_name"), p.last_name),
            Mutation::set(t.column("nick_name"), p.nick_name),
            Mutation::set(t.column("display_name"), p.display_name),
            Mutation::set(t.column("preferred_language"), p.preferred_language),
            Mutation::set(t.column("gender"), p.gender),
            Mutation::set(t.column("email"), p.email),
        ],
    )?;
    Ok(vec![stmt])
}

pub fn reduce_profile_changed(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(HUMAN_PROFILE_CHANGED)?;
    let p: ProfileChanged = event.decode()?;
    let mut changes = touch(t, event);
    let fields = [
        ("first_name", p.first_name),
        ("last_name", p.last_name),
        ("nick_name", p.nick_name),
        ("display_name", p.display_name),
        ("preferred_language", p.preferred_language),
    ];
    for (column, value) in fields {
        if let Some(v) = value {
            changes = changes.push(Mutation::set(t.column(column), v));
        }
    }
    if let Some(gender) = p.gender {
        changes = changes.push(Mutation::set(t.column("gender"), gender));
    }
    Ok(vec![Statement::update(t, changes, user(event))?])
}

pub fn reduce_recovery_codes_added(
    t: &Table,
    event: &Event,
) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(RECOVERY_CODES_ADDED)?;
    let p: RecoveryCodesAdded = event.decode()?;
    let changes = touch(t, event).push(add_recovery_codes(t, p.codes));
    Ok(vec![Statement::update(t, changes, user(event))?])
}

pub fn reduce_recovery_code_check_succeeded(
    t: &Table,
    event: &Event,
) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(RECOVERY_CODE_CHECK_SUCCEEDED)?;
    let p: RecoveryCodeCheckSucceeded = event.decode()?;
    let changes = touch(t, event)
        .push(remove_recovery_code(t, p.code))
        .extend(set_last_successful_recovery_code_check(t, p.checked_at));
    Ok(vec![Statement::update(t, changes, user(event))?])
}

pub fn reduce_recovery_code_check_failed(
    t: &Table,
    event: &Event,
) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(RECOVERY_CODE_CHECK_FAILED)?;
    let changes = touch(t, event).push(increment_recovery_code_failed_attempts(t));
    Ok(vec![Statement::update(t, changes, user(event))?])
}

pub fn reduce_recovery_codes_removed(
    t: &Table,
    event: &Event,
) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(RECOVERY_CODES_REMOVED)?;
    let changes = touch(t, event)
        .push(remove_all_recovery_codes(t))
        .push(reset_recovery_code_failed_attempts(t));
    Ok(vec![Statement::update(t, changes, user(event))?])
}

pub fn reduce_user_removed(t: &Table, event: &Event) -> Result<Vec<Statement>, ProjectorError> {
    event.expect_type(USER_REMOVED)?;
    Ok(vec![Statement::delete(t, user(event))?])
}

fn touch(t: &Table, event: &Event) -> Changes {
    Changes::new()
        .push(Mutation::set(t.column("change_date"), event.creation_date))
        .push(Mutation::set(t.column("sequence"), event.sequence))
}

fn user(event: &Event) -> Predicate {
    Predicate::new()
        .eq("instance_id", &event.instance_id)
        .eq("user_id", &event.aggregate_id)
}
