//! Shared fixtures for reducer unit tests.

use chrono::{DateTime, TimeZone, Utc};

use crate::event::Event;
use crate::sql::{Statement, Value};

pub fn creation_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Event with the fixed envelope used throughout the reducer tests:
/// tenant `instance-id`, owner `ro-id`, aggregate `agg-id`, sequence 15
/// following 10.
pub fn test_event(event_type: &str, aggregate_type: &str, payload: serde_json::Value) -> Event {
    Event {
        instance_id: "instance-id".into(),
        resource_owner: "ro-id".into(),
        aggregate_type: aggregate_type.into(),
        aggregate_id: "agg-id".into(),
        event_type: event_type.into(),
        sequence: 15,
        previous_sequence: Some(10),
        creation_date: creation_date(),
        payload,
    }
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

pub fn texts(items: &[&str]) -> Value {
    Value::from(items)
}

/// Assert a single statement's SQL and arguments.
pub fn assert_stmt(stmt: &Statement, sql: &str, args: &[Value]) {
    assert_eq!(stmt.sql(), sql);
    assert_eq!(stmt.args(), args, "args of {sql}");
}
