//! Domain events as delivered by the event feed.
//!
//! An [`Event`] is an immutable, sequenced fact about one aggregate instance.
//! The engine never produces or mutates events; it only reads the envelope
//! and decodes the payload into the statically declared structure of the
//! event type being reduced.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProjectorError;

/// Type of aggregate an event belongs to (e.g. `user`, `org`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AggregateType(String);

impl AggregateType {
    pub fn new(name: impl Into<String>) -> Self {
        AggregateType(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AggregateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AggregateType {
    fn from(s: &str) -> Self {
        AggregateType::new(s)
    }
}

/// Dotted event type name (e.g. `project.member.added`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    pub fn new(name: impl Into<String>) -> Self {
        EventType(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        EventType::new(s)
    }
}

/// Identity of one aggregate instance's sequence stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregateKey {
    pub instance_id: String,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
}

impl fmt::Display for AggregateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.instance_id, self.aggregate_type, self.aggregate_id
        )
    }
}

/// An immutable domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Tenant the event belongs to.
    pub instance_id: String,
    /// Organization owning the aggregate.
    pub resource_owner: String,
    pub aggregate_type: AggregateType,
    pub aggregate_id: String,
    pub event_type: EventType,
    /// Monotonic per aggregate instance.
    pub sequence: u64,
    /// Sequence of the aggregate's preceding event, when the log knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_sequence: Option<u64>,
    pub creation_date: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Event {
    /// The aggregate stream this event belongs to.
    pub fn aggregate_key(&self) -> AggregateKey {
        AggregateKey {
            instance_id: self.instance_id.clone(),
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
        }
    }

    /// Fail with [`ProjectorError::InvalidEventMapping`] unless the event has
    /// the given type.
    pub fn expect_type(&self, expected: &str) -> Result<(), ProjectorError> {
        if self.event_type.as_str() == expected {
            Ok(())
        } else {
            Err(ProjectorError::invalid_mapping(expected, &self.event_type))
        }
    }

    /// Like [`Event::expect_type`], accepting any of several types.
    pub fn expect_one_of(&self, expected: &[&str]) -> Result<(), ProjectorError> {
        if expected.contains(&self.event_type.as_str()) {
            Ok(())
        } else {
            Err(ProjectorError::invalid_mapping(
                expected.join("|"),
                &self.event_type,
            ))
        }
    }

    /// Decode the payload into the structure declared for this event type.
    ///
    /// A `null` payload decodes as an empty object so that payload-less
    /// events can use structs whose fields are all optional.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProjectorError> {
        let value = if self.payload.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.payload.clone()
        };
        serde_json::from_value(value).map_err(|e| ProjectorError::InvalidPayload {
            event_type: self.event_type.to_string(),
            reason: e.to_string(),
        })
    }
}
