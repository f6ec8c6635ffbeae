//! Engine configuration.
//!
//! [`EngineConfig`] is an immutable value constructed once (in code or from
//! TOML) and handed to every component at construction time. There is no
//! process-wide mutable configuration.
//!
//! ```toml
//! worker_count = 8
//! projection_schema = "projections"
//! gap_policy = "fail"
//!
//! [retry]
//! base_delay_ms = 100
//! max_delay_ms = 5000
//! max_attempts = 5
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProjectorError, RetryPolicy};

/// What to do when an event's predecessor was never applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Report `OutOfOrderEvent` to the feed and leave the projection as is.
    #[default]
    Fail,
    /// Log the gap and apply the event anyway.
    Apply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Number of worker lanes. Events of one aggregate always share a lane.
    pub worker_count: usize,
    /// Bounded queue length per lane.
    pub lane_capacity: usize,
    /// Schema holding projection tables.
    pub projection_schema: String,
    /// Persist tracker positions into `<schema>.current_sequences`.
    pub persist_positions: bool,
    /// Consecutive non-transient failures before a projection is reported
    /// unhealthy.
    pub max_consecutive_failures: u32,
    pub gap_policy: GapPolicy,
    /// Backoff for transient storage failures.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            lane_capacity: 256,
            projection_schema: "projections".to_string(),
            persist_positions: true,
            max_consecutive_failures: 3,
            gap_policy: GapPolicy::Fail,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ProjectorError> {
        let config: EngineConfig =
            toml::from_str(s).map_err(|e| ProjectorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ProjectorError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ProjectorError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ProjectorError> {
        if self.worker_count == 0 {
            return Err(ProjectorError::InvalidConfig(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.lane_capacity == 0 {
            return Err(ProjectorError::InvalidConfig(
                "lane_capacity must be at least 1".into(),
            ));
        }
        if !is_identifier(&self.projection_schema) {
            return Err(ProjectorError::InvalidConfig(format!(
                "projection_schema {:?} is not a plain SQL identifier",
                self.projection_schema
            )));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ProjectorError::InvalidConfig(
                "retry.base_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// `[a-z_][a-z0-9_]*` — rendered into statements unquoted.
fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
