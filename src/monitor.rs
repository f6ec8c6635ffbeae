//! Monitoring, health and alerting.
//!
//! # Statistics
//!
//! Each projection has a [`ProjectionStats`] of atomic counters updated by
//! the handler; [`Monitor::snapshot`] turns them into serializable
//! [`StatsSnapshot`]s for logs and the replay tool's summary.
//!
//! # Health
//!
//! A projection is [`ProjectionStatus::Unhealthy`] once
//! `max_consecutive_failures` non-transient failures happen in a row, and
//! becomes `Active` again on its next successful application.
//!
//! # Alerting
//!
//! Operational events are emitted as structured `tracing` events on the
//! `pg_projector::alert` target with a JSON payload:
//! - `projection_failed`: a contract, fatal storage or internal error
//! - `projection_unhealthy`: the failure threshold was reached
//! - `projection_recovered`: an unhealthy projection applied an event
//! - `sequence_gap`: an event's predecessor was never applied

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::ProjectorError;

// ── Alerting ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertEvent {
    ProjectionFailed,
    ProjectionUnhealthy,
    ProjectionRecovered,
    SequenceGap,
}

impl AlertEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertEvent::ProjectionFailed => "projection_failed",
            AlertEvent::ProjectionUnhealthy => "projection_unhealthy",
            AlertEvent::ProjectionRecovered => "projection_recovered",
            AlertEvent::SequenceGap => "sequence_gap",
        }
    }
}

/// Build the JSON payload of an alert. `extra` must be a JSON object; its
/// fields are merged next to `event` and `projection`.
pub fn alert_payload(event: AlertEvent, projection: &str, extra: serde_json::Value) -> String {
    let mut payload = serde_json::Map::new();
    payload.insert("event".into(), event.as_str().into());
    payload.insert("projection".into(), projection.into());
    if let serde_json::Value::Object(fields) = extra {
        payload.extend(fields);
    }
    serde_json::Value::Object(payload).to_string()
}

/// Emit an alert as a structured log event.
pub fn emit_alert(event: AlertEvent, projection: &str, extra: serde_json::Value) {
    let payload = alert_payload(event, projection, extra);
    match event {
        AlertEvent::ProjectionFailed | AlertEvent::ProjectionUnhealthy => {
            error!(target: "pg_projector::alert", alert = event.as_str(), %payload)
        }
        AlertEvent::SequenceGap => {
            warn!(target: "pg_projector::alert", alert = event.as_str(), %payload)
        }
        AlertEvent::ProjectionRecovered => {
            info!(target: "pg_projector::alert", alert = event.as_str(), %payload)
        }
    }
}

// ── Per-projection statistics ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProjectionStatus {
    Active,
    Unhealthy,
}

impl ProjectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectionStatus::Active => "ACTIVE",
            ProjectionStatus::Unhealthy => "UNHEALTHY",
        }
    }
}

/// Lock-free counters for one projection.
#[derive(Debug)]
pub struct ProjectionStats {
    name: String,
    max_consecutive_failures: u32,
    applied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    statements: AtomicU64,
    rows_affected: AtomicU64,
    consecutive_failures: AtomicU32,
    unhealthy: AtomicBool,
}

impl ProjectionStats {
    pub fn new(name: &str, max_consecutive_failures: u32) -> Self {
        ProjectionStats {
            name: name.to_string(),
            max_consecutive_failures: max_consecutive_failures.max(1),
            applied: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            statements: AtomicU64::new(0),
            rows_affected: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            unhealthy: AtomicBool::new(false),
        }
    }

    pub fn record_applied(&self, statements: usize, rows_affected: u64) {
        self.applied.fetch_add(1, Ordering::Relaxed);
        self.statements
            .fetch_add(statements as u64, Ordering::Relaxed);
        self.rows_affected
            .fetch_add(rows_affected, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        if self.unhealthy.swap(false, Ordering::AcqRel) {
            emit_alert(
                AlertEvent::ProjectionRecovered,
                &self.name,
                serde_json::json!({}),
            );
        }
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed application. Returns `true` when this failure made
    /// the projection unhealthy.
    pub fn record_failure(&self, err: &ProjectorError) -> bool {
        self.failed.fetch_add(1, Ordering::Relaxed);
        if !err.counts_toward_unhealthy() {
            return false;
        }
        let streak = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if streak >= self.max_consecutive_failures && !self.unhealthy.swap(true, Ordering::AcqRel)
        {
            emit_alert(
                AlertEvent::ProjectionUnhealthy,
                &self.name,
                serde_json::json!({ "consecutive_failures": streak, "error": err.to_string() }),
            );
            return true;
        }
        false
    }

    pub fn status(&self) -> ProjectionStatus {
        if self.unhealthy.load(Ordering::Acquire) {
            ProjectionStatus::Unhealthy
        } else {
            ProjectionStatus::Active
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            projection: self.name.clone(),
            status: self.status(),
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            statements: self.statements.load(Ordering::Relaxed),
            rows_affected: self.rows_affected.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a projection's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub projection: String,
    pub status: ProjectionStatus,
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
    pub retries: u64,
    pub statements: u64,
    pub rows_affected: u64,
    pub consecutive_failures: u32,
}

/// Stats of every projection, keyed by projection name.
#[derive(Debug, Default)]
pub struct Monitor {
    stats: BTreeMap<String, ProjectionStats>,
}

impl Monitor {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>, max_consecutive_failures: u32) -> Self {
        Monitor {
            stats: names
                .into_iter()
                .map(|n| (n.to_string(), ProjectionStats::new(n, max_consecutive_failures)))
                .collect(),
        }
    }

    pub fn stats(&self, projection: &str) -> Option<&ProjectionStats> {
        self.stats.get(projection)
    }

    pub fn status(&self, projection: &str) -> Option<ProjectionStatus> {
        self.stats.get(projection).map(ProjectionStats::status)
    }

    /// Snapshots ordered by projection name.
    pub fn snapshot(&self) -> Vec<StatsSnapshot> {
        self.stats.values().map(ProjectionStats::snapshot).collect()
    }

    pub fn unhealthy(&self) -> Vec<&str> {
        self.stats
            .values()
            .filter(|s| s.status() == ProjectionStatus::Unhealthy)
            .map(|s| s.name.as_str())
            .collect()
    }
}
