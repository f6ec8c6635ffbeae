//! Per-projection, per-aggregate sequence positions.
//!
//! A position records the last event sequence a projection applied for one
//! aggregate instance. It is the gate for idempotent application:
//!
//! 1. **Checked** — before reducing, the event's sequence is compared to the
//!    recorded position. Not strictly greater means the event was already
//!    applied (replay, at-least-once redelivery) and is skipped.
//! 2. **Gap-checked** — if the event names its predecessor
//!    (`previous_sequence`) and that predecessor is newer than the recorded
//!    position, events were lost or reordered upstream.
//! 3. **Committed** — after every statement of the reduction succeeded the
//!    position advances to the event's sequence.
//!
//! Steps 1–3 run while holding a [`SequenceLease`] for the key so that two
//! concurrent deliveries for the same aggregate cannot both pass the check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::ProjectorError;
use crate::event::{AggregateKey, Event};
use crate::sql::{Mutation, Statement, Table};

/// Name of the table positions are persisted to.
pub const POSITIONS_TABLE: &str = "current_sequences";

/// Key of one position: projection name plus aggregate stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub projection: String,
    pub aggregate: AggregateKey,
}

impl PositionKey {
    pub fn new(projection: &str, aggregate: AggregateKey) -> Self {
        PositionKey {
            projection: projection.to_string(),
            aggregate,
        }
    }
}

/// Result of checking an event against the recorded position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Strictly newer than anything applied; go ahead.
    Apply,
    /// Already applied; skip.
    Stale { last: u64 },
    /// The event's predecessor was never applied.
    Gap { last: u64, previous: u64 },
}

impl Gate {
    /// Convert a non-`Apply` gate into its error condition.
    pub fn into_error(self, sequence: u64) -> Option<ProjectorError> {
        match self {
            Gate::Apply => None,
            Gate::Stale { last } => Some(ProjectorError::StaleOrDuplicateEvent { sequence, last }),
            Gate::Gap { last, previous } => Some(ProjectorError::OutOfOrderEvent {
                sequence,
                previous,
                last,
            }),
        }
    }
}

type LockMap = HashMap<PositionKey, Arc<AsyncMutex<()>>>;

/// In-memory position store with per-key locking.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    positions: Mutex<HashMap<PositionKey, u64>>,
    locks: Arc<Mutex<LockMap>>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the tracker from persisted positions.
    pub fn with_positions(positions: impl IntoIterator<Item = (PositionKey, u64)>) -> Self {
        let tracker = Self::new();
        {
            let mut map = lock(&tracker.positions);
            for (key, seq) in positions {
                let entry = map.entry(key).or_insert(seq);
                *entry = (*entry).max(seq);
            }
        }
        tracker
    }

    /// Last applied sequence, if any.
    pub fn last(&self, key: &PositionKey) -> Option<u64> {
        lock(&self.positions).get(key).copied()
    }

    /// Compare an event with the recorded position.
    ///
    /// Without a recorded position there is no baseline, so the event is
    /// applied.
    pub fn check(&self, key: &PositionKey, event: &Event) -> Gate {
        let Some(last) = self.last(key) else {
            return Gate::Apply;
        };
        if event.sequence <= last {
            return Gate::Stale { last };
        }
        match event.previous_sequence {
            Some(previous) if previous > last => Gate::Gap { last, previous },
            _ => Gate::Apply,
        }
    }

    /// Record that `sequence` was applied. Positions never move backwards.
    pub fn commit(&self, key: &PositionKey, sequence: u64) {
        let mut map = lock(&self.positions);
        let entry = map.entry(key.clone()).or_insert(sequence);
        *entry = (*entry).max(sequence);
    }

    /// Number of tracked positions.
    pub fn len(&self) -> usize {
        lock(&self.positions).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire exclusive access to one key for the check-apply-commit window.
    pub async fn lease(&self, key: &PositionKey) -> SequenceLease {
        let mutex = {
            let mut locks = lock(&self.locks);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = mutex.lock_owned().await;
        SequenceLease {
            guard: Some(guard),
            key: key.clone(),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys with an outstanding lock entry.
    pub fn active_leases(&self) -> usize {
        lock(&self.locks).len()
    }
}

/// Exclusive access to one position key. Dropping it releases the lock and
/// forgets the lock entry once nobody else is waiting on it.
#[derive(Debug)]
pub struct SequenceLease {
    guard: Option<OwnedMutexGuard<()>>,
    key: PositionKey,
    locks: Arc<Mutex<LockMap>>,
}

impl Drop for SequenceLease {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock(&self.locks);
        if let Some(entry) = locks.get(&self.key) {
            // Only the map still holds it: no holder, no waiter.
            if Arc::strong_count(entry) == 1 {
                locks.remove(&self.key);
            }
        }
    }
}

/// The upsert persisting a position into `<schema>.current_sequences`.
pub fn position_statement(
    schema: &str,
    key: &PositionKey,
    event: &Event,
) -> Result<Statement, ProjectorError> {
    let t = positions_table(schema);
    Statement::upsert(
        &t,
        vec![
            Mutation::set(t.column("projection_name"), &key.projection),
            Mutation::set(t.column("instance_id"), &key.aggregate.instance_id),
            Mutation::set(
                t.column("aggregate_type"),
                key.aggregate.aggregate_type.as_str(),
            ),
            Mutation::set(t.column("aggregate_id"), &key.aggregate.aggregate_id),
            Mutation::set(t.column("sequence"), event.sequence),
            Mutation::set(t.column("event_date"), event.creation_date),
            Mutation::now(t.column("change_date")),
        ],
        &[
            "projection_name",
            "instance_id",
            "aggregate_type",
            "aggregate_id",
        ],
    )
}

pub fn positions_table(schema: &str) -> Table {
    Table::new(schema, POSITIONS_TABLE)
}

/// DDL of the positions table.
pub fn positions_ddl(schema: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    projection_name TEXT NOT NULL,
    instance_id     TEXT NOT NULL,
    aggregate_type  TEXT NOT NULL,
    aggregate_id    TEXT NOT NULL,
    sequence        BIGINT NOT NULL,
    event_date      TIMESTAMPTZ NOT NULL,
    change_date     TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (projection_name, instance_id, aggregate_type, aggregate_id)
);",
        table = positions_table(schema).qualified()
    )
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Critical sections never panic mid-update, so poisoned data is intact.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::time::Duration;

    fn event(seq: u64, previous: Option<u64>) -> Event {
        Event {
            instance_id: "i".into(),
            resource_owner: "o".into(),
            aggregate_type: "org".into(),
            aggregate_id: "a".into(),
            event_type: "org.changed".into(),
            sequence: seq,
            previous_sequence: previous,
            creation_date: Utc::now(),
            payload: serde_json::Value::Null,
        }
    }

    fn key() -> PositionKey {
        PositionKey::new("orgs", event(1, None).aggregate_key())
    }

    #[test]
    fn test_unknown_key_applies() {
        let t = SequenceTracker::new();
        assert_eq!(t.check(&key(), &event(7, Some(6))), Gate::Apply);
    }

    #[test]
    fn test_stale_and_duplicate_detected() {
        let t = SequenceTracker::new();
        t.commit(&key(), 10);
        assert_eq!(t.check(&key(), &event(10, None)), Gate::Stale { last: 10 });
        assert_eq!(t.check(&key(), &event(3, None)), Gate::Stale { last: 10 });
        assert_eq!(t.check(&key(), &event(11, Some(10))), Gate::Apply);
    }

    #[test]
    fn test_gap_detected_from_previous_sequence() {
        let t = SequenceTracker::new();
        t.commit(&key(), 10);
        assert_eq!(
            t.check(&key(), &event(15, Some(12))),
            Gate::Gap {
                last: 10,
                previous: 12
            }
        );
        // Unknown predecessor: sequences may legitimately jump
        assert_eq!(t.check(&key(), &event(15, None)), Gate::Apply);
    }

    #[test]
    fn test_commit_never_moves_backwards() {
        let t = SequenceTracker::new();
        t.commit(&key(), 10);
        t.commit(&key(), 4);
        assert_eq!(t.last(&key()), Some(10));
    }

    #[test]
    fn test_gate_into_error() {
        assert!(Gate::Apply.into_error(1).is_none());
        assert!(matches!(
            Gate::Stale { last: 5 }.into_error(5),
            Some(ProjectorError::StaleOrDuplicateEvent {
                sequence: 5,
                last: 5
            })
        ));
        assert!(matches!(
            Gate::Gap {
                last: 1,
                previous: 3
            }
            .into_error(4),
            Some(ProjectorError::OutOfOrderEvent { .. })
        ));
    }

    #[test]
    fn test_with_positions_seeds_maximum() {
        let t = SequenceTracker::with_positions(vec![(key(), 3), (key(), 9), (key(), 5)]);
        assert_eq!(t.last(&key()), Some(9));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_position_statement() {
        let ev = event(15, None);
        let stmt = position_statement("projections", &key(), &ev).unwrap();
        assert!(stmt.sql().starts_with(
            "INSERT INTO projections.current_sequences (projection_name, instance_id, aggregate_type, aggregate_id, sequence, event_date, change_date)"
        ));
        assert!(stmt.sql().contains(
            "ON CONFLICT (projection_name, instance_id, aggregate_type, aggregate_id) DO UPDATE SET sequence = EXCLUDED.sequence"
        ));
        assert_eq!(stmt.args().len(), 6);
    }

    #[test]
    fn test_positions_ddl_mentions_primary_key() {
        let ddl = positions_ddl("projections");
        assert!(ddl.contains("projections.current_sequences"));
        assert!(ddl.contains("PRIMARY KEY (projection_name, instance_id, aggregate_type, aggregate_id)"));
    }

    #[tokio::test]
    async fn test_lease_serializes_same_key() {
        let t = Arc::new(SequenceTracker::new());
        let first = t.lease(&key()).await;

        let t2 = Arc::clone(&t);
        let waiter = tokio::spawn(async move {
            let _second = t2.lease(&key()).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second lease must wait for the first");

        drop(first);
        waiter.await.unwrap();
        assert_eq!(t.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_leases_on_different_keys_do_not_block() {
        let t = SequenceTracker::new();
        let _a = t.lease(&key()).await;
        let other = PositionKey::new("projects", event(1, None).aggregate_key());
        let _b = t.lease(&other).await;
        assert_eq!(t.active_leases(), 2);
    }
}
