//! Applying one event to one projection.
//!
//! [`ProjectionHandler::apply`] runs the full pipeline for a single
//! (projection, event) pair:
//!
//! 1. lease the position key, so no other delivery for the same aggregate
//!    and projection can interleave;
//! 2. gate on the recorded position: stale events are skipped, gaps are
//!    reported or tolerated per [`GapPolicy`];
//! 3. reduce the event into statements;
//! 4. execute them together with the position upsert as one batch,
//!    resubmitting the batch unchanged with backoff on transient failures;
//! 5. commit the new position in the tracker.
//!
//! The batch is atomic, so a failure in 3–5 leaves both the rows and the
//! position where they were and redelivery applies the event exactly once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info_span, warn};

use crate::config::{EngineConfig, GapPolicy};
use crate::error::{ProjectorError, RetryState};
use crate::event::Event;
use crate::executor::{ExecError, StatementExecutor};
use crate::monitor::{AlertEvent, ProjectionStats, emit_alert};
use crate::projection::Projection;
use crate::sequence::{Gate, PositionKey, SequenceTracker, position_statement};
use crate::sql::Statement;

/// What happened to an event that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Statements were executed (possibly none) and the position advanced.
    Applied { statements: usize, rows_affected: u64 },
    /// Already applied; nothing was executed.
    Skipped { last: u64 },
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }
}

/// Shared pipeline state for all projections.
pub struct ProjectionHandler {
    executor: Arc<dyn StatementExecutor>,
    tracker: Arc<SequenceTracker>,
    config: EngineConfig,
}

impl ProjectionHandler {
    pub fn new(
        executor: Arc<dyn StatementExecutor>,
        tracker: Arc<SequenceTracker>,
        config: EngineConfig,
    ) -> Self {
        ProjectionHandler {
            executor,
            tracker,
            config,
        }
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply `event` to `projection`, recording the result in `stats`.
    pub async fn apply(
        &self,
        projection: &Projection,
        event: &Event,
        stats: &ProjectionStats,
    ) -> Result<ApplyOutcome, ProjectorError> {
        let span = info_span!(
            "apply",
            projection = projection.name(),
            event_type = %event.event_type,
            aggregate = %event.aggregate_key(),
            sequence = event.sequence,
        );
        let result = self.apply_inner(projection, event, stats).instrument(span).await;
        match &result {
            Ok(ApplyOutcome::Applied {
                statements,
                rows_affected,
            }) => stats.record_applied(*statements, *rows_affected),
            Ok(ApplyOutcome::Skipped { .. }) => stats.record_skipped(),
            Err(err) => {
                stats.record_failure(err);
                if err.should_alert() {
                    emit_alert(
                        AlertEvent::ProjectionFailed,
                        projection.name(),
                        serde_json::json!({
                            "event_type": event.event_type.as_str(),
                            "aggregate": event.aggregate_key().to_string(),
                            "sequence": event.sequence,
                            "kind": err.kind().to_string(),
                            "error": err.to_string(),
                        }),
                    );
                }
            }
        }
        result
    }

    async fn apply_inner(
        &self,
        projection: &Projection,
        event: &Event,
        stats: &ProjectionStats,
    ) -> Result<ApplyOutcome, ProjectorError> {
        let key = PositionKey::new(projection.name(), event.aggregate_key());
        let _lease = self.tracker.lease(&key).await;

        match self.tracker.check(&key, event) {
            Gate::Apply => {}
            stale @ Gate::Stale { last } => {
                if let Some(err) = stale.into_error(event.sequence) {
                    debug!(kind = %err.kind(), error = %err, "skipping already applied event");
                }
                return Ok(ApplyOutcome::Skipped { last });
            }
            gap @ Gate::Gap { last, previous } => {
                emit_alert(
                    AlertEvent::SequenceGap,
                    projection.name(),
                    serde_json::json!({
                        "aggregate": key.aggregate.to_string(),
                        "sequence": event.sequence,
                        "previous": previous,
                        "last": last,
                    }),
                );
                if self.config.gap_policy == GapPolicy::Fail {
                    if let Some(err) = gap.into_error(event.sequence) {
                        return Err(err);
                    }
                }
                warn!(last, previous, "applying event across a sequence gap");
            }
        }

        let mut batch = projection.reduce(event)?;
        let statements = batch.len();
        // Also for empty reductions: the persisted position has to follow
        // the aggregate's `previous_sequence` chain to survive a restart.
        if self.config.persist_positions {
            batch.push(position_statement(
                &self.config.projection_schema,
                &key,
                event,
            )?);
        }
        let rows_affected = if batch.is_empty() {
            0
        } else {
            let affected = self.execute_with_retry(&batch, stats).await?;
            affected.iter().take(statements).sum::<u64>()
        };
        self.tracker.commit(&key, event.sequence);

        debug!(statements, rows_affected, "event applied");
        Ok(ApplyOutcome::Applied {
            statements,
            rows_affected,
        })
    }

    /// Execute one batch atomically, resubmitting it unchanged on transient
    /// failures until the retry budget is spent.
    async fn execute_with_retry(
        &self,
        batch: &[Statement],
        stats: &ProjectionStats,
    ) -> Result<Vec<u64>, ProjectorError> {
        let mut retry = RetryState::new();
        loop {
            match self.executor.execute_batch(batch).await {
                Ok(rows) => return Ok(rows),
                Err(ExecError::Transient(msg)) => match retry.record_failure(&self.config.retry) {
                    Some(delay_ms) => {
                        warn!(
                            attempt = retry.attempts,
                            max_attempts = self.config.retry.max_attempts,
                            delay_ms,
                            error = %msg,
                            "transient storage failure, retrying"
                        );
                        stats.record_retry();
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                    None => return Err(ProjectorError::TransientStorageFailure(msg)),
                },
                Err(fatal) => return Err(fatal.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RetryPolicy;
    use crate::memory::MemoryExecutor;
    use crate::projection::test_helpers::test_event;
    use crate::projection::{ProjectionRegistry, org};
    use crate::sql::{Predicate, Table, Value};
    use serde_json::json;

    struct Fixture {
        exec: Arc<MemoryExecutor>,
        handler: ProjectionHandler,
        orgs: Projection,
        stats: ProjectionStats,
    }

    fn fixture(config: EngineConfig) -> Fixture {
        let registry = ProjectionRegistry::standard("projections").unwrap();
        let exec = Arc::new(MemoryExecutor::for_registry(&registry, "projections"));
        let handler = ProjectionHandler::new(
            exec.clone(),
            Arc::new(SequenceTracker::new()),
            config,
        );
        Fixture {
            exec,
            handler,
            orgs: org::projection("projections").unwrap(),
            stats: ProjectionStats::new("orgs", 2),
        }
    }

    fn fast_retry() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                base_delay_ms: 1,
                max_delay_ms: 2,
                max_attempts: 3,
            },
            ..EngineConfig::default()
        }
    }

    fn org_event(event_type: &str, seq: u64, previous: Option<u64>) -> Event {
        let mut ev = test_event(event_type, "org", json!({"name": format!("v{seq}")}));
        ev.sequence = seq;
        ev.previous_sequence = previous;
        ev
    }

    fn org_name(exec: &MemoryExecutor) -> Option<Value> {
        exec.find(
            &Table::new("projections", "orgs"),
            &Predicate::new().eq("instance_id", "instance-id").eq("id", "agg-id"),
        )
        .and_then(|r| r.get("name").cloned())
    }

    #[tokio::test]
    async fn test_apply_then_redeliver_is_skipped() {
        let f = fixture(fast_retry());
        let ev = org_event("org.added", 1, None);
        let out = f.handler.apply(&f.orgs, &ev, &f.stats).await.unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Applied {
                statements: 1,
                rows_affected: 1
            }
        );
        let calls = f.exec.attempts();

        let again = f.handler.apply(&f.orgs, &ev, &f.stats).await.unwrap();
        assert_eq!(again, ApplyOutcome::Skipped { last: 1 });
        assert_eq!(f.exec.attempts(), calls, "redelivery must not reach the executor");
        assert_eq!(f.stats.snapshot().skipped, 1);
    }

    #[tokio::test]
    async fn test_position_is_persisted() {
        let f = fixture(fast_retry());
        f.handler
            .apply(&f.orgs, &org_event("org.added", 4, None), &f.stats)
            .await
            .unwrap();
        let positions = f.exec.rows(&Table::new("projections", "current_sequences"));
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].get("sequence"), Some(&Value::Int(4)));
        assert_eq!(positions[0].get("projection_name"), Some(&Value::Text("orgs".into())));
    }

    #[tokio::test]
    async fn test_gap_fails_by_default_and_keeps_position() {
        let f = fixture(fast_retry());
        f.handler
            .apply(&f.orgs, &org_event("org.added", 1, None), &f.stats)
            .await
            .unwrap();
        let err = f
            .handler
            .apply(&f.orgs, &org_event("org.changed", 5, Some(3)), &f.stats)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProjectorError::OutOfOrderEvent {
                sequence: 5,
                previous: 3,
                last: 1
            }
        ));
        let key = PositionKey::new("orgs", org_event("org.added", 1, None).aggregate_key());
        assert_eq!(f.handler.tracker().last(&key), Some(1));
        assert_eq!(org_name(&f.exec), Some(Value::Text("v1".into())));
    }

    #[tokio::test]
    async fn test_gap_applied_when_configured() {
        let f = fixture(EngineConfig {
            gap_policy: GapPolicy::Apply,
            ..fast_retry()
        });
        f.handler
            .apply(&f.orgs, &org_event("org.added", 1, None), &f.stats)
            .await
            .unwrap();
        let out = f
            .handler
            .apply(&f.orgs, &org_event("org.changed", 5, Some(3)), &f.stats)
            .await
            .unwrap();
        assert!(out.is_applied());
        assert_eq!(org_name(&f.exec), Some(Value::Text("v5".into())));
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_with_same_statement() {
        let f = fixture(fast_retry());
        f.exec.fail_next(ExecError::Transient("deadlock detected".into()));
        f.exec.fail_next(ExecError::Transient("deadlock detected".into()));
        let out = f
            .handler
            .apply(&f.orgs, &org_event("org.added", 1, None), &f.stats)
            .await
            .unwrap();
        assert!(out.is_applied());
        // One batch holds the insert and the position
        assert_eq!(f.exec.attempts(), 3);
        assert_eq!(f.stats.snapshot().retries, 2);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let f = fixture(fast_retry());
        for _ in 0..3 {
            f.exec.fail_next(ExecError::Transient("connection reset".into()));
        }
        let err = f
            .handler
            .apply(&f.orgs, &org_event("org.added", 1, None), &f.stats)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.exec.attempts(), 3);
        assert_eq!(f.exec.count(&Table::new("projections", "orgs")), 0);
    }

    #[tokio::test]
    async fn test_fatal_failures_mark_projection_unhealthy() {
        let f = fixture(fast_retry());
        for seq in 1..=2 {
            f.exec.fail_next(ExecError::Fatal("undefined column".into()));
            let err = f
                .handler
                .apply(&f.orgs, &org_event("org.added", seq, None), &f.stats)
                .await
                .unwrap_err();
            assert!(matches!(err, ProjectorError::FatalStorageFailure(_)));
        }
        assert_eq!(f.exec.attempts(), 2, "fatal failures are not retried");
        assert_eq!(
            f.stats.status(),
            crate::monitor::ProjectionStatus::Unhealthy
        );
    }

    #[tokio::test]
    async fn test_undecodable_payload_does_not_advance_position() {
        let f = fixture(fast_retry());
        let mut ev = org_event("org.added", 1, None);
        ev.payload = json!({"name": 42});
        let err = f.handler.apply(&f.orgs, &ev, &f.stats).await.unwrap_err();
        assert!(matches!(err, ProjectorError::InvalidPayload { .. }));
        assert!(f.handler.tracker().is_empty());
        assert_eq!(f.exec.attempts(), 0);
    }

    #[tokio::test]
    async fn test_unhandled_event_only_advances_position() {
        let f = fixture(fast_retry());
        let ev = org_event("org.domain.added", 7, None);
        let out = f.handler.apply(&f.orgs, &ev, &f.stats).await.unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Applied {
                statements: 0,
                rows_affected: 0
            }
        );
        assert_eq!(f.exec.attempts(), 1, "one batch with only the position upsert");
        assert_eq!(f.exec.count(&Table::new("projections", "orgs")), 0);
        let key = PositionKey::new("orgs", ev.aggregate_key());
        assert_eq!(f.handler.tracker().last(&key), Some(7));
    }

    #[tokio::test]
    async fn test_lost_position_write_rolls_back_the_rows() {
        let f = fixture(fast_retry());
        let positions = Table::new("projections", "current_sequences");
        let orgs = Table::new("projections", "orgs");
        f.exec
            .fail_next_write_to(&positions, ExecError::Fatal("position write lost".into()));
        let ev = org_event("org.added", 1, None);

        let err = f.handler.apply(&f.orgs, &ev, &f.stats).await.unwrap_err();
        assert!(matches!(err, ProjectorError::FatalStorageFailure(_)));
        assert_eq!(f.exec.count(&orgs), 0);
        assert!(f.handler.tracker().is_empty());

        // Redelivery inserts once instead of hitting a duplicate key
        let out = f.handler.apply(&f.orgs, &ev, &f.stats).await.unwrap();
        assert_eq!(
            out,
            ApplyOutcome::Applied {
                statements: 1,
                rows_affected: 1
            }
        );
        assert_eq!(f.exec.count(&orgs), 1);
        assert_eq!(f.exec.count(&positions), 1);
        assert_eq!(f.stats.snapshot().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_stale_event_is_classified_not_failed() {
        let f = fixture(fast_retry());
        let ev = org_event("org.added", 2, None);
        f.handler.apply(&f.orgs, &ev, &f.stats).await.unwrap();
        let key = PositionKey::new("orgs", ev.aggregate_key());
        let gate = f.handler.tracker().check(&key, &org_event("org.changed", 1, None));
        let err = gate.into_error(1).unwrap();
        assert_eq!(err.kind(), crate::error::ProjectorErrorKind::Sequence);
        assert!(!err.should_alert());

        let out = f
            .handler
            .apply(&f.orgs, &org_event("org.changed", 1, None), &f.stats)
            .await
            .unwrap();
        assert_eq!(out, ApplyOutcome::Skipped { last: 2 });
        assert_eq!(f.stats.snapshot().failed, 0);
    }

    #[tokio::test]
    async fn test_no_batch_without_statements_or_positions() {
        let f = fixture(EngineConfig {
            persist_positions: false,
            ..fast_retry()
        });
        let ev = org_event("org.domain.added", 3, None);
        let out = f.handler.apply(&f.orgs, &ev, &f.stats).await.unwrap();
        assert!(out.is_applied());
        assert_eq!(f.exec.attempts(), 0);
        let key = PositionKey::new("orgs", ev.aggregate_key());
        assert_eq!(f.handler.tracker().last(&key), Some(3));
    }
}
