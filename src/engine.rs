//! Engine facade.
//!
//! A [`Projector`] wires the registry, sequence tracker, executor and
//! monitor together. [`Projector::apply`] fans one event out to every
//! projection that has something to do for it; each projection succeeds or
//! fails independently.

use std::sync::Arc;

use tracing::info;

use crate::config::EngineConfig;
use crate::error::ProjectorError;
use crate::event::Event;
use crate::executor::StatementExecutor;
use crate::handler::{ApplyOutcome, ProjectionHandler};
use crate::monitor::{Monitor, StatsSnapshot};
use crate::projection::ProjectionRegistry;
use crate::sequence::SequenceTracker;

/// Result of applying one event to one projection.
#[derive(Debug)]
pub struct DispatchResult {
    pub projection: String,
    pub result: Result<ApplyOutcome, ProjectorError>,
}

impl DispatchResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

pub struct Projector {
    registry: Arc<ProjectionRegistry>,
    handler: ProjectionHandler,
    monitor: Monitor,
}

impl Projector {
    /// Build an engine over `registry`. Fails on an invalid configuration.
    pub fn new(
        registry: ProjectionRegistry,
        executor: Arc<dyn StatementExecutor>,
        config: EngineConfig,
    ) -> Result<Self, ProjectorError> {
        Self::with_tracker(registry, executor, Arc::new(SequenceTracker::new()), config)
    }

    /// Like [`Projector::new`], resuming from an existing tracker (e.g. one
    /// seeded from persisted positions).
    pub fn with_tracker(
        registry: ProjectionRegistry,
        executor: Arc<dyn StatementExecutor>,
        tracker: Arc<SequenceTracker>,
        config: EngineConfig,
    ) -> Result<Self, ProjectorError> {
        config.validate()?;
        if registry.is_empty() {
            return Err(ProjectorError::InvalidConfig(
                "no projections registered".into(),
            ));
        }
        // Reject overlapping cascade edges up front.
        registry.cascade_graph()?;

        let monitor = Monitor::new(
            registry.iter().map(|p| p.name()),
            config.max_consecutive_failures,
        );
        info!(
            projections = registry.len(),
            positions = tracker.len(),
            "projector initialized"
        );
        Ok(Projector {
            registry: Arc::new(registry),
            handler: ProjectionHandler::new(executor, tracker, config),
            monitor,
        })
    }

    /// Apply `event` to every interested projection, in registration order.
    pub async fn apply(&self, event: &Event) -> Vec<DispatchResult> {
        let mut results = Vec::new();
        for projection in self.registry.interested(event) {
            let result = match self.monitor.stats(projection.name()) {
                Some(stats) => self.handler.apply(projection, event, stats).await,
                None => Err(ProjectorError::InternalError(format!(
                    "no stats for projection {}",
                    projection.name()
                ))),
            };
            results.push(DispatchResult {
                projection: projection.name().to_string(),
                result,
            });
        }
        results
    }

    pub fn config(&self) -> &EngineConfig {
        self.handler.config()
    }

    pub fn registry(&self) -> &ProjectionRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &SequenceTracker {
        self.handler.tracker()
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn stats(&self) -> Vec<StatsSnapshot> {
        self.monitor.snapshot()
    }
}
