//! Worker pool for concurrent event application.
//!
//! # Architecture
//! - `worker_count` lanes, each a tokio task draining a bounded channel of
//!   `lane_capacity` events
//! - Events are routed by an xxHash of their aggregate key
//!   ([`hash::lane_for`]), so one aggregate instance is always processed by
//!   the same lane, in submission order
//! - Different aggregate instances proceed in parallel on other lanes
//! - A full lane applies backpressure: [`WorkerPool::submit`] waits for room
//!
//! # Shutdown
//! [`WorkerPool::shutdown`] closes every channel; lanes finish the events
//! already queued and exit. Nothing in flight is cancelled.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span};

use crate::engine::{DispatchResult, Projector};
use crate::error::ProjectorError;
use crate::event::Event;
use crate::hash;

struct Job {
    event: Event,
    reply: oneshot::Sender<Vec<DispatchResult>>,
}

/// Handle to a submitted event's results.
pub type Pending = oneshot::Receiver<Vec<DispatchResult>>;

pub struct WorkerPool {
    lanes: Vec<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the lanes. Must be called inside a tokio runtime.
    pub fn start(projector: Arc<Projector>) -> Self {
        let config = projector.config();
        let (workers, capacity) = (config.worker_count.max(1), config.lane_capacity.max(1));

        let mut lanes = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for lane in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            let span = info_span!("lane", lane);
            handles.push(tokio::spawn(
                run_lane(Arc::clone(&projector), rx).instrument(span),
            ));
            lanes.push(tx);
        }
        info!(workers, capacity, "worker pool started");
        WorkerPool { lanes, handles }
    }

    pub fn worker_count(&self) -> usize {
        self.lanes.len()
    }

    pub fn lane_for(&self, event: &Event) -> usize {
        hash::lane_for(&event.aggregate_key(), self.lanes.len())
    }

    /// Queue an event on its aggregate's lane. Await the returned receiver
    /// for the per-projection results.
    pub async fn submit(&self, event: Event) -> Result<Pending, ProjectorError> {
        let lane = self.lane_for(&event);
        let (reply, pending) = oneshot::channel();
        self.lanes[lane]
            .send(Job { event, reply })
            .await
            .map_err(|_| ProjectorError::InternalError(format!("lane {lane} is closed")))?;
        Ok(pending)
    }

    /// Submit and wait for the results.
    pub async fn apply(&self, event: Event) -> Result<Vec<DispatchResult>, ProjectorError> {
        self.submit(event)
            .await?
            .await
            .map_err(|_| ProjectorError::InternalError("lane dropped the event".into()))
    }

    /// Close all lanes and wait for queued events to drain.
    pub async fn shutdown(self) -> Result<(), ProjectorError> {
        drop(self.lanes);
        let mut failed = 0;
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "lane terminated abnormally");
                failed += 1;
            }
        }
        info!("worker pool stopped");
        if failed > 0 {
            return Err(ProjectorError::InternalError(format!(
                "{failed} lane(s) terminated abnormally"
            )));
        }
        Ok(())
    }
}

async fn run_lane(projector: Arc<Projector>, mut rx: mpsc::Receiver<Job>) {
    while let Some(Job { event, reply }) = rx.recv().await {
        let results = projector.apply(&event).await;
        if reply.send(results).is_err() {
            debug!(sequence = event.sequence, "submitter no longer waiting for results");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::memory::MemoryExecutor;
    use crate::projection::ProjectionRegistry;
    use crate::projection::test_helpers::test_event;
    use serde_json::json;

    fn pool(workers: usize) -> (WorkerPool, Arc<Projector>) {
        let registry = ProjectionRegistry::standard("projections").unwrap();
        let exec = Arc::new(MemoryExecutor::for_registry(&registry, "projections"));
        let config = EngineConfig {
            worker_count: workers,
            lane_capacity: 4,
            ..EngineConfig::default()
        };
        let projector = Arc::new(Projector::new(registry, exec, config).unwrap());
        (WorkerPool::start(Arc::clone(&projector)), projector)
    }

    fn org(id: &str, event_type: &str, seq: u64) -> Event {
        let mut ev = test_event(event_type, "org", json!({"name": format!("{id}-{seq}")}));
        ev.aggregate_id = id.to_string();
        ev.sequence = seq;
        ev.previous_sequence = (seq > 1).then(|| seq - 1);
        ev
    }

    #[tokio::test]
    async fn test_same_aggregate_same_lane() {
        let (pool, _) = pool(4);
        assert_eq!(
            pool.lane_for(&org("a", "org.added", 1)),
            pool.lane_for(&org("a", "org.changed", 9))
        );
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_submitted_events_apply_in_order() {
        let (pool, projector) = pool(3);
        let mut pending = Vec::new();
        for id in ["a", "b", "c", "d"] {
            pending.push(pool.submit(org(id, "org.added", 1)).await.unwrap());
            for seq in 2..=5 {
                pending.push(pool.submit(org(id, "org.changed", seq)).await.unwrap());
            }
        }
        for p in pending {
            let results = p.await.unwrap();
            assert!(results.iter().all(DispatchResult::is_ok), "{results:?}");
        }
        let snap = projector.stats();
        let orgs = snap.iter().find(|s| s.projection == "orgs").unwrap();
        assert_eq!(orgs.applied, 20);
        assert_eq!(orgs.failed, 0);
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_apply_waits_for_results() {
        let (pool, _) = pool(2);
        let results = pool.apply(org("a", "org.added", 1)).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_events() {
        let (pool, projector) = pool(1);
        let mut pending = Vec::new();
        for seq in 1..=3 {
            let ev = if seq == 1 {
                org("a", "org.added", 1)
            } else {
                org("a", "org.changed", seq)
            };
            pending.push(pool.submit(ev).await.unwrap());
        }
        pool.shutdown().await.unwrap();
        for p in pending {
            assert!(p.await.is_ok());
        }
        let key = crate::sequence::PositionKey::new("orgs", org("a", "org.added", 1).aggregate_key());
        assert_eq!(projector.tracker().last(&key), Some(3));
    }
}
