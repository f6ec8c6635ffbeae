//! Worker pool behavior under concurrent load.
//!
//! - per-aggregate ordering holds with many aggregates across few lanes
//! - tiny lane capacities only slow submission down
//! - failures on one aggregate do not stall other lanes

mod common;

use serde_json::json;

use common::*;
use pg_projector::sql::Value;
use pg_projector::{ExecError, WorkerPool};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_aggregate_order_under_load() {
    let mut config = fast_config();
    config.worker_count = 3;
    config.lane_capacity = 1;
    let (projector, exec) = memory_projector(config);
    let pool = WorkerPool::start(projector.clone());

    let mut f = Feed::new();
    let orgs: Vec<String> = (0..25).map(|i| format!("org-{i}")).collect();
    let mut events = Vec::new();
    for org in &orgs {
        events.push(f.org(org, "org.added", json!({"name": format!("{org} v0")})));
    }
    // Round-robin the changes so lanes interleave
    for version in 1..=8 {
        for org in &orgs {
            events.push(f.org(org, "org.changed", json!({"name": format!("{org} v{version}")})));
        }
    }

    let mut pending = Vec::new();
    for event in events {
        pending.push(pool.submit(event).await.unwrap());
    }
    for p in pending {
        let results = p.await.unwrap();
        assert!(results.iter().all(|r| r.is_ok()), "{results:?}");
    }
    pool.shutdown().await.unwrap();

    for org in &orgs {
        let row = find(&exec, "orgs", &[("instance_id", INSTANCE), ("id", org.as_str())]).unwrap();
        assert_eq!(row.get("name"), Some(&Value::Text(format!("{org} v8"))));
    }
    let stats = projector.stats();
    let org_stats = stats.iter().find(|s| s.projection == "orgs").unwrap();
    assert_eq!(org_stats.applied, 25 * 9);
    assert_eq!(org_stats.skipped, 0);
}

#[tokio::test]
async fn test_failure_on_one_aggregate_does_not_stall_others() {
    let mut config = fast_config();
    config.worker_count = 2;
    let (projector, exec) = memory_projector(config);
    let pool = WorkerPool::start(projector.clone());
    let mut f = Feed::new();

    // Applied alone so the injected failure hits exactly this event
    exec.fail_next(ExecError::Fatal("check constraint violated".into()));
    let failed = pool
        .apply(f.org("org-bad", "org.added", json!({"name": "bad"})))
        .await
        .unwrap();
    assert!(failed[0].result.is_err());

    for i in 0..10 {
        let results = pool
            .apply(f.org(&format!("org-{i}"), "org.added", json!({"name": "ok"})))
            .await
            .unwrap();
        assert!(results[0].is_ok());
    }
    pool.shutdown().await.unwrap();
    assert_eq!(exec.count(&table("orgs")), 10);
}

#[tokio::test]
async fn test_same_aggregate_events_share_a_lane() {
    let (projector, _) = memory_projector(fast_config());
    let pool = WorkerPool::start(projector);
    let mut f = Feed::new();
    let added = f.user("org", "u", "user.human.added", json!({"userName": "u"}));
    let changed = f.user("org", "u", "user.human.profile.changed", json!({"nickName": "n"}));
    let other_tenant = Feed::for_instance("other").user("org", "u", "user.removed", json!({}));

    assert_eq!(pool.lane_for(&added), pool.lane_for(&changed));
    assert!(pool.lane_for(&other_tenant) < pool.worker_count());
    pool.shutdown().await.unwrap();
}
