//! Integration tests for reconciliation, the freshness marker, and
//! proactive replication.

#[allow(dead_code)]
mod common;

use common::{hash, with_size, TestNode, TestSetup};
use chrono::Utc;
use locus::events::LocationEvent;
use locus::types::{ContentInfo, Role};
use std::time::Duration;

fn info(prefix: u8, size: u64, last_access: i64) -> ContentInfo {
    ContentInfo {
        hash: hash(prefix),
        size,
        last_access_utc: last_access,
    }
}

fn reconcile_events(node: &TestNode) -> Vec<LocationEvent> {
    node.bus
        .log()
        .into_iter()
        .map(|e| e.event)
        .filter(|e| matches!(e, LocationEvent::Reconciled { .. }))
        .collect()
}

#[tokio::test]
async fn test_reconciliation_emits_sorted_diff() {
    let node = TestNode::start(Role::Master).await;
    let local = node.store.local_machine_id().unwrap();
    let now = Utc::now().timestamp();

    // Local content is {a, b, d}; the database credits us with {b, c, d}.
    node.content.set_inventory(vec![
        info(1, 10, now),
        info(2, 20, now),
        info(4, 40, now),
    ]);
    let db = node.store.database();
    for prefix in [2u8, 3, 4] {
        db.apply_add(local, &[with_size(prefix, prefix as u64 * 10)], true, now)
            .unwrap();
    }

    let outcome = node.store.reconcile().await.unwrap();

    assert!(!outcome.skipped);
    assert_eq!(outcome.cycles, 1);
    assert_eq!(outcome.hashes_added, 1);
    assert_eq!(outcome.hashes_removed, 1);

    let events = reconcile_events(&node);
    assert_eq!(events.len(), 1);
    match &events[0] {
        LocationEvent::Reconciled {
            machine,
            added,
            removed,
        } => {
            assert_eq!(*machine, local);
            assert_eq!(added, &vec![with_size(1, 10)]);
            assert_eq!(removed, &vec![hash(3)]);
        }
        other => panic!("expected Reconciled, got {:?}", other),
    }

    // The marker records the prefix and a parseable timestamp.
    let marker = node.env.working_dir.join("reconcileMarker.txt");
    let content = tokio::fs::read_to_string(&marker).await.unwrap();
    let (prefix, timestamp) = content.split_once('|').unwrap();
    assert_eq!(prefix, "test");
    assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());

    // The compensating events flow back into our own database.
    node.drain_events().await;
    assert!(db.get(&hash(1)).unwrap().locations.contains(local));
    assert!(!db.get(&hash(3)).unwrap().locations.contains(local));
}

#[tokio::test]
async fn test_reconciliation_skips_while_marker_fresh() {
    let node = TestNode::start(Role::Master).await;
    let now = Utc::now().timestamp();

    node.content.set_inventory(vec![info(1, 10, now)]);
    let first = node.store.reconcile().await.unwrap();
    assert!(!first.skipped);
    let events_after_first = node.bus.log().len();

    // Content changed, but the marker is fresh: nothing runs.
    node.content.set_inventory(vec![info(2, 20, now)]);
    let second = node.store.reconcile().await.unwrap();
    assert!(second.skipped);
    assert_eq!(node.bus.log().len(), events_after_first);
}

#[tokio::test]
async fn test_reconciliation_cycles_until_diff_fits() {
    let node = TestNode::start_with(Role::Master, |config| {
        config.reconciliation.max_cycle_size = 2;
        config.reconciliation.cycle_frequency = Duration::ZERO;
    })
    .await;
    let now = Utc::now().timestamp();

    node.content.set_inventory(vec![
        info(1, 10, now),
        info(2, 20, now),
        info(3, 30, now),
        info(4, 40, now),
        info(5, 50, now),
    ]);

    let outcome = node.store.reconcile().await.unwrap();

    // Two full cycles of two, then a final cycle of one.
    assert_eq!(outcome.cycles, 3);
    assert_eq!(outcome.hashes_added, 5);
    assert_eq!(outcome.hashes_removed, 0);
    assert_eq!(reconcile_events(&node).len(), 3);
}

#[tokio::test]
async fn test_post_restore_reconciliation_runs_once() {
    let setup = TestSetup::new(Role::Master);
    let now = Utc::now().timestamp();
    setup.content.set_inventory(vec![info(1, 10, now)]);
    let node = setup
        .start(|config| {
            config.reconciliation.enabled = true;
        })
        .await;

    // The post-restore reconciliation task runs in the background.
    let mut reconciled = false;
    for _ in 0..100 {
        if reconcile_events(&node).len() == 1 {
            reconciled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reconciled, "post-restore reconciliation did not run");

    // Later heartbeats do not trigger another pass.
    node.store.heartbeat().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reconcile_events(&node).len(), 1);
}

#[tokio::test]
async fn test_invalidate_local_machine_clears_marker() {
    let node = TestNode::start(Role::Master).await;
    let local = node.store.local_machine_id().unwrap();
    let now = Utc::now().timestamp();

    node.content.set_inventory(vec![info(1, 10, now)]);
    node.store.reconcile().await.unwrap();
    let marker = node.env.working_dir.join("reconcileMarker.txt");
    assert!(marker.exists());

    node.store.invalidate_local_machine().await.unwrap();

    assert!(!marker.exists());
    assert_eq!(node.global.invalidated_machines(), vec![local]);

    // With the marker gone, the next reconcile runs again.
    let outcome = node.store.reconcile().await.unwrap();
    assert!(!outcome.skipped);
}

#[tokio::test]
async fn test_proactive_replication_copies_after_first_restore() {
    let setup = TestSetup::new(Role::Master);
    let now = Utc::now().timestamp();
    setup
        .content
        .set_inventory(vec![info(1, 10, now), info(2, 20, now)]);
    let node = setup
        .start(|config| {
            config.replication.enabled = true;
            config.replication.inline = true;
            config.replication.locations_threshold = 3;
            config.replication.delay = Duration::ZERO;
            config.replication.copy_limit = 10;
        })
        .await;

    // Both entries are unknown to the database, so both are
    // under-replicated and both get copied during post-initialization.
    let mut copied = node.copier.copied();
    copied.sort();
    assert_eq!(copied, vec![hash(1), hash(2)]);

    let stats = node.store.stats();
    assert_eq!(stats.replication.copies_succeeded, 2);
    assert_eq!(stats.replication.copies_failed, 0);
}

#[tokio::test]
async fn test_proactive_replication_respects_copy_limit() {
    let setup = TestSetup::new(Role::Master);
    let now = Utc::now().timestamp();
    setup.content.set_inventory(vec![
        info(1, 10, now),
        info(2, 20, now),
        info(3, 30, now),
    ]);
    let node = setup
        .start(|config| {
            config.replication.enabled = true;
            config.replication.inline = true;
            config.replication.locations_threshold = 3;
            config.replication.delay = Duration::ZERO;
            config.replication.copy_limit = 2;
        })
        .await;

    assert_eq!(node.copier.copied().len(), 2);
}
