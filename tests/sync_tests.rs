// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end synchronization scenarios against in-memory endpoints.
//!
//! # Test Organization
//! - `continuous_*` - live subscription plus backfill behavior
//! - `periodic_*` - pull-only interval mode
//! - `controller_*` - registry enumeration, topology updates, shutdown

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, MockConnector, MockHds};
use hds_sync::client::TimeSeriesClient;
use hds_sync::pool::{Connector, ConnectionPool};
use hds_sync::sync::{Controller, Synchronizer};

const SERIES: &str = "kitchen/temp";

fn destinations(pairs: &[(&str, &Arc<MockHds>)]) -> HashMap<String, Arc<dyn TimeSeriesClient>> {
    pairs
        .iter()
        .map(|(host, hds)| {
            (
                host.to_string(),
                Arc::clone(*hds) as Arc<dyn TimeSeriesClient>,
            )
        })
        .collect()
}

fn seconds(range: std::ops::RangeInclusive<i64>) -> Vec<f64> {
    range.map(|i| i as f64).collect()
}

// =============================================================================
// Continuous mode
// =============================================================================

/// Cold start: the destination receives everything the source already
/// holds within one subscription round.
#[tokio::test]
async fn continuous_cold_start_backfills_destination() {
    let src = MockHds::new();
    let dst = MockHds::new();
    src.add_records(SERIES, &[1.0, 2.0, 3.0]).await;

    let sync = Synchronizer::spawn(
        SERIES,
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        destinations(&[("hds-b:8088", &dst)]),
        None,
    );

    wait_until("destination holds {1,2,3}", Duration::from_secs(5), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == vec![1.0, 2.0, 3.0] }
    })
    .await;

    sync.stop().await;
}

/// A record arriving while the backfill is still running is buffered and
/// lands after the backfill completes, with no further live traffic.
#[tokio::test]
async fn continuous_live_record_survives_backfill() {
    let src = MockHds::new();
    let dst = MockHds::new();
    src.add_records(SERIES, &seconds(1..=100)).await;

    // Hold the backfill open long enough for a live record to arrive.
    src.set_query_stream_chunk(25);
    src.set_query_stream_delay(Duration::from_millis(50));

    let sync = Synchronizer::spawn(
        SERIES,
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        destinations(&[("hds-b:8088", &dst)]),
        None,
    );

    wait_until("subscription open", Duration::from_secs(5), || {
        let src = Arc::clone(&src);
        async move { src.has_subscriber(SERIES).await }
    })
    .await;

    // Arrives mid-backfill; must be buffered, not lost.
    src.publish(SERIES, &[101.0]).await;

    wait_until("destination holds {1..101}", Duration::from_secs(10), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == seconds(1..=101) }
    })
    .await;

    sync.stop().await;
}

/// Live records flow straight through once cursors match.
#[tokio::test]
async fn continuous_live_records_forwarded() {
    let src = MockHds::new();
    let dst = MockHds::new();

    let sync = Synchronizer::spawn(
        SERIES,
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        destinations(&[("hds-b:8088", &dst)]),
        None,
    );

    wait_until("subscription open", Duration::from_secs(5), || {
        let src = Arc::clone(&src);
        async move { src.has_subscriber(SERIES).await }
    })
    .await;

    src.publish(SERIES, &[1.0]).await;
    src.publish(SERIES, &[2.0, 3.0]).await;

    wait_until("destination holds {1,2,3}", Duration::from_secs(5), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == vec![1.0, 2.0, 3.0] }
    })
    .await;

    sync.stop().await;
}

/// A replica added at runtime catches up from the epoch without
/// restarting the live stream of its peers.
#[tokio::test]
async fn continuous_replica_addition_catches_up() {
    let src = MockHds::new();
    let replica_a = MockHds::new();
    let replica_b = MockHds::new();
    src.add_records(SERIES, &seconds(1..=50)).await;
    replica_a.add_records(SERIES, &seconds(1..=50)).await;

    let sync = Synchronizer::spawn(
        SERIES,
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        destinations(&[("hds-a:8088", &replica_a)]),
        None,
    );

    wait_until("subscription open", Duration::from_secs(5), || {
        let src = Arc::clone(&src);
        async move { src.has_subscriber(SERIES).await }
    })
    .await;
    let subscriptions_before = src.subscribe_count();

    sync.update_destinations(
        destinations(&[("hds-b:8088", &replica_b)]),
        Vec::new(),
    )
    .await;

    wait_until("replica B holds {1..50}", Duration::from_secs(10), || {
        let b = Arc::clone(&replica_b);
        async move { b.times(SERIES).await == seconds(1..=50) }
    })
    .await;

    // Further live records land on both replicas.
    src.publish(SERIES, &[51.0]).await;
    wait_until("both replicas hold 51", Duration::from_secs(5), || {
        let a = Arc::clone(&replica_a);
        let b = Arc::clone(&replica_b);
        async move {
            a.times(SERIES).await.contains(&51.0) && b.times(SERIES).await.contains(&51.0)
        }
    })
    .await;

    assert_eq!(
        src.subscribe_count(),
        subscriptions_before,
        "adding a replica must not restart the live stream"
    );

    sync.stop().await;
}

/// Transient source loss: the loop restarts after a second and the
/// backfill catches up records that arrived during the outage.
#[tokio::test]
async fn continuous_transient_source_loss_recovers() {
    let src = MockHds::new();
    let dst = MockHds::new();
    src.add_records(SERIES, &[1.0, 2.0, 3.0]).await;

    let sync = Synchronizer::spawn(
        SERIES,
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        destinations(&[("hds-b:8088", &dst)]),
        None,
    );

    wait_until("destination holds {1,2,3}", Duration::from_secs(5), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == vec![1.0, 2.0, 3.0] }
    })
    .await;

    // Source drops the subscription; records 4 and 5 arrive during the
    // outage and are only visible via range queries.
    src.fail_subscription(SERIES).await;
    src.add_records(SERIES, &[4.0, 5.0]).await;

    wait_until("destination holds {1..5}", Duration::from_secs(10), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == seconds(1..=5) }
    })
    .await;

    // A fresh subscription was opened after the restart.
    assert!(src.subscribe_count() >= 2);

    sync.stop().await;
}

/// A rejected submit pauses only that round; the restart re-converges.
#[tokio::test]
async fn continuous_submit_failure_recovers() {
    let src = MockHds::new();
    let dst = MockHds::new();
    src.add_records(SERIES, &[1.0, 2.0, 3.0]).await;

    let sync = Synchronizer::spawn(
        SERIES,
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        destinations(&[("hds-b:8088", &dst)]),
        None,
    );

    wait_until("destination holds {1,2,3}", Duration::from_secs(5), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == vec![1.0, 2.0, 3.0] }
    })
    .await;

    dst.fail_next_submits(1);
    src.publish(SERIES, &[4.0]).await;

    wait_until("destination holds {1..4}", Duration::from_secs(10), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == seconds(1..=4) }
    })
    .await;

    sync.stop().await;
}

/// After clear(), no further writes reach any destination.
#[tokio::test]
async fn continuous_clear_stops_writes() {
    let src = MockHds::new();
    let dst = MockHds::new();

    let sync = Synchronizer::spawn(
        SERIES,
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        destinations(&[("hds-b:8088", &dst)]),
        None,
    );

    wait_until("subscription open", Duration::from_secs(5), || {
        let src = Arc::clone(&src);
        async move { src.has_subscriber(SERIES).await }
    })
    .await;

    src.publish(SERIES, &[1.0]).await;
    wait_until("destination holds {1}", Duration::from_secs(5), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == vec![1.0] }
    })
    .await;

    sync.stop().await;

    src.publish(SERIES, &[2.0]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dst.times(SERIES).await, vec![1.0], "no writes after clear");
}

/// Replaying an identical pack leaves the destination unchanged.
#[tokio::test]
async fn submit_is_idempotent() {
    let dst = MockHds::new();
    let pack: hds_sync::Pack = [1.0, 2.0]
        .iter()
        .map(|s| hds_sync::Record::new(SERIES, hds_sync::Timestamp::from_senml(*s), *s))
        .collect();

    let cancel = tokio_util::sync::CancellationToken::new();
    dst.submit(&pack, cancel.clone()).await.unwrap();
    dst.submit(&pack, cancel).await.unwrap();

    assert_eq!(dst.times(SERIES).await, vec![1.0, 2.0]);
    assert_eq!(dst.record_count(SERIES).await, 2);
}

// =============================================================================
// Periodic mode
// =============================================================================

/// Pull-only mode: no subscription, progress at tick boundaries only.
#[tokio::test]
async fn periodic_copies_at_tick_boundaries() {
    let src = MockHds::new();
    let dst = MockHds::new();
    src.add_records(SERIES, &[1.0, 2.0, 3.0]).await;

    let sync = Synchronizer::spawn(
        SERIES,
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        destinations(&[("hds-b:8088", &dst)]),
        Some(Duration::from_millis(200)),
    );

    wait_until("destination holds {1,2,3}", Duration::from_secs(5), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == vec![1.0, 2.0, 3.0] }
    })
    .await;

    // New source records are picked up on a later tick.
    src.add_records(SERIES, &[4.0, 5.0]).await;
    wait_until("destination holds {1..5}", Duration::from_secs(5), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == seconds(1..=5) }
    })
    .await;

    assert_eq!(src.subscribe_count(), 0, "periodic mode must not subscribe");

    sync.stop().await;
}

/// An already-converged pair is a no-op round: no migrate traffic.
#[tokio::test]
async fn periodic_equal_cursors_is_noop() {
    let src = MockHds::new();
    let dst = MockHds::new();
    src.add_records(SERIES, &[1.0, 2.0, 3.0]).await;
    dst.add_records(SERIES, &[1.0, 2.0, 3.0]).await;

    let sync = Synchronizer::spawn(
        SERIES,
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        destinations(&[("hds-b:8088", &dst)]),
        Some(Duration::from_millis(100)),
    );

    tokio::time::sleep(Duration::from_millis(450)).await;
    assert_eq!(dst.stream_submit_count().await, 0, "no migrate expected");
    assert_eq!(dst.submit_count().await, 0);
    assert_eq!(dst.times(SERIES).await, vec![1.0, 2.0, 3.0]);

    sync.stop().await;
}

// =============================================================================
// Controller
// =============================================================================

fn fixed_controller(src: &Arc<MockHds>, dst: &Arc<MockHds>) -> Arc<Controller> {
    let pool = Arc::new(ConnectionPool::new(Arc::new(MockConnector::new())));
    Arc::new(Controller::new(
        Arc::clone(src) as Arc<dyn TimeSeriesClient>,
        pool,
        Some((
            "hds-b:8088".to_string(),
            Arc::clone(dst) as Arc<dyn TimeSeriesClient>,
        )),
        None,
    ))
}

/// Registry enumeration creates the series on the destination, spawns a
/// synchronizer, and data converges.
#[tokio::test]
async fn controller_registry_round_starts_sync() {
    let src = MockHds::new();
    let dst = MockHds::new();
    src.register_series(&[SERIES]).await;
    src.add_records(SERIES, &[1.0, 2.0, 3.0]).await;

    let controller = fixed_controller(&src, &dst);
    controller.update_syncing().await.unwrap();

    assert_eq!(controller.active_series().await, vec![SERIES.to_string()]);
    assert_eq!(dst.registry_names().await, vec![SERIES.to_string()]);

    wait_until("destination holds {1,2,3}", Duration::from_secs(5), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == vec![1.0, 2.0, 3.0] }
    })
    .await;

    controller.stop_sync_for_all().await;
}

/// An existing destination series counts as success (idempotent create),
/// and a second round does not duplicate synchronizers.
#[tokio::test]
async fn controller_registry_add_already_exists_is_success() {
    let src = MockHds::new();
    let dst = MockHds::new();
    src.register_series(&[SERIES]).await;
    dst.register_series(&[SERIES]).await;

    let controller = fixed_controller(&src, &dst);
    controller.update_syncing().await.unwrap();
    assert_eq!(controller.active_series().await.len(), 1);

    controller.update_syncing().await.unwrap();
    assert_eq!(controller.active_series().await.len(), 1);

    controller.stop_sync_for_all().await;
}

/// A series that disappears from the source registry is cleared: removed
/// from the map, streams aborted, no further writes.
#[tokio::test]
async fn controller_removes_vanished_series() {
    let src = MockHds::new();
    let dst = MockHds::new();
    src.register_series(&[SERIES]).await;
    src.add_records(SERIES, &[1.0, 2.0, 3.0]).await;

    let controller = fixed_controller(&src, &dst);
    controller.update_syncing().await.unwrap();

    wait_until("destination holds {1,2,3}", Duration::from_secs(5), || {
        let dst = Arc::clone(&dst);
        async move { dst.times(SERIES).await == vec![1.0, 2.0, 3.0] }
    })
    .await;

    src.unregister_series(SERIES).await;
    controller.update_syncing().await.unwrap();
    assert!(controller.active_series().await.is_empty());

    // Give the canceled worker a moment to wind down, then verify silence.
    tokio::time::sleep(Duration::from_millis(100)).await;
    src.publish(SERIES, &[4.0]).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dst.times(SERIES).await, vec![1.0, 2.0, 3.0]);

    controller.stop_sync_for_all().await;
}

/// Directory-driven mode: hosts resolve through the pool, new replicas
/// are registry-propagated and catch up, departed replicas stop.
#[tokio::test]
async fn controller_topology_updates_replicas() {
    let src = MockHds::new();
    let replica_a = MockHds::new();
    let replica_b = MockHds::new();
    src.add_records(SERIES, &[1.0, 2.0]).await;

    let connector = Arc::new(MockConnector::new());
    connector.insert("hds-a:8088", Arc::clone(&replica_a));
    connector.insert("hds-b:8088", Arc::clone(&replica_b));
    let pool = Arc::new(ConnectionPool::new(connector));
    let controller = Arc::new(Controller::new(
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        pool,
        None,
        None,
    ));

    controller
        .add_or_update_series(SERIES, &["hds-a:8088".to_string(), "hds-b:8088".to_string()])
        .await;

    // Registry propagation hit both replicas before sync started.
    assert_eq!(replica_a.registry_names().await, vec![SERIES.to_string()]);
    assert_eq!(replica_b.registry_names().await, vec![SERIES.to_string()]);

    wait_until("both replicas hold {1,2}", Duration::from_secs(10), || {
        let a = Arc::clone(&replica_a);
        let b = Arc::clone(&replica_b);
        async move {
            a.times(SERIES).await == vec![1.0, 2.0] && b.times(SERIES).await == vec![1.0, 2.0]
        }
    })
    .await;

    // Replica B leaves the topology; only A keeps receiving.
    controller
        .add_or_update_series(SERIES, &["hds-a:8088".to_string()])
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    src.publish(SERIES, &[3.0]).await;
    wait_until("replica A holds 3", Duration::from_secs(5), || {
        let a = Arc::clone(&replica_a);
        async move { a.times(SERIES).await.contains(&3.0) }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !replica_b.times(SERIES).await.contains(&3.0),
        "departed replica must not receive new records"
    );

    controller.stop_sync_for_all().await;
}

/// Unreachable replica hosts are skipped; the series starts once a host
/// becomes resolvable.
#[tokio::test]
async fn controller_skips_unreachable_hosts() {
    let src = MockHds::new();
    let replica_a = MockHds::new();

    let connector = Arc::new(MockConnector::new());
    let pool = Arc::new(ConnectionPool::new(Arc::clone(&connector) as Arc<dyn Connector>));
    let controller = Arc::new(Controller::new(
        Arc::clone(&src) as Arc<dyn TimeSeriesClient>,
        pool,
        None,
        None,
    ));

    // Nothing resolvable yet: no synchronizer.
    controller
        .add_or_update_series(SERIES, &["hds-a:8088".to_string()])
        .await;
    assert!(controller.active_series().await.is_empty());

    // Host comes up; the next poll succeeds.
    connector.insert("hds-a:8088", Arc::clone(&replica_a));
    controller
        .add_or_update_series(SERIES, &["hds-a:8088".to_string()])
        .await;
    assert_eq!(controller.active_series().await.len(), 1);

    controller.stop_sync_for_all().await;
}
