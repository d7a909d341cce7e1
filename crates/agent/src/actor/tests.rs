// Copyright (C) 2025-present The ProbeWatch Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::*;
use probewatch_analytics::AggregatorConfig;
use std::{collections::HashMap, time::Duration};
use tracing_test::traced_test;

fn create_stats() -> ProbeAggregationStats {
    let meter = opentelemetry::global::meter("test");
    ProbeAggregationStats::new(meter)
}

fn aggregator() -> WindowAggregator {
    WindowAggregator::new(AggregatorConfig::default()).unwrap()
}

fn probe(vehicle_id: &str, speed: u32, millis: i64) -> CarProbe {
    CarProbe {
        vehicle_id: vehicle_id.to_string(),
        event_time: DateTime::from_timestamp_millis(millis).unwrap(),
        speed,
        heading: 90.0,
        distance: millis as f64,
        link_id: 1,
        properties: HashMap::new(),
    }
}

fn speeding() -> AggregateThresholdCondition {
    AggregateThresholdCondition {
        id: "speeding".to_string(),
        metric: AggregateMetric::AverageSpeed,
        operator: CompareOp::Gt,
        threshold: 100.0,
    }
}

#[tokio::test]
#[traced_test]
async fn test_shutdown_command() {
    let (cmd_tx, cmd_rx) = mpsc::channel(1);
    let (_probe_tx, probe_rx) = async_channel::unbounded();
    let (next_tx, _next_rx) = async_channel::unbounded();

    let actor = ProbeAggregationActor::new(
        cmd_rx,
        probe_rx,
        next_tx,
        aggregator(),
        Arc::from(vec![]),
        create_stats(),
        0,
    );
    let handle = tokio::spawn(async move { actor.run().await });

    cmd_tx.send(ProbeAggregationCommand::Shutdown).await.unwrap();

    let result = handle.await.unwrap();
    assert_eq!(result.unwrap(), "Probe aggregation shutdown successfully");
    assert!(logs_contain("Shutting down probe aggregation actor"));
}

#[tokio::test]
#[traced_test]
async fn test_cmd_channel_closed() {
    let (cmd_tx, cmd_rx) = mpsc::channel(1);
    let (_probe_tx, probe_rx) = async_channel::unbounded();
    let (next_tx, _next_rx) = async_channel::unbounded();

    let actor = ProbeAggregationActor::new(
        cmd_rx,
        probe_rx,
        next_tx,
        aggregator(),
        Arc::from(vec![]),
        create_stats(),
        0,
    );
    let handle = tokio::spawn(async move { actor.run().await });

    drop(cmd_tx);

    let result = handle.await.unwrap();
    assert!(result.is_ok());
    assert!(logs_contain(
        "Probe aggregation actor terminated due to command channel closing"
    ));
}

#[tokio::test]
#[traced_test]
async fn test_probe_processing() {
    let (_cmd_tx, cmd_rx) = mpsc::channel(1);
    let (probe_tx, probe_rx) = async_channel::unbounded();
    let (next_tx, next_rx) = async_channel::unbounded();

    let actor = ProbeAggregationActor::new(
        cmd_rx,
        probe_rx,
        next_tx,
        aggregator(),
        Arc::from(vec![speeding()]),
        create_stats(),
        0,
    );
    let handle = tokio::spawn(async move { actor.run().await });

    probe_tx.send(probe("car-1", 90, 1_000)).await.unwrap();
    // Stale, no update is published for it
    probe_tx.send(probe("car-1", 250, 1_000)).await.unwrap();
    probe_tx.send(probe("car-1", 130, 2_000)).await.unwrap();

    let first = next_rx.recv().await.unwrap();
    assert_eq!(first.key, StateKey::new("car-1", 1));
    assert_eq!(first.aggregates.average_speed, 90.0);
    assert!(first.alerts.is_empty());

    let second = next_rx.recv().await.unwrap();
    assert_eq!(second.event_time.timestamp_millis(), 2_000);
    assert_eq!(second.aggregates.average_speed, 110.0);
    assert_eq!(second.aggregates.window_len, 2);
    assert_eq!(
        second.alerts,
        vec![Alert {
            condition_id: "speeding".to_string(),
            metric: AggregateMetric::AverageSpeed,
            operator: CompareOp::Gt,
            threshold: 100.0,
            observed: 110.0,
        }]
    );

    // Input closed and drained
    drop(probe_tx);
    let result = handle.await.unwrap();
    assert_eq!(result.unwrap(), "Probe aggregation input drained");
    assert!(next_rx.is_empty());
    assert!(logs_contain("Skipping probe of car-1/1"));
}

#[tokio::test]
#[traced_test]
async fn test_update_send_error() {
    let (_cmd_tx, cmd_rx) = mpsc::channel(1);
    let (probe_tx, probe_rx) = async_channel::unbounded();
    let (next_tx, next_rx) = async_channel::unbounded();

    let actor = ProbeAggregationActor::new(
        cmd_rx,
        probe_rx,
        next_tx,
        aggregator(),
        Arc::from(vec![]),
        create_stats(),
        0,
    );
    let handle = tokio::spawn(async move { actor.run().await });

    drop(next_rx);
    probe_tx.send(probe("car-1", 10, 0)).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_err());
    assert!(logs_contain("Aggregate update send error"));
}

#[tokio::test]
async fn test_handle_snapshot() {
    let (probe_tx, probe_rx) = async_channel::unbounded();
    let (updates_tx, updates) = async_channel::bounded(16);
    let (join, handle) = ProbeAggregationActorHandle::new(
        aggregator(),
        Arc::from(vec![]),
        probe_rx,
        updates_tx,
        Either::Right(create_stats()),
        3,
    );

    probe_tx.send(probe("car-7", 20, 0)).await.unwrap();
    probe_tx.send(probe("car-7", 40, 500)).await.unwrap();
    updates.recv().await.unwrap();
    let last = updates.recv().await.unwrap();

    let record = handle
        .snapshot(StateKey::new("car-7", 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.len(), 2);
    assert_eq!(record.aggregates(), Some(&last.aggregates));
    assert_eq!(record.last_event_time(), Some(last.event_time));

    assert_eq!(
        handle.snapshot(StateKey::new("car-8", 1)).await.unwrap(),
        None
    );

    handle.shutdown().await.unwrap();
    assert!(join.await.unwrap().is_ok());
    assert!(handle.shutdown().await.is_err());
}

#[tokio::test]
#[traced_test]
async fn test_commands_served_while_updates_unread() {
    let (input_tx, input_rx) = async_channel::unbounded();
    // Room for a single update that nobody reads
    let (updates_tx, updates_rx) = async_channel::bounded(1);
    let (join, handle) = ProbeAggregationActorHandle::new(
        aggregator(),
        Arc::from(vec![]),
        input_rx,
        updates_tx,
        Either::Right(create_stats()),
        0,
    );

    for millis in [0, 1_000, 2_000] {
        input_tx.send(probe("car-1", 30, millis)).await.unwrap();
    }

    // The second update waits for room, the record already holds its sample
    let key = StateKey::new("car-1", 1);
    let record = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match handle.snapshot(key.clone()).await.unwrap() {
                Some(record) if record.len() == 2 => break record,
                _ => tokio::task::yield_now().await,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(record.sequence(), Some(1));
    assert_eq!(updates_rx.len(), 1);
    assert_eq!(input_tx.len(), 1);

    handle.shutdown().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), join)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap(), "Probe aggregation shutdown successfully");
    assert!(logs_contain("Dropping undelivered aggregate update"));
    assert_eq!(updates_rx.len(), 1);
}

#[test]
fn test_evaluate_alerts() {
    let aggregates = Aggregates {
        average_speed: 120.0,
        average_heading: None,
        average_acceleration: 2.0,
        move_distance: 10.0,
        last_speed: 125,
        last_heading: None,
        last_acceleration: 1.0,
        window_len: 3,
    };
    let heading = AggregateThresholdCondition {
        id: "heading".to_string(),
        metric: AggregateMetric::AverageHeading,
        operator: CompareOp::Ge,
        threshold: 0.0,
    };
    let braking = AggregateThresholdCondition {
        id: "braking".to_string(),
        metric: AggregateMetric::AverageAcceleration,
        operator: CompareOp::Lt,
        threshold: -3.0,
    };
    let alerts = evaluate_alerts(&[speeding(), heading, braking], &aggregates);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].condition_id, "speeding");
    assert_eq!(alerts[0].observed, 120.0);
}

#[test]
fn test_shard_for_key() {
    let key = StateKey::new("car-1", 1);
    assert_eq!(shard_for_key(&key, 1), 0);
    assert_eq!(shard_for_key(&key, 0), 0);
    for shards in 1..16 {
        let shard = shard_for_key(&key, shards);
        assert!(shard < shards);
        assert_eq!(shard, shard_for_key(&key.clone(), shards));
    }
}

#[tokio::test]
async fn test_router_is_key_affine() {
    let channels = (0..4)
        .map(|_| async_channel::unbounded::<CarProbe>())
        .collect::<Vec<_>>();
    let router = ProbeRouter::new(
        channels.iter().map(|(tx, _)| tx.clone()).collect(),
        1,
    );
    assert_eq!(router.num_shards(), 4);

    for millis in 0..10 {
        for vehicle in ["car-1", "car-2", "car-3"] {
            let shard = router.route(probe(vehicle, 10, millis)).await.unwrap();
            assert_eq!(shard, router.shard_of(vehicle));
        }
    }
    for (shard, (_, rx)) in channels.iter().enumerate() {
        while let Ok(probe) = rx.try_recv() {
            assert_eq!(router.shard_of(&probe.vehicle_id), shard);
        }
    }

    router.close();
    assert!(matches!(
        router.route(probe("car-1", 10, 99)).await,
        Err(ProbeRouterError::ShardClosed(_))
    ));
}
