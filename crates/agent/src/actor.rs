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

//! Sharded aggregation actors.
//!
//! Each [`ProbeAggregationActor`] exclusively owns the records of the state
//! keys routed to it, so a key is only ever updated by one task and no
//! locking is involved. The [`ProbeRouter`] hashes the state key of every
//! probe to pick its shard.

use chrono::{DateTime, Utc};
use either::Either;
use opentelemetry::metrics::Meter;
use probewatch_analytics::{
    AggregateRecord, AggregationError, Aggregates, StateKey, WindowAggregator,
};
use probewatch_rules::{AggregateMetric, AggregateThresholdCondition, CarProbe, CompareOp};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct ProbeAggregationStats {
    pub probes_received: opentelemetry::metrics::Counter<u64>,
    pub probes_accepted: opentelemetry::metrics::Counter<u64>,
    pub probes_stale: opentelemetry::metrics::Counter<u64>,
    pub probes_degenerate: opentelemetry::metrics::Counter<u64>,
    pub updates_sent: opentelemetry::metrics::Counter<u64>,
    pub updates_sent_error: opentelemetry::metrics::Counter<u64>,
    pub updates_dropped: opentelemetry::metrics::Counter<u64>,
}

impl ProbeAggregationStats {
    pub fn new(meter: Meter) -> Self {
        let probes_received = meter
            .u64_counter("probewatch.agent.aggregation.probes.received")
            .with_description("Number of car probes received for aggregation")
            .build();
        let probes_accepted = meter
            .u64_counter("probewatch.agent.aggregation.probes.accepted")
            .with_description("Number of car probes accepted into an aggregation window")
            .build();
        let probes_stale = meter
            .u64_counter("probewatch.agent.aggregation.probes.stale")
            .with_description(
                "Number of car probes skipped because they were not newer than the last accepted probe",
            )
            .build();
        let probes_degenerate = meter
            .u64_counter("probewatch.agent.aggregation.probes.degenerate")
            .with_description(
                "Number of car probes skipped because no acceleration could be derived",
            )
            .build();
        let updates_sent = meter
            .u64_counter("probewatch.agent.aggregation.updates.sent")
            .with_description("Number of aggregate updates successfully sent upstream")
            .build();
        let updates_sent_error = meter
            .u64_counter("probewatch.agent.aggregation.updates.sent.error")
            .with_description("Number of aggregate updates that failed to send upstream")
            .build();
        let updates_dropped = meter
            .u64_counter("probewatch.agent.aggregation.updates.dropped")
            .with_description("Number of aggregate updates dropped by a shutdown while waiting to be sent")
            .build();
        Self {
            probes_received,
            probes_accepted,
            probes_stale,
            probes_degenerate,
            updates_sent,
            updates_sent_error,
            updates_dropped,
        }
    }
}

/// A threshold condition that held for a published aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub condition_id: String,
    pub metric: AggregateMetric,
    pub operator: CompareOp,
    pub threshold: f64,
    pub observed: f64,
}

/// Published for every accepted probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateUpdate {
    pub key: StateKey,
    pub event_time: DateTime<Utc>,
    pub aggregates: Aggregates,
    pub alerts: Vec<Alert>,
}

pub fn evaluate_alerts(
    conditions: &[AggregateThresholdCondition],
    aggregates: &Aggregates,
) -> Vec<Alert> {
    conditions
        .iter()
        .filter_map(|condition| {
            let observed = condition.observed(Some(aggregates))?;
            condition
                .operator
                .compare(observed, condition.threshold)
                .then(|| Alert {
                    condition_id: condition.id.clone(),
                    metric: condition.metric,
                    operator: condition.operator,
                    threshold: condition.threshold,
                    observed,
                })
        })
        .collect()
}

/// Index of the shard owning `key` among `num_shards` shards
pub fn shard_for_key(key: &StateKey, num_shards: usize) -> usize {
    let mut hasher = DefaultHasher::default();
    key.hash(&mut hasher);
    hasher.finish() as usize % num_shards.max(1)
}

#[derive(Debug)]
pub enum ProbeAggregationCommand {
    Shutdown,
    Snapshot(StateKey, oneshot::Sender<Option<AggregateRecord>>),
}

#[derive(Debug)]
struct ProbeAggregationActor {
    cmd_rx: mpsc::Receiver<ProbeAggregationCommand>,
    rx: async_channel::Receiver<CarProbe>,
    tx: async_channel::Sender<AggregateUpdate>,
    aggregator: WindowAggregator,
    alerts: Arc<[AggregateThresholdCondition]>,
    records: FxHashMap<StateKey, AggregateRecord>,
    stats: ProbeAggregationStats,
    shard_id: usize,
}

impl ProbeAggregationActor {
    fn new(
        cmd_rx: mpsc::Receiver<ProbeAggregationCommand>,
        rx: async_channel::Receiver<CarProbe>,
        tx: async_channel::Sender<AggregateUpdate>,
        aggregator: WindowAggregator,
        alerts: Arc<[AggregateThresholdCondition]>,
        stats: ProbeAggregationStats,
        shard_id: usize,
    ) -> Self {
        Self {
            cmd_rx,
            rx,
            tx,
            aggregator,
            alerts,
            records: FxHashMap::default(),
            stats,
            shard_id,
        }
    }

    /// Apply the probe to its record, `None` when the probe was skipped
    fn process(
        &mut self,
        probe: &CarProbe,
        tags: &[opentelemetry::KeyValue],
    ) -> Option<AggregateUpdate> {
        let key = StateKey::new(probe.vehicle_id.as_str(), self.aggregator.config().rule_type);
        let record = self.records.entry(key.clone()).or_default();
        match self.aggregator.apply(record, &probe.to_sample()) {
            Ok(aggregates) => {
                self.stats.probes_accepted.add(1, tags);
                let alerts = evaluate_alerts(&self.alerts, &aggregates);
                Some(AggregateUpdate {
                    key,
                    event_time: probe.event_time,
                    aggregates,
                    alerts,
                })
            }
            Err(err @ AggregationError::StaleSample { .. }) => {
                trace!("[Shard {}] Skipping probe of {key}: {err}", self.shard_id);
                self.stats.probes_stale.add(1, tags);
                None
            }
            Err(err @ AggregationError::DegenerateInterval { .. }) => {
                debug!("[Shard {}] Skipping probe of {key}: {err}", self.shard_id);
                self.stats.probes_degenerate.add(1, tags);
                None
            }
        }
    }

    /// Serve a command, returns the exit message when the actor has to stop
    fn handle_command(&self, cmd: Option<ProbeAggregationCommand>) -> Option<String> {
        match cmd {
            Some(ProbeAggregationCommand::Shutdown) => {
                info!("Shutting down probe aggregation actor");
            }
            Some(ProbeAggregationCommand::Snapshot(key, reply)) => {
                if reply.send(self.records.get(&key).cloned()).is_err() {
                    warn!(
                        "[Shard {}] Snapshot of {key} requested but the requester is gone",
                        self.shard_id
                    );
                }
                return None;
            }
            None => {
                warn!("Probe aggregation actor terminated due to command channel closing");
            }
        }
        Some("Probe aggregation shutdown successfully".to_string())
    }

    /// Send the update downstream while still serving commands.
    ///
    /// Returns the exit message when a command stopped the actor before the
    /// update could be delivered, the pending update is dropped in that case.
    async fn publish(
        &mut self,
        update: AggregateUpdate,
        tags: &[opentelemetry::KeyValue],
    ) -> Result<Option<String>, ProbeAggregationActorError> {
        let send = self.tx.send(update);
        tokio::pin!(send);
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    if let Some(exit) = self.handle_command(cmd) {
                        warn!("[Shard {}] Dropping undelivered aggregate update", self.shard_id);
                        self.stats.updates_dropped.add(1, tags);
                        return Ok(Some(exit));
                    }
                }
                result = &mut send => {
                    return match result {
                        Ok(()) => {
                            self.stats.updates_sent.add(1, tags);
                            Ok(None)
                        }
                        Err(err) => {
                            error!("Aggregate update send error: {err}");
                            self.stats.updates_sent_error.add(1, tags);
                            Err(ProbeAggregationActorError::SendChannelError)
                        }
                    };
                }
            }
        }
    }

    async fn run(mut self) -> anyhow::Result<String> {
        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => {
                    if let Some(exit) = self.handle_command(cmd) {
                        return Ok(exit);
                    }
                }
                probe = self.rx.recv() => {
                    match probe {
                        Ok(probe) => {
                            let tags = [opentelemetry::KeyValue::new(
                                "shard_id",
                                opentelemetry::Value::I64(self.shard_id as i64),
                            )];
                            self.stats.probes_received.add(1, &tags);
                            let Some(update) = self.process(&probe, &tags) else {
                                continue;
                            };
                            if let Some(exit) = self.publish(update, &tags).await? {
                                return Ok(exit);
                            }
                        }
                        Err(_) => {
                            // All senders are gone and the queue is drained
                            info!("Probe input closed, shutting down probe aggregation actor");
                            return Ok("Probe aggregation input drained".to_string());
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProbeAggregationActorError {
    SendChannelError,
}

impl std::fmt::Display for ProbeAggregationActorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendChannelError => write!(f, "error in probe aggregation send channel"),
        }
    }
}

impl std::error::Error for ProbeAggregationActorError {}

#[derive(Debug, Clone)]
pub enum ProbeAggregationActorHandleError {
    SendError,
    ReceiveError,
}

impl std::fmt::Display for ProbeAggregationActorHandleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SendError => write!(f, "Failed to send command to probe aggregation actor"),
            Self::ReceiveError => {
                write!(f, "Failed to receive reply from probe aggregation actor")
            }
        }
    }
}

impl std::error::Error for ProbeAggregationActorHandleError {}

/// Handle for controlling a probe aggregation actor.
///
/// The actor publishes its aggregate updates on the sender given to
/// [`ProbeAggregationActorHandle::new`], reading them is up to the owner of
/// the matching receiver. Commands are served even while the actor waits
/// for room in a full update channel.
#[derive(Debug, Clone)]
pub struct ProbeAggregationActorHandle {
    cmd_send: mpsc::Sender<ProbeAggregationCommand>,
}

impl ProbeAggregationActorHandle {
    pub fn new(
        aggregator: WindowAggregator,
        alerts: Arc<[AggregateThresholdCondition]>,
        probes_rx: async_channel::Receiver<CarProbe>,
        updates_tx: async_channel::Sender<AggregateUpdate>,
        stats: Either<Meter, ProbeAggregationStats>,
        shard_id: usize,
    ) -> (JoinHandle<anyhow::Result<String>>, Self) {
        let (cmd_send, cmd_recv) = mpsc::channel(10);
        let stats = match stats {
            Either::Left(meter) => ProbeAggregationStats::new(meter),
            Either::Right(stats) => stats,
        };
        let actor = ProbeAggregationActor::new(
            cmd_recv, probes_rx, updates_tx, aggregator, alerts, stats, shard_id,
        );
        let join_handle = tokio::spawn(actor.run());
        (join_handle, Self { cmd_send })
    }

    pub async fn shutdown(&self) -> Result<(), ProbeAggregationActorHandleError> {
        self.cmd_send
            .send(ProbeAggregationCommand::Shutdown)
            .await
            .map_err(|_| ProbeAggregationActorHandleError::SendError)
    }

    /// Copy of the record of `key` as currently held by the actor.
    ///
    /// Commands take priority over queued probes, so probes still waiting in
    /// the actor's input are not reflected.
    pub async fn snapshot(
        &self,
        key: StateKey,
    ) -> Result<Option<AggregateRecord>, ProbeAggregationActorHandleError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_send
            .send(ProbeAggregationCommand::Snapshot(key, tx))
            .await
            .map_err(|_| ProbeAggregationActorHandleError::SendError)?;
        rx.await
            .map_err(|_| ProbeAggregationActorHandleError::ReceiveError)
    }
}

#[derive(Debug, Clone)]
pub enum ProbeRouterError {
    ShardClosed(usize),
}

impl std::fmt::Display for ProbeRouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShardClosed(shard_id) => {
                write!(f, "input channel of aggregation shard {shard_id} is closed")
            }
        }
    }
}

impl std::error::Error for ProbeRouterError {}

/// Distributes probes over the input channels of the aggregation shards.
#[derive(Debug, Clone)]
pub struct ProbeRouter {
    senders: Vec<async_channel::Sender<CarProbe>>,
    rule_type: u32,
}

impl ProbeRouter {
    pub fn new(senders: Vec<async_channel::Sender<CarProbe>>, rule_type: u32) -> Self {
        Self { senders, rule_type }
    }

    pub fn num_shards(&self) -> usize {
        self.senders.len()
    }

    pub fn state_key(&self, vehicle_id: &str) -> StateKey {
        StateKey::new(vehicle_id, self.rule_type)
    }

    pub fn shard_of(&self, vehicle_id: &str) -> usize {
        shard_for_key(&self.state_key(vehicle_id), self.senders.len())
    }

    /// Send the probe to its shard, returns the shard id
    pub async fn route(&self, probe: CarProbe) -> Result<usize, ProbeRouterError> {
        let shard_id = self.shard_of(&probe.vehicle_id);
        let Some(tx) = self.senders.get(shard_id) else {
            return Err(ProbeRouterError::ShardClosed(shard_id));
        };
        tx.send(probe)
            .await
            .map_err(|_| ProbeRouterError::ShardClosed(shard_id))?;
        Ok(shard_id)
    }

    /// Close every shard input, actors stop once their queue is drained
    pub fn close(&self) {
        for tx in &self.senders {
            tx.close();
        }
    }
}

#[cfg(test)]
mod tests;
