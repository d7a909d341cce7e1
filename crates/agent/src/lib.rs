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

use crate::{
    actor::{
        AggregateUpdate, ProbeAggregationActorHandle, ProbeAggregationActorHandleError,
        ProbeAggregationStats, ProbeRouter, ProbeRouterError,
    },
    config::{AggregationConfig, ConfigurationError},
};
use probewatch_analytics::{AggregateRecord, WindowAggregator};
use probewatch_rules::{AggregateThresholdCondition, CarProbe};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub mod actor;
pub mod config;
pub mod payload;

/// Running set of aggregation shards and the router feeding them.
#[derive(Debug, Clone)]
pub struct AggregationPipeline {
    router: ProbeRouter,
    handles: Vec<ProbeAggregationActorHandle>,
}

impl AggregationPipeline {
    pub fn router(&self) -> &ProbeRouter {
        &self.router
    }

    pub async fn route(&self, probe: CarProbe) -> Result<usize, ProbeRouterError> {
        self.router.route(probe).await
    }

    pub async fn snapshot(
        &self,
        vehicle_id: &str,
    ) -> Result<Option<AggregateRecord>, ProbeAggregationActorHandleError> {
        let shard_id = self.router.shard_of(vehicle_id);
        let Some(handle) = self.handles.get(shard_id) else {
            return Err(ProbeAggregationActorHandleError::SendError);
        };
        handle.snapshot(self.router.state_key(vehicle_id)).await
    }

    /// Stop accepting probes, actors finish the probes already queued
    pub fn close(&self) {
        self.router.close();
    }

    /// Stop every actor without waiting for queued probes
    pub async fn shutdown(&self) -> Result<(), ProbeAggregationActorHandleError> {
        for handle in &self.handles {
            handle.shutdown().await?;
        }
        Ok(())
    }
}

/// Updates of every shard, the channel closes once all actors stopped.
///
/// Dropping it makes the actors fail on their next update. Keeping it
/// without reading stalls probe processing once `buffer_size` updates are
/// pending, snapshots and shutdown are still served.
pub type AggregateUpdates = async_channel::Receiver<AggregateUpdate>;

pub fn init_aggregation(
    config: &AggregationConfig,
    alerts: Vec<AggregateThresholdCondition>,
    meter: opentelemetry::metrics::Meter,
) -> Result<
    (
        Vec<JoinHandle<anyhow::Result<String>>>,
        AggregationPipeline,
        AggregateUpdates,
    ),
    ConfigurationError,
> {
    config.validate()?;
    let aggregator =
        WindowAggregator::new(config.window.clone()).map_err(ConfigurationError::Aggregation)?;
    let alerts: Arc<[AggregateThresholdCondition]> = Arc::from(alerts);
    let stats = ProbeAggregationStats::new(meter);

    let mut join_handles = Vec::with_capacity(config.workers);
    let mut handles = Vec::with_capacity(config.workers);
    let mut senders = Vec::with_capacity(config.workers);
    let (updates_tx, updates_rx) = async_channel::bounded(config.buffer_size);
    for shard_id in 0..config.workers {
        let (probe_tx, probe_rx) = async_channel::bounded(config.buffer_size);
        let (join_handle, handle) = ProbeAggregationActorHandle::new(
            aggregator.clone(),
            alerts.clone(),
            probe_rx,
            updates_tx.clone(),
            either::Right(stats.clone()),
            shard_id,
        );
        join_handles.push(join_handle);
        handles.push(handle);
        senders.push(probe_tx);
    }
    info!(
        "Started {} probe aggregation shards for rule type {}",
        config.workers,
        config.window.rule_type
    );
    let router = ProbeRouter::new(senders, config.window.rule_type);
    Ok((
        join_handles,
        AggregationPipeline { router, handles },
        updates_rx,
    ))
}
