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

//! The moving-average rule action.
//!
//! A rule definition carries its parameters as a string property bag. They
//! are parsed and validated once, when the action is built, into an
//! [`AggregatorConfig`]; executing the action only applies probes.

use crate::probe::CarProbe;
use probewatch_analytics::{
    AggregationError, AggregatorConfig, Aggregates, ConfigurationError, RecordStore, StateKey,
    StoreError, WindowAggregator,
};
use std::{collections::HashMap, str::FromStr, sync::Arc};
use tracing::{debug, trace};

pub const PROP_MAX_RECORD: &str = "MaxRecord";
pub const PROP_RULE_TYPE: &str = "RuleType";
pub const PROP_SPEED_DIVISOR: &str = "SpeedDivisor";
pub const PROP_TRACK_HEADING: &str = "TrackHeading";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    #[error("invalid value `{value}` for rule property `{name}`")]
    InvalidProperty { name: &'static str, value: String },

    #[error("invalid aggregation configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("aggregate store error: {0}")]
    Store(StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ActionOutcome {
    /// The probe was accepted and the aggregates refreshed
    Updated(Aggregates),
    /// The probe was skipped, the stored state is unchanged
    Skipped(AggregationError),
}

impl ActionOutcome {
    pub fn aggregates(&self) -> Option<&Aggregates> {
        match self {
            Self::Updated(aggregates) => Some(aggregates),
            Self::Skipped(_) => None,
        }
    }
}

fn parse_property<T: FromStr>(
    properties: &HashMap<String, String>,
    name: &'static str,
    default: T,
) -> Result<T, ActionError> {
    match properties.get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ActionError::InvalidProperty {
                name,
                value: value.clone(),
            }),
        None => Ok(default),
    }
}

/// Keeps per-vehicle moving averages for one rule type.
#[derive(Debug, Clone)]
pub struct MovingAverageAction {
    aggregator: WindowAggregator,
    store: Arc<RecordStore<StateKey>>,
}

impl MovingAverageAction {
    pub fn new(
        config: AggregatorConfig,
        store: Arc<RecordStore<StateKey>>,
    ) -> Result<Self, ActionError> {
        Ok(Self {
            aggregator: WindowAggregator::new(config)?,
            store,
        })
    }

    /// Build the action from rule properties, falling back to the defaults
    /// of [`AggregatorConfig`] for absent properties.
    pub fn from_properties(
        properties: &HashMap<String, String>,
        store: Arc<RecordStore<StateKey>>,
    ) -> Result<Self, ActionError> {
        let defaults = AggregatorConfig::default();
        let config = AggregatorConfig {
            max_window_size: parse_property(
                properties,
                PROP_MAX_RECORD,
                defaults.max_window_size,
            )?,
            rule_type: parse_property(properties, PROP_RULE_TYPE, defaults.rule_type)?,
            speed_divisor: parse_property(
                properties,
                PROP_SPEED_DIVISOR,
                defaults.speed_divisor,
            )?,
            track_heading: parse_property(
                properties,
                PROP_TRACK_HEADING,
                defaults.track_heading,
            )?,
        };
        Self::new(config, store)
    }

    pub fn config(&self) -> &AggregatorConfig {
        self.aggregator.config()
    }

    pub fn state_key(&self, vehicle_id: &str) -> StateKey {
        StateKey::new(vehicle_id, self.config().rule_type)
    }

    pub fn exec(&self, probe: &CarProbe) -> Result<ActionOutcome, ActionError> {
        let key = self.state_key(&probe.vehicle_id);
        match self.store.apply(key, &self.aggregator, &probe.to_sample()) {
            Ok(aggregates) => {
                debug!(
                    vehicle_id = %probe.vehicle_id,
                    average_speed = aggregates.average_speed,
                    average_acceleration = aggregates.average_acceleration,
                    "Moving averages updated"
                );
                Ok(ActionOutcome::Updated(aggregates))
            }
            Err(StoreError::Aggregation(err)) => {
                trace!(vehicle_id = %probe.vehicle_id, "Probe skipped: {err}");
                Ok(ActionOutcome::Skipped(err))
            }
            Err(err) => Err(ActionError::Store(err)),
        }
    }

    /// Current aggregates of a vehicle for this rule type, `None` before the
    /// first accepted probe
    pub fn aggregates(&self, vehicle_id: &str) -> Result<Option<Aggregates>, ActionError> {
        let record = self
            .store
            .snapshot(&self.state_key(vehicle_id))
            .map_err(ActionError::Store)?;
        Ok(record.and_then(|record| record.aggregates().copied()))
    }
}
