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

//! Rule conditions.
//!
//! Conditions never mutate state. Fuel conditions look at the probe's `fuel`
//! property relative to the vehicle's `FUELTANK` capacity, threshold
//! conditions compare a published [`Aggregates`] value against a constant.

use crate::{
    compare::CompareOp,
    probe::{CarProbe, Vehicle, PROBE_PROP_FUEL, VEHICLE_PROP_FUEL_TANK},
};
use probewatch_analytics::Aggregates;
use serde::{Deserialize, Serialize};
use strum_macros::Display;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("invalid value `{value}` for property `{name}`: {reason}")]
    InvalidProperty {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything a condition may look at.
#[derive(Debug, Clone, Copy)]
pub struct ConditionContext<'a> {
    pub probe: &'a CarProbe,
    pub vehicle: &'a Vehicle,
    /// `None` when no sample was accepted yet for the evaluated state key
    pub aggregates: Option<&'a Aggregates>,
}

/// A read-only rule condition.
pub trait Condition: Send + Sync {
    /// Unique identifier for this condition instance
    fn id(&self) -> &str;

    /// Returns whether the condition holds. Missing inputs are reported as
    /// `Ok(false)`, malformed inputs as an error.
    fn check(&self, ctx: &ConditionContext<'_>) -> Result<bool, ConditionError>;
}

/// Fuel amount divided by tank capacity, `None` if either is not reported
fn fuel_level(probe: &CarProbe, vehicle: &Vehicle) -> Result<Option<f64>, ConditionError> {
    let (Some(fuel), Some(tank)) = (
        probe.property(PROBE_PROP_FUEL),
        vehicle.property(VEHICLE_PROP_FUEL_TANK),
    ) else {
        return Ok(None);
    };
    let fuel: f64 = fuel
        .trim()
        .parse()
        .map_err(|err: std::num::ParseFloatError| ConditionError::InvalidProperty {
            name: PROBE_PROP_FUEL,
            value: fuel.to_string(),
            reason: err.to_string(),
        })?;
    let capacity: u32 = tank
        .trim()
        .parse()
        .map_err(|err: std::num::ParseIntError| ConditionError::InvalidProperty {
            name: VEHICLE_PROP_FUEL_TANK,
            value: tank.to_string(),
            reason: err.to_string(),
        })?;
    if capacity == 0 {
        return Err(ConditionError::InvalidProperty {
            name: VEHICLE_PROP_FUEL_TANK,
            value: tank.to_string(),
            reason: "tank capacity must be greater than 0".to_string(),
        });
    }
    Ok(Some(fuel / f64::from(capacity)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LowFuelCondition {
    pub id: String,
    pub operator: CompareOp,
    pub level: f64,
}

impl Default for LowFuelCondition {
    fn default() -> Self {
        Self {
            id: "low-fuel".to_string(),
            operator: CompareOp::Lt,
            level: 0.1,
        }
    }
}

impl Condition for LowFuelCondition {
    fn id(&self) -> &str {
        &self.id
    }

    fn check(&self, ctx: &ConditionContext<'_>) -> Result<bool, ConditionError> {
        Ok(fuel_level(ctx.probe, ctx.vehicle)?
            .is_some_and(|level| self.operator.compare(level, self.level)))
    }
}

/// Holds while the tank is below half but not yet low: `0.1 <= level < 0.5`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HalfFuelCondition {
    pub id: String,
}

impl Default for HalfFuelCondition {
    fn default() -> Self {
        Self {
            id: "half-fuel".to_string(),
        }
    }
}

impl Condition for HalfFuelCondition {
    fn id(&self) -> &str {
        &self.id
    }

    fn check(&self, ctx: &ConditionContext<'_>) -> Result<bool, ConditionError> {
        Ok(fuel_level(ctx.probe, ctx.vehicle)?.is_some_and(|level| {
            CompareOp::Lt.compare(level, 0.5) && CompareOp::Ge.compare(level, 0.1)
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AggregateMetric {
    AverageSpeed,
    AverageHeading,
    AverageAcceleration,
    MoveDistance,
    LastSpeed,
    LastAcceleration,
}

impl AggregateMetric {
    pub fn value(&self, aggregates: &Aggregates) -> Option<f64> {
        match self {
            Self::AverageSpeed => Some(aggregates.average_speed),
            Self::AverageHeading => aggregates.average_heading,
            Self::AverageAcceleration => Some(aggregates.average_acceleration),
            Self::MoveDistance => Some(aggregates.move_distance),
            Self::LastSpeed => Some(f64::from(aggregates.last_speed)),
            Self::LastAcceleration => Some(aggregates.last_acceleration),
        }
    }
}

/// Compares one published aggregate with a threshold, e.g. a harsh
/// acceleration check on `average_acceleration > 8.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateThresholdCondition {
    pub id: String,
    pub metric: AggregateMetric,
    pub operator: CompareOp,
    pub threshold: f64,
}

impl AggregateThresholdCondition {
    /// The aggregate value this condition looks at, if any
    pub fn observed(&self, aggregates: Option<&Aggregates>) -> Option<f64> {
        aggregates.and_then(|agg| self.metric.value(agg))
    }

    pub fn matches(&self, aggregates: Option<&Aggregates>) -> bool {
        self.observed(aggregates)
            .is_some_and(|value| self.operator.compare(value, self.threshold))
    }
}

impl Condition for AggregateThresholdCondition {
    fn id(&self) -> &str {
        &self.id
    }

    fn check(&self, ctx: &ConditionContext<'_>) -> Result<bool, ConditionError> {
        Ok(self.matches(ctx.aggregates))
    }
}
