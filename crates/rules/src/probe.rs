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

use chrono::{DateTime, Utc};
use probewatch_analytics::Sample;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Probe property holding the current fuel amount
pub const PROBE_PROP_FUEL: &str = "fuel";

/// Vehicle property holding the fuel tank capacity
pub const VEHICLE_PROP_FUEL_TANK: &str = "FUELTANK";

/// A decoded telemetry report of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarProbe {
    pub vehicle_id: String,
    pub event_time: DateTime<Utc>,
    pub speed: u32,
    pub heading: f64,
    pub distance: f64,
    pub link_id: i64,
    /// Free-form probe fields, such as `fuel`
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl CarProbe {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn to_sample(&self) -> Sample {
        Sample::new(
            self.speed,
            self.heading,
            self.distance,
            self.link_id,
            self.event_time,
        )
    }
}

/// Static description of a vehicle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vehicle {
    pub vehicle_id: String,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl Vehicle {
    pub fn new(vehicle_id: impl Into<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            properties: HashMap::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}
