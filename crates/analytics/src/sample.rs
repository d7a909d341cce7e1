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
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single telemetry observation reported by a vehicle (a car probe).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Speed in km/h
    speed: u32,
    /// Heading in degrees
    heading: f64,
    /// Cumulative distance along the current link
    distance: f64,
    /// Road segment the vehicle is on
    link_id: i64,
    event_time: DateTime<Utc>,
}

impl Sample {
    pub const fn new(
        speed: u32,
        heading: f64,
        distance: f64,
        link_id: i64,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            speed,
            heading,
            distance,
            link_id,
            event_time,
        }
    }

    pub const fn speed(&self) -> u32 {
        self.speed
    }

    pub const fn heading(&self) -> f64 {
        self.heading
    }

    pub const fn distance(&self) -> f64 {
        self.distance
    }

    pub const fn link_id(&self) -> i64 {
        self.link_id
    }

    pub const fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }
}

/// Identifies one aggregate record: a vehicle and the rule type that owns the
/// state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    vehicle_id: String,
    rule_type: u32,
}

impl StateKey {
    pub fn new(vehicle_id: impl Into<String>, rule_type: u32) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            rule_type,
        }
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub const fn rule_type(&self) -> u32 {
        self.rule_type
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vehicle_id, self.rule_type)
    }
}

/// A sample tagged with the key of the state it updates
pub trait KeyedSample<K> {
    fn get_key(&self) -> K;
    fn get_sample(&self) -> Sample;
}

impl<K: Clone> KeyedSample<K> for (K, Sample) {
    fn get_key(&self) -> K {
        self.0.clone()
    }

    fn get_sample(&self) -> Sample {
        self.1
    }
}
