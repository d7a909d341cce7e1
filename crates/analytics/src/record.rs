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

//! Per-key aggregation state.
//!
//! An [`AggregateRecord`] is created empty for a key that has never been seen
//! and is only ever mutated by
//! [`WindowAggregator::apply`](crate::aggregation::WindowAggregator::apply).
//! It holds the retained window of [`WindowEntry`] values, ordered by their
//! sequence number, and the [`Aggregates`] published after the last accepted
//! sample.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One retained sample in the window together with its derived acceleration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub(crate) seq: u64,
    pub(crate) speed: u32,
    pub(crate) heading: Option<f64>,
    pub(crate) acceleration: f64,
    pub(crate) event_time: DateTime<Utc>,
}

impl WindowEntry {
    pub const fn seq(&self) -> u64 {
        self.seq
    }

    pub const fn speed(&self) -> u32 {
        self.speed
    }

    /// `None` when the aggregator is not configured to track heading
    pub const fn heading(&self) -> Option<f64> {
        self.heading
    }

    pub const fn acceleration(&self) -> f64 {
        self.acceleration
    }

    pub const fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }
}

/// Values published after each accepted sample and read by rule conditions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregates {
    pub average_speed: f64,
    pub average_heading: Option<f64>,
    pub average_acceleration: f64,
    /// Distance moved since the previously accepted sample, relative to the
    /// current link
    pub move_distance: f64,
    pub last_speed: u32,
    pub last_heading: Option<f64>,
    pub last_acceleration: f64,
    /// Number of entries the averages were computed over
    pub window_len: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub(crate) last_event_time: Option<DateTime<Utc>>,
    pub(crate) sequence: Option<u64>,
    pub(crate) window: BTreeMap<u64, WindowEntry>,
    pub(crate) last_distance: Option<f64>,
    pub(crate) last_link_id: Option<i64>,
    pub(crate) aggregates: Option<Aggregates>,
}

impl AggregateRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Event time of the last accepted sample
    pub const fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.last_event_time
    }

    /// Sequence number assigned to the last accepted sample
    pub const fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub const fn last_distance(&self) -> Option<f64> {
        self.last_distance
    }

    pub const fn last_link_id(&self) -> Option<i64> {
        self.last_link_id
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Retained entries, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &WindowEntry> + '_ {
        self.window.values()
    }

    pub fn oldest(&self) -> Option<&WindowEntry> {
        self.window.first_key_value().map(|(_, entry)| entry)
    }

    pub fn newest(&self) -> Option<&WindowEntry> {
        self.window.last_key_value().map(|(_, entry)| entry)
    }

    /// Published aggregates, or `None` when no sample was ever accepted for
    /// this record. Absence is never reported as zero.
    pub const fn aggregates(&self) -> Option<&Aggregates> {
        self.aggregates.as_ref()
    }

    pub fn average_speed(&self) -> Option<f64> {
        self.aggregates.map(|agg| agg.average_speed)
    }

    pub fn average_heading(&self) -> Option<f64> {
        self.aggregates.and_then(|agg| agg.average_heading)
    }

    pub fn average_acceleration(&self) -> Option<f64> {
        self.aggregates.map(|agg| agg.average_acceleration)
    }

    pub fn move_distance(&self) -> Option<f64> {
        self.aggregates.map(|agg| agg.move_distance)
    }
}
