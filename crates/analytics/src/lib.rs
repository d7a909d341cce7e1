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

//! Kinematic aggregation over streams of vehicle telemetry samples.
//!
//! The crate keeps a bounded, per-key history of car probe samples and
//! derives moving averages of speed, heading and acceleration from it, along
//! with the distance moved since the previous sample.
//!
//! - [`sample`]: incoming observations and the keys partitioning state
//! - [`record`]: the per-key state ([`record::AggregateRecord`])
//! - [`aggregation`]: the [`aggregation::WindowAggregator`] state machine and
//!   its iterator/stream adaptors
//! - [`store`]: a keyed store with per-key exclusive access

pub mod aggregation;
pub mod record;
pub mod sample;
pub mod store;

pub use aggregation::{AggregationError, AggregatorConfig, ConfigurationError, WindowAggregator};
pub use record::{AggregateRecord, Aggregates, WindowEntry};
pub use sample::{KeyedSample, Sample, StateKey};
pub use store::{RecordGuard, RecordHandle, RecordStore, StoreError};
