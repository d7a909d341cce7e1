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

//! A module that provides the sliding-window kinematic aggregation of car
//! probe samples.
//!
//! The main components are:
//! - `AggregatorConfig`: typed and validated aggregation settings
//! - `WindowAggregator`: the state machine applying one `Sample` to one
//!   `AggregateRecord`
//! - `MovingAverageAdaptor`/`MovingAverageStreamAdaptor`: iterator and stream
//!   adaptors keeping one record per key
//!
//! The window features:
//! - Count-bounded history, evicting the entry with the smallest sequence
//!   number first
//! - Acceleration derived from consecutive speed samples
//! - Rejection of samples that are not strictly newer than the last accepted
//!   one, leaving the record untouched
//! - Move distance tracking that resets at link-segment boundaries
//!
//! Example usage:
//! ```text
//! use probewatch_analytics::aggregation::{AggregatorConfig, MovingAverageExt, WindowAggregator};
//!
//! let aggregator = WindowAggregator::new(AggregatorConfig::default())?;
//! let results = probes
//!     .into_iter()
//!     .moving_average(aggregator)
//!     .filter_map(|x| x.left()) // Keep only accepted samples
//!     .collect::<Vec<_>>();
//! ```

use crate::{
    record::{AggregateRecord, Aggregates, WindowEntry},
    sample::{KeyedSample, Sample},
};
use chrono::{DateTime, Utc};
use either::Either;
use futures_core::Stream;
use pin_project::pin_project;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::{
    hash::Hash,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
};
use tracing::trace;

/// Divisor converting a speed delta in km/h into m/s
pub const KMH_TO_MS_DIVISOR: f64 = 3.6;

const MAX_WINDOW_SIZE_DEFAULT: usize = 10;
const RULE_TYPE_DEFAULT: u32 = 1;

pub(crate) const fn default_max_window_size() -> usize {
    MAX_WINDOW_SIZE_DEFAULT
}

pub(crate) const fn default_rule_type() -> u32 {
    RULE_TYPE_DEFAULT
}

pub(crate) const fn default_speed_divisor() -> f64 {
    1.0
}

pub(crate) const fn default_track_heading() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    InvalidWindowSize,
    InvalidSpeedDivisor(f64),
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidWindowSize => write!(f, "max_window_size must be greater than 0"),
            Self::InvalidSpeedDivisor(divisor) => {
                write!(
                    f,
                    "speed_divisor must be a finite number greater than 0, got {divisor}"
                )
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Maximum number of entries retained in the window
    #[serde(default = "default_max_window_size")]
    pub max_window_size: usize,

    /// Tag partitioning state keys between rules
    #[serde(default = "default_rule_type")]
    pub rule_type: u32,

    /// Speed deltas are divided by this value before computing the
    /// acceleration. `1.0` keeps km/h per second, [`KMH_TO_MS_DIVISOR`]
    /// yields m/s².
    #[serde(default = "default_speed_divisor")]
    pub speed_divisor: f64,

    /// Keep the heading of each entry and publish its average
    #[serde(default = "default_track_heading")]
    pub track_heading: bool,
}

impl AggregatorConfig {
    /// The acceleration-only variant: m/s² acceleration, no heading.
    pub fn acceleration_only() -> Self {
        Self {
            speed_divisor: KMH_TO_MS_DIVISOR,
            track_heading: false,
            ..Self::default()
        }
    }

    pub fn max_window_size(&self) -> usize {
        self.max_window_size
    }

    pub fn rule_type(&self) -> u32 {
        self.rule_type
    }

    pub fn speed_divisor(&self) -> f64 {
        self.speed_divisor
    }

    pub fn track_heading(&self) -> bool {
        self.track_heading
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_window_size == 0 {
            return Err(ConfigurationError::InvalidWindowSize);
        }
        if !self.speed_divisor.is_finite() || self.speed_divisor <= 0.0 {
            return Err(ConfigurationError::InvalidSpeedDivisor(self.speed_divisor));
        }
        Ok(())
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_window_size: default_max_window_size(),
            rule_type: default_rule_type(),
            speed_divisor: default_speed_divisor(),
            track_heading: default_track_heading(),
        }
    }
}

/// Reasons a sample is rejected by [`WindowAggregator::apply`].
///
/// In both cases the record is left exactly as it was before the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AggregationError {
    /// The sample is not strictly newer than the last accepted one
    #[error("stale sample at {received}, last accepted sample at {last}")]
    StaleSample {
        last: DateTime<Utc>,
        received: DateTime<Utc>,
    },

    /// The interval to the previous entry is zero at millisecond resolution,
    /// so no acceleration can be derived
    #[error("degenerate interval between samples at {previous} and {received}")]
    DegenerateInterval {
        previous: DateTime<Utc>,
        received: DateTime<Utc>,
    },
}

impl AggregationError {
    /// `true` when the sample was skipped because it was older than or as old
    /// as the last accepted one
    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::StaleSample { .. })
    }
}

/// Applies samples to aggregate records.
///
/// The aggregator holds only its configuration; all state lives in the
/// [`AggregateRecord`] passed to [`WindowAggregator::apply`]. Callers are
/// responsible for giving it exclusive access to that record.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowAggregator {
    config: AggregatorConfig,
}

impl WindowAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Apply one sample to the record and return the refreshed aggregates.
    ///
    /// All checks run before the record is touched: on error the record is
    /// unchanged.
    pub fn apply(
        &self,
        record: &mut AggregateRecord,
        sample: &Sample,
    ) -> Result<Aggregates, AggregationError> {
        let received = sample.event_time();
        if let Some(last) = record.last_event_time {
            if received <= last {
                return Err(AggregationError::StaleSample { last, received });
            }
        }

        let acceleration = self.acceleration(record.newest(), sample)?;
        let seq = record.sequence.map_or(0, |prev| prev + 1);
        let heading = self.config.track_heading.then_some(sample.heading());

        record.window.insert(
            seq,
            WindowEntry {
                seq,
                speed: sample.speed(),
                heading,
                acceleration,
                event_time: received,
            },
        );
        record.sequence = Some(seq);
        while record.window.len() > self.config.max_window_size {
            if let Some((evicted, _)) = record.window.pop_first() {
                trace!("Evicted window entry {evicted}, latest sequence {seq}");
            }
        }

        let move_distance = match (record.last_link_id, record.last_distance) {
            (Some(link_id), Some(prev)) if link_id == sample.link_id() => {
                (sample.distance() - prev).abs()
            }
            _ => sample.distance(),
        };
        record.last_distance = Some(sample.distance());
        record.last_link_id = Some(sample.link_id());
        record.last_event_time = Some(received);

        let aggregates = Aggregates {
            average_speed: mean(record.entries().map(|e| f64::from(e.speed))),
            average_heading: self
                .config
                .track_heading
                .then(|| mean(record.entries().filter_map(|e| e.heading)))
                .filter(|avg| !avg.is_nan()),
            average_acceleration: mean(record.entries().map(|e| e.acceleration)),
            move_distance,
            last_speed: sample.speed(),
            last_heading: heading,
            last_acceleration: acceleration,
            window_len: record.len(),
        };
        record.aggregates = Some(aggregates);
        Ok(aggregates)
    }

    /// Speed change per second relative to the previous entry. The first
    /// entry of a record is seeded with its own (converted) speed.
    fn acceleration(
        &self,
        previous: Option<&WindowEntry>,
        sample: &Sample,
    ) -> Result<f64, AggregationError> {
        let speed = f64::from(sample.speed());
        let previous = match previous {
            Some(previous) => previous,
            None => return Ok(speed / self.config.speed_divisor),
        };
        let degenerate = AggregationError::DegenerateInterval {
            previous: previous.event_time,
            received: sample.event_time(),
        };
        let interval_ms = (sample.event_time() - previous.event_time).num_milliseconds();
        if interval_ms <= 0 {
            return Err(degenerate);
        }
        let acceleration = (speed - f64::from(previous.speed)) / self.config.speed_divisor
            / interval_ms as f64
            * 1000.0;
        if !acceleration.is_finite() {
            return Err(degenerate);
        }
        Ok(acceleration)
    }
}

/// Arithmetic mean, `NaN` for an empty input
#[inline]
fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    sum / count as f64
}

/// Keeps one [`AggregateRecord`] per key and applies incoming items to it.
#[derive(Debug, Clone)]
struct KeyedRecords<Key> {
    aggregator: WindowAggregator,
    records: FxHashMap<Key, AggregateRecord>,
}

impl<Key: Eq + Hash + Clone> KeyedRecords<Key> {
    fn new(aggregator: WindowAggregator) -> Self {
        Self {
            aggregator,
            records: FxHashMap::default(),
        }
    }

    fn process_item<Input: KeyedSample<Key>>(
        &mut self,
        item: Input,
    ) -> Either<(Key, Aggregates), (Input, AggregationError)> {
        let key = item.get_key();
        let sample = item.get_sample();
        let record = self.records.entry(key.clone()).or_default();
        match self.aggregator.apply(record, &sample) {
            Ok(aggregates) => Either::Left((key, aggregates)),
            Err(err) => Either::Right((item, err)),
        }
    }
}

/// An iterator adaptor that applies each keyed sample to the record of its
/// key.
///
/// Accepted samples yield `Left((key, aggregates))`, rejected samples are
/// handed back as `Right((item, reason))`.
pub struct MovingAverageAdaptor<Key, Input, I> {
    source: I,
    state: KeyedRecords<Key>,
    _phantom: PhantomData<fn() -> Input>,
}

impl<Key: Eq + Hash + Clone, Input: KeyedSample<Key>, I: Iterator<Item = Input>>
    MovingAverageAdaptor<Key, Input, I>
{
    fn new(source: I, aggregator: WindowAggregator) -> Self {
        Self {
            source,
            state: KeyedRecords::new(aggregator),
            _phantom: PhantomData,
        }
    }

    /// Current state of the given key
    pub fn record(&self, key: &Key) -> Option<&AggregateRecord> {
        self.state.records.get(key)
    }
}

impl<Key: Eq + Hash + Clone, Input: KeyedSample<Key>, I: Iterator<Item = Input>> Iterator
    for MovingAverageAdaptor<Key, Input, I>
{
    type Item = Either<(Key, Aggregates), (Input, AggregationError)>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.source.next()?;
        Some(self.state.process_item(item))
    }
}

pub trait MovingAverageExt<Key: Eq + Hash + Clone, Input: KeyedSample<Key>>:
    Iterator<Item = Input> + Sized
{
    fn moving_average(
        self,
        aggregator: WindowAggregator,
    ) -> MovingAverageAdaptor<Key, Input, Self> {
        MovingAverageAdaptor::new(self, aggregator)
    }
}

impl<Key: Eq + Hash + Clone, Input: KeyedSample<Key>, I: Iterator<Item = Input>>
    MovingAverageExt<Key, Input> for I
{
}

#[pin_project]
pub struct MovingAverageStreamAdaptor<Key, Input, S> {
    #[pin]
    source: S,
    state: KeyedRecords<Key>,
    _phantom: PhantomData<fn() -> Input>,
}

impl<Key: Eq + Hash + Clone, Input: KeyedSample<Key>, S: Stream<Item = Input>>
    MovingAverageStreamAdaptor<Key, Input, S>
{
    pub fn new(source: S, aggregator: WindowAggregator) -> Self {
        Self {
            source,
            state: KeyedRecords::new(aggregator),
            _phantom: PhantomData,
        }
    }
}

impl<Key: Eq + Hash + Clone, Input: KeyedSample<Key>, S: Stream<Item = Input>> Stream
    for MovingAverageStreamAdaptor<Key, Input, S>
{
    type Item = Either<(Key, Aggregates), (Input, AggregationError)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.source.poll_next(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(this.state.process_item(item))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.source.size_hint()
    }
}

pub trait MovingAverageStreamExt<Key: Eq + Hash + Clone, Input: KeyedSample<Key>>:
    Stream<Item = Input>
{
    fn moving_average(
        self,
        aggregator: WindowAggregator,
    ) -> MovingAverageStreamAdaptor<Key, Input, Self>
    where
        Self: Sized,
    {
        MovingAverageStreamAdaptor::new(self, aggregator)
    }
}

impl<Key: Eq + Hash + Clone, Input: KeyedSample<Key>, S: Stream<Item = Input>>
    MovingAverageStreamExt<Key, Input> for S
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{stream, StreamExt};
    use rstest::rstest;

    fn ts(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_738_671_600_000 + millis).unwrap()
    }

    fn sample(speed: u32, millis: i64) -> Sample {
        Sample::new(speed, 0.0, 0.0, 1, ts(millis))
    }

    fn aggregator(max_window_size: usize) -> WindowAggregator {
        WindowAggregator::new(AggregatorConfig {
            max_window_size,
            ..AggregatorConfig::default()
        })
        .unwrap()
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn test_window_of_two() {
        let aggregator = aggregator(2);
        let mut record = AggregateRecord::new();
        aggregator.apply(&mut record, &sample(10, 0)).unwrap();
        aggregator.apply(&mut record, &sample(20, 1000)).unwrap();
        let agg = aggregator.apply(&mut record, &sample(15, 2000)).unwrap();

        let seqs: Vec<_> = record.entries().map(WindowEntry::seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(agg.average_speed, 17.5);
        assert_eq!(agg.window_len, 2);
        // accelerations of the retained entries are 10 and -5
        assert_close(agg.average_acceleration, 2.5);
        assert_close(agg.last_acceleration, -5.0);
        assert_eq!(agg.last_speed, 15);
        assert_eq!(record.aggregates(), Some(&agg));
    }

    #[test]
    fn test_evicts_minimum_sequence() {
        let aggregator = aggregator(3);
        let mut record = AggregateRecord::new();
        for i in 0..3 {
            aggregator
                .apply(&mut record, &sample(10 * i as u32, i * 1000))
                .unwrap();
        }
        assert_eq!(record.oldest().map(WindowEntry::seq), Some(0));

        aggregator.apply(&mut record, &sample(30, 3000)).unwrap();
        let seqs: Vec<_> = record.entries().map(WindowEntry::seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        aggregator.apply(&mut record, &sample(40, 4000)).unwrap();
        let seqs: Vec<_> = record.entries().map(WindowEntry::seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(record.sequence(), Some(4));
    }

    #[test]
    fn test_first_sample_seeds_acceleration_with_speed() {
        let aggregator = aggregator(10);
        let mut record = AggregateRecord::new();
        let agg = aggregator.apply(&mut record, &sample(42, 0)).unwrap();

        assert_eq!(record.sequence(), Some(0));
        assert_eq!(record.newest().map(WindowEntry::acceleration), Some(42.0));
        assert_eq!(agg.average_acceleration, 42.0);
        assert_eq!(agg.average_speed, 42.0);
        assert_eq!(agg.move_distance, 0.0);
    }

    #[rstest]
    #[case::same_time(1000)]
    #[case::older(500)]
    fn test_stale_sample_leaves_record_unchanged(#[case] millis: i64) {
        let aggregator = aggregator(5);
        let mut record = AggregateRecord::new();
        aggregator.apply(&mut record, &sample(10, 0)).unwrap();
        aggregator.apply(&mut record, &sample(20, 1000)).unwrap();
        let before = record.clone();

        let result = aggregator.apply(&mut record, &sample(99, millis));
        assert_eq!(
            result,
            Err(AggregationError::StaleSample {
                last: ts(1000),
                received: ts(millis),
            })
        );
        assert!(result.unwrap_err().is_stale());
        assert_eq!(record, before);
    }

    #[test]
    fn test_sub_millisecond_interval_is_degenerate() {
        let aggregator = aggregator(5);
        let mut record = AggregateRecord::new();
        aggregator.apply(&mut record, &sample(10, 0)).unwrap();
        let before = record.clone();

        let received = ts(0) + chrono::Duration::microseconds(400);
        let result = aggregator.apply(&mut record, &Sample::new(12, 0.0, 0.0, 1, received));
        assert_eq!(
            result,
            Err(AggregationError::DegenerateInterval {
                previous: ts(0),
                received,
            })
        );
        assert!(!result.unwrap_err().is_stale());
        assert_eq!(record, before);
    }

    #[test]
    fn test_move_distance_across_links() {
        let aggregator = aggregator(5);
        let mut record = AggregateRecord::new();
        let steps = [
            (1, 100.0, 0, 100.0),
            (1, 130.0, 1000, 30.0),
            (1, 120.0, 2000, 10.0),
            (2, 15.0, 3000, 15.0),
            (2, 40.0, 4000, 25.0),
        ];
        for (link_id, distance, millis, expected) in steps {
            let agg = aggregator
                .apply(
                    &mut record,
                    &Sample::new(50, 0.0, distance, link_id, ts(millis)),
                )
                .unwrap();
            assert_eq!(agg.move_distance, expected);
            assert_eq!(record.last_link_id(), Some(link_id));
            assert_eq!(record.last_distance(), Some(distance));
        }
    }

    #[test]
    fn test_average_heading() {
        let aggregator = aggregator(2);
        let mut record = AggregateRecord::new();
        for (heading, millis) in [(10.0, 0), (20.0, 1000), (60.0, 2000)] {
            aggregator
                .apply(&mut record, &Sample::new(30, heading, 0.0, 1, ts(millis)))
                .unwrap();
        }
        assert_eq!(record.average_heading(), Some(40.0));
        assert_eq!(record.aggregates().unwrap().last_heading, Some(60.0));
    }

    #[test]
    fn test_acceleration_only_variant() {
        let aggregator = WindowAggregator::new(AggregatorConfig::acceleration_only()).unwrap();
        let mut record = AggregateRecord::new();
        let agg = aggregator.apply(&mut record, &sample(36, 0)).unwrap();
        // The seeded value is converted like every later one
        assert_close(agg.last_acceleration, 10.0);
        assert_close(record.newest().unwrap().acceleration(), agg.last_acceleration);
        assert_close(agg.average_acceleration, 10.0);
        assert_eq!(agg.average_heading, None);

        // 36 km/h gained over 2 s is 5 m/s²
        let agg = aggregator.apply(&mut record, &sample(72, 2000)).unwrap();
        assert_close(agg.last_acceleration, 5.0);
        assert_close(agg.average_acceleration, 7.5);
        assert!(record.entries().all(|e| e.heading().is_none()));
    }

    #[test]
    fn test_shrinking_window_keeps_bound() {
        let mut record = AggregateRecord::new();
        let wide = aggregator(5);
        for i in 0..5 {
            wide.apply(&mut record, &sample(10, i * 1000)).unwrap();
        }
        let narrow = aggregator(2);
        narrow.apply(&mut record, &sample(10, 5000)).unwrap();
        let seqs: Vec<_> = record.entries().map(WindowEntry::seq).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[test]
    fn test_config_validate() {
        assert!(AggregatorConfig::default().validate().is_ok());
        let config = AggregatorConfig {
            max_window_size: 0,
            ..AggregatorConfig::default()
        };
        assert_eq!(
            WindowAggregator::new(config),
            Err(ConfigurationError::InvalidWindowSize)
        );
        for divisor in [0.0, -3.6, f64::INFINITY] {
            let config = AggregatorConfig {
                speed_divisor: divisor,
                ..AggregatorConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigurationError::InvalidSpeedDivisor(_))
            ));
        }
    }

    #[test]
    fn test_config_defaults_from_serde() {
        let config: AggregatorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AggregatorConfig::default());
        assert_eq!(config.max_window_size(), 10);
        assert_eq!(config.rule_type(), 1);
        assert_eq!(config.speed_divisor(), 1.0);
        assert!(config.track_heading());
    }

    fn get_test_input() -> Vec<(String, Sample)> {
        vec![
            ("car-1".to_string(), sample(10, 0)),
            ("car-2".to_string(), sample(50, 0)),
            ("car-1".to_string(), sample(20, 1000)),
            // Duplicate delivery of an already accepted sample
            ("car-1".to_string(), sample(20, 1000)),
            ("car-2".to_string(), sample(40, 500)),
            ("car-1".to_string(), sample(30, 2000)),
        ]
    }

    #[test]
    fn test_moving_average_iterator() {
        let mut adaptor = get_test_input().into_iter().moving_average(aggregator(2));
        let results: Vec<_> = adaptor.by_ref().collect();
        assert_eq!(results.len(), 6);

        let accepted: Vec<_> = results
            .iter()
            .cloned()
            .filter_map(|x| x.left())
            .map(|(key, agg)| (key, agg.average_speed))
            .collect();
        assert_eq!(
            accepted,
            vec![
                ("car-1".to_string(), 10.0),
                ("car-2".to_string(), 50.0),
                ("car-1".to_string(), 15.0),
                ("car-2".to_string(), 45.0),
                ("car-1".to_string(), 25.0),
            ]
        );
        let rejected: Vec<_> = results.into_iter().filter_map(|x| x.right()).collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].0, ("car-1".to_string(), sample(20, 1000)));
        assert!(rejected[0].1.is_stale());

        let record = adaptor.record(&"car-1".to_string()).unwrap();
        assert_eq!(record.len(), 2);
        assert_eq!(record.sequence(), Some(2));
    }

    #[tokio::test]
    async fn test_moving_average_stream() {
        let expected: Vec<_> = get_test_input()
            .into_iter()
            .moving_average(aggregator(2))
            .collect();
        let results: Vec<_> = stream::iter(get_test_input())
            .moving_average(aggregator(2))
            .collect()
            .await;
        assert_eq!(results, expected);
    }
}
