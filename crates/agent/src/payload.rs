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

//! Decoding of car probe payloads.
//!
//! Two line formats are understood:
//!
//! - JSON objects with the fields `vehicle_id`, `speed`, `heading`,
//!   `distance`, `link_id`, `timestamp` and an optional `properties` map.
//!   Numbers may also be given as strings. `timestamp` is either epoch
//!   milliseconds or an RFC 3339 date-time.
//! - CSV records `vehicle_id,timestamp_ms,speed,heading,distance,link_id`
//!   followed by any number of `key=value` properties.
//!
//! Every field is validated here, so a [`CarProbe`] handed to the
//! aggregation never carries a non-finite heading or distance.

use chrono::{DateTime, Utc};
use probewatch_rules::CarProbe;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::{collections::HashMap, str::FromStr};
use strum_macros::{Display, EnumString};

pub const FIELD_VEHICLE_ID: &str = "vehicle_id";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_SPEED: &str = "speed";
pub const FIELD_HEADING: &str = "heading";
pub const FIELD_DISTANCE: &str = "distance";
pub const FIELD_LINK_ID: &str = "link_id";

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    #[default]
    Json,
    Csv,
}

impl PayloadFormat {
    pub fn decode(&self, line: &str) -> Result<CarProbe, PayloadError> {
        match self {
            Self::Json => decode_json(line),
            Self::Csv => decode_csv(line),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("empty payload")]
    Empty,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("invalid number `{value}` for field `{field}`")]
    InvalidNumber { field: &'static str, value: String },

    #[error("field `{0}` is not a finite number")]
    NonFinite(&'static str),

    #[error("invalid timestamp `{0}`")]
    InvalidTimestamp(String),

    #[error("invalid property `{0}`")]
    InvalidProperty(String),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

fn parse_number<T: FromStr>(field: &'static str, value: &str) -> Result<T, PayloadError> {
    value
        .trim()
        .parse()
        .map_err(|_| PayloadError::InvalidNumber {
            field,
            value: value.to_string(),
        })
}

fn parse_finite(field: &'static str, value: &str) -> Result<f64, PayloadError> {
    check_finite(field, parse_number(field, value)?)
}

fn check_finite(field: &'static str, number: f64) -> Result<f64, PayloadError> {
    if number.is_finite() {
        Ok(number)
    } else {
        Err(PayloadError::NonFinite(field))
    }
}

/// Epoch milliseconds, or an RFC 3339 date-time
fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PayloadError> {
    let value = value.trim();
    let parsed = match value.parse::<i64>() {
        Ok(millis) => DateTime::from_timestamp_millis(millis),
        Err(_) => DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
    };
    parsed.ok_or_else(|| PayloadError::InvalidTimestamp(value.to_string()))
}

fn required<'a>(
    fields: &'a [&'a str],
    idx: usize,
    field: &'static str,
) -> Result<&'a str, PayloadError> {
    match fields.get(idx).map(|value| value.trim()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(PayloadError::MissingField(field)),
    }
}

pub fn decode_csv(line: &str) -> Result<CarProbe, PayloadError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(PayloadError::Empty);
    }
    let fields = line.split(',').collect::<Vec<_>>();
    let vehicle_id = required(&fields, 0, FIELD_VEHICLE_ID)?.to_string();
    let event_time = parse_timestamp(required(&fields, 1, FIELD_TIMESTAMP)?)?;
    let speed = parse_number(FIELD_SPEED, required(&fields, 2, FIELD_SPEED)?)?;
    let heading = parse_finite(FIELD_HEADING, required(&fields, 3, FIELD_HEADING)?)?;
    let distance = parse_finite(FIELD_DISTANCE, required(&fields, 4, FIELD_DISTANCE)?)?;
    let link_id = parse_number(FIELD_LINK_ID, required(&fields, 5, FIELD_LINK_ID)?)?;
    let mut properties = HashMap::new();
    for pair in fields.iter().skip(6).map(|pair| pair.trim()) {
        if pair.is_empty() {
            continue;
        }
        let Some((key, value)) = pair.split_once('=') else {
            return Err(PayloadError::InvalidProperty(pair.to_string()));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(PayloadError::InvalidProperty(pair.to_string()));
        }
        properties.insert(key.to_string(), value.trim().to_string());
    }
    Ok(CarProbe {
        vehicle_id,
        event_time,
        speed,
        heading,
        distance,
        link_id,
        properties,
    })
}

/// JSON probe as received, presence and ranges are checked afterwards
#[serde_as]
#[derive(Debug, Deserialize)]
struct JsonPayload {
    vehicle_id: Option<String>,
    timestamp: Option<JsonTimestamp>,
    #[serde_as(as = "Option<serde_with::PickFirst<(_, serde_with::DisplayFromStr)>>")]
    speed: Option<f64>,
    #[serde_as(as = "Option<serde_with::PickFirst<(_, serde_with::DisplayFromStr)>>")]
    heading: Option<f64>,
    #[serde_as(as = "Option<serde_with::PickFirst<(_, serde_with::DisplayFromStr)>>")]
    distance: Option<f64>,
    #[serde_as(as = "Option<serde_with::PickFirst<(_, serde_with::DisplayFromStr)>>")]
    link_id: Option<i64>,
    properties: Option<HashMap<String, JsonProperty>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonTimestamp {
    Millis(f64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonProperty {
    Text(String),
    Number(serde_json::Number),
    Flag(bool),
}

impl From<JsonProperty> for String {
    fn from(value: JsonProperty) -> Self {
        match value {
            JsonProperty::Text(text) => text,
            JsonProperty::Number(number) => number.to_string(),
            JsonProperty::Flag(flag) => flag.to_string(),
        }
    }
}

fn present<T>(value: Option<T>, field: &'static str) -> Result<T, PayloadError> {
    value.ok_or(PayloadError::MissingField(field))
}

impl JsonTimestamp {
    fn to_datetime(&self) -> Result<DateTime<Utc>, PayloadError> {
        match self {
            Self::Millis(millis) if millis.is_finite() => {
                DateTime::from_timestamp_millis(millis.trunc() as i64)
                    .ok_or_else(|| PayloadError::InvalidTimestamp(millis.to_string()))
            }
            Self::Millis(millis) => Err(PayloadError::InvalidTimestamp(millis.to_string())),
            Self::Text(text) => parse_timestamp(text),
        }
    }
}

impl TryFrom<JsonPayload> for CarProbe {
    type Error = PayloadError;

    fn try_from(payload: JsonPayload) -> Result<Self, Self::Error> {
        let vehicle_id = match payload.vehicle_id {
            Some(vehicle_id) if !vehicle_id.trim().is_empty() => vehicle_id,
            _ => return Err(PayloadError::MissingField(FIELD_VEHICLE_ID)),
        };
        let event_time = present(payload.timestamp, FIELD_TIMESTAMP)?.to_datetime()?;
        let speed = present(payload.speed, FIELD_SPEED)?;
        // Whole numbers written as floats, such as `30.0`, are valid speeds
        if speed.fract() != 0.0 || !(0.0..=f64::from(u32::MAX)).contains(&speed) {
            return Err(PayloadError::InvalidNumber {
                field: FIELD_SPEED,
                value: speed.to_string(),
            });
        }
        let heading = check_finite(FIELD_HEADING, present(payload.heading, FIELD_HEADING)?)?;
        let distance = check_finite(FIELD_DISTANCE, present(payload.distance, FIELD_DISTANCE)?)?;
        Ok(CarProbe {
            vehicle_id,
            event_time,
            speed: speed as u32,
            heading,
            distance,
            link_id: present(payload.link_id, FIELD_LINK_ID)?,
            properties: payload
                .properties
                .unwrap_or_default()
                .into_iter()
                .map(|(key, value)| (key, value.into()))
                .collect(),
        })
    }
}

pub fn decode_json(line: &str) -> Result<CarProbe, PayloadError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(PayloadError::Empty);
    }
    let payload: JsonPayload = serde_json::from_str(line)?;
    payload.try_into()
}
