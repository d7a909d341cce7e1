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

use crate::payload::PayloadFormat;
use probewatch_analytics::AggregatorConfig;
use probewatch_rules::AggregateThresholdCondition;
use serde_with::serde_as;
use std::{collections::HashSet, str::FromStr, time::Duration};

const NUM_WORKERS_DEFAULT: usize = 1;

pub(crate) const fn default_num_workers() -> usize {
    NUM_WORKERS_DEFAULT
}

pub(crate) const fn default_buffer_size() -> usize {
    1_000
}

pub(crate) const fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub input: InputConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Threshold conditions evaluated on every published aggregate
    #[serde(default)]
    pub alerts: Vec<AggregateThresholdCondition>,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if tracing::Level::from_str(&self.logging.level).is_err() {
            return Err(ConfigurationError::InvalidLoggingLevel(
                self.logging.level.clone(),
            ));
        }
        if self.runtime.threads == Some(0) {
            return Err(ConfigurationError::ZeroThreads);
        }
        self.aggregation.validate()?;
        let mut ids = HashSet::new();
        for alert in &self.alerts {
            if !ids.insert(alert.id.as_str()) {
                return Err(ConfigurationError::DuplicateAlertId(alert.id.clone()));
            }
            if !alert.threshold.is_finite() {
                return Err(ConfigurationError::InvalidAlertThreshold(alert.id.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuntimeConfig {
    #[serde(skip_serializing_if = "::std::option::Option::is_none")]
    pub threads: Option<usize>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct InputConfig {
    #[serde(default)]
    pub format: PayloadFormat,
}

#[serde_as]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AggregationConfig {
    /// Number of aggregation actors, vehicles are sharded across them
    #[serde(default = "default_num_workers")]
    pub workers: usize,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// How long to wait for the actors to drain on shutdown
    #[serde(default = "default_shutdown_timeout")]
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub shutdown_timeout: Duration,

    #[serde(default)]
    pub window: AggregatorConfig,
}

impl AggregationConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.workers == 0 {
            return Err(ConfigurationError::ZeroWorkers);
        }
        if self.buffer_size == 0 {
            return Err(ConfigurationError::ZeroBufferSize);
        }
        self.window
            .validate()
            .map_err(ConfigurationError::Aggregation)
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            workers: default_num_workers(),
            buffer_size: default_buffer_size(),
            shutdown_timeout: default_shutdown_timeout(),
            window: AggregatorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    InvalidLoggingLevel(String),
    ZeroThreads,
    ZeroWorkers,
    ZeroBufferSize,
    Aggregation(probewatch_analytics::ConfigurationError),
    DuplicateAlertId(String),
    InvalidAlertThreshold(String),
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLoggingLevel(level) => write!(f, "invalid logging level `{level}`"),
            Self::ZeroThreads => write!(f, "runtime threads must be greater than 0"),
            Self::ZeroWorkers => write!(f, "aggregation workers must be greater than 0"),
            Self::ZeroBufferSize => write!(f, "aggregation buffer_size must be greater than 0"),
            Self::Aggregation(err) => write!(f, "invalid aggregation window: {err}"),
            Self::DuplicateAlertId(id) => write!(f, "duplicate alert id `{id}`"),
            Self::InvalidAlertThreshold(id) => {
                write!(f, "alert `{id}` threshold must be a finite number")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}
