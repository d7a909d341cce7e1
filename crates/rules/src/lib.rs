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

//! Rule conditions and actions evaluated against car probes.
//!
//! Conditions are read-only checks ([`condition::Condition`]) over a probe,
//! its vehicle and, optionally, the aggregates published by
//! `probewatch-analytics`. The [`action::MovingAverageAction`] is the rule
//! action that keeps those aggregates up to date.

pub mod action;
pub mod compare;
pub mod condition;
pub mod probe;

pub use action::{ActionError, ActionOutcome, MovingAverageAction};
pub use compare::CompareOp;
pub use condition::{
    AggregateMetric, AggregateThresholdCondition, Condition, ConditionContext, ConditionError,
    HalfFuelCondition, LowFuelCondition,
};
pub use probe::{CarProbe, Vehicle};
