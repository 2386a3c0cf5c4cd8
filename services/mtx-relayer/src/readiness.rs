// Copyright 2022 Webb Technologies Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Readiness accounting of the relay server.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::Serialize;

/// Process-wide readiness state. Every instant since `running_since` is
/// accounted to exactly one of the ready and not-ready totals. Timestamps
/// are kept at millisecond precision, the unit of the totals.
#[derive(Debug, Clone)]
pub struct ReadinessInfo {
    running_since: DateTime<Utc>,
    current_state_timestamp: DateTime<Utc>,
    total_ready_time: Duration,
    total_not_ready_time: Duration,
    total_readiness_changes: u64,
    is_ready: bool,
}

/// A serializable snapshot of [`ReadinessInfo`], durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessStats {
    /// When the process started.
    pub running_since: DateTime<Utc>,
    /// When the current state was entered.
    pub current_state_timestamp: DateTime<Utc>,
    /// Time spent ready before the current state.
    pub total_ready_time: i64,
    /// Time spent not ready before the current state.
    pub total_not_ready_time: i64,
    /// Number of observed flips.
    pub total_readiness_changes: u64,
    /// The current state.
    pub is_ready: bool,
}

impl ReadinessInfo {
    /// Starts not ready at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        let now = now.trunc_subsecs(3);
        Self {
            running_since: now,
            current_state_timestamp: now,
            total_ready_time: Duration::zero(),
            total_not_ready_time: Duration::zero(),
            total_readiness_changes: 0,
            is_ready: false,
        }
    }

    /// The current state.
    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    /// Records the state observed at `now`. On a flip, the time spent in the
    /// previous state is added to its total. Returns whether it flipped.
    pub fn set_ready(&mut self, ready: bool, now: DateTime<Utc>) -> bool {
        if ready == self.is_ready {
            return false;
        }
        // never go back in time, a skewed clock must not break the totals.
        let now = now.trunc_subsecs(3).max(self.current_state_timestamp);
        let elapsed = now - self.current_state_timestamp;
        if self.is_ready {
            self.total_ready_time = self.total_ready_time + elapsed;
        } else {
            self.total_not_ready_time = self.total_not_ready_time + elapsed;
        }
        self.current_state_timestamp = now;
        self.total_readiness_changes += 1;
        self.is_ready = ready;
        true
    }

    /// A snapshot of the accounting.
    pub fn stats(&self) -> ReadinessStats {
        ReadinessStats {
            running_since: self.running_since,
            current_state_timestamp: self.current_state_timestamp,
            total_ready_time: self.total_ready_time.num_milliseconds(),
            total_not_ready_time: self.total_not_ready_time.num_milliseconds(),
            total_readiness_changes: self.total_readiness_changes,
            is_ready: self.is_ready,
        }
    }
}
