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

use std::fmt::Display;

use ethers::types::U256;
use mtx_relayer_utils::probe;

/// A tracked (current, required) pair. Satisfied when the current value is
/// at least the required one.
#[derive(Debug, Clone)]
pub struct AmountRequired {
    name: &'static str,
    current: U256,
    required: U256,
}

impl AmountRequired {
    /// Starts unsatisfied at zero.
    pub fn new(name: &'static str, required: U256) -> Self {
        Self {
            name,
            current: U256::zero(),
            required,
        }
    }

    /// Current value.
    pub fn current(&self) -> U256 {
        self.current
    }

    /// Required value.
    pub fn required(&self) -> U256 {
        self.required
    }

    /// Whether the current value meets the requirement.
    pub fn is_satisfied(&self) -> bool {
        self.current >= self.required
    }

    /// Updates the current value.
    pub fn set_current(&mut self, current: U256) {
        let was = self.is_satisfied();
        self.current = current;
        self.log_flip(was);
    }

    /// Updates the required value.
    pub fn set_required(&mut self, required: U256) {
        let was = self.is_satisfied();
        self.required = required;
        self.log_flip(was);
    }

    fn log_flip(&self, was_satisfied: bool) {
        let satisfied = self.is_satisfied();
        if satisfied == was_satisfied {
            return;
        }
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Registration,
            requirement = self.name,
            current = %self.current,
            required = %self.required,
            satisfied = satisfied,
        );
        if satisfied {
            tracing::info!("{} requirement is satisfied: {}", self.name, self);
        } else {
            tracing::warn!("{} requirement is not satisfied: {}", self.name, self);
        }
    }
}

impl Display for AmountRequired {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mark = if self.is_satisfied() { "ok" } else { "missing" };
        write!(f, "{} {}/{} ({mark})", self.name, self.current, self.required)
    }
}
