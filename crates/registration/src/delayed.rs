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

use std::collections::VecDeque;

use mtx_relayer_context::LedgerEvent;

/// An event whose consequence is deferred until `time`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayedEvent {
    /// When the event becomes due, as a block timestamp.
    pub time: u64,
    /// The deferred event.
    pub event: LedgerEvent,
}

/// Delayed events in arrival order.
#[derive(Debug, Default, Clone)]
pub struct DelayedEvents {
    queue: VecDeque<DelayedEvent>,
}

impl DelayedEvents {
    /// Queues `event` until `time`.
    pub fn push(&mut self, time: u64, event: LedgerEvent) {
        self.queue.push_back(DelayedEvent { time, event });
    }

    /// Number of queued events.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drops the queued events matching `cancelled`. Returns how many were
    /// dropped.
    pub fn cancel<F>(&mut self, cancelled: F) -> usize
    where
        F: Fn(&LedgerEvent) -> bool,
    {
        let before = self.queue.len();
        self.queue.retain(|delayed| !cancelled(&delayed.event));
        before - self.queue.len()
    }

    /// Removes and returns, in arrival order, every event due at
    /// `current_time`. Later events stay queued.
    pub fn extract_due(&mut self, current_time: u64) -> Vec<LedgerEvent> {
        let mut due = Vec::new();
        let mut later = VecDeque::with_capacity(self.queue.len());
        for delayed in self.queue.drain(..) {
            if delayed.time <= current_time {
                due.push(delayed.event);
            } else {
                later.push_back(delayed);
            }
        }
        self.queue = later;
        due
    }
}
