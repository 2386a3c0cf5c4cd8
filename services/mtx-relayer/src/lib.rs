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

//! # Meta-Transaction Relay Server
//!
//! The relay server drives the relay manager of a meta-transaction relay
//! network. On every new ledger block it runs a worker cycle that:
//!
//! * refreshes the gas price and the manager and worker balances,
//! * reacts to registrar events (stake changes, hub authorization, owner
//!   changes) and registers the relay server when needed,
//! * prunes confirmed transactions and boosts stuck ones,
//! * keeps the workers funded, and
//! * tracks whether the relay server is ready to accept relay requests.
//!
//! [`RelayServer`] holds that state, [`service`] runs it against a block
//! poller in the background.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Readiness accounting.
pub mod readiness;
/// The relay server and its worker cycle.
pub mod server;
/// Background services.
pub mod service;

pub use readiness::{ReadinessInfo, ReadinessStats};
pub use server::{BalanceCheck, RelayServer};
pub use service::{ignite, poll_once, SharedRelayServer};

#[cfg(test)]
mod tests;
