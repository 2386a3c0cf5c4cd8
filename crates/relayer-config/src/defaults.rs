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

use ethers::types::U256;
use ethers::utils::WEI_IN_ETHER;

const GWEI: u64 = 1_000_000_000;

/// One worker identity by default.
pub const fn worker_count() -> usize {
    1
}
/// A transaction is considered stuck after `30` blocks without being mined.
pub const fn pending_transaction_timeout_blocks() -> u64 {
    30
}
/// A transaction is final after `12` confirmations.
pub const fn confirmations_needed() -> u64 {
    12
}
/// Boosted transactions are re-priced to at least `1.2x` the old price.
pub const fn retry_gas_price_factor() -> f64 {
    1.2
}
/// The network gas price is used as is.
pub const fn gas_price_factor() -> f64 {
    1.0
}
/// The relayer never pays more than `500 gwei` per gas.
pub fn max_gas_price() -> U256 {
    U256::from(500 * GWEI)
}
/// Gas limit used when the estimation fails, `500_000`.
pub const fn default_gas_limit() -> u64 {
    500_000
}
/// `0.1 ether`.
pub fn manager_min_balance() -> U256 {
    WEI_IN_ETHER / 10
}
/// `0.3 ether`.
pub fn manager_target_balance() -> U256 {
    WEI_IN_ETHER * 3 / 10
}
/// `0.1 ether`.
pub fn worker_min_balance() -> U256 {
    WEI_IN_ETHER / 10
}
/// `0.3 ether`.
pub fn worker_target_balance() -> U256 {
    WEI_IN_ETHER * 3 / 10
}
/// `0.1 ether`.
pub fn min_hub_withdrawal_balance() -> U256 {
    WEI_IN_ETHER / 10
}
/// Re-registration by age is disabled by default.
pub const fn registration_block_rate() -> u64 {
    0
}
/// Re-registration by inactivity is disabled by default.
pub const fn activity_block_rate() -> u64 {
    0
}
/// The same action is not repeated within `10` blocks.
pub const fn recent_action_avoid_repeat_distance_blocks() -> u64 {
    10
}
/// A ready relayer refreshes its full state every `5` blocks.
pub const fn refresh_state_timeout_blocks() -> u64 {
    5
}
/// Three successful rounds before reporting ready.
pub const fn successful_rounds_for_ready() -> u64 {
    3
}
/// The ledger is polled every `10` seconds.
pub const fn polling_interval() -> u64 {
    10_000
}
