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

#![warn(missing_docs)]

//! # Relayer Configuration Module 🕸️
//!
//! A module for configuring the relayer.
//!
//! ## Overview
//!
//! The relayer reads every `*.toml`/`*.json` file under its config directory,
//! merges them with `MTX_` prefixed environment variables and deserializes
//! the result into a [`RelayerConfig`]. Possible configuration include:
//! * `url`: The public URL the relay server advertises on-chain.
//! * `ledger`: The ledger endpoint the relayer talks to.
//! * `relay-hub-address`, `stake-manager-address`: The registrar contracts.
//! * balance thresholds, gas pricing and boosting knobs, see [`RelayerConfig`].

/// CLI configuration
#[cfg(feature = "cli")]
pub mod cli;
/// Default values of the configuration.
pub mod defaults;
/// Utils for processing configuration
pub mod utils;

use ethers::types::{Address, U256};
use mtx_relayer_types::{amount, PrivateKey, RpcUrl, SubmissionMode};
use serde::{Deserialize, Serialize};

/// The ledger the relayer submits transactions to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LedgerConfig {
    /// Http(s) Endpoint of the ledger JSON-RPC.
    #[serde(skip_serializing)]
    pub http_endpoint: RpcUrl,
    /// The expected chain id, checked against the endpoint at startup.
    #[serde(default)]
    pub chain_id: Option<u64>,
}

/// Keys of the relayer identities.
///
/// Identities that are not configured here are generated on first start and
/// kept in the keystore next to the database.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct KeysConfig {
    /// Private key of the manager identity.
    ///
    /// It could be:
    /// 1. a hex string (including the 0x prefix)
    /// 2. an env var containing the hex string, written as `$VAR_NAME`
    #[serde(skip_serializing, default)]
    pub manager_private_key: Option<PrivateKey>,
    /// Private keys of the worker identities, same format as the manager's.
    #[serde(skip_serializing, default)]
    pub worker_private_keys: Vec<PrivateKey>,
}

/// RelayerConfig is the configuration for the meta-transaction relayer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelayerConfig {
    /// The URL this relay server advertises when registering.
    pub url: String,
    /// The ledger connection.
    pub ledger: LedgerConfig,
    /// Address of the RelayHub contract.
    pub relay_hub_address: Address,
    /// Address of the StakeManager contract.
    ///
    /// When missing, it is read from the RelayHub.
    #[serde(default)]
    pub stake_manager_address: Option<Address>,
    /// The account that owns the stake of the manager identity, and receives
    /// the swept funds.
    pub owner_address: Address,
    /// The token the manager is staked with.
    #[serde(default)]
    pub manager_stake_token_address: Address,
    /// Keys of the relayer identities.
    #[serde(default)]
    pub keys: KeysConfig,
    /// How many worker identities the manager registers.
    #[serde(default = "defaults::worker_count")]
    pub worker_count: usize,
    /// Blocks after which an unmined transaction is boosted.
    #[serde(default = "defaults::pending_transaction_timeout_blocks")]
    pub pending_transaction_timeout_blocks: u64,
    /// Minimum blocks between two boosts of the same nonce.
    ///
    /// Defaults to `pending-transaction-timeout-blocks`.
    #[serde(default)]
    pub boost_cooldown_blocks: Option<u64>,
    /// Confirmations after which a mined transaction is dropped from the store.
    #[serde(default = "defaults::confirmations_needed")]
    pub confirmations_needed: u64,
    /// Multiplier applied to the old gas price when boosting.
    #[serde(default = "defaults::retry_gas_price_factor")]
    pub retry_gas_price_factor: f64,
    /// Multiplier applied to the network gas price for new transactions.
    #[serde(default = "defaults::gas_price_factor")]
    pub gas_price_factor: f64,
    /// Ceiling of the gas price, in wei.
    #[serde(default = "defaults::max_gas_price", with = "amount")]
    pub max_gas_price: U256,
    /// Gas limit used when the estimation fails.
    #[serde(default = "defaults::default_gas_limit")]
    pub default_gas_limit: u64,
    /// Below this native balance the manager cannot operate.
    #[serde(default = "defaults::manager_min_balance", with = "amount")]
    pub manager_min_balance: U256,
    /// The manager is topped up from its hub deposit up to this balance.
    #[serde(default = "defaults::manager_target_balance", with = "amount")]
    pub manager_target_balance: U256,
    /// Below this native balance a worker cannot operate.
    #[serde(default = "defaults::worker_min_balance", with = "amount")]
    pub worker_min_balance: U256,
    /// Workers are topped up to this balance.
    #[serde(default = "defaults::worker_target_balance", with = "amount")]
    pub worker_target_balance: U256,
    /// The hub deposit is only withdrawn when at least this large.
    #[serde(default = "defaults::min_hub_withdrawal_balance", with = "amount")]
    pub min_hub_withdrawal_balance: U256,
    /// When set, hub deposit above this amount is swept to the owner.
    #[serde(default, with = "amount::option")]
    pub withdraw_to_owner_on_balance: Option<U256>,
    /// Re-register when the last registration is older than this many
    /// blocks, `0` disables it.
    #[serde(default = "defaults::registration_block_rate")]
    pub registration_block_rate: u64,
    /// Re-register when nothing was relayed or registered for this many
    /// blocks, `0` disables it.
    #[serde(default = "defaults::activity_block_rate")]
    pub activity_block_rate: u64,
    /// The same action is not sent again within this many blocks.
    #[serde(default = "defaults::recent_action_avoid_repeat_distance_blocks")]
    pub recent_action_avoid_repeat_distance_blocks: u64,
    /// A ready relayer refreshes its full state at least this often.
    #[serde(default = "defaults::refresh_state_timeout_blocks")]
    pub refresh_state_timeout_blocks: u64,
    /// Consecutive successful rounds before reporting ready.
    #[serde(default = "defaults::successful_rounds_for_ready")]
    pub successful_rounds_for_ready: u64,
    /// Interval between two polls of the ledger head, in milliseconds.
    #[serde(default = "defaults::polling_interval")]
    pub polling_interval: u64,
    /// How relay calls are submitted.
    #[serde(default)]
    pub submission_mode: SubmissionMode,
    /// The batch gateway, required in `batched` submission mode.
    #[serde(default)]
    pub batch_gateway_address: Option<Address>,
}

impl RelayerConfig {
    /// Minimum blocks between two boosts of the same nonce.
    pub fn boost_cooldown_blocks(&self) -> u64 {
        self.boost_cooldown_blocks
            .unwrap_or(self.pending_transaction_timeout_blocks)
    }

    /// The destination of relay calls in the configured submission mode.
    pub fn relay_call_destination(&self) -> Address {
        match self.submission_mode {
            SubmissionMode::Individual => self.relay_hub_address,
            SubmissionMode::Batched => self
                .batch_gateway_address
                .unwrap_or(self.relay_hub_address),
        }
    }

    /// Makes sure that the config is valid, by going
    /// through the whole config and doing some basic checks.
    pub fn verify(&self) -> mtx_relayer_utils::Result<()> {
        use mtx_relayer_utils::Error::InvalidConfig;
        if self.url.trim().is_empty() {
            return Err(InvalidConfig("url must not be empty".into()));
        }
        if self.owner_address.is_zero() {
            return Err(InvalidConfig("owner-address must be set".into()));
        }
        if self.relay_hub_address.is_zero() {
            return Err(InvalidConfig("relay-hub-address must be set".into()));
        }
        if self.worker_count == 0 {
            return Err(InvalidConfig("worker-count must be at least 1".into()));
        }
        if self.keys.worker_private_keys.len() > self.worker_count {
            return Err(InvalidConfig(format!(
                "{} worker keys configured but worker-count is {}",
                self.keys.worker_private_keys.len(),
                self.worker_count
            )));
        }
        if self.retry_gas_price_factor <= 1.0 {
            return Err(InvalidConfig(
                "retry-gas-price-factor must be greater than 1".into(),
            ));
        }
        if self.gas_price_factor <= 0.0 {
            return Err(InvalidConfig(
                "gas-price-factor must be positive".into(),
            ));
        }
        if self.manager_target_balance < self.manager_min_balance {
            return Err(InvalidConfig(
                "manager-target-balance is lower than manager-min-balance"
                    .into(),
            ));
        }
        if self.worker_target_balance < self.worker_min_balance {
            return Err(InvalidConfig(
                "worker-target-balance is lower than worker-min-balance".into(),
            ));
        }
        if self.submission_mode == SubmissionMode::Batched
            && self.batch_gateway_address.is_none()
        {
            return Err(InvalidConfig(
                "batch-gateway-address is required in batched submission mode"
                    .into(),
            ));
        }
        Ok(())
    }
}
