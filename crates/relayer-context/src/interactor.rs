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

use ethers::types::{Address, BlockNumber, Bytes, H256, U256};
use mtx_relayer_types::BlockInfo;
use mtx_relayer_utils::Result;
use serde::Serialize;

/// The stake of a relay manager, as reported by the StakeManager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StakeInfo {
    /// Amount of staked tokens.
    pub stake: U256,
    /// Delay, in seconds, before an unlocked stake can be withdrawn.
    pub unstake_delay: U256,
    /// When the unlocked stake becomes withdrawable, `0` if still locked.
    pub withdraw_time: U256,
    /// The staked token.
    pub token: Address,
    /// The owner of the stake.
    pub owner: Address,
}

/// Events of the registrar contracts that concern a relay manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "name")]
pub enum RelayEvent {
    /// The manager authorized a hub to penalize its stake.
    HubAuthorized {
        /// The authorized hub.
        relay_hub: Address,
    },
    /// The manager revoked a hub authorization, effective at `removal_time`.
    HubUnauthorized {
        /// The hub losing its authorization.
        relay_hub: Address,
        /// Timestamp (seconds) at which the revocation takes effect.
        removal_time: u64,
    },
    /// The owner added stake for the manager.
    StakeAdded {
        /// Owner of the stake.
        owner: Address,
        /// Staked token.
        token: Address,
        /// Total stake after the deposit.
        stake: U256,
        /// Unstake delay of the stake.
        unstake_delay: U256,
    },
    /// The owner started the unstake delay.
    StakeUnlocked {
        /// Owner of the stake.
        owner: Address,
        /// When the stake becomes withdrawable.
        withdraw_time: u64,
    },
    /// The owner withdrew the stake.
    StakeWithdrawn {
        /// Owner of the stake.
        owner: Address,
        /// Staked token.
        token: Address,
        /// Withdrawn amount.
        amount: U256,
    },
    /// The stake was slashed by a hub.
    StakePenalized {
        /// Who received the reward.
        beneficiary: Address,
        /// Staked token.
        token: Address,
        /// The reward paid out of the stake.
        reward: U256,
    },
    /// The stake owner was set.
    OwnerSet {
        /// The new owner.
        owner: Address,
    },
    /// The relay server (re-)registered its URL on the hub.
    RelayServerRegistered {
        /// The advertised URL.
        url: String,
    },
    /// Workers were added for the manager.
    RelayWorkersAdded {
        /// The new workers.
        workers: Vec<Address>,
        /// The total worker count of the manager.
        workers_count: u64,
    },
}

impl RelayEvent {
    /// The Solidity name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HubAuthorized { .. } => "HubAuthorized",
            Self::HubUnauthorized { .. } => "HubUnauthorized",
            Self::StakeAdded { .. } => "StakeAdded",
            Self::StakeUnlocked { .. } => "StakeUnlocked",
            Self::StakeWithdrawn { .. } => "StakeWithdrawn",
            Self::StakePenalized { .. } => "StakePenalized",
            Self::OwnerSet { .. } => "OwnerSet",
            Self::RelayServerRegistered { .. } => "RelayServerRegistered",
            Self::RelayWorkersAdded { .. } => "RelayWorkersAdded",
        }
    }
}

/// A decoded log entry of the registrar contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEvent {
    /// The manager the event refers to.
    pub relay_manager: Address,
    /// Block the event was emitted in.
    pub block_number: u64,
    /// Position of the log in the block.
    pub log_index: u64,
    /// The transaction that emitted the event.
    pub tx_hash: H256,
    /// The event itself.
    pub event: RelayEvent,
}

/// What the ledger knows about a transaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerTransaction {
    /// The transaction hash.
    pub hash: H256,
    /// The block it was mined in, `None` while pending.
    pub block_number: Option<u64>,
}

/// The ledger RPC endpoint together with the views of the registrar
/// contracts the relayer needs.
///
/// Every call is fallible and may be slow; implementations never retry at
/// this level beyond what the transport does.
#[async_trait::async_trait]
pub trait ContractInteractor: Send + Sync {
    /// Address of the RelayHub.
    fn relay_hub_address(&self) -> Address;
    /// Address of the StakeManager.
    fn stake_manager_address(&self) -> Address;

    /// The chain id of the ledger.
    async fn chain_id(&self) -> Result<u64>;
    /// Height of the chain head.
    async fn get_block_number(&self) -> Result<u64>;
    /// Header of the block at `number`.
    async fn get_block(&self, number: u64) -> Result<BlockInfo>;
    /// Native balance of `address`.
    async fn get_balance(&self, address: Address) -> Result<U256>;
    /// Transaction count of `address` at `block` (`Pending` or `Latest`).
    async fn get_transaction_count(
        &self,
        address: Address,
        block: BlockNumber,
    ) -> Result<u64>;
    /// Looks a transaction up by hash, `None` if the ledger does not know it.
    async fn get_transaction(
        &self,
        hash: H256,
    ) -> Result<Option<LedgerTransaction>>;
    /// Broadcasts a signed transaction and returns its hash.
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256>;
    /// Current network gas price.
    async fn get_gas_price(&self) -> Result<U256>;
    /// Estimates the gas of a call.
    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: &Bytes,
    ) -> Result<U256>;
    /// Events about `relay_manager` in `[from_block, to_block]`, ordered by
    /// block then log index.
    async fn get_past_events(
        &self,
        relay_manager: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LedgerEvent>>;
    /// Stake of `relay_manager`.
    async fn get_stake_info(&self, relay_manager: Address) -> Result<StakeInfo>;
    /// Minimum stake the hub requires for `token`, `0` if not accepted.
    async fn get_minimum_stake_per_token(&self, token: Address)
        -> Result<U256>;
    /// Minimum unstake delay the hub requires.
    async fn get_minimum_unstake_delay(&self) -> Result<U256>;
    /// Deposit of `address` on the hub.
    async fn relay_hub_balance_of(&self, address: Address) -> Result<U256>;
    /// Manager a worker is registered for, zero if none.
    async fn worker_to_manager(&self, worker: Address) -> Result<Address>;
}
