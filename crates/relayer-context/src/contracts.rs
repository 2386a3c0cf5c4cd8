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

//! Bindings of the registrar contracts and calldata encoding of the
//! transactions the relayer sends to them.

use ethers::abi::AbiEncode;
use ethers::contract::{abigen, EthLogDecode};
use ethers::types::{Address, Bytes, Log, U256};
use mtx_relayer_utils::Result;

use crate::interactor::{LedgerEvent, RelayEvent};

abigen!(
    RelayHubContract,
    r#"[
        function getStakeManager() external view returns (address)
        function getMinimumStakePerToken(address token) external view returns (uint256)
        function getMinimumUnstakeDelay() external view returns (uint256)
        function balanceOf(address target) external view returns (uint256)
        function workerToManager(address worker) external view returns (address)
        function addRelayWorkers(address[] newRelayWorkers) external
        function registerRelayServer(string url) external
        function withdraw(address dest, uint256 amount) external
        event RelayServerRegistered(address indexed relayManager, string relayUrl)
        event RelayWorkersAdded(address indexed relayManager, address[] newRelayWorkers, uint256 workersCount)
    ]"#
);

abigen!(
    StakeManagerContract,
    r#"[
        function getStakeInfo(address relayManager) external view returns (uint256 stake, uint256 unstakeDelay, uint256 withdrawTime, address token, address owner)
        function setRelayManagerOwner(address owner) external
        event StakeAdded(address indexed relayManager, address indexed owner, address token, uint256 stake, uint256 unstakeDelay)
        event StakeUnlocked(address indexed relayManager, address indexed owner, uint256 withdrawTime)
        event StakeWithdrawn(address indexed relayManager, address indexed owner, address token, uint256 amount)
        event StakePenalized(address indexed relayManager, address indexed beneficiary, address token, uint256 reward)
        event HubAuthorized(address indexed relayManager, address indexed relayHub)
        event HubUnauthorized(address indexed relayManager, address indexed relayHub, uint256 removalTime)
        event OwnerSet(address indexed relayManager, address indexed owner)
    ]"#
);

/// `StakeManager.setRelayManagerOwner(owner)`.
pub fn encode_set_owner(owner: Address) -> Bytes {
    SetRelayManagerOwnerCall { owner }.encode().into()
}

/// `RelayHub.addRelayWorkers(workers)`.
pub fn encode_add_relay_workers(workers: Vec<Address>) -> Bytes {
    AddRelayWorkersCall {
        new_relay_workers: workers,
    }
    .encode()
    .into()
}

/// `RelayHub.registerRelayServer(url)`.
pub fn encode_register_relay_server(url: &str) -> Bytes {
    RegisterRelayServerCall {
        url: url.to_owned(),
    }
    .encode()
    .into()
}

/// `RelayHub.withdraw(dest, amount)`.
pub fn encode_hub_withdraw(dest: Address, amount: U256) -> Bytes {
    WithdrawCall { dest, amount }.encode().into()
}

fn u256_to_u64(value: U256) -> u64 {
    if value > U256::from(u64::MAX) {
        u64::MAX
    } else {
        value.as_u64()
    }
}

/// Decodes a log of either registrar contract. Logs of other events
/// return `None`.
pub fn decode_log(log: Log) -> Result<Option<LedgerEvent>> {
    let block_number = log.block_number.map(|n| n.as_u64()).unwrap_or_default();
    let log_index = log.log_index.map(u256_to_u64).unwrap_or_default();
    let tx_hash = log.transaction_hash.unwrap_or_default();
    let raw = ethers::abi::RawLog::from(log);

    let decoded = if let Ok(event) = RelayHubContractEvents::decode_log(&raw) {
        Some(match event {
            RelayHubContractEvents::RelayServerRegisteredFilter(e) => (
                e.relay_manager,
                RelayEvent::RelayServerRegistered { url: e.relay_url },
            ),
            RelayHubContractEvents::RelayWorkersAddedFilter(e) => (
                e.relay_manager,
                RelayEvent::RelayWorkersAdded {
                    workers: e.new_relay_workers,
                    workers_count: u256_to_u64(e.workers_count),
                },
            ),
        })
    } else if let Ok(event) = StakeManagerContractEvents::decode_log(&raw) {
        use StakeManagerContractEvents as E;
        Some(match event {
            E::StakeAddedFilter(e) => (
                e.relay_manager,
                RelayEvent::StakeAdded {
                    owner: e.owner,
                    token: e.token,
                    stake: e.stake,
                    unstake_delay: e.unstake_delay,
                },
            ),
            E::StakeUnlockedFilter(e) => (
                e.relay_manager,
                RelayEvent::StakeUnlocked {
                    owner: e.owner,
                    withdraw_time: u256_to_u64(e.withdraw_time),
                },
            ),
            E::StakeWithdrawnFilter(e) => (
                e.relay_manager,
                RelayEvent::StakeWithdrawn {
                    owner: e.owner,
                    token: e.token,
                    amount: e.amount,
                },
            ),
            E::StakePenalizedFilter(e) => (
                e.relay_manager,
                RelayEvent::StakePenalized {
                    beneficiary: e.beneficiary,
                    token: e.token,
                    reward: e.reward,
                },
            ),
            E::HubAuthorizedFilter(e) => (
                e.relay_manager,
                RelayEvent::HubAuthorized {
                    relay_hub: e.relay_hub,
                },
            ),
            E::HubUnauthorizedFilter(e) => (
                e.relay_manager,
                RelayEvent::HubUnauthorized {
                    relay_hub: e.relay_hub,
                    removal_time: u256_to_u64(e.removal_time),
                },
            ),
            E::OwnerSetFilter(e) => {
                (e.relay_manager, RelayEvent::OwnerSet { owner: e.owner })
            }
        })
    } else {
        None
    };

    Ok(decoded.map(|(relay_manager, event)| LedgerEvent {
        relay_manager,
        block_number,
        log_index,
        tx_hash,
        event,
    }))
}

/// A transaction to one of the registrar contracts, decoded from its calldata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrarCall {
    /// `setRelayManagerOwner(owner)`.
    SetOwner(Address),
    /// `addRelayWorkers(workers)`.
    AddRelayWorkers(Vec<Address>),
    /// `registerRelayServer(url)`.
    RegisterRelayServer(String),
    /// `withdraw(dest, amount)`.
    Withdraw(Address, U256),
}

/// Decodes calldata produced by the `encode_*` functions of this module.
pub fn decode_registrar_call(data: &[u8]) -> Option<RegistrarCall> {
    use ethers::abi::AbiDecode;
    if let Ok(call) = RelayHubContractCalls::decode(data) {
        return match call {
            RelayHubContractCalls::AddRelayWorkers(c) => {
                Some(RegistrarCall::AddRelayWorkers(c.new_relay_workers))
            }
            RelayHubContractCalls::RegisterRelayServer(c) => {
                Some(RegistrarCall::RegisterRelayServer(c.url))
            }
            RelayHubContractCalls::Withdraw(c) => {
                Some(RegistrarCall::Withdraw(c.dest, c.amount))
            }
            _ => None,
        };
    }
    match SetRelayManagerOwnerCall::decode(data) {
        Ok(c) => Some(RegistrarCall::SetOwner(c.owner)),
        Err(_) => None,
    }
}
