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

//! An in-memory ledger implementing [`ContractInteractor`], used by the
//! tests of every crate above this one.
//!
//! Transactions are decoded from their signed payload, kept in a mempool and
//! mined on [`MockedContractInteractor::mine_block`]. Calls to the registrar
//! contracts are interpreted so that registration flows emit their events.

use std::collections::{BTreeMap, HashMap};

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, H256, U256};
use ethers::utils::{keccak256, rlp};
use mtx_relayer_types::BlockInfo;
use mtx_relayer_utils::{Error, Result};
use parking_lot::{Mutex, MutexGuard};

use crate::contracts::{decode_registrar_call, RegistrarCall};
use crate::interactor::{
    ContractInteractor, LedgerEvent, LedgerTransaction, RelayEvent, StakeInfo,
};

/// Chain id of the mocked ledger.
pub const MOCK_CHAIN_ID: u64 = 1337;

/// A transaction waiting in the mocked mempool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTransaction {
    /// Hash of the signed payload.
    pub hash: H256,
    /// Recovered sender.
    pub from: Address,
    /// Nonce of the transaction.
    pub nonce: u64,
    /// Destination.
    pub to: Address,
    /// Value transferred.
    pub value: U256,
    /// Signed gas price.
    pub gas_price: U256,
    /// Calldata.
    pub data: Bytes,
}

/// State of the mocked ledger, freely editable by tests.
#[derive(Debug)]
pub struct MockLedger {
    /// Height of the chain head.
    pub block_number: u64,
    /// Timestamp of the chain head, in seconds.
    pub timestamp: u64,
    /// Network gas price.
    pub gas_price: U256,
    /// Transactions priced below this stay in the mempool when mining.
    pub min_mining_gas_price: U256,
    /// Native balances.
    pub balances: HashMap<Address, U256>,
    /// Deposits on the hub.
    pub hub_balances: HashMap<Address, U256>,
    /// Mined transaction count per account.
    pub confirmed_nonces: HashMap<Address, u64>,
    /// Pending transactions by (sender, nonce).
    pub mempool: BTreeMap<(Address, u64), MockTransaction>,
    /// Mined transactions and their block.
    pub mined: HashMap<H256, u64>,
    /// Every accepted broadcast, in order.
    pub broadcasts: Vec<MockTransaction>,
    /// Stake per manager.
    pub stakes: HashMap<Address, StakeInfo>,
    /// Minimum stake per token.
    pub minimum_stake: HashMap<Address, U256>,
    /// Minimum unstake delay of the hub.
    pub minimum_unstake_delay: U256,
    /// Manager of each registered worker.
    pub worker_managers: HashMap<Address, Address>,
    /// Emitted events.
    pub events: Vec<LedgerEvent>,
    /// Number of upcoming broadcasts to reject.
    pub fail_broadcasts: usize,
    /// Reject every RPC call.
    pub offline: bool,
    /// Fail gas estimation.
    pub fail_estimate_gas: bool,
}

impl Default for MockLedger {
    fn default() -> Self {
        Self {
            block_number: 1,
            timestamp: 1_000,
            gas_price: U256::from(1_000_000_000u64),
            min_mining_gas_price: U256::zero(),
            balances: HashMap::new(),
            hub_balances: HashMap::new(),
            confirmed_nonces: HashMap::new(),
            mempool: BTreeMap::new(),
            mined: HashMap::new(),
            broadcasts: Vec::new(),
            stakes: HashMap::new(),
            minimum_stake: HashMap::new(),
            minimum_unstake_delay: U256::from(1_000u64),
            worker_managers: HashMap::new(),
            events: Vec::new(),
            fail_broadcasts: 0,
            offline: false,
            fail_estimate_gas: false,
        }
    }
}

impl MockLedger {
    fn confirmed_nonce(&self, address: Address) -> u64 {
        self.confirmed_nonces.get(&address).copied().unwrap_or_default()
    }

    fn pending_nonce(&self, address: Address) -> u64 {
        let mut nonce = self.confirmed_nonce(address);
        while self.mempool.contains_key(&(address, nonce)) {
            nonce += 1;
        }
        nonce
    }

    fn block_hash(number: u64) -> H256 {
        H256::from(keccak256(number.to_be_bytes()))
    }

    fn emit(&mut self, relay_manager: Address, tx_hash: H256, event: RelayEvent) {
        let log_index = self
            .events
            .iter()
            .filter(|e| e.block_number == self.block_number)
            .count() as u64;
        self.events.push(LedgerEvent {
            relay_manager,
            block_number: self.block_number,
            log_index,
            tx_hash,
            event,
        });
    }

    fn apply(&mut self, tx: &MockTransaction, hub: Address, stake_manager: Address) {
        if !tx.value.is_zero() {
            let from = self.balances.entry(tx.from).or_default();
            *from = from.saturating_sub(tx.value);
            *self.balances.entry(tx.to).or_default() += tx.value;
        }
        if tx.to != hub && tx.to != stake_manager {
            return;
        }
        match decode_registrar_call(&tx.data) {
            Some(RegistrarCall::SetOwner(owner)) => {
                self.stakes.entry(tx.from).or_default().owner = owner;
                self.emit(tx.from, tx.hash, RelayEvent::OwnerSet { owner });
            }
            Some(RegistrarCall::AddRelayWorkers(workers)) => {
                for worker in &workers {
                    self.worker_managers.insert(*worker, tx.from);
                }
                let workers_count = self
                    .worker_managers
                    .values()
                    .filter(|m| **m == tx.from)
                    .count() as u64;
                self.emit(
                    tx.from,
                    tx.hash,
                    RelayEvent::RelayWorkersAdded {
                        workers,
                        workers_count,
                    },
                );
            }
            Some(RegistrarCall::RegisterRelayServer(url)) => {
                self.emit(
                    tx.from,
                    tx.hash,
                    RelayEvent::RelayServerRegistered { url },
                );
            }
            Some(RegistrarCall::Withdraw(dest, amount)) => {
                let deposit = self.hub_balances.entry(tx.from).or_default();
                let amount = amount.min(*deposit);
                *deposit -= amount;
                *self.balances.entry(dest).or_default() += amount;
            }
            None => {}
        }
    }
}

/// A [`ContractInteractor`] over a [`MockLedger`].
#[derive(Debug)]
pub struct MockedContractInteractor {
    relay_hub: Address,
    stake_manager: Address,
    state: Mutex<MockLedger>,
}

impl Default for MockedContractInteractor {
    fn default() -> Self {
        Self::new(Address::repeat_byte(0x48), Address::repeat_byte(0x53))
    }
}

impl MockedContractInteractor {
    /// Creates an empty ledger with the given registrar addresses.
    pub fn new(relay_hub: Address, stake_manager: Address) -> Self {
        Self {
            relay_hub,
            stake_manager,
            state: Mutex::new(MockLedger::default()),
        }
    }

    /// Locks the ledger state for inspection or editing.
    pub fn state(&self) -> MutexGuard<'_, MockLedger> {
        self.state.lock()
    }

    /// Sets the native balance of `address`.
    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state.lock().balances.insert(address, balance);
    }

    /// Sets the hub deposit of `address`.
    pub fn set_hub_balance(&self, address: Address, balance: U256) {
        self.state.lock().hub_balances.insert(address, balance);
    }

    /// Sets the network gas price.
    pub fn set_gas_price(&self, gas_price: U256) {
        self.state.lock().gas_price = gas_price;
    }

    /// The current head.
    pub fn head(&self) -> BlockInfo {
        let state = self.state.lock();
        BlockInfo::new(
            state.block_number,
            MockLedger::block_hash(state.block_number),
            state.timestamp,
        )
    }

    /// Stakes `stake` of `token` for `relay_manager`, emitting `StakeAdded`.
    pub fn stake_for(
        &self,
        relay_manager: Address,
        owner: Address,
        token: Address,
        stake: U256,
        unstake_delay: U256,
    ) {
        let mut state = self.state.lock();
        let info = state.stakes.entry(relay_manager).or_default();
        info.stake = stake;
        info.unstake_delay = unstake_delay;
        info.token = token;
        state.emit(
            relay_manager,
            H256::zero(),
            RelayEvent::StakeAdded {
                owner,
                token,
                stake,
                unstake_delay,
            },
        );
    }

    /// Sets the minimum stake the hub requires for `token`.
    pub fn set_minimum_stake(&self, token: Address, minimum: U256) {
        self.state.lock().minimum_stake.insert(token, minimum);
    }

    /// Emits `HubAuthorized` for `relay_manager`.
    pub fn authorize_hub(&self, relay_manager: Address) {
        let hub = self.relay_hub;
        self.state.lock().emit(
            relay_manager,
            H256::zero(),
            RelayEvent::HubAuthorized { relay_hub: hub },
        );
    }

    /// Emits an arbitrary event at the current head.
    pub fn emit_event(&self, relay_manager: Address, event: RelayEvent) {
        self.state.lock().emit(relay_manager, H256::zero(), event);
    }

    /// Mines the mempool into a new block. Per sender, transactions are
    /// mined in nonce order as long as they pay `min_mining_gas_price`.
    /// Returns the new head.
    pub fn mine_block(&self) -> BlockInfo {
        let (hub, stake_manager) = (self.relay_hub, self.stake_manager);
        let mut state = self.state.lock();
        state.block_number += 1;
        state.timestamp += 12;
        let senders: Vec<Address> = {
            let mut senders: Vec<_> =
                state.mempool.keys().map(|(from, _)| *from).collect();
            senders.dedup();
            senders
        };
        for sender in senders {
            loop {
                let nonce = state.confirmed_nonce(sender);
                let Some(tx) = state.mempool.get(&(sender, nonce)).cloned() else {
                    break;
                };
                if tx.gas_price < state.min_mining_gas_price {
                    break;
                }
                state.mempool.remove(&(sender, nonce));
                let block = state.block_number;
                state.mined.insert(tx.hash, block);
                state.confirmed_nonces.insert(sender, nonce + 1);
                state.apply(&tx, hub, stake_manager);
            }
        }
        BlockInfo::new(
            state.block_number,
            MockLedger::block_hash(state.block_number),
            state.timestamp,
        )
    }

    /// Advances the head by `count` empty blocks without mining anything.
    pub fn advance_blocks(&self, count: u64) -> BlockInfo {
        let mut state = self.state.lock();
        state.block_number += count;
        state.timestamp += 12 * count;
        BlockInfo::new(
            state.block_number,
            MockLedger::block_hash(state.block_number),
            state.timestamp,
        )
    }

    /// All transactions broadcast so far.
    pub fn broadcasts(&self) -> Vec<MockTransaction> {
        self.state.lock().broadcasts.clone()
    }

    fn ensure_online(&self) -> Result<()> {
        if self.state.lock().offline {
            return Err(Error::Ledger("mocked ledger is offline".into()));
        }
        Ok(())
    }

    fn decode_raw(raw: &Bytes) -> Result<MockTransaction> {
        let rlp = rlp::Rlp::new(raw.as_ref());
        let (tx, signature) = TypedTransaction::decode_signed(&rlp)
            .map_err(|e| Error::Ledger(format!("invalid transaction: {e}")))?;
        let from = signature
            .recover(tx.sighash())
            .map_err(|e| Error::Ledger(format!("invalid signature: {e}")))?;
        Ok(MockTransaction {
            hash: H256::from(keccak256(raw.as_ref())),
            from,
            nonce: tx.nonce().map(|n| n.as_u64()).unwrap_or_default(),
            to: tx.to_addr().copied().unwrap_or_default(),
            value: tx.value().copied().unwrap_or_default(),
            gas_price: tx.gas_price().unwrap_or_default(),
            data: tx.data().cloned().unwrap_or_default(),
        })
    }
}

#[async_trait::async_trait]
impl ContractInteractor for MockedContractInteractor {
    fn relay_hub_address(&self) -> Address {
        self.relay_hub
    }

    fn stake_manager_address(&self) -> Address {
        self.stake_manager
    }

    async fn chain_id(&self) -> Result<u64> {
        self.ensure_online()?;
        Ok(MOCK_CHAIN_ID)
    }

    async fn get_block_number(&self) -> Result<u64> {
        self.ensure_online()?;
        Ok(self.state.lock().block_number)
    }

    async fn get_block(&self, number: u64) -> Result<BlockInfo> {
        self.ensure_online()?;
        let state = self.state.lock();
        if number > state.block_number {
            return Err(Error::BlockNotFound(number));
        }
        let behind = state.block_number - number;
        Ok(BlockInfo::new(
            number,
            MockLedger::block_hash(number),
            state.timestamp.saturating_sub(12 * behind),
        ))
    }

    async fn get_balance(&self, address: Address) -> Result<U256> {
        self.ensure_online()?;
        Ok(self
            .state
            .lock()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn get_transaction_count(
        &self,
        address: Address,
        block: BlockNumber,
    ) -> Result<u64> {
        self.ensure_online()?;
        let state = self.state.lock();
        Ok(match block {
            BlockNumber::Pending => state.pending_nonce(address),
            _ => state.confirmed_nonce(address),
        })
    }

    async fn get_transaction(
        &self,
        hash: H256,
    ) -> Result<Option<LedgerTransaction>> {
        self.ensure_online()?;
        let state = self.state.lock();
        if let Some(block) = state.mined.get(&hash) {
            return Ok(Some(LedgerTransaction {
                hash,
                block_number: Some(*block),
            }));
        }
        let pending = state.mempool.values().any(|tx| tx.hash == hash);
        Ok(pending.then_some(LedgerTransaction {
            hash,
            block_number: None,
        }))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        self.ensure_online()?;
        let tx = Self::decode_raw(&raw)?;
        let mut state = self.state.lock();
        if state.fail_broadcasts > 0 {
            state.fail_broadcasts -= 1;
            return Err(Error::Ledger("mocked broadcast failure".into()));
        }
        if tx.nonce < state.confirmed_nonce(tx.from) {
            return Err(Error::Ledger("nonce too low".into()));
        }
        if let Some(existing) = state.mempool.get(&(tx.from, tx.nonce)) {
            if existing.hash == tx.hash {
                return Err(Error::Ledger("already known".into()));
            }
            if tx.gas_price <= existing.gas_price {
                return Err(Error::Ledger(
                    "replacement transaction underpriced".into(),
                ));
            }
        }
        state.mempool.insert((tx.from, tx.nonce), tx.clone());
        state.broadcasts.push(tx.clone());
        Ok(tx.hash)
    }

    async fn get_gas_price(&self) -> Result<U256> {
        self.ensure_online()?;
        Ok(self.state.lock().gas_price)
    }

    async fn estimate_gas(
        &self,
        _from: Address,
        _to: Address,
        _value: U256,
        data: &Bytes,
    ) -> Result<U256> {
        self.ensure_online()?;
        if self.state.lock().fail_estimate_gas {
            return Err(Error::Ledger("execution reverted".into()));
        }
        Ok(if data.is_empty() {
            U256::from(21_000u64)
        } else {
            U256::from(21_000u64 + 16 * data.len() as u64 + 50_000)
        })
    }

    async fn get_past_events(
        &self,
        relay_manager: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LedgerEvent>> {
        self.ensure_online()?;
        Ok(self
            .state
            .lock()
            .events
            .iter()
            .filter(|e| {
                e.relay_manager == relay_manager
                    && e.block_number >= from_block
                    && e.block_number <= to_block
            })
            .cloned()
            .collect())
    }

    async fn get_stake_info(&self, relay_manager: Address) -> Result<StakeInfo> {
        self.ensure_online()?;
        Ok(self
            .state
            .lock()
            .stakes
            .get(&relay_manager)
            .copied()
            .unwrap_or_default())
    }

    async fn get_minimum_stake_per_token(
        &self,
        token: Address,
    ) -> Result<U256> {
        self.ensure_online()?;
        Ok(self
            .state
            .lock()
            .minimum_stake
            .get(&token)
            .copied()
            .unwrap_or_default())
    }

    async fn get_minimum_unstake_delay(&self) -> Result<U256> {
        self.ensure_online()?;
        Ok(self.state.lock().minimum_unstake_delay)
    }

    async fn relay_hub_balance_of(&self, address: Address) -> Result<U256> {
        self.ensure_online()?;
        Ok(self
            .state
            .lock()
            .hub_balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn worker_to_manager(&self, worker: Address) -> Result<Address> {
        self.ensure_online()?;
        Ok(self
            .state
            .lock()
            .worker_managers
            .get(&worker)
            .copied()
            .unwrap_or_default())
    }
}
