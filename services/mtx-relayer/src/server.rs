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

//! The worker loop of the relay server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use ethers::types::{Address, Bytes, H256, U256};

use mtx_relayer_config::RelayerConfig;
use mtx_relayer_context::contracts::encode_hub_withdraw;
use mtx_relayer_context::{ContractInteractor, KeyManager};
use mtx_relayer_registration::RegistrationManager;
use mtx_relayer_store::{HistoryStore, HistoryStoreKey, TransactionStore};
use mtx_relayer_tx_manager::{
    SendTransactionDetails, SignedTransaction, TransactionManager,
};
use mtx_relayer_types::{BlockInfo, ServerAction, SubmissionMode};
use mtx_relayer_utils::{probe, Error, Result};

use crate::readiness::{ReadinessInfo, ReadinessStats};

/// How the balances of the relayer identities compare to their minimums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceCheck {
    /// Some identity is below half its minimum.
    TooLow,
    /// Some identity is below its minimum, none below half of it.
    Low,
    /// Every identity holds at least its minimum.
    Sufficient,
}

/// The relay server: drives the transaction manager and the registration
/// state machine once per block and keeps the readiness flag.
pub struct RelayServer<S> {
    config: Arc<RelayerConfig>,
    interactor: Arc<dyn ContractInteractor>,
    tx_manager: Arc<TransactionManager<S>>,
    registration: RegistrationManager<S>,
    store: S,
    submission_mode: SubmissionMode,
    readiness: ReadinessInfo,
    history_key: Option<HistoryStoreKey>,
    last_scanned_block: u64,
    last_seen_block: Option<BlockInfo>,
    last_refresh_block: u64,
    needs_refresh: bool,
    successful_rounds: u64,
    next_worker: AtomicUsize,
    initialized: bool,
}

impl<S> std::fmt::Debug for RelayServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("mode", &self.submission_mode)
            .field("ready", &self.readiness.is_ready())
            .field("last_scanned_block", &self.last_scanned_block)
            .finish()
    }
}

impl<S> RelayServer<S>
where
    S: TransactionStore + HistoryStore,
{
    /// Builds the relay server and its engine and state machine. The
    /// submission mode is taken from the configuration.
    pub fn new(
        config: Arc<RelayerConfig>,
        interactor: Arc<dyn ContractInteractor>,
        manager_keys: Arc<dyn KeyManager>,
        worker_keys: Arc<dyn KeyManager>,
        store: S,
    ) -> Result<Self> {
        let tx_manager = Arc::new(TransactionManager::new(
            config.clone(),
            interactor.clone(),
            manager_keys,
            worker_keys,
            store.clone(),
        )?);
        let registration =
            RegistrationManager::new(config.clone(), tx_manager.clone());
        Ok(Self {
            submission_mode: config.submission_mode,
            config,
            interactor,
            tx_manager,
            registration,
            store,
            readiness: ReadinessInfo::new(Utc::now()),
            history_key: None,
            last_scanned_block: 0,
            last_seen_block: None,
            last_refresh_block: 0,
            needs_refresh: true,
            successful_rounds: 0,
            next_worker: AtomicUsize::new(0),
            initialized: false,
        })
    }

    /// Initializes the engine and the state machine and restores the last
    /// scanned block.
    #[tracing::instrument(skip_all)]
    pub async fn init(&mut self) -> Result<()> {
        self.tx_manager.init().await?;
        self.registration.init().await?;
        if let Err(e) = self.tx_manager.refresh_gas_price().await {
            tracing::warn!("Failed to refresh gas price: {}", e);
        }
        let chain_id = self.tx_manager.raw_tx_options()?.chain_id;
        let key = HistoryStoreKey::from((chain_id, self.registration.manager_address()));
        self.last_scanned_block = self.store.get_last_block_number_or_default(key)?;
        self.history_key = Some(key);
        if self.last_scanned_block > 0 {
            let events = self
                .interactor
                .get_past_events(
                    self.registration.manager_address(),
                    0,
                    self.last_scanned_block,
                )
                .await?;
            let cursor = self.interactor.get_block(self.last_scanned_block).await?;
            self.registration
                .restore_from_events(&events, cursor.timestamp);
        }
        self.initialized = true;
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Lifecycle,
            manager = ?self.registration.manager_address(),
            workers = self.registration.worker_addresses().len(),
            mode = ?self.submission_mode,
            last_scanned_block = self.last_scanned_block,
            initialized = true,
        );
        tracing::info!(
            "Relay server initialized for manager {:?}, resuming after block {}",
            self.registration.manager_address(),
            self.last_scanned_block
        );
        Ok(())
    }

    /// Runs one worker cycle for `block` and updates the readiness flag.
    /// Returns the ids of the transactions sent during the cycle.
    #[tracing::instrument(skip_all, fields(block = block.number))]
    pub async fn run_worker_cycle(&mut self, block: &BlockInfo) -> Result<Vec<H256>> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        let last_processed = self.last_processed_block();
        if block.number <= last_processed {
            return Err(Error::StaleBlock {
                block: block.number,
                last_scanned: last_processed,
            });
        }
        self.last_seen_block = Some(*block);
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::TRACE,
            kind = %probe::Kind::Sync,
            block_number = block.number,
        );

        match self.worker(block).await {
            Ok((tx_ids, ready)) => {
                self.observe_readiness(ready);
                Ok(tx_ids)
            }
            Err(e) => {
                tracing::error!("Worker cycle at block {} failed: {}", block.number, e);
                self.observe_readiness(false);
                Err(e)
            }
        }
    }

    async fn worker(&mut self, block: &BlockInfo) -> Result<(Vec<H256>, bool)> {
        if !self.should_refresh_state(block) {
            return Ok((Vec::new(), true));
        }
        self.last_refresh_block = block.number;
        if let Err(e) = self.withdraw_to_owner_if_needed(block).await {
            tracing::error!("Failed to withdraw excess balance to owner: {}", e);
        }
        self.tx_manager.refresh_gas_price().await?;
        let balances = self.refresh_and_check_balances().await?;
        let tx_ids = self.handle_changes_in_state(block).await?;
        let registered = self.registration.is_registered();
        let ready = match balances {
            BalanceCheck::TooLow => false,
            BalanceCheck::Low => self.is_ready() && registered,
            BalanceCheck::Sufficient => registered,
        };
        Ok((tx_ids, ready))
    }

    /// Whether the full state must be read again at `block`: always while
    /// not ready or low on funds, otherwise every
    /// `refresh-state-timeout-blocks` blocks.
    pub fn should_refresh_state(&self, block: &BlockInfo) -> bool {
        !self.is_ready()
            || self.needs_refresh
            || block.number.saturating_sub(self.last_refresh_block)
                >= self.config.refresh_state_timeout_blocks
    }

    /// Sends the hub deposit above what the relayer needs to the owner,
    /// once it reaches `withdraw-to-owner-on-balance`.
    pub async fn withdraw_to_owner_if_needed(
        &self,
        block: &BlockInfo,
    ) -> Result<Option<H256>> {
        let Some(threshold) = self.config.withdraw_to_owner_on_balance else {
            return Ok(None);
        };
        if !self.is_ready() {
            return Ok(None);
        }
        let manager = self.registration.manager_address();
        let deposit = self.interactor.relay_hub_balance_of(manager).await?;
        let workers = U256::from(self.registration.worker_addresses().len());
        let reserve = self.config.manager_target_balance
            + self.config.worker_target_balance.saturating_mul(workers);
        if deposit < threshold.saturating_add(reserve) {
            return Ok(None);
        }
        let amount = deposit - reserve;
        tracing::info!(
            "Hub deposit {} reached {}, sending {} to owner",
            deposit,
            threshold,
            amount
        );
        self.registration
            .send_manager_hub_balance_to_owner(block, Some(amount))
            .await
    }

    /// Reads the balances of the manager and the workers. Below half of a
    /// minimum the relayer is forced not ready; between half and the
    /// minimum the state is refreshed every block but readiness is kept.
    pub async fn refresh_and_check_balances(&mut self) -> Result<BalanceCheck> {
        let manager_balance = self.registration.refresh_balance().await?;
        let mut balances = vec![(
            self.registration.manager_address(),
            manager_balance,
            self.config.manager_min_balance,
        )];
        for worker in self.registration.worker_addresses() {
            let balance = self.interactor.get_balance(*worker).await?;
            balances.push((*worker, balance, self.config.worker_min_balance));
        }
        let mut check = BalanceCheck::Sufficient;
        for (address, balance, min) in balances {
            if balance < min / 2 {
                tracing::warn!(
                    "Balance {} of {:?} is below half of the minimum {}",
                    balance,
                    address,
                    min
                );
                check = BalanceCheck::TooLow;
            } else if balance < min && check == BalanceCheck::Sufficient {
                tracing::debug!("Balance {} of {:?} is below minimum {}", balance, address, min);
                check = BalanceCheck::Low;
            }
        }
        self.needs_refresh = check != BalanceCheck::Sufficient;
        if check == BalanceCheck::TooLow {
            self.set_ready_state(false);
        }
        Ok(check)
    }

    /// Applies the registrar events since the last scanned block, maintains
    /// the stored transactions and funds the workers. Maintenance failures
    /// are logged and skipped.
    pub async fn handle_changes_in_state(&mut self, block: &BlockInfo) -> Result<Vec<H256>> {
        let manager = self.registration.manager_address();
        let from = self.last_scanned_block + 1;
        let events = self
            .interactor
            .get_past_events(manager, from, block.number)
            .await?;
        let force = self.is_registration_forced_by_inactivity(block)?;
        let mut tx_ids = match self
            .registration
            .handle_past_events(&events, block, force)
            .await
        {
            Ok(sent) => sent,
            Err(e) => {
                tracing::error!("Failed to handle registrar events: {}", e);
                Vec::new()
            }
        };
        if let Some(key) = self.history_key {
            self.store.set_last_block_number(key, block.number)?;
        }
        self.last_scanned_block = block.number;

        if let Err(e) = self.tx_manager.fill_mined_block_details_for_transactions().await {
            tracing::error!("Failed to fill mined block details: {}", e);
        }
        if let Err(e) = self.tx_manager.remove_archived_transactions(block.number) {
            tracing::error!("Failed to remove archived transactions: {}", e);
        }
        match self.tx_manager.boost_stuck_pending_transactions(block).await {
            Ok(boosted) => tx_ids.extend(boosted.values().map(|signed| signed.tx_id)),
            Err(e) => tracing::error!("Failed to boost stuck transactions: {}", e),
        }
        if self.registration.is_registered() {
            match self.replenish_servers(block).await {
                Ok(sent) => tx_ids.extend(sent),
                Err(e) => tracing::error!("Failed to replenish workers: {}", e),
            }
        }
        Ok(tx_ids)
    }

    fn is_registration_forced_by_inactivity(&self, block: &BlockInfo) -> Result<bool> {
        let rate = self.config.activity_block_rate;
        if rate == 0 || !self.registration.is_registered() {
            return Ok(false);
        }
        for action in [self.submission_mode.relay_call_action(), ServerAction::RegisterServer] {
            if self
                .tx_manager
                .is_action_pending_or_recently_mined(action, block.number, rate, None)?
            {
                return Ok(false);
            }
        }
        let registered_recently = self
            .registration
            .last_registration_block()
            .map_or(false, |registered| block.number.saturating_sub(registered) < rate);
        if !registered_recently {
            tracing::info!("No activity within {} blocks, registering again", rate);
        }
        Ok(!registered_recently)
    }

    /// Withdraws the hub deposit to the manager when the manager runs low,
    /// then tops the workers up to their target balance from the manager.
    #[tracing::instrument(skip_all, fields(block = block.number))]
    pub async fn replenish_servers(&mut self, block: &BlockInfo) -> Result<Vec<H256>> {
        let manager = self.registration.manager_address();
        let hub = self.config.relay_hub_address;
        let recent = self.config.recent_action_avoid_repeat_distance_blocks;
        let mut tx_ids = Vec::new();
        let mut manager_balance = self.interactor.get_balance(manager).await?;

        if manager_balance < self.config.manager_target_balance
            && !self.tx_manager.is_action_pending_or_recently_mined(
                ServerAction::DepositWithdrawal,
                block.number,
                recent,
                Some(hub),
            )?
        {
            let deposit = self.interactor.relay_hub_balance_of(manager).await?;
            if deposit >= self.config.min_hub_withdrawal_balance && !deposit.is_zero() {
                let details = SendTransactionDetails::call(
                    manager,
                    ServerAction::DepositWithdrawal,
                    hub,
                    encode_hub_withdraw(manager, deposit),
                    *block,
                );
                let signed = self.tx_manager.send_transaction(details).await?;
                tracing::info!("Withdrawing hub deposit {} to manager in {:?}", deposit, signed.tx_id);
                tx_ids.push(signed.tx_id);
                manager_balance = manager_balance.saturating_add(deposit);
            }
        }

        for worker in self.registration.worker_addresses().to_vec() {
            let balance = self.interactor.get_balance(worker).await?;
            if balance >= self.config.worker_min_balance {
                continue;
            }
            if self.tx_manager.is_action_pending_or_recently_mined(
                ServerAction::ValueTransfer,
                block.number,
                recent,
                Some(worker),
            )? {
                continue;
            }
            let refill = self.config.worker_target_balance.saturating_sub(balance);
            let keeps_minimum = manager_balance
                .checked_sub(refill)
                .map_or(false, |left| left >= self.config.manager_min_balance);
            if !keeps_minimum {
                tracing::error!(
                    "Manager balance {} is too low to fund worker {:?} with {}, funding needed",
                    manager_balance,
                    worker,
                    refill
                );
                continue;
            }
            let details = SendTransactionDetails::transfer(manager, worker, refill, *block);
            let signed = self.tx_manager.send_transaction(details).await?;
            tracing::info!("Funding worker {:?} with {} in {:?}", worker, refill, signed.tx_id);
            tx_ids.push(signed.tx_id);
            manager_balance -= refill;
        }
        Ok(tx_ids)
    }

    fn observe_readiness(&mut self, ready: bool) {
        if !ready {
            self.successful_rounds = 0;
            self.set_ready_state(false);
            return;
        }
        self.successful_rounds += 1;
        if self.is_ready() {
            return;
        }
        let needed = self.config.successful_rounds_for_ready;
        if self.successful_rounds < needed {
            tracing::debug!(
                "Ready after {} of {} successful rounds",
                self.successful_rounds,
                needed
            );
            return;
        }
        self.set_ready_state(true);
    }

    /// Sets the readiness flag, accounting the time spent in the previous
    /// state on a flip.
    pub fn set_ready_state(&mut self, ready: bool) {
        if !self.readiness.set_ready(ready, Utc::now()) {
            return;
        }
        if ready {
            tracing::info!("Relayer state: READY");
        } else {
            tracing::warn!("Relayer state: NOT-READY");
        }
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Readiness,
            ready = ready,
            changes = self.readiness.stats().total_readiness_changes,
        );
    }

    /// Whether the relay server accepts work.
    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    /// A snapshot of the readiness accounting.
    pub fn get_readiness_stats(&self) -> ReadinessStats {
        self.readiness.stats()
    }

    /// Submits a relay call from the next worker, to the hub or the batch
    /// gateway depending on the submission mode.
    pub async fn submit_relay_call(
        &self,
        data: Bytes,
        gas_limit: Option<U256>,
    ) -> Result<SignedTransaction> {
        if !self.is_ready() {
            return Err(Error::Generic("relay server is not ready"));
        }
        let block = self.last_seen_block.ok_or(Error::NotInitialized)?;
        let workers = self.registration.worker_addresses();
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % workers.len().max(1);
        let worker: Address = *workers.get(index).ok_or(Error::Generic("no worker identity"))?;
        let mut details = SendTransactionDetails::call(
            worker,
            self.submission_mode.relay_call_action(),
            self.config.relay_call_destination(),
            data,
            block,
        );
        details.gas_limit = gas_limit;
        self.tx_manager.send_transaction(details).await
    }

    /// The transaction manager.
    pub fn tx_manager(&self) -> &Arc<TransactionManager<S>> {
        &self.tx_manager
    }

    /// The registration state machine.
    pub fn registration(&self) -> &RegistrationManager<S> {
        &self.registration
    }

    /// The ledger the server talks to.
    pub fn interactor(&self) -> &Arc<dyn ContractInteractor> {
        &self.interactor
    }

    /// The last block handed to the worker loop.
    pub fn last_seen_block(&self) -> Option<BlockInfo> {
        self.last_seen_block
    }

    /// Height of the last block processed, by this process or, after a
    /// restart, by the previous one.
    pub fn last_processed_block(&self) -> u64 {
        self.last_seen_block
            .map_or(self.last_scanned_block, |b| b.number)
    }

    /// Whether [`Self::init`] completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// How relay calls are submitted.
    pub fn submission_mode(&self) -> SubmissionMode {
        self.submission_mode
    }
}
