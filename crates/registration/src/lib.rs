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

//! # Registration Manager 🕸️
//!
//! Keeps the relay manager eligible to relay: staked, with its hub
//! authorized, its workers added and its URL registered on the RelayHub.
//!
//! ## Overview
//!
//! The [`RegistrationManager`] is fed the registrar events of every new
//! block by the worker loop. It tracks stake and balance requirements,
//! decides when a (re-)registration is due and sends the set-owner,
//! add-workers and register transactions through the transaction manager.
//! When the hub is unauthorized or the stake is withdrawn it sweeps the
//! relayer funds back to the owner instead.
#![warn(missing_docs)]

use std::sync::Arc;

use ethers::types::{Address, Bytes, H256, U256};

use mtx_relayer_config::RelayerConfig;
use mtx_relayer_context::contracts::{
    encode_add_relay_workers, encode_hub_withdraw, encode_register_relay_server,
    encode_set_owner,
};
use mtx_relayer_context::{LedgerEvent, RelayEvent};
use mtx_relayer_store::TransactionStore;
use mtx_relayer_tx_manager::{SendTransactionDetails, TransactionManager};
use mtx_relayer_types::{BlockInfo, ServerAction};
use mtx_relayer_utils::{probe, Error, Result};

/// Tracked (current, required) amounts.
pub mod amount_required;
/// Events whose consequence is deferred.
pub mod delayed;

pub use amount_required::AmountRequired;
pub use delayed::{DelayedEvent, DelayedEvents};

/// Gas of a plain value transfer.
const TRANSFER_GAS: u64 = 21_000;

/// The Registration State Machine.
pub struct RegistrationManager<S> {
    config: Arc<RelayerConfig>,
    tx_manager: Arc<TransactionManager<S>>,
    manager_address: Address,
    workers: Vec<Address>,
    stake_required: AmountRequired,
    unstake_delay_required: AmountRequired,
    balance_required: AmountRequired,
    stake_token_accepted: bool,
    owner_address: Option<Address>,
    is_stake_locked: bool,
    is_hub_authorized: bool,
    is_owner_set: bool,
    workers_added: bool,
    last_registered_url: Option<String>,
    last_registration_block: Option<u64>,
    current_block: BlockInfo,
    delayed_events: DelayedEvents,
    initialized: bool,
}

impl<S> std::fmt::Debug for RegistrationManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationManager")
            .field("manager", &self.manager_address)
            .field("stake", &self.stake_required.to_string())
            .field("hub_authorized", &self.is_hub_authorized)
            .field("owner_set", &self.is_owner_set)
            .field("workers_added", &self.workers_added)
            .field("registered_url", &self.last_registered_url)
            .finish()
    }
}

impl<S> RegistrationManager<S>
where
    S: TransactionStore,
{
    /// Creates the state machine for the manager identity of `tx_manager`.
    pub fn new(
        config: Arc<RelayerConfig>,
        tx_manager: Arc<TransactionManager<S>>,
    ) -> Self {
        let manager_address = tx_manager.manager_address();
        let workers = tx_manager.worker_addresses();
        let balance_required =
            AmountRequired::new("Balance", config.manager_min_balance);
        Self {
            config,
            tx_manager,
            manager_address,
            workers,
            stake_required: AmountRequired::new("Stake", U256::zero()),
            unstake_delay_required: AmountRequired::new(
                "Unstake delay",
                U256::zero(),
            ),
            balance_required,
            stake_token_accepted: false,
            owner_address: None,
            is_stake_locked: false,
            is_hub_authorized: false,
            is_owner_set: false,
            workers_added: false,
            last_registered_url: None,
            last_registration_block: None,
            current_block: BlockInfo::default(),
            delayed_events: DelayedEvents::default(),
            initialized: false,
        }
    }

    /// Reconciles the manager identity with the ledger: its stake, owner
    /// and whether its workers are already added.
    #[tracing::instrument(skip_all, fields(manager = ?self.manager_address))]
    pub async fn init(&mut self) -> Result<()> {
        let interactor = self.tx_manager.interactor().clone();
        let head = interactor.get_block(interactor.get_block_number().await?).await?;
        self.refresh_stake(&head).await?;
        let mut workers_added = !self.workers.is_empty();
        for worker in &self.workers {
            if interactor.worker_to_manager(*worker).await? != self.manager_address {
                workers_added = false;
                break;
            }
        }
        self.workers_added = workers_added;
        if !self.is_owner_set {
            tracing::info!(
                "Owner of relay manager {:?} is not set yet, it will be set once funded",
                self.manager_address
            );
        }
        self.initialized = true;
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Registration,
            manager = ?self.manager_address,
            owner_set = self.is_owner_set,
            workers_added = self.workers_added,
            initialized = true,
        );
        Ok(())
    }

    /// Re-reads the stake of the manager, the hub's staking policy and the
    /// manager's balance.
    #[tracing::instrument(skip_all, fields(block = block.number))]
    pub async fn refresh_stake(&mut self, block: &BlockInfo) -> Result<()> {
        let interactor = self.tx_manager.interactor().clone();
        let stake = interactor.get_stake_info(self.manager_address).await?;
        let configured_token = self.config.manager_stake_token_address;
        let minimum_stake = interactor
            .get_minimum_stake_per_token(configured_token)
            .await?;
        let minimum_delay = interactor.get_minimum_unstake_delay().await?;

        self.stake_token_accepted = !minimum_stake.is_zero();
        self.stake_required.set_required(minimum_stake);
        if stake.token == configured_token {
            self.stake_required.set_current(stake.stake);
        } else {
            if !stake.stake.is_zero() {
                tracing::warn!(
                    "Relay manager is staked with token {:?} but {:?} is configured",
                    stake.token,
                    configured_token
                );
            }
            self.stake_required.set_current(U256::zero());
        }
        self.unstake_delay_required.set_required(minimum_delay);
        self.unstake_delay_required.set_current(stake.unstake_delay);
        self.is_stake_locked = !stake.stake.is_zero() && stake.withdraw_time.is_zero();
        self.owner_address = (!stake.owner.is_zero()).then_some(stake.owner);
        self.is_owner_set = self.owner_address == Some(self.config.owner_address);
        if let Some(owner) = self.owner_address.filter(|_| !self.is_owner_set) {
            tracing::warn!(
                "Relay manager owner is {:?} but {:?} is configured",
                owner,
                self.config.owner_address
            );
        }
        self.refresh_balance().await?;
        self.current_block = *block;
        Ok(())
    }

    /// Re-reads the native balance of the manager.
    pub async fn refresh_balance(&mut self) -> Result<U256> {
        let balance = self
            .tx_manager
            .interactor()
            .get_balance(self.manager_address)
            .await?;
        self.balance_required.set_current(balance);
        Ok(balance)
    }

    /// The reconciliation step: applies the registrar events of the
    /// manager, then either sweeps the relayer funds to the owner (hub
    /// unauthorized, stake unlocked or withdrawn) or registers when a
    /// registration is due.
    ///
    /// Returns the ids of the transactions sent.
    #[tracing::instrument(skip_all, fields(block = block.number, events = events.len()))]
    pub async fn handle_past_events(
        &mut self,
        events: &[LedgerEvent],
        block: &BlockInfo,
        force_registration: bool,
    ) -> Result<Vec<H256>> {
        if !self.initialized {
            return Err(Error::NotInitialized);
        }
        self.current_block = *block;
        let mut refresh_stake = false;
        let mut sweep_manager = false;
        let manager = self.manager_address;
        for event in events.iter().filter(|e| e.relay_manager == manager) {
            tracing::debug!(
                event = event.event.name(),
                block = event.block_number,
                "Handling registrar event"
            );
            let (refresh, sweep) = self.apply_event(event);
            refresh_stake |= refresh;
            sweep_manager |= sweep;
        }
        if refresh_stake {
            self.refresh_stake(block).await?;
        }

        let due: Vec<_> = self
            .extract_due_pending_events(block.timestamp)
            .into_iter()
            .filter(|event| {
                let effective = self.is_still_effective(event);
                if !effective {
                    tracing::debug!(
                        "{} came due but was revoked since, ignoring it",
                        event.event.name()
                    );
                }
                effective
            })
            .collect();
        let sweep_workers = sweep_manager || !due.is_empty();
        if sweep_workers {
            for event in &due {
                tracing::warn!(
                    "{} is due, sending relayer funds to owner",
                    event.event.name()
                );
            }
            return self.withdraw_all_funds(sweep_manager, block).await;
        }

        let reason = if force_registration {
            Some("forced")
        } else {
            self.registration_due_reason()
        };
        let Some(reason) = reason else {
            return Ok(Vec::new());
        };
        if !force_registration
            && self.tx_manager.is_action_pending_or_recently_mined(
                ServerAction::RegisterServer,
                block.number,
                self.config.recent_action_avoid_repeat_distance_blocks,
                None,
            )?
        {
            tracing::debug!("Registration is due ({reason}) but one was sent recently");
            return Ok(Vec::new());
        }
        tracing::info!("Registration is due: {reason}");
        self.attempt_registration(block).await
    }

    /// Rebuilds the registration state from events that were already
    /// handled by a previous run, without sending anything. Delayed events
    /// due at or before `handled_until` (the timestamp of the last scanned
    /// block) were already acted upon and are not queued again.
    pub fn restore_from_events(
        &mut self,
        events: &[LedgerEvent],
        handled_until: u64,
    ) -> usize {
        let manager = self.manager_address;
        let mut applied = 0;
        for event in events.iter().filter(|e| e.relay_manager == manager) {
            self.apply_event(event);
            applied += 1;
        }
        let dropped = self.delayed_events.extract_due(handled_until).len();
        tracing::debug!(
            "Restored registration state from {} events, {} delayed events already handled",
            applied,
            dropped
        );
        applied
    }

    /// Whether a due delayed event still applies: a hub revocation is void
    /// once the hub is authorized again, an unlock once the stake is locked.
    fn is_still_effective(&self, event: &LedgerEvent) -> bool {
        match &event.event {
            RelayEvent::HubUnauthorized { .. } => !self.is_hub_authorized,
            RelayEvent::StakeUnlocked { .. } => !self.is_stake_locked,
            _ => true,
        }
    }

    /// Applies one event of the manager to the state. Returns whether the
    /// stake must be refreshed and whether the manager must be swept.
    fn apply_event(&mut self, event: &LedgerEvent) -> (bool, bool) {
        let hub = self.config.relay_hub_address;
        match &event.event {
            RelayEvent::HubAuthorized { relay_hub } if *relay_hub == hub => {
                self.is_hub_authorized = true;
                let cancelled = self.delayed_events.cancel(|queued| {
                    matches!(
                        queued.event,
                        RelayEvent::HubUnauthorized { relay_hub, .. } if relay_hub == hub
                    )
                });
                if cancelled > 0 {
                    tracing::info!("Hub {:?} authorized again, revocation cancelled", hub);
                }
            }
            RelayEvent::HubUnauthorized {
                relay_hub,
                removal_time,
            } if *relay_hub == hub => {
                self.is_hub_authorized = false;
                self.delayed_events.push(*removal_time, event.clone());
            }
            RelayEvent::StakeAdded { .. } => return (true, false),
            RelayEvent::StakeUnlocked { withdraw_time, .. } => {
                self.delayed_events.push(*withdraw_time, event.clone());
                return (true, false);
            }
            RelayEvent::StakeWithdrawn { .. } | RelayEvent::StakePenalized { .. } => {
                return (true, true);
            }
            RelayEvent::OwnerSet { owner } => {
                self.owner_address = Some(*owner);
                self.is_owner_set = *owner == self.config.owner_address;
            }
            RelayEvent::RelayServerRegistered { url } => {
                self.last_registered_url = Some(url.clone());
                self.last_registration_block = Some(event.block_number);
            }
            RelayEvent::RelayWorkersAdded { workers, .. } => {
                if self.workers.iter().all(|w| workers.contains(w)) {
                    self.workers_added = true;
                }
            }
            _ => {}
        }
        (false, false)
    }

    fn registration_due_reason(&self) -> Option<&'static str> {
        match (&self.last_registered_url, self.last_registration_block) {
            (None, _) | (_, None) => Some("never registered"),
            (Some(url), _) if *url != self.config.url => Some("url changed"),
            (_, Some(registered_at))
                if self.config.registration_block_rate > 0
                    && self.current_block.number.saturating_sub(registered_at)
                        >= self.config.registration_block_rate =>
            {
                Some("registration interval elapsed")
            }
            _ => None,
        }
    }

    fn is_stake_valid(&self) -> bool {
        self.stake_token_accepted
            && self.stake_required.is_satisfied()
            && self.unstake_delay_required.is_satisfied()
            && self.is_stake_locked
    }

    fn has_manager_transaction(&self, action: ServerAction) -> Result<bool> {
        Ok(self
            .tx_manager
            .store()
            .get_all_by_signer(self.manager_address)?
            .iter()
            .any(|tx| tx.action == action))
    }

    /// Sends, as needed and in this order, the set-owner, add-workers and
    /// register transactions. Returns nothing, with an error log, while the
    /// manager is not staked or not funded.
    #[tracing::instrument(skip_all, fields(block = block.number))]
    pub async fn attempt_registration(
        &mut self,
        block: &BlockInfo,
    ) -> Result<Vec<H256>> {
        let hub = self.config.relay_hub_address;
        if !self.is_stake_valid() {
            tracing::error!(
                "RelayManagerNotStaked: relay manager {:?} is not staked on RelayHub {:?}",
                self.manager_address,
                hub
            );
            tracing::error!(
                "MisconfiguredStakeOrDelay: {}, {}, token {:?} accepted: {}, stake locked: {}",
                self.stake_required,
                self.unstake_delay_required,
                self.config.manager_stake_token_address,
                self.stake_token_accepted,
                self.is_stake_locked
            );
            return Ok(Vec::new());
        }
        if !self.is_hub_authorized {
            tracing::error!(
                "RelayManagerNotStaked: RelayHub {:?} is not authorized by relay manager {:?}",
                hub,
                self.manager_address
            );
            return Ok(Vec::new());
        }
        self.refresh_balance().await?;
        if !self.balance_required.is_satisfied() {
            tracing::error!(
                "ManagerBalanceTooLow: relay manager {:?} has {}",
                self.manager_address,
                self.balance_required
            );
            return Ok(Vec::new());
        }

        let mut tx_ids = Vec::new();
        if !self.is_owner_set && !self.has_manager_transaction(ServerAction::SetOwner)? {
            let destination = self.tx_manager.interactor().stake_manager_address();
            let data = encode_set_owner(self.config.owner_address);
            tx_ids.push(
                self.send_manager_call(ServerAction::SetOwner, destination, data, block)
                    .await?,
            );
        }
        if !self.workers_added && !self.has_manager_transaction(ServerAction::AddWorker)? {
            let data = encode_add_relay_workers(self.workers.clone());
            tx_ids.push(
                self.send_manager_call(ServerAction::AddWorker, hub, data, block)
                    .await?,
            );
        }
        let data = encode_register_relay_server(&self.config.url);
        tx_ids.push(
            self.send_manager_call(ServerAction::RegisterServer, hub, data, block)
                .await?,
        );
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::Registration,
            manager = ?self.manager_address,
            url = %self.config.url,
            transactions = tx_ids.len(),
            registering = true,
        );
        Ok(tx_ids)
    }

    async fn send_manager_call(
        &self,
        action: ServerAction,
        destination: Address,
        data: Bytes,
        block: &BlockInfo,
    ) -> Result<H256> {
        let details = SendTransactionDetails::call(
            self.manager_address,
            action,
            destination,
            data,
            *block,
        );
        let signed = self.tx_manager.send_transaction(details).await?;
        Ok(signed.tx_id)
    }

    /// Whether the manager is staked, its hub authorized and its URL
    /// registered.
    pub fn is_registered(&self) -> bool {
        self.is_stake_valid()
            && self.is_hub_authorized
            && self.registration_due_reason().is_none()
    }

    /// Removes and returns the delayed events due at `current_time`.
    pub fn extract_due_pending_events(&mut self, current_time: u64) -> Vec<LedgerEvent> {
        self.delayed_events.extract_due(current_time)
    }

    /// Sends the whole relayer balance to the owner: the manager's hub
    /// deposit, the workers' native balances and, with `include_manager`,
    /// the manager's native balance.
    #[tracing::instrument(skip_all, fields(include_manager = include_manager))]
    pub async fn withdraw_all_funds(
        &mut self,
        include_manager: bool,
        block: &BlockInfo,
    ) -> Result<Vec<H256>> {
        let mut tx_ids = Vec::new();
        tx_ids.extend(self.send_manager_hub_balance_to_owner(block, None).await?);
        for worker in self.workers.clone() {
            tx_ids.extend(self.send_balance_to_owner(worker, block).await?);
        }
        if include_manager {
            tx_ids.extend(
                self.send_balance_to_owner(self.manager_address, block)
                    .await?,
            );
        }
        Ok(tx_ids)
    }

    /// Withdraws `amount` (the whole deposit when `None`) of the manager's
    /// hub deposit to the owner, if worth the transaction cost.
    pub async fn send_manager_hub_balance_to_owner(
        &self,
        block: &BlockInfo,
        amount: Option<U256>,
    ) -> Result<Option<H256>> {
        let hub = self.config.relay_hub_address;
        let owner = self.config.owner_address;
        let deposit = self
            .tx_manager
            .interactor()
            .relay_hub_balance_of(self.manager_address)
            .await?;
        let amount = amount.unwrap_or(deposit).min(deposit);
        let data = encode_hub_withdraw(owner, amount);
        let gas_price = self.tx_manager.gas_price().await?;
        let gas_limit = self
            .tx_manager
            .attempt_estimate_gas(self.manager_address, hub, &data, U256::zero())
            .await;
        let cost = gas_price.saturating_mul(gas_limit);
        if amount <= cost {
            tracing::debug!(
                "Hub deposit {} of {:?} does not cover withdrawal cost {}",
                amount,
                self.manager_address,
                cost
            );
            return Ok(None);
        }
        let mut details = SendTransactionDetails::call(
            self.manager_address,
            ServerAction::DepositWithdrawal,
            hub,
            data,
            *block,
        );
        details.gas_limit = Some(gas_limit);
        details.gas_price = Some(gas_price);
        let signed = self.tx_manager.send_transaction(details).await?;
        tracing::info!(
            "Sent hub deposit {} of {:?} to owner {:?} in {:?}",
            amount,
            self.manager_address,
            owner,
            signed.tx_id
        );
        Ok(Some(signed.tx_id))
    }

    async fn send_balance_to_owner(
        &self,
        signer: Address,
        block: &BlockInfo,
    ) -> Result<Option<H256>> {
        let owner = self.config.owner_address;
        let balance = self.tx_manager.interactor().get_balance(signer).await?;
        let gas_price = self.tx_manager.gas_price().await?;
        let cost = gas_price.saturating_mul(U256::from(TRANSFER_GAS));
        if balance <= cost {
            tracing::debug!(
                "Balance {} of {:?} does not cover transfer cost {}",
                balance,
                signer,
                cost
            );
            return Ok(None);
        }
        let mut details =
            SendTransactionDetails::transfer(signer, owner, balance - cost, *block);
        details.gas_limit = Some(U256::from(TRANSFER_GAS));
        details.gas_price = Some(gas_price);
        let signed = self.tx_manager.send_transaction(details).await?;
        tracing::info!(
            "Sent balance {} of {:?} to owner {:?} in {:?}",
            balance - cost,
            signer,
            owner,
            signed.tx_id
        );
        Ok(Some(signed.tx_id))
    }

    /// The manager identity.
    pub fn manager_address(&self) -> Address {
        self.manager_address
    }

    /// The worker identities.
    pub fn worker_addresses(&self) -> &[Address] {
        &self.workers
    }

    /// The owner recorded on chain, if any.
    pub fn owner_address(&self) -> Option<Address> {
        self.owner_address
    }

    /// Whether the RelayHub may penalize the manager's stake.
    pub fn is_hub_authorized(&self) -> bool {
        self.is_hub_authorized
    }

    /// Whether the stake is locked, not unlocked for withdrawal.
    pub fn is_stake_locked(&self) -> bool {
        self.is_stake_locked
    }

    /// Whether the workers are added on the hub.
    pub fn workers_added(&self) -> bool {
        self.workers_added
    }

    /// The stake requirement.
    pub fn stake_required(&self) -> &AmountRequired {
        &self.stake_required
    }

    /// The manager balance requirement.
    pub fn balance_required(&self) -> &AmountRequired {
        &self.balance_required
    }

    /// Block of the last `RelayServerRegistered` of the manager.
    pub fn last_registration_block(&self) -> Option<u64> {
        self.last_registration_block
    }

    /// Number of delayed events still queued.
    pub fn pending_delayed_events(&self) -> usize {
        self.delayed_events.len()
    }
}

#[cfg(test)]
mod tests;
