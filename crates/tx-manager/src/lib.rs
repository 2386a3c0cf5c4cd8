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

//! # Transaction Manager 🕸️
//!
//! The transaction lifecycle engine of the relayer.
//!
//! ## Overview
//!
//! Every transaction the relayer sends goes through the [`TransactionManager`]:
//! it reserves the next nonce of the signer, signs, persists the record and
//! only then broadcasts. Later cycles stamp the block a record was mined in,
//! prune records buried under enough confirmations, and replace transactions
//! stuck in the mempool with higher priced ones for the same nonce.
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Bytes, TransactionRequest, H256, U256};
use ethers::utils::keccak256;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use mtx_relayer_config::RelayerConfig;
use mtx_relayer_context::{ContractInteractor, KeyManager};
use mtx_relayer_store::{StoredTransaction, TransactionStore, TxKey};
use mtx_relayer_types::{BlockInfo, ServerAction};
use mtx_relayer_utils::{probe, Error, Result};

#[cfg(test)]
mod tests;

/// Chain parameters needed to recreate signed payloads, resolved once at
/// initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTxOptions {
    /// The chain id transactions are signed for.
    pub chain_id: u64,
}

/// What to send.
#[derive(Debug, Clone)]
pub struct SendTransactionDetails {
    /// The identity that signs the transaction.
    pub signer: Address,
    /// What the transaction is for.
    pub action: ServerAction,
    /// Destination of the transaction.
    pub destination: Address,
    /// Native value sent along.
    pub value: U256,
    /// Gas limit, estimated when `None`.
    pub gas_limit: Option<U256>,
    /// Gas price, the current network price when `None`.
    pub gas_price: Option<U256>,
    /// Calldata.
    pub data: Bytes,
    /// The chain head the transaction is created at.
    pub creation_block: BlockInfo,
}

impl SendTransactionDetails {
    /// A plain value transfer from `signer` to `destination`.
    pub fn transfer(
        signer: Address,
        destination: Address,
        value: U256,
        creation_block: BlockInfo,
    ) -> Self {
        Self {
            signer,
            action: ServerAction::ValueTransfer,
            destination,
            value,
            gas_limit: None,
            gas_price: None,
            data: Bytes::default(),
            creation_block,
        }
    }

    /// A contract call from `signer` to `destination` with `data`.
    pub fn call(
        signer: Address,
        action: ServerAction,
        destination: Address,
        data: Bytes,
        creation_block: BlockInfo,
    ) -> Self {
        Self {
            signer,
            action,
            destination,
            value: U256::zero(),
            gas_limit: None,
            gas_price: None,
            data,
            creation_block,
        }
    }
}

/// A transaction as it was broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    /// Hash of the signed payload.
    pub tx_id: H256,
    /// The signed payload.
    pub raw: Bytes,
}

#[derive(Debug, Clone, Copy, Default)]
struct NonceCounter {
    /// The next nonce to reserve.
    next: u64,
    /// Whether `next` was reconciled with the ledger's pending nonce.
    synced: bool,
}

/// The Transaction Lifecycle Engine.
///
/// Owns the stored transactions and the nonce counters of every identity
/// held by its key managers.
pub struct TransactionManager<S> {
    config: Arc<RelayerConfig>,
    interactor: Arc<dyn ContractInteractor>,
    manager_keys: Arc<dyn KeyManager>,
    worker_keys: Arc<dyn KeyManager>,
    manager_address: Address,
    store: S,
    nonces: Mutex<HashMap<Address, NonceCounter>>,
    raw_tx_options: RwLock<Option<RawTxOptions>>,
    gas_price: RwLock<Option<U256>>,
}

impl<S> std::fmt::Debug for TransactionManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("manager", &self.manager_address)
            .field("workers", &self.worker_keys.addresses())
            .field("raw_tx_options", &*self.raw_tx_options.read())
            .finish()
    }
}

impl<S> TransactionManager<S>
where
    S: TransactionStore,
{
    /// Creates a new engine. The manager identity is the first key of
    /// `manager_keys`.
    pub fn new(
        config: Arc<RelayerConfig>,
        interactor: Arc<dyn ContractInteractor>,
        manager_keys: Arc<dyn KeyManager>,
        worker_keys: Arc<dyn KeyManager>,
        store: S,
    ) -> Result<Self> {
        let manager_address = manager_keys
            .address(0)
            .ok_or(Error::Generic("manager key manager holds no identity"))?;
        Ok(Self {
            config,
            interactor,
            manager_keys,
            worker_keys,
            manager_address,
            store,
            nonces: Mutex::new(HashMap::new()),
            raw_tx_options: RwLock::new(None),
            gas_price: RwLock::new(None),
        })
    }

    /// Resolves the chain parameters and restores the nonce counters of the
    /// transactions persisted by a previous run.
    #[tracing::instrument(skip_all)]
    pub async fn init(&self) -> Result<()> {
        let chain_id = self.interactor.chain_id().await?;
        *self.raw_tx_options.write() = Some(RawTxOptions { chain_id });
        let mut nonces = self.nonces.lock().await;
        for tx in self.store.get_all()? {
            let counter = nonces.entry(tx.signer).or_default();
            counter.next = counter.next.max(tx.nonce + 1);
        }
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::TxManager,
            chain_id = %chain_id,
            restored_signers = nonces.len(),
            initialized = true,
        );
        Ok(())
    }

    /// The chain parameters resolved by [`Self::init`].
    pub fn raw_tx_options(&self) -> Result<RawTxOptions> {
        self.raw_tx_options.read().ok_or(Error::NotInitialized)
    }

    /// The persistent transaction store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The configuration the engine runs with.
    pub fn config(&self) -> &RelayerConfig {
        &self.config
    }

    /// The ledger the engine talks to.
    pub fn interactor(&self) -> &Arc<dyn ContractInteractor> {
        &self.interactor
    }

    /// The manager identity.
    pub fn manager_address(&self) -> Address {
        self.manager_address
    }

    /// The worker identities.
    pub fn worker_addresses(&self) -> Vec<Address> {
        self.worker_keys.addresses()
    }

    fn key_manager_of(&self, signer: Address) -> Result<&dyn KeyManager> {
        if self.manager_keys.is_signer(signer) {
            Ok(self.manager_keys.as_ref())
        } else if self.worker_keys.is_signer(signer) {
            Ok(self.worker_keys.as_ref())
        } else {
            Err(Error::UnknownSigner(signer))
        }
    }

    /// Reads the network gas price, applies the configured factor and
    /// caches the result. Fails if it is above the configured maximum.
    #[tracing::instrument(skip_all)]
    pub async fn refresh_gas_price(&self) -> Result<U256> {
        let network = self.interactor.get_gas_price().await?;
        let gas_price = mul_factor(network, self.config.gas_price_factor);
        if gas_price > self.config.max_gas_price {
            return Err(Error::GasPriceTooHigh {
                network: gas_price,
                max: self.config.max_gas_price,
            });
        }
        *self.gas_price.write() = Some(gas_price);
        Ok(gas_price)
    }

    /// The last refreshed gas price, refreshing it if there is none yet.
    pub async fn gas_price(&self) -> Result<U256> {
        let cached = *self.gas_price.read();
        match cached {
            Some(gas_price) => Ok(gas_price),
            None => self.refresh_gas_price().await,
        }
    }

    /// Estimates the gas of a call, falling back to the configured default
    /// gas limit when the ledger cannot estimate it.
    pub async fn attempt_estimate_gas(
        &self,
        signer: Address,
        destination: Address,
        data: &Bytes,
        value: U256,
    ) -> U256 {
        match self
            .interactor
            .estimate_gas(signer, destination, value, data)
            .await
        {
            Ok(gas) => gas,
            Err(e) => {
                tracing::warn!(
                    "Failed to estimate gas of call from {:?} to {:?}: {}, using default gas limit {}",
                    signer,
                    destination,
                    e,
                    self.config.default_gas_limit,
                );
                U256::from(self.config.default_gas_limit)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn sign(
        &self,
        keys: &dyn KeyManager,
        signer: Address,
        nonce: u64,
        destination: Address,
        value: U256,
        gas_limit: U256,
        gas_price: U256,
        data: &Bytes,
    ) -> Result<SignedTransaction> {
        let RawTxOptions { chain_id } = self.raw_tx_options()?;
        let tx: TypedTransaction = TransactionRequest::new()
            .from(signer)
            .to(destination)
            .value(value)
            .nonce(nonce)
            .gas(gas_limit)
            .gas_price(gas_price)
            .data(data.clone())
            .chain_id(chain_id)
            .into();
        let raw = keys.sign_transaction(signer, &tx)?;
        let tx_id = H256::from(keccak256(raw.as_ref()));
        Ok(SignedTransaction { tx_id, raw })
    }

    /// Signs, persists and broadcasts a new transaction.
    ///
    /// The nonce of the signer is reserved under the engine lock, which is
    /// held until the broadcast completes. If signing or broadcasting fails
    /// the nonce is released for the next send and the stored record is
    /// dropped.
    #[tracing::instrument(
        skip_all,
        fields(signer = ?details.signer, action = %details.action)
    )]
    pub async fn send_transaction(
        &self,
        details: SendTransactionDetails,
    ) -> Result<SignedTransaction> {
        let keys = self.key_manager_of(details.signer)?;
        let gas_price = match details.gas_price {
            Some(gas_price) => gas_price,
            None => self.gas_price().await?,
        };
        let gas_limit = match details.gas_limit {
            Some(gas_limit) => gas_limit,
            None => {
                self.attempt_estimate_gas(
                    details.signer,
                    details.destination,
                    &details.data,
                    details.value,
                )
                .await
            }
        };

        let mut nonces = self.nonces.lock().await;
        let nonce = self.reserve_nonce(&mut nonces, details.signer).await?;

        let signed = match self.sign(
            keys,
            details.signer,
            nonce,
            details.destination,
            details.value,
            gas_limit,
            gas_price,
            &details.data,
        ) {
            Ok(signed) => signed,
            Err(e) => {
                rollback_nonce(&mut nonces, details.signer, nonce);
                tracing::error!(
                    "Failed to sign {} transaction with nonce {}: {}",
                    details.action,
                    nonce,
                    e
                );
                return Err(Error::SendTransactionFailed {
                    reason: format!("signing failed: {e}"),
                });
            }
        };

        let record = StoredTransaction {
            signer: details.signer,
            nonce,
            action: details.action,
            to: details.destination,
            value: details.value,
            gas_price,
            gas_limit,
            data: details.data,
            raw_tx: signed.raw.clone(),
            tx_id: signed.tx_id,
            creation_block: details.creation_block,
            boost_block_number: None,
            mined_block_number: None,
            attempts: 0,
        };
        match self.store.put_tx(&record) {
            Ok(()) => {}
            // A duplicate is a bookkeeping bug: the counter stays past the
            // occupied nonce and the existing record is kept.
            Err(e @ Error::DuplicateNonce { .. }) => return Err(e),
            Err(e) => {
                rollback_nonce(&mut nonces, details.signer, nonce);
                tracing::error!(
                    "Failed to store {} transaction with nonce {}: {}",
                    details.action,
                    nonce,
                    e
                );
                return Err(e);
            }
        }

        if let Err(e) = self.interactor.send_raw_transaction(signed.raw.clone()).await {
            rollback_nonce(&mut nonces, details.signer, nonce);
            if let Err(store_err) = self.store.remove_tx(record.key()) {
                tracing::error!(
                    "Failed to drop record of failed send {}: {}",
                    record.key(),
                    store_err
                );
            }
            if e.is_nonce_too_low() {
                tracing::warn!(
                    "Nonce {} of {:?} was already used on the ledger, resyncing",
                    nonce,
                    details.signer
                );
                self.resync_nonce(&mut nonces, details.signer).await;
            }
            tracing::error!(
                "Failed to broadcast {} transaction {:?}: {}",
                details.action,
                signed.tx_id,
                e
            );
            return Err(Error::SendTransactionFailed {
                reason: e.to_string(),
            });
        }

        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::TxManager,
            signer = ?details.signer,
            action = %details.action,
            nonce = nonce,
            tx_hash = ?signed.tx_id,
            gas_price = %gas_price,
            sent = true,
        );
        tracing::info!(
            "Sent {} transaction {:?} from {:?} with nonce {}",
            details.action,
            signed.tx_id,
            details.signer,
            nonce
        );
        Ok(signed)
    }

    async fn reserve_nonce(
        &self,
        nonces: &mut HashMap<Address, NonceCounter>,
        signer: Address,
    ) -> Result<u64> {
        let counter = nonces.entry(signer).or_default();
        if !counter.synced {
            let pending = self
                .interactor
                .get_transaction_count(signer, BlockNumber::Pending)
                .await?;
            counter.next = counter.next.max(pending);
            counter.synced = true;
        }
        let nonce = counter.next;
        counter.next += 1;
        Ok(nonce)
    }

    async fn resync_nonce(
        &self,
        nonces: &mut HashMap<Address, NonceCounter>,
        signer: Address,
    ) {
        let pending = self
            .interactor
            .get_transaction_count(signer, BlockNumber::Pending)
            .await;
        let counter = nonces.entry(signer).or_default();
        match pending {
            Ok(pending) => {
                counter.next = pending;
                counter.synced = true;
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to read pending nonce of {:?}: {}, will retry on next send",
                    signer,
                    e
                );
                counter.synced = false;
            }
        }
    }

    /// Stamps the mined block of every stored transaction the ledger has
    /// mined. When the live attempt of a nonce is unknown to the ledger but
    /// one of its replaced attempts was mined, that attempt becomes the
    /// live record again.
    #[tracing::instrument(skip_all)]
    pub async fn fill_mined_block_details_for_transactions(&self) -> Result<()> {
        for tx in self.store.get_all()? {
            if tx.is_mined() {
                continue;
            }
            match self.interactor.get_transaction(tx.tx_id).await? {
                Some(found) => {
                    if let Some(block) = found.block_number {
                        let mut mined = tx.clone();
                        mined.mined_block_number = Some(block);
                        self.store.update_tx(&mined)?;
                        self.log_mined(&mined, block);
                    }
                }
                None => self.check_superseded_attempts(&tx).await?,
            }
        }
        Ok(())
    }

    async fn check_superseded_attempts(&self, live: &StoredTransaction) -> Result<()> {
        for attempt in self.store.get_superseded(live.key())?.into_iter().rev() {
            let found = self.interactor.get_transaction(attempt.tx_id).await?;
            let Some(block) = found.and_then(|t| t.block_number) else {
                continue;
            };
            let mut mined = attempt;
            mined.mined_block_number = Some(block);
            self.store.replace_tx(&mined)?;
            tracing::info!(
                "Transaction {:?} was superseded by earlier attempt {:?} of nonce {}",
                live.tx_id,
                mined.tx_id,
                mined.nonce
            );
            self.log_mined(&mined, block);
            break;
        }
        Ok(())
    }

    fn log_mined(&self, tx: &StoredTransaction, block: u64) {
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::TxManager,
            signer = ?tx.signer,
            nonce = tx.nonce,
            tx_hash = ?tx.tx_id,
            block_number = block,
            mined = true,
        );
    }

    /// Removes every stored transaction with more confirmations than
    /// configured at `current_block`. Returns the removed records.
    #[tracing::instrument(skip_all, fields(current_block = current_block))]
    pub fn remove_confirmed_transactions(
        &self,
        current_block: u64,
    ) -> Result<Vec<StoredTransaction>> {
        let needed = self.config.confirmations_needed;
        let removed = self.store.remove_where(|tx| {
            tx.confirmations(current_block)
                .map_or(false, |confirmations| confirmations > needed)
        })?;
        if !removed.is_empty() {
            tracing::event!(
                target: probe::TARGET,
                tracing::Level::DEBUG,
                kind = %probe::Kind::TxManager,
                current_block = current_block,
                pruned = removed.len(),
            );
        }
        Ok(removed)
    }

    /// Maintenance entry point: drops confirmed transactions together with
    /// their replaced attempts.
    pub fn remove_archived_transactions(
        &self,
        current_block: u64,
    ) -> Result<usize> {
        let removed = self.remove_confirmed_transactions(current_block)?;
        for tx in &removed {
            tracing::debug!(
                "Archived {} transaction {:?} of {:?} with nonce {}",
                tx.action,
                tx.tx_id,
                tx.signer,
                tx.nonce
            );
        }
        Ok(removed.len())
    }

    /// Replaces every pending transaction broadcast more than the pending
    /// timeout ago (or the boost cooldown ago, once boosted) and priced below
    /// the current market with a higher priced one for the same nonce.
    ///
    /// Returns the new transactions keyed by the id of the ones they replace.
    #[tracing::instrument(skip_all, fields(current_block = current_block.number))]
    pub async fn boost_stuck_pending_transactions(
        &self,
        current_block: &BlockInfo,
    ) -> Result<HashMap<H256, SignedTransaction>> {
        let mut boosted = HashMap::new();
        let market = mul_factor(
            self.interactor.get_gas_price().await?,
            self.config.gas_price_factor,
        );
        let mut confirmed_nonces: HashMap<Address, u64> = HashMap::new();
        for tx in self.store.get_all()? {
            if tx.is_mined() {
                continue;
            }
            let confirmed = match confirmed_nonces.get(&tx.signer) {
                Some(nonce) => *nonce,
                None => {
                    let nonce = self
                        .interactor
                        .get_transaction_count(tx.signer, BlockNumber::Latest)
                        .await?;
                    confirmed_nonces.insert(tx.signer, nonce);
                    nonce
                }
            };
            if tx.nonce < confirmed {
                // mined, waiting for its block to be filled in.
                continue;
            }
            let threshold = if tx.attempts == 0 {
                self.config.pending_transaction_timeout_blocks
            } else {
                self.config.boost_cooldown_blocks()
            };
            let elapsed = current_block
                .number
                .saturating_sub(tx.last_broadcast_block());
            if elapsed < threshold {
                continue;
            }
            if tx.gas_price >= market {
                tracing::debug!(
                    "Transaction {:?} is priced at {} which is not below market {}",
                    tx.tx_id,
                    tx.gas_price,
                    market
                );
                continue;
            }
            let mut new_gas_price =
                mul_factor(tx.gas_price, self.config.retry_gas_price_factor)
                    .max(market);
            if new_gas_price > self.config.max_gas_price {
                tracing::warn!(
                    "Boost of {:?} capped at max gas price {} (wanted {})",
                    tx.tx_id,
                    self.config.max_gas_price,
                    new_gas_price
                );
                new_gas_price = self.config.max_gas_price;
            }
            if new_gas_price <= tx.gas_price {
                continue;
            }
            match self
                .resend_transaction(&tx, current_block, new_gas_price, true)
                .await
            {
                Ok(Some(signed)) => {
                    boosted.insert(tx.tx_id, signed);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(
                    "Failed to boost transaction {:?} of {:?}: {}",
                    tx.tx_id,
                    tx.signer,
                    e
                ),
            }
        }
        Ok(boosted)
    }

    /// Re-broadcasts a stored transaction. With `resign` the transaction is
    /// signed again with `new_gas_price` and the new attempt replaces the
    /// stored one; otherwise the stored payload is broadcast as is.
    ///
    /// A ledger that already moved past the nonce is logged and yields
    /// `Ok(None)`.
    #[tracing::instrument(skip_all, fields(signer = ?tx.signer, nonce = tx.nonce))]
    pub async fn resend_transaction(
        &self,
        tx: &StoredTransaction,
        current_block: &BlockInfo,
        new_gas_price: U256,
        resign: bool,
    ) -> Result<Option<SignedTransaction>> {
        let signed = if resign {
            let keys = self.key_manager_of(tx.signer)?;
            self.sign(
                keys,
                tx.signer,
                tx.nonce,
                tx.to,
                tx.value,
                tx.gas_limit,
                new_gas_price,
                &tx.data,
            )?
        } else {
            SignedTransaction {
                tx_id: tx.tx_id,
                raw: tx.raw_tx.clone(),
            }
        };

        if let Err(e) = self.interactor.send_raw_transaction(signed.raw.clone()).await {
            if e.is_nonce_too_low() {
                let e = Error::NonceTooLow {
                    signer: tx.signer,
                    nonce: tx.nonce,
                };
                tracing::warn!("Not resending {:?}: {}, resyncing", tx.tx_id, e);
                let mut nonces = self.nonces.lock().await;
                self.resync_nonce(&mut nonces, tx.signer).await;
                return Ok(None);
            }
            return Err(e);
        }

        let mut record = tx.clone();
        record.boost_block_number = Some(current_block.number);
        if resign {
            record.gas_price = new_gas_price;
            record.raw_tx = signed.raw.clone();
            record.tx_id = signed.tx_id;
            record.attempts += 1;
            self.store.replace_tx(&record)?;
        } else {
            self.store.update_tx(&record)?;
        }
        tracing::event!(
            target: probe::TARGET,
            tracing::Level::DEBUG,
            kind = %probe::Kind::TxManager,
            signer = ?tx.signer,
            nonce = tx.nonce,
            old_tx_hash = ?tx.tx_id,
            tx_hash = ?signed.tx_id,
            old_gas_price = %tx.gas_price,
            gas_price = %record.gas_price,
            boosted = true,
        );
        tracing::info!(
            "Replaced {:?} with {:?} (nonce {}, gas price {} -> {})",
            tx.tx_id,
            signed.tx_id,
            tx.nonce,
            tx.gas_price,
            record.gas_price
        );
        Ok(Some(signed))
    }

    /// Whether a transaction for `action` (to `destination`, if given) is
    /// still pending or was mined within `distance` blocks of
    /// `current_block`.
    pub fn is_action_pending_or_recently_mined(
        &self,
        action: ServerAction,
        current_block: u64,
        distance: u64,
        destination: Option<Address>,
    ) -> Result<bool> {
        let found = self.store.get_all()?.into_iter().any(|tx| {
            tx.action == action
                && destination.map_or(true, |d| d == tx.to)
                && tx
                    .mined_block_number
                    .map_or(true, |mined| current_block <= mined + distance)
        });
        Ok(found)
    }

    /// The live records of `signer` that are not mined yet.
    pub fn pending_transactions_of(
        &self,
        signer: Address,
    ) -> Result<Vec<StoredTransaction>> {
        Ok(self
            .store
            .get_all_by_signer(signer)?
            .into_iter()
            .filter(|tx| !tx.is_mined())
            .collect())
    }

    /// The live record of (`signer`, `nonce`).
    pub fn get_transaction(
        &self,
        signer: Address,
        nonce: u64,
    ) -> Result<Option<StoredTransaction>> {
        self.store.get_tx(TxKey::new(signer, nonce))
    }
}

fn rollback_nonce(
    nonces: &mut HashMap<Address, NonceCounter>,
    signer: Address,
    nonce: u64,
) {
    if let Some(counter) = nonces.get_mut(&signer) {
        if counter.next == nonce + 1 {
            counter.next = nonce;
        }
    }
}

/// Multiplies `value` by `factor` using integer math in thousandths.
pub fn mul_factor(value: U256, factor: f64) -> U256 {
    let per_mille = (factor * 1000.0).round().max(0.0) as u64;
    value.saturating_mul(U256::from(per_mille)) / U256::from(1000u64)
}
