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
//! # Relayer Context Module 🕸️
//!
//! The collaborators the relayer core talks to: the ledger RPC endpoint with
//! the registrar contract views ([`ContractInteractor`]) and the key
//! custodian ([`KeyManager`]), plus the shared [`RelayerContext`] that owns
//! the configuration, the store and the shutdown signal.

use std::path::Path;

use tokio::sync::broadcast;

use mtx_relayer_config::RelayerConfig;
use mtx_relayer_store::SledStore;

/// Contract bindings and calldata encoding.
pub mod contracts;
/// The ledger over a JSON-RPC HTTP endpoint.
pub mod ethers_interactor;
/// A module for managing retry policy of the ledger transport.
pub mod ethers_retry_policy;
/// The ledger collaborator interface.
pub mod interactor;
/// The key custodian.
pub mod keys;
/// An in-memory ledger.
pub mod mocked;

pub use ethers_interactor::EthersContractInteractor;
pub use interactor::{
    ContractInteractor, LedgerEvent, LedgerTransaction, RelayEvent, StakeInfo,
};
pub use keys::{KeyManager, LocalKeyManager};

/// RelayerContext contains Relayer's configuration and shutdown signal.
#[derive(Clone)]
pub struct RelayerContext {
    /// The configuration of the relayer.
    pub config: RelayerConfig,
    /// Broadcasts a shutdown signal to all active tasks.
    ///
    /// When a task is spawned, it is passed a broadcast receiver handle.
    /// When a graceful shutdown is initiated, a `()` value is sent via
    /// the broadcast::Sender. Each active task receives it, reaches a
    /// safe terminal state, and completes.
    notify_shutdown: broadcast::Sender<()>,
    store: SledStore,
}

impl RelayerContext {
    /// Creates a new RelayerContext.
    pub fn new(config: RelayerConfig, store: SledStore) -> Self {
        let (notify_shutdown, _) = broadcast::channel(2);
        Self {
            config,
            notify_shutdown,
            store,
        }
    }

    /// Returns a broadcast receiver handle for the shutdown signal.
    pub fn shutdown_signal(&self) -> Shutdown {
        Shutdown::new(self.notify_shutdown.subscribe())
    }

    /// Sends a shutdown signal to all subscribed tasks.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }

    /// Returns [Sled](https://sled.rs)-based database store
    pub fn store(&self) -> &SledStore {
        &self.store
    }

    /// Connects to the configured ledger.
    pub async fn ledger(
        &self,
    ) -> mtx_relayer_utils::Result<EthersContractInteractor> {
        EthersContractInteractor::connect(&self.config).await
    }

    /// Loads the manager and worker key managers, keeping generated keys in
    /// a keystore under `data_dir`.
    pub fn key_managers<P: AsRef<Path>>(
        &self,
        data_dir: P,
    ) -> mtx_relayer_utils::Result<(LocalKeyManager, LocalKeyManager)> {
        let keys = &self.config.keys;
        let configured_manager: Vec<_> =
            keys.manager_private_key.iter().cloned().collect();
        let manager = LocalKeyManager::load_or_generate(
            LocalKeyManager::keystore_path(&data_dir, "manager"),
            1,
            &configured_manager,
        )?;
        let workers = LocalKeyManager::load_or_generate(
            LocalKeyManager::keystore_path(&data_dir, "workers"),
            self.config.worker_count,
            &keys.worker_private_keys,
        )?;
        Ok((manager, workers))
    }
}

/// Listens for the shutdown signal.
///
/// Shutdown is signalled using a `broadcast::Receiver`. Only a single value is
/// ever sent. Once a value has been sent via the broadcast channel, the task
/// should shutdown.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received
    shutdown: bool,

    /// The receive half of the channel used to listen for shutdown.
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    /// Create a new `Shutdown` backed by the given `broadcast::Receiver`.
    pub fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Returns `true` if the shutdown signal has been received.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        // If the shutdown signal has already been received, then return
        // immediately.
        if self.shutdown {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;

        // Remember that the signal has been received.
        self.shutdown = true;
    }
}
