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

//! Background services of the relay server.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::H256;
use tokio::sync::Mutex;

use mtx_relayer_context::{
    ContractInteractor, LocalKeyManager, RelayerContext, Shutdown,
};
use mtx_relayer_store::{HistoryStore, SledStore, TransactionStore};
use mtx_relayer_utils::{probe, retry, Result};

use crate::server::RelayServer;

/// A relay server shared between the block poller and its observers.
pub type SharedRelayServer<S> = Arc<Mutex<RelayServer<S>>>;

/// Reads the chain head and, when it moved past the last processed block,
/// runs one worker cycle on it. Returns `None` when there is no new block.
pub async fn poll_once<S>(server: &SharedRelayServer<S>) -> Result<Option<Vec<H256>>>
where
    S: TransactionStore + HistoryStore,
{
    let mut server = server.lock().await;
    let interactor = server.interactor().clone();
    let head = interactor.get_block_number().await?;
    if head <= server.last_processed_block() {
        tracing::trace!("No new block after #{}", head);
        return Ok(None);
    }
    const MAX_RETRY_COUNT: usize = 5;
    let backoff = retry::ConstantWithMaxRetryCount::new(
        Duration::from_millis(100),
        MAX_RETRY_COUNT,
    );
    let fetch_block = || async {
        interactor
            .get_block(head)
            .await
            .map_err(backoff::Error::transient)
    };
    let block = backoff::future::retry(backoff, fetch_block).await?;
    server.run_worker_cycle(&block).await.map(Some)
}

/// Initializes the relay server, then runs a worker cycle for every new
/// block, polling the ledger every `polling_interval`. Failed cycles are
/// logged and the poller waits for the next block.
#[tracing::instrument(skip_all)]
pub async fn run_block_poller<S>(
    server: SharedRelayServer<S>,
    polling_interval: Duration,
) -> Result<()>
where
    S: TransactionStore + HistoryStore,
{
    let backoff = backoff::backoff::Constant::new(Duration::from_secs(1));
    let init = || async {
        let mut server = server.lock().await;
        if server.is_initialized() {
            return Ok(());
        }
        server.init().await.map_err(|e| {
            tracing::warn!("Failed to initialize relay server: {}, retrying", e);
            backoff::Error::transient(e)
        })
    };
    backoff::future::retry(backoff, init).await?;
    loop {
        match poll_once(&server).await {
            Ok(Some(tx_ids)) if !tx_ids.is_empty() => {
                tracing::debug!("Worker cycle sent {} transactions", tx_ids.len());
            }
            Ok(_) => {}
            Err(e) => tracing::error!("Worker cycle failed: {}", e),
        }
        tracing::trace!("Cooldown a bit for {}ms", polling_interval.as_millis());
        tokio::time::sleep(polling_interval).await;
    }
}

/// Spawns the block poller until `shutdown` fires.
pub fn start_block_poller<S>(
    server: SharedRelayServer<S>,
    polling_interval: Duration,
    mut shutdown: Shutdown,
) -> tokio::task::JoinHandle<()>
where
    S: TransactionStore + HistoryStore + 'static,
{
    tracing::debug!("Block poller started");
    let task = async move {
        tokio::select! {
            result = run_block_poller(server, polling_interval) => {
                if let Err(e) = result {
                    tracing::error!("Block poller stopped: {}", e);
                } else {
                    tracing::warn!("Block poller stopped");
                }
            },
            _ = shutdown.recv() => {
                tracing::trace!("Stopping block poller");
            },
        }
    };
    tokio::task::spawn(task)
}

/// Connects to the ledger, builds the relay server over the relayer store
/// and starts its block poller in the background.
pub async fn ignite(
    ctx: &RelayerContext,
    manager_keys: LocalKeyManager,
    worker_keys: LocalKeyManager,
) -> Result<SharedRelayServer<SledStore>> {
    let interactor: Arc<dyn ContractInteractor> = Arc::new(ctx.ledger().await?);
    let server = RelayServer::new(
        Arc::new(ctx.config.clone()),
        interactor,
        Arc::new(manager_keys),
        Arc::new(worker_keys),
        ctx.store().clone(),
    )?;
    let server = Arc::new(Mutex::new(server));
    let polling_interval = Duration::from_millis(ctx.config.polling_interval);
    start_block_poller(server.clone(), polling_interval, ctx.shutdown_signal());
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::Lifecycle,
        block_poller = true,
        started = true,
    );
    Ok(server)
}
