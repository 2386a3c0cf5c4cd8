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

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, U256};
use ethers::utils::WEI_IN_ETHER;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};

use mtx_relayer::service::{poll_once, start_block_poller};
use mtx_relayer::RelayServer;
use mtx_relayer_config::RelayerConfig;
use mtx_relayer_context::mocked::{MockedContractInteractor, MOCK_CHAIN_ID};
use mtx_relayer_context::{KeyManager, LocalKeyManager, Shutdown};
use mtx_relayer_store::{HistoryStore, InMemoryStore, SledStore};
use mtx_relayer_tx_manager::SendTransactionDetails;
use mtx_relayer_utils::Error;

fn config() -> Arc<RelayerConfig> {
    let config = serde_json::from_value(json!({
        "url": "https://relay.example.org",
        "ledger": { "http-endpoint": "http://localhost:8545" },
        "relay-hub-address": "0x4848484848484848484848484848484848484848",
        "owner-address": "0x2222222222222222222222222222222222222222",
        "manager-stake-token-address": "0x7070707070707070707070707070707070707070",
        "worker-count": 2,
        "polling-interval": 10,
    }))
    .unwrap();
    Arc::new(config)
}

struct Keys {
    manager: Arc<LocalKeyManager>,
    workers: Arc<LocalKeyManager>,
}

impl Keys {
    fn new() -> Self {
        Self {
            manager: Arc::new(LocalKeyManager::ephemeral(1)),
            workers: Arc::new(LocalKeyManager::ephemeral(2)),
        }
    }

    fn manager_address(&self) -> Address {
        self.manager.addresses()[0]
    }
}

/// A ledger where the manager of `keys` is funded and staked.
fn staked_ledger(keys: &Keys) -> Arc<MockedContractInteractor> {
    let ledger = Arc::new(MockedContractInteractor::default());
    let manager = keys.manager_address();
    let token = Address::repeat_byte(0x70);
    ledger.set_balance(manager, WEI_IN_ETHER * 2);
    ledger.set_minimum_stake(token, WEI_IN_ETHER);
    ledger.stake_for(
        manager,
        Address::repeat_byte(0x22),
        token,
        WEI_IN_ETHER,
        U256::from(1_000u64),
    );
    ledger.authorize_hub(manager);
    ledger
}

fn server<S>(
    ledger: &Arc<MockedContractInteractor>,
    keys: &Keys,
    store: S,
) -> RelayServer<S>
where
    S: mtx_relayer_store::TransactionStore + HistoryStore,
{
    RelayServer::new(
        config(),
        ledger.clone(),
        keys.manager.clone(),
        keys.workers.clone(),
        store,
    )
    .unwrap()
}

#[tokio::test]
async fn scan_position_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = SledStore::open(dir.path()).unwrap();
    let keys = Keys::new();
    let ledger = staked_ledger(&keys);

    let mut first = server(&ledger, &keys, store.clone());
    first.init().await.unwrap();
    let head = ledger.head();
    assert_eq!(first.run_worker_cycle(&head).await.unwrap().len(), 3);
    let head = ledger.mine_block();
    assert_eq!(first.run_worker_cycle(&head).await.unwrap().len(), 2);
    drop(first);

    let mut second = server(&ledger, &keys, store.clone());
    second.init().await.unwrap();
    assert_eq!(second.last_processed_block(), head.number);
    assert!(second.registration().is_registered());
    let err = second.run_worker_cycle(&head).await.unwrap_err();
    assert!(matches!(err, Error::StaleBlock { .. }));

    let head = ledger.mine_block();
    second.run_worker_cycle(&head).await.unwrap();
    let manager = keys.manager_address();
    let scanned = store
        .get_last_block_number_or_default((MOCK_CHAIN_ID, manager))
        .unwrap();
    assert_eq!(scanned, head.number);

    // the restored counter continues after the five stored transactions
    let details = SendTransactionDetails::transfer(
        manager,
        Address::repeat_byte(0x22),
        U256::from(1_000u64),
        head,
    );
    second.tx_manager().send_transaction(details).await.unwrap();
    let last = ledger.broadcasts().last().cloned().unwrap();
    assert_eq!((last.from, last.nonce), (manager, 5));
}

#[tokio::test]
async fn polling_runs_one_cycle_per_new_block() {
    let keys = Keys::new();
    let ledger = staked_ledger(&keys);
    let shared = Arc::new(Mutex::new(server(
        &ledger,
        &keys,
        InMemoryStore::default(),
    )));

    let err = poll_once(&shared).await.unwrap_err();
    assert!(matches!(err, Error::NotInitialized));
    shared.lock().await.init().await.unwrap();

    let sent = poll_once(&shared).await.unwrap();
    assert_eq!(sent.map(|ids| ids.len()), Some(3));
    assert!(poll_once(&shared).await.unwrap().is_none());

    ledger.mine_block();
    let sent = poll_once(&shared).await.unwrap();
    assert_eq!(sent.map(|ids| ids.len()), Some(2));
    assert_eq!(
        shared.lock().await.last_processed_block(),
        ledger.head().number
    );
}

#[tokio::test]
async fn block_poller_drives_the_server_until_shutdown() {
    let keys = Keys::new();
    let ledger = staked_ledger(&keys);
    let shared = Arc::new(Mutex::new(server(
        &ledger,
        &keys,
        InMemoryStore::default(),
    )));
    let (notify, _) = broadcast::channel(1);
    let handle = start_block_poller(
        shared.clone(),
        Duration::from_millis(5),
        Shutdown::new(notify.subscribe()),
    );

    let mut ready = false;
    for _ in 0..400 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if shared.lock().await.is_ready() {
            ready = true;
            break;
        }
        ledger.mine_block();
    }
    assert!(ready, "server never became ready");

    notify.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
