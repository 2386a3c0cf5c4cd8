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

use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::WEI_IN_ETHER;
use serde_json::json;

use mtx_relayer_config::RelayerConfig;
use mtx_relayer_context::contracts::{decode_registrar_call, RegistrarCall};
use mtx_relayer_context::mocked::MockedContractInteractor;
use mtx_relayer_context::{KeyManager, LocalKeyManager};
use mtx_relayer_context::mocked::MOCK_CHAIN_ID;
use mtx_relayer_store::{HistoryStore, InMemoryStore};
use mtx_relayer_types::BlockInfo;
use mtx_relayer_utils::Error;

use crate::server::{BalanceCheck, RelayServer};

fn owner() -> Address {
    Address::repeat_byte(0x22)
}

fn token() -> Address {
    Address::repeat_byte(0x70)
}

fn hub() -> Address {
    Address::repeat_byte(0x48)
}

fn ether_tenths(tenths: u64) -> U256 {
    WEI_IN_ETHER * tenths / 10
}

fn config(overrides: serde_json::Value) -> Arc<RelayerConfig> {
    let mut value = json!({
        "url": "https://relay.example.org",
        "ledger": { "http-endpoint": "http://localhost:8545" },
        "relay-hub-address": format!("{:?}", hub()),
        "owner-address": format!("{:?}", owner()),
        "manager-stake-token-address": format!("{:?}", token()),
        "worker-count": 2,
    });
    if let (Some(base), Some(overrides)) =
        (value.as_object_mut(), overrides.as_object())
    {
        for (key, v) in overrides {
            base.insert(key.clone(), v.clone());
        }
    }
    Arc::new(serde_json::from_value(value).unwrap())
}

struct Harness {
    ledger: Arc<MockedContractInteractor>,
    workers: Vec<Address>,
    store: InMemoryStore,
    server: RelayServer<InMemoryStore>,
}

impl Harness {
    /// A staked and funded manager whose server is initialized but has not
    /// run any cycle yet.
    async fn new(overrides: serde_json::Value) -> Self {
        let ledger = Arc::new(MockedContractInteractor::default());
        let manager_keys = Arc::new(LocalKeyManager::ephemeral(1));
        let worker_keys = Arc::new(LocalKeyManager::ephemeral(2));
        let manager = manager_keys.addresses()[0];
        let workers = worker_keys.addresses();
        ledger.set_balance(manager, WEI_IN_ETHER * 2);
        ledger.set_minimum_stake(token(), WEI_IN_ETHER);
        ledger.stake_for(
            manager,
            owner(),
            token(),
            WEI_IN_ETHER,
            U256::from(1_000u64),
        );
        ledger.authorize_hub(manager);
        let store = InMemoryStore::default();
        let mut server = RelayServer::new(
            config(overrides),
            ledger.clone(),
            manager_keys,
            worker_keys,
            store.clone(),
        )
        .unwrap();
        server.init().await.unwrap();
        Self {
            ledger,
            workers,
            store,
            server,
        }
    }

    async fn cycle(&mut self, block: BlockInfo) -> Vec<H256> {
        self.server.run_worker_cycle(&block).await.unwrap()
    }

    /// Registers, funds the workers and runs until the server is ready.
    async fn ready(overrides: serde_json::Value) -> Self {
        let mut h = Self::new(overrides).await;
        let head = h.ledger.head();
        assert_eq!(h.cycle(head).await.len(), 3);
        let head = h.ledger.mine_block();
        assert_eq!(h.cycle(head).await.len(), 2);
        for _ in 0..3 {
            assert!(!h.server.is_ready());
            let head = h.ledger.mine_block();
            assert!(h.cycle(head).await.is_empty());
        }
        assert!(h.server.is_ready());
        h
    }
}

#[tokio::test]
#[tracing_test::traced_test]
async fn server_becomes_ready_after_registration_and_funding() {
    let mut h = Harness::new(json!({})).await;
    assert!(!h.server.is_ready());

    let head = h.ledger.head();
    let sent = h.cycle(head).await;
    assert_eq!(sent.len(), 3);
    assert!(!h.server.registration().is_registered());

    let head = h.ledger.mine_block();
    let sent = h.cycle(head).await;
    assert_eq!(sent.len(), 2);
    assert!(h.server.registration().is_registered());
    let funded: Vec<_> = h
        .ledger
        .broadcasts()
        .iter()
        .filter(|tx| h.workers.contains(&tx.to))
        .map(|tx| tx.value)
        .collect();
    assert_eq!(funded, vec![ether_tenths(3), ether_tenths(3)]);
    assert!(!h.server.is_ready());

    for round in 1..=3 {
        let head = h.ledger.mine_block();
        h.cycle(head).await;
        assert_eq!(h.server.is_ready(), round == 3);
    }
    assert!(logs_contain("Relayer state: READY"));
    let stats = h.server.get_readiness_stats();
    assert!(stats.is_ready);
    assert_eq!(stats.total_readiness_changes, 1);
}

#[tokio::test]
async fn ready_server_skips_refresh_until_timeout() {
    let mut h = Harness::ready(json!({})).await;
    let last = h.server.last_processed_block();

    let head = h.ledger.mine_block();
    assert!(!h.server.should_refresh_state(&head));
    assert!(h.cycle(head).await.is_empty());
    assert!(h.server.is_ready());
    assert_eq!(h.server.last_processed_block(), last + 1);

    let head = h.ledger.advance_blocks(5);
    assert!(h.server.should_refresh_state(&head));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn worker_below_half_minimum_makes_server_not_ready() {
    let mut h = Harness::ready(json!({})).await;
    h.ledger.set_balance(h.workers[0], WEI_IN_ETHER / 100);

    // past the repeat distance of the first funding
    let head = h.ledger.advance_blocks(15);
    let sent = h.cycle(head).await;
    assert!(!h.server.is_ready());
    assert!(logs_contain("Relayer state: NOT-READY"));
    assert_eq!(h.server.get_readiness_stats().total_readiness_changes, 2);

    // the worker is topped up in the same cycle
    assert_eq!(sent.len(), 1);
    let refill = h.ledger.broadcasts().last().cloned().unwrap();
    assert_eq!(refill.to, h.workers[0]);
    assert_eq!(refill.value, ether_tenths(3) - WEI_IN_ETHER / 100);
}

#[tokio::test]
async fn low_balance_keeps_readiness_but_refreshes_every_block() {
    let mut h = Harness::ready(json!({})).await;
    h.ledger.set_balance(h.workers[1], WEI_IN_ETHER * 8 / 100);
    assert_eq!(
        h.server.refresh_and_check_balances().await.unwrap(),
        BalanceCheck::Low
    );

    let head = h.ledger.advance_blocks(5);
    h.cycle(head).await;
    assert!(h.server.is_ready());
    let next = h.ledger.mine_block();
    assert!(h.server.should_refresh_state(&next));
}

#[tokio::test]
async fn excess_hub_deposit_is_sent_to_owner() {
    let mut h =
        Harness::ready(json!({ "withdraw-to-owner-on-balance": "1 ether" }))
            .await;
    let manager = h.server.registration().manager_address();
    h.ledger.set_hub_balance(manager, WEI_IN_ETHER * 3);

    let head = h.ledger.advance_blocks(5);
    h.cycle(head).await;
    let withdrawals: Vec<_> = h
        .ledger
        .broadcasts()
        .iter()
        .filter(|tx| tx.to == hub())
        .filter_map(|tx| match decode_registrar_call(&tx.data) {
            Some(RegistrarCall::Withdraw(dest, amount)) => Some((dest, amount)),
            _ => None,
        })
        .collect();
    // the deposit above the manager and worker targets
    assert_eq!(withdrawals, vec![(owner(), ether_tenths(21))]);
}

#[tokio::test]
async fn relay_calls_rotate_over_workers() {
    let h = Harness::new(json!({})).await;
    let err = h
        .server
        .submit_relay_call(Bytes::from_static(b"relay"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Generic(_)));

    let h = Harness::ready(json!({})).await;
    for _ in 0..3 {
        h.server
            .submit_relay_call(Bytes::from_static(b"relay"), None)
            .await
            .unwrap();
    }
    let broadcasts = h.ledger.broadcasts();
    let calls: Vec<_> = broadcasts
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(|tx| (tx.from, tx.to))
        .collect();
    assert_eq!(
        calls,
        vec![
            (h.workers[0], hub()),
            (h.workers[1], hub()),
            (h.workers[0], hub()),
        ]
    );
}

#[tokio::test]
async fn cycles_require_init_and_a_new_block() {
    let ledger = Arc::new(MockedContractInteractor::default());
    let mut server = RelayServer::new(
        config(json!({})),
        ledger.clone(),
        Arc::new(LocalKeyManager::ephemeral(1)),
        Arc::new(LocalKeyManager::ephemeral(2)),
        InMemoryStore::default(),
    )
    .unwrap();
    let head = ledger.head();
    let err = server.run_worker_cycle(&head).await.unwrap_err();
    assert!(matches!(err, Error::NotInitialized));

    let mut h = Harness::ready(json!({})).await;
    let head = h.ledger.head();
    let err = h.server.run_worker_cycle(&head).await.unwrap_err();
    assert!(matches!(
        err,
        Error::StaleBlock { block, last_scanned } if block == head.number && last_scanned == head.number
    ));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn failed_registration_does_not_stop_the_cycle() {
    let mut h = Harness::new(json!({})).await;
    let manager = h.server.registration().manager_address();
    h.ledger.state().fail_broadcasts = 1;

    let head = h.ledger.head();
    let sent = h.cycle(head).await;
    assert!(sent.is_empty());
    assert!(logs_contain("Failed to handle registrar events"));
    let scanned = h
        .store
        .get_last_block_number_or_default((MOCK_CHAIN_ID, manager))
        .unwrap();
    assert_eq!(scanned, head.number);

    // registration is retried on the next block
    let head = h.ledger.mine_block();
    assert_eq!(h.cycle(head).await.len(), 3);
}
