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

use ethers::utils::WEI_IN_ETHER;
use mtx_relayer_context::contracts::{decode_registrar_call, RegistrarCall};
use mtx_relayer_context::mocked::MockedContractInteractor;
use mtx_relayer_context::{ContractInteractor, KeyManager, LocalKeyManager};
use mtx_relayer_store::InMemoryStore;

use super::*;

const URL: &str = "https://relay.example.org";

fn owner() -> Address {
    Address::repeat_byte(0x22)
}

fn token() -> Address {
    Address::repeat_byte(0x70)
}

fn config() -> Arc<RelayerConfig> {
    let config = serde_json::from_value(serde_json::json!({
        "url": URL,
        "ledger": { "http-endpoint": "http://localhost:8545" },
        "relay-hub-address": "0x4848484848484848484848484848484848484848",
        "owner-address": format!("{:?}", owner()),
        "manager-stake-token-address": format!("{:?}", token()),
        "worker-count": 2,
    }))
    .unwrap();
    Arc::new(config)
}

struct Harness {
    ledger: Arc<MockedContractInteractor>,
    manager: Address,
    workers: Vec<Address>,
    engine: Arc<TransactionManager<InMemoryStore>>,
    registration: RegistrationManager<InMemoryStore>,
}

impl Harness {
    async fn new() -> Self {
        let config = config();
        let ledger = Arc::new(MockedContractInteractor::default());
        let manager_keys = Arc::new(LocalKeyManager::ephemeral(1));
        let worker_keys = Arc::new(LocalKeyManager::ephemeral(2));
        let manager = manager_keys.addresses()[0];
        let workers = worker_keys.addresses();
        let engine = Arc::new(
            TransactionManager::new(
                config.clone(),
                ledger.clone(),
                manager_keys,
                worker_keys,
                InMemoryStore::default(),
            )
            .unwrap(),
        );
        engine.init().await.unwrap();
        ledger.set_balance(manager, WEI_IN_ETHER);
        ledger.set_minimum_stake(token(), WEI_IN_ETHER);
        let registration = RegistrationManager::new(config, engine.clone());
        Self {
            ledger,
            manager,
            workers,
            engine,
            registration,
        }
    }

    fn stake(&self) {
        self.ledger.stake_for(
            self.manager,
            owner(),
            token(),
            WEI_IN_ETHER,
            U256::from(1_000u64),
        );
        self.ledger.authorize_hub(self.manager);
    }

    async fn events_at(&self, block: &BlockInfo) -> Vec<LedgerEvent> {
        self.ledger
            .get_past_events(self.manager, block.number, block.number)
            .await
            .unwrap()
    }

    /// Stakes, registers and mines the registration.
    async fn registered() -> Self {
        let mut h = Self::new().await;
        h.stake();
        h.registration.init().await.unwrap();
        let head = h.ledger.head();
        let events = h.events_at(&head).await;
        let sent = h
            .registration
            .handle_past_events(&events, &head, false)
            .await
            .unwrap();
        assert_eq!(sent.len(), 3);
        let head = h.ledger.mine_block();
        let events = h.events_at(&head).await;
        let sent = h
            .registration
            .handle_past_events(&events, &head, false)
            .await
            .unwrap();
        assert!(sent.is_empty());
        assert!(h.registration.is_registered());
        h
    }
}

#[tokio::test]
#[tracing_test::traced_test]
async fn registration_is_gated_on_stake() {
    let mut h = Harness::new().await;
    h.ledger.authorize_hub(h.manager);
    h.registration.init().await.unwrap();

    let head = h.ledger.head();
    let events = h.events_at(&head).await;
    let sent = h
        .registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    assert!(sent.is_empty());
    assert!(h.registration.is_hub_authorized());
    assert!(logs_contain("RelayManagerNotStaked"));
    assert!(logs_contain("MisconfiguredStakeOrDelay"));
    assert!(h.ledger.broadcasts().is_empty());

    h.stake();
    let head = h.ledger.mine_block();
    h.registration.refresh_stake(&head).await.unwrap();
    let sent = h.registration.attempt_registration(&head).await.unwrap();
    assert_eq!(sent.len(), 3);

    let calls: Vec<_> = h
        .ledger
        .broadcasts()
        .iter()
        .map(|tx| decode_registrar_call(&tx.data).unwrap())
        .collect();
    assert_eq!(
        calls,
        vec![
            RegistrarCall::SetOwner(owner()),
            RegistrarCall::AddRelayWorkers(h.workers.clone()),
            RegistrarCall::RegisterRelayServer(URL.to_string()),
        ]
    );
    let actions: Vec<_> = h
        .engine
        .store()
        .get_all_by_signer(h.manager)
        .unwrap()
        .iter()
        .map(|tx| tx.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            ServerAction::SetOwner,
            ServerAction::AddWorker,
            ServerAction::RegisterServer
        ]
    );

    let head = h.ledger.mine_block();
    let events = h.events_at(&head).await;
    let sent = h
        .registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    assert!(sent.is_empty());
    assert!(h.registration.is_registered());
    assert!(h.registration.workers_added());
    assert_eq!(h.registration.owner_address(), Some(owner()));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn unfunded_manager_does_not_register() {
    let mut h = Harness::new().await;
    h.stake();
    h.ledger.set_balance(h.manager, U256::zero());
    h.registration.init().await.unwrap();

    let head = h.ledger.head();
    let events = h.events_at(&head).await;
    let sent = h
        .registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    assert!(sent.is_empty());
    assert!(logs_contain("ManagerBalanceTooLow"));
}

#[tokio::test]
async fn pending_registration_is_not_repeated_unless_forced() {
    let mut h = Harness::new().await;
    h.stake();
    h.registration.init().await.unwrap();
    let head = h.ledger.head();
    let events = h.events_at(&head).await;
    let sent = h
        .registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    assert_eq!(sent.len(), 3);

    let head = h.ledger.advance_blocks(1);
    let sent = h
        .registration
        .handle_past_events(&[], &head, false)
        .await
        .unwrap();
    assert!(sent.is_empty());

    // set-owner and add-workers are still pending, only register again.
    let sent = h
        .registration
        .handle_past_events(&[], &head, true)
        .await
        .unwrap();
    assert_eq!(sent.len(), 1);
    let tx = h.engine.get_transaction(h.manager, 3).unwrap().unwrap();
    assert_eq!(tx.action, ServerAction::RegisterServer);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn changed_url_triggers_registration() {
    let mut h = Harness::registered().await;
    h.ledger.emit_event(
        h.manager,
        RelayEvent::RelayServerRegistered {
            url: "https://old.example.org".into(),
        },
    );
    let head = h.ledger.advance_blocks(11);
    let events = h
        .ledger
        .get_past_events(h.manager, 0, head.number)
        .await
        .unwrap();
    let sent = h
        .registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    assert_eq!(sent.len(), 1);
    assert!(logs_contain("url changed"));
}

#[tokio::test]
async fn unauthorized_hub_sweeps_funds_once_due() {
    let mut h = Harness::registered().await;
    let hub = h.engine.config().relay_hub_address;
    h.ledger.set_hub_balance(h.manager, WEI_IN_ETHER);
    for worker in &h.workers {
        h.ledger.set_balance(*worker, WEI_IN_ETHER / 2);
    }
    let removal_time = h.ledger.head().timestamp + 100;
    h.ledger.emit_event(
        h.manager,
        RelayEvent::HubUnauthorized {
            relay_hub: hub,
            removal_time,
        },
    );
    let head = h.ledger.head();
    let events = h.events_at(&head).await;
    let sent = h
        .registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    assert!(sent.is_empty());
    assert!(!h.registration.is_hub_authorized());
    assert!(!h.registration.is_registered());
    assert_eq!(h.registration.pending_delayed_events(), 1);

    let head = h.ledger.advance_blocks(10);
    let sent = h
        .registration
        .handle_past_events(&[], &head, false)
        .await
        .unwrap();
    assert_eq!(sent.len(), 3);
    assert_eq!(h.registration.pending_delayed_events(), 0);
    let broadcasts = h.ledger.broadcasts();
    let withdrawn = broadcasts.iter().any(|tx| {
        tx.from == h.manager
            && decode_registrar_call(&tx.data)
                == Some(RegistrarCall::Withdraw(owner(), WEI_IN_ETHER))
    });
    assert!(withdrawn);
    let to_owner = broadcasts
        .iter()
        .filter(|tx| h.workers.contains(&tx.from) && tx.to == owner())
        .count();
    assert_eq!(to_owner, 2);
}

#[tokio::test]
async fn withdrawn_stake_sweeps_manager_balance() {
    let mut h = Harness::registered().await;
    h.ledger.emit_event(
        h.manager,
        RelayEvent::StakeWithdrawn {
            owner: owner(),
            token: token(),
            amount: WEI_IN_ETHER,
        },
    );
    let head = h.ledger.head();
    let events = h.events_at(&head).await;
    let sent = h
        .registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    assert_eq!(sent.len(), 1);
    let last = h.ledger.broadcasts().pop().unwrap();
    assert_eq!(last.from, h.manager);
    assert_eq!(last.to, owner());
    assert!(last.value < WEI_IN_ETHER);
}

#[tokio::test]
async fn events_before_init_are_rejected() {
    let mut h = Harness::new().await;
    let head = h.ledger.head();
    let err = h
        .registration
        .handle_past_events(&[], &head, false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotInitialized));
}

#[tokio::test]
async fn reauthorized_hub_cancels_pending_revocation() {
    let mut h = Harness::registered().await;
    let hub = h.engine.config().relay_hub_address;
    h.ledger.set_hub_balance(h.manager, WEI_IN_ETHER);
    let removal_time = h.ledger.head().timestamp + 100;
    h.ledger.emit_event(
        h.manager,
        RelayEvent::HubUnauthorized {
            relay_hub: hub,
            removal_time,
        },
    );
    let head = h.ledger.head();
    let events = h.events_at(&head).await;
    h.registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    assert_eq!(h.registration.pending_delayed_events(), 1);

    h.ledger.mine_block();
    h.ledger.authorize_hub(h.manager);
    let head = h.ledger.head();
    let events = h.events_at(&head).await;
    let sent = h
        .registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    assert!(sent.is_empty());
    assert!(h.registration.is_hub_authorized());
    assert_eq!(h.registration.pending_delayed_events(), 0);

    let broadcasts = h.ledger.broadcasts().len();
    let head = h.ledger.advance_blocks(10);
    let sent = h
        .registration
        .handle_past_events(&[], &head, false)
        .await
        .unwrap();
    assert!(sent.is_empty());
    assert_eq!(h.ledger.broadcasts().len(), broadcasts);
}

#[tokio::test]
async fn restart_does_not_replay_a_handled_revocation() {
    let mut h = Harness::registered().await;
    let hub = h.engine.config().relay_hub_address;
    h.ledger.set_hub_balance(h.manager, WEI_IN_ETHER);
    for worker in &h.workers {
        h.ledger.set_balance(*worker, WEI_IN_ETHER / 2);
    }
    let removal_time = h.ledger.head().timestamp + 10;
    h.ledger.emit_event(
        h.manager,
        RelayEvent::HubUnauthorized {
            relay_hub: hub,
            removal_time,
        },
    );
    let head = h.ledger.head();
    let events = h.events_at(&head).await;
    h.registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    let head = h.ledger.advance_blocks(1);
    let sent = h
        .registration
        .handle_past_events(&[], &head, false)
        .await
        .unwrap();
    assert_eq!(sent.len(), 3);

    h.ledger.mine_block();
    h.ledger.authorize_hub(h.manager);
    let head = h.ledger.head();
    let events = h.events_at(&head).await;
    h.registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();
    assert!(h.registration.is_hub_authorized());

    let mut restarted = RegistrationManager::new(config(), h.engine.clone());
    restarted.init().await.unwrap();
    let history = h
        .ledger
        .get_past_events(h.manager, 0, head.number)
        .await
        .unwrap();
    restarted.restore_from_events(&history, head.timestamp);
    assert!(restarted.is_hub_authorized());
    assert_eq!(restarted.pending_delayed_events(), 0);

    let broadcasts = h.ledger.broadcasts().len();
    let next = h.ledger.mine_block();
    let sent = restarted
        .handle_past_events(&[], &next, false)
        .await
        .unwrap();
    assert!(sent.is_empty());
    assert_eq!(h.ledger.broadcasts().len(), broadcasts);
}

#[tokio::test]
async fn restart_keeps_a_revocation_that_is_not_due_yet() {
    let mut h = Harness::registered().await;
    let hub = h.engine.config().relay_hub_address;
    let removal_time = h.ledger.head().timestamp + 100;
    h.ledger.emit_event(
        h.manager,
        RelayEvent::HubUnauthorized {
            relay_hub: hub,
            removal_time,
        },
    );
    let head = h.ledger.head();
    let events = h.events_at(&head).await;
    h.registration
        .handle_past_events(&events, &head, false)
        .await
        .unwrap();

    let mut restarted = RegistrationManager::new(config(), h.engine.clone());
    restarted.init().await.unwrap();
    let history = h
        .ledger
        .get_past_events(h.manager, 0, head.number)
        .await
        .unwrap();
    restarted.restore_from_events(&history, head.timestamp);
    assert!(!restarted.is_hub_authorized());
    assert_eq!(restarted.pending_delayed_events(), 1);
}
