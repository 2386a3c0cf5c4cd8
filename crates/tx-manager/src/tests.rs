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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use ethers::types::transaction::eip2718::TypedTransaction;
use mtx_relayer_context::mocked::MockedContractInteractor;
use mtx_relayer_context::LocalKeyManager;
use mtx_relayer_store::InMemoryStore;

use super::*;

fn gwei(n: u64) -> U256 {
    U256::from(n) * U256::exp10(9)
}

fn config() -> Arc<RelayerConfig> {
    let config = serde_json::from_value(serde_json::json!({
        "url": "https://relay.example.org",
        "ledger": { "http-endpoint": "http://localhost:8545" },
        "relay-hub-address": "0x4848484848484848484848484848484848484848",
        "owner-address": "0x2222222222222222222222222222222222222222",
        "pending-transaction-timeout-blocks": 30,
        "confirmations-needed": 12,
    }))
    .unwrap();
    Arc::new(config)
}

struct Harness {
    ledger: Arc<MockedContractInteractor>,
    workers: Vec<Address>,
    engine: TransactionManager<InMemoryStore>,
}

async fn harness_with(
    worker_keys: Arc<dyn KeyManager>,
    store: InMemoryStore,
) -> Harness {
    let ledger = Arc::new(MockedContractInteractor::default());
    let workers = worker_keys.addresses();
    let engine = TransactionManager::new(
        config(),
        ledger.clone(),
        Arc::new(LocalKeyManager::ephemeral(1)),
        worker_keys,
        store,
    )
    .unwrap();
    engine.init().await.unwrap();
    Harness {
        ledger,
        workers,
        engine,
    }
}

async fn harness(workers: usize) -> Harness {
    harness_with(
        Arc::new(LocalKeyManager::ephemeral(workers)),
        InMemoryStore::default(),
    )
    .await
}

fn transfer(h: &Harness, signer: Address, gas_price: Option<U256>) -> SendTransactionDetails {
    let mut details = SendTransactionDetails::transfer(
        signer,
        Address::repeat_byte(0x77),
        U256::from(1u64),
        h.ledger.head(),
    );
    details.gas_price = gas_price;
    details
}

fn signed_gas_price(raw: &Bytes) -> U256 {
    let rlp = ethers::utils::rlp::Rlp::new(raw.as_ref());
    let (tx, _) = TypedTransaction::decode_signed(&rlp).unwrap();
    tx.gas_price().unwrap()
}

/// Fails the first `failures` signatures, then delegates.
struct FlakyKeys {
    inner: LocalKeyManager,
    failures: AtomicUsize,
}

impl KeyManager for FlakyKeys {
    fn addresses(&self) -> Vec<Address> {
        self.inner.addresses()
    }

    fn sign_transaction(
        &self,
        signer: Address,
        tx: &TypedTransaction,
    ) -> Result<Bytes> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::Signing("hardware wallet unplugged".into()));
        }
        self.inner.sign_transaction(signer, tx)
    }
}

/// An in-memory store whose first `put_failures` inserts fail.
#[derive(Clone, Default)]
struct FailingStore {
    inner: InMemoryStore,
    put_failures: Arc<AtomicUsize>,
}

impl TransactionStore for FailingStore {
    fn put_tx(&self, tx: &StoredTransaction) -> Result<()> {
        let left = self.put_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.put_failures.store(left - 1, Ordering::SeqCst);
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.inner.put_tx(tx)
    }

    fn update_tx(&self, tx: &StoredTransaction) -> Result<()> {
        self.inner.update_tx(tx)
    }

    fn replace_tx(&self, tx: &StoredTransaction) -> Result<StoredTransaction> {
        self.inner.replace_tx(tx)
    }

    fn get_tx(&self, key: TxKey) -> Result<Option<StoredTransaction>> {
        self.inner.get_tx(key)
    }

    fn get_all(&self) -> Result<Vec<StoredTransaction>> {
        self.inner.get_all()
    }

    fn get_superseded(&self, key: TxKey) -> Result<Vec<StoredTransaction>> {
        self.inner.get_superseded(key)
    }

    fn remove_tx(&self, key: TxKey) -> Result<Option<StoredTransaction>> {
        self.inner.remove_tx(key)
    }

    fn remove_where<F>(&self, predicate: F) -> Result<Vec<StoredTransaction>>
    where
        F: Fn(&StoredTransaction) -> bool,
    {
        self.inner.remove_where(predicate)
    }
}

#[tokio::test]
async fn concurrent_sends_reserve_contiguous_nonces() {
    let h = harness(1).await;
    let worker = h.workers[0];
    h.ledger.state().confirmed_nonces.insert(worker, 5);

    let sends = (0..10).map(|_| h.engine.send_transaction(transfer(&h, worker, None)));
    let results = futures::future::join_all(sends).await;
    assert!(results.iter().all(|r| r.is_ok()));

    let mut nonces: Vec<u64> = h
        .engine
        .store()
        .get_all_by_signer(worker)
        .unwrap()
        .iter()
        .map(|tx| tx.nonce)
        .collect();
    nonces.sort_unstable();
    assert_eq!(nonces, (5..15).collect::<Vec<_>>());
    assert_eq!(h.ledger.broadcasts().len(), 10);
}

#[tokio::test]
async fn signing_failure_releases_the_lock_and_the_nonce() {
    let keys = FlakyKeys {
        inner: LocalKeyManager::ephemeral(1),
        failures: AtomicUsize::new(1),
    };
    let h = harness_with(Arc::new(keys), InMemoryStore::default()).await;
    let worker = h.workers[0];

    let err = h
        .engine
        .send_transaction(transfer(&h, worker, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SendTransactionFailed { .. }));
    assert!(h.engine.store().get_all().unwrap().is_empty());

    let next = tokio::time::timeout(
        Duration::from_secs(5),
        h.engine.send_transaction(transfer(&h, worker, None)),
    )
    .await
    .expect("send must not block after a failed one")
    .unwrap();
    let stored = h.engine.get_transaction(worker, 0).unwrap().unwrap();
    assert_eq!(stored.tx_id, next.tx_id);
}

#[tokio::test]
async fn broadcast_failure_drops_the_record() {
    let h = harness(1).await;
    let worker = h.workers[0];
    h.ledger.state().fail_broadcasts = 1;

    let err = h
        .engine
        .send_transaction(transfer(&h, worker, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SendTransactionFailed { .. }));
    assert!(h.engine.store().get_all().unwrap().is_empty());

    h.engine
        .send_transaction(transfer(&h, worker, None))
        .await
        .unwrap();
    assert!(h.engine.get_transaction(worker, 0).unwrap().is_some());
}

#[tokio::test]
async fn store_failure_releases_the_nonce() {
    let ledger = Arc::new(MockedContractInteractor::default());
    let worker_keys = Arc::new(LocalKeyManager::ephemeral(1));
    let worker = worker_keys.addresses()[0];
    let store = FailingStore {
        put_failures: Arc::new(AtomicUsize::new(1)),
        ..Default::default()
    };
    let engine = TransactionManager::new(
        config(),
        ledger.clone(),
        Arc::new(LocalKeyManager::ephemeral(1)),
        worker_keys,
        store,
    )
    .unwrap();
    engine.init().await.unwrap();
    let details = SendTransactionDetails::transfer(
        worker,
        Address::repeat_byte(0x77),
        U256::from(1u64),
        ledger.head(),
    );

    let err = engine.send_transaction(details.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Io(_)));
    assert!(ledger.broadcasts().is_empty());

    engine.send_transaction(details).await.unwrap();
    assert!(engine.get_transaction(worker, 0).unwrap().is_some());
    assert_eq!(ledger.broadcasts()[0].nonce, 0);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn nonce_too_low_resyncs_the_counter() {
    let h = harness(1).await;
    let worker = h.workers[0];
    h.engine
        .send_transaction(transfer(&h, worker, None))
        .await
        .unwrap();
    {
        // the key was used out of band, up to nonce 2.
        let mut state = h.ledger.state();
        state.mempool.clear();
        state.confirmed_nonces.insert(worker, 3);
    }

    let err = h
        .engine
        .send_transaction(transfer(&h, worker, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SendTransactionFailed { .. }));
    assert!(logs_contain("was already used on the ledger"));

    h.engine
        .send_transaction(transfer(&h, worker, None))
        .await
        .unwrap();
    assert!(h.engine.get_transaction(worker, 3).unwrap().is_some());
    assert!(h.engine.get_transaction(worker, 1).unwrap().is_none());
}

#[tokio::test]
async fn unknown_signers_are_rejected_before_reserving() {
    let h = harness(1).await;
    let stranger = Address::repeat_byte(0x99);
    let err = h
        .engine
        .send_transaction(transfer(&h, stranger, None))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownSigner(a) if a == stranger));
    assert!(h.ledger.broadcasts().is_empty());
}

#[tokio::test]
async fn init_restores_counters_from_the_store() {
    let keys = Arc::new(LocalKeyManager::ephemeral(1));
    let worker = keys.addresses()[0];
    let store = InMemoryStore::default();
    store
        .put_tx(&StoredTransaction {
            signer: worker,
            nonce: 7,
            action: ServerAction::ValueTransfer,
            to: Address::repeat_byte(0x77),
            value: U256::zero(),
            gas_price: gwei(1),
            gas_limit: U256::from(21_000u64),
            data: Bytes::default(),
            raw_tx: Bytes::default(),
            tx_id: H256::repeat_byte(7),
            creation_block: BlockInfo::default(),
            boost_block_number: None,
            mined_block_number: None,
            attempts: 0,
        })
        .unwrap();
    let h = harness_with(keys, store).await;

    h.engine
        .send_transaction(transfer(&h, worker, None))
        .await
        .unwrap();
    assert!(h.engine.get_transaction(worker, 8).unwrap().is_some());
}

#[tokio::test]
async fn boost_waits_for_the_pending_timeout() {
    let h = harness(1).await;
    let worker = h.workers[0];
    let sent = h
        .engine
        .send_transaction(transfer(&h, worker, Some(gwei(9))))
        .await
        .unwrap();
    h.ledger.set_gas_price(gwei(10));

    let head = h.ledger.advance_blocks(29);
    let boosted = h.engine.boost_stuck_pending_transactions(&head).await.unwrap();
    assert!(boosted.is_empty());

    let head = h.ledger.advance_blocks(1);
    let boosted = h.engine.boost_stuck_pending_transactions(&head).await.unwrap();
    assert_eq!(boosted.len(), 1);
    let replacement = &boosted[&sent.tx_id];
    assert!(signed_gas_price(&replacement.raw) >= mul_factor(gwei(9), 1.2));

    // exactly one live record for the nonce, the old attempt is archived.
    let live = h.engine.store().get_all_by_signer(worker).unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].tx_id, replacement.tx_id);
    assert_eq!(live[0].attempts, 1);
    assert_eq!(live[0].boost_block_number, Some(head.number));
    let superseded = h.engine.store().get_superseded(live[0].key()).unwrap();
    assert_eq!(superseded.len(), 1);
    assert_eq!(superseded[0].tx_id, sent.tx_id);

    // not boosted again before the cooldown.
    let head = h.ledger.advance_blocks(1);
    let boosted = h.engine.boost_stuck_pending_transactions(&head).await.unwrap();
    assert!(boosted.is_empty());
}

#[tokio::test]
#[tracing_test::traced_test]
async fn resending_a_used_nonce_resyncs_the_counter() {
    let h = harness(1).await;
    let worker = h.workers[0];
    h.engine
        .send_transaction(transfer(&h, worker, Some(gwei(9))))
        .await
        .unwrap();
    {
        // the key was used out of band, up to nonce 2.
        let mut state = h.ledger.state();
        state.mempool.clear();
        state.confirmed_nonces.insert(worker, 3);
    }

    let stuck = h.engine.get_transaction(worker, 0).unwrap().unwrap();
    let head = h.ledger.advance_blocks(30);
    let resent = h
        .engine
        .resend_transaction(&stuck, &head, gwei(20), true)
        .await
        .unwrap();
    assert!(resent.is_none());
    assert!(logs_contain("resyncing"));

    h.engine
        .send_transaction(transfer(&h, worker, None))
        .await
        .unwrap();
    assert!(h.engine.get_transaction(worker, 3).unwrap().is_some());
    assert!(h.engine.get_transaction(worker, 1).unwrap().is_none());
}

#[tokio::test]
async fn boost_is_capped_at_max_gas_price() {
    let h = harness(1).await;
    let worker = h.workers[0];
    h.engine
        .send_transaction(transfer(&h, worker, Some(gwei(450))))
        .await
        .unwrap();
    h.ledger.set_gas_price(gwei(480));

    let head = h.ledger.advance_blocks(30);
    let boosted = h.engine.boost_stuck_pending_transactions(&head).await.unwrap();
    let replacement = boosted.values().next().unwrap();
    assert_eq!(signed_gas_price(&replacement.raw), gwei(500));
}

#[tokio::test]
async fn stuck_transactions_of_five_signers_are_boosted() {
    let h = harness(5).await;
    let mut below_market = Vec::new();
    for (i, worker) in h.workers.iter().enumerate() {
        let price = if i == 4 { gwei(10) } else { gwei(9) };
        let sent = h
            .engine
            .send_transaction(transfer(&h, *worker, Some(price)))
            .await
            .unwrap();
        if i != 4 {
            below_market.push(sent.tx_id);
        }
    }
    h.ledger.set_gas_price(gwei(10));

    let head = h.ledger.advance_blocks(30);
    let boosted = h.engine.boost_stuck_pending_transactions(&head).await.unwrap();
    assert_eq!(boosted.len(), 4);
    for original in &below_market {
        let replacement = &boosted[original];
        assert_eq!(signed_gas_price(&replacement.raw), U256::from(10_800_000_000u64));
    }
    let untouched = h
        .engine
        .get_transaction(h.workers[4], 0)
        .unwrap()
        .unwrap();
    assert_eq!(untouched.attempts, 0);
}

#[tokio::test]
async fn mined_transactions_are_pruned_once_confirmed() {
    let h = harness(1).await;
    let worker = h.workers[0];
    for _ in 0..2 {
        h.engine
            .send_transaction(transfer(&h, worker, None))
            .await
            .unwrap();
    }
    let mined_at = h.ledger.mine_block();
    h.engine
        .fill_mined_block_details_for_transactions()
        .await
        .unwrap();
    let stored = h.engine.store().get_all().unwrap();
    assert!(stored
        .iter()
        .all(|tx| tx.mined_block_number == Some(mined_at.number)));

    let head = h.ledger.advance_blocks(12);
    assert!(h.engine.remove_confirmed_transactions(head.number).unwrap().is_empty());
    assert_eq!(h.engine.store().get_all().unwrap().len(), 2);

    let head = h.ledger.advance_blocks(1);
    assert_eq!(h.engine.remove_confirmed_transactions(head.number).unwrap().len(), 2);
    let after_once = h.engine.store().get_all().unwrap();
    assert!(h.engine.remove_confirmed_transactions(head.number).unwrap().is_empty());
    assert_eq!(h.engine.store().get_all().unwrap(), after_once);
}

#[tokio::test]
async fn mined_earlier_attempt_becomes_the_live_record() {
    let h = harness(1).await;
    let worker = h.workers[0];
    let original = h
        .engine
        .send_transaction(transfer(&h, worker, Some(gwei(9))))
        .await
        .unwrap();
    h.ledger.set_gas_price(gwei(10));
    let head = h.ledger.advance_blocks(30);
    let boosted = h.engine.boost_stuck_pending_transactions(&head).await.unwrap();
    assert_eq!(boosted.len(), 1);
    {
        // the first attempt won the race on another node.
        let mut state = h.ledger.state();
        state.mempool.clear();
        state.mined.insert(original.tx_id, head.number);
        state.confirmed_nonces.insert(worker, 1);
    }

    h.engine
        .fill_mined_block_details_for_transactions()
        .await
        .unwrap();
    let live = h.engine.get_transaction(worker, 0).unwrap().unwrap();
    assert_eq!(live.tx_id, original.tx_id);
    assert_eq!(live.mined_block_number, Some(head.number));
}

#[tokio::test]
async fn recent_actions_are_detected() {
    let h = harness(1).await;
    let manager = h.engine.manager_address();
    let hub = h.engine.config().relay_hub_address;
    let details = SendTransactionDetails::call(
        manager,
        ServerAction::RegisterServer,
        hub,
        Bytes::from(vec![1, 2, 3]),
        h.ledger.head(),
    );
    h.engine.send_transaction(details).await.unwrap();
    let head = h.ledger.head().number;
    let pending = |distance, destination| {
        h.engine
            .is_action_pending_or_recently_mined(
                ServerAction::RegisterServer,
                head,
                distance,
                destination,
            )
            .unwrap()
    };
    assert!(pending(0, None));
    assert!(pending(0, Some(hub)));
    assert!(!pending(0, Some(Address::repeat_byte(1))));

    let mined = h.ledger.mine_block();
    h.engine
        .fill_mined_block_details_for_transactions()
        .await
        .unwrap();
    let later = mined.number + 5;
    assert!(h
        .engine
        .is_action_pending_or_recently_mined(ServerAction::RegisterServer, later, 10, None)
        .unwrap());
    assert!(!h
        .engine
        .is_action_pending_or_recently_mined(ServerAction::RegisterServer, later, 4, None)
        .unwrap());
    assert!(!h
        .engine
        .is_action_pending_or_recently_mined(ServerAction::AddWorker, later, 10, None)
        .unwrap());
}

#[tokio::test]
async fn gas_price_above_ceiling_is_rejected() {
    let h = harness(1).await;
    h.ledger.set_gas_price(gwei(600));
    let err = h.engine.refresh_gas_price().await.unwrap_err();
    assert!(matches!(err, Error::GasPriceTooHigh { .. }));
}

#[tokio::test]
#[tracing_test::traced_test]
async fn gas_estimation_falls_back_to_default() {
    let h = harness(1).await;
    h.ledger.state().fail_estimate_gas = true;
    let gas = h
        .engine
        .attempt_estimate_gas(h.workers[0], Address::zero(), &Bytes::default(), U256::zero())
        .await;
    assert_eq!(gas, U256::from(500_000u64));
    assert!(logs_contain("using default gas limit"));
}

#[test]
fn factors_are_applied_in_thousandths() {
    assert_eq!(mul_factor(gwei(9), 1.2), U256::from(10_800_000_000u64));
    assert_eq!(mul_factor(gwei(10), 1.0), gwei(10));
    assert_eq!(mul_factor(U256::from(3u64), 1.5), U256::from(4u64));
}
