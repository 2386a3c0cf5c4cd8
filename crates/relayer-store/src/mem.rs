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

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use mtx_relayer_utils::Error;
use parking_lot::RwLock;

use super::{
    HistoryStore, HistoryStoreKey, StoredTransaction, TransactionStore, TxKey,
};

/// InMemoryStore keeps the relayer transactions in memory, mostly used in tests.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    txs: Arc<RwLock<BTreeMap<TxKey, StoredTransaction>>>,
    superseded: Arc<RwLock<BTreeMap<TxKey, Vec<StoredTransaction>>>>,
    last_block_numbers: Arc<RwLock<HashMap<HistoryStoreKey, u64>>>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish()
    }
}

impl TransactionStore for InMemoryStore {
    #[tracing::instrument(skip_all, fields(key = %tx.key()))]
    fn put_tx(&self, tx: &StoredTransaction) -> crate::Result<()> {
        let key = tx.key();
        let mut guard = self.txs.write();
        if guard.contains_key(&key) {
            return Err(Error::DuplicateNonce {
                signer: key.signer,
                nonce: key.nonce,
            });
        }
        guard.insert(key, tx.clone());
        Ok(())
    }

    fn update_tx(&self, tx: &StoredTransaction) -> crate::Result<()> {
        let key = tx.key();
        let mut guard = self.txs.write();
        match guard.get_mut(&key) {
            Some(slot) => {
                *slot = tx.clone();
                Ok(())
            }
            None => Err(Error::TransactionNotFound {
                signer: key.signer,
                nonce: key.nonce,
            }),
        }
    }

    fn replace_tx(
        &self,
        tx: &StoredTransaction,
    ) -> crate::Result<StoredTransaction> {
        let key = tx.key();
        let mut txs = self.txs.write();
        let old = txs.insert(key, tx.clone()).ok_or(
            Error::TransactionNotFound {
                signer: key.signer,
                nonce: key.nonce,
            },
        );
        match old {
            Ok(old) => {
                self.superseded
                    .write()
                    .entry(key)
                    .or_default()
                    .push(old.clone());
                Ok(old)
            }
            Err(e) => {
                txs.remove(&key);
                Err(e)
            }
        }
    }

    fn get_tx(&self, key: TxKey) -> crate::Result<Option<StoredTransaction>> {
        Ok(self.txs.read().get(&key).cloned())
    }

    fn get_all(&self) -> crate::Result<Vec<StoredTransaction>> {
        Ok(self.txs.read().values().cloned().collect())
    }

    fn get_superseded(
        &self,
        key: TxKey,
    ) -> crate::Result<Vec<StoredTransaction>> {
        Ok(self
            .superseded
            .read()
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    fn remove_tx(
        &self,
        key: TxKey,
    ) -> crate::Result<Option<StoredTransaction>> {
        self.superseded.write().remove(&key);
        Ok(self.txs.write().remove(&key))
    }

    fn remove_where<F>(
        &self,
        predicate: F,
    ) -> crate::Result<Vec<StoredTransaction>>
    where
        F: Fn(&StoredTransaction) -> bool,
    {
        let mut txs = self.txs.write();
        let mut superseded = self.superseded.write();
        let keys: Vec<_> = txs
            .values()
            .filter(|tx| predicate(tx))
            .map(StoredTransaction::key)
            .collect();
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                superseded.remove(&key);
                txs.remove(&key)
            })
            .collect())
    }
}

impl HistoryStore for InMemoryStore {
    #[tracing::instrument(skip(self))]
    fn get_last_block_number<K: Into<HistoryStoreKey> + Debug>(
        &self,
        key: K,
        default_block_number: u64,
    ) -> crate::Result<u64> {
        let guard = self.last_block_numbers.read();
        let val = guard
            .get(&key.into())
            .cloned()
            .unwrap_or(default_block_number);
        Ok(val)
    }

    #[tracing::instrument(skip(self))]
    fn set_last_block_number<K: Into<HistoryStoreKey> + Debug>(
        &self,
        key: K,
        block_number: u64,
    ) -> crate::Result<u64> {
        let mut guard = self.last_block_numbers.write();
        let val = guard.insert(key.into(), block_number);
        Ok(val.unwrap_or(block_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::store_contract_holds;

    #[test]
    fn in_memory_store_contract() {
        store_contract_holds(InMemoryStore::default());
    }
}
