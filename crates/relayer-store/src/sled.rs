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

use std::fmt::Debug;
use std::path::Path;

use ethers::types::Address;
use mtx_relayer_utils::Error;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;

use super::{
    HistoryStore, HistoryStoreKey, StoredTransaction, TransactionStore, TxKey,
};

const TXS_TREE: &str = "txs";
const SUPERSEDED_TREE: &str = "superseded_txs";
const LAST_BLOCK_TREE: &str = "last_block_numbers";

/// SledStore is a store that keeps the relayer transactions in a [Sled](https://sled.rs)-based database.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    txs: sled::Tree,
    superseded: sled::Tree,
}

impl std::fmt::Debug for SledStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledStore").finish()
    }
}

impl SledStore {
    /// Create a new SledStore.
    pub fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let db = sled::Config::new()
            .path(path)
            .mode(sled::Mode::HighThroughput)
            .open()?;
        Self::from_db(db)
    }

    /// Creates a temporary SledStore, removed when dropped.
    pub fn temporary() -> crate::Result<Self> {
        let dir = tempfile::tempdir()?;
        let db = sled::Config::new()
            .path(dir.path())
            .temporary(true)
            .open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> crate::Result<Self> {
        let txs = db.open_tree(TXS_TREE)?;
        let superseded = db.open_tree(SUPERSEDED_TREE)?;
        Ok(Self {
            db,
            txs,
            superseded,
        })
    }

    /// Gets the total amount of data stored on disk
    pub fn get_data_stored_size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or_default()
    }

    fn superseded_key(key: TxKey, attempt: u32) -> [u8; TxKey::LEN + 4] {
        let mut bytes = [0u8; TxKey::LEN + 4];
        bytes[..TxKey::LEN].copy_from_slice(&key.to_bytes());
        bytes[TxKey::LEN..].copy_from_slice(&attempt.to_be_bytes());
        bytes
    }

    fn decode(bytes: &[u8]) -> crate::Result<StoredTransaction> {
        serde_json::from_slice(bytes).map_err(Error::from)
    }

    fn remove_superseded(&self, key: TxKey) -> crate::Result<()> {
        for item in self.superseded.scan_prefix(key.to_bytes()) {
            let (k, _) = item?;
            self.superseded.remove(k)?;
        }
        Ok(())
    }
}

/// Maps an aborted sled transaction back into the relayer error.
fn abort_to_error(e: TransactionError<Error>) -> Error {
    match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => Error::Sled(e),
    }
}

impl TransactionStore for SledStore {
    #[tracing::instrument(skip_all, fields(key = %tx.key()))]
    fn put_tx(&self, tx: &StoredTransaction) -> crate::Result<()> {
        let key = tx.key();
        let bytes = serde_json::to_vec(tx)?;
        self.txs
            .transaction(|db| {
                if db.get(key.to_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(
                        Error::DuplicateNonce {
                            signer: key.signer,
                            nonce: key.nonce,
                        },
                    ));
                }
                db.insert(&key.to_bytes()[..], bytes.as_slice())?;
                Ok(())
            })
            .map_err(abort_to_error)?;
        self.db.flush()?;
        tracing::trace!("stored transaction {:?}", tx.tx_id);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key = %tx.key()))]
    fn update_tx(&self, tx: &StoredTransaction) -> crate::Result<()> {
        let key = tx.key();
        let bytes = serde_json::to_vec(tx)?;
        self.txs
            .transaction(|db| {
                if db.get(key.to_bytes())?.is_none() {
                    return Err(ConflictableTransactionError::Abort(
                        Error::TransactionNotFound {
                            signer: key.signer,
                            nonce: key.nonce,
                        },
                    ));
                }
                db.insert(&key.to_bytes()[..], bytes.as_slice())?;
                Ok(())
            })
            .map_err(abort_to_error)?;
        self.db.flush()?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key = %tx.key()))]
    fn replace_tx(
        &self,
        tx: &StoredTransaction,
    ) -> crate::Result<StoredTransaction> {
        let key = tx.key();
        let bytes = serde_json::to_vec(tx)?;
        // both trees are updated atomically, so a crash never leaves a nonce
        // without a live record.
        let old = (&self.txs, &self.superseded)
            .transaction(|(txs, superseded)| {
                let old = match txs.get(key.to_bytes())? {
                    Some(old) => old,
                    None => {
                        return Err(ConflictableTransactionError::Abort(
                            Error::TransactionNotFound {
                                signer: key.signer,
                                nonce: key.nonce,
                            },
                        ))
                    }
                };
                let old_tx = Self::decode(&old)
                    .map_err(ConflictableTransactionError::Abort)?;
                let archive_key = Self::superseded_key(key, old_tx.attempts);
                superseded.insert(&archive_key[..], old.clone())?;
                txs.insert(&key.to_bytes()[..], bytes.as_slice())?;
                Ok(old_tx)
            })
            .map_err(abort_to_error)?;
        self.db.flush()?;
        Ok(old)
    }

    fn get_tx(&self, key: TxKey) -> crate::Result<Option<StoredTransaction>> {
        self.txs
            .get(key.to_bytes())?
            .map(|v| Self::decode(&v))
            .transpose()
    }

    fn get_all(&self) -> crate::Result<Vec<StoredTransaction>> {
        self.txs
            .iter()
            .map(|item| {
                let (_, v) = item?;
                Self::decode(&v)
            })
            .collect()
    }

    fn get_all_by_signer(
        &self,
        signer: Address,
    ) -> crate::Result<Vec<StoredTransaction>> {
        self.txs
            .scan_prefix(signer.as_bytes())
            .map(|item| {
                let (_, v) = item?;
                Self::decode(&v)
            })
            .collect()
    }

    fn get_superseded(
        &self,
        key: TxKey,
    ) -> crate::Result<Vec<StoredTransaction>> {
        self.superseded
            .scan_prefix(key.to_bytes())
            .map(|item| {
                let (_, v) = item?;
                Self::decode(&v)
            })
            .collect()
    }

    #[tracing::instrument(skip(self), fields(key = %key))]
    fn remove_tx(
        &self,
        key: TxKey,
    ) -> crate::Result<Option<StoredTransaction>> {
        let removed = self.txs.remove(key.to_bytes())?;
        self.remove_superseded(key)?;
        self.db.flush()?;
        removed.map(|v| Self::decode(&v)).transpose()
    }

    #[tracing::instrument(skip_all)]
    fn remove_where<F>(
        &self,
        predicate: F,
    ) -> crate::Result<Vec<StoredTransaction>>
    where
        F: Fn(&StoredTransaction) -> bool,
    {
        let mut removed = Vec::new();
        for tx in self.get_all()? {
            if !predicate(&tx) {
                continue;
            }
            let key = tx.key();
            self.txs.remove(key.to_bytes())?;
            self.remove_superseded(key)?;
            removed.push(tx);
        }
        if !removed.is_empty() {
            self.db.flush()?;
            tracing::trace!("removed {} transactions", removed.len());
        }
        Ok(removed)
    }
}

impl HistoryStore for SledStore {
    #[tracing::instrument(skip(self))]
    fn set_last_block_number<K: Into<HistoryStoreKey> + Debug>(
        &self,
        key: K,
        block_number: u64,
    ) -> crate::Result<u64> {
        let tree = self.db.open_tree(LAST_BLOCK_TREE)?;
        let bytes = block_number.to_be_bytes();
        let key: HistoryStoreKey = key.into();
        let old = tree.insert(key.to_bytes(), &bytes)?;
        self.db.flush()?;
        match old {
            Some(v) => Ok(decode_u64(&v)),
            None => Ok(block_number),
        }
    }

    #[tracing::instrument(skip(self))]
    fn get_last_block_number<K: Into<HistoryStoreKey> + Debug>(
        &self,
        key: K,
        default_block_number: u64,
    ) -> crate::Result<u64> {
        let tree = self.db.open_tree(LAST_BLOCK_TREE)?;
        let key: HistoryStoreKey = key.into();
        let val = tree.get(key.to_bytes())?;
        match val {
            Some(v) => Ok(decode_u64(&v)),
            None => Ok(default_block_number),
        }
    }
}

fn decode_u64(bytes: &[u8]) -> u64 {
    let mut output = [0u8; 8];
    let len = bytes.len().min(8);
    output[..len].copy_from_slice(&bytes[..len]);
    u64::from_be_bytes(output)
}
