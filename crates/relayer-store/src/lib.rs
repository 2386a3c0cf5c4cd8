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

//! # Relayer Store Module 🕸️
//!
//! A module for managing the storage of the relayer.
//!
//! ## Overview
//!
//! The relayer store keeps every transaction the relayer has signed and
//! broadcast until it is buried deep enough under the chain head, together
//! with the replaced attempts of boosted transactions and the last block the
//! relayer scanned for events. A fresh process opened on the same directory
//! resumes with the same in-flight transactions.
use std::fmt::{Debug, Display};

use ethers::types::{Address, Bytes, H256, U256};
use mtx_relayer_types::{BlockInfo, ServerAction};
use serde::{Deserialize, Serialize};

pub use mtx_relayer_utils::Result;

/// A module for managing in-memory storage of the relayer.
pub mod mem;
/// A module for setting up and managing a [Sled](https://sled.rs)-based database.
#[cfg(feature = "sled")]
pub mod sled;

/// A store that uses [`sled`](https://sled.rs) as the backend.
#[cfg(feature = "sled")]
pub use self::sled::SledStore;
/// A store that uses in memory data structures as the backend.
pub use mem::InMemoryStore;

/// The identity of a live transaction: one per (signer, nonce).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxKey {
    /// The account that signed the transaction.
    pub signer: Address,
    /// The nonce reserved for the transaction.
    pub nonce: u64,
}

impl TxKey {
    /// Size of the key when encoded as bytes.
    pub const LEN: usize = 20 + 8;

    /// Creates a new key.
    pub fn new(signer: Address, nonce: u64) -> Self {
        Self { signer, nonce }
    }

    /// Returns the bytes of the key, `signer ‖ nonce (big endian)`, so that
    /// keys of the same signer sort by nonce.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut bytes = [0u8; Self::LEN];
        bytes[..20].copy_from_slice(self.signer.as_bytes());
        bytes[20..].copy_from_slice(&self.nonce.to_be_bytes());
        bytes
    }

    /// Decodes a key produced by [`TxKey::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::LEN {
            return None;
        }
        let signer = Address::from_slice(&bytes[..20]);
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&bytes[20..Self::LEN]);
        Some(Self::new(signer, u64::from_be_bytes(nonce)))
    }
}

impl Display for TxKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}#{}", self.signer, self.nonce)
    }
}

/// One durable record per broadcast attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTransaction {
    /// The account that signed the transaction.
    pub signer: Address,
    /// The nonce of the transaction.
    pub nonce: u64,
    /// What the transaction is for.
    pub action: ServerAction,
    /// Destination of the transaction.
    pub to: Address,
    /// Native value sent along.
    pub value: U256,
    /// Gas price the transaction was signed with.
    pub gas_price: U256,
    /// Gas limit the transaction was signed with.
    pub gas_limit: U256,
    /// Calldata.
    pub data: Bytes,
    /// The signed payload, as broadcast.
    pub raw_tx: Bytes,
    /// Hash of the signed payload.
    pub tx_id: H256,
    /// Head of the chain when the first attempt for this nonce was created.
    pub creation_block: BlockInfo,
    /// Head of the chain when the last boost was broadcast.
    #[serde(default)]
    pub boost_block_number: Option<u64>,
    /// Block the transaction was mined in, once observed.
    #[serde(default)]
    pub mined_block_number: Option<u64>,
    /// How many times this nonce was re-broadcast with a higher price.
    #[serde(default)]
    pub attempts: u32,
}

impl StoredTransaction {
    /// The store key of this transaction.
    pub fn key(&self) -> TxKey {
        TxKey::new(self.signer, self.nonce)
    }

    /// Whether a mining block was observed for this transaction.
    pub fn is_mined(&self) -> bool {
        self.mined_block_number.is_some()
    }

    /// The block at which this nonce was last (re)broadcast.
    pub fn last_broadcast_block(&self) -> u64 {
        self.boost_block_number.unwrap_or(self.creation_block.number)
    }

    /// Number of confirmations at `current_block`, if mined.
    pub fn confirmations(&self, current_block: u64) -> Option<u64> {
        self.mined_block_number
            .map(|mined| current_block.saturating_sub(mined))
    }
}

/// The Persistent Transaction Store.
///
/// At most one live record exists per (signer, nonce). Replaced attempts of
/// a nonce are kept aside as superseded until the nonce is pruned.
pub trait TransactionStore: Clone + Send + Sync {
    /// Inserts a new live record. Fails with [`Error::DuplicateNonce`]
    /// if a live record for the same (signer, nonce) already exists.
    ///
    /// [`Error::DuplicateNonce`]: mtx_relayer_utils::Error::DuplicateNonce
    fn put_tx(&self, tx: &StoredTransaction) -> crate::Result<()>;

    /// Overwrites an existing live record. Fails with
    /// [`Error::TransactionNotFound`](mtx_relayer_utils::Error::TransactionNotFound)
    /// if there is none.
    fn update_tx(&self, tx: &StoredTransaction) -> crate::Result<()>;

    /// Makes `tx` the live record of its nonce, moving the previous live
    /// record to the superseded set. Returns the previous record.
    fn replace_tx(
        &self,
        tx: &StoredTransaction,
    ) -> crate::Result<StoredTransaction>;

    /// Gets the live record for `key`.
    fn get_tx(&self, key: TxKey) -> crate::Result<Option<StoredTransaction>>;

    /// All live records, ordered by signer then nonce.
    fn get_all(&self) -> crate::Result<Vec<StoredTransaction>>;

    /// All live records of `signer`, ordered by nonce.
    fn get_all_by_signer(
        &self,
        signer: Address,
    ) -> crate::Result<Vec<StoredTransaction>> {
        let all = self.get_all()?;
        Ok(all.into_iter().filter(|tx| tx.signer == signer).collect())
    }

    /// Replaced attempts of `key`, oldest first.
    fn get_superseded(
        &self,
        key: TxKey,
    ) -> crate::Result<Vec<StoredTransaction>>;

    /// Removes the live record of `key` and all its superseded attempts.
    fn remove_tx(&self, key: TxKey)
        -> crate::Result<Option<StoredTransaction>>;

    /// Removes every live record matching `predicate` (with its superseded
    /// attempts) and returns the removed records.
    fn remove_where<F>(
        &self,
        predicate: F,
    ) -> crate::Result<Vec<StoredTransaction>>
    where
        F: Fn(&StoredTransaction) -> bool;
}

/// HistoryStoreKey identifies the cursor of an event scan: the chain and
/// the account whose events are scanned.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HistoryStoreKey {
    /// The chain id.
    pub chain_id: u64,
    /// The account the events are filtered by.
    pub address: Address,
}

impl HistoryStoreKey {
    /// Returns the bytes of the key.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut vec = Vec::with_capacity(8 + 20);
        vec.extend_from_slice(&self.chain_id.to_be_bytes());
        vec.extend_from_slice(self.address.as_bytes());
        vec
    }
}

impl Display for HistoryStoreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Scan(ChainId {}, {:?})", self.chain_id, self.address)
    }
}

impl From<(u64, Address)> for HistoryStoreKey {
    fn from((chain_id, address): (u64, Address)) -> Self {
        Self { chain_id, address }
    }
}

/// HistoryStore is a simple trait for storing and retrieving history
/// of block numbers.
pub trait HistoryStore: Clone + Send + Sync {
    /// Sets the new block number for that key and returns the old one.
    fn set_last_block_number<K: Into<HistoryStoreKey> + Debug>(
        &self,
        key: K,
        block_number: u64,
    ) -> crate::Result<u64>;
    /// Get the last block number for that key.
    /// if not found, returns the `default_block_number`.
    fn get_last_block_number<K: Into<HistoryStoreKey> + Debug>(
        &self,
        key: K,
        default_block_number: u64,
    ) -> crate::Result<u64>;

    /// an easy way to call the `get_last_block_number`
    /// where the default block number is `0`.
    fn get_last_block_number_or_default<K: Into<HistoryStoreKey> + Debug>(
        &self,
        key: K,
    ) -> crate::Result<u64> {
        self.get_last_block_number(key, 0u64)
    }
}
