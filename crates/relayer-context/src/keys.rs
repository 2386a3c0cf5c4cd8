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

//! The Key Custodian: holds the manager and worker identities and signs
//! transactions on their behalf.

use std::path::{Path, PathBuf};

use ethers::core::k256::SecretKey;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes};
use mtx_relayer_types::PrivateKey;
use mtx_relayer_utils::{Error, Result};
use serde::{Deserialize, Serialize};

/// Signs transactions for a fixed set of identities.
pub trait KeyManager: Send + Sync {
    /// All identities, in a stable order.
    fn addresses(&self) -> Vec<Address>;

    /// The identity at `index`.
    fn address(&self, index: usize) -> Option<Address> {
        self.addresses().get(index).copied()
    }

    /// Whether `address` is held by this key manager.
    fn is_signer(&self, address: Address) -> bool {
        self.addresses().contains(&address)
    }

    /// Signs `tx` as `signer` and returns the RLP encoded signed payload.
    fn sign_transaction(
        &self,
        signer: Address,
        tx: &TypedTransaction,
    ) -> Result<Bytes>;
}

#[derive(Default, Serialize, Deserialize)]
struct Keystore {
    keys: Vec<String>,
}

/// A key manager backed by in-process secp256k1 wallets.
#[derive(Clone)]
pub struct LocalKeyManager {
    wallets: Vec<LocalWallet>,
}

impl std::fmt::Debug for LocalKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKeyManager")
            .field("addresses", &self.addresses())
            .finish()
    }
}

impl LocalKeyManager {
    /// Creates a key manager from already known private keys.
    pub fn from_private_keys(keys: &[PrivateKey]) -> Result<Self> {
        let wallets = keys
            .iter()
            .map(|key| {
                let secret = SecretKey::from_bytes(key.as_bytes().into())?;
                Ok(LocalWallet::from(secret))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { wallets })
    }

    /// Creates `count` random identities that only live in memory.
    pub fn ephemeral(count: usize) -> Self {
        let mut rng = rand::thread_rng();
        let wallets = (0..count).map(|_| LocalWallet::new(&mut rng)).collect();
        Self { wallets }
    }

    /// Loads `count` identities: the `configured` keys first, then the ones
    /// saved in the keystore at `path`, generating and saving the missing ones.
    #[tracing::instrument(skip_all)]
    pub fn load_or_generate<P: AsRef<Path>>(
        path: P,
        count: usize,
        configured: &[PrivateKey],
    ) -> Result<Self> {
        let path = path.as_ref();
        let mut manager = Self::from_private_keys(configured)?;
        if manager.wallets.len() >= count {
            manager.wallets.truncate(count);
            return Ok(manager);
        }
        let mut keystore: Keystore = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Keystore::default()
            }
            Err(e) => return Err(e.into()),
        };
        let missing = count - manager.wallets.len();
        let mut rng = rand::thread_rng();
        while keystore.keys.len() < missing {
            let wallet = LocalWallet::new(&mut rng);
            tracing::info!("Generated new identity {:?}", wallet.address());
            keystore
                .keys
                .push(format!("0x{}", hex::encode(wallet.signer().to_bytes())));
        }
        for key in keystore.keys.iter().take(missing) {
            let bytes = hex::decode(key.trim_start_matches("0x"))
                .map_err(|_| Error::Generic("corrupted keystore entry"))?;
            let secret = SecretKey::from_slice(&bytes)?;
            manager.wallets.push(LocalWallet::from(secret));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(&keystore)?)?;
        Ok(manager)
    }

    /// Path of a keystore file under `dir`.
    pub fn keystore_path<P: AsRef<Path>>(dir: P, name: &str) -> PathBuf {
        dir.as_ref().join("keystore").join(format!("{name}.json"))
    }
}

impl KeyManager for LocalKeyManager {
    fn addresses(&self) -> Vec<Address> {
        self.wallets.iter().map(|w| w.address()).collect()
    }

    fn sign_transaction(
        &self,
        signer: Address,
        tx: &TypedTransaction,
    ) -> Result<Bytes> {
        let wallet = self
            .wallets
            .iter()
            .find(|w| w.address() == signer)
            .ok_or(Error::UnknownSigner(signer))?;
        let signature = wallet
            .sign_transaction_sync(tx)
            .map_err(|e| Error::Signing(e.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::TransactionRequest;

    #[test]
    fn keystore_is_reused_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = LocalKeyManager::keystore_path(dir.path(), "workers");
        let first = LocalKeyManager::load_or_generate(&path, 2, &[]).unwrap();
        let second = LocalKeyManager::load_or_generate(&path, 2, &[]).unwrap();
        assert_eq!(first.addresses().len(), 2);
        assert_eq!(first.addresses(), second.addresses());
        // asking for more keeps the existing ones first.
        let third = LocalKeyManager::load_or_generate(&path, 3, &[]).unwrap();
        assert_eq!(&third.addresses()[..2], &first.addresses()[..]);
    }

    #[test]
    fn unknown_signers_are_rejected() {
        let keys = LocalKeyManager::ephemeral(1);
        let tx: TypedTransaction = TransactionRequest::new()
            .to(Address::repeat_byte(1))
            .nonce(0)
            .gas(21_000)
            .gas_price(1)
            .chain_id(1337u64)
            .into();
        let err = keys
            .sign_transaction(Address::repeat_byte(9), &tx)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownSigner(_)));
        let signer = keys.address(0).unwrap();
        assert!(keys.sign_transaction(signer, &tx).is_ok());
    }
}
