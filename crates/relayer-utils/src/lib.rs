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

//! # Relayer Utils Module 🕸️
//!
//! Shared error taxonomy, logging probes and retry helpers used across the
//! meta-transaction relayer crates.

use ethers::types::Address;

/// A module used for debugging relayer lifecycle, sync state, or other relayer state.
pub mod probe;
/// Retry functionality
pub mod retry;

/// An enum of all possible errors that could be encountered during the execution of the
/// relayer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An Io error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// JSON Error occurred.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// Config loading error.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    /// Error while iterating over a glob pattern.
    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),
    /// Error from Glob Iterator.
    #[error(transparent)]
    Glob(#[from] glob::GlobError),
    /// Error while parsing a URL.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Error in Http Provider (ethers client).
    #[error(transparent)]
    EthersProvider(#[from] ethers::providers::ProviderError),
    /// Ether wallet errors.
    #[error(transparent)]
    EtherWalletError(#[from] ethers::signers::WalletError),
    /// Elliptic Curve error.
    #[error(transparent)]
    EllipticCurve(#[from] ethers::core::k256::elliptic_curve::Error),
    /// Sled database error.
    #[error(transparent)]
    Sled(#[from] sled::Error),
    /// Error while parsing the config files.
    #[error("Config parse error: {}", _0)]
    ParseConfig(#[from] serde_path_to_error::Error<config::ConfigError>),
    /// Generic error.
    #[error("{}", _0)]
    Generic(&'static str),
    /// A ledger call failed, with the reason reported by the node.
    #[error("Ledger error: {}", _0)]
    Ledger(String),
    /// Smart contract call error.
    #[error("Contract call error: {}", _0)]
    ContractCall(String),
    /// The configuration is internally inconsistent.
    #[error("Invalid configuration: {}", _0)]
    InvalidConfig(String),
    /// The requested signer is not held by any of the key managers.
    #[error("Unknown signer: {:?}", _0)]
    UnknownSigner(Address),
    /// Producing a signature failed.
    #[error("Signing failed: {}", _0)]
    Signing(String),
    /// A send attempt failed; the reserved nonce was rolled back.
    #[error("Send transaction failed: {}", reason)]
    SendTransactionFailed {
        /// Human readable reason of the failure.
        reason: String,
    },
    /// The ledger already progressed past this nonce.
    #[error("Nonce too low for signer {:?}: {}", signer, nonce)]
    NonceTooLow {
        /// The signer of the transaction.
        signer: Address,
        /// The rejected nonce.
        nonce: u64,
    },
    /// A live record for this (signer, nonce) already exists in the store.
    #[error("Duplicate transaction for signer {:?} with nonce {}", signer, nonce)]
    DuplicateNonce {
        /// The signer of the transaction.
        signer: Address,
        /// The duplicated nonce.
        nonce: u64,
    },
    /// No stored transaction exists for this (signer, nonce).
    #[error("Transaction not found for signer {:?} with nonce {}", signer, nonce)]
    TransactionNotFound {
        /// The signer of the transaction.
        signer: Address,
        /// The missing nonce.
        nonce: u64,
    },
    /// The network gas price exceeds the configured ceiling.
    #[error("Network gas price {} is higher than configured max gas price {}", network, max)]
    GasPriceTooHigh {
        /// The gas price reported by the network (after factor).
        network: ethers::types::U256,
        /// The configured ceiling.
        max: ethers::types::U256,
    },
    /// A component was used before `init` was called.
    #[error("Component is not initialized")]
    NotInitialized,
    /// The worker was asked to process a block it has already processed.
    #[error("Attempt to scan older block {}, last scanned is {}", block, last_scanned)]
    StaleBlock {
        /// The block handed to the worker.
        block: u64,
        /// The last block the worker processed.
        last_scanned: u64,
    },
    /// Block not found on the ledger.
    #[error("Block not found: {}", _0)]
    BlockNotFound(u64),
}

impl Error {
    /// Returns `true` if the ledger reported that the nonce was already used.
    pub fn is_nonce_too_low(&self) -> bool {
        match self {
            Self::NonceTooLow { .. } => true,
            Self::Ledger(reason) => is_nonce_too_low_message(reason),
            Self::EthersProvider(e) => is_nonce_too_low_message(&e.to_string()),
            _ => false,
        }
    }
}

/// Checks a raw node error message for the "nonce already used" family of
/// responses returned by common EVM clients.
pub fn is_nonce_too_low_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("nonce too low")
        || message.contains("already known")
        || message.contains("nonce has already been used")
}

/// A type alias for the result for the relayer, that uses the `Error` enum.
pub type Result<T> = std::result::Result<T, Error>;
