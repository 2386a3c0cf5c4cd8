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

use ethers::contract::ContractError;
use ethers::providers::{Http, Middleware, Provider, RetryClient};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockId, BlockNumber, Bytes, Filter, TransactionRequest, H256,
    U256,
};
use mtx_relayer_config::RelayerConfig;
use mtx_relayer_types::BlockInfo;
use mtx_relayer_utils::{Error, Result};

use crate::contracts::{self, RelayHubContract, StakeManagerContract};
use crate::ethers_retry_policy::LedgerHttpRetryPolicy;
use crate::interactor::{
    ContractInteractor, LedgerEvent, LedgerTransaction, StakeInfo,
};

/// Ethereum client using Ethers, that includes a retry strategy.
pub type EthersClient = Provider<RetryClient<Http>>;

const MAX_RPC_RETRIES: u32 = 10;
const INITIAL_BACKOFF_MS: u64 = 1_000;

fn contract_error<M: Middleware>(e: ContractError<M>) -> Error {
    Error::ContractCall(e.to_string())
}

/// [`ContractInteractor`] over a JSON-RPC HTTP endpoint.
#[derive(Debug, Clone)]
pub struct EthersContractInteractor {
    provider: Arc<EthersClient>,
    relay_hub: RelayHubContract<EthersClient>,
    stake_manager: StakeManagerContract<EthersClient>,
}

impl EthersContractInteractor {
    /// Connects to the ledger endpoint of `config`, resolving the
    /// StakeManager from the hub when it is not configured.
    #[tracing::instrument(skip_all, fields(endpoint = %config.ledger.http_endpoint))]
    pub async fn connect(config: &RelayerConfig) -> Result<Self> {
        let http = Http::new(config.ledger.http_endpoint.as_url().clone());
        let client = RetryClient::new(
            http,
            LedgerHttpRetryPolicy::boxed(),
            MAX_RPC_RETRIES,
            INITIAL_BACKOFF_MS,
        );
        let provider = Arc::new(
            Provider::new(client).interval(Duration::from_millis(500)),
        );
        let relay_hub =
            RelayHubContract::new(config.relay_hub_address, provider.clone());
        let stake_manager_address = match config.stake_manager_address {
            Some(address) => address,
            None => relay_hub
                .get_stake_manager()
                .call()
                .await
                .map_err(contract_error)?,
        };
        let stake_manager =
            StakeManagerContract::new(stake_manager_address, provider.clone());
        let this = Self {
            provider,
            relay_hub,
            stake_manager,
        };
        if let Some(expected) = config.ledger.chain_id {
            let actual = this.chain_id().await?;
            if actual != expected {
                return Err(Error::InvalidConfig(format!(
                    "ledger chain id is {actual}, expected {expected}"
                )));
            }
        }
        tracing::debug!(
            hub = ?config.relay_hub_address,
            stake_manager = ?stake_manager_address,
            "Connected to the ledger"
        );
        Ok(this)
    }

    /// The underlying provider.
    pub fn provider(&self) -> Arc<EthersClient> {
        self.provider.clone()
    }
}

#[async_trait::async_trait]
impl ContractInteractor for EthersContractInteractor {
    fn relay_hub_address(&self) -> Address {
        self.relay_hub.address()
    }

    fn stake_manager_address(&self) -> Address {
        self.stake_manager.address()
    }

    async fn chain_id(&self) -> Result<u64> {
        let chain_id = self.provider.get_chainid().await?;
        Ok(chain_id.as_u64())
    }

    async fn get_block_number(&self) -> Result<u64> {
        let number = self.provider.get_block_number().await?;
        Ok(number.as_u64())
    }

    async fn get_block(&self, number: u64) -> Result<BlockInfo> {
        let block = self
            .provider
            .get_block(number)
            .await?
            .ok_or(Error::BlockNotFound(number))?;
        Ok(BlockInfo::new(
            number,
            block.hash.unwrap_or_default(),
            block.timestamp.as_u64(),
        ))
    }

    async fn get_balance(&self, address: Address) -> Result<U256> {
        let balance = self.provider.get_balance(address, None).await?;
        Ok(balance)
    }

    async fn get_transaction_count(
        &self,
        address: Address,
        block: BlockNumber,
    ) -> Result<u64> {
        let count = self
            .provider
            .get_transaction_count(address, Some(BlockId::Number(block)))
            .await?;
        Ok(count.as_u64())
    }

    async fn get_transaction(
        &self,
        hash: H256,
    ) -> Result<Option<LedgerTransaction>> {
        let tx = self.provider.get_transaction(hash).await?;
        Ok(tx.map(|tx| LedgerTransaction {
            hash,
            block_number: tx.block_number.map(|n| n.as_u64()),
        }))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256> {
        match self.provider.send_raw_transaction(raw.clone()).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) if mtx_relayer_utils::is_nonce_too_low_message(&e.to_string()) => {
                Err(nonce_too_low(&raw).unwrap_or_else(|| e.into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_gas_price(&self) -> Result<U256> {
        let price = self.provider.get_gas_price().await?;
        Ok(price)
    }

    async fn estimate_gas(
        &self,
        from: Address,
        to: Address,
        value: U256,
        data: &Bytes,
    ) -> Result<U256> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(to)
            .value(value)
            .data(data.clone())
            .into();
        let gas = self.provider.estimate_gas(&tx, None).await?;
        Ok(gas)
    }

    #[tracing::instrument(skip(self))]
    async fn get_past_events(
        &self,
        relay_manager: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<LedgerEvent>> {
        let filter = Filter::new()
            .address(vec![self.relay_hub.address(), self.stake_manager.address()])
            .from_block(from_block)
            .to_block(to_block)
            .topic1(H256::from(relay_manager));
        let logs = self.provider.get_logs(&filter).await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if let Some(event) = contracts::decode_log(log)? {
                events.push(event);
            }
        }
        events.sort_by_key(|e| (e.block_number, e.log_index));
        tracing::trace!("Fetched {} events", events.len());
        Ok(events)
    }

    async fn get_stake_info(&self, relay_manager: Address) -> Result<StakeInfo> {
        let (stake, unstake_delay, withdraw_time, token, owner) = self
            .stake_manager
            .get_stake_info(relay_manager)
            .call()
            .await
            .map_err(contract_error)?;
        Ok(StakeInfo {
            stake,
            unstake_delay,
            withdraw_time,
            token,
            owner,
        })
    }

    async fn get_minimum_stake_per_token(
        &self,
        token: Address,
    ) -> Result<U256> {
        self.relay_hub
            .get_minimum_stake_per_token(token)
            .call()
            .await
            .map_err(contract_error)
    }

    async fn get_minimum_unstake_delay(&self) -> Result<U256> {
        self.relay_hub
            .get_minimum_unstake_delay()
            .call()
            .await
            .map_err(contract_error)
    }

    async fn relay_hub_balance_of(&self, address: Address) -> Result<U256> {
        self.relay_hub
            .balance_of(address)
            .call()
            .await
            .map_err(contract_error)
    }

    async fn worker_to_manager(&self, worker: Address) -> Result<Address> {
        self.relay_hub
            .worker_to_manager(worker)
            .call()
            .await
            .map_err(contract_error)
    }
}

/// Recovers the signer and nonce of a rejected raw transaction.
fn nonce_too_low(raw: &Bytes) -> Option<Error> {
    let rlp = ethers::utils::rlp::Rlp::new(raw.as_ref());
    let (tx, signature) = TypedTransaction::decode_signed(&rlp).ok()?;
    let signer = signature.recover(tx.sighash()).ok()?;
    let nonce = tx.nonce()?.as_u64();
    Some(Error::NonceTooLow { signer, nonce })
}
