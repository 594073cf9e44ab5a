//! Request/response chain access over an ordered endpoint pool.
//!
//! Each call walks the pool starting at the endpoint that last succeeded,
//! moving on after a 10 s timeout, an explicit error, or a 503. The pool
//! remembers the working endpoint so healthy traffic does not pay for dead
//! ones.

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, TransactionReceipt};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::OnceCell;
use tracing::instrument;
use url::Url;

use super::{ChainError, ERC20, RPC_TIMEOUT};
use crate::types::{TransferEvent, TxHash};

/// Failover pool over the configured JSON-RPC endpoints.
#[derive(Debug)]
pub struct RpcPool {
    endpoints: Vec<Url>,
    /// Index of the endpoint that served the last successful call.
    active: AtomicUsize,
    token: Address,
    decimals: OnceCell<u8>,
}

impl RpcPool {
    pub fn new(endpoints: Vec<Url>, token: Address) -> Self {
        Self {
            endpoints,
            active: AtomicUsize::new(0),
            token,
            decimals: OnceCell::new(),
        }
    }

    pub fn token_contract(&self) -> Address {
        self.token
    }

    /// Run `op` against the pool, failing over until an endpoint answers.
    ///
    /// # Errors
    /// [`ChainError::AllEndpointsFailed`] after a full unsuccessful cycle;
    /// the last per-endpoint error is preserved in the message.
    async fn with_provider<T, F, Fut>(&self, op: F) -> Result<T, ChainError>
    where
        F: Fn(DynProvider) -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let start = self.active.load(Ordering::Relaxed);
        let mut last_error: Option<ChainError> = None;
        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let url = &self.endpoints[index];
            let provider = ProviderBuilder::new().connect_http(url.clone()).erased();
            match tokio::time::timeout(RPC_TIMEOUT, op(provider)).await {
                Ok(Ok(value)) => {
                    self.active.store(index, Ordering::Relaxed);
                    return Ok(value);
                }
                Ok(Err(e)) => {
                    tracing::warn!(endpoint = %url, error = %e, "rpc endpoint failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    tracing::warn!(endpoint = %url, "rpc endpoint timed out");
                    last_error = Some(ChainError::Rpc(format!("timeout after {RPC_TIMEOUT:?}")));
                }
            }
        }
        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no endpoints configured".to_string());
        Err(ChainError::AllEndpointsFailed(detail))
    }

    #[instrument(skip_all, err)]
    pub async fn get_block_number(&self) -> Result<u64, ChainError> {
        self.with_provider(|provider| async move {
            provider
                .get_block_number()
                .await
                .map_err(ChainError::from_display)
        })
        .await
    }

    #[instrument(skip_all, err, fields(tx = %hash))]
    pub async fn get_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>, ChainError> {
        let hash: B256 = hash.into();
        self.with_provider(|provider| async move {
            provider
                .get_transaction_receipt(hash)
                .await
                .map_err(ChainError::from_display)
        })
        .await
    }

    /// Timestamp of block `number`, when the block is available.
    #[instrument(skip_all, err)]
    pub async fn get_block_timestamp(
        &self,
        number: u64,
    ) -> Result<Option<DateTime<Utc>>, ChainError> {
        let block = self
            .with_provider(|provider| async move {
                provider
                    .get_block_by_number(number.into())
                    .await
                    .map_err(ChainError::from_display)
            })
            .await?;
        Ok(block
            .and_then(|b| i64::try_from(b.header.timestamp).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0)))
    }

    #[instrument(skip_all, err, fields(address = %address))]
    pub async fn token_balance_of(&self, address: Address) -> Result<U256, ChainError> {
        let token = self.token;
        self.with_provider(|provider| async move {
            ERC20::new(token, provider)
                .balanceOf(address)
                .call()
                .await
                .map_err(ChainError::from_display)
        })
        .await
    }

    #[instrument(skip_all, err, fields(address = %address))]
    pub async fn native_balance_of(&self, address: Address) -> Result<U256, ChainError> {
        self.with_provider(|provider| async move {
            provider
                .get_balance(address)
                .await
                .map_err(ChainError::from_display)
        })
        .await
    }

    /// The token's `decimals()`, fetched once and cached for process life.
    pub async fn token_decimals(&self) -> Result<u8, ChainError> {
        self.decimals
            .get_or_try_init(|| async {
                let token = self.token;
                self.with_provider(|provider| async move {
                    ERC20::new(token, provider)
                        .decimals()
                        .call()
                        .await
                        .map_err(ChainError::from_display)
                })
                .await
            })
            .await
            .map(|d| *d)
    }

    /// Broadcast a token transfer signed by `signer` and return its hash.
    ///
    /// Does not wait for inclusion; confirmation is the caller's loop.
    #[instrument(skip_all, err, fields(to = %to, value = %value))]
    pub async fn transfer_token(
        &self,
        signer: PrivateKeySigner,
        to: Address,
        value: U256,
        gas_price: u128,
        gas_limit: u64,
    ) -> Result<TxHash, ChainError> {
        let token = self.token;
        let start = self.active.load(Ordering::Relaxed);
        let mut last_error: Option<ChainError> = None;
        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let url = &self.endpoints[index];
            let wallet = EthereumWallet::from(signer.clone());
            let provider = ProviderBuilder::new()
                .wallet(wallet)
                .connect_http(url.clone());
            let send = async {
                let pending = ERC20::new(token, &provider)
                    .transfer(to, value)
                    .gas_price(gas_price)
                    .gas(gas_limit)
                    .send()
                    .await
                    .map_err(ChainError::from_display)?;
                Ok::<TxHash, ChainError>(TxHash::from(*pending.tx_hash()))
            };
            match tokio::time::timeout(RPC_TIMEOUT, send).await {
                Ok(Ok(hash)) => {
                    self.active.store(index, Ordering::Relaxed);
                    return Ok(hash);
                }
                Ok(Err(e)) => {
                    tracing::warn!(endpoint = %url, error = %e, "transfer broadcast failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    last_error = Some(ChainError::Rpc(format!("timeout after {RPC_TIMEOUT:?}")));
                }
            }
        }
        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no endpoints configured".to_string());
        Err(ChainError::AllEndpointsFailed(detail))
    }

    /// Token `Transfer` logs in `[from_block, to_block]`, decoded.
    ///
    /// Used by the polling fallback; undecodable logs are skipped.
    #[instrument(skip_all, err)]
    pub async fn transfer_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, ChainError> {
        let token = self.token;
        let logs = self
            .with_provider(|provider| async move {
                let filter = Filter::new()
                    .address(token)
                    .event_signature(ERC20::Transfer::SIGNATURE_HASH)
                    .from_block(from_block)
                    .to_block(to_block);
                provider
                    .get_logs(&filter)
                    .await
                    .map_err(ChainError::from_display)
            })
            .await?;
        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            let Some(tx_hash) = log.transaction_hash else {
                continue;
            };
            match log.log_decode::<ERC20::Transfer>() {
                Ok(decoded) => events.push(TransferEvent {
                    tx_hash: TxHash::from(tx_hash),
                    from: decoded.inner.data.from,
                    to: decoded.inner.data.to,
                    value: decoded.inner.data.value,
                    block_number: log.block_number,
                }),
                Err(e) => {
                    tracing::debug!(tx = %tx_hash, error = %e, "skipping undecodable transfer log");
                }
            }
        }
        Ok(events)
    }
}
