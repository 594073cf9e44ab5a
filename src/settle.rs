//! Settlement: sweeping confirmed payments into hot wallets and moving hot
//! balances above threshold into cold storage.
//!
//! The sweeper consumes `settlement.process` (and is also nudged by the
//! confirmation engine after every confirmed payment). Each confirmed,
//! unswept payment is settled by transferring the deposit address's **full
//! live token balance** — dust that arrived after confirmation rides along —
//! to a hot wallet. The sweep is recorded first as a `settlement-transfer`
//! row, then broadcast; its confirmation completes through the standard
//! check loop, which marks the carried payments `settled` and announces
//! `transaction-settled` / `settlement-completed`.
//!
//! Hot→cold runs on its own cadence: any active hot wallet whose token
//! balance exceeds the threshold and whose native balance still covers gas
//! sends its full token balance to the configured cold address.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;
use tracing_core::Level;
use uuid::Uuid;

use crate::address::{AddressError, AddressService};
use crate::chain::{ChainError, RpcPool};
use crate::queue::{
    ConfirmationCheckTask, HandlerError, PublishOptions, QueueHandler, QueueName, QueueService,
    SettlementTask,
};
use crate::refund::boosted_gas_price;
use crate::store::{NewTransaction, Store, StoreError};
use crate::types::{
    AuditAction, PaymentAddress, TokenQuantity, Transaction, TransactionKind, TransactionStatus,
    parse_evm_address,
};
use crate::util::backoff;
use crate::vault::{KeyVault, VaultError};

const ACTOR: &str = "settlement-engine";

#[derive(Debug, thiserror::Error)]
pub enum SettleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Address(#[from] AddressError),
    #[error("can not enqueue settlement work: {0}")]
    Enqueue(#[from] crate::queue::QueueError),
    #[error("unprocessable settlement: {0}")]
    Unprocessable(String),
}

pub struct SettlementEngine {
    store: Store,
    chain: Arc<RpcPool>,
    queue: QueueService,
    vault: Arc<KeyVault>,
    addresses: Arc<AddressService>,
    gas_price: u128,
    gas_limit: u64,
    hot_threshold: Decimal,
    cold_address: Option<Address>,
    gas_reserve: U256,
}

impl SettlementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        chain: Arc<RpcPool>,
        queue: QueueService,
        vault: Arc<KeyVault>,
        addresses: Arc<AddressService>,
        gas_price: u128,
        gas_limit: u64,
        hot_threshold: Decimal,
        cold_address: Option<Address>,
        gas_reserve: U256,
    ) -> Self {
        Self {
            store,
            chain,
            queue,
            vault,
            addresses,
            gas_price,
            gas_limit,
            hot_threshold,
            cold_address,
            gas_reserve,
        }
    }

    /// Sweep confirmed payments, optionally narrowed to one merchant.
    #[instrument(skip_all, err, fields(merchant = ?merchant_id))]
    pub async fn run_sweep(&self, merchant_id: Option<Uuid>) -> Result<(), SettleError> {
        let payments = self.store.confirmed_unsettled_payments().await?;
        let mut by_merchant: BTreeMap<Uuid, Vec<Transaction>> = BTreeMap::new();
        for payment in payments {
            let Some(owner) = payment.merchant_id else {
                // Dust into operational wallets has no one to settle to.
                continue;
            };
            if merchant_id.is_some_and(|m| m != owner) {
                continue;
            }
            by_merchant.entry(owner).or_default().push(payment);
        }
        if by_merchant.is_empty() {
            return Ok(());
        }
        let hot_wallet = self.hot_wallet().await?;
        for (owner, group) in by_merchant {
            tracing::info!(merchant = %owner, payments = group.len(), "sweeping confirmed payments");
            for payment in group {
                if let Err(e) = self.sweep_payment(&payment, &hot_wallet).await {
                    // Keep going; the remaining payments should not starve
                    // behind one bad address.
                    tracing::warn!(payment = %payment.id, error = %e, "sweep failed; will retry");
                }
            }
        }
        Ok(())
    }

    /// The hot wallet sweeps target: the first active one, provisioned on
    /// first use.
    async fn hot_wallet(&self) -> Result<PaymentAddress, SettleError> {
        if let Some(wallet) = self.store.active_hot_wallets().await?.into_iter().next() {
            return Ok(wallet);
        }
        tracing::info!("no hot wallet yet; provisioning one");
        Ok(self.addresses.issue_hot_wallet().await?)
    }

    /// Sweep one payment's deposit address into the hot wallet.
    async fn sweep_payment(
        &self,
        payment: &Transaction,
        hot_wallet: &PaymentAddress,
    ) -> Result<(), SettleError> {
        if payment.settlement_tx_hash.is_some() {
            return Ok(());
        }
        if self.store.sweep_in_flight(payment.id).await? {
            tracing::debug!(payment = %payment.id, "sweep already in flight");
            return Ok(());
        }
        let Some(address_id) = payment.payment_address_id else {
            return Err(SettleError::Unprocessable(
                "payment has no deposit address".to_string(),
            ));
        };
        let Some(deposit) = self.store.address_by_id(address_id).await? else {
            return Err(SettleError::Unprocessable(
                "deposit address row disappeared".to_string(),
            ));
        };
        let deposit_addr = parse_evm_address(&deposit.address)
            .map_err(|e| SettleError::Unprocessable(e.to_string()))?;
        // Always sweep the live balance; it may exceed the recorded amount.
        let balance = self.chain.token_balance_of(deposit_addr).await?;
        if balance.is_zero() {
            tracing::debug!(payment = %payment.id, "deposit balance already empty");
            return Ok(());
        }
        let decimals = self.chain.token_decimals().await?;
        let amount = TokenQuantity::new(decimals)
            .to_amount(balance)
            .map_err(|e| SettleError::Unprocessable(e.to_string()))?;

        let sweep = self
            .store
            .insert_transaction(
                NewTransaction {
                    tx_hash: None,
                    kind: TransactionKind::SettlementTransfer,
                    status: TransactionStatus::Pending,
                    currency: payment.currency.clone(),
                    amount,
                    from_address: Some(deposit.address.clone()),
                    to_address: hot_wallet.address.clone(),
                    confirmations: 0,
                    block_number: None,
                    block_hash: None,
                    block_timestamp: None,
                    payment_address_id: Some(deposit.id),
                    merchant_id: payment.merchant_id,
                    fee_amount: Decimal::ZERO,
                    metadata: Some(serde_json::json!({ "paymentIds": [payment.id] })),
                },
                AuditAction::SettlementStarted,
                ACTOR,
            )
            .await?;

        let signer = self.vault.signer_from_encrypted(&deposit.encrypted_key)?;
        let hot_addr = parse_evm_address(&hot_wallet.address)
            .map_err(|e| SettleError::Unprocessable(e.to_string()))?;
        let broadcast = self
            .chain
            .transfer_token(
                signer,
                hot_addr,
                balance,
                boosted_gas_price(self.gas_price),
                self.gas_limit,
            )
            .await;
        let hash = match broadcast {
            Ok(hash) => hash,
            Err(e) => {
                // Close the sweep row so the retry creates a clean one.
                self.store
                    .advance_transaction_status(
                        sweep.id,
                        TransactionStatus::Pending,
                        TransactionStatus::Failed,
                        0,
                        AuditAction::TransactionFailed,
                        ACTOR,
                    )
                    .await?;
                return Err(e.into());
            }
        };
        self.store
            .set_transaction_hash(sweep.id, &hash.to_string())
            .await?;
        tracing::event!(Level::INFO,
            status = "ok",
            payment = %payment.id,
            sweep = %sweep.id,
            tx = %hash,
            "sweep broadcast"
        );
        self.enqueue_check(sweep.id).await;
        Ok(())
    }

    /// Move every over-threshold hot wallet balance to cold storage.
    #[instrument(skip_all, err)]
    pub async fn run_hot_to_cold(&self) -> Result<(), SettleError> {
        let Some(cold) = self.cold_address else {
            tracing::debug!("no cold address configured; skipping hot-to-cold run");
            return Ok(());
        };
        let decimals = self.chain.token_decimals().await?;
        let quantity = TokenQuantity::new(decimals);
        for wallet in self.store.active_hot_wallets().await? {
            let wallet_addr = match parse_evm_address(&wallet.address) {
                Ok(addr) => addr,
                Err(e) => {
                    tracing::error!(address = %wallet.address, error = %e, "hot wallet address unparseable");
                    continue;
                }
            };
            let balance = self.chain.token_balance_of(wallet_addr).await?;
            let amount = quantity
                .to_amount(balance)
                .map_err(|e| SettleError::Unprocessable(e.to_string()))?;
            if amount <= self.hot_threshold {
                continue;
            }
            let native = self.chain.native_balance_of(wallet_addr).await?;
            if native < self.gas_reserve {
                let detail = format!(
                    "hot wallet {} below gas reserve ({native} wei)",
                    wallet.address
                );
                tracing::error!("{detail}");
                if let Err(e) = self.store.audit_system_error(&detail, ACTOR).await {
                    tracing::warn!(error = %e, "can not record system error");
                }
                continue;
            }
            let row = self
                .store
                .insert_transaction(
                    NewTransaction {
                        tx_hash: None,
                        kind: TransactionKind::ColdStorageTransfer,
                        status: TransactionStatus::Pending,
                        currency: wallet.currency.clone(),
                        amount,
                        from_address: Some(wallet.address.clone()),
                        to_address: cold.to_string(),
                        confirmations: 0,
                        block_number: None,
                        block_hash: None,
                        block_timestamp: None,
                        payment_address_id: Some(wallet.id),
                        merchant_id: None,
                        fee_amount: Decimal::ZERO,
                        metadata: None,
                    },
                    AuditAction::ColdStorageTransfer,
                    ACTOR,
                )
                .await?;
            let signer = self.vault.signer_from_encrypted(&wallet.encrypted_key)?;
            let broadcast = self
                .chain
                .transfer_token(
                    signer,
                    cold,
                    balance,
                    boosted_gas_price(self.gas_price),
                    self.gas_limit,
                )
                .await;
            let hash = match broadcast {
                Ok(hash) => hash,
                Err(e) => {
                    self.store
                        .advance_transaction_status(
                            row.id,
                            TransactionStatus::Pending,
                            TransactionStatus::Failed,
                            0,
                            AuditAction::TransactionFailed,
                            ACTOR,
                        )
                        .await?;
                    tracing::warn!(wallet = %wallet.address, error = %e, "cold transfer broadcast failed");
                    continue;
                }
            };
            self.store
                .set_transaction_hash(row.id, &hash.to_string())
                .await?;
            tracing::info!(wallet = %wallet.address, amount = %amount, tx = %hash, "cold storage transfer broadcast");
            self.enqueue_check(row.id).await;
        }
        Ok(())
    }

    async fn enqueue_check(&self, transaction_id: Uuid) {
        let task = ConfirmationCheckTask { transaction_id };
        let delay = backoff::confirmation_check_delay(0);
        if let Err(e) = self
            .queue
            .publish(
                QueueName::PaymentMonitor,
                &task,
                PublishOptions::delayed(delay),
            )
            .await
        {
            tracing::error!(error = %e, "can not enqueue settlement confirmation check");
        }
    }
}

#[async_trait]
impl QueueHandler for SettlementEngine {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), HandlerError> {
        let task: SettlementTask = serde_json::from_value(payload)
            .map_err(|e| HandlerError::Fatal(format!("undecodable settlement task: {e}")))?;
        match self.run_sweep(task.merchant_id).await {
            Ok(()) => Ok(()),
            Err(SettleError::Unprocessable(detail)) => Err(HandlerError::Fatal(detail)),
            Err(e) => Err(HandlerError::Retriable(e.to_string())),
        }
    }
}
