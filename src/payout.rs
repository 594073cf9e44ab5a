//! Merchant payouts: outbound transfers from a hot wallet to a
//! merchant-nominated address.
//!
//! A payout is initiated as a `payout`-kind transaction row pinned to a hot
//! wallet with sufficient balance, then broadcast by the `payout.process`
//! consumer. Completion and failure notifications come from the
//! confirmation loop, like every other emitted transfer.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::chain::{ChainError, RpcPool};
use crate::queue::{
    ConfirmationCheckTask, HandlerError, PayoutTask, PublishOptions, QueueHandler, QueueName,
    QueueService,
};
use crate::store::{NewTransaction, Store, StoreError};
use crate::types::{
    AuditAction, TokenQuantity, TransactionKind, TransactionStatus, WebhookEvent,
    parse_evm_address,
};
use crate::util::backoff;
use crate::vault::{KeyVault, VaultError};
use crate::webhook::WebhookDispatcher;

const ACTOR: &str = "payout-engine";

#[derive(Debug, thiserror::Error)]
pub enum PayoutError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("can not enqueue payout work: {0}")]
    Enqueue(#[from] crate::queue::QueueError),
    #[error("payout rejected: {0}")]
    Rejected(String),
}

pub struct PayoutEngine {
    store: Store,
    chain: Arc<RpcPool>,
    queue: QueueService,
    vault: Arc<KeyVault>,
    webhooks: WebhookDispatcher,
    gas_price: u128,
    gas_limit: u64,
    currency: String,
}

impl PayoutEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        chain: Arc<RpcPool>,
        queue: QueueService,
        vault: Arc<KeyVault>,
        webhooks: WebhookDispatcher,
        gas_price: u128,
        gas_limit: u64,
        currency: String,
    ) -> Self {
        Self {
            store,
            chain,
            queue,
            vault,
            webhooks,
            gas_price,
            gas_limit,
            currency,
        }
    }

    /// Record a payout and queue its broadcast. Picks the first active hot
    /// wallet whose live balance covers the amount.
    #[instrument(skip_all, err, fields(merchant = %merchant_id, amount = %amount))]
    pub async fn initiate(
        &self,
        merchant_id: Uuid,
        destination: &str,
        amount: Decimal,
    ) -> Result<Uuid, PayoutError> {
        parse_evm_address(destination).map_err(|e| PayoutError::Rejected(e.to_string()))?;
        if amount <= Decimal::ZERO {
            return Err(PayoutError::Rejected("amount must be positive".to_string()));
        }
        let decimals = self.chain.token_decimals().await?;
        let needed = TokenQuantity::new(decimals)
            .to_atomic(amount)
            .map_err(|e| PayoutError::Rejected(e.to_string()))?;
        let mut source = None;
        for wallet in self.store.active_hot_wallets().await? {
            let addr = parse_evm_address(&wallet.address)
                .map_err(|e| PayoutError::Rejected(e.to_string()))?;
            if self.chain.token_balance_of(addr).await? >= needed {
                source = Some(wallet);
                break;
            }
        }
        let Some(source) = source else {
            return Err(PayoutError::Rejected(
                "no hot wallet can cover the payout".to_string(),
            ));
        };
        let row = self
            .store
            .insert_transaction(
                NewTransaction {
                    tx_hash: None,
                    kind: TransactionKind::Payout,
                    status: TransactionStatus::Pending,
                    currency: self.currency.clone(),
                    amount,
                    from_address: Some(source.address.clone()),
                    to_address: destination.to_string(),
                    confirmations: 0,
                    block_number: None,
                    block_hash: None,
                    block_timestamp: None,
                    payment_address_id: Some(source.id),
                    merchant_id: Some(merchant_id),
                    fee_amount: Decimal::ZERO,
                    metadata: None,
                },
                AuditAction::PayoutInitiated,
                ACTOR,
            )
            .await?;
        self.queue
            .publish(
                QueueName::PayoutProcess,
                &PayoutTask {
                    transaction_id: row.id,
                },
                PublishOptions::default(),
            )
            .await?;
        Ok(row.id)
    }

    async fn process(&self, task: PayoutTask) -> Result<(), PayoutError> {
        let Some(payout) = self.store.transaction_by_id(task.transaction_id).await? else {
            return Err(PayoutError::Rejected(format!(
                "payout row {} does not exist",
                task.transaction_id
            )));
        };
        if payout.status != TransactionStatus::Pending || payout.tx_hash.is_some() {
            if !payout.status.is_terminal() && payout.tx_hash.is_some() {
                self.enqueue_check(payout.id).await;
            }
            return Ok(());
        }
        let Some(source_value) = payout.from_address.clone() else {
            return Err(PayoutError::Rejected("payout has no source wallet".to_string()));
        };
        let Some(source) = self.store.address_by_value(&source_value).await? else {
            return Err(PayoutError::Rejected(
                "payout source wallet is not managed here".to_string(),
            ));
        };
        let signer = self.vault.signer_from_encrypted(&source.encrypted_key)?;
        let to = parse_evm_address(&payout.to_address)
            .map_err(|e| PayoutError::Rejected(e.to_string()))?;
        let decimals = self.chain.token_decimals().await?;
        let value = TokenQuantity::new(decimals)
            .to_atomic(payout.amount)
            .map_err(|e| PayoutError::Rejected(e.to_string()))?;
        let hash = self
            .chain
            .transfer_token(
                signer,
                to,
                value,
                crate::refund::boosted_gas_price(self.gas_price),
                self.gas_limit,
            )
            .await?;
        self.store
            .set_transaction_hash(payout.id, &hash.to_string())
            .await?;
        tracing::info!(payout = %payout.id, tx = %hash, "payout broadcast");
        if let Some(merchant_id) = payout.merchant_id {
            let fields = serde_json::json!({
                "transactionId": payout.id,
                "txHash": hash.to_string(),
                "amount": payout.amount.to_string(),
                "currency": payout.currency,
            });
            if let Err(e) = self
                .webhooks
                .emit(merchant_id, WebhookEvent::PayoutProcessing, fields)
                .await
            {
                tracing::warn!(error = %e, "can not emit payout-processing");
            }
        }
        self.enqueue_check(payout.id).await;
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
            tracing::error!(error = %e, "can not enqueue payout confirmation check");
        }
    }
}

#[async_trait]
impl QueueHandler for PayoutEngine {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), HandlerError> {
        let task: PayoutTask = serde_json::from_value(payload)
            .map_err(|e| HandlerError::Fatal(format!("undecodable payout task: {e}")))?;
        match self.process(task).await {
            Ok(()) => Ok(()),
            Err(PayoutError::Rejected(detail)) => Err(HandlerError::Fatal(detail)),
            Err(PayoutError::Vault(inner)) => Err(HandlerError::Fatal(inner.to_string())),
            Err(e) => Err(HandlerError::Retriable(e.to_string())),
        }
    }
}
