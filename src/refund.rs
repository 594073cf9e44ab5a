//! Refunds: overpayment excess, post-expiry returns, and operator-initiated
//! refunds.
//!
//! A refund is a `refund`-kind transaction row targeting the original
//! sender. [`schedule_refund`] creates the row, announces `refund-initiated`,
//! and enqueues a broadcast task; the engine consumes `refund.process`,
//! signs with the source address's stored key, submits the transfer, and
//! hands the new hash to the confirmation loop, which later announces
//! `refund-completed` or `refund-failed`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::chain::{ChainError, RpcPool};
use crate::queue::{
    ConfirmationCheckTask, HandlerError, PublishOptions, QueueHandler, QueueName, QueueService,
    RefundTask,
};
use crate::store::{NewTransaction, Store, StoreError};
use crate::types::{
    AuditAction, TokenQuantity, Transaction, TransactionKind, TransactionStatus, WebhookEvent,
    parse_evm_address,
};
use crate::util::backoff;
use crate::vault::{KeyVault, VaultError};
use crate::webhook::WebhookDispatcher;

/// Gas price boost applied to every emitted transfer: base × 1.2.
pub(crate) fn boosted_gas_price(base: u128) -> u128 {
    base.saturating_add(base / 5)
}

#[derive(Debug, thiserror::Error)]
pub enum RefundError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error("can not enqueue refund work: {0}")]
    Enqueue(#[from] crate::queue::QueueError),
    #[error("refund rejected: {0}")]
    Rejected(String),
}

/// Create the refund row, announce it, and enqueue the broadcast.
///
/// `original` is the inbound payment being (partially) returned; the refund
/// flows from the deposit address back to the payment's sender.
#[instrument(skip_all, err, fields(original = %original.id, amount = %amount))]
pub async fn schedule_refund(
    store: &Store,
    queue: &QueueService,
    webhooks: &WebhookDispatcher,
    original: &Transaction,
    amount: Decimal,
    reason: &str,
    actor: &str,
) -> Result<Transaction, RefundError> {
    let Some(sender) = original.from_address.clone() else {
        return Err(RefundError::Rejected(
            "original payment has no sender address".to_string(),
        ));
    };
    if amount <= Decimal::ZERO || amount > original.amount {
        return Err(RefundError::Rejected(format!(
            "refund amount {amount} outside (0, {}]",
            original.amount
        )));
    }
    let refund = store
        .insert_transaction(
            NewTransaction {
                tx_hash: None,
                kind: TransactionKind::Refund,
                status: TransactionStatus::Pending,
                currency: original.currency.clone(),
                amount,
                // Tokens flow back out of the deposit address.
                from_address: Some(original.to_address.clone()),
                to_address: sender,
                confirmations: 0,
                block_number: None,
                block_hash: None,
                block_timestamp: None,
                payment_address_id: original.payment_address_id,
                merchant_id: original.merchant_id,
                fee_amount: Decimal::ZERO,
                metadata: Some(serde_json::json!({
                    "originalTransactionId": original.id,
                    "reason": reason,
                })),
            },
            AuditAction::RefundInitiated,
            actor,
        )
        .await?;
    queue
        .publish(
            QueueName::RefundProcess,
            &RefundTask {
                transaction_id: refund.id,
            },
            PublishOptions::default(),
        )
        .await?;
    if let Some(merchant_id) = refund.merchant_id {
        let fields = serde_json::json!({
            "transactionId": refund.id,
            "originalTransactionId": original.id,
            "amount": refund.amount.to_string(),
            "currency": refund.currency,
            "reason": reason,
        });
        if let Err(e) = webhooks
            .emit(merchant_id, WebhookEvent::RefundInitiated, fields)
            .await
        {
            tracing::warn!(error = %e, "can not emit refund-initiated");
        }
    }
    Ok(refund)
}

/// Consumer of `refund.process`: broadcasts pending refund rows.
pub struct RefundEngine {
    store: Store,
    chain: Arc<RpcPool>,
    queue: QueueService,
    vault: Arc<KeyVault>,
    gas_price: u128,
    gas_limit: u64,
}

impl RefundEngine {
    pub fn new(
        store: Store,
        chain: Arc<RpcPool>,
        queue: QueueService,
        vault: Arc<KeyVault>,
        gas_price: u128,
        gas_limit: u64,
    ) -> Self {
        Self {
            store,
            chain,
            queue,
            vault,
            gas_price,
            gas_limit,
        }
    }

    /// Operator-initiated refund of a received payment.
    ///
    /// Defaults to the full amount and the original sender when the caller
    /// does not narrow them.
    #[instrument(skip_all, err, fields(transaction = %transaction_id))]
    pub async fn initiate_manual(
        &self,
        webhooks: &WebhookDispatcher,
        transaction_id: Uuid,
        amount: Option<Decimal>,
        refund_address: Option<String>,
        reason: &str,
        actor: &str,
    ) -> Result<Transaction, RefundError> {
        let original = self
            .store
            .transaction_by_id(transaction_id)
            .await?
            .ok_or_else(|| RefundError::Rejected("unknown transaction".to_string()))?;
        if original.kind != TransactionKind::Payment {
            return Err(RefundError::Rejected(
                "only inbound payments are refundable".to_string(),
            ));
        }
        if !matches!(
            original.status,
            TransactionStatus::Confirmed
                | TransactionStatus::Settled
                | TransactionStatus::Underpaid
                | TransactionStatus::Expired
        ) {
            return Err(RefundError::Rejected(format!(
                "transaction in status {} is not refundable",
                original.status
            )));
        }
        let mut original = original;
        if let Some(addr) = refund_address {
            parse_evm_address(&addr)
                .map_err(|e| RefundError::Rejected(e.to_string()))?;
            original.from_address = Some(addr);
        }
        let amount = amount.unwrap_or(original.amount);
        schedule_refund(
            &self.store,
            &self.queue,
            webhooks,
            &original,
            amount,
            reason,
            actor,
        )
        .await
    }

    async fn process(&self, task: RefundTask) -> Result<(), RefundError> {
        let Some(refund) = self.store.transaction_by_id(task.transaction_id).await? else {
            return Err(RefundError::Rejected(format!(
                "refund row {} does not exist",
                task.transaction_id
            )));
        };
        if refund.status != TransactionStatus::Pending {
            // Already broadcast or terminal; nothing to do.
            return Ok(());
        }
        if refund.tx_hash.is_some() {
            self.enqueue_check(refund.id).await;
            return Ok(());
        }
        let source = self
            .store
            .address_by_value(refund.from_address.as_deref().unwrap_or_default())
            .await?
            .ok_or_else(|| {
                RefundError::Rejected("refund source address is not managed here".to_string())
            })?;
        let signer = self.vault.signer_from_encrypted(&source.encrypted_key)?;
        let to = parse_evm_address(&refund.to_address)
            .map_err(|e| RefundError::Rejected(e.to_string()))?;
        let decimals = self.chain.token_decimals().await?;
        let value = TokenQuantity::new(decimals)
            .to_atomic(refund.amount)
            .map_err(|e| RefundError::Rejected(e.to_string()))?;
        let hash = self
            .chain
            .transfer_token(
                signer,
                to,
                value,
                boosted_gas_price(self.gas_price),
                self.gas_limit,
            )
            .await?;
        self.store
            .set_transaction_hash(refund.id, &hash.to_string())
            .await?;
        tracing::info!(refund = %refund.id, tx = %hash, "refund broadcast");
        self.enqueue_check(refund.id).await;
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
            tracing::error!(error = %e, "can not enqueue refund confirmation check");
        }
    }
}

#[async_trait]
impl QueueHandler for RefundEngine {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), HandlerError> {
        let task: RefundTask = serde_json::from_value(payload)
            .map_err(|e| HandlerError::Fatal(format!("undecodable refund task: {e}")))?;
        match self.process(task).await {
            Ok(()) => Ok(()),
            // Duplicate work resolves as success.
            Err(RefundError::Store(StoreError::Conflict(detail))) => {
                tracing::debug!(%detail, "refund already recorded");
                Ok(())
            }
            Err(RefundError::Store(inner)) => Err(HandlerError::Retriable(inner.to_string())),
            Err(RefundError::Chain(inner)) => Err(HandlerError::Retriable(inner.to_string())),
            Err(RefundError::Enqueue(inner)) => Err(HandlerError::Retriable(inner.to_string())),
            Err(RefundError::Vault(inner)) => Err(HandlerError::Fatal(inner.to_string())),
            Err(RefundError::Rejected(detail)) => Err(HandlerError::Fatal(detail)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_price_boost_is_twenty_percent() {
        assert_eq!(boosted_gas_price(5_000_000_000), 6_000_000_000);
        assert_eq!(boosted_gas_price(10), 12);
        assert_eq!(boosted_gas_price(0), 0);
        // Saturates instead of overflowing.
        assert_eq!(boosted_gas_price(u128::MAX), u128::MAX);
    }
}
