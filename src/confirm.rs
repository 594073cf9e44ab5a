//! The confirmation engine: drives every tracked transfer through its state
//! machine.
//!
//! Inbound payments enter via [`ConfirmationEngine::observe`] when a
//! `Transfer` event lands on a managed address; emitted transfers (sweeps,
//! refunds, payouts, cold-storage moves) enter when their broadcasting
//! engine enqueues a confirmation check. The `payment.monitor` consumer
//! re-reads the receipt, advances the machine, and re-enqueues itself on a
//! backoff that thins out as confirmations accumulate.
//!
//! Transitions are compare-and-update against the stored status: a handler
//! that loses the race re-enqueues and the winner's state stands. The only
//! backward edge is `confirming → pending` when a previously observed
//! inclusion disappears (re-org); a second disappearance fails the
//! transaction for good.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

use crate::chain::{ChainError, RpcPool};
use crate::config::PaymentConfig;
use crate::queue::{
    ConfirmationCheckTask, HandlerError, PublishOptions, QueueHandler, QueueName, QueueService,
    SettlementTask,
};
use crate::refund::{RefundError, schedule_refund};
use crate::store::{NewTransaction, Store, StoreError};
use crate::types::{
    AddressStatus, AuditAction, TokenQuantity, Transaction, TransactionKind, TransactionStatus,
    TransferEvent, TxHash, WebhookEvent,
};
use crate::util::backoff;
use crate::webhook::WebhookDispatcher;

const ACTOR: &str = "confirmation-engine";

/// Outcome of comparing a received amount against the expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountVerdict {
    /// Credited. `refund_excess` carries the overpaid portion to return
    /// when the excess exceeds tolerance.
    Accepted { refund_excess: Option<Decimal> },
    /// Short beyond tolerance; the payment ends `underpaid`.
    Underpaid,
}

/// Apply the tolerance policy.
///
/// A shortfall within `under_pct` percent of the expectation counts as
/// exact. An excess within `over_pct` percent is kept silently; past that
/// the payment is still credited and the difference above the expectation
/// is queued for refund.
pub fn judge_amount(
    expected: Decimal,
    received: Decimal,
    under_pct: Decimal,
    over_pct: Decimal,
) -> AmountVerdict {
    let hundred = Decimal::ONE_HUNDRED;
    if received < expected {
        let floor = expected * (hundred - under_pct) / hundred;
        if received >= floor {
            AmountVerdict::Accepted {
                refund_excess: None,
            }
        } else {
            AmountVerdict::Underpaid
        }
    } else {
        let ceiling = expected * (hundred + over_pct) / hundred;
        if received <= ceiling {
            AmountVerdict::Accepted {
                refund_excess: None,
            }
        } else {
            AmountVerdict::Accepted {
                refund_excess: Some(received - expected),
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfirmError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("can not enqueue follow-up work: {0}")]
    Enqueue(#[from] crate::queue::QueueError),
    #[error(transparent)]
    Refund(#[from] RefundError),
    /// The stored status moved underneath this handler; retry re-reads it.
    #[error("transaction {0} changed concurrently")]
    Raced(Uuid),
    /// The referenced row is gone; retrying can not help.
    #[error("transaction {0} does not exist")]
    Missing(Uuid),
    #[error("unprocessable transfer: {0}")]
    Unprocessable(String),
}

impl ConfirmError {
    /// Whether a retry can plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            ConfirmError::Store(_)
            | ConfirmError::Chain(_)
            | ConfirmError::Enqueue(_)
            | ConfirmError::Raced(_) => true,
            ConfirmError::Refund(inner) => !matches!(
                inner,
                RefundError::Rejected(_) | RefundError::Vault(_)
            ),
            ConfirmError::Missing(_) | ConfirmError::Unprocessable(_) => false,
        }
    }
}

pub struct ConfirmationEngine {
    store: Store,
    chain: Arc<RpcPool>,
    queue: QueueService,
    webhooks: WebhookDispatcher,
    confirmations_required: u32,
    payment: PaymentConfig,
}

impl ConfirmationEngine {
    pub fn new(
        store: Store,
        chain: Arc<RpcPool>,
        queue: QueueService,
        webhooks: WebhookDispatcher,
        confirmations_required: u32,
        payment: PaymentConfig,
    ) -> Self {
        Self {
            store,
            chain,
            queue,
            webhooks,
            confirmations_required,
            payment,
        }
    }

    /// Ingest one observed `Transfer`. Safe to call any number of times for
    /// the same event: the tx-hash uniqueness constraint collapses
    /// duplicates.
    #[instrument(skip_all, err, fields(tx = %event.tx_hash, to = %event.to))]
    pub async fn observe(&self, event: &TransferEvent) -> Result<(), ConfirmError> {
        let recipient = event.to.to_string();
        let Some(address) = self.store.address_by_value(&recipient).await? else {
            tracing::trace!("transfer to unmanaged address ignored");
            return Ok(());
        };
        let hash = event.tx_hash.to_string();
        if self.store.transaction_by_hash(&hash).await?.is_some() {
            tracing::debug!("transfer already recorded");
            return Ok(());
        }
        let decimals = self.chain.token_decimals().await?;
        let amount = TokenQuantity::new(decimals)
            .to_amount(event.value)
            .map_err(|e| ConfirmError::Unprocessable(e.to_string()))?;

        let receipt = self.chain.get_receipt(event.tx_hash).await?;
        let block_number = receipt
            .as_ref()
            .and_then(|r| r.block_number)
            .or(event.block_number);
        let block_hash = receipt
            .as_ref()
            .and_then(|r| r.block_hash)
            .map(|h| h.to_string());
        let block_timestamp = match block_number {
            Some(n) => self.chain.get_block_timestamp(n).await.ok().flatten(),
            None => None,
        };

        // The expiry sweep may not have flipped the row yet; the deadline
        // itself decides whether the merchant is credited.
        let overdue = address.status == AddressStatus::Active
            && address
                .expires_at
                .is_some_and(|deadline| chrono::Utc::now() > deadline);
        let status = if overdue {
            AddressStatus::Expired
        } else {
            address.status
        };

        match status {
            AddressStatus::Active | AddressStatus::Used => {
                let new = NewTransaction {
                    tx_hash: Some(hash.clone()),
                    kind: TransactionKind::Payment,
                    status: TransactionStatus::Confirming,
                    currency: address.currency.clone(),
                    amount,
                    from_address: Some(event.from.to_string()),
                    to_address: address.address.clone(),
                    confirmations: 1,
                    block_number: block_number.map(|n| n as i64),
                    block_hash,
                    block_timestamp,
                    payment_address_id: Some(address.id),
                    merchant_id: address.merchant_id,
                    fee_amount: Decimal::ZERO,
                    metadata: None,
                };
                let tx = match self
                    .store
                    .insert_transaction(new, AuditAction::TransactionObserved, "observer")
                    .await
                {
                    Ok(tx) => tx,
                    Err(e) if e.is_conflict() => {
                        tracing::debug!("transfer recorded by a concurrent observation");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                if address.status == AddressStatus::Active
                    && !self.store.mark_address_used(address.id).await?
                {
                    tracing::debug!(address = %address.address, "address already marked used");
                }
                if let Some(merchant_id) = address.merchant_id {
                    let fields = serde_json::json!({
                        "transactionId": tx.id,
                        "addressId": address.id,
                        "address": address.address,
                        "txHash": hash,
                        "amount": amount.to_string(),
                        "currency": tx.currency,
                        "confirmations": 1,
                    });
                    if let Err(e) = self
                        .webhooks
                        .emit(merchant_id, WebhookEvent::PaymentReceived, fields)
                        .await
                    {
                        tracing::warn!(error = %e, "can not emit payment-received");
                    }
                }
                self.enqueue_check(tx.id, 1).await?;
            }
            AddressStatus::Expired => {
                // Late payment: the merchant is never credited; the full
                // amount goes straight back to the sender.
                let new = NewTransaction {
                    tx_hash: Some(hash.clone()),
                    kind: TransactionKind::Payment,
                    status: TransactionStatus::Expired,
                    currency: address.currency.clone(),
                    amount,
                    from_address: Some(event.from.to_string()),
                    to_address: address.address.clone(),
                    confirmations: 0,
                    block_number: block_number.map(|n| n as i64),
                    block_hash,
                    block_timestamp,
                    payment_address_id: Some(address.id),
                    merchant_id: address.merchant_id,
                    fee_amount: Decimal::ZERO,
                    metadata: Some(serde_json::json!({"lateArrival": true})),
                };
                let tx = match self
                    .store
                    .insert_transaction(new, AuditAction::TransactionExpired, "observer")
                    .await
                {
                    Ok(tx) => tx,
                    Err(e) if e.is_conflict() => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                tracing::warn!(address = %address.address, amount = %amount, "payment after expiry; scheduling full refund");
                schedule_refund(
                    &self.store,
                    &self.queue,
                    &self.webhooks,
                    &tx,
                    amount,
                    "payment received after address expiry",
                    ACTOR,
                )
                .await?;
            }
            AddressStatus::Disabled => {
                tracing::warn!(address = %address.address, "transfer to disabled address ignored");
            }
        }
        Ok(())
    }

    /// One confirmation re-check. Advances the machine and re-enqueues
    /// itself until the transaction is terminal.
    #[instrument(skip_all, err, fields(transaction = %transaction_id))]
    pub async fn check(&self, transaction_id: Uuid) -> Result<(), ConfirmError> {
        let Some(tx) = self.store.transaction_by_id(transaction_id).await? else {
            return Err(ConfirmError::Missing(transaction_id));
        };
        if tx.status.is_terminal() {
            return Ok(());
        }
        let Some(hash_str) = tx.tx_hash.clone() else {
            // Broadcast still in flight elsewhere; look again later.
            self.enqueue_check(tx.id, tx.confirmations.max(0) as u32).await?;
            return Ok(());
        };
        let hash: TxHash = hash_str
            .parse()
            .map_err(|_| ConfirmError::Unprocessable(format!("stored hash {hash_str}")))?;

        let Some(receipt) = self.chain.get_receipt(hash).await? else {
            if tx.block_number.is_some() {
                // Previously included, now unknown to the chain: re-org.
                return self.handle_reorg(&tx).await;
            }
            self.enqueue_check(tx.id, tx.confirmations.max(0) as u32).await?;
            return Ok(());
        };

        if !receipt.status() {
            return self.fail(&tx, "reverted on chain").await;
        }
        let Some(included_at) = receipt.block_number else {
            self.enqueue_check(tx.id, tx.confirmations.max(0) as u32).await?;
            return Ok(());
        };
        if let Some(stored) = tx.block_number {
            if stored != included_at as i64 {
                // Moved to a different block since we last looked.
                return self.handle_reorg(&tx).await;
            }
        }

        let current = self.chain.get_block_number().await?;
        let confirmations = current.saturating_sub(included_at) as i64 + 1;
        let confirmations = i32::try_from(confirmations).unwrap_or(i32::MAX);

        if tx.block_number.is_none() {
            let block_hash = receipt
                .block_hash
                .map(|h| h.to_string())
                .unwrap_or_default();
            let block_timestamp = self
                .chain
                .get_block_timestamp(included_at)
                .await
                .ok()
                .flatten();
            self.store
                .set_block_fields(tx.id, included_at as i64, &block_hash, block_timestamp)
                .await?;
        }
        if tx.status == TransactionStatus::Pending
            && !self
                .store
                .advance_transaction_status(
                    tx.id,
                    TransactionStatus::Pending,
                    TransactionStatus::Confirming,
                    confirmations,
                    AuditAction::TransactionConfirming,
                    ACTOR,
                )
                .await?
        {
            return Err(ConfirmError::Raced(tx.id));
        }

        if (confirmations.max(0) as u32) < self.confirmations_required {
            self.store.set_confirmations(tx.id, confirmations).await?;
            self.enqueue_check(tx.id, confirmations.max(0) as u32).await?;
            return Ok(());
        }

        match tx.kind {
            TransactionKind::Payment => self.finalize_payment(&tx, confirmations).await,
            _ => self.finalize_emitted(&tx, confirmations).await,
        }
    }

    /// A payment has reached the threshold: apply the amount policy.
    async fn finalize_payment(
        &self,
        tx: &Transaction,
        confirmations: i32,
    ) -> Result<(), ConfirmError> {
        let expected = match tx.payment_address_id {
            Some(address_id) => self
                .store
                .address_by_id(address_id)
                .await?
                .and_then(|a| a.expected_amount),
            None => None,
        };
        let verdict = match expected {
            Some(expected) => judge_amount(
                expected,
                tx.amount,
                self.payment.underpayment_tolerance_pct,
                self.payment.overpayment_tolerance_pct,
            ),
            // No expectation recorded (hot-wallet dust etc.): credit as-is.
            None => AmountVerdict::Accepted {
                refund_excess: None,
            },
        };

        match verdict {
            AmountVerdict::Underpaid => {
                if !self
                    .store
                    .advance_transaction_status(
                        tx.id,
                        TransactionStatus::Confirming,
                        TransactionStatus::Underpaid,
                        confirmations,
                        AuditAction::TransactionUnderpaid,
                        ACTOR,
                    )
                    .await?
                {
                    return Err(ConfirmError::Raced(tx.id));
                }
                self.emit_for(tx, WebhookEvent::PaymentUnderpaid, serde_json::json!({
                    "transactionId": tx.id,
                    "expectedAmount": expected.map(|e| e.to_string()),
                    "receivedAmount": tx.amount.to_string(),
                    "currency": tx.currency,
                }))
                .await;
                Ok(())
            }
            AmountVerdict::Accepted { refund_excess } => {
                if !self
                    .store
                    .advance_transaction_status(
                        tx.id,
                        TransactionStatus::Confirming,
                        TransactionStatus::Confirmed,
                        confirmations,
                        AuditAction::TransactionConfirmed,
                        ACTOR,
                    )
                    .await?
                {
                    return Err(ConfirmError::Raced(tx.id));
                }
                self.emit_for(tx, WebhookEvent::PaymentConfirmed, serde_json::json!({
                    "transactionId": tx.id,
                    "txHash": tx.tx_hash,
                    "amount": tx.amount.to_string(),
                    "currency": tx.currency,
                    "confirmations": confirmations,
                }))
                .await;
                if let Some(excess) = refund_excess {
                    tracing::info!(transaction = %tx.id, %excess, "overpayment beyond tolerance; refunding excess");
                    schedule_refund(
                        &self.store,
                        &self.queue,
                        &self.webhooks,
                        tx,
                        excess,
                        "overpayment beyond tolerance",
                        ACTOR,
                    )
                    .await?;
                    self.emit_for(tx, WebhookEvent::PaymentCompleted, serde_json::json!({
                        "transactionId": tx.id,
                        "amount": tx.amount.to_string(),
                        "refundedExcess": excess.to_string(),
                        "currency": tx.currency,
                    }))
                    .await;
                }
                // Nudge the sweeper rather than waiting for its period.
                self.queue
                    .publish(
                        QueueName::SettlementProcess,
                        &SettlementTask {
                            merchant_id: tx.merchant_id,
                        },
                        PublishOptions::default(),
                    )
                    .await?;
                Ok(())
            }
        }
    }

    /// An emitted transfer (sweep, refund, payout, cold move) has reached
    /// the threshold: complete it and run its kind-specific effects.
    async fn finalize_emitted(
        &self,
        tx: &Transaction,
        confirmations: i32,
    ) -> Result<(), ConfirmError> {
        if !self
            .store
            .advance_transaction_status(
                tx.id,
                TransactionStatus::Confirming,
                TransactionStatus::Confirmed,
                confirmations,
                AuditAction::TransactionConfirmed,
                ACTOR,
            )
            .await?
        {
            // Another check may have completed it already.
            let fresh = self.store.transaction_by_id(tx.id).await?;
            if fresh.map(|t| t.status.is_terminal()).unwrap_or(false) {
                return Ok(());
            }
            return Err(ConfirmError::Raced(tx.id));
        }
        if !self
            .store
            .advance_transaction_status(
                tx.id,
                TransactionStatus::Confirmed,
                TransactionStatus::Completed,
                confirmations,
                AuditAction::TransactionCompleted,
                ACTOR,
            )
            .await?
        {
            return Err(ConfirmError::Raced(tx.id));
        }

        match tx.kind {
            TransactionKind::SettlementTransfer => self.complete_settlement(tx).await?,
            TransactionKind::Refund => {
                self.emit_for(tx, WebhookEvent::RefundCompleted, serde_json::json!({
                    "transactionId": tx.id,
                    "txHash": tx.tx_hash,
                    "amount": tx.amount.to_string(),
                    "currency": tx.currency,
                }))
                .await;
            }
            TransactionKind::Payout => {
                self.emit_for(tx, WebhookEvent::PayoutCompleted, serde_json::json!({
                    "transactionId": tx.id,
                    "txHash": tx.tx_hash,
                    "amount": tx.amount.to_string(),
                    "currency": tx.currency,
                }))
                .await;
            }
            TransactionKind::ColdStorageTransfer => {
                tracing::info!(transaction = %tx.id, "cold storage transfer confirmed");
            }
            TransactionKind::Payment => {
                debug_assert!(false, "payments finalize via finalize_payment");
            }
        }
        Ok(())
    }

    /// A confirmed sweep settles the payments it carried.
    async fn complete_settlement(&self, sweep: &Transaction) -> Result<(), ConfirmError> {
        let sweep_hash = sweep.tx_hash.clone().unwrap_or_default();
        let payment_ids: Vec<Uuid> = sweep
            .metadata
            .as_ref()
            .and_then(|m| m.get("paymentIds"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        for payment_id in &payment_ids {
            if self
                .store
                .mark_transaction_settled(*payment_id, &sweep_hash)
                .await?
            {
                if let Some(payment) = self.store.transaction_by_id(*payment_id).await? {
                    self.emit_for(&payment, WebhookEvent::TransactionSettled, serde_json::json!({
                        "transactionId": payment.id,
                        "settlementTxHash": sweep_hash,
                        "amount": payment.amount.to_string(),
                        "currency": payment.currency,
                    }))
                    .await;
                }
            }
        }
        self.emit_for(sweep, WebhookEvent::SettlementCompleted, serde_json::json!({
            "settlementTxHash": sweep_hash,
            "amount": sweep.amount.to_string(),
            "currency": sweep.currency,
            "paymentCount": payment_ids.len(),
        }))
        .await;
        Ok(())
    }

    /// First re-org: one step back. Second: the transaction fails.
    async fn handle_reorg(&self, tx: &Transaction) -> Result<(), ConfirmError> {
        if tx.reorg_count >= 1 {
            tracing::warn!(transaction = %tx.id, "second re-org; failing transaction");
            return self.fail(tx, "repeated chain re-org").await;
        }
        tracing::warn!(transaction = %tx.id, "re-org detected; reverting to pending");
        if !self.store.revert_transaction_to_pending(tx.id).await? {
            return Err(ConfirmError::Raced(tx.id));
        }
        self.enqueue_check(tx.id, 0).await?;
        Ok(())
    }

    async fn fail(&self, tx: &Transaction, reason: &str) -> Result<(), ConfirmError> {
        if !self
            .store
            .advance_transaction_status(
                tx.id,
                tx.status,
                TransactionStatus::Failed,
                tx.confirmations,
                AuditAction::TransactionFailed,
                ACTOR,
            )
            .await?
        {
            return Err(ConfirmError::Raced(tx.id));
        }
        let event = match tx.kind {
            TransactionKind::Payment => Some(WebhookEvent::PaymentFailed),
            TransactionKind::Refund => Some(WebhookEvent::RefundFailed),
            TransactionKind::Payout => Some(WebhookEvent::PayoutFailed),
            _ => None,
        };
        if let Some(event) = event {
            self.emit_for(tx, event, serde_json::json!({
                "transactionId": tx.id,
                "txHash": tx.tx_hash,
                "reason": reason,
            }))
            .await;
        }
        Ok(())
    }

    async fn emit_for(&self, tx: &Transaction, event: WebhookEvent, fields: serde_json::Value) {
        let Some(merchant_id) = tx.merchant_id else {
            return;
        };
        if let Err(e) = self.webhooks.emit(merchant_id, event, fields).await {
            tracing::warn!(error = %e, event = %event, "can not emit webhook");
        }
    }

    async fn enqueue_check(&self, transaction_id: Uuid, confirmations: u32) -> Result<(), ConfirmError> {
        let delay = backoff::confirmation_check_delay(confirmations);
        self.queue
            .publish(
                QueueName::PaymentMonitor,
                &ConfirmationCheckTask { transaction_id },
                PublishOptions::delayed(delay),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl QueueHandler for ConfirmationEngine {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), HandlerError> {
        let task: ConfirmationCheckTask = serde_json::from_value(payload)
            .map_err(|e| HandlerError::Fatal(format!("undecodable check task: {e}")))?;
        match self.check(task.transaction_id).await {
            Ok(()) => Ok(()),
            Err(ConfirmError::Missing(id)) => {
                Err(HandlerError::Fatal(format!("transaction {id} missing")))
            }
            Err(ConfirmError::Unprocessable(detail)) => Err(HandlerError::Fatal(detail)),
            Err(e) => Err(HandlerError::Retriable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn judge(expected: &str, received: &str) -> AmountVerdict {
        judge_amount(dec(expected), dec(received), dec("1.0"), dec("0.5"))
    }

    #[test]
    fn exact_amount_is_accepted() {
        assert_eq!(
            judge("100", "100"),
            AmountVerdict::Accepted { refund_excess: None }
        );
    }

    #[test]
    fn underpayment_boundary() {
        // Exactly at the 1% boundary: accepted.
        assert_eq!(
            judge("100", "99"),
            AmountVerdict::Accepted { refund_excess: None }
        );
        // One cent below the boundary: underpaid.
        assert_eq!(judge("100", "98.99"), AmountVerdict::Underpaid);
        // Two percent under: underpaid.
        assert_eq!(judge("100", "98"), AmountVerdict::Underpaid);
    }

    #[test]
    fn overpayment_boundary() {
        // Exactly at the 0.5% boundary: kept silently.
        assert_eq!(
            judge("100", "100.5"),
            AmountVerdict::Accepted { refund_excess: None }
        );
        // One cent above: the excess over the expectation is refunded.
        assert_eq!(
            judge("100", "100.51"),
            AmountVerdict::Accepted {
                refund_excess: Some(dec("0.51"))
            }
        );
        // One percent over: refund of the full excess.
        assert_eq!(
            judge("100", "101"),
            AmountVerdict::Accepted {
                refund_excess: Some(dec("1"))
            }
        );
    }

    #[test]
    fn zero_tolerance_requires_exactness() {
        let verdict = judge_amount(dec("50"), dec("49.999999"), Decimal::ZERO, Decimal::ZERO);
        assert_eq!(verdict, AmountVerdict::Underpaid);
        let verdict = judge_amount(dec("50"), dec("50.000001"), Decimal::ZERO, Decimal::ZERO);
        assert_eq!(
            verdict,
            AmountVerdict::Accepted {
                refund_excess: Some(dec("0.000001"))
            }
        );
    }
}
