//! At-least-once work distribution for the processing engines.
//!
//! Five named queues carry the gateway's asynchronous work, each paired
//! with a `*.retry` companion whose dead-letter target is the work queue
//! itself; a nacked message parks in the companion until its TTL elapses
//! and then flows back for another attempt.
//!
//! The broker is an availability optimization, not a correctness
//! dependency: when it is unreachable, [`QueueService`] switches to direct
//! mode and hands published messages to the in-process handlers, so
//! confirmation checks, settlements, refunds, and webhooks keep flowing. A
//! health probe reconnects in the background and replays parked failures
//! once the broker returns.

mod broker;
mod service;

pub use service::{PublishOptions, QueueError, QueueService};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::WebhookEvent;

/// The named queues and their retry companions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    /// Confirmation re-checks for tracked transactions.
    PaymentMonitor,
    /// Outbound webhook deliveries.
    WebhookSend,
    /// Sweeps of confirmed payments and hot→cold transfers.
    SettlementProcess,
    /// Refund broadcasts.
    RefundProcess,
    /// Merchant payout broadcasts.
    PayoutProcess,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::PaymentMonitor,
        QueueName::WebhookSend,
        QueueName::SettlementProcess,
        QueueName::RefundProcess,
        QueueName::PayoutProcess,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::PaymentMonitor => "payment.monitor",
            QueueName::WebhookSend => "webhook.send",
            QueueName::SettlementProcess => "settlement.process",
            QueueName::RefundProcess => "refund.process",
            QueueName::PayoutProcess => "payout.process",
        }
    }

    pub fn retry_name(self) -> &'static str {
        match self {
            QueueName::PaymentMonitor => "payment.monitor.retry",
            QueueName::WebhookSend => "webhook.send.retry",
            QueueName::SettlementProcess => "settlement.process.retry",
            QueueName::RefundProcess => "refund.process.retry",
            QueueName::PayoutProcess => "payout.process.retry",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        QueueName::ALL.into_iter().find(|q| q.as_str() == name)
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Message priority; critical webhook events publish high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn amqp(self) -> u8 {
        match self {
            Priority::Normal => 0,
            Priority::High => 9,
        }
    }
}

/// How a handler failed, which decides the message's fate.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Infrastructure trouble; the message is redelivered after the retry
    /// TTL with an incremented attempt count.
    #[error("retriable: {0}")]
    Retriable(String),
    /// The message can never succeed; it is parked in the failed-message
    /// log without redelivery.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, HandlerError::Retriable(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            HandlerError::Retriable(s) | HandlerError::Fatal(s) => s,
        }
    }
}

/// A consumer registered for one queue.
///
/// Handlers must be idempotent: delivery is at-least-once and order is
/// best-effort, so the persisted transaction state, not arrival order,
/// resolves what a message means.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), HandlerError>;
}

/// Re-check the confirmation state of one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationCheckTask {
    pub transaction_id: Uuid,
}

/// Deliver one webhook to one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDeliveryTask {
    pub endpoint_id: Uuid,
    pub url: String,
    pub event: WebhookEvent,
    pub payload: serde_json::Value,
    pub secret: String,
    /// Stable across redeliveries of this logical notification, so the
    /// receiver can deduplicate.
    pub idempotency_key: String,
    pub retry_count: u32,
    pub max_retries: u32,
}

/// Sweep confirmed payments; scoped to one merchant when set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementTask {
    #[serde(default)]
    pub merchant_id: Option<Uuid>,
}

/// Broadcast the refund transaction with this id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundTask {
    pub transaction_id: Uuid,
}

/// Broadcast the payout transaction with this id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutTask {
    pub transaction_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_names_round_trip() {
        for queue in QueueName::ALL {
            assert_eq!(QueueName::from_name(queue.as_str()), Some(queue));
            assert_eq!(queue.retry_name(), format!("{}.retry", queue.as_str()));
        }
        assert_eq!(QueueName::from_name("payment.monitor.retry"), None);
    }

    #[test]
    fn priorities_map_to_amqp() {
        assert_eq!(Priority::Normal.amqp(), 0);
        assert_eq!(Priority::High.amqp(), 9);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn handler_error_classification() {
        assert!(HandlerError::Retriable("broker gone".into()).is_retriable());
        assert!(!HandlerError::Fatal("bad payload".into()).is_retriable());
    }
}
