//! Signed merchant webhooks: fan-out, delivery, retry, and circuit breaking.
//!
//! [`WebhookDispatcher::emit`] resolves the endpoints subscribed to an event
//! and enqueues one delivery task per endpoint; critical events publish at
//! high priority. The dispatcher is also the `webhook.send` consumer: each
//! task is signed with the endpoint secret, POSTed with a 10 s deadline,
//! and retried on 5xx/429/network failures on a `base · 2^attempt`
//! schedule. Five failures against one URL inside the rolling window open a
//! per-URL breaker; while it is open, deliveries are skipped and only
//! critical events are rescheduled for after the reset.
//!
//! Signature scheme: `X-Webhook-Signature: t=<unix-seconds>,v1=<hex>` where
//! the hex is HMAC-SHA256 over `"t=<unix-seconds>\n<json-body>"`. Receivers
//! are expected to reject bodies older than five minutes.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use crate::config::WebhookConfig;
use crate::queue::{
    HandlerError, PublishOptions, QueueHandler, QueueName, QueueService, WebhookDeliveryTask,
};
use crate::store::{Store, StoreError};
use crate::types::WebhookEvent;
use crate::util::breaker::CircuitBreaker;

type HmacSha256 = Hmac<Sha256>;

pub const USER_AGENT: &str = "Crypto-Payment-Gateway/1.0";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("can not enqueue delivery: {0}")]
    Enqueue(#[from] crate::queue::QueueError),
}

/// HMAC-SHA256 of `message` under `secret`, hex encoded.
fn hmac_hex(secret: &str, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Signature over the timestamped body.
pub fn sign_payload(secret: &str, timestamp: i64, body: &str) -> String {
    hmac_hex(secret, &format!("t={timestamp}\n{body}"))
}

/// Value for the `X-Webhook-Signature` header.
pub fn signature_header(timestamp: i64, signature_hex: &str) -> String {
    format!("t={timestamp},v1={signature_hex}")
}

/// Random 16-byte hex idempotency key, minted once per logical delivery.
pub fn new_idempotency_key() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

#[derive(Debug, PartialEq, Eq)]
enum DeliveryOutcome {
    Success,
    /// 5xx, 429, or a network/timeout error.
    Retriable(String),
    /// Any other 4xx; retrying can not help.
    NonRetriable(String),
}

fn classify_status(status: StatusCode) -> DeliveryOutcome {
    if status.is_success() {
        DeliveryOutcome::Success
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        DeliveryOutcome::Retriable(format!("http {status}"))
    } else if status.is_client_error() {
        DeliveryOutcome::NonRetriable(format!("http {status}"))
    } else {
        // Unexpected 1xx/3xx; treat as retriable infrastructure noise.
        DeliveryOutcome::Retriable(format!("http {status}"))
    }
}

struct Inner {
    store: Store,
    queue: QueueService,
    config: WebhookConfig,
    client: reqwest::Client,
    /// One breaker per target URL.
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

/// Process-wide webhook component. Register it as the `webhook.send`
/// consumer at the application root.
#[derive(Clone)]
pub struct WebhookDispatcher {
    inner: Arc<Inner>,
}

impl WebhookDispatcher {
    pub fn new(store: Store, queue: QueueService, config: WebhookConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(USER_AGENT)
            .build()
            .expect("reqwest client with static configuration");
        Self {
            inner: Arc::new(Inner {
                store,
                queue,
                config,
                client,
                breakers: DashMap::new(),
            }),
        }
    }

    /// Notify every subscribed endpoint of `merchant_id` about `event`.
    ///
    /// `fields` are merged into the standard envelope
    /// `{id, event, merchantId, timestamp}`.
    #[instrument(skip_all, err, fields(merchant = %merchant_id, event = %event))]
    pub async fn emit(
        &self,
        merchant_id: Uuid,
        event: WebhookEvent,
        fields: serde_json::Value,
    ) -> Result<(), WebhookError> {
        let endpoints = self
            .inner
            .store
            .endpoints_for_event(merchant_id, event)
            .await?;
        if endpoints.is_empty() {
            tracing::debug!("no endpoints subscribed");
            return Ok(());
        }
        let body = build_event_body(merchant_id, event, fields);
        let options = if event.is_critical() {
            PublishOptions::high_priority()
        } else {
            PublishOptions::default()
        };
        for endpoint in endpoints {
            let task = WebhookDeliveryTask {
                endpoint_id: endpoint.id,
                url: endpoint.url.clone(),
                event,
                payload: body.clone(),
                secret: endpoint.secret.clone(),
                idempotency_key: new_idempotency_key(),
                retry_count: 0,
                max_retries: endpoint.max_retries.max(0) as u32,
            };
            self.inner
                .queue
                .publish(QueueName::WebhookSend, &task, options)
                .await?;
        }
        Ok(())
    }

    fn breaker_for(&self, url: &str) -> Arc<CircuitBreaker> {
        let window = Duration::from_millis(self.inner.config.breaker_window_ms);
        self.inner
            .breakers
            .entry(url.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    self.inner.config.breaker_threshold,
                    window,
                    window,
                ))
            })
            .value()
            .clone()
    }

    /// Deliver one task. Retries are scheduled by republishing the task
    /// with an incremented count, so the queue message itself always acks.
    #[instrument(skip_all, fields(endpoint = %task.endpoint_id, event = %task.event, attempt = task.retry_count))]
    async fn deliver(&self, task: WebhookDeliveryTask) -> Result<(), HandlerError> {
        let inner = &self.inner;
        let breaker = self.breaker_for(&task.url);

        if breaker.acquire().is_err() {
            tracing::warn!(url = %task.url, "delivery skipped: circuit open");
            self.note_failure(&task, "skipped: circuit breaker open").await;
            if task.event.is_critical() {
                let delay = Duration::from_millis(inner.config.breaker_window_ms);
                self.reschedule(task, delay).await;
            }
            return Ok(());
        }

        let body = task.payload.to_string();
        let timestamp = Utc::now().timestamp();
        let signature = sign_payload(&task.secret, timestamp, &body);

        let response = inner
            .client
            .post(&task.url)
            .header("Content-Type", "application/json")
            .header("X-Webhook-Signature", signature_header(timestamp, &signature))
            .header("X-Webhook-Event", task.event.as_str())
            .header("X-Idempotency-Key", &task.idempotency_key)
            .body(body)
            .send()
            .await;

        let outcome = match response {
            Ok(response) => classify_status(response.status()),
            Err(e) => DeliveryOutcome::Retriable(format!("network: {e}")),
        };

        match outcome {
            DeliveryOutcome::Success => {
                breaker.record_success();
                if let Err(e) = inner.store.record_endpoint_success(task.endpoint_id).await {
                    tracing::warn!(error = %e, "can not reset endpoint failure counter");
                }
                tracing::info!(url = %task.url, "webhook delivered");
                Ok(())
            }
            DeliveryOutcome::NonRetriable(reason) => {
                breaker.record_failure();
                tracing::warn!(url = %task.url, %reason, "webhook rejected; not retrying");
                self.note_failure(&task, &reason).await;
                Ok(())
            }
            DeliveryOutcome::Retriable(reason) => {
                breaker.record_failure();
                self.note_failure(&task, &reason).await;
                if task.retry_count + 1 > task.max_retries {
                    tracing::warn!(url = %task.url, %reason, "webhook retries exhausted; endpoint failed");
                    if let Err(e) = inner.store.mark_endpoint_failed(task.endpoint_id).await {
                        tracing::warn!(error = %e, "can not mark endpoint failed");
                    }
                    return Ok(());
                }
                let delay = crate::util::backoff::exponential(
                    Duration::from_millis(inner.config.retry_delay_ms),
                    Duration::from_secs(3600),
                    task.retry_count,
                );
                tracing::info!(url = %task.url, %reason, in_secs = delay.as_secs(), "webhook delivery retrying");
                self.reschedule(task, delay).await;
                Ok(())
            }
        }
    }

    /// Bump the endpoint's consecutive-failure count; flip it to `failed`
    /// once the count reaches the endpoint's retry budget.
    async fn note_failure(&self, task: &WebhookDeliveryTask, reason: &str) {
        match self
            .inner
            .store
            .record_endpoint_failure(task.endpoint_id, reason)
            .await
        {
            Ok(count) if count >= task.max_retries.max(1) as i32 => {
                if let Err(e) = self.inner.store.mark_endpoint_failed(task.endpoint_id).await {
                    tracing::warn!(error = %e, "can not mark endpoint failed");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "can not record endpoint failure"),
        }
    }

    async fn reschedule(&self, mut task: WebhookDeliveryTask, delay: Duration) {
        task.retry_count += 1;
        let options = PublishOptions {
            priority: if task.event.is_critical() {
                crate::queue::Priority::High
            } else {
                crate::queue::Priority::Normal
            },
            delay: Some(delay),
        };
        if let Err(e) = self
            .inner
            .queue
            .publish(QueueName::WebhookSend, &task, options)
            .await
        {
            tracing::error!(error = %e, "can not reschedule webhook delivery");
        }
    }
}

#[async_trait]
impl QueueHandler for WebhookDispatcher {
    async fn handle(&self, payload: serde_json::Value) -> Result<(), HandlerError> {
        let task: WebhookDeliveryTask = serde_json::from_value(payload)
            .map_err(|e| HandlerError::Fatal(format!("undecodable delivery task: {e}")))?;
        self.deliver(task).await
    }
}

/// The standard notification envelope.
fn build_event_body(
    merchant_id: Uuid,
    event: WebhookEvent,
    fields: serde_json::Value,
) -> serde_json::Value {
    let mut body = serde_json::json!({
        "id": Uuid::new_v4(),
        "event": event.as_str(),
        "merchantId": merchant_id,
        "timestamp": Utc::now().timestamp(),
    });
    if let (Some(base), serde_json::Value::Object(extra)) = (body.as_object_mut(), fields) {
        for (key, value) in extra {
            base.entry(key).or_insert(value);
        }
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_matches_rfc4231_vector() {
        // RFC 4231 test case 2.
        assert_eq!(
            hmac_hex("Jefe", "what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn signature_is_deterministic_and_keyed() {
        let a = sign_payload("whsec_1", 1_700_000_000, "{\"x\":1}");
        let b = sign_payload("whsec_1", 1_700_000_000, "{\"x\":1}");
        let c = sign_payload("whsec_2", 1_700_000_000, "{\"x\":1}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_header_format() {
        let header = signature_header(1_700_000_000, "abc123");
        assert_eq!(header, "t=1700000000,v1=abc123");
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::OK), DeliveryOutcome::Success);
        assert_eq!(classify_status(StatusCode::CREATED), DeliveryOutcome::Success);
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND),
            DeliveryOutcome::NonRetriable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            DeliveryOutcome::NonRetriable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            DeliveryOutcome::Retriable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            DeliveryOutcome::Retriable(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY),
            DeliveryOutcome::Retriable(_)
        ));
    }

    #[test]
    fn idempotency_keys_are_16_bytes_and_unique() {
        let a = new_idempotency_key();
        let b = new_idempotency_key();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn event_body_carries_envelope_and_fields() {
        let merchant = Uuid::new_v4();
        let body = build_event_body(
            merchant,
            WebhookEvent::PaymentConfirmed,
            serde_json::json!({"transactionId": "abc", "amount": "100.5"}),
        );
        assert_eq!(body["event"], "payment-confirmed");
        assert_eq!(body["merchantId"], serde_json::json!(merchant));
        assert_eq!(body["transactionId"], "abc");
        assert!(body["id"].is_string());
        assert!(body["timestamp"].is_i64());
    }

    #[test]
    fn event_fields_do_not_override_envelope() {
        let merchant = Uuid::new_v4();
        let body = build_event_body(
            merchant,
            WebhookEvent::PaymentReceived,
            serde_json::json!({"event": "spoofed"}),
        );
        assert_eq!(body["event"], "payment-received");
    }
}
