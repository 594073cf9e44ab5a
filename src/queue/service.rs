//! The queue service: broker-backed at-least-once delivery with a direct,
//! in-process fallback.
//!
//! Publish never fails for infrastructure reasons. With a live broker the
//! message goes out persistent; without one the service dispatches it to
//! the registered in-process handler off the caller's path, with the same
//! retry counting and failed-message parking the broker path gets. A probe
//! task reconnects in the background, flips the service back to broker
//! mode, and replays parked messages.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::broker::{Broker, ack_or_log, delivery_retry_count, next_delivery};
use super::{HandlerError, Priority, QueueHandler, QueueName};
use crate::config::QueueConfig;
use crate::store::Store;

/// Cap for the exponential redelivery delay.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The message could not be serialized; nothing was published.
    #[error("can not serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Per-publish options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    pub priority: Priority,
    /// Deliver after this delay instead of immediately.
    pub delay: Option<Duration>,
}

impl PublishOptions {
    pub fn high_priority() -> Self {
        Self {
            priority: Priority::High,
            delay: None,
        }
    }

    pub fn delayed(delay: Duration) -> Self {
        Self {
            priority: Priority::Normal,
            delay: Some(delay),
        }
    }
}

struct Inner {
    config: QueueConfig,
    store: Store,
    handlers: DashMap<QueueName, Arc<dyn QueueHandler>>,
    broker: RwLock<Option<Broker>>,
    direct_mode: AtomicBool,
    mode_changed: Notify,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Handle shared by every component that publishes or consumes.
#[derive(Clone)]
pub struct QueueService {
    inner: Arc<Inner>,
}

impl QueueService {
    pub fn new(config: QueueConfig, store: Store, cancel: CancellationToken) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                handlers: DashMap::new(),
                broker: RwLock::new(None),
                direct_mode: AtomicBool::new(true),
                mode_changed: Notify::new(),
                cancel,
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Attempt the initial broker connection and start the health probe.
    /// The service is usable either way.
    pub async fn start(&self) {
        let inner = &self.inner;
        match Broker::connect(
            &inner.config.url,
            Duration::from_millis(inner.config.retry_delay_ms),
        )
        .await
        {
            Ok(broker) => {
                *inner.broker.write().await = Some(broker);
                inner.direct_mode.store(false, Ordering::SeqCst);
                tracing::info!("queue broker connected");
            }
            Err(e) => {
                tracing::warn!(error = %e, "queue broker unreachable at startup; running in direct mode");
            }
        }
        let probe = Arc::clone(inner);
        inner.tracker.spawn(async move { health_probe(probe).await });
    }

    pub fn in_direct_mode(&self) -> bool {
        self.inner.direct_mode.load(Ordering::SeqCst)
    }

    /// Wait for in-flight direct dispatches and consumers to finish.
    pub async fn shutdown(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Publish a message. Succeeds whether or not the broker is reachable.
    ///
    /// # Errors
    /// Only [`QueueError::Serialize`]; infrastructure trouble degrades to
    /// direct dispatch instead of surfacing.
    pub async fn publish<T: Serialize>(
        &self,
        queue: QueueName,
        message: &T,
        options: PublishOptions,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_value(message)?;
        self.publish_value(queue, payload, options, 0).await;
        Ok(())
    }

    async fn publish_value(
        &self,
        queue: QueueName,
        payload: serde_json::Value,
        options: PublishOptions,
        retry_count: u32,
    ) {
        let inner = &self.inner;
        if !self.in_direct_mode() {
            let body = payload.to_string().into_bytes();
            let guard = inner.broker.read().await;
            if let Some(broker) = guard.as_ref() {
                let result = match options.delay {
                    Some(delay) => {
                        broker
                            .publish_delayed(queue, &body, options.priority, retry_count, delay)
                            .await
                    }
                    None => {
                        broker
                            .publish(queue, &body, options.priority, retry_count)
                            .await
                    }
                };
                match result {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "broker publish failed; switching to direct mode");
                        drop(guard);
                        enter_direct_mode(inner);
                    }
                }
            } else {
                drop(guard);
                enter_direct_mode(inner);
            }
        }
        spawn_direct(inner, queue, payload, options.delay, retry_count);
    }

    /// Register the handler for a queue and start consuming.
    ///
    /// One handler per queue; a second registration replaces the first,
    /// which only happens in tests.
    pub fn consume(&self, queue: QueueName, handler: Arc<dyn QueueHandler>) {
        self.inner.handlers.insert(queue, handler);
        let inner = Arc::clone(&self.inner);
        self.inner
            .tracker
            .spawn(async move { consumer_loop(inner, queue).await });
    }
}

fn enter_direct_mode(inner: &Arc<Inner>) {
    if !inner.direct_mode.swap(true, Ordering::SeqCst) {
        tracing::warn!("queue entering direct mode");
        inner.mode_changed.notify_waiters();
    }
}

async fn exit_direct_mode(inner: &Arc<Inner>, broker: Broker) {
    *inner.broker.write().await = Some(broker);
    if inner.direct_mode.swap(false, Ordering::SeqCst) {
        tracing::info!("queue broker restored");
        inner.mode_changed.notify_waiters();
    }
    replay_failed_messages(inner).await;
}

/// Periodic reconnection and liveness checks.
async fn health_probe(inner: Arc<Inner>) {
    let interval = Duration::from_millis(inner.config.health_check_ms);
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if inner.direct_mode.load(Ordering::SeqCst) {
            match Broker::connect(
                &inner.config.url,
                Duration::from_millis(inner.config.retry_delay_ms),
            )
            .await
            {
                Ok(broker) => exit_direct_mode(&inner, broker).await,
                Err(e) => {
                    tracing::debug!(error = %e, "queue broker still unreachable");
                }
            }
        } else {
            let connected = inner
                .broker
                .read()
                .await
                .as_ref()
                .is_some_and(Broker::is_connected);
            if !connected {
                enter_direct_mode(&inner);
            }
        }
    }
}

/// Push parked failed messages back into the restored broker.
async fn replay_failed_messages(inner: &Arc<Inner>) {
    if !inner.config.store_failed_messages {
        return;
    }
    loop {
        let batch = match inner.store.claim_failed_messages(100).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(error = %e, "can not claim failed messages for replay");
                return;
            }
        };
        if batch.is_empty() {
            return;
        }
        tracing::info!(count = batch.len(), "replaying failed queue messages");
        for message in batch {
            let Some(queue) = QueueName::from_name(&message.queue) else {
                tracing::warn!(queue = %message.queue, "parked message references unknown queue");
                continue;
            };
            let body = message.payload.to_string().into_bytes();
            let guard = inner.broker.read().await;
            let Some(broker) = guard.as_ref() else {
                return;
            };
            if let Err(e) = broker.publish(queue, &body, Priority::Normal, 0).await {
                tracing::warn!(queue = %queue, error = %e, "replay publish failed");
                drop(guard);
                park_message(inner, queue, &message.payload, &e.to_string(), 0).await;
                return;
            }
        }
    }
}

async fn park_message(
    inner: &Arc<Inner>,
    queue: QueueName,
    payload: &serde_json::Value,
    error: &str,
    retry_count: u32,
) {
    if !inner.config.store_failed_messages {
        return;
    }
    if let Err(e) = inner
        .store
        .store_failed_message(queue.as_str(), payload, error, retry_count as i32)
        .await
    {
        tracing::error!(queue = %queue, error = %e, "can not park failed message");
    }
}

fn retry_delay(config: &QueueConfig, attempt: u32) -> Duration {
    let base = Duration::from_millis(config.retry_delay_ms);
    if config.use_backoff {
        crate::util::backoff::exponential(base, MAX_RETRY_DELAY, attempt.saturating_sub(1))
    } else {
        base
    }
}

fn spawn_direct(
    inner: &Arc<Inner>,
    queue: QueueName,
    payload: serde_json::Value,
    delay: Option<Duration>,
    retry_count: u32,
) {
    let inner = Arc::clone(inner);
    let tracker = inner.tracker.clone();
    tracker.spawn(async move { direct_dispatch(inner, queue, payload, delay, retry_count).await });
}

/// Fallback execution of one message, with the broker path's retry policy.
async fn direct_dispatch(
    inner: Arc<Inner>,
    queue: QueueName,
    payload: serde_json::Value,
    mut delay: Option<Duration>,
    mut attempt: u32,
) {
    loop {
        if let Some(d) = delay.take() {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(d) => {}
            }
        }
        let handler = inner.handlers.get(&queue).map(|h| Arc::clone(h.value()));
        let Some(handler) = handler else {
            park_message(&inner, queue, &payload, "no consumer registered", attempt).await;
            return;
        };
        match handler.handle(payload.clone()).await {
            Ok(()) => return,
            Err(e) if e.is_retriable() => {
                attempt += 1;
                if attempt > inner.config.max_retries {
                    park_message(&inner, queue, &payload, e.detail(), attempt).await;
                    return;
                }
                tracing::debug!(queue = %queue, attempt, error = %e, "direct dispatch retrying");
                delay = Some(retry_delay(&inner.config, attempt));
            }
            Err(e) => {
                park_message(&inner, queue, &payload, e.detail(), attempt).await;
                return;
            }
        }
    }
}

/// Broker-backed consumption for one queue; parks in direct mode and
/// resumes when the probe restores the connection.
async fn consumer_loop(inner: Arc<Inner>, queue: QueueName) {
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }
        if inner.direct_mode.load(Ordering::SeqCst) {
            // The notify wakes us promptly on mode change; the timeout
            // covers a wakeup raced away between the flag check and the
            // wait registration.
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::timeout(
                    Duration::from_secs(5),
                    inner.mode_changed.notified(),
                ) => {}
            }
            continue;
        }
        let consumer = {
            let guard = inner.broker.read().await;
            match guard.as_ref() {
                None => {
                    drop(guard);
                    enter_direct_mode(&inner);
                    continue;
                }
                Some(broker) => {
                    match broker.start_consumer(queue, inner.config.prefetch).await {
                        Ok(consumer) => consumer,
                        Err(e) => {
                            tracing::warn!(queue = %queue, error = %e, "can not start consumer");
                            drop(guard);
                            enter_direct_mode(&inner);
                            continue;
                        }
                    }
                }
            }
        };
        let mut consumer = consumer;
        loop {
            tokio::select! {
                _ = inner.cancel.cancelled() => return,
                delivery = next_delivery(&mut consumer) => {
                    match delivery {
                        None => break,
                        Some(Err(e)) => {
                            tracing::warn!(queue = %queue, error = %e, "consumer channel failed");
                            break;
                        }
                        Some(Ok(delivery)) => handle_delivery(&inner, queue, delivery).await,
                    }
                }
            }
        }
        enter_direct_mode(&inner);
    }
}

async fn handle_delivery(inner: &Arc<Inner>, queue: QueueName, delivery: lapin::message::Delivery) {
    let payload: serde_json::Value = match serde_json::from_slice(&delivery.data) {
        Ok(value) => value,
        Err(e) => {
            let raw = String::from_utf8_lossy(&delivery.data).into_owned();
            park_message(
                inner,
                queue,
                &serde_json::Value::String(raw),
                &format!("undecodable payload: {e}"),
                0,
            )
            .await;
            ack_or_log(&delivery).await;
            return;
        }
    };
    let handler = inner.handlers.get(&queue).map(|h| Arc::clone(h.value()));
    let Some(handler) = handler else {
        park_message(inner, queue, &payload, "no consumer registered", 0).await;
        ack_or_log(&delivery).await;
        return;
    };
    let attempt = delivery_retry_count(&delivery);
    match handler.handle(payload.clone()).await {
        Ok(()) => {}
        Err(e) if e.is_retriable() => {
            let next = attempt + 1;
            if next > inner.config.max_retries {
                tracing::warn!(queue = %queue, attempts = next, error = %e, "message exhausted retries");
                park_message(inner, queue, &payload, e.detail(), next).await;
            } else {
                let delay = retry_delay(&inner.config, next);
                let body = payload.to_string().into_bytes();
                let guard = inner.broker.read().await;
                match guard.as_ref() {
                    Some(broker) => {
                        if let Err(pe) = broker
                            .publish_delayed(queue, &body, Priority::Normal, next, delay)
                            .await
                        {
                            tracing::warn!(queue = %queue, error = %pe, "redelivery publish failed");
                            drop(guard);
                            spawn_direct(inner, queue, payload.clone(), Some(delay), next);
                        }
                    }
                    None => {
                        drop(guard);
                        spawn_direct(inner, queue, payload.clone(), Some(delay), next);
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!(queue = %queue, error = %e, "message rejected as non-retriable");
            park_message(inner, queue, &payload, e.detail(), attempt).await;
        }
    }
    ack_or_log(&delivery).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(use_backoff: bool) -> QueueConfig {
        QueueConfig {
            use_backoff,
            ..QueueConfig::default()
        }
    }

    #[test]
    fn retry_delay_backs_off_exponentially() {
        let cfg = config(true);
        assert_eq!(retry_delay(&cfg, 1), Duration::from_secs(60));
        assert_eq!(retry_delay(&cfg, 2), Duration::from_secs(120));
        assert_eq!(retry_delay(&cfg, 3), Duration::from_secs(240));
        // Capped at one hour.
        assert_eq!(retry_delay(&cfg, 30), MAX_RETRY_DELAY);
    }

    #[test]
    fn retry_delay_flat_without_backoff() {
        let cfg = config(false);
        assert_eq!(retry_delay(&cfg, 1), Duration::from_secs(60));
        assert_eq!(retry_delay(&cfg, 5), Duration::from_secs(60));
    }
}
