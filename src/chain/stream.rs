//! Long-lived push subscription to token `Transfer` events.
//!
//! The stream task owns the WebSocket lifecycle: connect, subscribe,
//! forward decoded events, and reconnect with exponential backoff when the
//! socket drops. The subscription is re-established on every reconnect, so
//! a successful session always carries the current filter.
//!
//! The advertised capability downgrades to pull-only on the second
//! consecutive connection failure and returns to push as soon as a session
//! is live again; the observer watches this signal to start and stop its
//! polling fallback.

use alloy::primitives::Address;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use alloy::rpc::types::Filter;
use alloy::sol_types::SolEvent;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{ChainError, ERC20, RPC_TIMEOUT};
use crate::types::{ChainCapability, TransferEvent, TxHash};
use crate::util::backoff;

/// Reconnect delay base after an ordinary failure.
const RECONNECT_BASE: Duration = Duration::from_secs(5);
/// Reconnect delay base after a 503, which signals endpoint overload.
const RECONNECT_BASE_OVERLOADED: Duration = Duration::from_secs(15);
const RECONNECT_MAX: Duration = Duration::from_secs(600);
/// Consecutive failures after which the capability drops to pull-only.
const PULL_ONLY_AFTER: u32 = 2;

/// Push-stream half of the chain client. Run with [`TransferStream::run`]
/// as an independent task.
pub struct TransferStream {
    ws_urls: Vec<Url>,
    token: Address,
    events: mpsc::Sender<TransferEvent>,
    capability: watch::Sender<ChainCapability>,
    cancel: CancellationToken,
}

impl TransferStream {
    pub fn new(
        ws_urls: Vec<Url>,
        token: Address,
        events: mpsc::Sender<TransferEvent>,
        capability: watch::Sender<ChainCapability>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ws_urls,
            token,
            events,
            capability,
            cancel,
        }
    }

    /// Drive the subscription until cancellation.
    pub async fn run(self) {
        if self.ws_urls.is_empty() {
            tracing::warn!("no websocket endpoints configured; running pull-only");
            let _ = self.capability.send(ChainCapability::PullOnly);
            self.cancel.cancelled().await;
            return;
        }
        let mut failures: u32 = 0;
        let mut endpoint = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let url = &self.ws_urls[endpoint % self.ws_urls.len()];
            match self.session(url).await {
                Ok(()) => {
                    // Session ended: either cancellation or a dropped socket.
                    if self.cancel.is_cancelled() {
                        return;
                    }
                    tracing::warn!(endpoint = %url, "transfer stream disconnected");
                    // The session did subscribe, so the drop starts a fresh
                    // failure round.
                    failures = 1;
                }
                Err(e) => {
                    tracing::warn!(endpoint = %url, error = %e, "transfer stream connect failed");
                    failures += 1;
                    endpoint += 1;
                    if failures >= PULL_ONLY_AFTER {
                        let _ = self.capability.send(ChainCapability::PullOnly);
                    }
                    let base = if e.is_service_unavailable() {
                        RECONNECT_BASE_OVERLOADED
                    } else {
                        RECONNECT_BASE
                    };
                    let delay = backoff::jittered(base, RECONNECT_MAX, failures.saturating_sub(1));
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            }
            if failures >= PULL_ONLY_AFTER {
                let _ = self.capability.send(ChainCapability::PullOnly);
            }
            let delay = backoff::jittered(RECONNECT_BASE, RECONNECT_MAX, failures.saturating_sub(1));
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connected session: subscribe and forward until the socket drops.
    ///
    /// Returning `Ok` means the session was live and then ended; `Err` means
    /// it never got as far as a subscription.
    async fn session(&self, url: &Url) -> Result<(), ChainError> {
        let connect = ProviderBuilder::new().connect_ws(WsConnect::new(url.as_str()));
        let provider = tokio::time::timeout(RPC_TIMEOUT, connect)
            .await
            .map_err(|_| ChainError::Rpc(format!("ws connect timeout after {RPC_TIMEOUT:?}")))?
            .map_err(ChainError::from_display)?;
        let filter = Filter::new()
            .address(self.token)
            .event_signature(ERC20::Transfer::SIGNATURE_HASH);
        let subscription = provider
            .subscribe_logs(&filter)
            .await
            .map_err(ChainError::from_display)?;
        tracing::info!(endpoint = %url, "transfer stream subscribed");
        let _ = self.capability.send(ChainCapability::Push);
        let mut stream = subscription.into_stream();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                log = stream.next() => {
                    let Some(log) = log else {
                        // Upstream closed; the caller reconnects and
                        // re-subscribes.
                        return Ok(());
                    };
                    let Some(tx_hash) = log.transaction_hash else {
                        continue;
                    };
                    match log.log_decode::<ERC20::Transfer>() {
                        Ok(decoded) => {
                            let event = TransferEvent {
                                tx_hash: TxHash::from(tx_hash),
                                from: decoded.inner.data.from,
                                to: decoded.inner.data.to,
                                value: decoded.inner.data.value,
                                block_number: log.block_number,
                            };
                            if self.events.send(event).await.is_err() {
                                // Receiver gone; nothing left to feed.
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            tracing::debug!(tx = %tx_hash, error = %e, "skipping undecodable transfer log");
                        }
                    }
                }
            }
        }
    }
}
