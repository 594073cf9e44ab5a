//! The chain observer: owns the monitored-address set and feeds the
//! confirmation engine from whichever ingestion path is currently healthy.
//!
//! In push mode, decoded `Transfer` events arrive from the stream task and
//! go straight into the observation algorithm. When the stream degrades to
//! pull-only, a poller compares each monitored address's live token balance
//! against its cached value every 30 s; any increase pulls the recent
//! transfer logs and runs the same algorithm, so both paths share the
//! tx-hash idempotency that prevents duplicates when push recovers.
//!
//! The observer is the single writer of the monitored set: it adds freshly
//! issued addresses, drops expired ones during the periodic expiry sweep,
//! and refreshes the whole snapshot from storage on each sweep so a missed
//! notification heals itself.

use alloy::primitives::U256;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::chain::RpcPool;
use crate::confirm::ConfirmationEngine;
use crate::store::{Store, StoreError};
use crate::types::{ChainCapability, PaymentAddress, TransferEvent, WebhookEvent, parse_evm_address};
use crate::util::backoff;
use crate::webhook::WebhookDispatcher;

/// Balance-poll cadence while the push stream is down.
const POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Blocks re-scanned at poll-mode entry to cover the gap around the switch.
const POLL_OVERLAP: u64 = 50;
/// Expiry sweep cadence.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// In-line retries before an observation is abandoned to the audit log.
const INGEST_RETRIES: u32 = 3;

pub struct ChainObserver {
    store: Store,
    chain: Arc<RpcPool>,
    engine: Arc<ConfirmationEngine>,
    webhooks: WebhookDispatcher,
    /// Lowercased address → row id. Written only by observer tasks.
    monitored: DashMap<String, Uuid>,
    /// Cached token balances for delta detection in pull mode.
    balances: DashMap<String, U256>,
    cancel: CancellationToken,
}

impl ChainObserver {
    pub fn new(
        store: Store,
        chain: Arc<RpcPool>,
        engine: Arc<ConfirmationEngine>,
        webhooks: WebhookDispatcher,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            chain,
            engine,
            webhooks,
            monitored: DashMap::new(),
            balances: DashMap::new(),
            cancel,
        }
    }

    /// Load the watch list and spawn the observer's long-lived tasks.
    pub async fn start(
        self: Arc<Self>,
        events: mpsc::Receiver<TransferEvent>,
        issued: mpsc::Receiver<PaymentAddress>,
        capability: watch::Receiver<ChainCapability>,
        tracker: &TaskTracker,
    ) -> Result<(), StoreError> {
        let initial = self.store.monitored_addresses().await?;
        for address in &initial {
            self.monitored
                .insert(address.address.to_lowercase(), address.id);
            self.balances
                .insert(address.address.to_lowercase(), U256::ZERO);
        }
        tracing::info!(count = initial.len(), "monitoring addresses");

        let observer = Arc::clone(&self);
        tracker.spawn(async move { observer.event_loop(events).await });
        let observer = Arc::clone(&self);
        tracker.spawn(async move { observer.issuance_loop(issued).await });
        let observer = Arc::clone(&self);
        tracker.spawn(async move { observer.poll_loop(capability).await });
        let observer = Arc::clone(&self);
        tracker.spawn(async move { observer.expiry_loop().await });
        Ok(())
    }

    /// Push path: every decoded transfer goes to the observation algorithm,
    /// which resolves recipients against storage (so late payments to
    /// expired addresses are still caught).
    async fn event_loop(&self, mut events: mpsc::Receiver<TransferEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events.recv() => {
                    let Some(event) = event else { return };
                    self.ingest(event).await;
                }
            }
        }
    }

    /// Run one observation with bounded in-line retries; an abandoned event
    /// leaves a system-error audit entry for the operator.
    async fn ingest(&self, event: TransferEvent) {
        for attempt in 0..INGEST_RETRIES {
            match self.engine.observe(&event).await {
                Ok(()) => return,
                Err(e) if e.is_retriable() => {
                    let delay =
                        backoff::exponential(Duration::from_secs(5), Duration::from_secs(60), attempt);
                    tracing::warn!(tx = %event.tx_hash, error = %e, "observation failed; retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(tx = %event.tx_hash, error = %e, "observation rejected");
                    return;
                }
            }
        }
        let detail = format!("dropped transfer event {} after retries", event.tx_hash);
        tracing::error!("{detail}");
        if let Err(e) = self.store.audit_system_error(&detail, "observer").await {
            tracing::warn!(error = %e, "can not record dropped event");
        }
    }

    /// Watch-list growth: each freshly issued address is monitored from the
    /// moment it is handed out.
    async fn issuance_loop(&self, mut issued: mpsc::Receiver<PaymentAddress>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                address = issued.recv() => {
                    let Some(address) = address else { return };
                    let key = address.address.to_lowercase();
                    tracing::debug!(address = %address.address, "watching new address");
                    self.monitored.insert(key.clone(), address.id);
                    self.balances.insert(key, U256::ZERO);
                }
            }
        }
    }

    /// Pull fallback: runs only while the stream advertises pull-only.
    async fn poll_loop(&self, mut capability: watch::Receiver<ChainCapability>) {
        loop {
            // Wait for the stream to degrade.
            while *capability.borrow() == ChainCapability::Push {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    changed = capability.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            tracing::warn!("push stream degraded; polling balances for deposits");
            let mut next_block = self
                .chain
                .get_block_number()
                .await
                .unwrap_or_default()
                .saturating_sub(POLL_OVERLAP);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(POLL_INTERVAL) => {}
                }
                if *capability.borrow() == ChainCapability::Push {
                    tracing::info!("push stream restored; polling stopped");
                    break;
                }
                if let Err(e) = self.poll_once(&mut next_block).await {
                    tracing::warn!(error = %e, "balance poll failed");
                }
            }
        }
    }

    /// One poll round: detect balance increases, then pull and replay the
    /// transfer logs since the last round.
    async fn poll_once(&self, next_block: &mut u64) -> Result<(), crate::chain::ChainError> {
        let current = self.chain.get_block_number().await?;
        let mut increase_seen = false;
        for entry in self.monitored.iter() {
            let Ok(address) = parse_evm_address(entry.key()) else {
                continue;
            };
            let balance = self.chain.token_balance_of(address).await?;
            let previous = self
                .balances
                .get(entry.key())
                .map(|b| *b)
                .unwrap_or(U256::ZERO);
            if balance > previous {
                increase_seen = true;
            }
            self.balances.insert(entry.key().clone(), balance);
        }
        if increase_seen && *next_block <= current {
            let events = self.chain.transfer_logs(*next_block, current).await?;
            for event in events {
                let key = event.to.to_string().to_lowercase();
                if self.monitored.contains_key(&key) {
                    self.ingest(event).await;
                }
            }
        }
        *next_block = current + 1;
        Ok(())
    }

    /// Expire overdue addresses, announce it, and refresh the snapshot.
    async fn expiry_loop(&self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(EXPIRY_SWEEP_INTERVAL) => {}
            }
            match self.store.expire_overdue_addresses().await {
                Ok(expired) => {
                    for address in expired {
                        let key = address.address.to_lowercase();
                        self.monitored.remove(&key);
                        self.balances.remove(&key);
                        tracing::info!(address = %address.address, "address expired");
                        if let Some(merchant_id) = address.merchant_id {
                            let fields = serde_json::json!({
                                "addressId": address.id,
                                "address": address.address,
                                "expectedAmount": address.expected_amount.map(|a| a.to_string()),
                                "currency": address.currency,
                            });
                            if let Err(e) = self
                                .webhooks
                                .emit(merchant_id, WebhookEvent::AddressExpired, fields)
                                .await
                            {
                                tracing::warn!(error = %e, "can not emit address-expired");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "expiry sweep failed");
                    continue;
                }
            }
            // Re-sync the snapshot so missed issuance notifications heal.
            match self.store.monitored_addresses().await {
                Ok(fresh) => {
                    let keep: std::collections::HashSet<String> = fresh
                        .iter()
                        .map(|a| a.address.to_lowercase())
                        .collect();
                    self.monitored.retain(|key, _| keep.contains(key));
                    for address in fresh {
                        let key = address.address.to_lowercase();
                        self.monitored.entry(key.clone()).or_insert(address.id);
                        self.balances.entry(key).or_insert(U256::ZERO);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "can not refresh monitored set"),
            }
        }
    }
}
