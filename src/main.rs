//! Payment gateway entrypoint.
//!
//! Construction order matters only in that consumers must be registered on
//! the queue before the first publish can fall back to direct dispatch:
//! persistence and the vault come up first, then the queue, then the
//! engines register as consumers, then chain ingestion starts, and the
//! HTTP surface goes live last.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` names the JSON configuration file
//! - `OTEL_*` variables enable tracing export

use dotenvy::dotenv;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::task::TaskTracker;
use tower_http::cors;
use tower_http::trace::TraceLayer;

use paygate_rs::address::AddressService;
use paygate_rs::chain::{RpcPool, TransferStream};
use paygate_rs::config::Config;
use paygate_rs::confirm::ConfirmationEngine;
use paygate_rs::http::{AppState, handlers};
use paygate_rs::observer::ChainObserver;
use paygate_rs::payout::PayoutEngine;
use paygate_rs::queue::{PublishOptions, QueueName, QueueService, SettlementTask};
use paygate_rs::refund::RefundEngine;
use paygate_rs::settle::SettlementEngine;
use paygate_rs::store::Store;
use paygate_rs::types::ChainCapability;
use paygate_rs::util::{Shutdown, Telemetry};
use paygate_rs::vault::KeyVault;
use paygate_rs::webhook::WebhookDispatcher;

/// Cadence of the periodic full sweep.
const SETTLEMENT_INTERVAL: Duration = Duration::from_secs(300);
/// Cadence of the hot→cold threshold check.
const HOT_TO_COLD_INTERVAL: Duration = Duration::from_secs(600);
/// Cadence of the re-check sweep for transactions whose queued check was
/// lost (broker outage, crash between ack and re-enqueue).
const MONITOR_SWEEP_INTERVAL: Duration = Duration::from_secs(120);
/// A non-terminal transaction untouched for this long gets a fresh check.
const MONITOR_STALE_AFTER: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let _telemetry = Telemetry::init();

    let config = Config::load()?;
    let shutdown = Shutdown::install()?;
    let cancel = shutdown.token();
    let tracker = TaskTracker::new();

    let store = Store::connect(&config.database).await?;
    tracing::info!("database connected, migrations applied");

    let vault = Arc::new(KeyVault::new(
        config.wallet.mnemonic.to_string(),
        config.wallet.hd_base_path.clone(),
        config.security.encryption_key_bytes()?,
    ));

    let token_contract = *config.chain.token_contract;
    let gas_price = *config.chain.gas_price;
    let gas_limit = config.chain.gas_limit;
    let chain = Arc::new(RpcPool::new(config.chain.rpc_urls.clone(), token_contract));

    let queue = QueueService::new(config.queue.clone(), store.clone(), cancel.clone());
    queue.start().await;

    let webhooks = WebhookDispatcher::new(store.clone(), queue.clone(), config.webhook.clone());

    let (issued_tx, issued_rx) = mpsc::channel(256);
    let addresses = Arc::new(AddressService::new(
        store.clone(),
        Arc::clone(&vault),
        config.chain.currency.clone(),
        Duration::from_millis(config.wallet.address_lifetime_ms),
        issued_tx,
    ));

    let confirm = Arc::new(ConfirmationEngine::new(
        store.clone(),
        Arc::clone(&chain),
        queue.clone(),
        webhooks.clone(),
        config.chain.confirmations,
        config.payment.clone(),
    ));
    let refunds = Arc::new(RefundEngine::new(
        store.clone(),
        Arc::clone(&chain),
        queue.clone(),
        Arc::clone(&vault),
        gas_price,
        gas_limit,
    ));
    let settlement = Arc::new(SettlementEngine::new(
        store.clone(),
        Arc::clone(&chain),
        queue.clone(),
        Arc::clone(&vault),
        Arc::clone(&addresses),
        gas_price,
        gas_limit,
        config.wallet.hot_threshold.clone().into_inner(),
        config.wallet.cold_address.clone().map(|c| c.into_inner()),
        alloy::primitives::U256::from(config.wallet.gas_reserve_wei),
    ));
    let payouts = Arc::new(PayoutEngine::new(
        store.clone(),
        Arc::clone(&chain),
        queue.clone(),
        Arc::clone(&vault),
        webhooks.clone(),
        gas_price,
        gas_limit,
        config.chain.currency.clone(),
    ));

    // Consumers go live before any ingestion so direct-mode publishes
    // always find their handler.
    queue.consume(
        QueueName::PaymentMonitor,
        Arc::clone(&confirm) as Arc<dyn paygate_rs::queue::QueueHandler>,
    );
    queue.consume(QueueName::WebhookSend, Arc::new(webhooks.clone()));
    queue.consume(
        QueueName::SettlementProcess,
        Arc::clone(&settlement) as Arc<dyn paygate_rs::queue::QueueHandler>,
    );
    queue.consume(
        QueueName::RefundProcess,
        Arc::clone(&refunds) as Arc<dyn paygate_rs::queue::QueueHandler>,
    );
    queue.consume(
        QueueName::PayoutProcess,
        Arc::clone(&payouts) as Arc<dyn paygate_rs::queue::QueueHandler>,
    );

    // Chain ingestion: push stream plus the observer that owns failover.
    let (events_tx, events_rx) = mpsc::channel(1024);
    let (capability_tx, capability_rx) = watch::channel(ChainCapability::Push);
    let stream = TransferStream::new(
        config.chain.ws_urls.clone(),
        token_contract,
        events_tx,
        capability_tx,
        cancel.clone(),
    );
    tracker.spawn(stream.run());

    let observer = Arc::new(ChainObserver::new(
        store.clone(),
        Arc::clone(&chain),
        Arc::clone(&confirm),
        webhooks.clone(),
        cancel.clone(),
    ));
    observer
        .start(events_rx, issued_rx, capability_rx.clone(), &tracker)
        .await?;

    // Periodic drivers: the sweeper and the hot→cold mover run on their own
    // cadence in addition to on-demand nudges through the queue.
    {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(SETTLEMENT_INTERVAL) => {}
                }
                let task = SettlementTask { merchant_id: None };
                if let Err(e) = queue
                    .publish(QueueName::SettlementProcess, &task, PublishOptions::default())
                    .await
                {
                    tracing::warn!(error = %e, "can not enqueue periodic sweep");
                }
            }
        });
    }
    {
        let settlement = Arc::clone(&settlement);
        let cancel = cancel.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(HOT_TO_COLD_INTERVAL) => {}
                }
                if let Err(e) = settlement.run_hot_to_cold().await {
                    tracing::warn!(error = %e, "hot-to-cold run failed");
                }
            }
        });
    }
    {
        // Confirmation progress must not depend on the broker keeping our
        // delayed re-checks: anything stale gets a fresh check task, and
        // tx-hash idempotency makes the extra checks harmless.
        let store = store.clone();
        let queue = queue.clone();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(MONITOR_SWEEP_INTERVAL) => {}
                }
                let stale = match store
                    .stale_active_transactions(MONITOR_STALE_AFTER, 200)
                    .await
                {
                    Ok(stale) => stale,
                    Err(e) => {
                        tracing::warn!(error = %e, "monitor sweep query failed");
                        continue;
                    }
                };
                for tx in stale {
                    let task = paygate_rs::queue::ConfirmationCheckTask {
                        transaction_id: tx.id,
                    };
                    if let Err(e) = queue
                        .publish(QueueName::PaymentMonitor, &task, PublishOptions::default())
                        .await
                    {
                        tracing::warn!(error = %e, "can not enqueue stale re-check");
                    }
                }
            }
        });
    }

    let state = Arc::new(AppState::new(
        &config,
        store.clone(),
        Arc::clone(&addresses),
        Arc::clone(&refunds),
        webhooks.clone(),
        queue.clone(),
        capability_rx,
    ));
    let app = handlers::routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.http.host, config.http.port);
    tracing::info!("starting gateway at http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let shutdown_token = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown_token.cancelled().await })
        .await?;

    // The server is down; wind down the background tasks.
    cancel.cancel();
    tracker.close();
    tracker.wait().await;
    queue.shutdown().await;
    tracing::info!("gateway stopped");
    Ok(())
}
