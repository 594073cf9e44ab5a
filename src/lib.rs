//! Core of a crypto payment gateway for a BEP20-style USDT token.
//!
//! The gateway ingests on-chain token transfers, attributes them to
//! merchants, drives each payment through a confirmation state machine,
//! sweeps settled funds from single-use deposit addresses to hot wallets
//! and onward to cold storage, refunds overpayments and late payments, and
//! notifies merchants through signed, retried HTTP webhooks.
//!
//! # Architecture
//!
//! Components are constructed once at the application root and communicate
//! through the work queue and typed channels; none reaches for global
//! state. Data flows:
//!
//! ```text
//! chain stream / poller → observer → confirmation engine ⇄ work queue
//!                                        ⇅                    ⇅
//!                                   persistence      settlement / refund /
//!                                                     payout / webhooks
//! ```
//!
//! # Modules
//!
//! - [`address`] — monotonic derivation of deposit and hot-wallet addresses.
//! - [`chain`] — failover JSON-RPC pool and the push `Transfer` stream.
//! - [`config`] — JSON configuration with environment references.
//! - [`confirm`] — the per-transaction confirmation state machine.
//! - [`http`] — the merchant REST surface.
//! - [`observer`] — monitored-address set, push→pull ingestion failover.
//! - [`payout`] — outbound merchant payouts.
//! - [`queue`] — at-least-once work queue with direct in-process fallback.
//! - [`refund`] — overpayment, post-expiry, and manual refunds.
//! - [`settle`] — sweeps to hot wallets and hot→cold transfers.
//! - [`store`] — PostgreSQL persistence, status CAS, audit log.
//! - [`types`] — domain types shared across the gateway.
//! - [`vault`] — HD key derivation and private-key encryption at rest.
//! - [`webhook`] — signed webhook fan-out and delivery.

pub mod address;
pub mod chain;
pub mod config;
pub mod confirm;
pub mod http;
pub mod observer;
pub mod payout;
pub mod queue;
pub mod refund;
pub mod settle;
pub mod store;
pub mod types;
pub mod util;
pub mod vault;
pub mod webhook;
