//! Merchant-facing HTTP surface.
//!
//! A thin axum layer over the core services: address issuance, transaction
//! views, manual refunds, and webhook endpoint management. Mutating routes
//! honour an `Idempotency-Key` header (24 h replay window), every
//! authenticated route verifies the merchant request signature, and a
//! per-key fixed-window rate limit answers 429 with `X-RateLimit-Reset`.

pub mod auth;
pub mod handlers;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

use crate::address::{AddressError, AddressService};
use crate::config::Config;
use crate::queue::QueueService;
use crate::refund::{RefundEngine, RefundError};
use crate::store::{Store, StoreError};
use crate::types::ChainCapability;
use crate::webhook::WebhookDispatcher;

/// Shared state behind every handler.
pub struct AppState {
    pub store: Store,
    pub addresses: Arc<AddressService>,
    pub refunds: Arc<RefundEngine>,
    pub webhooks: WebhookDispatcher,
    pub queue: QueueService,
    pub capability: watch::Receiver<ChainCapability>,
    pub rate_limiter: auth::RateLimiter,
    pub default_webhook_secret: String,
    pub webhook_max_retries: i32,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Store,
        addresses: Arc<AddressService>,
        refunds: Arc<RefundEngine>,
        webhooks: WebhookDispatcher,
        queue: QueueService,
        capability: watch::Receiver<ChainCapability>,
    ) -> Self {
        Self {
            store,
            addresses,
            refunds,
            webhooks,
            queue,
            capability,
            rate_limiter: auth::RateLimiter::new(config.http.rate_limit_per_minute),
            default_webhook_secret: config.security.webhook_secret.to_string(),
            webhook_max_retries: config.webhook.max_retries as i32,
        }
    }
}

/// Error surface of the merchant API: `{code, message, details?}` with the
/// status matching the error class.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("rate limit exceeded")]
    RateLimited { reset_at: i64 },
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    fn code(&self) -> (&'static str, StatusCode) {
        match self {
            ApiError::BadRequest(_) => ("bad_request", StatusCode::BAD_REQUEST),
            ApiError::Unauthorized(_) => ("unauthorized", StatusCode::UNAUTHORIZED),
            ApiError::NotFound => ("not_found", StatusCode::NOT_FOUND),
            ApiError::Conflict(_) => ("conflict", StatusCode::CONFLICT),
            ApiError::Unprocessable(_) => ("unprocessable", StatusCode::UNPROCESSABLE_ENTITY),
            ApiError::RateLimited { .. } => ("rate_limited", StatusCode::TOO_MANY_REQUESTS),
            ApiError::Internal(_) => ("internal_error", StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = self.code();
        // Internal details stay in the logs, not on the wire.
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(%detail, "internal error on merchant api");
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        let body = Json(json!({ "code": code, "message": message }));
        let mut response = (status, body).into_response();
        if let ApiError::RateLimited { reset_at } = self {
            if let Ok(value) = reset_at.to_string().parse() {
                response
                    .headers_mut()
                    .insert("X-RateLimit-Reset", value);
            }
        }
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(detail) => ApiError::Conflict(detail),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AddressError> for ApiError {
    fn from(e: AddressError) -> Self {
        match e {
            AddressError::LockBusy | AddressError::WatchdogExpired => {
                ApiError::Internal(e.to_string())
            }
            AddressError::IndexContention => ApiError::Conflict(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RefundError> for ApiError {
    fn from(e: RefundError) -> Self {
        match e {
            RefundError::Rejected(detail) => ApiError::Unprocessable(detail),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
