//! Route handlers of the merchant API.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;
use uuid::Uuid;

use super::auth::{AuthedMerchant, authenticate, idempotency};
use super::{ApiError, AppState};
use crate::address::DepositRequest;
use crate::types::{ChainCapability, EntityKind, WebhookEvent};

/// Assemble the full router: a public health probe plus the authenticated
/// merchant surface.
pub fn routes(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .route("/payment-addresses", post(create_payment_address))
        .route("/payment-addresses/{id}", get(get_payment_address))
        .route("/transactions", get(list_transactions))
        .route("/transactions/{id}", get(get_transaction))
        .route("/transactions/{id}/audit", get(get_transaction_audit))
        .route("/transactions/{id}/refunds", post(create_refund))
        .route("/webhooks", post(create_webhook).get(list_webhooks))
        .route("/webhooks/{id}", axum::routing::delete(disable_webhook))
        .layer(middleware::from_fn_with_state(state.clone(), idempotency))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate));
    Router::new()
        .route("/health", get(get_health))
        .merge(authenticated)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAddressBody {
    pub expected_amount: Option<Decimal>,
    /// Overrides the configured address lifetime.
    pub expires_in_ms: Option<u64>,
}

/// `POST /payment-addresses`: derive a fresh deposit address.
///
/// The address is monitored from the moment the response is sent.
#[instrument(skip_all)]
async fn create_payment_address(
    State(state): State<Arc<AppState>>,
    Extension(AuthedMerchant(merchant)): Extension<AuthedMerchant>,
    Json(body): Json<CreateAddressBody>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(amount) = body.expected_amount {
        if amount <= Decimal::ZERO {
            return Err(ApiError::BadRequest(
                "expectedAmount must be positive".to_string(),
            ));
        }
    }
    let address = state
        .addresses
        .issue_deposit_address(DepositRequest {
            merchant_id: merchant.id,
            expected_amount: body.expected_amount,
            expires_in: body.expires_in_ms.map(Duration::from_millis),
        })
        .await?;
    let fields = json!({
        "addressId": address.id,
        "address": address.address,
        "expectedAmount": address.expected_amount.map(|a| a.to_string()),
        "currency": address.currency,
        "expiresAt": address.expires_at,
    });
    if let Err(e) = state
        .webhooks
        .emit(merchant.id, WebhookEvent::AddressCreated, fields)
        .await
    {
        tracing::warn!(error = %e, "can not emit address-created");
    }
    Ok((StatusCode::CREATED, Json(address)))
}

/// `GET /payment-addresses/{id}`
#[instrument(skip_all)]
async fn get_payment_address(
    State(state): State<Arc<AppState>>,
    Extension(AuthedMerchant(merchant)): Extension<AuthedMerchant>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let address = state
        .store
        .address_by_id(id)
        .await?
        .filter(|a| a.merchant_id == Some(merchant.id))
        .ok_or(ApiError::NotFound)?;
    Ok(Json(address))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// `GET /transactions`
#[instrument(skip_all)]
async fn list_transactions(
    State(state): State<Arc<AppState>>,
    Extension(AuthedMerchant(merchant)): Extension<AuthedMerchant>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.clamp(1, 200);
    let offset = query.offset.max(0);
    let transactions = state
        .store
        .transactions_for_merchant(merchant.id, limit, offset)
        .await?;
    Ok(Json(json!({
        "transactions": transactions,
        "limit": limit,
        "offset": offset,
    })))
}

/// `GET /transactions/{id}`
#[instrument(skip_all)]
async fn get_transaction(
    State(state): State<Arc<AppState>>,
    Extension(AuthedMerchant(merchant)): Extension<AuthedMerchant>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let transaction = state
        .store
        .transaction_by_id(id)
        .await?
        .filter(|t| t.merchant_id == Some(merchant.id))
        .ok_or(ApiError::NotFound)?;
    Ok(Json(transaction))
}

/// `GET /transactions/{id}/audit`: the append-only trail of one
/// transaction's state changes.
#[instrument(skip_all)]
async fn get_transaction_audit(
    State(state): State<Arc<AppState>>,
    Extension(AuthedMerchant(merchant)): Extension<AuthedMerchant>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .store
        .transaction_by_id(id)
        .await?
        .filter(|t| t.merchant_id == Some(merchant.id))
        .ok_or(ApiError::NotFound)?;
    let entries = state
        .store
        .audit_entries_for(EntityKind::Transaction, &id.to_string())
        .await?;
    Ok(Json(json!({ "audit": entries })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRefundBody {
    pub amount: Option<Decimal>,
    pub refund_address: Option<String>,
    pub reason: Option<String>,
}

/// `POST /transactions/{id}/refunds`: operator-initiated refund.
#[instrument(skip_all)]
async fn create_refund(
    State(state): State<Arc<AppState>>,
    Extension(AuthedMerchant(merchant)): Extension<AuthedMerchant>,
    Path(id): Path<Uuid>,
    Json(body): Json<CreateRefundBody>,
) -> Result<impl IntoResponse, ApiError> {
    // The transaction must belong to the calling merchant.
    state
        .store
        .transaction_by_id(id)
        .await?
        .filter(|t| t.merchant_id == Some(merchant.id))
        .ok_or(ApiError::NotFound)?;
    let reason = body.reason.unwrap_or_else(|| "merchant refund".to_string());
    let refund = state
        .refunds
        .initiate_manual(
            &state.webhooks,
            id,
            body.amount,
            body.refund_address,
            &reason,
            &format!("merchant:{}", merchant.id),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(refund)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWebhookBody {
    pub url: url::Url,
    pub events: Vec<String>,
    pub secret: Option<String>,
}

/// `POST /webhooks`: register a delivery endpoint.
#[instrument(skip_all)]
async fn create_webhook(
    State(state): State<Arc<AppState>>,
    Extension(AuthedMerchant(merchant)): Extension<AuthedMerchant>,
    Json(body): Json<CreateWebhookBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.events.is_empty() {
        return Err(ApiError::BadRequest(
            "at least one event subscription is required".to_string(),
        ));
    }
    for event in &body.events {
        event
            .parse::<WebhookEvent>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    }
    let secret = body
        .secret
        .unwrap_or_else(|| state.default_webhook_secret.clone());
    let endpoint = state
        .store
        .insert_webhook_endpoint(
            merchant.id,
            body.url.as_str(),
            &body.events,
            &secret,
            state.webhook_max_retries,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(endpoint)))
}

/// `GET /webhooks`
#[instrument(skip_all)]
async fn list_webhooks(
    State(state): State<Arc<AppState>>,
    Extension(AuthedMerchant(merchant)): Extension<AuthedMerchant>,
) -> Result<impl IntoResponse, ApiError> {
    let endpoints = state
        .store
        .webhook_endpoints_for_merchant(merchant.id)
        .await?;
    Ok(Json(json!({ "webhooks": endpoints })))
}

/// `DELETE /webhooks/{id}`: endpoints are disabled, never deleted, so the
/// delivery history stays attributable.
#[instrument(skip_all)]
async fn disable_webhook(
    State(state): State<Arc<AppState>>,
    Extension(AuthedMerchant(merchant)): Extension<AuthedMerchant>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.store.disable_endpoint(id, merchant.id).await? {
        return Err(ApiError::NotFound);
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /health`: liveness plus the degradation signals an operator cares
/// about — queue mode, chain ingestion capability, database breaker.
#[instrument(skip_all)]
async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let capability = match *state.capability.borrow() {
        ChainCapability::Push => "push",
        ChainCapability::PullOnly => "pull-only",
    };
    Json(json!({
        "status": "ok",
        "queueMode": if state.queue.in_direct_mode() { "direct" } else { "broker" },
        "chainCapability": capability,
        "databaseBreakerOpen": state.store.breaker_open(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_address_body_parses_camel_case() {
        let body: CreateAddressBody =
            serde_json::from_str(r#"{"expectedAmount": "100.5", "expiresInMs": 3600000}"#).unwrap();
        assert_eq!(body.expected_amount, Some("100.5".parse().unwrap()));
        assert_eq!(body.expires_in_ms, Some(3_600_000));
    }

    #[test]
    fn refund_body_fields_are_optional() {
        let body: CreateRefundBody = serde_json::from_str("{}").unwrap();
        assert!(body.amount.is_none());
        assert!(body.refund_address.is_none());
        assert!(body.reason.is_none());
    }

    #[test]
    fn webhook_body_requires_valid_url() {
        let ok: Result<CreateWebhookBody, _> = serde_json::from_str(
            r#"{"url": "https://merchant.example/hooks", "events": ["payment-received"]}"#,
        );
        assert!(ok.is_ok());
        let bad: Result<CreateWebhookBody, _> =
            serde_json::from_str(r#"{"url": "not a url", "events": []}"#);
        assert!(bad.is_err());
    }
}
