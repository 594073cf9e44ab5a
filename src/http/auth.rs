//! Merchant request authentication, rate limiting, and idempotent replay.
//!
//! Every authenticated request carries `X-API-Key`, `X-Timestamp`,
//! `X-Nonce`, and `X-Signature`, where the signature is HMAC-SHA256 over
//! `timestamp\nnonce\nmethod\npath[\nbody]` under the merchant's API
//! secret. Timestamps older than five minutes are rejected outright, which
//! bounds the replay window to what the nonce protects.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use super::{ApiError, AppState};
use crate::types::Merchant;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted request age.
const TIMESTAMP_WINDOW_SECS: i64 = 300;
/// Request bodies beyond this are rejected before signature checking.
const MAX_BODY_BYTES: usize = 1 << 20;
/// Cached idempotent responses live this long.
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 3600);

/// The authenticated merchant, injected into request extensions.
#[derive(Clone)]
pub struct AuthedMerchant(pub Arc<Merchant>);

/// Fixed-window request counter per API key.
pub struct RateLimiter {
    limit_per_minute: u32,
    windows: DashMap<String, (i64, u32)>,
}

impl RateLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        Self {
            limit_per_minute,
            windows: DashMap::new(),
        }
    }

    /// Count one request; on rejection returns the window reset time
    /// (unix seconds) for `X-RateLimit-Reset`.
    pub fn check(&self, key: &str) -> Result<(), i64> {
        let now = Utc::now().timestamp();
        let window = now - now.rem_euclid(60);
        let mut entry = self.windows.entry(key.to_string()).or_insert((window, 0));
        let (start, count) = *entry;
        if start != window {
            *entry = (window, 1);
            return Ok(());
        }
        if count >= self.limit_per_minute {
            return Err(window + 60);
        }
        *entry = (start, count + 1);
        Ok(())
    }
}

/// The canonical string a merchant signs for a request.
pub fn canonical_message(
    timestamp: &str,
    nonce: &str,
    method: &str,
    path: &str,
    body: &[u8],
) -> String {
    let mut message = format!("{timestamp}\n{nonce}\n{method}\n{path}");
    if !body.is_empty() {
        message.push('\n');
        message.push_str(&String::from_utf8_lossy(body));
    }
    message
}

/// Constant-time verification of the hex signature over `message`.
pub fn verify_signature(secret: &str, message: &str, signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(message.as_bytes());
    mac.verify_slice(&signature).is_ok()
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Result<&'h str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized(format!("missing {name} header")))
}

/// Signature + rate-limit gate for the authenticated routes.
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match authenticate_inner(state, request, next).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn authenticate_inner(
    state: Arc<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let headers = request.headers();
    let api_key = header(headers, "X-API-Key")?.to_string();
    let timestamp = header(headers, "X-Timestamp")?.to_string();
    let nonce = header(headers, "X-Nonce")?.to_string();
    let signature = header(headers, "X-Signature")?.to_string();

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| ApiError::Unauthorized("malformed X-Timestamp".to_string()))?;
    if (Utc::now().timestamp() - ts).abs() > TIMESTAMP_WINDOW_SECS {
        return Err(ApiError::Unauthorized(
            "request timestamp outside the accepted window".to_string(),
        ));
    }

    let merchant = state
        .store
        .merchant_by_api_key(&api_key)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("unknown api key".to_string()))?;

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| ApiError::BadRequest("request body too large".to_string()))?;

    let message = canonical_message(&timestamp, &nonce, &method, &path, &bytes);
    if !verify_signature(&merchant.api_secret, &message, &signature) {
        return Err(ApiError::Unauthorized("invalid signature".to_string()));
    }

    if let Err(reset_at) = state.rate_limiter.check(&api_key) {
        return Err(ApiError::RateLimited { reset_at });
    }

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request
        .extensions_mut()
        .insert(AuthedMerchant(Arc::new(merchant)));
    Ok(next.run(request).await)
}

/// Replay cache for mutating routes carrying an `Idempotency-Key`.
///
/// Runs inside the authentication layer, so the merchant identity is
/// already attached. The first execution's JSON response is stored for 24 h
/// and replayed verbatim for the same `(merchant, key)` pair.
pub async fn idempotency(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    match idempotency_inner(state, request, next).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn idempotency_inner(
    state: Arc<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(key) = request
        .headers()
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return Ok(next.run(request).await);
    };
    let Some(AuthedMerchant(merchant)) = request.extensions().get::<AuthedMerchant>().cloned()
    else {
        return Ok(next.run(request).await);
    };

    if let Some((status, body)) = state.store.idempotent_response(merchant.id, &key).await? {
        tracing::debug!(%key, "replaying cached idempotent response");
        let status = axum::http::StatusCode::from_u16(status.clamp(100, 599) as u16)
            .unwrap_or(axum::http::StatusCode::OK);
        return Ok((status, axum::Json(body)).into_response());
    }

    let response = next.run(request).await;
    let status = response.status();
    // Only successful, definitive outcomes are worth replaying.
    if !status.is_success() {
        return Ok(response);
    }
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&bytes) {
        if let Err(e) = state
            .store
            .store_idempotent_response(
                merchant.id,
                &key,
                status.as_u16() as i32,
                &json,
                IDEMPOTENCY_TTL,
            )
            .await
        {
            tracing::warn!(error = %e, "can not store idempotent response");
        }
    }
    Ok(Response::from_parts(parts, Body::from(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_message_with_and_without_body() {
        let with = canonical_message("1700000000", "abc", "POST", "/payment-addresses", b"{}");
        assert_eq!(with, "1700000000\nabc\nPOST\n/payment-addresses\n{}");
        let without = canonical_message("1700000000", "abc", "GET", "/transactions", b"");
        assert_eq!(without, "1700000000\nabc\nGET\n/transactions");
    }

    #[test]
    fn signature_round_trip() {
        let secret = "sk_test_123";
        let message = canonical_message("1700000000", "n1", "POST", "/webhooks", b"{\"a\":1}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(message.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        assert!(verify_signature(secret, &message, &signature));
        assert!(!verify_signature("wrong-secret", &message, &signature));
        assert!(!verify_signature(secret, &message, "zz-not-hex"));
        assert!(!verify_signature(secret, "tampered", &signature));
    }

    #[test]
    fn rate_limiter_enforces_window() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.check("key").is_ok());
        assert!(limiter.check("key").is_ok());
        assert!(limiter.check("key").is_ok());
        let reset = limiter.check("key").unwrap_err();
        let now = Utc::now().timestamp();
        assert!(reset > now && reset <= now + 60);
        // Other keys are unaffected.
        assert!(limiter.check("other").is_ok());
    }
}
