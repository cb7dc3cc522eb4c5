use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Shared-key auth for the sync endpoints. Callers are internal services
/// (the catalog backend, ops tooling), each with its own key so a leaked
/// key can be rotated without touching the others.
#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, String>>,
    limiter: Arc<TokenBuckets>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub caller_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let keys = Arc::new(load_keys_from_env());
        let limiter = Arc::new(TokenBuckets::from_env());
        Self { keys, limiter }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.keys.get(presented).map(|caller| AuthContext {
            caller_id: caller.clone(),
        })
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        return Ok(unauthorized("missing_api_key", "Provide X-Sync-Key or Bearer token"));
    };

    let Some(context) = state.authenticate(&presented) else {
        return Ok(unauthorized("invalid_api_key", "Key not recognized"));
    };

    match state.limiter.consume(&context.caller_id).await {
        Ok(snapshot) => {
            request.extensions_mut().insert(context);
            let mut response = next.run(request).await;
            snapshot.apply_headers(response.headers_mut());
            Ok(response)
        }
        Err(snapshot) => {
            let payload = ApiError {
                error: "rate_limited".to_string(),
                detail: Some("Too many requests".to_string()),
            };
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(payload)).into_response();
            snapshot.apply_headers(response.headers_mut());
            Ok(response)
        }
    }
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Sync-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

/// `SYNC_API_KEYS` is `caller:key[,caller:key...]`; the map goes from
/// presented key to caller id.
fn load_keys_from_env() -> HashMap<String, String> {
    let raw = env::var("SYNC_API_KEYS").unwrap_or_else(|_| "catalog:local-dev-key".to_string());
    let mut entries = HashMap::new();
    for token in raw.split(',') {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let caller = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (caller, key) {
            (Some(caller), Some(secret)) => {
                entries.insert(secret.to_string(), caller.to_string());
            }
            _ => warn!(
                target = "sync.api",
                "ignored malformed SYNC_API_KEYS entry: {trimmed}"
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "sync.api",
            "SYNC_API_KEYS produced no keys; falling back to local dev credentials"
        );
        entries.insert("local-dev-key".to_string(), "catalog".to_string());
    } else {
        info!(
            target = "sync.api",
            key_count = entries.len(),
            "loaded API keys from env"
        );
    }

    entries
}

#[derive(Clone)]
struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Arc<Mutex<HashMap<String, BucketState>>>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Bucket view after a consume attempt; `retry_after` is set only when the
/// attempt was refused.
#[derive(Debug, Clone)]
pub struct RateSnapshot {
    capacity: f64,
    tokens: f64,
    rate: f64,
    retry_after: Option<f64>,
}

impl TokenBuckets {
    fn from_env() -> Self {
        let rate_per_sec = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| *value >= 1.0)
            .unwrap_or(10.0);
        Self {
            rate_per_sec,
            capacity,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn consume(&self, key: &str) -> Result<RateSnapshot, RateSnapshot> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RateSnapshot {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
                retry_after: None,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateSnapshot {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
                retry_after: Some((deficit / self.rate_per_sec).max(0.0)),
            })
        }
    }
}

impl RateSnapshot {
    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        if let Some(retry_after) = self.retry_after {
            let retry = retry_after.ceil().max(0.0) as u64;
            headers.insert(
                http::header::RETRY_AFTER,
                HeaderValue::from_str(&retry.to_string())
                    .unwrap_or_else(|_| HeaderValue::from_static("1")),
            );
        }
        let remaining = self.tokens.max(0.0).floor() as u64;
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert(
            "X-RateLimit-Limit",
            HeaderValue::from_str(&(self.capacity as u64).to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
        headers.insert(
            "X-RateLimit-Remaining",
            HeaderValue::from_str(&remaining.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
        headers.insert(
            "X-RateLimit-Reset",
            HeaderValue::from_str(&reset.to_string())
                .unwrap_or_else(|_| HeaderValue::from_static("0")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buckets(rate: f64, capacity: f64) -> TokenBuckets {
        TokenBuckets {
            rate_per_sec: rate,
            capacity,
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[tokio::test]
    async fn bucket_refuses_once_drained() {
        let limiter = buckets(1.0, 2.0);
        assert!(limiter.consume("catalog").await.is_ok());
        assert!(limiter.consume("catalog").await.is_ok());
        let refused = limiter.consume("catalog").await.unwrap_err();
        assert!(refused.retry_after.is_some());
    }

    #[tokio::test]
    async fn buckets_are_per_caller() {
        let limiter = buckets(1.0, 1.0);
        assert!(limiter.consume("catalog").await.is_ok());
        assert!(limiter.consume("ops").await.is_ok());
        assert!(limiter.consume("catalog").await.is_err());
    }
}
