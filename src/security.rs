use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, HeaderMap, Request, StatusCode, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

const API_KEY_HEADER: &str = "X-Listro-Key";

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, AuthContext>>,
    limiter: Arc<TokenBuckets>,
}

/// Caller identity attached to authenticated requests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: String,
    pub api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("API_KEYS").unwrap_or_default();
        let rate = env::var("RATE_LIMIT_PER_SEC")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v > 0.0)
            .unwrap_or(5.0);
        let burst = env::var("RATE_LIMIT_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|v| *v >= 1.0)
            .unwrap_or(10.0);
        Self::new(parse_api_keys(&raw), rate, burst)
    }

    pub fn new(keys: HashMap<String, AuthContext>, rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            keys: Arc::new(keys),
            limiter: Arc::new(TokenBuckets::new(rate_per_sec, capacity)),
        }
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = presented_key(request.headers()) else {
        return Ok(reject(
            StatusCode::UNAUTHORIZED,
            "missing_api_key",
            "Provide X-Listro-Key or a Bearer token",
        ));
    };
    let Some(context) = state.keys.get(&presented).cloned() else {
        return Ok(reject(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "Key not recognized",
        ));
    };

    let verdict = state.limiter.consume(&context.user_id).await;
    if let Some(retry_after) = verdict.retry_after {
        let mut response = reject(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "Too many requests");
        set_header(
            response.headers_mut(),
            "Retry-After",
            retry_after.ceil().max(1.0) as u64,
        );
        verdict.apply(response.headers_mut());
        return Ok(response);
    }

    request.extensions_mut().insert(context);
    let mut response = next.run(request).await;
    verdict.apply(response.headers_mut());
    Ok(response)
}

fn presented_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn reject(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: u64) {
    headers.insert(
        name,
        HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
}

/// Parses `user:key` pairs separated by commas. Falls back to a single demo key.
pub fn parse_api_keys(raw: &str) -> HashMap<String, AuthContext> {
    let mut keys = HashMap::new();
    for (idx, entry) in raw.split(',').map(str::trim).enumerate() {
        if entry.is_empty() {
            continue;
        }
        match entry.split_once(':') {
            Some((user, secret)) if !user.trim().is_empty() && !secret.trim().is_empty() => {
                keys.insert(
                    secret.trim().to_string(),
                    AuthContext {
                        user_id: user.trim().to_string(),
                        api_key_id: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(target = "listro.api", "ignored malformed API_KEYS entry #{}", idx + 1),
        }
    }

    if keys.is_empty() {
        warn!(
            target = "listro.api",
            "API_KEYS produced no keys; falling back to demo credentials"
        );
        keys.insert(
            "demo-key".to_string(),
            AuthContext {
                user_id: "demo-user".to_string(),
                api_key_id: "key-01".to_string(),
            },
        );
    } else {
        info!(target = "listro.api", key_count = keys.len(), "loaded API keys");
    }
    keys
}

struct TokenBuckets {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Bucket state after a request, rendered into `X-RateLimit-*` headers.
struct RateVerdict {
    capacity: f64,
    tokens: f64,
    rate: f64,
    retry_after: Option<f64>,
}

impl RateVerdict {
    fn apply(&self, headers: &mut HeaderMap) {
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        set_header(headers, "X-RateLimit-Limit", self.capacity as u64);
        set_header(
            headers,
            "X-RateLimit-Remaining",
            self.tokens.max(0.0).floor() as u64,
        );
        set_header(headers, "X-RateLimit-Reset", reset);
    }
}

impl TokenBuckets {
    fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    async fn consume(&self, key: &str) -> RateVerdict {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = guard.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        bucket.last_refill = now;

        let retry_after = if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            None
        } else {
            Some((1.0 - bucket.tokens) / self.rate_per_sec)
        };
        RateVerdict {
            capacity: self.capacity,
            tokens: bucket.tokens,
            rate: self.rate_per_sec,
            retry_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_keys_and_skips_malformed() {
        let keys = parse_api_keys("alice:k1, bad-entry ,bob:k2");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["k1"].user_id, "alice");
        assert_eq!(keys["k2"].user_id, "bob");
        assert_eq!(keys["k2"].api_key_id, "key-03");
    }

    #[test]
    fn empty_config_falls_back_to_demo_key() {
        let keys = parse_api_keys("");
        assert_eq!(keys["demo-key"].user_id, "demo-user");
    }

    #[test]
    fn bearer_and_header_keys() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static(" k1 "));
        assert_eq!(presented_key(&headers).as_deref(), Some("k1"));
        headers.insert(
            http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer k2"),
        );
        assert_eq!(presented_key(&headers).as_deref(), Some("k2"));
    }

    #[tokio::test]
    async fn bucket_runs_dry_after_capacity() {
        let buckets = TokenBuckets::new(0.001, 2.0);
        assert!(buckets.consume("u").await.retry_after.is_none());
        assert!(buckets.consume("u").await.retry_after.is_none());
        assert!(buckets.consume("u").await.retry_after.is_some());
        assert!(buckets.consume("other").await.retry_after.is_none());
    }
}
