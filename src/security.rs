use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, Request, StatusCode, header, header::HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const API_KEY_HEADER: &str = "X-Atelier-Key";
const DEFAULT_KEYS: &str = "local:atelier-dev-key";

/// Who is calling. Sessions are scoped to `tenant`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthContext {
    pub tenant: String,
    pub key_label: String,
}

#[derive(Clone)]
pub struct AuthState {
    keys: Arc<HashMap<String, AuthContext>>,
    limiter: Arc<RateLimiter>,
}

impl AuthState {
    pub fn from_env() -> Self {
        let raw = env::var("ATELIER_API_KEYS").unwrap_or_else(|_| DEFAULT_KEYS.to_string());
        let mut keys = parse_key_spec(&raw);
        if keys.is_empty() {
            warn!(
                target = "atelier.api",
                "ATELIER_API_KEYS produced no keys; using the local development key"
            );
            keys = parse_key_spec(DEFAULT_KEYS);
        } else {
            info!(target = "atelier.api", key_count = keys.len(), "api keys loaded");
        }
        Self::new(keys, RateLimiter::from_env())
    }

    pub fn new(keys: HashMap<String, AuthContext>, limiter: RateLimiter) -> Self {
        Self {
            keys: Arc::new(keys),
            limiter: Arc::new(limiter),
        }
    }
}

/// Parse `tenant:key` pairs separated by commas. Malformed entries are skipped.
pub fn parse_key_spec(raw: &str) -> HashMap<String, AuthContext> {
    let mut keys = HashMap::new();
    for (idx, entry) in raw.split(',').map(str::trim).enumerate() {
        if entry.is_empty() {
            continue;
        }
        match entry.split_once(':') {
            Some((tenant, secret)) if !tenant.trim().is_empty() && !secret.trim().is_empty() => {
                keys.insert(
                    secret.trim().to_string(),
                    AuthContext {
                        tenant: tenant.trim().to_string(),
                        key_label: format!("key-{:02}", idx + 1),
                    },
                );
            }
            _ => warn!(
                target = "atelier.api",
                position = idx + 1,
                "ignored malformed ATELIER_API_KEYS entry"
            ),
        }
    }
    keys
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
            "Provide X-Atelier-Key or a Bearer token",
        ));
    };
    let Some(context) = state.keys.get(&presented).cloned() else {
        return Ok(reject(StatusCode::UNAUTHORIZED, "invalid_api_key", "Key not recognized"));
    };

    let verdict = state.limiter.take(&context.tenant).await;
    if !verdict.allowed {
        warn!(target = "atelier.api", tenant = %context.tenant, "rate_limited");
        let mut response = reject(StatusCode::TOO_MANY_REQUESTS, "rate_limited", "Too many requests");
        verdict.write_headers(response.headers_mut());
        return Ok(response);
    }

    request.extensions_mut().insert(context);
    let mut response = next.run(request).await;
    verdict.write_headers(response.headers_mut());
    Ok(response)
}

fn presented_key(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| {
            let (scheme, token) = raw.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim().to_string())
        });
    bearer
        .or_else(|| {
            headers
                .get(API_KEY_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.trim().to_string())
        })
        .filter(|value| !value.is_empty())
}

fn reject(status: StatusCode, code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (status, Json(payload)).into_response()
}

/// Token bucket per tenant.
pub struct RateLimiter {
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

#[derive(Debug, Clone)]
pub struct RateVerdict {
    pub allowed: bool,
    limit: u64,
    remaining: u64,
    reset_secs: u64,
    retry_after_secs: Option<u64>,
}

impl RateLimiter {
    pub fn new(rate_per_sec: f64, capacity: f64) -> Self {
        Self {
            rate_per_sec,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_env() -> Self {
        let rate = env_f64("RATE_LIMIT_PER_SEC")
            .filter(|value| *value > 0.0)
            .unwrap_or(5.0);
        let capacity = env_f64("RATE_LIMIT_CAPACITY")
            .filter(|value| *value >= 1.0)
            .unwrap_or(20.0);
        Self::new(rate, capacity)
    }

    pub async fn take(&self, tenant: &str) -> RateVerdict {
        let mut buckets = self.buckets.lock().await;
        let now = Instant::now();
        let bucket = buckets.entry(tenant.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            refilled_at: now,
        });
        let elapsed = now.duration_since(bucket.refilled_at).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        bucket.refilled_at = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let seconds_for = |tokens: f64| (tokens / self.rate_per_sec).ceil().max(0.0) as u64;
        RateVerdict {
            allowed,
            limit: self.capacity as u64,
            remaining: bucket.tokens.max(0.0).floor() as u64,
            reset_secs: seconds_for(self.capacity - bucket.tokens),
            retry_after_secs: (!allowed).then(|| seconds_for(1.0 - bucket.tokens).max(1)),
        }
    }
}

impl RateVerdict {
    fn write_headers(&self, headers: &mut HeaderMap) {
        let mut put = |name: HeaderName, value: u64| {
            headers.insert(name, HeaderValue::from(value));
        };
        put(HeaderName::from_static("x-ratelimit-limit"), self.limit);
        put(HeaderName::from_static("x-ratelimit-remaining"), self.remaining);
        put(HeaderName::from_static("x-ratelimit-reset"), self.reset_secs);
        if let Some(retry) = self.retry_after_secs {
            put(header::RETRY_AFTER, retry);
        }
    }
}

fn env_f64(key: &str) -> Option<f64> {
    env::var(key).ok().and_then(|value| value.parse::<f64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_spec_skips_malformed_entries() {
        let keys = parse_key_spec("boutique:abc, broken, :nokey, studio:xyz ,");
        assert_eq!(keys.len(), 2);
        assert_eq!(keys["abc"].tenant, "boutique");
        assert_eq!(keys["xyz"].tenant, "studio");
        assert_eq!(keys["xyz"].key_label, "key-04");
    }

    #[test]
    fn bearer_and_header_keys_are_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer  abc "));
        assert_eq!(presented_key(&headers).as_deref(), Some("abc"));

        let mut headers = HeaderMap::new();
        headers.insert("x-atelier-key", HeaderValue::from_static("xyz"));
        assert_eq!(presented_key(&headers).as_deref(), Some("xyz"));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9v"));
        assert_eq!(presented_key(&headers), None);
    }

    #[tokio::test]
    async fn bucket_empties_then_refuses() {
        let limiter = RateLimiter::new(0.001, 2.0);
        assert!(limiter.take("t").await.allowed);
        let second = limiter.take("t").await;
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        let third = limiter.take("t").await;
        assert!(!third.allowed);
        assert!(third.retry_after_secs.is_some());
        assert!(limiter.take("other").await.allowed);
    }
}
