use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};

use vigil_core::rate_limit::{RateLimitConfig, RateLimitResult, RequestClass};
use vigil_core::SharedClock;

use super::auth::Principal;
use super::response::ApiError;

/// In-memory token-bucket rate limiter, one bucket per (principal, class).
///
/// Buckets live in a mutex-guarded map; a periodic sweep drops buckets not
/// seen for twice the cleanup interval.
pub struct RateLimiter {
    read: RateLimitConfig,
    write: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
    clock: SharedClock,
}

struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl RateLimiter {
    pub fn new(read: RateLimitConfig, write: RateLimitConfig, clock: SharedClock) -> Self {
        Self {
            read,
            write,
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn config(&self, class: RequestClass) -> &RateLimitConfig {
        match class {
            RequestClass::Read => &self.read,
            RequestClass::Write => &self.write,
        }
    }

    /// Take one token from the bucket for this key and class.
    pub fn check(&self, key: &str, class: RequestClass) -> RateLimitResult {
        let config = self.config(class);
        let max_tokens = config.requests as f64;
        let refill_rate = config.refill_rate();
        let now = self.clock.now();

        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let bucket = buckets
            .entry(format!("{}:{}", class.as_str(), key))
            .or_insert(Bucket {
                tokens: max_tokens,
                last_refill: now,
                last_seen: now,
            });

        let elapsed = (now - bucket.last_refill)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * refill_rate).min(max_tokens);
        bucket.last_refill = now;
        bucket.last_seen = now;

        bucket.tokens -= 1.0;

        let remaining = bucket.tokens.max(0.0) as u32;
        let reset_at =
            now + chrono::Duration::seconds(((max_tokens - bucket.tokens) / refill_rate) as i64);

        if bucket.tokens >= 0.0 {
            RateLimitResult::allowed(remaining, reset_at)
        } else {
            let retry_after = Duration::from_secs_f64((-bucket.tokens) / refill_rate);
            RateLimitResult::denied(remaining, reset_at, retry_after)
        }
    }

    /// Drop buckets idle for longer than the TTL. The runtime calls this on
    /// a timer with TTL = 2x the cleanup interval.
    pub fn cleanup(&self, ttl: Duration) -> usize {
        let cutoff = self.clock.now() - chrono::Duration::from_std(ttl).unwrap_or_default();
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let before = buckets.len();
        buckets.retain(|_, b| b.last_seen >= cutoff);
        before - buckets.len()
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("bucket lock poisoned").len()
    }
}

/// Classify a request by method: GET/HEAD read, everything else write.
fn request_class(method: &axum::http::Method) -> RequestClass {
    match *method {
        axum::http::Method::GET | axum::http::Method::HEAD => RequestClass::Read,
        _ => RequestClass::Write,
    }
}

/// Per-principal rate limiting middleware. Anonymous requests are bucketed
/// by client IP.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let class = request_class(req.method());

    let key = match req.extensions().get::<Principal>() {
        Some(principal) => principal.bucket_key(),
        None => {
            let ip = req
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .unwrap_or("unknown")
                .trim()
                .to_string();
            format!("ip:{}", ip)
        }
    };

    let result = limiter.check(&key, class);
    if !result.allowed {
        let retry_after = result.retry_after.map(|d| d.as_secs().max(1)).unwrap_or(1);

        let mut response = ApiError::new("RATE_LIMITED", "rate limit exceeded").into_response();
        response.headers_mut().insert(
            axum::http::header::RETRY_AFTER,
            axum::http::HeaderValue::from(retry_after),
        );
        return response;
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vigil_core::clock::ManualClock;

    fn limiter(clock: ManualClock) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::per_minute(60),
            RateLimitConfig::per_minute(6),
            Arc::new(clock),
        )
    }

    #[test]
    fn test_bucket_exhaustion_and_refill() {
        let clock = ManualClock::at(Utc::now());
        let limiter = limiter(clock.clone());

        // 6 writes per minute: the 7th in the same instant is denied.
        for _ in 0..6 {
            assert!(limiter.check("user:a", RequestClass::Write).allowed);
        }
        let denied = limiter.check("user:a", RequestClass::Write);
        assert!(!denied.allowed);
        assert!(denied.retry_after.is_some());

        // One token refills every 10s.
        clock.advance(chrono::Duration::seconds(20));
        assert!(limiter.check("user:a", RequestClass::Write).allowed);
    }

    #[test]
    fn test_read_and_write_limits_are_distinct() {
        let clock = ManualClock::at(Utc::now());
        let limiter = limiter(clock);

        for _ in 0..6 {
            limiter.check("user:a", RequestClass::Write);
        }
        assert!(!limiter.check("user:a", RequestClass::Write).allowed);
        // Reads still flow for the same principal.
        assert!(limiter.check("user:a", RequestClass::Read).allowed);
    }

    #[test]
    fn test_principals_are_isolated() {
        let clock = ManualClock::at(Utc::now());
        let limiter = limiter(clock);

        for _ in 0..7 {
            limiter.check("user:a", RequestClass::Write);
        }
        assert!(limiter.check("user:b", RequestClass::Write).allowed);
    }

    #[test]
    fn test_cleanup_drops_stale_buckets() {
        let clock = ManualClock::at(Utc::now());
        let limiter = limiter(clock.clone());

        limiter.check("user:a", RequestClass::Read);
        limiter.check("user:b", RequestClass::Read);
        assert_eq!(limiter.bucket_count(), 2);

        clock.advance(chrono::Duration::seconds(601));
        limiter.check("user:b", RequestClass::Read);

        let dropped = limiter.cleanup(Duration::from_secs(600));
        assert_eq!(dropped, 1);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_request_classification() {
        assert_eq!(request_class(&axum::http::Method::GET), RequestClass::Read);
        assert_eq!(request_class(&axum::http::Method::HEAD), RequestClass::Read);
        assert_eq!(request_class(&axum::http::Method::POST), RequestClass::Write);
        assert_eq!(request_class(&axum::http::Method::DELETE), RequestClass::Write);
    }
}
