//! In-process sliding-window rate limiter.
//!
//! Approximate throttling for webhook and admin endpoints. Counters live in
//! process memory only: they do not coordinate across instances and are safe
//! to lose on restart. Callers that need strict guarantees belong on the
//! shared store with atomic increments, like the usage metering engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const WINDOW: Duration = Duration::from_secs(60);
/// Entries idle longer than this are dropped during the sweep.
const SWEEP_IDLE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Per-key minute-window counter map.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new_in_memory() -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Count one request against `key` with a per-minute `limit`.
    pub async fn check(&self, key: &str, limit: u32) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(window.started_at) >= WINDOW {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= limit {
            let elapsed = now.duration_since(window.started_at);
            let retry_after = WINDOW.saturating_sub(elapsed).as_secs().max(1);
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some(retry_after),
            };
        }

        window.count += 1;
        RateLimitResult {
            allowed: true,
            remaining: limit - window.count,
            retry_after_seconds: None,
        }
    }

    /// Drop idle entries. Called periodically from a background task.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        windows.retain(|_, w| now.duration_since(w.started_at) < SWEEP_IDLE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_request_allowed() {
        let limiter = RateLimiter::new_in_memory();
        let result = limiter.check("tenant-a", 60).await;
        assert!(result.allowed);
        assert_eq!(result.remaining, 59);
    }

    #[tokio::test]
    async fn limit_enforced() {
        let limiter = RateLimiter::new_in_memory();
        for i in 0..5 {
            let result = limiter.check("k", 5).await;
            assert!(result.allowed, "request {} should be allowed", i);
        }
        let result = limiter.check("k", 5).await;
        assert!(!result.allowed, "6th request should be rejected");
        assert!(result.retry_after_seconds.is_some());
    }

    #[tokio::test]
    async fn keys_isolated() {
        let limiter = RateLimiter::new_in_memory();
        for _ in 0..3 {
            limiter.check("a", 3).await;
        }
        assert!(!limiter.check("a", 3).await.allowed);
        assert!(limiter.check("b", 3).await.allowed);
    }

    #[tokio::test]
    async fn sweep_keeps_active_windows() {
        let limiter = RateLimiter::new_in_memory();
        limiter.check("active", 10).await;
        limiter.sweep().await;
        // Window was just created, so it survives and keeps its count
        let result = limiter.check("active", 10).await;
        assert_eq!(result.remaining, 8);
    }
}
