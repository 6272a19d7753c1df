//! Per-destination rate limiting over a shared counter store.
//!
//! Fixed one-minute windows keyed by webhook id; the window counter lives
//! in a store supporting atomic increment-with-TTL so concurrent workers
//! (and engine instances sharing the store) observe the same count.
//!
//! A rejection is a scheduling deferral, never a delivery attempt. If the
//! counter store is unreachable the limiter fails open: delivering is
//! worth more than strict enforcement.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::types::{now_millis, WebhookId};

#[cfg(feature = "tracing")]
fn trace_warn(message: &str) {
    tracing::warn!("{message}");
}

#[cfg(not(feature = "tracing"))]
fn trace_warn(_message: &str) {}

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Length of one rate-limit window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// The counter store could not serve the increment.
#[derive(Debug, Clone)]
pub struct CounterError(pub String);

impl fmt::Display for CounterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "counter store unavailable: {}", self.0)
    }
}

impl std::error::Error for CounterError {}

/// Shared counter store with atomic increment-with-TTL.
///
/// Keys are scoped to a webhook and a time window; the TTL equals the
/// window so stale counters expire on their own.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, setting `ttl` when the key is created, and return
    /// the post-increment count.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterError>;
}

/// In-process counter store for single-instance deployments and tests.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<String, WindowCounter>>,
}

struct WindowCounter {
    count: u64,
    expires_at: u64,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterError> {
        let now = now_millis();
        let mut counters = self.counters.lock().await;
        counters.retain(|_, c| c.expires_at > now);

        let counter = counters.entry(key.to_string()).or_insert(WindowCounter {
            count: 0,
            expires_at: now + ttl.as_millis() as u64,
        });
        counter.count += 1;
        Ok(counter.count)
    }
}

/// Token gate deciding admit/reject for one delivery attempt right now.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    default_limit: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, default_limit: u32) -> Self {
        Self {
            store,
            default_limit,
        }
    }

    /// Try to admit one attempt for this webhook in the current window.
    ///
    /// `limit_override` is the webhook's own requests-per-minute setting,
    /// if any. Returns `false` only on a counted rejection; store failures
    /// admit the attempt and log.
    pub async fn try_acquire(&self, webhook_id: &WebhookId, limit_override: Option<u32>) -> bool {
        let limit = limit_override.unwrap_or(self.default_limit).max(1) as u64;
        let window = now_millis() / WINDOW.as_millis() as u64;
        let key = format!("{}:{}", webhook_id.0, window);

        match self.store.increment(&key, WINDOW).await {
            Ok(count) => {
                if count > limit {
                    metric_inc("webhook.rate_limited");
                    false
                } else {
                    true
                }
            }
            Err(e) => {
                // Fail open: availability of delivery beats strict limits.
                trace_warn(&format!(
                    "rate limiter failing open for {}: {e}",
                    webhook_id.0
                ));
                metric_inc("webhook.rate_limiter.fail_open");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment(&self, _key: &str, _ttl: Duration) -> Result<u64, CounterError> {
            Err(CounterError("connection refused".into()))
        }
    }

    fn webhook_id() -> WebhookId {
        WebhookId("wh_1".to_string())
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()), 3);
        let id = webhook_id();

        for _ in 0..3 {
            assert!(limiter.try_acquire(&id, None).await);
        }
        assert!(!limiter.try_acquire(&id, None).await);
    }

    #[tokio::test]
    async fn per_webhook_override_beats_default() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()), 100);
        let id = webhook_id();

        assert!(limiter.try_acquire(&id, Some(1)).await);
        assert!(!limiter.try_acquire(&id, Some(1)).await);
    }

    #[tokio::test]
    async fn webhooks_are_counted_independently() {
        let limiter = RateLimiter::new(Arc::new(InMemoryCounterStore::new()), 1);
        assert!(limiter.try_acquire(&WebhookId("a".into()), None).await);
        assert!(limiter.try_acquire(&WebhookId("b".into()), None).await);
        assert!(!limiter.try_acquire(&WebhookId("a".into()), None).await);
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore), 1);
        let id = webhook_id();

        // far past any limit, every attempt is still admitted
        for _ in 0..10 {
            assert!(limiter.try_acquire(&id, None).await);
        }
    }

    #[tokio::test]
    async fn expired_windows_are_dropped() {
        let store = InMemoryCounterStore::new();
        store
            .increment("old", Duration::from_millis(0))
            .await
            .unwrap();
        // a zero TTL window is discarded on the next access
        let count = store.increment("old", Duration::from_secs(60)).await.unwrap();
        assert_eq!(count, 1);
    }
}
