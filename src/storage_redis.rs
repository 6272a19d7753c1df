//! Redis-backed rate-limit counters, for running more than one engine
//! process against the same destinations.

#[cfg(feature = "redis")]
use async_trait::async_trait;
#[cfg(feature = "redis")]
use redis::AsyncCommands;
#[cfg(feature = "redis")]
use std::time::Duration;

#[cfg(feature = "redis")]
use crate::rate_limit::{CounterError, CounterStore};

#[cfg(feature = "redis")]
pub struct RedisCounterStore {
    client: redis::Client,
    prefix: String,
}

#[cfg(feature = "redis")]
impl RedisCounterStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}:rl:{}", self.prefix, key)
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterError> {
        let mut conn = self
            .client
            .get_tokio_connection()
            .await
            .map_err(|e| CounterError(e.to_string()))?;

        let counter_key = self.counter_key(key);
        let count: u64 = conn
            .incr(&counter_key, 1u64)
            .await
            .map_err(|e| CounterError(e.to_string()))?;

        // First increment creates the key; give it the window's lifetime so
        // stale windows expire on their own.
        if count == 1 {
            let _ = conn
                .expire::<_, ()>(&counter_key, ttl.as_secs().max(1) as usize)
                .await;
        }

        Ok(count)
    }
}
