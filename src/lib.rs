//! A webhook delivery engine with durable, at-least-once semantics.
//!
//! Domain events fan out to matching webhook subscriptions as signed
//! HTTP callbacks. Every delivery is tracked as a durable record that
//! the engine drives to a terminal state through bounded retries with
//! exponential backoff.
//!
//! ## Guarantees
//! - At-least-once delivery: a created record reaches a terminal state
//! - HMAC-SHA256 signatures with replay protection on every attempt
//! - Per-destination rate limiting and a circuit breaker
//! - Recovery of unfinished deliveries from the storage backend
//!
//! ## Non-Guarantees
//! - Exactly-once delivery (receivers must deduplicate by event id)
//! - Ordering between deliveries
//! - Exact cross-instance webhook counters: instances sharing a store
//!   merge webhook state by most recent update, so lifetime counters
//!   are approximate when several engines deliver for the same webhook
//!
//! The engine is a library, not a hosted service. It embeds in the
//! process that produces the events (or consumes them from a bus).
//! Instances sharing a storage backend coordinate through atomic record
//! claims; webhook changes made by one instance (registration,
//! suspension, reactivation) reach the others on the due-work sweep
//! interval.

mod engine;
mod error;
mod executor;
mod rate_limit;
mod registry;
mod retry;
mod signing;
mod state_machine;
mod storage;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod storage_redis;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use engine::{DeliveryEngine, EngineConfig};
pub use error::{ConfigError, DispatchError, FailureReason, RegisterError};
pub use executor::{
    AttemptOutcome, Transport, TransportError, TransportRequest, TransportResponse,
    EVENT_ID_HEADER,
};
pub use rate_limit::{CounterError, CounterStore, InMemoryCounterStore, RateLimiter};
pub use registry::{OutcomeEffect, WebhookRegistry};
pub use retry::{next_retry, RetryDecision};
pub use signing::{
    compute_signature, is_timestamp_fresh, parse_signature_headers, signature_header_value,
    verify_signature, verify_webhook_request, ParsedSignature, VerificationError,
    SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
pub use storage::{InMemoryStorage, Storage};
pub use types::{
    DeliveryKey, DeliveryRecord, DeliveryStatus, Event, EventId, UserId, Webhook, WebhookId,
    WebhookStats, WebhookStatus,
};

#[cfg(feature = "http")]
pub use executor::HttpTransport;

#[cfg(feature = "redis")]
pub use storage_redis::RedisCounterStore;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresStorage;
