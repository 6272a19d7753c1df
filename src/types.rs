use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A registered webhook subscription.
///
/// A `Webhook` describes *where* signed callbacks are delivered and under
/// what policy. The delivery engine treats it as the authority for event
/// matching, signing, timeouts and retry limits; the mutable failure and
/// success counters are updated only through the registry.
///
/// Webhooks must be registered with the engine before events can reach them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    /// Logical identifier for the subscription.
    pub id: WebhookId,

    /// Owning user.
    pub user_id: UserId,

    /// Target URL for delivery.
    pub url: String,

    /// Subscribed event-type patterns.
    ///
    /// A pattern is either an exact event type (`user.created`), a prefix
    /// wildcard (`user.*`), or `*` for everything. Matching is
    /// case-sensitive.
    pub event_types: Vec<String>,

    /// Secret used for HMAC signing. Never exposed on read paths.
    pub secret: Vec<u8>,

    /// Custom headers sent with every delivery.
    pub headers: HashMap<String, String>,

    /// Subscription status. Only `Active` webhooks receive new deliveries.
    pub status: WebhookStatus,

    /// Lifetime failed-attempt count.
    pub failure_count: u64,

    /// Failed attempts since the last success. Crossing the configured
    /// threshold suspends the webhook.
    pub consecutive_failures: u32,

    pub last_failure_at: Option<u64>,
    pub last_failure_reason: Option<String>,

    /// Lifetime successful delivery count.
    pub success_count: u64,
    pub last_success_at: Option<u64>,

    /// Requests-per-minute override. `None` uses the engine default.
    pub rate_limit: Option<u32>,

    /// Maximum time allowed for a single delivery attempt.
    pub timeout: Duration,

    /// Max delivery attempts override. `None` uses the engine default.
    pub retry_attempts: Option<u32>,

    /// Free-form labels for the admin surface.
    pub tags: Vec<String>,

    /// Free-form metadata, opaque to the engine.
    pub metadata: serde_json::Value,

    pub created_at: u64,
    pub updated_at: u64,
}

impl Webhook {
    /// Create a new active webhook with default delivery settings.
    ///
    /// Defaults:
    /// - timeout: 5 seconds
    /// - no rate-limit or retry overrides
    /// - subscribed to nothing until patterns are added
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: WebhookId(id.into()),
            user_id: UserId(user_id.into()),
            url: url.into(),
            event_types: Vec::new(),
            secret: Vec::new(),
            headers: HashMap::new(),
            status: WebhookStatus::Active,
            failure_count: 0,
            consecutive_failures: 0,
            last_failure_at: None,
            last_failure_reason: None,
            success_count: 0,
            last_success_at: None,
            rate_limit: None,
            timeout: Duration::from_secs(5),
            retry_attempts: None,
            tags: Vec::new(),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Subscribe to an event-type pattern.
    pub fn with_event_type(mut self, pattern: impl Into<String>) -> Self {
        self.event_types.push(pattern.into());
        self
    }

    /// Set the signing secret.
    pub fn with_secret(mut self, secret: impl Into<Vec<u8>>) -> Self {
        self.secret = secret.into();
        self
    }

    /// Add a custom header sent with every delivery.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set a custom timeout for delivery attempts.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the maximum number of delivery attempts.
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    /// Override the per-minute rate limit.
    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit = Some(per_minute);
        self
    }

    /// Attach a tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Attach free-form metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Whether the webhook accepts new deliveries.
    pub fn is_active(&self) -> bool {
        self.status == WebhookStatus::Active
    }

    /// Whether any subscribed pattern matches the event type.
    pub fn matches_event_type(&self, event_type: &str) -> bool {
        self.event_types
            .iter()
            .any(|p| pattern_matches(p, event_type))
    }

    /// Copy with the secret and sensitive header values masked.
    ///
    /// Every read path that leaves the engine goes through this.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.secret.is_empty() {
            copy.secret = MASK.as_bytes().to_vec();
        }
        for (name, value) in copy.headers.iter_mut() {
            if is_sensitive_header(name) {
                *value = MASK.to_string();
            }
        }
        copy
    }
}

const MASK: &str = "********";

fn is_sensitive_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    ["authorization", "secret", "token", "api-key", "apikey"]
        .iter()
        .any(|s| lower.contains(s))
}

/// Case-sensitive pattern match: exact, `prefix.*`, or `*`.
pub fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.'));
    }
    pattern == event_type
}

/// Subscription lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Active,
    /// Cut off by the circuit breaker. Requires explicit reactivation.
    Suspended,
    /// Turned off by an operator.
    Disabled,
}

/// A domain event consumed from the bus.
///
/// The payload is opaque to the engine; it is wrapped in the canonical
/// envelope and serialized exactly once when delivery records are created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Epoch milliseconds at which the event occurred.
    pub timestamp: u64,
}

impl Event {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: EventId(id.into()),
            event_type: event_type.into(),
            payload,
            timestamp: now_millis(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Serialize the documented delivery envelope to its canonical bytes.
    ///
    /// The field order is fixed by the struct definition, so the same event
    /// always canonicalizes to the same byte sequence. These bytes are
    /// captured on the delivery record and resent verbatim on every retry.
    pub fn envelope_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&Envelope {
            event_id: &self.id.0,
            event_type: &self.event_type,
            payload: &self.payload,
            timestamp: self.timestamp,
        })
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    event_id: &'a str,
    #[serde(rename = "type")]
    event_type: &'a str,
    payload: &'a serde_json::Value,
    timestamp: u64,
}

/// Unique identifier for a webhook subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WebhookId(pub String);

/// Unique identifier for an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

/// Unique identifier for a webhook owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

/// Identity of a delivery record: one event delivered to one webhook.
///
/// Doubles as the dedupe key when the bus redelivers an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub event_id: EventId,
    pub webhook_id: WebhookId,
}

impl DeliveryKey {
    pub fn new(event_id: EventId, webhook_id: WebhookId) -> Self {
        Self {
            event_id,
            webhook_id,
        }
    }
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, awaiting its first attempt.
    Pending,
    /// Claimed by a worker, attempt in flight.
    Delivering,
    /// Terminal success.
    Delivered,
    /// Attempt failed, next attempt scheduled.
    RetryScheduled,
    /// Terminal: could not be attempted (webhook gone, payload invalid).
    Failed,
    /// Terminal: retries exhausted or destination cut off.
    Abandoned,
}

impl DeliveryStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed | Self::Abandoned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::RetryScheduled => "retry_scheduled",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// One attempt lineage for delivering a single event to a single webhook.
///
/// The persistence layer owns records for their full lifetime; in-memory
/// queues hold only a lightweight handle. The canonical payload bytes are
/// immutable once the record exists, so retries resend identical content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub key: DeliveryKey,
    pub event_type: String,
    pub event_timestamp: u64,

    /// Canonical envelope bytes, captured at creation.
    pub payload: Vec<u8>,

    pub status: DeliveryStatus,

    /// Attempts made so far. Never exceeds `max_attempts`.
    pub attempts: u32,

    /// Snapshot of the webhook's retry policy at creation time. Policy
    /// changes do not retroactively affect in-flight deliveries.
    pub max_attempts: u32,

    pub last_status_code: Option<u16>,
    pub last_response_body: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub error_message: Option<String>,

    /// Due time (epoch millis) while `Pending` or `RetryScheduled`.
    pub next_retry_at: Option<u64>,
    pub last_attempt_at: Option<u64>,
    pub created_at: u64,
    pub delivered_at: Option<u64>,

    /// Optimistic claim marker: at most one worker holds an unexpired claim.
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<u64>,
}

impl DeliveryRecord {
    /// Create a `Pending` record due immediately.
    pub fn new(event: &Event, webhook: &Webhook, payload: Vec<u8>, max_attempts: u32) -> Self {
        let now = now_millis();
        Self {
            key: DeliveryKey::new(event.id.clone(), webhook.id.clone()),
            event_type: event.event_type.clone(),
            event_timestamp: event.timestamp,
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts,
            last_status_code: None,
            last_response_body: None,
            last_duration_ms: None,
            error_message: None,
            next_retry_at: Some(now),
            last_attempt_at: None,
            created_at: now,
            delivered_at: None,
            claimed_by: None,
            claim_expires_at: None,
        }
    }
}

/// Aggregate delivery counters exposed to the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub last_success_at: Option<u64>,
    pub last_failure_at: Option<u64>,
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_exact_match_is_case_sensitive() {
        assert!(pattern_matches("user.created", "user.created"));
        assert!(!pattern_matches("User.created", "user.created"));
        assert!(!pattern_matches("user.created", "user.deleted"));
    }

    #[test]
    fn pattern_prefix_wildcard() {
        assert!(pattern_matches("user.*", "user.created"));
        assert!(pattern_matches("user.*", "user.profile.updated"));
        assert!(!pattern_matches("user.*", "userx.created"));
        assert!(!pattern_matches("user.*", "user"));
    }

    #[test]
    fn pattern_star_matches_everything() {
        assert!(pattern_matches("*", "anything.at.all"));
    }

    #[test]
    fn webhook_matching_requires_subscription() {
        let webhook = Webhook::new("wh_1", "user_1", "https://example.com/hook")
            .with_event_type("order.*")
            .with_event_type("user.created");
        assert!(webhook.matches_event_type("order.paid"));
        assert!(webhook.matches_event_type("user.created"));
        assert!(!webhook.matches_event_type("user.deleted"));
    }

    #[test]
    fn envelope_bytes_are_stable() {
        let event = Event::new("evt_1", "user.created", serde_json::json!({"id": 42}))
            .with_timestamp(1_700_000_000_000);
        let a = event.envelope_bytes().unwrap();
        let b = event.envelope_bytes().unwrap();
        assert_eq!(a, b);
        let text = String::from_utf8(a).unwrap();
        assert!(text.starts_with(r#"{"event_id":"evt_1","type":"user.created""#));
    }

    #[test]
    fn redacted_masks_secret_and_sensitive_headers() {
        let webhook = Webhook::new("wh_1", "user_1", "https://example.com/hook")
            .with_secret(b"supersecret".to_vec())
            .with_header("Authorization", "Bearer abc")
            .with_header("X-Custom", "visible");
        let masked = webhook.redacted();
        assert_eq!(masked.secret, b"********".to_vec());
        assert_eq!(masked.headers["Authorization"], "********");
        assert_eq!(masked.headers["X-Custom"], "visible");
        // original untouched
        assert_eq!(webhook.secret, b"supersecret".to_vec());
    }

    #[test]
    fn new_record_is_pending_and_due_now() {
        let event = Event::new("evt_1", "user.created", serde_json::json!({}));
        let webhook = Webhook::new("wh_1", "user_1", "https://example.com/hook");
        let payload = event.envelope_bytes().unwrap();
        let record = DeliveryRecord::new(&event, &webhook, payload, 3);
        assert_eq!(record.status, DeliveryStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.max_attempts, 3);
        assert!(record.next_retry_at.is_some());
        assert!(record.claimed_by.is_none());
    }
}
