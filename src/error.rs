use std::fmt;

use crate::types::WebhookId;

/// Errors returned when handing an event to the engine fails *before*
/// any delivery record is attempted.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// The ready queue is full. Persisted records are picked up by the
    /// next due-work sweep; the caller may also retry with backoff.
    Backpressure,

    /// The engine has been shut down.
    Shutdown,

    /// The event payload could not be serialized into the envelope.
    InvalidPayload(String),

    /// The named webhook is not registered.
    UnknownWebhook { webhook_id: WebhookId },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Backpressure => write!(f, "engine at capacity"),
            DispatchError::Shutdown => write!(f, "engine is shut down"),
            DispatchError::InvalidPayload(msg) => {
                write!(f, "event payload not serializable: {msg}")
            }
            DispatchError::UnknownWebhook { webhook_id } => {
                write!(f, "webhook not registered: {:?}", webhook_id)
            }
        }
    }
}

impl std::error::Error for DispatchError {}

/// Errors rejected at webhook registration time.
///
/// Configuration problems never reach the delivery path.
#[derive(Debug, PartialEq, Eq)]
pub enum RegisterError {
    /// URL is empty or has an unsupported scheme.
    InvalidUrl(String),

    /// Webhooks must carry a signing secret.
    MissingSecret,

    /// The owner already has the maximum number of webhooks.
    LimitExceeded { limit: usize },
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::InvalidUrl(url) => write!(f, "invalid webhook url: {url}"),
            RegisterError::MissingSecret => write!(f, "webhook has no signing secret"),
            RegisterError::LimitExceeded { limit } => {
                write!(f, "webhook limit ({limit}) reached for user")
            }
        }
    }
}

impl std::error::Error for RegisterError {}

/// An engine configuration value outside its accepted range.
#[derive(Debug, PartialEq, Eq)]
pub struct ConfigError {
    pub field: &'static str,
    pub min: u64,
    pub max: u64,
    pub value: u64,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} = {} outside accepted range {}..={}",
            self.field, self.value, self.min, self.max
        )
    }
}

impl std::error::Error for ConfigError {}

/// Reasons why a single HTTP delivery attempt failed.
///
/// The engine retries every failure class up to the record's attempt
/// budget, except `Gone` which abandons immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The attempt exceeded the webhook's timeout.
    Timeout,

    /// Connection could not be established.
    Connect,

    /// Other transport-level failure.
    Network,

    /// Destination answered 5xx.
    RemoteError { status: u16 },

    /// Destination answered 4xx (other than 410).
    ClientError { status: u16 },

    /// Destination answered 410 Gone; retrying is pointless.
    Gone,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "request timed out"),
            FailureReason::Connect => write!(f, "connection failed"),
            FailureReason::Network => write!(f, "network error"),
            FailureReason::RemoteError { status } => {
                write!(f, "destination returned HTTP {status}")
            }
            FailureReason::ClientError { status } => {
                write!(f, "destination rejected request with HTTP {status}")
            }
            FailureReason::Gone => write!(f, "destination returned HTTP 410 Gone"),
        }
    }
}

impl FailureReason {
    /// Whether another attempt may still succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureReason::Gone)
    }
}
