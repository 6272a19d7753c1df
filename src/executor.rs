//! One HTTP delivery attempt.
//!
//! The executor signs the canonical payload, performs a single bounded
//! POST through a [`Transport`], and reports the outcome. It holds no
//! state and persists nothing; the worker owns the record lifecycle.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::FailureReason;
use crate::signing::{
    compute_signature, signature_header_value, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};
use crate::types::{DeliveryRecord, Webhook};

/// Header carrying the event id, for receiver-side dedupe.
pub const EVENT_ID_HEADER: &str = "X-Webhook-Event-Id";

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub success: bool,
    pub http_status: Option<u16>,
    /// Response body, truncated to the configured bound.
    pub response_body: Option<String>,
    pub duration_ms: u64,
    pub error: Option<FailureReason>,
}

/// An outbound POST, fully assembled.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

#[derive(Debug, Clone)]
pub enum TransportError {
    Timeout,
    Connect(String),
    Other(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Connect(msg) => write!(f, "connection failed: {msg}"),
            TransportError::Other(msg) => write!(f, "request error: {msg}"),
        }
    }
}

/// Outbound HTTP seam. Production uses [`HttpTransport`]; tests script
/// responses through a fake.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

/// reqwest-backed transport.
#[cfg(feature = "http")]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[cfg(feature = "http")]
impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(TransportResponse { status, body })
    }
}

/// Performs one signed, bounded delivery attempt.
pub struct DeliveryExecutor {
    transport: Arc<dyn Transport>,
    max_body_bytes: usize,
}

impl DeliveryExecutor {
    pub fn new(transport: Arc<dyn Transport>, max_body_bytes: usize) -> Self {
        Self {
            transport,
            max_body_bytes,
        }
    }

    /// Sign and send the record's payload to the webhook's destination.
    ///
    /// 2xx is success; every other response or transport failure is a
    /// failure with a captured reason. The response body is truncated
    /// before it reaches storage.
    pub async fn attempt(&self, record: &DeliveryRecord, webhook: &Webhook) -> AttemptOutcome {
        let timestamp = (crate::types::now_millis() / 1000).to_string();

        let mut headers: Vec<(String, String)> = webhook
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
        headers.push((
            EVENT_ID_HEADER.to_string(),
            record.key.event_id.0.clone(),
        ));
        headers.push((TIMESTAMP_HEADER.to_string(), timestamp.clone()));
        if !webhook.secret.is_empty() {
            let digest = compute_signature(&webhook.secret, &record.payload, &timestamp);
            headers.push((
                SIGNATURE_HEADER.to_string(),
                signature_header_value(&digest),
            ));
        }

        let request = TransportRequest {
            url: webhook.url.clone(),
            headers,
            body: record.payload.clone(),
            timeout: webhook.timeout,
        };

        let start = Instant::now();
        let result = self.transport.post(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let body = truncate(response.body, self.max_body_bytes);
                if (200..300).contains(&response.status) {
                    AttemptOutcome {
                        success: true,
                        http_status: Some(response.status),
                        response_body: Some(body),
                        duration_ms,
                        error: None,
                    }
                } else {
                    let error = match response.status {
                        410 => FailureReason::Gone,
                        status @ 400..=499 => FailureReason::ClientError { status },
                        status => FailureReason::RemoteError { status },
                    };
                    AttemptOutcome {
                        success: false,
                        http_status: Some(response.status),
                        response_body: Some(body),
                        duration_ms,
                        error: Some(error),
                    }
                }
            }
            Err(e) => {
                let error = match e {
                    TransportError::Timeout => FailureReason::Timeout,
                    TransportError::Connect(_) => FailureReason::Connect,
                    TransportError::Other(_) => FailureReason::Network,
                };
                AttemptOutcome {
                    success: false,
                    http_status: None,
                    response_body: None,
                    duration_ms,
                    error: Some(error),
                }
            }
        }
    }
}

fn truncate(body: String, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body;
    }
    let mut end = max_bytes;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}
