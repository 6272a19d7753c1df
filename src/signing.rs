//! HMAC-SHA256 payload signing and receiver-side verification.
//!
//! The signature covers `{timestamp}.{payload}` so destinations can reject
//! replays outside their accepted clock skew. It is recomputed on every
//! attempt because the timestamp changes; the payload bytes never do.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signature, formatted `sha256={hex-digest}`.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Header carrying the unix-seconds timestamp the signature covers.
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Compute the hex HMAC-SHA256 digest over `{timestamp}.{payload}`.
pub fn compute_signature(secret: &[u8], payload: &[u8], timestamp: &str) -> String {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Format a digest as the wire header value.
pub fn signature_header_value(hex_digest: &str) -> String {
    format!("sha256={hex_digest}")
}

/// Strip the `sha256=` prefix from a header value.
pub fn parse_signature_value(value: &str) -> Option<&str> {
    value.strip_prefix("sha256=")
}

/// Verify a received hex digest in constant time.
pub fn verify_signature(secret: &[u8], payload: &[u8], timestamp: &str, hex_digest: &str) -> bool {
    let Ok(signature) = hex::decode(hex_digest) else {
        return false;
    };

    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);

    mac.verify_slice(&signature).is_ok()
}

/// Basic timestamp freshness check for receivers.
pub fn is_timestamp_fresh(timestamp_secs: u64, now_secs: u64, max_age_secs: u64) -> bool {
    if now_secs >= timestamp_secs {
        now_secs - timestamp_secs <= max_age_secs
    } else {
        false
    }
}

#[derive(Debug, Clone)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

/// Pull the signature and timestamp values out of a header list.
pub fn parse_signature_headers<'a, I>(headers: I) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let sig_key = SIGNATURE_HEADER.to_ascii_lowercase();
    let ts_key = TIMESTAMP_HEADER.to_ascii_lowercase();

    let mut signature = None;
    let mut timestamp = None;

    for (name, value) in headers {
        let key = name.to_ascii_lowercase();
        if key == sig_key {
            signature = Some(value.to_string());
        } else if key == ts_key {
            timestamp = Some(value.to_string());
        }
    }

    ParsedSignature {
        signature,
        timestamp,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    MissingTimestamp,
    MalformedSignature,
    InvalidTimestamp,
    StaleTimestamp,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
///
/// Intended for receivers of this engine's deliveries; checks header
/// presence, the `sha256=` format, timestamp freshness, and the digest.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
    max_age_secs: u64,
    now_secs: u64,
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers);
    let raw = parsed
        .signature
        .ok_or(VerificationError::MissingSignature)?;
    let digest = parse_signature_value(&raw).ok_or(VerificationError::MalformedSignature)?;
    let timestamp_str = parsed
        .timestamp
        .ok_or(VerificationError::MissingTimestamp)?;
    let timestamp = timestamp_str
        .parse::<u64>()
        .map_err(|_| VerificationError::InvalidTimestamp)?;

    if !is_timestamp_fresh(timestamp, now_secs, max_age_secs) {
        return Err(VerificationError::StaleTimestamp);
    }

    if verify_signature(secret, payload, &timestamp_str, digest) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
