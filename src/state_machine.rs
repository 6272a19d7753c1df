//! Delivery record lifecycle.
//!
//! All transitions go through the functions here so the invariants hold
//! everywhere: terminal records never change, `attempts` never exceeds
//! `max_attempts`, and a record is processed by at most one worker at a
//! time via the claim marker. Storage backends reuse [`is_claimable`] so
//! eligibility means the same thing in memory and in SQL.

use crate::executor::AttemptOutcome;
use crate::types::{DeliveryRecord, DeliveryStatus};

/// Whether the lifecycle permits moving `from` → `to`.
pub fn can_transition(from: DeliveryStatus, to: DeliveryStatus) -> bool {
    use DeliveryStatus::*;
    match (from, to) {
        (Pending, Delivering) => true,
        (RetryScheduled, Delivering) => true,
        (Delivering, Delivered) => true,
        (Delivering, RetryScheduled) => true,
        (Delivering, Abandoned) => true,
        // queued work for a suspended or deleted webhook is drained
        (Pending, Abandoned) | (RetryScheduled, Abandoned) => true,
        (Pending, Failed) | (RetryScheduled, Failed) | (Delivering, Failed) => true,
        _ => false,
    }
}

/// Whether a worker may claim this record right now.
///
/// Due `Pending`/`RetryScheduled` records with no live claim are eligible,
/// as is a `Delivering` record whose claim has expired (its worker died
/// mid-attempt).
pub fn is_claimable(record: &DeliveryRecord, now: u64) -> bool {
    if record.status.is_terminal() {
        return false;
    }
    let claim_live = record
        .claim_expires_at
        .is_some_and(|expires| expires > now);
    if claim_live {
        return false;
    }
    match record.status {
        DeliveryStatus::Pending | DeliveryStatus::RetryScheduled => {
            record.next_retry_at.is_none_or(|due| due <= now)
        }
        DeliveryStatus::Delivering => true,
        _ => false,
    }
}

/// Stamp a claim. Returns false if the record is not claimable.
pub fn claim(record: &mut DeliveryRecord, claimant: &str, claim_ttl_ms: u64, now: u64) -> bool {
    if !is_claimable(record, now) {
        return false;
    }
    record.claimed_by = Some(claimant.to_string());
    record.claim_expires_at = Some(now + claim_ttl_ms);
    true
}

fn release(record: &mut DeliveryRecord) {
    record.claimed_by = None;
    record.claim_expires_at = None;
}

/// An attempt is starting.
pub fn mark_delivering(record: &mut DeliveryRecord, now: u64) -> bool {
    if record.status == DeliveryStatus::Delivering {
        // reclaimed after a crashed worker; already in the right state
        record.last_attempt_at = Some(now);
        return true;
    }
    if !can_transition(record.status, DeliveryStatus::Delivering) {
        return false;
    }
    record.status = DeliveryStatus::Delivering;
    record.last_attempt_at = Some(now);
    true
}

/// Terminal success. The record is immutable afterwards.
pub fn mark_delivered(record: &mut DeliveryRecord, outcome: &AttemptOutcome, now: u64) -> bool {
    if !can_transition(record.status, DeliveryStatus::Delivered) {
        return false;
    }
    record.status = DeliveryStatus::Delivered;
    record.attempts = (record.attempts + 1).min(record.max_attempts);
    record.last_status_code = outcome.http_status;
    record.last_response_body = outcome.response_body.clone();
    record.last_duration_ms = Some(outcome.duration_ms);
    record.error_message = None;
    record.next_retry_at = None;
    record.delivered_at = Some(now);
    release(record);
    true
}

/// A failed attempt with budget remaining; due again after `delay_ms`.
pub fn mark_retry_scheduled(
    record: &mut DeliveryRecord,
    outcome: &AttemptOutcome,
    error: &str,
    delay_ms: u64,
    now: u64,
) -> bool {
    if !can_transition(record.status, DeliveryStatus::RetryScheduled) {
        return false;
    }
    record.status = DeliveryStatus::RetryScheduled;
    record.attempts = (record.attempts + 1).min(record.max_attempts);
    record.last_status_code = outcome.http_status;
    record.last_response_body = outcome.response_body.clone();
    record.last_duration_ms = Some(outcome.duration_ms);
    record.error_message = Some(error.to_string());
    record.next_retry_at = Some(now + delay_ms.max(1));
    release(record);
    true
}

/// Terminal failure after an attempt: budget exhausted or a non-retryable
/// response.
pub fn mark_abandoned_after_attempt(
    record: &mut DeliveryRecord,
    outcome: &AttemptOutcome,
    error: &str,
    now: u64,
) -> bool {
    if !can_transition(record.status, DeliveryStatus::Abandoned) {
        return false;
    }
    record.status = DeliveryStatus::Abandoned;
    record.attempts = (record.attempts + 1).min(record.max_attempts);
    record.last_status_code = outcome.http_status;
    record.last_response_body = outcome.response_body.clone();
    record.last_duration_ms = Some(outcome.duration_ms);
    record.error_message = Some(error.to_string());
    record.next_retry_at = None;
    record.last_attempt_at = Some(now);
    release(record);
    true
}

/// Terminal drain without an attempt (webhook suspended, disabled or
/// deleted while work was queued). No attempt slot is consumed.
pub fn mark_abandoned(record: &mut DeliveryRecord, reason: &str) -> bool {
    if !can_transition(record.status, DeliveryStatus::Abandoned) {
        return false;
    }
    record.status = DeliveryStatus::Abandoned;
    record.error_message = Some(reason.to_string());
    record.next_retry_at = None;
    release(record);
    true
}

/// Terminal structural failure: the delivery can never be attempted.
pub fn mark_failed(record: &mut DeliveryRecord, reason: &str) -> bool {
    if !can_transition(record.status, DeliveryStatus::Failed) {
        return false;
    }
    record.status = DeliveryStatus::Failed;
    record.error_message = Some(reason.to_string());
    record.next_retry_at = None;
    release(record);
    true
}

/// Rate-limit deferral: push the due time out without consuming an
/// attempt or changing status.
pub fn defer(record: &mut DeliveryRecord, delay_ms: u64, now: u64) {
    if record.status.is_terminal() {
        return;
    }
    if record.status == DeliveryStatus::Delivering {
        // claimed before the limiter said no; put it back in line
        record.status = DeliveryStatus::Pending;
    }
    record.next_retry_at = Some(now + delay_ms.max(1));
    release(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Event, Webhook};

    fn record() -> DeliveryRecord {
        let event = Event::new("evt_1", "user.created", serde_json::json!({}));
        let webhook = Webhook::new("wh_1", "user_1", "https://example.com/hook");
        let payload = event.envelope_bytes().unwrap();
        DeliveryRecord::new(&event, &webhook, payload, 3)
    }

    fn ok_outcome() -> AttemptOutcome {
        AttemptOutcome {
            success: true,
            http_status: Some(200),
            response_body: Some("ok".into()),
            duration_ms: 12,
            error: None,
        }
    }

    fn failed_outcome() -> AttemptOutcome {
        AttemptOutcome {
            success: false,
            http_status: Some(500),
            response_body: Some("boom".into()),
            duration_ms: 12,
            error: Some(crate::error::FailureReason::RemoteError { status: 500 }),
        }
    }

    #[test]
    fn terminal_states_are_immutable() {
        let mut r = record();
        assert!(mark_delivering(&mut r, 1));
        assert!(mark_delivered(&mut r, &ok_outcome(), 2));

        assert!(!mark_delivering(&mut r, 3));
        assert!(!mark_retry_scheduled(&mut r, &failed_outcome(), "e", 100, 3));
        assert!(!mark_abandoned(&mut r, "drain"));
        assert!(!mark_failed(&mut r, "gone"));
        assert_eq!(r.status, DeliveryStatus::Delivered);
    }

    #[test]
    fn failure_schedules_retry_with_future_due_time() {
        let mut r = record();
        mark_delivering(&mut r, 1000);
        assert!(mark_retry_scheduled(
            &mut r,
            &failed_outcome(),
            "HTTP 500",
            2000,
            1000
        ));
        assert_eq!(r.status, DeliveryStatus::RetryScheduled);
        assert_eq!(r.attempts, 1);
        assert_eq!(r.next_retry_at, Some(3000));
        assert!(r.claimed_by.is_none());
    }

    #[test]
    fn attempts_never_exceed_max() {
        let mut r = record();
        for _ in 0..5 {
            mark_delivering(&mut r, 1);
            if r.attempts + 1 >= r.max_attempts {
                mark_abandoned_after_attempt(&mut r, &failed_outcome(), "e", 1);
                break;
            }
            mark_retry_scheduled(&mut r, &failed_outcome(), "e", 1, 1);
            r.next_retry_at = Some(0); // force due for the next loop
        }
        assert_eq!(r.attempts, 3);
        assert_eq!(r.status, DeliveryStatus::Abandoned);
    }

    #[test]
    fn claim_excludes_second_claimant() {
        let mut r = record();
        r.next_retry_at = Some(0);
        assert!(claim(&mut r, "worker-0", 60_000, 100));
        assert!(!claim(&mut r, "worker-1", 60_000, 100));
        assert_eq!(r.claimed_by.as_deref(), Some("worker-0"));
    }

    #[test]
    fn expired_claim_is_reclaimable() {
        let mut r = record();
        r.next_retry_at = Some(0);
        assert!(claim(&mut r, "worker-0", 50, 100));
        mark_delivering(&mut r, 100);
        // worker-0 died; its claim lapses at 150
        assert!(claim(&mut r, "worker-1", 50, 200));
        assert_eq!(r.claimed_by.as_deref(), Some("worker-1"));
    }

    #[test]
    fn future_retry_is_not_claimable() {
        let mut r = record();
        r.status = DeliveryStatus::RetryScheduled;
        r.next_retry_at = Some(5000);
        assert!(!is_claimable(&r, 4000));
        assert!(is_claimable(&r, 5000));
    }

    #[test]
    fn defer_keeps_attempts_and_reschedules() {
        let mut r = record();
        claim(&mut r, "worker-0", 60_000, 100);
        mark_delivering(&mut r, 100);
        defer(&mut r, 5000, 100);
        assert_eq!(r.status, DeliveryStatus::Pending);
        assert_eq!(r.attempts, 0);
        assert_eq!(r.next_retry_at, Some(5100));
        assert!(r.claimed_by.is_none());
    }

    #[test]
    fn drain_abandon_consumes_no_attempt() {
        let mut r = record();
        r.status = DeliveryStatus::RetryScheduled;
        assert!(mark_abandoned(&mut r, "webhook suspended"));
        assert_eq!(r.attempts, 0);
        assert_eq!(r.status, DeliveryStatus::Abandoned);
    }
}
