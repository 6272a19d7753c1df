//! Delivery workers.
//!
//! Each worker drives one due delivery end-to-end: claim, registry and
//! rate-limit checks, the HTTP attempt, then outcome persistence. The
//! HTTP call is the only operation expected to suspend meaningfully and
//! is bounded by the webhook's timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::engine::EngineConfig;
use crate::executor::DeliveryExecutor;
use crate::rate_limit::RateLimiter;
use crate::registry::WebhookRegistry;
use crate::retry::{next_retry, RetryDecision};
use crate::state_machine;
use crate::storage::Storage;
use crate::types::{now_millis, DeliveryKey, WebhookId};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
macro_rules! trace_delivery {
    ($level:ident, $task:expr, $($arg:tt)*) => {
        tracing::$level!(
            event_id = %$task.key.event_id.0,
            webhook_id = %$task.key.webhook_id.0,
            $($arg)*
        )
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_delivery {
    ($level:ident, $task:expr, $($arg:tt)*) => {
        let _ = &$task;
    };
}

/// Lightweight handle to a due delivery. The record itself stays in the
/// store; a stale handle is harmless because the claim check skips it.
#[derive(Debug, Clone)]
pub struct DueTask {
    pub key: DeliveryKey,
}

impl DueTask {
    pub fn new(key: DeliveryKey) -> Self {
        Self { key }
    }
}

/// What the scheduler should do with a task after a worker is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Terminal, skipped, or otherwise finished; nothing to requeue.
    Done,
    /// Attempt failed with budget remaining; requeue after this delay.
    RetryAfter(Duration),
    /// Rate limited; requeue after the deferral delay, no attempt spent.
    DeferAfter(Duration),
}

#[derive(Debug, Clone)]
pub struct WorkReport {
    pub task: DueTask,
    pub disposition: Disposition,
}

/// Shared context for all workers.
pub struct WorkerContext {
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<WebhookRegistry>,
    pub rate_limiter: RateLimiter,
    pub executor: DeliveryExecutor,
    pub config: EngineConfig,
    /// Reports from workers back to the scheduler.
    pub report_tx: mpsc::Sender<WorkReport>,
}

/// Main worker loop: pull a due task, process it, report the disposition.
pub async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<DueTask>>>,
    ctx: Arc<WorkerContext>,
) {
    let claimant = format!("worker-{worker_id}");
    loop {
        let task = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };

        let Some(task) = task else { break };

        let disposition = process_task(&claimant, &task, &ctx).await;
        let _ = ctx.report_tx.send(WorkReport { task, disposition }).await;
    }
}

/// Process a single due delivery.
async fn process_task(claimant: &str, task: &DueTask, ctx: &WorkerContext) -> Disposition {
    let now = now_millis();

    // Claim first: exactly one worker may hold a due record.
    let Some(mut record) = ctx
        .storage
        .claim_record(&task.key, claimant, ctx.config.claim_ttl_ms, now)
        .await
    else {
        return Disposition::Done;
    };

    let webhook = match ctx.registry.get(&task.key.webhook_id).await {
        Some(w) => w,
        None => {
            // webhook deleted while work was queued
            state_machine::mark_failed(&mut record, "webhook no longer registered");
            ctx.storage.update_record(&record).await;
            trace_delivery!(info, task, "delivery failed, webhook deleted");
            return Disposition::Done;
        }
    };

    if !webhook.is_active() {
        // drain rather than deliver to a destination the operator cut off
        state_machine::mark_abandoned(&mut record, "webhook suspended or disabled");
        ctx.storage.update_record(&record).await;
        metric_inc("webhook.delivery.drained");
        trace_delivery!(info, task, "delivery abandoned, webhook not active");
        return Disposition::Done;
    }

    if !ctx
        .rate_limiter
        .try_acquire(&webhook.id, webhook.rate_limit)
        .await
    {
        let delay = ctx.config.rate_limit_deferral_ms;
        state_machine::defer(&mut record, delay, now);
        ctx.storage.update_record(&record).await;
        trace_delivery!(debug, task, deferral_ms = delay, "delivery rate limited");
        return Disposition::DeferAfter(Duration::from_millis(delay));
    }

    if !state_machine::mark_delivering(&mut record, now) {
        // terminal in the meantime; leave it alone
        ctx.storage.release_claim(&task.key).await;
        return Disposition::Done;
    }
    ctx.storage.update_record(&record).await;

    let outcome = ctx.executor.attempt(&record, &webhook).await;
    let now = now_millis();

    if outcome.success {
        state_machine::mark_delivered(&mut record, &outcome, now);
        ctx.storage.update_record(&record).await;
        record_webhook_outcome(ctx, &webhook.id, true, None).await;
        metric_inc("webhook.delivery.delivered");
        trace_delivery!(
            info,
            task,
            attempts = record.attempts,
            status = outcome.http_status,
            "delivery succeeded"
        );
        return Disposition::Done;
    }

    let reason = outcome
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "delivery failed".to_string());
    let retryable = outcome.error.as_ref().is_none_or(|e| e.is_retryable());

    let attempts_after = record.attempts + 1;
    let decision = if retryable {
        next_retry(
            attempts_after,
            ctx.config.retry_delay_ms,
            ctx.config.retry_multiplier,
            ctx.config.retry_max_delay_ms,
            record.max_attempts,
        )
    } else {
        RetryDecision::Exhausted
    };

    let disposition = match decision {
        RetryDecision::RetryAfter(delay) => {
            let delay = delay + jitter(ctx.config.retry_jitter_ms);
            state_machine::mark_retry_scheduled(
                &mut record,
                &outcome,
                &reason,
                delay.as_millis() as u64,
                now,
            );
            ctx.storage.update_record(&record).await;
            metric_inc("webhook.delivery.retry_scheduled");
            trace_delivery!(
                warn,
                task,
                attempts = record.attempts,
                error = %reason,
                retry_in_ms = delay.as_millis() as u64,
                "delivery failed, retry scheduled"
            );
            Disposition::RetryAfter(delay)
        }
        RetryDecision::Exhausted => {
            state_machine::mark_abandoned_after_attempt(&mut record, &outcome, &reason, now);
            ctx.storage.update_record(&record).await;
            metric_inc("webhook.delivery.abandoned");
            trace_delivery!(
                warn,
                task,
                attempts = record.attempts,
                error = %reason,
                "delivery abandoned"
            );
            Disposition::Done
        }
    };

    record_webhook_outcome(ctx, &webhook.id, false, Some(&reason)).await;
    disposition
}

/// Update webhook counters through the registry's single-writer path and
/// persist the result. Trips of the circuit breaker also drain queued
/// work for the now-suspended webhook.
async fn record_webhook_outcome(
    ctx: &WorkerContext,
    webhook_id: &WebhookId,
    success: bool,
    reason: Option<&str>,
) {
    let Some(effect) = ctx.registry.record_outcome(webhook_id, success, reason).await else {
        return;
    };
    ctx.storage.save_webhook(&effect.webhook).await;

    if effect.suspended {
        metric_inc("webhook.circuit.suspended");
        #[cfg(feature = "tracing")]
        tracing::warn!(
            webhook_id = %webhook_id.0,
            consecutive_failures = effect.webhook.consecutive_failures,
            "circuit breaker suspended webhook"
        );
        drain_open_records(ctx.storage.as_ref(), webhook_id, "webhook suspended").await;
    }
}

/// Abandon every queued record for a webhook that is no longer worth
/// delivering to. Records held by a worker (in `Delivering`, or carrying
/// a live claim taken between claiming and the first status write) are
/// left alone; their attempt finishes on its own.
pub(crate) async fn drain_open_records(storage: &dyn Storage, webhook_id: &WebhookId, reason: &str) {
    let now = now_millis();
    let open = storage.open_records_for_webhook(webhook_id).await;
    for mut record in open {
        if record.status == crate::types::DeliveryStatus::Delivering
            || record.claim_expires_at.is_some_and(|expires| expires > now)
        {
            continue;
        }
        if state_machine::mark_abandoned(&mut record, reason) {
            storage.update_record(&record).await;
            metric_inc("webhook.delivery.drained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;
    use crate::types::{DeliveryRecord, DeliveryStatus, Event, Webhook};

    fn record(event_id: &str) -> DeliveryRecord {
        let event = Event::new(event_id, "user.created", serde_json::json!({}));
        let webhook = Webhook::new("wh_1", "user_1", "https://example.com/hook");
        let payload = event.envelope_bytes().unwrap();
        DeliveryRecord::new(&event, &webhook, payload, 3)
    }

    #[tokio::test]
    async fn drain_skips_records_held_by_a_worker() {
        let storage = InMemoryStorage::new();
        let webhook_id = WebhookId("wh_1".into());
        let now = now_millis();

        // a worker has claimed this record but not yet written a status
        let claimed = record("evt_claimed");
        storage.insert_record(&claimed).await;
        assert!(storage
            .claim_record(&claimed.key, "worker-0", 60_000, now)
            .await
            .is_some());

        let mut parked = record("evt_parked");
        parked.status = DeliveryStatus::RetryScheduled;
        parked.next_retry_at = Some(now + 60_000);
        storage.insert_record(&parked).await;

        drain_open_records(&storage, &webhook_id, "webhook suspended").await;

        // the claimed record stays with its worker
        let held = storage.get_record(&claimed.key).await.unwrap();
        assert_eq!(held.status, DeliveryStatus::Pending);
        assert_eq!(held.claimed_by.as_deref(), Some("worker-0"));

        // the parked retry is drained without spending an attempt
        let drained = storage.get_record(&parked.key).await.unwrap();
        assert_eq!(drained.status, DeliveryStatus::Abandoned);
        assert_eq!(drained.attempts, 0);
    }

    #[tokio::test]
    async fn drain_reaps_expired_claims() {
        let storage = InMemoryStorage::new();
        let webhook_id = WebhookId("wh_1".into());
        let now = now_millis();

        let mut stale = record("evt_stale");
        stale.next_retry_at = Some(now.saturating_sub(120_000));
        storage.insert_record(&stale).await;
        // claim granted far in the past; its worker is gone
        assert!(storage
            .claim_record(&stale.key, "worker-0", 1, now.saturating_sub(60_000))
            .await
            .is_some());

        drain_open_records(&storage, &webhook_id, "webhook suspended").await;

        let drained = storage.get_record(&stale.key).await.unwrap();
        assert_eq!(drained.status, DeliveryStatus::Abandoned);
    }
}

fn jitter(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    Duration::from_millis(fastrand::u64(0..=jitter_ms))
}
