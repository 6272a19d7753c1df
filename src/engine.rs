use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};

use crate::error::{ConfigError, DispatchError, RegisterError};
use crate::executor::{AttemptOutcome, DeliveryExecutor, Transport};
use crate::rate_limit::{CounterStore, RateLimiter};
use crate::registry::WebhookRegistry;
use crate::storage::Storage;
use crate::types::{
    now_millis, DeliveryKey, DeliveryRecord, Event, UserId, Webhook, WebhookId, WebhookStats,
    WebhookStatus,
};
use crate::worker::{
    drain_open_records, worker_loop, Disposition, DueTask, WorkReport, WorkerContext,
};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

#[cfg(feature = "tracing")]
fn trace_info(message: &str) {
    tracing::info!("{message}");
}

#[cfg(not(feature = "tracing"))]
fn trace_info(_message: &str) {}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of delivery workers.
    pub worker_count: usize,
    /// Capacity of the ready queue.
    pub queue_size: usize,
    /// Default max delivery attempts (1–10); webhooks may override.
    pub max_retry_attempts: u32,
    /// Base backoff delay in milliseconds (100–60000).
    pub retry_delay_ms: u64,
    /// Backoff multiplier (1–10).
    pub retry_multiplier: u32,
    /// Upper bound on a single backoff delay.
    pub retry_max_delay_ms: u64,
    /// Random jitter added to every scheduled retry.
    pub retry_jitter_ms: u64,
    /// Default per-attempt timeout in milliseconds (1000–60000).
    pub timeout_ms: u64,
    /// Registration-time cap per owner (1–1000).
    pub max_webhooks_per_user: usize,
    /// Global default requests-per-minute limit (1–1000).
    pub rate_limit_per_minute: u32,
    /// Consecutive failures before the circuit breaker suspends a
    /// webhook (1–10000).
    pub suspend_threshold: u32,
    /// Fixed delay applied when an attempt is rate limited. Distinct from
    /// failure backoff; never consumes an attempt.
    pub rate_limit_deferral_ms: u64,
    /// How long a worker's claim on a record stays exclusive.
    pub claim_ttl_ms: u64,
    /// Stored response bodies are truncated to this many bytes.
    pub max_response_body_bytes: usize,
    /// Interval of the due-work sweep that rescues records with expired
    /// claims or missed enqueues.
    pub sweep_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            worker_count,
            queue_size: 1_024,
            max_retry_attempts: 5,
            retry_delay_ms: 1_000,
            retry_multiplier: 2,
            retry_max_delay_ms: 900_000,
            retry_jitter_ms: 50,
            timeout_ms: 5_000,
            max_webhooks_per_user: 100,
            rate_limit_per_minute: 120,
            suspend_threshold: 10,
            rate_limit_deferral_ms: 5_000,
            claim_ttl_ms: 60_000,
            max_response_body_bytes: 4_096,
            sweep_interval_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Check every value against its accepted range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check("worker_count", self.worker_count as u64, 1, 1_024)?;
        check("queue_size", self.queue_size as u64, 1, 1_000_000)?;
        check("max_retry_attempts", self.max_retry_attempts as u64, 1, 10)?;
        check("retry_delay_ms", self.retry_delay_ms, 100, 60_000)?;
        check("retry_multiplier", self.retry_multiplier as u64, 1, 10)?;
        check("timeout_ms", self.timeout_ms, 1_000, 60_000)?;
        check(
            "max_webhooks_per_user",
            self.max_webhooks_per_user as u64,
            1,
            1_000,
        )?;
        check(
            "rate_limit_per_minute",
            self.rate_limit_per_minute as u64,
            1,
            1_000,
        )?;
        check("suspend_threshold", self.suspend_threshold as u64, 1, 10_000)?;
        Ok(())
    }
}

fn check(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

/// The webhook delivery engine.
///
/// Consumes domain events, fans them out to matching active webhooks,
/// and drives every resulting delivery record to a terminal state with
/// signed attempts, bounded retries, per-destination rate limiting and a
/// circuit breaker. Delivery state lives in the [`Storage`] backend, so
/// a restart recovers in-flight work by re-scanning the store.
pub struct DeliveryEngine {
    ready_tx: Option<mpsc::Sender<DueTask>>,
    is_running: Arc<AtomicBool>,
    worker_handles: Vec<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
    ctx: Arc<WorkerContext>,
    registry: Arc<WebhookRegistry>,
    storage: Arc<dyn Storage>,
    notify: Arc<Notify>,
    config: EngineConfig,
}

impl DeliveryEngine {
    /// Create an engine with in-memory storage and the real HTTP transport.
    #[cfg(feature = "http")]
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        Self::build(
            config,
            Arc::new(crate::storage::InMemoryStorage::new()),
            Arc::new(crate::rate_limit::InMemoryCounterStore::new()),
            Arc::new(crate::executor::HttpTransport::new()),
        )
    }

    /// Create an engine over explicit stores and transport, then recover
    /// persisted webhooks and unfinished deliveries from the storage
    /// backend, re-enqueuing each by its due time.
    pub async fn with_stores(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        counter_store: Arc<dyn CounterStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        let engine = Self::build(config, storage, counter_store, transport)?;
        engine.recover().await;
        Ok(engine)
    }

    fn build(
        config: EngineConfig,
        storage: Arc<dyn Storage>,
        counter_store: Arc<dyn CounterStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (ready_tx, ready_rx) = mpsc::channel(config.queue_size);
        let shared_ready_rx = Arc::new(Mutex::new(ready_rx));
        let (report_tx, report_rx) = mpsc::channel(config.queue_size);

        let registry = Arc::new(WebhookRegistry::new(config.suspend_threshold));
        let rate_limiter = RateLimiter::new(counter_store, config.rate_limit_per_minute);
        let executor = DeliveryExecutor::new(transport, config.max_response_body_bytes);

        let ctx = Arc::new(WorkerContext {
            storage: storage.clone(),
            registry: registry.clone(),
            rate_limiter,
            executor,
            config: config.clone(),
            report_tx,
        });

        let mut worker_handles = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            worker_handles.push(tokio::spawn(worker_loop(
                worker_id,
                shared_ready_rx.clone(),
                ctx.clone(),
            )));
        }

        let notify = Arc::new(Notify::new());
        let is_running = Arc::new(AtomicBool::new(true));

        let scheduler_handle = tokio::spawn(scheduler_loop(
            ready_tx.clone(),
            report_rx,
            storage.clone(),
            registry.clone(),
            notify.clone(),
            is_running.clone(),
            config.sweep_interval_ms,
        ));

        Ok(Self {
            ready_tx: Some(ready_tx),
            is_running,
            worker_handles,
            scheduler_handle: Some(scheduler_handle),
            ctx,
            registry,
            storage,
            notify,
            config,
        })
    }

    /// Load persisted webhooks and re-enqueue unfinished deliveries.
    async fn recover(&self) {
        for webhook in self.storage.load_webhooks().await {
            self.registry.insert(webhook).await;
        }

        let open = self.storage.load_open().await;
        if open.is_empty() {
            return;
        }
        trace_info(&format!("recovering {} unfinished deliveries", open.len()));

        let now = now_millis();
        for record in open {
            let due_in = record
                .next_retry_at
                .map(|due| due.saturating_sub(now))
                .unwrap_or(0);
            let task = DueTask::new(record.key);
            if due_in == 0 {
                if let Some(tx) = &self.ready_tx {
                    let _ = tx.send(task).await;
                }
            } else {
                // hand future work to the scheduler's timing heap
                let _ = self
                    .ctx
                    .report_tx
                    .send(WorkReport {
                        task,
                        disposition: Disposition::RetryAfter(Duration::from_millis(due_in)),
                    })
                    .await;
            }
        }
        self.notify.notify_one();
    }

    /// Register a webhook subscription.
    ///
    /// Configuration problems are rejected here and never reach the
    /// delivery path. A zero timeout means "use the engine default".
    pub async fn register_webhook(&self, mut webhook: Webhook) -> Result<(), RegisterError> {
        if !(webhook.url.starts_with("https://") || webhook.url.starts_with("http://")) {
            return Err(RegisterError::InvalidUrl(webhook.url.clone()));
        }
        if webhook.secret.is_empty() {
            return Err(RegisterError::MissingSecret);
        }
        let existing = self.registry.count_for_user(&webhook.user_id).await;
        if existing >= self.config.max_webhooks_per_user
            && !self.registry.contains(&webhook.id).await
        {
            return Err(RegisterError::LimitExceeded {
                limit: self.config.max_webhooks_per_user,
            });
        }

        if webhook.timeout.is_zero() {
            webhook.timeout = Duration::from_millis(self.config.timeout_ms);
        }

        self.storage.save_webhook(&webhook).await;
        self.registry.insert(webhook).await;
        Ok(())
    }

    /// Consume one domain event: create and enqueue a delivery record for
    /// every matching active webhook.
    ///
    /// Returns the number of records created. Redelivery of an event the
    /// engine has already recorded for a webhook is a no-op for that
    /// webhook. Created records are durable before they are enqueued; if
    /// the ready queue is momentarily full the due-work sweep picks the
    /// record up, and `Backpressure` tells the caller to slow down.
    pub async fn on_event(&self, event: &Event) -> Result<usize, DispatchError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(DispatchError::Shutdown);
        }

        let matched = self.registry.matching(&event.event_type).await;
        if matched.is_empty() {
            return Ok(0);
        }

        let payload = event
            .envelope_bytes()
            .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;

        let Some(ready_tx) = &self.ready_tx else {
            return Err(DispatchError::Shutdown);
        };

        let mut created = 0usize;
        let mut saturated = false;

        for webhook in matched {
            let key = DeliveryKey::new(event.id.clone(), webhook.id.clone());
            if self.storage.get_record(&key).await.is_some() {
                // at-least-once bus redelivered this event
                continue;
            }

            let max_attempts = webhook
                .retry_attempts
                .unwrap_or(self.config.max_retry_attempts);
            let record = DeliveryRecord::new(event, &webhook, payload.clone(), max_attempts);
            self.storage.insert_record(&record).await;
            created += 1;

            match ready_tx.try_send(DueTask::new(key)) {
                Ok(()) => {
                    metric_inc("webhook.dispatch.enqueued");
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // the record is persisted; the sweep will pick it up
                    metric_inc("webhook.dispatch.backpressure");
                    saturated = true;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(DispatchError::Shutdown);
                }
            }
        }

        if saturated {
            return Err(DispatchError::Backpressure);
        }
        Ok(created)
    }

    /// One immediate, unrecorded attempt against a webhook's destination.
    ///
    /// A successful test resets the failure streak and reactivates a
    /// suspended webhook; a failed test changes nothing.
    pub async fn test_delivery(
        &self,
        webhook_id: &WebhookId,
    ) -> Result<AttemptOutcome, DispatchError> {
        let webhook = self
            .registry
            .get(webhook_id)
            .await
            .ok_or_else(|| DispatchError::UnknownWebhook {
                webhook_id: webhook_id.clone(),
            })?;

        let event = Event::new(
            format!("test_{}", now_millis()),
            "webhook.test",
            serde_json::json!({ "test": true }),
        );
        let payload = event
            .envelope_bytes()
            .map_err(|e| DispatchError::InvalidPayload(e.to_string()))?;
        let record = DeliveryRecord::new(&event, &webhook, payload, 1);

        let outcome = self.ctx.executor.attempt(&record, &webhook).await;

        if outcome.success {
            if let Some(effect) = self.registry.record_outcome(webhook_id, true, None).await {
                self.storage.save_webhook(&effect.webhook).await;
            }
            if webhook.status == WebhookStatus::Suspended {
                if let Some(restored) = self.registry.reactivate(webhook_id).await {
                    self.storage.save_webhook(&restored).await;
                    trace_info(&format!(
                        "webhook {} reactivated by successful test delivery",
                        webhook_id.0
                    ));
                }
            }
        }

        Ok(outcome)
    }

    /// Operator action: bring a suspended or disabled webhook back.
    pub async fn reactivate_webhook(&self, webhook_id: &WebhookId) -> bool {
        match self.registry.reactivate(webhook_id).await {
            Some(webhook) => {
                self.storage.save_webhook(&webhook).await;
                true
            }
            None => false,
        }
    }

    /// Operator action: turn a webhook off. Queued work is drained to a
    /// terminal state; an attempt already in flight finishes on its own.
    pub async fn disable_webhook(&self, webhook_id: &WebhookId) -> bool {
        match self.registry.disable(webhook_id).await {
            Some(webhook) => {
                self.storage.save_webhook(&webhook).await;
                drain_open_records(self.storage.as_ref(), webhook_id, "webhook disabled").await;
                true
            }
            None => false,
        }
    }

    /// Remove a webhook entirely. Queued work is drained.
    pub async fn delete_webhook(&self, webhook_id: &WebhookId) -> bool {
        if self.registry.remove(webhook_id).await.is_none() {
            return false;
        }
        self.storage.delete_webhook(webhook_id).await;
        drain_open_records(self.storage.as_ref(), webhook_id, "webhook deleted").await;
        true
    }

    /// A webhook with its secret and sensitive headers masked.
    pub async fn webhook(&self, webhook_id: &WebhookId) -> Option<Webhook> {
        self.registry.get(webhook_id).await.map(|w| w.redacted())
    }

    /// All of a user's webhooks, masked.
    pub async fn webhooks_for_user(&self, user_id: &UserId) -> Vec<Webhook> {
        self.registry
            .for_user(user_id)
            .await
            .into_iter()
            .map(|w| w.redacted())
            .collect()
    }

    pub async fn delivery(&self, key: &DeliveryKey) -> Option<DeliveryRecord> {
        self.storage.get_record(key).await
    }

    pub async fn deliveries_for_webhook(&self, webhook_id: &WebhookId) -> Vec<DeliveryRecord> {
        self.storage.records_for_webhook(webhook_id).await
    }

    pub async fn webhook_stats(&self, webhook_id: &WebhookId) -> Option<WebhookStats> {
        self.registry.stats(webhook_id).await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop intake and drain the workers. Unfinished deliveries stay in
    /// the store and are recovered by the next engine instance.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.ready_tx.take();
        self.notify.notify_waiters();

        if let Some(handle) = self.scheduler_handle.take() {
            let _ = handle.await;
        }
        for handle in self.worker_handles.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Owns the timing heap: worker reports with a delay land here and are
/// moved to the ready queue once due. A periodic sweep of the store
/// rescues records the heap does not know about (expired claims, missed
/// enqueues, work left by a previous process) and refreshes the registry
/// so webhook changes made by other engine instances take effect here.
async fn scheduler_loop(
    ready_tx: mpsc::Sender<DueTask>,
    mut report_rx: mpsc::Receiver<WorkReport>,
    storage: Arc<dyn Storage>,
    registry: Arc<WebhookRegistry>,
    notify: Arc<Notify>,
    is_running: Arc<AtomicBool>,
    sweep_interval_ms: u64,
) {
    let mut delay_heap: BinaryHeap<TimedTask> = BinaryHeap::new();
    let mut sweep = tokio::time::interval(Duration::from_millis(sweep_interval_ms.max(1)));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the immediate first tick would race startup recovery
    sweep.tick().await;

    loop {
        if !is_running.load(Ordering::SeqCst) {
            return;
        }

        let next_ready = delay_heap.peek().map(|t| t.ready_at);

        tokio::select! {
            maybe_report = report_rx.recv() => {
                let Some(report) = maybe_report else { return };
                let delay = match report.disposition {
                    Disposition::Done => None,
                    Disposition::RetryAfter(d) | Disposition::DeferAfter(d) => Some(d),
                };
                if let Some(delay) = delay {
                    delay_heap.push(TimedTask {
                        ready_at: Instant::now() + delay,
                        task: report.task,
                    });
                }
            }
            _ = sleep_until(next_ready.unwrap_or_else(Instant::now)), if next_ready.is_some() => {
                let now = Instant::now();
                while let Some(timed) = delay_heap.peek() {
                    if timed.ready_at > now {
                        break;
                    }
                    let Some(timed) = delay_heap.pop() else { break };
                    if ready_tx.send(timed.task).await.is_err() {
                        return;
                    }
                }
            }
            _ = sweep.tick() => {
                registry.sync_from(storage.load_webhooks().await).await;
                let due = storage.load_due(now_millis()).await;
                for record in due {
                    // duplicates are harmless: the claim check skips them
                    let _ = ready_tx.try_send(DueTask::new(record.key));
                }
            }
            _ = notify.notified() => {}
        }
    }
}

#[derive(Debug)]
struct TimedTask {
    ready_at: Instant,
    task: DueTask,
}

impl Eq for TimedTask {}

impl PartialEq for TimedTask {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at.eq(&other.ready_at)
    }
}

impl Ord for TimedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse for min-heap behavior
        other.ready_at.cmp(&self.ready_at)
    }
}

impl PartialOrd for TimedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut config = EngineConfig::default();
        config.max_retry_attempts = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "max_retry_attempts");

        let mut config = EngineConfig::default();
        config.max_retry_attempts = 11;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry_delay_ms = 99;
        assert_eq!(config.validate().unwrap_err().field, "retry_delay_ms");

        let mut config = EngineConfig::default();
        config.retry_multiplier = 11;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.timeout_ms = 100;
        assert_eq!(config.validate().unwrap_err().field, "timeout_ms");

        let mut config = EngineConfig::default();
        config.rate_limit_per_minute = 1_001;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_webhooks_per_user = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.suspend_threshold = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "suspend_threshold");
        assert_eq!(err.max, 10_000);
    }

    #[test]
    fn timed_tasks_pop_earliest_first() {
        let mut heap = BinaryHeap::new();
        let base = Instant::now();
        for offset in [30u64, 10, 20] {
            heap.push(TimedTask {
                ready_at: base + Duration::from_millis(offset),
                task: DueTask::new(DeliveryKey::new(
                    crate::types::EventId(format!("evt_{offset}")),
                    WebhookId("wh".into()),
                )),
            });
        }
        let order: Vec<String> = std::iter::from_fn(|| heap.pop())
            .map(|t| t.task.key.event_id.0)
            .collect();
        assert_eq!(order, vec!["evt_10", "evt_20", "evt_30"]);
    }
}
