//! Persistence for webhooks and delivery records.
//!
//! The store is the source of truth for retry state: in-memory queues
//! hold only handles, so recovery after a restart is a re-scan of the
//! due-work index, not a reconstruction of runtime state.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::state_machine;
use crate::types::{DeliveryKey, DeliveryRecord, Webhook, WebhookId};

#[async_trait]
pub trait Storage: Send + Sync {
    async fn insert_record(&self, record: &DeliveryRecord);

    /// Persist a new snapshot of the record.
    ///
    /// The first terminal write wins: a backend must discard a snapshot
    /// that would change the status of a record already in a terminal
    /// status, so a worker holding a stale copy cannot revert it.
    async fn update_record(&self, record: &DeliveryRecord);

    async fn get_record(&self, key: &DeliveryKey) -> Option<DeliveryRecord>;

    /// Atomically claim a record for one worker.
    ///
    /// Returns the claimed record, or `None` when it is terminal, not yet
    /// due, or already claimed. Expired claims are taken over.
    async fn claim_record(
        &self,
        key: &DeliveryKey,
        claimant: &str,
        claim_ttl_ms: u64,
        now_ms: u64,
    ) -> Option<DeliveryRecord>;

    /// Drop a claim without changing anything else.
    async fn release_claim(&self, key: &DeliveryKey);

    /// Records eligible for a worker right now (the due-work index).
    async fn load_due(&self, now_ms: u64) -> Vec<DeliveryRecord>;

    /// All non-terminal records, for startup recovery.
    async fn load_open(&self) -> Vec<DeliveryRecord>;

    /// Non-terminal records for one webhook, for draining on suspension.
    async fn open_records_for_webhook(&self, webhook_id: &WebhookId) -> Vec<DeliveryRecord>;

    /// Delivery history for the admin surface.
    async fn records_for_webhook(&self, webhook_id: &WebhookId) -> Vec<DeliveryRecord>;

    async fn save_webhook(&self, webhook: &Webhook);
    async fn load_webhooks(&self) -> Vec<Webhook>;
    async fn delete_webhook(&self, id: &WebhookId);
}

/// In-memory storage for lightweight deployments and tests.
#[derive(Default)]
pub struct InMemoryStorage {
    records: Mutex<HashMap<DeliveryKey, DeliveryRecord>>,
    webhooks: Mutex<HashMap<WebhookId, Webhook>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_record(&self, record: &DeliveryRecord) {
        let mut records = self.records.lock().await;
        records
            .entry(record.key.clone())
            .or_insert_with(|| record.clone());
    }

    async fn update_record(&self, record: &DeliveryRecord) {
        let mut records = self.records.lock().await;
        if let Some(stored) = records.get(&record.key) {
            if stored.status.is_terminal() && stored.status != record.status {
                return;
            }
        }
        records.insert(record.key.clone(), record.clone());
    }

    async fn get_record(&self, key: &DeliveryKey) -> Option<DeliveryRecord> {
        let records = self.records.lock().await;
        records.get(key).cloned()
    }

    async fn claim_record(
        &self,
        key: &DeliveryKey,
        claimant: &str,
        claim_ttl_ms: u64,
        now_ms: u64,
    ) -> Option<DeliveryRecord> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(key)?;
        if state_machine::claim(record, claimant, claim_ttl_ms, now_ms) {
            Some(record.clone())
        } else {
            None
        }
    }

    async fn release_claim(&self, key: &DeliveryKey) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(key) {
            record.claimed_by = None;
            record.claim_expires_at = None;
        }
    }

    async fn load_due(&self, now_ms: u64) -> Vec<DeliveryRecord> {
        let records = self.records.lock().await;
        records
            .values()
            .filter(|r| state_machine::is_claimable(r, now_ms))
            .cloned()
            .collect()
    }

    async fn load_open(&self) -> Vec<DeliveryRecord> {
        let records = self.records.lock().await;
        records
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect()
    }

    async fn open_records_for_webhook(&self, webhook_id: &WebhookId) -> Vec<DeliveryRecord> {
        let records = self.records.lock().await;
        records
            .values()
            .filter(|r| &r.key.webhook_id == webhook_id && !r.status.is_terminal())
            .cloned()
            .collect()
    }

    async fn records_for_webhook(&self, webhook_id: &WebhookId) -> Vec<DeliveryRecord> {
        let records = self.records.lock().await;
        let mut out: Vec<DeliveryRecord> = records
            .values()
            .filter(|r| &r.key.webhook_id == webhook_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    async fn save_webhook(&self, webhook: &Webhook) {
        let mut webhooks = self.webhooks.lock().await;
        webhooks.insert(webhook.id.clone(), webhook.clone());
    }

    async fn load_webhooks(&self) -> Vec<Webhook> {
        let webhooks = self.webhooks.lock().await;
        webhooks.values().cloned().collect()
    }

    async fn delete_webhook(&self, id: &WebhookId) {
        let mut webhooks = self.webhooks.lock().await;
        webhooks.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeliveryStatus, Event};

    fn record(event_id: &str, webhook_id: &str) -> DeliveryRecord {
        let event = Event::new(event_id, "user.created", serde_json::json!({}));
        let webhook = Webhook::new(webhook_id, "user_1", "https://example.com/hook");
        let payload = event.envelope_bytes().unwrap();
        DeliveryRecord::new(&event, &webhook, payload, 3)
    }

    #[tokio::test]
    async fn insert_is_create_only() {
        let storage = InMemoryStorage::new();
        let mut r = record("evt_1", "wh_1");
        storage.insert_record(&r).await;

        // a second insert for the same key must not clobber progress
        r.attempts = 2;
        storage.insert_record(&r).await;
        let loaded = storage.get_record(&r.key).await.unwrap();
        assert_eq!(loaded.attempts, 0);
    }

    #[tokio::test]
    async fn terminal_status_never_reverts() {
        let storage = InMemoryStorage::new();
        let mut r = record("evt_1", "wh_1");
        storage.insert_record(&r).await;

        let mut delivered = r.clone();
        delivered.status = DeliveryStatus::Delivered;
        delivered.attempts = 1;
        storage.update_record(&delivered).await;

        // a worker holding a stale copy tries to schedule a retry
        r.status = DeliveryStatus::RetryScheduled;
        r.attempts = 1;
        r.next_retry_at = Some(crate::types::now_millis() + 60_000);
        storage.update_record(&r).await;

        let stored = storage.get_record(&r.key).await.unwrap();
        assert_eq!(stored.status, DeliveryStatus::Delivered);
    }

    #[tokio::test]
    async fn claim_race_has_one_winner() {
        let storage = InMemoryStorage::new();
        let r = record("evt_1", "wh_1");
        storage.insert_record(&r).await;

        let now = crate::types::now_millis();
        let first = storage.claim_record(&r.key, "worker-0", 60_000, now).await;
        let second = storage.claim_record(&r.key, "worker-1", 60_000, now).await;

        assert!(first.is_some());
        assert!(second.is_none());
        let stored = storage.get_record(&r.key).await.unwrap();
        assert_eq!(stored.claimed_by.as_deref(), Some("worker-0"));
    }

    #[tokio::test]
    async fn load_due_skips_future_and_terminal() {
        let storage = InMemoryStorage::new();
        let now = crate::types::now_millis();

        let due = record("evt_due", "wh_1");
        storage.insert_record(&due).await;

        let mut future = record("evt_future", "wh_1");
        future.status = DeliveryStatus::RetryScheduled;
        future.next_retry_at = Some(now + 60_000);
        storage.insert_record(&future).await;

        let mut done = record("evt_done", "wh_1");
        done.status = DeliveryStatus::Delivered;
        storage.insert_record(&done).await;

        let loaded = storage.load_due(now).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key.event_id.0, "evt_due");
    }

    #[tokio::test]
    async fn open_records_exclude_terminal() {
        let storage = InMemoryStorage::new();
        let wh = WebhookId("wh_1".into());

        storage.insert_record(&record("evt_1", "wh_1")).await;
        let mut done = record("evt_2", "wh_1");
        done.status = DeliveryStatus::Abandoned;
        storage.insert_record(&done).await;
        storage.insert_record(&record("evt_3", "wh_other")).await;

        let open = storage.open_records_for_webhook(&wh).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].key.event_id.0, "evt_1");

        let all = storage.records_for_webhook(&wh).await;
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn webhooks_round_trip() {
        let storage = InMemoryStorage::new();
        let webhook = Webhook::new("wh_1", "user_1", "https://example.com/hook");
        storage.save_webhook(&webhook).await;
        assert_eq!(storage.load_webhooks().await.len(), 1);
        storage.delete_webhook(&webhook.id).await;
        assert!(storage.load_webhooks().await.is_empty());
    }
}
