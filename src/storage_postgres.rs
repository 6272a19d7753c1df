//! Postgres-backed delivery storage.
//!
//! Records are stored as JSONB payloads keyed by the delivery identity,
//! with the status, due time and claim expiry denormalized into columns
//! so the due-work and claim queries stay in SQL. The claim is a guarded
//! `UPDATE ... RETURNING`, so it stays atomic across processes.

#[cfg(feature = "postgres")]
use async_trait::async_trait;
#[cfg(feature = "postgres")]
use tokio_postgres::Client;

#[cfg(feature = "postgres")]
use crate::storage::Storage;
#[cfg(feature = "postgres")]
use crate::types::{DeliveryKey, DeliveryRecord, Webhook, WebhookId};

#[cfg(feature = "postgres")]
const TERMINAL: &str = "('delivered', 'failed', 'abandoned')";

#[cfg(feature = "postgres")]
pub struct PostgresStorage {
    client: Client,
}

#[cfg(feature = "postgres")]
impl PostgresStorage {
    pub async fn new(client: Client) -> Result<Self, tokio_postgres::Error> {
        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                    id TEXT PRIMARY KEY,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    id TEXT PRIMARY KEY,
                    webhook_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    next_retry_at BIGINT,
                    claim_expires_at BIGINT,
                    payload JSONB NOT NULL
                )",
                &[],
            )
            .await?;

        client
            .execute(
                "CREATE INDEX IF NOT EXISTS webhook_deliveries_due
                 ON webhook_deliveries (status, next_retry_at)",
                &[],
            )
            .await?;

        Ok(Self { client })
    }

    fn record_id(key: &DeliveryKey) -> String {
        format!("{}|{}", key.event_id.0, key.webhook_id.0)
    }

    fn parse_rows(rows: Vec<tokio_postgres::Row>) -> Vec<DeliveryRecord> {
        rows.into_iter()
            .filter_map(|row| row.try_get::<_, serde_json::Value>(0).ok())
            .filter_map(|v| serde_json::from_value::<DeliveryRecord>(v).ok())
            .collect()
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Storage for PostgresStorage {
    async fn insert_record(&self, record: &DeliveryRecord) {
        let payload = serde_json::to_value(record).unwrap_or_default();
        // create-only: redelivered events must not clobber progress
        let _ = self
            .client
            .execute(
                "INSERT INTO webhook_deliveries
                     (id, webhook_id, status, next_retry_at, claim_expires_at, payload)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &Self::record_id(&record.key),
                    &record.key.webhook_id.0,
                    &record.status.as_str(),
                    &record.next_retry_at.map(|v| v as i64),
                    &record.claim_expires_at.map(|v| v as i64),
                    &payload,
                ],
            )
            .await;
    }

    async fn update_record(&self, record: &DeliveryRecord) {
        let payload = serde_json::to_value(record).unwrap_or_default();
        // the first terminal write wins; stale workers cannot revert it
        let sql = format!(
            "UPDATE webhook_deliveries
                SET status = $2,
                    next_retry_at = $3,
                    claim_expires_at = $4,
                    payload = $5
              WHERE id = $1
                AND status NOT IN {TERMINAL}"
        );
        let _ = self
            .client
            .execute(
                &sql,
                &[
                    &Self::record_id(&record.key),
                    &record.status.as_str(),
                    &record.next_retry_at.map(|v| v as i64),
                    &record.claim_expires_at.map(|v| v as i64),
                    &payload,
                ],
            )
            .await;
    }

    async fn get_record(&self, key: &DeliveryKey) -> Option<DeliveryRecord> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM webhook_deliveries WHERE id = $1",
                &[&Self::record_id(key)],
            )
            .await
            .ok()??;
        let payload: serde_json::Value = row.try_get(0).ok()?;
        serde_json::from_value(payload).ok()
    }

    async fn claim_record(
        &self,
        key: &DeliveryKey,
        claimant: &str,
        claim_ttl_ms: u64,
        now_ms: u64,
    ) -> Option<DeliveryRecord> {
        let now = now_ms as i64;
        let expires = (now_ms + claim_ttl_ms) as i64;
        let sql = format!(
            "UPDATE webhook_deliveries
                SET claim_expires_at = $3,
                    payload = payload
                        || jsonb_build_object('claimed_by', $2::text)
                        || jsonb_build_object('claim_expires_at', $3::bigint)
              WHERE id = $1
                AND status NOT IN {TERMINAL}
                AND (claim_expires_at IS NULL OR claim_expires_at <= $4)
                AND (status = 'delivering'
                     OR next_retry_at IS NULL
                     OR next_retry_at <= $4)
              RETURNING payload"
        );
        let row = self
            .client
            .query_opt(&sql, &[&Self::record_id(key), &claimant, &expires, &now])
            .await
            .ok()??;
        let payload: serde_json::Value = row.try_get(0).ok()?;
        serde_json::from_value(payload).ok()
    }

    async fn release_claim(&self, key: &DeliveryKey) {
        let _ = self
            .client
            .execute(
                "UPDATE webhook_deliveries
                    SET claim_expires_at = NULL,
                        payload = payload
                            || '{\"claimed_by\": null, \"claim_expires_at\": null}'::jsonb
                  WHERE id = $1",
                &[&Self::record_id(key)],
            )
            .await;
    }

    async fn load_due(&self, now_ms: u64) -> Vec<DeliveryRecord> {
        let now = now_ms as i64;
        let sql = format!(
            "SELECT payload FROM webhook_deliveries
              WHERE status NOT IN {TERMINAL}
                AND (claim_expires_at IS NULL OR claim_expires_at <= $1)
                AND (status = 'delivering'
                     OR next_retry_at IS NULL
                     OR next_retry_at <= $1)"
        );
        let rows = self.client.query(&sql, &[&now]).await.unwrap_or_default();
        Self::parse_rows(rows)
    }

    async fn load_open(&self) -> Vec<DeliveryRecord> {
        let sql = format!(
            "SELECT payload FROM webhook_deliveries WHERE status NOT IN {TERMINAL}"
        );
        let rows = self.client.query(&sql, &[]).await.unwrap_or_default();
        Self::parse_rows(rows)
    }

    async fn open_records_for_webhook(&self, webhook_id: &WebhookId) -> Vec<DeliveryRecord> {
        let sql = format!(
            "SELECT payload FROM webhook_deliveries
              WHERE webhook_id = $1 AND status NOT IN {TERMINAL}"
        );
        let rows = self
            .client
            .query(&sql, &[&webhook_id.0])
            .await
            .unwrap_or_default();
        Self::parse_rows(rows)
    }

    async fn records_for_webhook(&self, webhook_id: &WebhookId) -> Vec<DeliveryRecord> {
        let rows = self
            .client
            .query(
                "SELECT payload FROM webhook_deliveries WHERE webhook_id = $1",
                &[&webhook_id.0],
            )
            .await
            .unwrap_or_default();
        let mut records = Self::parse_rows(rows);
        records.sort_by_key(|r| r.created_at);
        records
    }

    async fn save_webhook(&self, webhook: &Webhook) {
        let payload = serde_json::to_value(webhook).unwrap_or_default();
        let _ = self
            .client
            .execute(
                "INSERT INTO webhook_subscriptions (id, payload)
                 VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&webhook.id.0, &payload],
            )
            .await;
    }

    async fn load_webhooks(&self) -> Vec<Webhook> {
        let rows = self
            .client
            .query("SELECT payload FROM webhook_subscriptions", &[])
            .await
            .unwrap_or_default();
        rows.into_iter()
            .filter_map(|row| row.try_get::<_, serde_json::Value>(0).ok())
            .filter_map(|v| serde_json::from_value::<Webhook>(v).ok())
            .collect()
    }

    async fn delete_webhook(&self, id: &WebhookId) {
        let _ = self
            .client
            .execute(
                "DELETE FROM webhook_subscriptions WHERE id = $1",
                &[&id.0],
            )
            .await;
    }
}
