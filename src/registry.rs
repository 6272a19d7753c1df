//! In-memory view of active subscriptions and the circuit breaker.
//!
//! The registry is the single writer for webhook counters: every outcome
//! goes through [`WebhookRegistry::record_outcome`], which runs under the
//! map's write lock so two attempts resolving concurrently for the same
//! webhook cannot lose updates.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::types::{now_millis, UserId, Webhook, WebhookId, WebhookStats, WebhookStatus};

/// What `record_outcome` changed, for the caller to persist.
#[derive(Debug, Clone)]
pub struct OutcomeEffect {
    /// Snapshot of the webhook after the update.
    pub webhook: Webhook,
    /// True when this outcome tripped the circuit breaker.
    pub suspended: bool,
}

pub struct WebhookRegistry {
    webhooks: RwLock<HashMap<WebhookId, Webhook>>,
    suspend_threshold: u32,
}

impl WebhookRegistry {
    pub fn new(suspend_threshold: u32) -> Self {
        Self {
            webhooks: RwLock::new(HashMap::new()),
            suspend_threshold: suspend_threshold.max(1),
        }
    }

    pub async fn insert(&self, webhook: Webhook) {
        let mut guard = self.webhooks.write().await;
        guard.insert(webhook.id.clone(), webhook);
    }

    pub async fn remove(&self, id: &WebhookId) -> Option<Webhook> {
        let mut guard = self.webhooks.write().await;
        guard.remove(id)
    }

    pub async fn get(&self, id: &WebhookId) -> Option<Webhook> {
        let guard = self.webhooks.read().await;
        guard.get(id).cloned()
    }

    pub async fn contains(&self, id: &WebhookId) -> bool {
        let guard = self.webhooks.read().await;
        guard.contains_key(id)
    }

    /// Active webhooks whose subscriptions match this event type.
    pub async fn matching(&self, event_type: &str) -> Vec<Webhook> {
        let guard = self.webhooks.read().await;
        guard
            .values()
            .filter(|w| w.is_active() && w.matches_event_type(event_type))
            .cloned()
            .collect()
    }

    pub async fn count_for_user(&self, user_id: &UserId) -> usize {
        let guard = self.webhooks.read().await;
        guard.values().filter(|w| &w.user_id == user_id).count()
    }

    pub async fn for_user(&self, user_id: &UserId) -> Vec<Webhook> {
        let guard = self.webhooks.read().await;
        guard
            .values()
            .filter(|w| &w.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<Webhook> {
        let guard = self.webhooks.read().await;
        guard.values().cloned().collect()
    }

    /// Record a delivery outcome against the webhook's counters.
    ///
    /// On success the consecutive-failure streak resets. On failure the
    /// streak grows, and reaching the threshold flips the webhook to
    /// `Suspended` until an operator reactivates it.
    pub async fn record_outcome(
        &self,
        id: &WebhookId,
        success: bool,
        reason: Option<&str>,
    ) -> Option<OutcomeEffect> {
        let now = now_millis();
        let mut guard = self.webhooks.write().await;
        let webhook = guard.get_mut(id)?;

        let mut suspended = false;
        if success {
            webhook.success_count += 1;
            webhook.consecutive_failures = 0;
            webhook.last_success_at = Some(now);
        } else {
            webhook.failure_count += 1;
            webhook.consecutive_failures += 1;
            webhook.last_failure_at = Some(now);
            webhook.last_failure_reason = reason.map(|r| r.to_string());

            if webhook.status == WebhookStatus::Active
                && webhook.consecutive_failures >= self.suspend_threshold
            {
                webhook.status = WebhookStatus::Suspended;
                suspended = true;
            }
        }
        webhook.updated_at = now;

        Some(OutcomeEffect {
            webhook: webhook.clone(),
            suspended,
        })
    }

    /// Operator action: bring a suspended or disabled webhook back.
    ///
    /// Resets the failure streak so the breaker does not re-trip on the
    /// first post-reactivation failure.
    pub async fn reactivate(&self, id: &WebhookId) -> Option<Webhook> {
        let mut guard = self.webhooks.write().await;
        let webhook = guard.get_mut(id)?;
        webhook.status = WebhookStatus::Active;
        webhook.consecutive_failures = 0;
        webhook.updated_at = now_millis();
        Some(webhook.clone())
    }

    /// Operator action: turn a webhook off.
    pub async fn disable(&self, id: &WebhookId) -> Option<Webhook> {
        let mut guard = self.webhooks.write().await;
        let webhook = guard.get_mut(id)?;
        webhook.status = WebhookStatus::Disabled;
        webhook.updated_at = now_millis();
        Some(webhook.clone())
    }

    /// Adopt webhook state persisted by other engine instances.
    ///
    /// Store rows newer than the local copy (by `updated_at`) replace it,
    /// unknown webhooks are added, and webhooks no longer in the store are
    /// dropped. While the local copy is newest it stays authoritative, so
    /// a refresh never clobbers counters this instance just updated.
    pub async fn sync_from(&self, stored: Vec<Webhook>) {
        let mut guard = self.webhooks.write().await;
        let mut seen = HashSet::with_capacity(stored.len());
        for webhook in stored {
            seen.insert(webhook.id.clone());
            match guard.get(&webhook.id) {
                Some(local) if local.updated_at >= webhook.updated_at => {}
                _ => {
                    guard.insert(webhook.id.clone(), webhook);
                }
            }
        }
        guard.retain(|id, _| seen.contains(id));
    }

    pub async fn stats(&self, id: &WebhookId) -> Option<WebhookStats> {
        let guard = self.webhooks.read().await;
        guard.get(id).map(|w| WebhookStats {
            success_count: w.success_count,
            failure_count: w.failure_count,
            consecutive_failures: w.consecutive_failures,
            last_success_at: w.last_success_at,
            last_failure_at: w.last_failure_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook(id: &str) -> Webhook {
        Webhook::new(id, "user_1", "https://example.com/hook").with_event_type("user.*")
    }

    #[tokio::test]
    async fn matching_skips_inactive_and_unsubscribed() {
        let registry = WebhookRegistry::new(3);
        registry.insert(webhook("a")).await;
        registry
            .insert(webhook("b").with_event_type("order.paid"))
            .await;
        let mut disabled = webhook("c");
        disabled.status = WebhookStatus::Disabled;
        registry.insert(disabled).await;

        let matched = registry.matching("user.created").await;
        let ids: Vec<&str> = matched.iter().map(|w| w.id.0.as_str()).collect();
        assert!(ids.contains(&"a"));
        assert!(ids.contains(&"b"));
        assert!(!ids.contains(&"c"));
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let registry = WebhookRegistry::new(5);
        registry.insert(webhook("a")).await;
        let id = WebhookId("a".into());

        registry.record_outcome(&id, false, Some("HTTP 500")).await;
        registry.record_outcome(&id, false, Some("HTTP 500")).await;
        let effect = registry.record_outcome(&id, true, None).await.unwrap();

        assert_eq!(effect.webhook.consecutive_failures, 0);
        assert_eq!(effect.webhook.failure_count, 2);
        assert_eq!(effect.webhook.success_count, 1);
        assert!(effect.webhook.last_success_at.is_some());
    }

    #[tokio::test]
    async fn breaker_trips_at_threshold() {
        let registry = WebhookRegistry::new(3);
        registry.insert(webhook("a")).await;
        let id = WebhookId("a".into());

        for i in 0..2 {
            let effect = registry
                .record_outcome(&id, false, Some("timeout"))
                .await
                .unwrap();
            assert!(!effect.suspended, "tripped early at failure {}", i + 1);
            assert_eq!(effect.webhook.status, WebhookStatus::Active);
        }

        let effect = registry
            .record_outcome(&id, false, Some("timeout"))
            .await
            .unwrap();
        assert!(effect.suspended);
        assert_eq!(effect.webhook.status, WebhookStatus::Suspended);

        // suspended webhooks no longer match
        assert!(registry.matching("user.created").await.is_empty());
    }

    #[tokio::test]
    async fn breaker_does_not_retrip_while_suspended() {
        let registry = WebhookRegistry::new(2);
        registry.insert(webhook("a")).await;
        let id = WebhookId("a".into());

        registry.record_outcome(&id, false, None).await;
        let effect = registry.record_outcome(&id, false, None).await.unwrap();
        assert!(effect.suspended);

        // further failures (in-flight attempts resolving) stay quiet
        let effect = registry.record_outcome(&id, false, None).await.unwrap();
        assert!(!effect.suspended);
        assert_eq!(effect.webhook.status, WebhookStatus::Suspended);
    }

    #[tokio::test]
    async fn reactivate_resets_streak_and_matches_again() {
        let registry = WebhookRegistry::new(1);
        registry.insert(webhook("a")).await;
        let id = WebhookId("a".into());

        let effect = registry.record_outcome(&id, false, None).await.unwrap();
        assert!(effect.suspended);

        let restored = registry.reactivate(&id).await.unwrap();
        assert_eq!(restored.status, WebhookStatus::Active);
        assert_eq!(restored.consecutive_failures, 0);
        assert_eq!(registry.matching("user.created").await.len(), 1);
    }

    #[tokio::test]
    async fn sync_adopts_newer_rows_and_drops_deleted() {
        let registry = WebhookRegistry::new(3);
        registry.insert(webhook("a")).await;
        registry.insert(webhook("b")).await;

        // another instance suspended "a" and registered "c"; "b" was deleted
        let mut suspended = registry.get(&WebhookId("a".into())).await.unwrap();
        suspended.status = WebhookStatus::Suspended;
        suspended.updated_at += 1;
        registry.sync_from(vec![suspended, webhook("c")]).await;

        assert_eq!(
            registry.get(&WebhookId("a".into())).await.unwrap().status,
            WebhookStatus::Suspended
        );
        assert!(registry.get(&WebhookId("b".into())).await.is_none());
        assert!(registry.get(&WebhookId("c".into())).await.is_some());
    }

    #[tokio::test]
    async fn sync_keeps_the_local_copy_while_it_is_newest() {
        let registry = WebhookRegistry::new(3);
        registry.insert(webhook("a")).await;
        let id = WebhookId("a".into());
        registry.record_outcome(&id, false, Some("timeout")).await;

        // a stale store row must not clobber the local failure streak
        let mut stale = webhook("a");
        stale.updated_at = 0;
        registry.sync_from(vec![stale]).await;

        assert_eq!(registry.stats(&id).await.unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn stats_reflect_counters() {
        let registry = WebhookRegistry::new(10);
        registry.insert(webhook("a")).await;
        let id = WebhookId("a".into());

        registry.record_outcome(&id, true, None).await;
        registry.record_outcome(&id, false, Some("HTTP 502")).await;

        let stats = registry.stats(&id).await.unwrap();
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.consecutive_failures, 1);
    }
}
