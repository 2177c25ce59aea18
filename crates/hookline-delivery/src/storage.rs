//! Storage abstraction for the delivery engine.
//!
//! The trigger service talks to the event store only through
//! [`DeliveryStorage`]. Production wraps `hookline_core::storage::Storage`;
//! tests use the in-memory [`mock::MockDeliveryStorage`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use hookline_core::{
    error::Result, DeliveryStatus, EventId, Webhook, WebhookDelivery, WebhookEvent, WebhookId,
};
use uuid::Uuid;

type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Event store operations required by the delivery engine.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Loads a webhook by id. `None` if it no longer exists.
    fn find_webhook(&self, id: WebhookId) -> StorageFuture<'_, Option<Webhook>>;

    /// Lists enabled webhooks for change dispatch.
    fn find_enabled_webhooks(&self) -> StorageFuture<'_, Vec<Webhook>>;

    /// Persists new events atomically: all of them or none.
    fn create_events(&self, events: Vec<WebhookEvent>) -> StorageFuture<'_, Vec<EventId>>;

    /// Fetches up to `limit` due, unprocessed events of one webhook in
    /// creation order.
    fn fetch_due_events(
        &self,
        webhook_id: WebhookId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<WebhookEvent>>;

    /// Returns up to `limit` distinct webhook ids with due events.
    fn find_webhooks_with_due_events(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<WebhookId>>;

    /// Marks an event delivered.
    fn mark_processed(&self, id: EventId, now: DateTime<Utc>) -> StorageFuture<'_, ()>;

    /// Records a failed attempt. `next_retry_at = None` is terminal.
    fn record_failure(
        &self,
        id: EventId,
        attempts: i32,
        next_retry_at: Option<DateTime<Utc>>,
        error_message: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Moves `next_retry_at` without consuming an attempt.
    fn reschedule(&self, id: EventId, next_retry_at: DateTime<Utc>) -> StorageFuture<'_, ()>;

    /// Deletes processed events created before `cutoff`.
    fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64>;

    /// Inserts an audit row before a send.
    fn create_delivery(&self, delivery: WebhookDelivery) -> StorageFuture<'_, ()>;

    /// Completes an audit row after a send.
    fn complete_delivery(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        response_status: Option<i32>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;
}

/// Production storage backed by PostgreSQL repositories.
pub struct PostgresDeliveryStorage {
    storage: Arc<hookline_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<hookline_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_webhook(&self, id: WebhookId) -> StorageFuture<'_, Option<Webhook>> {
        Box::pin(async move { self.storage.webhooks.find_by_id(id).await })
    }

    fn find_enabled_webhooks(&self) -> StorageFuture<'_, Vec<Webhook>> {
        Box::pin(async move { self.storage.webhooks.find_enabled().await })
    }

    fn create_events(&self, events: Vec<WebhookEvent>) -> StorageFuture<'_, Vec<EventId>> {
        Box::pin(async move { self.storage.webhook_events.create_many(&events).await })
    }

    fn fetch_due_events(
        &self,
        webhook_id: WebhookId,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<WebhookEvent>> {
        Box::pin(async move { self.storage.webhook_events.fetch_due(webhook_id, limit, now).await })
    }

    fn find_webhooks_with_due_events(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<WebhookId>> {
        Box::pin(async move {
            self.storage.webhook_events.find_webhooks_with_due_events(limit, now).await
        })
    }

    fn mark_processed(&self, id: EventId, now: DateTime<Utc>) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.webhook_events.mark_processed(id, now).await })
    }

    fn record_failure(
        &self,
        id: EventId,
        attempts: i32,
        next_retry_at: Option<DateTime<Utc>>,
        error_message: String,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage
                .webhook_events
                .record_failure(id, attempts, next_retry_at, &error_message, now)
                .await
        })
    }

    fn reschedule(&self, id: EventId, next_retry_at: DateTime<Utc>) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.webhook_events.reschedule(id, next_retry_at).await })
    }

    fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
        Box::pin(async move { self.storage.webhook_events.delete_processed_before(cutoff).await })
    }

    fn create_delivery(&self, delivery: WebhookDelivery) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage.webhook_deliveries.create(&delivery).await.map(|_| ())
        })
    }

    fn complete_delivery(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        response_status: Option<i32>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage
                .webhook_deliveries
                .complete(id, status, response_status, error_message.as_deref(), now)
                .await
        })
    }
}

pub mod mock {
    //! In-memory storage for exercising delivery logic without a database.
    //!
    //! Due-ness and ordering follow the PostgreSQL queries exactly. Errors
    //! can be injected per operation group.

    use std::collections::HashMap;

    use hookline_core::CoreError;
    use tokio::sync::RwLock;

    use super::{
        Arc, DateTime, DeliveryStatus, DeliveryStorage, EventId, Result, StorageFuture, Utc, Uuid,
        Webhook, WebhookDelivery, WebhookEvent, WebhookId,
    };

    /// Mock storage holding webhooks, events and audit rows in memory.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        webhooks: Arc<RwLock<HashMap<WebhookId, Webhook>>>,
        events: Arc<RwLock<HashMap<EventId, WebhookEvent>>>,
        deliveries: Arc<RwLock<Vec<WebhookDelivery>>>,
        fetch_error: Arc<RwLock<Option<String>>>,
        write_error: Arc<RwLock<Option<String>>>,
    }

    impl MockDeliveryStorage {
        /// Creates an empty mock storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds or replaces a webhook.
        pub async fn add_webhook(&self, webhook: Webhook) {
            self.webhooks.write().await.insert(webhook.id, webhook);
        }

        /// Adds an event as-is.
        pub async fn add_event(&self, event: WebhookEvent) {
            self.events.write().await.insert(event.id, event);
        }

        /// Enables or disables a stored webhook.
        pub async fn set_webhook_enabled(&self, id: WebhookId, enabled: bool) {
            if let Some(webhook) = self.webhooks.write().await.get_mut(&id) {
                webhook.enabled = enabled;
            }
        }

        /// Returns a snapshot of one event.
        pub async fn event(&self, id: EventId) -> Option<WebhookEvent> {
            self.events.read().await.get(&id).cloned()
        }

        /// Returns every event of one webhook in creation order.
        pub async fn events_for(&self, webhook_id: WebhookId) -> Vec<WebhookEvent> {
            let mut events: Vec<_> = self
                .events
                .read()
                .await
                .values()
                .filter(|e| e.webhook_id == webhook_id)
                .cloned()
                .collect();
            events.sort_by_key(|e| e.created_at);
            events
        }

        /// Returns every audit row in insertion order.
        pub async fn deliveries(&self) -> Vec<WebhookDelivery> {
            self.deliveries.read().await.clone()
        }

        /// Makes fetch operations fail with `message` until cleared.
        pub async fn inject_fetch_error(&self, message: Option<String>) {
            *self.fetch_error.write().await = message;
        }

        /// Makes event write operations fail with `message` until cleared.
        pub async fn inject_write_error(&self, message: Option<String>) {
            *self.write_error.write().await = message;
        }

        async fn check(&self, slot: &RwLock<Option<String>>) -> Result<()> {
            match slot.read().await.as_ref() {
                Some(message) => Err(CoreError::Database(message.clone())),
                None => Ok(()),
            }
        }

        async fn update_event<F>(&self, id: EventId, update: F) -> Result<()>
        where
            F: FnOnce(&mut WebhookEvent) + Send,
        {
            self.check(&self.write_error).await?;
            let mut events = self.events.write().await;
            let event =
                events.get_mut(&id).ok_or_else(|| CoreError::NotFound(format!("event {id}")))?;
            update(event);
            Ok(())
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_webhook(&self, id: WebhookId) -> StorageFuture<'_, Option<Webhook>> {
            Box::pin(async move {
                self.check(&self.fetch_error).await?;
                Ok(self.webhooks.read().await.get(&id).cloned())
            })
        }

        fn find_enabled_webhooks(&self) -> StorageFuture<'_, Vec<Webhook>> {
            Box::pin(async move {
                self.check(&self.fetch_error).await?;
                let mut webhooks: Vec<_> =
                    self.webhooks.read().await.values().filter(|w| w.enabled).cloned().collect();
                webhooks.sort_by_key(|w| w.created_at);
                Ok(webhooks)
            })
        }

        fn create_events(&self, events: Vec<WebhookEvent>) -> StorageFuture<'_, Vec<EventId>> {
            Box::pin(async move {
                self.check(&self.write_error).await?;
                {
                    let webhooks = self.webhooks.read().await;
                    if let Some(missing) =
                        events.iter().find(|e| !webhooks.contains_key(&e.webhook_id))
                    {
                        return Err(CoreError::ConstraintViolation(format!(
                            "webhook {} does not exist",
                            missing.webhook_id
                        )));
                    }
                }
                let mut stored = self.events.write().await;
                let ids = events.iter().map(|e| e.id).collect();
                for event in events {
                    stored.insert(event.id, event);
                }
                Ok(ids)
            })
        }

        fn fetch_due_events(
            &self,
            webhook_id: WebhookId,
            limit: usize,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<WebhookEvent>> {
            Box::pin(async move {
                self.check(&self.fetch_error).await?;
                let mut due: Vec<_> = self
                    .events
                    .read()
                    .await
                    .values()
                    .filter(|e| e.webhook_id == webhook_id && e.is_due(now))
                    .cloned()
                    .collect();
                due.sort_by_key(|e| e.created_at);
                due.truncate(limit);
                Ok(due)
            })
        }

        fn find_webhooks_with_due_events(
            &self,
            limit: usize,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<WebhookId>> {
            Box::pin(async move {
                self.check(&self.fetch_error).await?;
                let mut earliest: HashMap<WebhookId, DateTime<Utc>> = HashMap::new();
                for event in self.events.read().await.values().filter(|e| e.is_due(now)) {
                    let due_at = event.next_retry_at.unwrap_or(event.created_at);
                    earliest
                        .entry(event.webhook_id)
                        .and_modify(|t| *t = (*t).min(due_at))
                        .or_insert(due_at);
                }
                let mut ids: Vec<_> = earliest.into_iter().collect();
                ids.sort_by_key(|(_, due_at)| *due_at);
                Ok(ids.into_iter().take(limit).map(|(id, _)| id).collect())
            })
        }

        fn mark_processed(&self, id: EventId, now: DateTime<Utc>) -> StorageFuture<'_, ()> {
            Box::pin(self.update_event(id, move |event| {
                event.processed = true;
                event.last_attempt_at = Some(now);
                event.next_retry_at = None;
                event.error_message = None;
            }))
        }

        fn record_failure(
            &self,
            id: EventId,
            attempts: i32,
            next_retry_at: Option<DateTime<Utc>>,
            error_message: String,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(self.update_event(id, move |event| {
                event.attempts = attempts;
                event.next_retry_at = next_retry_at;
                event.error_message = Some(error_message);
                event.last_attempt_at = Some(now);
            }))
        }

        fn reschedule(&self, id: EventId, next_retry_at: DateTime<Utc>) -> StorageFuture<'_, ()> {
            Box::pin(self.update_event(id, move |event| {
                event.next_retry_at = Some(next_retry_at);
            }))
        }

        fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> StorageFuture<'_, u64> {
            Box::pin(async move {
                self.check(&self.write_error).await?;
                let mut events = self.events.write().await;
                let before = events.len();
                events.retain(|_, e| !(e.processed && e.created_at < cutoff));
                Ok(u64::try_from(before - events.len()).unwrap_or(u64::MAX))
            })
        }

        fn create_delivery(&self, delivery: WebhookDelivery) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.deliveries.write().await.push(delivery);
                Ok(())
            })
        }

        fn complete_delivery(
            &self,
            id: Uuid,
            status: DeliveryStatus,
            response_status: Option<i32>,
            error_message: Option<String>,
            now: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut deliveries = self.deliveries.write().await;
                let delivery = deliveries
                    .iter_mut()
                    .find(|d| d.id == id)
                    .ok_or_else(|| CoreError::NotFound(format!("delivery {id}")))?;
                delivery.status = status;
                delivery.response_status = response_status;
                delivery.error_message = error_message;
                delivery.completed_at = Some(now);
                Ok(())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use hookline_core::{Operation, RowChange};

    use super::{mock::MockDeliveryStorage, *};

    fn change() -> RowChange {
        RowChange {
            operation: Operation::Insert,
            schema: "public".to_string(),
            table: "orders".to_string(),
            record_id: None,
            old_record: None,
            new_record: Some(serde_json::json!({"id": 1})),
        }
    }

    #[tokio::test]
    async fn mock_fetch_due_orders_by_creation_and_respects_limit() {
        let storage = MockDeliveryStorage::new();
        let webhook = Webhook::new("hook", "https://example.com");
        storage.add_webhook(webhook.clone()).await;

        let base = Utc::now();
        let events = [3, 1, 2]
            .into_iter()
            .map(|offset| {
                WebhookEvent::from_change(
                    webhook.id,
                    &change(),
                    base + chrono::Duration::seconds(offset),
                )
            })
            .collect();
        assert_eq!(storage.create_events(events).await.unwrap().len(), 3);

        let due = storage
            .fetch_due_events(webhook.id, 2, base + chrono::Duration::seconds(10))
            .await
            .unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].created_at, base + chrono::Duration::seconds(1));
        assert_eq!(due[1].created_at, base + chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn mock_event_creation_is_all_or_nothing() {
        let storage = MockDeliveryStorage::new();
        let webhook = Webhook::new("hook", "https://example.com");
        storage.add_webhook(webhook.clone()).await;

        let known = WebhookEvent::from_change(webhook.id, &change(), Utc::now());
        let unknown = WebhookEvent::from_change(WebhookId::new(), &change(), Utc::now());
        assert!(storage.create_events(vec![known, unknown]).await.is_err());
        assert!(storage.events_for(webhook.id).await.is_empty());
    }

    #[tokio::test]
    async fn injected_fetch_errors_surface() {
        let storage = MockDeliveryStorage::new();
        storage.inject_fetch_error(Some("connection reset".to_string())).await;

        let err = storage.find_webhooks_with_due_events(10, Utc::now()).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn retention_keeps_unprocessed_and_recent_events() {
        let storage = MockDeliveryStorage::new();
        let webhook = Webhook::new("hook", "https://example.com");
        storage.add_webhook(webhook.clone()).await;

        let now = Utc::now();
        let mut old_done = WebhookEvent::from_change(webhook.id, &change(), now - chrono::Duration::days(8));
        old_done.processed = true;
        let old_pending = WebhookEvent::from_change(webhook.id, &change(), now - chrono::Duration::days(8));
        let mut recent_done = WebhookEvent::from_change(webhook.id, &change(), now);
        recent_done.processed = true;
        for e in [old_done, old_pending, recent_done] {
            storage.add_event(e).await;
        }

        let removed = storage.delete_processed_before(now - chrono::Duration::days(7)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(storage.events_for(webhook.id).await.len(), 2);
    }
}
