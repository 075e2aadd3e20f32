//! Event delivery engine: fans a committed [`EventToDeliver`] out to a
//! topic's verified subscribers in Normal mode, then drains the failure
//! list in Retry mode until it is empty or the event gives up.

pub mod error;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;

use crate::core::constants::{
    DELIVERY_BARRIER_DEADLINE, DELIVERY_RETRY_PERIOD_SECS, EVENT_QUEUE, EVENT_SUBSCRIBER_CHUNK_SIZE,
    MAX_DELIVERY_FAILURES, OUTBOUND_HTTP_TIMEOUT, backoff_seconds,
};
use crate::queue::TaskQueue;
use crate::store::Store;
use crate::store::entities::{DeliveryMode, EventToDeliver, Subscription};
use crate::utils::crypto::hmac_sha1_signature;
use error::DeliveryError;

pub struct DeliveryEngine {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    http: reqwest::Client,
}

impl DeliveryEngine {
    pub fn new(store: Arc<Store>, queue: Arc<TaskQueue>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(OUTBOUND_HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self { store, queue, http }
    }

    /// `Deliver(eventKey)`: processes exactly one chunk of work for the
    /// event, in whichever mode it currently holds.
    pub async fn deliver(&self, event_key: &str) -> Result<(), DeliveryError> {
        let Some(event) = self.store.get_event(event_key).await? else {
            return Ok(());
        };

        match event.mode {
            DeliveryMode::Normal => self.deliver_normal(event).await,
            DeliveryMode::Retry => self.deliver_retry(event).await,
        }
    }

    async fn deliver_normal(&self, mut event: EventToDeliver) -> Result<(), DeliveryError> {
        let start = event.last_callback.clone().unwrap_or_default();
        let mut page = self
            .store
            .list_verified_subscribers_chunk(&event.topic_hash, &start, EVENT_SUBSCRIBER_CHUNK_SIZE + 1)
            .await?;

        let more_callbacks = page.len() as i64 > EVENT_SUBSCRIBER_CHUNK_SIZE;
        event.last_callback = Some(page.last().map(|s| s.callback_hash.clone()).unwrap_or_default());
        page.truncate(EVENT_SUBSCRIBER_CHUNK_SIZE as usize);

        let failed = self.deliver_chunk(&event, &page).await;
        self.apply_outcome(event, more_callbacks, failed).await
    }

    async fn deliver_retry(&self, mut event: EventToDeliver) -> Result<(), DeliveryError> {
        let chunk_size = EVENT_SUBSCRIBER_CHUNK_SIZE as usize;
        let mut next_keys: Vec<String> = event.failed_callbacks.iter().take(chunk_size).cloned().collect();
        let mut more_callbacks = event.failed_callbacks.len() > next_keys.len();

        let sentinel = event.last_callback.clone().filter(|s| !s.is_empty());
        if let Some(sentinel) = &sentinel
            && let Some(pos) = next_keys.iter().position(|k| k == sentinel)
        {
            more_callbacks = false;
            next_keys.truncate(pos);
        }

        let mut subs = Vec::with_capacity(next_keys.len());
        for key in &next_keys {
            if let Some(sub) = self.store.get_subscription(key).await? {
                subs.push(sub);
            }
        }

        if sentinel.is_none()
            && let Some(first) = subs.first()
        {
            event.last_callback = Some(first.key.clone());
        }

        event.failed_callbacks.drain(0..next_keys.len());

        let failed = self.deliver_chunk(&event, &subs).await;
        self.apply_outcome(event, more_callbacks, failed).await
    }

    async fn apply_outcome(
        &self,
        mut event: EventToDeliver,
        more_callbacks: bool,
        mut failed: Vec<Subscription>,
    ) -> Result<(), DeliveryError> {
        failed.sort_by(|a, b| a.callback_hash.cmp(&b.callback_hash));
        event.failed_callbacks.extend(failed.into_iter().map(|s| s.key));
        event.last_modified = Utc::now();

        if !more_callbacks && event.failed_callbacks.is_empty() {
            self.store.delete_event(&event.key).await?;
            return Ok(());
        }

        if !more_callbacks {
            event.last_callback = None;
            let delay = backoff_seconds(DELIVERY_RETRY_PERIOD_SECS, (event.retry_attempts + 1) as u32);
            let next_eta = Utc::now() + chrono::Duration::seconds(delay);
            event.retry_attempts += 1;
            if event.retry_attempts as u32 > MAX_DELIVERY_FAILURES {
                event.totally_failed = true;
            }
            if event.mode == DeliveryMode::Normal {
                event.mode = DeliveryMode::Retry;
            }

            self.store.put_event(&event).await?;
            if !event.totally_failed {
                self.enqueue_delivery(&event.key, next_eta).await?;
            }
            return Ok(());
        }

        self.store.put_event(&event).await?;
        self.enqueue_delivery(&event.key, Utc::now()).await?;
        Ok(())
    }

    async fn enqueue_delivery(&self, event_key: &str, eta: DateTime<Utc>) -> Result<(), DeliveryError> {
        self.queue
            .enqueue_at(
                EVENT_QUEUE,
                None,
                "/work/push_events",
                &serde_json::json!({"event_key": event_key}),
                eta,
            )
            .await?;
        Ok(())
    }

    /// Issues every delivery in the chunk concurrently, each bounded by
    /// [`DELIVERY_BARRIER_DEADLINE`], and returns the subscribers whose
    /// delivery did not succeed.
    async fn deliver_chunk(&self, event: &EventToDeliver, subs: &[Subscription]) -> Vec<Subscription> {
        let attempts = subs.iter().map(|sub| self.deliver_one(event, sub));
        let results = futures::future::join_all(attempts).await;
        subs.iter()
            .cloned()
            .zip(results)
            .filter_map(|(sub, ok)| if ok { None } else { Some(sub) })
            .collect()
    }

    async fn deliver_one(&self, event: &EventToDeliver, sub: &Subscription) -> bool {
        let mut request = self
            .http
            .post(&sub.callback)
            .header(CONTENT_TYPE, event.content_type.mime_type())
            .body(event.payload.clone());

        if let Some(key) = sub.secret.as_ref().or(sub.verify_token.as_ref()) {
            let signature = hmac_sha1_signature(key.as_bytes(), event.payload.as_bytes());
            request = request.header("X-Hub-Signature", signature);
        }

        let attempt = async {
            match request.send().await {
                Ok(resp) => matches!(resp.status().as_u16(), 200 | 204),
                Err(_) => false,
            }
        };

        tokio::time::timeout(DELIVERY_BARRIER_DEADLINE, attempt)
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::{FeedContentType, SubscriptionState};
    use crate::store::sqlite::SqliteStore;

    async fn test_engine() -> (DeliveryEngine, Arc<Store>) {
        let store = Arc::new(Store::Sqlite(SqliteStore::open_memory().await.unwrap()));
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&store),
            "http://127.0.0.1:0".to_string(),
            "secret".to_string(),
        ));
        (DeliveryEngine::new(Arc::clone(&store), queue), store)
    }

    fn sample_subscription(callback: &str, topic: &str) -> Subscription {
        let now = Utc::now();
        Subscription {
            key: Subscription::key_for(callback, topic),
            callback: callback.to_string(),
            callback_hash: crate::utils::crypto::sha1_hex(callback),
            topic: topic.to_string(),
            topic_hash: crate::utils::crypto::sha1_hex(topic),
            created_at: now,
            last_modified: now,
            lease_seconds: 86400,
            expiration_time: now,
            eta: now,
            confirm_failures: 0,
            verify_token: None,
            secret: None,
            state: SubscriptionState::Verified,
        }
    }

    #[tokio::test]
    async fn deliver_of_missing_event_is_a_noop() {
        let (engine, _store) = test_engine().await;
        engine.deliver("nope").await.unwrap();
    }

    #[tokio::test]
    async fn normal_mode_with_no_subscribers_deletes_event_immediately() {
        let (engine, store) = test_engine().await;
        let topic = "http://pub.example/feed";
        let event = EventToDeliver {
            key: EventToDeliver::key_for(topic),
            topic: topic.to_string(),
            topic_hash: crate::utils::crypto::sha1_hex(topic),
            payload: "<feed></feed>".to_string(),
            content_type: FeedContentType::Atom,
            mode: DeliveryMode::Normal,
            last_callback: None,
            failed_callbacks: Vec::new(),
            retry_attempts: 0,
            last_modified: Utc::now(),
            totally_failed: false,
        };
        store.put_event(&event).await.unwrap();

        engine.deliver(&event.key).await.unwrap();

        assert!(store.get_event(&event.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_mode_skips_deleted_subscriptions() {
        let (engine, store) = test_engine().await;
        let topic = "http://pub.example/feed";
        let sub = sample_subscription("http://sub.example/cb", topic);
        let ghost_key = Subscription::key_for("http://sub.example/gone", topic);

        let event = EventToDeliver {
            key: EventToDeliver::key_for(topic),
            topic: topic.to_string(),
            topic_hash: crate::utils::crypto::sha1_hex(topic),
            payload: "<feed></feed>".to_string(),
            content_type: FeedContentType::Atom,
            mode: DeliveryMode::Retry,
            last_callback: None,
            failed_callbacks: vec![ghost_key, sub.key.clone()],
            retry_attempts: 0,
            last_modified: Utc::now(),
            totally_failed: false,
        };
        store.put_event(&event).await.unwrap();

        engine.deliver(&event.key).await.unwrap();
    }
}
