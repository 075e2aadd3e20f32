//! Durable storage for subscriptions, feeds, delivery events, and the task
//! queue, backed by either SQLite or PostgreSQL.
//!
//! [`Store`] is a thin enum dispatch over the two backends rather than a
//! trait object: every repository method below has an identical signature
//! on both [`sqlite::SqliteStore`] and [`postgres::PostgresStore`], so the
//! dispatch is mechanical and keeps each backend's query syntax (`?` vs
//! `$1`) local to its own module.

pub mod entities;
pub mod error;
pub mod postgres;
pub mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::config::{AppConfig, StoreBackend};
use entities::{
    EventToDeliver, FeedEntryRecord, FeedRecord, FeedToFetch, KnownFeed, PollingMarker,
    QueuedTask, Subscription,
};
use error::StoreError;
use postgres::PostgresStore;
use sqlite::SqliteStore;

pub enum Store {
    Sqlite(SqliteStore),
    Postgres(PostgresStore),
}

impl Store {
    pub async fn open(config: &AppConfig) -> Result<Self, StoreError> {
        match config.store.backend {
            StoreBackend::Sqlite => {
                Ok(Self::Sqlite(SqliteStore::init(&config.store.sqlite_path).await?))
            }
            StoreBackend::Postgres => {
                let url = config.store.postgres_url.as_deref().ok_or_else(|| {
                    StoreError::Config("postgres backend requires postgres_url".to_string())
                })?;
                Ok(Self::Postgres(PostgresStore::init(url).await?))
            }
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Sqlite(s) => s.close().await,
            Self::Postgres(s) => s.close().await,
        }
    }

    /// Spawns backend-specific background maintenance (WAL checkpointing
    /// for SQLite; a no-op for PostgreSQL). Returns the handles so callers
    /// can register them with the shutdown service.
    pub fn start_maintenance_tasks(
        self: &Arc<Self>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        match self.as_ref() {
            Self::Sqlite(_) => {
                let store = Arc::clone(self);
                vec![tokio::spawn(async move {
                    let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
                    loop {
                        tokio::select! {
                            biased;
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    tracing::debug!("store maintenance task shutting down");
                                    break;
                                }
                            }
                            _ = interval.tick() => {
                                if let Store::Sqlite(sqlite) = store.as_ref() {
                                    if let Err(e) = sqlite.checkpoint().await {
                                        tracing::warn!(error = %e, "wal checkpoint failed");
                                    }
                                }
                            }
                        }
                    }
                })]
            }
            Self::Postgres(_) => Vec::new(),
        }
    }

    // ---- subscriptions ----

    pub async fn get_subscription(&self, key: &str) -> Result<Option<Subscription>, StoreError> {
        match self {
            Self::Sqlite(s) => s.get_subscription(key).await,
            Self::Postgres(s) => s.get_subscription(key).await,
        }
    }

    pub async fn put_subscription(&self, sub: &Subscription) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.put_subscription(sub).await,
            Self::Postgres(s) => s.put_subscription(sub).await,
        }
    }

    pub async fn delete_subscription(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.delete_subscription(key).await,
            Self::Postgres(s) => s.delete_subscription(key).await,
        }
    }

    pub async fn count_verified_subscribers(&self, topic_hash: &str) -> Result<i64, StoreError> {
        match self {
            Self::Sqlite(s) => s.count_verified_subscribers(topic_hash).await,
            Self::Postgres(s) => s.count_verified_subscribers(topic_hash).await,
        }
    }

    pub async fn list_verified_subscribers_chunk(
        &self,
        topic_hash: &str,
        start_callback_hash: &str,
        limit: i64,
    ) -> Result<Vec<Subscription>, StoreError> {
        match self {
            Self::Sqlite(s) => {
                s.list_verified_subscribers_chunk(topic_hash, start_callback_hash, limit)
                    .await
            }
            Self::Postgres(s) => {
                s.list_verified_subscribers_chunk(topic_hash, start_callback_hash, limit)
                    .await
            }
        }
    }

    // ---- feeds ----

    pub async fn get_feed_to_fetch(&self, key: &str) -> Result<Option<FeedToFetch>, StoreError> {
        match self {
            Self::Sqlite(s) => s.get_feed_to_fetch(key).await,
            Self::Postgres(s) => s.get_feed_to_fetch(key).await,
        }
    }

    pub async fn upsert_feed_to_fetch(
        &self,
        topic: &str,
        key: &str,
        eta: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.upsert_feed_to_fetch(topic, key, eta).await,
            Self::Postgres(s) => s.upsert_feed_to_fetch(topic, key, eta).await,
        }
    }

    pub async fn update_feed_to_fetch(&self, f: &FeedToFetch) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.update_feed_to_fetch(f).await,
            Self::Postgres(s) => s.update_feed_to_fetch(f).await,
        }
    }

    pub async fn delete_feed_to_fetch(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.delete_feed_to_fetch(key).await,
            Self::Postgres(s) => s.delete_feed_to_fetch(key).await,
        }
    }

    pub async fn delete_feed_to_fetch_if_eta(
        &self,
        key: &str,
        expected_eta: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        match self {
            Self::Sqlite(s) => s.delete_feed_to_fetch_if_eta(key, expected_eta).await,
            Self::Postgres(s) => s.delete_feed_to_fetch_if_eta(key, expected_eta).await,
        }
    }

    pub async fn get_feed_record(&self, key: &str) -> Result<Option<FeedRecord>, StoreError> {
        match self {
            Self::Sqlite(s) => s.get_feed_record(key).await,
            Self::Postgres(s) => s.get_feed_record(key).await,
        }
    }

    pub async fn get_feed_entry_records(
        &self,
        feed_key: &str,
        entry_id_hashes: &[String],
    ) -> Result<Vec<FeedEntryRecord>, StoreError> {
        match self {
            Self::Sqlite(s) => s.get_feed_entry_records(feed_key, entry_id_hashes).await,
            Self::Postgres(s) => s.get_feed_entry_records(feed_key, entry_id_hashes).await,
        }
    }

    pub async fn commit_fetch(
        &self,
        feed_record: &FeedRecord,
        new_entries: &[FeedEntryRecord],
        event: Option<&EventToDeliver>,
    ) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.commit_fetch(feed_record, new_entries, event).await,
            Self::Postgres(s) => s.commit_fetch(feed_record, new_entries, event).await,
        }
    }

    pub async fn get_known_feed(&self, key: &str) -> Result<Option<KnownFeed>, StoreError> {
        match self {
            Self::Sqlite(s) => s.get_known_feed(key).await,
            Self::Postgres(s) => s.get_known_feed(key).await,
        }
    }

    pub async fn put_known_feed(&self, key: &str, topic: &str) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.put_known_feed(key, topic).await,
            Self::Postgres(s) => s.put_known_feed(key, topic).await,
        }
    }

    pub async fn delete_known_feed(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.delete_known_feed(key).await,
            Self::Postgres(s) => s.delete_known_feed(key).await,
        }
    }

    pub async fn list_known_feed_keys_from(
        &self,
        after_key: &str,
        limit: i64,
    ) -> Result<Vec<KnownFeed>, StoreError> {
        match self {
            Self::Sqlite(s) => s.list_known_feed_keys_from(after_key, limit).await,
            Self::Postgres(s) => s.list_known_feed_keys_from(after_key, limit).await,
        }
    }

    pub async fn get_polling_marker(&self) -> Result<Option<PollingMarker>, StoreError> {
        match self {
            Self::Sqlite(s) => s.get_polling_marker().await,
            Self::Postgres(s) => s.get_polling_marker().await,
        }
    }

    pub async fn put_polling_marker(&self, marker: &PollingMarker) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.put_polling_marker(marker).await,
            Self::Postgres(s) => s.put_polling_marker(marker).await,
        }
    }

    // ---- events ----

    pub async fn get_event(&self, key: &str) -> Result<Option<EventToDeliver>, StoreError> {
        match self {
            Self::Sqlite(s) => s.get_event(key).await,
            Self::Postgres(s) => s.get_event(key).await,
        }
    }

    pub async fn put_event(&self, event: &EventToDeliver) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.put_event(event).await,
            Self::Postgres(s) => s.put_event(event).await,
        }
    }

    pub async fn delete_event(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Self::Sqlite(s) => s.delete_event(key).await,
            Self::Postgres(s) => s.delete_event(key).await,
        }
    }

    pub async fn list_totally_failed_event_keys_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        match self {
            Self::Sqlite(s) => s.list_totally_failed_event_keys_older_than(cutoff).await,
            Self::Postgres(s) => s.list_totally_failed_event_keys_older_than(cutoff).await,
        }
    }

    // ---- task queue ----

    pub async fn enqueue_task(
        &self,
        queue: &str,
        name: Option<&str>,
        url: &str,
        params: &serde_json::Value,
        eta: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        match self {
            Self::Sqlite(s) => s.enqueue_task(queue, name, url, params, eta, now).await,
            Self::Postgres(s) => s.enqueue_task(queue, name, url, params, eta, now).await,
        }
    }

    pub async fn pop_due_tasks(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QueuedTask>, StoreError> {
        match self {
            Self::Sqlite(s) => s.pop_due_tasks(queue, now, limit).await,
            Self::Postgres(s) => s.pop_due_tasks(queue, now, limit).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entities::{Subscription, SubscriptionState};

    async fn memory_store() -> Store {
        Store::Sqlite(SqliteStore::open_memory().await.unwrap())
    }

    #[tokio::test]
    async fn put_and_get_subscription_round_trips() {
        let store = memory_store().await;
        let now = Utc::now();
        let key = Subscription::key_for("https://sub.example/cb", "https://pub.example/feed");
        let sub = Subscription {
            key: key.clone(),
            callback: "https://sub.example/cb".to_string(),
            callback_hash: "hash_cb".to_string(),
            topic: "https://pub.example/feed".to_string(),
            topic_hash: "hash_topic".to_string(),
            created_at: now,
            last_modified: now,
            lease_seconds: 86400,
            expiration_time: now,
            eta: now,
            confirm_failures: 0,
            verify_token: None,
            secret: None,
            state: SubscriptionState::NotVerified,
        };

        store.put_subscription(&sub).await.unwrap();
        let fetched = store.get_subscription(&key).await.unwrap().unwrap();
        assert_eq!(fetched.topic, sub.topic);
        assert_eq!(fetched.state, SubscriptionState::NotVerified);
    }

    #[tokio::test]
    async fn enqueue_task_dedupes_by_name() {
        let store = memory_store().await;
        let now = Utc::now();
        let params = serde_json::json!({"topic": "https://pub.example/feed"});

        let first = store
            .enqueue_task("feed-pulls", Some("task-a"), "/work/pull_feeds", &params, now, now)
            .await
            .unwrap();
        let second = store
            .enqueue_task("feed-pulls", Some("task-a"), "/work/pull_feeds", &params, now, now)
            .await
            .unwrap();

        assert!(first);
        assert!(!second);

        let popped = store.pop_due_tasks("feed-pulls", now, 10).await.unwrap();
        assert_eq!(popped.len(), 1);
    }

    #[tokio::test]
    async fn feed_to_fetch_blind_overwrite_resets_failure_counters() {
        let store = memory_store().await;
        let now = Utc::now();
        let key = FeedToFetch::key_for("https://pub.example/feed");

        store
            .upsert_feed_to_fetch("https://pub.example/feed", &key, now)
            .await
            .unwrap();
        let mut loaded = store.get_feed_to_fetch(&key).await.unwrap().unwrap();
        loaded.fetching_failures = 3;
        loaded.totally_failed = false;
        store.update_feed_to_fetch(&loaded).await.unwrap();

        store
            .upsert_feed_to_fetch("https://pub.example/feed", &key, now)
            .await
            .unwrap();
        let reloaded = store.get_feed_to_fetch(&key).await.unwrap().unwrap();
        assert_eq!(reloaded.fetching_failures, 0);
        assert!(!reloaded.totally_failed);
    }
}
