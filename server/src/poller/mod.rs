//! Bootstrap poller: periodically re-enqueues a fetch for every known feed
//! so topics that never receive a publisher ping still get pulled, plus the
//! cron-triggered reaper that drops old totally-failed delivery events.

pub mod error;

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::core::constants::{
    BOOTSTRAP_FEED_CHUNK_SIZE, EVENT_CLEANUP_MAX_AGE_SECONDS, POLLING_BOOTSTRAP_PERIOD_SECS,
    POLLING_QUEUE,
};
use crate::queue::TaskQueue;
use crate::store::Store;
use crate::store::entities::{FeedToFetch, PollingMarker};
use crate::utils::crypto::sha1_hex;
use error::PollerError;

/// Params carried by a bootstrap scan task; `sequence` names the
/// generation this scan belongs to and `current_key` is the cursor into
/// the known-feed keyspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanTask {
    pub sequence: String,
    pub current_key: String,
}

pub struct BootstrapPoller {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
}

impl BootstrapPoller {
    pub fn new(store: Arc<Store>, queue: Arc<TaskQueue>) -> Self {
        Self { store, queue }
    }

    /// `GET /work/poll_bootstrap`: advances the marker and kicks off one
    /// scan generation if the previous one's period has elapsed.
    pub async fn trigger(&self) -> Result<(), PollerError> {
        let now = Utc::now();
        let marker = self
            .store
            .get_polling_marker()
            .await?
            .unwrap_or(PollingMarker { last_start: now, next_start: now });

        if marker.next_start > now {
            return Ok(());
        }

        let last_start = marker.next_start;
        let next_start = now + chrono::Duration::seconds(POLLING_BOOTSTRAP_PERIOD_SECS);
        self.store
            .put_polling_marker(&PollingMarker { last_start, next_start })
            .await?;

        let sequence = sha1_hex(&last_start.to_rfc3339());
        let task = ScanTask { sequence: sequence.clone(), current_key: String::new() };
        self.queue
            .enqueue(
                POLLING_QUEUE,
                Some(&format!("{}-start", sequence)),
                "/work/poll_bootstrap",
                &serde_json::to_value(&task).expect("ScanTask always serializes"),
            )
            .await?;
        Ok(())
    }

    /// `POST /work/poll_bootstrap`: scans one chunk of the known-feed
    /// keyspace, inserting a `FeedToFetch` for each, and chains the next
    /// chunk under a name derived from `(sequence, last_key)`.
    pub async fn scan_chunk(&self, task: &ScanTask) -> Result<(), PollerError> {
        let chunk = self
            .store
            .list_known_feed_keys_from(&task.current_key, BOOTSTRAP_FEED_CHUNK_SIZE)
            .await?;

        if chunk.is_empty() {
            return Ok(());
        }

        for known in &chunk {
            let key = FeedToFetch::key_for(&known.topic);
            self.store.upsert_feed_to_fetch(&known.topic, &key, Utc::now()).await?;
        }

        let last_key = chunk.last().expect("chunk is non-empty").key.clone();
        let next_task = ScanTask { sequence: task.sequence.clone(), current_key: last_key.clone() };
        let name = format!("{}-{}", task.sequence, sha1_hex(&last_key));
        self.queue
            .enqueue(
                POLLING_QUEUE,
                Some(&name),
                "/work/poll_bootstrap",
                &serde_json::to_value(&next_task).expect("ScanTask always serializes"),
            )
            .await?;
        Ok(())
    }
}

/// `GET /work/event_cleanup`: reaps totally-failed delivery events once
/// they are older than [`EVENT_CLEANUP_MAX_AGE_SECONDS`], triggered by an
/// external cron caller the same way `poll_bootstrap`'s GET trigger is.
pub async fn reap_expired_events(store: &Store) -> Result<(), PollerError> {
    let cutoff = Utc::now() - chrono::Duration::seconds(EVENT_CLEANUP_MAX_AGE_SECONDS);
    let keys = store.list_totally_failed_event_keys_older_than(cutoff).await?;
    for key in keys {
        store.delete_event(&key).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::entities::KnownFeed;
    use crate::store::sqlite::SqliteStore;

    async fn test_poller() -> (BootstrapPoller, Arc<Store>) {
        let store = Arc::new(Store::Sqlite(SqliteStore::open_memory().await.unwrap()));
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&store),
            "http://127.0.0.1:0".to_string(),
            "secret".to_string(),
        ));
        (BootstrapPoller::new(Arc::clone(&store), queue), store)
    }

    #[tokio::test]
    async fn trigger_twice_rapidly_enqueues_once() {
        let (poller, store) = test_poller().await;
        poller.trigger().await.unwrap();
        poller.trigger().await.unwrap();

        let tasks = store.pop_due_tasks(POLLING_QUEUE, Utc::now(), 10).await.unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn scan_chunk_inserts_feed_to_fetch_for_each_known_feed() {
        let (poller, store) = test_poller().await;
        for topic in ["http://a.example/feed", "http://b.example/feed"] {
            store.put_known_feed(&KnownFeed::key_for(topic), topic).await.unwrap();
        }

        poller
            .scan_chunk(&ScanTask { sequence: "gen1".to_string(), current_key: String::new() })
            .await
            .unwrap();

        for topic in ["http://a.example/feed", "http://b.example/feed"] {
            let key = FeedToFetch::key_for(topic);
            assert!(store.get_feed_to_fetch(&key).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn scan_chunk_of_empty_keyspace_enqueues_nothing() {
        let (poller, store) = test_poller().await;
        poller
            .scan_chunk(&ScanTask { sequence: "gen1".to_string(), current_key: String::new() })
            .await
            .unwrap();

        let tasks = store.pop_due_tasks(POLLING_QUEUE, Utc::now(), 10).await.unwrap();
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn reap_expired_events_deletes_only_old_totally_failed_ones() {
        use crate::store::entities::{DeliveryMode, EventToDeliver};

        let store = Arc::new(Store::Sqlite(SqliteStore::open_memory().await.unwrap()));
        let old_event = EventToDeliver {
            key: EventToDeliver::key_for("http://old.example/feed"),
            topic: "http://old.example/feed".to_string(),
            topic_hash: sha1_hex("http://old.example/feed"),
            payload: String::new(),
            content_type: crate::store::entities::FeedContentType::Atom,
            mode: DeliveryMode::Retry,
            last_callback: None,
            failed_callbacks: Vec::new(),
            retry_attempts: 10,
            last_modified: Utc::now() - chrono::Duration::days(60),
            totally_failed: true,
        };
        let fresh_event = EventToDeliver {
            key: EventToDeliver::key_for("http://fresh.example/feed"),
            topic: "http://fresh.example/feed".to_string(),
            last_modified: Utc::now(),
            ..old_event.clone()
        };
        store.put_event(&old_event).await.unwrap();
        store.put_event(&fresh_event).await.unwrap();

        reap_expired_events(&store).await.unwrap();

        assert!(store.get_event(&old_event.key).await.unwrap().is_none());
        assert!(store.get_event(&fresh_event.key).await.unwrap().is_some());
    }
}
