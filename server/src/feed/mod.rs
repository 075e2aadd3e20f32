//! Feed fetch/diff pipeline: takes a topic from `FeedToFetch`, conditionally
//! re-fetches it, diffs the parsed entries against the last-seen
//! [`FeedEntryRecord`]s, and atomically commits the new envelope plus a
//! delivery event.

pub mod differ;
pub mod error;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::header::{CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};

use crate::core::constants::{
    FEED_PULL_RETRY_PERIOD_SECS, FEED_QUEUE, MAX_COMMIT_BYTES, MAX_FEED_ENTRY_RECORD_LOOKUPS,
    MAX_FEED_PULL_FAILURES, MAX_NEW_FEED_ENTRY_RECORDS, MAX_REDIRECTS, OUTBOUND_HTTP_TIMEOUT,
    PUT_SPLITTING_ATTEMPTS, backoff_seconds,
};
use crate::queue::TaskQueue;
use crate::store::Store;
use crate::store::entities::{
    DeliveryMode, EventToDeliver, FeedContentType, FeedEntryRecord, FeedRecord, FeedToFetch,
    KnownFeed,
};
use crate::utils::crypto::sha1_hex;
use differ::{FeedDiffer, ParsedEntry, ParsedFeed};
use error::FeedError;

pub struct FeedPipeline {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    differ: Arc<dyn FeedDiffer>,
    fetch_client: reqwest::Client,
}

impl FeedPipeline {
    pub fn new(store: Arc<Store>, queue: Arc<TaskQueue>, differ: Arc<dyn FeedDiffer>) -> Self {
        let fetch_client = reqwest::Client::builder()
            .timeout(OUTBOUND_HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS as usize))
            .build()
            .expect("failed to build reqwest client");
        Self {
            store,
            queue,
            differ,
            fetch_client,
        }
    }

    /// `Publish(topicURLs)`: inserts a `FeedToFetch` and enqueues a fetch
    /// task for every distinct topic already present in the known-feed set.
    /// Topics outside that set, or that fail to parse as a URL, are
    /// silently dropped.
    pub async fn publish(&self, topic_urls: &[String]) -> Result<(), FeedError> {
        let mut seen = std::collections::HashSet::new();
        for raw in topic_urls {
            let Ok(url) = url::Url::parse(raw) else {
                continue;
            };
            let topic = crate::utils::url::normalize_iri(&url);
            if !seen.insert(topic.clone()) {
                continue;
            }

            let known_key = KnownFeed::key_for(&topic);
            if self.store.get_known_feed(&known_key).await?.is_none() {
                continue;
            }

            let fetch_key = FeedToFetch::key_for(&topic);
            let eta = Utc::now();
            self.store.upsert_feed_to_fetch(&topic, &fetch_key, eta).await?;
            self.queue
                .enqueue(FEED_QUEUE, Some(&fetch_key), "/work/pull_feeds", &serde_json::json!({
                    "topic": topic,
                }))
                .await?;
        }
        Ok(())
    }

    /// Per-topic fetch worker: spec §4.D steps 1-10.
    pub async fn fetch_worker(&self, topic: &str) -> Result<(), FeedError> {
        let fetch_key = FeedToFetch::key_for(topic);
        let Some(to_fetch) = self.store.get_feed_to_fetch(&fetch_key).await? else {
            return Ok(());
        };

        let topic_hash = sha1_hex(topic);
        if self.store.count_verified_subscribers(&topic_hash).await? == 0 {
            if self.store.delete_feed_to_fetch_if_eta(&fetch_key, to_fetch.eta).await? {
                self.store.delete_known_feed(&KnownFeed::key_for(topic)).await?;
            }
            return Ok(());
        }

        let feed_key = FeedRecord::key_for(topic);
        let existing_record = self.store.get_feed_record(&feed_key).await?;

        let mut request = self
            .fetch_client
            .get(topic)
            .header(CACHE_CONTROL, "no-cache, no-store, max-age=1");
        if let Some(record) = &existing_record {
            if let Some(lm) = &record.last_modified_header {
                request = request.header(IF_MODIFIED_SINCE, lm.clone());
            }
            if let Some(etag) = &record.etag {
                request = request.header(IF_NONE_MATCH, etag.clone());
            }
        }

        let response = match request.send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.fetch_failed(to_fetch).await?;
                return Err(FeedError::FetchUnreachable(e.to_string()));
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            self.mark_done(&fetch_key, to_fetch.eta).await?;
            return Ok(());
        }
        if status != reqwest::StatusCode::OK {
            self.fetch_failed(to_fetch).await?;
            return Err(FeedError::UnexpectedStatus(status.as_u16()));
        }

        let last_modified_header = response
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                self.fetch_failed(to_fetch).await?;
                return Err(FeedError::FetchUnreachable(e.to_string()));
            }
        };

        let preferred = existing_record
            .as_ref()
            .map(|r| r.content_type)
            .unwrap_or(FeedContentType::Atom);
        let fallback = match preferred {
            FeedContentType::Atom => FeedContentType::Rss,
            FeedContentType::Rss => FeedContentType::Atom,
        };

        let (content_type, parsed) = match self.differ.parse(preferred, &body) {
            Ok(parsed) => (preferred, parsed),
            Err(_) => match self.differ.parse(fallback, &body) {
                Ok(parsed) => (fallback, parsed),
                Err(e) => {
                    self.fetch_failed(to_fetch).await?;
                    return Err(e);
                }
            },
        };

        let changed = match self.diff_entries(&feed_key, &parsed).await {
            Ok(changed) => changed,
            Err(e) => {
                self.fetch_failed(to_fetch).await?;
                return Err(e);
            }
        };

        let feed_record = FeedRecord {
            key: feed_key.clone(),
            topic: topic.to_string(),
            envelope_header: parsed.envelope_header.clone(),
            envelope_footer: parsed.envelope_footer.clone(),
            content_type,
            last_updated: Utc::now(),
            last_modified_header,
            etag,
        };

        if changed.is_empty() {
            match self.store.commit_fetch(&feed_record, &[], None).await {
                Ok(()) => {}
                Err(e) => {
                    self.fetch_failed(to_fetch).await?;
                    return Err(e.into());
                }
            }
            self.mark_done(&fetch_key, to_fetch.eta).await?;
            return Ok(());
        }

        let event = match self.build_event(topic, &topic_hash, content_type, &parsed, &changed) {
            Some(event) => event,
            None => {
                self.fetch_failed(to_fetch).await?;
                return Err(FeedError::ParseFailed(
                    "closing tag missing from assembled payload".to_string(),
                ));
            }
        };

        if let Err(e) = self.commit_with_splitting(&feed_record, &changed, &event).await {
            self.fetch_failed(to_fetch).await?;
            return Err(e);
        }

        self.queue
            .enqueue(
                crate::core::constants::EVENT_QUEUE,
                Some(&event.key),
                "/work/push_events",
                &serde_json::json!({"event_key": event.key}),
            )
            .await?;
        self.mark_done(&fetch_key, to_fetch.eta).await?;
        Ok(())
    }

    async fn diff_entries(
        &self,
        feed_key: &str,
        parsed: &ParsedFeed,
    ) -> Result<Vec<(ParsedEntry, FeedEntryRecord)>, FeedError> {
        let mut changed = Vec::new();
        for chunk in parsed.entries.chunks(MAX_FEED_ENTRY_RECORD_LOOKUPS) {
            let hashes: Vec<String> = chunk.iter().map(|e| sha1_hex(&e.id)).collect();
            let existing = self.store.get_feed_entry_records(feed_key, &hashes).await?;
            for (entry, hash) in chunk.iter().zip(hashes.into_iter()) {
                let prior = existing.iter().find(|r| r.entry_id_hash == hash);
                let is_changed = match prior {
                    None => true,
                    Some(r) => r.content_hash != entry.content_hash,
                };
                if is_changed {
                    let record = FeedEntryRecord {
                        key: FeedEntryRecord::key_for(feed_key, &entry.id),
                        feed_key: feed_key.to_string(),
                        entry_id: entry.id.clone(),
                        entry_id_hash: hash,
                        content_hash: entry.content_hash.clone(),
                        update_time: Utc::now(),
                    };
                    changed.push((entry.clone(), record));
                }
            }
        }
        changed.truncate(MAX_NEW_FEED_ENTRY_RECORDS);
        Ok(changed)
    }

    fn build_event(
        &self,
        topic: &str,
        topic_hash: &str,
        content_type: FeedContentType,
        parsed: &ParsedFeed,
        changed: &[(ParsedEntry, FeedEntryRecord)],
    ) -> Option<EventToDeliver> {
        if !parsed.envelope_footer.starts_with("</") {
            return None;
        }
        let mut payload = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>");
        payload.push_str(&parsed.envelope_header);
        for (entry, _) in changed {
            payload.push_str(&entry.xml);
        }
        payload.push_str(&parsed.envelope_footer);

        Some(EventToDeliver {
            key: EventToDeliver::key_for(topic),
            topic: topic.to_string(),
            topic_hash: topic_hash.to_string(),
            payload,
            content_type,
            mode: DeliveryMode::Normal,
            last_callback: None,
            failed_callbacks: Vec::new(),
            retry_attempts: 0,
            last_modified: Utc::now(),
            totally_failed: false,
        })
    }

    /// Commits the fetch, halving the entry batch on an oversized write up
    /// to `PUT_SPLITTING_ATTEMPTS` times before giving up.
    async fn commit_with_splitting(
        &self,
        feed_record: &FeedRecord,
        changed: &[(ParsedEntry, FeedEntryRecord)],
        event: &EventToDeliver,
    ) -> Result<(), FeedError> {
        let mut records: Vec<FeedEntryRecord> = changed.iter().map(|(_, r)| r.clone()).collect();
        for attempt in 0..=PUT_SPLITTING_ATTEMPTS {
            let size = estimate_commit_bytes(feed_record, &records, event);
            if size <= MAX_COMMIT_BYTES {
                self.store.commit_fetch(feed_record, &records, Some(event)).await?;
                return Ok(());
            }
            if attempt == PUT_SPLITTING_ATTEMPTS || records.len() <= 1 {
                return Err(FeedError::CommitTooLarge { attempts: attempt });
            }
            let half = records.len() / 2;
            records.truncate(half.max(1));
        }
        Err(FeedError::CommitTooLarge {
            attempts: PUT_SPLITTING_ATTEMPTS,
        })
    }

    async fn mark_done(&self, fetch_key: &str, held_eta: DateTime<Utc>) -> Result<(), FeedError> {
        self.store.delete_feed_to_fetch_if_eta(fetch_key, held_eta).await?;
        Ok(())
    }

    async fn fetch_failed(&self, mut to_fetch: FeedToFetch) -> Result<(), FeedError> {
        if to_fetch.fetching_failures as u32 >= MAX_FEED_PULL_FAILURES {
            to_fetch.totally_failed = true;
            self.store.update_feed_to_fetch(&to_fetch).await?;
            return Ok(());
        }

        to_fetch.fetching_failures += 1;
        let delay = backoff_seconds(FEED_PULL_RETRY_PERIOD_SECS, to_fetch.fetching_failures as u32);
        to_fetch.eta = Utc::now() + chrono::Duration::seconds(delay);
        self.store.update_feed_to_fetch(&to_fetch).await?;
        self.queue
            .enqueue_at(
                FEED_QUEUE,
                None,
                "/work/pull_feeds",
                &serde_json::json!({"topic": to_fetch.topic}),
                to_fetch.eta,
            )
            .await?;
        Ok(())
    }
}

/// Rough serialized-size estimate used to trigger the split-and-retry loop;
/// mirrors the datastore entity-group write-size limit the original hub
/// guarded against.
fn estimate_commit_bytes(
    feed_record: &FeedRecord,
    entries: &[FeedEntryRecord],
    event: &EventToDeliver,
) -> usize {
    let mut size = feed_record.envelope_header.len() + feed_record.envelope_footer.len();
    size += entries.iter().map(|e| e.entry_id.len() + e.content_hash.len()).sum::<usize>();
    size += event.payload.len();
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    async fn test_pipeline() -> (FeedPipeline, Arc<Store>) {
        let store = Arc::new(Store::Sqlite(SqliteStore::open_memory().await.unwrap()));
        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&store),
            "http://127.0.0.1:0".to_string(),
            "secret".to_string(),
        ));
        let differ: Arc<dyn FeedDiffer> = Arc::new(differ::QuickXmlDiffer);
        (FeedPipeline::new(Arc::clone(&store), queue, differ), store)
    }

    #[tokio::test]
    async fn publish_drops_unknown_topics() {
        let (pipeline, store) = test_pipeline().await;
        pipeline
            .publish(&["http://pub.example/unknown".to_string()])
            .await
            .unwrap();
        let key = FeedToFetch::key_for("http://pub.example/unknown");
        assert!(store.get_feed_to_fetch(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_inserts_fetch_for_known_topic() {
        let (pipeline, store) = test_pipeline().await;
        let topic = "http://pub.example/feed";
        store
            .put_known_feed(&KnownFeed::key_for(topic), topic)
            .await
            .unwrap();

        pipeline.publish(&[topic.to_string()]).await.unwrap();

        let key = FeedToFetch::key_for(topic);
        assert!(store.get_feed_to_fetch(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn fetch_worker_with_no_feed_to_fetch_is_a_noop() {
        let (pipeline, _store) = test_pipeline().await;
        pipeline.fetch_worker("http://pub.example/feed").await.unwrap();
    }

    #[tokio::test]
    async fn fetch_worker_gcs_when_no_subscribers_remain() {
        let (pipeline, store) = test_pipeline().await;
        let topic = "http://pub.example/feed";
        let known_key = KnownFeed::key_for(topic);
        store.put_known_feed(&known_key, topic).await.unwrap();
        let fetch_key = FeedToFetch::key_for(topic);
        store
            .upsert_feed_to_fetch(topic, &fetch_key, Utc::now())
            .await
            .unwrap();

        pipeline.fetch_worker(topic).await.unwrap();

        assert!(store.get_feed_to_fetch(&fetch_key).await.unwrap().is_none());
        assert!(store.get_known_feed(&known_key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn built_rss_event_payload_has_one_prolog_and_keeps_entries_inside_channel() {
        let (pipeline, _store) = test_pipeline().await;
        let raw = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <title>Example</title>
  <item><guid>g1</guid><title>First</title></item>
</channel></rss>"#;
        let parsed = pipeline.differ.parse(FeedContentType::Rss, raw).unwrap();
        let changed: Vec<(ParsedEntry, FeedEntryRecord)> = parsed
            .entries
            .iter()
            .cloned()
            .map(|e| {
                let record = FeedEntryRecord {
                    key: FeedEntryRecord::key_for("feed-key", &e.id),
                    feed_key: "feed-key".to_string(),
                    entry_id: e.id.clone(),
                    entry_id_hash: sha1_hex(&e.id),
                    content_hash: e.content_hash.clone(),
                    update_time: Utc::now(),
                };
                (e, record)
            })
            .collect();

        let event = pipeline
            .build_event("http://pub.example/feed", "hash", FeedContentType::Rss, &parsed, &changed)
            .unwrap();

        assert_eq!(event.payload.matches("<?xml").count(), 1);
        assert!(event.payload.contains("<item><guid>g1</guid>"));
        let item_pos = event.payload.find("<item>").unwrap();
        let channel_close_pos = event.payload.find("</channel>").unwrap();
        let rss_close_pos = event.payload.rfind("</rss>").unwrap();
        assert!(item_pos < channel_close_pos);
        assert!(channel_close_pos < rss_close_pos);
    }

    #[tokio::test]
    async fn built_atom_event_payload_has_exactly_one_prolog() {
        let (pipeline, _store) = test_pipeline().await;
        let raw = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example</title>
  <entry><id>e1</id><title>First</title></entry>
</feed>"#;
        let parsed = pipeline.differ.parse(FeedContentType::Atom, raw).unwrap();
        let changed: Vec<(ParsedEntry, FeedEntryRecord)> = parsed
            .entries
            .iter()
            .cloned()
            .map(|e| {
                let record = FeedEntryRecord {
                    key: FeedEntryRecord::key_for("feed-key", &e.id),
                    feed_key: "feed-key".to_string(),
                    entry_id: e.id.clone(),
                    entry_id_hash: sha1_hex(&e.id),
                    content_hash: e.content_hash.clone(),
                    update_time: Utc::now(),
                };
                (e, record)
            })
            .collect();

        let event = pipeline
            .build_event("http://pub.example/feed", "hash", FeedContentType::Atom, &parsed, &changed)
            .unwrap();

        assert_eq!(event.payload.matches("<?xml").count(), 1);
        assert!(event.payload.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
    }
}
