//! Entity types backing the hub's durable store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::crypto::hash_key_name;

/// `Subscription.state`'s DAG: `NotVerified -> Verified -> ToDelete -> (deleted)`,
/// with `NotVerified -> (deleted)` on give-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    NotVerified,
    Verified,
    ToDelete,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::NotVerified => "not_verified",
            SubscriptionState::Verified => "verified",
            SubscriptionState::ToDelete => "to_delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "not_verified" => Some(Self::NotVerified),
            "verified" => Some(Self::Verified),
            "to_delete" => Some(Self::ToDelete),
            _ => None,
        }
    }
}

/// A single subscription to a topic for a callback URL. Keyed by
/// `hash(callback \n topic)`, one entity group per (callback, topic) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub key: String,
    pub callback: String,
    pub callback_hash: String,
    pub topic: String,
    pub topic_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub lease_seconds: i64,
    pub expiration_time: DateTime<Utc>,
    pub eta: DateTime<Utc>,
    pub confirm_failures: i64,
    pub verify_token: Option<String>,
    pub secret: Option<String>,
    pub state: SubscriptionState,
}

impl Subscription {
    /// Deterministic key for a (callback, topic) pair, matching the
    /// original hub's `'%s\n%s' % (callback, topic)` convention.
    pub fn key_for(callback: &str, topic: &str) -> String {
        hash_key_name(&format!("{}\n{}", callback, topic))
    }
}

/// At most one per topic; its presence means a fetch is owed by `eta` or
/// later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedToFetch {
    pub key: String,
    pub topic: String,
    pub eta: DateTime<Utc>,
    pub fetching_failures: i64,
    pub totally_failed: bool,
}

impl FeedToFetch {
    pub fn key_for(topic: &str) -> String {
        hash_key_name(topic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedContentType {
    Atom,
    Rss,
}

impl FeedContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedContentType::Atom => "atom",
            FeedContentType::Rss => "rss",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "atom" => Some(Self::Atom),
            "rss" => Some(Self::Rss),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            FeedContentType::Atom => "application/atom+xml",
            FeedContentType::Rss => "application/rss+xml",
        }
    }
}

/// Parent of a topic's entity group: the last-seen feed envelope and
/// conditional-GET caching headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRecord {
    pub key: String,
    pub topic: String,
    pub envelope_header: String,
    pub envelope_footer: String,
    pub content_type: FeedContentType,
    pub last_updated: DateTime<Utc>,
    pub last_modified_header: Option<String>,
    pub etag: Option<String>,
}

impl FeedRecord {
    pub fn key_for(topic: &str) -> String {
        hash_key_name(topic)
    }
}

/// Child of [`FeedRecord`]: one per (topic, entry id). An entry is new or
/// changed iff no record exists for it, or `content_hash` differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEntryRecord {
    pub key: String,
    pub feed_key: String,
    pub entry_id: String,
    pub entry_id_hash: String,
    pub content_hash: String,
    pub update_time: DateTime<Utc>,
}

impl FeedEntryRecord {
    pub fn key_for(feed_key: &str, entry_id: &str) -> String {
        hash_key_name(&format!("{}\n{}", feed_key, entry_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Normal,
    Retry,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Normal => "normal",
            DeliveryMode::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "retry" => Some(Self::Retry),
            _ => None,
        }
    }
}

/// Child of [`FeedRecord`]: an in-flight or pending delivery. Keyed by the
/// owning topic so at most one event is in flight per topic at a time (the
/// fetch pipeline merges new diffs into an existing undelivered event
/// instead of creating a second row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventToDeliver {
    pub key: String,
    pub topic: String,
    pub topic_hash: String,
    pub payload: String,
    pub content_type: FeedContentType,
    pub mode: DeliveryMode,
    /// Normal mode: inclusive cursor of the next subscriber chunk to fetch.
    pub last_callback: Option<String>,
    /// Retry mode: ordered queue of callback keys that have failed so far.
    pub failed_callbacks: Vec<String>,
    pub retry_attempts: i64,
    pub last_modified: DateTime<Utc>,
    pub totally_failed: bool,
}

impl EventToDeliver {
    pub fn key_for(topic: &str) -> String {
        hash_key_name(topic)
    }
}

/// Marker set: presence means "this topic has been subscribed to at least
/// once". Source of the bootstrap poller's iteration; may go briefly stale
/// after the last subscriber leaves, corrected lazily by the fetch worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnownFeed {
    pub key: String,
    pub topic: String,
}

impl KnownFeed {
    pub fn key_for(topic: &str) -> String {
        hash_key_name(topic)
    }
}

/// Singleton row driving the bootstrap cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingMarker {
    pub last_start: DateTime<Utc>,
    pub next_start: DateTime<Utc>,
}

pub const POLLING_MARKER_KEY: &str = "polling_marker";

/// A durable, at-least-once task queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub id: i64,
    pub queue: String,
    pub name: Option<String>,
    pub url: String,
    pub params: serde_json::Value,
    pub eta: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_key_is_symmetric_in_order_but_not_callback_topic() {
        let k1 = Subscription::key_for("http://a/cb", "http://b/topic");
        let k2 = Subscription::key_for("http://a/cb", "http://b/topic");
        let k3 = Subscription::key_for("http://b/topic", "http://a/cb");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn feed_content_type_roundtrips() {
        assert_eq!(
            FeedContentType::parse(FeedContentType::Atom.as_str()),
            Some(FeedContentType::Atom)
        );
        assert_eq!(
            FeedContentType::parse(FeedContentType::Rss.as_str()),
            Some(FeedContentType::Rss)
        );
    }

    #[test]
    fn subscription_state_roundtrips() {
        for state in [
            SubscriptionState::NotVerified,
            SubscriptionState::Verified,
            SubscriptionState::ToDelete,
        ] {
            assert_eq!(SubscriptionState::parse(state.as_str()), Some(state));
        }
    }
}
