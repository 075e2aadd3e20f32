//! Subscription lifecycle: async verification with a callback challenge,
//! exponential retry, and give-up after too many failures (spec §4.C).

pub mod error;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::core::constants::{
    CHALLENGE_TOKEN_LEN, MAX_SUBSCRIPTION_CONFIRM_FAILURES, OUTBOUND_HTTP_TIMEOUT,
    SUBSCRIPTION_QUEUE, SUBSCRIPTION_RETRY_PERIOD_SECS, backoff_seconds,
};
use crate::queue::TaskQueue;
use crate::store::Store;
use crate::store::entities::{Subscription, SubscriptionState};
use crate::utils::crypto::{constant_time_eq, generate_challenge_token};
use crate::utils::url::{normalize_iri, validate_url};
use error::SubscriptionError;

/// `hub.verify` request parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    Sync,
    Async,
}

/// Internal direction of a verification challenge; mirrors `hub.mode` on
/// the outbound GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChallengeDirection {
    Subscribe,
    Unsubscribe,
}

impl ChallengeDirection {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

/// Outcome of a subscribe/unsubscribe call, distinguishing the three
/// response shapes the `/subscribe` handler needs to pick a status code:
/// 204 when a challenge round-trip already happened synchronously, 202
/// when verification work was queued for later, and 204 again when there
/// was genuinely nothing to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// 204: challenge round-trip succeeded.
    Verified,
    /// 202: async verification was queued.
    Accepted,
    /// 204: nothing to do (unknown subscription on unsubscribe).
    NoOp,
}

/// Request shape accepted from the `/subscribe` HTTP handler, already
/// decoded from the form body.
pub struct SubscribeRequest {
    pub callback: String,
    pub topic: String,
    pub verify_token: Option<String>,
    pub secret: Option<String>,
    pub lease_seconds: Option<i64>,
    pub mode: VerifyMode,
}

pub struct SubscriptionManager {
    store: Arc<Store>,
    queue: Arc<TaskQueue>,
    challenge_client: reqwest::Client,
    default_lease_seconds: i64,
    max_lease_seconds: i64,
    dev_mode: bool,
}

impl SubscriptionManager {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<TaskQueue>,
        default_lease_seconds: i64,
        max_lease_seconds: i64,
        dev_mode: bool,
    ) -> Self {
        let challenge_client = reqwest::Client::builder()
            .timeout(OUTBOUND_HTTP_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("failed to build reqwest client");
        Self {
            store,
            queue,
            challenge_client,
            default_lease_seconds,
            max_lease_seconds,
            dev_mode,
        }
    }

    /// `hub.lease_seconds` resolution: absent or non-positive uses the
    /// default, clamped to the configured maximum (spec §6, SPEC_FULL.B).
    fn resolve_lease(&self, requested: Option<i64>) -> i64 {
        let lease = match requested {
            Some(n) if n > 0 => n,
            _ => self.default_lease_seconds,
        };
        lease.min(self.max_lease_seconds)
    }

    fn validate_pair(&self, callback: &str, topic: &str) -> Result<(String, String), SubscriptionError> {
        let callback_url = validate_url(callback, self.dev_mode)
            .map_err(|source| SubscriptionError::InvalidUrl { field: "hub.callback", source })?;
        let topic_url = validate_url(topic, self.dev_mode)
            .map_err(|source| SubscriptionError::InvalidUrl { field: "hub.topic", source })?;
        Ok((normalize_iri(&callback_url), normalize_iri(&topic_url)))
    }

    pub async fn subscribe(&self, req: SubscribeRequest) -> Result<SyncOutcome, SubscriptionError> {
        let (callback, topic) = self.validate_pair(&req.callback, &req.topic)?;
        let lease_seconds = self.resolve_lease(req.lease_seconds);
        let key = Subscription::key_for(&callback, &topic);

        match req.mode {
            VerifyMode::Sync => {
                let now = Utc::now();
                let challenge = generate_challenge_token();
                self.issue_challenge(
                    &callback,
                    &topic,
                    ChallengeDirection::Subscribe,
                    &challenge,
                    lease_seconds,
                    req.verify_token.as_deref(),
                )
                .await?;

                let sub = Subscription {
                    key: key.clone(),
                    callback: callback.clone(),
                    callback_hash: crate::utils::crypto::sha1_hex(&callback),
                    topic: topic.clone(),
                    topic_hash: crate::utils::crypto::sha1_hex(&topic),
                    created_at: now,
                    last_modified: now,
                    lease_seconds,
                    expiration_time: now + chrono::Duration::seconds(lease_seconds),
                    eta: now,
                    confirm_failures: 0,
                    verify_token: req.verify_token,
                    secret: req.secret,
                    state: SubscriptionState::Verified,
                };
                self.store.put_subscription(&sub).await?;
                let known_feed_key = crate::store::entities::KnownFeed::key_for(&topic);
                self.store.put_known_feed(&known_feed_key, &topic).await?;
                Ok(SyncOutcome::Verified)
            }
            VerifyMode::Async => {
                if self.store.get_subscription(&key).await?.is_none() {
                    let now = Utc::now();
                    let sub = Subscription {
                        key: key.clone(),
                        callback: callback.clone(),
                        callback_hash: crate::utils::crypto::sha1_hex(&callback),
                        topic: topic.clone(),
                        topic_hash: crate::utils::crypto::sha1_hex(&topic),
                        created_at: now,
                        last_modified: now,
                        lease_seconds,
                        expiration_time: now + chrono::Duration::seconds(lease_seconds),
                        eta: now,
                        confirm_failures: 0,
                        verify_token: req.verify_token,
                        secret: req.secret,
                        state: SubscriptionState::NotVerified,
                    };
                    self.store.put_subscription(&sub).await?;
                }
                self.enqueue_confirm_task(&key, Utc::now()).await?;
                Ok(SyncOutcome::Accepted)
            }
        }
    }

    pub async fn unsubscribe(
        &self,
        callback: &str,
        topic: &str,
        verify_token: Option<String>,
        mode: VerifyMode,
    ) -> Result<SyncOutcome, SubscriptionError> {
        let (callback, topic) = self.validate_pair(callback, topic)?;
        let key = Subscription::key_for(&callback, &topic);
        let Some(mut sub) = self.store.get_subscription(&key).await? else {
            return Ok(SyncOutcome::NoOp);
        };

        match mode {
            VerifyMode::Sync => {
                let challenge = generate_challenge_token();
                self.issue_challenge(
                    &callback,
                    &topic,
                    ChallengeDirection::Unsubscribe,
                    &challenge,
                    sub.lease_seconds,
                    verify_token.as_deref(),
                )
                .await?;
                self.store.delete_subscription(&key).await?;
                Ok(SyncOutcome::Verified)
            }
            VerifyMode::Async => {
                sub.state = SubscriptionState::ToDelete;
                sub.last_modified = Utc::now();
                if verify_token.is_some() {
                    sub.verify_token = verify_token;
                }
                self.store.put_subscription(&sub).await?;
                self.enqueue_confirm_task(&key, Utc::now()).await?;
                Ok(SyncOutcome::Accepted)
            }
        }
    }

    async fn enqueue_confirm_task(&self, key: &str, eta: DateTime<Utc>) -> Result<(), SubscriptionError> {
        self.queue
            .enqueue_at(
                SUBSCRIPTION_QUEUE,
                Some(key),
                "/work/subscriptions",
                &json!({ "subscription_key": key }),
                eta,
            )
            .await?;
        Ok(())
    }

    /// Worker entry point for `/work/subscriptions`: drives one pending
    /// verification round for the subscription at `key`.
    pub async fn confirm_work(&self, key: &str) -> Result<(), SubscriptionError> {
        let Some(sub) = self.store.get_subscription(key).await? else {
            tracing::debug!(key, "confirm_work: subscription already gone, no-op");
            return Ok(());
        };

        let direction = match sub.state {
            SubscriptionState::Verified => {
                tracing::debug!(key, "confirm_work: already verified, no-op (replay)");
                return Ok(());
            }
            SubscriptionState::NotVerified => ChallengeDirection::Subscribe,
            SubscriptionState::ToDelete => ChallengeDirection::Unsubscribe,
        };

        let challenge = generate_challenge_token();
        let result = self
            .issue_challenge(
                &sub.callback,
                &sub.topic,
                direction,
                &challenge,
                sub.lease_seconds,
                sub.verify_token.as_deref(),
            )
            .await;

        match result {
            Ok(()) => self.confirm_succeeded(sub, direction).await,
            Err(_) => self.confirm_failed(sub).await,
        }
    }

    async fn confirm_succeeded(
        &self,
        mut sub: Subscription,
        direction: ChallengeDirection,
    ) -> Result<(), SubscriptionError> {
        match direction {
            ChallengeDirection::Subscribe => {
                let now = Utc::now();
                sub.state = SubscriptionState::Verified;
                sub.last_modified = now;
                sub.expiration_time = now + chrono::Duration::seconds(sub.lease_seconds);
                sub.confirm_failures = 0;
                self.store.put_subscription(&sub).await?;
                let known_feed_key = crate::store::entities::KnownFeed::key_for(&sub.topic);
                self.store.put_known_feed(&known_feed_key, &sub.topic).await?;
            }
            ChallengeDirection::Unsubscribe => {
                self.store.delete_subscription(&sub.key).await?;
            }
        }
        Ok(())
    }

    /// Exponential-backoff retry, or give-up past
    /// [`MAX_SUBSCRIPTION_CONFIRM_FAILURES`] (spec §4.C, §8).
    async fn confirm_failed(&self, mut sub: Subscription) -> Result<(), SubscriptionError> {
        if sub.confirm_failures as u32 >= MAX_SUBSCRIPTION_CONFIRM_FAILURES {
            tracing::warn!(key = %sub.key, "subscription confirm failures exhausted, abandoning");
            self.store.delete_subscription(&sub.key).await?;
            return Ok(());
        }

        sub.confirm_failures += 1;
        let delay = backoff_seconds(SUBSCRIPTION_RETRY_PERIOD_SECS, sub.confirm_failures as u32);
        let now = Utc::now();
        sub.eta = now + chrono::Duration::seconds(delay);
        sub.last_modified = now;
        self.store.put_subscription(&sub).await?;
        self.enqueue_confirm_task(&sub.key, sub.eta).await?;
        Ok(())
    }

    /// Build and issue the challenge GET, requiring a 2xx status and a
    /// body that echoes the challenge byte-for-byte (spec §4.C). Redirects
    /// are not followed.
    async fn issue_challenge(
        &self,
        callback: &str,
        topic: &str,
        direction: ChallengeDirection,
        challenge: &str,
        lease_seconds: i64,
        verify_token: Option<&str>,
    ) -> Result<(), SubscriptionError> {
        debug_assert_eq!(challenge.len(), CHALLENGE_TOKEN_LEN);

        let mut url = reqwest::Url::parse(callback)
            .map_err(|e| SubscriptionError::VerifierUnreachable(e.to_string()))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("hub.mode", direction.as_str());
            pairs.append_pair("hub.topic", topic);
            pairs.append_pair("hub.challenge", challenge);
            pairs.append_pair("hub.lease_seconds", &lease_seconds.to_string());
            if let Some(token) = verify_token {
                pairs.append_pair("hub.verify_token", token);
            }
        }

        let response = self
            .challenge_client
            .get(url)
            .send()
            .await
            .map_err(|e| SubscriptionError::VerifierUnreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SubscriptionError::VerifierRejected(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SubscriptionError::VerifierUnreachable(e.to_string()))?;

        if !constant_time_eq(body.trim_end_matches(['\n', '\r']), challenge) {
            return Err(SubscriptionError::ChallengeMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    async fn test_manager() -> (SubscriptionManager, Arc<Store>) {
        let store = Arc::new(Store::Sqlite(SqliteStore::open_memory().await.unwrap()));
        let queue = Arc::new(TaskQueue::new(
            store.clone(),
            "http://127.0.0.1:0".to_string(),
            "secret".to_string(),
        ));
        let manager = SubscriptionManager::new(store.clone(), queue, 2_592_000, 7_776_000, false);
        (manager, store)
    }

    #[tokio::test]
    async fn async_subscribe_creates_not_verified_row_and_enqueues_once() {
        let (manager, store) = test_manager().await;
        let req = SubscribeRequest {
            callback: "http://sub.example/cb".to_string(),
            topic: "http://pub.example/feed".to_string(),
            verify_token: Some("tok".to_string()),
            secret: None,
            lease_seconds: None,
            mode: VerifyMode::Async,
        };
        let outcome = manager.subscribe(req).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Accepted);

        let key = Subscription::key_for("http://sub.example/cb", "http://pub.example/feed");
        let sub = store.get_subscription(&key).await.unwrap().unwrap();
        assert_eq!(sub.state, SubscriptionState::NotVerified);
        assert_eq!(sub.lease_seconds, 2_592_000);
    }

    #[tokio::test]
    async fn unsubscribe_of_unknown_subscription_is_a_noop() {
        let (manager, _store) = test_manager().await;
        let outcome = manager
            .unsubscribe(
                "http://sub.example/cb",
                "http://pub.example/feed",
                None,
                VerifyMode::Async,
            )
            .await
            .unwrap();
        assert_eq!(outcome, SyncOutcome::NoOp);
    }

    #[tokio::test]
    async fn confirm_work_on_missing_subscription_is_a_noop() {
        let (manager, _store) = test_manager().await;
        manager.confirm_work("hash_does_not_exist").await.unwrap();
    }

    #[tokio::test]
    async fn lease_seconds_defaults_and_clamps() {
        let (manager, _store) = test_manager().await;
        assert_eq!(manager.resolve_lease(None), 2_592_000);
        assert_eq!(manager.resolve_lease(Some(0)), 2_592_000);
        assert_eq!(manager.resolve_lease(Some(-5)), 2_592_000);
        assert_eq!(manager.resolve_lease(Some(999_999_999)), 7_776_000);
    }

    #[test]
    fn confirm_failures_give_up_after_max() {
        assert!(MAX_SUBSCRIPTION_CONFIRM_FAILURES > 0);
    }
}
