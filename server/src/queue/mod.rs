//! Durable, at-least-once task queue built on top of [`crate::store::Store`].
//!
//! Tasks are rows with a queue name, an optional dedup name, a target URL,
//! and a JSON params blob. A [`Dispatcher`] polls each logical queue on an
//! interval and delivers due tasks to the hub's own HTTP worker endpoints,
//! mirroring how the original hub's task queue invokes app handlers.

pub mod error;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::constants::{
    ENQUEUE_MAX_ATTEMPTS, ENQUEUE_RETRY_BASE_DELAY_MS, OUTBOUND_HTTP_TIMEOUT, QUEUE_OVERRIDE_ENV,
};
use crate::store::Store;
use crate::utils::retry::retry_with_backoff_async;
use error::QueueError;

/// Header carrying the internal task-queue secret expected by `/work/*`
/// handlers (see `core::constants`'s work-endpoint auth policy).
pub const TASK_QUEUE_HEADER: &str = "X-Hub-Task-Queue";

const DISPATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DISPATCH_BATCH_SIZE: i64 = 25;

pub struct TaskQueue {
    store: Arc<Store>,
    http: reqwest::Client,
    base_url: String,
    task_queue_secret: String,
}

impl TaskQueue {
    pub fn new(store: Arc<Store>, base_url: String, task_queue_secret: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(OUTBOUND_HTTP_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");
        Self {
            store,
            http,
            base_url,
            task_queue_secret,
        }
    }

    /// The queue name this call should actually land on: the caller's
    /// request, unless [`QUEUE_OVERRIDE_ENV`] names a different queue for
    /// this process (a worker chaining follow-up work onto its own queue).
    fn resolve_queue(requested: &str) -> String {
        std::env::var(QUEUE_OVERRIDE_ENV).unwrap_or_else(|_| requested.to_string())
    }

    /// Enqueues a task, retrying a small bounded number of times on
    /// transient store errors before surfacing the failure.
    pub async fn enqueue(
        &self,
        queue: &str,
        name: Option<&str>,
        url: &str,
        params: &Value,
    ) -> Result<bool, QueueError> {
        self.enqueue_at(queue, name, url, params, Utc::now()).await
    }

    pub async fn enqueue_at(
        &self,
        queue: &str,
        name: Option<&str>,
        url: &str,
        params: &Value,
        eta: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let queue = Self::resolve_queue(queue);
        let mut inserted = false;
        let result = retry_with_backoff_async(
            ENQUEUE_MAX_ATTEMPTS,
            ENQUEUE_RETRY_BASE_DELAY_MS,
            || async {
                let now = Utc::now();
                match self.store.enqueue_task(&queue, name, url, params, eta, now).await {
                    Ok(did_insert) => {
                        inserted = did_insert;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            },
        )
        .await;

        match result {
            Ok(_) => Ok(inserted),
            Err((source, attempts)) => Err(QueueError::EnqueueExhausted { attempts, source }),
        }
    }

    /// Spawns the polling dispatcher for one logical queue. Returns the
    /// handle so callers can register it with [`crate::core::shutdown::ShutdownService`].
    pub fn start_dispatcher(
        self: &Arc<Self>,
        queue: &'static str,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let queue_runner = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DISPATCH_POLL_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::debug!(queue, "dispatcher shutting down");
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        queue_runner.dispatch_due(queue).await;
                    }
                }
            }
        })
    }

    async fn dispatch_due(&self, queue: &str) {
        let now = Utc::now();
        let tasks = match self.store.pop_due_tasks(queue, now, DISPATCH_BATCH_SIZE).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!(queue, error = %e, "failed to pop due tasks");
                return;
            }
        };

        if tasks.is_empty() {
            return;
        }

        tracing::debug!(queue, count = tasks.len(), "dispatching due tasks");
        let dispatches = tasks.into_iter().map(|task| {
            let http = self.http.clone();
            let url = format!("{}{}", self.base_url, task.url);
            let secret = self.task_queue_secret.clone();
            let params = task.params.clone();
            async move {
                let result = http
                    .post(&url)
                    .header(TASK_QUEUE_HEADER, secret)
                    .json(&params)
                    .send()
                    .await;
                match result {
                    Ok(resp) if resp.status().is_success() => {
                        tracing::debug!(url = %task.url, "task dispatched");
                    }
                    Ok(resp) => {
                        tracing::warn!(url = %task.url, status = %resp.status(), "task dispatch returned non-2xx");
                    }
                    Err(e) => {
                        tracing::warn!(url = %task.url, error = %e, "task dispatch failed");
                    }
                }
            }
        });
        futures::future::join_all(dispatches).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::SqliteStore;

    async fn test_queue() -> TaskQueue {
        let store = Arc::new(Store::Sqlite(SqliteStore::open_memory().await.unwrap()));
        TaskQueue::new(store, "http://127.0.0.1:0".to_string(), "secret".to_string())
    }

    #[tokio::test]
    async fn enqueue_without_name_always_inserts() {
        let queue = test_queue().await;
        let params = serde_json::json!({});
        assert!(queue.enqueue("feed-pulls", None, "/work/pull_feeds", &params).await.unwrap());
        assert!(queue.enqueue("feed-pulls", None, "/work/pull_feeds", &params).await.unwrap());
    }

    #[tokio::test]
    async fn enqueue_with_name_dedupes() {
        let queue = test_queue().await;
        let params = serde_json::json!({});
        assert!(
            queue
                .enqueue("polling", Some("gen-1"), "/work/poll_bootstrap", &params)
                .await
                .unwrap()
        );
        assert!(
            !queue
                .enqueue("polling", Some("gen-1"), "/work/poll_bootstrap", &params)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn resolve_queue_honors_override_env() {
        // SAFETY: test is single-threaded with respect to this env var and
        // restores it before returning.
        unsafe {
            std::env::set_var(QUEUE_OVERRIDE_ENV, "polling");
        }
        assert_eq!(TaskQueue::resolve_queue("feed-pulls"), "polling");
        unsafe {
            std::env::remove_var(QUEUE_OVERRIDE_ENV);
        }
        assert_eq!(TaskQueue::resolve_queue("feed-pulls"), "feed-pulls");
    }
}
