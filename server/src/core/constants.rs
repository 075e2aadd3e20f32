//! Tunable constants governing retry cadence, queue names, and the
//! hub's port allowlist.

use std::time::Duration;

/// Default subscription lease, used when a subscribe request omits
/// `hub.lease_seconds` (or supplies a non-positive value).
pub const DEFAULT_LEASE_SECONDS: i64 = 30 * 24 * 3600;

/// Upper bound a requested lease is clamped to.
pub const MAX_LEASE_SECONDS: i64 = 90 * 24 * 3600;

/// Base period for the subscription confirmation backoff: `base * 2^failures`.
pub const SUBSCRIPTION_RETRY_PERIOD_SECS: i64 = 300;

/// A subscription is abandoned once its confirm-failure counter reaches this.
pub const MAX_SUBSCRIPTION_CONFIRM_FAILURES: u32 = 10;

/// Base period for the feed-pull backoff.
pub const FEED_PULL_RETRY_PERIOD_SECS: i64 = 60;

/// A FeedToFetch is marked totally_failed once its failure counter reaches this.
pub const MAX_FEED_PULL_FAILURES: u32 = 9;

/// Base period for the delivery-retry backoff.
pub const DELIVERY_RETRY_PERIOD_SECS: i64 = 60;

/// An event is marked totally_failed once retry_attempts exceeds this.
pub const MAX_DELIVERY_FAILURES: u32 = 8;

/// Number of verified subscribers fetched per delivery chunk (Normal and Retry mode).
pub const EVENT_SUBSCRIBER_CHUNK_SIZE: i64 = 10;

/// Number of KnownFeed keys scanned per bootstrap poll chunk.
pub const BOOTSTRAP_FEED_CHUNK_SIZE: i64 = 200;

/// Cadence of the bootstrap poller's own trigger.
pub const POLLING_BOOTSTRAP_PERIOD_SECS: i64 = 3 * 3600;

/// How long a totally_failed EventToDeliver is retained before the cleanup
/// reaper deletes it.
pub const EVENT_CLEANUP_MAX_AGE_SECONDS: i64 = 30 * 24 * 3600;

/// Redirects followed during a feed fetch before giving up.
pub const MAX_REDIRECTS: u8 = 7;

/// Batch size for FeedEntryRecord existence/hash lookups during diffing.
pub const MAX_FEED_ENTRY_RECORD_LOOKUPS: usize = 100;

/// Hard cap on new/updated entries carried by a single commit; oldest excess
/// entries are deferred to the next fetch.
pub const MAX_NEW_FEED_ENTRY_RECORDS: usize = 100;

/// Attempts to shrink an oversized fetch-commit before giving up as a fetch failure.
pub const PUT_SPLITTING_ATTEMPTS: u32 = 4;

/// Soft cap on the serialized size of a single fetch-commit (feed record +
/// entry records + event payload), mirroring the per-entity-group write
/// limit of the original hub's datastore. Exceeding it triggers the
/// halve-and-retry loop in the fetch pipeline.
pub const MAX_COMMIT_BYTES: usize = 1_000_000;

/// Retention window for totally-failed [`crate::store::entities::FeedToFetch`]
/// rows is unbounded (kept for diagnosis per spec); events are reaped after
/// [`EVENT_CLEANUP_MAX_AGE_SECONDS`]. Cadence of that reaper's own trigger.
pub const EVENT_CLEANUP_PERIOD_SECS: u64 = 3600;

/// Length, in characters, of the challenge token handed to subscribers.
pub const CHALLENGE_TOKEN_LEN: usize = 128;

/// Alphabet the challenge token is drawn from.
pub const CHALLENGE_TOKEN_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Overall deadline budget for a single worker handler invocation, covering
/// store round-trips, the task-queue enqueue, and any outbound HTTP.
pub const HANDLER_DEADLINE: Duration = Duration::from_secs(30);

/// Deadline for the concurrent delivery barrier within one chunk.
pub const DELIVERY_BARRIER_DEADLINE: Duration = Duration::from_secs(20);

/// Outbound HTTP connect/request timeout shared by challenge GET, fetch GET,
/// and delivery POST.
pub const OUTBOUND_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Ports a callback/topic URL may use outside a development environment,
/// carried verbatim from the original hub's `VALID_PORTS`.
pub const VALID_PORTS: &[u16] = &[
    80, 443, 4443, 8080, 8081, 8082, 8083, 8084, 8085, 8086, 8087, 8088, 8089, 8188, 8444, 8990,
];

/// Logical task-queue names.
pub const SUBSCRIPTION_QUEUE: &str = "subscriptions";
pub const FEED_QUEUE: &str = "feed-pulls";
pub const EVENT_QUEUE: &str = "event-delivery";
pub const POLLING_QUEUE: &str = "polling";

/// Environment variable that, when set, overrides the queue a worker
/// re-enqueues follow-up work on.
pub const QUEUE_OVERRIDE_ENV: &str = "HUB_QUEUE_OVERRIDE";

/// Bounded number of in-process retries an enqueue call gets before the
/// caller surfaces the failure.
pub const ENQUEUE_MAX_ATTEMPTS: u32 = 3;
pub const ENQUEUE_RETRY_BASE_DELAY_MS: u64 = 50;

/// Timeout budget background tasks are given to drain during shutdown.
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Returns the exponential backoff ETA, in seconds from now, for the
/// `k`-th failure (1-indexed): `base * 2^(k-1)`.
pub fn backoff_seconds(base_secs: i64, failure_number: u32) -> i64 {
    base_secs * 2_i64.pow(failure_number.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_each_failure() {
        // etas 300*2^0 .. 300*2^9 after failures 1..10.
        assert_eq!(backoff_seconds(300, 1), 300);
        assert_eq!(backoff_seconds(300, 2), 600);
        assert_eq!(backoff_seconds(300, 10), 300 * 512);
    }

    #[test]
    fn known_ports_contains_http_and_https_defaults() {
        assert!(VALID_PORTS.contains(&80));
        assert!(VALID_PORTS.contains(&443));
    }
}
