//! SQLite schema definition. Version 1 is the initial schema; future
//! migrations are appended here and applied incrementally.

pub const SCHEMA_VERSION: i32 = 1;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    key               TEXT PRIMARY KEY,
    callback          TEXT NOT NULL,
    callback_hash     TEXT NOT NULL,
    topic             TEXT NOT NULL,
    topic_hash        TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    last_modified     TEXT NOT NULL,
    lease_seconds     INTEGER NOT NULL,
    expiration_time   TEXT NOT NULL,
    eta               TEXT NOT NULL,
    confirm_failures  INTEGER NOT NULL DEFAULT 0,
    verify_token      TEXT,
    secret            TEXT,
    state             TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_subscriptions_topic_state_callback
    ON subscriptions(topic_hash, state, callback_hash);

CREATE TABLE IF NOT EXISTS feed_to_fetch (
    key                TEXT PRIMARY KEY,
    topic              TEXT NOT NULL,
    eta                TEXT NOT NULL,
    fetching_failures  INTEGER NOT NULL DEFAULT 0,
    totally_failed     INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS feed_records (
    key                  TEXT PRIMARY KEY,
    topic                TEXT NOT NULL,
    envelope_header      TEXT NOT NULL,
    envelope_footer      TEXT NOT NULL,
    content_type         TEXT NOT NULL,
    last_updated         TEXT NOT NULL,
    last_modified_header TEXT,
    etag                 TEXT
);

CREATE TABLE IF NOT EXISTS feed_entry_records (
    key            TEXT PRIMARY KEY,
    feed_key       TEXT NOT NULL,
    entry_id       TEXT NOT NULL,
    entry_id_hash  TEXT NOT NULL,
    content_hash   TEXT NOT NULL,
    update_time    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_feed_entry_feed_key
    ON feed_entry_records(feed_key, entry_id_hash);

CREATE TABLE IF NOT EXISTS events_to_deliver (
    key               TEXT PRIMARY KEY,
    topic             TEXT NOT NULL,
    topic_hash        TEXT NOT NULL,
    payload           TEXT NOT NULL,
    content_type      TEXT NOT NULL,
    mode              TEXT NOT NULL,
    last_callback     TEXT,
    failed_callbacks  TEXT NOT NULL DEFAULT '[]',
    retry_attempts    INTEGER NOT NULL DEFAULT 0,
    last_modified     TEXT NOT NULL,
    totally_failed    INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_events_totally_failed_last_modified
    ON events_to_deliver(totally_failed, last_modified);

CREATE TABLE IF NOT EXISTS known_feeds (
    key    TEXT PRIMARY KEY,
    topic  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS polling_marker (
    key         TEXT PRIMARY KEY,
    last_start  TEXT NOT NULL,
    next_start  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    queue       TEXT NOT NULL,
    name        TEXT,
    url         TEXT NOT NULL,
    params      TEXT NOT NULL,
    eta         TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE(queue, name)
);
CREATE INDEX IF NOT EXISTS idx_task_queue_queue_eta ON task_queue(queue, eta);

CREATE TABLE IF NOT EXISTS schema_version (
    id       INTEGER PRIMARY KEY,
    version  INTEGER NOT NULL
);
"#;
