use chrono::{DateTime, Utc};
use sqlx::Row;

use super::SqliteStore;
use crate::store::entities::{
    EventToDeliver, FeedContentType, FeedEntryRecord, FeedRecord, FeedToFetch, KnownFeed,
    PollingMarker, POLLING_MARKER_KEY,
};
use crate::store::error::{StoreError, StoreResult};

fn row_to_feed_to_fetch(row: &sqlx::sqlite::SqliteRow) -> StoreResult<FeedToFetch> {
    Ok(FeedToFetch {
        key: row.try_get("key").map_err(StoreError::Sqlite)?,
        topic: row.try_get("topic").map_err(StoreError::Sqlite)?,
        eta: row.try_get("eta").map_err(StoreError::Sqlite)?,
        fetching_failures: row.try_get("fetching_failures").map_err(StoreError::Sqlite)?,
        totally_failed: row.try_get("totally_failed").map_err(StoreError::Sqlite)?,
    })
}

fn row_to_feed_record(row: &sqlx::sqlite::SqliteRow) -> StoreResult<FeedRecord> {
    let content_type_str: String = row.try_get("content_type").map_err(StoreError::Sqlite)?;
    let content_type = FeedContentType::parse(&content_type_str)
        .ok_or_else(|| StoreError::Config(format!("unknown content_type '{}'", content_type_str)))?;
    Ok(FeedRecord {
        key: row.try_get("key").map_err(StoreError::Sqlite)?,
        topic: row.try_get("topic").map_err(StoreError::Sqlite)?,
        envelope_header: row.try_get("envelope_header").map_err(StoreError::Sqlite)?,
        envelope_footer: row.try_get("envelope_footer").map_err(StoreError::Sqlite)?,
        content_type,
        last_updated: row.try_get("last_updated").map_err(StoreError::Sqlite)?,
        last_modified_header: row
            .try_get("last_modified_header")
            .map_err(StoreError::Sqlite)?,
        etag: row.try_get("etag").map_err(StoreError::Sqlite)?,
    })
}

fn row_to_feed_entry(row: &sqlx::sqlite::SqliteRow) -> StoreResult<FeedEntryRecord> {
    Ok(FeedEntryRecord {
        key: row.try_get("key").map_err(StoreError::Sqlite)?,
        feed_key: row.try_get("feed_key").map_err(StoreError::Sqlite)?,
        entry_id: row.try_get("entry_id").map_err(StoreError::Sqlite)?,
        entry_id_hash: row.try_get("entry_id_hash").map_err(StoreError::Sqlite)?,
        content_hash: row.try_get("content_hash").map_err(StoreError::Sqlite)?,
        update_time: row.try_get("update_time").map_err(StoreError::Sqlite)?,
    })
}

impl SqliteStore {
    pub async fn get_feed_to_fetch(&self, key: &str) -> StoreResult<Option<FeedToFetch>> {
        let row = sqlx::query("SELECT * FROM feed_to_fetch WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        row.as_ref().map(row_to_feed_to_fetch).transpose()
    }

    /// Blind-overwrite insert: always resets `fetching_failures` and
    /// `totally_failed`, matching the original hub's `FeedToFetch.insert`
    /// (it constructs a fresh entity rather than merging into one that
    /// might already exist).
    pub async fn upsert_feed_to_fetch(
        &self,
        topic: &str,
        key: &str,
        eta: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO feed_to_fetch (key, topic, eta, fetching_failures, totally_failed)
            VALUES (?, ?, ?, 0, 0)
            ON CONFLICT(key) DO UPDATE SET
                topic = excluded.topic,
                eta = excluded.eta,
                fetching_failures = 0,
                totally_failed = 0
            "#,
        )
        .bind(key)
        .bind(topic)
        .bind(eta)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    pub async fn update_feed_to_fetch(&self, f: &FeedToFetch) -> StoreResult<()> {
        sqlx::query(
            "UPDATE feed_to_fetch SET eta = ?, fetching_failures = ?, totally_failed = ? WHERE key = ?",
        )
        .bind(f.eta)
        .bind(f.fetching_failures)
        .bind(f.totally_failed)
        .bind(&f.key)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    pub async fn delete_feed_to_fetch(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM feed_to_fetch WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    /// Conditional delete: succeeds only if the persisted ETA still
    /// matches the one the worker loaded, so a concurrent publish that
    /// moved the ETA forward survives.
    pub async fn delete_feed_to_fetch_if_eta(
        &self,
        key: &str,
        expected_eta: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM feed_to_fetch WHERE key = ? AND eta = ?")
            .bind(key)
            .bind(expected_eta)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_feed_record(&self, key: &str) -> StoreResult<Option<FeedRecord>> {
        let row = sqlx::query("SELECT * FROM feed_records WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        row.as_ref().map(row_to_feed_record).transpose()
    }

    /// Batched lookup of [`FeedEntryRecord`]s by their id hashes, bounded
    /// by `MAX_FEED_ENTRY_RECORD_LOOKUPS` at the caller.
    pub async fn get_feed_entry_records(
        &self,
        feed_key: &str,
        entry_id_hashes: &[String],
    ) -> StoreResult<Vec<FeedEntryRecord>> {
        if entry_id_hashes.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = entry_id_hashes.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT * FROM feed_entry_records WHERE feed_key = ? AND entry_id_hash IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(feed_key);
        for hash in entry_id_hashes {
            query = query.bind(hash);
        }
        let rows = query.fetch_all(&self.pool).await.map_err(StoreError::Sqlite)?;
        rows.iter().map(row_to_feed_entry).collect()
    }

    /// Atomically commits the diffed entries, the updated feed envelope,
    /// and the delivery event for one topic. All three sets are present
    /// or absent together.
    pub async fn commit_fetch(
        &self,
        feed_record: &FeedRecord,
        new_entries: &[FeedEntryRecord],
        event: Option<&EventToDeliver>,
    ) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Sqlite)?;

        sqlx::query(
            r#"
            INSERT INTO feed_records
                (key, topic, envelope_header, envelope_footer, content_type,
                 last_updated, last_modified_header, etag)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                envelope_header = excluded.envelope_header,
                envelope_footer = excluded.envelope_footer,
                content_type = excluded.content_type,
                last_updated = excluded.last_updated,
                last_modified_header = excluded.last_modified_header,
                etag = excluded.etag
            "#,
        )
        .bind(&feed_record.key)
        .bind(&feed_record.topic)
        .bind(&feed_record.envelope_header)
        .bind(&feed_record.envelope_footer)
        .bind(feed_record.content_type.as_str())
        .bind(feed_record.last_updated)
        .bind(&feed_record.last_modified_header)
        .bind(&feed_record.etag)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::Sqlite)?;

        for entry in new_entries {
            sqlx::query(
                r#"
                INSERT INTO feed_entry_records
                    (key, feed_key, entry_id, entry_id_hash, content_hash, update_time)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    content_hash = excluded.content_hash,
                    update_time = excluded.update_time
                "#,
            )
            .bind(&entry.key)
            .bind(&entry.feed_key)
            .bind(&entry.entry_id)
            .bind(&entry.entry_id_hash)
            .bind(&entry.content_hash)
            .bind(entry.update_time)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlite)?;
        }

        if let Some(event) = event {
            let failed_callbacks = serde_json::to_string(&event.failed_callbacks)
                .map_err(|e| StoreError::Config(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO events_to_deliver
                    (key, topic, topic_hash, payload, content_type, mode, last_callback,
                     failed_callbacks, retry_attempts, last_modified, totally_failed)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(key) DO UPDATE SET
                    payload = excluded.payload,
                    content_type = excluded.content_type,
                    mode = excluded.mode,
                    last_callback = excluded.last_callback,
                    failed_callbacks = excluded.failed_callbacks,
                    retry_attempts = excluded.retry_attempts,
                    last_modified = excluded.last_modified,
                    totally_failed = excluded.totally_failed
                "#,
            )
            .bind(&event.key)
            .bind(&event.topic)
            .bind(&event.topic_hash)
            .bind(&event.payload)
            .bind(event.content_type.as_str())
            .bind(event.mode.as_str())
            .bind(&event.last_callback)
            .bind(failed_callbacks)
            .bind(event.retry_attempts)
            .bind(event.last_modified)
            .bind(event.totally_failed)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlite)?;
        }

        tx.commit().await.map_err(StoreError::Sqlite)?;
        Ok(())
    }

    pub async fn get_known_feed(&self, key: &str) -> StoreResult<Option<KnownFeed>> {
        let row = sqlx::query("SELECT * FROM known_feeds WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        row.map(|r| {
            Ok(KnownFeed {
                key: r.try_get("key").map_err(StoreError::Sqlite)?,
                topic: r.try_get("topic").map_err(StoreError::Sqlite)?,
            })
        })
        .transpose()
    }

    pub async fn put_known_feed(&self, key: &str, topic: &str) -> StoreResult<()> {
        sqlx::query("INSERT INTO known_feeds (key, topic) VALUES (?, ?) ON CONFLICT(key) DO NOTHING")
            .bind(key)
            .bind(topic)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    pub async fn delete_known_feed(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM known_feeds WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    /// Lexicographic chunked scan used by the bootstrap poller: keys
    /// strictly greater than `after_key` (empty string to start),
    /// ascending, bounded by `limit`.
    pub async fn list_known_feed_keys_from(
        &self,
        after_key: &str,
        limit: i64,
    ) -> StoreResult<Vec<KnownFeed>> {
        let rows = sqlx::query("SELECT * FROM known_feeds WHERE key > ? ORDER BY key ASC LIMIT ?")
            .bind(after_key)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        rows.into_iter()
            .map(|r| {
                Ok(KnownFeed {
                    key: r.try_get("key").map_err(StoreError::Sqlite)?,
                    topic: r.try_get("topic").map_err(StoreError::Sqlite)?,
                })
            })
            .collect()
    }

    pub async fn get_polling_marker(&self) -> StoreResult<Option<PollingMarker>> {
        let row = sqlx::query("SELECT * FROM polling_marker WHERE key = ?")
            .bind(POLLING_MARKER_KEY)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        row.map(|r| {
            Ok(PollingMarker {
                last_start: r.try_get("last_start").map_err(StoreError::Sqlite)?,
                next_start: r.try_get("next_start").map_err(StoreError::Sqlite)?,
            })
        })
        .transpose()
    }

    pub async fn put_polling_marker(&self, marker: &PollingMarker) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO polling_marker (key, last_start, next_start)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                last_start = excluded.last_start,
                next_start = excluded.next_start
            "#,
        )
        .bind(POLLING_MARKER_KEY)
        .bind(marker.last_start)
        .bind(marker.next_start)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }
}
