use chrono::{DateTime, Utc};
use sqlx::Row;

use super::SqliteStore;
use crate::store::entities::{DeliveryMode, EventToDeliver, FeedContentType};
use crate::store::error::{StoreError, StoreResult};

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> StoreResult<EventToDeliver> {
    let content_type_str: String = row.try_get("content_type").map_err(StoreError::Sqlite)?;
    let content_type = FeedContentType::parse(&content_type_str)
        .ok_or_else(|| StoreError::Config(format!("unknown content_type '{}'", content_type_str)))?;
    let mode_str: String = row.try_get("mode").map_err(StoreError::Sqlite)?;
    let mode = DeliveryMode::parse(&mode_str)
        .ok_or_else(|| StoreError::Config(format!("unknown delivery mode '{}'", mode_str)))?;
    let failed_callbacks_json: String = row.try_get("failed_callbacks").map_err(StoreError::Sqlite)?;
    let failed_callbacks: Vec<String> =
        serde_json::from_str(&failed_callbacks_json).map_err(|e| StoreError::Config(e.to_string()))?;

    Ok(EventToDeliver {
        key: row.try_get("key").map_err(StoreError::Sqlite)?,
        topic: row.try_get("topic").map_err(StoreError::Sqlite)?,
        topic_hash: row.try_get("topic_hash").map_err(StoreError::Sqlite)?,
        payload: row.try_get("payload").map_err(StoreError::Sqlite)?,
        content_type,
        mode,
        last_callback: row.try_get("last_callback").map_err(StoreError::Sqlite)?,
        failed_callbacks,
        retry_attempts: row.try_get("retry_attempts").map_err(StoreError::Sqlite)?,
        last_modified: row.try_get("last_modified").map_err(StoreError::Sqlite)?,
        totally_failed: row.try_get("totally_failed").map_err(StoreError::Sqlite)?,
    })
}

impl SqliteStore {
    pub async fn get_event(&self, key: &str) -> StoreResult<Option<EventToDeliver>> {
        let row = sqlx::query("SELECT * FROM events_to_deliver WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        row.as_ref().map(row_to_event).transpose()
    }

    pub async fn put_event(&self, event: &EventToDeliver) -> StoreResult<()> {
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
        .execute(&self.pool)
        .await
        .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    pub async fn delete_event(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM events_to_deliver WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Sqlite)?;
        Ok(())
    }

    /// Keys of totally-failed events older than the retention cutoff, for
    /// the periodic cleanup reaper.
    pub async fn list_totally_failed_event_keys_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        let rows = sqlx::query(
            "SELECT key FROM events_to_deliver WHERE totally_failed = 1 AND last_modified < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Sqlite)?;
        rows.into_iter()
            .map(|r| r.try_get("key").map_err(StoreError::Sqlite))
            .collect()
    }
}
