use sqlx::Row;

use super::PostgresStore;
use crate::store::entities::{Subscription, SubscriptionState};
use crate::store::error::{StoreError, StoreResult};

fn row_to_subscription(row: &sqlx::postgres::PgRow) -> StoreResult<Subscription> {
    let state_str: String = row.try_get("state").map_err(StoreError::Postgres)?;
    let state = SubscriptionState::parse(&state_str).ok_or_else(|| {
        StoreError::Config(format!("unknown subscription state '{}'", state_str))
    })?;
    Ok(Subscription {
        key: row.try_get("key").map_err(StoreError::Postgres)?,
        callback: row.try_get("callback").map_err(StoreError::Postgres)?,
        callback_hash: row.try_get("callback_hash").map_err(StoreError::Postgres)?,
        topic: row.try_get("topic").map_err(StoreError::Postgres)?,
        topic_hash: row.try_get("topic_hash").map_err(StoreError::Postgres)?,
        created_at: row.try_get("created_at").map_err(StoreError::Postgres)?,
        last_modified: row.try_get("last_modified").map_err(StoreError::Postgres)?,
        lease_seconds: row.try_get("lease_seconds").map_err(StoreError::Postgres)?,
        expiration_time: row.try_get("expiration_time").map_err(StoreError::Postgres)?,
        eta: row.try_get("eta").map_err(StoreError::Postgres)?,
        confirm_failures: row.try_get("confirm_failures").map_err(StoreError::Postgres)?,
        verify_token: row.try_get("verify_token").map_err(StoreError::Postgres)?,
        secret: row.try_get("secret").map_err(StoreError::Postgres)?,
        state,
    })
}

impl PostgresStore {
    pub async fn get_subscription(&self, key: &str) -> StoreResult<Option<Subscription>> {
        let row = sqlx::query("SELECT * FROM subscriptions WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Postgres)?;
        row.as_ref().map(row_to_subscription).transpose()
    }

    pub async fn put_subscription(&self, sub: &Subscription) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (key, callback, callback_hash, topic, topic_hash, created_at, last_modified,
                 lease_seconds, expiration_time, eta, confirm_failures, verify_token, secret, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT(key) DO UPDATE SET
                callback = excluded.callback,
                callback_hash = excluded.callback_hash,
                topic = excluded.topic,
                topic_hash = excluded.topic_hash,
                last_modified = excluded.last_modified,
                lease_seconds = excluded.lease_seconds,
                expiration_time = excluded.expiration_time,
                eta = excluded.eta,
                confirm_failures = excluded.confirm_failures,
                verify_token = excluded.verify_token,
                secret = excluded.secret,
                state = excluded.state
            "#,
        )
        .bind(&sub.key)
        .bind(&sub.callback)
        .bind(&sub.callback_hash)
        .bind(&sub.topic)
        .bind(&sub.topic_hash)
        .bind(sub.created_at)
        .bind(sub.last_modified)
        .bind(sub.lease_seconds)
        .bind(sub.expiration_time)
        .bind(sub.eta)
        .bind(sub.confirm_failures)
        .bind(&sub.verify_token)
        .bind(&sub.secret)
        .bind(sub.state.as_str())
        .execute(&self.pool)
        .await
        .map_err(StoreError::Postgres)?;
        Ok(())
    }

    pub async fn delete_subscription(&self, key: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM subscriptions WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Postgres)?;
        Ok(())
    }

    pub async fn count_verified_subscribers(&self, topic_hash: &str) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscriptions WHERE topic_hash = $1 AND state = 'verified'",
        )
        .bind(topic_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::Postgres)?;
        Ok(count)
    }

    pub async fn list_verified_subscribers_chunk(
        &self,
        topic_hash: &str,
        start_callback_hash: &str,
        limit: i64,
    ) -> StoreResult<Vec<Subscription>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM subscriptions
            WHERE topic_hash = $1 AND state = 'verified' AND callback_hash >= $2
            ORDER BY callback_hash ASC
            LIMIT $3
            "#,
        )
        .bind(topic_hash)
        .bind(start_callback_hash)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Postgres)?;
        rows.iter().map(row_to_subscription).collect()
    }
}
