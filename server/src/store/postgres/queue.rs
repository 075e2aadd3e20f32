use chrono::{DateTime, Utc};
use sqlx::Row;

use super::PostgresStore;
use crate::store::entities::QueuedTask;
use crate::store::error::{StoreError, StoreResult};

fn row_to_task(row: &sqlx::postgres::PgRow) -> StoreResult<QueuedTask> {
    let params_text: String = row.try_get("params").map_err(StoreError::Postgres)?;
    let params = serde_json::from_str(&params_text).map_err(|e| StoreError::Config(e.to_string()))?;
    Ok(QueuedTask {
        id: row.try_get("id").map_err(StoreError::Postgres)?,
        queue: row.try_get("queue").map_err(StoreError::Postgres)?,
        name: row.try_get("name").map_err(StoreError::Postgres)?,
        url: row.try_get("url").map_err(StoreError::Postgres)?,
        params,
        eta: row.try_get("eta").map_err(StoreError::Postgres)?,
        created_at: row.try_get("created_at").map_err(StoreError::Postgres)?,
    })
}

impl PostgresStore {
    /// Enqueues a task. If `name` is `Some` and a task with the same
    /// `(queue, name)` already exists, this is a no-op. Returns whether a
    /// new row was inserted.
    pub async fn enqueue_task(
        &self,
        queue: &str,
        name: Option<&str>,
        url: &str,
        params: &serde_json::Value,
        eta: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let params_text = serde_json::to_string(params).map_err(|e| StoreError::Config(e.to_string()))?;
        let result = sqlx::query(
            r#"
            INSERT INTO task_queue (queue, name, url, params, eta, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT(queue, name) DO NOTHING
            "#,
        )
        .bind(queue)
        .bind(name)
        .bind(url)
        .bind(params_text)
        .bind(eta)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Postgres)?;
        Ok(result.rows_affected() > 0)
    }

    /// Pops up to `limit` due tasks from `queue`, deleting them within the
    /// same transaction so execution is at-least-once.
    pub async fn pop_due_tasks(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<QueuedTask>> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Postgres)?;
        let rows = sqlx::query(
            "SELECT * FROM task_queue WHERE queue = $1 AND eta <= $2 ORDER BY eta ASC LIMIT $3",
        )
        .bind(queue)
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(StoreError::Postgres)?;

        let tasks: Vec<QueuedTask> = rows.iter().map(row_to_task).collect::<StoreResult<_>>()?;
        for task in &tasks {
            sqlx::query("DELETE FROM task_queue WHERE id = $1")
                .bind(task.id)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::Postgres)?;
        }
        tx.commit().await.map_err(StoreError::Postgres)?;
        Ok(tasks)
    }
}
