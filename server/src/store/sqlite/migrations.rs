//! Schema versioning for the SQLite backend. Version 1 is the initial
//! schema; future migrations are applied incrementally.

use sqlx::SqlitePool;

use super::schema::{SCHEMA, SCHEMA_VERSION};
use crate::store::error::StoreError;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    let table_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
    )
    .fetch_one(pool)
    .await
    .map_err(StoreError::Sqlite)?;

    if !table_exists {
        tracing::debug!(version = SCHEMA_VERSION, "initializing fresh sqlite schema");
        let mut tx = pool.begin().await.map_err(StoreError::Sqlite)?;
        sqlx::query(SCHEMA)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlite)?;
        sqlx::query("INSERT INTO schema_version (id, version) VALUES (1, ?)")
            .bind(SCHEMA_VERSION)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Sqlite)?;
        tx.commit().await.map_err(StoreError::Sqlite)?;
        return Ok(());
    }

    let current_version: i32 = sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
        .fetch_optional(pool)
        .await
        .map_err(StoreError::Sqlite)?
        .unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        tracing::debug!(version = current_version, "sqlite schema up to date");
        return Ok(());
    }

    // No migrations beyond version 1 yet; future versions append here.
    Ok(())
}
