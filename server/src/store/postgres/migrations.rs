//! Schema versioning for the PostgreSQL backend.

use sqlx::PgPool;

use super::schema::{SCHEMA, SCHEMA_VERSION};
use crate::store::error::StoreError;

pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    let table_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'schema_version')",
    )
    .fetch_one(pool)
    .await
    .map_err(StoreError::Postgres)?;

    if !table_exists {
        tracing::debug!(version = SCHEMA_VERSION, "initializing fresh postgres schema");
        let mut tx = pool.begin().await.map_err(StoreError::Postgres)?;
        sqlx::query(SCHEMA)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Postgres)?;
        sqlx::query("INSERT INTO schema_version (id, version) VALUES (1, $1)")
            .bind(SCHEMA_VERSION)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Postgres)?;
        tx.commit().await.map_err(StoreError::Postgres)?;
        return Ok(());
    }

    let current_version: i32 = sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
        .fetch_optional(pool)
        .await
        .map_err(StoreError::Postgres)?
        .unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        tracing::debug!(version = current_version, "postgres schema up to date");
        return Ok(());
    }

    Ok(())
}
