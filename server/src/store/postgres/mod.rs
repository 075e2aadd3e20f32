//! PostgreSQL store backend, kept structurally parallel to
//! [`crate::store::sqlite`] for multi-instance deployments.

mod events;
mod feeds;
mod migrations;
mod queue;
mod schema;
mod subscriptions;

pub use sqlx::PgPool;

use sqlx::postgres::PgPoolOptions;

use crate::store::error::StoreError;

const MAX_CONNECTIONS: u32 = 20;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn init(connection_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(connection_url)
            .await
            .map_err(StoreError::Postgres)?;

        migrations::run_migrations(&pool).await?;

        tracing::debug!("postgres store initialized");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
