//! Unified error type for the store layer, covering both backends.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(sqlx::Error),

    #[error("PostgreSQL error: {0}")]
    Postgres(sqlx::Error),

    #[error("migration {version} ({name}) failed on {backend}: {error}")]
    MigrationFailed {
        backend: &'static str,
        version: i32,
        name: String,
        error: String,
    },

    #[error("row {key} not found in {entity}")]
    NotFound { entity: &'static str, key: String },

    #[error("commit too large after {attempts} splitting attempts")]
    CommitTooLarge { attempts: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Whether a caller should retry in-process rather than surfacing 503
    /// immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(e) | Self::Postgres(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Postgres(_) => "postgres",
            Self::MigrationFailed { backend, .. } => backend,
            Self::NotFound { .. } | Self::CommitTooLarge { .. } | Self::Config(_) | Self::Io(_) => {
                "unknown"
            }
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_displays_entity_and_key() {
        let err = StoreError::not_found("subscription", "hash_abc");
        assert_eq!(err.to_string(), "row hash_abc not found in subscription");
    }

    #[test]
    fn migration_failed_display() {
        let err = StoreError::MigrationFailed {
            backend: "sqlite",
            version: 1,
            name: "init".to_string(),
            error: "syntax error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "migration 1 (init) failed on sqlite: syntax error"
        );
    }
}
