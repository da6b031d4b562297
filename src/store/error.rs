#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Department not found: {tenant_id}")]
    NotFound { tenant_id: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Turn UNIQUE violations into a stable conflict error
pub(crate) fn map_write_error(e: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() || db_err.message().to_ascii_uppercase().contains("UNIQUE")
        {
            return StoreError::Conflict {
                message: format!("{}: {}", what, db_err.message()),
            };
        }
    }
    StoreError::Database(e)
}
