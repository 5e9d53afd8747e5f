//! Database Error Types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Query error: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Row not found")]
    NotFound,
}

impl DbError {
    /// Classify a driver error, surfacing unique-constraint violations separately
    pub fn from_driver(err: tokio_postgres::Error) -> Self {
        match err.as_db_error() {
            Some(db) if *db.code() == tokio_postgres::error::SqlState::UNIQUE_VIOLATION => {
                DbError::UniqueViolation(
                    db.constraint().unwrap_or_else(|| db.message()).to_string(),
                )
            }
            _ => DbError::Query(err),
        }
    }
}
