//! Error types for Tiba services

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TibaError>;

#[derive(Error, Debug)]
pub enum TibaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TibaError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Auth(_) => 401,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Auth(_) => "AUTH_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for TibaError {
    fn from(err: std::io::Error) -> Self {
        TibaError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(TibaError::Validation("x".into()).status_code(), 400);
        assert_eq!(TibaError::Conflict("x".into()).status_code(), 409);
        assert_eq!(TibaError::Database("x".into()).status_code(), 500);
        assert_eq!(TibaError::Auth("x".into()).status_code(), 401);
    }

    #[test]
    fn test_io_errors_surface_as_network() {
        let err: TibaError = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use").into();
        assert_eq!(err.error_code(), "NETWORK_ERROR");
        assert_eq!(err.status_code(), 500);
    }
}
