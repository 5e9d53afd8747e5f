//! Payment orchestration errors

use crate::model::{PaymentStatus, Rail};
use thiserror::Error;
use tiba_core::TibaError;
use tiba_db::DbError;

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Debug, Error)]
pub enum PaymentError {
    /// Rail credential or token failure; the attempt is over
    #[error("Authentication failed for {rail}: {message}")]
    Authentication { rail: Rail, message: String },

    /// Non-2xx or malformed response from a rail
    #[error("Gateway error from {rail} (HTTP {http_status:?}): {body}")]
    Gateway {
        rail: Rail,
        http_status: Option<u16>,
        body: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Malformed callback: {0}")]
    MalformedCallback(String),

    #[error("Ambiguous status from {rail}: {status}")]
    AmbiguousStatus { rail: Rail, status: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Payment not found: {0}")]
    NotFound(String),

    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition { from: PaymentStatus, to: PaymentStatus },

    #[error("Payment {0} cannot be cancelled")]
    NotCancellable(String),

    #[error("Payment {0} was cancelled")]
    Cancelled(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PaymentError {
    pub fn gateway(rail: Rail, http_status: Option<u16>, body: impl Into<String>) -> Self {
        Self::Gateway {
            rail,
            http_status,
            body: body.into(),
        }
    }

    /// Transport failure before any HTTP status was received
    pub fn transport(rail: Rail, err: reqwest::Error) -> Self {
        let body = if err.is_timeout() {
            format!("request timed out: {err}")
        } else {
            err.to_string()
        };
        Self::gateway(rail, err.status().map(|s| s.as_u16()), body)
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::MalformedCallback(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_)
            | Self::InvalidTransition { .. }
            | Self::NotCancellable(_)
            | Self::Cancelled(_) => 409,
            Self::Authentication { .. } | Self::Gateway { .. } => 502,
            Self::AmbiguousStatus { .. } => 202,
            Self::Store(_) | Self::Config(_) => 500,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "AUTHENTICATION_ERROR",
            Self::Gateway { .. } => "GATEWAY_ERROR",
            Self::Conflict(_) => "CONFLICT",
            Self::MalformedCallback(_) => "MALFORMED_CALLBACK",
            Self::AmbiguousStatus { .. } => "AMBIGUOUS_STATUS",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::NotCancellable(_) => "NOT_CANCELLABLE",
            Self::Cancelled(_) => "CANCELLED",
            Self::Store(_) => "STORE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

impl From<DbError> for PaymentError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::UniqueViolation(constraint) => {
                PaymentError::Conflict(format!("unique constraint {constraint}"))
            }
            other => PaymentError::Store(other.to_string()),
        }
    }
}

impl From<PaymentError> for TibaError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Validation(m) | PaymentError::MalformedCallback(m) => {
                TibaError::Validation(m)
            }
            PaymentError::NotFound(m) => TibaError::NotFound(m),
            PaymentError::Authentication { message, .. } => TibaError::Auth(message),
            PaymentError::Config(m) => TibaError::Config(m),
            PaymentError::Store(m) => TibaError::Database(m),
            PaymentError::Conflict(m) => TibaError::Conflict(m),
            other => TibaError::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PaymentError::Conflict("x".into()).status_code(), 409);
        assert_eq!(PaymentError::MalformedCallback("x".into()).status_code(), 400);
        assert_eq!(
            PaymentError::gateway(Rail::CardRedirect, Some(500), "boom").status_code(),
            502
        );
        assert_eq!(PaymentError::NotFound("x".into()).error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_unique_violation_is_conflict() {
        let err: PaymentError = DbError::UniqueViolation("one_active_intent".into()).into();
        assert!(matches!(err, PaymentError::Conflict(_)));
    }

    #[test]
    fn test_into_platform_error() {
        let err: TibaError = PaymentError::Config("rail disabled".into()).into();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }
}
