// src/error.rs

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

use crate::evidence::EvidenceError;
use crate::provider::ProviderError;
use crate::store::{StoreError, UniqueField};

/// Failure taxonomy shared by every intake, activation and reconciliation path.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    /// Unknown or inactive plan named by a caller.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("{}", .0.message())]
    Duplicate(UniqueField),

    #[error("authentication required")]
    Unauthenticated,

    #[error("not allowed to access this resource")]
    Authorization,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("billing provider error: {0}")]
    Upstream(String),

    #[error("billing provider timed out")]
    UpstreamTimeout,
}

pub type AppResult<T> = Result<T, AppError>;

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidPlan(_) => StatusCode::BAD_REQUEST,
            AppError::Duplicate(_) => StatusCode::CONFLICT,
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Authorization => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Storage details stay in the logs.
        let message = match self {
            AppError::Storage(_) => "An error occurred. Please try again later.".to_string(),
            other => other.to_string(),
        };
        HttpResponse::build(self.status_code()).json(json!({
            "success": false,
            "message": message,
        }))
    }
}

impl From<StoreError> for AppError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(field) => AppError::Duplicate(field),
            StoreError::NotFound(what) => AppError::NotFound(what),
            other => {
                log::error!("store error: {other}");
                AppError::Storage(other.to_string())
            }
        }
    }
}

impl From<EvidenceError> for AppError {
    fn from(value: EvidenceError) -> Self {
        match value {
            EvidenceError::InvalidName | EvidenceError::Missing => AppError::NotFound("evidence"),
            other => {
                log::error!("evidence store error: {other}");
                AppError::Storage(other.to_string())
            }
        }
    }
}

impl From<ProviderError> for AppError {
    fn from(value: ProviderError) -> Self {
        match value {
            ProviderError::Timeout => AppError::UpstreamTimeout,
            other => AppError::Upstream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_http_statuses() {
        assert_eq!(AppError::Validation("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::InvalidPlan("gold".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Duplicate(UniqueField::Email).status_code(), StatusCode::CONFLICT);
        assert_eq!(AppError::Authorization.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::NotFound("payment").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::Storage("db".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(AppError::Upstream("503".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(AppError::UpstreamTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn store_conflicts_become_duplicates() {
        let err: AppError = StoreError::Conflict(UniqueField::Phone).into();
        assert!(matches!(err, AppError::Duplicate(UniqueField::Phone)));
        assert_eq!(err.to_string(), "Phone number already registered.");
    }
}
