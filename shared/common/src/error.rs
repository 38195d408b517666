use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::types::ApiResponse;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic version mismatch or unique-key collision; the caller may retry.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid transition: {entity} cannot {event} from {from}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        event: &'static str,
    },

    #[error("External service error: {0}")]
    ExternalService(String),

    /// An internal invariant no longer holds. Never coerced away.
    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

impl ApiError {
    pub fn new(error_code: String, message: String) -> Self {
        Self {
            error_code,
            message,
            details: None,
            timestamp: Utc::now(),
            request_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl AppError {
    pub fn invalid_transition(entity: &'static str, from: impl ToString, event: &'static str) -> Self {
        AppError::InvalidTransition {
            entity,
            from: from.to_string(),
            event,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            AppError::Authentication(_) => 401,
            AppError::Authorization(_) => 403,
            AppError::NotFound(_) => 404,
            AppError::Validation(_) | AppError::InvalidTransition { .. } => 400,
            AppError::Conflict(_) => 409,
            AppError::Precondition(_) => 422,
            AppError::ExternalService(_) => 502,
            _ => 500,
        }
    }

    pub fn error_code(&self) -> &str {
        match self {
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Authentication(_) => "AUTHENTICATION_ERROR",
            AppError::Authorization(_) => "AUTHORIZATION_ERROR",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Conflict(_) => "CONCURRENT_UPDATE",
            AppError::Precondition(_) => "PRECONDITION_FAILED",
            AppError::InvalidTransition { .. } => "INVALID_TRANSITION",
            AppError::ExternalService(_) => "EXTERNAL_SERVICE_ERROR",
            AppError::Consistency(_) => "CONSISTENCY_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Only optimistic conflicts are worth re-running; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Conflict(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        match &self {
            AppError::Consistency(_) | AppError::Database(_) | AppError::Internal(_) => {
                tracing::error!(error_code = self.error_code(), error = %self, "request failed");
            }
            _ => {
                tracing::debug!(error_code = self.error_code(), error = %self, "request rejected");
            }
        }

        let body = ApiResponse::<()>::error(format!("{}: {}", self.error_code(), self));
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_lifecycle_errors_to_http_status() {
        assert_eq!(AppError::invalid_transition("session", "completed", "book").status_code(), 400);
        assert_eq!(AppError::Authorization("coach only".into()).status_code(), 403);
        assert_eq!(AppError::NotFound("session".into()).status_code(), 404);
        assert_eq!(AppError::Conflict("stale version".into()).status_code(), 409);
        assert_eq!(AppError::Precondition("unpaid".into()).status_code(), 422);
        assert_eq!(AppError::ExternalService("stripe down".into()).status_code(), 502);
        assert_eq!(AppError::Consistency("count went down".into()).status_code(), 500);
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(AppError::Conflict("x".into()).is_retryable());
        assert!(!AppError::Precondition("x".into()).is_retryable());
        assert!(!AppError::ExternalService("x".into()).is_retryable());
    }

    #[test]
    fn invalid_transition_message_names_the_edge() {
        let err = AppError::invalid_transition("session", "missed", "end");
        assert_eq!(err.to_string(), "Invalid transition: session cannot end from missed");
    }
}
