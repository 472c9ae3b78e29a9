//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use linedesk_shared::LineDeskError;
use serde_json::json;

use crate::channels::ChannelError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource already exists")]
    Conflict(String),

    // Workflow errors
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("Client has no {0} identity")]
    ClientChannelMissing(String),
    #[error("Channel error: {0}")]
    Channel(String),

    // Rate limiting
    #[error("Too many requests")]
    RateLimited,
    #[error("Too many requests: {0}")]
    TooManyRequests(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl ApiError {
    /// Stable machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidCredentials => "INVALID_CREDENTIALS",
            ApiError::InvalidToken => "INVALID_TOKEN",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ApiError::ClientChannelMissing(_) => "CLIENT_CHANNEL_MISSING",
            ApiError::Channel(_) => "CHANNEL_ERROR",
            ApiError::RateLimited => "RATE_LIMITED",
            ApiError::TooManyRequests(_) => "TOO_MANY_REQUESTS",
            ApiError::Database(_) => "DATABASE_ERROR",
            ApiError::Internal => "INTERNAL_ERROR",
            ApiError::ServiceUnavailable => "SERVICE_UNAVAILABLE",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidCredentials | ApiError::InvalidToken | ApiError::Unauthorized => {
                StatusCode::UNAUTHORIZED
            }
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Validation(_)
            | ApiError::BadRequest(_)
            | ApiError::ClientChannelMissing(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) | ApiError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ApiError::Channel(_) => StatusCode::BAD_GATEWAY,
            ApiError::RateLimited | ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Database(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::Validation(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Conflict(msg)
            | ApiError::TooManyRequests(msg) => msg.clone(),
            // Never leak SQL details to clients
            ApiError::Database(_) => "Database error".to_string(),
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": message,
            }
        }));

        (self.status(), body).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => {
                match db_err.code().as_deref() {
                    // PostgreSQL unique violation
                    Some("23505") => {
                        return ApiError::Conflict("Resource already exists".to_string())
                    }
                    // PostgreSQL foreign key violation
                    Some("23503") => {
                        return ApiError::Validation(
                            "Referenced resource does not exist".to_string(),
                        )
                    }
                    // PostgreSQL check violation
                    Some("23514") => {
                        return ApiError::Validation("Constraint violated".to_string())
                    }
                    _ => {}
                }
                tracing::error!("Database error: {:?}", db_err);
                ApiError::Database(db_err.to_string())
            }
            _ => {
                tracing::error!("Database error: {:?}", err);
                ApiError::Database(err.to_string())
            }
        }
    }
}

impl From<LineDeskError> for ApiError {
    fn from(err: LineDeskError) -> Self {
        match err {
            LineDeskError::NotFound(_) => ApiError::NotFound,
            LineDeskError::Validation(msg) => ApiError::Validation(msg),
            LineDeskError::InvalidTransition { from, to } => {
                ApiError::InvalidTransition { from, to }
            }
            LineDeskError::RateLimited => ApiError::RateLimited,
            LineDeskError::Channel(msg) => ApiError::Channel(msg),
            LineDeskError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                ApiError::Internal
            }
        }
    }
}

impl From<ChannelError> for ApiError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::NotConfigured(channel) => {
                ApiError::Channel(format!("{} is not configured", channel))
            }
            other => ApiError::Channel(other.to_string()),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use linedesk_shared::TicketStatus;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::Channel("down".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::ClientChannelMissing("telegram".into()).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_invalid_transition_from_shared_error() {
        let err: ApiError =
            linedesk_shared::workflow::check_transition(TicketStatus::Closed, TicketStatus::Pending)
                .unwrap_err()
                .into();

        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "Invalid status transition: closed -> pending");
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ApiError::Validation("subject is required".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
        assert_eq!(body["error"]["message"], "subject is required");
    }

    #[tokio::test]
    async fn test_database_error_is_not_leaked() {
        let response = ApiError::Database("relation \"tickets\" does not exist".into())
            .into_response();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["message"], "Database error");
    }
}
