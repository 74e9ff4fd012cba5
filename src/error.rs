//! Service-wide error type and retry policy.
//!
//! Every fallible path in the pipeline resolves to one of these kinds, and
//! the consumer runtime decides ack/retry/drop purely from the kind. The HTTP
//! layer maps the same kinds onto status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("transient upstream failure: {0}")]
    TransientUpstream(String),

    #[error("upstream api error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("already in progress: {0}")]
    AlreadyInProgress(String),

    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn store(e: impl std::fmt::Display) -> Self {
        ServiceError::Store(e.to_string())
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        ServiceError::Internal(e.to_string())
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        ServiceError::Store(e.to_string())
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        ServiceError::Internal(e.to_string())
    }
}

/// What the consumer runtime does with a failed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Ack and move on (success-equivalent outcomes).
    Ack,
    /// Ack with a warning; the job is intentionally abandoned and its
    /// continuation must not be published.
    DropWarn,
    /// Nack with exponential backoff, up to the configured attempt limit.
    Retry,
    /// One redelivery at most, then dead-letter.
    RetryOnce,
    /// Straight to the dead-letter table.
    DeadLetter,
}

/// Retry/drop policy as a pure function of the error kind.
pub fn recovery_action(err: &ServiceError) -> RecoveryAction {
    match err {
        ServiceError::RateLimitExceeded(_) => RecoveryAction::DropWarn,
        ServiceError::NotFound(_) => RecoveryAction::Ack,
        ServiceError::TransientUpstream(_) => RecoveryAction::Retry,
        ServiceError::Store(_) => RecoveryAction::Retry,
        ServiceError::Internal(_) => RecoveryAction::Retry,
        ServiceError::BusUnavailable(_) => RecoveryAction::Retry,
        ServiceError::Api { .. } => RecoveryAction::RetryOnce,
        ServiceError::Unauthorized(_) => RecoveryAction::RetryOnce,
        ServiceError::InvalidRequest(_) => RecoveryAction::DeadLetter,
        ServiceError::AlreadyInProgress(_) => RecoveryAction::Ack,
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServiceError::InvalidRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServiceError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServiceError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            ServiceError::AlreadyInProgress(_) => {
                (StatusCode::CONFLICT, "already in progress".to_string())
            }
            ServiceError::BusUnavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.clone()),
            ServiceError::TransientUpstream(m) => (StatusCode::BAD_GATEWAY, m.clone()),
            ServiceError::Api { status, body } => (
                StatusCode::BAD_GATEWAY,
                format!("upstream {}: {}", status, body),
            ),
            ServiceError::RateLimitExceeded(m) => (StatusCode::BAD_GATEWAY, m.clone()),
            ServiceError::Store(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
            ServiceError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_dropped_not_retried() {
        let err = ServiceError::RateLimitExceeded("429 from upstream".into());
        assert_eq!(recovery_action(&err), RecoveryAction::DropWarn);
    }

    #[test]
    fn transient_errors_retry() {
        for err in [
            ServiceError::TransientUpstream("timeout".into()),
            ServiceError::Store("disk io".into()),
            ServiceError::Internal("oops".into()),
        ] {
            assert_eq!(recovery_action(&err), RecoveryAction::Retry);
        }
    }

    #[test]
    fn api_errors_retry_once() {
        let err = ServiceError::Api {
            status: 422,
            body: "bad filter".into(),
        };
        assert_eq!(recovery_action(&err), RecoveryAction::RetryOnce);
    }
}
