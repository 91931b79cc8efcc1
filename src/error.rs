use crate::types::Envelope;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Authentication required")]
    Unauthorized,

    /// `status` is the provider's HTTP status; `None` means the request never got a response.
    #[error("Telephony gateway error{}: {message}", http_suffix(.status))]
    Gateway {
        status: Option<u16>,
        message: String,
    },

    #[error("Transcription failed: {message}")]
    Transcription { retryable: bool, message: String },

    #[error("Summary generation failed: {message}")]
    Summarization { retryable: bool, message: String },

    #[error("Call {0} already has a pipeline job in flight")]
    ConcurrencyConflict(i64),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Call processing is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn http_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// Transport failures, timeouts, 429 and 5xx are worth another attempt; anything the provider
/// rejected on its merits is not.
fn retryable_status(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(code) => code == 429 || code >= 500,
    }
}

impl AppError {
    pub fn gateway(status: Option<u16>, message: impl Into<String>) -> Self {
        AppError::Gateway {
            status,
            message: message.into(),
        }
    }

    pub fn transcription(status: Option<u16>, message: impl Into<String>) -> Self {
        AppError::Transcription {
            retryable: retryable_status(status),
            message: message.into(),
        }
    }

    pub fn summarization(status: Option<u16>, message: impl Into<String>) -> Self {
        AppError::Summarization {
            retryable: retryable_status(status),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Gateway { status, .. } => retryable_status(*status),
            AppError::Transcription { retryable, .. }
            | AppError::Summarization { retryable, .. } => *retryable,
            AppError::Timeout(_) | AppError::Io(_) => true,
            AppError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
            ),
            AppError::Validation(_)
            | AppError::NotFound(_)
            | AppError::Unauthorized
            | AppError::ConcurrencyConflict(_)
            | AppError::ShuttingDown
            | AppError::Config(_) => false,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Gateway { .. }
            | AppError::Transcription { .. }
            | AppError::Summarization { .. } => StatusCode::BAD_GATEWAY,
            AppError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
            AppError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Timeout(_)
            | AppError::Config(_)
            | AppError::Database(_)
            | AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error=%self, "request failed");
        }
        let body: Envelope<()> = Envelope::error(status, self.to_string());
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_split_transient_from_permanent() {
        assert!(AppError::gateway(None, "connection reset").is_retryable());
        assert!(AppError::gateway(Some(503), "unavailable").is_retryable());
        assert!(AppError::gateway(Some(429), "slow down").is_retryable());
        assert!(!AppError::gateway(Some(400), "invalid number").is_retryable());
        assert!(!AppError::gateway(Some(401), "bad credentials").is_retryable());
    }

    #[test]
    fn vendor_constructors_tag_retryability() {
        assert!(AppError::transcription(Some(429), "rate limited").is_retryable());
        assert!(!AppError::transcription(Some(413), "file too large").is_retryable());
        assert!(AppError::summarization(None, "timeout").is_retryable());
        assert!(!AppError::summarization(Some(400), "bad request").is_retryable());
    }

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            AppError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("Call not found".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::gateway(Some(500), "boom").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::ShuttingDown.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert!(!AppError::ShuttingDown.is_retryable());
    }

    #[test]
    fn gateway_message_mentions_http_status() {
        let e = AppError::gateway(Some(404), "no such call");
        assert_eq!(
            e.to_string(),
            "Telephony gateway error (HTTP 404): no such call"
        );
        let e = AppError::gateway(None, "dns failure");
        assert_eq!(e.to_string(), "Telephony gateway error: dns failure");
    }
}
