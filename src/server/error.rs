use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors a handler can answer with. Every variant becomes a JSON body, so
/// nothing escapes to the transport as a bare failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// Bad or missing upload input (400)
    #[error("{0}")]
    Validation(String),
    /// Nothing to serve (404)
    #[error("{0}")]
    NotFound(String),
    /// Filesystem or parse failure, detail is returned to the caller (500)
    #[error("{message}: {details}")]
    Io { message: String, details: String },
    /// Anything else; only the generic message leaves the server (500)
    #[error("{0}")]
    Unexpected(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        ApiError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn io(message: impl Into<String>, details: impl ToString) -> Self {
        ApiError::Io {
            message: message.into(),
            details: details.to_string(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        ApiError::Unexpected(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Io { .. } | ApiError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self {
            ApiError::Validation(m) | ApiError::NotFound(m) | ApiError::Unexpected(m) => ErrorBody {
                error: m,
                details: None,
            },
            ApiError::Io { message, details } => ErrorBody {
                error: message,
                details: Some(details),
            },
        };

        (self.status(), Json(body)).into_response()
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        tracing::error!(error = %e, "Handler task failed");
        ApiError::unexpected("An unexpected error occurred.")
    }
}
