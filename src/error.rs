use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

// ─── Error ──────────────────────────────────────────────────────────────────

/// Application error taxonomy.
///
/// Every fallible operation in the crate returns this type; the API layer
/// serializes it to a JSON envelope:
///
/// ```json
/// {
///   "error": {
///     "code": "room_full",
///     "message": "Room has reached the maximum number of participants.",
///     "status": 409
///   }
/// }
/// ```
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad input shape or size — rejected before any state mutation.
    #[error("{0}")]
    Validation(String),

    /// The room does not exist or has expired.
    #[error("room not found")]
    NotFound,

    /// The room has reached its participant capacity.
    #[error("room is full")]
    Full,

    /// An optimistic roster update exhausted its retries. Retryable.
    #[error("roster update contention, try again")]
    Contention,

    /// Credential mismatch or invalid/expired token.
    #[error("{0}")]
    Unauthorized(String),

    /// The caller's identity is valid but does not permit this operation.
    #[error("{0}")]
    Forbidden(String),

    /// Too many requests inside the configured window.
    #[error("rate limit exceeded")]
    RateLimited,

    /// The backing store is unreachable or misbehaving. Retryable.
    #[error("storage error: {0}")]
    Storage(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Stable machine-readable code for the JSON envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_failed",
            Self::NotFound => "room_not_found",
            Self::Full => "room_full",
            Self::Contention => "roster_contention",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::RateLimited => "rate_limited",
            Self::Storage(_) => "storage_unavailable",
            Self::Serialization(_) => "internal_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Full => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            // Contention and storage failures are retryable by the caller.
            Self::Contention | Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Serialization(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // Log according to severity; storage details stay out of the response.
        if status.is_server_error() {
            tracing::error!(code = self.code(), status = status.as_u16(), "{self}");
        } else {
            tracing::warn!(code = self.code(), status = status.as_u16(), "{self}");
        }

        let message = match &self {
            Self::Storage(_) => "storage backend unavailable".to_string(),
            Self::Serialization(_) | Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        };

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message,
                status: status.as_u16(),
            },
        };

        (status, Json(envelope)).into_response()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
