//! HTTP-facing error type.
//!
//! Handlers return `Result<T, ApiError>`. Every variant maps to a status
//! code and a machine-readable code, rendered as:
//!
//! ```json
//! { "detail": { "message": "Empty query", "code": "EMPTY_QUERY" } }
//! ```
//!
//! Services return `anyhow::Result` and signal domain failures by wrapping
//! an `ApiError` (or a [`LanguageError`]) in the `anyhow::Error`; the
//! `From<anyhow::Error>` conversion recovers it. Anything else becomes
//! [`ApiError::Internal`], which is logged in full and rendered with a
//! generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use welearn_core::lang::LanguageError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Empty query")]
    EmptyQuery,

    #[error("Language not supported")]
    LangNotSupported,

    #[error("Please provide a valid question")]
    InvalidQuestion,

    #[error("{0}")]
    CollectionNotFound(String),

    #[error("{0}")]
    ModelNotFound(String),

    #[error("Subject not found")]
    SubjectNotFound,

    #[error("Missing or invalid API key")]
    Unauthorized,

    #[error("Session ID not found")]
    SessionIdNotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    /// An LLM pipeline step failed; the message is client-safe.
    #[error("{message}")]
    Pipeline { code: &'static str, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn reformulate() -> Self {
        Self::Pipeline {
            code: "REFORMULATE_ERROR",
            message: "Something went wrong while reformulating the query".to_string(),
        }
    }

    pub fn rephrase() -> Self {
        Self::Pipeline {
            code: "REPHRASE_ERROR",
            message: "Something went wrong while rephrasing the query".to_string(),
        }
    }

    pub fn stream() -> Self {
        Self::Pipeline {
            code: "STREAM_ERROR",
            message: "Something went wrong while streaming the query".to_string(),
        }
    }

    pub fn answer() -> Self {
        Self::Pipeline {
            code: "ANSWER_ERROR",
            message: "Something went wrong while answering the query".to_string(),
        }
    }

    pub fn agent() -> Self {
        Self::Pipeline {
            code: "AGENT_ERROR",
            message: "Something went wrong while running the agent".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::EmptyQuery | Self::LangNotSupported | Self::InvalidQuestion | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::CollectionNotFound(_)
            | Self::ModelNotFound(_)
            | Self::SubjectNotFound
            | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unauthorized | Self::SessionIdNotFound | Self::UserNotFound => {
                StatusCode::UNAUTHORIZED
            }
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Pipeline { .. } | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyQuery => "EMPTY_QUERY",
            Self::LangNotSupported => "LANG_NOT_SUPPORTED",
            Self::InvalidQuestion => "INVALID_QUESTION",
            Self::CollectionNotFound(_) => "COLL_NOT_FOUND",
            Self::ModelNotFound(_) => "MODEL_NOT_FOUND",
            Self::SubjectNotFound => "SUBJECT_NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionIdNotFound => "SESSION_ID_NOT_FOUND",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Pipeline { code, .. } => *code,
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = match &self {
            Self::Internal(m) => {
                error!(message = %m, "internal server error");
                "internal server error".to_string()
            }
            other => {
                warn!(code, status = status.as_u16(), "{}", other);
                other.to_string()
            }
        };
        (
            status,
            Json(json!({ "detail": { "message": message, "code": code } })),
        )
            .into_response()
    }
}

impl From<LanguageError> for ApiError {
    fn from(_: LanguageError) -> Self {
        Self::LangNotSupported
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        let e = match e.downcast::<ApiError>() {
            Ok(api) => return api,
            Err(e) => e,
        };
        let e = match e.downcast::<LanguageError>() {
            Ok(_) => return Self::LangNotSupported,
            Err(e) => e,
        };
        error!(error = ?e, "converting anyhow error to ApiError::Internal");
        Self::Internal(format!("{:#}", e))
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        error!(error = %e, "database error");
        Self::Internal(e.to_string())
    }
}
