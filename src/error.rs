//! Error taxonomy for the collaboration relay.
//!
//! Every failure in the relay is contained to one connection or one document.
//! The variants mirror those containment boundaries: transport errors end a
//! single client actor, cache errors only widen the durability window, and
//! storage or merge errors fail one document for one persistence pass.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors produced by the relay and its collaborators.
#[derive(Debug, Error)]
pub enum CollabError {
    /// Connection read/write failure. Terminates one client actor.
    #[error("transport error: {0}")]
    Transport(String),

    /// Fast cache backend failure or timeout. Live broadcast continues.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// Durable storage failure or timeout for one document.
    #[error("storage error: {0}")]
    Storage(String),

    /// Unknown document at connect time.
    #[error("document not found: {0}")]
    NotFound(String),

    /// An update payload could not be applied to the baseline state.
    #[error("merge failed for document {doc_id}: {reason}")]
    Merge { doc_id: String, reason: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("invalid document id")]
    InvalidDocumentId,

    /// Startup configuration problem.
    #[error("configuration error: {0}")]
    Config(String),
}

impl CollabError {
    /// Static label for structured log fields.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::CacheUnavailable(_) => "cache_unavailable",
            Self::Storage(_) => "storage",
            Self::NotFound(_) => "not_found",
            Self::Merge { .. } => "merge",
            Self::Unauthorized => "unauthorized",
            Self::InvalidDocumentId => "invalid_document_id",
            Self::Config(_) => "config",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidDocumentId => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::CacheUnavailable(_) | Self::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transport(_) | Self::Merge { .. } | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub(crate) fn merge(doc_id: &str, reason: impl ToString) -> Self {
        Self::Merge {
            doc_id: doc_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<redis::RedisError> for CollabError {
    fn from(err: redis::RedisError) -> Self {
        Self::CacheUnavailable(err.to_string())
    }
}

impl From<sqlx::Error> for CollabError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for CollabError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<std::io::Error> for CollabError {
    fn from(err: std::io::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl IntoResponse for CollabError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.error_code(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, CollabError>;
