use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Engine-wide error taxonomy. Recovery policy per kind:
/// `Transient` is retried with back-off before it ever reaches a caller,
/// `ContentDrift` and `TaskDropped` are handled locally by the wrappers,
/// everything else surfaces with its structured kind.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Content drift at {path}:{start}..{end}")]
    ContentDrift {
        path: String,
        start: usize,
        end: usize,
    },

    #[error("Schema mismatch: stored ({stored_model}, {stored_dim}) vs active ({active_model}, {active_dim})")]
    SchemaMismatch {
        stored_model: String,
        stored_dim: usize,
        active_model: String,
        active_dim: usize,
    },

    #[error("Task dropped: enqueued under session {enqueued}, current session {current}")]
    TaskDropped { enqueued: u64, current: u64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Worker not ready: {0}")]
    NotReady(String),

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// True for errors a caller wrapper may silently retry or re-issue.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_) | EngineError::TaskDropped { .. } | EngineError::NotReady(_)
        )
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            EngineError::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            EngineError::NotReady(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            EngineError::TaskDropped { .. } => (StatusCode::CONFLICT, self.to_string()),
            EngineError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            EngineError::ContentDrift { .. } => (StatusCode::CONFLICT, self.to_string()),
            EngineError::SchemaMismatch { .. } => (StatusCode::CONFLICT, self.to_string()),
            EngineError::Serde(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            EngineError::Fatal(_)
            | EngineError::Io(_)
            | EngineError::Decode(_)
            | EngineError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = json!({
            "error": message,
            "kind": self.kind_str(),
            "status": status.as_u16(),
        });

        (status, Json(body)).into_response()
    }
}

impl EngineError {
    pub fn kind_str(&self) -> &'static str {
        match self {
            EngineError::Transient(_) => "transient",
            EngineError::ContentDrift { .. } => "content_drift",
            EngineError::SchemaMismatch { .. } => "schema_mismatch",
            EngineError::TaskDropped { .. } => "task_dropped",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::NotReady(_) => "not_ready",
            EngineError::Fatal(_) => "fatal",
            EngineError::Io(_) => "io",
            EngineError::Decode(_) => "decode",
            EngineError::Serde(_) => "serde",
            EngineError::Internal(_) => "internal",
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
