//! Application-wide error types.
//!
//! [`AppError`] covers bootstrap and storage failures.  [`SessionError`] is
//! the taxonomy surfaced by the session facade: every failure is scoped to a
//! single load or generate call and none of them poison the session.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("transcript error: {0}")]
    Transcript(String),

    #[error("speech error: {0}")]
    Speech(String),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by [`Session`](crate::session::Session) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("backend failed to load model: {0}")]
    BackendLoad(String),

    #[error("backend failed during generation: {0}")]
    BackendGeneration(String),

    #[error("no model loaded")]
    NoModelLoaded,

    #[error("a generation is already in progress")]
    GenerationInProgress,

    #[error("a model load is already in progress")]
    LoadInProgress,

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("transcript unavailable: {0}")]
    Transcript(String),

    #[error("session has been shut down")]
    ShutDown,
}

impl SessionError {
    /// `true` for rejections the caller should simply retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::GenerationInProgress | SessionError::LoadInProgress)
    }
}

impl From<AppError> for SessionError {
    fn from(e: AppError) -> Self {
        match e {
            AppError::Session(inner) => inner,
            other => SessionError::Transcript(other.to_string()),
        }
    }
}
