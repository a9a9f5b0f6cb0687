use std::time::Duration;
use thiserror::Error;

/// Typed controller errors the engine dispatches on.
#[derive(Error, Debug)]
pub enum UnifiError {
    #[error("controller rejected credentials")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("controller rate limit hit (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("controller API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl UnifiError {
    /// Errors worth retrying at the worker-pool level.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UnifiError::Unauthorized
                | UnifiError::RateLimited { .. }
                | UnifiError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, UnifiError>;
