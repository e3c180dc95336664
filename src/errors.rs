use std::time::Duration;

use thiserror::Error;

/// Failures of the experiment client lifecycle.
///
/// None of these reach the host application: initialization errors become the
/// terminal `failed` state and refresh errors only get logged.
#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("flag backend did not initialize within {0:?}")]
    InitializationTimeout(Duration),

    #[error("flag backend failed to initialize: {0}")]
    Initialization(#[source] BackendError),

    #[error("flag refresh failed: {0}")]
    Refresh(#[source] BackendError),
}

/// Errors reported by a flag backend connection.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("flag service responded with {status}: {body}")]
    Status { status: u16, body: String },

    #[error("flag service rejected the request: {0}")]
    Rejected(String),

    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} missing, it is required")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}
