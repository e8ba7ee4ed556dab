//! Tracker-specific error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("stream transport error: {0}")]
    Stream(String),

    #[error("stream retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("unexpected status payload: {0}")]
    InvalidStatus(String),
}

pub type TrackerResult<T> = Result<T, TrackerError>;
