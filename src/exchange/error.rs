//! Exchange error taxonomy.

use thiserror::Error;

/// Errors surfaced by an [`ExchangeApi`](super::ExchangeApi) implementation.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Structured rejection carrying the exchange's machine-readable name.
    #[error("order rejected: {message} ({name})")]
    Rejected {
        name: String,
        message: String,
        payload: serde_json::Value,
    },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response (status {status}): {body}")]
    UnexpectedResponse { status: u16, body: String },

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// Anything else (simulated outages, unknown markets in paper trading).
    #[error("{0}")]
    Other(String),
}
