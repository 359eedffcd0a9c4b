//! Sync error types.

use thiserror::Error;

/// Sync error type.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("not connected")]
    NotConnected,

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl SyncError {
    /// Whether the failure is worth retrying (reconnect, next poll, manual refresh).
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::Http { .. } | Self::NotConnected
        )
    }

    /// Whether the remote resource is gone for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Sync result type.
pub type Result<T> = std::result::Result<T, SyncError>;
