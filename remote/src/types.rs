use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub prompt: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
}

impl Generation {
    pub fn new(prompt: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            response: response.into(),
            created_at: Utc::now(),
        }
    }
}

/// Errors from the generation, embedding and vector index services.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("service temporarily unavailable: {0}")]
    Transient(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("request too long: {0}")]
    Oversized(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("vector index rejected the request: {0}")]
    Index(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<RemoteError>,
    },
}

impl RemoteError {
    /// Worth retrying after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited(_) | Self::Network(_)
        )
    }

    pub fn is_oversized(&self) -> bool {
        matches!(self, Self::Oversized(_))
    }
}
