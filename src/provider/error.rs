//! Provider error types with HTTP status classification.

use std::time::Duration;

/// Error returned by a provider client.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// 401 / 403
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// 429, with the upstream Retry-After if it sent one
    #[error("Rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// Other 4xx: the provider refused this request outright
    #[error("Request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// 5xx
    #[error("Server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request timed out")]
    Timeout,

    /// Connection refused, reset, DNS failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Body or stream did not match the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::Auth(_) => ProviderErrorKind::Auth,
            Self::RateLimited { .. } => ProviderErrorKind::RateLimited,
            Self::Rejected { .. } => ProviderErrorKind::Rejected,
            Self::Server { .. } => ProviderErrorKind::Server,
            Self::Timeout => ProviderErrorKind::Timeout,
            Self::Transport(_) => ProviderErrorKind::Transport,
            Self::InvalidResponse(_) => ProviderErrorKind::InvalidResponse,
        }
    }

    /// Build an error from a non-success HTTP status.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = truncate(body, 512);
        match classify_http_status(status) {
            ProviderErrorKind::RateLimited => Self::RateLimited { retry_after },
            ProviderErrorKind::Auth => Self::Auth(message),
            ProviderErrorKind::Rejected => Self::Rejected { status, message },
            _ => Self::Server { status, message },
        }
    }
}

/// Classification of provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Auth,
    RateLimited,
    Rejected,
    Server,
    Timeout,
    Transport,
    InvalidResponse,
}

impl ProviderErrorKind {
    /// Whether this outcome says something about the provider's health.
    ///
    /// Upstream rate limits are backpressure, not failure.
    pub fn counts_toward_circuit(&self) -> bool {
        !matches!(self, ProviderErrorKind::RateLimited)
    }
}

/// Parse HTTP status code into error kind.
pub fn classify_http_status(status: u16) -> ProviderErrorKind {
    match status {
        429 => ProviderErrorKind::RateLimited,
        401 | 403 => ProviderErrorKind::Auth,
        408 => ProviderErrorKind::Timeout,
        400..=499 => ProviderErrorKind::Rejected,
        _ => ProviderErrorKind::Server,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
