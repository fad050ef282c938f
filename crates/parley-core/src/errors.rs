use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Failures reported by an inference provider, classified for the retry layer.
///
/// Transient errors may be retried from the last committed turn. Fatal errors
/// propagate to the session immediately.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ProviderError {
    // Fatal
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("context window exceeded: {0}")]
    ContextWindowExceeded(String),

    // Transient
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Stream-level
    #[error("malformed stream: {0}")]
    MalformedStream(String),
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Overloaded
                | Self::Network(_)
                | Self::Timeout(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) | Self::ContextWindowExceeded(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logs and outward error events.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ContextWindowExceeded(_) => "context_window_exceeded",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::MalformedStream(_) => "malformed_stream",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 413 if body.contains("prompt is too long") => Self::ContextWindowExceeded(body),
            400 => Self::InvalidRequest(body),
            408 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }

    /// Classify a provider-reported error by its `type` string (as carried in
    /// an error frame of a streaming response).
    pub fn from_error_type(error_type: &str, message: String) -> Self {
        match error_type {
            "overloaded_error" => Self::Overloaded,
            "rate_limit_error" => Self::RateLimited { retry_after: None },
            "api_error" => Self::ServerError { status: 500, body: message },
            "authentication_error" | "permission_error" => Self::AuthenticationFailed(message),
            "invalid_request_error" if message.contains("prompt is too long") => {
                Self::ContextWindowExceeded(message)
            }
            "invalid_request_error" | "not_found_error" | "request_too_large" => {
                Self::InvalidRequest(message)
            }
            "timeout_error" => Self::Timeout(Duration::ZERO),
            _ => Self::StreamInterrupted(format!("{error_type}: {message}")),
        }
    }
}

/// Serializable summary of a [`ProviderError`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
}

impl From<&ProviderError> for ErrorInfo {
    fn from(e: &ProviderError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::RateLimited { retry_after: None }.is_transient());
        assert!(ProviderError::ServerError { status: 503, body: String::new() }.is_transient());
        assert!(ProviderError::Overloaded.is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(ProviderError::Timeout(Duration::from_secs(90)).is_transient());
        assert!(ProviderError::StreamInterrupted("eof".into()).is_transient());
    }

    #[test]
    fn fatal_classification() {
        assert!(ProviderError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(ProviderError::InvalidRequest("bad".into()).is_fatal());
        assert!(ProviderError::ContextWindowExceeded("too long".into()).is_fatal());
    }

    #[test]
    fn malformed_and_cancelled_are_neither() {
        for e in [ProviderError::MalformedStream("x".into()), ProviderError::Cancelled] {
            assert!(!e.is_transient());
            assert!(!e.is_fatal());
        }
    }

    #[test]
    fn from_status_mapping() {
        assert!(ProviderError::from_status(401, String::new()).is_fatal());
        assert!(ProviderError::from_status(403, String::new()).is_fatal());
        assert!(ProviderError::from_status(400, "bad".into()).is_fatal());
        assert_eq!(
            ProviderError::from_status(400, "prompt is too long: 210000 tokens".into()).kind(),
            "context_window_exceeded"
        );
        assert!(ProviderError::from_status(429, String::new()).is_transient());
        assert!(ProviderError::from_status(529, String::new()).is_transient());
        assert!(ProviderError::from_status(502, String::new()).is_transient());
        assert!(ProviderError::from_status(418, String::new()).is_fatal());
    }

    #[test]
    fn from_error_type_mapping() {
        assert_eq!(
            ProviderError::from_error_type("overloaded_error", "busy".into()),
            ProviderError::Overloaded
        );
        assert!(ProviderError::from_error_type("invalid_request_error", "x".into()).is_fatal());
        assert!(ProviderError::from_error_type("mystery", "x".into()).is_transient());
    }

    #[test]
    fn suggested_delay_only_for_rate_limit() {
        let rl = ProviderError::RateLimited { retry_after: Some(Duration::from_secs(7)) };
        assert_eq!(rl.suggested_delay(), Some(Duration::from_secs(7)));
        assert_eq!(ProviderError::Overloaded.suggested_delay(), None);
    }

    #[test]
    fn error_info() {
        let info = ErrorInfo::from(&ProviderError::Overloaded);
        assert_eq!(info.kind, "overloaded");
        assert_eq!(info.message, "provider overloaded");
    }
}
