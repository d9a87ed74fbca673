use std::time::Duration;

/// Failures talking to the chat-completion backend.
/// Classifies errors as fatal (don't retry), retryable, or operational.
#[derive(Clone, Debug, thiserror::Error)]
pub enum LlmError {
    // Fatal
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    // Retryable
    #[error("rate limited")]
    RateLimited,
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::ServerError { .. }
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) | Self::InvalidResponse(_)
        )
    }

    /// Short classification string, used as the wire `error.code`.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidResponse(_) => "invalid_response",
            Self::RateLimited => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(LlmError::RateLimited.is_retryable());
        assert!(LlmError::ServerError { status: 502, body: "bad gateway".into() }.is_retryable());
        assert!(LlmError::NetworkError("reset".into()).is_retryable());
        assert!(LlmError::StreamInterrupted("eof".into()).is_retryable());
        assert!(!LlmError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(LlmError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(LlmError::InvalidResponse("not json".into()).is_fatal());
        assert!(!LlmError::RateLimited.is_fatal());
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(LlmError::from_status(401, String::new()), LlmError::AuthenticationFailed(_)));
        assert!(matches!(LlmError::from_status(429, String::new()), LlmError::RateLimited));
        assert!(matches!(
            LlmError::from_status(503, "down".into()),
            LlmError::ServerError { status: 503, .. }
        ));
        assert!(LlmError::from_status(418, "teapot".into()).is_fatal());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(LlmError::RateLimited.error_kind(), "rate_limited");
        assert_eq!(
            LlmError::StreamInterrupted("x".into()).error_kind(),
            "stream_interrupted"
        );
    }
}
