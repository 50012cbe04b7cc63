#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP error: {status} - {body}")]
    HttpError { status: u16, body: String },

    #[error("SSE stream error: {0}")]
    StreamError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Rate limited. Retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("Request timed out after {0}s")]
    Timeout(u64),

    #[error("Context window exceeded: {0}")]
    ContextOverflow(String),
}

impl ProviderError {
    pub fn from_http(status: u16, body: String, retry_after: Option<&str>) -> Self {
        if status == 429 {
            let retry_after_ms = retry_after
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(|secs| (secs * 1000.0) as u64)
                .unwrap_or(2000);
            return ProviderError::RateLimited { retry_after_ms };
        }
        if status == 400 && body.contains("context") && body.contains("length") {
            return ProviderError::ContextOverflow(body);
        }
        ProviderError::HttpError { status, body }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } => true,
            ProviderError::Timeout(_) => true,
            ProviderError::StreamError(_) => true,
            ProviderError::HttpError { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// 400-class rejection that is not a rate limit. The degradation path
    /// for tool-choice enforcement keys off this.
    pub fn is_invalid_request(&self) -> bool {
        matches!(self, ProviderError::HttpError { status, .. } if (400..429).contains(status) || (430..500).contains(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_parses_retry_after_seconds() {
        let err = ProviderError::from_http(429, String::new(), Some("5"));
        assert_eq!(err.retry_after_ms(), Some(5000));
        assert!(err.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable_client_errors_are_not() {
        assert!(ProviderError::from_http(503, "oops".into(), None).is_retryable());
        let bad = ProviderError::from_http(400, "bad tool_choice".into(), None);
        assert!(!bad.is_retryable());
        assert!(bad.is_invalid_request());
    }

    #[test]
    fn rate_limit_is_not_invalid_request() {
        let err = ProviderError::from_http(429, String::new(), None);
        assert!(!err.is_invalid_request());
    }
}
