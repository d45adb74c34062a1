use thiserror::Error;

/// Error surface for the feed pipeline.
///
/// Transient transport and sink failures are handled (and counted) at the
/// task that observes them; only `Config` errors are allowed to terminate
/// the process, and only during startup.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FeedError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FeedError::Connection(_) | FeedError::RateLimit(_))
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FeedError::Connection("request timeout".to_string())
        } else if err.is_connect() {
            FeedError::Connection(format!("connect failed: {}", err))
        } else if let Some(status) = err.status() {
            match status.as_u16() {
                429 => FeedError::RateLimit("HTTP 429 from upstream".to_string()),
                418 => FeedError::RateLimit("IP banned by venue (HTTP 418)".to_string()),
                500..=599 => FeedError::Connection(format!("server error (HTTP {})", status.as_u16())),
                _ => FeedError::Internal(format!("HTTP error: {}", status)),
            }
        } else {
            FeedError::Internal(err.to_string())
        }
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(err: serde_json::Error) -> Self {
        FeedError::Parse(format!("JSON decode failed: {}", err))
    }
}

impl From<redis::RedisError> for FeedError {
    fn from(err: redis::RedisError) -> Self {
        FeedError::Sink(format!("redis: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FeedError::Connection("reset".into()).is_retryable());
        assert!(FeedError::RateLimit("429".into()).is_retryable());
        assert!(!FeedError::Parse("bad frame".into()).is_retryable());
        assert!(!FeedError::Config("missing sink url".into()).is_retryable());
    }

    #[test]
    fn test_json_error_maps_to_parse() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(FeedError::from(err), FeedError::Parse(_)));
    }
}
