use std::time::Duration;

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Error taxonomy for the dispatch substrate
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Keyed store failure after client-side retries were exhausted
    #[error("keyed store error: {0}")]
    Store(String),

    /// No connection could be acquired within the configured timeout
    #[error("connection pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Provider or tenant quota hit; retry after the embedded delay
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error(
        "monthly budget exceeded for organization {organization_id}: \
         spent {spent_minor} of {budget_minor}"
    )]
    BudgetExceeded {
        organization_id: String,
        spent_minor: i64,
        budget_minor: i64,
    },

    #[error("webhook error: {0}")]
    Webhook(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl DispatchError {
    /// Whether a retry of the same operation could reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Store(_)
            | DispatchError::PoolExhausted(_)
            | DispatchError::Timeout(_)
            | DispatchError::RateLimited { .. } => true,
            DispatchError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether this error represents a provider-side rate limit.
    ///
    /// Provider SDK errors arrive as opaque messages, so this also sniffs
    /// the rendered text for the usual 429 spellings.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            DispatchError::RateLimited { .. } => true,
            _ => message_is_rate_limit(&self.to_string()),
        }
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(e: redis::RedisError) -> Self {
        DispatchError::Store(e.to_string())
    }
}

/// Recognize rate-limit spellings in free-form provider error messages.
pub fn message_is_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_sniffing() {
        assert!(message_is_rate_limit("Rate limit exceeded (429)"));
        assert!(message_is_rate_limit("Too Many Requests"));
        assert!(!message_is_rate_limit("connection refused"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DispatchError::Store("gone".into()).is_retryable());
        assert!(DispatchError::RateLimited { retry_after_ms: 100 }.is_retryable());
        assert!(!DispatchError::InvalidArgument("bad".into()).is_retryable());
        assert!(!DispatchError::Config("missing".into()).is_retryable());
    }

    #[test]
    fn test_rate_limited_variant_is_rate_limit() {
        assert!(DispatchError::RateLimited { retry_after_ms: 1000 }.is_rate_limit());
        assert!(!DispatchError::Timeout(Duration::from_secs(1)).is_rate_limit());
    }
}
