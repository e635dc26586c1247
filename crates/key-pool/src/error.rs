//! Error types for pool operations

/// Errors from pool construction and key selection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("at least one API key is required")]
    NoKeys,

    #[error("rate limit must be greater than 0")]
    InvalidRateLimit,

    /// One full sweep found no key with a free token.
    #[error("all API keys are rate limited, please wait")]
    RateLimited,

    /// Every attempt of a retrying selection failed.
    #[error("failed to get API key after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Whether the error means the pool is temporarily out of tokens, as
    /// opposed to being misconfigured.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Error::RateLimited | Error::Exhausted { .. })
    }
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
