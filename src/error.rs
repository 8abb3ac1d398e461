//! Error types for gator.

use thiserror::Error;

/// Common error type for gator.
#[derive(Error, Debug)]
pub enum GatorError {
    /// Missing or malformed config file.
    #[error("configuration error: {0}")]
    Config(String),

    /// Connection or query failure in the store.
    #[error("database error: {0}")]
    Storage(String),

    /// Unique-constraint violation on creation.
    #[error("{0} already exists")]
    Conflict(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// The feed table is empty, so there is nothing to scrape.
    #[error("no feeds registered")]
    NoFeeds,

    /// A protected command ran without a valid current user.
    #[error("login required: {0}")]
    AuthRequired(String),

    /// Transport, DNS, timeout or HTTP status failure while fetching a feed.
    #[error("network error: {0}")]
    Network(String),

    /// The fetched document is not a feed we can read.
    #[error("feed parsing error: {0}")]
    Parse(String),

    /// No handler is registered under this name.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Missing or malformed command arguments.
    #[error("usage: {0}")]
    Usage(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatorError {
    /// Whether a later attempt at the same operation may succeed.
    ///
    /// Network failures are transient; a document that fails to parse will
    /// fail the same way next time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatorError::Network(_))
    }
}

impl From<sqlx::Error> for GatorError {
    fn from(e: sqlx::Error) -> Self {
        GatorError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for GatorError {
    fn from(e: reqwest::Error) -> Self {
        GatorError::Network(e.to_string())
    }
}

impl From<feed_rs::parser::ParseFeedError> for GatorError {
    fn from(e: feed_rs::parser::ParseFeedError) -> Self {
        GatorError::Parse(e.to_string())
    }
}

/// Result type alias for gator operations.
pub type Result<T> = std::result::Result<T, GatorError>;
