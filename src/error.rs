use thiserror::Error;

/// Errors raised while polling a device or one of its components
#[derive(Debug, Error)]
pub enum PollError {
    /// Transport unreachable, I/O failure or timeout
    #[error("Connection error: {0}")]
    Connection(String),

    /// Register data could not be decoded, or the device answered with an exception
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Counter state could not be loaded or saved
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid or missing configuration, raised at construction time only
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl PollError {
    /// Whether the next scheduled cycle may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Configuration(_))
    }
}

impl From<std::io::Error> for PollError {
    fn from(err: std::io::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PollError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Connection("timed out".to_string())
    }
}

impl From<serde_json::Error> for PollError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PollError>;
