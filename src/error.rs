//! Error types for logbarrel

use std::fmt;

/// Result type alias for logbarrel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for logbarrel
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Coordination store errors
    Coordination(String),
    /// Cluster broadcast errors
    Broadcast(String),
    /// Persistence plugin errors
    Persistence(String),
    /// Persistence plugin name not recognised
    UnknownPersister(String),
    /// Lifecycle called in the wrong state
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    /// Timeout
    Timeout,
    /// Too many retries
    TooManyRetries,
    /// Internal error
    Internal(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Coordination(msg) => write!(f, "Coordination store error: {}", msg),
            Error::Broadcast(msg) => write!(f, "Broadcast error: {}", msg),
            Error::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            Error::UnknownPersister(name) => {
                write!(f, "Unknown persister '{}', expected one of file, eventfile", name)
            }
            Error::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Error::Timeout => write!(f, "Operation timed out"),
            Error::TooManyRetries => write!(
                f,
                "Too many retries: operation failed after maximum retry attempts"
            ),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
