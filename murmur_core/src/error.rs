//! Unified error handling for murmur.
//!
//! One crate-wide error enum. Saturation of a send slot is deliberately
//! not an error (the send path flushes and retries); anything that would
//! leave the peer group partially participating in a collective is.

use thiserror::Error;

/// Main error type for murmur operations.
#[derive(Debug, Error)]
pub enum MurmurError {
    /// I/O errors (window mapping, config file access)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parsing or validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A collective transport primitive failed. Fatal: the group can no
    /// longer be assumed to participate in further collectives.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid input/argument errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Window geometry or allocation errors
    #[error("Memory error: {0}")]
    Memory(String),

    /// Operation attempted after the comm was closed
    #[error("Comm terminated: {0}")]
    Terminated(String),
}

impl From<toml::de::Error> for MurmurError {
    fn from(err: toml::de::Error) -> Self {
        MurmurError::Config(format!("TOML parse error: {}", err))
    }
}

/// Convenience type alias for Results using MurmurError
pub type MurmurResult<T> = std::result::Result<T, MurmurError>;

// Helper methods
impl MurmurError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(msg: S) -> Self {
        MurmurError::Config(msg.into())
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        MurmurError::Transport(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        MurmurError::InvalidInput(msg.into())
    }

    /// Create a memory error
    pub fn memory<S: Into<String>>(msg: S) -> Self {
        MurmurError::Memory(msg.into())
    }
}
