//! Error types for Tollgate.

use thiserror::Error;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// A limiter or process option failed validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// The caller-supplied identity could not be turned into a key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A counter store primitive failed
    #[error("Store error: {0}")]
    Store(String),

    /// The window key disappeared between the trial and the lifetime read
    #[error("Key \"{key}\" does not exist")]
    WindowVanished {
        /// The composite key that vanished
        key: String,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether this is a construction-time configuration failure.
    pub fn is_config(&self) -> bool {
        matches!(self, TollgateError::Config(_))
    }

    /// Whether the caller identity was rejected.
    pub fn is_invalid_key(&self) -> bool {
        matches!(self, TollgateError::InvalidKey(_))
    }

    /// Whether a store primitive failed.
    pub fn is_store(&self) -> bool {
        matches!(self, TollgateError::Store(_))
    }

    /// Whether the window state was removed underneath the limiter.
    pub fn is_window_vanished(&self) -> bool {
        matches!(self, TollgateError::WindowVanished { .. })
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for TollgateError {
    fn from(err: redis::RedisError) -> Self {
        TollgateError::Store(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
