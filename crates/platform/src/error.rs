//! Error types for Skiff

use std::fmt;

/// Unified error type for all Skiff operations
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error: unexpected packet type, malformed fields, framing
    /// violation. Fatal to the engine that raised it.
    Protocol(String),

    /// The server answered a request with a non-OK SFTP status.
    Status {
        /// Raw SSH_FX_* status code
        code: u32,
        /// Server-supplied error message (may be empty)
        message: String,
        /// Language tag of the message (may be empty)
        language_tag: String,
    },

    /// The requested feature is absent on the negotiated protocol version
    /// and no extension fallback applies.
    Unsupported(String),

    /// No response arrived within the configured window
    Timeout,

    /// The underlying stream closed or failed mid-operation
    Transport(String),

    /// The engine has already been closed
    Closed,
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Status {
                code,
                message,
                language_tag: _,
            } => write!(f, "SFTP status {}: {}", code, message),
            SkiffError::Unsupported(msg) => write!(f, "Unsupported operation: {}", msg),
            SkiffError::Timeout => write!(f, "Request timed out"),
            SkiffError::Transport(msg) => write!(f, "Transport error: {}", msg),
            SkiffError::Closed => write!(f, "Engine is closed"),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for Skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;
