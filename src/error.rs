//! Error types for the script host.

use thiserror::Error;

/// Common error type for script host operations.
#[derive(Error, Debug)]
pub enum ScriptError {
    /// Failure while installing a chunk: syntax error, top-level runtime
    /// error or sandbox wrapper construction failure.
    #[error("load error: {0}")]
    Load(String),

    /// Error raised while a script function or ad-hoc code was running.
    #[error("runtime error: {message}")]
    Runtime {
        /// Error message reported by the runtime.
        message: String,
        /// Formatted call-stack text at the point of failure.
        stack: String,
    },

    /// Argument coercion failure inside a native callback.
    #[error("type error: {0}")]
    Type(String),

    /// Function named in `begin_call` does not exist.
    #[error("function '{0}' not found")]
    Lookup(String),

    /// Misuse of the begin/end call protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// State document (de)serialization error.
    #[error("document error: {0}")]
    Document(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ScriptError {
    /// Build a runtime error without stack information.
    pub fn runtime(message: impl Into<String>) -> Self {
        ScriptError::Runtime {
            message: message.into(),
            stack: String::new(),
        }
    }

    /// Call-stack text attached to a runtime error, if any.
    pub fn stack(&self) -> Option<&str> {
        match self {
            ScriptError::Runtime { stack, .. } if !stack.is_empty() => Some(stack),
            _ => None,
        }
    }
}

/// Result type alias for script host operations.
pub type Result<T> = std::result::Result<T, ScriptError>;
