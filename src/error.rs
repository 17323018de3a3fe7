//! Error types for Basalisk.
//!
//! All errors are strongly typed using thiserror, one enum per concern.
//! None of them terminate the service: the dispatcher turns every failure
//! into a logged, per-message outcome.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while compiling an expression set into a matcher.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Invalid expression {expression:?}: {reason}")]
    InvalidExpression {
        expression: String,
        reason: String,
    },

    #[error("Expression set failed to compile: {reason}")]
    Build {
        reason: String,
    },
}

/// Errors raised by the durable store.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("State directory {} is locked by another process", path.display())]
    Locked {
        path: PathBuf,
    },

    #[error("Failed to encode persisted state: {reason}")]
    Encode {
        reason: String,
    },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised while decoding an inbound bus message.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {reason}")]
    Envelope {
        reason: String,
    },

    #[error("Malformed payload for topic '{topic}': {reason}")]
    Payload {
        topic: String,
        reason: String,
    },
}

/// Transport errors on the message bus.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {addr} failed: {message}")]
    ConnectionFailed {
        addr: String,
        message: String,
    },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        size: usize,
        max: usize,
    },

    #[error("Bus disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Failed to encode outbound message: {message}")]
    Encode {
        message: String,
    },

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type for Basalisk.
#[derive(Debug, Error)]
pub enum BasaliskError {
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {message}")]
    Config {
        message: String,
    },
}

impl BasaliskError {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this is a compile error.
    #[must_use]
    pub const fn is_compile(&self) -> bool {
        matches!(self, Self::Compile(_))
    }

    /// Returns true if this is a persistence error.
    #[must_use]
    pub const fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }

    /// Returns true if this is a decode error.
    #[must_use]
    pub const fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result type alias for Basalisk operations.
pub type BasaliskResult<T> = Result<T, BasaliskError>;
