use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced while configuring or running the proxy as a whole.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown stratum endpoint index {0}")]
    UnknownEndpoint(usize),
}

/// Reasons a single miner session is torn down.
///
/// None of these are fatal to the listener; the admission loop logs them,
/// drops the session from its registry and closes the socket.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Socket flood: request line exceeds {limit} bytes")]
    Flood { limit: usize },

    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Malformed params for {method}: {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("Session rejected: {0}")]
    Rejected(String),

    #[error("i/o timeout")]
    Timeout,

    #[error("Socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Framing failures raised by [`crate::codec::LineCodec`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Line exceeds {limit} bytes without terminator")]
    LineTooLong { limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::LineTooLong { limit } => SessionError::Flood { limit },
            CodecError::Io(e) => SessionError::Io(e),
            CodecError::Encode(e) => SessionError::Encode(e),
        }
    }
}

/// JSON-RPC error object returned to miners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: i64,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        ProxyError::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for ProxyError {
    fn from(err: toml::ser::Error) -> Self {
        ProxyError::Serialization(err.to_string())
    }
}
