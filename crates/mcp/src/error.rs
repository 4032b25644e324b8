//! Tool protocol error types.

use std::time::Duration;

use thiserror::Error;

use crate::envelope::{ErrorBody, ErrorKind};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("tool already registered: {0}")]
    DuplicateTool(String),

    #[error("invalid tool name: {0:?}")]
    InvalidToolName(String),

    #[error("invalid schema for tool {tool}: {message}")]
    InvalidSchema { tool: String, message: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid parameters for {tool}: {message}")]
    Validation { tool: String, message: String },

    #[error("tool {tool} failed: {message}")]
    Handler { tool: String, message: String },

    #[error("remote error: {0}")]
    Remote(#[from] ErrorBody),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("failed to serialize message: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn connection(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transport(reason: impl ToString) -> Self {
        Self::Transport(reason.to_string())
    }

    /// Error kind reported by the remote host, if this is a remote error.
    pub fn remote_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote(body) => Some(body.kind),
            _ => None,
        }
    }

    /// Whether this error ends the session it occurred on.
    ///
    /// Tool-level failures only affect the call that produced them.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Transport(_) | Self::ConnectionClosed
        )
    }

    /// Convert a host-side failure into the body of an error envelope.
    pub fn to_error_body(&self) -> ErrorBody {
        let kind = match self {
            Self::UnknownTool(_) => ErrorKind::UnknownTool,
            Self::Validation { .. } | Self::Malformed(_) => ErrorKind::Validation,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Remote(body) => return body.clone(),
            _ => ErrorKind::Internal,
        };
        ErrorBody::new(kind, self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
