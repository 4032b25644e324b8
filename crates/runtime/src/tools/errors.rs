use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("timeout after {0}ms")]
    Timeout(u64),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("cancelled")]
    Cancelled,
    #[error("tool session lost: {0}")]
    SessionLost(String),
}

impl ToolError {
    /// Whether the tool host is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionLost(_))
    }
}

impl From<mcp::Error> for ToolError {
    fn from(err: mcp::Error) -> Self {
        use mcp::{Error, ErrorKind};

        match err {
            Error::Remote(body) => match body.kind {
                ErrorKind::UnknownTool => Self::NotFound(body.message),
                ErrorKind::Validation => Self::InvalidInput(body.message),
                ErrorKind::Cancelled => Self::Cancelled,
                _ => Self::Execution(body.message),
            },
            Error::Timeout(after) => Self::Timeout(after.as_millis() as u64),
            Error::Cancelled => Self::Cancelled,
            Error::UnknownTool(name) => Self::NotFound(name),
            Error::Validation { message, .. } => Self::InvalidInput(message),
            e if e.is_session_fatal() => Self::SessionLost(e.to_string()),
            e => Self::Execution(e.to_string()),
        }
    }
}
