//! CLI error types.

use thiserror::Error;

use crate::config::ConfigError;

/// CLI errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration is invalid or missing required fields.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Tool parameters or results could not be (de)serialized.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The in-process tool host never reported healthy.
    #[error("tool host at {url} did not become ready")]
    HostNotReady { url: String },

    /// An error occurred in the tool protocol layer.
    #[error(transparent)]
    Mcp(#[from] mcp::Error),

    /// An error occurred in the runtime layer.
    #[error(transparent)]
    Runtime(#[from] runtime::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
