use thiserror::Error;

/// Errors from a model backend call.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ModelError {
    /// The request never got a response.
    #[error("model request failed: {0}")]
    Network(String),

    /// The provider answered with a non-success status.
    #[error("model api returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The provider response could not be parsed or had no usable choice.
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
}
